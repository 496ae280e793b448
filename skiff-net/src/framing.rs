//! Length-framed message transport
//!
//! Every message travels as a u32 big-endian length prefix followed by the
//! codec payload. The length is checked against the configured ceiling
//! before any allocation.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use skiff_proto::{codec, Message, WireFormat};

use crate::errors::{NetError, Result};

pub async fn write_message<W>(
    writer: &mut W,
    message: &Message,
    format: WireFormat,
    max_frame_size: usize,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let payload = codec::encode(message, format)?;
    if payload.len() > max_frame_size {
        return Err(NetError::FrameTooLarge {
            size: payload.len(),
            max: max_frame_size,
        });
    }

    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_message<R>(
    reader: &mut R,
    format: WireFormat,
    max_frame_size: usize,
) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > max_frame_size {
        return Err(NetError::FrameTooLarge {
            size: len,
            max: max_frame_size,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(codec::decode(&payload, format)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_proto::message::{Ping, Problem};

    #[tokio::test]
    async fn frames_roundtrip_in_order() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        let first = Message::Ping(Ping {
            id: "1".to_string(),
            payload: vec![9; 32],
        });
        let second = Message::Problem(Problem {
            message: "advisory".to_string(),
            fatal: false,
        });

        write_message(&mut a, &first, WireFormat::Compact, 1024)
            .await
            .unwrap();
        write_message(&mut a, &second, WireFormat::Compact, 1024)
            .await
            .unwrap();

        let got_first = read_message(&mut b, WireFormat::Compact, 1024).await.unwrap();
        let got_second = read_message(&mut b, WireFormat::Compact, 1024).await.unwrap();
        assert_eq!(got_first, first);
        assert_eq!(got_second, second);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected_before_reading() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        // A length prefix far beyond the ceiling, no payload behind it.
        a.write_all(&u32::MAX.to_be_bytes()).await.unwrap();

        match read_message(&mut b, WireFormat::Compact, 1024).await {
            Err(NetError::FrameTooLarge { max: 1024, .. }) => {}
            other => panic!("expected FrameTooLarge, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_message_is_not_written() {
        let (mut a, _b) = tokio::io::duplex(4096);
        let message = Message::Ping(Ping {
            id: "big".to_string(),
            payload: vec![0; 512],
        });

        assert!(matches!(
            write_message(&mut a, &message, WireFormat::Compact, 64).await,
            Err(NetError::FrameTooLarge { .. })
        ));
    }
}
