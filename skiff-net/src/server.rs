//! TCP listener and connector
//!
//! Thin glue from sockets to [`Connection::establish`]. Retry policy on
//! failed connects belongs to the caller; nothing here retries.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{info, warn};

use skiff_proto::message::Identity;
use skiff_proto::Message;

use crate::config::NetConfig;
use crate::connection::Connection;
use crate::errors::Result;

/// An accepted, fully established inbound connection.
pub type AcceptedConnection = (Connection, mpsc::Receiver<Message>);

/// Accept forever on a bound listener, handing established connections to
/// `accepted`. Each connection gets a fresh magic id in our Identity.
/// Handshake failures are logged and the socket dropped; the loop ends when
/// the receiver side of `accepted` goes away.
pub async fn serve(
    listener: TcpListener,
    local: Identity,
    config: NetConfig,
    accepted: mpsc::Sender<AcceptedConnection>,
) -> Result<()> {
    info!(addr = %listener.local_addr()?, "listening for peers");

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        if accepted.is_closed() {
            return Ok(());
        }

        let mut local = local.clone();
        local.magic_id = crate::handshake::fresh_magic_id();
        let config = config.clone();
        let accepted = accepted.clone();
        tokio::spawn(async move {
            if let Err(e) = stream.set_nodelay(true) {
                warn!(%peer_addr, error = %e, "set_nodelay failed");
            }
            match Connection::establish(stream, local, config).await {
                Ok(pair) => {
                    let _ = accepted.send(pair).await;
                }
                Err(e) => warn!(%peer_addr, error = %e, "inbound handshake failed"),
            }
        });
    }
}

/// Bind and serve.
pub async fn listen(
    bind_addr: SocketAddr,
    local: Identity,
    config: NetConfig,
    accepted: mpsc::Sender<AcceptedConnection>,
) -> Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    serve(listener, local, config, accepted).await
}

/// Dial a peer and run the handshake.
pub async fn connect(
    addr: SocketAddr,
    local: Identity,
    config: NetConfig,
) -> Result<AcceptedConnection> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    Connection::establish(stream, local, config).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_proto::{Capabilities, NodeInfo, PROTOCOL_VERSION};

    fn identity(id: &str, nick: &str) -> Identity {
        Identity {
            node: NodeInfo::new(id, nick),
            magic_id: format!("magic-{id}"),
            capabilities: Capabilities::default(),
            protocol_version: PROTOCOL_VERSION,
            program_version: "0.1.0".to_string(),
            acknowledges_handshake_completion: true,
        }
    }

    #[tokio::test]
    async fn accept_and_connect_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (accepted_tx, mut accepted_rx) = mpsc::channel(4);
        tokio::spawn(listen(
            addr,
            identity("server", "server-nick"),
            NetConfig::default(),
            accepted_tx,
        ));

        // The listener needs a moment to bind again.
        let mut dialed = None;
        for _ in 0..50 {
            match connect(addr, identity("client", "client-nick"), NetConfig::default()).await {
                Ok(pair) => {
                    dialed = Some(pair);
                    break;
                }
                Err(_) => tokio::time::sleep(std::time::Duration::from_millis(20)).await,
            }
        }
        let (client_conn, _client_rx) = dialed.expect("client could not connect");
        let (server_conn, _server_rx) = accepted_rx.recv().await.unwrap();

        assert_eq!(client_conn.peer().id.as_str(), "server");
        assert_eq!(server_conn.peer().id.as_str(), "client");
    }
}
