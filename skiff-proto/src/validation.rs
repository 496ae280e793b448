//! Input validation and size limits for protocol messages
//!
//! Validation rejects a single offending message; it never decides whether a
//! connection stays open. Repeated violations are a policy matter for the
//! layer above.

use crate::errors::{ProtoError, Result};
use crate::info::{FileInfo, Range};
use crate::message::Message;

/// Size ceilings enforced by the codecs and message validation.
pub mod limits {
    /// Maximum size of one framed message on the wire (10 MB).
    pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

    /// Maximum payload of a single FileChunk (4 MB).
    pub const MAX_CHUNK_SIZE: usize = 4 * 1024 * 1024;

    /// Maximum length of any string field (64 KB).
    pub const MAX_STRING_LEN: usize = 64 * 1024;

    /// Maximum length of a file path (4096 bytes).
    pub const MAX_PATH_LENGTH: usize = 4096;

    /// Maximum length of a nickname (256 bytes).
    pub const MAX_NICK_LENGTH: usize = 256;

    /// Maximum items in one list-typed message.
    pub const MAX_LIST_ITEMS: usize = 1_000_000;

    /// Maximum ping padding payload (1 KB).
    pub const MAX_PING_PAYLOAD: usize = 1024;
}

/// Progress values are advisory and must sit in [0, 1].
pub fn validate_progress(progress: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&progress) {
        return Err(ProtoError::ProgressOutOfRange(progress));
    }
    Ok(())
}

/// A range must lie entirely within the file at the referenced version.
pub fn validate_range(range: &Range, file_size: u64) -> Result<()> {
    let end = range.offset.checked_add(range.length);
    match end {
        Some(end) if end <= file_size => Ok(()),
        _ => Err(ProtoError::RangeOutOfBounds {
            offset: range.offset,
            length: range.length,
            size: file_size,
        }),
    }
}

fn validate_file(file: &FileInfo) -> Result<()> {
    if file.path.is_empty() {
        return Err(ProtoError::MissingField("file path"));
    }
    if file.path.len() > limits::MAX_PATH_LENGTH {
        return Err(ProtoError::FieldTooLarge {
            field: "file path",
            size: file.path.len(),
            max: limits::MAX_PATH_LENGTH,
        });
    }
    Ok(())
}

/// Validate a decoded message before it is dispatched.
pub fn validate_message(message: &Message) -> Result<()> {
    match message {
        Message::Identity(m) => {
            if m.node.id.is_empty() {
                return Err(ProtoError::MissingField("member id"));
            }
            if m.node.nick.is_empty() {
                return Err(ProtoError::MissingField("nickname"));
            }
            if m.node.nick.len() > limits::MAX_NICK_LENGTH {
                return Err(ProtoError::FieldTooLarge {
                    field: "nickname",
                    size: m.node.nick.len(),
                    max: limits::MAX_NICK_LENGTH,
                });
            }
            if m.magic_id.is_empty() {
                return Err(ProtoError::MissingField("magic id"));
            }
            Ok(())
        }
        Message::Ping(m) => {
            if m.payload.len() > limits::MAX_PING_PAYLOAD {
                return Err(ProtoError::FieldTooLarge {
                    field: "ping payload",
                    size: m.payload.len(),
                    max: limits::MAX_PING_PAYLOAD,
                });
            }
            Ok(())
        }
        Message::RequestDownload(m) => {
            validate_file(&m.file)?;
            if m.start_offset > m.file.size {
                return Err(ProtoError::RangeOutOfBounds {
                    offset: m.start_offset,
                    length: 0,
                    size: m.file.size,
                });
            }
            Ok(())
        }
        Message::RequestPart(m) => {
            validate_file(&m.file)?;
            validate_range(&m.range, m.file.size)?;
            validate_progress(m.progress)
        }
        Message::FileChunk(m) => {
            validate_file(&m.file)?;
            let range = Range::new(m.offset, m.data.len() as u64);
            validate_range(&range, m.file.size)
        }
        Message::FileList(m) => m.files.iter().try_for_each(validate_file),
        Message::FolderFilesChanged(m) => m
            .added
            .iter()
            .chain(m.removed.iter())
            .try_for_each(validate_file),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::{FolderId, NodeInfo};
    use crate::message::{Identity, Capabilities, RequestPart};

    fn test_file(size: u64) -> FileInfo {
        FileInfo::new(FolderId::new("f"), "a.txt", size)
    }

    fn part_request(offset: u64, length: u64, progress: f64) -> Message {
        Message::RequestPart(RequestPart {
            file: test_file(100),
            range: Range::new(offset, length),
            progress,
        })
    }

    #[test]
    fn progress_bounds() {
        assert!(validate_progress(0.0).is_ok());
        assert!(validate_progress(1.0).is_ok());
        assert!(validate_progress(-0.01).is_err());
        assert!(validate_progress(1.01).is_err());
        assert!(validate_progress(f64::NAN).is_err());
    }

    #[test]
    fn range_within_file() {
        assert!(validate_message(&part_request(0, 100, 0.5)).is_ok());
        assert!(validate_message(&part_request(50, 51, 0.5)).is_err());
        assert!(validate_message(&part_request(u64::MAX, 1, 0.5)).is_err());
    }

    #[test]
    fn out_of_range_progress_fails() {
        assert!(validate_message(&part_request(0, 10, 1.5)).is_err());
    }

    #[test]
    fn chunk_past_end_fails() {
        let message = Message::FileChunk(crate::message::FileChunk {
            file: test_file(100),
            offset: 90,
            data: vec![0; 20],
        });
        assert!(validate_message(&message).is_err());
    }

    #[test]
    fn empty_identity_fields_fail() {
        let identity = |id: &str, nick: &str| {
            Message::Identity(Identity {
                node: NodeInfo::new(id, nick),
                magic_id: "m".to_string(),
                capabilities: Capabilities::default(),
                protocol_version: 1,
                program_version: "0.1.0".to_string(),
                acknowledges_handshake_completion: false,
            })
        };

        assert!(validate_message(&identity("id", "nick")).is_ok());
        assert!(validate_message(&identity("", "nick")).is_err());
        assert!(validate_message(&identity("id", "")).is_err());
    }
}
