//! Error types for message encoding, decoding and validation

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtoError {
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown message tag: {0}")]
    UnknownTag(u16),

    #[error("version mismatch for {kind}: expected {expected}, found {found}")]
    VersionMismatch {
        kind: &'static str,
        expected: u8,
        found: u8,
    },

    #[error("truncated message while reading {0}")]
    Truncated(&'static str),

    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("field too large: {field} is {size} bytes (max {max})")]
    FieldTooLarge {
        field: &'static str,
        size: usize,
        max: usize,
    },

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("progress {0} outside [0, 1]")]
    ProgressOutOfRange(f64),

    #[error("range {offset}+{length} exceeds file size {size}")]
    RangeOutOfBounds { offset: u64, length: u64, size: u64 },

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(i64),

    #[error("invalid socket address: {0}")]
    InvalidAddress(String),
}

pub type Result<T> = std::result::Result<T, ProtoError>;
