//! Error types for transfers

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("validation error: {0}")]
    Validation(#[from] skiff_proto::ProtoError),

    #[error("no such transfer: {0}")]
    UnknownTransfer(String),

    #[error("no such file: {0}")]
    UnknownFile(String),

    #[error("digest mismatch in part {part}")]
    DigestMismatch { part: usize },

    #[error("transfer failed: {0}")]
    Failed(String),
}

pub type Result<T> = std::result::Result<T, TransferError>;
