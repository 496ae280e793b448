//! Error types for reconciliation

use skiff_proto::FolderId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("folder not joined: {0}")]
    UnknownFolder(FolderId),

    #[error("codec error: {0}")]
    Proto(#[from] skiff_proto::ProtoError),
}

pub type Result<T> = std::result::Result<T, SyncError>;
