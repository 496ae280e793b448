//! Error types for the engine

use skiff_proto::NodeId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("network error: {0}")]
    Net(#[from] skiff_net::NetError),

    #[error("codec error: {0}")]
    Proto(#[from] skiff_proto::ProtoError),

    #[error("sync error: {0}")]
    Sync(#[from] skiff_sync::SyncError),

    #[error("transfer error: {0}")]
    Transfer(#[from] skiff_transfer::TransferError),

    #[error("peer not connected: {0}")]
    PeerNotConnected(NodeId),

    #[error("engine already stopped")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, EngineError>;
