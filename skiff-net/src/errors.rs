//! Error types for connection handling

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Proto(#[from] skiff_proto::ProtoError),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("connection closed")]
    Closed,

    #[error("round-trip measured before ping was sent")]
    PingNotSent,
}

pub type Result<T> = std::result::Result<T, NetError>;
