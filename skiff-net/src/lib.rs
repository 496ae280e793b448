//! Peer connections for skiff
//!
//! One [`Connection`] per peer: a framed duplex byte stream with an
//! Identity handshake in front of it. Frames from one peer are decoded and
//! handed up strictly in order; different peers proceed in parallel. The
//! [`relay`] module multiplexes logical streams through a third peer when a
//! direct connection is impossible.

pub mod config;
pub mod connection;
pub mod errors;
pub mod framing;
pub mod handshake;
pub mod ping;
pub mod relay;
pub mod server;

pub use config::NetConfig;
pub use connection::Connection;
pub use errors::{NetError, Result};
pub use handshake::{fresh_magic_id, ConnectionState, HandshakeOutcome};
pub use ping::{PingMeasurement, PingTracker};
pub use relay::{ForwardDecision, RelayManager, RelayState, RelayedChannel};
pub use server::{connect, listen, serve, AcceptedConnection};
