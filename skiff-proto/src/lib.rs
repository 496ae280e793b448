//! Wire protocol for skiff
//!
//! This crate defines the closed set of messages peers exchange, the data
//! records they carry, and two interchangeable byte encodings:
//! - a structured, self-describing JSON form
//! - a compact binary form with explicit per-message version integers
//!
//! Everything here is pure: no I/O, no clocks, no global state.

pub mod codec;
pub mod errors;
pub mod info;
pub mod message;
pub mod split;
pub mod validation;

pub use codec::{decode, encode, WireFormat};
pub use errors::{ProtoError, Result};
pub use info::{FileInfo, FolderId, FolderInfo, NodeId, NodeInfo, Range};
pub use message::{
    Capabilities, FilePartsRecord, Identity, IdentityReply, Message, NodeListCriteria,
    RelayKind, RelayedMessage, UdtMessage,
};
pub use split::{file_list_messages, known_nodes_messages, split_items};
pub use validation::validate_message;

/// Protocol version negotiated in the Identity exchange. Peers with a
/// different version are rejected during handshake.
pub const PROTOCOL_VERSION: u32 = 1;
