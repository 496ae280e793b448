//! Transfer management for skiff
//!
//! Part-based, resumable file transfers with bounded concurrency and
//! token-bucket bandwidth limiting. The manager is a state machine over
//! messages: handlers take an inbound message and return the messages to
//! send, so it stays independent of any particular transport.

pub mod bandwidth;
pub mod errors;
pub mod manager;
pub mod parts;
pub mod ranges;
pub mod source;

pub use bandwidth::{BandwidthLimiter, LimitScope, TokenBucket};
pub use errors::{Result, TransferError};
pub use manager::{Outbound, TransferConfig, TransferEvent, TransferManager};
pub use parts::{build_record, verify_partial, DEFAULT_PART_LENGTH};
pub use ranges::RangeSet;
pub use source::{ChunkSink, ChunkSource, MemoryStore};
