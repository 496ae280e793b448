//! Folder file-list reconciliation for skiff
//!
//! Per folder, this crate holds the authoritative local file index and the
//! last-known remote index per peer, computes outgoing deltas, and merges
//! incoming listings into a view that converges regardless of arrival
//! order: higher version wins, deletion wins a version tie.

pub mod errors;
pub mod ignore;
pub mod reconciler;

pub use errors::{Result, SyncError};
pub use ignore::IgnoreRules;
pub use reconciler::{OutgoingDelta, Reconciler, RemoteBaseline};
