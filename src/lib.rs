//! skiff workspace root
//!
//! Re-exports the member crates and hosts the integration tests that
//! exercise interactions between them.

pub use skiff_engine as engine;
pub use skiff_net as net;
pub use skiff_nodes as nodes;
pub use skiff_proto as proto;
pub use skiff_sync as sync;
pub use skiff_transfer as transfer;
