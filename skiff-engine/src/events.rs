//! Events the engine surfaces to its embedder

use skiff_proto::message::{Invitation, TransferStatus};
use skiff_proto::{FileInfo, NodeId, NodeInfo};

/// What happened, for the UI layer. The engine never blocks on the
/// consumer.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    PeerConnected(NodeInfo),
    PeerDisconnected(NodeId),
    InvitationReceived { from: NodeId, invitation: Invitation },
    TextMessageReceived { from: NodeId, text: String },
    NotificationReceived {
        from: NodeId,
        event: String,
        args: Vec<String>,
    },
    TransferCompleted { peer: NodeId, file: FileInfo },
    TransferFailed {
        peer: NodeId,
        file: FileInfo,
        reason: String,
    },
    /// A peer shared its transfer activity.
    PeerTransferStatus { peer: NodeId, status: TransferStatus },
}
