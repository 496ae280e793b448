//! The closed set of wire messages
//!
//! One canonical in-memory representation per message kind; the codecs in
//! [`crate::codec`] turn these into bytes and back.

use serde::{Deserialize, Serialize};

use crate::info::{FileInfo, FolderId, FolderInfo, NodeId, NodeInfo, Range};

/// Capability flags declared during the Identity exchange. The effective
/// capabilities of a connection are the intersection of both declarations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub encryption: bool,
    pub partial_transfers: bool,
    pub tunneled: bool,
}

impl Capabilities {
    pub fn intersect(&self, other: &Capabilities) -> Capabilities {
        Capabilities {
            encryption: self.encryption && other.encryption,
            partial_transfers: self.partial_transfers && other.partial_transfers,
            tunneled: self.tunneled || other.tunneled,
        }
    }
}

/// First message on every connection, in both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub node: NodeInfo,
    /// Random per-connection nonce; also keys folder-id obfuscation.
    pub magic_id: String,
    pub capabilities: Capabilities,
    pub protocol_version: u32,
    pub program_version: String,
    /// When both sides declare this, each must receive HandshakeCompleted
    /// before sending data traffic.
    pub acknowledges_handshake_completion: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityReply {
    pub accepted: bool,
    pub reason: Option<String>,
}

impl IdentityReply {
    pub fn accept() -> Self {
        Self {
            accepted: true,
            reason: None,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ping {
    pub id: String,
    /// Random-size padding so probe frames vary on the wire.
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pong {
    /// Echo of the Ping id being answered.
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Problem {
    pub message: String,
    /// Fatal problems force the connection closed; advisory ones are logged.
    pub fatal: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FolderList {
    pub folders: Vec<FolderInfo>,
}

/// Full file listing for one folder. Establishes the baseline a peer holds
/// for us; `following_deltas` announces how many FolderFilesChanged messages
/// complete the listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileList {
    pub folder: FolderInfo,
    pub files: Vec<FileInfo>,
    pub following_deltas: u32,
}

/// Incremental change set against an established baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FolderFilesChanged {
    pub folder: FolderInfo,
    pub added: Vec<FileInfo>,
    pub removed: Vec<FileInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileListRequest {
    pub folder: FolderId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestDownload {
    pub file: FileInfo,
    pub start_offset: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestPart {
    pub file: FileInfo,
    pub range: Range,
    /// Advisory download progress in [0, 1], for the uploader's display only.
    pub progress: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartUpload {
    pub file: FileInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChunk {
    pub file: FileInfo,
    pub offset: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopUpload {
    pub file: FileInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadQueued {
    pub file: FileInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbortDownload {
    pub file: FileInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbortUpload {
    pub file: FileInfo,
}

/// Digests of fixed-length parts of a file, used to verify retained partial
/// data before trusting it on resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilePartsRecord {
    pub part_length: u64,
    pub digests: Vec<[u8; 32]>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFilePartsRecord {
    pub file: FileInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyFilePartsRecord {
    pub file: FileInfo,
    pub record: FilePartsRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnownNodes {
    pub nodes: Vec<NodeInfo>,
}

/// Which peers a node-list answer should contain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeListCriteria {
    All,
    OnlineSupernodes,
    Explicit { ids: Vec<NodeId> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestNodeList {
    pub criteria: NodeListCriteria,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchNodeRequest {
    pub pattern: String,
}

/// Runtime counters a peer may request for debugging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInformation {
    pub program_version: String,
    pub known_nodes: u64,
    pub connected_nodes: u64,
    pub active_transfers: u64,
    pub queued_transfers: u64,
}

/// Snapshot of transfer activity, for display on the remote side.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransferStatus {
    pub active_uploads: u32,
    pub queued_uploads: u32,
    pub active_downloads: u32,
    pub queued_downloads: u32,
    pub current_upload_cps: u64,
    pub allowed_upload_cps: u64,
    pub current_download_cps: u64,
    pub allowed_download_cps: u64,
}

/// Lifecycle discriminator of a relayed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayKind {
    Syn,
    Ack,
    Nack,
    Eof,
    DataZipped,
}

/// Payload routed through a relay peer. The relay forwards by destination
/// without interpreting `payload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayedMessage {
    pub kind: RelayKind,
    /// Caller-chosen id, scoped to the relay peer.
    pub connection_id: u64,
    pub source: NodeId,
    pub destination: NodeId,
    /// Deflated bytes for DataZipped, empty otherwise.
    pub payload: Vec<u8>,
}

/// UDT hole-punch negotiation. Answered with Nack when unsupported so the
/// peer falls through to the relay path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UdtMessage {
    pub kind: RelayKind,
    pub source: NodeId,
    pub destination: NodeId,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invitation {
    pub folder: FolderInfo,
    pub invitor: NodeInfo,
    pub suggested_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextMessage {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub event: String,
    pub args: Vec<String>,
}

/// Every message a peer can send, as one tagged sum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Identity(Identity),
    IdentityReply(IdentityReply),
    HandshakeCompleted,
    Ping(Ping),
    Pong(Pong),
    Problem(Problem),
    FolderList(FolderList),
    FileList(FileList),
    FolderFilesChanged(FolderFilesChanged),
    FileListRequest(FileListRequest),
    RequestDownload(RequestDownload),
    RequestPart(RequestPart),
    StartUpload(StartUpload),
    FileChunk(FileChunk),
    StopUpload(StopUpload),
    DownloadQueued(DownloadQueued),
    AbortDownload(AbortDownload),
    AbortUpload(AbortUpload),
    RequestFilePartsRecord(RequestFilePartsRecord),
    ReplyFilePartsRecord(ReplyFilePartsRecord),
    KnownNodes(KnownNodes),
    RequestNodeList(RequestNodeList),
    SearchNodeRequest(SearchNodeRequest),
    NodeInformation(NodeInformation),
    TransferStatus(TransferStatus),
    Relayed(RelayedMessage),
    Udt(UdtMessage),
    Invitation(Invitation),
    TextMessage(TextMessage),
    Notification(Notification),
}

impl Message {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Identity(_) => "Identity",
            Message::IdentityReply(_) => "IdentityReply",
            Message::HandshakeCompleted => "HandshakeCompleted",
            Message::Ping(_) => "Ping",
            Message::Pong(_) => "Pong",
            Message::Problem(_) => "Problem",
            Message::FolderList(_) => "FolderList",
            Message::FileList(_) => "FileList",
            Message::FolderFilesChanged(_) => "FolderFilesChanged",
            Message::FileListRequest(_) => "FileListRequest",
            Message::RequestDownload(_) => "RequestDownload",
            Message::RequestPart(_) => "RequestPart",
            Message::StartUpload(_) => "StartUpload",
            Message::FileChunk(_) => "FileChunk",
            Message::StopUpload(_) => "StopUpload",
            Message::DownloadQueued(_) => "DownloadQueued",
            Message::AbortDownload(_) => "AbortDownload",
            Message::AbortUpload(_) => "AbortUpload",
            Message::RequestFilePartsRecord(_) => "RequestFilePartsRecord",
            Message::ReplyFilePartsRecord(_) => "ReplyFilePartsRecord",
            Message::KnownNodes(_) => "KnownNodes",
            Message::RequestNodeList(_) => "RequestNodeList",
            Message::SearchNodeRequest(_) => "SearchNodeRequest",
            Message::NodeInformation(_) => "NodeInformation",
            Message::TransferStatus(_) => "TransferStatus",
            Message::Relayed(_) => "Relayed",
            Message::Udt(_) => "Udt",
            Message::Invitation(_) => "Invitation",
            Message::TextMessage(_) => "TextMessage",
            Message::Notification(_) => "Notification",
        }
    }

    /// True for bulk payload frames, the default scope of bandwidth limiting.
    pub fn carries_chunk_data(&self) -> bool {
        matches!(self, Message::FileChunk(_))
    }
}
