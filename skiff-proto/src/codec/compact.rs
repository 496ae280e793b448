//! Compact versioned binary wire form
//!
//! Layout: a u16 kind tag, a u8 message version, then length-prefixed
//! fields. The version is checked on read and a mismatch is a hard decode
//! error; this form trades the structured codec's tolerance for size.
//!
//! All integers are big-endian. Strings are u32-length-prefixed UTF-8,
//! byte fields u32-length-prefixed, lists u32-counted.

use bytes::{Buf, BufMut};
use chrono::{DateTime, TimeZone, Utc};

use crate::errors::{ProtoError, Result};
use crate::info::{FileInfo, FolderId, FolderInfo, NodeId, NodeInfo, Range};
use crate::message::*;
use crate::validation::limits;

/// Current version of every message kind in this form. Bumped per kind when
/// a kind's field layout changes.
const MESSAGE_VERSION: u8 = 1;

const TAG_IDENTITY: u16 = 1;
const TAG_IDENTITY_REPLY: u16 = 2;
const TAG_HANDSHAKE_COMPLETED: u16 = 3;
const TAG_PING: u16 = 4;
const TAG_PONG: u16 = 5;
const TAG_PROBLEM: u16 = 6;
const TAG_FOLDER_LIST: u16 = 7;
const TAG_FILE_LIST: u16 = 8;
const TAG_FOLDER_FILES_CHANGED: u16 = 9;
const TAG_FILE_LIST_REQUEST: u16 = 10;
const TAG_REQUEST_DOWNLOAD: u16 = 11;
const TAG_REQUEST_PART: u16 = 12;
const TAG_START_UPLOAD: u16 = 13;
const TAG_FILE_CHUNK: u16 = 14;
const TAG_STOP_UPLOAD: u16 = 15;
const TAG_DOWNLOAD_QUEUED: u16 = 16;
const TAG_ABORT_DOWNLOAD: u16 = 17;
const TAG_ABORT_UPLOAD: u16 = 18;
const TAG_REQUEST_FILE_PARTS_RECORD: u16 = 19;
const TAG_REPLY_FILE_PARTS_RECORD: u16 = 20;
const TAG_KNOWN_NODES: u16 = 21;
const TAG_REQUEST_NODE_LIST: u16 = 22;
const TAG_SEARCH_NODE_REQUEST: u16 = 23;
const TAG_NODE_INFORMATION: u16 = 24;
const TAG_TRANSFER_STATUS: u16 = 25;
const TAG_RELAYED: u16 = 26;
const TAG_UDT: u16 = 27;
const TAG_INVITATION: u16 = 28;
const TAG_TEXT_MESSAGE: u16 = 29;
const TAG_NOTIFICATION: u16 = 30;

pub fn encode(message: &Message) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(64);
    buf.put_u16(tag_of(message));
    buf.put_u8(MESSAGE_VERSION);

    match message {
        Message::Identity(m) => {
            put_node_info(&mut buf, &m.node);
            put_str(&mut buf, &m.magic_id);
            put_capabilities(&mut buf, &m.capabilities);
            buf.put_u32(m.protocol_version);
            put_str(&mut buf, &m.program_version);
            put_bool(&mut buf, m.acknowledges_handshake_completion);
        }
        Message::IdentityReply(m) => {
            put_bool(&mut buf, m.accepted);
            put_opt_str(&mut buf, m.reason.as_deref());
        }
        Message::HandshakeCompleted => {}
        Message::Ping(m) => {
            put_str(&mut buf, &m.id);
            put_bytes(&mut buf, &m.payload);
        }
        Message::Pong(m) => {
            put_str(&mut buf, &m.id);
        }
        Message::Problem(m) => {
            put_str(&mut buf, &m.message);
            put_bool(&mut buf, m.fatal);
        }
        Message::FolderList(m) => {
            buf.put_u32(m.folders.len() as u32);
            for folder in &m.folders {
                put_folder_info(&mut buf, folder);
            }
        }
        Message::FileList(m) => {
            put_folder_info(&mut buf, &m.folder);
            put_file_infos(&mut buf, &m.files);
            buf.put_u32(m.following_deltas);
        }
        Message::FolderFilesChanged(m) => {
            put_folder_info(&mut buf, &m.folder);
            put_file_infos(&mut buf, &m.added);
            put_file_infos(&mut buf, &m.removed);
        }
        Message::FileListRequest(m) => {
            put_str(&mut buf, m.folder.as_str());
        }
        Message::RequestDownload(m) => {
            put_file_info(&mut buf, &m.file);
            buf.put_u64(m.start_offset);
        }
        Message::RequestPart(m) => {
            put_file_info(&mut buf, &m.file);
            put_range(&mut buf, &m.range);
            buf.put_f64(m.progress);
        }
        Message::StartUpload(m) => put_file_info(&mut buf, &m.file),
        Message::FileChunk(m) => {
            put_file_info(&mut buf, &m.file);
            buf.put_u64(m.offset);
            put_bytes(&mut buf, &m.data);
        }
        Message::StopUpload(m) => put_file_info(&mut buf, &m.file),
        Message::DownloadQueued(m) => put_file_info(&mut buf, &m.file),
        Message::AbortDownload(m) => put_file_info(&mut buf, &m.file),
        Message::AbortUpload(m) => put_file_info(&mut buf, &m.file),
        Message::RequestFilePartsRecord(m) => put_file_info(&mut buf, &m.file),
        Message::ReplyFilePartsRecord(m) => {
            put_file_info(&mut buf, &m.file);
            buf.put_u64(m.record.part_length);
            buf.put_u32(m.record.digests.len() as u32);
            for digest in &m.record.digests {
                buf.put_slice(digest);
            }
        }
        Message::KnownNodes(m) => {
            buf.put_u32(m.nodes.len() as u32);
            for node in &m.nodes {
                put_node_info(&mut buf, node);
            }
        }
        Message::RequestNodeList(m) => match &m.criteria {
            NodeListCriteria::All => buf.put_u8(0),
            NodeListCriteria::OnlineSupernodes => buf.put_u8(1),
            NodeListCriteria::Explicit { ids } => {
                buf.put_u8(2);
                buf.put_u32(ids.len() as u32);
                for id in ids {
                    put_str(&mut buf, id.as_str());
                }
            }
        },
        Message::SearchNodeRequest(m) => {
            put_str(&mut buf, &m.pattern);
        }
        Message::NodeInformation(m) => {
            put_str(&mut buf, &m.program_version);
            buf.put_u64(m.known_nodes);
            buf.put_u64(m.connected_nodes);
            buf.put_u64(m.active_transfers);
            buf.put_u64(m.queued_transfers);
        }
        Message::TransferStatus(m) => {
            buf.put_u32(m.active_uploads);
            buf.put_u32(m.queued_uploads);
            buf.put_u32(m.active_downloads);
            buf.put_u32(m.queued_downloads);
            buf.put_u64(m.current_upload_cps);
            buf.put_u64(m.allowed_upload_cps);
            buf.put_u64(m.current_download_cps);
            buf.put_u64(m.allowed_download_cps);
        }
        Message::Relayed(m) => {
            put_relay_kind(&mut buf, m.kind);
            buf.put_u64(m.connection_id);
            put_str(&mut buf, m.source.as_str());
            put_str(&mut buf, m.destination.as_str());
            put_bytes(&mut buf, &m.payload);
        }
        Message::Udt(m) => {
            put_relay_kind(&mut buf, m.kind);
            put_str(&mut buf, m.source.as_str());
            put_str(&mut buf, m.destination.as_str());
            buf.put_u16(m.port);
        }
        Message::Invitation(m) => {
            put_folder_info(&mut buf, &m.folder);
            put_node_info(&mut buf, &m.invitor);
            put_str(&mut buf, &m.suggested_path);
        }
        Message::TextMessage(m) => {
            put_str(&mut buf, &m.text);
        }
        Message::Notification(m) => {
            put_str(&mut buf, &m.event);
            buf.put_u32(m.args.len() as u32);
            for arg in &m.args {
                put_str(&mut buf, arg);
            }
        }
    }

    Ok(buf)
}

pub fn decode(bytes: &[u8]) -> Result<Message> {
    let mut buf = bytes;
    let tag = get_u16(&mut buf, "tag")?;
    let kind = kind_name(tag)?;
    let version = get_u8(&mut buf, "version")?;
    if version != MESSAGE_VERSION {
        return Err(ProtoError::VersionMismatch {
            kind,
            expected: MESSAGE_VERSION,
            found: version,
        });
    }

    let message = match tag {
        TAG_IDENTITY => Message::Identity(Identity {
            node: get_node_info(&mut buf)?,
            magic_id: get_str(&mut buf, "magic_id")?,
            capabilities: get_capabilities(&mut buf)?,
            protocol_version: get_u32(&mut buf, "protocol_version")?,
            program_version: get_str(&mut buf, "program_version")?,
            acknowledges_handshake_completion: get_bool(&mut buf, "acknowledges")?,
        }),
        TAG_IDENTITY_REPLY => Message::IdentityReply(IdentityReply {
            accepted: get_bool(&mut buf, "accepted")?,
            reason: get_opt_str(&mut buf, "reason")?,
        }),
        TAG_HANDSHAKE_COMPLETED => Message::HandshakeCompleted,
        TAG_PING => Message::Ping(Ping {
            id: get_str(&mut buf, "ping id")?,
            payload: get_bytes(&mut buf, "ping payload")?,
        }),
        TAG_PONG => Message::Pong(Pong {
            id: get_str(&mut buf, "pong id")?,
        }),
        TAG_PROBLEM => Message::Problem(Problem {
            message: get_str(&mut buf, "problem")?,
            fatal: get_bool(&mut buf, "fatal")?,
        }),
        TAG_FOLDER_LIST => {
            let count = get_count(&mut buf, "folders")?;
            let mut folders = Vec::with_capacity(count);
            for _ in 0..count {
                folders.push(get_folder_info(&mut buf)?);
            }
            Message::FolderList(FolderList { folders })
        }
        TAG_FILE_LIST => Message::FileList(FileList {
            folder: get_folder_info(&mut buf)?,
            files: get_file_infos(&mut buf)?,
            following_deltas: get_u32(&mut buf, "following_deltas")?,
        }),
        TAG_FOLDER_FILES_CHANGED => Message::FolderFilesChanged(FolderFilesChanged {
            folder: get_folder_info(&mut buf)?,
            added: get_file_infos(&mut buf)?,
            removed: get_file_infos(&mut buf)?,
        }),
        TAG_FILE_LIST_REQUEST => Message::FileListRequest(FileListRequest {
            folder: FolderId::new(get_str(&mut buf, "folder id")?),
        }),
        TAG_REQUEST_DOWNLOAD => Message::RequestDownload(RequestDownload {
            file: get_file_info(&mut buf)?,
            start_offset: get_u64(&mut buf, "start_offset")?,
        }),
        TAG_REQUEST_PART => Message::RequestPart(RequestPart {
            file: get_file_info(&mut buf)?,
            range: get_range(&mut buf)?,
            progress: get_f64(&mut buf, "progress")?,
        }),
        TAG_START_UPLOAD => Message::StartUpload(StartUpload {
            file: get_file_info(&mut buf)?,
        }),
        TAG_FILE_CHUNK => Message::FileChunk(FileChunk {
            file: get_file_info(&mut buf)?,
            offset: get_u64(&mut buf, "offset")?,
            data: get_bytes(&mut buf, "chunk data")?,
        }),
        TAG_STOP_UPLOAD => Message::StopUpload(StopUpload {
            file: get_file_info(&mut buf)?,
        }),
        TAG_DOWNLOAD_QUEUED => Message::DownloadQueued(DownloadQueued {
            file: get_file_info(&mut buf)?,
        }),
        TAG_ABORT_DOWNLOAD => Message::AbortDownload(AbortDownload {
            file: get_file_info(&mut buf)?,
        }),
        TAG_ABORT_UPLOAD => Message::AbortUpload(AbortUpload {
            file: get_file_info(&mut buf)?,
        }),
        TAG_REQUEST_FILE_PARTS_RECORD => {
            Message::RequestFilePartsRecord(RequestFilePartsRecord {
                file: get_file_info(&mut buf)?,
            })
        }
        TAG_REPLY_FILE_PARTS_RECORD => {
            let file = get_file_info(&mut buf)?;
            let part_length = get_u64(&mut buf, "part_length")?;
            let count = get_count(&mut buf, "digests")?;
            let mut digests = Vec::with_capacity(count);
            for _ in 0..count {
                if buf.remaining() < 32 {
                    return Err(ProtoError::Truncated("digest"));
                }
                let mut digest = [0u8; 32];
                buf.copy_to_slice(&mut digest);
                digests.push(digest);
            }
            Message::ReplyFilePartsRecord(ReplyFilePartsRecord {
                file,
                record: FilePartsRecord {
                    part_length,
                    digests,
                },
            })
        }
        TAG_KNOWN_NODES => {
            let count = get_count(&mut buf, "nodes")?;
            let mut nodes = Vec::with_capacity(count);
            for _ in 0..count {
                nodes.push(get_node_info(&mut buf)?);
            }
            Message::KnownNodes(KnownNodes { nodes })
        }
        TAG_REQUEST_NODE_LIST => {
            let criteria = match get_u8(&mut buf, "criteria")? {
                0 => NodeListCriteria::All,
                1 => NodeListCriteria::OnlineSupernodes,
                2 => {
                    let count = get_count(&mut buf, "ids")?;
                    let mut ids = Vec::with_capacity(count);
                    for _ in 0..count {
                        ids.push(NodeId::new(get_str(&mut buf, "node id")?));
                    }
                    NodeListCriteria::Explicit { ids }
                }
                other => return Err(ProtoError::UnknownTag(u16::from(other))),
            };
            Message::RequestNodeList(RequestNodeList { criteria })
        }
        TAG_SEARCH_NODE_REQUEST => Message::SearchNodeRequest(SearchNodeRequest {
            pattern: get_str(&mut buf, "pattern")?,
        }),
        TAG_NODE_INFORMATION => Message::NodeInformation(NodeInformation {
            program_version: get_str(&mut buf, "program_version")?,
            known_nodes: get_u64(&mut buf, "known_nodes")?,
            connected_nodes: get_u64(&mut buf, "connected_nodes")?,
            active_transfers: get_u64(&mut buf, "active_transfers")?,
            queued_transfers: get_u64(&mut buf, "queued_transfers")?,
        }),
        TAG_TRANSFER_STATUS => Message::TransferStatus(TransferStatus {
            active_uploads: get_u32(&mut buf, "active_uploads")?,
            queued_uploads: get_u32(&mut buf, "queued_uploads")?,
            active_downloads: get_u32(&mut buf, "active_downloads")?,
            queued_downloads: get_u32(&mut buf, "queued_downloads")?,
            current_upload_cps: get_u64(&mut buf, "current_upload_cps")?,
            allowed_upload_cps: get_u64(&mut buf, "allowed_upload_cps")?,
            current_download_cps: get_u64(&mut buf, "current_download_cps")?,
            allowed_download_cps: get_u64(&mut buf, "allowed_download_cps")?,
        }),
        TAG_RELAYED => Message::Relayed(RelayedMessage {
            kind: get_relay_kind(&mut buf)?,
            connection_id: get_u64(&mut buf, "connection_id")?,
            source: NodeId::new(get_str(&mut buf, "source")?),
            destination: NodeId::new(get_str(&mut buf, "destination")?),
            payload: get_bytes(&mut buf, "relay payload")?,
        }),
        TAG_UDT => Message::Udt(UdtMessage {
            kind: get_relay_kind(&mut buf)?,
            source: NodeId::new(get_str(&mut buf, "source")?),
            destination: NodeId::new(get_str(&mut buf, "destination")?),
            port: get_u16(&mut buf, "port")?,
        }),
        TAG_INVITATION => Message::Invitation(Invitation {
            folder: get_folder_info(&mut buf)?,
            invitor: get_node_info(&mut buf)?,
            suggested_path: get_str(&mut buf, "suggested_path")?,
        }),
        TAG_TEXT_MESSAGE => Message::TextMessage(TextMessage {
            text: get_str(&mut buf, "text")?,
        }),
        TAG_NOTIFICATION => {
            let event = get_str(&mut buf, "event")?;
            let count = get_count(&mut buf, "args")?;
            let mut args = Vec::with_capacity(count);
            for _ in 0..count {
                args.push(get_str(&mut buf, "arg")?);
            }
            Message::Notification(Notification { event, args })
        }
        other => return Err(ProtoError::UnknownTag(other)),
    };

    Ok(message)
}

fn tag_of(message: &Message) -> u16 {
    match message {
        Message::Identity(_) => TAG_IDENTITY,
        Message::IdentityReply(_) => TAG_IDENTITY_REPLY,
        Message::HandshakeCompleted => TAG_HANDSHAKE_COMPLETED,
        Message::Ping(_) => TAG_PING,
        Message::Pong(_) => TAG_PONG,
        Message::Problem(_) => TAG_PROBLEM,
        Message::FolderList(_) => TAG_FOLDER_LIST,
        Message::FileList(_) => TAG_FILE_LIST,
        Message::FolderFilesChanged(_) => TAG_FOLDER_FILES_CHANGED,
        Message::FileListRequest(_) => TAG_FILE_LIST_REQUEST,
        Message::RequestDownload(_) => TAG_REQUEST_DOWNLOAD,
        Message::RequestPart(_) => TAG_REQUEST_PART,
        Message::StartUpload(_) => TAG_START_UPLOAD,
        Message::FileChunk(_) => TAG_FILE_CHUNK,
        Message::StopUpload(_) => TAG_STOP_UPLOAD,
        Message::DownloadQueued(_) => TAG_DOWNLOAD_QUEUED,
        Message::AbortDownload(_) => TAG_ABORT_DOWNLOAD,
        Message::AbortUpload(_) => TAG_ABORT_UPLOAD,
        Message::RequestFilePartsRecord(_) => TAG_REQUEST_FILE_PARTS_RECORD,
        Message::ReplyFilePartsRecord(_) => TAG_REPLY_FILE_PARTS_RECORD,
        Message::KnownNodes(_) => TAG_KNOWN_NODES,
        Message::RequestNodeList(_) => TAG_REQUEST_NODE_LIST,
        Message::SearchNodeRequest(_) => TAG_SEARCH_NODE_REQUEST,
        Message::NodeInformation(_) => TAG_NODE_INFORMATION,
        Message::TransferStatus(_) => TAG_TRANSFER_STATUS,
        Message::Relayed(_) => TAG_RELAYED,
        Message::Udt(_) => TAG_UDT,
        Message::Invitation(_) => TAG_INVITATION,
        Message::TextMessage(_) => TAG_TEXT_MESSAGE,
        Message::Notification(_) => TAG_NOTIFICATION,
    }
}

fn kind_name(tag: u16) -> Result<&'static str> {
    Ok(match tag {
        TAG_IDENTITY => "Identity",
        TAG_IDENTITY_REPLY => "IdentityReply",
        TAG_HANDSHAKE_COMPLETED => "HandshakeCompleted",
        TAG_PING => "Ping",
        TAG_PONG => "Pong",
        TAG_PROBLEM => "Problem",
        TAG_FOLDER_LIST => "FolderList",
        TAG_FILE_LIST => "FileList",
        TAG_FOLDER_FILES_CHANGED => "FolderFilesChanged",
        TAG_FILE_LIST_REQUEST => "FileListRequest",
        TAG_REQUEST_DOWNLOAD => "RequestDownload",
        TAG_REQUEST_PART => "RequestPart",
        TAG_START_UPLOAD => "StartUpload",
        TAG_FILE_CHUNK => "FileChunk",
        TAG_STOP_UPLOAD => "StopUpload",
        TAG_DOWNLOAD_QUEUED => "DownloadQueued",
        TAG_ABORT_DOWNLOAD => "AbortDownload",
        TAG_ABORT_UPLOAD => "AbortUpload",
        TAG_REQUEST_FILE_PARTS_RECORD => "RequestFilePartsRecord",
        TAG_REPLY_FILE_PARTS_RECORD => "ReplyFilePartsRecord",
        TAG_KNOWN_NODES => "KnownNodes",
        TAG_REQUEST_NODE_LIST => "RequestNodeList",
        TAG_SEARCH_NODE_REQUEST => "SearchNodeRequest",
        TAG_NODE_INFORMATION => "NodeInformation",
        TAG_TRANSFER_STATUS => "TransferStatus",
        TAG_RELAYED => "Relayed",
        TAG_UDT => "Udt",
        TAG_INVITATION => "Invitation",
        TAG_TEXT_MESSAGE => "TextMessage",
        TAG_NOTIFICATION => "Notification",
        other => return Err(ProtoError::UnknownTag(other)),
    })
}

// --- field helpers -------------------------------------------------------

fn put_bool(buf: &mut Vec<u8>, value: bool) {
    buf.put_u8(u8::from(value));
}

fn put_str(buf: &mut Vec<u8>, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn put_opt_str(buf: &mut Vec<u8>, s: Option<&str>) {
    match s {
        Some(s) => {
            buf.put_u8(1);
            put_str(buf, s);
        }
        None => buf.put_u8(0),
    }
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

fn put_time(buf: &mut Vec<u8>, time: &DateTime<Utc>) {
    buf.put_i64(time.timestamp_millis());
}

fn put_capabilities(buf: &mut Vec<u8>, caps: &Capabilities) {
    put_bool(buf, caps.encryption);
    put_bool(buf, caps.partial_transfers);
    put_bool(buf, caps.tunneled);
}

fn put_node_info(buf: &mut Vec<u8>, node: &NodeInfo) {
    put_str(buf, node.id.as_str());
    put_str(buf, &node.nick);
    put_opt_str(buf, node.address.map(|a| a.to_string()).as_deref());
    put_bool(buf, node.supernode);
    put_time(buf, &node.last_seen);
}

fn put_folder_info(buf: &mut Vec<u8>, folder: &FolderInfo) {
    put_str(buf, folder.id.as_str());
    put_str(buf, &folder.name);
    buf.put_u64(folder.files_count);
    buf.put_u64(folder.bytes_total);
}

fn put_file_info(buf: &mut Vec<u8>, file: &FileInfo) {
    put_str(buf, file.folder.as_str());
    put_str(buf, &file.path);
    buf.put_u64(file.size);
    put_time(buf, &file.modified);
    buf.put_u64(file.version);
    put_bool(buf, file.deleted);
}

fn put_file_infos(buf: &mut Vec<u8>, files: &[FileInfo]) {
    buf.put_u32(files.len() as u32);
    for file in files {
        put_file_info(buf, file);
    }
}

fn put_range(buf: &mut Vec<u8>, range: &Range) {
    buf.put_u64(range.offset);
    buf.put_u64(range.length);
}

fn put_relay_kind(buf: &mut Vec<u8>, kind: RelayKind) {
    buf.put_u8(match kind {
        RelayKind::Syn => 0,
        RelayKind::Ack => 1,
        RelayKind::Nack => 2,
        RelayKind::Eof => 3,
        RelayKind::DataZipped => 4,
    });
}

fn get_u8(buf: &mut &[u8], field: &'static str) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(ProtoError::Truncated(field));
    }
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut &[u8], field: &'static str) -> Result<u16> {
    if buf.remaining() < 2 {
        return Err(ProtoError::Truncated(field));
    }
    Ok(buf.get_u16())
}

fn get_u32(buf: &mut &[u8], field: &'static str) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(ProtoError::Truncated(field));
    }
    Ok(buf.get_u32())
}

fn get_u64(buf: &mut &[u8], field: &'static str) -> Result<u64> {
    if buf.remaining() < 8 {
        return Err(ProtoError::Truncated(field));
    }
    Ok(buf.get_u64())
}

fn get_i64(buf: &mut &[u8], field: &'static str) -> Result<i64> {
    if buf.remaining() < 8 {
        return Err(ProtoError::Truncated(field));
    }
    Ok(buf.get_i64())
}

fn get_f64(buf: &mut &[u8], field: &'static str) -> Result<f64> {
    if buf.remaining() < 8 {
        return Err(ProtoError::Truncated(field));
    }
    Ok(buf.get_f64())
}

fn get_bool(buf: &mut &[u8], field: &'static str) -> Result<bool> {
    Ok(get_u8(buf, field)? != 0)
}

fn get_count(buf: &mut &[u8], field: &'static str) -> Result<usize> {
    let count = get_u32(buf, field)? as usize;
    if count > limits::MAX_LIST_ITEMS {
        return Err(ProtoError::FieldTooLarge {
            field,
            size: count,
            max: limits::MAX_LIST_ITEMS,
        });
    }
    Ok(count)
}

fn get_str(buf: &mut &[u8], field: &'static str) -> Result<String> {
    let len = get_u32(buf, field)? as usize;
    if len > limits::MAX_STRING_LEN {
        return Err(ProtoError::FieldTooLarge {
            field,
            size: len,
            max: limits::MAX_STRING_LEN,
        });
    }
    if buf.remaining() < len {
        return Err(ProtoError::Truncated(field));
    }
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    String::from_utf8(bytes).map_err(|_| ProtoError::InvalidUtf8(field))
}

fn get_opt_str(buf: &mut &[u8], field: &'static str) -> Result<Option<String>> {
    if get_bool(buf, field)? {
        Ok(Some(get_str(buf, field)?))
    } else {
        Ok(None)
    }
}

fn get_bytes(buf: &mut &[u8], field: &'static str) -> Result<Vec<u8>> {
    let len = get_u32(buf, field)? as usize;
    if len > limits::MAX_CHUNK_SIZE {
        return Err(ProtoError::FieldTooLarge {
            field,
            size: len,
            max: limits::MAX_CHUNK_SIZE,
        });
    }
    if buf.remaining() < len {
        return Err(ProtoError::Truncated(field));
    }
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    Ok(bytes)
}

fn get_time(buf: &mut &[u8], field: &'static str) -> Result<DateTime<Utc>> {
    let millis = get_i64(buf, field)?;
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or(ProtoError::InvalidTimestamp(millis))
}

fn get_capabilities(buf: &mut &[u8]) -> Result<Capabilities> {
    Ok(Capabilities {
        encryption: get_bool(buf, "encryption")?,
        partial_transfers: get_bool(buf, "partial_transfers")?,
        tunneled: get_bool(buf, "tunneled")?,
    })
}

fn get_node_info(buf: &mut &[u8]) -> Result<NodeInfo> {
    let id = NodeId::new(get_str(buf, "node id")?);
    let nick = get_str(buf, "nick")?;
    let address = match get_opt_str(buf, "address")? {
        Some(s) => Some(
            s.parse()
                .map_err(|_| ProtoError::InvalidAddress(s.clone()))?,
        ),
        None => None,
    };
    Ok(NodeInfo {
        id,
        nick,
        address,
        supernode: get_bool(buf, "supernode")?,
        last_seen: get_time(buf, "last_seen")?,
    })
}

fn get_folder_info(buf: &mut &[u8]) -> Result<FolderInfo> {
    Ok(FolderInfo {
        id: FolderId::new(get_str(buf, "folder id")?),
        name: get_str(buf, "folder name")?,
        files_count: get_u64(buf, "files_count")?,
        bytes_total: get_u64(buf, "bytes_total")?,
    })
}

fn get_file_info(buf: &mut &[u8]) -> Result<FileInfo> {
    Ok(FileInfo {
        folder: FolderId::new(get_str(buf, "folder id")?),
        path: get_str(buf, "path")?,
        size: get_u64(buf, "size")?,
        modified: get_time(buf, "modified")?,
        version: get_u64(buf, "version")?,
        deleted: get_bool(buf, "deleted")?,
    })
}

fn get_file_infos(buf: &mut &[u8]) -> Result<Vec<FileInfo>> {
    let count = get_count(buf, "files")?;
    let mut files = Vec::with_capacity(count);
    for _ in 0..count {
        files.push(get_file_info(buf)?);
    }
    Ok(files)
}

fn get_range(buf: &mut &[u8]) -> Result<Range> {
    Ok(Range {
        offset: get_u64(buf, "range offset")?,
        length: get_u64(buf, "range length")?,
    })
}

fn get_relay_kind(buf: &mut &[u8]) -> Result<RelayKind> {
    Ok(match get_u8(buf, "relay kind")? {
        0 => RelayKind::Syn,
        1 => RelayKind::Ack,
        2 => RelayKind::Nack,
        3 => RelayKind::Eof,
        4 => RelayKind::DataZipped,
        other => return Err(ProtoError::UnknownTag(u16::from(other))),
    })
}
