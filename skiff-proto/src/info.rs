//! Identity and metadata records carried on the wire
//!
//! These are the light-weight descriptions of peers, folders and files that
//! messages embed. They are plain values: relationships between them are
//! expressed as id references, never as object pointers.

use std::fmt;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable identifier of a peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable identifier of a synchronized folder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FolderId(String);

impl FolderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Last known information about a peer.
///
/// Owned by the node registry; mutated on connect, disconnect and info
/// updates. Entries are never destroyed, only go stale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub nick: String,
    pub address: Option<SocketAddr>,
    pub supernode: bool,
    pub last_seen: DateTime<Utc>,
}

impl NodeInfo {
    pub fn new(id: impl Into<String>, nick: impl Into<String>) -> Self {
        Self {
            id: NodeId::new(id),
            nick: nick.into(),
            address: None,
            supernode: false,
            last_seen: Utc::now(),
        }
    }

    /// An identity is acceptable only with a non-empty id and nickname.
    pub fn is_valid(&self) -> bool {
        !self.id.is_empty() && !self.nick.is_empty()
    }
}

/// Identity and aggregate statistics of a synchronized folder.
///
/// Immutable once created. When sent to a peer that must not learn the plain
/// folder id, the id is replaced by a magic-id-derived digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FolderInfo {
    pub id: FolderId,
    pub name: String,
    pub files_count: u64,
    pub bytes_total: u64,
}

impl FolderInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: FolderId::new(id),
            name: name.into(),
            files_count: 0,
            bytes_total: 0,
        }
    }

    /// Derive the obfuscated id this folder presents to a peer that handed us
    /// `magic_id` in its Identity.
    pub fn secure_id(&self, magic_id: &str) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(magic_id.as_bytes());
        hasher.update(self.id.as_str().as_bytes());
        hasher.finalize().to_hex().to_string()
    }

    /// Clone of this folder info carrying the obfuscated id.
    pub fn obfuscated(&self, magic_id: &str) -> FolderInfo {
        FolderInfo {
            id: FolderId::new(self.secure_id(magic_id)),
            name: self.name.clone(),
            files_count: self.files_count,
            bytes_total: self.bytes_total,
        }
    }

    /// True if `candidate` is this folder's id, either plain or obfuscated
    /// with the magic id we handed out.
    pub fn matches(&self, candidate: &FolderId, own_magic_id: &str) -> bool {
        self.id == *candidate || self.secure_id(own_magic_id) == candidate.as_str()
    }
}

/// A file as a folder should contain it, at one version.
///
/// Within a folder a path maps to at most one currently-valid record. Records
/// are superseded, never mutated in place; the version is monotonically
/// non-decreasing per path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub folder: FolderId,
    /// Path relative to the folder root, `/`-separated.
    pub path: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub version: u64,
    pub deleted: bool,
}

impl FileInfo {
    pub fn new(folder: FolderId, path: impl Into<String>, size: u64) -> Self {
        Self {
            folder,
            path: path.into(),
            size,
            modified: Utc::now(),
            version: 0,
            deleted: false,
        }
    }

    /// Reconciliation rule: a record replaces `other` iff its version is
    /// strictly greater, or versions are equal and this one is a deletion
    /// marker while the other is not.
    pub fn supersedes(&self, other: &FileInfo) -> bool {
        if self.version != other.version {
            return self.version > other.version;
        }
        self.deleted && !other.deleted
    }

    /// Successor record marking this path deleted.
    pub fn deleted_version(&self) -> FileInfo {
        FileInfo {
            folder: self.folder.clone(),
            path: self.path.clone(),
            size: 0,
            modified: Utc::now(),
            version: self.version + 1,
            deleted: true,
        }
    }
}

/// A contiguous byte sub-region of a file at a given version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range {
    pub offset: u64,
    pub length: u64,
}

impl Range {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    pub fn overlaps(&self, other: &Range) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(version: u64, deleted: bool) -> FileInfo {
        FileInfo {
            folder: FolderId::new("folder"),
            path: "doc.txt".to_string(),
            size: 100,
            modified: Utc::now(),
            version,
            deleted,
        }
    }

    #[test]
    fn higher_version_supersedes() {
        assert!(file(2, false).supersedes(&file(1, false)));
        assert!(!file(1, false).supersedes(&file(2, false)));
        assert!(!file(1, false).supersedes(&file(1, false)));
    }

    #[test]
    fn deletion_wins_at_equal_version() {
        assert!(file(1, true).supersedes(&file(1, false)));
        assert!(!file(1, false).supersedes(&file(1, true)));
        assert!(!file(1, true).supersedes(&file(1, true)));
    }

    #[test]
    fn deletion_loses_to_higher_version() {
        assert!(file(2, false).supersedes(&file(1, true)));
    }

    #[test]
    fn secure_id_roundtrip() {
        let folder = FolderInfo::new("plain-id", "Documents");
        let obfuscated = folder.obfuscated("magic-123");

        assert_ne!(obfuscated.id, folder.id);
        assert!(folder.matches(&obfuscated.id, "magic-123"));
        assert!(!folder.matches(&obfuscated.id, "other-magic"));
        assert!(folder.matches(&folder.id, "magic-123"));
    }

    #[test]
    fn range_overlap() {
        let a = Range::new(0, 100);
        assert!(a.overlaps(&Range::new(50, 100)));
        assert!(!a.overlaps(&Range::new(100, 10)));
        assert!(!Range::new(100, 10).overlaps(&a));
    }
}
