//! Per-folder file-list reconciliation
//!
//! The local index is authoritative for what this node offers; one remote
//! baseline per (peer, folder) mirrors what each peer announced. All merges
//! follow a single rule, so convergence does not depend on arrival order:
//! a record replaces another iff it has a strictly higher version, or the
//! same version and a deletion marker against a live record.

use std::collections::HashMap;

use tracing::{debug, trace, warn};

use skiff_proto::message::{FileList, FolderFilesChanged};
use skiff_proto::{file_list_messages, FileInfo, FolderId, FolderInfo, Message, NodeId};

use crate::errors::{Result, SyncError};
use crate::ignore::IgnoreRules;

/// Changes to announce to peers, computed against the last broadcast.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct OutgoingDelta {
    pub added: Vec<FileInfo>,
    pub removed: Vec<FileInfo>,
}

impl OutgoingDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// What one peer announced for one folder. Established by a full FileList;
/// deltas are only accepted on top of it.
#[derive(Debug, Default)]
pub struct RemoteBaseline {
    files: HashMap<String, FileInfo>,
    expected_deltas: u32,
    received_deltas: u32,
}

impl RemoteBaseline {
    /// The listing is complete once every announced delta arrived.
    pub fn is_complete(&self) -> bool {
        self.received_deltas >= self.expected_deltas
    }

    pub fn files(&self) -> impl Iterator<Item = &FileInfo> {
        self.files.values()
    }

    pub fn get(&self, path: &str) -> Option<&FileInfo> {
        self.files.get(path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn merge(&mut self, incoming: FileInfo) -> bool {
        merge_record(&mut self.files, incoming)
    }
}

struct FolderState {
    info: FolderInfo,
    files: HashMap<String, FileInfo>,
    last_broadcast: HashMap<String, FileInfo>,
    ignore: IgnoreRules,
}

/// Reconciles file listings across all joined folders and peers.
#[derive(Default)]
pub struct Reconciler {
    folders: HashMap<FolderId, FolderState>,
    remote: HashMap<(NodeId, FolderId), RemoteBaseline>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_folder(&mut self, info: FolderInfo, ignore: IgnoreRules) {
        debug!(folder = %info.id, name = %info.name, "folder joined");
        self.folders.insert(
            info.id.clone(),
            FolderState {
                info,
                files: HashMap::new(),
                last_broadcast: HashMap::new(),
                ignore,
            },
        );
    }

    pub fn folder(&self, id: &FolderId) -> Option<&FolderInfo> {
        self.folders.get(id).map(|f| &f.info)
    }

    pub fn folders(&self) -> impl Iterator<Item = &FolderInfo> {
        self.folders.values().map(|f| &f.info)
    }

    /// Map an incoming folder id, plain or obfuscated with the magic id we
    /// handed out, back to a joined folder.
    pub fn resolve_folder(&self, candidate: &FolderId, own_magic_id: &str) -> Option<FolderId> {
        self.folders
            .values()
            .find(|f| f.info.matches(candidate, own_magic_id))
            .map(|f| f.info.id.clone())
    }

    /// Record a local change (scan result or committed download). Ignored
    /// paths are not tracked; a record that does not supersede the stored
    /// one is dropped. Returns whether the index changed.
    pub fn apply_local_change(&mut self, file: FileInfo) -> Result<bool> {
        let folder = self
            .folders
            .get_mut(&file.folder)
            .ok_or_else(|| SyncError::UnknownFolder(file.folder.clone()))?;
        if folder.ignore.is_ignored(&file.path) {
            trace!(folder = %file.folder, path = %file.path, "ignored, not tracked");
            return Ok(false);
        }
        Ok(merge_record(&mut folder.files, file))
    }

    /// Current local index of a folder.
    pub fn local_files(&self, id: &FolderId) -> Result<Vec<FileInfo>> {
        let folder = self
            .folders
            .get(id)
            .ok_or_else(|| SyncError::UnknownFolder(id.clone()))?;
        Ok(folder.files.values().cloned().collect())
    }

    pub fn local_file(&self, id: &FolderId, path: &str) -> Option<&FileInfo> {
        self.folders.get(id).and_then(|f| f.files.get(path))
    }

    /// Establish a peer's baseline from a full listing. Unknown folders are
    /// ignored with a log line: the peer may share folders we did not join.
    pub fn apply_full_list(
        &mut self,
        peer: &NodeId,
        list: &FileList,
        own_magic_id: &str,
    ) -> bool {
        let Some(folder_id) = self.resolve_folder(&list.folder.id, own_magic_id) else {
            debug!(peer = %peer, folder = %list.folder.id, "file list for unjoined folder");
            return false;
        };

        let mut baseline = RemoteBaseline {
            files: HashMap::new(),
            expected_deltas: list.following_deltas,
            received_deltas: 0,
        };
        for file in &list.files {
            let mut file = file.clone();
            file.folder = folder_id.clone();
            baseline.merge(file);
        }

        debug!(
            peer = %peer,
            folder = %folder_id,
            files = baseline.len(),
            expected_deltas = baseline.expected_deltas,
            "baseline established"
        );
        self.remote.insert((peer.clone(), folder_id), baseline);
        true
    }

    /// Merge a delta into a peer's baseline. A delta with no baseline is a
    /// protocol slip by the peer: logged and dropped, never buffered.
    pub fn apply_delta(
        &mut self,
        peer: &NodeId,
        delta: &FolderFilesChanged,
        own_magic_id: &str,
    ) -> bool {
        let Some(folder_id) = self.resolve_folder(&delta.folder.id, own_magic_id) else {
            debug!(peer = %peer, folder = %delta.folder.id, "delta for unjoined folder");
            return false;
        };
        let Some(baseline) = self.remote.get_mut(&(peer.clone(), folder_id.clone())) else {
            warn!(peer = %peer, folder = %folder_id, "delta before any full list, dropping");
            return false;
        };

        baseline.received_deltas = baseline.received_deltas.saturating_add(1);
        for file in &delta.added {
            let mut file = file.clone();
            file.folder = folder_id.clone();
            baseline.merge(file);
        }
        for file in &delta.removed {
            // Removals are deletion markers regardless of how the sender
            // flagged them.
            let mut file = file.clone();
            file.folder = folder_id.clone();
            file.deleted = true;
            file.size = 0;
            baseline.merge(file);
        }
        true
    }

    pub fn remote_baseline(&self, peer: &NodeId, folder: &FolderId) -> Option<&RemoteBaseline> {
        self.remote.get(&(peer.clone(), folder.clone()))
    }

    /// Files a peer announced that supersede (or are missing from) our
    /// local index: the download candidates. Deletion markers are excluded;
    /// only complete listings are consulted.
    pub fn wanted_from(&self, peer: &NodeId, folder: &FolderId) -> Vec<FileInfo> {
        let Some(folder_state) = self.folders.get(folder) else {
            return Vec::new();
        };
        let Some(baseline) = self.remote_baseline(peer, folder) else {
            return Vec::new();
        };
        if !baseline.is_complete() {
            return Vec::new();
        }

        baseline
            .files()
            .filter(|remote| !remote.deleted)
            .filter(|remote| !folder_state.ignore.is_ignored(&remote.path))
            .filter(|remote| match folder_state.files.get(&remote.path) {
                Some(local) => remote.supersedes(local),
                None => true,
            })
            .cloned()
            .collect()
    }

    /// Deletions a peer announced that supersede live local records.
    pub fn deletions_from(&self, peer: &NodeId, folder: &FolderId) -> Vec<FileInfo> {
        let Some(folder_state) = self.folders.get(folder) else {
            return Vec::new();
        };
        let Some(baseline) = self.remote_baseline(peer, folder) else {
            return Vec::new();
        };
        if !baseline.is_complete() {
            return Vec::new();
        }

        baseline
            .files()
            .filter(|remote| remote.deleted)
            .filter(|remote| match folder_state.files.get(&remote.path) {
                Some(local) => remote.supersedes(local),
                None => false,
            })
            .cloned()
            .collect()
    }

    /// Changes since the last broadcast: live records that superseded their
    /// broadcast counterpart, and deletion markers against live ones.
    pub fn compute_outgoing_delta(&self, id: &FolderId) -> Result<OutgoingDelta> {
        let folder = self
            .folders
            .get(id)
            .ok_or_else(|| SyncError::UnknownFolder(id.clone()))?;

        let mut delta = OutgoingDelta::default();
        for (path, file) in &folder.files {
            let announced = folder.last_broadcast.get(path);
            let changed = match announced {
                Some(previous) => file.supersedes(previous),
                None => true,
            };
            if !changed {
                continue;
            }
            if file.deleted {
                // Deleting something never announced is not worth a delta.
                if announced.is_some_and(|previous| !previous.deleted) {
                    delta.removed.push(file.clone());
                }
            } else {
                delta.added.push(file.clone());
            }
        }
        Ok(delta)
    }

    /// Build the wire messages for a folder's full listing, splitting by
    /// `max_per_message`, obfuscating ids with the peer's magic id.
    pub fn full_list_messages(
        &self,
        id: &FolderId,
        peer_magic_id: &str,
        max_per_message: usize,
    ) -> Result<Vec<Message>> {
        let folder = self
            .folders
            .get(id)
            .ok_or_else(|| SyncError::UnknownFolder(id.clone()))?;

        let info = folder.info.obfuscated(peer_magic_id);
        let files: Vec<FileInfo> = folder
            .files
            .values()
            .map(|f| {
                let mut f = f.clone();
                f.folder = info.id.clone();
                f
            })
            .collect();

        let ignore = &folder.ignore;
        Ok(file_list_messages(
            &info,
            &files,
            |f| ignore.is_ignored(&f.path),
            max_per_message,
        ))
    }

    /// Snapshot the current index as broadcast; the next outgoing delta is
    /// computed against this.
    pub fn mark_broadcast(&mut self, id: &FolderId) -> Result<()> {
        let folder = self
            .folders
            .get_mut(id)
            .ok_or_else(|| SyncError::UnknownFolder(id.clone()))?;
        folder.last_broadcast = folder.files.clone();
        Ok(())
    }

    /// Forget everything a disconnected peer announced.
    pub fn peer_disconnected(&mut self, peer: &NodeId) {
        self.remote.retain(|(p, _), _| p != peer);
    }
}

fn merge_record(index: &mut HashMap<String, FileInfo>, incoming: FileInfo) -> bool {
    match index.get(&incoming.path) {
        Some(stored) if !incoming.supersedes(stored) => {
            trace!(path = %incoming.path, "record does not supersede, dropped");
            false
        }
        _ => {
            index.insert(incoming.path.clone(), incoming);
            true
        }
    }
}
