//! Splitting of large list-typed messages
//!
//! A listing larger than the configured per-message item cap goes out as an
//! ordered sequence of sub-messages; concatenating their item lists in order
//! reconstructs the original. The first file-list message announces how many
//! delta messages follow, so the receiver knows when the listing is complete.

use crate::info::{FileInfo, FolderInfo, NodeInfo};
use crate::message::{FileList, FolderFilesChanged, KnownNodes, Message};

/// Split `items` into ordered batches of at most `max_per_message` each.
///
/// Lossless and order-preserving: the concatenation of the result equals the
/// input. An empty input yields no batches.
pub fn split_items<T: Clone>(items: &[T], max_per_message: usize) -> Vec<Vec<T>> {
    assert!(max_per_message > 0, "max_per_message must be positive");
    items
        .chunks(max_per_message)
        .map(|chunk| chunk.to_vec())
        .collect()
}

/// Build the wire messages announcing a full file listing for one folder.
///
/// Items matching `is_ignored` are dropped before splitting, so both peers
/// agree on the tracked set. Three outcomes:
/// - input empty: one empty FileList (the folder really holds nothing)
/// - everything filtered out: no messages at all (nothing to send)
/// - otherwise: a FileList followed by the announced number of
///   FolderFilesChanged deltas
pub fn file_list_messages(
    folder: &FolderInfo,
    files: &[FileInfo],
    is_ignored: impl Fn(&FileInfo) -> bool,
    max_per_message: usize,
) -> Vec<Message> {
    if files.is_empty() {
        return vec![Message::FileList(FileList {
            folder: folder.clone(),
            files: Vec::new(),
            following_deltas: 0,
        })];
    }

    let kept: Vec<FileInfo> = files.iter().filter(|f| !is_ignored(f)).cloned().collect();
    if kept.is_empty() {
        // Only ignored entries: distinguish from a genuinely empty folder.
        return Vec::new();
    }

    let batches = split_items(&kept, max_per_message);
    let following_deltas = (batches.len() - 1) as u32;

    let mut messages = Vec::with_capacity(batches.len());
    for (index, batch) in batches.into_iter().enumerate() {
        if index == 0 {
            messages.push(Message::FileList(FileList {
                folder: folder.clone(),
                files: batch,
                following_deltas,
            }));
        } else {
            messages.push(Message::FolderFilesChanged(FolderFilesChanged {
                folder: folder.clone(),
                added: batch,
                removed: Vec::new(),
            }));
        }
    }
    messages
}

/// Split a node-list answer into bounded KnownNodes messages, preserving the
/// given ordering. An empty answer is a single empty KnownNodes.
pub fn known_nodes_messages(nodes: &[NodeInfo], max_per_message: usize) -> Vec<Message> {
    if nodes.is_empty() {
        return vec![Message::KnownNodes(KnownNodes { nodes: Vec::new() })];
    }
    split_items(nodes, max_per_message)
        .into_iter()
        .map(|batch| Message::KnownNodes(KnownNodes { nodes: batch }))
        .collect()
}
