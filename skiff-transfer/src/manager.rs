//! The transfer manager
//!
//! Downloads are pulled part by part: the downloader asks for a file, the
//! uploader grants or queues a slot, then each RequestPart is answered with
//! FileChunk frames. Slots are bounded per peer and globally with FIFO
//! promotion; chunk traffic is paced by the global and per-peer token
//! buckets. Aborts are idempotent and never discard partial data.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use skiff_proto::message::{
    AbortDownload, DownloadQueued, FileChunk, FilePartsRecord, RequestDownload, RequestPart,
    StartUpload, StopUpload, TransferStatus,
};
use skiff_proto::validation::{validate_progress, validate_range};
use skiff_proto::{FileInfo, Message, NodeId, Range};

use crate::bandwidth::{BandwidthLimiter, LimitScope};
use crate::errors::Result;
use crate::parts;
use crate::ranges::RangeSet;
use crate::source::{ChunkSink, ChunkSource};

/// Limits and pacing for all transfers of one engine.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub max_uploads: usize,
    pub max_uploads_per_peer: usize,
    pub max_downloads: usize,
    pub max_downloads_per_peer: usize,
    /// Largest FileChunk payload.
    pub max_chunk_size: usize,
    /// Size of one RequestPart.
    pub part_request_length: u64,
    /// Global upload cap in bytes/second, 0 for unlimited.
    pub upload_rate: u64,
    /// Per-peer upload cap in bytes/second, 0 for unlimited.
    pub upload_rate_per_peer: u64,
    /// Granularity of parts records.
    pub parts_record_length: u64,
    pub limit_scope: LimitScope,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_uploads: 8,
            max_uploads_per_peer: 3,
            max_downloads: 8,
            max_downloads_per_peer: 3,
            max_chunk_size: 256 * 1024,
            part_request_length: 1024 * 1024,
            upload_rate: 0,
            upload_rate_per_peer: 0,
            parts_record_length: parts::DEFAULT_PART_LENGTH,
            limit_scope: LimitScope::default(),
        }
    }
}

/// A message the caller must deliver to a peer.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub peer: NodeId,
    pub message: Message,
}

impl Outbound {
    fn new(peer: &NodeId, message: Message) -> Self {
        Self {
            peer: peer.clone(),
            message,
        }
    }
}

/// Transfer lifecycle notifications for the folder and UI layers.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    UploadStarted { peer: NodeId, file: FileInfo },
    UploadReleased { peer: NodeId, file: FileInfo },
    DownloadCompleted { peer: NodeId, file: FileInfo },
    DownloadAborted {
        peer: NodeId,
        file: FileInfo,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TransferKey {
    peer: NodeId,
    folder: skiff_proto::FolderId,
    path: String,
}

impl TransferKey {
    fn new(peer: &NodeId, file: &FileInfo) -> Self {
        Self {
            peer: peer.clone(),
            folder: file.folder.clone(),
            path: file.path.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DownloadPhase {
    /// Waiting for a local slot.
    PendingSlot,
    /// RequestDownload sent, waiting for the uploader.
    Requested,
    /// Uploader has us queued.
    RemoteQueued,
    /// Parts are flowing.
    Active,
    /// User paused; state and partial data retained, slot freed.
    Paused,
}

#[derive(Debug)]
struct DownloadState {
    file: FileInfo,
    received: RangeSet,
    in_flight: Option<Range>,
    phase: DownloadPhase,
}

impl DownloadState {
    fn progress(&self) -> f64 {
        self.received.progress(self.file.size)
    }
}

#[derive(Default)]
struct RateCounter {
    samples: VecDeque<(Instant, u64)>,
}

impl RateCounter {
    const WINDOW: Duration = Duration::from_secs(1);

    fn record(&mut self, bytes: u64) {
        let now = Instant::now();
        self.samples.push_back((now, bytes));
        self.prune(now);
    }

    fn prune(&mut self, now: Instant) {
        while self
            .samples
            .front()
            .is_some_and(|(at, _)| now.duration_since(*at) > Self::WINDOW)
        {
            self.samples.pop_front();
        }
    }

    fn rate(&mut self) -> u64 {
        self.prune(Instant::now());
        self.samples.iter().map(|(_, b)| b).sum()
    }
}

#[derive(Default)]
struct Inner {
    uploads: HashMap<TransferKey, FileInfo>,
    upload_queue: VecDeque<TransferKey>,
    queued_uploads: HashMap<TransferKey, FileInfo>,
    downloads: HashMap<TransferKey, DownloadState>,
    download_queue: VecDeque<TransferKey>,
    peer_upload_limiters: HashMap<NodeId, BandwidthLimiter>,
    upload_counter: RateCounter,
    download_counter: RateCounter,
}

impl Inner {
    fn uploads_for(&self, peer: &NodeId) -> usize {
        self.uploads.keys().filter(|k| k.peer == *peer).count()
    }

    fn holds_slot(phase: DownloadPhase) -> bool {
        !matches!(phase, DownloadPhase::PendingSlot | DownloadPhase::Paused)
    }

    fn active_downloads(&self) -> usize {
        self.downloads
            .values()
            .filter(|d| Self::holds_slot(d.phase))
            .count()
    }

    fn active_downloads_for(&self, peer: &NodeId) -> usize {
        self.downloads
            .iter()
            .filter(|(k, d)| k.peer == *peer && Self::holds_slot(d.phase))
            .count()
    }
}

/// Drives every upload and download of one engine.
pub struct TransferManager {
    config: TransferConfig,
    source: Arc<dyn ChunkSource>,
    sink: Arc<dyn ChunkSink>,
    inner: Arc<Mutex<Inner>>,
    upload_limiter: BandwidthLimiter,
    events: mpsc::UnboundedSender<TransferEvent>,
}

impl TransferManager {
    pub fn new(
        config: TransferConfig,
        source: Arc<dyn ChunkSource>,
        sink: Arc<dyn ChunkSink>,
    ) -> (Self, mpsc::UnboundedReceiver<TransferEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let upload_limiter = BandwidthLimiter::new(config.upload_rate);
        (
            Self {
                config,
                source,
                sink,
                inner: Arc::new(Mutex::new(Inner::default())),
                upload_limiter,
                events,
            },
            events_rx,
        )
    }

    pub fn limit_scope(&self) -> LimitScope {
        self.config.limit_scope
    }

    /// The shared global upload bucket, for callers that pace non-chunk
    /// traffic under [`LimitScope::AllMessages`].
    pub fn upload_limiter(&self) -> BandwidthLimiter {
        self.upload_limiter.clone()
    }

    // --- upload side ----------------------------------------------------

    /// A peer wants a file. Grant a slot (StartUpload) or queue the request
    /// (DownloadQueued), FIFO.
    pub fn handle_request_download(
        &self,
        peer: &NodeId,
        request: &RequestDownload,
    ) -> Result<Vec<Outbound>> {
        let key = TransferKey::new(peer, &request.file);
        let mut inner = self.inner.lock().unwrap();

        if inner.uploads.contains_key(&key) {
            // Already serving: repeat the grant, the peer may have missed it.
            return Ok(vec![Outbound::new(
                peer,
                Message::StartUpload(StartUpload {
                    file: request.file.clone(),
                }),
            )]);
        }

        if inner.uploads.len() < self.config.max_uploads
            && inner.uploads_for(peer) < self.config.max_uploads_per_peer
        {
            inner.uploads.insert(key, request.file.clone());
            drop(inner);
            info!(peer = %peer, path = %request.file.path, "upload slot granted");
            self.emit(TransferEvent::UploadStarted {
                peer: peer.clone(),
                file: request.file.clone(),
            });
            Ok(vec![Outbound::new(
                peer,
                Message::StartUpload(StartUpload {
                    file: request.file.clone(),
                }),
            )])
        } else {
            if !inner.queued_uploads.contains_key(&key) {
                inner.upload_queue.push_back(key.clone());
                inner.queued_uploads.insert(key, request.file.clone());
            }
            debug!(peer = %peer, path = %request.file.path, "upload queued");
            Ok(vec![Outbound::new(
                peer,
                Message::DownloadQueued(DownloadQueued {
                    file: request.file.clone(),
                }),
            )])
        }
    }

    /// Serve one part as a paced stream of FileChunk frames.
    pub async fn handle_request_part(
        &self,
        peer: &NodeId,
        request: &RequestPart,
    ) -> Result<Vec<Outbound>> {
        validate_range(&request.range, request.file.size)?;
        validate_progress(request.progress)?;

        let key = TransferKey::new(peer, &request.file);
        {
            let mut inner = self.inner.lock().unwrap();
            if !inner.uploads.contains_key(&key) {
                // Resume without a fresh RequestDownload: claim a slot the
                // same way.
                if inner.uploads.len() >= self.config.max_uploads
                    || inner.uploads_for(peer) >= self.config.max_uploads_per_peer
                {
                    if !inner.queued_uploads.contains_key(&key) {
                        inner.upload_queue.push_back(key.clone());
                        inner.queued_uploads.insert(key, request.file.clone());
                    }
                    return Ok(vec![Outbound::new(
                        peer,
                        Message::DownloadQueued(DownloadQueued {
                            file: request.file.clone(),
                        }),
                    )]);
                }
                inner.uploads.insert(key, request.file.clone());
            }
        }
        trace!(peer = %peer, path = %request.file.path, offset = request.range.offset,
               length = request.range.length, progress = request.progress, "part requested");

        let data = self.source.read_range(&request.file, &request.range).await?;
        let peer_limiter = self.peer_upload_limiter(peer);

        let mut messages = Vec::new();
        for (index, chunk) in data.chunks(self.config.max_chunk_size).enumerate() {
            let offset = request.range.offset + (index * self.config.max_chunk_size) as u64;
            self.upload_limiter.acquire(chunk.len() as u64).await;
            peer_limiter.acquire(chunk.len() as u64).await;

            self.inner
                .lock()
                .unwrap()
                .upload_counter
                .record(chunk.len() as u64);
            messages.push(Outbound::new(
                peer,
                Message::FileChunk(FileChunk {
                    file: request.file.clone(),
                    offset,
                    data: chunk.to_vec(),
                }),
            ));
        }
        Ok(messages)
    }

    /// StopUpload or AbortDownload from the downloader: cease immediately,
    /// free the slot. Idempotent.
    pub fn release_upload(&self, peer: &NodeId, file: &FileInfo) -> Vec<Outbound> {
        let key = TransferKey::new(peer, file);
        let mut inner = self.inner.lock().unwrap();
        let released = inner.uploads.remove(&key);
        inner.queued_uploads.remove(&key);
        inner.upload_queue.retain(|k| *k != key);

        if let Some(file) = released {
            debug!(peer = %peer, path = %file.path, "upload released");
            let promoted = self.promote_uploads(&mut inner);
            drop(inner);
            self.emit(TransferEvent::UploadReleased {
                peer: peer.clone(),
                file,
            });
            promoted
        } else {
            Vec::new()
        }
    }

    fn promote_uploads(&self, inner: &mut Inner) -> Vec<Outbound> {
        let mut granted = Vec::new();
        while inner.uploads.len() < self.config.max_uploads {
            let next = inner
                .upload_queue
                .iter()
                .position(|k| inner.uploads_for(&k.peer) < self.config.max_uploads_per_peer);
            let Some(position) = next else { break };
            let key = inner.upload_queue.remove(position).unwrap();
            let Some(file) = inner.queued_uploads.remove(&key) else {
                continue;
            };
            info!(peer = %key.peer, path = %file.path, "queued upload promoted");
            self.emit(TransferEvent::UploadStarted {
                peer: key.peer.clone(),
                file: file.clone(),
            });
            granted.push(Outbound::new(
                &key.peer,
                Message::StartUpload(StartUpload { file: file.clone() }),
            ));
            inner.uploads.insert(key, file);
        }
        granted
    }

    // --- download side --------------------------------------------------

    /// Ask `peer` for a file, resuming from `start_offset`. Waits for a
    /// local slot when the cap is reached.
    pub async fn request_download(
        &self,
        peer: &NodeId,
        file: FileInfo,
        start_offset: u64,
    ) -> Result<Vec<Outbound>> {
        let key = TransferKey::new(peer, &file);
        let mut received = RangeSet::new();
        if start_offset > 0 {
            received.insert(Range::new(0, start_offset.min(file.size)));
        }

        if received.is_complete(file.size) {
            // Nothing left to fetch; commit straight away.
            self.sink.commit(&file).await?;
            self.emit(TransferEvent::DownloadCompleted {
                peer: peer.clone(),
                file,
            });
            return Ok(Vec::new());
        }

        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.downloads.get(&key) {
            if existing.file.version >= file.version {
                trace!(path = %file.path, "download already tracked");
                return Ok(Vec::new());
            }
        }

        let has_slot = inner.active_downloads() < self.config.max_downloads
            && inner.active_downloads_for(peer) < self.config.max_downloads_per_peer;
        let phase = if has_slot {
            DownloadPhase::Requested
        } else {
            inner.download_queue.push_back(key.clone());
            DownloadPhase::PendingSlot
        };
        inner.downloads.insert(
            key,
            DownloadState {
                file: file.clone(),
                received,
                in_flight: None,
                phase,
            },
        );
        drop(inner);

        if has_slot {
            debug!(peer = %peer, path = %file.path, start_offset, "download requested");
            Ok(vec![Outbound::new(
                peer,
                Message::RequestDownload(RequestDownload { file, start_offset }),
            )])
        } else {
            debug!(peer = %peer, path = %file.path, "download waiting for local slot");
            Ok(Vec::new())
        }
    }

    /// The uploader granted our request: start pulling parts.
    pub async fn handle_start_upload(
        &self,
        peer: &NodeId,
        grant: &StartUpload,
    ) -> Result<Vec<Outbound>> {
        let key = TransferKey::new(peer, &grant.file);
        let (file, outbound) = {
            let mut inner = self.inner.lock().unwrap();
            let Some(download) = inner.downloads.get_mut(&key) else {
                debug!(peer = %peer, path = %grant.file.path, "grant for unknown download");
                return Ok(Vec::new());
            };
            download.phase = DownloadPhase::Active;

            match self.next_part_request(peer, download) {
                Some(request) => return Ok(vec![request]),
                None => {
                    // Already holding every byte (verified resume).
                    let file = download.file.clone();
                    inner.downloads.remove(&key);
                    let outbound = self.promote_downloads(&mut inner);
                    (file, outbound)
                }
            }
        };
        self.finish_download(peer, file).await?;
        Ok(outbound)
    }

    /// The uploader has us queued; keep the state, nothing to send.
    pub fn handle_download_queued(&self, peer: &NodeId, notice: &DownloadQueued) {
        let key = TransferKey::new(peer, &notice.file);
        if let Some(download) = self.inner.lock().unwrap().downloads.get_mut(&key) {
            debug!(peer = %peer, path = %notice.file.path, "queued on remote side");
            download.phase = DownloadPhase::RemoteQueued;
        }
    }

    /// A chunk arrived: land it, track coverage, pull the next part or
    /// finish.
    pub async fn handle_chunk(&self, peer: &NodeId, chunk: &FileChunk) -> Result<Vec<Outbound>> {
        let range = Range::new(chunk.offset, chunk.data.len() as u64);
        validate_range(&range, chunk.file.size)?;

        let key = TransferKey::new(peer, &chunk.file);
        {
            let inner = self.inner.lock().unwrap();
            let Some(download) = inner.downloads.get(&key) else {
                debug!(peer = %peer, path = %chunk.file.path, "chunk for unknown download");
                return Ok(Vec::new());
            };
            if download.file.version != chunk.file.version {
                warn!(
                    peer = %peer,
                    path = %chunk.file.path,
                    expected = download.file.version,
                    got = chunk.file.version,
                    "chunk for stale version, dropped"
                );
                return Ok(Vec::new());
            }
            if download.received.contains(&range) {
                trace!(path = %chunk.file.path, offset = chunk.offset, "duplicate chunk");
                return Ok(Vec::new());
            }
        }

        self.sink.write_chunk(&chunk.file, chunk.offset, &chunk.data).await?;

        let (file, outbound) = {
            let mut inner = self.inner.lock().unwrap();
            let Some(download) = inner.downloads.get_mut(&key) else {
                // Aborted while the write was in flight; data stays for resume.
                return Ok(Vec::new());
            };
            download.received.insert(range);
            inner.download_counter.record(chunk.data.len() as u64);

            let download = inner.downloads.get_mut(&key).unwrap();
            if download
                .in_flight
                .is_some_and(|r| download.received.contains(&r))
            {
                download.in_flight = None;
            }

            if download.received.is_complete(download.file.size) {
                let file = download.file.clone();
                inner.downloads.remove(&key);
                let outbound = self.promote_downloads(&mut inner);
                (file, outbound)
            } else if download.phase == DownloadPhase::Active && download.in_flight.is_none() {
                let request = self.next_part_request(peer, download);
                return Ok(request.into_iter().collect());
            } else {
                return Ok(Vec::new());
            }
        };
        self.finish_download(peer, file).await?;
        Ok(outbound)
    }

    /// User intent: stop pulling parts but keep the state and partial data
    /// for a later resume. The uploader's slot is released. Idempotent.
    pub fn pause_download(&self, peer: &NodeId, file: &FileInfo) -> Vec<Outbound> {
        let key = TransferKey::new(peer, file);
        let mut inner = self.inner.lock().unwrap();
        let Some(download) = inner.downloads.get_mut(&key) else {
            return Vec::new();
        };
        if download.phase == DownloadPhase::Paused {
            return Vec::new();
        }
        let was_queued = download.phase == DownloadPhase::PendingSlot;
        download.phase = DownloadPhase::Paused;
        download.in_flight = None;
        inner.download_queue.retain(|k| *k != key);

        debug!(peer = %peer, path = %file.path, "download paused");
        let mut outbound = Vec::new();
        if !was_queued {
            outbound.push(Outbound::new(
                peer,
                Message::StopUpload(StopUpload { file: file.clone() }),
            ));
        }
        outbound.extend(self.promote_downloads(&mut inner));
        outbound
    }

    /// User intent: continue a paused download from what was received.
    pub fn resume_download(&self, peer: &NodeId, file: &FileInfo) -> Vec<Outbound> {
        let key = TransferKey::new(peer, file);
        let mut inner = self.inner.lock().unwrap();
        let Some(download) = inner.downloads.get_mut(&key) else {
            return Vec::new();
        };
        if download.phase != DownloadPhase::Paused {
            return Vec::new();
        }

        if inner.active_downloads() < self.config.max_downloads
            && inner.active_downloads_for(peer) < self.config.max_downloads_per_peer
        {
            let download = inner.downloads.get_mut(&key).unwrap();
            download.phase = DownloadPhase::Requested;
            let start_offset = download
                .received
                .first_missing(download.file.size, u64::MAX)
                .map(|r| r.offset)
                .unwrap_or(0);
            debug!(peer = %peer, path = %file.path, start_offset, "download resumed");
            vec![Outbound::new(
                peer,
                Message::RequestDownload(RequestDownload {
                    file: download.file.clone(),
                    start_offset,
                }),
            )]
        } else {
            let download = inner.downloads.get_mut(&key).unwrap();
            download.phase = DownloadPhase::PendingSlot;
            inner.download_queue.push_back(key);
            Vec::new()
        }
    }

    /// User- or failure-driven abort. Safe to call from anywhere, any
    /// number of times; partial data is retained.
    pub fn abort_download(&self, peer: &NodeId, file: &FileInfo, reason: &str) -> Vec<Outbound> {
        let key = TransferKey::new(peer, file);
        let mut inner = self.inner.lock().unwrap();
        inner.download_queue.retain(|k| *k != key);
        let Some(removed) = inner.downloads.remove(&key) else {
            return Vec::new();
        };

        let mut outbound = Vec::new();
        if removed.phase != DownloadPhase::PendingSlot {
            outbound.push(Outbound::new(
                peer,
                Message::AbortDownload(AbortDownload { file: file.clone() }),
            ));
        }
        outbound.extend(self.promote_downloads(&mut inner));
        drop(inner);

        info!(peer = %peer, path = %file.path, reason, "download aborted");
        self.emit(TransferEvent::DownloadAborted {
            peer: peer.clone(),
            file: removed.file,
            reason: reason.to_string(),
        });
        outbound
    }

    /// The uploader gave up on us; drop the state, keep the bytes.
    pub fn handle_abort_upload(&self, peer: &NodeId, file: &FileInfo) {
        let key = TransferKey::new(peer, file);
        let removed = {
            let mut inner = self.inner.lock().unwrap();
            inner.download_queue.retain(|k| *k != key);
            inner.downloads.remove(&key)
        };
        if let Some(state) = removed {
            self.emit(TransferEvent::DownloadAborted {
                peer: peer.clone(),
                file: state.file,
                reason: "aborted by uploader".to_string(),
            });
        }
    }

    /// A peer went away: all its transfers end now. Partially-written data
    /// is not touched; a connection close is not a delete signal.
    pub fn peer_disconnected(&self, peer: &NodeId) -> Vec<Outbound> {
        let mut inner = self.inner.lock().unwrap();
        inner.upload_queue.retain(|k| k.peer != *peer);
        inner.queued_uploads.retain(|k, _| k.peer != *peer);
        inner.uploads.retain(|k, _| k.peer != *peer);
        inner.download_queue.retain(|k| k.peer != *peer);

        let aborted: Vec<DownloadState> = {
            let keys: Vec<TransferKey> = inner
                .downloads
                .keys()
                .filter(|k| k.peer == *peer)
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|k| inner.downloads.remove(&k))
                .collect()
        };
        let mut outbound = self.promote_uploads(&mut inner);
        outbound.extend(self.promote_downloads(&mut inner));
        drop(inner);

        for state in aborted {
            self.emit(TransferEvent::DownloadAborted {
                peer: peer.clone(),
                file: state.file,
                reason: "peer disconnected".to_string(),
            });
        }
        outbound
    }

    /// Advisory progress of one download.
    pub fn download_progress(&self, peer: &NodeId, file: &FileInfo) -> Option<f64> {
        let key = TransferKey::new(peer, file);
        self.inner
            .lock()
            .unwrap()
            .downloads
            .get(&key)
            .map(DownloadState::progress)
    }

    /// Snapshot for the UI layer and TransferStatus broadcasts.
    pub fn status(&self) -> TransferStatus {
        let mut inner = self.inner.lock().unwrap();
        let queued_downloads = inner
            .downloads
            .values()
            .filter(|d| d.phase == DownloadPhase::PendingSlot)
            .count() as u32;
        let active_downloads = inner.active_downloads() as u32;
        TransferStatus {
            active_uploads: inner.uploads.len() as u32,
            queued_uploads: inner.upload_queue.len() as u32,
            active_downloads,
            queued_downloads,
            current_upload_cps: inner.upload_counter.rate(),
            allowed_upload_cps: self.config.upload_rate,
            current_download_cps: inner.download_counter.rate(),
            allowed_download_cps: 0,
        }
    }

    /// Digest record of a local file, for ReplyFilePartsRecord.
    pub async fn build_parts_record(&self, file: &FileInfo) -> Result<FilePartsRecord> {
        parts::build_record(self.source.as_ref(), file, self.config.parts_record_length).await
    }

    /// Verify retained partial data against a peer's record; the verified
    /// coverage seeds the next resume.
    pub async fn verify_partial(
        &self,
        file: &FileInfo,
        record: &FilePartsRecord,
        received: &RangeSet,
    ) -> Result<RangeSet> {
        parts::verify_partial(self.source.as_ref(), file, record, received).await
    }

    // --- internals ------------------------------------------------------

    fn next_part_request(&self, peer: &NodeId, download: &mut DownloadState) -> Option<Outbound> {
        let missing = download
            .received
            .first_missing(download.file.size, self.config.part_request_length)?;
        download.in_flight = Some(missing);
        Some(Outbound::new(
            peer,
            Message::RequestPart(RequestPart {
                file: download.file.clone(),
                range: missing,
                progress: download.progress(),
            }),
        ))
    }

    fn promote_downloads(&self, inner: &mut Inner) -> Vec<Outbound> {
        let mut outbound = Vec::new();
        while inner.active_downloads() < self.config.max_downloads {
            let next = inner.download_queue.iter().position(|k| {
                inner.active_downloads_for(&k.peer) < self.config.max_downloads_per_peer
            });
            let Some(position) = next else { break };
            let key = inner.download_queue.remove(position).unwrap();
            let Some(download) = inner.downloads.get_mut(&key) else {
                continue;
            };
            download.phase = DownloadPhase::Requested;
            // Resume from the contiguous prefix already held.
            let start_offset = download
                .received
                .first_missing(download.file.size, u64::MAX)
                .map(|r| r.offset)
                .unwrap_or(0);
            debug!(peer = %key.peer, path = %download.file.path, "queued download promoted");
            outbound.push(Outbound::new(
                &key.peer,
                Message::RequestDownload(RequestDownload {
                    file: download.file.clone(),
                    start_offset,
                }),
            ));
        }
        outbound
    }

    async fn finish_download(&self, peer: &NodeId, file: FileInfo) -> Result<()> {
        self.sink.commit(&file).await?;
        info!(peer = %peer, path = %file.path, "download complete");
        self.emit(TransferEvent::DownloadCompleted {
            peer: peer.clone(),
            file,
        });
        Ok(())
    }

    fn peer_upload_limiter(&self, peer: &NodeId) -> BandwidthLimiter {
        self.inner
            .lock()
            .unwrap()
            .peer_upload_limiters
            .entry(peer.clone())
            .or_insert_with(|| BandwidthLimiter::new(self.config.upload_rate_per_peer))
            .clone()
    }

    fn emit(&self, event: TransferEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemoryStore;
    use skiff_proto::FolderId;

    fn file(path: &str, size: u64) -> FileInfo {
        let mut f = FileInfo::new(FolderId::new("folder"), path, size);
        f.version = 1;
        f
    }

    fn make(
        config: TransferConfig,
    ) -> (
        TransferManager,
        MemoryStore,
        mpsc::UnboundedReceiver<TransferEvent>,
    ) {
        let store = MemoryStore::new();
        let (manager, events) =
            TransferManager::new(config, Arc::new(store.clone()), Arc::new(store.clone()));
        (manager, store, events)
    }

    fn unwrap_kind<'a>(outbound: &'a [Outbound], kind: &str) -> &'a Message {
        assert_eq!(outbound.len(), 1, "expected exactly one {kind}");
        assert_eq!(outbound[0].message.kind(), kind);
        &outbound[0].message
    }

    #[tokio::test]
    async fn full_download_completes_and_commits() {
        let (uploader, up_store, _up_events) = make(TransferConfig::default());
        let (downloader, down_store, mut down_events) = make(TransferConfig::default());

        let doc = file("doc.txt", 100);
        up_store.put(&doc, vec![7u8; 100]);

        let uploader_id = NodeId::new("node-a");
        let downloader_id = NodeId::new("node-b");

        // B asks A for the file.
        let out = downloader
            .request_download(&uploader_id, doc.clone(), 0)
            .await
            .unwrap();
        let request = match unwrap_kind(&out, "RequestDownload") {
            Message::RequestDownload(m) => m.clone(),
            _ => unreachable!(),
        };

        // A grants the slot.
        let out = uploader
            .handle_request_download(&downloader_id, &request)
            .unwrap();
        let grant = match unwrap_kind(&out, "StartUpload") {
            Message::StartUpload(m) => m.clone(),
            _ => unreachable!(),
        };

        // B pulls the single missing part.
        let out = downloader
            .handle_start_upload(&uploader_id, &grant)
            .await
            .unwrap();
        let part = match unwrap_kind(&out, "RequestPart") {
            Message::RequestPart(m) => m.clone(),
            _ => unreachable!(),
        };
        assert_eq!(part.range, Range::new(0, 100));
        assert_eq!(part.progress, 0.0);

        // A streams the chunk, B lands it.
        let chunks = uploader
            .handle_request_part(&downloader_id, &part)
            .await
            .unwrap();
        assert_eq!(chunks.len(), 1);
        let chunk = match &chunks[0].message {
            Message::FileChunk(m) => m.clone(),
            other => panic!("unexpected {}", other.kind()),
        };
        downloader.handle_chunk(&uploader_id, &chunk).await.unwrap();

        match down_events.try_recv().unwrap() {
            TransferEvent::DownloadCompleted { file, .. } => assert_eq!(file.path, "doc.txt"),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(down_store.get(&doc).unwrap(), vec![7u8; 100]);
        assert_eq!(down_store.committed().len(), 1);
        assert_eq!(downloader.status().active_downloads, 0);
    }

    #[tokio::test]
    async fn parts_are_pulled_sequentially() {
        let (uploader, up_store, _e1) = make(TransferConfig {
            max_chunk_size: 400,
            part_request_length: 1000,
            ..TransferConfig::default()
        });
        let (downloader, _store, _e2) = make(TransferConfig {
            max_chunk_size: 400,
            part_request_length: 1000,
            ..TransferConfig::default()
        });

        let doc = file("big.bin", 2500);
        up_store.put(&doc, vec![1u8; 2500]);
        let uploader_id = NodeId::new("node-a");
        let downloader_id = NodeId::new("node-b");

        downloader
            .request_download(&uploader_id, doc.clone(), 0)
            .await
            .unwrap();
        let out = downloader
            .handle_start_upload(
                &uploader_id,
                &StartUpload { file: doc.clone() },
            )
            .await
            .unwrap();
        let part = match unwrap_kind(&out, "RequestPart") {
            Message::RequestPart(m) => m.clone(),
            _ => unreachable!(),
        };
        assert_eq!(part.range, Range::new(0, 1000));

        let chunks = uploader
            .handle_request_part(&downloader_id, &part)
            .await
            .unwrap();
        assert_eq!(chunks.len(), 3); // 400 + 400 + 200

        // No new part request until the in-flight one fully arrived.
        let mut next = Vec::new();
        for outbound in &chunks {
            let chunk = match &outbound.message {
                Message::FileChunk(m) => m.clone(),
                other => panic!("unexpected {}", other.kind()),
            };
            next = downloader.handle_chunk(&uploader_id, &chunk).await.unwrap();
        }
        let part = match unwrap_kind(&next, "RequestPart") {
            Message::RequestPart(m) => m.clone(),
            _ => unreachable!(),
        };
        assert_eq!(part.range, Range::new(1000, 1000));
        assert!((part.progress - 0.4).abs() < 1e-9);
    }

    #[tokio::test]
    async fn uploads_beyond_cap_queue_fifo() {
        let (uploader, store, _events) = make(TransferConfig {
            max_uploads: 1,
            ..TransferConfig::default()
        });
        let doc_a = file("a.bin", 10);
        let doc_b = file("b.bin", 10);
        store.put(&doc_a, vec![0; 10]);
        store.put(&doc_b, vec![0; 10]);

        let first = NodeId::new("peer-1");
        let second = NodeId::new("peer-2");

        let out = uploader
            .handle_request_download(
                &first,
                &RequestDownload {
                    file: doc_a.clone(),
                    start_offset: 0,
                },
            )
            .unwrap();
        unwrap_kind(&out, "StartUpload");

        let out = uploader
            .handle_request_download(
                &second,
                &RequestDownload {
                    file: doc_b.clone(),
                    start_offset: 0,
                },
            )
            .unwrap();
        unwrap_kind(&out, "DownloadQueued");
        assert_eq!(uploader.status().queued_uploads, 1);

        // Releasing the active slot promotes the queued request.
        let promoted = uploader.release_upload(&first, &doc_a);
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].peer, second);
        assert_eq!(promoted[0].message.kind(), "StartUpload");
        assert_eq!(uploader.status().queued_uploads, 0);
        assert_eq!(uploader.status().active_uploads, 1);
    }

    #[tokio::test]
    async fn resume_skips_already_received_bytes() {
        let (downloader, store, _events) = make(TransferConfig::default());
        let doc = file("resume.bin", 100);
        store.put(&doc, vec![0; 100]);
        let peer = NodeId::new("node-a");

        let out = downloader
            .request_download(&peer, doc.clone(), 40)
            .await
            .unwrap();
        match unwrap_kind(&out, "RequestDownload") {
            Message::RequestDownload(m) => assert_eq!(m.start_offset, 40),
            _ => unreachable!(),
        }

        let out = downloader
            .handle_start_upload(&peer, &StartUpload { file: doc.clone() })
            .await
            .unwrap();
        match unwrap_kind(&out, "RequestPart") {
            Message::RequestPart(m) => {
                assert_eq!(m.range, Range::new(40, 60));
                assert!((m.progress - 0.4).abs() < 1e-9);
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn abort_is_idempotent_and_keeps_partial_data() {
        let (downloader, store, mut events) = make(TransferConfig::default());
        let doc = file("doc.bin", 100);
        let peer = NodeId::new("node-a");

        downloader
            .request_download(&peer, doc.clone(), 0)
            .await
            .unwrap();
        downloader
            .handle_start_upload(&peer, &StartUpload { file: doc.clone() })
            .await
            .unwrap();
        downloader
            .handle_chunk(
                &peer,
                &FileChunk {
                    file: doc.clone(),
                    offset: 0,
                    data: vec![5; 50],
                },
            )
            .await
            .unwrap();

        let out = downloader.abort_download(&peer, &doc, "user request");
        assert!(out.iter().any(|o| o.message.kind() == "AbortDownload"));
        assert!(matches!(
            events.try_recv().unwrap(),
            TransferEvent::DownloadAborted { .. }
        ));

        // Second abort is a no-op, not an error.
        assert!(downloader.abort_download(&peer, &doc, "again").is_empty());
        assert!(events.try_recv().is_err());

        // Partially-written data stays for resume.
        assert_eq!(store.get(&doc).unwrap()[..50], vec![5; 50][..]);
    }

    #[tokio::test]
    async fn disconnect_aborts_transfers_but_not_data() {
        let (downloader, store, mut events) = make(TransferConfig::default());
        let doc = file("doc.bin", 100);
        let peer = NodeId::new("node-a");

        downloader
            .request_download(&peer, doc.clone(), 0)
            .await
            .unwrap();
        downloader
            .handle_chunk(
                &peer,
                &FileChunk {
                    file: doc.clone(),
                    offset: 0,
                    data: vec![9; 30],
                },
            )
            .await
            .unwrap();

        downloader.peer_disconnected(&peer);

        match events.try_recv().unwrap() {
            TransferEvent::DownloadAborted { reason, .. } => {
                assert_eq!(reason, "peer disconnected")
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(downloader.status().active_downloads, 0);
        assert_eq!(store.get(&doc).unwrap()[..30], vec![9; 30][..]);
    }

    #[tokio::test]
    async fn pause_frees_the_slot_and_resume_continues() {
        let (downloader, _store, _events) = make(TransferConfig::default());
        let doc = file("doc.bin", 100);
        let peer = NodeId::new("node-a");

        downloader
            .request_download(&peer, doc.clone(), 0)
            .await
            .unwrap();
        downloader
            .handle_start_upload(&peer, &StartUpload { file: doc.clone() })
            .await
            .unwrap();
        downloader
            .handle_chunk(
                &peer,
                &FileChunk {
                    file: doc.clone(),
                    offset: 0,
                    data: vec![1; 40],
                },
            )
            .await
            .unwrap();

        let out = downloader.pause_download(&peer, &doc);
        assert!(out.iter().any(|o| o.message.kind() == "StopUpload"));
        assert_eq!(downloader.status().active_downloads, 0);
        // Pausing again is a no-op.
        assert!(downloader.pause_download(&peer, &doc).is_empty());

        let out = downloader.resume_download(&peer, &doc);
        match &out[0].message {
            Message::RequestDownload(m) => assert_eq!(m.start_offset, 40),
            other => panic!("unexpected {}", other.kind()),
        }
        assert_eq!(downloader.status().active_downloads, 1);
    }

    #[tokio::test]
    async fn stale_version_chunks_are_dropped() {
        let (downloader, store, _events) = make(TransferConfig::default());
        let doc = file("doc.bin", 100);
        let peer = NodeId::new("node-a");

        downloader
            .request_download(&peer, doc.clone(), 0)
            .await
            .unwrap();

        let mut newer = doc.clone();
        newer.version = 2;
        let out = downloader
            .handle_chunk(
                &peer,
                &FileChunk {
                    file: newer,
                    offset: 0,
                    data: vec![1; 10],
                },
            )
            .await
            .unwrap();

        assert!(out.is_empty());
        assert!(store.get(&doc).is_none());
    }

    #[tokio::test]
    async fn zero_byte_file_completes_immediately() {
        let (downloader, store, mut events) = make(TransferConfig::default());
        let doc = file("empty.txt", 0);
        let peer = NodeId::new("node-a");

        let out = downloader
            .request_download(&peer, doc.clone(), 0)
            .await
            .unwrap();

        assert!(out.is_empty());
        assert!(matches!(
            events.try_recv().unwrap(),
            TransferEvent::DownloadCompleted { .. }
        ));
        assert_eq!(store.committed().len(), 1);
    }
}
