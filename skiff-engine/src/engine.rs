//! The protocol engine
//!
//! One Engine owns the peer registry, the reconciler, the transfer manager
//! and the relay manager, and routes every inbound message to the right
//! one. Each connection is driven by its own task, so peers proceed in
//! parallel while messages from a single peer stay strictly ordered.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use skiff_net::relay::{forward, ForwardDecision};
use skiff_net::{fresh_magic_id, Connection, RelayManager, RelayedChannel};
use skiff_nodes::NodeRegistry;
use skiff_proto::message::{
    FolderFilesChanged, FolderList, Identity, NodeInformation, RelayKind, ReplyFilePartsRecord,
    TextMessage, TransferStatus, UdtMessage,
};
use skiff_proto::{
    known_nodes_messages, Capabilities, FileInfo, FolderId, Message, NodeId, NodeInfo, Range,
    PROTOCOL_VERSION,
};
use skiff_sync::Reconciler;
use skiff_transfer::{LimitScope, Outbound, RangeSet, TransferEvent, TransferManager};

use crate::config::{EngineConfig, SyncProfile};
use crate::errors::{EngineError, Result};
use crate::events::EngineEvent;
use crate::repository::FolderRepository;

struct Shared {
    config: EngineConfig,
    self_node: NodeInfo,
    registry: Mutex<NodeRegistry>,
    reconciler: Mutex<Reconciler>,
    transfers: TransferManager,
    relay: RelayManager,
    connections: Mutex<HashMap<NodeId, Connection>>,
    profiles: Mutex<HashMap<FolderId, SyncProfile>>,
    relayed_incoming: Mutex<Vec<RelayedChannel>>,
    events: mpsc::UnboundedSender<EngineEvent>,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: watch::Sender<bool>,
}

/// Clonable handle to the running engine. Construct with [`Engine::start`],
/// stop with [`Engine::stop`].
#[derive(Clone)]
pub struct Engine {
    shared: Arc<Shared>,
}

impl Engine {
    /// Bring the engine up: load folders from the repository, bind the
    /// listener when configured, start background tasks.
    pub async fn start<R>(
        config: EngineConfig,
        repository: Arc<R>,
    ) -> Result<(Engine, mpsc::UnboundedReceiver<EngineEvent>)>
    where
        R: FolderRepository + 'static,
    {
        let mut self_node = NodeInfo::new(config.node_id.clone(), config.nick.clone());
        self_node.supernode = config.supernode;

        let (transfers, transfer_events) = TransferManager::new(
            config.transfer.clone(),
            repository.clone(),
            repository.clone(),
        );
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        let engine = Engine {
            shared: Arc::new(Shared {
                registry: Mutex::new(NodeRegistry::new(
                    self_node.clone(),
                    config.registry.clone(),
                )),
                reconciler: Mutex::new(Reconciler::new()),
                transfers,
                relay: RelayManager::new(self_node.id.clone()),
                connections: Mutex::new(HashMap::new()),
                profiles: Mutex::new(HashMap::new()),
                relayed_incoming: Mutex::new(Vec::new()),
                events: events_tx,
                local_addr: Mutex::new(None),
                shutdown,
                self_node,
                config,
            }),
        };

        // Seed the reconciler with the repository's view.
        for (info, ignore) in repository.folders().await {
            let folder_id = info.id.clone();
            engine
                .shared
                .reconciler
                .lock()
                .unwrap()
                .add_folder(info, ignore);
            for file in repository.file_list(&folder_id).await {
                engine
                    .shared
                    .reconciler
                    .lock()
                    .unwrap()
                    .apply_local_change(file)?;
            }
        }

        // Transfer lifecycle feeds the folder index and the event stream.
        {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine.drive_transfer_events(transfer_events).await;
            });
        }

        if let Some(bind_addr) = engine.shared.config.bind_addr {
            let listener = TcpListener::bind(bind_addr).await?;
            *engine.shared.local_addr.lock().unwrap() = Some(listener.local_addr()?);

            let (accepted_tx, mut accepted_rx) = mpsc::channel(16);
            {
                let identity = engine.identity();
                let net = engine.shared.config.net.clone();
                let mut shutdown = engine.shared.shutdown.subscribe();
                tokio::spawn(async move {
                    tokio::select! {
                        result = skiff_net::serve(listener, identity, net, accepted_tx) => {
                            if let Err(e) = result {
                                warn!(error = %e, "listener stopped");
                            }
                        }
                        _ = shutdown.changed() => {}
                    }
                });
            }
            {
                let engine = engine.clone();
                tokio::spawn(async move {
                    while let Some(pair) = accepted_rx.recv().await {
                        if let Err(e) = engine.register_connection(pair).await {
                            warn!(error = %e, "inbound connection setup failed");
                        }
                    }
                });
            }
        }

        info!(node = %engine.shared.self_node.id, nick = %engine.shared.self_node.nick, "engine started");
        Ok((engine, events_rx))
    }

    /// Stop accepting and drop every connection.
    pub async fn stop(&self) {
        let _ = self.shared.shutdown.send(true);
        let connections: Vec<Connection> = self
            .shared
            .connections
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect();
        for connection in connections {
            connection.close();
        }
        info!(node = %self.shared.self_node.id, "engine stopped");
    }

    /// Dial a peer, run the handshake, start driving the connection.
    pub async fn connect_peer(&self, addr: SocketAddr) -> Result<NodeId> {
        let pair =
            skiff_net::connect(addr, self.identity(), self.shared.config.net.clone()).await?;
        let peer = pair.0.peer().id.clone();
        self.register_connection(pair).await?;
        Ok(peer)
    }

    pub fn self_id(&self) -> &NodeId {
        &self.shared.self_node.id
    }

    /// Actual listening address, once bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local_addr.lock().unwrap()
    }

    pub fn known_nodes(&self) -> Vec<NodeInfo> {
        self.shared.registry.lock().unwrap().valid_nodes()
    }

    pub fn is_connected(&self, peer: &NodeId) -> bool {
        self.shared.connections.lock().unwrap().contains_key(peer)
    }

    /// Snapshot for the UI layer.
    pub fn transfer_status(&self) -> TransferStatus {
        self.shared.transfers.status()
    }

    /// Runtime counters, as answered to peers asking for debug info.
    pub fn node_information(&self) -> NodeInformation {
        let (known, connected) = {
            let registry = self.shared.registry.lock().unwrap();
            (registry.len() as u64, registry.connected_count() as u64)
        };
        let status = self.shared.transfers.status();
        NodeInformation {
            program_version: self.shared.config.program_version.clone(),
            known_nodes: known,
            connected_nodes: connected,
            active_transfers: u64::from(status.active_uploads + status.active_downloads),
            queued_transfers: u64::from(status.queued_uploads + status.queued_downloads),
        }
    }

    /// User intent: choose how a folder syncs.
    pub fn set_sync_profile(&self, folder: FolderId, profile: SyncProfile) {
        self.shared.profiles.lock().unwrap().insert(folder, profile);
    }

    /// Record a local scan result in the index. Pair with
    /// [`broadcast_changes`](Self::broadcast_changes) to announce it.
    pub fn index_local_change(&self, file: FileInfo) -> Result<bool> {
        Ok(self
            .shared
            .reconciler
            .lock()
            .unwrap()
            .apply_local_change(file)?)
    }

    /// User intent: fetch one file from one peer, resuming at an offset.
    pub async fn request_file(
        &self,
        peer: &NodeId,
        file: FileInfo,
        start_offset: u64,
    ) -> Result<()> {
        let outbound = self
            .shared
            .transfers
            .request_download(peer, file, start_offset)
            .await?;
        self.route(outbound).await;
        Ok(())
    }

    /// User intent: abort a download. Idempotent.
    pub async fn abort_download(&self, peer: &NodeId, file: &FileInfo) -> Result<()> {
        let outbound = self.shared.transfers.abort_download(peer, file, "user request");
        self.route(outbound).await;
        Ok(())
    }

    /// User intent: pause a download, keeping partial data for resume.
    pub async fn pause_download(&self, peer: &NodeId, file: &FileInfo) -> Result<()> {
        let outbound = self.shared.transfers.pause_download(peer, file);
        self.route(outbound).await;
        Ok(())
    }

    /// User intent: continue a paused download.
    pub async fn resume_download(&self, peer: &NodeId, file: &FileInfo) -> Result<()> {
        let outbound = self.shared.transfers.resume_download(peer, file);
        self.route(outbound).await;
        Ok(())
    }

    pub async fn send_text(&self, peer: &NodeId, text: impl Into<String>) -> Result<()> {
        self.send_to(peer, Message::TextMessage(TextMessage { text: text.into() }))
            .await
    }

    /// Share our transfer activity with a peer, for its UI.
    pub async fn share_transfer_status(&self, peer: &NodeId) -> Result<()> {
        self.send_to(peer, Message::TransferStatus(self.transfer_status()))
            .await
    }

    /// Share our runtime counters with a peer.
    pub async fn share_node_information(&self, peer: &NodeId) -> Result<()> {
        self.send_to(peer, Message::NodeInformation(self.node_information()))
            .await
    }

    /// Fire a liveness probe at a peer.
    pub async fn ping(&self, peer: &NodeId) -> Result<()> {
        let connection = self.connection(peer)?;
        connection.ping().await?;
        Ok(())
    }

    /// Open a relayed byte channel to `destination` through a connected
    /// relay peer. None when the attempt failed normally.
    pub async fn open_relayed(
        &self,
        via: &NodeId,
        destination: NodeId,
    ) -> Result<Option<RelayedChannel>> {
        let relay_connection = self.connection(via)?;
        let channel = self
            .shared
            .relay
            .connect_via(
                relay_connection.sender(),
                destination,
                self.shared.config.net.relay_ack_timeout,
            )
            .await?;
        Ok(channel)
    }

    /// Relayed channels peers opened towards us, in arrival order.
    pub fn take_relayed_channels(&self) -> Vec<RelayedChannel> {
        std::mem::take(&mut self.shared.relayed_incoming.lock().unwrap())
    }

    /// Announce local changes to every connected peer, split per the
    /// configured item cap, then snapshot the broadcast state.
    pub async fn broadcast_changes(&self) -> Result<()> {
        let folder_ids: Vec<FolderId> = {
            let reconciler = self.shared.reconciler.lock().unwrap();
            reconciler.folders().map(|f| f.id.clone()).collect()
        };

        for folder_id in folder_ids {
            let delta = {
                let reconciler = self.shared.reconciler.lock().unwrap();
                reconciler.compute_outgoing_delta(&folder_id)?
            };
            if delta.is_empty() {
                continue;
            }

            let connections: Vec<Connection> = self
                .shared
                .connections
                .lock()
                .unwrap()
                .values()
                .cloned()
                .collect();
            for connection in connections {
                let info = {
                    let reconciler = self.shared.reconciler.lock().unwrap();
                    match reconciler.folder(&folder_id) {
                        Some(info) => info.obfuscated(connection.remote_magic_id()),
                        None => continue,
                    }
                };
                let rewrite = |files: &[FileInfo]| -> Vec<FileInfo> {
                    files
                        .iter()
                        .map(|f| {
                            let mut f = f.clone();
                            f.folder = info.id.clone();
                            f
                        })
                        .collect()
                };

                let max = self.shared.config.max_items_per_message;
                let mut messages = Vec::new();
                for chunk in delta.added.chunks(max) {
                    messages.push(Message::FolderFilesChanged(FolderFilesChanged {
                        folder: info.clone(),
                        added: rewrite(chunk),
                        removed: Vec::new(),
                    }));
                }
                for chunk in delta.removed.chunks(max) {
                    messages.push(Message::FolderFilesChanged(FolderFilesChanged {
                        folder: info.clone(),
                        added: Vec::new(),
                        removed: rewrite(chunk),
                    }));
                }
                for message in messages {
                    if let Err(e) = connection.send(message).await {
                        debug!(peer = %connection.peer().id, error = %e, "delta not delivered");
                        break;
                    }
                }
            }

            self.shared
                .reconciler
                .lock()
                .unwrap()
                .mark_broadcast(&folder_id)?;
        }
        Ok(())
    }

    // --- internals ------------------------------------------------------

    fn identity(&self) -> Identity {
        let mut node = self.shared.self_node.clone();
        node.last_seen = chrono::Utc::now();
        Identity {
            node,
            magic_id: fresh_magic_id(),
            capabilities: Capabilities {
                encryption: false,
                partial_transfers: true,
                tunneled: false,
            },
            protocol_version: PROTOCOL_VERSION,
            program_version: self.shared.config.program_version.clone(),
            acknowledges_handshake_completion: self
                .shared
                .config
                .net
                .acknowledges_handshake_completion,
        }
    }

    fn connection(&self, peer: &NodeId) -> Result<Connection> {
        self.shared
            .connections
            .lock()
            .unwrap()
            .get(peer)
            .cloned()
            .ok_or_else(|| EngineError::PeerNotConnected(peer.clone()))
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.shared.events.send(event);
    }

    async fn register_connection(
        &self,
        (connection, mut inbound): (Connection, mpsc::Receiver<Message>),
    ) -> Result<()> {
        let peer = connection.peer().clone();
        self.shared
            .registry
            .lock()
            .unwrap()
            .peer_connected(peer.clone());

        if let Some(previous) = self
            .shared
            .connections
            .lock()
            .unwrap()
            .insert(peer.id.clone(), connection.clone())
        {
            debug!(peer = %peer.id, "replacing existing connection");
            previous.close();
        }
        self.emit(EngineEvent::PeerConnected(peer.clone()));

        // Opening traffic: our folders and their full listings.
        let magic = connection.remote_magic_id().to_string();
        let (folder_list, listings) = {
            let reconciler = self.shared.reconciler.lock().unwrap();
            let folders: Vec<_> = reconciler.folders().cloned().collect();
            let folder_list = Message::FolderList(FolderList {
                folders: folders.iter().map(|f| f.obfuscated(&magic)).collect(),
            });
            let mut listings = Vec::new();
            for folder in &folders {
                listings.push((
                    folder.id.clone(),
                    reconciler.full_list_messages(
                        &folder.id,
                        &magic,
                        self.shared.config.max_items_per_message,
                    )?,
                ));
            }
            (folder_list, listings)
        };
        connection.send(folder_list).await?;
        for (folder_id, messages) in listings {
            for message in messages {
                connection.send(message).await?;
            }
            self.shared
                .reconciler
                .lock()
                .unwrap()
                .mark_broadcast(&folder_id)?;
        }

        // Drive the connection until it closes.
        let engine = self.clone();
        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                if let Err(e) = engine.handle_message(&connection, message).await {
                    warn!(peer = %connection.peer().id, error = %e, "message handling failed");
                }
            }
            engine.handle_disconnect(&connection.peer().id).await;
        });
        Ok(())
    }

    async fn handle_disconnect(&self, peer: &NodeId) {
        info!(%peer, "peer disconnected");
        self.shared.connections.lock().unwrap().remove(peer);
        self.shared.registry.lock().unwrap().peer_disconnected(peer);
        self.shared
            .reconciler
            .lock()
            .unwrap()
            .peer_disconnected(peer);
        let outbound = self.shared.transfers.peer_disconnected(peer);
        self.route(outbound).await;
        self.emit(EngineEvent::PeerDisconnected(peer.clone()));
    }

    async fn drive_transfer_events(&self, mut events: mpsc::UnboundedReceiver<TransferEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                TransferEvent::DownloadCompleted { peer, file } => {
                    if let Err(e) = self
                        .shared
                        .reconciler
                        .lock()
                        .unwrap()
                        .apply_local_change(file.clone())
                    {
                        warn!(path = %file.path, error = %e, "completed download not indexed");
                    }
                    self.emit(EngineEvent::TransferCompleted { peer, file });
                    if let Err(e) = self.broadcast_changes().await {
                        warn!(error = %e, "post-download broadcast failed");
                    }
                }
                TransferEvent::DownloadAborted { peer, file, reason } => {
                    self.emit(EngineEvent::TransferFailed { peer, file, reason });
                }
                TransferEvent::UploadStarted { peer, file } => {
                    trace!(%peer, path = %file.path, "upload started");
                }
                TransferEvent::UploadReleased { peer, file } => {
                    trace!(%peer, path = %file.path, "upload released");
                }
            }
        }
    }

    async fn route(&self, outbound: Vec<Outbound>) {
        for out in outbound {
            if let Err(e) = self.send_to(&out.peer, out.message).await {
                debug!(peer = %out.peer, error = %e, "outbound message dropped");
            }
        }
    }

    async fn send_to(&self, peer: &NodeId, message: Message) -> Result<()> {
        let connection = self.connection(peer)?;
        // Chunk frames are paced where they are produced; under the wide
        // scope everything else debits the same bucket here.
        if self.shared.transfers.limit_scope() == LimitScope::AllMessages
            && !message.carries_chunk_data()
        {
            let size = skiff_proto::codec::encode(&message, self.shared.config.net.wire_format)
                .map(|bytes| bytes.len() as u64)
                .unwrap_or(256);
            self.shared.transfers.upload_limiter().acquire(size).await;
        }
        connection.send(message).await?;
        Ok(())
    }

    async fn handle_message(&self, connection: &Connection, message: Message) -> Result<()> {
        let peer = connection.peer().id.clone();
        match message {
            Message::FolderList(m) => {
                debug!(%peer, folders = m.folders.len(), "peer shared folder list");
            }
            Message::FileList(m) => {
                let folder = {
                    let mut reconciler = self.shared.reconciler.lock().unwrap();
                    let applied =
                        reconciler.apply_full_list(&peer, &m, connection.local_magic_id());
                    if applied {
                        reconciler.resolve_folder(&m.folder.id, connection.local_magic_id())
                    } else {
                        None
                    }
                };
                if let Some(folder) = folder {
                    self.auto_sync(&peer, &folder).await;
                }
            }
            Message::FolderFilesChanged(m) => {
                let folder = {
                    let mut reconciler = self.shared.reconciler.lock().unwrap();
                    let applied = reconciler.apply_delta(&peer, &m, connection.local_magic_id());
                    if applied {
                        reconciler.resolve_folder(&m.folder.id, connection.local_magic_id())
                    } else {
                        None
                    }
                };
                if let Some(folder) = folder {
                    self.auto_sync(&peer, &folder).await;
                }
            }
            Message::FileListRequest(m) => {
                // The peer names our folder by the id we presented to them.
                let messages = {
                    let reconciler = self.shared.reconciler.lock().unwrap();
                    match reconciler.resolve_folder(&m.folder, connection.remote_magic_id()) {
                        Some(folder) => Some(reconciler.full_list_messages(
                            &folder,
                            connection.remote_magic_id(),
                            self.shared.config.max_items_per_message,
                        )?),
                        None => None,
                    }
                };
                match messages {
                    Some(messages) => {
                        for message in messages {
                            connection.send(message).await?;
                        }
                    }
                    None => {
                        debug!(%peer, folder = %m.folder, "file list request for unknown folder")
                    }
                }
            }
            Message::RequestDownload(m) => {
                let outbound = self.shared.transfers.handle_request_download(&peer, &m)?;
                self.route(outbound).await;
            }
            Message::RequestPart(m) => {
                match self.shared.transfers.handle_request_part(&peer, &m).await {
                    Ok(outbound) => self.route(outbound).await,
                    // A bad range or progress rejects this request only.
                    Err(e) => warn!(%peer, error = %e, "part request rejected"),
                }
            }
            Message::StartUpload(m) => {
                let outbound = self.shared.transfers.handle_start_upload(&peer, &m).await?;
                self.route(outbound).await;
            }
            Message::FileChunk(m) => {
                let outbound = self.shared.transfers.handle_chunk(&peer, &m).await?;
                self.route(outbound).await;
            }
            Message::StopUpload(m) => {
                let outbound = self.shared.transfers.release_upload(&peer, &m.file);
                self.route(outbound).await;
            }
            Message::DownloadQueued(m) => {
                self.shared.transfers.handle_download_queued(&peer, &m);
            }
            Message::AbortDownload(m) => {
                let outbound = self.shared.transfers.release_upload(&peer, &m.file);
                self.route(outbound).await;
            }
            Message::AbortUpload(m) => {
                self.shared.transfers.handle_abort_upload(&peer, &m.file);
            }
            Message::RequestFilePartsRecord(m) => {
                match self.shared.transfers.build_parts_record(&m.file).await {
                    Ok(record) => {
                        connection
                            .send(Message::ReplyFilePartsRecord(ReplyFilePartsRecord {
                                file: m.file,
                                record,
                            }))
                            .await?;
                    }
                    Err(e) => warn!(%peer, path = %m.file.path, error = %e, "no parts record"),
                }
            }
            Message::ReplyFilePartsRecord(m) => {
                // Verify whatever we already hold, then resume past it.
                let mut assumed = RangeSet::new();
                assumed.insert(Range::new(0, m.file.size));
                let verified = self
                    .shared
                    .transfers
                    .verify_partial(&m.file, &m.record, &assumed)
                    .await?;
                let resume_at = verified
                    .first_missing(m.file.size, u64::MAX)
                    .map(|r| r.offset)
                    .unwrap_or(m.file.size);
                let outbound = self
                    .shared
                    .transfers
                    .request_download(&peer, m.file, resume_at)
                    .await?;
                self.route(outbound).await;
            }
            Message::KnownNodes(m) => {
                self.shared.registry.lock().unwrap().merge(m.nodes);
            }
            Message::RequestNodeList(m) => {
                let nodes = self.shared.registry.lock().unwrap().request_list(&m.criteria);
                for message in
                    known_nodes_messages(&nodes, self.shared.config.max_items_per_message)
                {
                    connection.send(message).await?;
                }
            }
            Message::SearchNodeRequest(m) => {
                let hits = self.shared.registry.lock().unwrap().search(&m.pattern, &peer);
                for message in known_nodes_messages(&hits, self.shared.config.max_items_per_message)
                {
                    connection.send(message).await?;
                }
            }
            Message::NodeInformation(m) => {
                debug!(%peer, version = %m.program_version, known = m.known_nodes, "peer node information");
            }
            Message::TransferStatus(m) => {
                self.emit(EngineEvent::PeerTransferStatus { peer, status: m });
            }
            Message::Relayed(m) => {
                if m.destination == self.shared.self_node.id {
                    let (reply, channel) = self.shared.relay.handle_message(m, connection.sender());
                    if let Some(reply) = reply {
                        connection.send(reply).await?;
                    }
                    if let Some(channel) = channel {
                        self.shared.relayed_incoming.lock().unwrap().push(channel);
                    }
                } else {
                    // We are the relay: forward opaquely or answer.
                    let destination = self
                        .shared
                        .connections
                        .lock()
                        .unwrap()
                        .get(&m.destination)
                        .cloned();
                    match forward(m, destination.is_some(), &self.shared.self_node.id) {
                        ForwardDecision::Deliver(m) => {
                            if let Some(destination) = destination {
                                destination.send(Message::Relayed(m)).await?;
                            }
                        }
                        ForwardDecision::Reply(reply) => connection.send(reply).await?,
                    }
                }
            }
            Message::Udt(m) => {
                if m.kind == RelayKind::Syn {
                    // No UDT stack: refuse so the peer tries the relay path.
                    connection
                        .send(Message::Udt(UdtMessage {
                            kind: RelayKind::Nack,
                            source: self.shared.self_node.id.clone(),
                            destination: m.source,
                            port: 0,
                        }))
                        .await?;
                }
            }
            Message::Invitation(m) => {
                self.emit(EngineEvent::InvitationReceived {
                    from: peer,
                    invitation: m,
                });
            }
            Message::TextMessage(m) => {
                self.emit(EngineEvent::TextMessageReceived {
                    from: peer,
                    text: m.text,
                });
            }
            Message::Notification(m) => {
                self.emit(EngineEvent::NotificationReceived {
                    from: peer,
                    event: m.event,
                    args: m.args,
                });
            }
            // Advisory problems were already logged by the connection.
            Message::Problem(_) => {}
            other => {
                warn!(%peer, kind = other.kind(), "unexpected message after handshake");
            }
        }
        Ok(())
    }

    /// Pull newer files and converge deletions from a peer's completed
    /// baseline, when the folder's profile allows it.
    async fn auto_sync(&self, peer: &NodeId, folder: &FolderId) {
        let profile = self
            .shared
            .profiles
            .lock()
            .unwrap()
            .get(folder)
            .copied()
            .unwrap_or_default();
        if profile == SyncProfile::ManualDownload {
            return;
        }

        let (wanted, deletions) = {
            let reconciler = self.shared.reconciler.lock().unwrap();
            (
                reconciler.wanted_from(peer, folder),
                reconciler.deletions_from(peer, folder),
            )
        };

        for deletion in deletions {
            if let Err(e) = self
                .shared
                .reconciler
                .lock()
                .unwrap()
                .apply_local_change(deletion)
            {
                warn!(error = %e, "deletion not applied");
            }
        }

        for file in wanted {
            match self.shared.transfers.request_download(peer, file, 0).await {
                Ok(outbound) => self.route(outbound).await,
                Err(e) => warn!(%peer, error = %e, "download request failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryRepository;
    use skiff_proto::FolderInfo;
    use skiff_sync::IgnoreRules;
    use std::time::Duration;

    fn test_config(id: &str, nick: &str) -> EngineConfig {
        EngineConfig::new(id, nick).bind_addr(Some("127.0.0.1:0".parse().unwrap()))
    }

    fn folder() -> FolderInfo {
        FolderInfo::new("folder-1", "Documents")
    }

    fn seeded_file(path: &str, content: &[u8]) -> FileInfo {
        let mut file = FileInfo::new(FolderId::new("folder-1"), path, content.len() as u64);
        file.version = 1;
        file
    }

    async fn wait_for(mut probe: impl FnMut() -> bool) {
        for _ in 0..200 {
            if probe() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn peers_exchange_listings_and_sync_a_file() {
        let repo_a = Arc::new(MemoryRepository::new());
        repo_a.add_folder(folder(), IgnoreRules::empty());
        let doc = seeded_file("doc.txt", b"hello skiff");
        repo_a.add_file(doc.clone(), b"hello skiff".to_vec());

        let repo_b = Arc::new(MemoryRepository::new());
        repo_b.add_folder(folder(), IgnoreRules::empty());

        let (engine_a, _events_a) = Engine::start(test_config("node-a", "alice"), repo_a)
            .await
            .unwrap();
        let (engine_b, _events_b) = Engine::start(test_config("node-b", "bob"), repo_b.clone())
            .await
            .unwrap();

        let addr = engine_a.local_addr().unwrap();
        let peer = engine_b.connect_peer(addr).await.unwrap();
        assert_eq!(peer.as_str(), "node-a");

        // B learns A's listing and auto-downloads the file.
        let repo = repo_b.clone();
        wait_for(move || repo.store().get(&doc) == Some(b"hello skiff".to_vec())).await;

        wait_for(|| engine_b.transfer_status().active_downloads == 0).await;
        assert!(engine_b.is_connected(&NodeId::new("node-a")));
        assert!(engine_a.is_connected(&NodeId::new("node-b")));

        engine_a.stop().await;
        engine_b.stop().await;
    }

    #[tokio::test]
    async fn changed_files_propagate_as_deltas() {
        let repo_a = Arc::new(MemoryRepository::new());
        repo_a.add_folder(folder(), IgnoreRules::empty());
        let repo_b = Arc::new(MemoryRepository::new());
        repo_b.add_folder(folder(), IgnoreRules::empty());

        let (engine_a, _events_a) = Engine::start(test_config("node-a", "alice"), repo_a.clone())
            .await
            .unwrap();
        let (engine_b, _events_b) = Engine::start(test_config("node-b", "bob"), repo_b.clone())
            .await
            .unwrap();

        engine_b.connect_peer(engine_a.local_addr().unwrap()).await.unwrap();
        let b_id = NodeId::new("node-b");
        {
            let engine_a = engine_a.clone();
            wait_for(move || engine_a.is_connected(&b_id)).await;
        }

        // A file appears on A after the connection was established.
        let doc = seeded_file("late.txt", b"late content");
        repo_a.add_file(doc.clone(), b"late content".to_vec());
        engine_a.index_local_change(doc.clone()).unwrap();
        engine_a.broadcast_changes().await.unwrap();

        let repo = repo_b.clone();
        wait_for(move || repo.store().get(&doc) == Some(b"late content".to_vec())).await;

        engine_a.stop().await;
        engine_b.stop().await;
    }

    #[tokio::test]
    async fn relay_routes_between_two_leaf_peers() {
        let make_repo = || {
            let repo = Arc::new(MemoryRepository::new());
            repo.add_folder(folder(), IgnoreRules::empty());
            repo
        };

        let (relay, _events_r) = Engine::start(test_config("relay", "relay-nick"), make_repo())
            .await
            .unwrap();
        let (engine_a, _events_a) = Engine::start(test_config("node-a", "alice"), make_repo())
            .await
            .unwrap();
        let (engine_b, _events_b) = Engine::start(test_config("node-b", "bob"), make_repo())
            .await
            .unwrap();

        let relay_addr = relay.local_addr().unwrap();
        engine_a.connect_peer(relay_addr).await.unwrap();
        engine_b.connect_peer(relay_addr).await.unwrap();

        let relay_id = NodeId::new("relay");
        let channel = engine_a
            .open_relayed(&relay_id, NodeId::new("node-b"))
            .await
            .unwrap()
            .expect("relay attempt should be acked");

        channel.send(b"tunneled bytes").await.unwrap();

        let mut received = None;
        for _ in 0..200 {
            let mut channels = engine_b.take_relayed_channels();
            if let Some(mut incoming) = channels.pop() {
                received = incoming.recv().await;
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert_eq!(received.unwrap(), b"tunneled bytes");

        relay.stop().await;
        engine_a.stop().await;
        engine_b.stop().await;
    }

    #[tokio::test]
    async fn relay_attempt_to_offline_peer_fails_normally() {
        let repo = Arc::new(MemoryRepository::new());
        let (relay, _events_r) = Engine::start(test_config("relay", "relay-nick"), repo.clone())
            .await
            .unwrap();
        let (engine_a, _events_a) = Engine::start(
            test_config("node-a", "alice").bind_addr(None),
            repo.clone(),
        )
        .await
        .unwrap();

        engine_a.connect_peer(relay.local_addr().unwrap()).await.unwrap();

        // node-c is not connected to the relay: NACK, resolved as None.
        let attempt = engine_a
            .open_relayed(&NodeId::new("relay"), NodeId::new("node-c"))
            .await
            .unwrap();
        assert!(attempt.is_none());

        relay.stop().await;
        engine_a.stop().await;
    }
}
