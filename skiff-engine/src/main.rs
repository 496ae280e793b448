//! skiffd: a minimal daemon around the engine
//!
//! Shares one folder from an in-memory snapshot of a directory and syncs
//! it with every peer it can reach. Meant for trying the protocol out,
//! not for production storage.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use skiff_engine::{Engine, EngineConfig, EngineEvent, MemoryRepository};
use skiff_net::fresh_magic_id;
use skiff_proto::{FileInfo, FolderId, FolderInfo};
use skiff_sync::IgnoreRules;

#[derive(Parser, Debug)]
#[command(name = "skiffd", about = "Peer-to-peer folder synchronization daemon")]
struct Args {
    /// Listen address for incoming peers.
    #[arg(long, default_value = "0.0.0.0:9941")]
    bind: SocketAddr,

    /// Peers to dial on startup.
    #[arg(long)]
    connect: Vec<SocketAddr>,

    /// Nickname announced to peers.
    #[arg(long, default_value = "skiff-node")]
    nick: String,

    /// Stable node id; generated when omitted.
    #[arg(long)]
    node_id: Option<String>,

    /// Directory to share (loaded into memory at startup).
    #[arg(long)]
    share: Option<PathBuf>,

    /// Folder id/name announced for the shared directory.
    #[arg(long, default_value = "shared")]
    folder: String,

    /// Ignore patterns for the shared folder, e.g. "*.tmp".
    #[arg(long)]
    ignore: Vec<String>,

    /// Take part in node-list distribution as a supernode.
    #[arg(long)]
    supernode: bool,
}

fn load_directory(
    repository: &MemoryRepository,
    folder: &FolderId,
    root: &Path,
    dir: &Path,
) -> anyhow::Result<u64> {
    let mut loaded = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            loaded += load_directory(repository, folder, root, &path)?;
            continue;
        }

        let relative = path
            .strip_prefix(root)
            .context("entry outside share root")?
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let data = std::fs::read(&path)?;
        let metadata = entry.metadata()?;

        let mut file = FileInfo::new(folder.clone(), relative, data.len() as u64);
        file.version = 1;
        if let Ok(modified) = metadata.modified() {
            file.modified = modified.into();
        }
        repository.add_file(file, data);
        loaded += 1;
    }
    Ok(loaded)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let node_id = args.node_id.clone().unwrap_or_else(fresh_magic_id);

    let repository = Arc::new(MemoryRepository::new());
    let folder = FolderInfo::new(args.folder.clone(), args.folder.clone());
    let folder_id = folder.id.clone();
    repository.add_folder(folder, IgnoreRules::new(args.ignore.clone()));

    if let Some(share) = &args.share {
        let loaded = load_directory(&repository, &folder_id, share, share)
            .with_context(|| format!("loading {}", share.display()))?;
        info!(files = loaded, dir = %share.display(), "share loaded");
    }

    let config = EngineConfig::new(node_id, args.nick.clone())
        .bind_addr(Some(args.bind))
        .supernode(args.supernode);
    let (engine, mut events) = Engine::start(config, repository).await?;

    for addr in &args.connect {
        match engine.connect_peer(*addr).await {
            Ok(peer) => info!(%peer, %addr, "connected"),
            Err(e) => warn!(%addr, error = %e, "connect failed"),
        }
    }

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                EngineEvent::PeerConnected(node) => {
                    info!(peer = %node.id, nick = %node.nick, "peer online")
                }
                EngineEvent::PeerDisconnected(id) => info!(peer = %id, "peer offline"),
                EngineEvent::TransferCompleted { peer, file } => {
                    info!(%peer, path = %file.path, "received file")
                }
                EngineEvent::TransferFailed { peer, file, reason } => {
                    warn!(%peer, path = %file.path, %reason, "transfer failed")
                }
                EngineEvent::TextMessageReceived { from, text } => {
                    info!(%from, %text, "message")
                }
                other => info!(?other, "event"),
            }
        }
    });

    signal::ctrl_c().await?;
    info!("shutting down");
    engine.stop().await;
    Ok(())
}
