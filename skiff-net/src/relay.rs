//! Relayed connections through a third peer
//!
//! When two peers cannot reach each other directly, byte payloads travel
//! through a relay node that forwards them opaquely, keyed by a
//! caller-chosen connection id. Lifecycle per id:
//!
//! ```text
//! Init --SYN--> AwaitAck --ACK--> Open --EOF--> Closed
//!                      \--NACK/timeout--> Closed
//! ```
//!
//! A missing ACK is a normal failure (the caller falls back to other
//! connectivity), never fatal to the peer relationship.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use skiff_proto::message::{RelayKind, RelayedMessage};
use skiff_proto::{Message, NodeId};

use crate::errors::{NetError, Result};

const CHANNEL_DEPTH: usize = 32;

/// Lifecycle of one relayed connection id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Init,
    AwaitAck,
    Open,
    Closed,
}

/// One open relayed byte channel. Payloads are deflated on send and
/// inflated on receive; the relay never sees plaintext structure.
pub struct RelayedChannel {
    pub id: u64,
    pub remote: NodeId,
    local: NodeId,
    relay: mpsc::Sender<Message>,
    inbound: mpsc::Receiver<Vec<u8>>,
}

impl RelayedChannel {
    pub async fn send(&self, bytes: &[u8]) -> Result<()> {
        let message = Message::Relayed(RelayedMessage {
            kind: RelayKind::DataZipped,
            connection_id: self.id,
            source: self.local.clone(),
            destination: self.remote.clone(),
            payload: deflate(bytes)?,
        });
        self.relay.send(message).await.map_err(|_| NetError::Closed)
    }

    /// Next inflated payload; None once the channel saw EOF.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.inbound.recv().await
    }

    /// Announce EOF to the remote side.
    pub async fn close(self) -> Result<()> {
        let message = Message::Relayed(RelayedMessage {
            kind: RelayKind::Eof,
            connection_id: self.id,
            source: self.local.clone(),
            destination: self.remote.clone(),
            payload: Vec::new(),
        });
        self.relay.send(message).await.map_err(|_| NetError::Closed)
    }
}

struct OpenChannel {
    remote: NodeId,
    inbound: mpsc::Sender<Vec<u8>>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    pending: HashMap<u64, oneshot::Sender<bool>>,
    open: HashMap<u64, OpenChannel>,
}

/// Tracks relayed connections we initiated or accepted. One manager per
/// engine; `relay` senders address the peer acting as relay.
#[derive(Clone)]
pub struct RelayManager {
    self_id: NodeId,
    inner: Arc<Mutex<Inner>>,
}

impl RelayManager {
    pub fn new(self_id: NodeId) -> Self {
        Self {
            self_id,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Open a relayed connection to `destination` through the relay behind
    /// `relay`. Resolves to None when the attempt fails normally (NACK or
    /// no ACK inside `ack_timeout`).
    pub async fn connect_via(
        &self,
        relay: mpsc::Sender<Message>,
        destination: NodeId,
        ack_timeout: Duration,
    ) -> Result<Option<RelayedChannel>> {
        let (ack_tx, ack_rx) = oneshot::channel();
        let id = {
            let mut inner = self.inner.lock().unwrap();
            inner.next_id += 1;
            let id = inner.next_id;
            inner.pending.insert(id, ack_tx);
            id
        };

        let syn = Message::Relayed(RelayedMessage {
            kind: RelayKind::Syn,
            connection_id: id,
            source: self.self_id.clone(),
            destination: destination.clone(),
            payload: Vec::new(),
        });
        trace!(connection_id = id, %destination, "relay SYN");
        relay.send(syn).await.map_err(|_| NetError::Closed)?;

        let accepted = match timeout(ack_timeout, ack_rx).await {
            Ok(Ok(accepted)) => accepted,
            // Sender dropped or window elapsed: close the attempt quietly.
            Ok(Err(_)) | Err(_) => {
                self.inner.lock().unwrap().pending.remove(&id);
                debug!(connection_id = id, "relay attempt closed without ACK");
                return Ok(None);
            }
        };
        if !accepted {
            debug!(connection_id = id, "relay attempt NACKed");
            return Ok(None);
        }

        Ok(Some(self.register_open(id, destination, relay)))
    }

    /// Process a relayed message addressed to us. Returns a reply to send
    /// back through the relay, if any, plus a channel when a SYN opened one.
    pub fn handle_message(
        &self,
        message: RelayedMessage,
        relay: mpsc::Sender<Message>,
    ) -> (Option<Message>, Option<RelayedChannel>) {
        match message.kind {
            RelayKind::Syn => {
                trace!(connection_id = message.connection_id, source = %message.source, "relay SYN received");
                let channel =
                    self.register_open(message.connection_id, message.source.clone(), relay);
                let ack = Message::Relayed(RelayedMessage {
                    kind: RelayKind::Ack,
                    connection_id: message.connection_id,
                    source: self.self_id.clone(),
                    destination: message.source,
                    payload: Vec::new(),
                });
                (Some(ack), Some(channel))
            }
            RelayKind::Ack | RelayKind::Nack => {
                let accepted = message.kind == RelayKind::Ack;
                let pending = self
                    .inner
                    .lock()
                    .unwrap()
                    .pending
                    .remove(&message.connection_id);
                match pending {
                    Some(waiter) => {
                        let _ = waiter.send(accepted);
                    }
                    None => {
                        warn!(connection_id = message.connection_id, "ACK/NACK for unknown attempt")
                    }
                }
                (None, None)
            }
            RelayKind::DataZipped => {
                let inbound = {
                    let inner = self.inner.lock().unwrap();
                    inner
                        .open
                        .get(&message.connection_id)
                        .map(|c| c.inbound.clone())
                };
                match inbound {
                    Some(inbound) => match inflate(&message.payload) {
                        Ok(bytes) => {
                            if inbound.try_send(bytes).is_err() {
                                warn!(
                                    connection_id = message.connection_id,
                                    "relayed channel congested or gone, dropping payload"
                                );
                            }
                            (None, None)
                        }
                        Err(e) => {
                            warn!(connection_id = message.connection_id, error = %e, "bad relay payload");
                            (self.eof_for(&message), None)
                        }
                    },
                    // Data for a connection we do not hold: answer EOF.
                    None => (self.eof_for(&message), None),
                }
            }
            RelayKind::Eof => {
                self.close(message.connection_id);
                (None, None)
            }
        }
    }

    /// Drop the channel for this id; the receiver sees end-of-stream.
    pub fn close(&self, connection_id: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.pending.remove(&connection_id);
        if inner.open.remove(&connection_id).is_some() {
            debug!(connection_id, "relayed connection closed");
        }
    }

    pub fn state(&self, connection_id: u64) -> RelayState {
        let inner = self.inner.lock().unwrap();
        if inner.open.contains_key(&connection_id) {
            RelayState::Open
        } else if inner.pending.contains_key(&connection_id) {
            RelayState::AwaitAck
        } else {
            RelayState::Closed
        }
    }

    fn register_open(
        &self,
        id: u64,
        remote: NodeId,
        relay: mpsc::Sender<Message>,
    ) -> RelayedChannel {
        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_DEPTH);
        self.inner.lock().unwrap().open.insert(
            id,
            OpenChannel {
                remote: remote.clone(),
                inbound: inbound_tx,
            },
        );
        RelayedChannel {
            id,
            remote,
            local: self.self_id.clone(),
            relay,
            inbound: inbound_rx,
        }
    }

    fn eof_for(&self, message: &RelayedMessage) -> Option<Message> {
        Some(Message::Relayed(RelayedMessage {
            kind: RelayKind::Eof,
            connection_id: message.connection_id,
            source: self.self_id.clone(),
            destination: message.source.clone(),
            payload: Vec::new(),
        }))
    }
}

/// Decision taken by a node acting as the relay itself.
#[derive(Debug)]
pub enum ForwardDecision {
    /// Pass the message on to the destination untouched.
    Deliver(RelayedMessage),
    /// Destination unreachable: answer the source instead.
    Reply(Message),
}

/// Forwarding rule for the relay role: payloads are passed through opaquely;
/// a SYN for an unreachable destination is NACKed, anything else gets EOF.
pub fn forward(message: RelayedMessage, destination_online: bool, self_id: &NodeId) -> ForwardDecision {
    if destination_online {
        return ForwardDecision::Deliver(message);
    }
    let kind = if message.kind == RelayKind::Syn {
        RelayKind::Nack
    } else {
        RelayKind::Eof
    };
    ForwardDecision::Reply(Message::Relayed(RelayedMessage {
        kind,
        connection_id: message.connection_id,
        source: self_id.clone(),
        destination: message.source,
        payload: Vec::new(),
    }))
}

fn deflate(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

fn inflate(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}
