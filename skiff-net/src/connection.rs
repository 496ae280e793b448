//! One established connection to one peer
//!
//! Owns the stream after handshake: a writer task drains the outbound
//! queue, a reader task decodes frames in order and hands them up through a
//! channel, so handling for a single peer is strictly sequential. Liveness
//! probes and fatal problems are handled here; everything else is the
//! dispatcher's business.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use skiff_proto::message::{Identity, Pong, Problem};
use skiff_proto::{validate_message, Capabilities, Message, NodeInfo};

use crate::config::NetConfig;
use crate::errors::{NetError, Result};
use crate::framing;
use crate::handshake::{self, ConnectionState};
use crate::ping::PingTracker;

const OUTBOUND_QUEUE: usize = 64;
const INBOUND_QUEUE: usize = 64;

/// Handle to an established peer connection.
#[derive(Clone)]
pub struct Connection {
    peer: NodeInfo,
    capabilities: Capabilities,
    local_magic_id: String,
    remote_magic_id: String,
    outbound: mpsc::Sender<Message>,
    state: Arc<Mutex<ConnectionState>>,
    pings: Arc<Mutex<PingTracker>>,
    last_rtt: Arc<Mutex<Option<Duration>>>,
}

impl Connection {
    /// Run the handshake on a fresh stream and, on success, start the
    /// reader/writer tasks. Returns the handle plus the ordered inbound
    /// message stream for this peer.
    pub async fn establish<S>(
        mut stream: S,
        local: Identity,
        config: NetConfig,
    ) -> Result<(Connection, mpsc::Receiver<Message>)>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut hs_state = ConnectionState::Connecting;
        let outcome = handshake::perform(&mut stream, &local, &config, &mut hs_state).await?;

        let state = Arc::new(Mutex::new(ConnectionState::Established));
        let pings = Arc::new(Mutex::new(PingTracker::new()));
        let last_rtt = Arc::new(Mutex::new(None));

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
        let (inbound_tx, inbound_rx) = mpsc::channel::<Message>(INBOUND_QUEUE);

        let (mut read_half, mut write_half) = tokio::io::split(stream);

        let connection = Connection {
            peer: outcome.remote.node.clone(),
            capabilities: outcome.capabilities,
            local_magic_id: local.magic_id.clone(),
            remote_magic_id: outcome.remote.magic_id.clone(),
            outbound: outbound_tx.clone(),
            state: state.clone(),
            pings: pings.clone(),
            last_rtt: last_rtt.clone(),
        };

        // Writer: drains the outbound queue until it closes or the wire
        // fails.
        {
            let state = state.clone();
            let config = config.clone();
            let peer = connection.peer.id.clone();
            tokio::spawn(async move {
                while let Some(message) = outbound_rx.recv().await {
                    trace!(%peer, kind = message.kind(), "sending");
                    if let Err(e) = framing::write_message(
                        &mut write_half,
                        &message,
                        config.wire_format,
                        config.max_frame_size,
                    )
                    .await
                    {
                        debug!(%peer, error = %e, "write failed, closing connection");
                        *state.lock().unwrap() = ConnectionState::Closed;
                        break;
                    }
                }
            });
        }

        // Reader: frames are processed strictly in arrival order.
        {
            let state = state.clone();
            let pings = pings.clone();
            let last_rtt = last_rtt.clone();
            let config = config.clone();
            let peer = connection.peer.id.clone();
            tokio::spawn(async move {
                loop {
                    let message = match framing::read_message(
                        &mut read_half,
                        config.wire_format,
                        config.max_frame_size,
                    )
                    .await
                    {
                        Ok(message) => message,
                        Err(NetError::Io(e)) => {
                            debug!(%peer, error = %e, "connection lost");
                            break;
                        }
                        Err(e) => {
                            // Undecodable traffic: protocol error, close.
                            error!(%peer, error = %e, "protocol error on wire");
                            break;
                        }
                    };

                    trace!(%peer, kind = message.kind(), "received");
                    if let Err(e) = validate_message(&message) {
                        // Reject the single offending message only.
                        warn!(%peer, error = %e, "dropping invalid message");
                        continue;
                    }

                    match message {
                        Message::Ping(ping) => {
                            let pong = Message::Pong(Pong { id: ping.id });
                            if outbound_tx.send(pong).await.is_err() {
                                break;
                            }
                        }
                        Message::Pong(pong) => match pings.lock().unwrap().pong_received(&pong.id)
                        {
                            Ok(rtt) => {
                                trace!(%peer, ?rtt, "pong matched");
                                *last_rtt.lock().unwrap() = Some(rtt);
                            }
                            Err(e) => {
                                error!(%peer, error = %e, "unmatched pong");
                                break;
                            }
                        },
                        Message::Problem(Problem { message, fatal }) if fatal => {
                            error!(%peer, %message, "fatal problem from peer");
                            let _ = inbound_tx
                                .send(Message::Problem(Problem { message, fatal }))
                                .await;
                            break;
                        }
                        Message::Problem(problem) => {
                            warn!(%peer, message = %problem.message, "advisory problem");
                            if inbound_tx.send(Message::Problem(problem)).await.is_err() {
                                break;
                            }
                        }
                        other => {
                            if inbound_tx.send(other).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                *state.lock().unwrap() = ConnectionState::Closed;
            });
        }

        info!(peer = %connection.peer.id, nick = %connection.peer.nick, "connection established");
        Ok((connection, inbound_rx))
    }

    /// Queue a message for this peer. Fails once the connection closed.
    pub async fn send(&self, message: Message) -> Result<()> {
        if self.state() == ConnectionState::Closed {
            return Err(NetError::Closed);
        }
        self.outbound
            .send(message)
            .await
            .map_err(|_| NetError::Closed)
    }

    /// Clone of the raw outbound queue, for layers that multiplex onto this
    /// connection (relaying).
    pub fn sender(&self) -> mpsc::Sender<Message> {
        self.outbound.clone()
    }

    /// Fire a liveness probe. The round trip shows up in
    /// [`last_rtt`](Self::last_rtt) when the matching Pong arrives.
    pub async fn ping(&self) -> Result<()> {
        let ping = self.pings.lock().unwrap().prepare();
        let id = ping.id.clone();
        self.send(Message::Ping(ping)).await?;
        self.pings.lock().unwrap().mark_sent(&id);
        Ok(())
    }

    pub fn last_rtt(&self) -> Option<Duration> {
        *self.last_rtt.lock().unwrap()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Mark closed. Tasks wind down as their channels drain; safe to call
    /// repeatedly.
    pub fn close(&self) {
        *self.state.lock().unwrap() = ConnectionState::Closed;
    }

    pub fn peer(&self) -> &NodeInfo {
        &self.peer
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Magic id we declared; peers obfuscate folder ids against it.
    pub fn local_magic_id(&self) -> &str {
        &self.local_magic_id
    }

    /// Magic id the peer declared; we obfuscate folder ids against it.
    pub fn remote_magic_id(&self) -> &str {
        &self.remote_magic_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_proto::message::TextMessage;
    use skiff_proto::PROTOCOL_VERSION;

    fn identity(id: &str, nick: &str) -> Identity {
        Identity {
            node: NodeInfo::new(id, nick),
            magic_id: format!("magic-{id}"),
            capabilities: Capabilities::default(),
            protocol_version: PROTOCOL_VERSION,
            program_version: "0.1.0".to_string(),
            acknowledges_handshake_completion: true,
        }
    }

    async fn pair() -> (
        (Connection, mpsc::Receiver<Message>),
        (Connection, mpsc::Receiver<Message>),
    ) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let config = NetConfig::default();
        let (alice, bob) = tokio::join!(
            Connection::establish(a, identity("node-a", "alice"), config.clone()),
            Connection::establish(b, identity("node-b", "bob"), config),
        );
        (alice.unwrap(), bob.unwrap())
    }

    #[tokio::test]
    async fn messages_arrive_in_send_order() {
        let ((alice, _alice_rx), (_bob, mut bob_rx)) = pair().await;

        for i in 0..10 {
            alice
                .send(Message::TextMessage(TextMessage {
                    text: format!("m{i}"),
                }))
                .await
                .unwrap();
        }

        for i in 0..10 {
            match bob_rx.recv().await.unwrap() {
                Message::TextMessage(m) => assert_eq!(m.text, format!("m{i}")),
                other => panic!("unexpected {}", other.kind()),
            }
        }
    }

    #[tokio::test]
    async fn ping_is_answered_and_measured() {
        let ((alice, _alice_rx), (_bob, _bob_rx)) = pair().await;

        alice.ping().await.unwrap();

        // The pong is handled inside the reader task; poll for the result.
        for _ in 0..50 {
            if alice.last_rtt().is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no round trip recorded");
    }

    #[tokio::test]
    async fn fatal_problem_closes_connection() {
        let ((alice, _alice_rx), (bob, mut bob_rx)) = pair().await;

        alice
            .send(Message::Problem(Problem {
                message: "shutting down".to_string(),
                fatal: true,
            }))
            .await
            .unwrap();

        // Bob still sees the problem before the close.
        match bob_rx.recv().await {
            Some(Message::Problem(p)) => assert!(p.fatal),
            other => panic!("expected problem, got {other:?}"),
        }
        assert!(bob_rx.recv().await.is_none());
        for _ in 0..50 {
            if bob.is_closed() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("connection did not close");
    }

    #[tokio::test]
    async fn peer_metadata_is_exposed() {
        let ((alice, _alice_rx), (bob, _bob_rx)) = pair().await;

        assert_eq!(alice.peer().id.as_str(), "node-b");
        assert_eq!(bob.peer().id.as_str(), "node-a");
        assert_eq!(alice.remote_magic_id(), "magic-node-b");
        assert_eq!(bob.local_magic_id(), "magic-node-b");
        assert_eq!(alice.state(), ConnectionState::Established);
    }
}
