//! Identity exchange state machine
//!
//! Both sides open by sending an Identity; each validates the peer's and
//! answers with an IdentityReply. When both identities declared the
//! completion barrier, data traffic additionally waits for a
//! HandshakeCompleted from the peer, so neither side starts sending file
//! lists before the other finished validating.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tracing::{debug, trace};

use skiff_proto::message::{Identity, IdentityReply};
use skiff_proto::{validate_message, Capabilities, Message};

use crate::config::NetConfig;
use crate::errors::{NetError, Result};
use crate::framing;

/// Fresh per-connection session nonce. Doubles as the key peers use to
/// obfuscate folder ids they send us.
pub fn fresh_magic_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    format!("{:016x}{:016x}", rng.gen::<u64>(), rng.gen::<u64>())
}

/// Lifecycle of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    IdentityExchanged,
    Accepted,
    Rejected,
    Established,
    Closed,
}

/// Result of a completed exchange.
#[derive(Debug)]
pub struct HandshakeOutcome {
    pub remote: Identity,
    /// Intersection of both capability declarations.
    pub capabilities: Capabilities,
}

/// Run the Identity exchange on a fresh stream, within the configured
/// window. `state` tracks the machine for observers; on any failure it ends
/// at Rejected or Closed.
pub async fn perform<S>(
    stream: &mut S,
    local: &Identity,
    config: &NetConfig,
    state: &mut ConnectionState,
) -> Result<HandshakeOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    *state = ConnectionState::Connecting;
    let result = timeout(config.handshake_timeout, exchange(stream, local, config, state))
        .await
        .map_err(|_| NetError::Timeout("handshake"))
        .and_then(|inner| inner);

    match &result {
        Ok(_) => *state = ConnectionState::Established,
        Err(NetError::HandshakeRejected(_)) => *state = ConnectionState::Rejected,
        Err(_) => *state = ConnectionState::Closed,
    }
    result
}

async fn exchange<S>(
    stream: &mut S,
    local: &Identity,
    config: &NetConfig,
    state: &mut ConnectionState,
) -> Result<HandshakeOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let format = config.wire_format;
    let max = config.max_frame_size;

    framing::write_message(stream, &Message::Identity(local.clone()), format, max).await?;

    let remote = match framing::read_message(stream, format, max).await? {
        Message::Identity(identity) => identity,
        other => {
            return Err(NetError::Protocol(format!(
                "expected Identity, got {}",
                other.kind()
            )))
        }
    };
    *state = ConnectionState::IdentityExchanged;
    trace!(peer = %remote.node.id, "identity received");

    if let Err(reason) = validate_remote(&remote, local) {
        framing::write_message(
            stream,
            &Message::IdentityReply(IdentityReply::reject(reason.clone())),
            format,
            max,
        )
        .await?;
        return Err(NetError::HandshakeRejected(reason));
    }

    framing::write_message(
        stream,
        &Message::IdentityReply(IdentityReply::accept()),
        format,
        max,
    )
    .await?;

    let reply = match framing::read_message(stream, format, max).await? {
        Message::IdentityReply(reply) => reply,
        other => {
            return Err(NetError::Protocol(format!(
                "expected IdentityReply, got {}",
                other.kind()
            )))
        }
    };
    if !reply.accepted {
        let reason = reply
            .reason
            .unwrap_or_else(|| "peer gave no reason".to_string());
        return Err(NetError::HandshakeRejected(reason));
    }
    *state = ConnectionState::Accepted;

    // Completion barrier, only when both sides asked for it.
    if local.acknowledges_handshake_completion && remote.acknowledges_handshake_completion {
        framing::write_message(stream, &Message::HandshakeCompleted, format, max).await?;
        match framing::read_message(stream, format, max).await? {
            Message::HandshakeCompleted => {}
            other => {
                return Err(NetError::Protocol(format!(
                    "expected HandshakeCompleted, got {}",
                    other.kind()
                )))
            }
        }
    }

    debug!(peer = %remote.node.id, nick = %remote.node.nick, "handshake complete");
    Ok(HandshakeOutcome {
        capabilities: local.capabilities.intersect(&remote.capabilities),
        remote,
    })
}

fn validate_remote(remote: &Identity, local: &Identity) -> std::result::Result<(), String> {
    if let Err(error) = validate_message(&Message::Identity(remote.clone())) {
        return Err(error.to_string());
    }
    if remote.protocol_version != local.protocol_version {
        return Err(format!(
            "protocol version mismatch: ours {}, theirs {}",
            local.protocol_version, remote.protocol_version
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_proto::NodeInfo;
    use std::time::Duration;

    fn identity(id: &str, nick: &str) -> Identity {
        Identity {
            node: NodeInfo::new(id, nick),
            magic_id: format!("magic-{id}"),
            capabilities: Capabilities {
                encryption: false,
                partial_transfers: true,
                tunneled: false,
            },
            protocol_version: skiff_proto::PROTOCOL_VERSION,
            program_version: "0.1.0".to_string(),
            acknowledges_handshake_completion: true,
        }
    }

    #[tokio::test]
    async fn mutual_handshake_establishes() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        let config = NetConfig::default();

        let alice = identity("node-a", "alice");
        let bob = identity("node-b", "bob");

        let (config_a, config_b) = (config.clone(), config);
        let (alice_side, bob_side) = tokio::join!(
            async {
                let mut state = ConnectionState::Connecting;
                let outcome = perform(&mut a, &alice, &config_a, &mut state).await;
                (outcome, state)
            },
            async {
                let mut state = ConnectionState::Connecting;
                let outcome = perform(&mut b, &bob, &config_b, &mut state).await;
                (outcome, state)
            },
        );

        let (outcome_a, state_a) = alice_side;
        let (outcome_b, state_b) = bob_side;
        let outcome_a = outcome_a.unwrap();
        let outcome_b = outcome_b.unwrap();

        assert_eq!(state_a, ConnectionState::Established);
        assert_eq!(state_b, ConnectionState::Established);
        assert_eq!(outcome_a.remote.node.id.as_str(), "node-b");
        assert_eq!(outcome_b.remote.node.id.as_str(), "node-a");
        assert!(outcome_a.capabilities.partial_transfers);
        assert!(!outcome_a.capabilities.encryption);
    }

    #[tokio::test]
    async fn empty_nick_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        let config = NetConfig::default();

        let alice = identity("node-a", "alice");
        let anonymous = identity("node-b", "");

        let (config_a, config_b) = (config.clone(), config);
        let (alice_result, anon_result) = tokio::join!(
            async {
                let mut state = ConnectionState::Connecting;
                let result = perform(&mut a, &alice, &config_a, &mut state).await;
                (result, state)
            },
            async {
                let mut state = ConnectionState::Connecting;
                let result = perform(&mut b, &anonymous, &config_b, &mut state).await;
                (result, state)
            },
        );

        // Alice rejects the anonymous identity; the anonymous side sees the
        // rejection in its reply.
        let (result_a, state_a) = alice_result;
        assert!(matches!(result_a, Err(NetError::HandshakeRejected(_))));
        assert_eq!(state_a, ConnectionState::Rejected);

        let (result_b, state_b) = anon_result;
        assert!(matches!(result_b, Err(NetError::HandshakeRejected(_))));
        assert_eq!(state_b, ConnectionState::Rejected);
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let (mut a, _b) = tokio::io::duplex(64 * 1024);
        let config = NetConfig::default().handshake_timeout(Duration::from_millis(50));

        let mut state = ConnectionState::Connecting;
        let result = perform(&mut a, &identity("node-a", "alice"), &config, &mut state).await;

        assert!(matches!(result, Err(NetError::Timeout("handshake"))));
        assert_eq!(state, ConnectionState::Closed);
    }

    #[tokio::test]
    async fn version_mismatch_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        let config = NetConfig::default();

        let alice = identity("node-a", "alice");
        let mut stale = identity("node-b", "bob");
        stale.protocol_version = skiff_proto::PROTOCOL_VERSION + 1;

        let (config_a, config_b) = (config.clone(), config);
        let (result_a, result_b) = tokio::join!(
            async {
                let mut state = ConnectionState::Connecting;
                perform(&mut a, &alice, &config_a, &mut state).await
            },
            async {
                let mut state = ConnectionState::Connecting;
                perform(&mut b, &stale, &config_b, &mut state).await
            },
        );

        assert!(result_a.is_err());
        assert!(matches!(result_b, Err(NetError::HandshakeRejected(_))));
    }
}
