//! Connection configuration

use std::time::Duration;

use skiff_proto::validation::limits;
use skiff_proto::WireFormat;

/// Tunables for one deployment's connections. The wire format is fixed here,
/// not sniffed per connection.
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// Codec spoken on every connection.
    pub wire_format: WireFormat,

    /// Hard ceiling for a single framed message.
    pub max_frame_size: usize,

    /// Bounded wait for the whole Identity exchange.
    pub handshake_timeout: Duration,

    /// Bounded wait for a Pong.
    pub ping_timeout: Duration,

    /// Bounded wait for an ACK after a relay SYN.
    pub relay_ack_timeout: Duration,

    /// Declare the HandshakeCompleted barrier in our Identity.
    pub acknowledges_handshake_completion: bool,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            wire_format: WireFormat::Compact,
            max_frame_size: limits::MAX_MESSAGE_SIZE,
            handshake_timeout: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(10),
            relay_ack_timeout: Duration::from_secs(20),
            acknowledges_handshake_completion: true,
        }
    }
}

impl NetConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wire_format(mut self, format: WireFormat) -> Self {
        self.wire_format = format;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn relay_ack_timeout(mut self, timeout: Duration) -> Self {
        self.relay_ack_timeout = timeout;
        self
    }
}
