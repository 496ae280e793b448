//! Message byte codecs
//!
//! Two coexisting wire representations of the same [`Message`] set:
//!
//! - [`structured`]: self-describing JSON, tolerant of field additions
//! - [`compact`]: length-prefixed binary fields with explicit per-kind
//!   version integers, rejected on mismatch
//!
//! Which one a deployment speaks is fixed by configuration, not sniffed.

pub mod compact;
pub mod structured;

use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::message::Message;

/// Wire representation selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    /// Self-describing structured form.
    Structured,
    /// Compact versioned binary form.
    #[default]
    Compact,
}

/// Encode a message in the given wire format.
pub fn encode(message: &Message, format: WireFormat) -> Result<Vec<u8>> {
    match format {
        WireFormat::Structured => structured::encode(message),
        WireFormat::Compact => compact::encode(message),
    }
}

/// Decode a message from the given wire format.
pub fn decode(bytes: &[u8], format: WireFormat) -> Result<Message> {
    match format {
        WireFormat::Structured => structured::decode(bytes),
        WireFormat::Compact => compact::decode(bytes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Ping, Problem};

    #[test]
    fn both_formats_roundtrip() {
        let message = Message::Problem(Problem {
            message: "disk full".to_string(),
            fatal: false,
        });

        for format in [WireFormat::Structured, WireFormat::Compact] {
            let bytes = encode(&message, format).unwrap();
            assert_eq!(decode(&bytes, format).unwrap(), message);
        }
    }

    #[test]
    fn formats_are_distinct() {
        let message = Message::Ping(Ping {
            id: "ping-1".to_string(),
            payload: vec![1, 2, 3],
        });

        let structured = encode(&message, WireFormat::Structured).unwrap();
        let compact = encode(&message, WireFormat::Compact).unwrap();
        assert_ne!(structured, compact);
    }
}
