//! Structured-object wire form
//!
//! JSON with an internal `type` tag. Self-describing: the message kind is
//! discoverable from the payload itself, and unknown trailing fields from
//! newer peers are ignored by serde.

use crate::errors::Result;
use crate::message::Message;

pub fn encode(message: &Message) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(message)?)
}

pub fn decode(bytes: &[u8]) -> Result<Message> {
    Ok(serde_json::from_slice(bytes)?)
}
