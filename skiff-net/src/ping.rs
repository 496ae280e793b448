//! Ping/pong liveness probes
//!
//! Each probe carries a fresh unique id and a random-size padding payload.
//! Round-trip time is measured between the mark-sent instant and the
//! matching Pong; measuring an un-sent ping or answering with an unknown id
//! is an error.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::Rng;

use skiff_proto::message::Ping;
use skiff_proto::validation::limits;

use crate::errors::{NetError, Result};

/// One outstanding probe.
#[derive(Debug)]
pub struct PingMeasurement {
    id: String,
    sent_at: Option<Instant>,
}

impl PingMeasurement {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            sent_at: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Record the send instant. Must happen before [`took`](Self::took).
    pub fn mark_sent(&mut self) {
        self.sent_at = Some(Instant::now());
    }

    /// Round-trip time against `now`. Refuses to measure a ping that was
    /// never marked sent.
    pub fn took(&self, now: Instant) -> Result<Duration> {
        match self.sent_at {
            Some(sent_at) => Ok(now.duration_since(sent_at)),
            None => Err(NetError::PingNotSent),
        }
    }
}

/// Outstanding probes for one connection.
#[derive(Debug, Default)]
pub struct PingTracker {
    outstanding: HashMap<String, PingMeasurement>,
    next_id: u64,
}

impl PingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a fresh probe and register it as outstanding. The caller sends
    /// the returned message, then calls [`mark_sent`](Self::mark_sent).
    pub fn prepare(&mut self) -> Ping {
        let mut rng = rand::thread_rng();
        self.next_id += 1;
        let id = format!("{:x}-{:x}", rng.gen::<u64>(), self.next_id);

        let mut payload = vec![0u8; rng.gen_range(16..=limits::MAX_PING_PAYLOAD)];
        rng.fill(payload.as_mut_slice());

        self.outstanding
            .insert(id.clone(), PingMeasurement::new(id.clone()));
        Ping { id, payload }
    }

    pub fn mark_sent(&mut self, id: &str) {
        if let Some(measurement) = self.outstanding.get_mut(id) {
            measurement.mark_sent();
        }
    }

    /// Match a Pong against the outstanding set, yielding the round trip.
    /// An id that matches no outstanding ping is a protocol error.
    pub fn pong_received(&mut self, id: &str) -> Result<Duration> {
        let measurement = self.outstanding.remove(id).ok_or_else(|| {
            NetError::Protocol(format!("pong id {id} matches no outstanding ping"))
        })?;
        measurement.took(Instant::now())
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_is_measured_after_send() {
        let mut tracker = PingTracker::new();
        let ping = tracker.prepare();
        tracker.mark_sent(&ping.id);

        let rtt = tracker.pong_received(&ping.id).unwrap();
        assert!(rtt < Duration::from_secs(1));
        assert_eq!(tracker.outstanding_count(), 0);
    }

    #[test]
    fn unknown_pong_id_is_a_protocol_error() {
        let mut tracker = PingTracker::new();
        let ping = tracker.prepare();
        tracker.mark_sent(&ping.id);

        assert!(matches!(
            tracker.pong_received("no-such-id"),
            Err(NetError::Protocol(_))
        ));
        // The real probe is still outstanding.
        assert_eq!(tracker.outstanding_count(), 1);
    }

    #[test]
    fn measuring_unsent_ping_fails() {
        let measurement = PingMeasurement::new("p");
        assert!(matches!(
            measurement.took(Instant::now()),
            Err(NetError::PingNotSent)
        ));
    }

    #[test]
    fn ids_are_unique_and_payload_sized_randomly() {
        let mut tracker = PingTracker::new();
        let a = tracker.prepare();
        let b = tracker.prepare();

        assert_ne!(a.id, b.id);
        assert!(a.payload.len() >= 16 && a.payload.len() <= limits::MAX_PING_PAYLOAD);
    }
}
