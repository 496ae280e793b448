//! Token-bucket bandwidth limiting
//!
//! Credits replenish at the configured rate and accumulate up to one burst
//! allowance. A send debits its byte count once credits cover it; until
//! then the caller sleeps for the deficit. Buckets are shared across all
//! transfers in a scope (per peer, and one global), so concurrent debits
//! must be safe.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use skiff_proto::Message;

/// What traffic the token bucket meters. An explicit choice, not inferred
/// from message markers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LimitScope {
    /// Only FileChunk payload frames; control traffic is never delayed.
    #[default]
    ChunkDataOnly,
    /// Every outbound message.
    AllMessages,
}

impl LimitScope {
    pub fn applies_to(&self, message: &Message) -> bool {
        match self {
            LimitScope::ChunkDataOnly => message.carries_chunk_data(),
            LimitScope::AllMessages => true,
        }
    }
}

/// Minimum burst so a single chunk can always pass a nonzero bucket.
const MIN_BURST: u64 = 64 * 1024;

/// Plain token bucket. `refill` takes an explicit instant, so behavior is
/// deterministic under test.
#[derive(Debug)]
pub struct TokenBucket {
    /// Bytes per second; 0 means unlimited.
    rate: u64,
    burst: u64,
    available: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate: u64, now: Instant) -> Self {
        let burst = rate.max(MIN_BURST);
        Self {
            rate,
            burst,
            // A full burst is available up front.
            available: burst as f64,
            last_refill: now,
        }
    }

    pub fn unlimited(now: Instant) -> Self {
        Self::new(0, now)
    }

    pub fn rate(&self) -> u64 {
        self.rate
    }

    pub fn is_unlimited(&self) -> bool {
        self.rate == 0
    }

    /// Accrue credits for the time since the last refill, capped at the
    /// burst allowance.
    pub fn refill(&mut self, now: Instant) {
        if self.is_unlimited() {
            return;
        }
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.available =
            (self.available + self.rate as f64 * elapsed.as_secs_f64()).min(self.burst as f64);
        self.last_refill = now;
    }

    /// Debit `amount` bytes if covered, else return how long to wait for
    /// the deficit to replenish. Oversized requests are clamped to the
    /// burst so they cannot wait forever.
    pub fn try_debit(&mut self, amount: u64, now: Instant) -> Option<Duration> {
        if self.is_unlimited() {
            return None;
        }
        self.refill(now);

        let amount = amount.min(self.burst) as f64;
        if self.available >= amount {
            self.available -= amount;
            return None;
        }
        let deficit = amount - self.available;
        Some(Duration::from_secs_f64(deficit / self.rate as f64))
    }
}

/// Shared async wrapper around a bucket.
#[derive(Debug, Clone)]
pub struct BandwidthLimiter {
    bucket: Arc<Mutex<TokenBucket>>,
}

impl BandwidthLimiter {
    pub fn new(rate: u64) -> Self {
        Self {
            bucket: Arc::new(Mutex::new(TokenBucket::new(rate, Instant::now()))),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    pub fn rate(&self) -> u64 {
        self.bucket.lock().unwrap().rate()
    }

    /// Block until `amount` bytes of credit were debited.
    pub async fn acquire(&self, amount: u64) {
        loop {
            let wait = self
                .bucket
                .lock()
                .unwrap()
                .try_debit(amount, Instant::now());
            match wait {
                None => return,
                Some(wait) => tokio::time::sleep(wait).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_proto::message::{FileChunk, Ping};
    use skiff_proto::{FileInfo, FolderId};

    #[test]
    fn grants_never_exceed_rate_times_elapsed_plus_burst() {
        let start = Instant::now();
        let rate = 100_000u64;
        let mut bucket = TokenBucket::new(rate, start);

        let mut granted = 0u64;
        let grant = 1000u64;

        // Drain at t=0: only the initial burst is available.
        let mut now = start;
        while bucket.try_debit(grant, now).is_none() {
            granted += grant;
        }
        assert!(granted <= rate.max(MIN_BURST));
        let initial = granted;

        // One simulated second later, at most rate more bytes pass.
        now += Duration::from_secs(1);
        while bucket.try_debit(grant, now).is_none() {
            granted += grant;
        }
        assert!(granted - initial <= rate);
        assert!(granted - initial >= rate - grant);
    }

    #[test]
    fn deficit_wait_matches_replenishment() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(MIN_BURST, start);

        // Drain the burst exactly.
        assert!(bucket.try_debit(MIN_BURST, start).is_none());

        // Asking for half the rate should cost about half a second.
        let wait = bucket.try_debit(MIN_BURST / 2, start).unwrap();
        assert!(wait >= Duration::from_millis(450) && wait <= Duration::from_millis(550));

        // After that wait has elapsed the debit passes.
        assert!(bucket
            .try_debit(MIN_BURST / 2, start + wait)
            .is_none());
    }

    #[test]
    fn unlimited_bucket_never_waits() {
        let start = Instant::now();
        let mut bucket = TokenBucket::unlimited(start);
        for _ in 0..1000 {
            assert!(bucket.try_debit(u64::MAX, start).is_none());
        }
    }

    #[test]
    fn oversized_request_is_clamped_to_burst() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(1000, start);

        // Far larger than the burst, yet it passes once the burst is full.
        assert!(bucket.try_debit(u64::MAX, start).is_none());
    }

    #[test]
    fn scope_selects_messages() {
        let chunk = Message::FileChunk(FileChunk {
            file: FileInfo::new(FolderId::new("f"), "a", 10),
            offset: 0,
            data: vec![0; 10],
        });
        let ping = Message::Ping(Ping {
            id: "p".to_string(),
            payload: vec![],
        });

        assert!(LimitScope::ChunkDataOnly.applies_to(&chunk));
        assert!(!LimitScope::ChunkDataOnly.applies_to(&ping));
        assert!(LimitScope::AllMessages.applies_to(&ping));
    }

    #[tokio::test]
    async fn limiter_paces_concurrent_debits() {
        let limiter = BandwidthLimiter::new(1_000_000);

        // Two tasks splitting the burst concurrently both complete.
        let a = limiter.clone();
        let b = limiter.clone();
        let (ra, rb) = tokio::join!(
            tokio::spawn(async move { a.acquire(100_000).await }),
            tokio::spawn(async move { b.acquire(100_000).await }),
        );
        ra.unwrap();
        rb.unwrap();
    }
}
