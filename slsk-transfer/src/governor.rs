//! Bandwidth-shaped issuance of byte grants (spec §4.5). Generalizes the
//! fixed-concurrency permit pattern of
//! `drop_transfer::ws::client::throttle::PermitInit` from "N uploads in
//! flight" into "N bytes per second", keeping the same shape: an
//! accumulator gated behind a lock, with callers awaiting until enough
//! budget has accrued.

use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::SoulseekError;

struct Bucket {
    rate: Option<u32>,
    available: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self) {
        let Some(rate) = self.rate else {
            return;
        };
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.available = (self.available + elapsed * rate as f64).min(rate as f64);
        self.last_refill = now;
    }
}

/// Shared, bandwidth-shaping byte-budget counter. One instance per
/// direction (download/upload), shared across all of that direction's
/// transfers, per spec §4.5.
pub struct TokenBucket {
    bucket: Mutex<Bucket>,
}

impl TokenBucket {
    pub fn new(bytes_per_sec: Option<u32>) -> Self {
        Self {
            bucket: Mutex::new(Bucket {
                rate: bytes_per_sec,
                available: bytes_per_sec.unwrap_or(0) as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn unmetered() -> Self {
        Self::new(None)
    }

    /// Yields once `n'` bytes of budget have accrued, `n' <= n`. An
    /// unmetered bucket (`rate = None`) grants the full request
    /// immediately. Observes `cancel` while waiting for a metered bucket
    /// to refill.
    pub async fn get(&self, n: u64, cancel: &CancellationToken) -> Result<u64, SoulseekError> {
        if n == 0 {
            return Ok(0);
        }

        loop {
            {
                let mut bucket = self.bucket.lock().await;
                bucket.refill();

                if bucket.rate.is_none() {
                    return Ok(n);
                }

                if bucket.available >= 1.0 {
                    let grant = (n as f64).min(bucket.available.floor()) as u64;
                    if grant > 0 {
                        bucket.available -= grant as f64;
                        return Ok(grant);
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(20)) => {},
                _ = cancel.cancelled() => return Err(SoulseekError::Cancelled),
            }
        }
    }

    /// Credit unused bytes back to the bucket (spec §4.5 `return`, P10).
    pub async fn give_back(&self, unused: u64) {
        if unused == 0 {
            return;
        }
        let mut bucket = self.bucket.lock().await;
        if let Some(rate) = bucket.rate {
            bucket.available = (bucket.available + unused as f64).min(rate as f64);
        }
    }

    pub async fn update_rate(&self, bytes_per_sec: Option<u32>) {
        let mut bucket = self.bucket.lock().await;
        bucket.refill();
        bucket.rate = bytes_per_sec;
        if let Some(rate) = bytes_per_sec {
            bucket.available = bucket.available.min(rate as f64);
        }
    }
}
