// src/pipeline/throttle.rs

//! Per-platform request throttling.
//!
//! Each collector owns one `RateLimiter`. Callers reserve the next free
//! slot under a short lock and then sleep outside of it, so concurrent
//! callers are spaced `min_interval` apart in reservation order.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Longest spacing a limiter will enforce, however low the configured rate.
pub const MAX_INTERVAL: Duration = Duration::from_secs(3600);

/// Enforces a minimum interval between acquired slots.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// Create a limiter with a fixed minimum interval.
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_slot: Mutex::new(None),
        }
    }

    /// Create a limiter allowing `rps` calls per second. Non-positive rates
    /// disable throttling; tiny rates are capped at `MAX_INTERVAL`.
    pub fn per_second(rps: f64) -> Self {
        if rps > 0.0 && rps.is_finite() {
            let interval = Duration::try_from_secs_f64(1.0 / rps).unwrap_or(MAX_INTERVAL);
            Self::new(interval.min(MAX_INTERVAL))
        } else {
            Self::unlimited()
        }
    }

    pub fn unlimited() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Wait until the caller may issue its next request.
    pub async fn acquire(&self) {
        let slot = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = match *next {
                Some(reserved) if reserved > now => reserved,
                _ => now,
            };
            *next = Some(slot + self.min_interval);
            slot
        };
        tokio::time::sleep_until(slot).await;
    }
}
