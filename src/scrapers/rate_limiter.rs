//! Per-source request budget enforcement.
//!
//! Each source gets three concurrent constraints: a rolling one minute window,
//! a rolling one hour window, and a minimum delay between requests. Callers
//! block until a slot is free; there is no "retry after violation" path.

mod window_state;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{CrawlError, Result};
use crate::models::Source;

pub use window_state::{WindowState, HOUR, MINUTE};

/// Limiter state for one source.
#[derive(Debug, Default)]
struct SourceLimiter {
    /// Held across the wait so waiters are served in arrival order.
    turnstile: Mutex<()>,
    state: StdMutex<WindowState>,
}

/// Snapshot of a source's limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceStats {
    pub total_requests: u64,
    pub in_last_minute: usize,
    pub in_last_hour: usize,
    pub total_wait: Duration,
}

/// Rate limiter shared by every worker, keyed by source id.
#[derive(Debug, Clone, Default)]
pub struct RateLimiter {
    sources: Arc<StdMutex<HashMap<String, Arc<SourceLimiter>>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn limiter_for(&self, source_id: &str) -> Arc<SourceLimiter> {
        let mut sources = match self.sources.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        sources
            .entry(source_id.to_string())
            .or_default()
            .clone()
    }

    /// Wait until a request to `source` complies with its budget, then take
    /// the slot.
    pub async fn wait_if_needed(&self, source: &Source, cancel: &CancellationToken) -> Result<()> {
        let limiter = self.limiter_for(&source.id);

        let _turn = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CrawlError::Cancelled),
            turn = limiter.turnstile.lock() => turn,
        };

        let mut waited = Duration::ZERO;
        loop {
            let now = Instant::now();
            let wait = {
                let mut state = lock_state(&limiter.state);
                let wait = state.time_until_ready(now, &source.rate);
                if wait.is_zero() {
                    state.reserve(now);
                    state.total_wait += waited;
                    return Ok(());
                }
                wait
            };

            debug!(source = %source.id, ?wait, "rate limiting");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CrawlError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
            waited += wait;
        }
    }

    /// Record that a request to `source_id` was actually issued now.
    pub fn register_request(&self, source_id: &str) {
        let limiter = self.limiter_for(source_id);
        lock_state(&limiter.state).register(Instant::now());
    }

    /// Per-source totals and current window occupancy.
    pub fn stats(&self) -> HashMap<String, SourceStats> {
        let now = Instant::now();
        let sources = match self.sources.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        sources
            .iter()
            .map(|(id, limiter)| {
                let state = lock_state(&limiter.state);
                let (in_last_minute, in_last_hour) = state.occupancy(now);
                (
                    id.clone(),
                    SourceStats {
                        total_requests: state.total_requests,
                        in_last_minute,
                        in_last_hour,
                        total_wait: state.total_wait,
                    },
                )
            })
            .collect()
    }
}

fn lock_state(state: &StdMutex<WindowState>) -> std::sync::MutexGuard<'_, WindowState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
