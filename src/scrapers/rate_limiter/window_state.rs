//! Rolling request windows for a single source.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::models::RateConfig;

pub const MINUTE: Duration = Duration::from_secs(60);
pub const HOUR: Duration = Duration::from_secs(3600);

/// Issued request instants, oldest first.
#[derive(Debug, Clone, Default)]
pub struct WindowState {
    /// Requests issued in the last minute.
    pub minute: VecDeque<Instant>,
    /// Requests issued in the last hour.
    pub hour: VecDeque<Instant>,
    /// Last request time; the delay clock runs from here.
    pub last_request: Option<Instant>,
    /// Total requests made.
    pub total_requests: u64,
    /// Total time callers spent waiting.
    pub total_wait: Duration,
}

impl WindowState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop entries whose age has reached the window length.
    pub fn prune(&mut self, now: Instant) {
        prune_window(&mut self.minute, now, MINUTE);
        prune_window(&mut self.hour, now, HOUR);
    }

    /// Time until one more request fits every constraint.
    pub fn time_until_ready(&mut self, now: Instant, rate: &RateConfig) -> Duration {
        self.prune(now);

        let delay = match self.last_request {
            Some(last) => {
                let next = last + Duration::from_millis(rate.delay_between_requests_ms);
                next.saturating_duration_since(now)
            }
            None => Duration::ZERO,
        };

        delay
            .max(window_wait(&self.minute, now, MINUTE, rate.requests_per_minute))
            .max(window_wait(&self.hour, now, HOUR, rate.requests_per_hour))
    }

    /// Record a request slot taken at `now`.
    pub fn reserve(&mut self, now: Instant) {
        self.minute.push_back(now);
        self.hour.push_back(now);
        self.last_request = Some(now);
        self.total_requests += 1;
    }

    /// Restart the delay clock at the actual issuance instant.
    pub fn register(&mut self, now: Instant) {
        match self.last_request {
            Some(last) if last > now => {}
            _ => self.last_request = Some(now),
        }
    }

    /// (last minute, last hour) occupancy without mutating the windows.
    pub fn occupancy(&self, now: Instant) -> (usize, usize) {
        let live = |window: &VecDeque<Instant>, len: Duration| {
            window
                .iter()
                .filter(|t| now.saturating_duration_since(**t) < len)
                .count()
        };
        (live(&self.minute, MINUTE), live(&self.hour, HOUR))
    }
}

fn prune_window(window: &mut VecDeque<Instant>, now: Instant, len: Duration) {
    // Entries are appended in time order, so expired ones form a prefix.
    let cutoff_idx = window.partition_point(|t| now.saturating_duration_since(*t) >= len);
    if cutoff_idx > 0 {
        window.drain(0..cutoff_idx);
    }
}

fn window_wait(window: &VecDeque<Instant>, now: Instant, len: Duration, limit: u32) -> Duration {
    let limit = limit as usize;
    if limit == 0 || window.len() < limit {
        return Duration::ZERO;
    }
    // The entry whose expiry brings the count back under the limit.
    let blocking = window[window.len() - limit];
    (blocking + len).saturating_duration_since(now)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rate(rpm: u32, rph: u32, delay_ms: u64) -> RateConfig {
        RateConfig {
            requests_per_minute: rpm,
            requests_per_hour: rph,
            delay_between_requests_ms: delay_ms,
        }
    }

    #[test]
    fn minute_window_blocks_until_oldest_expires() {
        let start = Instant::now();
        let mut state = WindowState::new();
        let rate = rate(2, 0, 0);

        state.reserve(start);
        state.reserve(start + Duration::from_secs(10));
        let now = start + Duration::from_secs(20);
        assert_eq!(state.time_until_ready(now, &rate), Duration::from_secs(40));

        // Age exactly equal to the window no longer counts.
        let later = start + MINUTE;
        assert_eq!(state.time_until_ready(later, &rate), Duration::ZERO);
        assert_eq!(state.minute.len(), 1);
    }

    #[test]
    fn zero_limits_mean_unlimited() {
        let now = Instant::now();
        let mut state = WindowState::new();
        for _ in 0..100 {
            state.reserve(now);
        }
        assert_eq!(state.time_until_ready(now, &rate(0, 0, 0)), Duration::ZERO);
        assert_eq!(state.occupancy(now), (100, 100));
    }

    #[test]
    fn register_restarts_delay_clock() {
        let start = Instant::now();
        let mut state = WindowState::new();
        let rate = rate(0, 0, 1000);
        state.reserve(start);
        state.register(start + Duration::from_millis(400));
        assert_eq!(
            state.time_until_ready(start + Duration::from_millis(500), &rate),
            Duration::from_millis(900)
        );
    }
}
