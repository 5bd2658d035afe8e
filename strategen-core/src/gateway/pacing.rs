//! Request pacing shared by every thread using one gateway.
//!
//! Enforces a minimum interval between request starts. A rate-limit
//! response can push the next slot further out (`Retry-After`), capped so
//! a hostile header cannot stall the loop.

use std::sync::Mutex;
use std::time::{Duration, Instant};

const MAX_DEFER: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
struct PacerState {
    last_start: Option<Instant>,
    not_before: Option<Instant>,
}

/// Minimum-interval pacer.
#[derive(Debug)]
pub struct RequestPacer {
    min_interval: Duration,
    state: Mutex<PacerState>,
}

impl RequestPacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            state: Mutex::new(PacerState::default()),
        }
    }

    pub fn unpaced() -> Self {
        Self::new(Duration::ZERO)
    }

    /// How long a request starting now would have to wait.
    pub fn wait_time(&self) -> Duration {
        let state = self.lock();
        Self::wait_for(&state, self.min_interval, Instant::now())
    }

    /// Block until a request may start, then claim the slot.
    pub fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.lock();
                let now = Instant::now();
                let wait = Self::wait_for(&state, self.min_interval, now);
                if wait.is_zero() {
                    state.last_start = Some(now);
                    state.not_before = None;
                    return;
                }
                wait
            };
            std::thread::sleep(wait);
        }
    }

    /// Push the next slot at least `delay` into the future.
    pub fn defer(&self, delay: Duration) {
        let until = Instant::now() + delay.min(MAX_DEFER);
        let mut state = self.lock();
        state.not_before = Some(match state.not_before {
            Some(existing) if existing > until => existing,
            _ => until,
        });
    }

    fn wait_for(state: &PacerState, min_interval: Duration, now: Instant) -> Duration {
        let interval_ready = state.last_start.map(|t| t + min_interval);
        let ready = match (interval_ready, state.not_before) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        ready.map_or(Duration::ZERO, |r| r.saturating_duration_since(now))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PacerState> {
        // A poisoned pacer still holds valid timestamps.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unpaced_never_waits() {
        let p = RequestPacer::unpaced();
        p.acquire();
        p.acquire();
        assert_eq!(p.wait_time(), Duration::ZERO);
    }

    #[test]
    fn enforces_min_interval() {
        let p = RequestPacer::new(Duration::from_millis(40));
        let start = Instant::now();
        p.acquire();
        p.acquire();
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn defer_pushes_next_slot() {
        let p = RequestPacer::unpaced();
        p.defer(Duration::from_millis(200));
        assert!(p.wait_time() > Duration::from_millis(100));
    }

    #[test]
    fn defer_is_capped() {
        let p = RequestPacer::unpaced();
        p.defer(Duration::from_secs(3600));
        assert!(p.wait_time() <= MAX_DEFER);
    }

    #[test]
    fn acquire_clears_deferral() {
        let p = RequestPacer::unpaced();
        p.defer(Duration::from_millis(15));
        p.acquire();
        assert_eq!(p.wait_time(), Duration::ZERO);
    }
}
