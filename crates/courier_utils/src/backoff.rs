//! Exponential reconnect backoff
//!
//! `Backoff` doubles the delay on every call to [`Backoff::next`] up to a
//! ceiling. An optional *mandatory stop* caps the total time spent backing off
//! since the first attempt: once the accumulated delay would cross it, a single
//! shortened delay is returned so that a caller-side deadline (for example an
//! operation timeout) gets one last attempt right before it expires.

use std::time::{Duration, Instant};

/// Base interval used by [`Backoff::should_backoff`].
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(100);

/// Ceiling used by [`Backoff::should_backoff`].
pub const MAX_BACKOFF_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
    mandatory_stop: Option<Duration>,
    first_backoff_at: Option<Instant>,
    mandatory_stop_made: bool,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            next: initial,
            mandatory_stop: None,
            first_backoff_at: None,
            mandatory_stop_made: false,
        }
    }

    pub fn with_mandatory_stop(mut self, mandatory_stop: Duration) -> Self {
        self.mandatory_stop = Some(mandatory_stop);
        self
    }

    /// Delay to wait before the next attempt.
    pub fn next(&mut self) -> Duration {
        self.next_at(Instant::now())
    }

    /// Same as [`Backoff::next`] with an explicit clock reading.
    pub fn next_at(&mut self, now: Instant) -> Duration {
        let mut current = self.next;
        if current < self.max {
            self.next = (self.next * 2).min(self.max);
        }

        if let Some(stop) = self.mandatory_stop {
            if !self.mandatory_stop_made {
                let elapsed = if current == self.initial {
                    self.first_backoff_at = Some(now);
                    Duration::ZERO
                } else {
                    self.first_backoff_at
                        .map(|first| now.saturating_duration_since(first))
                        .unwrap_or_default()
                };

                if elapsed + current > stop {
                    current = self.initial.max(stop.saturating_sub(elapsed));
                    self.mandatory_stop_made = true;
                }
            }
        }

        current.max(self.initial)
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
        self.first_backoff_at = None;
        self.mandatory_stop_made = false;
    }

    /// Whether a caller that last failed at `last_failure` after
    /// `failed_attempts` consecutive failures should still hold off.
    pub fn should_backoff(last_failure: Instant, failed_attempts: u32) -> bool {
        Self::should_backoff_at(last_failure, Instant::now(), failed_attempts)
    }

    pub fn should_backoff_at(last_failure: Instant, now: Instant, failed_attempts: u32) -> bool {
        let mut interval = DEFAULT_INTERVAL;
        for _ in 1..failed_attempts {
            interval *= 2;
            if interval > MAX_BACKOFF_INTERVAL {
                interval = MAX_BACKOFF_INTERVAL;
                break;
            }
        }
        now < last_failure + interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_max() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(1000));
        let delays: Vec<_> = (0..6).map(|_| backoff.next().as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
    }

    #[test]
    fn reset_returns_to_initial() {
        let mut backoff = Backoff::new(Duration::from_millis(50), Duration::from_secs(1));
        backoff.next();
        backoff.next();
        backoff.reset();
        assert_eq!(backoff.next(), Duration::from_millis(50));
    }

    #[test]
    fn mandatory_stop_shortens_one_delay() {
        let start = Instant::now();
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(60))
            .with_mandatory_stop(Duration::from_millis(1900));

        assert_eq!(backoff.next_at(start), Duration::from_millis(100));
        assert_eq!(
            backoff.next_at(start + Duration::from_millis(100)),
            Duration::from_millis(200)
        );
        assert_eq!(
            backoff.next_at(start + Duration::from_millis(300)),
            Duration::from_millis(400)
        );
        // 700ms elapsed, 800ms would land at 1500ms: still below the stop.
        assert_eq!(
            backoff.next_at(start + Duration::from_millis(700)),
            Duration::from_millis(800)
        );
        // 1500ms elapsed, 1600ms would overshoot 1900ms: shortened to 400ms.
        assert_eq!(
            backoff.next_at(start + Duration::from_millis(1500)),
            Duration::from_millis(400)
        );
        // Afterwards the regular schedule continues.
        assert_eq!(
            backoff.next_at(start + Duration::from_millis(1900)),
            Duration::from_millis(3200)
        );
    }

    #[test]
    fn should_backoff_is_false_for_old_failures() {
        let now = Instant::now();
        let long_ago = now.checked_sub(Duration::from_secs(60)).unwrap_or(now);
        if long_ago < now {
            assert!(!Backoff::should_backoff_at(long_ago, now, 0));
        }
    }

    #[test]
    fn should_backoff_is_true_for_fresh_failures() {
        let now = Instant::now();
        assert!(Backoff::should_backoff(now, 100));
        assert!(Backoff::should_backoff_at(now, now + Duration::from_millis(99), 1));
        assert!(!Backoff::should_backoff_at(now, now + Duration::from_millis(100), 1));
        assert!(Backoff::should_backoff_at(now, now + Duration::from_millis(399), 3));
    }
}
