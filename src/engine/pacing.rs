//! Interval pacing state shared across image tasks.
//!
//! Time-lapse pacing is one wall-clock wait per time frame, not per image:
//! only the first image of a frame carries a nonzero wait, and the wait is
//! measured from the moment the *previous* timed wait completed. That moment,
//! the last wake time, is the single piece of mutable state shared by every
//! image task of a run. [`PacingClock`] owns it behind one mutex; every run
//! starts with a fresh clock.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Outcome of planning one timed wait against the clock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitPlan {
    /// No previous wake recorded (first timed stage of the run): proceed
    /// without waiting.
    NoBaseline,
    /// The deadline has already passed. `lagging` is true when a nonzero
    /// wait had been requested, i.e. the schedule was actually missed.
    Ready {
        /// Whether the missed deadline should be annotated in metadata.
        lagging: bool,
    },
    /// Sleep until the contained deadline.
    SleepUntil(Instant),
}

/// Shared `last wake time` state for one acquisition run.
#[derive(Debug, Default)]
pub struct PacingClock {
    last_wake: Mutex<Option<Instant>>,
}

impl PacingClock {
    /// A clock with no recorded wake.
    pub fn new() -> Self {
        Self::default()
    }

    /// Plans a wait of `wait_ms` relative to the last recorded wake.
    pub async fn plan_wait(&self, wait_ms: f64) -> WaitPlan {
        let last = *self.last_wake.lock().await;
        match last {
            None => WaitPlan::NoBaseline,
            Some(last_wake) => {
                let deadline = last_wake + Duration::from_secs_f64(wait_ms.max(0.0) / 1000.0);
                if Instant::now() >= deadline {
                    WaitPlan::Ready {
                        lagging: wait_ms > 0.0,
                    }
                } else {
                    WaitPlan::SleepUntil(deadline)
                }
            }
        }
    }

    /// Records "now" as the wake time. Called when a timed-wait stage
    /// completes, whether or not it slept.
    pub async fn mark_wake(&self) {
        *self.last_wake.lock().await = Some(Instant::now());
    }

    /// Overwrites the recorded wake time. Test and scheduling hook.
    pub async fn set_last_wake(&self, instant: Instant) {
        *self.last_wake.lock().await = Some(instant);
    }

    /// Milliseconds from `start` to the last recorded wake, if any.
    pub async fn wake_offset_ms(&self, start: Instant) -> Option<f64> {
        self.last_wake
            .lock()
            .await
            .map(|wake| wake.saturating_duration_since(start).as_secs_f64() * 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_first_wait_has_no_baseline() {
        let clock = PacingClock::new();
        assert_eq!(clock.plan_wait(1000.0).await, WaitPlan::NoBaseline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_within_interval_sleeps() {
        let clock = PacingClock::new();
        clock.mark_wake().await;
        match clock.plan_wait(1000.0).await {
            WaitPlan::SleepUntil(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                assert_eq!(remaining, Duration::from_secs(1));
            }
            other => panic!("expected a sleep, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_missed_deadline_is_lagging() {
        let clock = PacingClock::new();
        clock.mark_wake().await;
        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(
            clock.plan_wait(1000.0).await,
            WaitPlan::Ready { lagging: true }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_wait_is_ready_without_lagging() {
        let clock = PacingClock::new();
        clock.mark_wake().await;
        tokio::time::advance(Duration::from_millis(5)).await;
        assert_eq!(
            clock.plan_wait(0.0).await,
            WaitPlan::Ready { lagging: false }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_wake_offset_from_start() {
        let clock = PacingClock::new();
        let start = Instant::now();
        assert!(clock.wake_offset_ms(start).await.is_none());
        tokio::time::advance(Duration::from_millis(250)).await;
        clock.mark_wake().await;
        let offset = clock.wake_offset_ms(start).await.unwrap();
        assert!((offset - 250.0).abs() < 1.0, "offset was {offset}");
    }
}
