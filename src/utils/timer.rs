//! Deadline timer backing the replica's two schedules: the randomized
//! anti-entropy interval and the timeout bounding the round in flight.
//!
//! Each `kickoff()` bumps an epoch counter and spawns a one-shot sleeper
//! task stamped with that epoch; when the sleeper wakes it notifies only if
//! its epoch is still current. Re-kicking or cancelling therefore silently
//! orphans any pending sleeper, which matches how the replica re-arms the
//! interval after every round and discards the round timeout on completion.
//! Suitable only for coarse-grained intervals.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::utils::BayouError;

use futures::future::FutureExt;

use tokio::sync::Notify;
use tokio::time::{self, Duration};

/// Timer utility for signalling after a given timeout.
#[derive(Debug)]
pub struct Timer {
    /// Bumped on every `kickoff()` / `cancel()`; a sleeper fires only if
    /// the value it was stamped with is still current.
    epoch: Arc<AtomicU64>,

    /// Timeout notification channel (caller side receiver).
    notify: Arc<Notify>,
}

impl Timer {
    /// Creates a new timer utility with nothing scheduled.
    pub fn new() -> Self {
        Timer {
            epoch: Arc::new(AtomicU64::new(0)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Schedules a notification after the given duration, replacing any
    /// previously scheduled one. Every call leads to one or zero permits
    /// inserted into `notify`. Must be called within a tokio runtime.
    pub fn kickoff(&self, dur: Duration) -> Result<(), BayouError> {
        if dur.is_zero() {
            return Err(BayouError::msg(format!(
                "invalid timeout duration {} ns",
                dur.as_nanos()
            )));
        }

        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        let epoch_ref = self.epoch.clone();
        let notify_ref = self.notify.clone();
        tokio::spawn(async move {
            time::sleep(dur).await;
            if epoch_ref.load(Ordering::Acquire) == epoch {
                notify_ref.notify_one();
            }
        });

        Ok(())
    }

    /// Invalidates the currently scheduled timeout, if any, and consumes
    /// notifications of timeouts that already ticked.
    pub fn cancel(&self) -> Result<(), BayouError> {
        self.epoch.fetch_add(1, Ordering::AcqRel);

        while self.notify.notified().now_or_never().is_some() {}

        Ok(())
    }

    /// Waits for a timeout notification. Typically, this should be used as
    /// a branch of a `tokio::select!`.
    pub async fn timeout(&self) {
        self.notify.notified().await;
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod timer_tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timer_fires() -> Result<(), BayouError> {
        let timer = Timer::new();
        assert!(timer.kickoff(Duration::ZERO).is_err());

        let start = Instant::now();
        timer.kickoff(Duration::from_millis(100))?;
        timer.timeout().await;
        assert!(start.elapsed() >= Duration::from_millis(100));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timer_rekick_replaces() -> Result<(), BayouError> {
        let timer = Timer::new();
        let start = Instant::now();
        timer.kickoff(Duration::from_millis(100))?;
        time::sleep(Duration::from_millis(50)).await;
        // the second kickoff orphans the first sleeper, so the wait runs
        // to the later deadline
        timer.kickoff(Duration::from_millis(200))?;
        timer.timeout().await;
        assert!(start.elapsed() >= Duration::from_millis(250));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timer_cancel() -> Result<(), BayouError> {
        let timer = Timer::new();
        // let a timeout tick, then cancel: the stale permit is consumed
        timer.kickoff(Duration::from_millis(50))?;
        time::sleep(Duration::from_millis(100)).await;
        timer.cancel()?;

        let start = Instant::now();
        timer.kickoff(Duration::from_millis(100))?;
        timer.timeout().await;
        assert!(start.elapsed() >= Duration::from_millis(100));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timer_cancel_pending() -> Result<(), BayouError> {
        let timer = Timer::new();
        // cancel before the deadline: the sleeper must stay silent
        timer.kickoff(Duration::from_millis(50))?;
        timer.cancel()?;
        time::sleep(Duration::from_millis(100)).await;

        let start = Instant::now();
        timer.kickoff(Duration::from_millis(100))?;
        timer.timeout().await;
        assert!(start.elapsed() >= Duration::from_millis(100));
        Ok(())
    }
}
