//! Mining countdown for ConsignChain
//!
//! A peer that has gathered enough pending transactions does not mine at once:
//! it waits a randomised delay so that, across the network, one peer usually
//! wins and the others are pre-empted by its `addblock` broadcast.

use rand::Rng;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountdownOutcome {
    /// The delay elapsed; the peer should mine.
    Success,
    /// Another block arrived first (or the peer dropped the countdown).
    Preempted,
}

/// Handle used to pre-empt a running countdown.
#[derive(Debug)]
pub struct CountdownCancel(oneshot::Sender<()>);

impl CountdownCancel {
    /// Returns `false` when the countdown had already finished.
    pub fn preempt(self) -> bool {
        self.0.send(()).is_ok()
    }
}

/// A running countdown task.
#[derive(Debug)]
pub struct MiningCountdown {
    cancel: CountdownCancel,
    handle: JoinHandle<CountdownOutcome>,
}

impl MiningCountdown {
    /// Spawns a countdown sleeping `minimum + random(0..=range)`.
    pub fn start(minimum: Duration, range: Duration) -> Self {
        let jitter_ms = range.as_millis() as u64;
        let delay = minimum + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms));
        Self::with_delay(delay)
    }

    /// Spawns a countdown with a fixed delay.
    pub fn with_delay(delay: Duration) -> Self {
        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => CountdownOutcome::Success,
                // A dropped sender resolves the receiver with an error.
                _ = rx => CountdownOutcome::Preempted,
            }
        });
        debug!(delay_ms = delay.as_millis() as u64, "mining countdown started");
        MiningCountdown {
            cancel: CountdownCancel(tx),
            handle,
        }
    }

    pub fn into_parts(self) -> (CountdownCancel, JoinHandle<CountdownOutcome>) {
        (self.cancel, self.handle)
    }

    /// Waits for the countdown, treating a failed task as pre-empted.
    pub async fn outcome(handle: JoinHandle<CountdownOutcome>) -> CountdownOutcome {
        handle.await.unwrap_or(CountdownOutcome::Preempted)
    }
}

/// Starts mining countdowns. The peer goes through this seam so tests can
/// observe the parameters and control the outcome.
pub trait CountdownLauncher: Send + Sync {
    fn launch(&self, minimum: Duration, range: Duration) -> MiningCountdown;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioCountdownLauncher;

impl CountdownLauncher for TokioCountdownLauncher {
    fn launch(&self, minimum: Duration, range: Duration) -> MiningCountdown {
        MiningCountdown::start(minimum, range)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_countdown_succeeds_after_delay() {
        let (_cancel, handle) = MiningCountdown::start(Duration::from_millis(5), Duration::from_millis(5)).into_parts();
        let outcome = timeout(Duration::from_secs(2), MiningCountdown::outcome(handle))
            .await
            .expect("countdown timed out");
        assert_eq!(outcome, CountdownOutcome::Success);
    }

    #[tokio::test]
    async fn test_countdown_preempted() {
        let (cancel, handle) = MiningCountdown::with_delay(Duration::from_secs(60)).into_parts();
        assert!(cancel.preempt());
        let outcome = timeout(Duration::from_secs(2), MiningCountdown::outcome(handle))
            .await
            .expect("countdown timed out");
        assert_eq!(outcome, CountdownOutcome::Preempted);
    }

    #[tokio::test]
    async fn test_dropped_cancel_preempts() {
        let (cancel, handle) = MiningCountdown::with_delay(Duration::from_secs(60)).into_parts();
        drop(cancel);
        let outcome = timeout(Duration::from_secs(2), MiningCountdown::outcome(handle))
            .await
            .expect("countdown timed out");
        assert_eq!(outcome, CountdownOutcome::Preempted);
    }

    #[tokio::test]
    async fn test_preempt_after_finish_reports_false() {
        let (cancel, handle) = MiningCountdown::with_delay(Duration::ZERO).into_parts();
        assert_eq!(MiningCountdown::outcome(handle).await, CountdownOutcome::Success);
        assert!(!cancel.preempt());
    }
}
