use std::time::Duration;

use tokio::sync::oneshot;

const BASE_DURATION: Duration = Duration::from_secs(5);

/// Exponential-backoff view timer (spec.md §4.4, §4.6, §5). `start` is
/// resettable: calling it while a previous instance is still running
/// signals that instance to stop via a dedicated one-shot channel before
/// arming the new one. An expired timer doubles its duration for the next
/// round; a timer that is `stop`ped before expiry resets to the 5s base
/// (chained HotStuff's "stop halves back to base" rule, generalized to
/// every protocol's liveness timer). `stop` is idempotent.
pub struct Timer {
    duration: Duration,
    cancel: Option<oneshot::Sender<()>>,
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer {
    pub fn new() -> Self {
        Self {
            duration: BASE_DURATION,
            cancel: None,
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Arm the timer. `on_expire` runs (on the tokio runtime) if the
    /// duration elapses before `stop`/another `start` cancels it.
    pub fn start(&mut self, on_expire: impl FnOnce() + Send + 'static) {
        self.cancel_running();
        let (tx, rx) = oneshot::channel();
        self.cancel = Some(tx);
        let dur = self.duration;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(dur) => { on_expire(); }
                _ = rx => {}
            }
        });
        self.duration *= 2;
    }

    /// Idempotent: cancels any running instance and resets the backoff.
    pub fn stop(&mut self) {
        self.cancel_running();
        self.duration = BASE_DURATION;
    }

    fn cancel_running(&mut self) {
        if let Some(tx) = self.cancel.take() {
            let _ = tx.send(());
        }
    }
}

/// HotStuff-2's enter-timer (spec.md §4.7): armed by the leader after a
/// `TC_MSG` so stragglers can catch up before the leader proposes. Distinct
/// from the view timer because it waits for presence, not absence.
pub type EnterTimer = Timer;

/// Aggregates WISH votes toward a target view until `2f+1` are collected
/// (spec.md §4.7 view-change flow); the rotating candidate leader set is
/// `f+1` replicas starting at the current leader index.
pub struct WishAggregator {
    target_view: u64,
    threshold: usize,
    wishes: Vec<crate::types::NodeId>,
}

impl WishAggregator {
    pub fn new(target_view: u64, threshold: usize) -> Self {
        Self {
            target_view,
            threshold,
            wishes: Vec::new(),
        }
    }

    pub fn target_view(&self) -> u64 {
        self.target_view
    }

    /// Record a wish; returns `true` the moment the threshold is first met.
    pub fn record(&mut self, from: crate::types::NodeId) -> bool {
        if self.wishes.contains(&from) {
            return false;
        }
        self.wishes.push(from);
        self.wishes.len() == self.threshold
    }

    pub fn count(&self) -> usize {
        self.wishes.len()
    }

    pub fn signers(&self) -> &[crate::types::NodeId] {
        &self.wishes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn expiry_fires_and_doubles_backoff() {
        let fired = Arc::new(AtomicBool::new(false));
        let mut timer = Timer::new();
        assert_eq!(timer.duration(), Duration::from_secs(5));

        let fired_clone = fired.clone();
        timer.start(move || fired_clone.store(true, Ordering::SeqCst));
        assert_eq!(timer.duration(), Duration::from_secs(10));

        tokio::time::advance(Duration::from_secs(6)).await;
        tokio::task::yield_now().await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn stop_resets_backoff() {
        let mut timer = Timer::new();
        timer.start(|| {});
        assert_eq!(timer.duration(), Duration::from_secs(10));
        timer.stop();
        assert_eq!(timer.duration(), Duration::from_secs(5));
    }

    #[test]
    fn wish_aggregator_triggers_at_threshold() {
        let mut agg = WishAggregator::new(4, 3);
        assert!(!agg.record(crate::types::NodeId::from("r_0")));
        assert!(!agg.record(crate::types::NodeId::from("r_1")));
        assert!(agg.record(crate::types::NodeId::from("r_2")));
        // duplicate does not re-trigger or double count
        assert!(!agg.record(crate::types::NodeId::from("r_0")));
        assert_eq!(agg.count(), 3);
    }
}
