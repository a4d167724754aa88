//! Metrics collection (spec.md §2 ambient stack): counts proposals, votes,
//! commits, view changes and reconfigurations. Grounded on the teacher's
//! `metrics/mod.rs` atomic-counters-plus-mpsc-event-loop shape, trimmed to
//! the events this crate actually emits and with the Prometheus text
//! encoder gated behind the `metrics` feature instead of always-on.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConsensusMetrics {
    pub blocks_proposed: u64,
    pub blocks_committed: u64,
    pub votes_sent: u64,
    pub votes_received: u64,
    pub timeouts: u64,
    pub view_changes: u64,
    pub reconfigurations: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
}

/// Events the orderer and server emit; the collector's event loop folds
/// these into the atomic counters and the published snapshot.
#[derive(Debug, Clone)]
pub enum MetricEvent {
    BlockProposed,
    BlockCommitted,
    VoteSent,
    VoteReceived,
    Timeout,
    ViewChange,
    Reconfiguration,
    MessageSent,
    MessageReceived,
}

/// Owns the atomic counters directly so `record` never contends on a lock;
/// the mpsc loop only exists to publish periodic snapshots into `metrics`
/// for `snapshot()`/a future Prometheus scrape endpoint.
pub struct MetricsCollector {
    metrics: Arc<RwLock<ConsensusMetrics>>,
    event_tx: mpsc::Sender<MetricEvent>,

    blocks_proposed: Arc<AtomicU64>,
    blocks_committed: Arc<AtomicU64>,
    votes_sent: Arc<AtomicU64>,
    votes_received: Arc<AtomicU64>,
    timeouts: Arc<AtomicU64>,
    view_changes: Arc<AtomicU64>,
    reconfigurations: Arc<AtomicU64>,
    messages_sent: Arc<AtomicU64>,
    messages_received: Arc<AtomicU64>,
}

impl MetricsCollector {
    /// Spawns the fold loop immediately; there is no `start()` step since the
    /// counters are useful even before anything is draining a snapshot.
    pub fn new() -> Arc<Self> {
        let (event_tx, mut event_rx) = mpsc::channel(1000);
        let collector = Arc::new(Self {
            metrics: Arc::new(RwLock::new(ConsensusMetrics::default())),
            event_tx,
            blocks_proposed: Arc::new(AtomicU64::new(0)),
            blocks_committed: Arc::new(AtomicU64::new(0)),
            votes_sent: Arc::new(AtomicU64::new(0)),
            votes_received: Arc::new(AtomicU64::new(0)),
            timeouts: Arc::new(AtomicU64::new(0)),
            view_changes: Arc::new(AtomicU64::new(0)),
            reconfigurations: Arc::new(AtomicU64::new(0)),
            messages_sent: Arc::new(AtomicU64::new(0)),
            messages_received: Arc::new(AtomicU64::new(0)),
        });

        let handle = collector.clone();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                handle.apply(event);
            }
        });

        collector
    }

    fn apply(&self, event: MetricEvent) {
        let counter = match event {
            MetricEvent::BlockProposed => &self.blocks_proposed,
            MetricEvent::BlockCommitted => &self.blocks_committed,
            MetricEvent::VoteSent => &self.votes_sent,
            MetricEvent::VoteReceived => &self.votes_received,
            MetricEvent::Timeout => &self.timeouts,
            MetricEvent::ViewChange => &self.view_changes,
            MetricEvent::Reconfiguration => &self.reconfigurations,
            MetricEvent::MessageSent => &self.messages_sent,
            MetricEvent::MessageReceived => &self.messages_received,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        debug!("metrics: {event:?}");

        let mut metrics = self.metrics.write();
        metrics.blocks_proposed = self.blocks_proposed.load(Ordering::Relaxed);
        metrics.blocks_committed = self.blocks_committed.load(Ordering::Relaxed);
        metrics.votes_sent = self.votes_sent.load(Ordering::Relaxed);
        metrics.votes_received = self.votes_received.load(Ordering::Relaxed);
        metrics.timeouts = self.timeouts.load(Ordering::Relaxed);
        metrics.view_changes = self.view_changes.load(Ordering::Relaxed);
        metrics.reconfigurations = self.reconfigurations.load(Ordering::Relaxed);
        metrics.messages_sent = self.messages_sent.load(Ordering::Relaxed);
        metrics.messages_received = self.messages_received.load(Ordering::Relaxed);
    }

    pub fn sender(&self) -> mpsc::Sender<MetricEvent> {
        self.event_tx.clone()
    }

    /// Fire-and-forget record from sync code; drops the event rather than
    /// blocking if the channel is somehow full (metrics must never slow down
    /// the consensus path).
    pub fn record(&self, event: MetricEvent) {
        let _ = self.event_tx.try_send(event);
    }

    pub fn snapshot(&self) -> ConsensusMetrics {
        self.metrics.read().clone()
    }
}

#[cfg(feature = "metrics")]
pub mod prometheus_text {
    use super::ConsensusMetrics;

    /// Renders a snapshot in Prometheus's plain text exposition format, for
    /// whatever HTTP handler the embedding binary wires up on `/metrics`.
    pub fn encode(metrics: &ConsensusMetrics) -> String {
        format!(
            "bft_orderer_blocks_proposed {}\n\
             bft_orderer_blocks_committed {}\n\
             bft_orderer_votes_sent {}\n\
             bft_orderer_votes_received {}\n\
             bft_orderer_timeouts {}\n\
             bft_orderer_view_changes {}\n\
             bft_orderer_reconfigurations {}\n\
             bft_orderer_messages_sent {}\n\
             bft_orderer_messages_received {}\n",
            metrics.blocks_proposed,
            metrics.blocks_committed,
            metrics.votes_sent,
            metrics.votes_received,
            metrics.timeouts,
            metrics.view_changes,
            metrics.reconfigurations,
            metrics.messages_sent,
            metrics.messages_received,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counters_fold_into_snapshot() {
        let collector = MetricsCollector::new();
        collector.record(MetricEvent::BlockProposed);
        collector.record(MetricEvent::BlockCommitted);
        collector.record(MetricEvent::VoteSent);

        // give the fold task a chance to drain the channel
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.blocks_proposed, 1);
        assert_eq!(snapshot.blocks_committed, 1);
        assert_eq!(snapshot.votes_sent, 1);
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn prometheus_text_contains_metric_names() {
        let metrics = ConsensusMetrics { blocks_committed: 3, ..Default::default() };
        let text = prometheus_text::encode(&metrics);
        assert!(text.contains("bft_orderer_blocks_committed 3"));
    }
}
