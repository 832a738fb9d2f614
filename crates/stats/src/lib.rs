//! Per-message lifecycle statistics.
//!
//! Every processed message produces one [`MessageStat`], pushed through a
//! bounded channel to a single collector task that owns all mutation of the
//! per-UID history and the two counters. Pushing blocks while the collector
//! is saturated, which backpressures the pipeline instead of dropping
//! telemetry. The collector exits when the last pusher has been dropped and
//! the channel is drained, so no event handed to `push` is ever lost.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, error};

/// Stat id used when a message failed to decode before a UID was known.
pub const UNKNOWN_ID: &str = "unknown";

/// Outcome of processing one message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StatStatus {
    Success,
    Error,
}

/// One lifecycle event for one consumed message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageStat {
    /// Order UID, or [`UNKNOWN_ID`] when the payload never decoded.
    pub id: String,
    pub status: StatStatus,
    pub message: String,
    /// UTC timestamp at which the message finished processing.
    pub processed: DateTime<Utc>,
}

impl MessageStat {
    pub fn success(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: StatStatus::Success,
            message: "ok".to_string(),
            processed: Utc::now(),
        }
    }

    pub fn error(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: StatStatus::Error,
            message: message.into(),
            processed: Utc::now(),
        }
    }
}

/// Current counter values.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatCounts {
    /// Total events recorded, success and error alike.
    pub processed: u64,
    /// Events recorded with [`StatStatus::Error`].
    pub failed: u64,
}

#[derive(Debug, Default)]
struct Shared {
    statistics: RwLock<HashMap<String, Vec<MessageStat>>>,
    processed: AtomicU64,
    failed: AtomicU64,
}

/// Producer side of the stat sink. Cheap to clone; one clone per pipeline
/// task. The sink channel closes once every clone has been dropped.
#[derive(Debug, Clone)]
pub struct StatsPusher {
    tx: mpsc::Sender<MessageStat>,
}

impl StatsPusher {
    /// Hand one event to the collector, waiting while it is saturated.
    pub async fn push(&self, stat: MessageStat) {
        // Only possible if the collector was torn down while producers are
        // still alive, which the shutdown order rules out.
        if let Err(e) = self.tx.send(stat).await {
            error!(stat_id = %e.0.id, "stat collector is gone, event dropped");
        }
    }
}

/// Read side of the stat sink, shared with the HTTP layer.
#[derive(Debug, Clone)]
pub struct StatsReader {
    shared: Arc<Shared>,
}

impl StatsReader {
    /// Snapshot of the full per-UID history.
    ///
    /// Returns a defensive copy taken under the read lock; callers may hold
    /// or mutate it freely without observing later collector writes.
    pub async fn stats(&self) -> HashMap<String, Vec<MessageStat>> {
        self.shared.statistics.read().await.clone()
    }

    /// Current counter values.
    pub fn counts(&self) -> StatCounts {
        StatCounts {
            processed: self.shared.processed.load(Ordering::Acquire),
            failed: self.shared.failed.load(Ordering::Acquire),
        }
    }
}

/// The single consumer loop of the stat sink.
pub struct StatsCollector {
    rx: mpsc::Receiver<MessageStat>,
    shared: Arc<Shared>,
}

impl StatsCollector {
    /// Drain the channel until every pusher has been dropped.
    ///
    /// Events are appended to the per-UID history before the counters move,
    /// so a reader that observes the counters always finds at least as many
    /// recorded events.
    pub async fn run(mut self) {
        while let Some(stat) = self.rx.recv().await {
            let failed = stat.status == StatStatus::Error;
            {
                let mut statistics = self.shared.statistics.write().await;
                statistics.entry(stat.id.clone()).or_default().push(stat);
            }
            self.shared.processed.fetch_add(1, Ordering::Release);
            if failed {
                self.shared.failed.fetch_add(1, Ordering::Release);
            }
        }
        debug!("stat collector drained and stopped");
    }
}

/// Build a stat sink with the given handoff capacity.
pub fn stats_channel(capacity: usize) -> (StatsPusher, StatsReader, StatsCollector) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let shared = Arc::new(Shared::default());

    (
        StatsPusher { tx },
        StatsReader {
            shared: shared.clone(),
        },
        StatsCollector { rx, shared },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counts_follow_pushed_events() {
        let (pusher, reader, collector) = stats_channel(4);
        let collector = tokio::spawn(collector.run());

        pusher.push(MessageStat::success("u1")).await;
        pusher.push(MessageStat::error("u2", "boom")).await;
        pusher.push(MessageStat::success("u1")).await;
        drop(pusher);
        collector.await.unwrap();

        let counts = reader.counts();
        assert_eq!(counts.processed, 3);
        assert_eq!(counts.failed, 1);
    }

    #[tokio::test]
    async fn per_uid_history_keeps_push_order() {
        let (pusher, reader, collector) = stats_channel(4);
        let collector = tokio::spawn(collector.run());

        pusher.push(MessageStat::error("u4", "duplicate")).await;
        pusher.push(MessageStat::success("u4")).await;
        drop(pusher);
        collector.await.unwrap();

        let stats = reader.stats().await;
        let history = &stats["u4"];
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, StatStatus::Error);
        assert_eq!(history[1].status, StatStatus::Success);
    }

    #[tokio::test]
    async fn unknown_id_groups_decode_failures() {
        let (pusher, reader, collector) = stats_channel(1);
        let collector = tokio::spawn(collector.run());

        pusher
            .push(MessageStat::error(UNKNOWN_ID, "bad json"))
            .await;
        pusher
            .push(MessageStat::error(UNKNOWN_ID, "worse json"))
            .await;
        drop(pusher);
        collector.await.unwrap();

        let stats = reader.stats().await;
        assert_eq!(stats[UNKNOWN_ID].len(), 2);
    }

    #[tokio::test]
    async fn snapshot_is_a_defensive_copy() {
        let (pusher, reader, collector) = stats_channel(1);
        let collector = tokio::spawn(collector.run());

        pusher.push(MessageStat::success("u1")).await;
        drop(pusher);
        collector.await.unwrap();

        let mut snapshot = reader.stats().await;
        snapshot.remove("u1");

        assert_eq!(reader.stats().await.len(), 1);
    }

    #[tokio::test]
    async fn collector_stops_when_all_pushers_drop() {
        let (pusher, _reader, collector) = stats_channel(2);
        let collector = tokio::spawn(collector.run());

        let second = pusher.clone();
        drop(pusher);
        second.push(MessageStat::success("u1")).await;
        drop(second);

        // Completes only because the channel closed.
        collector.await.unwrap();
    }

    #[tokio::test]
    async fn many_producers_serialize_through_the_collector() {
        let (pusher, reader, collector) = stats_channel(2);
        let collector = tokio::spawn(collector.run());

        let mut tasks = Vec::new();
        for i in 0..8 {
            let pusher = pusher.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..25 {
                    pusher.push(MessageStat::success(format!("u{i}"))).await;
                }
            }));
        }
        drop(pusher);
        for task in tasks {
            task.await.unwrap();
        }
        collector.await.unwrap();

        let counts = reader.counts();
        assert_eq!(counts.processed, 200);
        assert_eq!(counts.failed, 0);
        assert_eq!(reader.stats().await.len(), 8);
    }
}
