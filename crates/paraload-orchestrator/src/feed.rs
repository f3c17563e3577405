//! ---
//! ems_section: "04-configuration-orchestration"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Bounded, lossy telemetry and status feeds for external consumers."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use chrono::{DateTime, Local};
use paraload_metrics::RunMetrics;
use paraload_persistence::LogLevel;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

/// Default depth of both feeds.
pub const DEFAULT_FEED_CAPACITY: usize = 256;

/// One classified narrative line, as offered on the status feed.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusLine {
    pub timestamp: DateTime<Local>,
    pub relative_s: f64,
    pub level: LogLevel,
    pub message: String,
}

/// Producer half of a feed. Publishing never waits: a full or closed channel drops the item.
#[derive(Debug)]
pub struct Feed<T> {
    name: &'static str,
    tx: mpsc::Sender<T>,
    dropped: u64,
    metrics: Option<RunMetrics>,
}

impl<T> Feed<T> {
    pub fn channel(name: &'static str, capacity: usize) -> (Self, mpsc::Receiver<T>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                name,
                tx,
                dropped: 0,
                metrics: None,
            },
            rx,
        )
    }

    pub fn attach_metrics(&mut self, metrics: RunMetrics) {
        self.metrics = Some(metrics);
    }

    /// Offer `item`; returns whether it was queued.
    pub fn publish(&mut self, item: T) -> bool {
        match self.tx.try_send(item) {
            Ok(()) => true,
            Err(err) => {
                self.dropped += 1;
                if let Some(metrics) = &self.metrics {
                    metrics.record_feed_drop(self.name);
                }
                match err {
                    TrySendError::Full(_) => {
                        debug!(feed = self.name, dropped = self.dropped, "feed full, item dropped")
                    }
                    TrySendError::Closed(_) => {
                        debug!(feed = self.name, dropped = self.dropped, "feed closed, item dropped")
                    }
                }
                false
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paraload_metrics::new_registry;

    #[test]
    fn full_feed_drops_without_reordering() {
        let (mut feed, mut rx) = Feed::channel("telemetry", 2);
        assert!(feed.publish(1));
        assert!(feed.publish(2));
        assert!(!feed.publish(3));
        assert_eq!(rx.try_recv().ok(), Some(1));
        assert!(feed.publish(4));
        assert_eq!(rx.try_recv().ok(), Some(2));
        assert_eq!(rx.try_recv().ok(), Some(4));
        assert_eq!(feed.dropped(), 1);
    }

    #[test]
    fn closed_feed_counts_drops() {
        let registry = new_registry();
        let (mut feed, rx) = Feed::channel("status", 4);
        feed.attach_metrics(RunMetrics::new(registry.clone()).unwrap());
        drop(rx);
        assert!(!feed.publish("line"));
        assert!(!feed.publish("line"));
        assert_eq!(feed.dropped(), 2);
        let families = registry.gather();
        let dropped = families
            .iter()
            .find(|family| family.get_name() == "paraload_feed_dropped_total")
            .map(|family| family.get_metric()[0].get_counter().get_value());
        assert_eq!(dropped, Some(2.0));
    }
}
