//! Command deduplication on the broker boundary.
//!
//! Orchestrator retries and overlapping publishes can deliver the same
//! command twice. Command IDs are remembered for a sliding window; a repeat
//! inside the window is dropped before it reaches the scheduler, so a
//! retried command never double-fires or double-supersedes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

struct DedupEntry {
    expires_at: Instant,
}

#[derive(Clone)]
pub struct CommandDeduplicator {
    entries: Arc<DashMap<u64, DedupEntry>>,
    window: Duration,
    cleanup_interval: Duration,
}

impl CommandDeduplicator {
    #[must_use]
    pub fn new(window: Duration, cleanup_interval: Duration) -> Self {
        let dedup = Self {
            entries: Arc::new(DashMap::new()),
            window,
            cleanup_interval,
        };

        let cleanup = dedup.clone();
        tokio::spawn(async move {
            cleanup.run_cleanup().await;
        });

        dedup
    }

    /// Whether this command ID is new within the window. Registers it as
    /// seen when it is.
    #[must_use]
    pub fn should_process(&self, command_id: u64) -> bool {
        let now = Instant::now();

        if let Some(entry) = self.entries.get(&command_id) {
            if entry.expires_at > now {
                return false;
            }
            drop(entry);
            self.entries.remove(&command_id);
        }

        self.entries.insert(
            command_id,
            DedupEntry {
                expires_at: now + self.window,
            },
        );
        true
    }

    async fn run_cleanup(&self) {
        let mut interval = tokio::time::interval(self.cleanup_interval);
        loop {
            interval.tick().await;
            let now = Instant::now();
            self.entries.retain(|_, entry| entry.expires_at > now);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplicate_within_window_is_dropped() {
        let dedup = CommandDeduplicator::new(Duration::from_secs(5), Duration::from_secs(30));

        assert!(dedup.should_process(42));
        assert!(!dedup.should_process(42));
        assert!(dedup.should_process(43));
    }

    #[tokio::test]
    async fn test_expired_entry_processes_again() {
        let dedup = CommandDeduplicator::new(Duration::from_millis(10), Duration::from_secs(30));

        assert!(dedup.should_process(7));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(dedup.should_process(7));
    }
}
