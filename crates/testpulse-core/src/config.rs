//! Configuration knobs for the telemetry pipeline.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use testpulse_types::CheckpointDetail;

/// Tuning for the event queue, the write cache, and checkpoint storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DbLogConfig {
    /// Producer-side backpressure: capacity of the bounded event queue.
    pub queue_capacity: usize,
    /// Batch mode caches row inserts and flushes them in chunks;
    /// immediate mode writes every event as it arrives.
    pub batch_mode: bool,
    /// Pending rows that force a flush.
    pub chunk_size: usize,
    /// Oldest a pending row may get before the next add forces a flush,
    /// in seconds.
    pub max_cache_age_secs: u64,
    /// How long the idle consumer waits before flushing anyway, in
    /// seconds. Only meaningful in batch mode.
    pub poll_interval_secs: u64,
    /// Whether individual checkpoint rows are stored (`full`) or only
    /// summaries (`short`).
    pub checkpoint_detail: CheckpointDetail,
    /// When false, every checkpoint event is a no-op.
    pub enable_checkpoints: bool,
    /// Log item counts and elapsed time for every cache flush.
    pub monitor_cache: bool,
    /// Name this process reports as the message origin machine.
    pub machine: String,
}

impl Default for DbLogConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 4096,
            batch_mode: false,
            chunk_size: 1000,
            max_cache_age_secs: 10,
            poll_interval_secs: 10,
            checkpoint_detail: CheckpointDetail::Short,
            enable_checkpoints: true,
            monitor_cache: false,
            machine: String::new(),
        }
    }
}

impl DbLogConfig {
    pub fn max_cache_age(&self) -> Duration {
        Duration::from_secs(self.max_cache_age_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_immediate_mode_with_short_checkpoints() {
        let cfg = DbLogConfig::default();
        assert!(!cfg.batch_mode);
        assert_eq!(cfg.checkpoint_detail, CheckpointDetail::Short);
        assert!(cfg.enable_checkpoints);
        assert_eq!(cfg.max_cache_age(), Duration::from_secs(10));
    }

    #[test]
    fn partial_config_deserializes_over_defaults() {
        let cfg: DbLogConfig =
            serde_json::from_str(r#"{"batch_mode": true, "chunk_size": 50}"#).unwrap();
        assert!(cfg.batch_mode);
        assert_eq!(cfg.chunk_size, 50);
        assert_eq!(cfg.queue_capacity, 4096);
    }
}
