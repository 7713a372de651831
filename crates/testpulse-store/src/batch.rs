//! Row types carried by a batched flush.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use testpulse_types::{CheckpointResult, Message};

/// One checkpoint row ready for insertion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRow {
    pub load_queue_id: i64,
    pub name: String,
    pub response_time_ms: i64,
    pub transfer_size: i64,
    pub transfer_unit: String,
    pub result: CheckpointResult,
    pub ended_at: DateTime<Utc>,
}

/// Pending rows accumulated between flushes, grouped by destination
/// table. All lanes are written in a single transaction; if any row
/// fails the whole batch rolls back and is discarded.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    pub run_messages: Vec<(i64, Message)>,
    pub suite_messages: Vec<(i64, Message)>,
    pub testcase_messages: Vec<(i64, Message)>,
    pub checkpoints: Vec<CheckpointRow>,
}

impl WriteBatch {
    pub fn len(&self) -> usize {
        self.run_messages.len()
            + self.suite_messages.len()
            + self.testcase_messages.len()
            + self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Client-side summary of checkpoints sharing a `(load queue, name)`
/// pair, maintained while rows wait in the cache so one flush can update
/// the persisted summary instead of replaying every row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointAggregate {
    pub load_queue_id: i64,
    pub name: String,
    pub transfer_unit: String,
    pub num_passed: i64,
    pub num_failed: i64,
    pub min_response_time_ms: i64,
    pub max_response_time_ms: i64,
    sum_response_time_ms: i64,
    pub min_transfer_rate: f64,
    pub max_transfer_rate: f64,
    sum_transfer_rate: f64,
}

impl CheckpointAggregate {
    pub fn new(load_queue_id: i64, name: &str, transfer_unit: &str) -> Self {
        Self {
            load_queue_id,
            name: name.to_owned(),
            transfer_unit: transfer_unit.to_owned(),
            num_passed: 0,
            num_failed: 0,
            min_response_time_ms: i64::MAX,
            max_response_time_ms: 0,
            sum_response_time_ms: 0,
            min_transfer_rate: f64::MAX,
            max_transfer_rate: 0.0,
            sum_transfer_rate: 0.0,
        }
    }

    /// Fold one checkpoint into the summary. Failed checkpoints count but
    /// never contribute timing data.
    pub fn record(&mut self, result: CheckpointResult, response_time_ms: i64, transfer_rate: f64) {
        if result == CheckpointResult::Passed {
            self.num_passed += 1;
            self.min_response_time_ms = self.min_response_time_ms.min(response_time_ms);
            self.max_response_time_ms = self.max_response_time_ms.max(response_time_ms);
            self.sum_response_time_ms += response_time_ms;
            self.min_transfer_rate = self.min_transfer_rate.min(transfer_rate);
            self.max_transfer_rate = self.max_transfer_rate.max(transfer_rate);
            self.sum_transfer_rate += transfer_rate;
        } else {
            self.num_failed += 1;
        }
    }

    /// Fold another aggregate for the same `(load queue, name)` pair
    /// into this one.
    pub fn merge(&mut self, other: &CheckpointAggregate) {
        self.num_failed += other.num_failed;
        if other.num_passed > 0 {
            self.num_passed += other.num_passed;
            self.min_response_time_ms = self.min_response_time_ms.min(other.min_response_time_ms);
            self.max_response_time_ms = self.max_response_time_ms.max(other.max_response_time_ms);
            self.sum_response_time_ms += other.sum_response_time_ms;
            self.min_transfer_rate = self.min_transfer_rate.min(other.min_transfer_rate);
            self.max_transfer_rate = self.max_transfer_rate.max(other.max_transfer_rate);
            self.sum_transfer_rate += other.sum_transfer_rate;
        }
    }

    pub fn avg_response_time_ms(&self) -> f64 {
        if self.num_passed == 0 {
            0.0
        } else {
            self.sum_response_time_ms as f64 / self.num_passed as f64
        }
    }

    pub fn avg_transfer_rate(&self) -> f64 {
        if self.num_passed == 0 {
            0.0
        } else {
            self.sum_transfer_rate / self.num_passed as f64
        }
    }

    /// Min values suitable for persisting: a summary with no passed
    /// checkpoints reports zero, not the sentinel.
    pub fn min_response_for_store(&self) -> i64 {
        if self.num_passed == 0 {
            0
        } else {
            self.min_response_time_ms
        }
    }

    pub fn min_rate_for_store(&self) -> f64 {
        if self.num_passed == 0 {
            0.0
        } else {
            self.min_transfer_rate
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_tracks_min_avg_max() {
        let mut agg = CheckpointAggregate::new(1, "login", "KB");
        agg.record(CheckpointResult::Passed, 10, 100.0);
        agg.record(CheckpointResult::Passed, 30, 300.0);
        agg.record(CheckpointResult::Failed, 999, 999.0);

        assert_eq!(agg.num_passed, 2);
        assert_eq!(agg.num_failed, 1);
        assert_eq!(agg.min_response_for_store(), 10);
        assert_eq!(agg.max_response_time_ms, 30);
        assert!((agg.avg_response_time_ms() - 20.0).abs() < f64::EPSILON);
        assert!((agg.avg_transfer_rate() - 200.0).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_aggregate_stores_zeros() {
        let mut agg = CheckpointAggregate::new(1, "cp", "");
        agg.record(CheckpointResult::Failed, 5, 0.0);
        assert_eq!(agg.min_response_for_store(), 0);
        assert_eq!(agg.avg_response_time_ms(), 0.0);
    }
}
