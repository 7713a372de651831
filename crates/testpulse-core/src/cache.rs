//! Write caching for batch mode.
//!
//! [`BatchedWriteCache`] collects message and checkpoint rows and hands
//! them to the gateway as one transactional batch once the pending count
//! reaches `chunk_size` or the oldest row reaches `max_age`. A failed
//! flush discards the batch; rows are never retried.
//!
//! [`CheckpointSummaryCache`] is the coarser companion for one-shot
//! checkpoints: instead of keeping every row it folds them into per
//! `(queue, name)` aggregates and flushes a handful of summary updates.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use testpulse_store::{
    CheckpointAggregate, CheckpointRow, PersistenceGateway, StoreResult, WriteBatch,
};
use testpulse_types::{CheckpointResult, Message};

/// Size- and age-bounded cache of pending rows.
pub struct BatchedWriteCache {
    chunk_size: usize,
    max_age: Duration,
    monitor: bool,
    batch: WriteBatch,
    birth: Option<Instant>,
}

impl BatchedWriteCache {
    pub fn new(chunk_size: usize, max_age: Duration, monitor: bool) -> Self {
        Self {
            chunk_size,
            max_age,
            monitor,
            batch: WriteBatch::default(),
            birth: None,
        }
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    /// True once the pending rows have hit the size or age bound.
    pub fn needs_flush(&self) -> bool {
        if self.batch.is_empty() {
            return false;
        }
        if self.batch.len() >= self.chunk_size {
            return true;
        }
        self.birth
            .map(|birth| birth.elapsed() >= self.max_age)
            .unwrap_or(false)
    }

    fn note_added(&mut self) -> bool {
        if self.birth.is_none() {
            self.birth = Some(Instant::now());
        }
        self.needs_flush()
    }

    /// Each `add_*` returns whether the cache now wants a flush.
    pub fn add_run_message(&mut self, run_id: i64, message: Message) -> bool {
        self.batch.run_messages.push((run_id, message));
        self.note_added()
    }

    pub fn add_suite_message(&mut self, suite_id: i64, message: Message) -> bool {
        self.batch.suite_messages.push((suite_id, message));
        self.note_added()
    }

    pub fn add_testcase_message(&mut self, testcase_id: i64, message: Message) -> bool {
        self.batch.testcase_messages.push((testcase_id, message));
        self.note_added()
    }

    pub fn add_checkpoint(&mut self, row: CheckpointRow) -> bool {
        self.batch.checkpoints.push(row);
        self.note_added()
    }

    /// Hand the pending rows to the gateway as one transaction. The
    /// batch is taken out first, so a failed flush drops its rows.
    pub async fn flush(&mut self, gateway: &dyn PersistenceGateway) -> StoreResult<usize> {
        let batch = std::mem::take(&mut self.batch);
        self.birth = None;
        if batch.is_empty() {
            return Ok(0);
        }
        let count = batch.len();
        let started = Instant::now();
        gateway.flush_batch(batch).await?;
        if self.monitor {
            info!(
                rows = count,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "write cache flushed"
            );
        } else {
            debug!(rows = count, "write cache flushed");
        }
        Ok(count)
    }

    /// Drop pending rows without writing them.
    pub fn reset(&mut self) {
        self.batch = WriteBatch::default();
        self.birth = None;
    }
}

/// Aggregating cache for one-shot checkpoints.
pub struct CheckpointSummaryCache {
    chunk_size: usize,
    max_age: Duration,
    aggregates: BTreeMap<(i64, String), CheckpointAggregate>,
    pending: usize,
    birth: Option<Instant>,
}

impl CheckpointSummaryCache {
    pub fn new(chunk_size: usize, max_age: Duration) -> Self {
        Self {
            chunk_size,
            max_age,
            aggregates: BTreeMap::new(),
            pending: 0,
            birth: None,
        }
    }

    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn is_empty(&self) -> bool {
        self.pending == 0
    }

    pub fn needs_flush(&self) -> bool {
        if self.pending == 0 {
            return false;
        }
        if self.pending >= self.chunk_size {
            return true;
        }
        self.birth
            .map(|birth| birth.elapsed() >= self.max_age)
            .unwrap_or(false)
    }

    /// Fold one checkpoint into its `(queue, name)` aggregate. Returns
    /// whether the cache now wants a flush.
    pub fn add(
        &mut self,
        load_queue_id: i64,
        name: &str,
        transfer_unit: &str,
        result: CheckpointResult,
        response_time_ms: i64,
        transfer_rate: f64,
    ) -> bool {
        if self.birth.is_none() {
            self.birth = Some(Instant::now());
        }
        self.aggregates
            .entry((load_queue_id, name.to_owned()))
            .or_insert_with(|| CheckpointAggregate::new(load_queue_id, name, transfer_unit))
            .record(result, response_time_ms, transfer_rate);
        self.pending += 1;
        self.needs_flush()
    }

    /// Apply the aggregates in one gateway call and reset. A failed
    /// update drops the aggregates, matching the no-retry batch rule.
    pub async fn flush(&mut self, gateway: &dyn PersistenceGateway) -> StoreResult<usize> {
        let aggregates: Vec<CheckpointAggregate> =
            std::mem::take(&mut self.aggregates).into_values().collect();
        let count = self.pending;
        self.pending = 0;
        self.birth = None;
        if aggregates.is_empty() {
            return Ok(0);
        }
        gateway.update_checkpoint_summaries(&aggregates).await?;
        debug!(checkpoints = count, summaries = aggregates.len(), "summary cache flushed");
        Ok(count)
    }

    pub fn reset(&mut self) {
        self.aggregates.clear();
        self.pending = 0;
        self.birth = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use testpulse_store::{MemoryGateway, NewRun};
    use testpulse_types::MessageLevel;

    fn msg(text: &str) -> Message {
        Message {
            text: text.into(),
            level: MessageLevel::Info,
            escape_html: false,
            machine: "m".into(),
            thread_name: "t".into(),
            timestamp: Utc::now(),
        }
    }

    async fn gateway_with_run() -> (MemoryGateway, i64) {
        let gw = MemoryGateway::new();
        let run_id = gw
            .start_run(
                &NewRun {
                    name: "r".into(),
                    os: String::new(),
                    product: String::new(),
                    version: String::new(),
                    build: String::new(),
                    host: String::new(),
                },
                Utc::now(),
            )
            .await
            .unwrap();
        (gw, run_id)
    }

    #[tokio::test]
    async fn flush_fires_exactly_at_chunk_size() {
        let (gw, run_id) = gateway_with_run().await;
        let mut cache = BatchedWriteCache::new(3, Duration::from_secs(3600), false);

        assert!(!cache.add_run_message(run_id, msg("1")));
        assert!(!cache.add_run_message(run_id, msg("2")));
        assert!(cache.add_run_message(run_id, msg("3")));

        cache.flush(&gw).await.unwrap();
        assert_eq!(gw.counts().run_messages, 3);
        assert_eq!(gw.counts().batches_flushed, 1);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn age_bound_triggers_flush_request() {
        let (_gw, run_id) = gateway_with_run().await;
        let mut cache = BatchedWriteCache::new(1000, Duration::from_millis(10), false);

        assert!(!cache.add_run_message(run_id, msg("young")));
        assert!(!cache.needs_flush());

        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(cache.needs_flush(), "rows past max_age must request a flush");
        assert!(cache.add_run_message(run_id, msg("old")));
    }

    #[tokio::test]
    async fn failed_flush_discards_rows() {
        let (gw, run_id) = gateway_with_run().await;
        let mut cache = BatchedWriteCache::new(10, Duration::from_secs(3600), false);
        cache.add_run_message(run_id, msg("doomed"));

        gw.fail_next_flush();
        assert!(cache.flush(&gw).await.is_err());
        assert!(cache.is_empty(), "failed rows must not be retried");

        cache.add_run_message(run_id, msg("next"));
        cache.flush(&gw).await.unwrap();
        assert_eq!(gw.run_message_texts(run_id), vec!["next".to_string()]);
    }

    #[tokio::test]
    async fn reset_drops_rows_without_writing() {
        let (gw, run_id) = gateway_with_run().await;
        let mut cache = BatchedWriteCache::new(10, Duration::from_secs(3600), false);
        cache.add_run_message(run_id, msg("sanity leftover"));
        cache.reset();
        cache.flush(&gw).await.unwrap();
        assert_eq!(gw.counts().run_messages, 0);
    }

    #[tokio::test]
    async fn summary_cache_aggregates_per_queue_and_name() {
        // Build a queue hierarchy for the summaries to land on.
        let (gw, rid) = gateway_with_run().await;
        let now = Utc::now();
        let sid = gw.start_suite(rid, "s", "", now).await.unwrap();
        let tid = gw.start_testcase(sid, "", "", "tc", now).await.unwrap();
        let qid = gw
            .start_load_queue(
                &testpulse_store::NewLoadQueue {
                    testcase_id: tid,
                    name: "q".into(),
                    thread_count: 1,
                    threading_pattern: String::new(),
                    host: String::new(),
                },
                now,
            )
            .await
            .unwrap();

        let mut cache = CheckpointSummaryCache::new(100, Duration::from_secs(3600));
        cache.add(qid, "login", "KB", CheckpointResult::Passed, 10, 100.0);
        cache.add(qid, "login", "KB", CheckpointResult::Passed, 30, 300.0);
        cache.add(qid, "logout", "KB", CheckpointResult::Failed, 1, 0.0);

        let flushed = cache.flush(&gw).await.unwrap();
        assert_eq!(flushed, 3);
        assert_eq!(gw.counts().summary_updates, 1);

        let login = gw.summary(qid, "login").unwrap();
        assert_eq!(login.num_passed, 2);
        assert_eq!(login.min_response_for_store(), 10);
        assert_eq!(login.max_response_time_ms, 30);
        let logout = gw.summary(qid, "logout").unwrap();
        assert_eq!(logout.num_failed, 1);
    }
}
