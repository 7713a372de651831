//! The persistence seam between event processing and the backing store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use testpulse_types::{
    CheckpointDetail, CheckpointInfo, CheckpointResult, LoadQueueResult, Message, Run, RunPatch,
    StatisticDefinition, StatisticSample, TestcasePatch, TestcaseResult,
};

use crate::batch::{CheckpointAggregate, CheckpointRow, WriteBatch};
use crate::error::StoreResult;

/// Fields needed to create a run row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRun {
    pub name: String,
    pub os: String,
    pub product: String,
    pub version: String,
    pub build: String,
    pub host: String,
}

/// Fields needed to create a load queue row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewLoadQueue {
    pub testcase_id: i64,
    pub name: String,
    pub thread_count: i64,
    pub threading_pattern: String,
    pub host: String,
}

/// Storage operations the event processor depends on.
///
/// Implementations are called from a single consumer task (plus the
/// occasional agent-side relay), must be cancel-safe, and report a
/// missing parent entity as [`crate::StoreError::MissingParent`] so the
/// caller can degrade gracefully when runs, suites, or testcases have
/// been deleted mid-flight.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Exercise every write path inside one transaction and roll it
    /// back. Called once before the first real run so a broken schema
    /// fails fast instead of mid-run.
    async fn run_sanity_check(&self) -> StoreResult<()>;

    // -- runs ------------------------------------------------------------

    async fn start_run(&self, run: &NewRun, timestamp: DateTime<Utc>) -> StoreResult<i64>;
    async fn end_run(&self, run_id: i64, timestamp: DateTime<Utc>) -> StoreResult<()>;
    async fn update_run(&self, run_id: i64, patch: &RunPatch) -> StoreResult<()>;
    async fn get_run(&self, run_id: i64) -> StoreResult<Run>;
    async fn add_run_metainfo(&self, run_id: i64, key: &str, value: &str) -> StoreResult<()>;

    // -- suites ----------------------------------------------------------

    async fn start_suite(
        &self,
        run_id: i64,
        name: &str,
        package: &str,
        timestamp: DateTime<Utc>,
    ) -> StoreResult<i64>;
    async fn end_suite(&self, suite_id: i64, timestamp: DateTime<Utc>) -> StoreResult<()>;
    async fn update_suite(
        &self,
        suite_id: i64,
        name: Option<&str>,
        user_note: Option<&str>,
    ) -> StoreResult<()>;

    // -- testcases -------------------------------------------------------

    async fn start_testcase(
        &self,
        suite_id: i64,
        scenario_name: &str,
        scenario_description: &str,
        name: &str,
        timestamp: DateTime<Utc>,
    ) -> StoreResult<i64>;
    async fn end_testcase(
        &self,
        testcase_id: i64,
        result: TestcaseResult,
        timestamp: DateTime<Utc>,
    ) -> StoreResult<()>;
    async fn update_testcase(
        &self,
        testcase_id: i64,
        patch: &TestcasePatch,
        timestamp: DateTime<Utc>,
    ) -> StoreResult<()>;
    async fn delete_testcase(&self, testcase_id: i64) -> StoreResult<()>;
    async fn add_scenario_metainfo(
        &self,
        testcase_id: i64,
        key: &str,
        value: &str,
    ) -> StoreResult<()>;
    async fn clear_scenario_metainfo(&self, testcase_id: i64) -> StoreResult<()>;
    async fn add_testcase_metainfo(
        &self,
        testcase_id: i64,
        key: &str,
        value: &str,
    ) -> StoreResult<()>;

    // -- load queues and checkpoints ------------------------------------

    async fn start_load_queue(
        &self,
        queue: &NewLoadQueue,
        timestamp: DateTime<Utc>,
    ) -> StoreResult<i64>;
    async fn end_load_queue(
        &self,
        load_queue_id: i64,
        result: LoadQueueResult,
        timestamp: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Open a checkpoint: ensure the `(queue, name)` summary row exists
    /// and, in `Full` detail, insert an in-progress checkpoint row.
    async fn start_checkpoint(
        &self,
        load_queue_id: i64,
        name: &str,
        transfer_unit: &str,
        detail: CheckpointDetail,
        timestamp: DateTime<Utc>,
    ) -> StoreResult<CheckpointInfo>;

    /// Close a previously started checkpoint and fold it into the
    /// summary row.
    async fn end_checkpoint(
        &self,
        info: &CheckpointInfo,
        response_time_ms: i64,
        transfer_size: i64,
        result: CheckpointResult,
        detail: CheckpointDetail,
        timestamp: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Persist a single already-measured checkpoint, summary included.
    async fn insert_checkpoint(
        &self,
        row: &CheckpointRow,
        detail: CheckpointDetail,
    ) -> StoreResult<()>;

    /// Apply client-side summary aggregates produced by the checkpoint
    /// summary cache. Creates missing summary rows.
    async fn update_checkpoint_summaries(
        &self,
        aggregates: &[CheckpointAggregate],
    ) -> StoreResult<()>;

    // -- messages and statistics ----------------------------------------

    async fn insert_run_message(&self, run_id: i64, message: &Message) -> StoreResult<()>;
    async fn insert_suite_message(&self, suite_id: i64, message: &Message) -> StoreResult<()>;
    async fn insert_testcase_message(&self, testcase_id: i64, message: &Message)
        -> StoreResult<()>;

    async fn register_statistic_definition(&self, def: &StatisticDefinition) -> StoreResult<i64>;
    async fn insert_system_statistics(
        &self,
        testcase_id: i64,
        sample: &StatisticSample,
    ) -> StoreResult<()>;
    async fn insert_user_activity_statistics(
        &self,
        testcase_id: i64,
        sample: &StatisticSample,
    ) -> StoreResult<()>;
    async fn update_machine_info(&self, machine: &str, info: &str) -> StoreResult<()>;

    // -- presence checks -------------------------------------------------

    async fn is_run_present(&self, run_id: i64) -> StoreResult<bool>;
    async fn is_suite_present(&self, suite_id: i64) -> StoreResult<bool>;
    async fn is_testcase_present(&self, testcase_id: i64) -> StoreResult<bool>;

    // -- batched writes --------------------------------------------------

    /// Write every row of the batch in one transaction. On failure the
    /// transaction rolls back and the error is returned; the caller
    /// discards the batch either way.
    async fn flush_batch(&self, batch: WriteBatch) -> StoreResult<()>;
}
