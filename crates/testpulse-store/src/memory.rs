//! In-memory [`PersistenceGateway`] for tests.
//!
//! Mirrors the SQLite backend's observable behavior: ids are allocated
//! from one counter, child inserts against a deleted parent return
//! `MissingParent`, and a failed batch lands nothing. Per-operation
//! counters and snapshot accessors let tests assert on what reached the
//! store without poking at SQL.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use testpulse_types::{
    CheckpointDetail, CheckpointInfo, CheckpointResult, LoadQueueResult, Message, Run, RunPatch,
    StatisticDefinition, StatisticSample, Testcase, TestcasePatch, TestcaseResult,
};

use crate::batch::{CheckpointAggregate, CheckpointRow, WriteBatch};
use crate::error::{StoreError, StoreResult};
use crate::gateway::{NewLoadQueue, NewRun, PersistenceGateway};

/// How many times each write family has reached the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub run_messages: usize,
    pub suite_messages: usize,
    pub testcase_messages: usize,
    pub checkpoints: usize,
    pub batches_flushed: usize,
    pub summary_updates: usize,
    pub sanity_checks: usize,
    pub statistics: usize,
}

#[derive(Debug, Clone)]
struct StoredQueue {
    testcase_id: i64,
    #[allow(dead_code)]
    name: String,
    result: Option<LoadQueueResult>,
}

#[derive(Default)]
struct State {
    next_id: i64,
    runs: BTreeMap<i64, Run>,
    run_metainfo: Vec<(i64, String, String)>,
    suites: BTreeMap<i64, (i64, String)>,
    testcases: BTreeMap<i64, Testcase>,
    scenario_metainfo: Vec<(i64, String, String)>,
    testcase_metainfo: Vec<(i64, String, String)>,
    load_queues: BTreeMap<i64, StoredQueue>,
    summaries: BTreeMap<(i64, String), (i64, CheckpointAggregate)>,
    checkpoint_rows: Vec<CheckpointRow>,
    run_messages: Vec<(i64, Message)>,
    suite_messages: Vec<(i64, Message)>,
    testcase_messages: Vec<(i64, Message)>,
    stat_defs: BTreeMap<String, i64>,
    statistics: Vec<(i64, String, i64, f64)>,
    machine_info: BTreeMap<String, String>,
    counts: CallCounts,
    fail_next_flush: bool,
    connection_down: bool,
}

impl State {
    fn alloc(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn check_connected(&self) -> StoreResult<()> {
        if self.connection_down {
            Err(StoreError::Connection("store unreachable".into()))
        } else {
            Ok(())
        }
    }

    fn require_run(&self, run_id: i64) -> StoreResult<()> {
        if self.runs.contains_key(&run_id) {
            Ok(())
        } else {
            Err(StoreError::MissingParent {
                entity: "run",
                id: run_id,
            })
        }
    }

    fn require_suite(&self, suite_id: i64) -> StoreResult<()> {
        if self.suites.contains_key(&suite_id) {
            Ok(())
        } else {
            Err(StoreError::MissingParent {
                entity: "suite",
                id: suite_id,
            })
        }
    }

    fn require_testcase(&self, testcase_id: i64) -> StoreResult<()> {
        if self.testcases.contains_key(&testcase_id) {
            Ok(())
        } else {
            Err(StoreError::MissingParent {
                entity: "testcase",
                id: testcase_id,
            })
        }
    }

    fn require_queue(&self, load_queue_id: i64) -> StoreResult<()> {
        if self.load_queues.contains_key(&load_queue_id) {
            Ok(())
        } else {
            Err(StoreError::MissingParent {
                entity: "load queue",
                id: load_queue_id,
            })
        }
    }

    fn merge_summary(&mut self, agg: &CheckpointAggregate) -> StoreResult<i64> {
        self.require_queue(agg.load_queue_id)?;
        let key = (agg.load_queue_id, agg.name.clone());
        if let Some((id, existing)) = self.summaries.get_mut(&key) {
            existing.merge(agg);
            Ok(*id)
        } else {
            let id = self.alloc();
            self.summaries.insert(key, (id, agg.clone()));
            Ok(id)
        }
    }
}

/// In-memory test double for the persistence gateway.
#[derive(Clone, Default)]
pub struct MemoryGateway {
    state: Arc<Mutex<State>>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `flush_batch` fail with a backend error.
    pub fn fail_next_flush(&self) {
        self.lock().fail_next_flush = true;
    }

    /// Simulate the store being unreachable (`true`) or back up (`false`).
    pub fn set_connection_down(&self, down: bool) {
        self.lock().connection_down = down;
    }

    pub fn counts(&self) -> CallCounts {
        self.lock().counts
    }

    pub fn run(&self, run_id: i64) -> Option<Run> {
        self.lock().runs.get(&run_id).cloned()
    }

    pub fn testcase(&self, testcase_id: i64) -> Option<Testcase> {
        self.lock().testcases.get(&testcase_id).cloned()
    }

    pub fn run_message_texts(&self, run_id: i64) -> Vec<String> {
        self.lock()
            .run_messages
            .iter()
            .filter(|(id, _)| *id == run_id)
            .map(|(_, m)| m.text.clone())
            .collect()
    }

    pub fn suite_message_texts(&self, suite_id: i64) -> Vec<String> {
        self.lock()
            .suite_messages
            .iter()
            .filter(|(id, _)| *id == suite_id)
            .map(|(_, m)| m.text.clone())
            .collect()
    }

    pub fn testcase_message_texts(&self, testcase_id: i64) -> Vec<String> {
        self.lock()
            .testcase_messages
            .iter()
            .filter(|(id, _)| *id == testcase_id)
            .map(|(_, m)| m.text.clone())
            .collect()
    }

    pub fn summary(&self, load_queue_id: i64, name: &str) -> Option<CheckpointAggregate> {
        self.lock()
            .summaries
            .get(&(load_queue_id, name.to_owned()))
            .map(|(_, agg)| agg.clone())
    }

    pub fn checkpoint_row_count(&self) -> usize {
        self.lock().checkpoint_rows.len()
    }

    pub fn run_metainfo(&self, run_id: i64) -> Vec<(String, String)> {
        self.lock()
            .run_metainfo
            .iter()
            .filter(|(id, _, _)| *id == run_id)
            .map(|(_, k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn testcase_metainfo(&self, testcase_id: i64) -> Vec<(String, String)> {
        self.lock()
            .testcase_metainfo
            .iter()
            .filter(|(id, _, _)| *id == testcase_id)
            .map(|(_, k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn statistic_count(&self) -> usize {
        self.lock().statistics.len()
    }

    /// Remove a testcase and its children behind the processor's back.
    pub fn remove_testcase(&self, testcase_id: i64) {
        let mut state = self.lock();
        state.testcases.remove(&testcase_id);
        let queues: Vec<i64> = state
            .load_queues
            .iter()
            .filter(|(_, q)| q.testcase_id == testcase_id)
            .map(|(id, _)| *id)
            .collect();
        for queue_id in queues {
            state.load_queues.remove(&queue_id);
            state.summaries.retain(|(qid, _), _| *qid != queue_id);
        }
        state
            .testcase_messages
            .retain(|(id, _)| *id != testcase_id);
    }

    /// Remove a run row behind the processor's back.
    pub fn remove_run(&self, run_id: i64) {
        let mut state = self.lock();
        state.runs.remove(&run_id);
        state.run_messages.retain(|(id, _)| *id != run_id);
        let suites: Vec<i64> = state
            .suites
            .iter()
            .filter(|(_, (rid, _))| *rid == run_id)
            .map(|(id, _)| *id)
            .collect();
        for suite_id in suites {
            state.suites.remove(&suite_id);
        }
    }
}

#[async_trait]
impl PersistenceGateway for MemoryGateway {
    async fn run_sanity_check(&self) -> StoreResult<()> {
        let mut state = self.lock();
        state.check_connected()?;
        state.counts.sanity_checks += 1;
        Ok(())
    }

    async fn start_run(&self, run: &NewRun, timestamp: DateTime<Utc>) -> StoreResult<i64> {
        let mut state = self.lock();
        state.check_connected()?;
        let id = state.alloc();
        state.runs.insert(
            id,
            Run {
                id,
                name: run.name.clone(),
                os: run.os.clone(),
                product: run.product.clone(),
                version: run.version.clone(),
                build: run.build.clone(),
                host: run.host.clone(),
                user_note: String::new(),
                started_at: timestamp,
                ended_at: None,
            },
        );
        Ok(id)
    }

    async fn end_run(&self, run_id: i64, timestamp: DateTime<Utc>) -> StoreResult<()> {
        let mut state = self.lock();
        state.check_connected()?;
        state.require_run(run_id)?;
        if let Some(run) = state.runs.get_mut(&run_id) {
            run.ended_at = Some(timestamp);
        }
        Ok(())
    }

    async fn update_run(&self, run_id: i64, patch: &RunPatch) -> StoreResult<()> {
        let mut state = self.lock();
        state.check_connected()?;
        state.require_run(run_id)?;
        if let Some(run) = state.runs.get_mut(&run_id) {
            if let Some(name) = &patch.name {
                run.name = name.clone();
            }
            if let Some(os) = &patch.os {
                run.os = os.clone();
            }
            if let Some(product) = &patch.product {
                run.product = product.clone();
            }
            if let Some(version) = &patch.version {
                run.version = version.clone();
            }
            if let Some(build) = &patch.build {
                run.build = build.clone();
            }
            if let Some(host) = &patch.host {
                run.host = host.clone();
            }
            if let Some(user_note) = &patch.user_note {
                run.user_note = user_note.clone();
            }
        }
        Ok(())
    }

    async fn get_run(&self, run_id: i64) -> StoreResult<Run> {
        let state = self.lock();
        state.check_connected()?;
        state.runs.get(&run_id).cloned().ok_or(StoreError::NotFound {
            entity: "run",
            id: run_id,
        })
    }

    async fn add_run_metainfo(&self, run_id: i64, key: &str, value: &str) -> StoreResult<()> {
        let mut state = self.lock();
        state.check_connected()?;
        state.require_run(run_id)?;
        state
            .run_metainfo
            .push((run_id, key.to_owned(), value.to_owned()));
        Ok(())
    }

    async fn start_suite(
        &self,
        run_id: i64,
        name: &str,
        _package: &str,
        _timestamp: DateTime<Utc>,
    ) -> StoreResult<i64> {
        let mut state = self.lock();
        state.check_connected()?;
        state.require_run(run_id)?;
        let id = state.alloc();
        state.suites.insert(id, (run_id, name.to_owned()));
        Ok(id)
    }

    async fn end_suite(&self, suite_id: i64, _timestamp: DateTime<Utc>) -> StoreResult<()> {
        let state = self.lock();
        state.check_connected()?;
        state.require_suite(suite_id)
    }

    async fn update_suite(
        &self,
        suite_id: i64,
        name: Option<&str>,
        _user_note: Option<&str>,
    ) -> StoreResult<()> {
        let mut state = self.lock();
        state.check_connected()?;
        state.require_suite(suite_id)?;
        if let (Some(name), Some((_, stored))) = (name, state.suites.get_mut(&suite_id)) {
            *stored = name.to_owned();
        }
        Ok(())
    }

    async fn start_testcase(
        &self,
        suite_id: i64,
        scenario_name: &str,
        scenario_description: &str,
        name: &str,
        timestamp: DateTime<Utc>,
    ) -> StoreResult<i64> {
        let mut state = self.lock();
        state.check_connected()?;
        state.require_suite(suite_id)?;
        let id = state.alloc();
        state.testcases.insert(
            id,
            Testcase {
                id,
                suite_id,
                scenario_name: scenario_name.to_owned(),
                scenario_description: scenario_description.to_owned(),
                name: name.to_owned(),
                result: TestcaseResult::Running,
                started_at: timestamp,
                ended_at: None,
            },
        );
        Ok(id)
    }

    async fn end_testcase(
        &self,
        testcase_id: i64,
        result: TestcaseResult,
        timestamp: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut state = self.lock();
        state.check_connected()?;
        state.require_testcase(testcase_id)?;
        if let Some(tc) = state.testcases.get_mut(&testcase_id) {
            tc.result = result;
            tc.ended_at = Some(timestamp);
        }
        Ok(())
    }

    async fn update_testcase(
        &self,
        testcase_id: i64,
        patch: &TestcasePatch,
        _timestamp: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut state = self.lock();
        state.check_connected()?;
        state.require_testcase(testcase_id)?;
        if let Some(tc) = state.testcases.get_mut(&testcase_id) {
            if let Some(scenario_name) = &patch.scenario_name {
                tc.scenario_name = scenario_name.clone();
            }
            if let Some(desc) = &patch.scenario_description {
                tc.scenario_description = desc.clone();
            }
            if let Some(name) = &patch.name {
                tc.name = name.clone();
            }
        }
        Ok(())
    }

    async fn delete_testcase(&self, testcase_id: i64) -> StoreResult<()> {
        self.lock().check_connected()?;
        self.remove_testcase(testcase_id);
        Ok(())
    }

    async fn add_scenario_metainfo(
        &self,
        testcase_id: i64,
        key: &str,
        value: &str,
    ) -> StoreResult<()> {
        let mut state = self.lock();
        state.check_connected()?;
        state.require_testcase(testcase_id)?;
        state
            .scenario_metainfo
            .push((testcase_id, key.to_owned(), value.to_owned()));
        Ok(())
    }

    async fn clear_scenario_metainfo(&self, testcase_id: i64) -> StoreResult<()> {
        let mut state = self.lock();
        state.check_connected()?;
        state.require_testcase(testcase_id)?;
        state.scenario_metainfo.retain(|(id, _, _)| *id != testcase_id);
        Ok(())
    }

    async fn add_testcase_metainfo(
        &self,
        testcase_id: i64,
        key: &str,
        value: &str,
    ) -> StoreResult<()> {
        let mut state = self.lock();
        state.check_connected()?;
        state.require_testcase(testcase_id)?;
        state
            .testcase_metainfo
            .push((testcase_id, key.to_owned(), value.to_owned()));
        Ok(())
    }

    async fn start_load_queue(
        &self,
        queue: &NewLoadQueue,
        _timestamp: DateTime<Utc>,
    ) -> StoreResult<i64> {
        let mut state = self.lock();
        state.check_connected()?;
        state.require_testcase(queue.testcase_id)?;
        let id = state.alloc();
        state.load_queues.insert(
            id,
            StoredQueue {
                testcase_id: queue.testcase_id,
                name: queue.name.clone(),
                result: None,
            },
        );
        Ok(id)
    }

    async fn end_load_queue(
        &self,
        load_queue_id: i64,
        result: LoadQueueResult,
        _timestamp: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut state = self.lock();
        state.check_connected()?;
        state.require_queue(load_queue_id)?;
        if let Some(queue) = state.load_queues.get_mut(&load_queue_id) {
            queue.result = Some(result);
        }
        Ok(())
    }

    async fn start_checkpoint(
        &self,
        load_queue_id: i64,
        name: &str,
        transfer_unit: &str,
        detail: CheckpointDetail,
        timestamp: DateTime<Utc>,
    ) -> StoreResult<CheckpointInfo> {
        let mut state = self.lock();
        state.check_connected()?;
        state.require_queue(load_queue_id)?;
        let summary_id =
            state.merge_summary(&CheckpointAggregate::new(load_queue_id, name, transfer_unit))?;
        let checkpoint_id = if detail == CheckpointDetail::Full {
            state.alloc()
        } else {
            0
        };
        Ok(CheckpointInfo {
            name: name.to_owned(),
            summary_id,
            checkpoint_id,
            started_at: timestamp,
        })
    }

    async fn end_checkpoint(
        &self,
        info: &CheckpointInfo,
        response_time_ms: i64,
        transfer_size: i64,
        result: CheckpointResult,
        detail: CheckpointDetail,
        timestamp: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut state = self.lock();
        state.check_connected()?;
        let key = state
            .summaries
            .iter()
            .find(|(_, (id, _))| *id == info.summary_id)
            .map(|(key, _)| key.clone())
            .ok_or(StoreError::MissingParent {
                entity: "checkpoint summary",
                id: info.summary_id,
            })?;

        let rate = if response_time_ms > 0 {
            transfer_size as f64 * 1000.0 / response_time_ms as f64
        } else {
            0.0
        };
        let mut agg = CheckpointAggregate::new(key.0, &info.name, "");
        agg.record(result, response_time_ms, rate);
        state.merge_summary(&agg)?;

        if detail == CheckpointDetail::Full {
            state.counts.checkpoints += 1;
            state.checkpoint_rows.push(CheckpointRow {
                load_queue_id: key.0,
                name: info.name.clone(),
                response_time_ms,
                transfer_size,
                transfer_unit: String::new(),
                result,
                ended_at: timestamp,
            });
        }
        Ok(())
    }

    async fn insert_checkpoint(
        &self,
        row: &CheckpointRow,
        detail: CheckpointDetail,
    ) -> StoreResult<()> {
        let mut state = self.lock();
        state.check_connected()?;
        state.require_queue(row.load_queue_id)?;
        let rate = if row.response_time_ms > 0 {
            row.transfer_size as f64 * 1000.0 / row.response_time_ms as f64
        } else {
            0.0
        };
        let mut agg = CheckpointAggregate::new(row.load_queue_id, &row.name, &row.transfer_unit);
        agg.record(row.result, row.response_time_ms, rate);
        state.merge_summary(&agg)?;
        if detail == CheckpointDetail::Full {
            state.counts.checkpoints += 1;
            state.checkpoint_rows.push(row.clone());
        }
        Ok(())
    }

    async fn update_checkpoint_summaries(
        &self,
        aggregates: &[CheckpointAggregate],
    ) -> StoreResult<()> {
        let mut state = self.lock();
        state.check_connected()?;
        for agg in aggregates {
            state.merge_summary(agg)?;
        }
        state.counts.summary_updates += 1;
        Ok(())
    }

    async fn insert_run_message(&self, run_id: i64, message: &Message) -> StoreResult<()> {
        let mut state = self.lock();
        state.check_connected()?;
        state.require_run(run_id)?;
        state.run_messages.push((run_id, message.clone()));
        state.counts.run_messages += 1;
        Ok(())
    }

    async fn insert_suite_message(&self, suite_id: i64, message: &Message) -> StoreResult<()> {
        let mut state = self.lock();
        state.check_connected()?;
        state.require_suite(suite_id)?;
        state.suite_messages.push((suite_id, message.clone()));
        state.counts.suite_messages += 1;
        Ok(())
    }

    async fn insert_testcase_message(
        &self,
        testcase_id: i64,
        message: &Message,
    ) -> StoreResult<()> {
        let mut state = self.lock();
        state.check_connected()?;
        state.require_testcase(testcase_id)?;
        state.testcase_messages.push((testcase_id, message.clone()));
        state.counts.testcase_messages += 1;
        Ok(())
    }

    async fn register_statistic_definition(&self, def: &StatisticDefinition) -> StoreResult<i64> {
        let mut state = self.lock();
        state.check_connected()?;
        let key = format!(
            "{}|{}|{}|{}|{}",
            def.name, def.parent_name, def.internal_name, def.unit, def.params
        );
        if let Some(id) = state.stat_defs.get(&key) {
            return Ok(*id);
        }
        let id = state.alloc();
        state.stat_defs.insert(key, id);
        Ok(id)
    }

    async fn insert_system_statistics(
        &self,
        testcase_id: i64,
        sample: &StatisticSample,
    ) -> StoreResult<()> {
        let mut state = self.lock();
        state.check_connected()?;
        state.require_testcase(testcase_id)?;
        for (def_id, value) in sample.definition_ids.iter().zip(sample.values.iter()) {
            state
                .statistics
                .push((testcase_id, "system".into(), *def_id, *value));
        }
        state.counts.statistics += 1;
        Ok(())
    }

    async fn insert_user_activity_statistics(
        &self,
        testcase_id: i64,
        sample: &StatisticSample,
    ) -> StoreResult<()> {
        let mut state = self.lock();
        state.check_connected()?;
        state.require_testcase(testcase_id)?;
        for (def_id, value) in sample.definition_ids.iter().zip(sample.values.iter()) {
            state
                .statistics
                .push((testcase_id, "user_activity".into(), *def_id, *value));
        }
        state.counts.statistics += 1;
        Ok(())
    }

    async fn update_machine_info(&self, machine: &str, info: &str) -> StoreResult<()> {
        let mut state = self.lock();
        state.check_connected()?;
        state
            .machine_info
            .insert(machine.to_owned(), info.to_owned());
        Ok(())
    }

    async fn is_run_present(&self, run_id: i64) -> StoreResult<bool> {
        let state = self.lock();
        state.check_connected()?;
        Ok(state.runs.contains_key(&run_id))
    }

    async fn is_suite_present(&self, suite_id: i64) -> StoreResult<bool> {
        let state = self.lock();
        state.check_connected()?;
        Ok(state.suites.contains_key(&suite_id))
    }

    async fn is_testcase_present(&self, testcase_id: i64) -> StoreResult<bool> {
        let state = self.lock();
        state.check_connected()?;
        Ok(state.testcases.contains_key(&testcase_id))
    }

    async fn flush_batch(&self, batch: WriteBatch) -> StoreResult<()> {
        let mut state = self.lock();
        state.check_connected()?;
        if state.fail_next_flush {
            state.fail_next_flush = false;
            return Err(StoreError::Backend("simulated flush failure".into()));
        }

        // Validate the whole batch first: a failed batch lands nothing.
        for (run_id, _) in &batch.run_messages {
            state.require_run(*run_id)?;
        }
        for (suite_id, _) in &batch.suite_messages {
            state.require_suite(*suite_id)?;
        }
        for (testcase_id, _) in &batch.testcase_messages {
            state.require_testcase(*testcase_id)?;
        }
        for row in &batch.checkpoints {
            state.require_queue(row.load_queue_id)?;
        }

        state.counts.run_messages += batch.run_messages.len();
        state.counts.suite_messages += batch.suite_messages.len();
        state.counts.testcase_messages += batch.testcase_messages.len();
        state.counts.checkpoints += batch.checkpoints.len();
        state.run_messages.extend(batch.run_messages);
        state.suite_messages.extend(batch.suite_messages);
        state.testcase_messages.extend(batch.testcase_messages);
        for row in batch.checkpoints {
            let rate = if row.response_time_ms > 0 {
                row.transfer_size as f64 * 1000.0 / row.response_time_ms as f64
            } else {
                0.0
            };
            let mut agg =
                CheckpointAggregate::new(row.load_queue_id, &row.name, &row.transfer_unit);
            agg.record(row.result, row.response_time_ms, rate);
            state.merge_summary(&agg)?;
            state.checkpoint_rows.push(row);
        }
        state.counts.batches_flushed += 1;
        Ok(())
    }
}
