//! Event processor: replays telemetry events against the persistence
//! gateway, owning the lifecycle state machine, the checkpoint registry,
//! the write caches, and the graceful-degradation bookkeeping for
//! entities deleted behind the pipeline's back.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn, Level};

use testpulse_observability::{emit_event, ObservabilityEvent, ProcessKind};
use testpulse_store::{CheckpointRow, NewRun, PersistenceGateway, StoreError};
use testpulse_types::{
    CheckpointDetail, CheckpointResult, EventKind, EventRequest, LoadQueueResult, Message,
    MessageLevel, RunPatch, StatisticSample, TelemetryEvent, TestcasePatch, TestcaseResult,
    TestcaseState,
};

use crate::cache::{BatchedWriteCache, CheckpointSummaryCache};
use crate::config::DbLogConfig;
use crate::error::{ProcessingError, ProcessingResult};
use crate::lifecycle::{LifecyclePhase, LifecycleState};
use crate::registry::CheckpointRegistry;

/// Callbacks for producers blocked on lifecycle milestones.
pub trait LifecycleListener: Send + Sync {
    fn on_run_started(&self, _run_id: i64) {}
    fn on_run_finished(&self) {}
    fn on_testcase_started(&self, _testcase_id: i64) {}
    fn on_testcase_finished(&self) {}
}

fn obs(event: &str) -> ObservabilityEvent<'_> {
    ObservabilityEvent {
        event,
        component: "processor",
        run_id: None,
        suite_id: None,
        testcase_id: None,
        queue: None,
        thread: None,
        status: None,
        error_code: None,
        detail: None,
    }
}

/// Replays [`EventRequest`]s, one at a time, against the gateway.
pub struct EventProcessor {
    config: DbLogConfig,
    gateway: Arc<dyn PersistenceGateway>,
    registry: Arc<CheckpointRegistry>,
    lifecycle: LifecycleState,
    cache: Option<BatchedWriteCache>,
    summary_cache: Option<CheckpointSummaryCache>,
    listener: Option<Arc<dyn LifecycleListener>>,
    /// Suite rows already created this run, keyed by `(run id, name)`.
    /// A suite name repeating within a run reuses its row.
    suite_ids: HashMap<(i64, String), i64>,
    deleted_runs: HashSet<i64>,
    deleted_suites: HashSet<i64>,
    deleted_testcases: HashSet<i64>,
    /// Testcase id another thread asked us to delete; 0 means none.
    delete_request: Arc<AtomicI64>,
    pending_run_patch: Option<RunPatch>,
    pending_suite_update: Option<(Option<String>, Option<String>)>,
    sanity_done: bool,
}

impl EventProcessor {
    pub fn new(
        config: DbLogConfig,
        gateway: Arc<dyn PersistenceGateway>,
        registry: Arc<CheckpointRegistry>,
        listener: Option<Arc<dyn LifecycleListener>>,
        delete_request: Arc<AtomicI64>,
    ) -> Self {
        let (cache, summary_cache) = if config.batch_mode {
            (
                Some(BatchedWriteCache::new(
                    config.chunk_size,
                    config.max_cache_age(),
                    config.monitor_cache,
                )),
                Some(CheckpointSummaryCache::new(
                    config.chunk_size,
                    config.max_cache_age(),
                )),
            )
        } else {
            (None, None)
        };
        Self {
            config,
            gateway,
            registry,
            lifecycle: LifecycleState::new(),
            cache,
            summary_cache,
            listener,
            suite_ids: HashMap::new(),
            deleted_runs: HashSet::new(),
            deleted_suites: HashSet::new(),
            deleted_testcases: HashSet::new(),
            delete_request,
            pending_run_patch: None,
            pending_suite_update: None,
            sanity_done: false,
        }
    }

    pub fn state(&self) -> &LifecycleState {
        &self.lifecycle
    }

    pub fn registry(&self) -> &Arc<CheckpointRegistry> {
        &self.registry
    }

    /// Process one request, or `None` for an idle tick (batch mode's
    /// poll timeout), which flushes whatever the caches hold.
    pub async fn process(&mut self, request: Option<EventRequest>) -> ProcessingResult<()> {
        self.promote_pending_deletion().await?;

        let Some(request) = request else {
            return self.flush_caches().await;
        };

        let kind = request.event.kind();
        self.lifecycle.check_admissible(kind)?;

        // Non-batchable events observe every cached row for the open
        // testcase, so force those rows down first.
        if self.config.batch_mode
            && !request.event.is_batchable()
            && self.lifecycle.phase() == LifecyclePhase::TestcaseStarted
        {
            self.flush_caches().await?;
        }

        self.dispatch(request).await
    }

    /// Flush both caches; called on idle ticks and at shutdown.
    pub async fn flush_caches(&mut self) -> ProcessingResult<()> {
        let gateway = Arc::clone(&self.gateway);
        if let Some(cache) = self.cache.as_mut() {
            cache.flush(gateway.as_ref()).await?;
        }
        if let Some(summary) = self.summary_cache.as_mut() {
            summary.flush(gateway.as_ref()).await?;
        }
        Ok(())
    }

    async fn promote_pending_deletion(&mut self) -> ProcessingResult<()> {
        let testcase_id = self.delete_request.swap(0, Ordering::AcqRel);
        if testcase_id == 0 {
            return Ok(());
        }
        // Cached rows may reference the doomed testcase.
        self.flush_caches().await?;
        self.gateway.delete_testcase(testcase_id).await?;
        self.deleted_testcases.insert(testcase_id);
        emit_event(
            Level::INFO,
            ProcessKind::Executor,
            ObservabilityEvent {
                testcase_id: Some(testcase_id),
                status: Some("deleted"),
                ..obs("testcase.delete")
            },
        );
        Ok(())
    }

    async fn dispatch(&mut self, request: EventRequest) -> ProcessingResult<()> {
        let EventRequest {
            event,
            timestamp,
            thread_name,
        } = request;
        match event {
            TelemetryEvent::StartRun {
                name,
                os,
                product,
                version,
                build,
                host,
            } => {
                self.handle_start_run(
                    NewRun {
                        name,
                        os,
                        product,
                        version,
                        build,
                        host,
                    },
                    timestamp,
                )
                .await
            }
            TelemetryEvent::EndRun => self.handle_end_run(timestamp).await,
            TelemetryEvent::UpdateRun(patch) => self.handle_update_run(patch).await,
            TelemetryEvent::AddRunMetainfo { key, value } => {
                self.handle_add_run_metainfo(&key, &value).await
            }
            TelemetryEvent::StartSuite { name, package } => {
                self.handle_start_suite(&name, &package, timestamp).await
            }
            TelemetryEvent::EndSuite => self.handle_end_suite(timestamp).await,
            TelemetryEvent::UpdateSuite { name, user_note } => {
                self.handle_update_suite(name, user_note).await
            }
            TelemetryEvent::StartTestcase {
                suite_name,
                scenario_name,
                scenario_description,
                name,
            } => {
                self.handle_start_testcase(
                    &suite_name,
                    &scenario_name,
                    &scenario_description,
                    &name,
                    timestamp,
                )
                .await
            }
            TelemetryEvent::EndTestcase { result } => {
                self.handle_end_testcase(result, timestamp).await
            }
            TelemetryEvent::UpdateTestcase(patch) => {
                self.handle_update_testcase(patch, timestamp).await
            }
            TelemetryEvent::JoinTestcase(state) => self.handle_join_testcase(state).await,
            TelemetryEvent::LeaveTestcase => {
                self.registry.clear();
                self.lifecycle.left();
                Ok(())
            }
            TelemetryEvent::AddScenarioMetainfo { key, value } => {
                self.handle_scenario_metainfo(Some((key, value))).await
            }
            TelemetryEvent::ClearScenarioMetainfo => self.handle_scenario_metainfo(None).await,
            TelemetryEvent::AddTestcaseMetainfo {
                testcase_id,
                key,
                value,
            } => self.handle_testcase_metainfo(testcase_id, &key, &value).await,
            TelemetryEvent::StartAfterSuite => {
                self.lifecycle.set_after_suite(true);
                Ok(())
            }
            TelemetryEvent::EndAfterSuite => {
                self.lifecycle.set_after_suite(false);
                Ok(())
            }
            TelemetryEvent::StartAfterClass => {
                self.lifecycle.set_after_class(true);
                Ok(())
            }
            TelemetryEvent::EndAfterClass => {
                self.lifecycle.set_after_class(false);
                Ok(())
            }
            TelemetryEvent::StartAfterMethod => {
                self.lifecycle.set_after_method(true);
                Ok(())
            }
            TelemetryEvent::EndAfterMethod => {
                self.lifecycle.set_after_method(false);
                Ok(())
            }
            TelemetryEvent::RememberLoadQueue {
                name,
                load_queue_id,
            } => {
                self.registry.add_load_queue(&name, load_queue_id)?;
                Ok(())
            }
            TelemetryEvent::CleanupLoadQueue { name } => {
                self.registry.remove_load_queue(&name)?;
                Ok(())
            }
            TelemetryEvent::EndLoadQueue { name, result } => {
                self.handle_end_load_queue(&name, result, timestamp).await
            }
            TelemetryEvent::RegisterThreadWithLoadQueue { load_queue_name } => {
                self.registry.register_thread(&thread_name, &load_queue_name)?;
                Ok(())
            }
            TelemetryEvent::StartCheckpoint {
                name,
                transfer_unit,
            } => {
                self.handle_start_checkpoint(&thread_name, &name, &transfer_unit, timestamp)
                    .await
            }
            TelemetryEvent::EndCheckpoint {
                name,
                transfer_size,
                result,
            } => {
                self.handle_end_checkpoint(&thread_name, &name, transfer_size, result, timestamp)
                    .await
            }
            TelemetryEvent::InsertCheckpoint {
                name,
                response_time_ms,
                transfer_size,
                transfer_unit,
                result,
            } => {
                self.handle_insert_checkpoint(
                    &thread_name,
                    &name,
                    response_time_ms,
                    transfer_size,
                    &transfer_unit,
                    result,
                    timestamp,
                )
                .await
            }
            TelemetryEvent::InsertSystemStatistic(sample) => {
                self.handle_statistics(sample, true).await
            }
            TelemetryEvent::InsertUserActivityStatistic(sample) => {
                self.handle_statistics(sample, false).await
            }
            TelemetryEvent::InsertMessage {
                text,
                level,
                escape_html,
                is_run_message,
            } => {
                let message = Message {
                    text,
                    level,
                    escape_html,
                    machine: self.config.machine.clone(),
                    thread_name,
                    timestamp,
                };
                self.handle_insert_message(message, is_run_message).await
            }
        }
    }

    // -- run handlers ----------------------------------------------------

    async fn handle_start_run(
        &mut self,
        run: NewRun,
        timestamp: DateTime<Utc>,
    ) -> ProcessingResult<()> {
        if !self.sanity_done {
            self.gateway.run_sanity_check().await?;
            // Sanity traffic must never ride along with real rows.
            if let Some(cache) = self.cache.as_mut() {
                cache.reset();
            }
            if let Some(summary) = self.summary_cache.as_mut() {
                summary.reset();
            }
            self.sanity_done = true;
        }

        let run_id = self.gateway.start_run(&run, timestamp).await?;
        self.suite_ids.clear();
        self.lifecycle.run_started(run_id);

        if let Some(patch) = self.pending_run_patch.clone() {
            if let Err(e) = self.apply_run_patch(patch).await {
                warn!(run_id, error = %e, "could not apply pending run update");
            }
        }

        emit_event(
            Level::INFO,
            ProcessKind::Executor,
            ObservabilityEvent {
                run_id: Some(run_id),
                status: Some("started"),
                detail: Some(&run.name),
                ..obs("run.start")
            },
        );
        if let Some(listener) = &self.listener {
            listener.on_run_started(run_id);
        }
        Ok(())
    }

    async fn handle_end_run(&mut self, timestamp: DateTime<Utc>) -> ProcessingResult<()> {
        self.flush_caches().await?;
        let run_id = self.lifecycle.run_id();

        let result = if self.deleted_runs.contains(&run_id) {
            Ok(())
        } else {
            match self.gateway.end_run(run_id, timestamp).await {
                Ok(()) => Ok(()),
                Err(e) => self.suppress_missing_run(e.into(), run_id).await,
            }
        };

        // The session leaves the run even if the final write failed.
        self.lifecycle.run_ended();
        emit_event(
            Level::INFO,
            ProcessKind::Executor,
            ObservabilityEvent {
                run_id: Some(run_id),
                status: Some("ended"),
                ..obs("run.end")
            },
        );
        if let Some(listener) = &self.listener {
            listener.on_run_finished();
        }
        result
    }

    async fn handle_update_run(&mut self, patch: RunPatch) -> ProcessingResult<()> {
        // Keep the latest user-provided patch; a run started later (or a
        // rejoined one) still receives it.
        self.pending_run_patch = Some(patch.clone());
        if self.lifecycle.phase() == LifecyclePhase::Initialized {
            debug!("run update parked until a run starts");
            return Ok(());
        }
        self.apply_run_patch(patch).await
    }

    /// Backfill unset patch fields from the persisted row, so a partial
    /// update never blanks columns another writer already filled.
    async fn apply_run_patch(&mut self, patch: RunPatch) -> ProcessingResult<()> {
        let run_id = self.lifecycle.run_id();
        if self.deleted_runs.contains(&run_id) {
            return Ok(());
        }
        let persisted = match self.gateway.get_run(run_id).await {
            Ok(run) => run,
            Err(StoreError::NotFound { .. }) => {
                return self
                    .suppress_missing_run(
                        ProcessingError::Store(StoreError::MissingParent {
                            entity: "run",
                            id: run_id,
                        }),
                        run_id,
                    )
                    .await;
            }
            Err(e) => return Err(e.into()),
        };
        let full = patch.backfill(&persisted);
        match self.gateway.update_run(run_id, &full).await {
            Ok(()) => Ok(()),
            Err(e) => self.suppress_missing_run(e.into(), run_id).await,
        }
    }

    async fn handle_add_run_metainfo(&mut self, key: &str, value: &str) -> ProcessingResult<()> {
        let run_id = self.lifecycle.run_id();
        if self.deleted_runs.contains(&run_id) {
            return Ok(());
        }
        match self.gateway.add_run_metainfo(run_id, key, value).await {
            Ok(()) => Ok(()),
            Err(e) => self.suppress_missing_run(e.into(), run_id).await,
        }
    }

    // -- suite handlers --------------------------------------------------

    async fn handle_start_suite(
        &mut self,
        name: &str,
        package: &str,
        timestamp: DateTime<Utc>,
    ) -> ProcessingResult<()> {
        let run_id = self.lifecycle.run_id();
        let key = (run_id, name.to_owned());
        let suite_id = if let Some(&existing) = self.suite_ids.get(&key) {
            debug!(suite_id = existing, name, "reusing suite row");
            existing
        } else {
            let id = self
                .gateway
                .start_suite(run_id, name, package, timestamp)
                .await?;
            self.suite_ids.insert(key, id);
            id
        };
        self.lifecycle.suite_started(suite_id);

        if let Some((new_name, user_note)) = self.pending_suite_update.take() {
            if let Err(e) = self
                .gateway
                .update_suite(suite_id, new_name.as_deref(), user_note.as_deref())
                .await
            {
                warn!(suite_id, error = %e, "could not apply pending suite update");
            }
        }
        Ok(())
    }

    async fn handle_end_suite(&mut self, timestamp: DateTime<Utc>) -> ProcessingResult<()> {
        let suite_id = self.lifecycle.suite_id();
        let result = if self.deleted_suites.contains(&suite_id) {
            Ok(())
        } else {
            match self.gateway.end_suite(suite_id, timestamp).await {
                Ok(()) => Ok(()),
                Err(e) => self.suppress_missing_suite(e.into(), suite_id).await,
            }
        };
        self.lifecycle.suite_ended();
        result
    }

    async fn handle_update_suite(
        &mut self,
        name: Option<String>,
        user_note: Option<String>,
    ) -> ProcessingResult<()> {
        let suite_id = self.lifecycle.suite_id();
        if suite_id == 0 {
            // Raised before its suite started; apply when it does.
            self.pending_suite_update = Some((name, user_note));
            debug!("suite update parked until a suite starts");
            return Ok(());
        }
        if self.deleted_suites.contains(&suite_id) {
            return Ok(());
        }
        match self
            .gateway
            .update_suite(suite_id, name.as_deref(), user_note.as_deref())
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => self.suppress_missing_suite(e.into(), suite_id).await,
        }
    }

    // -- testcase handlers -----------------------------------------------

    async fn handle_start_testcase(
        &mut self,
        suite_name: &str,
        scenario_name: &str,
        scenario_description: &str,
        name: &str,
        timestamp: DateTime<Utc>,
    ) -> ProcessingResult<()> {
        let run_id = self.lifecycle.run_id();
        let suite_id = self
            .suite_ids
            .get(&(run_id, suite_name.to_owned()))
            .copied()
            .unwrap_or_else(|| self.lifecycle.suite_id());

        let testcase_id = self
            .gateway
            .start_testcase(suite_id, scenario_name, scenario_description, name, timestamp)
            .await?;
        self.lifecycle.testcase_started(testcase_id);

        emit_event(
            Level::INFO,
            ProcessKind::Executor,
            ObservabilityEvent {
                run_id: Some(run_id),
                suite_id: Some(suite_id),
                testcase_id: Some(testcase_id),
                status: Some("started"),
                detail: Some(name),
                ..obs("testcase.start")
            },
        );
        if let Some(listener) = &self.listener {
            listener.on_testcase_started(testcase_id);
        }
        Ok(())
    }

    async fn handle_end_testcase(
        &mut self,
        result: TestcaseResult,
        timestamp: DateTime<Utc>,
    ) -> ProcessingResult<()> {
        self.flush_caches().await?;
        let testcase_id = self.lifecycle.testcase_id();

        let outcome = if self.deleted_testcases.contains(&testcase_id) {
            Ok(())
        } else {
            match self.gateway.end_testcase(testcase_id, result, timestamp).await {
                Ok(()) => Ok(()),
                Err(e) => self.suppress_missing_testcase(e.into(), testcase_id).await,
            }
        };

        // Registry and lifecycle leave the testcase even on error.
        self.registry.clear();
        self.lifecycle.testcase_ended();
        emit_event(
            Level::INFO,
            ProcessKind::Executor,
            ObservabilityEvent {
                testcase_id: Some(testcase_id),
                status: Some(match result {
                    TestcaseResult::Passed => "passed",
                    TestcaseResult::Failed => "failed",
                    TestcaseResult::Skipped => "skipped",
                    TestcaseResult::Running => "running",
                }),
                ..obs("testcase.end")
            },
        );
        if let Some(listener) = &self.listener {
            listener.on_testcase_finished();
        }
        outcome
    }

    async fn handle_update_testcase(
        &mut self,
        patch: TestcasePatch,
        timestamp: DateTime<Utc>,
    ) -> ProcessingResult<()> {
        let testcase_id = if self.lifecycle.phase() == LifecyclePhase::TestcaseStarted {
            self.lifecycle.testcase_id()
        } else {
            self.lifecycle.last_executed_testcase_id()
        };
        if self.deleted_testcases.contains(&testcase_id) {
            return Ok(());
        }
        match self
            .gateway
            .update_testcase(testcase_id, &patch, timestamp)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => self.suppress_missing_testcase(e.into(), testcase_id).await,
        }
    }

    async fn handle_join_testcase(&mut self, state: TestcaseState) -> ProcessingResult<()> {
        if !self.gateway.is_testcase_present(state.testcase_id).await? {
            return Err(StoreError::MissingParent {
                entity: "testcase",
                id: state.testcase_id,
            }
            .into());
        }
        self.lifecycle.joined(state);
        debug!(testcase_id = state.testcase_id, "joined running testcase");
        Ok(())
    }

    async fn handle_scenario_metainfo(
        &mut self,
        entry: Option<(String, String)>,
    ) -> ProcessingResult<()> {
        let testcase_id = self.lifecycle.testcase_id();
        if self.deleted_testcases.contains(&testcase_id) {
            return Ok(());
        }
        let result = match &entry {
            Some((key, value)) => {
                self.gateway
                    .add_scenario_metainfo(testcase_id, key, value)
                    .await
            }
            None => self.gateway.clear_scenario_metainfo(testcase_id).await,
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) => self.suppress_missing_testcase(e.into(), testcase_id).await,
        }
    }

    async fn handle_testcase_metainfo(
        &mut self,
        explicit_id: Option<i64>,
        key: &str,
        value: &str,
    ) -> ProcessingResult<()> {
        let testcase_id = match explicit_id {
            Some(id) => id,
            None if self.lifecycle.phase() == LifecyclePhase::TestcaseStarted => {
                self.lifecycle.testcase_id()
            }
            None if self.lifecycle.in_after_method()
                && self.lifecycle.last_executed_testcase_id() != 0 =>
            {
                self.lifecycle.last_executed_testcase_id()
            }
            None => {
                return Err(ProcessingError::PhaseViolation {
                    event: EventKind::AddTestcaseMetainfo,
                    phase: self.lifecycle.phase(),
                    expected: "testcase started (or after-method mode)",
                })
            }
        };
        if self.deleted_testcases.contains(&testcase_id) {
            return Ok(());
        }
        match self
            .gateway
            .add_testcase_metainfo(testcase_id, key, value)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => self.suppress_missing_testcase(e.into(), testcase_id).await,
        }
    }

    // -- load queue and checkpoint handlers -----------------------------

    async fn handle_end_load_queue(
        &mut self,
        name: &str,
        result: LoadQueueResult,
        timestamp: DateTime<Utc>,
    ) -> ProcessingResult<()> {
        let load_queue_id = self.registry.remove_load_queue(name)?;
        let testcase_id = self.lifecycle.testcase_id();
        if self.deleted_testcases.contains(&testcase_id) {
            return Ok(());
        }
        match self
            .gateway
            .end_load_queue(load_queue_id, result, timestamp)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => self.suppress_missing_testcase(e.into(), testcase_id).await,
        }
    }

    async fn handle_start_checkpoint(
        &mut self,
        thread: &str,
        name: &str,
        transfer_unit: &str,
        timestamp: DateTime<Utc>,
    ) -> ProcessingResult<()> {
        if !self.config.enable_checkpoints {
            return Ok(());
        }
        let testcase_id = self.lifecycle.testcase_id();
        if self.deleted_testcases.contains(&testcase_id) {
            return Ok(());
        }
        let load_queue_id = self.registry.load_queue_for_thread(thread)?;
        let info = match self
            .gateway
            .start_checkpoint(
                load_queue_id,
                name,
                transfer_unit,
                self.config.checkpoint_detail,
                timestamp,
            )
            .await
        {
            Ok(info) => info,
            Err(e) => return self.suppress_missing_testcase(e.into(), testcase_id).await,
        };
        self.registry.start_checkpoint(thread, info)?;
        Ok(())
    }

    async fn handle_end_checkpoint(
        &mut self,
        thread: &str,
        name: &str,
        transfer_size: i64,
        result: CheckpointResult,
        timestamp: DateTime<Utc>,
    ) -> ProcessingResult<()> {
        if !self.config.enable_checkpoints {
            return Ok(());
        }
        let testcase_id = self.lifecycle.testcase_id();
        if self.deleted_testcases.contains(&testcase_id) {
            return Ok(());
        }
        let info = self.registry.end_checkpoint(thread, name)?;
        let response_time_ms = (timestamp - info.started_at).num_milliseconds().max(0);
        match self
            .gateway
            .end_checkpoint(
                &info,
                response_time_ms,
                transfer_size,
                result,
                self.config.checkpoint_detail,
                timestamp,
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => self.suppress_missing_testcase(e.into(), testcase_id).await,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_insert_checkpoint(
        &mut self,
        thread: &str,
        name: &str,
        response_time_ms: i64,
        transfer_size: i64,
        transfer_unit: &str,
        result: CheckpointResult,
        timestamp: DateTime<Utc>,
    ) -> ProcessingResult<()> {
        if !self.config.enable_checkpoints {
            return Ok(());
        }
        let testcase_id = self.lifecycle.testcase_id();
        if self.deleted_testcases.contains(&testcase_id) {
            return Ok(());
        }
        let load_queue_id = self.registry.load_queue_for_thread(thread)?;
        let transfer_rate = if response_time_ms > 0 {
            transfer_size as f64 * 1000.0 / response_time_ms as f64
        } else {
            0.0
        };

        if self.config.batch_mode {
            let mut flush = false;
            if let Some(summary) = self.summary_cache.as_mut() {
                flush |= summary.add(
                    load_queue_id,
                    name,
                    transfer_unit,
                    result,
                    response_time_ms,
                    transfer_rate,
                );
            }
            if self.config.checkpoint_detail == CheckpointDetail::Full {
                if let Some(cache) = self.cache.as_mut() {
                    flush |= cache.add_checkpoint(CheckpointRow {
                        load_queue_id,
                        name: name.to_owned(),
                        response_time_ms,
                        transfer_size,
                        transfer_unit: transfer_unit.to_owned(),
                        result,
                        ended_at: timestamp,
                    });
                }
            }
            if flush {
                self.flush_caches().await?;
            }
            return Ok(());
        }

        let row = CheckpointRow {
            load_queue_id,
            name: name.to_owned(),
            response_time_ms,
            transfer_size,
            transfer_unit: transfer_unit.to_owned(),
            result,
            ended_at: timestamp,
        };
        match self
            .gateway
            .insert_checkpoint(&row, self.config.checkpoint_detail)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => self.suppress_missing_testcase(e.into(), testcase_id).await,
        }
    }

    async fn handle_statistics(
        &mut self,
        sample: StatisticSample,
        system: bool,
    ) -> ProcessingResult<()> {
        let testcase_id = self.lifecycle.testcase_id();
        if self.deleted_testcases.contains(&testcase_id) {
            return Ok(());
        }
        let result = if system {
            self.gateway
                .insert_system_statistics(testcase_id, &sample)
                .await
        } else {
            self.gateway
                .insert_user_activity_statistics(testcase_id, &sample)
                .await
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) => self.suppress_missing_testcase(e.into(), testcase_id).await,
        }
    }

    // -- messages --------------------------------------------------------

    async fn handle_insert_message(
        &mut self,
        message: Message,
        is_run_message: bool,
    ) -> ProcessingResult<()> {
        let phase = self.lifecycle.phase();

        if is_run_message
            || self.lifecycle.in_after_suite()
            || (phase == LifecyclePhase::RunStarted && !self.lifecycle.in_after_class())
        {
            let run_id = self.lifecycle.run_id();
            if run_id == 0 {
                debug!("run message dropped: no run open");
                return Ok(());
            }
            if self.deleted_runs.contains(&run_id) {
                return Ok(());
            }
            if self.cache.is_some() {
                let flush = self
                    .cache
                    .as_mut()
                    .map(|cache| cache.add_run_message(run_id, message))
                    .unwrap_or(false);
                if flush {
                    self.flush_caches().await?;
                }
                return Ok(());
            }
            return match self.gateway.insert_run_message(run_id, &message).await {
                Ok(()) => Ok(()),
                Err(e) => self.suppress_missing_run(e.into(), run_id).await,
            };
        }

        // While an after mode is set the overlay target wins, even when
        // the next entity is already open.
        let after_method_target = self.lifecycle.in_after_method()
            && self.lifecycle.last_executed_testcase_id() != 0;
        if phase == LifecyclePhase::TestcaseStarted || after_method_target {
            let testcase_id = if after_method_target {
                self.lifecycle.last_executed_testcase_id()
            } else {
                self.lifecycle.testcase_id()
            };
            if self.deleted_testcases.contains(&testcase_id) {
                return Ok(());
            }
            if self.cache.is_some() {
                let flush = self
                    .cache
                    .as_mut()
                    .map(|cache| cache.add_testcase_message(testcase_id, message))
                    .unwrap_or(false);
                if flush {
                    self.flush_caches().await?;
                }
                return Ok(());
            }
            return match self
                .gateway
                .insert_testcase_message(testcase_id, &message)
                .await
            {
                Ok(()) => Ok(()),
                Err(e) => self.suppress_missing_testcase(e.into(), testcase_id).await,
            };
        }

        let after_class_target =
            self.lifecycle.in_after_class() && self.lifecycle.last_ended_suite_id() != 0;
        if phase == LifecyclePhase::SuiteStarted || after_class_target {
            let suite_id = if after_class_target {
                self.lifecycle.last_ended_suite_id()
            } else {
                self.lifecycle.suite_id()
            };
            if self.deleted_suites.contains(&suite_id) {
                return Ok(());
            }
            if self.cache.is_some() {
                let flush = self
                    .cache
                    .as_mut()
                    .map(|cache| cache.add_suite_message(suite_id, message))
                    .unwrap_or(false);
                if flush {
                    self.flush_caches().await?;
                }
                return Ok(());
            }
            return match self.gateway.insert_suite_message(suite_id, &message).await {
                Ok(()) => Ok(()),
                Err(e) => self.suppress_missing_suite(e.into(), suite_id).await,
            };
        }

        debug!("message dropped: session not attached to any entity");
        Ok(())
    }

    // -- graceful degradation -------------------------------------------

    /// If `err` says a parent is missing and the testcase really is
    /// gone, remember the id and swallow the error; later events for it
    /// become no-ops. Anything else propagates.
    async fn suppress_missing_testcase(
        &mut self,
        err: ProcessingError,
        testcase_id: i64,
    ) -> ProcessingResult<()> {
        if matches!(&err, ProcessingError::Store(e) if e.is_missing_parent())
            && !self.gateway.is_testcase_present(testcase_id).await?
        {
            self.deleted_testcases.insert(testcase_id);
            warn!(testcase_id, "testcase deleted externally; suppressing its events");
            emit_event(
                Level::WARN,
                ProcessKind::Executor,
                ObservabilityEvent {
                    testcase_id: Some(testcase_id),
                    status: Some("deleted-externally"),
                    ..obs("testcase.deleted.detected")
                },
            );
            return Ok(());
        }
        Err(err)
    }

    async fn suppress_missing_run(
        &mut self,
        err: ProcessingError,
        run_id: i64,
    ) -> ProcessingResult<()> {
        if matches!(&err, ProcessingError::Store(e) if e.is_missing_parent())
            && !self.gateway.is_run_present(run_id).await?
        {
            self.deleted_runs.insert(run_id);
            warn!(run_id, "run deleted externally; suppressing its events");
            if let Some(listener) = &self.listener {
                listener.on_run_finished();
            }
            return Ok(());
        }
        Err(err)
    }

    async fn suppress_missing_suite(
        &mut self,
        err: ProcessingError,
        suite_id: i64,
    ) -> ProcessingResult<()> {
        if matches!(&err, ProcessingError::Store(e) if e.is_missing_parent())
            && !self.gateway.is_suite_present(suite_id).await?
        {
            self.deleted_suites.insert(suite_id);
            warn!(suite_id, "suite deleted externally; suppressing its events");
            return Ok(());
        }
        Err(err)
    }
}
