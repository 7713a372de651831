//! The telemetry event taxonomy.
//!
//! Every mutation of persisted test state travels as a [`TelemetryEvent`]
//! wrapped in an [`EventRequest`] that pins the producing thread and the
//! moment the event was raised. The consumer loop replays requests in
//! arrival order, so the timestamp here is authoritative even when the
//! event is persisted much later.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::{
    CheckpointResult, LoadQueueResult, MessageLevel, RunPatch, StatisticSample, TestcasePatch,
    TestcaseResult,
};

/// One event plus the context it was raised in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRequest {
    pub event: TelemetryEvent,
    pub timestamp: DateTime<Utc>,
    pub thread_name: String,
}

impl EventRequest {
    pub fn new(event: TelemetryEvent, thread_name: impl Into<String>) -> Self {
        Self {
            event,
            timestamp: Utc::now(),
            thread_name: thread_name.into(),
        }
    }
}

/// Position of a secondary producer joining an already-running testcase.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TestcaseState {
    pub run_id: i64,
    pub testcase_id: i64,
    pub last_executed_testcase_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TelemetryEvent {
    StartRun {
        name: String,
        os: String,
        product: String,
        version: String,
        build: String,
        host: String,
    },
    EndRun,
    UpdateRun(RunPatch),
    AddRunMetainfo {
        key: String,
        value: String,
    },
    StartSuite {
        name: String,
        package: String,
    },
    EndSuite,
    UpdateSuite {
        name: Option<String>,
        user_note: Option<String>,
    },
    StartTestcase {
        suite_name: String,
        scenario_name: String,
        scenario_description: String,
        name: String,
    },
    EndTestcase {
        result: TestcaseResult,
    },
    UpdateTestcase(TestcasePatch),
    /// A secondary producer attaches to a testcase another process started.
    JoinTestcase(TestcaseState),
    LeaveTestcase,
    AddScenarioMetainfo {
        key: String,
        value: String,
    },
    ClearScenarioMetainfo,
    AddTestcaseMetainfo {
        /// Explicit target; `None` means the current (or, in after-method
        /// mode, the last executed) testcase.
        testcase_id: Option<i64>,
        key: String,
        value: String,
    },
    StartAfterSuite,
    EndAfterSuite,
    StartAfterClass,
    EndAfterClass,
    StartAfterMethod,
    EndAfterMethod,
    /// Record an externally created load queue in the checkpoint registry.
    RememberLoadQueue {
        name: String,
        load_queue_id: i64,
    },
    /// Forget a load queue without persisting a final state.
    CleanupLoadQueue {
        name: String,
    },
    EndLoadQueue {
        name: String,
        result: LoadQueueResult,
    },
    RegisterThreadWithLoadQueue {
        load_queue_name: String,
    },
    StartCheckpoint {
        name: String,
        transfer_unit: String,
    },
    EndCheckpoint {
        name: String,
        transfer_size: i64,
        result: CheckpointResult,
    },
    /// A checkpoint reported in one shot, already measured by the caller.
    InsertCheckpoint {
        name: String,
        response_time_ms: i64,
        transfer_size: i64,
        transfer_unit: String,
        result: CheckpointResult,
    },
    InsertSystemStatistic(StatisticSample),
    InsertUserActivityStatistic(StatisticSample),
    InsertMessage {
        text: String,
        level: MessageLevel,
        escape_html: bool,
        /// Force run-level routing regardless of the current phase.
        is_run_message: bool,
    },
}

impl TelemetryEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            TelemetryEvent::StartRun { .. } => EventKind::StartRun,
            TelemetryEvent::EndRun => EventKind::EndRun,
            TelemetryEvent::UpdateRun(_) => EventKind::UpdateRun,
            TelemetryEvent::AddRunMetainfo { .. } => EventKind::AddRunMetainfo,
            TelemetryEvent::StartSuite { .. } => EventKind::StartSuite,
            TelemetryEvent::EndSuite => EventKind::EndSuite,
            TelemetryEvent::UpdateSuite { .. } => EventKind::UpdateSuite,
            TelemetryEvent::StartTestcase { .. } => EventKind::StartTestcase,
            TelemetryEvent::EndTestcase { .. } => EventKind::EndTestcase,
            TelemetryEvent::UpdateTestcase(_) => EventKind::UpdateTestcase,
            TelemetryEvent::JoinTestcase(_) => EventKind::JoinTestcase,
            TelemetryEvent::LeaveTestcase => EventKind::LeaveTestcase,
            TelemetryEvent::AddScenarioMetainfo { .. } => EventKind::AddScenarioMetainfo,
            TelemetryEvent::ClearScenarioMetainfo => EventKind::ClearScenarioMetainfo,
            TelemetryEvent::AddTestcaseMetainfo { .. } => EventKind::AddTestcaseMetainfo,
            TelemetryEvent::StartAfterSuite => EventKind::StartAfterSuite,
            TelemetryEvent::EndAfterSuite => EventKind::EndAfterSuite,
            TelemetryEvent::StartAfterClass => EventKind::StartAfterClass,
            TelemetryEvent::EndAfterClass => EventKind::EndAfterClass,
            TelemetryEvent::StartAfterMethod => EventKind::StartAfterMethod,
            TelemetryEvent::EndAfterMethod => EventKind::EndAfterMethod,
            TelemetryEvent::RememberLoadQueue { .. } => EventKind::RememberLoadQueue,
            TelemetryEvent::CleanupLoadQueue { .. } => EventKind::CleanupLoadQueue,
            TelemetryEvent::EndLoadQueue { .. } => EventKind::EndLoadQueue,
            TelemetryEvent::RegisterThreadWithLoadQueue { .. } => {
                EventKind::RegisterThreadWithLoadQueue
            }
            TelemetryEvent::StartCheckpoint { .. } => EventKind::StartCheckpoint,
            TelemetryEvent::EndCheckpoint { .. } => EventKind::EndCheckpoint,
            TelemetryEvent::InsertCheckpoint { .. } => EventKind::InsertCheckpoint,
            TelemetryEvent::InsertSystemStatistic(_) => EventKind::InsertSystemStatistic,
            TelemetryEvent::InsertUserActivityStatistic(_) => {
                EventKind::InsertUserActivityStatistic
            }
            TelemetryEvent::InsertMessage { .. } => EventKind::InsertMessage,
        }
    }

    /// Whether the event may sit in the write cache instead of hitting
    /// the store immediately. Only high-volume row inserts qualify.
    pub fn is_batchable(&self) -> bool {
        matches!(
            self,
            TelemetryEvent::InsertMessage { .. } | TelemetryEvent::InsertCheckpoint { .. }
        )
    }
}

/// Discriminant-only view of an event, used for admissibility checks,
/// error reporting, and the critical-event allow list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    StartRun,
    EndRun,
    UpdateRun,
    AddRunMetainfo,
    StartSuite,
    EndSuite,
    UpdateSuite,
    StartTestcase,
    EndTestcase,
    UpdateTestcase,
    JoinTestcase,
    LeaveTestcase,
    AddScenarioMetainfo,
    ClearScenarioMetainfo,
    AddTestcaseMetainfo,
    StartAfterSuite,
    EndAfterSuite,
    StartAfterClass,
    EndAfterClass,
    StartAfterMethod,
    EndAfterMethod,
    RememberLoadQueue,
    CleanupLoadQueue,
    EndLoadQueue,
    RegisterThreadWithLoadQueue,
    StartCheckpoint,
    EndCheckpoint,
    InsertCheckpoint,
    InsertSystemStatistic,
    InsertUserActivityStatistic,
    InsertMessage,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EventKind::StartRun => "start-run",
            EventKind::EndRun => "end-run",
            EventKind::UpdateRun => "update-run",
            EventKind::AddRunMetainfo => "add-run-metainfo",
            EventKind::StartSuite => "start-suite",
            EventKind::EndSuite => "end-suite",
            EventKind::UpdateSuite => "update-suite",
            EventKind::StartTestcase => "start-testcase",
            EventKind::EndTestcase => "end-testcase",
            EventKind::UpdateTestcase => "update-testcase",
            EventKind::JoinTestcase => "join-testcase",
            EventKind::LeaveTestcase => "leave-testcase",
            EventKind::AddScenarioMetainfo => "add-scenario-metainfo",
            EventKind::ClearScenarioMetainfo => "clear-scenario-metainfo",
            EventKind::AddTestcaseMetainfo => "add-testcase-metainfo",
            EventKind::StartAfterSuite => "start-after-suite",
            EventKind::EndAfterSuite => "end-after-suite",
            EventKind::StartAfterClass => "start-after-class",
            EventKind::EndAfterClass => "end-after-class",
            EventKind::StartAfterMethod => "start-after-method",
            EventKind::EndAfterMethod => "end-after-method",
            EventKind::RememberLoadQueue => "remember-load-queue",
            EventKind::CleanupLoadQueue => "cleanup-load-queue",
            EventKind::EndLoadQueue => "end-load-queue",
            EventKind::RegisterThreadWithLoadQueue => "register-thread-with-load-queue",
            EventKind::StartCheckpoint => "start-checkpoint",
            EventKind::EndCheckpoint => "end-checkpoint",
            EventKind::InsertCheckpoint => "insert-checkpoint",
            EventKind::InsertSystemStatistic => "insert-system-statistic",
            EventKind::InsertUserActivityStatistic => "insert-user-activity-statistic",
            EventKind::InsertMessage => "insert-message",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_row_inserts_are_batchable() {
        assert!(TelemetryEvent::InsertMessage {
            text: "x".into(),
            level: MessageLevel::Info,
            escape_html: false,
            is_run_message: false,
        }
        .is_batchable());
        assert!(TelemetryEvent::InsertCheckpoint {
            name: "cp".into(),
            response_time_ms: 3,
            transfer_size: 0,
            transfer_unit: String::new(),
            result: CheckpointResult::Passed,
        }
        .is_batchable());
        assert!(!TelemetryEvent::EndRun.is_batchable());
        assert!(!TelemetryEvent::StartCheckpoint {
            name: "cp".into(),
            transfer_unit: String::new(),
        }
        .is_batchable());
    }

    #[test]
    fn event_request_carries_thread_and_time() {
        let req = EventRequest::new(TelemetryEvent::EndRun, "main");
        assert_eq!(req.thread_name, "main");
        assert_eq!(req.event.kind(), EventKind::EndRun);
    }
}
