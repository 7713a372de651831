//! Lifecycle state machine.
//!
//! The persisted hierarchy follows the grammar
//! `run ( suite ( testcase )* )*`: a run owns sequential suites, a suite
//! owns sequential testcases, and exactly one entity of each level is
//! open at a time. The state machine tracks which level is open plus the
//! three "after" overlays that let teardown code log against entities
//! that already ended.

use serde::{Deserialize, Serialize};
use testpulse_types::{EventKind, TestcaseState};

use crate::error::ProcessingError;

/// Which level of the hierarchy is currently open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePhase {
    Initialized,
    RunStarted,
    SuiteStarted,
    TestcaseStarted,
}

impl std::fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecyclePhase::Initialized => write!(f, "initialized"),
            LifecyclePhase::RunStarted => write!(f, "run-started"),
            LifecyclePhase::SuiteStarted => write!(f, "suite-started"),
            LifecyclePhase::TestcaseStarted => write!(f, "testcase-started"),
        }
    }
}

/// Mutable lifecycle position of one telemetry session.
#[derive(Debug, Clone)]
pub struct LifecycleState {
    phase: LifecyclePhase,
    run_id: i64,
    previous_run_id: i64,
    suite_id: i64,
    testcase_id: i64,
    last_executed_testcase_id: i64,
    last_ended_suite_id: i64,
    after_suite: bool,
    after_class: bool,
    after_method: bool,
}

impl Default for LifecycleState {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleState {
    pub fn new() -> Self {
        Self {
            phase: LifecyclePhase::Initialized,
            run_id: 0,
            previous_run_id: 0,
            suite_id: 0,
            testcase_id: 0,
            last_executed_testcase_id: 0,
            last_ended_suite_id: 0,
            after_suite: false,
            after_class: false,
            after_method: false,
        }
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.phase
    }

    pub fn run_id(&self) -> i64 {
        self.run_id
    }

    pub fn previous_run_id(&self) -> i64 {
        self.previous_run_id
    }

    pub fn suite_id(&self) -> i64 {
        self.suite_id
    }

    pub fn testcase_id(&self) -> i64 {
        self.testcase_id
    }

    pub fn last_executed_testcase_id(&self) -> i64 {
        self.last_executed_testcase_id
    }

    pub fn last_ended_suite_id(&self) -> i64 {
        self.last_ended_suite_id
    }

    pub fn in_after_suite(&self) -> bool {
        self.after_suite
    }

    pub fn in_after_class(&self) -> bool {
        self.after_class
    }

    pub fn in_after_method(&self) -> bool {
        self.after_method
    }

    /// Whether `kind` may be processed in the current phase.
    ///
    /// Events whose routing depends on payload or on after-mode targets
    /// (messages, updates, metainfo) always pass here; the processor
    /// resolves their target and raises the violation itself when none
    /// exists.
    pub fn check_admissible(&self, kind: EventKind) -> Result<(), ProcessingError> {
        let required: Option<(&'static str, bool)> = match kind {
            EventKind::StartRun | EventKind::JoinTestcase => Some((
                "initialized",
                self.phase == LifecyclePhase::Initialized,
            )),
            EventKind::EndRun | EventKind::StartSuite => Some((
                "run started with no open suite",
                self.phase == LifecyclePhase::RunStarted,
            )),
            EventKind::AddRunMetainfo => Some((
                "run started",
                self.phase >= LifecyclePhase::RunStarted,
            )),
            EventKind::EndSuite | EventKind::StartTestcase => Some((
                "suite started with no open testcase",
                self.phase == LifecyclePhase::SuiteStarted,
            )),
            EventKind::EndTestcase | EventKind::LeaveTestcase => Some((
                "testcase started",
                self.phase == LifecyclePhase::TestcaseStarted,
            )),
            EventKind::UpdateTestcase => Some((
                "testcase started (or after-method mode)",
                self.phase == LifecyclePhase::TestcaseStarted
                    || (self.after_method && self.last_executed_testcase_id != 0),
            )),
            EventKind::AddScenarioMetainfo | EventKind::ClearScenarioMetainfo => Some((
                "testcase started",
                self.phase == LifecyclePhase::TestcaseStarted,
            )),
            EventKind::RememberLoadQueue
            | EventKind::CleanupLoadQueue
            | EventKind::EndLoadQueue
            | EventKind::RegisterThreadWithLoadQueue
            | EventKind::StartCheckpoint
            | EventKind::EndCheckpoint
            | EventKind::InsertCheckpoint
            | EventKind::InsertSystemStatistic
            | EventKind::InsertUserActivityStatistic => Some((
                "testcase started",
                self.phase == LifecyclePhase::TestcaseStarted,
            )),
            // Payload- or overlay-dependent events; the processor decides.
            EventKind::UpdateRun
            | EventKind::UpdateSuite
            | EventKind::AddTestcaseMetainfo
            | EventKind::InsertMessage
            | EventKind::StartAfterSuite
            | EventKind::EndAfterSuite
            | EventKind::StartAfterClass
            | EventKind::EndAfterClass
            | EventKind::StartAfterMethod
            | EventKind::EndAfterMethod => None,
        };

        match required {
            Some((expected, ok)) if !ok => Err(ProcessingError::PhaseViolation {
                event: kind,
                phase: self.phase,
                expected,
            }),
            _ => Ok(()),
        }
    }

    // -- transitions -----------------------------------------------------

    pub fn run_started(&mut self, run_id: i64) {
        self.phase = LifecyclePhase::RunStarted;
        self.run_id = run_id;
        self.suite_id = 0;
        self.testcase_id = 0;
        self.last_executed_testcase_id = 0;
        self.last_ended_suite_id = 0;
    }

    pub fn run_ended(&mut self) {
        self.previous_run_id = self.run_id;
        self.run_id = 0;
        self.phase = LifecyclePhase::Initialized;
    }

    pub fn suite_started(&mut self, suite_id: i64) {
        self.phase = LifecyclePhase::SuiteStarted;
        self.suite_id = suite_id;
    }

    pub fn suite_ended(&mut self) {
        self.last_ended_suite_id = self.suite_id;
        self.suite_id = 0;
        self.phase = LifecyclePhase::RunStarted;
    }

    pub fn testcase_started(&mut self, testcase_id: i64) {
        self.phase = LifecyclePhase::TestcaseStarted;
        self.testcase_id = testcase_id;
    }

    pub fn testcase_ended(&mut self) {
        self.last_executed_testcase_id = self.testcase_id;
        self.testcase_id = 0;
        self.phase = LifecyclePhase::SuiteStarted;
    }

    /// Attach to a testcase started by another process.
    pub fn joined(&mut self, state: TestcaseState) {
        self.phase = LifecyclePhase::TestcaseStarted;
        self.run_id = state.run_id;
        self.testcase_id = state.testcase_id;
        if let Some(last) = state.last_executed_testcase_id {
            self.last_executed_testcase_id = last;
        }
    }

    pub fn left(&mut self) {
        self.last_executed_testcase_id = self.testcase_id;
        self.testcase_id = 0;
        self.run_id = 0;
        self.phase = LifecyclePhase::Initialized;
    }

    pub fn set_after_suite(&mut self, on: bool) {
        self.after_suite = on;
    }

    pub fn set_after_class(&mut self, on: bool) {
        self.after_class = on;
    }

    pub fn set_after_method(&mut self, on: bool) {
        self.after_method = on;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grammar_happy_path() {
        let mut state = LifecycleState::new();
        assert!(state.check_admissible(EventKind::StartRun).is_ok());
        state.run_started(1);
        assert!(state.check_admissible(EventKind::StartSuite).is_ok());
        state.suite_started(2);
        assert!(state.check_admissible(EventKind::StartTestcase).is_ok());
        state.testcase_started(3);
        assert!(state.check_admissible(EventKind::EndTestcase).is_ok());
        state.testcase_ended();
        assert!(state.check_admissible(EventKind::EndSuite).is_ok());
        state.suite_ended();
        assert!(state.check_admissible(EventKind::EndRun).is_ok());
        state.run_ended();
        assert_eq!(state.previous_run_id(), 1);
        assert_eq!(state.phase(), LifecyclePhase::Initialized);
    }

    #[test]
    fn out_of_order_events_are_rejected() {
        let state = LifecycleState::new();
        for kind in [
            EventKind::EndRun,
            EventKind::StartSuite,
            EventKind::StartTestcase,
            EventKind::EndTestcase,
            EventKind::StartCheckpoint,
        ] {
            let err = state.check_admissible(kind).unwrap_err();
            assert!(
                matches!(err, ProcessingError::PhaseViolation { .. }),
                "{kind} must be a phase violation when nothing is open"
            );
        }
    }

    #[test]
    fn second_start_run_is_rejected_while_open() {
        let mut state = LifecycleState::new();
        state.run_started(1);
        assert!(state.check_admissible(EventKind::StartRun).is_err());
    }

    #[test]
    fn end_run_rejected_while_suite_open() {
        let mut state = LifecycleState::new();
        state.run_started(1);
        state.suite_started(2);
        assert!(state.check_admissible(EventKind::EndRun).is_err());
    }

    #[test]
    fn update_testcase_allowed_in_after_method_with_history() {
        let mut state = LifecycleState::new();
        state.run_started(1);
        state.suite_started(2);
        state.testcase_started(3);
        state.testcase_ended();

        assert!(state.check_admissible(EventKind::UpdateTestcase).is_err());
        state.set_after_method(true);
        assert!(state.check_admissible(EventKind::UpdateTestcase).is_ok());
        assert_eq!(state.last_executed_testcase_id(), 3);
    }

    #[test]
    fn join_attaches_to_running_testcase() {
        let mut state = LifecycleState::new();
        state.joined(TestcaseState {
            run_id: 10,
            testcase_id: 33,
            last_executed_testcase_id: None,
        });
        assert_eq!(state.phase(), LifecyclePhase::TestcaseStarted);
        assert_eq!(state.testcase_id(), 33);
        assert!(state.check_admissible(EventKind::InsertCheckpoint).is_ok());

        state.left();
        assert_eq!(state.phase(), LifecyclePhase::Initialized);
        assert_eq!(state.last_executed_testcase_id(), 33);
    }
}
