//! Entity records and result enums.
//!
//! All identifiers are backend-assigned `i64`s; `0` means "not assigned
//! yet" and is never handed out by a store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of a testcase. The numeric values are part of the stored
/// representation and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestcaseResult {
    Failed,
    Passed,
    Skipped,
    Running,
}

impl TestcaseResult {
    pub fn as_i64(self) -> i64 {
        match self {
            TestcaseResult::Failed => 0,
            TestcaseResult::Passed => 1,
            TestcaseResult::Skipped => 2,
            TestcaseResult::Running => 4,
        }
    }
}

impl std::fmt::Display for TestcaseResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestcaseResult::Failed => write!(f, "failed"),
            TestcaseResult::Passed => write!(f, "passed"),
            TestcaseResult::Skipped => write!(f, "skipped"),
            TestcaseResult::Running => write!(f, "running"),
        }
    }
}

/// Outcome of a single checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointResult {
    Failed,
    Passed,
    Running,
}

impl CheckpointResult {
    pub fn as_i64(self) -> i64 {
        match self {
            CheckpointResult::Failed => 0,
            CheckpointResult::Passed => 1,
            CheckpointResult::Running => 4,
        }
    }
}

/// Final state of a load queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadQueueResult {
    Failed,
    Passed,
    Cancelled,
}

impl LoadQueueResult {
    pub fn as_i64(self) -> i64 {
        match self {
            LoadQueueResult::Failed => 0,
            LoadQueueResult::Passed => 1,
            LoadQueueResult::Cancelled => 2,
        }
    }
}

/// Severity of a logged message row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageLevel {
    Fatal,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
    System,
}

impl MessageLevel {
    pub fn as_i64(self) -> i64 {
        match self {
            MessageLevel::Fatal => 1,
            MessageLevel::Error => 2,
            MessageLevel::Warn => 3,
            MessageLevel::Info => 4,
            MessageLevel::Debug => 5,
            MessageLevel::Trace => 6,
            MessageLevel::System => 7,
        }
    }
}

/// How much checkpoint data is persisted.
///
/// `Full` stores every individual checkpoint row plus the per-name
/// summary; `Short` maintains only the summary aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointDetail {
    Full,
    Short,
}

/// A persisted run row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: i64,
    pub name: String,
    pub os: String,
    pub product: String,
    pub version: String,
    pub build: String,
    pub host: String,
    pub user_note: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Partial update to a run row. `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunPatch {
    pub name: Option<String>,
    pub os: Option<String>,
    pub product: Option<String>,
    pub version: Option<String>,
    pub build: Option<String>,
    pub host: Option<String>,
    pub user_note: Option<String>,
}

impl RunPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.os.is_none()
            && self.product.is_none()
            && self.version.is_none()
            && self.build.is_none()
            && self.host.is_none()
            && self.user_note.is_none()
    }

    /// Fill unset fields from a persisted row, yielding a complete patch.
    pub fn backfill(&self, run: &Run) -> RunPatch {
        RunPatch {
            name: Some(self.name.clone().unwrap_or_else(|| run.name.clone())),
            os: Some(self.os.clone().unwrap_or_else(|| run.os.clone())),
            product: Some(self.product.clone().unwrap_or_else(|| run.product.clone())),
            version: Some(self.version.clone().unwrap_or_else(|| run.version.clone())),
            build: Some(self.build.clone().unwrap_or_else(|| run.build.clone())),
            host: Some(self.host.clone().unwrap_or_else(|| run.host.clone())),
            user_note: Some(self.user_note.clone().unwrap_or_else(|| run.user_note.clone())),
        }
    }
}

/// A persisted testcase row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Testcase {
    pub id: i64,
    pub suite_id: i64,
    pub scenario_name: String,
    pub scenario_description: String,
    pub name: String,
    pub result: TestcaseResult,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Partial update to a testcase row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestcasePatch {
    pub scenario_name: Option<String>,
    pub scenario_description: Option<String>,
    pub name: Option<String>,
    pub user_note: Option<String>,
}

/// Handle to a checkpoint that has been started but not yet ended.
///
/// Identity is the checkpoint *name* only: a thread may have at most one
/// open checkpoint per name, and the end event carries just the name.
/// `summary_id`/`checkpoint_id` are payload the end operation needs but
/// they never participate in equality or hashing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointInfo {
    pub name: String,
    pub summary_id: i64,
    /// Row id of the in-progress checkpoint; `0` when the store runs in
    /// `Short` detail and no individual row exists.
    pub checkpoint_id: i64,
    pub started_at: DateTime<Utc>,
}

impl PartialEq for CheckpointInfo {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for CheckpointInfo {}

impl std::hash::Hash for CheckpointInfo {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl std::borrow::Borrow<str> for CheckpointInfo {
    fn borrow(&self) -> &str {
        &self.name
    }
}

/// A message row destined for the run, suite, or testcase message table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub text: String,
    pub level: MessageLevel,
    pub escape_html: bool,
    pub machine: String,
    pub thread_name: String,
    pub timestamp: DateTime<Utc>,
}

/// A statistic definition registered once and referenced by id from
/// every sample that measures it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatisticDefinition {
    pub name: String,
    pub parent_name: String,
    pub internal_name: String,
    pub unit: String,
    pub params: String,
}

/// One timestamped batch of statistic values from a single machine.
/// `definition_ids` and `values` are parallel vectors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatisticSample {
    pub machine: String,
    pub definition_ids: Vec<i64>,
    pub values: Vec<f64>,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn checkpoint_identity_is_name_only() {
        let a = CheckpointInfo {
            name: "login".into(),
            summary_id: 1,
            checkpoint_id: 10,
            started_at: Utc::now(),
        };
        let b = CheckpointInfo {
            name: "login".into(),
            summary_id: 2,
            checkpoint_id: 99,
            started_at: Utc::now(),
        };
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(!set.insert(b), "same name must collide in a set");
        assert!(set.contains("login"));
    }

    #[test]
    fn result_codes_are_stable() {
        assert_eq!(TestcaseResult::Failed.as_i64(), 0);
        assert_eq!(TestcaseResult::Passed.as_i64(), 1);
        assert_eq!(TestcaseResult::Skipped.as_i64(), 2);
        assert_eq!(TestcaseResult::Running.as_i64(), 4);
        assert_eq!(CheckpointResult::Running.as_i64(), 4);
    }

    #[test]
    fn run_patch_backfill_completes_missing_fields() {
        let run = Run {
            id: 7,
            name: "nightly".into(),
            os: "linux".into(),
            product: "gateway".into(),
            version: "2.1".into(),
            build: "1042".into(),
            host: "exec-03".into(),
            user_note: "".into(),
            started_at: Utc::now(),
            ended_at: None,
        };
        let patch = RunPatch {
            user_note: Some("rerun after fix".into()),
            ..RunPatch::default()
        };
        let full = patch.backfill(&run);
        assert_eq!(full.name.as_deref(), Some("nightly"));
        assert_eq!(full.user_note.as_deref(), Some("rerun after fix"));
        assert_eq!(full.build.as_deref(), Some("1042"));
    }
}
