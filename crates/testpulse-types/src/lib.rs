//! Shared data types for the TestPulse telemetry pipeline: the event
//! taxonomy produced by executors and agents, the entity records they
//! persist, and the result/level enums shared across crates.

pub mod entity;
pub mod event;

pub use entity::{
    CheckpointDetail, CheckpointInfo, CheckpointResult, LoadQueueResult, Message, MessageLevel,
    Run, RunPatch, StatisticDefinition, StatisticSample, Testcase, TestcasePatch,
    TestcaseResult,
};
pub use event::{EventKind, EventRequest, TelemetryEvent, TestcaseState};
