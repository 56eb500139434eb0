//! DAG Scheduler subsystem (C7).

pub mod dsl_scheduler;
pub mod graph;
pub mod stream;

pub use dsl_scheduler::{AlwaysTrue, ConditionEvaluator, DslScheduler, SchedulerRun};
pub use graph::{EdgeMarker, TaskGraph, TaskOutcome};
pub use stream::{gather, scatter, view_for_stream, StreamActions};
