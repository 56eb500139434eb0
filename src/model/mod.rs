//! Domain model.
//!
//! This module groups the data types shared by every other subsystem:
//! identifiers, the action statement, the uniform result envelope, the
//! registry lock/version/manifest, and the execution context. Nothing in
//! here performs I/O — these are plain, serializable value types, the same
//! separation the rest of this crate's engine/storage modules assume.

pub mod action;
pub mod context;
pub mod ids;
pub mod object;
pub mod registry;

pub use action::{
    ActionStatement, DependencyRef, EdgeType, ForEach, JoinStrategy, RetryPolicy, ScatterSpec,
    StreamErrorHandlingStrategy, validate_statements,
};
pub use context::{ExecutionContext, RunContext};
pub use ids::{ExecutionId, StreamId, StreamSegment, WorkflowId};
pub use object::{ActionErrorInfo, InteractionMetadata, StoredObject, TaskResult};
pub use registry::{
    ActionImplementation, ActionType, ManifestAction, RegistryLock, RegistryVersion,
    TemplateImplementation, TemplateStep, UdfImplementation,
};
