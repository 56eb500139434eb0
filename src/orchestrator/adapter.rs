//! Orchestrator Adapter (C8): maps scheduler decisions onto a durable
//! workflow runtime.
//!
//! The real runtime (activities, child workflows, signals, timers) is out
//! of scope — only the interface into it is specified. `Orchestrator` is
//! that interface; `LocalOrchestrator` is an in-process implementation
//! sufficient to drive the scheduler end-to-end in the `executor` binary's
//! demo and in tests, the same role `InMemoryFunctionStorage` plays for the
//! teacher's storage trait.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};
use crate::model::{ActionStatement, RunContext, TaskResult};
use crate::retry::RetryPolicy;

pub type ActionDispatcher =
    Arc<dyn Fn(ActionStatement, RunContext) -> Pin<Box<dyn Future<Output = Result<TaskResult>> + Send>> + Send + Sync>;

/// The boundary the DAG scheduler dispatches through. A durable-runtime
/// implementation would submit each call as an activity invocation; timers
/// (`start_delay`, `wait_until`) and signals (interaction responses) are
/// separate methods so the scheduler never needs runtime-specific types.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn dispatch(&self, task: ActionStatement, ctx: RunContext) -> Result<TaskResult>;

    async fn sleep(&self, duration: std::time::Duration);

    /// Starts a child workflow execution (`core.workflow.execute`), returning
    /// its result once the child completes.
    async fn execute_child_workflow(
        &self,
        workflow_id: crate::model::WorkflowId,
        trigger: serde_json::Value,
    ) -> Result<TaskResult>;
}

/// Drives every dispatch through a user-supplied async closure. Good enough
/// for tests and the demo binary, where "the runtime" is just calling the
/// action runner directly in-process.
///
/// The scheduler sees only final outcomes: retries happen here, at the
/// activity-dispatch boundary, not in the DAG walk. Rate-limit errors get
/// their own bounded-backoff envelope separate from each statement's own
/// `retry_policy`, which governs other retryable error kinds.
pub struct LocalOrchestrator {
    dispatcher: ActionDispatcher,
    rate_limit_policy: RetryPolicy,
}

impl LocalOrchestrator {
    pub fn new(dispatcher: ActionDispatcher) -> Self {
        Self {
            dispatcher,
            rate_limit_policy: RetryPolicy::rate_limit_envelope(),
        }
    }

    /// Overrides the rate-limit retry envelope, for tests that need a
    /// short backoff instead of the 4s-5min production default.
    pub fn with_rate_limit_policy(mut self, policy: RetryPolicy) -> Self {
        self.rate_limit_policy = policy;
        self
    }
}

#[async_trait]
impl Orchestrator for LocalOrchestrator {
    async fn dispatch(&self, task: ActionStatement, ctx: RunContext) -> Result<TaskResult> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            debug!(ref_ = %task.ref_, stream = %ctx.stream_id, attempt, "dispatching action");

            let mut outcome = match (self.dispatcher)(task.clone(), ctx.clone()).await {
                Err(CoreError::RateLimited { retry_after })
                    if self.rate_limit_policy.should_retry(attempt, true) =>
                {
                    warn!(ref_ = %task.ref_, attempt, ?retry_after, "rate limited, retrying with backoff");
                    self.sleep(retry_after).await;
                    continue;
                }
                other => other?,
            };

            let is_rate_limited = outcome
                .error
                .as_ref()
                .is_some_and(|err| err.type_ == "RateLimitExceeded");

            if is_rate_limited && self.rate_limit_policy.should_retry(attempt, true) {
                let delay = self.rate_limit_policy.delay_for_attempt(attempt);
                warn!(ref_ = %task.ref_, attempt, ?delay, "rate limited, retrying with backoff");
                self.sleep(delay).await;
                continue;
            }

            if let Some(err) = outcome.error.as_mut() {
                err.attempt = attempt;
            }
            return Ok(outcome);
        }
    }

    async fn sleep(&self, duration: std::time::Duration) {
        tokio::time::sleep(duration).await;
    }

    async fn execute_child_workflow(
        &self,
        workflow_id: crate::model::WorkflowId,
        _trigger: serde_json::Value,
    ) -> Result<TaskResult> {
        info!(%workflow_id, "local orchestrator does not run real child workflows");
        Err(crate::error::CoreError::Orchestrator(
            "child workflow execution requires a durable runtime".to_string(),
        ))
    }
}
