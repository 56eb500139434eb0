//! Composes the Registry Resolver (C2), the Action Runner (C4) / Worker
//! Pool (C5), and the DAG Scheduler (C7) into a single [`ActionDispatcher`]:
//! resolve the action's implementation, dispatch it through the Direct or
//! Worker-Pool backend, and hand the result back in the shape the scheduler
//! expects. Each subsystem is otherwise only unit-tested in isolation; this
//! is where they actually run together, the way the `executor` binary and
//! integration tests are meant to exercise a real workflow.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::error::{CoreError, Result};
use crate::model::{ActionImplementation, RegistryLock, RunContext, TaskResult, UdfImplementation};
use crate::orchestrator::ActionDispatcher;
use crate::pool::WorkerPool;
use crate::registry::resolver::RegistryResolver;
use crate::runner::action_runner::ActionRunner;
use crate::runner::protocol::{RunActionInput, RunContextWire};
use crate::storage::ObjectStore;

/// In-tree actions pinned to the `builtin` origin run directly; everything
/// else goes through the worker pool so a tarball's subprocess is bounded by
/// pool capacity instead of spawned unbounded.
fn uses_worker_pool(udf: &UdfImplementation) -> bool {
    udf.origin != "builtin"
}

/// Builds the tarball URI an origin's published version resolves to. A real
/// deployment would read this off the `RegistryVersion` looked up during
/// resolution; the resolver here only returns the implementation, so the
/// dispatcher derives the URI from the origin the same way the sync service
/// names the object it published.
fn tarball_uri_for(origin: &str) -> String {
    format!("s3://registry/tarball-venvs/{origin}/site-packages.tar.gz")
}

/// Builds the dispatcher the orchestrator drives every `ActionStatement`
/// through. A rate-limit failure from the worker is raised as
/// [`CoreError::RateLimited`] rather than folded into a [`TaskResult`]
/// failure so `LocalOrchestrator::dispatch`'s retry loop can catch and back
/// off on it before the scheduler ever sees the task as failed.
pub fn build_action_dispatcher(
    resolver: Arc<RegistryResolver>,
    lock: Arc<RegistryLock>,
    runner: Arc<ActionRunner>,
    pool: Arc<WorkerPool>,
    object_store: Arc<dyn ObjectStore>,
) -> ActionDispatcher {
    Arc::new(move |task, ctx: RunContext| {
        let resolver = resolver.clone();
        let lock = lock.clone();
        let runner = runner.clone();
        let pool = pool.clone();
        let object_store = object_store.clone();
        Box::pin(async move {
            let implementation = resolver.resolve(&task.action, &lock).await?;
            let udf = match implementation {
                ActionImplementation::Udf(udf) => udf,
                ActionImplementation::Template(_) => {
                    return Err(CoreError::Validation(format!(
                        "action '{}' resolved to a template, which this dispatcher does not expand",
                        task.action
                    )));
                }
            };

            let secret_names = resolver.collect_secrets(&task.action, &lock).await?;
            let secrets: HashMap<String, Value> = secret_names
                .into_iter()
                .map(|name| (name, Value::Null))
                .collect();

            let tarball_uri = tarball_uri_for(&udf.origin);
            let input = RunActionInput {
                task: task.clone(),
                resolved_args: task.args.clone(),
                secrets,
                run_context: RunContextWire::from(&ctx),
            };

            let outcome = if uses_worker_pool(&udf) {
                let worker_id = pool.acquire().await?;
                let result = runner.run(&tarball_uri, &input).await;
                pool.release(worker_id).await;
                result
            } else {
                runner.run(&tarball_uri, &input).await
            };

            match outcome {
                Ok(value) => {
                    let stored = object_store.store(&task.ref_, &value, "object").await?;
                    Ok(TaskResult::success(stored, "object"))
                }
                Err(err) if err.type_ == "RateLimitExceeded" => Err(CoreError::RateLimited {
                    retry_after: Duration::from_secs(4),
                }),
                Err(err) => Ok(TaskResult::failure(err)),
            }
        })
    })
}
