//! The DAG scheduler's main loop: a dynamic, stream-partitioned topological
//! execution over a [`TaskGraph`].
//!
//! Grounded on `tracecat/dsl/scheduler.py`: a queue-based walk that enqueues
//! newly-reachable refs in sorted order, bounds concurrent dispatch with
//! `max_pending_tasks`, evaluates `run_if` immediately before dispatch, and
//! aggregates every unrecoverable task failure into one error raised at the
//! end of the run rather than aborting on the first failure.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::{CoreError, Result};
use crate::model::{ActionErrorInfo, ActionStatement, ExecutionContext, RunContext, ScatterSpec, StreamId, TaskResult};
use crate::orchestrator::Orchestrator;
use crate::scheduler::graph::{TaskGraph, TaskOutcome};
use crate::scheduler::stream;
use crate::storage::ObjectStore;

/// Decides whether a `run_if` expression is truthy against the current
/// context. Kept abstract because expression evaluation is outside this
/// crate's scope; callers supply whatever expression engine they use.
pub trait ConditionEvaluator: Send + Sync {
    fn evaluate(&self, expr: &str, ctx: &ExecutionContext) -> Result<bool>;
}

/// Always-true evaluator for graphs with no `run_if` clauses (tests, and
/// any caller that hasn't wired in a real expression engine yet).
pub struct AlwaysTrue;

impl ConditionEvaluator for AlwaysTrue {
    fn evaluate(&self, _expr: &str, _ctx: &ExecutionContext) -> Result<bool> {
        Ok(true)
    }
}

/// Decision taken in this codebase for the open question of how a `run_if`
/// evaluation *failure* (not a falsy result, an actual evaluation error)
/// should be treated: it is surfaced as a task failure on that ref, not a
/// silent skip. A broken condition expression is a workflow-authoring bug,
/// and silently skipping would hide it from the run history.
fn run_if_error(ref_: &str, stream_id: &StreamId, err: CoreError) -> ActionErrorInfo {
    ActionErrorInfo {
        ref_: ref_.to_string(),
        message: format!("run_if evaluation failed: {err}"),
        type_: "ValidationError".to_string(),
        attempt: 0,
        stream_id: stream_id.to_string(),
        children: vec![],
    }
}

fn dispatch_error(ref_: &str, stream_id: &str, err: CoreError) -> ActionErrorInfo {
    ActionErrorInfo {
        ref_: ref_.to_string(),
        message: err.to_string(),
        type_: err.kind().to_string(),
        attempt: 1,
        stream_id: stream_id.to_string(),
        children: vec![],
    }
}

pub struct DslScheduler {
    graph: TaskGraph,
    orchestrator: Arc<dyn Orchestrator>,
    evaluator: Arc<dyn ConditionEvaluator>,
    store: Arc<dyn ObjectStore>,
    max_pending_tasks: usize,
    max_do_while_iterations: u32,
}

pub struct SchedulerRun {
    pub context: ExecutionContext,
    pub task_exceptions: Vec<ActionErrorInfo>,
    /// Do-while iteration counts per `core.loop.end` ref, keyed by ref. A
    /// caller driving a do-while body as repeated `run` calls over the same
    /// graph threads this back in as the next call's `loop_iterations`
    /// argument so the cap holds across calls, not just within one.
    pub loop_iterations: HashMap<String, u32>,
}

impl DslScheduler {
    pub fn new(
        graph: TaskGraph,
        orchestrator: Arc<dyn Orchestrator>,
        evaluator: Arc<dyn ConditionEvaluator>,
        store: Arc<dyn ObjectStore>,
        max_pending_tasks: usize,
        max_do_while_iterations: u32,
    ) -> Self {
        Self {
            graph,
            orchestrator,
            evaluator,
            store,
            max_pending_tasks,
            max_do_while_iterations,
        }
    }

    /// Runs the whole graph to completion within a single stream, returning
    /// the merged context and any task exceptions accumulated along the way.
    /// A non-empty `task_exceptions` means the run should ultimately be
    /// reported as failed, but every task that *could* still run was given
    /// the chance to.
    ///
    /// `loop_iterations` carries forward do-while iteration counts from a
    /// prior call over the same graph (pass `HashMap::new()` for a fresh
    /// run); see [`SchedulerRun::loop_iterations`].
    pub async fn run(
        &mut self,
        wf_exec_id: &str,
        stream_id: StreamId,
        mut loop_iterations: HashMap<String, u32>,
    ) -> Result<SchedulerRun> {
        let mut ctx = ExecutionContext::new(None);
        let mut task_exceptions = Vec::new();
        let mut in_flight: JoinSet<(String, std::result::Result<TaskResult, ActionErrorInfo>)> =
            JoinSet::new();
        let mut queued: HashSet<String> = HashSet::new();
        let mut ready_queue: Vec<String> = self.graph.roots();
        let mut stopped_enqueuing = false;

        loop {
            while !stopped_enqueuing
                && !ready_queue.is_empty()
                && in_flight.len() < self.max_pending_tasks
            {
                let ref_ = ready_queue.remove(0);
                if !queued.insert(ref_.clone()) {
                    continue;
                }
                let Some(stmt) = self.graph.statement(&ref_).cloned() else {
                    continue;
                };

                if stmt.action == "core.loop.end" {
                    let count = loop_iterations.entry(ref_.clone()).or_insert(0);
                    *count += 1;
                    if *count > self.max_do_while_iterations {
                        task_exceptions.push(ActionErrorInfo {
                            ref_: ref_.clone(),
                            message: format!(
                                "exceeded max do-while iterations ({})",
                                self.max_do_while_iterations
                            ),
                            type_: "LoopExecutionError".to_string(),
                            attempt: *count,
                            stream_id: stream_id.to_string(),
                            children: vec![],
                        });
                        stopped_enqueuing = true;
                        continue;
                    }
                }

                if let Some(expr) = &stmt.run_if {
                    match self.evaluator.evaluate(expr, &ctx) {
                        Ok(true) => {}
                        Ok(false) => {
                            debug!(ref_ = %ref_, "run_if false, skipping");
                            let (ready, skipped) = self.graph.complete(&ref_, TaskOutcome::Skipped);
                            ready_queue.extend(ready);
                            for s in skipped {
                                queued.insert(s.clone());
                            }
                            continue;
                        }
                        Err(err) => {
                            warn!(ref_ = %ref_, error = %err, "run_if evaluation errored");
                            task_exceptions.push(run_if_error(&ref_, &stream_id, err));
                            let (ready, skipped) = self.graph.complete(&ref_, TaskOutcome::Failed);
                            ready_queue.extend(ready);
                            for s in skipped {
                                queued.insert(s.clone());
                            }
                            continue;
                        }
                    }
                }

                let ref_for_task = ref_.clone();

                if let Some(scatter_spec) = stmt.scatter.clone() {
                    let orchestrator = self.orchestrator.clone();
                    let store = self.store.clone();
                    let wf_exec_id_owned = wf_exec_id.to_string();
                    let parent_stream = stream_id.clone();
                    in_flight.spawn(async move {
                        let mapped = dispatch_scatter(
                            orchestrator,
                            store,
                            stmt,
                            scatter_spec,
                            wf_exec_id_owned,
                            parent_stream,
                        )
                        .await;
                        (ref_for_task, mapped)
                    });
                    continue;
                }

                let orchestrator = self.orchestrator.clone();
                let run_context = RunContext {
                    wf_exec_id: wf_exec_id.to_string(),
                    stream_id: stream_id.clone(),
                    session_id: None,
                };
                in_flight.spawn(async move {
                    let outcome = orchestrator.dispatch(stmt, run_context).await;
                    let mapped = match outcome {
                        Ok(result) if result.is_failure() => {
                            Err(result.error.clone().expect("is_failure implies error"))
                        }
                        Ok(result) => Ok(result),
                        Err(e) => Err(dispatch_error(&ref_for_task, "", e)),
                    };
                    (ref_for_task, mapped)
                });
            }

            if in_flight.is_empty() {
                break;
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            let (ref_, outcome) = joined.map_err(|e| CoreError::Orchestrator(e.to_string()))?;

            match outcome {
                Ok(result) => {
                    ctx.record(ref_.clone(), result);
                    let (ready, skipped) = self.graph.complete(&ref_, TaskOutcome::Completed);
                    ready_queue.extend(ready);
                    for s in skipped {
                        queued.insert(s.clone());
                    }
                }
                Err(err) => {
                    let has_error_edge = self.graph.has_outgoing_error_edge(&ref_);
                    ctx.record(ref_.clone(), TaskResult::failure(err.clone()));
                    if !has_error_edge {
                        error!(ref_ = %ref_, message = %err.message, "unrecoverable task failure");
                        task_exceptions.push(err);
                        stopped_enqueuing = true;
                    }
                    let (ready, skipped) = self.graph.complete(&ref_, TaskOutcome::Failed);
                    ready_queue.extend(ready);
                    for s in skipped {
                        queued.insert(s.clone());
                    }
                }
            }
        }

        if !task_exceptions.is_empty() {
            info!(count = task_exceptions.len(), "scheduler run finished with task exceptions");
        }

        Ok(SchedulerRun {
            context: ctx,
            task_exceptions,
            loop_iterations,
        })
    }
}

/// Runs a scatter/gather node: evaluates the named arg into child elements,
/// dispatches the statement once per element (each in its own child
/// stream, with the collection arg rebound to that one element), then
/// collapses the per-stream results into a single Collection via `gather`.
/// Concurrency here is internal to the node and is not bounded by the
/// scheduler's `max_pending_tasks`, the same way `for_each` expansion is
/// handled entirely inside the action dispatcher rather than by the graph
/// walk.
async fn dispatch_scatter(
    orchestrator: Arc<dyn Orchestrator>,
    store: Arc<dyn ObjectStore>,
    stmt: ActionStatement,
    scatter_spec: ScatterSpec,
    wf_exec_id: String,
    parent_stream: StreamId,
) -> std::result::Result<TaskResult, ActionErrorInfo> {
    let ref_ = stmt.ref_.clone();

    let elements = match stmt.args.get(&scatter_spec.collection_arg) {
        Some(Value::Array(items)) => items.clone(),
        Some(_) => {
            return Err(scatter_validation_error(
                &ref_,
                &parent_stream,
                format!("scatter arg '{}' is not an array", scatter_spec.collection_arg),
            ));
        }
        None => {
            return Err(scatter_validation_error(
                &ref_,
                &parent_stream,
                format!("scatter arg '{}' is missing", scatter_spec.collection_arg),
            ));
        }
    };

    let children = stream::scatter(&parent_stream, &ref_, &elements);
    let key_prefix = format!("{wf_exec_id}:{parent_stream}/{ref_}");

    let results: Vec<TaskResult> = if elements.is_empty() {
        Vec::new()
    } else {
        let mut futures = Vec::with_capacity(elements.len());
        for (child_stream, element) in children.iter().zip(elements.iter()) {
            let mut child_stmt = stmt.clone();
            child_stmt.scatter = None;
            child_stmt
                .args
                .insert(scatter_spec.collection_arg.clone(), element.clone());
            let run_context = RunContext {
                wf_exec_id: wf_exec_id.clone(),
                stream_id: child_stream.clone(),
                session_id: None,
            };
            let orchestrator = orchestrator.clone();
            let ref_for_child = ref_.clone();
            let child_stream_str = child_stream.to_string();
            futures.push(async move {
                match orchestrator.dispatch(child_stmt, run_context).await {
                    Ok(result) => result,
                    Err(e) => TaskResult::failure(dispatch_error(&ref_for_child, &child_stream_str, e)),
                }
            });
        }
        join_all(futures).await
    };

    let gathered = stream::gather(
        &store,
        &key_prefix,
        results,
        scatter_spec.gather_strategy,
        scatter_spec.drop_nulls,
    )
    .await;

    match gathered {
        Ok(stored) => Ok(TaskResult::success(stored, "collection")),
        Err(e) => Err(dispatch_error(&ref_, &parent_stream.to_string(), e)),
    }
}

fn scatter_validation_error(ref_: &str, stream_id: &StreamId, message: String) -> ActionErrorInfo {
    ActionErrorInfo {
        ref_: ref_.to_string(),
        message,
        type_: "ValidationError".to_string(),
        attempt: 1,
        stream_id: stream_id.to_string(),
        children: vec![],
    }
}
