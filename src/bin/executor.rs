//! Demo entry point: wires up the in-memory implementations of every
//! subsystem and runs a small three-step workflow end to end.
//!
//! This is not a production server — the durable runtime, real object
//! storage, and real registry persistence are all out of scope for this
//! crate. It exists to exercise the DAG scheduler, object store, and
//! orchestrator adapter together the way an integration test would, and to
//! give operators a way to sanity-check a build.

use std::collections::HashMap;
use std::sync::Arc;

use sentryflow_core::config::Config;
use sentryflow_core::model::{
    ActionStatement, ExecutionContext, JoinStrategy, RetryPolicy, StoredObject, StreamId, TaskResult,
};
use sentryflow_core::orchestrator::{ActionDispatcher, LocalOrchestrator};
use sentryflow_core::scheduler::{AlwaysTrue, DslScheduler, TaskGraph};
use sentryflow_core::storage::{InMemoryObjectStore, ObjectStore};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn noop_statement(ref_: &str, depends_on: Vec<&str>) -> ActionStatement {
    ActionStatement {
        ref_: ref_.to_string(),
        action: "core.echo".to_string(),
        args: HashMap::new(),
        depends_on: depends_on.into_iter().map(String::from).collect(),
        run_if: None,
        for_each: None,
        retry_policy: RetryPolicy::default(),
        start_delay_secs: 0,
        wait_until: None,
        join_strategy: JoinStrategy::All,
        environment: None,
        scatter: None,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::load()?;
    info!(max_pending_tasks = config.scheduler.max_pending_tasks, "loaded configuration");

    let object_store: Arc<dyn ObjectStore> =
        Arc::new(InMemoryObjectStore::new(config.object_store.clone()));

    let dispatcher: ActionDispatcher = {
        let object_store = object_store.clone();
        Arc::new(move |task, _ctx| {
            let object_store = object_store.clone();
            Box::pin(async move {
                let value = serde_json::json!({ "echoed": task.ref_ });
                let stored = object_store.store(&task.ref_, &value, "object").await?;
                Ok(TaskResult::success(stored, "object"))
            })
        })
    };
    let orchestrator = Arc::new(LocalOrchestrator::new(dispatcher));

    let graph = TaskGraph::new(vec![
        noop_statement("fetch", vec![]),
        noop_statement("transform", vec!["fetch"]),
        noop_statement("notify", vec!["transform"]),
    ]);

    let mut scheduler = DslScheduler::new(
        graph,
        orchestrator,
        Arc::new(AlwaysTrue),
        object_store.clone(),
        config.scheduler.max_pending_tasks,
        config.runner.max_do_while_iterations,
    );

    let run = scheduler
        .run("demo-workflow:run-1", StreamId::root(), HashMap::new())
        .await?;
    report(&run.context, object_store).await?;

    if !run.task_exceptions.is_empty() {
        anyhow::bail!("workflow run finished with {} task exceptions", run.task_exceptions.len());
    }
    Ok(())
}

async fn report(ctx: &ExecutionContext, object_store: Arc<dyn ObjectStore>) -> anyhow::Result<()> {
    for (ref_, result) in &ctx.actions {
        match resolve(result, &object_store).await {
            Ok(value) => info!(ref_ = %ref_, %value, "task completed"),
            Err(e) => info!(ref_ = %ref_, error = %e, "task failed"),
        }
    }
    Ok(())
}

async fn resolve(
    result: &TaskResult,
    object_store: &Arc<dyn ObjectStore>,
) -> anyhow::Result<serde_json::Value> {
    if let Some(err) = &result.error {
        anyhow::bail!(err.message.clone());
    }
    Ok(match &result.result {
        StoredObject::Inline { data, .. } => data.clone(),
        other => object_store.retrieve(other).await?,
    })
}
