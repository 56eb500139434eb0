//! Stream partitioning: scatter creates child streams, gather collapses
//! them back with one of four error-handling strategies.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::Result;
use crate::model::{ExecutionContext, StoredObject, StreamErrorHandlingStrategy, StreamId, TaskResult};
use crate::storage::ObjectStore;

/// Per-stream ACTIONS view: the current stream's own results layered over
/// every ancestor stream's, child keys shadowing ancestors.
#[derive(Default)]
pub struct StreamActions {
    layers: Vec<HashMap<String, TaskResult>>,
}

impl StreamActions {
    pub fn merged(&self) -> HashMap<String, TaskResult> {
        let mut merged = HashMap::new();
        for layer in &self.layers {
            for (k, v) in layer {
                merged.insert(k.clone(), v.clone());
            }
        }
        merged
    }

    pub fn push_layer(&mut self, layer: HashMap<String, TaskResult>) {
        self.layers.push(layer);
    }
}

/// Builds the merged ACTIONS context visible to `stream`, given a lookup of
/// each stream's own (non-inherited) results.
pub fn view_for_stream(
    stream: &StreamId,
    per_stream_actions: &HashMap<String, HashMap<String, TaskResult>>,
) -> ExecutionContext {
    let mut chain = StreamActions::default();
    for ancestor in stream.ancestors() {
        if let Some(layer) = per_stream_actions.get(&ancestor.to_string()) {
            chain.push_layer(layer.clone());
        }
    }
    if let Some(layer) = per_stream_actions.get(&stream.to_string()) {
        chain.push_layer(layer.clone());
    }
    let mut ctx = ExecutionContext::new(None);
    ctx.actions = chain.merged();
    ctx
}

/// Scatters `elements` into one child stream per element under `scope`. An
/// empty collection produces a single skipped child stream rather than zero
/// streams, so the scope's presence is still observable downstream.
pub fn scatter(parent: &StreamId, scope: &str, elements: &[Value]) -> Vec<StreamId> {
    if elements.is_empty() {
        vec![parent.skipped_child(scope)]
    } else {
        (0..elements.len() as u32)
            .map(|i| parent.child(scope, i))
            .collect()
    }
}

/// Collapses results from child streams back onto the parent per the
/// configured error-handling strategy.
pub async fn gather(
    store: &Arc<dyn ObjectStore>,
    key_prefix: &str,
    results: Vec<TaskResult>,
    strategy: StreamErrorHandlingStrategy,
    drop_nulls: bool,
) -> Result<StoredObject> {
    let mut kept: Vec<TaskResult> = results;
    if drop_nulls {
        kept.retain(|r| !matches!(&r.result, StoredObject::Inline { data, .. } if data.is_null()));
    }

    let any_failed = kept.iter().any(|r| r.is_failure());

    let elements: Vec<StoredObject> = match strategy {
        StreamErrorHandlingStrategy::Raise => {
            if any_failed {
                return Err(crate::error::CoreError::Execution {
                    ref_: key_prefix.to_string(),
                    message: "one or more scatter streams failed".to_string(),
                });
            }
            kept.into_iter().map(|r| r.result).collect()
        }
        StreamErrorHandlingStrategy::Drop => kept
            .into_iter()
            .filter(|r| !r.is_failure())
            .map(|r| r.result)
            .collect(),
        StreamErrorHandlingStrategy::Include => kept.into_iter().map(|r| r.result).collect(),
        StreamErrorHandlingStrategy::Partition => {
            let (errors, successes): (Vec<_>, Vec<_>) =
                kept.into_iter().partition(|r| r.is_failure());
            let success_values: Vec<StoredObject> = successes.into_iter().map(|r| r.result).collect();
            let error_values: Vec<StoredObject> = errors
                .into_iter()
                .map(|r| {
                    let err = r.error.unwrap_or_else(|| crate::model::ActionErrorInfo {
                        ref_: key_prefix.to_string(),
                        message: "unknown error".to_string(),
                        type_: "ExecutionError".to_string(),
                        attempt: 1,
                        stream_id: key_prefix.to_string(),
                        children: vec![],
                    });
                    StoredObject::inline(serde_json::to_value(err).unwrap_or(Value::Null), "error")
                })
                .collect();
            let results_collection = store
                .store_collection(&format!("{key_prefix}/results"), success_values)
                .await?;
            let errors_collection = store
                .store_collection(&format!("{key_prefix}/errors"), error_values)
                .await?;
            return Ok(StoredObject::inline(
                serde_json::json!({
                    "results": serde_json::to_value(&results_collection)?,
                    "errors": serde_json::to_value(&errors_collection)?,
                }),
                "partition",
            ));
        }
    };

    store.store_collection(key_prefix, elements).await
}
