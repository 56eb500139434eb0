//! Execution Context / Materialization (C6).
//!
//! Resolves every [`StoredObject`] in an [`ExecutionContext`] into raw JSON
//! so expression evaluation can operate on plain data, without ever
//! mutating storage.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::try_join_all;
use serde_json::Value;

use crate::error::Result;
use crate::model::{ExecutionContext, StoredObject, TaskResult};
use crate::storage::ObjectStore;

/// A fully-resolved view of an [`ExecutionContext`]: every ACTIONS entry and
/// TRIGGER replaced by their raw value.
#[derive(Debug, Clone, Default)]
pub struct MaterializedContext {
    pub actions: HashMap<String, Value>,
    pub trigger: Option<Value>,
    pub env: HashMap<String, Value>,
    pub secrets: HashMap<String, Value>,
    pub vars: HashMap<String, Value>,
    pub loop_var: Option<Value>,
}

async fn materialize_result(store: &Arc<dyn ObjectStore>, result: &TaskResult) -> Result<Value> {
    if let Some(index) = result.collection_index {
        let element = store.collection_at(&result.result, index).await?;
        store.retrieve(&element).await
    } else {
        store.retrieve(&result.result).await
    }
}

/// Materializes every entry in parallel; any single failure aborts the
/// whole operation since a partially-resolved context would silently hand
/// expressions a mix of raw and un-fetched data.
pub async fn materialize(
    store: &Arc<dyn ObjectStore>,
    ctx: &ExecutionContext,
) -> Result<MaterializedContext> {
    let refs: Vec<&String> = ctx.actions.keys().collect();
    let futures = refs
        .iter()
        .map(|ref_| materialize_result(store, &ctx.actions[*ref_]));
    let resolved = try_join_all(futures).await?;

    let actions = refs
        .into_iter()
        .cloned()
        .zip(resolved)
        .collect::<HashMap<_, _>>();

    let trigger = match &ctx.trigger {
        Some(object) => Some(store.retrieve(object).await?),
        None => None,
    };

    Ok(MaterializedContext {
        actions,
        trigger,
        env: ctx.env.clone(),
        secrets: ctx.secrets.clone(),
        vars: ctx.vars.clone(),
        loop_var: ctx.loop_var.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ObjectStoreConfig;
    use crate::storage::InMemoryObjectStore;

    #[tokio::test]
    async fn materialize_resolves_inline_and_external_results() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new(ObjectStoreConfig {
            externalize_threshold_bytes: 8,
            bucket: "test".to_string(),
        }));
        let mut ctx = ExecutionContext::new(Some(
            store.store("trigger", &Value::from(1), "number").await.unwrap(),
        ));
        let big = store
            .store("fetch", &Value::String("x".repeat(50)), "string")
            .await
            .unwrap();
        ctx.record("fetch", TaskResult::success(big, "string"));

        let materialized = materialize(&store, &ctx).await.unwrap();
        assert_eq!(materialized.trigger, Some(Value::from(1)));
        assert_eq!(
            materialized.actions.get("fetch").unwrap().as_str().unwrap().len(),
            50
        );
    }

    #[tokio::test]
    async fn materialize_respects_collection_index() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new(ObjectStoreConfig {
            externalize_threshold_bytes: 1024,
            bucket: "test".to_string(),
        }));
        let elements = vec![
            StoredObject::inline(Value::from(10), "number"),
            StoredObject::inline(Value::from(20), "number"),
        ];
        let collection = store.store_collection("run/items", elements).await.unwrap();
        let mut result = TaskResult::success(collection, "collection<number>");
        result.collection_index = Some(1);

        let mut ctx = ExecutionContext::new(None);
        ctx.record("item", result);
        let materialized = materialize(&store, &ctx).await.unwrap();
        assert_eq!(materialized.actions.get("item").unwrap(), &Value::from(20));
    }
}
