//! The uniform result envelope: [`StoredObject`] and [`TaskResult`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Every action result, trigger input, and collection is wrapped as one of
/// these three shapes so that downstream code never needs to know whether a
/// value lives inline or in object storage until it actually materializes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoredObject {
    Inline {
        data: Value,
        typename: String,
    },
    External {
        bucket: String,
        key: String,
        sha256: String,
        size: u64,
    },
    Collection {
        key_prefix: String,
        length: usize,
        element_kind: String,
    },
}

impl StoredObject {
    pub fn inline(data: Value, typename: impl Into<String>) -> Self {
        StoredObject::Inline {
            data,
            typename: typename.into(),
        }
    }

    pub fn is_inline(&self) -> bool {
        matches!(self, StoredObject::Inline { .. })
    }

    pub fn is_collection(&self) -> bool {
        matches!(self, StoredObject::Collection { .. })
    }
}

/// Diagnostic metadata attached to a failed task, built from a [`CoreError`]
/// at the activity boundary.
///
/// [`CoreError`]: crate::error::CoreError
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionErrorInfo {
    #[serde(rename = "ref")]
    pub ref_: String,
    pub message: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub attempt: u32,
    pub stream_id: String,
    #[serde(default)]
    pub children: Vec<ActionErrorInfo>,
}

/// An interaction request/response attached to a task awaiting human input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionMetadata {
    pub interaction_id: String,
    pub prompt: Value,
    pub response: Option<Value>,
}

/// The outcome of one dispatched task within a stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub result: StoredObject,
    pub result_typename: String,
    pub error: Option<ActionErrorInfo>,
    pub interaction: Option<InteractionMetadata>,
    /// Set when this result references a single element of an owning
    /// collection rather than the whole value.
    pub collection_index: Option<usize>,
}

impl TaskResult {
    pub fn success(result: StoredObject, typename: impl Into<String>) -> Self {
        Self {
            result,
            result_typename: typename.into(),
            error: None,
            interaction: None,
            collection_index: None,
        }
    }

    pub fn failure(error: ActionErrorInfo) -> Self {
        Self {
            result: StoredObject::inline(Value::Null, "null"),
            result_typename: "null".to_string(),
            error: Some(error),
            interaction: None,
            collection_index: None,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_result_has_no_error() {
        let result = TaskResult::success(StoredObject::inline(Value::Bool(true), "bool"), "bool");
        assert!(!result.is_failure());
    }

    #[test]
    fn failure_result_carries_error() {
        let err = ActionErrorInfo {
            ref_: "fetch".to_string(),
            message: "boom".to_string(),
            type_: "ExecutionError".to_string(),
            attempt: 1,
            stream_id: "root:0".to_string(),
            children: vec![],
        };
        let result = TaskResult::failure(err);
        assert!(result.is_failure());
    }
}
