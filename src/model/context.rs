//! The execution context: the data plane threaded through every action
//! dispatch.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::ids::StreamId;
use crate::model::object::{StoredObject, TaskResult};

/// `{ ACTIONS, TRIGGER, ENV?, SECRETS?, VARS?, var? }` scoped to one stream.
///
/// ACTIONS and TRIGGER are always present. A child stream's view is the
/// union of its own ACTIONS with every ancestor stream's ACTIONS, with the
/// child's keys shadowing the ancestors' on conflict — see
/// [`crate::scheduler::stream::StreamActions`] for where that merge happens.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub actions: HashMap<String, TaskResult>,
    pub trigger: Option<StoredObject>,
    #[serde(default)]
    pub env: HashMap<String, Value>,
    #[serde(default)]
    pub secrets: HashMap<String, Value>,
    #[serde(default)]
    pub vars: HashMap<String, Value>,
    #[serde(rename = "var", default)]
    pub loop_var: Option<Value>,
}

impl ExecutionContext {
    pub fn new(trigger: Option<StoredObject>) -> Self {
        Self {
            trigger,
            ..Default::default()
        }
    }

    pub fn record(&mut self, ref_: impl Into<String>, result: TaskResult) {
        self.actions.insert(ref_.into(), result);
    }

    pub fn get(&self, ref_: &str) -> Option<&TaskResult> {
        self.actions.get(ref_)
    }
}

/// Everything an activity needs besides the statement itself: which stream
/// it's running in, the current merged context, and the registry lock used
/// to resolve its implementation.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub wf_exec_id: String,
    pub stream_id: StreamId,
    pub session_id: Option<String>,
}
