//! The subprocess wire protocol between the action runner and a sandboxed
//! worker process.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{ActionStatement, RunContext};

/// What's written to the worker's stdin: the task, its resolved context
/// (evaluated args/secrets/vars plus the implementation descriptor), and the
/// ambient run context.
#[derive(Debug, Clone, Serialize)]
pub struct RunActionInput {
    pub task: ActionStatement,
    pub resolved_args: HashMap<String, Value>,
    pub secrets: HashMap<String, Value>,
    pub run_context: RunContextWire,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunContextWire {
    pub wf_exec_id: String,
    pub stream_id: String,
    pub session_id: Option<String>,
}

impl From<&RunContext> for RunContextWire {
    fn from(ctx: &RunContext) -> Self {
        Self {
            wf_exec_id: ctx.wf_exec_id.clone(),
            stream_id: ctx.stream_id.to_string(),
            session_id: ctx.session_id.clone(),
        }
    }
}

/// What's read back on stdout: exactly one of these two shapes.
///
/// Deserialized manually rather than with `#[serde(untagged)]`: both shapes
/// share a `success` field and an untagged enum picks the first variant
/// whose required fields are *present*, not the one whose `success` value
/// actually matches, which would silently misclassify failures as
/// successes whenever `result` happens to be present-but-null.
#[derive(Debug, Clone)]
pub enum RunActionOutput {
    Success { result: Value },
    Failure { error: WorkerErrorPayload },
}

impl<'de> Deserialize<'de> for RunActionOutput {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            success: bool,
            #[serde(default)]
            result: Value,
            error: Option<WorkerErrorPayload>,
        }
        let raw = Raw::deserialize(deserializer)?;
        if raw.success {
            Ok(RunActionOutput::Success { result: raw.result })
        } else {
            let error = raw.error.ok_or_else(|| {
                serde::de::Error::missing_field("error")
            })?;
            Ok(RunActionOutput::Failure { error })
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerErrorPayload {
    #[serde(rename = "type")]
    pub type_: String,
    pub message: String,
    pub action_name: Option<String>,
    pub filename: Option<String>,
    pub function: Option<String>,
    pub loop_iteration: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_success_payload() {
        let raw = r#"{"success": true, "result": {"ok": 1}}"#;
        let parsed: RunActionOutput = serde_json::from_str(raw).unwrap();
        assert!(matches!(parsed, RunActionOutput::Success { .. }));
    }

    #[test]
    fn parses_failure_payload() {
        let raw = r#"{"success": false, "result": null, "error": {"type": "ValueError", "message": "bad input", "action_name": null, "filename": null, "function": null, "loop_iteration": null}}"#;
        let parsed: RunActionOutput = serde_json::from_str(raw).unwrap();
        match parsed {
            RunActionOutput::Failure { error, .. } => assert_eq!(error.type_, "ValueError"),
            _ => panic!("expected failure variant"),
        }
    }
}
