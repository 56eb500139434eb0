//! The action statement: the unit of scheduling.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which side of a completed parent a child depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdgeType {
    Success,
    Error,
}

impl Default for EdgeType {
    fn default() -> Self {
        EdgeType::Success
    }
}

/// `<ref>` or `<ref>.<edge-type>` as written in `depends_on`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DependencyRef {
    pub ref_: String,
    pub edge_type: EdgeType,
}

impl DependencyRef {
    pub fn parse(raw: &str) -> Self {
        match raw.rsplit_once('.') {
            Some((ref_, "error")) => DependencyRef {
                ref_: ref_.to_string(),
                edge_type: EdgeType::Error,
            },
            Some((ref_, "success")) => DependencyRef {
                ref_: ref_.to_string(),
                edge_type: EdgeType::Success,
            },
            _ => DependencyRef {
                ref_: raw.to_string(),
                edge_type: EdgeType::Success,
            },
        }
    }
}

/// Whether a child with multiple parent edges becomes reachable once one
/// edge is visited, or only once all of them are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinStrategy {
    All,
    Any,
}

impl Default for JoinStrategy {
    fn default() -> Self {
        JoinStrategy::All
    }
}

/// How a gather collapses errors from its child streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamErrorHandlingStrategy {
    Partition,
    Drop,
    Include,
    Raise,
}

/// Marks an [`ActionStatement`] as a scatter/gather node: `collection_arg`
/// names the entry in `args` holding the (already-resolved) array to
/// scatter over. The scheduler dispatches the statement once per element,
/// each in its own child stream with `collection_arg` rebound to that
/// element, then collapses the per-stream results back into a single
/// Collection on this ref via `gather_strategy`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScatterSpec {
    pub collection_arg: String,
    pub gather_strategy: StreamErrorHandlingStrategy,
    #[serde(default)]
    pub drop_nulls: bool,
}

/// Bounded exponential backoff with jitter, configured per action.
///
/// Grounded on the same shape as the retry policy used for the rate-limit
/// envelope (see [`crate::retry::RetryPolicy`]); this struct is the
/// declarative, per-statement counterpart that the scheduler hands to the
/// orchestrator adapter to drive an activity's retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(with = "humantime_secs")]
    pub per_attempt_timeout: Duration,
    /// Optional expression re-evaluated after each failed attempt; retrying
    /// stops early if it evaluates falsy.
    pub retry_until: Option<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            per_attempt_timeout: Duration::from_secs(300),
            retry_until: None,
        }
    }
}

mod humantime_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// The declarative unit the DAG scheduler operates on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionStatement {
    /// Unique slug within the workflow.
    pub ref_: String,
    /// Namespaced action key, e.g. `core.http_request`.
    pub action: String,
    pub args: HashMap<String, Value>,
    pub depends_on: Vec<String>,
    pub run_if: Option<String>,
    pub for_each: Option<ForEach>,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(default)]
    pub start_delay_secs: u64,
    pub wait_until: Option<String>,
    #[serde(default)]
    pub join_strategy: JoinStrategy,
    /// Literal-only; templates are rejected at validation time.
    pub environment: Option<String>,
    /// Present if this ref is a scatter/gather node; see [`ScatterSpec`].
    #[serde(default)]
    pub scatter: Option<ScatterSpec>,
}

/// A `for_each` clause. `single` expands one iterable; `multi` zips several
/// in lock-step, failing validation if their element types disagree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ForEach {
    Single(String),
    Multi(Vec<String>),
}

impl ActionStatement {
    pub fn dependencies(&self) -> Vec<DependencyRef> {
        self.depends_on.iter().map(|s| DependencyRef::parse(s)).collect()
    }
}

/// Validates a whole set of statements against the structural invariants:
/// unique refs, resolvable `depends_on`, and no templated `environment`.
pub fn validate_statements(statements: &[ActionStatement]) -> Result<(), String> {
    let mut seen = HashSet::new();
    for stmt in statements {
        if !seen.insert(stmt.ref_.as_str()) {
            return Err(format!("duplicate action ref: {}", stmt.ref_));
        }
    }
    for stmt in statements {
        for dep in stmt.dependencies() {
            if !seen.contains(dep.ref_.as_str()) {
                return Err(format!(
                    "action '{}' depends on unknown ref '{}'",
                    stmt.ref_, dep.ref_
                ));
            }
        }
        if let Some(env) = &stmt.environment {
            if env.contains("${{") {
                return Err(format!(
                    "action '{}' has a templated environment, which is not allowed",
                    stmt.ref_
                ));
            }
        }
        if let Some(ForEach::Multi(exprs)) = &stmt.for_each {
            if exprs.is_empty() {
                return Err(format!("action '{}' has an empty for_each list", stmt.ref_));
            }
        }
        if let Some(scatter) = &stmt.scatter {
            if scatter.collection_arg.is_empty() {
                return Err(format!(
                    "action '{}' has a scatter spec with an empty collection_arg",
                    stmt.ref_
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stmt(ref_: &str, depends_on: Vec<&str>) -> ActionStatement {
        ActionStatement {
            ref_: ref_.to_string(),
            action: "core.noop".to_string(),
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

    #[test]
    fn dependency_ref_defaults_to_success_edge() {
        let dep = DependencyRef::parse("fetch");
        assert_eq!(dep.ref_, "fetch");
        assert_eq!(dep.edge_type, EdgeType::Success);

        let dep = DependencyRef::parse("fetch.error");
        assert_eq!(dep.edge_type, EdgeType::Error);
    }

    #[test]
    fn duplicate_refs_are_rejected() {
        let statements = vec![stmt("a", vec![]), stmt("a", vec![])];
        assert!(validate_statements(&statements).is_err());
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let statements = vec![stmt("a", vec!["missing"])];
        assert!(validate_statements(&statements).is_err());
    }

    #[test]
    fn templated_environment_is_rejected() {
        let mut a = stmt("a", vec![]);
        a.environment = Some("${{ ENV.name }}".to_string());
        assert!(validate_statements(&[a]).is_err());
    }

    #[test]
    fn valid_graph_passes() {
        let statements = vec![stmt("a", vec![]), stmt("b", vec!["a"])];
        assert!(validate_statements(&statements).is_ok());
    }
}
