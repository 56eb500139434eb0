//! Registry lock, version, and manifest types.
//!
//! `RegistryLock` is grounded directly on the pydantic model in
//! `tracecat/registry/lock/types.py`: the `actions` map's values must all be
//! keys in the `origins` map, enforced at construction rather than left as
//! an implicit invariant callers have to remember to check.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, Result};

/// Binds a workflow run to exact, content-addressable registry versions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryLock {
    origins: HashMap<String, String>,
    actions: HashMap<String, String>,
}

impl RegistryLock {
    /// Fails if any action is bound to an origin absent from `origins`.
    pub fn new(
        origins: HashMap<String, String>,
        actions: HashMap<String, String>,
    ) -> Result<Self> {
        for (action, origin) in &actions {
            if !origins.contains_key(origin) {
                return Err(CoreError::Validation(format!(
                    "action '{action}' is bound to origin '{origin}' which has no pinned version"
                )));
            }
        }
        Ok(Self { origins, actions })
    }

    pub fn origin_version(&self, origin: &str) -> Option<&str> {
        self.origins.get(origin).map(String::as_str)
    }

    pub fn resolve_origin(&self, action_key: &str) -> Option<&str> {
        self.actions.get(action_key).map(String::as_str)
    }

    pub fn resolve(&self, action_key: &str) -> Result<(&str, &str)> {
        let origin = self
            .actions
            .get(action_key)
            .ok_or_else(|| CoreError::NotBound {
                action: action_key.to_string(),
            })?;
        let version = self.origins.get(origin).expect(
            "invariant: every actions value is an origins key, enforced at construction",
        );
        Ok((origin.as_str(), version.as_str()))
    }

    pub fn origins(&self) -> &HashMap<String, String> {
        &self.origins
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Udf,
    Template,
}

/// A UDF's implementation descriptor: enough to locate and import it from
/// the extracted tarball venv.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdfImplementation {
    pub module: String,
    pub function: String,
    pub origin: String,
}

/// A template action's implementation: an embedded list of steps, each
/// itself invoking another action (only `core.script.run_python` may
/// appear inlined; everything else must be a bound action key).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateStep {
    pub ref_: String,
    pub action: String,
    pub args: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateImplementation {
    pub steps: Vec<TemplateStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionImplementation {
    Udf(UdfImplementation),
    Template(TemplateImplementation),
}

/// One action's full manifest entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestAction {
    pub namespace: String,
    pub name: String,
    pub action_type: ActionType,
    pub expects: Value,
    pub returns: Value,
    pub implementation: ActionImplementation,
    #[serde(default)]
    pub secrets: Vec<String>,
    #[serde(default)]
    pub options: Value,
}

impl ManifestAction {
    pub fn key(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }
}

/// An immutable, content-addressed registry snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryVersion {
    pub repository_id: String,
    pub version: String,
    pub commit_sha: Option<String>,
    pub created_at: DateTime<Utc>,
    pub manifest: HashMap<String, ManifestAction>,
    pub tarball_uri: String,
}

impl RegistryVersion {
    pub fn lookup(&self, action_key: &str) -> Option<&ManifestAction> {
        self.manifest.get(action_key)
    }

    /// Recursively collects every secret referenced by an action and, for
    /// templates, by each step's underlying action.
    pub fn collect_secrets(&self, action_key: &str) -> Result<Vec<String>> {
        let mut seen = std::collections::HashSet::new();
        self.collect_secrets_inner(action_key, &mut seen)?;
        let mut secrets: Vec<String> = seen.into_iter().collect();
        secrets.sort();
        Ok(secrets)
    }

    fn collect_secrets_inner(
        &self,
        action_key: &str,
        seen: &mut std::collections::HashSet<String>,
    ) -> Result<()> {
        let action = self
            .manifest
            .get(action_key)
            .ok_or_else(|| CoreError::NotBound {
                action: action_key.to_string(),
            })?;
        seen.extend(action.secrets.iter().cloned());
        if let ActionImplementation::Template(tmpl) = &action.implementation {
            for step in &tmpl.steps {
                if self.manifest.contains_key(&step.action) {
                    self.collect_secrets_inner(&step.action, seen)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest_action(name: &str, secrets: Vec<&str>) -> ManifestAction {
        ManifestAction {
            namespace: "core".to_string(),
            name: name.to_string(),
            action_type: ActionType::Udf,
            expects: Value::Null,
            returns: Value::Null,
            implementation: ActionImplementation::Udf(UdfImplementation {
                module: "core.actions".to_string(),
                function: name.to_string(),
                origin: "builtin".to_string(),
            }),
            secrets: secrets.into_iter().map(String::from).collect(),
            options: Value::Null,
        }
    }

    #[test]
    fn lock_rejects_dangling_origin() {
        let origins = HashMap::new();
        let mut actions = HashMap::new();
        actions.insert("core.http_request".to_string(), "builtin".to_string());
        assert!(RegistryLock::new(origins, actions).is_err());
    }

    #[test]
    fn lock_resolves_bound_action() {
        let mut origins = HashMap::new();
        origins.insert("builtin".to_string(), "2026.01.01.000000".to_string());
        let mut actions = HashMap::new();
        actions.insert("core.http_request".to_string(), "builtin".to_string());
        let lock = RegistryLock::new(origins, actions).unwrap();
        let (origin, version) = lock.resolve("core.http_request").unwrap();
        assert_eq!(origin, "builtin");
        assert_eq!(version, "2026.01.01.000000");
        assert!(lock.resolve("unknown.action").is_err());
    }

    #[test]
    fn collect_secrets_descends_templates() {
        let mut manifest = HashMap::new();
        manifest.insert(
            "core.http_request".to_string(),
            manifest_action("http_request", vec!["HTTP_TOKEN"]),
        );
        manifest.insert(
            "core.composite".to_string(),
            ManifestAction {
                namespace: "core".to_string(),
                name: "composite".to_string(),
                action_type: ActionType::Template,
                expects: Value::Null,
                returns: Value::Null,
                implementation: ActionImplementation::Template(TemplateImplementation {
                    steps: vec![TemplateStep {
                        ref_: "inner".to_string(),
                        action: "core.http_request".to_string(),
                        args: HashMap::new(),
                    }],
                }),
                secrets: vec!["COMPOSITE_SECRET".to_string()],
                options: Value::Null,
            },
        );
        let version = RegistryVersion {
            repository_id: "builtin".to_string(),
            version: "2026.01.01.000000".to_string(),
            commit_sha: None,
            created_at: Utc::now(),
            manifest,
            tarball_uri: "s3://bucket/tarball.tar.gz".to_string(),
        };
        let secrets = version.collect_secrets("core.composite").unwrap();
        assert_eq!(secrets, vec!["COMPOSITE_SECRET", "HTTP_TOKEN"]);
    }
}
