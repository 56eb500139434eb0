//! Registry Sync (C3): turn a source into an immutable, content-addressed
//! [`RegistryVersion`].
//!
//! Grounded on `tracecat/registry/common.py`'s `reload_registry` bootstrap
//! (source resolution for builtin/local/remote registries) and on the
//! discovery-subprocess + validate + build-tarball + upload + persist phase
//! sequence described across `tracecat/registry/sync/*`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{info, warn};

use crate::error::{CoreError, Result};
use crate::model::{ManifestAction, RegistryVersion};
use crate::registry::resolver::InMemoryVersionStore;
use crate::registry::tarball::build_tarball;
use crate::storage::ObjectStore;

/// Where a registry's action package comes from.
#[derive(Debug, Clone)]
pub enum RegistrySource {
    Builtin { package_dir: PathBuf },
    Local { path: PathBuf },
    GitSsh { url: String, commit_sha: Option<String> },
}

impl RegistrySource {
    pub fn origin_slug(&self) -> String {
        match self {
            RegistrySource::Builtin { .. } => "builtin".to_string(),
            RegistrySource::Local { path } => format!("local:{}", path.display()),
            RegistrySource::GitSsh { url, .. } => format!("git:{url}"),
        }
    }
}

/// A discovered action, as emitted by the discovery subprocess. The real
/// subprocess protocol mirrors the action-runner's: a single JSON document
/// on stdout, diagnostics on stderr.
#[derive(Debug, Deserialize)]
struct DiscoveredAction {
    namespace: String,
    name: String,
    #[serde(default)]
    secrets: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct DiscoveryOutput {
    actions: Vec<DiscoveredAction>,
}

/// Resolves a source to a local package directory. Git sources are cloned
/// shallowly; builtin and local sources are already on disk.
async fn resolve_source(source: &RegistrySource) -> Result<PathBuf> {
    match source {
        RegistrySource::Builtin { package_dir } => Ok(package_dir.clone()),
        RegistrySource::Local { path } => {
            if !path.exists() {
                return Err(CoreError::Registry(format!(
                    "local registry path does not exist: {}",
                    path.display()
                )));
            }
            Ok(path.clone())
        }
        RegistrySource::GitSsh { url, commit_sha } => {
            let clone_dir = std::env::temp_dir().join(format!(
                "sentryflow-registry-clone-{}",
                sha_of(url)
            ));
            let status = Command::new("git")
                .args(["clone", "--depth", "1", url, clone_dir.to_str().unwrap_or_default()])
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .status()
                .await?;
            if !status.success() {
                return Err(CoreError::Registry(format!("git clone failed for {url}")));
            }
            if let Some(sha) = commit_sha {
                let status = Command::new("git")
                    .args(["-C", clone_dir.to_str().unwrap_or_default(), "checkout", sha])
                    .status()
                    .await?;
                if !status.success() {
                    return Err(CoreError::Registry(format!("git checkout {sha} failed")));
                }
            }
            Ok(clone_dir)
        }
    }
}

fn sha_of(input: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())[..16].to_string()
}

/// Invokes the discovery entrypoint as a subprocess and parses its stdout.
/// The subprocess inherits no ambient environment beyond what's explicitly
/// passed; stderr is logged but never parsed.
async fn discover_actions(package_dir: &Path) -> Result<Vec<DiscoveredAction>> {
    let output = Command::new("python3")
        .arg("-m")
        .arg("sentryflow_discovery")
        .arg(package_dir)
        .env_clear()
        .env("PYTHONPATH", package_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| CoreError::Registry(format!("failed to spawn discovery subprocess: {e}")))?;

    if !output.stderr.is_empty() {
        warn!(
            stderr = %String::from_utf8_lossy(&output.stderr),
            "discovery subprocess wrote to stderr"
        );
    }
    if !output.status.success() {
        return Err(CoreError::Registry(format!(
            "discovery subprocess exited with {:?}",
            output.status.code()
        )));
    }
    let parsed: DiscoveryOutput = serde_json::from_slice(&output.stdout)
        .map_err(|e| CoreError::Protocol(format!("malformed discovery output: {e}")))?;
    Ok(parsed.actions)
}

/// Computes the version string for a sync: short commit sha for git
/// sources, otherwise a timestamp. `now` is injected so tests stay
/// deterministic.
pub fn compute_version_string(source: &RegistrySource, now: chrono::DateTime<Utc>) -> String {
    match source {
        RegistrySource::GitSsh {
            commit_sha: Some(sha),
            ..
        } => sha.chars().take(12).collect(),
        _ => now.format("%Y.%m.%d.%H%M%S").to_string(),
    }
}

/// Applies the collision-suffix policy: if `version` already exists for this
/// origin with different content, append `.devN` for the first `N` that's
/// free.
fn resolve_collision(
    existing: &HashMap<String, RegistryVersion>,
    version: &str,
    content_hash: &str,
) -> String {
    match existing.get(version) {
        None => version.to_string(),
        Some(current) if current.tarball_uri.ends_with(content_hash) => version.to_string(),
        Some(_) => {
            let mut n = 1;
            loop {
                let candidate = format!("{version}.dev{n}");
                if !existing.contains_key(&candidate) {
                    return candidate;
                }
                n += 1;
            }
        }
    }
}

pub struct RegistrySyncService {
    object_store: Arc<dyn ObjectStore>,
    version_store: Arc<InMemoryVersionStore>,
    object_namespace: String,
}

impl RegistrySyncService {
    pub fn new(
        object_store: Arc<dyn ObjectStore>,
        version_store: Arc<InMemoryVersionStore>,
        object_namespace: impl Into<String>,
    ) -> Self {
        Self {
            object_store,
            version_store,
            object_namespace: object_namespace.into(),
        }
    }

    /// Runs the full sync pipeline: resolve, discover, build tarball,
    /// upload, persist. `build_dir` is the staging directory the tarball is
    /// assembled in before upload.
    pub async fn sync(
        &self,
        source: RegistrySource,
        build_dir: &Path,
        existing: &HashMap<String, RegistryVersion>,
    ) -> Result<RegistryVersion> {
        let package_dir = resolve_source(&source).await?;
        info!(origin = %source.origin_slug(), "resolved registry source");

        let discovered = discover_actions(&package_dir).await?;
        let manifest: HashMap<String, ManifestAction> = discovered
            .into_iter()
            .map(|d| {
                let action = ManifestAction {
                    namespace: d.namespace.clone(),
                    name: d.name.clone(),
                    action_type: crate::model::ActionType::Udf,
                    expects: serde_json::Value::Null,
                    returns: serde_json::Value::Null,
                    implementation: crate::model::ActionImplementation::Udf(
                        crate::model::UdfImplementation {
                            module: format!("{}.{}", d.namespace, d.name),
                            function: "run".to_string(),
                            origin: source.origin_slug(),
                        },
                    ),
                    secrets: d.secrets,
                    options: serde_json::Value::Null,
                };
                (action.key(), action)
            })
            .collect();

        if manifest.is_empty() {
            return Err(CoreError::Registry(
                "discovery produced zero actions".to_string(),
            ));
        }

        let tarball_path = build_dir.join("site-packages.tar.gz");
        std::fs::create_dir_all(build_dir)?;
        let (content_hash, size) = build_tarball(&package_dir, &tarball_path)?;
        info!(bytes = size, sha256 = %content_hash, "built tarball venv");

        let raw_version = compute_version_string(&source, Utc::now());
        let version = resolve_collision(existing, &raw_version, &content_hash);

        let tarball_bytes = std::fs::read(&tarball_path)?;
        let object_key = format!(
            "{}/tarball-venvs/{}/{}/site-packages.tar.gz",
            self.object_namespace,
            source.origin_slug(),
            version
        );
        let stored = self.object_store.store_bytes(&object_key, &tarball_bytes).await?;
        let tarball_uri = match &stored {
            crate::model::StoredObject::External { bucket, key, .. } => {
                format!("s3://{bucket}/{key}")
            }
            _ => format!("inline://{object_key}#{content_hash}"),
        };

        let registry_version = RegistryVersion {
            repository_id: source.origin_slug(),
            version,
            commit_sha: match &source {
                RegistrySource::GitSsh { commit_sha, .. } => commit_sha.clone(),
                _ => None,
            },
            created_at: Utc::now(),
            manifest,
            tarball_uri,
        };

        self.version_store.insert(registry_version.clone()).await;
        info!(
            origin = %registry_version.repository_id,
            version = %registry_version.version,
            actions = registry_version.manifest.len(),
            "registry sync complete"
        );
        Ok(registry_version)
    }
}
