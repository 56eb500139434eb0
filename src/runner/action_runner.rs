//! Action Runner (C4): dispatch a single action into a sandboxed subprocess.
//!
//! The tarball cache key and extraction semantics are grounded directly on
//! `tests/unit/test_action_runner.py`: the key is the first 16 hex
//! characters of the trimmed tarball URI's SHA256 (empty URI maps to the
//! `base` sentinel), and `ensure_tarball_extracted` is idempotent — a
//! pre-existing target directory short-circuits extraction, and concurrent
//! requests for the same key collapse into a single download.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};
use crate::model::{ActionErrorInfo, RunContext};
use crate::runner::protocol::{RunActionInput, RunActionOutput, RunContextWire};

/// First 16 hex chars of SHA256(trimmed URI); empty URI maps to `base`.
pub fn compute_tarball_cache_key(tarball_uri: &str) -> String {
    let trimmed = tarball_uri.trim();
    if trimmed.is_empty() {
        return "base".to_string();
    }
    let mut hasher = Sha256::new();
    hasher.update(trimmed.as_bytes());
    format!("{:x}", hasher.finalize())[..16].to_string()
}

/// `s3://bucket/key` → `(bucket, key)`.
pub fn parse_s3_uri(uri: &str) -> Result<(String, String)> {
    let rest = uri
        .strip_prefix("s3://")
        .ok_or_else(|| CoreError::Validation(format!("not an s3 URI: {uri}")))?;
    let (bucket, key) = rest
        .split_once('/')
        .ok_or_else(|| CoreError::Validation(format!("s3 URI missing key: {uri}")))?;
    if bucket.is_empty() || key.is_empty() {
        return Err(CoreError::Validation(format!("malformed s3 URI: {uri}")));
    }
    Ok((bucket.to_string(), key.to_string()))
}

/// Dependencies the runner needs to fetch and extract a tarball; split out
/// as a trait so tests can substitute a fake downloader, matching the way
/// `test_ensure_tarball_extracted_concurrent_requests` mocks
/// `_download_file`/`_extract_tarball`.
#[async_trait::async_trait]
pub trait TarballFetcher: Send + Sync {
    async fn download(&self, tarball_uri: &str) -> Result<Vec<u8>>;
}

pub struct ActionRunner {
    cache_dir: PathBuf,
    fetcher: Arc<dyn TarballFetcher>,
    /// One lock per cache key, created on first use, so concurrent requests
    /// for distinct tarballs don't serialize against each other.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    default_timeout: Duration,
}

impl ActionRunner {
    pub fn new(cache_dir: PathBuf, fetcher: Arc<dyn TarballFetcher>, default_timeout: Duration) -> Self {
        Self {
            cache_dir,
            fetcher,
            locks: Mutex::new(HashMap::new()),
            default_timeout,
        }
    }

    fn target_dir(&self, cache_key: &str) -> PathBuf {
        self.cache_dir.join(format!("tarball-{cache_key}"))
    }

    async fn lock_for(&self, cache_key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(cache_key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Ensures the tarball for `tarball_uri` is extracted under the cache
    /// dir, returning the extracted path. Idempotent and safe to call
    /// concurrently for the same URI.
    pub async fn ensure_tarball_extracted(&self, tarball_uri: &str) -> Result<PathBuf> {
        let cache_key = compute_tarball_cache_key(tarball_uri);
        let target = self.target_dir(&cache_key);
        if target.exists() {
            debug!(cache_key, "tarball already extracted");
            return Ok(target);
        }

        let key_lock = self.lock_for(&cache_key).await;
        let _guard = key_lock.lock().await;
        // Re-check after acquiring the lock: another caller may have
        // finished extraction while we were waiting.
        if target.exists() {
            return Ok(target);
        }

        info!(cache_key, tarball_uri, "downloading tarball venv");
        let bytes = self.fetcher.download(tarball_uri).await?;
        let tarball_path = self.cache_dir.join(format!("{cache_key}.tar.gz"));
        crate::registry::tarball::write_bytes(&tarball_path, &bytes)?;
        crate::registry::tarball::extract_tarball(&tarball_path, &target)?;
        Ok(target)
    }

    /// Runs one action as a subprocess: writes `input` as JSON to stdin,
    /// reads a single JSON document from stdout, logs stderr lines as they
    /// arrive.
    pub async fn run(
        &self,
        tarball_uri: &str,
        input: &RunActionInput,
    ) -> std::result::Result<serde_json::Value, ActionErrorInfo> {
        self.run_with_timeout(tarball_uri, input, self.default_timeout)
            .await
    }

    pub async fn run_with_timeout(
        &self,
        tarball_uri: &str,
        input: &RunActionInput,
        timeout: Duration,
    ) -> std::result::Result<serde_json::Value, ActionErrorInfo> {
        let result = tokio::time::timeout(timeout, self.run_inner(tarball_uri, input)).await;
        match result {
            Ok(inner) => inner,
            Err(_) => Err(error_info(
                &input.task.ref_,
                &input.run_context,
                "TimeoutError",
                format!("action timed out after {timeout:?}"),
            )),
        }
    }

    async fn run_inner(
        &self,
        tarball_uri: &str,
        input: &RunActionInput,
    ) -> std::result::Result<serde_json::Value, ActionErrorInfo> {
        let extracted = self
            .ensure_tarball_extracted(tarball_uri)
            .await
            .map_err(|e| error_info(&input.task.ref_, &input.run_context, "RegistryError", e.to_string()))?;

        let payload = serde_json::to_vec(input)
            .map_err(|e| error_info(&input.task.ref_, &input.run_context, "ProtocolError", e.to_string()))?;

        let mut child = Command::new("python3")
            .arg("-m")
            .arg("sentryflow_worker")
            .env("PYTHONPATH", &extracted)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                error_info(
                    &input.task.ref_,
                    &input.run_context,
                    "SubprocessError",
                    format!("failed to spawn worker: {e}"),
                )
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(&payload).await;
        }

        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");
        let mut stdout_reader = BufReader::new(stdout).lines();
        let mut stderr_reader = BufReader::new(stderr).lines();
        let mut stdout_buf = String::new();

        loop {
            tokio::select! {
                line = stdout_reader.next_line() => {
                    match line {
                        Ok(Some(l)) => { stdout_buf.push_str(&l); }
                        Ok(None) => break,
                        Err(e) => warn!(error = %e, "error reading worker stdout"),
                    }
                }
                line = stderr_reader.next_line() => {
                    match line {
                        Ok(Some(l)) => debug!(worker_stderr = %l, ref_ = %input.task.ref_, "worker stderr"),
                        Ok(None) => {},
                        Err(e) => warn!(error = %e, "error reading worker stderr"),
                    }
                }
            }
        }

        let status = child.wait().await.map_err(|e| {
            error_info(
                &input.task.ref_,
                &input.run_context,
                "SubprocessError",
                format!("failed waiting on worker: {e}"),
            )
        })?;

        if !status.success() && stdout_buf.trim().is_empty() {
            return Err(error_info(
                &input.task.ref_,
                &input.run_context,
                "SubprocessError",
                format!("worker exited with {:?} and produced no output", status.code()),
            ));
        }

        let parsed: RunActionOutput = serde_json::from_str(&stdout_buf).map_err(|e| {
            error_info(
                &input.task.ref_,
                &input.run_context,
                "ProtocolError",
                format!("malformed worker output: {e}"),
            )
        })?;

        match parsed {
            RunActionOutput::Success { result } => Ok(result),
            RunActionOutput::Failure { error } => Err(ActionErrorInfo {
                ref_: input.task.ref_.clone(),
                message: error.message,
                type_: error.type_,
                attempt: 1,
                stream_id: input.run_context.stream_id.clone(),
                children: vec![],
            }),
        }
    }
}

fn error_info(
    ref_: &str,
    run_context: &RunContextWire,
    type_: &str,
    message: String,
) -> ActionErrorInfo {
    ActionErrorInfo {
        ref_: ref_.to_string(),
        message,
        type_: type_.to_string(),
        attempt: 1,
        stream_id: run_context.stream_id.clone(),
        children: vec![],
    }
}

/// Drives a `for_each` expansion by invoking the runner once per resolved
/// iteration value, aggregating failures into a single `LoopExecutionError`
/// rather than aborting on the first one.
pub async fn run_for_each(
    runner: &ActionRunner,
    tarball_uri: &str,
    base_input: &RunActionInput,
    iterations: Vec<serde_json::Value>,
) -> std::result::Result<Vec<serde_json::Value>, CoreError> {
    let mut results = Vec::with_capacity(iterations.len());
    let mut failures = Vec::new();
    for (i, value) in iterations.iter().enumerate() {
        let mut input = base_input.clone();
        input
            .resolved_args
            .insert("__loop_var__".to_string(), value.clone());
        match runner.run(tarball_uri, &input).await {
            Ok(result) => results.push(result),
            Err(mut err) => {
                err.ref_ = format!("{}[{i}]", base_input.task.ref_);
                failures.push(err);
            }
        }
    }
    if failures.is_empty() {
        Ok(results)
    } else {
        Err(CoreError::LoopExecution {
            failed: failures.len(),
            total: iterations.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn cache_key_is_deterministic_and_16_hex_chars() {
        let a = compute_tarball_cache_key("s3://bucket/path/a.tar.gz");
        let b = compute_tarball_cache_key("s3://bucket/path/a.tar.gz");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn cache_key_is_case_sensitive() {
        let lower = compute_tarball_cache_key("s3://bucket/a.tar.gz");
        let upper = compute_tarball_cache_key("s3://BUCKET/a.tar.gz");
        assert_ne!(lower, upper);
    }

    #[test]
    fn different_uris_produce_different_keys() {
        let a = compute_tarball_cache_key("s3://bucket/a.tar.gz");
        let b = compute_tarball_cache_key("s3://bucket/b.tar.gz");
        assert_ne!(a, b);
    }

    #[test]
    fn empty_uri_maps_to_base_sentinel() {
        assert_eq!(compute_tarball_cache_key(""), "base");
        assert_eq!(compute_tarball_cache_key("   "), "base");
    }

    #[test]
    fn whitespace_is_stripped_before_hashing() {
        let a = compute_tarball_cache_key("s3://bucket/a.tar.gz");
        let b = compute_tarball_cache_key("  s3://bucket/a.tar.gz  ");
        assert_eq!(a, b);
    }

    #[test]
    fn parse_s3_uri_accepts_well_formed_uris() {
        let (bucket, key) = parse_s3_uri("s3://my-bucket/path/to/object.tar.gz").unwrap();
        assert_eq!(bucket, "my-bucket");
        assert_eq!(key, "path/to/object.tar.gz");
    }

    #[test]
    fn parse_s3_uri_rejects_malformed_uris() {
        assert!(parse_s3_uri("http://not-s3/bucket/key").is_err());
        assert!(parse_s3_uri("s3://bucket-only").is_err());
        assert!(parse_s3_uri("s3:///key-only").is_err());
    }

    struct CountingFetcher {
        downloads: AtomicUsize,
        payload: Vec<u8>,
    }

    #[async_trait::async_trait]
    impl TarballFetcher for CountingFetcher {
        async fn download(&self, _tarball_uri: &str) -> Result<Vec<u8>> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(self.payload.clone())
        }
    }

    fn sample_tarball_bytes() -> Vec<u8> {
        let src_dir = std::env::temp_dir().join(format!("sentryflow-runner-src-{}", std::process::id()));
        std::fs::create_dir_all(&src_dir).unwrap();
        std::fs::write(src_dir.join("mod.py"), b"x = 1").unwrap();
        let tarball_path = src_dir.with_extension("tar.gz");
        crate::registry::tarball::build_tarball(&src_dir, &tarball_path).unwrap();
        let bytes = std::fs::read(&tarball_path).unwrap();
        std::fs::remove_dir_all(&src_dir).ok();
        std::fs::remove_file(&tarball_path).ok();
        bytes
    }

    #[tokio::test]
    async fn ensure_tarball_extracted_short_circuits_on_existing_dir() {
        let cache_dir = std::env::temp_dir().join(format!("sentryflow-cache-{}", std::process::id()));
        std::fs::create_dir_all(&cache_dir).unwrap();
        let fetcher = Arc::new(CountingFetcher {
            downloads: AtomicUsize::new(0),
            payload: sample_tarball_bytes(),
        });
        let runner = ActionRunner::new(cache_dir.clone(), fetcher.clone(), Duration::from_secs(5));

        let uri = "s3://bucket/pre-extracted.tar.gz";
        let key = compute_tarball_cache_key(uri);
        std::fs::create_dir_all(cache_dir.join(format!("tarball-{key}"))).unwrap();

        runner.ensure_tarball_extracted(uri).await.unwrap();
        assert_eq!(fetcher.downloads.load(Ordering::SeqCst), 0);

        std::fs::remove_dir_all(&cache_dir).ok();
    }

    #[tokio::test]
    async fn concurrent_extraction_requests_dedupe_downloads() {
        let cache_dir = std::env::temp_dir().join(format!("sentryflow-cache-concurrent-{}", std::process::id()));
        std::fs::create_dir_all(&cache_dir).unwrap();
        let fetcher = Arc::new(CountingFetcher {
            downloads: AtomicUsize::new(0),
            payload: sample_tarball_bytes(),
        });
        let runner = Arc::new(ActionRunner::new(cache_dir.clone(), fetcher.clone(), Duration::from_secs(5)));

        let uri = "s3://bucket/concurrent.tar.gz";
        let mut handles = Vec::new();
        for _ in 0..3 {
            let runner = runner.clone();
            let uri = uri.to_string();
            handles.push(tokio::spawn(async move {
                runner.ensure_tarball_extracted(&uri).await.unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(fetcher.downloads.load(Ordering::SeqCst), 1);

        std::fs::remove_dir_all(&cache_dir).ok();
    }
}
