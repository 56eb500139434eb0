//! Sandboxed action execution (C4).

pub mod action_runner;
pub mod protocol;

pub use action_runner::{
    compute_tarball_cache_key, parse_s3_uri, run_for_each, ActionRunner, TarballFetcher,
};
pub use protocol::{RunActionInput, RunActionOutput, RunContextWire, WorkerErrorPayload};
