//! Worker pool subsystem (C5).

pub mod worker_pool;

pub use worker_pool::{PoolMetrics, WorkerId, WorkerInfo, WorkerPool, WorkerPoolConfig};
