//! Execution context materialization (C6).

pub mod materialize;

pub use materialize::{materialize, MaterializedContext};
