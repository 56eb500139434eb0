//! Object storage subsystem (C1).

pub mod object_store;

pub use object_store::{store_value, InMemoryObjectStore, ObjectStore};
