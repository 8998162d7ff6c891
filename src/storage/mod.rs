//! Storage layer.
//!
//! The core reads and writes everything durable through a simple key/value
//! abstraction. A failing store is the only fatal condition in the system.

pub mod kv;

pub use kv::{DirKv, InMemoryKv, KvStore, StorageError};
