//! Riverbed Metadata Store - durable versioned key-value storage
//!
//! Scope and stream records live in redb tables keyed by name. Every row
//! carries a version so the stream layer can serialize per-stream updates
//! with compare-and-set instead of locks.

pub mod kv;
pub mod store;
pub mod tables;

// Re-exports
pub use kv::{KvStore, MemoryKvStore};
pub use store::{MetaStore, MetaStoreError, MetaStoreResult, Versioned};
pub use tables::Table;
