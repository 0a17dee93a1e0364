#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Per-node scheduling engine: queues, worker pool, resource ledger, and the
//! object-reconstruction protocol, driven by a single event-loop task.

/// Public API for the engine crate.
pub mod api;
/// Engine error types.
pub mod error;
/// Metadata-store seam (task table, object table, subscriptions).
pub mod meta;
/// Object-store seam (residency notifications in, fetch requests out).
pub mod object_store;

mod engine;
mod queues;
mod reconstruct;
mod redis_meta;
mod worker;

pub use api::{
    start_engine, start_engine_with, EngineConfig, EngineDeps, EngineEvent, EngineHandle,
    KillMode, StatusSnapshot, WorkerId, WorkerSnapshot, WorkerStage,
};
pub use error::EngineError;
pub use meta::{MemoryMetaStore, MetadataStore, StoreError, TaskStatus, TaskTableEntry};
pub use object_store::{NullObjectStore, ObjectEvent, ObjectStoreClient, SocketObjectStore};
pub use redis_meta::RedisMetaStore;
