//! Core traits and types for buffered document synchronization.
//!
//! This crate defines the abstractions shared between the sync engine and its
//! storage backends:
//! - `LocalBuffer` / `BufferProvider`: durable local buffer, one per document instance
//! - `RemoteStore`: shared networked store, including tag sets
//! - `LockManager`: advisory locking across processes
//! - In-memory implementations of the buffer and remote store

mod buffer;
mod document;
mod error;
mod lock;
pub mod memory;
mod remote;

pub use buffer::{BufferProvider, LocalBuffer};
pub use document::{DocumentId, ReplicaRank, Value};
pub use error::StoreError;
pub use lock::{
    acquire_scoped, LockAcquireResult, LockGuard, LockManager, LockReleaseResult,
    LockRenewResult,
};
pub use memory::{Fault, MemoryBufferProvider, MemoryRemoteStore};
pub use remote::RemoteStore;
