//! Local filesystem backends for docsync.
//!
//! - `RedbBufferProvider`: one redb file per `(DocumentId, ReplicaRank)`
//! - `FileLock`: advisory lock files shared by every process on the host

pub mod buffer;
pub mod lock;

pub use buffer::{RedbBuffer, RedbBufferProvider};
pub use lock::FileLock;
