mod redb_file;

pub use redb_file::{RedbBuffer, RedbBufferProvider};
