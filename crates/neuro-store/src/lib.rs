//! Job store and artifact storage implementations.

mod local;
mod memory;

#[cfg(feature = "sqlite")]
mod sqlite;

pub use local::LocalArtifactStorage;
pub use memory::InMemoryJobStore;
pub use neuro_types::{ArtifactStorage, JobStore, StorageError, StoreError};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteJobStore;
