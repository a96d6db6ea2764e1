//! Persistence for the energy-panel integration
//!
//! - `Storage`: versioned JSON files under `.storage/` with atomic writes
//! - `IdentityRegistry`: multi-index registry over `IdentityRecord`s with
//!   snapshot/restore for transactional migration
//! - `MigrationMarker`: durable at-most-once migration guard

pub mod identity_registry;
pub mod marker;
pub mod storage;

pub use identity_registry::{
    IdentityRegistry, IdentityRegistryData, IdentityRegistryError, STORAGE_KEY,
};
pub use marker::{MigrationMarker, MARKER_KEY};
pub use storage::{Storable, Storage, StorageError, StorageFile, StorageResult};
