//! Durable migration marker
//!
//! Written only after a migration plan commits in full. Its presence with a
//! current `schema_version` makes setup-time migration a no-op, guaranteeing
//! at-most-once execution per installation generation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ep_core::SchemaVersion;

use crate::storage::{Storable, Storage, StorageResult};

/// Storage key for the migration marker
pub const MARKER_KEY: &str = "epanel.migration_marker";

/// Persisted `{schema_version, migrated_at}` per installation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MigrationMarker {
    /// Schema generation the stored identifiers conform to
    pub schema_version: SchemaVersion,
    /// When that generation was reached
    pub migrated_at: DateTime<Utc>,
}

impl Storable for MigrationMarker {
    const KEY: &'static str = MARKER_KEY;
    const VERSION: u32 = 1;
    const MINOR_VERSION: u32 = 1;
}

impl MigrationMarker {
    /// Marker recording that identifiers are current as of now
    pub fn current_now() -> Self {
        Self {
            schema_version: SchemaVersion::Current,
            migrated_at: Utc::now(),
        }
    }

    /// Load the marker, or `None` when no migration has ever completed
    pub async fn load(storage: &Storage) -> StorageResult<Option<Self>> {
        Ok(storage.load::<Self>(MARKER_KEY).await?.map(|f| f.data))
    }

    /// Persist the marker
    pub async fn store(&self, storage: &Storage) -> StorageResult<()> {
        storage.save(&self.to_storage_file()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn marker_roundtrip() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path());

        assert!(MigrationMarker::load(&storage).await.unwrap().is_none());

        let marker = MigrationMarker::current_now();
        marker.store(&storage).await.unwrap();

        let loaded = MigrationMarker::load(&storage).await.unwrap().unwrap();
        assert_eq!(loaded.schema_version, SchemaVersion::Current);
        assert_eq!(loaded.migrated_at, marker.migrated_at);
    }
}
