//! Identity registry
//!
//! Holds every `IdentityRecord` for one installation with indexes by
//! external, canonical, and legacy identifier. All persisted writes go
//! through here; the migration patcher is the only caller of
//! `snapshot`/`restore_snapshot`.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use dashmap::DashMap;
use indexmap::IndexMap;
use thiserror::Error;
use tracing::{debug, info};

use ep_core::{ExternalId, IdentityRecord};
use serde::{Deserialize, Serialize};

use crate::storage::{Storable, Storage, StorageFile, StorageResult};

/// Storage key for the identity registry
pub const STORAGE_KEY: &str = "epanel.identity_registry";
/// Current storage version
pub const STORAGE_VERSION: u32 = 2;
/// Current minor version
pub const STORAGE_MINOR_VERSION: u32 = 1;

/// Errors that can occur in the identity registry
#[derive(Debug, Error, Clone, PartialEq)]
pub enum IdentityRegistryError {
    /// No record with this external id
    #[error("identity not found: {0}")]
    NotFound(String),

    /// Insert would shadow an existing external id
    #[error("duplicate external id: {0}")]
    DuplicateExternalId(String),

    /// Insert would shadow an existing canonical id
    #[error("duplicate canonical id: {0}")]
    DuplicateCanonicalId(String),
}

/// Registry payload as persisted
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityRegistryData {
    /// All identity records
    pub records: Vec<IdentityRecord>,
}

impl Storable for IdentityRegistryData {
    const KEY: &'static str = STORAGE_KEY;
    const VERSION: u32 = STORAGE_VERSION;
    const MINOR_VERSION: u32 = STORAGE_MINOR_VERSION;
}

/// Multi-index registry over identity records
///
/// Primary index is external_id (insertion-ordered); canonical and legacy
/// ids map back to the external id. Entries are `Arc`-wrapped so reads never
/// clone a record.
pub struct IdentityRegistry {
    storage: Arc<Storage>,

    /// Primary index: external_id -> record
    by_external_id: RwLock<IndexMap<ExternalId, Arc<IdentityRecord>>>,

    /// Index: canonical_id string -> external_id
    by_canonical_id: DashMap<String, ExternalId>,

    /// Index: legacy_id string -> external_id
    by_legacy_id: DashMap<String, ExternalId>,

    /// Index: device serial -> set of external_ids
    by_serial: DashMap<String, HashSet<ExternalId>>,
}

impl IdentityRegistry {
    /// Create an empty registry over the given storage
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            by_external_id: RwLock::new(IndexMap::new()),
            by_canonical_id: DashMap::new(),
            by_legacy_id: DashMap::new(),
            by_serial: DashMap::new(),
        }
    }

    /// Load records from storage
    pub async fn load(&self) -> StorageResult<()> {
        if let Some(file) = self
            .storage
            .load::<IdentityRegistryData>(STORAGE_KEY)
            .await?
        {
            info!(
                "loading {} identity records from storage (v{}.{})",
                file.data.records.len(),
                file.version,
                file.minor_version
            );
            for record in file.data.records {
                self.index_record(Arc::new(record));
            }
        }
        Ok(())
    }

    /// Save all records to storage
    pub async fn save(&self) -> StorageResult<()> {
        let data = IdentityRegistryData {
            records: self.snapshot(),
        };
        let file = StorageFile::new(STORAGE_KEY, data, STORAGE_VERSION, STORAGE_MINOR_VERSION);
        self.storage.save(&file).await?;
        debug!("saved {} identity records", self.len());
        Ok(())
    }

    fn index_record(&self, record: Arc<IdentityRecord>) {
        let external_id = record.external_id.clone();
        self.by_canonical_id
            .insert(record.canonical_id.to_string(), external_id.clone());
        self.by_legacy_id
            .insert(record.legacy_id.clone(), external_id.clone());
        self.by_serial
            .entry(record.device_serial.clone())
            .or_default()
            .insert(external_id.clone());
        if let Ok(mut idx) = self.by_external_id.write() {
            idx.insert(external_id, record);
        }
    }

    fn unindex_record(&self, record: &IdentityRecord) {
        self.by_canonical_id.remove(&record.canonical_id.to_string());
        self.by_legacy_id.remove(&record.legacy_id);
        if let Some(mut ids) = self.by_serial.get_mut(&record.device_serial) {
            ids.remove(&record.external_id);
        }
        if let Ok(mut idx) = self.by_external_id.write() {
            idx.shift_remove(&record.external_id);
        }
    }

    /// Insert a new record, rejecting identifier duplicates
    pub fn insert(&self, record: IdentityRecord) -> Result<Arc<IdentityRecord>, IdentityRegistryError> {
        if self.get(&record.external_id).is_some() {
            return Err(IdentityRegistryError::DuplicateExternalId(
                record.external_id.to_string(),
            ));
        }
        let canonical = record.canonical_id.to_string();
        if self.by_canonical_id.contains_key(&canonical) {
            return Err(IdentityRegistryError::DuplicateCanonicalId(canonical));
        }

        let arc = Arc::new(record);
        self.index_record(Arc::clone(&arc));
        info!("registered identity: {}", arc.external_id);
        Ok(arc)
    }

    /// Get a record by external id
    pub fn get(&self, external_id: &ExternalId) -> Option<Arc<IdentityRecord>> {
        self.by_external_id
            .read()
            .ok()
            .and_then(|idx| idx.get(external_id).cloned())
    }

    /// Get a record by canonical id string
    pub fn get_by_canonical_id(&self, canonical_id: &str) -> Option<Arc<IdentityRecord>> {
        self.by_canonical_id
            .get(canonical_id)
            .and_then(|eid| self.get(&eid))
    }

    /// Get a record by legacy id string
    pub fn get_by_legacy_id(&self, legacy_id: &str) -> Option<Arc<IdentityRecord>> {
        self.by_legacy_id.get(legacy_id).and_then(|eid| self.get(&eid))
    }

    /// All records for one device serial
    pub fn records_for_serial(&self, serial: &str) -> Vec<Arc<IdentityRecord>> {
        self.by_serial
            .get(serial)
            .map(|ids| ids.iter().filter_map(|id| self.get(id)).collect())
            .unwrap_or_default()
    }

    /// All stored legacy id strings, in insertion order
    pub fn legacy_ids(&self) -> Vec<String> {
        self.by_external_id
            .read()
            .map(|idx| idx.values().map(|r| r.legacy_id.clone()).collect())
            .unwrap_or_default()
    }

    /// Update a record in place
    ///
    /// The closure mutates a clone; indexes are rebuilt for the new value.
    pub fn update<F>(
        &self,
        external_id: &ExternalId,
        f: F,
    ) -> Result<Arc<IdentityRecord>, IdentityRegistryError>
    where
        F: FnOnce(&mut IdentityRecord),
    {
        let current = self
            .by_external_id
            .write()
            .ok()
            .and_then(|mut idx| idx.shift_remove(external_id));

        let Some(current) = current else {
            return Err(IdentityRegistryError::NotFound(external_id.to_string()));
        };

        // Secondary indexes still point at the old value
        self.by_canonical_id.remove(&current.canonical_id.to_string());
        self.by_legacy_id.remove(&current.legacy_id);
        if let Some(mut ids) = self.by_serial.get_mut(&current.device_serial) {
            ids.remove(&current.external_id);
        }

        let mut record = (*current).clone();
        f(&mut record);
        record.modified_at = Utc::now();

        // A rename must never clobber another record; put the original back
        // and refuse.
        if record.external_id != current.external_id && self.get(&record.external_id).is_some() {
            let taken = record.external_id.to_string();
            self.index_record(current);
            return Err(IdentityRegistryError::DuplicateExternalId(taken));
        }

        let arc = Arc::new(record);
        self.index_record(Arc::clone(&arc));
        Ok(arc)
    }

    /// Remove a record by external id
    pub fn remove(&self, external_id: &ExternalId) -> Option<Arc<IdentityRecord>> {
        let record = self.get(external_id)?;
        self.unindex_record(&record);
        info!("removed identity: {}", external_id);
        Some(record)
    }

    /// Clone out every record, in insertion order
    pub fn snapshot(&self) -> Vec<IdentityRecord> {
        self.by_external_id
            .read()
            .map(|idx| idx.values().map(|r| (**r).clone()).collect())
            .unwrap_or_default()
    }

    /// Replace the full contents with a previously taken snapshot.
    ///
    /// Compensating-rollback path for the migration patcher.
    pub fn restore_snapshot(&self, records: Vec<IdentityRecord>) {
        if let Ok(mut idx) = self.by_external_id.write() {
            idx.clear();
        }
        self.by_canonical_id.clear();
        self.by_legacy_id.clear();
        self.by_serial.clear();
        let count = records.len();
        for record in records {
            self.index_record(Arc::new(record));
        }
        info!("restored identity registry snapshot ({} records)", count);
    }

    /// All records, in insertion order
    pub fn iter(&self) -> Vec<Arc<IdentityRecord>> {
        self.by_external_id
            .read()
            .map(|idx| idx.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Count of records
    pub fn len(&self) -> usize {
        self.by_external_id.read().map(|idx| idx.len()).unwrap_or(0)
    }

    /// True when no records are registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
