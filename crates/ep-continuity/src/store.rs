//! Durable statistics store seam
//!
//! The host platform owns the real long-term statistics database; this trait
//! is the narrow surface the continuity layer needs from it: last recorded
//! sample per series (grace-state restore), windowed reads and precise row
//! deletion (spike cleanup). A file-backed implementation over the
//! `.storage/` layer is provided for installations without a recorder, plus
//! an in-memory store for tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use ep_core::ExternalId;
use ep_registry::{Storable, Storage, StorageError, StorageFile};

/// Statistics store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("unknown statistics series: {0}")]
    UnknownSeries(String),
}

/// One persisted statistic sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatSample {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Series identity plus the property the spike cleaner filters on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesInfo {
    pub external_id: ExternalId,
    /// True for cumulative counters that must only grow
    pub monotonic: bool,
}

/// The continuity layer's view of the host's durable statistics
#[async_trait]
pub trait StatisticsStore: Send + Sync {
    /// All known series
    async fn series(&self) -> Result<Vec<SeriesInfo>, StoreError>;

    /// Create the series if absent; existing series keep their flag
    async fn ensure_series(&self, id: &ExternalId, monotonic: bool) -> Result<(), StoreError>;

    /// Most recent sample of a series, if any
    async fn last_sample(&self, id: &ExternalId) -> Result<Option<StatSample>, StoreError>;

    /// Samples at or after `since`, in timestamp order
    async fn samples_since(
        &self,
        id: &ExternalId,
        since: DateTime<Utc>,
    ) -> Result<Vec<StatSample>, StoreError>;

    /// Append one sample
    async fn append_sample(&self, id: &ExternalId, sample: StatSample) -> Result<(), StoreError>;

    /// Delete exactly the rows at the given timestamps; returns how many
    /// rows existed and were removed.
    async fn delete_samples(
        &self,
        id: &ExternalId,
        timestamps: &[DateTime<Utc>],
    ) -> Result<usize, StoreError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SeriesData {
    monotonic: bool,
    samples: Vec<StatSample>,
}

/// In-memory statistics store for tests and ephemeral setups
#[derive(Default)]
pub struct MemoryStatisticsStore {
    series: RwLock<BTreeMap<ExternalId, SeriesData>>,
}

impl MemoryStatisticsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatisticsStore for MemoryStatisticsStore {
    async fn series(&self) -> Result<Vec<SeriesInfo>, StoreError> {
        Ok(self
            .series
            .read()
            .await
            .iter()
            .map(|(id, data)| SeriesInfo {
                external_id: id.clone(),
                monotonic: data.monotonic,
            })
            .collect())
    }

    async fn ensure_series(&self, id: &ExternalId, monotonic: bool) -> Result<(), StoreError> {
        self.series
            .write()
            .await
            .entry(id.clone())
            .or_insert_with(|| SeriesData {
                monotonic,
                samples: Vec::new(),
            });
        Ok(())
    }

    async fn last_sample(&self, id: &ExternalId) -> Result<Option<StatSample>, StoreError> {
        Ok(self
            .series
            .read()
            .await
            .get(id)
            .and_then(|data| data.samples.last().copied()))
    }

    async fn samples_since(
        &self,
        id: &ExternalId,
        since: DateTime<Utc>,
    ) -> Result<Vec<StatSample>, StoreError> {
        Ok(self
            .series
            .read()
            .await
            .get(id)
            .map(|data| {
                data.samples
                    .iter()
                    .filter(|s| s.timestamp >= since)
                    .copied()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn append_sample(&self, id: &ExternalId, sample: StatSample) -> Result<(), StoreError> {
        let mut series = self.series.write().await;
        let data = series
            .get_mut(id)
            .ok_or_else(|| StoreError::UnknownSeries(id.to_string()))?;
        data.samples.push(sample);
        data.samples.sort_by_key(|s| s.timestamp);
        Ok(())
    }

    async fn delete_samples(
        &self,
        id: &ExternalId,
        timestamps: &[DateTime<Utc>],
    ) -> Result<usize, StoreError> {
        let mut series = self.series.write().await;
        let data = series
            .get_mut(id)
            .ok_or_else(|| StoreError::UnknownSeries(id.to_string()))?;
        let before = data.samples.len();
        data.samples.retain(|s| !timestamps.contains(&s.timestamp));
        Ok(before - data.samples.len())
    }
}

/// Persisted payload of the file-backed store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatisticsData {
    series: BTreeMap<String, SeriesData>,
}

impl Storable for StatisticsData {
    const KEY: &'static str = "epanel.statistics";
    const VERSION: u32 = 1;
    const MINOR_VERSION: u32 = 1;
}

/// File-backed statistics store over the versioned `.storage/` layer.
///
/// Every mutation flushes, so the grace-state restore path always sees the
/// last committed sample after a process restart.
pub struct FileStatisticsStore {
    storage: Arc<Storage>,
    state: RwLock<StatisticsData>,
}

impl FileStatisticsStore {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            state: RwLock::new(StatisticsData::default()),
        }
    }

    /// Load persisted samples from storage
    pub async fn load(&self) -> Result<(), StoreError> {
        if let Some(file) = self.storage.load::<StatisticsData>(StatisticsData::KEY).await? {
            let mut state = self.state.write().await;
            *state = file.data;
            debug!("loaded {} statistics series", state.series.len());
        }
        Ok(())
    }

    async fn flush(&self, state: &StatisticsData) -> Result<(), StoreError> {
        let file = StorageFile::new(
            StatisticsData::KEY,
            state.clone(),
            StatisticsData::VERSION,
            StatisticsData::MINOR_VERSION,
        );
        self.storage.save(&file).await?;
        Ok(())
    }
}

#[async_trait]
impl StatisticsStore for FileStatisticsStore {
    async fn series(&self) -> Result<Vec<SeriesInfo>, StoreError> {
        let state = self.state.read().await;
        state
            .series
            .iter()
            .map(|(id, data)| {
                let external_id = id
                    .parse::<ExternalId>()
                    .map_err(|_| StoreError::UnknownSeries(id.clone()))?;
                Ok(SeriesInfo {
                    external_id,
                    monotonic: data.monotonic,
                })
            })
            .collect()
    }

    async fn ensure_series(&self, id: &ExternalId, monotonic: bool) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if !state.series.contains_key(&id.to_string()) {
            state.series.insert(
                id.to_string(),
                SeriesData {
                    monotonic,
                    samples: Vec::new(),
                },
            );
            let snapshot = state.clone();
            drop(state);
            self.flush(&snapshot).await?;
        }
        Ok(())
    }

    async fn last_sample(&self, id: &ExternalId) -> Result<Option<StatSample>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .series
            .get(&id.to_string())
            .and_then(|data| data.samples.last().copied()))
    }

    async fn samples_since(
        &self,
        id: &ExternalId,
        since: DateTime<Utc>,
    ) -> Result<Vec<StatSample>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .series
            .get(&id.to_string())
            .map(|data| {
                data.samples
                    .iter()
                    .filter(|s| s.timestamp >= since)
                    .copied()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn append_sample(&self, id: &ExternalId, sample: StatSample) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let data = state
            .series
            .get_mut(&id.to_string())
            .ok_or_else(|| StoreError::UnknownSeries(id.to_string()))?;
        data.samples.push(sample);
        data.samples.sort_by_key(|s| s.timestamp);
        let snapshot = state.clone();
        drop(state);
        self.flush(&snapshot).await
    }

    async fn delete_samples(
        &self,
        id: &ExternalId,
        timestamps: &[DateTime<Utc>],
    ) -> Result<usize, StoreError> {
        let mut state = self.state.write().await;
        let data = state
            .series
            .get_mut(&id.to_string())
            .ok_or_else(|| StoreError::UnknownSeries(id.to_string()))?;
        let before = data.samples.len();
        data.samples.retain(|s| !timestamps.contains(&s.timestamp));
        let removed = before - data.samples.len();
        let snapshot = state.clone();
        drop(state);
        self.flush(&snapshot).await?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn eid(s: &str) -> ExternalId {
        s.parse().unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[tokio::test]
    async fn memory_store_basics() {
        let store = MemoryStatisticsStore::new();
        let id = eid("sensor.a_energy");
        store.ensure_series(&id, true).await.unwrap();
        store
            .append_sample(&id, StatSample { timestamp: at(0), value: 1.0 })
            .await
            .unwrap();
        store
            .append_sample(&id, StatSample { timestamp: at(60), value: 2.0 })
            .await
            .unwrap();

        assert_eq!(store.last_sample(&id).await.unwrap().unwrap().value, 2.0);
        assert_eq!(store.samples_since(&id, at(30)).await.unwrap().len(), 1);
        assert_eq!(store.delete_samples(&id, &[at(0)]).await.unwrap(), 1);
        assert_eq!(store.samples_since(&id, at(-1)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn file_store_survives_reload() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::new(dir.path()));
        let id = eid("sensor.a_energy");

        let store = FileStatisticsStore::new(Arc::clone(&storage));
        store.ensure_series(&id, true).await.unwrap();
        store
            .append_sample(&id, StatSample { timestamp: at(0), value: 42.0 })
            .await
            .unwrap();

        let reopened = FileStatisticsStore::new(storage);
        reopened.load().await.unwrap();
        assert_eq!(
            reopened.last_sample(&id).await.unwrap().unwrap().value,
            42.0
        );
        let series = reopened.series().await.unwrap();
        assert_eq!(series.len(), 1);
        assert!(series[0].monotonic);
    }

    #[tokio::test]
    async fn append_to_unknown_series_fails() {
        let store = MemoryStatisticsStore::new();
        let err = store
            .append_sample(
                &eid("sensor.nope"),
                StatSample { timestamp: at(0), value: 0.0 },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownSeries(_)));
    }
}
