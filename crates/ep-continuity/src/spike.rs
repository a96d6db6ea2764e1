//! Statistics spike cleanup
//!
//! Counter resets and firmware glitches leave absurd rows in long-term
//! statistics: a meter that reported 12 kWh/h for years suddenly has one row
//! implying megawatts. This module scans monotonic series for samples whose
//! implied rate exceeds a multiple of the series' own baseline and deletes
//! exactly those rows. The scan completes for every series before any
//! deletion starts, so a failure mid-scan never leaves a half-cleaned
//! database.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use ep_core::ExternalId;

use crate::store::{StatSample, StatisticsStore, StoreError};

/// Widest supported cleanup window, in days
pub const MAX_DAYS_BACK: u32 = 365;

/// A sample is a spike when its implied rate exceeds this multiple of the
/// series baseline
pub const SPIKE_MULTIPLIER: f64 = 10.0;

/// Spike cleanup errors
#[derive(Debug, Error)]
pub enum SpikeError {
    #[error("cleanup window must be between 1 and {MAX_DAYS_BACK} days, got {0}")]
    InvalidWindow(u32),

    #[error("a spike cleanup is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One flagged statistics row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticsSpike {
    pub external_id: ExternalId,
    pub timestamp: DateTime<Utc>,
    pub reported_value: f64,
    /// Baseline rate the sample was judged against
    pub baseline_rate: f64,
}

/// Result of one cleanup run
#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    pub candidates: Vec<StatisticsSpike>,
    /// Rows actually removed; zero on dry runs
    pub deleted_count: usize,
}

/// Scans and repairs monotonic statistics series.
///
/// At most one cleanup runs at a time; concurrent callers get
/// [`SpikeError::AlreadyRunning`] instead of queueing.
pub struct SpikeCleaner {
    store: Arc<dyn StatisticsStore>,
    in_flight: AtomicBool,
}

impl SpikeCleaner {
    pub fn new(store: Arc<dyn StatisticsStore>) -> Self {
        Self {
            store,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Scan the last `days_back` days of every monotonic series and delete
    /// spike rows. With `dry_run` the candidates are reported but nothing is
    /// deleted.
    pub async fn cleanup_statistics_spikes(
        &self,
        days_back: u32,
        dry_run: bool,
    ) -> Result<CleanupReport, SpikeError> {
        if days_back == 0 || days_back > MAX_DAYS_BACK {
            return Err(SpikeError::InvalidWindow(days_back));
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SpikeError::AlreadyRunning);
        }

        let result = self.scan_and_delete(days_back, dry_run).await;
        self.in_flight.store(false, Ordering::Release);
        result
    }

    async fn scan_and_delete(
        &self,
        days_back: u32,
        dry_run: bool,
    ) -> Result<CleanupReport, SpikeError> {
        let since = Utc::now() - Duration::days(i64::from(days_back));
        let mut report = CleanupReport::default();

        // Full scan first; deletions only once every series was inspected
        for series in self.store.series().await? {
            if !series.monotonic {
                continue;
            }
            let samples = self.store.samples_since(&series.external_id, since).await?;
            let flagged = flag_spikes(&series.external_id, &samples);
            if !flagged.is_empty() {
                debug!(
                    "{}: {} spike candidate(s) in the last {} day(s)",
                    series.external_id,
                    flagged.len(),
                    days_back
                );
            }
            report.candidates.extend(flagged);
        }

        if dry_run {
            info!(
                "spike cleanup dry run: {} candidate(s), nothing deleted",
                report.candidates.len()
            );
            return Ok(report);
        }

        for spike in &report.candidates {
            let removed = self
                .store
                .delete_samples(&spike.external_id, &[spike.timestamp])
                .await?;
            if removed == 0 {
                warn!(
                    "{}: spike row at {} vanished before deletion",
                    spike.external_id, spike.timestamp
                );
            }
            report.deleted_count += removed;
        }
        info!(
            "spike cleanup removed {} of {} candidate row(s)",
            report.deleted_count,
            report.candidates.len()
        );
        Ok(report)
    }
}

/// Flag samples whose implied rates mark them as spikes.
///
/// The baseline is the median of the nonzero absolute rates between
/// consecutive samples in the window. A spike run is a stretch of rows
/// entered by an anomalously large upward rate and left by the next
/// anomalously large downward rate; every row inside the run is flagged,
/// however many there are. A downward break with no preceding upward one is
/// a counter reset whose new data must survive, so it never starts a run.
/// A series needs at least three samples and a positive baseline before
/// anything can be flagged.
fn flag_spikes(external_id: &ExternalId, samples: &[StatSample]) -> Vec<StatisticsSpike> {
    if samples.len() < 3 {
        return Vec::new();
    }

    let mut rates = Vec::with_capacity(samples.len() - 1);
    for pair in samples.windows(2) {
        let secs = (pair[1].timestamp - pair[0].timestamp).num_seconds();
        if secs <= 0 {
            rates.push(0.0);
            continue;
        }
        rates.push((pair[1].value - pair[0].value) / secs as f64);
    }

    let baseline = median_nonzero_abs(&rates);
    if baseline <= 0.0 {
        return Vec::new();
    }
    let threshold = SPIKE_MULTIPLIER * baseline;

    // rates[i] is the rate between samples[i] and samples[i + 1]
    let anomalous: Vec<usize> = (0..rates.len())
        .filter(|&i| rates[i].abs() > threshold)
        .collect();

    let mut flagged = Vec::new();
    let mut i = 0;
    while i < anomalous.len() {
        let entry = anomalous[i];
        if rates[entry] <= 0.0 {
            // Downward break without an open run: a reset, kept
            i += 1;
            continue;
        }
        // The run closes at the next anomalous downward rate
        let mut j = i + 1;
        while j < anomalous.len() && rates[anomalous[j]] > 0.0 {
            j += 1;
        }
        if j == anomalous.len() {
            // Never comes back down: a level shift, kept
            break;
        }
        let exit = anomalous[j];
        for idx in (entry + 1)..=exit {
            flagged.push(StatisticsSpike {
                external_id: external_id.clone(),
                timestamp: samples[idx].timestamp,
                reported_value: samples[idx].value,
                baseline_rate: baseline,
            });
        }
        i = j + 1;
    }
    flagged
}

fn median_nonzero_abs(rates: &[f64]) -> f64 {
    let mut nonzero: Vec<f64> = rates
        .iter()
        .map(|r| r.abs())
        .filter(|r| *r > 0.0)
        .collect();
    if nonzero.is_empty() {
        return 0.0;
    }
    nonzero.sort_by(|a, b| a.total_cmp(b));
    let mid = nonzero.len() / 2;
    if nonzero.len() % 2 == 1 {
        nonzero[mid]
    } else {
        (nonzero[mid - 1] + nonzero[mid]) / 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStatisticsStore;

    fn eid(s: &str) -> ExternalId {
        s.parse().unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        // Recent enough that a 1-day window covers it
        Utc::now() - Duration::hours(1) + Duration::seconds(secs)
    }

    async fn seeded_store() -> (Arc<MemoryStatisticsStore>, ExternalId) {
        let store = Arc::new(MemoryStatisticsStore::new());
        let id = eid("sensor.main_panel_produced_energy");
        store.ensure_series(&id, true).await.unwrap();
        // Steady 1.0/min, one absurd row, then back to normal
        let values = [100.0, 101.0, 102.0, 99_000.0, 104.0, 105.0];
        for (i, value) in values.into_iter().enumerate() {
            store
                .append_sample(&id, StatSample { timestamp: at(i as i64 * 60), value })
                .await
                .unwrap();
        }
        (store, id)
    }

    #[tokio::test]
    async fn dry_run_flags_without_deleting() {
        let (store, id) = seeded_store().await;
        let cleaner = SpikeCleaner::new(Arc::clone(&store) as Arc<dyn StatisticsStore>);

        let report = cleaner.cleanup_statistics_spikes(7, true).await.unwrap();
        assert_eq!(report.deleted_count, 0);
        assert_eq!(report.candidates.len(), 1);
        assert_eq!(report.candidates[0].reported_value, 99_000.0);

        // Nothing removed
        assert_eq!(store.samples_since(&id, at(-1)).await.unwrap().len(), 6);
    }

    #[tokio::test]
    async fn wet_run_deletes_exactly_the_flagged_rows() {
        let (store, id) = seeded_store().await;
        let cleaner = SpikeCleaner::new(Arc::clone(&store) as Arc<dyn StatisticsStore>);

        let dry = cleaner.cleanup_statistics_spikes(7, true).await.unwrap();
        let wet = cleaner.cleanup_statistics_spikes(7, false).await.unwrap();
        assert_eq!(wet.candidates, dry.candidates);
        assert_eq!(wet.deleted_count, 1);

        let remaining = store.samples_since(&id, at(-1)).await.unwrap();
        assert_eq!(remaining.len(), 5);
        assert!(remaining.iter().all(|s| s.value < 1000.0));
    }

    #[tokio::test]
    async fn non_monotonic_series_are_ignored() {
        let store = Arc::new(MemoryStatisticsStore::new());
        let id = eid("sensor.kitchen_power");
        store.ensure_series(&id, false).await.unwrap();
        for (i, value) in [10.0, 20.0, 90_000.0, 15.0].into_iter().enumerate() {
            store
                .append_sample(&id, StatSample { timestamp: at(i as i64 * 60), value })
                .await
                .unwrap();
        }

        let cleaner = SpikeCleaner::new(store as Arc<dyn StatisticsStore>);
        let report = cleaner.cleanup_statistics_spikes(7, true).await.unwrap();
        assert!(report.candidates.is_empty());
    }

    #[tokio::test]
    async fn window_bounds_are_enforced() {
        let store = Arc::new(MemoryStatisticsStore::new());
        let cleaner = SpikeCleaner::new(store as Arc<dyn StatisticsStore>);

        assert!(matches!(
            cleaner.cleanup_statistics_spikes(0, true).await,
            Err(SpikeError::InvalidWindow(0))
        ));
        assert!(matches!(
            cleaner.cleanup_statistics_spikes(366, true).await,
            Err(SpikeError::InvalidWindow(366))
        ));
    }

    #[tokio::test]
    async fn cleaner_is_reusable_after_a_run() {
        let (store, _) = seeded_store().await;
        let cleaner = SpikeCleaner::new(store as Arc<dyn StatisticsStore>);

        cleaner.cleanup_statistics_spikes(7, true).await.unwrap();
        // Guard released: a second sequential run succeeds
        cleaner.cleanup_statistics_spikes(7, true).await.unwrap();
    }

    #[test]
    fn consecutive_corrupted_rows_are_all_flagged() {
        let id = eid("sensor.a_energy");
        let samples: Vec<StatSample> = [100.0, 101.0, 102.0, 99_000.0, 99_001.0, 104.0, 105.0]
            .into_iter()
            .enumerate()
            .map(|(i, value)| StatSample { timestamp: at(i as i64 * 60), value })
            .collect();

        let flagged = flag_spikes(&id, &samples);
        assert_eq!(flagged.len(), 2);
        assert_eq!(flagged[0].reported_value, 99_000.0);
        assert_eq!(flagged[1].reported_value, 99_001.0);
    }

    #[test]
    fn reset_followed_by_spike_keeps_post_reset_data() {
        let id = eid("sensor.a_energy");
        // Counter resets at row 3; a wild row lands later. Only the wild
        // row may go.
        let samples: Vec<StatSample> = [1000.0, 1001.0, 1002.0, 3.0, 4.0, 90_000.0, 5.0, 6.0]
            .into_iter()
            .enumerate()
            .map(|(i, value)| StatSample { timestamp: at(i as i64 * 60), value })
            .collect();

        let flagged = flag_spikes(&id, &samples);
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].reported_value, 90_000.0);
    }

    #[test]
    fn counter_reset_data_is_not_flagged() {
        // A reset drops the level once; the rows after it are real data
        let id = eid("sensor.a_energy");
        let samples: Vec<StatSample> = [1000.0, 1001.0, 1002.0, 3.0, 4.0, 5.0]
            .into_iter()
            .enumerate()
            .map(|(i, value)| StatSample { timestamp: at(i as i64 * 60), value })
            .collect();
        assert!(flag_spikes(&id, &samples).is_empty());
    }

    #[test]
    fn short_series_never_flag() {
        let id = eid("sensor.a_energy");
        let samples = vec![
            StatSample { timestamp: at(0), value: 1.0 },
            StatSample { timestamp: at(60), value: 90_000.0 },
        ];
        assert!(flag_spikes(&id, &samples).is_empty());
    }

    #[test]
    fn flat_series_has_no_baseline_and_never_flags() {
        let id = eid("sensor.a_energy");
        let samples: Vec<StatSample> = (0..5)
            .map(|i| StatSample { timestamp: at(i * 60), value: 42.0 })
            .collect();
        assert!(flag_spikes(&id, &samples).is_empty());
    }
}
