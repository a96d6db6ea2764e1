//! Grace-period continuity store
//!
//! Keeps cumulative and instant sensors coherent across transient outages.
//! Each tracked sensor runs a small state machine:
//!
//! ```text
//! FRESH --(failed/implausible poll)--> STALE --(window elapsed)--> EXPIRED
//!   ^---------(plausible value)----------'
//! ```
//!
//! While STALE the last known-good value is substituted; once the grace
//! window elapses the sensor reports unavailable instead of flat-lining a
//! chart indefinitely. A monotonic counter that genuinely reset is recorded
//! as a spike candidate for the cleanup subsystem, never accepted or
//! silently clamped.
//!
//! The store takes `&mut self` for every poll: one in-flight cycle per
//! device, no races on `last_good_value`.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use ep_core::ExternalId;

use crate::spike::StatisticsSpike;
use crate::store::{StatisticsStore, StoreError};

/// Continuity errors; non-fatal to the host, the affected sensor reports
/// unavailable instead.
#[derive(Debug, Error)]
pub enum ContinuityError {
    #[error("statistics store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
}

/// Grace-period tuning
#[derive(Debug, Clone)]
pub struct GraceConfig {
    /// How long a stale value may be substituted, measured from the last
    /// good timestamp
    pub grace_window: Duration,
    /// Tolerance below the last good value before a monotonic reading is
    /// implausible
    pub epsilon: f64,
    /// Consecutive implausible polls before a drop can count as a reset
    pub reset_min_consecutive: u32,
    /// Drop fraction of the last good value that marks a reset
    pub reset_drop_ratio: f64,
    /// Alternative reset trigger: drop exceeding this multiple of the mean
    /// recent positive delta
    pub reset_delta_multiplier: f64,
}

impl Default for GraceConfig {
    fn default() -> Self {
        Self {
            grace_window: Duration::seconds(600),
            epsilon: 0.01,
            reset_min_consecutive: 2,
            reset_drop_ratio: 0.5,
            reset_delta_multiplier: 10.0,
        }
    }
}

/// Phase of one sensor's continuity state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GracePhase {
    /// Most recent poll produced a plausible value
    Fresh,
    /// Bridging a gap with the last known-good value
    Stale,
    /// Grace window elapsed without a valid reading
    Expired,
}

/// Raw outcome of one poll for one sensor
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PollResult {
    /// The device reported a value
    Value(f64),
    /// The device answered with its "unknown" sentinel
    Unknown,
    /// The poll itself failed
    Failed,
}

/// What the sensor reports after continuity handling
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reading {
    Value(f64),
    Unavailable,
}

/// Per-sensor continuity state
#[derive(Debug, Clone)]
pub struct GraceState {
    pub external_id: ExternalId,
    pub last_good_value: f64,
    pub last_good_timestamp: DateTime<Utc>,
    pub monotonic: bool,
    pub phase: GracePhase,
    /// Consecutive polls below `last_good - epsilon`
    below_count: u32,
    /// True once this reset episode produced a cleanup candidate
    reset_reported: bool,
    /// Recent positive deltas, for reset proportionality
    recent_deltas: VecDeque<f64>,
}

const RECENT_DELTA_CAP: usize = 16;

impl GraceState {
    fn new(external_id: ExternalId, value: f64, now: DateTime<Utc>, monotonic: bool) -> Self {
        Self {
            external_id,
            last_good_value: value,
            last_good_timestamp: now,
            monotonic,
            phase: GracePhase::Fresh,
            below_count: 0,
            reset_reported: false,
            recent_deltas: VecDeque::new(),
        }
    }

    fn mean_recent_delta(&self) -> f64 {
        if self.recent_deltas.is_empty() {
            return 0.0;
        }
        self.recent_deltas.iter().sum::<f64>() / self.recent_deltas.len() as f64
    }
}

/// Continuity store: one per monitored device
pub struct ContinuityStore {
    config: GraceConfig,
    states: HashMap<ExternalId, GraceState>,
    reset_candidates: Vec<StatisticsSpike>,
}

impl ContinuityStore {
    pub fn new(config: GraceConfig) -> Self {
        Self {
            config,
            states: HashMap::new(),
            reset_candidates: Vec::new(),
        }
    }

    /// Seed grace state from the host's durable statistics after a restart.
    ///
    /// In-memory-only state cannot bridge the outages this store exists to
    /// bridge, so the last recorded value and timestamp per tracked sensor
    /// are read back from the statistics store.
    pub async fn restore(
        &mut self,
        store: &dyn StatisticsStore,
        tracked: &[(ExternalId, bool)],
    ) -> Result<(), ContinuityError> {
        for (external_id, monotonic) in tracked {
            if let Some(sample) = store.last_sample(external_id).await? {
                debug!(
                    "restored grace state for {} at {}",
                    external_id, sample.timestamp
                );
                self.states.insert(
                    external_id.clone(),
                    GraceState::new(
                        external_id.clone(),
                        sample.value,
                        sample.timestamp,
                        *monotonic,
                    ),
                );
            }
        }
        info!("continuity store restored {} states", self.states.len());
        Ok(())
    }

    /// Feed one poll result through the state machine and get the value the
    /// sensor should report.
    pub fn record_poll(
        &mut self,
        external_id: &ExternalId,
        monotonic: bool,
        result: PollResult,
        now: DateTime<Utc>,
    ) -> Reading {
        match result {
            PollResult::Value(value) => self.record_value(external_id, monotonic, value, now),
            PollResult::Unknown | PollResult::Failed => self.record_miss(external_id, now),
        }
    }

    fn record_value(
        &mut self,
        external_id: &ExternalId,
        monotonic: bool,
        value: f64,
        now: DateTime<Utc>,
    ) -> Reading {
        let Some(state) = self.states.get_mut(external_id) else {
            // First valid reading creates the state
            self.states.insert(
                external_id.clone(),
                GraceState::new(external_id.clone(), value, now, monotonic),
            );
            return Reading::Value(value);
        };

        let implausible = monotonic && value < state.last_good_value - self.config.epsilon;
        if !implausible {
            if value > state.last_good_value {
                state.recent_deltas.push_back(value - state.last_good_value);
                if state.recent_deltas.len() > RECENT_DELTA_CAP {
                    state.recent_deltas.pop_front();
                }
            }
            state.last_good_value = value;
            state.last_good_timestamp = now;
            state.phase = GracePhase::Fresh;
            state.below_count = 0;
            state.reset_reported = false;
            return Reading::Value(value);
        }

        // Monotonic regression: stale until proven to be a genuine reset
        state.below_count += 1;
        let drop = state.last_good_value - value;
        let mean_delta = state.mean_recent_delta();
        let proportionally_large = drop >= self.config.reset_drop_ratio * state.last_good_value.abs()
            || (mean_delta > 0.0 && drop >= self.config.reset_delta_multiplier * mean_delta);

        // One candidate per reset episode; further below-epsilon polls of the
        // same episode would only duplicate it.
        if !state.reset_reported
            && state.below_count >= self.config.reset_min_consecutive
            && proportionally_large
        {
            state.reset_reported = true;
            warn!(
                "{}: counter reset detected ({} -> {}), recording spike candidate",
                external_id, state.last_good_value, value
            );
            self.reset_candidates.push(StatisticsSpike {
                external_id: external_id.clone(),
                timestamp: now,
                reported_value: value,
                baseline_rate: mean_delta,
            });
        }

        self.stale_reading(external_id, now)
    }

    fn record_miss(&mut self, external_id: &ExternalId, now: DateTime<Utc>) -> Reading {
        if !self.states.contains_key(external_id) {
            return Reading::Unavailable;
        }
        self.stale_reading(external_id, now)
    }

    fn stale_reading(&mut self, external_id: &ExternalId, now: DateTime<Utc>) -> Reading {
        let grace_window = self.config.grace_window;
        let Some(state) = self.states.get_mut(external_id) else {
            return Reading::Unavailable;
        };
        if now - state.last_good_timestamp <= grace_window {
            state.phase = GracePhase::Stale;
            Reading::Value(state.last_good_value)
        } else {
            if state.phase != GracePhase::Expired {
                warn!("{}: grace window elapsed, reporting unavailable", external_id);
            }
            state.phase = GracePhase::Expired;
            Reading::Unavailable
        }
    }

    /// Current phase of a tracked sensor
    pub fn phase(&self, external_id: &ExternalId) -> Option<GracePhase> {
        self.states.get(external_id).map(|s| s.phase)
    }

    /// Grace state of a tracked sensor
    pub fn state(&self, external_id: &ExternalId) -> Option<&GraceState> {
        self.states.get(external_id)
    }

    /// Drain reset candidates accumulated since the last call; handed to the
    /// spike cleanup subsystem.
    pub fn take_reset_candidates(&mut self) -> Vec<StatisticsSpike> {
        std::mem::take(&mut self.reset_candidates)
    }

    /// Forget a sensor's state after its reset was cleaned up, so the next
    /// valid reading starts a fresh baseline.
    pub fn acknowledge_reset(&mut self, external_id: &ExternalId) {
        if self.states.remove(external_id).is_some() {
            info!("{}: reset acknowledged, baseline cleared", external_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn eid() -> ExternalId {
        "sensor.main_panel_produced_energy".parse().unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn store() -> ContinuityStore {
        ContinuityStore::new(GraceConfig::default())
    }

    #[test]
    fn grace_window_timeline_from_last_good() {
        let mut cs = store();
        let id = eid();

        // last_good = 120 at t0
        assert_eq!(
            cs.record_poll(&id, true, PollResult::Value(120.0), at(0)),
            Reading::Value(120.0)
        );

        // Outage: every poll in (t0, t0+600] returns 120
        for secs in [1, 60, 300, 600] {
            assert_eq!(
                cs.record_poll(&id, true, PollResult::Failed, at(secs)),
                Reading::Value(120.0),
                "poll at t0+{secs}s"
            );
            assert_eq!(cs.phase(&id), Some(GracePhase::Stale));
        }

        // Past the window: unavailable, not a stale number
        assert_eq!(
            cs.record_poll(&id, true, PollResult::Failed, at(700)),
            Reading::Unavailable
        );
        assert_eq!(cs.phase(&id), Some(GracePhase::Expired));
    }

    #[test]
    fn recovery_while_stale_adopts_fresh_value() {
        let mut cs = store();
        let id = eid();
        cs.record_poll(&id, true, PollResult::Value(120.0), at(0));
        cs.record_poll(&id, true, PollResult::Unknown, at(30));
        assert_eq!(cs.phase(&id), Some(GracePhase::Stale));

        assert_eq!(
            cs.record_poll(&id, true, PollResult::Value(125.0), at(60)),
            Reading::Value(125.0)
        );
        assert_eq!(cs.phase(&id), Some(GracePhase::Fresh));
    }

    #[test]
    fn single_regression_is_not_a_reset() {
        let mut cs = store();
        let id = eid();
        cs.record_poll(&id, true, PollResult::Value(1000.0), at(0));

        // One implausible poll: bridged, no candidate
        assert_eq!(
            cs.record_poll(&id, true, PollResult::Value(5.0), at(30)),
            Reading::Value(1000.0)
        );
        assert!(cs.take_reset_candidates().is_empty());
    }

    #[test]
    fn consecutive_large_drop_records_reset_candidate() {
        let mut cs = store();
        let id = eid();
        cs.record_poll(&id, true, PollResult::Value(1000.0), at(0));
        cs.record_poll(&id, true, PollResult::Value(5.0), at(30));
        cs.record_poll(&id, true, PollResult::Value(6.0), at(60));

        let candidates = cs.take_reset_candidates();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].reported_value, 6.0);
        // Candidates drain
        assert!(cs.take_reset_candidates().is_empty());
    }

    #[test]
    fn reset_episode_yields_exactly_one_candidate() {
        let mut cs = store();
        let id = eid();
        cs.record_poll(&id, true, PollResult::Value(1000.0), at(0));

        // A long post-reset stretch keeps polling below the old level
        for (i, value) in [5.0, 6.0, 7.0, 8.0, 9.0].into_iter().enumerate() {
            cs.record_poll(&id, true, PollResult::Value(value), at(30 * (i as i64 + 1)));
        }

        assert_eq!(cs.take_reset_candidates().len(), 1);

        // Recovery to a plausible value closes the episode; a second reset
        // opens a new one
        cs.record_poll(&id, true, PollResult::Value(1001.0), at(300));
        cs.record_poll(&id, true, PollResult::Value(2.0), at(330));
        cs.record_poll(&id, true, PollResult::Value(3.0), at(360));
        assert_eq!(cs.take_reset_candidates().len(), 1);
    }

    #[test]
    fn small_wobble_within_epsilon_is_plausible() {
        let mut cs = store();
        let id = eid();
        cs.record_poll(&id, true, PollResult::Value(100.0), at(0));
        // 100.0 - 0.005 is inside epsilon: accepted as-is
        assert_eq!(
            cs.record_poll(&id, true, PollResult::Value(99.995), at(30)),
            Reading::Value(99.995)
        );
        assert_eq!(cs.phase(&id), Some(GracePhase::Fresh));
    }

    #[test]
    fn non_monotonic_sensor_accepts_any_value() {
        let mut cs = store();
        let id: ExternalId = "sensor.kitchen_power".parse().unwrap();
        cs.record_poll(&id, false, PollResult::Value(1500.0), at(0));
        assert_eq!(
            cs.record_poll(&id, false, PollResult::Value(3.0), at(30)),
            Reading::Value(3.0)
        );
    }

    #[test]
    fn untracked_sensor_misses_are_unavailable() {
        let mut cs = store();
        assert_eq!(
            cs.record_poll(&eid(), true, PollResult::Failed, at(0)),
            Reading::Unavailable
        );
    }

    #[tokio::test]
    async fn restore_seeds_state_from_durable_statistics() {
        use crate::store::{MemoryStatisticsStore, StatSample, StatisticsStore};

        let stats = MemoryStatisticsStore::new();
        let id = eid();
        stats.ensure_series(&id, true).await.unwrap();
        stats
            .append_sample(&id, StatSample { timestamp: at(0), value: 120.0 })
            .await
            .unwrap();

        let mut cs = store();
        cs.restore(&stats, &[(id.clone(), true)]).await.unwrap();

        // Process restarted mid-outage: the bridge still holds
        assert_eq!(
            cs.record_poll(&id, true, PollResult::Failed, at(300)),
            Reading::Value(120.0)
        );
        assert_eq!(
            cs.record_poll(&id, true, PollResult::Failed, at(700)),
            Reading::Unavailable
        );
    }
}
