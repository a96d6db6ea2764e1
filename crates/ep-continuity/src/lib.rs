//! Continuity and anomaly recovery
//!
//! Two concerns that keep energy statistics trustworthy across the failures
//! real installations see:
//!
//! - [`grace`]: bridges transient device outages by substituting the last
//!   known-good value inside a bounded window, and tells genuine counter
//!   resets apart from glitches instead of clamping them away.
//! - [`spike`]: scans long-term statistics for physically absurd rows left
//!   behind by counter resets and deletes exactly those rows.
//!
//! Both sit on the [`store::StatisticsStore`] seam so the host's recorder,
//! the file-backed store, or a test double can back them interchangeably.

pub mod grace;
pub mod spike;
pub mod store;

pub use grace::{ContinuityError, ContinuityStore, GraceConfig, GracePhase, PollResult, Reading};
pub use spike::{CleanupReport, SpikeCleaner, SpikeError, StatisticsSpike, SPIKE_MULTIPLIER};
pub use store::{
    FileStatisticsStore, MemoryStatisticsStore, SeriesInfo, StatSample, StatisticsStore,
    StoreError,
};
