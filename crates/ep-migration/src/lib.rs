//! Unique-identity migration engine
//!
//! Protects long-lived statistics from identifier churn: detects which
//! schema generation an installation's stored identifiers belong to,
//! normalizes them to the canonical grammar through static lookup tables,
//! computes collision-free external identifiers for the configured naming
//! pattern, and applies the whole write-set as one compensable transaction.
//!
//! Runs exactly once per installation generation, before any polling or
//! entity creation, guarded by the durable migration marker.

pub mod engine;
pub mod error;
pub mod formula;
pub mod naming;
pub mod normalize;
pub mod patcher;
pub mod plan;
pub mod version;

pub use engine::{MigrationConfig, MigrationEngine, MigrationOutcome};
pub use error::MigrationError;
pub use formula::rewrite_references;
pub use naming::{compute_external_ids, NamingInput};
pub use normalize::{normalize, repair_missing_serial};
pub use patcher::{CancelFlag, RegistryPatcher, DEFAULT_BATCH_SIZE};
pub use plan::{MigrationPlan, PlanStep};
pub use version::detect_version;
