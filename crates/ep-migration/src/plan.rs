//! Migration plans
//!
//! A plan is the full computed write-set for one setup attempt: created
//! once, validated, applied atomically by the patcher, then discarded. The
//! durable migration marker prevents a plan from ever being recreated for an
//! already-current installation.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use ep_core::{CanonicalId, ExternalId, SchemaVersion};

use crate::error::MigrationError;

/// One record's worth of identifier rewrites
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    /// Internal record id
    pub record_id: String,
    pub old_canonical_id: CanonicalId,
    pub new_canonical_id: CanonicalId,
    pub old_external_id: ExternalId,
    pub new_external_id: ExternalId,
}

impl PlanStep {
    /// True when the step would not change anything
    pub fn is_noop(&self) -> bool {
        self.old_canonical_id == self.new_canonical_id
            && self.old_external_id == self.new_external_id
    }
}

/// The computed write-set for one migration attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationPlan {
    pub from_version: SchemaVersion,
    pub to_version: SchemaVersion,
    pub steps: Vec<PlanStep>,
}

impl MigrationPlan {
    /// Plan with no-op steps removed
    pub fn new(
        from_version: SchemaVersion,
        to_version: SchemaVersion,
        steps: Vec<PlanStep>,
    ) -> Self {
        Self {
            from_version,
            to_version,
            steps: steps.into_iter().filter(|s| !s.is_noop()).collect(),
        }
    }

    /// True when there is nothing to apply
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// The external-id renames this plan performs (for formula rewriting)
    pub fn renames(&self) -> Vec<(ExternalId, ExternalId)> {
        self.steps
            .iter()
            .filter(|s| s.old_external_id != s.new_external_id)
            .map(|s| (s.old_external_id.clone(), s.new_external_id.clone()))
            .collect()
    }

    /// Validate the write-set before any write is applied: no duplicate
    /// target canonical or external identifiers.
    pub fn validate(&self) -> Result<(), MigrationError> {
        let mut canonicals = HashSet::new();
        let mut externals = HashSet::new();
        for step in &self.steps {
            if !canonicals.insert(step.new_canonical_id.to_string()) {
                return Err(MigrationError::InvalidWriteSet(format!(
                    "duplicate target canonical id: {}",
                    step.new_canonical_id
                )));
            }
            if !externals.insert(step.new_external_id.clone()) {
                return Err(MigrationError::InvalidWriteSet(format!(
                    "duplicate target external id: {}",
                    step.new_external_id
                )));
            }
        }
        Ok(())
    }
}
