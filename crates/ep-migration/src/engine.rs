//! One-shot setup-time migration engine
//!
//! Runs synchronously before any polling or entity creation: version
//! detection, normalization, naming-pattern transform, and the transactional
//! registry patch, guarded by the durable migration marker so at most one
//! migration attempt occurs per installation generation.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tracing::{info, warn};

use ep_core::{
    CanonicalId, CircuitDescriptor, CircuitRef, ExternalId, IdentityRecord, NamingPattern,
    SchemaVersion,
};
use ep_registry::{IdentityRegistry, MigrationMarker, Storage};

use crate::error::MigrationError;
use crate::formula::rewrite_references;
use crate::naming::{compute_external_ids, NamingInput};
use crate::normalize::{normalize, repair_missing_serial};
use crate::patcher::{CancelFlag, RegistryPatcher, DEFAULT_BATCH_SIZE};
use crate::plan::{MigrationPlan, PlanStep};
use crate::version::detect_version;

/// Engine configuration
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Naming convention external identifiers are computed for
    pub naming_pattern: NamingPattern,
    /// Plan steps between cancellation checks
    pub batch_size: usize,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            naming_pattern: NamingPattern::default(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// What a migration attempt did
#[derive(Debug, Clone)]
pub struct MigrationOutcome {
    /// Detected generation, `None` when the marker short-circuited
    pub from_version: Option<SchemaVersion>,
    /// Generation the installation is at now
    pub schema_version: SchemaVersion,
    /// Records rewritten
    pub applied: usize,
    /// Legacy ids skipped over unrecognized schema tokens
    pub skipped: Vec<String>,
    /// External-id renames the plan performed
    pub renames: BTreeMap<ExternalId, ExternalId>,
}

impl MigrationOutcome {
    fn noop() -> Self {
        Self {
            from_version: None,
            schema_version: SchemaVersion::Current,
            applied: 0,
            skipped: Vec::new(),
            renames: BTreeMap::new(),
        }
    }

    /// False when records were skipped and the marker withheld
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty()
    }

    /// Rewrite one user formula for this outcome's external-id renames
    pub fn rewrite_formula(&self, formula: &str) -> String {
        rewrite_references(formula, &self.renames)
    }
}

/// Setup-time migration engine
pub struct MigrationEngine {
    storage: Arc<Storage>,
    registry: Arc<IdentityRegistry>,
    config: MigrationConfig,
}

impl MigrationEngine {
    pub fn new(
        storage: Arc<Storage>,
        registry: Arc<IdentityRegistry>,
        config: MigrationConfig,
    ) -> Self {
        Self {
            storage,
            registry,
            config,
        }
    }

    /// Run the full setup-time migration.
    ///
    /// No-op when the durable marker already records the current generation.
    /// The marker is written only after a fully complete migration; a run
    /// with skipped records leaves it absent so the next setup retries.
    pub async fn run(
        &self,
        descriptors: &HashMap<CircuitRef, CircuitDescriptor>,
        cancel: &CancelFlag,
    ) -> Result<MigrationOutcome, MigrationError> {
        if let Some(marker) = MigrationMarker::load(&self.storage).await? {
            if marker.schema_version.is_current() {
                info!("identifiers already current, skipping migration");
                return Ok(MigrationOutcome::noop());
            }
        }

        let legacy_ids = self.registry.legacy_ids();
        let from_version = detect_version(&legacy_ids)?;
        info!(
            "detected schema generation {:?} across {} records",
            from_version,
            legacy_ids.len()
        );

        let serials: BTreeSet<String> = self
            .registry
            .iter()
            .into_iter()
            .map(|r| r.device_serial.clone())
            .filter(|s| !s.is_empty())
            .collect();

        let mut skipped = Vec::new();
        let mut resolved: Vec<(Arc<IdentityRecord>, CanonicalId)> = Vec::new();
        for record in self.registry.iter() {
            let repaired = repair_missing_serial(&record.legacy_id, &serials)?;
            match normalize(&repaired) {
                Ok(canonical) => resolved.push((record, canonical)),
                Err(MigrationError::UnrecognizedSchemaToken { id, token }) => {
                    warn!("skipping '{}': unrecognized schema token '{}'", id, token);
                    skipped.push(record.legacy_id.clone());
                }
                Err(err) => return Err(err),
            }
        }

        let inputs: Vec<NamingInput> = resolved
            .iter()
            .map(|(record, canonical)| NamingInput {
                canonical_id: canonical.clone(),
                descriptor: self.descriptor_for(descriptors, record, canonical),
                platform_kind: record.platform_kind,
            })
            .collect();
        let targets = compute_external_ids(self.config.naming_pattern, &inputs)?;

        let steps: Vec<PlanStep> = resolved
            .iter()
            .map(|(record, canonical)| PlanStep {
                record_id: record.id.clone(),
                old_canonical_id: record.canonical_id.clone(),
                new_canonical_id: canonical.clone(),
                old_external_id: record.external_id.clone(),
                new_external_id: targets[canonical].clone(),
            })
            .collect();
        let plan = MigrationPlan::new(from_version, SchemaVersion::Current, steps);

        let applied = plan.steps.len();
        RegistryPatcher::new(Arc::clone(&self.registry))
            .with_batch_size(self.config.batch_size)
            .apply(&plan, cancel)
            .await?;

        if skipped.is_empty() {
            MigrationMarker::current_now().store(&self.storage).await?;
        } else {
            warn!(
                "migration incomplete: {} record(s) skipped, marker withheld",
                skipped.len()
            );
        }

        Ok(MigrationOutcome {
            from_version: Some(from_version),
            schema_version: SchemaVersion::Current,
            applied,
            skipped,
            renames: plan.renames().into_iter().collect(),
        })
    }

    /// Recompute external identifiers for a newly chosen naming pattern.
    ///
    /// Canonical identifiers are untouched and no version detection runs;
    /// this is the deliberate, explicit external-id change path.
    pub async fn apply_naming_pattern(
        &self,
        pattern: NamingPattern,
        descriptors: &HashMap<CircuitRef, CircuitDescriptor>,
        cancel: &CancelFlag,
    ) -> Result<MigrationOutcome, MigrationError> {
        let records = self.registry.iter();
        let inputs: Vec<NamingInput> = records
            .iter()
            .map(|record| NamingInput {
                canonical_id: record.canonical_id.clone(),
                descriptor: self.descriptor_for(descriptors, record, &record.canonical_id),
                platform_kind: record.platform_kind,
            })
            .collect();
        let targets = compute_external_ids(pattern, &inputs)?;

        let steps: Vec<PlanStep> = records
            .iter()
            .map(|record| PlanStep {
                record_id: record.id.clone(),
                old_canonical_id: record.canonical_id.clone(),
                new_canonical_id: record.canonical_id.clone(),
                old_external_id: record.external_id.clone(),
                new_external_id: targets[&record.canonical_id].clone(),
            })
            .collect();
        let plan = MigrationPlan::new(SchemaVersion::Current, SchemaVersion::Current, steps);

        let applied = plan.steps.len();
        RegistryPatcher::new(Arc::clone(&self.registry))
            .with_batch_size(self.config.batch_size)
            .apply(&plan, cancel)
            .await?;

        if MigrationMarker::load(&self.storage).await?.is_some() {
            MigrationMarker::current_now().store(&self.storage).await?;
        }
        info!(
            "naming pattern {:?} applied, {} external ids rewritten",
            pattern, applied
        );

        Ok(MigrationOutcome {
            from_version: Some(SchemaVersion::Current),
            schema_version: SchemaVersion::Current,
            applied,
            skipped: Vec::new(),
            renames: plan.renames().into_iter().collect(),
        })
    }

    /// Descriptor from device state, or synthesized from the record when the
    /// device no longer reports this circuit. User renames always win.
    fn descriptor_for(
        &self,
        descriptors: &HashMap<CircuitRef, CircuitDescriptor>,
        record: &IdentityRecord,
        canonical: &CanonicalId,
    ) -> CircuitDescriptor {
        if let Some(descriptor) = descriptors.get(canonical.circuit()) {
            let mut descriptor = descriptor.clone();
            if record.is_user_renamed {
                if let Some(name) = &record.display_name {
                    descriptor.display_name = name.clone();
                    descriptor.is_user_renamed = true;
                }
            }
            return descriptor;
        }
        CircuitDescriptor {
            circuit_ref: canonical.circuit().clone(),
            tab_numbers: Vec::new(),
            is_user_renamed: record.is_user_renamed,
            display_name: record
                .display_name
                .clone()
                .unwrap_or_else(|| canonical.circuit().token()),
            priority_hint: String::new(),
        }
    }
}
