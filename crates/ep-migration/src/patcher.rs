//! Registry patcher
//!
//! Applies a `MigrationPlan` as one logical transaction against a
//! persistence layer that only supports per-record writes. Writes are staged
//! in memory and flushed to disk only after the full write-set has applied;
//! any failure triggers compensating writes restoring the pre-migration
//! snapshot. Cooperative cancellation is honored at record-batch boundaries
//! only, so a record write is never left half-done.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use ep_core::IdentityRecord;
use ep_registry::{IdentityRegistry, IdentityRegistryError};

use crate::error::MigrationError;
use crate::plan::MigrationPlan;

/// Default number of plan steps between cancellation checks
pub const DEFAULT_BATCH_SIZE: usize = 16;

/// Cooperative cancellation flag, checked at batch boundaries
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; takes effect at the next batch boundary
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Transactional applier for migration plans
pub struct RegistryPatcher {
    registry: Arc<IdentityRegistry>,
    batch_size: usize,
}

impl RegistryPatcher {
    pub fn new(registry: Arc<IdentityRegistry>) -> Self {
        Self {
            registry,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Apply the plan: snapshot, validate, write sequentially, persist.
    ///
    /// On any failure the snapshot is restored and the error surfaced; no
    /// partial-migration state is observable afterwards.
    pub async fn apply(
        &self,
        plan: &MigrationPlan,
        cancel: &CancelFlag,
    ) -> Result<(), MigrationError> {
        if plan.is_empty() {
            return Ok(());
        }

        plan.validate()?;
        self.validate_against_registry(plan)?;

        let snapshot = self.registry.snapshot();

        // Renames may chain: one step's target is another step's source.
        // Every affected record leaves the indexes before any rewritten
        // record goes back in, so a not-yet-migrated record can never be
        // clobbered by an earlier step's insert.
        let mut staged = Vec::with_capacity(plan.steps.len());
        for batch in plan.steps.chunks(self.batch_size) {
            if cancel.is_cancelled() {
                warn!("migration cancelled at batch boundary, rolling back");
                self.rollback(&snapshot).await;
                return Err(MigrationError::Cancelled);
            }
            for step in batch {
                match self.registry.remove(&step.old_external_id) {
                    Some(record) => staged.push((step, record)),
                    None => {
                        warn!(
                            "migration source record missing for {}, rolling back",
                            step.old_external_id
                        );
                        self.rollback(&snapshot).await;
                        return Err(MigrationError::Apply(IdentityRegistryError::NotFound(
                            step.old_external_id.to_string(),
                        )));
                    }
                }
            }
        }

        for batch in staged.chunks(self.batch_size) {
            if cancel.is_cancelled() {
                warn!("migration cancelled at batch boundary, rolling back");
                self.rollback(&snapshot).await;
                return Err(MigrationError::Cancelled);
            }
            for (step, original) in batch.iter() {
                // legacy_id stays as originally persisted for audit;
                // only the canonical and external identifiers move.
                let mut record = (**original).clone();
                record.canonical_id = step.new_canonical_id.clone();
                record.external_id = step.new_external_id.clone();
                record.modified_at = Utc::now();
                if let Err(err) = self.registry.insert(record) {
                    warn!(
                        "migration write failed for {} ({}), rolling back",
                        step.new_external_id, err
                    );
                    self.rollback(&snapshot).await;
                    return Err(MigrationError::Apply(err));
                }
            }
        }

        if let Err(err) = self.registry.save().await {
            warn!("migration flush failed ({}), rolling back", err);
            self.rollback(&snapshot).await;
            return Err(MigrationError::Storage(err));
        }

        info!("migration plan applied: {} records", plan.steps.len());
        Ok(())
    }

    /// Target identifiers must not shadow records the plan does not touch
    fn validate_against_registry(&self, plan: &MigrationPlan) -> Result<(), MigrationError> {
        let rewritten: Vec<_> = plan.steps.iter().map(|s| &s.old_external_id).collect();
        for step in &plan.steps {
            if step.new_external_id != step.old_external_id
                && self.registry.get(&step.new_external_id).is_some()
                && !rewritten.contains(&&step.new_external_id)
            {
                return Err(MigrationError::InvalidWriteSet(format!(
                    "target external id shadows an unaffected record: {}",
                    step.new_external_id
                )));
            }
        }
        Ok(())
    }

    async fn rollback(&self, snapshot: &[IdentityRecord]) {
        self.registry.restore_snapshot(snapshot.to_vec());
        // The on-disk state was never past the snapshot (the flush happens
        // last); saving here just resyncs after a failed flush attempt.
        if let Err(err) = self.registry.save().await {
            warn!("rollback flush failed: {}", err);
        }
    }
}
