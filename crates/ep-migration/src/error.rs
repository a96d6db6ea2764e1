//! Migration error taxonomy
//!
//! Everything here is recoverable by restoring the pre-migration snapshot;
//! the patcher guarantees no partial-migration state is ever left persisted.

use thiserror::Error;

use ep_core::IdentifierError;
use ep_registry::{IdentityRegistryError, StorageError};

/// Errors raised by the identity migration engine
#[derive(Debug, Error)]
pub enum MigrationError {
    /// The stored identifier set mixes markers inconsistent with any known
    /// generation. Setup halts; nothing is migrated or guessed.
    #[error("version detection inconclusive: {0}")]
    AmbiguousVersion(String),

    /// A legacy identifier carries a descriptive token outside the known
    /// suffix tables. The record is skipped and the migration flagged
    /// incomplete; silent pass-through could collide with a future
    /// canonical form.
    #[error("unrecognized legacy schema token '{token}' in '{id}'")]
    UnrecognizedSchemaToken { id: String, token: String },

    /// Disambiguation exceeded its suffix budget. Indicates duplicate source
    /// data; the whole migration is aborted and rolled back.
    #[error("external id collision could not be disambiguated for '{0}'")]
    Collision(String),

    /// Automatic serial repair refused: more than one device serial is
    /// present in the record set, so the missing serial cannot be inferred.
    #[error("cannot repair serial for '{id}': {candidates} candidate serials present")]
    AmbiguousSerialRepair { id: String, candidates: usize },

    /// Cooperative cancellation observed at a batch boundary. The registry
    /// has been restored to its pre-migration snapshot.
    #[error("migration cancelled at a batch boundary")]
    Cancelled,

    /// The computed write-set failed validation before any write was applied
    #[error("write-set validation failed: {0}")]
    InvalidWriteSet(String),

    /// A registry write failed mid-apply; compensating writes have restored
    /// the snapshot.
    #[error("migration apply failed: {0}")]
    Apply(#[from] IdentityRegistryError),

    /// Persistence failure
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Identifier grammar failure outside the known repair paths
    #[error(transparent)]
    Identifier(#[from] IdentifierError),
}
