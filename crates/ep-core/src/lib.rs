//! Core types for the energy-panel integration
//!
//! This crate defines the identifier grammar and identity records shared by
//! the migration engine and the continuity layer:
//! - `ExternalId`: the automation-visible `domain.object_id` identifier
//! - `CanonicalId`: the internal stable key (`epanel_{serial}_{circuit}_{suffix}`)
//! - `CircuitRef`/`CircuitDescriptor`: monitored branches of the panel
//! - `IdentityRecord`: the persisted link between all of the above

pub mod circuit;
pub mod external_id;
pub mod identifier;
pub mod record;

pub use circuit::{CircuitDescriptor, CircuitRef, CircuitRefError};
pub use external_id::{slugify, ExternalId, ExternalIdError};
pub use identifier::{CanonicalId, IdentifierError, ID_PREFIX};
pub use record::{IdentityRecord, NamingPattern, PlatformKind, SchemaVersion};
