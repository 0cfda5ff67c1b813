//! Error types for the location system.
//!
//! Categorizes failures into state-machine violations (provenance conflicts,
//! unknown entities) and wire-decode problems, so callers can distinguish
//! programming errors from malformed remote input.

use crate::types::EntityId;

/// Errors produced by the location state store and the wire payload codecs.
#[derive(Debug, thiserror::Error)]
pub enum LocationError {
    /// An entity was added while a record for it already exists.
    #[error("entity {0} is already tracked")]
    AlreadyTracked(EntityId),

    /// An operation referenced an entity with no record on this node.
    #[error("entity {0} is not tracked")]
    NotTracked(EntityId),

    /// A local operation hit a replica record or vice versa. Records must
    /// pass through the absent state to change provenance.
    #[error("entity {entity} is tracked as {actual}, operation requires {expected}")]
    ProvenanceConflict {
        /// The entity whose record conflicted.
        entity: EntityId,
        /// Provenance the operation required.
        expected: &'static str,
        /// Provenance actually recorded.
        actual: &'static str,
    },

    /// A wire payload failed to decode. Fatal to that message only; the
    /// message is dropped and logged, never propagated as a fault.
    #[error("malformed payload: {0}")]
    Decode(#[from] serde_json::Error),
}
