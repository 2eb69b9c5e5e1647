use crate::ids::{EntityId, PeerId};
use thiserror::Error;

/// Outcomes of authority-protocol operations that did not take effect.
///
/// None of these are fatal. Callers on the update loop log them and carry on.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoreError {
    /// The message refers to an entity this peer no longer knows about.
    #[error("stale reference to {entity}")]
    StaleReference { entity: EntityId },

    /// A non-owner tried to mutate authoritative state directly.
    #[error("{entity} is owned by {owner}, mutation rejected")]
    UnauthorizedMutation { entity: EntityId, owner: PeerId },

    /// Bounded retries ran out, or a required collaborator is missing.
    #[error("resource unavailable: {what}")]
    ResourceUnavailable { what: &'static str },

    /// No master is elected; master-only work has been deferred.
    #[error("no master elected, action deferred")]
    CoordinatorAbsent,

    /// The local peer lost its relay connection.
    #[error("network partition: {reason}")]
    NetworkPartition { reason: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}
