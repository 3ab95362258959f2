//! Fabric-level error types.
//!
//! Per-subscription failures travel in poll/unsubscribe error maps
//! ([`crate::registry::SubscriptionError`]); this module covers the errors
//! that fail a whole operation.

use std::io;

use thiserror::Error;

use crate::matcher::MatchError;
use crate::transport::TransportError;

/// Main error type for fabric operations.
#[derive(Error, Debug)]
pub enum FabricError {
    /// The underlying message-queue call failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A subscription socket could not be created or wired up.
    #[error("could not create subscription: {0}")]
    Subscribe(TransportError),

    /// A freshly minted id was already registered.
    #[error("subscription id collision")]
    IdCollision,

    /// Pub/sub was disabled because the bootstrap topology failed.
    #[error("pub/sub is disabled on this node")]
    Disabled,

    /// The node configuration cannot produce a working topology.
    #[error("invalid fabric configuration: {0}")]
    Config(String),

    /// A filter or projection argument failed to compile.
    #[error(transparent)]
    Match(#[from] MatchError),

    /// A background thread could not be spawned.
    #[error("could not spawn {name} thread: {source}")]
    Thread {
        /// Role of the thread that failed to start.
        name: &'static str,
        /// Spawn failure.
        source: io::Error,
    },
}

/// Result type alias for fabric operations.
pub type Result<T> = std::result::Result<T, FabricError>;
