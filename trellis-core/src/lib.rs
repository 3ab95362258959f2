//! Trellis Core
//!
//! This crate contains the engine of the pub/sub fabric embedded in every
//! database node:
//! - Typed wrapper over the message-queue library (`transport`)
//! - Three-frame wire codec and clock (`wire`)
//! - Subscription identifiers (`id`)
//! - Match predicates and projections (`matcher`)
//! - Subscription registry with the exclusive poll lease (`registry`)
//! - Multi-subscription long-poll engine (`poll`)
//! - Outbound publish path and peer bookkeeping (`publish`)
//! - Idle-subscription reclamation (`reaper`)
//! - Per-role topology bootstrap (`topology`)
//! - The node-wide handle tying it together (`fabric`)

#![deny(unsafe_code)]
// Allow some pedantic lints that are intentional in this crate
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]

pub mod config;
pub mod endpoint;
pub mod error;
pub mod fabric;
pub mod id;
pub mod matcher;
pub mod message;
pub mod poll;
pub mod publish;
pub mod reaper;
pub mod registry;
pub mod transport;
pub mod wire;

mod topology;

// Optional: a small prelude to make downstream crates ergonomic.
// Keep it minimal to avoid API lock-in.
pub mod prelude {
    pub use crate::config::{FabricConfig, HostPort, NodeRole};
    pub use crate::error::{FabricError, Result};
    pub use crate::fabric::Fabric;
    pub use crate::id::SubscriptionId;
    pub use crate::message::SubscriptionMessage;
    pub use crate::poll::PollOutcome;
    pub use crate::registry::{SubscriptionError, SubscriptionInfo};
}
