//! # Trellis
//!
//! A publish/subscribe fabric embedded in every node of a distributed
//! database. Clients publish documents on named channels and retrieve them by
//! repeated long-polling on subscriptions; messages reach every node of the
//! deployment, so a subscriber connected to any one node sees publications
//! from any other.
//!
//! ## Architecture
//!
//! Trellis is structured in two layers:
//!
//! - **`trellis-core`**: transport wrapper, wire codec, subscription
//!   registry, long-poll engine, publish path, reaper, topology bootstrap
//! - **`trellis`**: the command surface the host database dispatches to
//!   (this crate)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use serde_json::json;
//! use trellis::{commands, Fabric, FabricConfig, NodeRole};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // One fabric per node, bootstrapped at startup.
//! let fabric = Fabric::bootstrap(FabricConfig::new(NodeRole::Shard, 27017));
//!
//! // The host's dispatcher hands commands straight through.
//! let sub = commands::subscribe(&fabric, &json!({ "subscribe": "events." }))?;
//! let id = &sub["subscriptionId"];
//!
//! commands::publish(&fabric, &json!({ "publish": "events.login", "message": { "user": 7 } }))?;
//!
//! let response = commands::poll(&fabric, &json!({ "poll": id, "timeout": 500 }))?;
//! println!("{response}");
//! # Ok(())
//! # }
//! ```
//!
//! ## Delivery model
//!
//! - Channels match by byte prefix: a subscription to `events.` receives
//!   `events.login` and `events.logout`.
//! - Delivery is pull-only and best-effort at-most-once to live subscribers;
//!   nothing is persisted.
//! - Subscriptions left unpolled for a full reaper window are reclaimed.

#![warn(missing_docs)]
#![warn(clippy::all)]
// Allow some pedantic patterns
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

// Re-export core types
pub use trellis_core::config::{FabricConfig, HostPort, NodeRole};
pub use trellis_core::error::FabricError;
pub use trellis_core::fabric::Fabric;
pub use trellis_core::id::SubscriptionId;
pub use trellis_core::message::SubscriptionMessage;
pub use trellis_core::poll::PollOutcome;
pub use trellis_core::registry::{SubscriptionError, SubscriptionInfo};

pub mod commands;

/// Development helpers (tests)
pub mod dev_tracing;
