//! Subscription identifiers.
//!
//! A [`SubscriptionId`] is 12 opaque bytes minted at subscribe time and
//! returned to the client, who presents it back on every poll/unsubscribe.
//! Ids are globally unique in practice (wall-clock seconds, a per-process
//! random tag, and a wrapping counter) and totally ordered so registry
//! iteration and response grouping are deterministic.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;
use thiserror::Error;

static PROCESS_TAG: Lazy<[u8; 5]> = Lazy::new(rand::random);
static COUNTER: Lazy<AtomicU32> = Lazy::new(|| AtomicU32::new(rand::random()));

/// Error raised when parsing a subscription id from its string form.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("subscription id must be 24 hexadecimal characters")]
pub struct ParseIdError;

/// Opaque 12-byte subscription identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId([u8; 12]);

impl SubscriptionId {
    /// Mint a fresh identifier.
    pub fn mint() -> Self {
        let seconds = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs() as u32)
            .unwrap_or(0);
        let count = COUNTER.fetch_add(1, Ordering::Relaxed);

        let mut bytes = [0u8; 12];
        bytes[0..4].copy_from_slice(&seconds.to_be_bytes());
        bytes[4..9].copy_from_slice(&*PROCESS_TAG);
        bytes[9..12].copy_from_slice(&count.to_be_bytes()[1..4]);
        Self(bytes)
    }

    /// Wrap raw bytes as an identifier.
    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    /// The raw bytes.
    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionId({self})")
    }
}

impl FromStr for SubscriptionId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 24 || !s.is_ascii() {
            return Err(ParseIdError);
        }
        let mut bytes = [0u8; 12];
        for (i, chunk) in s.as_bytes().chunks_exact(2).enumerate() {
            let pair = std::str::from_utf8(chunk).map_err(|_| ParseIdError)?;
            bytes[i] = u8::from_str_radix(pair, 16).map_err(|_| ParseIdError)?;
        }
        Ok(Self(bytes))
    }
}
