//! Three-frame wire codec for inter-node messages.
//!
//! Every message travels as exactly three frames, on every transport socket:
//! 1. channel bytes followed by one NUL terminator
//! 2. payload document bytes (JSON)
//! 3. 8-byte little-endian unsigned send timestamp, in microseconds
//!
//! Senders stamp the timestamp; receivers never rewrite it.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use thiserror::Error;

/// Error raised when an incoming message does not follow the frame layout.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// The channel frame carried no NUL terminator.
    #[error("channel frame is missing its NUL terminator")]
    MissingTerminator,
    /// The timestamp frame was not exactly 8 bytes.
    #[error("timestamp frame must be 8 bytes but was {0}")]
    BadTimestamp(usize),
}

/// One decoded (or about-to-be-encoded) message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageFrames {
    channel: Bytes,
    payload: Bytes,
    sent_at_micros: u64,
}

impl MessageFrames {
    /// Assemble a message for sending.
    pub fn new(channel: impl Into<Bytes>, payload: impl Into<Bytes>, sent_at_micros: u64) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
            sent_at_micros,
        }
    }

    /// Channel bytes, without the wire terminator.
    pub fn channel(&self) -> &[u8] {
        &self.channel
    }

    /// Payload document bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Send timestamp in microseconds since the Unix epoch.
    pub fn sent_at_micros(&self) -> u64 {
        self.sent_at_micros
    }

    /// Serialize into the three wire frames.
    pub fn encode(&self) -> [Vec<u8>; 3] {
        let mut channel = Vec::with_capacity(self.channel.len() + 1);
        channel.extend_from_slice(&self.channel);
        channel.push(0);
        [
            channel,
            self.payload.to_vec(),
            self.sent_at_micros.to_le_bytes().to_vec(),
        ]
    }

    /// Parse the three wire frames of one received message.
    ///
    /// The channel is everything before the first NUL in frame 1; a missing
    /// terminator is an error.
    pub fn decode(channel: &[u8], payload: &[u8], timestamp: &[u8]) -> Result<Self, WireError> {
        let nul = channel
            .iter()
            .position(|&b| b == 0)
            .ok_or(WireError::MissingTerminator)?;
        let stamp: [u8; 8] = timestamp
            .try_into()
            .map_err(|_| WireError::BadTimestamp(timestamp.len()))?;
        Ok(Self {
            channel: Bytes::copy_from_slice(&channel[..nul]),
            payload: Bytes::copy_from_slice(payload),
            sent_at_micros: u64::from_le_bytes(stamp),
        })
    }
}

/// Current wall-clock time in microseconds since the Unix epoch.
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_micros() as u64)
        .unwrap_or(0)
}
