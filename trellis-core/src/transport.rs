//! Thin typed wrapper over the ZeroMQ messaging library.
//!
//! Everything the fabric does on the wire goes through this module:
//! - typed sockets of kinds {PUB, SUB, PUSH, PULL}
//! - bind/connect by URI (`tcp://host:port`, `inproc://name`)
//! - subscribe filters on SUB sockets
//! - multipart send, blocking and non-blocking receive
//! - a bounded multi-socket readiness wait
//! - a blocking `proxy` that forwards every frame from one socket to another
//!
//! Contract: sockets are NOT thread-safe. Callers must guarantee exclusive
//! access for the duration of every operation (the registry's lease and the
//! publisher's send mutex exist for exactly this reason).

use std::fmt;

use thiserror::Error;

pub use zmq::PollItem;

/// Socket kinds used by the fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketKind {
    /// PUB socket for broadcasting messages to subscribers
    Pub,
    /// SUB socket for receiving messages matching a subscribed prefix
    Sub,
    /// PUSH socket for handing messages to a shared queue
    Push,
    /// PULL socket for draining a shared queue
    Pull,
}

impl SocketKind {
    /// Get the socket kind as a string name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pub => "PUB",
            Self::Sub => "SUB",
            Self::Push => "PUSH",
            Self::Pull => "PULL",
        }
    }

    fn to_zmq(self) -> zmq::SocketType {
        match self {
            Self::Pub => zmq::PUB,
            Self::Sub => zmq::SUB,
            Self::Push => zmq::PUSH,
            Self::Pull => zmq::PULL,
        }
    }
}

impl fmt::Display for SocketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error raised by a failed transport operation.
///
/// Carries the library's error code and message verbatim.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("transport error {code}: {message}")]
pub struct TransportError {
    /// Implementation-defined error code (the library's raw errno).
    pub code: i32,
    /// Human-readable description from the library.
    pub message: String,
}

impl From<zmq::Error> for TransportError {
    fn from(err: zmq::Error) -> Self {
        Self {
            code: err.to_raw(),
            message: err.message().to_string(),
        }
    }
}

/// Result type alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Shared messaging context.
///
/// Sockets created from the same context can reach each other over
/// `inproc://` endpoints; cloning the handle shares the context.
#[derive(Clone)]
pub struct Context {
    inner: zmq::Context,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// Create a fresh context with its own `inproc` namespace.
    pub fn new() -> Self {
        Self {
            inner: zmq::Context::new(),
        }
    }

    /// Create a socket of the given kind.
    pub fn socket(&self, kind: SocketKind) -> TransportResult<Socket> {
        let inner = self.inner.socket(kind.to_zmq())?;
        Ok(Socket { inner, kind })
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context").finish_non_exhaustive()
    }
}

/// A single messaging socket.
///
/// Closed when dropped. Not thread-safe: wrap in a mutex (or hand exclusive
/// ownership to one thread) before sharing.
pub struct Socket {
    inner: zmq::Socket,
    kind: SocketKind,
}

impl Socket {
    /// The kind this socket was created as.
    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    /// Accept incoming connections on `endpoint`.
    pub fn bind(&self, endpoint: &str) -> TransportResult<()> {
        self.inner.bind(endpoint)?;
        Ok(())
    }

    /// Connect to a peer at `endpoint`.
    pub fn connect(&self, endpoint: &str) -> TransportResult<()> {
        self.inner.connect(endpoint)?;
        Ok(())
    }

    /// Drop the connection to `endpoint` previously made with [`connect`].
    ///
    /// [`connect`]: Socket::connect
    pub fn disconnect(&self, endpoint: &str) -> TransportResult<()> {
        self.inner.disconnect(endpoint)?;
        Ok(())
    }

    /// Set a subscription filter on a SUB socket.
    ///
    /// An empty prefix matches every message.
    pub fn set_subscribe(&self, prefix: &[u8]) -> TransportResult<()> {
        self.inner.set_subscribe(prefix)?;
        Ok(())
    }

    /// Send a multipart message; all frames are delivered atomically.
    pub fn send_frames(&self, frames: &[&[u8]]) -> TransportResult<()> {
        let Some((last, rest)) = frames.split_last() else {
            return Ok(());
        };
        for frame in rest {
            self.inner.send(*frame, zmq::SNDMORE)?;
        }
        self.inner.send(*last, 0)?;
        Ok(())
    }

    /// Receive one frame, blocking until it arrives.
    pub fn recv(&self) -> TransportResult<Vec<u8>> {
        Ok(self.inner.recv_bytes(0)?)
    }

    /// Receive one frame without blocking; `None` when nothing is queued.
    pub fn recv_nowait(&self) -> TransportResult<Option<Vec<u8>>> {
        match self.inner.recv_bytes(zmq::DONTWAIT) {
            Ok(frame) => Ok(Some(frame)),
            Err(zmq::Error::EAGAIN) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Build a readiness entry for [`wait`].
    pub fn poll_item(&self) -> PollItem<'_> {
        self.inner.as_poll_item(zmq::POLLIN)
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket").field("kind", &self.kind).finish()
    }
}

/// Wait up to `timeout_ms` for any of `items` to become readable.
///
/// Returns the number of readable sockets; 0 means the timeout elapsed.
pub fn wait(items: &mut [PollItem<'_>], timeout_ms: i64) -> TransportResult<usize> {
    let ready = zmq::poll(items, timeout_ms)?;
    Ok(ready as usize)
}

/// Blocking forwarder: moves every frame from `from` to `to` until one of the
/// sockets terminates. Intended to run on a dedicated thread for the life of
/// the process; steady-state forwarding is lossless.
pub fn proxy(from: &Socket, to: &Socket) -> TransportResult<()> {
    zmq::proxy(&from.inner, &to.inner)?;
    Ok(())
}
