//! Connection handles shared between sessions, registries and handlers
//!
//! A [`ConnectionHandle`] is the registry-facing side of one live transport
//! connection. The session owns the socket; everyone else talks to it through
//! the close token and a small control queue on the handle. Chat traffic never
//! goes through the handle: the writer pulls it from the recipient's sink one
//! message at a time, so the sink's capacity applies while a client is slow.

use std::fmt;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::protocol::messages::{Envelope, RecipientKey};

/// Identifier of one transport connection, unique per process
pub type ConnectionId = String;

/// Control envelopes (heartbeats) that may wait for the writer
pub const CONTROL_QUEUE: usize = 16;

/// Lifecycle status of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionStatus {
    /// Transport accepted, nothing read yet
    Connecting = 0,
    /// Waiting for the identity assertion
    Handshaking = 1,
    /// Identity bound and registered
    Active = 2,
    /// Teardown in progress
    Closing = 3,
    /// Terminal
    Closed = 4,
}

impl ConnectionStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionStatus::Connecting,
            1 => ConnectionStatus::Handshaking,
            2 => ConnectionStatus::Active,
            3 => ConnectionStatus::Closing,
            _ => ConnectionStatus::Closed,
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionStatus::Connecting => "CONNECTING",
            ConnectionStatus::Handshaking => "HANDSHAKING",
            ConnectionStatus::Active => "ACTIVE",
            ConnectionStatus::Closing => "CLOSING",
            ConnectionStatus::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// Shared handle to one live connection
pub struct ConnectionHandle {
    id: ConnectionId,
    identity: OnceLock<RecipientKey>,
    status: AtomicU8,
    remote: String,
    created_at: Instant,
    connected_at_ms: u64,
    outbound: mpsc::Sender<Envelope>,
    closed: CancellationToken,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("identity", &self.identity.get())
            .field("status", &self.status())
            .field("remote", &self.remote)
            .finish()
    }
}

impl ConnectionHandle {
    /// Create a handle whose control queue feeds `outbound`
    pub fn new(remote: impl Into<String>, outbound: mpsc::Sender<Envelope>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            identity: OnceLock::new(),
            status: AtomicU8::new(ConnectionStatus::Connecting as u8),
            remote: remote.into(),
            created_at: Instant::now(),
            connected_at_ms: crate::current_timestamp(),
            outbound,
            closed: CancellationToken::new(),
        }
    }

    /// Create a handle together with the receiving end of its control queue
    pub fn channel(remote: impl Into<String>) -> (Self, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(CONTROL_QUEUE);
        (Self::new(remote, tx), rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Bound identity, if the handshake has completed
    pub fn identity(&self) -> Option<&RecipientKey> {
        self.identity.get()
    }

    /// Bind the identity once; a second call hands the rejected key back
    pub fn bind_identity(&self, key: RecipientKey) -> std::result::Result<(), RecipientKey> {
        self.identity.set(key)
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: ConnectionStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.status() == ConnectionStatus::Active && !self.is_closed()
    }

    /// Time since the transport was accepted
    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// Wall-clock connect time in milliseconds since UNIX epoch
    pub fn connected_at_ms(&self) -> u64 {
        self.connected_at_ms
    }

    /// Queue a control envelope for the connection's writer without waiting.
    ///
    /// Hands the envelope back when the connection is closed or the control
    /// queue is full.
    pub fn send(&self, envelope: Envelope) -> std::result::Result<(), Envelope> {
        if self.closed.is_cancelled() {
            return Err(envelope);
        }
        self.outbound.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(envelope) | mpsc::error::TrySendError::Closed(envelope) => envelope,
        })
    }

    /// Ask the owning session to tear the connection down
    pub fn close(&self) {
        if self.status() != ConnectionStatus::Closed {
            self.set_status(ConnectionStatus::Closing);
        }
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.outbound.is_closed()
    }

    /// Token cancelled when the connection starts closing
    pub fn close_token(&self) -> CancellationToken {
        self.closed.clone()
    }
}
