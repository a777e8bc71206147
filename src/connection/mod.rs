//! Server-side connections.
//!
//! A [`Connection`] binds a server-assigned [`ConnectionId`] and the caller's
//! [`Identity`] to the [`Channel`] it arrived on. Connections are created and
//! destroyed only by the [`ConnectionRegistry`]; destroying one fires its
//! cancellation token and closes the transport.
//!
//! Outbound traffic goes through a bounded per-connection outbox drained by its
//! own writer task, so a peer that stops reading only stalls itself. When the
//! outbox is full the connection is cancelled.

pub mod registry;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::channel::{Channel, ChannelError};
use crate::protocol::Message;

pub use registry::ConnectionRegistry;

/// Default number of messages queued for one connection before it is
/// considered stuck.
pub const DEFAULT_OUTBOX_CAPACITY: usize = 256;

/// Server-assigned connection identifier (hyphenated random UUID).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Generate a fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ConnectionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Authenticated caller data supplied by the host.
///
/// The crate never authenticates; it only carries what the host established.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Principal name.
    pub name: String,
    /// Role names.
    #[serde(default)]
    pub roles: Vec<String>,
    /// Free-form claims.
    #[serde(default)]
    pub claims: HashMap<String, String>,
}

impl Identity {
    /// Identity with a name and no roles or claims.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Add a role.
    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }

    /// Add a claim.
    #[must_use]
    pub fn with_claim(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.claims.insert(key.into(), value.into());
        self
    }

    /// Whether the identity carries `role`.
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// One live client connection.
pub struct Connection {
    id: ConnectionId,
    identity: Option<Identity>,
    channel: Arc<Channel>,
    cancellation: CancellationToken,
    outbox: mpsc::Sender<Message>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("identity", &self.identity.as_ref().map(|i| &i.name))
            .field("channel", &self.channel.id())
            .field("queued", &self.queued())
            .finish()
    }
}

impl Connection {
    /// Must run inside a Tokio runtime: spawns the writer task.
    pub(crate) fn new(
        channel: Arc<Channel>,
        identity: Option<Identity>,
        outbox_capacity: usize,
    ) -> Self {
        let id = ConnectionId::generate();
        let cancellation = CancellationToken::new();
        let (outbox, rx) = mpsc::channel(outbox_capacity.max(1));
        tokio::spawn(write_outbox(
            id.clone(),
            Arc::clone(&channel),
            rx,
            cancellation.clone(),
        ));
        Self {
            id,
            identity,
            channel,
            cancellation,
            outbox,
        }
    }

    /// Connection id.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Caller identity, if the host supplied one.
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// The underlying channel.
    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// Token that fires when the connection is removed.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Whether the connection has been torn down.
    pub fn is_closed(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Messages waiting in the outbox.
    pub fn queued(&self) -> usize {
        self.outbox.max_capacity() - self.outbox.capacity()
    }

    /// Queue a message for this connection without waiting on the transport.
    ///
    /// A full outbox means the peer stopped reading: the connection is
    /// cancelled and the message dropped.
    pub fn enqueue(&self, message: Message) -> Result<(), ChannelError> {
        match self.outbox.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                log::warn!(
                    "[Hub] outbox of {} full ({} messages), closing slow connection",
                    self.id,
                    self.outbox.max_capacity()
                );
                self.cancellation.cancel();
                Err(ChannelError::SendFailed("outbox full".to_string()))
            }
            Err(TrySendError::Closed(_)) => Err(ChannelError::Closed),
        }
    }
}

/// Writer task: drains the outbox into the channel until the connection is
/// cancelled. A write in progress is abandoned on cancellation so the sink lock
/// is released for the closing handshake.
async fn write_outbox(
    id: ConnectionId,
    channel: Arc<Channel>,
    mut rx: mpsc::Receiver<Message>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            () = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(message) => message,
                None => break,
            },
        };
        let written = tokio::select! {
            () = cancel.cancelled() => break,
            written = channel.send(&message) => written,
        };
        if let Err(e) = written {
            log::warn!("[Hub] write to {id} failed: {e}");
            cancel.cancel();
            break;
        }
    }
    log::trace!("[Hub] writer for {id} stopped");
}
