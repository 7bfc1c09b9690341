//! Connected-client registry.
//!
//! Tracks every bound client session in arrival order. Routing code
//! looks sessions up by exact full JID or by bare JID (first bound
//! resource wins) and delivers serialized stanzas through each
//! session's outbound channel.

use std::fmt;
use std::sync::RwLock;

use jid::{FullJid, Jid};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// A serialized stanza queued for delivery to one client.
#[derive(Debug, Clone)]
pub struct OutboundStanza {
    /// XML text to write to the client's stream.
    pub xml: String,
}

impl OutboundStanza {
    /// Create a new outbound stanza.
    pub fn new(xml: String) -> Self {
        Self { xml }
    }
}

/// Result of attempting to deliver a stanza to a client.
#[derive(Debug)]
pub enum SendResult {
    /// Queued for delivery.
    Sent,
    /// No session bound under that JID.
    NotConnected,
    /// The session's outbound channel is full; the stanza was dropped.
    ChannelFull,
    /// The session's writer is gone, the connection is dead.
    ChannelClosed,
}

/// Handle to one bound client session.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    /// Connection id, stable across the life of the TCP connection.
    pub id: Uuid,
    /// The full JID the session bound.
    pub jid: FullJid,
    sender: mpsc::Sender<OutboundStanza>,
}

impl ClientHandle {
    /// Create a handle from a bound JID and the session's outbound channel.
    pub fn new(id: Uuid, jid: FullJid, sender: mpsc::Sender<OutboundStanza>) -> Self {
        Self { id, jid, sender }
    }

    /// Queue XML on the session's outbound channel without blocking.
    pub fn send(&self, xml: String) -> SendResult {
        match self.sender.try_send(OutboundStanza::new(xml)) {
            Ok(()) => SendResult::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(jid = %self.jid, "outbound channel full, dropping stanza");
                SendResult::ChannelFull
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(jid = %self.jid, "outbound channel closed");
                SendResult::ChannelClosed
            }
        }
    }
}

/// Registry of bound client sessions, ordered by arrival.
pub struct ClientRegistry {
    clients: RwLock<Vec<ClientHandle>>,
}

impl ClientRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(Vec::new()),
        }
    }

    /// Register a freshly bound session.
    ///
    /// A session already bound under the same full JID is replaced;
    /// the old connection is about to be torn down by its own task.
    pub fn register(&self, handle: ClientHandle) {
        let mut clients = self.clients.write().unwrap();
        let before = clients.len();
        clients.retain(|c| c.jid != handle.jid);
        if clients.len() != before {
            debug!(jid = %handle.jid, "replaced existing registration");
        }
        debug!(jid = %handle.jid, "registered client");
        clients.push(handle);
    }

    /// Remove a session by connection id.
    pub fn unregister(&self, id: Uuid) -> Option<ClientHandle> {
        let mut clients = self.clients.write().unwrap();
        let index = clients.iter().position(|c| c.id == id)?;
        let handle = clients.remove(index);
        debug!(jid = %handle.jid, "unregistered client");
        Some(handle)
    }

    /// Look up a session by address.
    ///
    /// A full JID must match exactly; a bare JID selects the first
    /// bound resource of that user in arrival order.
    pub fn find(&self, jid: &Jid) -> Option<ClientHandle> {
        let clients = self.clients.read().unwrap();
        match jid.clone().try_into_full() {
            Ok(full) => clients.iter().find(|c| c.jid == full).cloned(),
            Err(bare) => clients.iter().find(|c| c.jid.to_bare() == bare).cloned(),
        }
    }

    /// Whether any session is bound under the given address.
    pub fn is_connected(&self, jid: &Jid) -> bool {
        self.find(jid).is_some()
    }

    /// Deliver XML to the session bound exactly at `jid`.
    pub fn send_to(&self, jid: &FullJid, xml: String) -> SendResult {
        let handle = {
            let clients = self.clients.read().unwrap();
            clients.iter().find(|c| c.jid == *jid).cloned()
        };
        let Some(handle) = handle else {
            return SendResult::NotConnected;
        };
        let result = handle.send(xml);
        if matches!(result, SendResult::ChannelClosed) {
            // Drop the stale entry; the reader task may be long gone.
            self.unregister(handle.id);
        }
        result
    }

    /// Number of bound sessions.
    pub fn count(&self) -> usize {
        self.clients.read().unwrap().len()
    }

    /// All bound JIDs, in arrival order.
    pub fn list(&self) -> Vec<FullJid> {
        self.clients
            .read()
            .unwrap()
            .iter()
            .map(|c| c.jid.clone())
            .collect()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("count", &self.count())
            .finish()
    }
}
