//! Live-session registry
//!
//! Owned by the accept loop and mutated only from there: sessions are
//! inserted on accept and removed when their close notification arrives.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use tokio::sync::oneshot;
use tracing::debug;

/// Identity of one accepted session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// Raw numeric id
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Registry's side of a live session
#[derive(Debug)]
pub struct SessionHandle {
    peer: SocketAddr,
    disconnect: Option<oneshot::Sender<()>>,
}

impl SessionHandle {
    /// Create a handle plus the receiver the session watches for disconnects
    pub fn new(peer: SocketAddr) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let handle = SessionHandle {
            peer,
            disconnect: Some(tx),
        };
        (handle, rx)
    }

    /// Address of the client
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Ask the session to close; returns false if already asked
    pub fn disconnect(&mut self) -> bool {
        match self.disconnect.take() {
            // The session may already be gone; that is not an error.
            Some(tx) => {
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }
}

/// Set of live sessions keyed by id
#[derive(Debug, Default)]
pub struct Registry {
    sessions: HashMap<SessionId, SessionHandle>,
    next_id: u64,
}

impl Registry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new session, returning its id and disconnect receiver
    pub fn register(&mut self, peer: SocketAddr) -> (SessionId, oneshot::Receiver<()>) {
        self.next_id += 1;
        let id = SessionId(self.next_id);
        let (handle, rx) = SessionHandle::new(peer);
        self.sessions.insert(id, handle);
        (id, rx)
    }

    /// Forget a closed session; repeated calls are no-ops returning false
    pub fn on_session_closed(&mut self, id: SessionId) -> bool {
        match self.sessions.remove(&id) {
            Some(handle) => {
                debug!("Session {} from {} removed", id, handle.peer());
                true
            }
            None => false,
        }
    }

    /// Ask every live session to close
    ///
    /// Entries stay until each session reports back through
    /// [`Registry::on_session_closed`]. Returns how many sessions were asked.
    pub fn disconnect_all(&mut self) -> usize {
        let mut ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        ids.sort();

        let mut asked = 0;
        for id in ids {
            if let Some(handle) = self.sessions.get_mut(&id) {
                if handle.disconnect() {
                    asked += 1;
                }
            }
        }
        asked
    }

    /// Whether the session is still live
    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is live
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
