//! Per-participant relay state
//!
//! Each mutable facet of a peer (session description, candidate buffer,
//! connection) has its own lock, so work on one facet never waits on another.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::connection::Connection;
use crate::error::RelayError;
use crate::messages::{IceCandidate, RelayMessage, SessionDescription};

/// Maximum number of undelivered candidates kept per peer
pub const MAX_BUFFERED_CANDIDATES: usize = 50;

/// A participant in a room
pub struct Peer {
    id: String,
    description: Mutex<SessionDescription>,
    candidates: Mutex<VecDeque<IceCandidate>>,
    conn: Mutex<Option<Arc<Connection>>>,
}

impl Peer {
    pub fn new(id: String) -> Self {
        Self {
            id,
            description: Mutex::new(SessionDescription::default()),
            candidates: Mutex::new(VecDeque::with_capacity(MAX_BUFFERED_CANDIDATES)),
            conn: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Buffer a candidate this peer sent, evicting the oldest when full
    pub fn store_ice_candidate(&self, candidate: IceCandidate) {
        let mut candidates = self.candidates.lock();
        if candidates.len() >= MAX_BUFFERED_CANDIDATES {
            candidates.pop_front();
            debug!("Peer {} candidate buffer full, evicted oldest", self.id);
        }
        candidates.push_back(candidate);
    }

    /// Remove and return every buffered candidate, oldest first
    pub fn take_ice_candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().drain(..).collect()
    }

    pub fn buffered_candidate_count(&self) -> usize {
        self.candidates.lock().len()
    }

    /// Overwrite the stored session description
    pub fn set_session_description(&self, description: SessionDescription) {
        *self.description.lock() = description;
    }

    pub fn session_description(&self) -> SessionDescription {
        self.description.lock().clone()
    }

    /// Attach a connection, handing back the one it supersedes.
    ///
    /// The superseded connection is not closed here; its owner does that.
    pub fn set_conn(&self, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        self.conn.lock().replace(conn)
    }

    /// Detach `conn` if it is still the current connection
    pub fn release_conn(&self, conn: &Arc<Connection>) -> bool {
        let mut current = self.conn.lock();
        match current.as_ref() {
            Some(c) if Arc::ptr_eq(c, conn) => {
                *current = None;
                true
            }
            _ => false,
        }
    }

    /// The current connection, if it is still open
    pub fn conn(&self) -> Option<Arc<Connection>> {
        self.conn.lock().as_ref().filter(|c| !c.is_closed()).cloned()
    }

    pub fn is_connected(&self) -> bool {
        self.conn().is_some()
    }

    pub async fn send_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), RelayError> {
        self.send(&RelayMessage::Candidate {
            candidate: candidate.clone(),
        })
        .await
    }

    pub async fn send_ice_candidates(&self, candidates: Vec<IceCandidate>) -> Result<(), RelayError> {
        self.send(&RelayMessage::Candidates { candidates }).await
    }

    pub async fn send_session_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), RelayError> {
        self.send(&RelayMessage::Description {
            description: description.clone(),
        })
        .await
    }

    // The connection slot is only locked long enough to clone the handle;
    // the write itself is serialized by the connection's own write lock.
    async fn send(&self, msg: &RelayMessage) -> Result<(), RelayError> {
        let conn = self.conn().ok_or(RelayError::NoConnection)?;
        conn.write_json(msg).await
    }
}
