//! Room management and store-or-send routing
//!
//! A room pairs at most two peers. Anything one peer uploads is sent straight
//! to the other peer when it has a live connection, and buffered on the
//! sender's record otherwise. Buffers are flushed to a peer when it connects.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use duet_core::IdSource;

use crate::connection::Connection;
use crate::error::RelayError;
use crate::messages::{IceCandidate, SessionDescription};
use crate::peer::Peer;

/// Maximum peers per room
pub const MAX_PEERS_PER_ROOM: usize = 2;

/// A signaling session between two peers
pub struct Room {
    id: String,
    peers: Mutex<RoomPeers>,
    id_gen: Box<dyn IdSource>,
    last_activity: Mutex<Instant>,
}

struct RoomPeers {
    peers: HashMap<String, Arc<Peer>>,
    /// Set once the last peer leaves; a closed room never takes new peers
    closed: bool,
}

impl Room {
    /// Create a new room whose peer ids come from `id_gen`
    pub fn new(id: String, id_gen: Box<dyn IdSource>) -> Self {
        Self {
            id,
            peers: Mutex::new(RoomPeers {
                peers: HashMap::with_capacity(MAX_PEERS_PER_ROOM),
                closed: false,
            }),
            id_gen,
            last_activity: Mutex::new(Instant::now()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Add a fresh peer and return its id
    pub fn add_new_peer(&self) -> Result<String, RelayError> {
        let mut state = self.peers.lock();
        if state.closed {
            return Err(RelayError::RoomNotFound);
        }
        if state.peers.len() >= MAX_PEERS_PER_ROOM {
            return Err(RelayError::RoomFull);
        }

        let peer_id = self.id_gen.generate();
        state
            .peers
            .insert(peer_id.clone(), Arc::new(Peer::new(peer_id.clone())));
        drop(state);

        self.touch();
        Ok(peer_id)
    }

    /// Send a candidate to the other peer, or buffer it on the sender
    pub async fn store_or_send_ice_candidate(
        &self,
        peer_id: &str,
        candidate: IceCandidate,
    ) -> Result<(), RelayError> {
        let (peer, other) = self.resolve(peer_id)?;
        self.touch();

        let Some(other) = other else {
            debug!("Room {}: no counterpart for {}, buffering candidate", self.id, peer_id);
            peer.store_ice_candidate(candidate);
            return Ok(());
        };

        match other.send_ice_candidate(&candidate).await {
            Ok(()) => {
                debug!("Room {}: relayed candidate {} -> {}", self.id, peer_id, other.id());
                Ok(())
            }
            Err(e) if e.is_recipient_unavailable() => {
                debug!(
                    "Room {}: {} unreachable ({}), buffering candidate from {}",
                    self.id,
                    other.id(),
                    e,
                    peer_id
                );
                peer.store_ice_candidate(candidate);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Send a session description to the other peer, or store it on the sender
    pub async fn set_or_send_session_description(
        &self,
        peer_id: &str,
        description: SessionDescription,
    ) -> Result<(), RelayError> {
        let (peer, other) = self.resolve(peer_id)?;
        self.touch();

        let Some(other) = other else {
            debug!("Room {}: no counterpart for {}, storing description", self.id, peer_id);
            peer.set_session_description(description);
            return Ok(());
        };

        match other.send_session_description(&description).await {
            Ok(()) => {
                debug!("Room {}: relayed description {} -> {}", self.id, peer_id, other.id());
                Ok(())
            }
            Err(e) if e.is_recipient_unavailable() => {
                debug!(
                    "Room {}: {} unreachable ({}), storing description from {}",
                    self.id,
                    other.id(),
                    e,
                    peer_id
                );
                peer.set_session_description(description);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Attach a live connection to a peer, returning the one it replaces
    pub fn set_conn(
        &self,
        peer_id: &str,
        conn: Arc<Connection>,
    ) -> Result<Option<Arc<Connection>>, RelayError> {
        let peer = self.peer(peer_id)?;
        self.touch();
        Ok(peer.set_conn(conn))
    }

    /// Detach `conn` from a peer if it is still that peer's connection
    pub fn release_conn(&self, peer_id: &str, conn: &Arc<Connection>) -> Result<bool, RelayError> {
        Ok(self.peer(peer_id)?.release_conn(conn))
    }

    /// Deliver the other peer's session description to `peer_id`
    pub async fn flush_session_description(&self, peer_id: &str) -> Result<(), RelayError> {
        let (to_peer, from_peer) = self.resolve(peer_id)?;
        let Some(from_peer) = from_peer else {
            return Ok(());
        };

        let description = from_peer.session_description();
        to_peer.send_session_description(&description).await
    }

    /// Drain the other peer's buffered candidates and deliver them to `peer_id`.
    ///
    /// Drained candidates are consumed even when the send fails.
    pub async fn flush_ice_candidates(&self, peer_id: &str) -> Result<(), RelayError> {
        let (to_peer, from_peer) = self.resolve(peer_id)?;
        let Some(from_peer) = from_peer else {
            return Ok(());
        };

        let candidates = from_peer.take_ice_candidates();
        let count = candidates.len();

        to_peer.send_ice_candidates(candidates).await.map_err(|e| {
            warn!(
                "Room {}: dropped {} buffered candidates for {}: {}",
                self.id, count, peer_id, e
            );
            e
        })?;

        debug!("Room {}: flushed {} candidates to {}", self.id, count, peer_id);
        Ok(())
    }

    /// Remove a peer; returns true when the room is now empty
    pub fn remove_peer(&self, peer_id: &str) -> bool {
        let mut state = self.peers.lock();
        state.peers.remove(peer_id);
        if state.peers.is_empty() {
            state.closed = true;
        }
        let empty = state.closed;
        drop(state);

        self.touch();
        empty
    }

    /// Stop accepting peers; returns false if the room was already closed
    pub fn close(&self) -> bool {
        let mut state = self.peers.lock();
        !std::mem::replace(&mut state.closed, true)
    }

    /// Number of peers in the room
    pub fn peer_count(&self) -> usize {
        self.peers.lock().peers.len()
    }

    /// Check if the room is empty
    pub fn is_empty(&self) -> bool {
        self.peers.lock().peers.is_empty()
    }

    /// Whether any peer currently has a live connection
    pub fn has_live_connection(&self) -> bool {
        self.snapshot().iter().any(|p| p.is_connected())
    }

    /// Idle rooms have seen no activity for `timeout` and have nobody connected
    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_activity.lock().elapsed() > timeout && !self.has_live_connection()
    }

    /// Update last activity time
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Look up a peer by id
    pub fn peer(&self, peer_id: &str) -> Result<Arc<Peer>, RelayError> {
        self.peers
            .lock()
            .peers
            .get(peer_id)
            .cloned()
            .ok_or(RelayError::PeerNotFound)
    }

    /// Resolve `peer_id` and its counterpart under a single lock
    fn resolve(&self, peer_id: &str) -> Result<(Arc<Peer>, Option<Arc<Peer>>), RelayError> {
        let state = self.peers.lock();
        let peer = state
            .peers
            .get(peer_id)
            .cloned()
            .ok_or(RelayError::PeerNotFound)?;
        let other = state
            .peers
            .iter()
            .find(|(id, _)| id.as_str() != peer_id)
            .map(|(_, p)| Arc::clone(p));
        Ok((peer, other))
    }

    fn snapshot(&self) -> Vec<Arc<Peer>> {
        self.peers.lock().peers.values().cloned().collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::connection::testing::{self, Outbox};
    use crate::messages::RelayMessage;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::assert_ok;

    /// Sequential ids ("p1", "p2", ...) for readable assertions
    pub(crate) struct SeqIds {
        prefix: &'static str,
        next: AtomicUsize,
    }

    impl SeqIds {
        pub(crate) fn new(prefix: &'static str) -> Self {
            Self {
                prefix,
                next: AtomicUsize::new(1),
            }
        }
    }

    impl IdSource for SeqIds {
        fn generate(&self) -> String {
            format!("{}{}", self.prefix, self.next.fetch_add(1, Ordering::Relaxed))
        }

        fn scoped(&self, _namespace: &str) -> Result<Box<dyn IdSource>, duet_core::IdError> {
            Ok(Box::new(SeqIds::new("p")))
        }
    }

    fn room() -> Room {
        Room::new("r1".into(), Box::new(SeqIds::new("p")))
    }

    fn cand(c: &str) -> IceCandidate {
        IceCandidate {
            candidate: c.into(),
            sdp_m_line_index: "0".into(),
            ..Default::default()
        }
    }

    fn desc(sdp: &str, kind: i32) -> SessionDescription {
        SessionDescription {
            sdp: sdp.into(),
            kind,
        }
    }

    fn connect(room: &Room, peer_id: &str) -> (Arc<Connection>, Outbox) {
        let (conn, outbox, _inbound) = testing::channel();
        room.set_conn(peer_id, conn.clone()).unwrap();
        (conn, outbox)
    }

    #[test]
    fn test_add_peers_until_full() {
        let room = room();
        assert_eq!(room.add_new_peer().unwrap(), "p1");
        assert_eq!(room.add_new_peer().unwrap(), "p2");
        assert!(matches!(room.add_new_peer(), Err(RelayError::RoomFull)));
        assert_eq!(room.peer_count(), 2);
    }

    #[test]
    fn test_remove_peer_reports_empty() {
        let room = room();
        room.add_new_peer().unwrap();
        room.add_new_peer().unwrap();

        assert!(!room.remove_peer("p1"));
        assert!(room.remove_peer("p2"));
        assert!(room.is_empty());

        // A room that emptied out does not take new peers
        assert!(matches!(room.add_new_peer(), Err(RelayError::RoomNotFound)));
    }

    #[tokio::test]
    async fn test_unknown_peer() {
        let room = room();
        room.add_new_peer().unwrap();

        let result = room.store_or_send_ice_candidate("nope", cand("c1")).await;
        assert!(matches!(result, Err(RelayError::PeerNotFound)));

        let result = room.set_or_send_session_description("nope", desc("d", 1)).await;
        assert!(matches!(result, Err(RelayError::PeerNotFound)));

        let (conn, _o, _i) = testing::channel();
        assert!(matches!(room.set_conn("nope", conn), Err(RelayError::PeerNotFound)));
        assert!(matches!(
            room.flush_ice_candidates("nope").await,
            Err(RelayError::PeerNotFound)
        ));
    }

    #[tokio::test]
    async fn test_alone_in_room_buffers() {
        let room = room();
        room.add_new_peer().unwrap();

        assert_ok!(room.store_or_send_ice_candidate("p1", cand("c1")).await);
        assert_ok!(room.set_or_send_session_description("p1", desc("d1", 1)).await);

        let p1 = room.peer("p1").unwrap();
        assert_eq!(p1.buffered_candidate_count(), 1);
        assert_eq!(p1.session_description(), desc("d1", 1));

        // Nobody to flush from
        assert_ok!(room.flush_ice_candidates("p1").await);
        assert_ok!(room.flush_session_description("p1").await);
        assert_eq!(p1.buffered_candidate_count(), 1);
    }

    #[tokio::test]
    async fn test_counterpart_without_connection_buffers() {
        let room = room();
        room.add_new_peer().unwrap();
        room.add_new_peer().unwrap();

        assert_ok!(room.store_or_send_ice_candidate("p1", cand("c1")).await);
        assert_eq!(room.peer("p1").unwrap().buffered_candidate_count(), 1);
        assert_eq!(room.peer("p2").unwrap().buffered_candidate_count(), 0);
    }

    #[tokio::test]
    async fn test_live_counterpart_receives_directly() {
        let room = room();
        room.add_new_peer().unwrap();
        room.add_new_peer().unwrap();
        let (_conn, mut outbox) = connect(&room, "p2");

        assert_ok!(room.store_or_send_ice_candidate("p1", cand("c1")).await);
        assert_eq!(
            outbox.next().await,
            RelayMessage::Candidate {
                candidate: cand("c1")
            }
        );

        assert_ok!(room.set_or_send_session_description("p1", desc("offer", 1)).await);
        assert_eq!(
            outbox.next().await,
            RelayMessage::Description {
                description: desc("offer", 1)
            }
        );

        // Delivered data is not buffered
        let p1 = room.peer("p1").unwrap();
        assert_eq!(p1.buffered_candidate_count(), 0);
        assert_eq!(p1.session_description(), SessionDescription::default());
    }

    #[tokio::test]
    async fn test_buffered_candidates_flush_in_order() {
        let room = room();
        room.add_new_peer().unwrap();
        room.add_new_peer().unwrap();

        for c in ["c1", "c2", "c3"] {
            assert_ok!(room.store_or_send_ice_candidate("p1", cand(c)).await);
        }

        let (_conn, mut outbox) = connect(&room, "p2");
        assert_ok!(room.flush_ice_candidates("p2").await);

        assert_eq!(
            outbox.next().await,
            RelayMessage::Candidates {
                candidates: vec![cand("c1"), cand("c2"), cand("c3")]
            }
        );
        assert_eq!(room.peer("p1").unwrap().buffered_candidate_count(), 0);

        // A second flush finds nothing left
        assert_ok!(room.flush_ice_candidates("p2").await);
        assert_eq!(
            outbox.next().await,
            RelayMessage::Candidates { candidates: vec![] }
        );
    }

    #[tokio::test]
    async fn test_description_flush_delivers_latest() {
        let room = room();
        room.add_new_peer().unwrap();
        room.add_new_peer().unwrap();

        assert_ok!(room.set_or_send_session_description("p1", desc("d1", 1)).await);
        assert_ok!(room.set_or_send_session_description("p1", desc("d2", 1)).await);

        let (_conn, mut outbox) = connect(&room, "p2");
        assert_ok!(room.flush_session_description("p2").await);

        assert_eq!(
            outbox.next().await,
            RelayMessage::Description {
                description: desc("d2", 1)
            }
        );
        assert!(outbox.is_empty());
    }

    #[tokio::test]
    async fn test_flush_failure_consumes_candidates() {
        let room = room();
        room.add_new_peer().unwrap();
        room.add_new_peer().unwrap();
        assert_ok!(room.store_or_send_ice_candidate("p1", cand("c1")).await);

        room.set_conn("p2", testing::broken()).unwrap();
        let result = room.flush_ice_candidates("p2").await;

        assert!(matches!(result, Err(RelayError::Transport(_))));
        assert_eq!(room.peer("p1").unwrap().buffered_candidate_count(), 0);
    }

    #[tokio::test]
    async fn test_flush_without_own_connection() {
        let room = room();
        room.add_new_peer().unwrap();
        room.add_new_peer().unwrap();
        assert_ok!(room.store_or_send_ice_candidate("p1", cand("c1")).await);

        let result = room.flush_ice_candidates("p2").await;
        assert!(matches!(result, Err(RelayError::NoConnection)));
        assert_eq!(room.peer("p1").unwrap().buffered_candidate_count(), 0);
    }

    #[tokio::test]
    async fn test_transport_error_is_surfaced_not_buffered() {
        let room = room();
        room.add_new_peer().unwrap();
        room.add_new_peer().unwrap();
        room.set_conn("p2", testing::broken()).unwrap();

        let result = room.store_or_send_ice_candidate("p1", cand("c1")).await;
        assert!(matches!(result, Err(RelayError::Transport(_))));
        assert_eq!(room.peer("p1").unwrap().buffered_candidate_count(), 0);

        let result = room.set_or_send_session_description("p1", desc("d1", 1)).await;
        assert!(matches!(result, Err(RelayError::Transport(_))));
        assert_eq!(
            room.peer("p1").unwrap().session_description(),
            SessionDescription::default()
        );
    }

    #[tokio::test]
    async fn test_stalled_counterpart_buffers_after_deadline() {
        let room = room();
        room.add_new_peer().unwrap();
        room.add_new_peer().unwrap();
        room.set_conn("p2", testing::stalled(Duration::from_millis(20)))
            .unwrap();

        assert_ok!(room.store_or_send_ice_candidate("p1", cand("c1")).await);
        assert_ok!(room.set_or_send_session_description("p1", desc("d1", 1)).await);

        let p1 = room.peer("p1").unwrap();
        assert_eq!(p1.buffered_candidate_count(), 1);
        assert_eq!(p1.session_description(), desc("d1", 1));
    }

    #[tokio::test]
    async fn test_queued_frame_is_not_buffered_again() {
        let room = room();
        room.add_new_peer().unwrap();
        room.add_new_peer().unwrap();
        room.set_conn("p2", testing::unflushed(Duration::from_millis(20)))
            .unwrap();

        // The socket holds c1, so buffering it too would deliver it twice
        let result = room.store_or_send_ice_candidate("p1", cand("c1")).await;
        assert!(matches!(result, Err(RelayError::FlushTimeout)));
        assert_eq!(room.peer("p1").unwrap().buffered_candidate_count(), 0);

        // Nothing new reaches the socket after that, so c2 is buffered
        assert_ok!(room.store_or_send_ice_candidate("p1", cand("c2")).await);
        assert_eq!(room.peer("p1").unwrap().buffered_candidate_count(), 1);
    }

    #[tokio::test]
    async fn test_relay_to_removed_peer() {
        let room = room();
        room.add_new_peer().unwrap();
        room.add_new_peer().unwrap();
        let (_conn, _outbox) = connect(&room, "p2");

        // p1 gone entirely: p2 can no longer address it
        room.remove_peer("p1");
        assert_ok!(room.store_or_send_ice_candidate("p2", cand("c1")).await);
        assert_eq!(room.peer("p2").unwrap().buffered_candidate_count(), 1);
        assert!(matches!(
            room.store_or_send_ice_candidate("p1", cand("c2")).await,
            Err(RelayError::PeerNotFound)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_relay_racing_removal() {
        for _ in 0..100 {
            let room = Arc::new(room());
            room.add_new_peer().unwrap();
            room.add_new_peer().unwrap();
            let (_conn, mut outbox) = connect(&room, "p2");

            let to_leaving = {
                let room = Arc::clone(&room);
                tokio::spawn(async move { room.store_or_send_ice_candidate("p1", cand("c1")).await })
            };
            let from_leaving = {
                let room = Arc::clone(&room);
                tokio::spawn(async move { room.store_or_send_ice_candidate("p2", cand("c2")).await })
            };
            let remove = {
                let room = Arc::clone(&room);
                tokio::spawn(async move { room.remove_peer("p2") })
            };

            let to_leaving = tokio::time::timeout(Duration::from_secs(1), to_leaving)
                .await
                .expect("relay to a leaving peer hung")
                .unwrap();
            let from_leaving = tokio::time::timeout(Duration::from_secs(1), from_leaving)
                .await
                .expect("relay from a leaving peer hung")
                .unwrap();
            assert!(!remove.await.unwrap());

            assert_ok!(to_leaving);
            assert!(matches!(from_leaving, Ok(()) | Err(RelayError::PeerNotFound)));

            // c1 went out on p2's socket or stayed with p1, never both
            let delivered = usize::from(!outbox.is_empty());
            let buffered = room.peer("p1").unwrap().buffered_candidate_count();
            assert_eq!(delivered + buffered, 1);
            assert!(matches!(room.peer("p2"), Err(RelayError::PeerNotFound)));
        }
    }

    #[tokio::test]
    async fn test_release_conn_then_relay_buffers() {
        let room = room();
        room.add_new_peer().unwrap();
        room.add_new_peer().unwrap();
        let (conn, _outbox) = connect(&room, "p1");

        assert!(room.release_conn("p1", &conn).unwrap());
        assert_ok!(room.store_or_send_ice_candidate("p2", cand("c1")).await);
        assert_eq!(room.peer("p2").unwrap().buffered_candidate_count(), 1);
    }

    #[test]
    fn test_idle_detection() {
        let room = room();
        room.add_new_peer().unwrap();
        assert!(!room.is_idle(Duration::from_secs(60)));

        std::thread::sleep(Duration::from_millis(5));
        assert!(room.is_idle(Duration::from_millis(1)));

        // A connected peer keeps the room alive
        let (conn, _o, _i) = testing::channel();
        room.peer("p1").unwrap().set_conn(conn);
        assert!(!room.is_idle(Duration::from_millis(1)));
    }
}
