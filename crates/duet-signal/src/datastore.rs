//! Process-wide registry of active rooms
//!
//! Map guards are held only long enough to clone a room handle; every room or
//! peer operation runs after the guard is released.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::info;

use duet_core::{IdSource, UuidIdGenerator};

use crate::connection::Connection;
use crate::error::RelayError;
use crate::messages::{IceCandidate, SessionDescription};
use crate::room::Room;

/// In-memory room registry
pub struct Datastore {
    rooms: DashMap<String, Arc<Room>>,
    id_gen: Box<dyn IdSource>,
}

impl Datastore {
    pub fn new() -> Self {
        Self::with_id_source(Box::new(UuidIdGenerator::new()))
    }

    /// Build a registry that draws room ids from `id_gen`.
    ///
    /// Each room's peer ids come from `id_gen.scoped(room_id)`.
    pub fn with_id_source(id_gen: Box<dyn IdSource>) -> Self {
        Self {
            rooms: DashMap::new(),
            id_gen,
        }
    }

    /// Allocate and register a new room
    pub fn create_room(&self) -> Result<String, RelayError> {
        let room_id = self.id_gen.generate();
        let peer_ids = self.id_gen.scoped(&room_id)?;

        let room = Arc::new(Room::new(room_id.clone(), peer_ids));
        self.rooms.insert(room_id.clone(), room);

        info!("Room created: {}", room_id);
        Ok(room_id)
    }

    pub fn add_new_peer_to_room(&self, room_id: &str) -> Result<String, RelayError> {
        let peer_id = self.room(room_id)?.add_new_peer()?;
        info!("Peer {} joined room {}", peer_id, room_id);
        Ok(peer_id)
    }

    pub async fn store_or_send_ice_candidate(
        &self,
        room_id: &str,
        peer_id: &str,
        candidate: IceCandidate,
    ) -> Result<(), RelayError> {
        self.room(room_id)?
            .store_or_send_ice_candidate(peer_id, candidate)
            .await
    }

    pub async fn set_or_send_session_description(
        &self,
        room_id: &str,
        peer_id: &str,
        description: SessionDescription,
    ) -> Result<(), RelayError> {
        self.room(room_id)?
            .set_or_send_session_description(peer_id, description)
            .await
    }

    /// Attach a connection to a peer, returning the superseded one for the caller to close
    pub fn set_conn_for_peer(
        &self,
        room_id: &str,
        peer_id: &str,
        conn: Arc<Connection>,
    ) -> Result<Option<Arc<Connection>>, RelayError> {
        self.room(room_id)?.set_conn(peer_id, conn)
    }

    /// Detach `conn` from a peer; false if the peer already moved on to another connection
    pub fn release_conn_for_peer(
        &self,
        room_id: &str,
        peer_id: &str,
        conn: &Arc<Connection>,
    ) -> Result<bool, RelayError> {
        self.room(room_id)?.release_conn(peer_id, conn)
    }

    pub async fn flush_session_description(
        &self,
        room_id: &str,
        peer_id: &str,
    ) -> Result<(), RelayError> {
        self.room(room_id)?.flush_session_description(peer_id).await
    }

    pub async fn flush_ice_candidates(&self, room_id: &str, peer_id: &str) -> Result<(), RelayError> {
        self.room(room_id)?.flush_ice_candidates(peer_id).await
    }

    /// Remove a peer, dropping the room once it is empty
    pub fn remove_peer_from_room(&self, room_id: &str, peer_id: &str) -> Result<(), RelayError> {
        let room = self.room(room_id)?;
        info!("Peer {} left room {}", peer_id, room_id);

        if room.remove_peer(peer_id) {
            self.rooms.remove_if(room_id, |_, r| Arc::ptr_eq(r, &room));
            info!("Room {} removed (empty)", room_id);
        }
        Ok(())
    }

    /// Drop rooms that have been idle for longer than `timeout`
    pub fn remove_idle_rooms(&self, timeout: Duration) -> usize {
        let mut removed = 0;
        for room in self.rooms_snapshot() {
            if room.is_idle(timeout) && room.close() {
                self.rooms.remove_if(room.id(), |_, r| Arc::ptr_eq(r, &room));
                info!("Room {} removed (idle timeout)", room.id());
                removed += 1;
            }
        }
        removed
    }

    /// Get room count (for monitoring)
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Get peer count across all rooms (for monitoring)
    pub fn peer_count(&self) -> usize {
        self.rooms_snapshot().iter().map(|r| r.peer_count()).sum()
    }

    pub fn contains_room(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }

    fn room(&self, room_id: &str) -> Result<Arc<Room>, RelayError> {
        self.rooms
            .get(room_id)
            .map(|r| Arc::clone(r.value()))
            .ok_or(RelayError::RoomNotFound)
    }

    fn rooms_snapshot(&self) -> Vec<Arc<Room>> {
        self.rooms.iter().map(|r| Arc::clone(r.value())).collect()
    }
}

impl Default for Datastore {
    fn default() -> Self {
        Self::new()
    }
}
