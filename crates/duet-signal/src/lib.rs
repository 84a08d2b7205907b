//! Duet Signal Server
//!
//! WebRTC signaling relay that pairs two peers in a room and ferries their
//! session descriptions and ICE candidates between them.
//!
//! # Protocol
//!
//! 1. A client creates a room over RPC and shares the room id
//! 2. Both participants join the room and receive a peer id
//! 3. Each participant uploads its description and candidates over RPC
//! 4. Uploads are relayed to the other peer's WebSocket if it is connected,
//!    and buffered otherwise
//! 5. When a peer's WebSocket connects, the other peer's buffered description
//!    and candidates are flushed to it
//! 6. Closing the WebSocket removes the peer; the room goes away with its last peer

pub mod connection;
pub mod datastore;
pub mod error;
pub mod messages;
pub mod peer;
pub mod room;
pub mod rpc;
pub mod server;

pub use connection::Connection;
pub use datastore::Datastore;
pub use error::RelayError;
pub use messages::{ErrorCode, IceCandidate, RelayMessage, SessionDescription};
pub use peer::{Peer, MAX_BUFFERED_CANDIDATES};
pub use room::{Room, MAX_PEERS_PER_ROOM};
pub use rpc::SignalService;
pub use server::SignalServer;

pub use duet_core::DEFAULT_PORT;
