//! Peer state module
//!
//! Connection lifecycle and the choke/interest flags of one remote peer.

use std::collections::HashSet;
use std::net::SocketAddr;

use crate::scheduler::BlockRequest;

/// Lifecycle of a peer connection. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No socket yet
    #[default]
    Disconnected,
    /// TCP connected, handshake in flight
    Handshaking,
    /// Handshake accepted, not yet interested
    Idle,
    /// Interested; requests flow while unchoked
    Active,
    /// Socket released
    Closed,
}

impl ConnectionState {
    /// Check whether the handshake has completed and the socket is still open
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Idle | ConnectionState::Active)
    }
}

/// Per-connection view of one remote peer
#[derive(Debug, Clone)]
pub struct Peer {
    /// Peer address
    pub addr: SocketAddr,
    /// Identifier from the peer's handshake
    pub peer_id: Option<[u8; 20]>,
    /// Current state
    pub state: ConnectionState,
    /// We're choking them
    pub am_choking: bool,
    /// We're interested
    pub am_interested: bool,
    /// They're choking us
    pub peer_choking: bool,
    /// They're interested
    pub peer_interested: bool,
    /// Blocks requested from this peer and not yet answered
    pub outstanding: HashSet<BlockRequest>,
    /// Verified pieces completed by a block from this peer
    pub pieces_downloaded: u32,
}

impl Peer {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            peer_id: None,
            state: ConnectionState::Disconnected,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            outstanding: HashSet::new(),
            pieces_downloaded: 0,
        }
    }

    /// Check if we can send requests to this peer
    pub fn can_request(&self) -> bool {
        self.state == ConnectionState::Active && self.am_interested && !self.peer_choking
    }

    /// Free pipeline slots given a maximum depth
    pub fn request_slots(&self, pipeline_depth: usize) -> usize {
        pipeline_depth.saturating_sub(self.outstanding.len())
    }

    pub fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
    }

    pub fn set_peer_id(&mut self, peer_id: [u8; 20]) {
        self.peer_id = Some(peer_id);
    }

    pub fn peer_id_hex(&self) -> Option<String> {
        self.peer_id.map(hex::encode)
    }
}
