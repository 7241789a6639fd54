//! Peer state module
//!
//! Per-connection peer state shared between the tasks that drive a socket.
//! Handshake progress lives in a single atomic so that the send and receive
//! paths can complete in either order, or concurrently, and exactly one of
//! them observes the transition to active.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use crate::strategy::Bitfield;

const SENT_HANDSHAKE: u8 = 0b01;
const RECEIVED_HANDSHAKE: u8 = 0b10;
const HANDSHAKED: u8 = SENT_HANDSHAKE | RECEIVED_HANDSHAKE;

/// Lifecycle of a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Outbound socket being opened
    #[default]
    Connecting,
    /// Inbound socket accepted, waiting for the remote handshake
    Accepted,
    /// At least one handshake direction is in flight
    Handshaking,
    /// Both handshakes done, ready for block exchange
    Active,
    /// Connection failed or was rejected
    Dropped,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Active | ConnectionState::Dropped)
    }
}

/// Which side opened the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// A remote peer and its connection state
#[derive(Debug)]
pub struct Peer {
    /// Remote endpoint
    pub addr: SocketAddr,
    pub direction: Direction,
    peer_id: OnceLock<[u8; 20]>,
    handshake: AtomicU8,
    state: Mutex<ConnectionState>,
    /// Pieces the remote advertised
    bitfield: Mutex<Option<Bitfield>>,
    peer_choking: AtomicBool,
    blocks_downloaded: AtomicU32,
}

impl Peer {
    fn with_state(addr: SocketAddr, direction: Direction, state: ConnectionState) -> Self {
        Self {
            addr,
            direction,
            peer_id: OnceLock::new(),
            handshake: AtomicU8::new(0),
            state: Mutex::new(state),
            bitfield: Mutex::new(None),
            peer_choking: AtomicBool::new(true),
            blocks_downloaded: AtomicU32::new(0),
        }
    }

    /// Peer we are dialing
    pub fn outbound(addr: SocketAddr) -> Self {
        Self::with_state(addr, Direction::Outbound, ConnectionState::Connecting)
    }

    /// Peer that dialed us
    pub fn inbound(addr: SocketAddr) -> Self {
        Self::with_state(addr, Direction::Inbound, ConnectionState::Accepted)
    }

    fn state_guard(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_guard()
    }

    /// Move to `state` unless the connection already dropped
    pub fn set_state(&self, state: ConnectionState) {
        let mut current = self.state_guard();
        if *current != ConnectionState::Dropped {
            *current = state;
        }
    }

    pub fn drop_connection(&self) {
        *self.state_guard() = ConnectionState::Dropped;
    }

    pub fn peer_id(&self) -> Option<[u8; 20]> {
        self.peer_id.get().copied()
    }

    pub fn sent_handshake(&self) -> bool {
        self.handshake.load(Ordering::Acquire) & SENT_HANDSHAKE != 0
    }

    pub fn received_handshake(&self) -> bool {
        self.handshake.load(Ordering::Acquire) & RECEIVED_HANDSHAKE != 0
    }

    /// Both handshakes exchanged and the connection still up
    pub fn is_active(&self) -> bool {
        self.handshake.load(Ordering::Acquire) == HANDSHAKED && self.state() == ConnectionState::Active
    }

    /// Record that our handshake went out. Returns true if this call
    /// completed the handshake.
    pub fn mark_handshake_sent(&self) -> bool {
        self.mark(SENT_HANDSHAKE)
    }

    /// Record the remote handshake. The first identifier seen is kept.
    /// Returns true if this call completed the handshake.
    pub fn mark_handshake_received(&self, peer_id: [u8; 20]) -> bool {
        let _ = self.peer_id.set(peer_id);
        self.mark(RECEIVED_HANDSHAKE)
    }

    // Flags and state change under the same lock
    fn mark(&self, flag: u8) -> bool {
        let mut state = self.state_guard();
        let previous = self.handshake.fetch_or(flag, Ordering::AcqRel);
        let combined = previous | flag;
        if *state != ConnectionState::Dropped {
            *state = if combined == HANDSHAKED {
                ConnectionState::Active
            } else {
                ConnectionState::Handshaking
            };
        }
        previous != HANDSHAKED && combined == HANDSHAKED
    }

    /// Replace the advertised bitfield
    pub fn update_bitfield(&self, bitfield: Bitfield) {
        *self.bitfield.lock().unwrap_or_else(PoisonError::into_inner) = Some(bitfield);
    }

    /// Record a `have` announcement
    pub fn set_have(&self, piece_index: usize, piece_count: usize) {
        let mut guard = self.bitfield.lock().unwrap_or_else(PoisonError::into_inner);
        guard.get_or_insert_with(|| Bitfield::new(piece_count)).set(piece_index);
    }

    /// Advertised pieces; empty if the peer has not said anything yet
    pub fn bitfield(&self, piece_count: usize) -> Bitfield {
        self.bitfield
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_else(|| Bitfield::new(piece_count))
    }

    pub fn has_piece(&self, piece_index: usize) -> bool {
        self.bitfield
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|bitfield| bitfield.has(piece_index))
    }

    pub fn peer_choking(&self) -> bool {
        self.peer_choking.load(Ordering::Acquire)
    }

    pub fn set_peer_choking(&self, choking: bool) {
        self.peer_choking.store(choking, Ordering::Release);
    }

    pub fn increment_downloaded(&self) {
        self.blocks_downloaded.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time view for reporting
    pub fn stats(&self) -> PeerStats {
        PeerStats {
            addr: self.addr,
            peer_id: self.peer_id(),
            direction: self.direction,
            state: self.state(),
            sent_handshake: self.sent_handshake(),
            received_handshake: self.received_handshake(),
            peer_choking: self.peer_choking(),
            blocks_downloaded: self.blocks_downloaded.load(Ordering::Relaxed),
        }
    }
}

/// Peer statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStats {
    pub addr: SocketAddr,
    pub peer_id: Option<[u8; 20]>,
    pub direction: Direction,
    pub state: ConnectionState,
    pub sent_handshake: bool,
    pub received_handshake: bool,
    pub peer_choking: bool,
    pub blocks_downloaded: u32,
}

impl PeerStats {
    /// Get the peer ID as a hex string
    pub fn peer_id_hex(&self) -> Option<String> {
        self.peer_id.map(hex::encode)
    }
}
