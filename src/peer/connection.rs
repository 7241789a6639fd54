//! Peer connection module
//!
//! Drives one TCP connection: the handshake in either direction, then block
//! requests against the shared selector until the transfer completes, the
//! peer misbehaves, or a stop is requested.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use super::registry::PeerRegistry;
use super::state::{Direction, Peer};
use crate::error::TorrentError;
use crate::events::{EventBus, TransferEvent};
use crate::protocol::{BitTorrentWire, Handshake, Message, WireProtocol};
use crate::strategy::{Bitfield, BlockSelector};

/// Transfer-wide state shared by every connection task
#[derive(Debug)]
pub struct ConnectionContext {
    pub info_hash: [u8; 20],
    pub local_peer_id: [u8; 20],
    pub piece_count: usize,
    pub max_pending_requests: usize,
    /// Bounds the TCP connect and each handshake read
    pub handshake_timeout: Duration,
    pub selector: Arc<BlockSelector>,
    pub registry: Arc<PeerRegistry>,
    pub events: EventBus,
}

/// A live connection to one peer
pub struct PeerConnection {
    peer: Arc<Peer>,
    stream: TcpStream,
    wire: BitTorrentWire,
    ctx: Arc<ConnectionContext>,
    stop: watch::Receiver<bool>,
    /// Requested blocks as (piece, offset)
    pending: HashSet<(u32, u32)>,
    registered: bool,
}

impl PeerConnection {
    /// Dial `addr`
    pub async fn connect(ctx: Arc<ConnectionContext>, addr: SocketAddr, stop: watch::Receiver<bool>) -> Result<Self> {
        info!("Connecting to peer: {}", addr);
        let stream = timeout(ctx.handshake_timeout, TcpStream::connect(addr))
            .await
            .map_err(|e| TorrentError::network_error_full("Connection timeout", addr.to_string(), e.to_string()))?
            .map_err(|e| TorrentError::network_error_full("Failed to connect", addr.to_string(), e.to_string()))?;

        debug!("Connected to peer: {}", addr);
        Ok(Self::new(ctx, Peer::outbound(addr), stream, stop))
    }

    /// Wrap a socket accepted by the listener
    pub fn accept(ctx: Arc<ConnectionContext>, stream: TcpStream, addr: SocketAddr, stop: watch::Receiver<bool>) -> Self {
        debug!("Accepted connection from {}", addr);
        Self::new(ctx, Peer::inbound(addr), stream, stop)
    }

    fn new(ctx: Arc<ConnectionContext>, peer: Peer, stream: TcpStream, stop: watch::Receiver<bool>) -> Self {
        Self {
            peer: Arc::new(peer),
            stream,
            wire: BitTorrentWire,
            ctx,
            stop,
            pending: HashSet::new(),
            registered: false,
        }
    }

    pub fn peer(&self) -> &Arc<Peer> {
        &self.peer
    }

    /// Run the connection to completion. Failures only affect this peer.
    pub async fn run(mut self) {
        let addr = self.peer.addr;
        match self.drive().await {
            Ok(()) => debug!("Connection to {} finished", addr),
            Err(e) => {
                match e.downcast_ref::<TorrentError>() {
                    Some(err) if err.is_peer_scoped() => warn!("Dropping peer {}: {}", addr, err),
                    _ => warn!("Connection to {} failed: {}", addr, e),
                }
                self.ctx.events.publish(TransferEvent::ConnectionException(format!("{}: {}", addr, e)));
            }
        }

        self.peer.drop_connection();
        if self.registered {
            if let Some(peer_id) = self.peer.peer_id() {
                self.ctx.registry.remove_if_same(&peer_id, &self.peer);
            }
            self.ctx.events.publish(TransferEvent::PeersChanged);
        }
    }

    async fn drive(&mut self) -> Result<()> {
        match self.peer.direction {
            Direction::Outbound => {
                self.send_handshake().await?;
                if !self.peer.received_handshake() {
                    self.receive_handshake().await?;
                }
            }
            Direction::Inbound => {
                self.receive_handshake().await?;
                if !self.peer.sent_handshake() && !self.is_self() {
                    self.send_handshake().await?;
                }
            }
        }

        if !self.registered {
            debug!("Already connected to the peer at {}, closing duplicate after handshake", self.peer.addr);
            return Ok(());
        }
        if self.is_self() {
            info!("Connection from {} is ourselves, not answering", self.peer.addr);
            return Ok(());
        }
        if !self.peer.is_active() {
            return Ok(());
        }

        self.exchange().await
    }

    fn is_self(&self) -> bool {
        self.peer.peer_id() == Some(self.ctx.local_peer_id)
    }

    async fn send_handshake(&mut self) -> Result<()> {
        let handshake = Handshake::new(self.ctx.info_hash, self.ctx.local_peer_id);
        self.wire.write_handshake(&mut self.stream, &handshake).await?;
        debug!("Sent handshake to {}", self.peer.addr);

        self.ctx.events.publish(TransferEvent::HandshakeSent(self.peer.addr));
        if self.peer.mark_handshake_sent() {
            self.on_handshaked();
        }
        Ok(())
    }

    async fn receive_handshake(&mut self) -> Result<()> {
        let addr = self.peer.addr;
        let handshake = timeout(self.ctx.handshake_timeout, self.wire.read_handshake(&mut self.stream))
            .await
            .map_err(TorrentError::from)??;

        if !handshake.validate(&self.ctx.info_hash) {
            return Err(TorrentError::peer_error_with_peer(
                format!("Info hash mismatch: {}", hex::encode(handshake.info_hash)),
                addr.to_string(),
            )
            .into());
        }
        debug!("Received handshake from {} ({})", addr, hex::encode(handshake.peer_id));

        let completed = self.peer.mark_handshake_received(handshake.peer_id);
        let (_, inserted) = self.ctx.registry.insert_or_get(handshake.peer_id, self.peer.clone());
        self.registered = inserted;

        self.ctx.events.publish(TransferEvent::PeersChanged);
        self.ctx.events.publish(TransferEvent::HandshakeReceived(addr));
        if completed {
            self.on_handshaked();
        }
        Ok(())
    }

    fn on_handshaked(&self) {
        info!(
            "Handshake complete with {} ({})",
            self.peer.addr,
            self.peer.peer_id().map(hex::encode).unwrap_or_default()
        );
        self.ctx.events.publish(TransferEvent::PeersChanged);
    }

    async fn exchange(&mut self) -> Result<()> {
        let ours = self.ctx.selector.bitfield();
        if ours.count() > 0 {
            let message = Message::Bitfield { bitfield: ours.as_bytes().to_vec() };
            self.wire.write_message(&mut self.stream, &message).await?;
        }
        self.wire.write_message(&mut self.stream, &Message::Interested).await?;

        loop {
            if self.ctx.selector.is_complete() {
                info!("Transfer complete, closing connection to {}", self.peer.addr);
                break;
            }
            if *self.stop.borrow() {
                break;
            }

            let message = tokio::select! {
                _ = self.stop.changed() => {
                    debug!("Stop requested, closing connection to {}", self.peer.addr);
                    break;
                }
                message = self.wire.read_message(&mut self.stream) => message?,
            };
            self.handle_message(message).await?;
        }

        Ok(())
    }

    async fn handle_message(&mut self, message: Message) -> Result<()> {
        let piece_count = self.ctx.piece_count;

        match &message {
            Message::KeepAlive => trace!("Keep-alive from {}", self.peer.addr),
            Message::Choke => {
                debug!("Choked by {}", self.peer.addr);
                self.peer.set_peer_choking(true);
                self.pending.clear();
            }
            Message::Unchoke => {
                debug!("Unchoked by {}", self.peer.addr);
                self.peer.set_peer_choking(false);
                self.request_blocks().await?;
            }
            Message::Have { piece_index } => {
                let index = *piece_index as usize;
                if index >= piece_count {
                    return Err(TorrentError::protocol_error_with_source(
                        "Have for unknown piece",
                        format!("piece {} of {}", index, piece_count),
                    )
                    .into());
                }
                self.peer.set_have(index, piece_count);
                self.request_blocks().await?;
            }
            Message::Bitfield { bitfield } => {
                let expected = piece_count.div_ceil(8);
                if bitfield.len() != expected {
                    return Err(TorrentError::invalid_length(expected, bitfield.len()).into());
                }
                self.peer.update_bitfield(Bitfield::from_bytes(bitfield, piece_count));
                self.request_blocks().await?;
            }
            Message::Piece { .. } => {
                if let Some(block) = message.as_block() {
                    self.pending.remove(&(block.piece_index, block.offset));
                    if self.ctx.selector.received(&block) {
                        self.peer.increment_downloaded();
                    } else {
                        trace!("Discarding block {:?} from {}", block, self.peer.addr);
                    }
                }
                self.request_blocks().await?;
            }
            Message::Interested
            | Message::NotInterested
            | Message::Request { .. }
            | Message::Cancel { .. }
            | Message::Port { .. } => trace!("Ignoring {:?} from {}", message.message_id(), self.peer.addr),
        }

        Ok(())
    }

    async fn request_blocks(&mut self) -> Result<()> {
        if self.peer.peer_choking() {
            return Ok(());
        }

        let available = self.peer.bitfield(self.ctx.piece_count);
        while self.pending.len() < self.ctx.max_pending_requests {
            let Some(block) = self.ctx.selector.next(&available) else {
                break;
            };
            // A block already in flight means the draw hit our own requests
            if !self.pending.insert((block.piece_index, block.offset)) {
                break;
            }
            trace!("Requesting {:?} from {}", block, self.peer.addr);
            self.wire.write_message(&mut self.stream, &Message::request(&block)).await?;
        }
        Ok(())
    }
}

/// Dial `addr` and run the connection, logging failures
pub async fn run_outbound(ctx: Arc<ConnectionContext>, addr: SocketAddr, stop: watch::Receiver<bool>) {
    match PeerConnection::connect(ctx.clone(), addr, stop).await {
        Ok(connection) => connection.run().await,
        Err(e) => {
            warn!("Could not reach peer {}: {}", addr, e);
            ctx.events.publish(TransferEvent::ConnectionException(format!("{}: {}", addr, e)));
        }
    }
}
