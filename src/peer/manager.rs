//! Peer manager module
//!
//! Owns the lifecycle of a transfer: binds the listener, announces to the
//! tracker, dials the returned endpoints and accepts inbound peers until a
//! stop is requested.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::connection::{run_outbound, ConnectionContext, PeerConnection};
use super::registry::PeerRegistry;
use crate::config::TransferConfig;
use crate::error::TorrentError;
use crate::events::{EventBus, TransferEvent};
use crate::strategy::BlockSelector;
use crate::torrent::TorrentInfo;
use crate::tracker::{AnnounceRequest, TrackerClient};

/// Pause after a failed accept before listening again
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

struct ManagerShared {
    ctx: Arc<ConnectionContext>,
    listen_addr: String,
    tracker: Arc<dyn TrackerClient>,
    running: AtomicBool,
    stop_tx: watch::Sender<bool>,
}

/// Connection manager for a single torrent
pub struct PeerManager {
    info: Arc<TorrentInfo>,
    shared: Arc<ManagerShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PeerManager {
    /// Create a stopped manager for `info`
    pub fn new(info: TorrentInfo, config: &TransferConfig, tracker: Arc<dyn TrackerClient>) -> Result<Self> {
        config.validate()?;
        let local_peer_id = config.local_peer_id()?;
        let events = EventBus::new(config.event_capacity);
        let selector = BlockSelector::for_torrent(&info, config.block_size, config.max_selection_attempts)?
            .with_events(events.clone());

        info!(
            "Peer manager for {} ({}), local peer id {}",
            info.name,
            info.info_hash_hex(),
            hex::encode(local_peer_id)
        );

        let ctx = ConnectionContext {
            info_hash: info.info_hash,
            local_peer_id,
            piece_count: info.piece_count(),
            max_pending_requests: config.max_pending_requests,
            handshake_timeout: config.connect_timeout(),
            selector: Arc::new(selector),
            registry: Arc::new(PeerRegistry::new()),
            events,
        };
        let (stop_tx, _) = watch::channel(false);

        Ok(Self {
            info: Arc::new(info),
            shared: Arc::new(ManagerShared {
                ctx: Arc::new(ctx),
                listen_addr: config.listen_addr(),
                tracker,
                running: AtomicBool::new(false),
                stop_tx,
            }),
            handle: Mutex::new(None),
        })
    }

    /// Launch the transfer in the background.
    ///
    /// Must be called from within a Tokio runtime. Fails with
    /// `AlreadyRunning` while a previous start has not finished.
    pub fn start(&self) -> Result<()> {
        if self
            .shared
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("Start requested while already running");
            return Err(TorrentError::AlreadyRunning.into());
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                self.shared.running.store(false, Ordering::Release);
                return Err(TorrentError::config_error_with_field(format!("No Tokio runtime: {}", e), "runtime").into());
            }
        };

        info!("Starting transfer of {}", self.info.name);
        self.shared.stop_tx.send_replace(false);
        let shared = self.shared.clone();
        let handle = runtime.spawn(async move { shared.run().await });
        *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Request shutdown without waiting for it
    pub fn stop(&self) {
        if !self.is_running() {
            debug!("Stop requested while not running");
        }
        info!("Stopping transfer of {}", self.info.name);
        self.shared.stop_tx.send_replace(true);
    }

    /// Wait for the background task started by `start` to finish
    pub async fn wait(&self) {
        let handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Transfer task failed: {}", e);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.shared.ctx.events.subscribe()
    }

    pub fn info(&self) -> &TorrentInfo {
        &self.info
    }

    pub fn local_peer_id(&self) -> [u8; 20] {
        self.shared.ctx.local_peer_id
    }

    pub fn selector(&self) -> &Arc<BlockSelector> {
        &self.shared.ctx.selector
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.shared.ctx.registry
    }
}

impl ManagerShared {
    async fn run(self: Arc<Self>) {
        let mut accept_task = None;
        if let Err(e) = self.supervise(&mut accept_task).await {
            error!("Transfer failed: {}", e);
            self.ctx.events.publish(TransferEvent::ConnectionException(e.to_string()));
        }

        self.ctx.events.publish(TransferEvent::Stopping);
        self.stop_tx.send_replace(true);
        if let Some(task) = accept_task {
            if let Err(e) = task.await {
                warn!("Accept loop ended abnormally: {}", e);
            }
        }

        self.running.store(false, Ordering::Release);
        info!("Transfer stopped");
    }

    async fn supervise(&self, accept_task: &mut Option<JoinHandle<()>>) -> Result<()> {
        let listener = TcpListener::bind(&self.listen_addr).await.map_err(|e| {
            TorrentError::network_error_full("Failed to bind listener", self.listen_addr.clone(), e.to_string())
        })?;
        let local_addr = listener.local_addr()?;
        info!("Listening for peers on {}", local_addr);
        self.ctx.events.publish(TransferEvent::Listening(local_addr));

        *accept_task = Some(tokio::spawn(accept_loop(self.ctx.clone(), listener, self.stop_tx.subscribe())));

        let endpoints = self.announce(local_addr.port()).await?;
        info!("Dialing {} peers", endpoints.len());
        for addr in endpoints {
            tokio::spawn(run_outbound(self.ctx.clone(), addr, self.stop_tx.subscribe()));
        }

        let mut stop = self.stop_tx.subscribe();
        // Err means the sender is gone, which also ends the transfer
        let _ = stop.wait_for(|stopped| *stopped).await;
        Ok(())
    }

    async fn announce(&self, port: u16) -> Result<Vec<SocketAddr>> {
        let request = AnnounceRequest {
            info_hash: self.ctx.info_hash,
            peer_id: self.ctx.local_peer_id,
            port,
            uploaded: 0,
            downloaded: 0,
            left: self.ctx.selector.bytes_left(),
        };
        let response = self.tracker.announce_start(&request).await?;
        debug!("Tracker returned {:?}", response.endpoints);
        Ok(response.endpoints)
    }
}

async fn accept_loop(ctx: Arc<ConnectionContext>, listener: TcpListener, mut stop: watch::Receiver<bool>) {
    loop {
        if *stop.borrow() {
            break;
        }

        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!("Incoming connection from {}", addr);
                    let connection = PeerConnection::accept(ctx.clone(), stream, addr, stop.clone());
                    tokio::spawn(connection.run());
                }
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            },
        }
    }
    debug!("Accept loop finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{BitTorrentWire, Handshake, Message, WireProtocol};
    use crate::tracker::{AnnounceResponse, StaticTracker};
    use async_trait::async_trait;
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    struct UnreachableTracker;

    #[async_trait]
    impl TrackerClient for UnreachableTracker {
        async fn announce_start(&self, _request: &AnnounceRequest) -> Result<AnnounceResponse> {
            Err(TorrentError::tracker_error("Tracker unreachable").into())
        }
    }

    fn torrent() -> TorrentInfo {
        TorrentInfo {
            announce: "http://tracker.example.com/announce".to_string(),
            announce_list: Vec::new(),
            info_hash: [0x33; 20],
            piece_length: 8,
            pieces: vec![[0u8; 20]; 3],
            name: "sample.bin".to_string(),
            length: Some(20),
            files: None,
        }
    }

    fn config() -> TransferConfig {
        TransferConfig {
            listen_port: 0,
            block_size: 4,
            peer_id: Some("aa".repeat(20)),
            connect_timeout_secs: 2,
            ..Default::default()
        }
    }

    fn manager(endpoints: Vec<SocketAddr>) -> PeerManager {
        PeerManager::new(torrent(), &config(), Arc::new(StaticTracker::new(endpoints))).unwrap()
    }

    async fn listening_port(events: &mut broadcast::Receiver<TransferEvent>) -> u16 {
        loop {
            if let TransferEvent::Listening(addr) = events.recv().await.unwrap() {
                return addr.port();
            }
        }
    }

    async fn wait_for_event(events: &mut broadcast::Receiver<TransferEvent>, wanted: TransferEvent) {
        timeout(Duration::from_secs(5), async {
            while events.recv().await.unwrap() != wanted {}
        })
        .await
        .unwrap();
    }

    /// Connect as `peer_id` and run the handshake, returning the open stream
    async fn handshake_as(port: u16, peer_id: [u8; 20]) -> (TcpStream, Handshake) {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut wire = BitTorrentWire;
        wire.write_handshake(&mut stream, &Handshake::new([0x33; 20], peer_id)).await.unwrap();
        let reply = timeout(Duration::from_secs(5), wire.read_handshake(&mut stream)).await.unwrap().unwrap();
        (stream, reply)
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let manager = manager(Vec::new());
        let mut events = manager.subscribe();

        manager.start().unwrap();
        let port = listening_port(&mut events).await;
        let (mut stream, _) = handshake_as(port, [9u8; 20]).await;
        assert_eq!(BitTorrentWire.read_message(&mut stream).await.unwrap(), Message::Interested);
        let before = manager.registry().get(&[9u8; 20]).unwrap();

        let err = manager.start().unwrap_err();
        assert!(matches!(err.downcast_ref::<TorrentError>(), Some(TorrentError::AlreadyRunning)));
        assert!(manager.is_running());

        let after = manager.registry().get(&[9u8; 20]).unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        assert!(after.is_active());
        drop(stream);

        manager.stop();
        wait_for_event(&mut events, TransferEvent::Stopping).await;
        manager.wait().await;
        assert!(!manager.is_running());
    }

    #[test]
    fn test_start_without_runtime() {
        let manager = manager(Vec::new());
        assert!(manager.start().is_err());
        assert!(!manager.is_running());
    }

    #[test]
    fn test_rejects_inconsistent_metadata() {
        let mut info = torrent();
        info.pieces.pop();
        let tracker: Arc<dyn TrackerClient> = Arc::new(StaticTracker::default());
        let err = PeerManager::new(info, &config(), tracker).err().unwrap();
        assert!(matches!(err.downcast_ref::<TorrentError>(), Some(TorrentError::InvalidMetadata { .. })));
    }

    #[tokio::test]
    async fn test_inbound_handshake_round_trip() {
        let manager = manager(Vec::new());
        let mut events = manager.subscribe();
        manager.start().unwrap();
        let port = listening_port(&mut events).await;

        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut wire = BitTorrentWire;
        wire.write_handshake(&mut stream, &Handshake::new([0x33; 20], [9u8; 20])).await.unwrap();

        let reply = timeout(Duration::from_secs(5), wire.read_handshake(&mut stream)).await.unwrap().unwrap();
        assert_eq!(reply.info_hash, [0x33; 20]);
        assert_eq!(reply.peer_id, manager.local_peer_id());
        assert_eq!(wire.read_message(&mut stream).await.unwrap(), Message::Interested);

        let peer = manager.registry().get(&[9u8; 20]).unwrap();
        assert!(peer.sent_handshake() && peer.received_handshake());

        manager.stop();
        manager.wait().await;
    }

    #[tokio::test]
    async fn test_duplicate_peer_id_gets_reply_then_closes() {
        let manager = manager(Vec::new());
        let mut events = manager.subscribe();
        manager.start().unwrap();
        let port = listening_port(&mut events).await;

        let (mut first, _) = handshake_as(port, [9u8; 20]).await;
        assert_eq!(BitTorrentWire.read_message(&mut first).await.unwrap(), Message::Interested);
        let registered = manager.registry().get(&[9u8; 20]).unwrap();

        let (mut second, reply) = handshake_as(port, [9u8; 20]).await;
        assert_eq!(reply.info_hash, [0x33; 20]);
        assert_eq!(reply.peer_id, manager.local_peer_id());
        let closed = timeout(Duration::from_secs(5), BitTorrentWire.read_message(&mut second)).await.unwrap();
        assert!(closed.is_err());

        let current = manager.registry().get(&[9u8; 20]).unwrap();
        assert!(Arc::ptr_eq(&registered, &current));
        assert!(current.is_active());
        assert_eq!(manager.registry().len(), 1);
        drop(first);

        manager.stop();
        manager.wait().await;
    }

    #[tokio::test]
    async fn test_tracker_failure_stops_transfer() {
        let manager = PeerManager::new(torrent(), &config(), Arc::new(UnreachableTracker)).unwrap();
        let mut events = manager.subscribe();
        manager.start().unwrap();

        let mut seen = Vec::new();
        timeout(Duration::from_secs(5), async {
            loop {
                let event = events.recv().await.unwrap();
                let stopping = event == TransferEvent::Stopping;
                seen.push(event);
                if stopping {
                    break;
                }
            }
        })
        .await
        .unwrap();

        let exception = seen
            .iter()
            .position(|event| matches!(event, TransferEvent::ConnectionException(message) if message.contains("unreachable")));
        assert!(matches!(exception, Some(i) if i + 1 < seen.len()));

        manager.wait().await;
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn test_self_connection_gets_no_reply() {
        let manager = manager(Vec::new());
        let mut events = manager.subscribe();
        manager.start().unwrap();
        let port = listening_port(&mut events).await;

        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut wire = BitTorrentWire;
        let handshake = Handshake::new([0x33; 20], manager.local_peer_id());
        wire.write_handshake(&mut stream, &handshake).await.unwrap();

        let reply = timeout(Duration::from_millis(500), wire.read_handshake(&mut stream)).await;
        assert!(!matches!(reply, Ok(Ok(_))));

        manager.stop();
        manager.wait().await;
    }

    #[tokio::test]
    async fn test_outbound_peer_from_tracker() {
        let remote = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let manager = manager(vec![remote.local_addr().unwrap()]);
        let mut events = manager.subscribe();
        manager.start().unwrap();

        let (mut socket, _) = timeout(Duration::from_secs(5), remote.accept()).await.unwrap().unwrap();
        let mut wire = BitTorrentWire;
        let handshake = wire.read_handshake(&mut socket).await.unwrap();
        assert_eq!(handshake.peer_id, manager.local_peer_id());
        wire.write_handshake(&mut socket, &Handshake::new([0x33; 20], [5u8; 20])).await.unwrap();

        wait_for_event(&mut events, TransferEvent::HandshakeReceived(socket.local_addr().unwrap())).await;
        assert!(manager.registry().contains(&[5u8; 20]));

        manager.stop();
        manager.wait().await;
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let manager = manager(Vec::new());
        manager.start().unwrap();
        manager.stop();
        manager.wait().await;

        manager.start().unwrap();
        assert!(manager.is_running());
        manager.stop();
        manager.wait().await;
    }
}
