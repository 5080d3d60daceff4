//! # Network
//!
//! Top-level entry point. A [`Network`] owns one local [`Pid`] and secret, the
//! listeners it started, and a registry of every connected [`Participant`].
//!
//! ## Connection setup
//! Every accepted or dialed connection runs the handshake (bounded by the
//! configured handshake timeout), then registers a participant under the remote
//! pid. A second connection announcing a pid that is still connected is rejected:
//! with a different secret as [`NetworkConnectError::InvalidSecret`], with the
//! same secret as [`NetworkConnectError::AlreadyConnected`].
//!
//! ## Events
//! [`Network::subscribe`] yields connect, disconnect and handshake-failure
//! notifications. Participants accepted by a listener are additionally handed
//! out one by one through [`Network::connected`].
//!
//! ## Example
//! ```rust,no_run
//! use mux_network::{ConnectAddr, ListenAddr, Network, NetworkConfig, Pid, Promises, StreamParams};
//!
//! # async fn run() -> mux_network::error::Result<()> {
//! let server = Network::new(Pid::new(), NetworkConfig::default())?;
//! let client = Network::new(Pid::new(), NetworkConfig::default())?;
//! server.listen(ListenAddr::Mpsc(7)).await?;
//!
//! let remote = client.connect(ConnectAddr::Mpsc(7)).await?;
//! let stream = remote.open(StreamParams::new(Promises::ORDERED)).await.ok();
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::NetworkConfig;
use crate::core::types::{HandshakeFeatures, Pid, Secret};
use crate::error::{ConfigError, NetworkConnectError, NetworkError, Result};
use crate::participant::{Participant, ParticipantSetup};
use crate::protocol::handshake::{Handshake, HandshakeOutcome, Role};
use crate::scheduler::Scheduler;
use crate::transport::{
    mpsc as local, quic, tcp, udp, ConnectAddr, FrameSink, FrameSource, Link, ListenAddr,
    ProtocolKind,
};
use crate::utils::Metrics;

/// Capacity of the event broadcast; slow subscribers lose the oldest events.
const EVENT_CAPACITY: usize = 256;

/// Network-level notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    Connected(Pid),
    Disconnected(Pid),
    /// A connection attempt failed before a participant was registered.
    HandshakeFailed {
        protocol: ProtocolKind,
        reason: String,
    },
}

type Establish = std::result::Result<(HandshakeOutcome, Link), NetworkConnectError>;

struct NetworkShared {
    local_pid: Pid,
    local_secret: Secret,
    config: Arc<NetworkConfig>,
    metrics: Arc<Metrics>,
    participants: DashMap<Pid, Participant>,
    connected_tx: mpsc::UnboundedSender<Participant>,
    connected_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Participant>>,
    events: broadcast::Sender<NetworkEvent>,
    scheduler: Scheduler,
    /// Stops every task of this network.
    cancel: CancellationToken,
    /// Stops the listeners only.
    listeners: CancellationToken,
    local_ids: Mutex<Vec<u64>>,
    closed: AtomicBool,
}

impl NetworkShared {
    fn emit(&self, event: NetworkEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn handshake(&self, features: HandshakeFeatures, role: Role) -> Handshake {
        Handshake::new(self.local_pid, self.local_secret, features, role)
    }

    /// Run `handshake` under the handshake timeout and register the result.
    async fn establish<F>(
        self: &Arc<Self>,
        protocol: ProtocolKind,
        peer: Option<SocketAddr>,
        incoming: bool,
        handshake: F,
    ) -> std::result::Result<Participant, NetworkConnectError>
    where
        F: Future<Output = Establish>,
    {
        let timeout = self.config.handshake.timeout;
        let result = match tokio::time::timeout(timeout, handshake).await {
            Ok(result) => result,
            Err(_) => Err(NetworkConnectError::Timeout),
        };
        let result = result.and_then(|(outcome, link)| {
            self.register(outcome, link, protocol, peer, incoming)
        });
        if let Err(e) = &result {
            self.metrics.handshake_failed();
            warn!(protocol = %protocol, ?peer, error = %e, "Connection setup failed");
            self.emit(NetworkEvent::HandshakeFailed {
                protocol,
                reason: e.to_string(),
            });
        }
        result
    }

    fn register(
        self: &Arc<Self>,
        outcome: HandshakeOutcome,
        link: Link,
        protocol: ProtocolKind,
        peer: Option<SocketAddr>,
        incoming: bool,
    ) -> std::result::Result<Participant, NetworkConnectError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NetworkConnectError::Cancelled);
        }
        let remote_pid = outcome.remote_pid;
        let remote_secret = outcome.remote_secret;
        let setup = ParticipantSetup {
            local_pid: self.local_pid,
            outcome,
            protocol,
            peer,
            config: self.config.clone(),
            metrics: self.metrics.clone(),
            cancel: self.cancel.child_token(),
        };

        let participant = match self.participants.entry(remote_pid) {
            Entry::Occupied(mut entry) => {
                let existing = entry.get();
                if !existing.is_disconnected() {
                    // dropping the link closes the connection
                    return Err(if existing.remote_secret() == remote_secret {
                        NetworkConnectError::AlreadyConnected(remote_pid)
                    } else {
                        warn!(pid = %remote_pid, "Rejecting connection with a foreign secret");
                        NetworkConnectError::InvalidSecret
                    });
                }
                debug!(pid = %remote_pid, "Replacing disconnected participant");
                let participant = Participant::spawn(setup, link);
                entry.insert(participant.clone());
                participant
            }
            Entry::Vacant(entry) => {
                let participant = Participant::spawn(setup, link);
                entry.insert(participant.clone());
                participant
            }
        };

        self.watch(participant.clone());
        self.emit(NetworkEvent::Connected(remote_pid));
        if incoming {
            let _ = self.connected_tx.send(participant.clone());
        }
        Ok(participant)
    }

    /// Remove `participant` from the registry once it is torn down.
    fn watch(self: &Arc<Self>, participant: Participant) {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = this.cancel.cancelled() => return,
                _ = participant.disconnected() => {}
            }
            let network = this.clone();
            this.scheduler.schedule(async move {
                let pid = participant.remote_pid();
                let removed = network
                    .participants
                    .remove_if(&pid, |_, registered| registered.same(&participant))
                    .is_some();
                if removed {
                    info!(pid = %pid, "Participant removed");
                    network.emit(NetworkEvent::Disconnected(pid));
                }
            });
        });
    }

    fn spawn_accept<F>(
        self: &Arc<Self>,
        protocol: ProtocolKind,
        peer: Option<SocketAddr>,
        handshake: F,
    ) where
        F: Future<Output = Establish> + Send + 'static,
    {
        self.metrics.incoming_connection(protocol);
        let this = self.clone();
        tokio::spawn(async move {
            if let Ok(participant) = this.establish(protocol, peer, true, handshake).await {
                debug!(
                    pid = %participant.remote_pid(),
                    protocol = %protocol,
                    "Accepted participant"
                );
            }
        });
    }

    async fn listen_tcp(
        self: &Arc<Self>,
        addr: SocketAddr,
        features: HandshakeFeatures,
    ) -> std::io::Result<SocketAddr> {
        let listener = tcp::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let (stream, peer) = tokio::select! {
                    _ = this.listeners.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(error = %e, "TCP accept failed");
                            continue;
                        }
                    },
                };
                let handshake = this.handshake(features, Role::Acceptor);
                let cancel = this.cancel.clone();
                let chunk_size = this.config.stream.max_chunk_size;
                this.spawn_accept(ProtocolKind::Tcp, Some(peer), async move {
                    tcp::accepted(&stream)?;
                    let (mut read, mut write) = stream.into_split();
                    let outcome = handshake.run_stream(&mut read, &mut write, &cancel).await?;
                    let (read, write) = tcp::boxed(read, write);
                    let link = Link::byte_stream(read, write, chunk_size);
                    Ok::<_, NetworkConnectError>((outcome, link))
                });
            }
            debug!(addr = %local_addr, "TCP listener stopped");
        });
        Ok(local_addr)
    }

    async fn listen_udp(
        self: &Arc<Self>,
        addr: SocketAddr,
        features: HandshakeFeatures,
    ) -> std::io::Result<SocketAddr> {
        let socket = udp::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        udp::spawn_demux(socket, tx, self.listeners.clone());
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(mut channel) = rx.recv().await {
                let handshake = this.handshake(features, Role::Acceptor);
                let cancel = this.cancel.clone();
                let chunk_size = this.config.stream.datagram_chunk_size;
                let peer = channel.peer();
                this.spawn_accept(ProtocolKind::Udp, Some(peer), async move {
                    let outcome = handshake.run_datagram(&mut channel, &cancel).await?;
                    Ok::<_, NetworkConnectError>((outcome, Link::datagram(channel, chunk_size)))
                });
            }
            debug!(addr = %local_addr, "UDP listener stopped");
        });
        Ok(local_addr)
    }

    fn listen_quic(
        self: &Arc<Self>,
        addr: SocketAddr,
        server_config: quinn::ServerConfig,
        features: HandshakeFeatures,
    ) -> std::io::Result<SocketAddr> {
        let endpoint = quic::server_endpoint(addr, server_config)?;
        let local_addr = endpoint.local_addr()?;
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let incoming = tokio::select! {
                    _ = this.listeners.cancelled() => break,
                    incoming = endpoint.accept() => incoming,
                };
                let Some(incoming) = incoming else {
                    break;
                };
                let peer = incoming.remote_address();
                let handshake = this.handshake(features, Role::Acceptor);
                let cancel = this.cancel.clone();
                this.spawn_accept(ProtocolKind::Quic, Some(peer), async move {
                    let connection = incoming
                        .await
                        .map_err(|e| NetworkConnectError::Quic(e.to_string()))?;
                    let (mut send, mut recv) = connection
                        .accept_bi()
                        .await
                        .map_err(|e| NetworkConnectError::Quic(e.to_string()))?;
                    let outcome = handshake.run_stream(&mut recv, &mut send, &cancel).await?;
                    Ok::<_, NetworkConnectError>((
                        outcome,
                        Link::Quic {
                            connection,
                            endpoint: None,
                            sink: FrameSink::stream(Box::new(send)),
                            source: FrameSource::stream(Box::new(recv)),
                        },
                    ))
                });
            }
            endpoint.close(quinn::VarInt::from_u32(0), b"shutdown");
            debug!(addr = %local_addr, "QUIC listener stopped");
        });
        Ok(local_addr)
    }

    fn listen_local(self: &Arc<Self>, id: u64, features: HandshakeFeatures) -> std::io::Result<()> {
        let mut rx = local::listen(id)?;
        self.local_ids.lock().push(id);
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let connection = tokio::select! {
                    _ = this.listeners.cancelled() => break,
                    connection = rx.recv() => connection,
                };
                let Some(connection) = connection else {
                    break;
                };
                let handshake = this.handshake(features, Role::Acceptor);
                let cancel = this.cancel.clone();
                this.spawn_accept(ProtocolKind::Mpsc, None, async move {
                    let local::LocalConnection { handshake: pipe, tx, rx } = connection;
                    let (mut read, mut write) = tokio::io::split(pipe);
                    let outcome = handshake.run_stream(&mut read, &mut write, &cancel).await?;
                    Ok::<_, NetworkConnectError>((outcome, Link::Local { tx, rx }))
                });
            }
            debug!(id, "In-process listener stopped");
        });
        Ok(())
    }

    async fn dial(&self, addr: ConnectAddr, features: HandshakeFeatures) -> Establish {
        let handshake = self.handshake(features, Role::Initiator);
        let cancel = &self.cancel;
        match addr {
            ConnectAddr::Tcp(addr) => {
                let stream = tcp::connect(addr).await?;
                let (mut read, mut write) = stream.into_split();
                let outcome = handshake.run_stream(&mut read, &mut write, cancel).await?;
                let (read, write) = tcp::boxed(read, write);
                let chunk_size = self.config.stream.max_chunk_size;
                Ok((outcome, Link::byte_stream(read, write, chunk_size)))
            }
            ConnectAddr::Udp(addr) => {
                let mut channel = udp::connect(addr).await?;
                let outcome = handshake.run_datagram(&mut channel, cancel).await?;
                let chunk_size = self.config.stream.datagram_chunk_size;
                Ok((outcome, Link::datagram(channel, chunk_size)))
            }
            ConnectAddr::Quic(addr, client_config, server_name) => {
                let (endpoint, connection) =
                    quic::connect(addr, client_config, &server_name).await?;
                let (mut send, mut recv) = connection
                    .open_bi()
                    .await
                    .map_err(|e| NetworkConnectError::Quic(e.to_string()))?;
                let outcome = handshake.run_stream(&mut recv, &mut send, cancel).await?;
                Ok((
                    outcome,
                    Link::Quic {
                        connection,
                        endpoint: Some(endpoint),
                        sink: FrameSink::stream(Box::new(send)),
                        source: FrameSource::stream(Box::new(recv)),
                    },
                ))
            }
            ConnectAddr::Mpsc(id) => {
                let local::LocalConnection { handshake: pipe, tx, rx } = local::connect(id)?;
                let (mut read, mut write) = tokio::io::split(pipe);
                let outcome = handshake.run_stream(&mut read, &mut write, cancel).await?;
                Ok((outcome, Link::Local { tx, rx }))
            }
        }
    }

    fn release_listeners(&self) {
        self.listeners.cancel();
        for id in self.local_ids.lock().drain(..) {
            local::unlisten(id);
        }
    }
}

/// A local network endpoint. Must be created inside a tokio runtime.
///
/// Dropping the network stops its listeners and background tasks without
/// the graceful close of [`Network::shutdown`].
pub struct Network {
    inner: Arc<NetworkShared>,
}

impl Network {
    /// Create a network after validating `config`.
    ///
    /// # Errors
    /// `ConfigError::Invalid` listing every problem [`NetworkConfig::validate`]
    /// found; no task is started in that case
    pub fn new(local_pid: Pid, config: NetworkConfig) -> std::result::Result<Self, ConfigError> {
        config.validate_strict()?;
        let metrics = Arc::new(Metrics::new());
        let (connected_tx, connected_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let cancel = CancellationToken::new();
        let scheduler = Scheduler::new(config.scheduler.clone(), metrics.clone());
        info!(pid = %local_pid, "Network created");
        Ok(Self {
            inner: Arc::new(NetworkShared {
                local_pid,
                local_secret: Secret::generate(),
                config: Arc::new(config),
                metrics,
                participants: DashMap::new(),
                connected_tx,
                connected_rx: tokio::sync::Mutex::new(connected_rx),
                events,
                scheduler,
                listeners: cancel.child_token(),
                cancel,
                local_ids: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn local_pid(&self) -> Pid {
        self.inner.local_pid
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.inner.metrics.clone()
    }

    /// Accept connections on `addr`, declaring the configured handshake
    /// features. Returns the bound address (with the actual port when `addr`
    /// asked for port 0).
    ///
    /// # Errors
    /// `ListenFailed` if the address cannot be bound, `NetworkClosed` after shutdown
    pub async fn listen(&self, addr: ListenAddr) -> Result<ListenAddr> {
        let features = self.inner.config.handshake.features;
        self.listen_with_features(addr, features).await
    }

    #[instrument(skip(self, addr), fields(pid = %self.inner.local_pid, addr = ?addr))]
    pub async fn listen_with_features(
        &self,
        addr: ListenAddr,
        features: HandshakeFeatures,
    ) -> Result<ListenAddr> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(NetworkError::NetworkClosed);
        }
        inner.metrics.listen_request(addr.protocol());
        let bound = match addr {
            ListenAddr::Tcp(addr) => ListenAddr::Tcp(
                inner
                    .listen_tcp(addr, features)
                    .await
                    .map_err(NetworkError::ListenFailed)?,
            ),
            ListenAddr::Udp(addr) => ListenAddr::Udp(
                inner
                    .listen_udp(addr, features)
                    .await
                    .map_err(NetworkError::ListenFailed)?,
            ),
            ListenAddr::Quic(addr, server_config) => {
                let local_addr = inner
                    .listen_quic(addr, server_config.clone(), features)
                    .map_err(NetworkError::ListenFailed)?;
                ListenAddr::Quic(local_addr, server_config)
            }
            ListenAddr::Mpsc(id) => {
                inner.listen_local(id, features).map_err(NetworkError::ListenFailed)?;
                ListenAddr::Mpsc(id)
            }
        };
        info!(addr = ?bound, "Listening");
        Ok(bound)
    }

    /// Dial `addr`, declaring the configured handshake features.
    ///
    /// # Errors
    /// `ConnectFailed` carrying the I/O, handshake or registration failure
    pub async fn connect(&self, addr: ConnectAddr) -> Result<Participant> {
        let features = self.inner.config.handshake.features;
        self.connect_with_features(addr, features).await
    }

    #[instrument(skip(self, addr), fields(pid = %self.inner.local_pid, addr = ?addr))]
    pub async fn connect_with_features(
        &self,
        addr: ConnectAddr,
        features: HandshakeFeatures,
    ) -> Result<Participant> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(NetworkError::NetworkClosed);
        }
        let protocol = addr.protocol();
        inner.metrics.connect_request(protocol);
        let peer = match &addr {
            ConnectAddr::Tcp(addr) | ConnectAddr::Udp(addr) | ConnectAddr::Quic(addr, ..) => {
                Some(*addr)
            }
            ConnectAddr::Mpsc(_) => None,
        };
        let participant = inner
            .establish(protocol, peer, false, inner.dial(addr, features))
            .await?;
        info!(remote = %participant.remote_pid(), "Connected");
        Ok(participant)
    }

    /// Wait for the next participant accepted by one of the listeners.
    ///
    /// # Errors
    /// `NetworkClosed` after shutdown
    pub async fn connected(&self) -> Result<Participant> {
        let mut rx = self.inner.connected_rx.lock().await;
        tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => Err(NetworkError::NetworkClosed),
            participant = rx.recv() => participant.ok_or(NetworkError::NetworkClosed),
        }
    }

    pub fn participant(&self, pid: Pid) -> Option<Participant> {
        self.inner.participants.get(&pid).map(|p| p.clone())
    }

    pub fn participants(&self) -> Vec<Participant> {
        self.inner
            .participants
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn participant_count(&self) -> usize {
        self.inner.participants.len()
    }

    /// Gracefully disconnect the participant registered under `pid`.
    ///
    /// # Errors
    /// `UnknownParticipant` if no participant with that pid is registered
    pub async fn disconnect(&self, pid: Pid) -> Result<()> {
        let participant = self
            .participant(pid)
            .ok_or(NetworkError::UnknownParticipant(pid))?;
        if participant.disconnect().await.is_err() {
            debug!(pid = %pid, "Participant was already disconnecting");
        }
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.inner.events.subscribe()
    }

    /// Stop every listener, gracefully disconnect every participant and stop
    /// the background tasks. Later calls are no-ops.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(
            pid = %inner.local_pid,
            participants = inner.participants.len(),
            "Shutting down network"
        );
        inner.release_listeners();

        let participants = self.participants();
        join_all(participants.iter().map(|p| p.disconnect())).await;
        for participant in participants {
            let pid = participant.remote_pid();
            if inner
                .participants
                .remove_if(&pid, |_, registered| registered.same(&participant))
                .is_some()
            {
                inner.emit(NetworkEvent::Disconnected(pid));
            }
        }

        inner.cancel.cancel();
        inner.scheduler.shutdown();
        inner.metrics.log_metrics();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl Drop for Network {
    fn drop(&mut self) {
        self.inner.release_listeners();
        self.inner.cancel.cancel();
    }
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network")
            .field("pid", &self.inner.local_pid)
            .field("participants", &self.inner.participants.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::core::types::{Promises, StreamParams};
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;

    static NEXT_ID: AtomicU64 = AtomicU64::new(0x6e65_7400);

    fn local_id() -> u64 {
        NEXT_ID.fetch_add(1, Ordering::Relaxed)
    }

    #[tokio::test]
    async fn test_in_process_connect_registers_both_sides() {
        let id = local_id();
        let server = Network::new(Pid::fake(1), NetworkConfig::default()).unwrap();
        let client = Network::new(Pid::fake(2), NetworkConfig::default()).unwrap();
        let mut events = server.subscribe();
        server.listen(ListenAddr::Mpsc(id)).await.unwrap();

        let remote = client.connect(ConnectAddr::Mpsc(id)).await.unwrap();
        assert_eq!(remote.remote_pid(), Pid::fake(1));
        let accepted = server.connected().await.unwrap();
        assert_eq!(accepted.remote_pid(), Pid::fake(2));
        assert_eq!(events.recv().await.unwrap(), NetworkEvent::Connected(Pid::fake(2)));
        assert!(server.participant(Pid::fake(2)).is_some());
        assert_eq!(client.participant_count(), 1);

        let stream = remote.open(StreamParams::new(Promises::ORDERED)).await.unwrap();
        stream.send("hello").await.unwrap();
        let incoming = accepted.opened().await.unwrap();
        assert_eq!(incoming.recv::<String>().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_listen_twice_on_same_id_fails() {
        let id = local_id();
        let a = Network::new(Pid::fake(1), NetworkConfig::default()).unwrap();
        let b = Network::new(Pid::fake(2), NetworkConfig::default()).unwrap();
        a.listen(ListenAddr::Mpsc(id)).await.unwrap();
        assert!(matches!(
            b.listen(ListenAddr::Mpsc(id)).await,
            Err(NetworkError::ListenFailed(_))
        ));
        drop(a);
        b.listen(ListenAddr::Mpsc(id)).await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_without_listener_fails() {
        let network = Network::new(Pid::fake(1), NetworkConfig::default()).unwrap();
        let err = network.connect(ConnectAddr::Mpsc(local_id())).await.unwrap_err();
        assert!(matches!(
            err,
            NetworkError::ConnectFailed(NetworkConnectError::Io(_))
        ));
        assert_eq!(network.metrics().snapshot().failed_handshakes, 1);
    }

    #[tokio::test]
    async fn test_disconnect_removes_participant() {
        let id = local_id();
        let server = Network::new(Pid::fake(1), NetworkConfig::default()).unwrap();
        let client = Network::new(Pid::fake(2), NetworkConfig::default()).unwrap();
        server.listen(ListenAddr::Mpsc(id)).await.unwrap();
        let mut events = client.subscribe();
        let remote = client.connect(ConnectAddr::Mpsc(id)).await.unwrap();
        let accepted = server.connected().await.unwrap();

        client.disconnect(Pid::fake(1)).await.unwrap();
        assert!(remote.is_disconnected());
        tokio::time::timeout(Duration::from_secs(5), accepted.disconnected())
            .await
            .unwrap();

        assert_eq!(events.recv().await.unwrap(), NetworkEvent::Connected(Pid::fake(1)));
        assert_eq!(
            tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap(),
            NetworkEvent::Disconnected(Pid::fake(1))
        );
        assert!(client.participant(Pid::fake(1)).is_none());
        assert!(matches!(
            client.disconnect(Pid::fake(1)).await,
            Err(NetworkError::UnknownParticipant(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let id = local_id();
        let server = Network::new(Pid::fake(1), NetworkConfig::default()).unwrap();
        let client = Network::new(Pid::fake(2), NetworkConfig::default()).unwrap();
        server.listen(ListenAddr::Mpsc(id)).await.unwrap();
        let remote = client.connect(ConnectAddr::Mpsc(id)).await.unwrap();

        server.shutdown().await;
        server.shutdown().await;
        assert!(server.is_closed());
        assert_eq!(server.participant_count(), 0);
        assert!(matches!(server.connected().await, Err(NetworkError::NetworkClosed)));
        assert!(matches!(
            server.listen(ListenAddr::Mpsc(id)).await,
            Err(NetworkError::NetworkClosed)
        ));
        tokio::time::timeout(Duration::from_secs(5), remote.disconnected())
            .await
            .unwrap();
    }
}
