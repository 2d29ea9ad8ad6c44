//! QUIC server.
//!
//! Each accepted connection carries one bidirectional stream. The first frame
//! on it must be a handshake; the configured [`Authentication`] decides
//! between an accepted and a rejected reply. Accepted peers are registered by
//! name and their data frames are routed along the workflow.

use crate::auth::{AuthOutcome, Authentication};
use crate::config::Config;
use crate::error::ServerError;
use crate::metrics::Metrics;
use crate::registry::{Peer, PeerInfo, Registry, OUTBOUND_QUEUE_CAPACITY};
use crate::tls::create_server_config;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use sfn_client::Client;
use sfn_core::Router;
use sfn_protocol::{
    AcceptedFrame, ClientType, ConnectionState, DataFrame, Frame, FrameReader, ProtocolError,
    RejectedFrame,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

/// Time allowed for queued frames to drain when a connection ends.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Hook invoked with every data frame received from an accepted peer.
pub type DataHandler = Arc<dyn Fn(&PeerInfo, &DataFrame) + Send + Sync>;

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// QUIC endpoint configuration (TLS and transport idle timeout).
    pub quic: quinn::ServerConfig,
    /// Time allowed for the handshake exchange.
    pub handshake_timeout: Duration,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Metrics instance (if metrics are enabled).
    pub metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("max_connections", &self.max_connections)
            .field("metrics_enabled", &self.metrics.is_some())
            .finish()
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr, quic: quinn::ServerConfig) -> Self {
        Self {
            bind_addr,
            quic,
            handshake_timeout: Duration::from_secs(5),
            max_connections: 1000,
            metrics: None,
        }
    }

    /// Builds the endpoint configuration from processor settings.
    pub fn from_config(bind_addr: SocketAddr, config: &Config) -> Result<Self, ServerError> {
        let quic = create_server_config(&config.tls, config.network.idle_timeout())?;
        Ok(Self::new(bind_addr, quic)
            .with_handshake_timeout(config.network.handshake_timeout())
            .with_max_connections(config.network.max_connections))
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn metrics_enabled(&self) -> bool {
        self.metrics.is_some()
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub handshakes_rejected: AtomicU64,
    pub frames_received: AtomicU64,
    pub frames_forwarded: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub errors_total: AtomicU64,
}

/// QUIC server for one processor.
pub struct Server {
    config: ServerConfig,
    endpoint: quinn::Endpoint,
    shared: Arc<Shared>,
    shutdown: broadcast::Sender<()>,
    shutdown_requested: AtomicBool,
    running: AtomicBool,
}

/// State shared with every connection task.
struct Shared {
    router: Arc<Router>,
    auth: Authentication,
    registry: Registry,
    /// Lifecycle state of every live connection, keyed by connection id.
    sessions: DashMap<Uuid, ConnectionState>,
    stats: ServerStats,
    metrics: Option<Arc<Metrics>>,
    handshake_timeout: Duration,
    handler: RwLock<Option<DataHandler>>,
    downstreams: RwLock<Vec<Client>>,
}

impl Server {
    /// Binds the QUIC endpoint. Must be called within a Tokio runtime.
    pub fn bind(
        config: ServerConfig,
        router: Arc<Router>,
        auth: Authentication,
    ) -> Result<Self, ServerError> {
        let endpoint = quinn::Endpoint::server(config.quic.clone(), config.bind_addr)?;
        let (shutdown, _) = broadcast::channel(1);

        let shared = Arc::new(Shared {
            router,
            auth,
            registry: Registry::new(),
            sessions: DashMap::new(),
            stats: ServerStats::default(),
            metrics: config.metrics.clone(),
            handshake_timeout: config.handshake_timeout,
            handler: RwLock::new(None),
            downstreams: RwLock::new(Vec::new()),
        });

        Ok(Self {
            config,
            endpoint,
            shared,
            shutdown,
            shutdown_requested: AtomicBool::new(false),
            running: AtomicBool::new(false),
        })
    }

    /// Address the endpoint is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Registers a hook that sees every received data frame.
    pub fn set_handler<F>(&self, handler: F)
    where
        F: Fn(&PeerInfo, &DataFrame) + Send + Sync + 'static,
    {
        *self.shared.handler.write() = Some(Arc::new(handler));
    }

    /// Adds a connected downstream processor to forward data to.
    pub fn add_downstream(&self, client: Client) {
        self.shared.downstreams.write().push(client);
    }

    pub fn downstreams(&self) -> Vec<Client> {
        self.shared.downstreams.read().clone()
    }

    /// Runs the accept loop until [`Server::shutdown`] is called.
    pub async fn run(&self) -> Result<(), ServerError> {
        let mut shutdown_rx = self.shutdown.subscribe();
        if self.shutdown_requested.load(Ordering::SeqCst) {
            self.endpoint.close(0u32.into(), b"shutdown");
            return Ok(());
        }

        self.running.store(true, Ordering::SeqCst);
        tracing::info!("Server listening on {} (QUIC)", self.local_addr()?);

        loop {
            tokio::select! {
                incoming = self.endpoint.accept() => {
                    let Some(incoming) = incoming else {
                        tracing::info!("Endpoint closed");
                        break;
                    };
                    let addr = incoming.remote_address();

                    if self.shared.stats.connections_active.load(Ordering::Relaxed)
                        >= self.config.max_connections as u64
                    {
                        tracing::warn!("Connection limit reached, rejecting {}", addr);
                        incoming.refuse();
                        continue;
                    }

                    self.shared.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                    self.shared.stats.connections_active.fetch_add(1, Ordering::Relaxed);
                    if let Some(ref metrics) = self.shared.metrics {
                        metrics.connections_total.inc();
                    }

                    let shared = self.shared.clone();
                    let mut conn_shutdown = self.shutdown.subscribe();
                    let id = Uuid::new_v4();
                    shared.set_state(id, addr, ConnectionState::Connecting);

                    tokio::spawn(async move {
                        let result = Self::handle_connection(
                            incoming,
                            addr,
                            id,
                            &shared,
                            &mut conn_shutdown,
                        )
                        .await;

                        if let Err(e) = result {
                            tracing::debug!("[{}] Connection error: {}", addr, e);
                            shared.stats.errors_total.fetch_add(1, Ordering::Relaxed);
                        }

                        shared.sessions.remove(&id);
                        shared.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                        tracing::info!("[{}] Client disconnected", addr);
                    });
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }

        self.endpoint.close(0u32.into(), b"shutdown");
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn handle_connection(
        incoming: quinn::Incoming,
        addr: SocketAddr,
        id: Uuid,
        shared: &Arc<Shared>,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        let connection = incoming.await?;
        tracing::debug!("[{}] QUIC connection established", addr);

        let (mut send, recv) =
            match tokio::time::timeout(shared.handshake_timeout, connection.accept_bi()).await {
                Ok(streams) => streams?,
                Err(_) => {
                    shared.record_handshake("timeout");
                    shared.set_state(id, addr, ConnectionState::Rejected);
                    connection.close(0u32.into(), b"handshake timeout");
                    return Err(ServerError::HandshakeTimeout);
                }
            };
        shared.set_state(id, addr, ConnectionState::Authenticating);
        let mut reader = FrameReader::new(recv);

        let first = tokio::time::timeout(shared.handshake_timeout, reader.read_frame()).await;
        let handshake = match first {
            Ok(Ok(Some(Frame::Handshake(handshake)))) => handshake,
            Ok(Ok(Some(other))) => {
                tracing::warn!(
                    "[{}] Expected handshake, got {} frame",
                    addr,
                    other.frame_type()
                );
                shared.record_handshake("invalid");
                shared.set_state(id, addr, ConnectionState::Rejected);
                Self::reject(&connection, send).await;
                return Err(ServerError::Protocol(ProtocolError::UnexpectedFrame {
                    expected: "handshake",
                    actual: other.frame_type().as_str(),
                }));
            }
            Ok(Ok(None)) => {
                tracing::debug!("[{}] Closed before handshake", addr);
                return Ok(());
            }
            Ok(Err(e)) => {
                tracing::warn!("[{}] Malformed handshake: {}", addr, e);
                shared.record_handshake("invalid");
                shared.set_state(id, addr, ConnectionState::Rejected);
                Self::reject(&connection, send).await;
                return Err(e.into());
            }
            Err(_) => {
                tracing::warn!("[{}] Handshake timed out", addr);
                shared.record_handshake("timeout");
                shared.set_state(id, addr, ConnectionState::Rejected);
                Self::reject(&connection, send).await;
                return Err(ServerError::HandshakeTimeout);
            }
        };

        tracing::info!(
            "[{}] Handshake from '{}' ({})",
            addr,
            handshake.name,
            handshake.client_type
        );

        if let AuthOutcome::Rejected(reason) = shared.auth.authenticate(&handshake) {
            tracing::warn!("[{}] Rejected '{}': {}", addr, handshake.name, reason);
            shared.record_handshake("rejected");
            shared
                .stats
                .handshakes_rejected
                .fetch_add(1, Ordering::Relaxed);
            shared.set_state(id, addr, ConnectionState::Rejected);
            Self::reject(&connection, send).await;
            return Err(ServerError::AuthFailed(reason));
        }

        send.write_all(&AcceptedFrame.encode()).await?;
        shared.record_handshake("accepted");
        shared.set_state(id, addr, ConnectionState::Accepted);

        let mut info = PeerInfo::from_handshake(&handshake, addr);
        info.id = id;
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let peer = Arc::new(Peer::new(info.clone(), tx));
        shared.registry.register(peer.clone());
        if let Some(ref metrics) = shared.metrics {
            metrics.connections_active.inc();
        }
        let writer = tokio::spawn(write_loop(send, rx, addr));
        shared.set_state(id, addr, ConnectionState::Connected);

        let result = Self::read_loop(shared, &peer, &mut reader, &connection, shutdown).await;
        let end = if result.is_ok() {
            ConnectionState::Disconnected
        } else {
            ConnectionState::Aborted
        };
        shared.set_state(id, addr, end);

        shared.registry.remove(&info.name, info.id);
        if let Some(ref metrics) = shared.metrics {
            metrics.connections_active.dec();
        }
        drop(peer);
        let _ = tokio::time::timeout(CLOSE_GRACE, writer).await;
        connection.close(0u32.into(), b"bye");

        result
    }

    /// Reads frames from an accepted peer until it leaves or is evicted.
    async fn read_loop(
        shared: &Shared,
        peer: &Peer,
        reader: &mut FrameReader<quinn::RecvStream>,
        connection: &quinn::Connection,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        let addr = peer.info().remote_addr;

        loop {
            tokio::select! {
                result = reader.read_frame() => {
                    match result {
                        Ok(Some(Frame::Data(frame))) => {
                            shared.record_received("data");
                            shared.dispatch(peer.info(), frame).await;
                        }
                        Ok(Some(other)) => {
                            let kind = other.frame_type().as_str();
                            tracing::debug!("[{}] Ignoring {} frame from '{}'", addr, kind, peer.name());
                            shared.record_received(kind);
                            shared.record_dropped("unexpected_frame");
                        }
                        Ok(None) => {
                            tracing::debug!("[{}] '{}' closed the stream", addr, peer.name());
                            return Ok(());
                        }
                        Err(e) if !e.is_fatal() => {
                            tracing::warn!("[{}] Dropping frame from '{}': {}", addr, peer.name(), e);
                            let reason = match e {
                                ProtocolError::UnknownFrameType(_) => "unknown_frame",
                                _ => "malformed",
                            };
                            shared.record_dropped(reason);
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                _ = peer.evicted() => {
                    connection.close(0u32.into(), b"replaced");
                    return Ok(());
                }
                _ = shutdown.recv() => {
                    connection.close(0u32.into(), b"shutdown");
                    return Ok(());
                }
            }
        }
    }

    /// Sends a rejected frame and lets it drain before closing.
    async fn reject(connection: &quinn::Connection, mut send: quinn::SendStream) {
        if send.write_all(&RejectedFrame.encode()).await.is_ok() && send.finish().is_ok() {
            let _ = tokio::time::timeout(CLOSE_GRACE, send.stopped()).await;
        }
        connection.close(0u32.into(), b"rejected");
    }

    /// Initiates server shutdown.
    pub fn shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
        let _ = self.shutdown.send(());
    }

    /// Receiver notified when [`Server::shutdown`] is called.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.shared.stats
    }

    pub fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    /// Lifecycle state of connection `id`, while its task is alive.
    ///
    /// A registered peer's [`PeerInfo::id`] is its connection id.
    pub fn connection_state(&self, id: Uuid) -> Option<ConnectionState> {
        self.shared.sessions.get(&id).map(|s| *s)
    }

    /// States of every live connection, registered or not.
    pub fn connection_states(&self) -> Vec<(Uuid, ConnectionState)> {
        self.shared
            .sessions
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect()
    }

    /// Currently registered peers.
    pub fn connections(&self) -> Vec<PeerInfo> {
        self.shared.registry.snapshot()
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.shared.router
    }
}

impl Shared {
    /// Forwards a data frame from `from` to its targets.
    ///
    /// Sources and upstream processors feed every workflow function; a stream
    /// function feeds the functions after it. A target only receives tags it
    /// observes. Data from sources and stream functions also goes to every
    /// downstream processor.
    async fn dispatch(&self, from: &PeerInfo, frame: DataFrame) {
        let tag = frame.tag();
        let targets = match from.client_type {
            ClientType::Source | ClientType::UpstreamProcessor => self
                .router
                .route(&from.app_id)
                .map(|route| route.all().to_vec())
                .unwrap_or_default(),
            ClientType::StreamFunction => self.router.forward_routes(&from.app_id, &from.name),
        };

        let encoded: Bytes = frame.encode();
        for name in &targets {
            let Some(peer) = self.registry.get(name) else {
                tracing::debug!("No peer '{}' connected, skipping", name);
                continue;
            };
            if !peer.observes(tag) {
                continue;
            }
            match peer.send(encoded.clone()).await {
                Ok(()) => self.record_forwarded(ClientType::StreamFunction.as_str()),
                Err(e) => {
                    tracing::debug!("Forward to '{}' failed: {}", name, e);
                    self.record_dropped("peer_closed");
                }
            }
        }

        if matches!(
            from.client_type,
            ClientType::Source | ClientType::StreamFunction
        ) {
            let downstreams = self.downstreams.read().clone();
            let data = Frame::Data(frame.clone());
            for client in downstreams {
                match client.write_frame(&data).await {
                    Ok(()) => self.record_forwarded(ClientType::UpstreamProcessor.as_str()),
                    Err(e) => {
                        tracing::warn!("Forward to downstream '{}' failed: {}", client.remote_addr(), e);
                        self.record_dropped("downstream_error");
                    }
                }
            }
        }

        let handler = self.handler.read().clone();
        if let Some(handler) = handler {
            handler(from, &frame);
        }
    }

    fn set_state(&self, id: Uuid, addr: SocketAddr, state: ConnectionState) {
        tracing::trace!("[{}] Connection {} -> {}", addr, id, state);
        self.sessions.insert(id, state);
    }

    fn record_handshake(&self, outcome: &str) {
        if let Some(ref metrics) = self.metrics {
            metrics.handshakes_total.with_label_values(&[outcome]).inc();
        }
    }

    fn record_received(&self, kind: &str) {
        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);
        if let Some(ref metrics) = self.metrics {
            metrics.frames_received_total.with_label_values(&[kind]).inc();
        }
    }

    fn record_forwarded(&self, target: &str) {
        self.stats.frames_forwarded.fetch_add(1, Ordering::Relaxed);
        if let Some(ref metrics) = self.metrics {
            metrics
                .frames_forwarded_total
                .with_label_values(&[target])
                .inc();
        }
    }

    fn record_dropped(&self, reason: &str) {
        self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
        if let Some(ref metrics) = self.metrics {
            metrics.frames_dropped_total.with_label_values(&[reason]).inc();
        }
    }
}

/// Drains a peer's outbound queue into its send stream.
async fn write_loop(mut send: quinn::SendStream, mut rx: mpsc::Receiver<Bytes>, addr: SocketAddr) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = send.write_all(&frame).await {
            tracing::debug!("[{}] Write failed: {}", addr, e);
            return;
        }
    }
    let _ = send.finish();
}
