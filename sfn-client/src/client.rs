//! Client connection.
//!
//! A [`Client`] owns one QUIC connection with a single bidirectional stream.
//! [`Client::connect`] sends the handshake and waits for the verdict; once
//! accepted a background task reads frames and hands observed data to the
//! registered handler. Writes are serialized through a mutex around the send
//! stream.

use crate::credential::Credential;
use crate::error::ClientError;
use crate::tls::{create_client_config, TlsClientConfig};
use bytes::Bytes;
use parking_lot::RwLock;
use sfn_protocol::{
    ClientType, ConnectionState, DataFrame, Frame, FrameReader, HandshakeFrame,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};

/// Time allowed for buffered writes to drain when closing.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Data handler. A returned `(tag, carriage)` is written back as a data frame
/// carrying the transaction id of the frame that produced it.
pub type DataHandler = Arc<dyn Fn(u8, Bytes) -> Option<(u8, Bytes)> + Send + Sync>;

/// Called with every state the connection enters, starting with `Connecting`.
pub type StateObserver = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// How the read loop runs the data handler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HandlerMode {
    /// In the read loop; frames are handled in arrival order.
    #[default]
    Sequential,
    /// One task per frame; results may be written out of order.
    Concurrent,
}

/// Client configuration.
#[derive(Clone)]
pub struct ClientConfig {
    /// Name announced in the handshake.
    pub name: String,
    pub client_type: ClientType,
    /// Data tags to receive. Empty means all.
    pub observe_data_tags: Vec<u8>,
    pub app_id: String,
    pub credential: Credential,
    pub tls: TlsClientConfig,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub idle_timeout: Duration,
    pub handler_mode: HandlerMode,
    pub state_observer: Option<StateObserver>,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("name", &self.name)
            .field("client_type", &self.client_type)
            .field("observe_data_tags", &self.observe_data_tags)
            .field("app_id", &self.app_id)
            .field("credential", &self.credential)
            .field("tls", &self.tls)
            .field("connect_timeout", &self.connect_timeout)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .field("handler_mode", &self.handler_mode)
            .field("state_observer", &self.state_observer.is_some())
            .finish()
    }
}

impl ClientConfig {
    pub fn new(name: impl Into<String>, client_type: ClientType) -> Self {
        Self {
            name: name.into(),
            client_type,
            observe_data_tags: Vec::new(),
            app_id: String::new(),
            credential: Credential::None,
            tls: TlsClientConfig::default(),
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(300),
            handler_mode: HandlerMode::default(),
            state_observer: None,
        }
    }

    pub fn with_observe_data_tags(mut self, tags: impl Into<Vec<u8>>) -> Self {
        self.observe_data_tags = tags.into();
        self
    }

    pub fn with_app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = app_id.into();
        self
    }

    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = credential;
        self
    }

    pub fn with_tls(mut self, tls: TlsClientConfig) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_handler_mode(mut self, mode: HandlerMode) -> Self {
        self.handler_mode = mode;
        self
    }

    /// Reports every state transition, including those of a failed connect.
    pub fn with_state_observer<F>(mut self, observer: F) -> Self
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.state_observer = Some(Arc::new(observer));
        self
    }

    /// Handshake frame describing this client.
    pub fn handshake(&self) -> HandshakeFrame {
        let mut frame = HandshakeFrame::new(self.name.clone(), self.client_type);
        frame.observe_data_tags = self.observe_data_tags.clone();
        frame.app_id = self.app_id.clone();
        frame.auth_type = self.credential.auth_type();
        frame.auth_payload = self.credential.payload(&self.name, &self.app_id);
        frame
    }

    /// Whether a data frame tagged `tag` should reach the handler.
    pub fn observes(&self, tag: u8) -> bool {
        self.observe_data_tags.is_empty() || self.observe_data_tags.contains(&tag)
    }
}

/// Current connection state plus the optional observer.
struct StateCell {
    state: RwLock<ConnectionState>,
    observer: Option<StateObserver>,
}

impl StateCell {
    fn new(observer: Option<StateObserver>) -> Self {
        Self {
            state: RwLock::new(ConnectionState::Disconnected),
            observer,
        }
    }

    fn get(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Moves to `next` and returns the previous state.
    fn set(&self, next: ConnectionState) -> ConnectionState {
        let previous = std::mem::replace(&mut *self.state.write(), next);
        if previous != next {
            self.notify(next);
        }
        previous
    }

    /// Moves to `next` only from an open state.
    fn set_if_open(&self, next: ConnectionState) -> bool {
        let changed = {
            let mut state = self.state.write();
            if state.is_open() {
                *state = next;
                true
            } else {
                false
            }
        };
        if changed {
            self.notify(next);
        }
        changed
    }

    fn notify(&self, state: ConnectionState) {
        if let Some(ref observer) = self.observer {
            observer(state);
        }
    }
}

/// Transport pieces of a connection whose handshake was accepted.
struct Established {
    remote_addr: SocketAddr,
    endpoint: quinn::Endpoint,
    connection: quinn::Connection,
    send: quinn::SendStream,
    reader: FrameReader<quinn::RecvStream>,
}

/// A connected client. Clones share the connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

struct Inner {
    config: ClientConfig,
    remote_addr: SocketAddr,
    endpoint: quinn::Endpoint,
    connection: quinn::Connection,
    writer: Mutex<Option<quinn::SendStream>>,
    state: StateCell,
    closed: AtomicBool,
    handler: RwLock<Option<DataHandler>>,
    done: watch::Sender<bool>,
}

impl Client {
    /// Connects to `addr` (`host:port`) and completes the handshake.
    ///
    /// Fails with [`ClientError::Rejected`] when the server refuses the
    /// credentials. Any other failure leaves the connection `Aborted`.
    pub async fn connect(addr: &str, config: ClientConfig) -> Result<Self, ClientError> {
        let state = StateCell::new(config.state_observer.clone());
        state.set(ConnectionState::Connecting);

        let established = match establish(addr, &config, &state).await {
            Ok(established) => established,
            Err(e) => {
                if state.get() != ConnectionState::Rejected {
                    state.set(ConnectionState::Aborted);
                }
                return Err(e);
            }
        };
        let Established {
            remote_addr,
            endpoint,
            connection,
            send,
            reader,
        } = established;
        tracing::info!("[{}] Connected as '{}'", remote_addr, config.name);

        let (done, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            config,
            remote_addr,
            endpoint,
            connection,
            writer: Mutex::new(Some(send)),
            state,
            closed: AtomicBool::new(false),
            handler: RwLock::new(None),
            done,
        });
        inner.state.set(ConnectionState::Connected);

        tokio::spawn(read_loop(inner.clone(), reader));

        Ok(Self { inner })
    }

    /// Registers the handler for observed data frames.
    pub fn set_handler<F>(&self, handler: F)
    where
        F: Fn(u8, Bytes) -> Option<(u8, Bytes)> + Send + Sync + 'static,
    {
        *self.inner.handler.write() = Some(Arc::new(handler));
    }

    /// Writes one frame.
    pub async fn write_frame(&self, frame: &Frame) -> Result<(), ClientError> {
        self.inner.write_frame(frame).await
    }

    /// Writes `carriage` as a data frame tagged `tag`.
    pub async fn write_data(&self, tag: u8, carriage: impl Into<Bytes>) -> Result<(), ClientError> {
        let frame = DataFrame::with_carriage(tag, carriage)?;
        self.inner.write_frame(&Frame::Data(frame)).await
    }

    /// Closes the stream and connection from any state. Calling it again is
    /// a no-op.
    ///
    /// Pending writes fail once the connection is closed; a write stalled on
    /// flow control does not hold up the close.
    pub async fn close(&self) -> Result<(), ClientError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.state.set(ConnectionState::Disconnected);
        tracing::debug!("[{}] Closing connection", self.inner.remote_addr);

        // The lock is only free when no write is in flight.
        if let Ok(mut writer) = self.inner.writer.try_lock() {
            if let Some(mut send) = writer.take() {
                if send.finish().is_ok() {
                    let _ = tokio::time::timeout(CLOSE_GRACE, send.stopped()).await;
                }
            }
        }
        self.inner.connection.close(0u32.into(), b"close");
        self.inner.endpoint.close(0u32.into(), b"close");
        self.inner.done.send_replace(true);
        Ok(())
    }

    /// Waits until the read loop has stopped.
    pub async fn wait_closed(&self) {
        let mut done = self.inner.done.subscribe();
        let _ = done.wait_for(|done| *done).await;
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.get()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_open()
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("name", &self.inner.config.name)
            .field("client_type", &self.inner.config.client_type)
            .field("remote_addr", &self.inner.remote_addr)
            .field("state", &self.state())
            .finish()
    }
}

/// Dials, opens the stream and exchanges the handshake.
async fn establish(
    addr: &str,
    config: &ClientConfig,
    state: &StateCell,
) -> Result<Established, ClientError> {
    let remote_addr = tokio::net::lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| ClientError::Resolve(addr.to_string()))?;
    let server_name = match config.tls.server_name {
        Some(ref name) => name.clone(),
        None => host_of(addr).to_string(),
    };
    tracing::debug!("Connecting to {} ({})...", remote_addr, server_name);

    let bind_addr: SocketAddr = if remote_addr.is_ipv6() {
        SocketAddr::from(([0u16; 8], 0))
    } else {
        SocketAddr::from(([0u8; 4], 0))
    };
    let mut endpoint = quinn::Endpoint::client(bind_addr)?;
    endpoint.set_default_client_config(create_client_config(
        &config.tls,
        config.idle_timeout,
    )?);

    let connecting = endpoint.connect(remote_addr, &server_name)?;
    let connection = tokio::time::timeout(config.connect_timeout, connecting)
        .await
        .map_err(|_| {
            tracing::debug!("Connection timeout");
            endpoint.close(0u32.into(), b"timeout");
            ClientError::Timeout
        })??;
    let (mut send, recv) = connection.open_bi().await?;

    state.set(ConnectionState::Authenticating);
    tracing::debug!("[{}] Sending handshake as '{}'", remote_addr, config.name);
    send.write_all(&config.handshake().encode()).await?;

    let mut reader = FrameReader::new(recv);
    let verdict = match tokio::time::timeout(config.handshake_timeout, reader.read_frame()).await {
        Ok(verdict) => verdict,
        Err(_) => {
            connection.close(0u32.into(), b"handshake timeout");
            return Err(ClientError::Timeout);
        }
    };
    match verdict? {
        Some(Frame::Accepted(_)) => {
            state.set(ConnectionState::Accepted);
            Ok(Established {
                remote_addr,
                endpoint,
                connection,
                send,
                reader,
            })
        }
        Some(Frame::Rejected(_)) => {
            tracing::warn!("[{}] Handshake rejected", remote_addr);
            state.set(ConnectionState::Rejected);
            connection.close(0u32.into(), b"rejected");
            Err(ClientError::Rejected)
        }
        Some(other) => {
            connection.close(0u32.into(), b"protocol error");
            Err(ClientError::UnexpectedFrame(other.frame_type().as_str()))
        }
        None => Err(ClientError::ConnectionClosed),
    }
}

impl Inner {
    async fn write_frame(&self, frame: &Frame) -> Result<(), ClientError> {
        if !self.state.get().is_open() {
            return Err(ClientError::NotConnected);
        }

        let bytes = frame.encode();
        let mut guard = self.writer.lock().await;
        let send = guard.as_mut().ok_or(ClientError::NotConnected)?;
        if let Err(e) = send.write_all(&bytes).await {
            tracing::debug!("[{}] Write failed: {}", self.remote_addr, e);
            self.abort();
            return Err(e.into());
        }
        Ok(())
    }

    /// Moves an open connection to `Aborted`; a closed one stays closed.
    fn abort(&self) {
        self.state.set_if_open(ConnectionState::Aborted);
    }

    /// Finishes the read loop after the server ended the stream.
    fn end(&self) {
        self.state.set_if_open(ConnectionState::Disconnected);
    }
}

async fn read_loop(inner: Arc<Inner>, mut reader: FrameReader<quinn::RecvStream>) {
    let addr = inner.remote_addr;
    loop {
        match reader.read_frame().await {
            Ok(Some(Frame::Data(frame))) => {
                if !inner.config.observes(frame.tag()) {
                    tracing::debug!("[{}] Ignoring unobserved tag {:#04x}", addr, frame.tag());
                    continue;
                }
                let Some(handler) = inner.handler.read().clone() else {
                    tracing::debug!("[{}] No handler, dropping data frame", addr);
                    continue;
                };
                match inner.config.handler_mode {
                    HandlerMode::Sequential => handle_data(&inner, &handler, frame).await,
                    HandlerMode::Concurrent => {
                        let inner = inner.clone();
                        tokio::spawn(async move { handle_data(&inner, &handler, frame).await });
                    }
                }
            }
            Ok(Some(other)) => {
                tracing::debug!("[{}] Ignoring {} frame", addr, other.frame_type());
            }
            Ok(None) => {
                tracing::info!("[{}] Server closed the stream", addr);
                inner.end();
                break;
            }
            Err(e) if !e.is_fatal() => {
                tracing::warn!("[{}] Dropping malformed frame: {}", addr, e);
            }
            Err(e) => {
                if inner.state.get().is_open() {
                    tracing::warn!("[{}] Connection aborted: {}", addr, e);
                }
                inner.abort();
                break;
            }
        }
    }
    inner.done.send_replace(true);
}

async fn handle_data(inner: &Inner, handler: &DataHandler, frame: DataFrame) {
    let Some((tag, carriage)) = handler(frame.tag(), frame.carriage().clone()) else {
        return;
    };

    let mut reply = match DataFrame::with_carriage(tag, carriage) {
        Ok(reply) => reply,
        Err(e) => {
            tracing::warn!("[{}] Handler returned invalid data: {}", inner.remote_addr, e);
            return;
        }
    };
    reply.set_transaction_id(frame.transaction_id());
    if let Err(e) = inner.write_frame(&Frame::Data(reply)).await {
        tracing::warn!("[{}] Failed to write handler result: {}", inner.remote_addr, e);
    }
}

/// Host part of `host:port`, without IPv6 brackets.
fn host_of(addr: &str) -> &str {
    let host = match addr.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() => host,
        _ => addr,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfn_protocol::AuthType;

    #[test]
    fn test_config_defaults() {
        let config = ClientConfig::new("sfn-1", ClientType::StreamFunction);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.handshake_timeout, Duration::from_secs(5));
        assert_eq!(config.handler_mode, HandlerMode::Sequential);
        assert!(config.observes(0x33));
    }

    #[test]
    fn test_handshake_from_config() {
        let config = ClientConfig::new("sfn-1", ClientType::StreamFunction)
            .with_observe_data_tags(vec![0x10, 0x20])
            .with_app_id("demo")
            .with_credential(Credential::AppKey("s3cret".into()));
        let handshake = config.handshake();

        assert_eq!(handshake.name, "sfn-1");
        assert_eq!(handshake.client_type, ClientType::StreamFunction);
        assert_eq!(handshake.observe_data_tags, vec![0x10, 0x20]);
        assert_eq!(handshake.app_id, "demo");
        assert_eq!(handshake.auth_type, AuthType::AppKey);
        assert_eq!(handshake.auth_payload.as_ref(), b"s3cret");

        assert!(config.observes(0x20));
        assert!(!config.observes(0x30));
    }

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("localhost:9000"), "localhost");
        assert_eq!(host_of("127.0.0.1:9000"), "127.0.0.1");
        assert_eq!(host_of("[::1]:9000"), "::1");
        assert_eq!(host_of("example.com"), "example.com");
    }

    #[tokio::test]
    async fn test_connect_unresolvable() {
        let config = ClientConfig::new("sfn-1", ClientType::Source);
        let err = Client::connect("not an address", config).await.unwrap_err();
        assert!(matches!(err, ClientError::Io(_) | ClientError::Resolve(_)));
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        // Nothing answers on this port; the QUIC handshake never completes.
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = socket.local_addr().unwrap().to_string();
        let config = ClientConfig::new("sfn-1", ClientType::Source)
            .with_tls(TlsClientConfig::new().with_insecure())
            .with_connect_timeout(Duration::from_millis(200));
        let err = Client::connect(&addr, config).await.unwrap_err();
        assert!(matches!(err, ClientError::Timeout));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_failed_connect_reports_aborted() {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = socket.local_addr().unwrap().to_string();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let observed = seen.clone();
        let config = ClientConfig::new("sfn-1", ClientType::Source)
            .with_tls(TlsClientConfig::new().with_insecure())
            .with_connect_timeout(Duration::from_millis(200))
            .with_state_observer(move |state| observed.lock().push(state));

        Client::connect(&addr, config).await.unwrap_err();
        assert_eq!(
            *seen.lock(),
            vec![ConnectionState::Connecting, ConnectionState::Aborted]
        );
    }

    #[test]
    fn test_state_cell_transitions() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let observed = seen.clone();
        let observer: StateObserver =
            Arc::new(move |state: ConnectionState| observed.lock().push(state));
        let cell = StateCell::new(Some(observer));

        assert!(!cell.set_if_open(ConnectionState::Aborted));
        cell.set(ConnectionState::Connected);
        cell.set(ConnectionState::Connected);
        assert!(cell.set_if_open(ConnectionState::Aborted));
        assert_eq!(cell.set(ConnectionState::Disconnected), ConnectionState::Aborted);
        assert!(!cell.set_if_open(ConnectionState::Aborted));

        assert_eq!(
            *seen.lock(),
            vec![
                ConnectionState::Connected,
                ConnectionState::Aborted,
                ConnectionState::Disconnected,
            ]
        );
    }

    #[test]
    fn test_config_debug_hides_observer() {
        let config = ClientConfig::new("sfn-1", ClientType::Source).with_state_observer(|_| {});
        let debug = format!("{:?}", config);
        assert!(debug.contains("state_observer: true"));
    }
}
