//! End-to-end tests over QUIC on the loopback interface.
//!
//! Every server runs with a freshly generated dev certificate; clients skip
//! certificate verification.

use bytes::Bytes;
use parking_lot::Mutex;
use sfn_client::{Client, ClientConfig, ClientError, Credential, TlsClientConfig};
use sfn_core::{DownstreamConfig, Router, WorkflowConfig};
use sfn_protocol::{
    AcceptedFrame, ClientType, ConnectionState, DataFrame, Frame, FrameReader, HandshakeFrame,
};
use sfn_server::auth::hash_secret;
use sfn_server::tls::{build_server_config, generate_dev_cert};
use sfn_server::{Authentication, Config, Processor, Server, ServerConfig};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(5);

struct TestServer {
    server: Arc<Server>,
    addr: SocketAddr,
}

impl TestServer {
    async fn start(functions: &[&str], auth: Authentication) -> Self {
        let mut workflow = WorkflowConfig::single("processor", "127.0.0.1", 9000, functions[0]);
        workflow.functions = functions
            .iter()
            .map(|f| sfn_core::FunctionConfig::new(*f))
            .collect();

        let (certs, key) = generate_dev_cert().unwrap();
        let quic = build_server_config(certs, key, Duration::from_secs(30)).unwrap();
        let config = ServerConfig::new("127.0.0.1:0".parse().unwrap(), quic)
            .with_handshake_timeout(Duration::from_secs(2));

        let server = Arc::new(Server::bind(config, Arc::new(Router::new(workflow)), auth).unwrap());
        let addr = server.local_addr().unwrap();
        let runner = server.clone();
        tokio::spawn(async move { runner.run().await });

        Self { server, addr }
    }

    fn target(&self) -> String {
        self.addr.to_string()
    }

    /// Waits until `n` peers are registered.
    async fn wait_for_peers(&self, n: usize) {
        tokio::time::timeout(WAIT, async {
            while self.server.connections().len() != n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("peers did not register in time");
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server.shutdown();
    }
}

fn insecure_tls() -> TlsClientConfig {
    TlsClientConfig::new()
        .with_insecure()
        .with_server_name("localhost")
}

fn client_config(name: &str, client_type: ClientType) -> ClientConfig {
    ClientConfig::new(name, client_type)
        .with_tls(insecure_tls())
        .with_connect_timeout(WAIT)
}

/// Connects a stream function whose observed data lands in the returned channel.
async fn function(
    target: &str,
    name: &str,
    tags: &[u8],
) -> (Client, mpsc::UnboundedReceiver<(u8, Bytes)>) {
    let config =
        client_config(name, ClientType::StreamFunction).with_observe_data_tags(tags.to_vec());
    let client = Client::connect(target, config).await.unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    client.set_handler(move |tag, data| {
        let _ = tx.send((tag, data));
        None
    });
    (client, rx)
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<(u8, Bytes)>) -> (u8, Bytes) {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for data")
        .expect("channel closed")
}

async fn assert_silent(rx: &mut mpsc::UnboundedReceiver<(u8, Bytes)>) {
    let received = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
    assert!(received.is_err(), "unexpected data: {:?}", received);
}

/// Bare QUIC endpoint standing in for a processor.
fn raw_server() -> (quinn::Endpoint, SocketAddr) {
    let (certs, key) = generate_dev_cert().unwrap();
    let config = build_server_config(certs, key, Duration::from_secs(30)).unwrap();
    let endpoint = quinn::Endpoint::server(config, "127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = endpoint.local_addr().unwrap();
    (endpoint, addr)
}

/// Accepts one connection and answers its handshake, then leaves the stream
/// to the caller.
async fn accept_handshake(
    endpoint: &quinn::Endpoint,
) -> (quinn::Connection, quinn::SendStream, FrameReader<quinn::RecvStream>) {
    let connection = endpoint.accept().await.unwrap().await.unwrap();
    let (mut send, recv) = connection.accept_bi().await.unwrap();
    let mut reader = FrameReader::new(recv);
    let first = reader.read_frame().await.unwrap();
    assert!(matches!(first, Some(Frame::Handshake(_))));
    send.write_all(&AcceptedFrame.encode()).await.unwrap();
    (connection, send, reader)
}

fn recording_config(
    name: &str,
    client_type: ClientType,
) -> (ClientConfig, Arc<Mutex<Vec<ConnectionState>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let observed = seen.clone();
    let config = client_config(name, client_type)
        .with_state_observer(move |state| observed.lock().push(state));
    (config, seen)
}

fn free_port() -> u16 {
    std::net::UdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

#[tokio::test]
async fn handshake_accepted_and_registered() {
    let server = TestServer::start(&["fn-a"], Authentication::None).await;

    let config = client_config("fn-a", ClientType::StreamFunction).with_observe_data_tags(vec![0x33]);
    let client = Client::connect(&server.target(), config).await.unwrap();
    assert_eq!(client.state(), ConnectionState::Connected);

    server.wait_for_peers(1).await;
    let peers = server.server.connections();
    assert_eq!(peers[0].name, "fn-a");
    assert_eq!(peers[0].client_type, ClientType::StreamFunction);
    assert_eq!(peers[0].observe_data_tags, vec![0x33]);

    client.close().await.unwrap();
    server.wait_for_peers(0).await;
}

#[tokio::test]
async fn app_key_authentication() {
    let auth = Authentication::AppKey {
        app_id: "app-1".to_string(),
        secret_hashes: HashSet::from([hash_secret(b"s3cret")]),
    };
    let server = TestServer::start(&["fn-a"], auth).await;

    let good = client_config("src", ClientType::Source)
        .with_app_id("app-1")
        .with_credential(Credential::AppKey("s3cret".to_string()));
    let client = Client::connect(&server.target(), good).await.unwrap();
    assert!(client.is_connected());

    let wrong_secret = client_config("src-2", ClientType::Source)
        .with_app_id("app-1")
        .with_credential(Credential::AppKey("guess".to_string()));
    let err = Client::connect(&server.target(), wrong_secret).await.unwrap_err();
    assert!(matches!(err, ClientError::Rejected));

    let wrong_app = client_config("src-3", ClientType::Source)
        .with_app_id("app-2")
        .with_credential(Credential::AppKey("s3cret".to_string()));
    let err = Client::connect(&server.target(), wrong_app).await.unwrap_err();
    assert!(matches!(err, ClientError::Rejected));

    let no_credential = client_config("src-4", ClientType::Source).with_app_id("app-1");
    let err = Client::connect(&server.target(), no_credential).await.unwrap_err();
    assert!(matches!(err, ClientError::Rejected));

    server.wait_for_peers(1).await;
    assert_eq!(server.server.stats().handshakes_rejected.load(std::sync::atomic::Ordering::Relaxed), 3);
}

#[tokio::test]
async fn non_handshake_first_frame_is_rejected() {
    let server = TestServer::start(&["fn-a"], Authentication::None).await;

    let mut endpoint = quinn::Endpoint::client("127.0.0.1:0".parse().unwrap()).unwrap();
    endpoint.set_default_client_config(
        sfn_client::tls::create_client_config(&insecure_tls(), Duration::from_secs(30)).unwrap(),
    );
    let connection = endpoint
        .connect(server.addr, "localhost")
        .unwrap()
        .await
        .unwrap();
    let (mut send, recv) = connection.open_bi().await.unwrap();

    let frame = DataFrame::with_carriage(0x10, "early").unwrap();
    send.write_all(&frame.encode()).await.unwrap();

    let mut reader = FrameReader::new(recv);
    let reply = tokio::time::timeout(WAIT, reader.read_frame())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(reply, Some(Frame::Rejected(_))));
    assert!(server.server.connections().is_empty());
}

#[tokio::test]
async fn source_data_reaches_every_function() {
    let server = TestServer::start(&["fn-a", "fn-b"], Authentication::None).await;
    let target = server.target();

    let (_a, mut rx_a) = function(&target, "fn-a", &[]).await;
    let (_b, mut rx_b) = function(&target, "fn-b", &[]).await;
    let source = Client::connect(&target, client_config("src", ClientType::Source))
        .await
        .unwrap();
    server.wait_for_peers(3).await;

    source.write_data(0x10, "hello").await.unwrap();

    assert_eq!(recv(&mut rx_a).await, (0x10, Bytes::from("hello")));
    assert_eq!(recv(&mut rx_b).await, (0x10, Bytes::from("hello")));
}

#[tokio::test]
async fn function_output_forwards_downstream_with_transaction_id() {
    let server = TestServer::start(&["upper", "sink"], Authentication::None).await;
    let target = server.target();

    let seen: Arc<Mutex<Vec<(String, u8, String)>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        server.server.set_handler(move |peer, frame| {
            seen.lock().push((
                peer.name.clone(),
                frame.tag(),
                frame.transaction_id().to_string(),
            ));
        });
    }

    let upper = Client::connect(
        &target,
        client_config("upper", ClientType::StreamFunction).with_observe_data_tags(vec![0x10]),
    )
    .await
    .unwrap();
    upper.set_handler(|_, data| Some((0x11, Bytes::from(data.to_ascii_uppercase()))));
    let (_sink, mut rx_sink) = function(&target, "sink", &[0x11]).await;
    let source = Client::connect(&target, client_config("src", ClientType::Source))
        .await
        .unwrap();
    server.wait_for_peers(3).await;

    let mut frame = DataFrame::with_carriage(0x10, "hello").unwrap();
    frame.set_transaction_id("tx-42");
    source.write_frame(&Frame::Data(frame)).await.unwrap();

    assert_eq!(recv(&mut rx_sink).await, (0x11, Bytes::from("HELLO")));
    assert_silent(&mut rx_sink).await;

    let seen = seen.lock().clone();
    assert!(seen.contains(&("src".to_string(), 0x10, "tx-42".to_string())));
    assert!(seen.contains(&("upper".to_string(), 0x11, "tx-42".to_string())));
}

#[tokio::test]
async fn unobserved_tags_are_filtered() {
    let server = TestServer::start(&["fn-a"], Authentication::None).await;
    let target = server.target();

    let (_a, mut rx_a) = function(&target, "fn-a", &[0x20]).await;
    let source = Client::connect(&target, client_config("src", ClientType::Source))
        .await
        .unwrap();
    server.wait_for_peers(2).await;

    source.write_data(0x10, "ignored").await.unwrap();
    source.write_data(0x20, "wanted").await.unwrap();

    assert_eq!(recv(&mut rx_a).await, (0x20, Bytes::from("wanted")));
    assert_silent(&mut rx_a).await;
}

#[tokio::test]
async fn last_function_output_goes_nowhere() {
    let server = TestServer::start(&["fn-a", "fn-b"], Authentication::None).await;
    let target = server.target();

    let (_a, mut rx_a) = function(&target, "fn-a", &[]).await;
    let (b, mut rx_b) = function(&target, "fn-b", &[]).await;
    server.wait_for_peers(2).await;

    b.write_data(0x12, "done").await.unwrap();

    assert_silent(&mut rx_a).await;
    assert_silent(&mut rx_b).await;
}

#[tokio::test]
async fn duplicate_name_replaces_older_connection() {
    let server = TestServer::start(&["fn-a"], Authentication::None).await;
    let target = server.target();

    let (first, _rx_first) = function(&target, "fn-a", &[]).await;
    server.wait_for_peers(1).await;
    let first_id = server.server.connections()[0].id;

    let (_second, mut rx_second) = function(&target, "fn-a", &[]).await;
    tokio::time::timeout(WAIT, first.wait_closed())
        .await
        .expect("older connection was not closed");
    assert!(!first.is_connected());

    server.wait_for_peers(1).await;
    assert_ne!(server.server.connections()[0].id, first_id);

    let source = Client::connect(&target, client_config("src", ClientType::Source))
        .await
        .unwrap();
    server.wait_for_peers(2).await;
    source.write_data(0x01, "to-new").await.unwrap();
    assert_eq!(recv(&mut rx_second).await, (0x01, Bytes::from("to-new")));
}

#[tokio::test]
async fn close_is_idempotent() {
    let server = TestServer::start(&["fn-a"], Authentication::None).await;

    let client = Client::connect(&server.target(), client_config("src", ClientType::Source))
        .await
        .unwrap();
    client.close().await.unwrap();
    client.close().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Disconnected);

    let err = client.write_data(0x01, "late").await.unwrap_err();
    assert!(matches!(err, ClientError::NotConnected));
    tokio::time::timeout(WAIT, client.wait_closed()).await.unwrap();
}

#[tokio::test]
async fn processor_forwards_to_downstream_processor() {
    let mut dev = Config::default();
    dev.tls.dev_mode = true;

    let edge_port = free_port();
    let edge_workflow = WorkflowConfig::single("edge", "127.0.0.1", edge_port, "sink");
    let edge = Arc::new(Processor::start(edge_workflow, dev.clone()).await.unwrap());
    {
        let edge = edge.clone();
        tokio::spawn(async move { edge.run().await });
    }

    let mut entry_workflow = WorkflowConfig::single("entry", "127.0.0.1", free_port(), "local-fn");
    entry_workflow.downstreams.push(DownstreamConfig {
        name: "edge".to_string(),
        host: "127.0.0.1".to_string(),
        port: edge_port,
    });
    let entry = Arc::new(Processor::start(entry_workflow, dev).await.unwrap());
    let entry_addr = entry.local_addr().unwrap().to_string();
    {
        let entry = entry.clone();
        tokio::spawn(async move { entry.run().await });
    }

    let (_sink, mut rx_sink) = function(&format!("127.0.0.1:{}", edge_port), "sink", &[]).await;
    tokio::time::timeout(WAIT, async {
        while entry.server().downstreams().is_empty() || edge.server().connections().len() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("downstream link not established");

    let upstream = edge
        .server()
        .connections()
        .into_iter()
        .find(|p| p.name == "entry")
        .unwrap();
    assert_eq!(upstream.client_type, ClientType::UpstreamProcessor);

    let source = Client::connect(&entry_addr, client_config("src", ClientType::Source))
        .await
        .unwrap();
    tokio::time::timeout(WAIT, async {
        while entry.server().connections().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    source.write_data(0x07, "relay").await.unwrap();
    assert_eq!(recv(&mut rx_sink).await, (0x07, Bytes::from("relay")));

    entry.shutdown();
    edge.shutdown();
}

#[tokio::test]
async fn close_does_not_wait_for_stalled_write() {
    let (endpoint, addr) = raw_server();
    let addr_str = addr.to_string();
    let (accepted, client) = tokio::join!(
        accept_handshake(&endpoint),
        Client::connect(&addr_str, client_config("src", ClientType::Source)),
    );
    // Keep the stream open but never read from it.
    let _held = accepted;
    let client = client.unwrap();

    let writer = {
        let client = client.clone();
        tokio::spawn(async move {
            let chunk = Bytes::from(vec![0u8; 60 * 1024]);
            let mut written = 0usize;
            while client.write_data(0x10, chunk.clone()).await.is_ok() {
                written += 1;
            }
            written
        })
    };
    tokio::time::sleep(Duration::from_millis(1500)).await;

    tokio::time::timeout(Duration::from_secs(3), client.close())
        .await
        .expect("close blocked behind a pending write")
        .unwrap();
    assert_eq!(client.state(), ConnectionState::Disconnected);

    let written = tokio::time::timeout(WAIT, writer)
        .await
        .expect("pending write was not released")
        .unwrap();
    assert!(written > 0);
}

#[tokio::test]
async fn server_loss_aborts_client() {
    let (endpoint, addr) = raw_server();
    let addr_str = addr.to_string();
    let (accepted, client) = tokio::join!(
        accept_handshake(&endpoint),
        Client::connect(&addr_str, client_config("fn-a", ClientType::StreamFunction)),
    );
    let client = client.unwrap();
    assert_eq!(client.state(), ConnectionState::Connected);

    let (connection, _send, _reader) = accepted;
    connection.close(1u32.into(), b"gone");
    endpoint.close(1u32.into(), b"gone");

    tokio::time::timeout(WAIT, client.wait_closed()).await.unwrap();
    assert_eq!(client.state(), ConnectionState::Aborted);
    let err = client.write_data(0x01, "late").await.unwrap_err();
    assert!(matches!(err, ClientError::NotConnected));

    client.close().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn client_walks_through_connection_states() {
    let server = TestServer::start(&["fn-a"], Authentication::None).await;

    let (config, seen) = recording_config("fn-a", ClientType::StreamFunction);
    let client = Client::connect(&server.target(), config).await.unwrap();
    assert_eq!(
        *seen.lock(),
        vec![
            ConnectionState::Connecting,
            ConnectionState::Authenticating,
            ConnectionState::Accepted,
            ConnectionState::Connected,
        ]
    );

    client.close().await.unwrap();
    assert_eq!(seen.lock().last(), Some(&ConnectionState::Disconnected));
}

#[tokio::test]
async fn rejected_handshake_is_recorded() {
    let auth = Authentication::AppKey {
        app_id: "app-1".to_string(),
        secret_hashes: HashSet::from([hash_secret(b"s3cret")]),
    };
    let server = TestServer::start(&["fn-a"], auth).await;

    let (config, seen) = recording_config("src", ClientType::Source);
    let config = config
        .with_app_id("app-1")
        .with_credential(Credential::AppKey("guess".to_string()));
    let err = Client::connect(&server.target(), config).await.unwrap_err();
    assert!(matches!(err, ClientError::Rejected));
    assert_eq!(
        *seen.lock(),
        vec![
            ConnectionState::Connecting,
            ConnectionState::Authenticating,
            ConnectionState::Rejected,
        ]
    );
}

#[tokio::test]
async fn server_tracks_connection_states() {
    let server = TestServer::start(&["fn-a"], Authentication::None).await;

    // A handshake that never completes keeps the connection authenticating.
    let mut endpoint = quinn::Endpoint::client("127.0.0.1:0".parse().unwrap()).unwrap();
    endpoint.set_default_client_config(
        sfn_client::tls::create_client_config(&insecure_tls(), Duration::from_secs(30)).unwrap(),
    );
    let connection = endpoint
        .connect(server.addr, "localhost")
        .unwrap()
        .await
        .unwrap();
    let (mut send, _recv) = connection.open_bi().await.unwrap();
    let handshake = HandshakeFrame::new("slow", ClientType::Source).encode();
    send.write_all(&handshake[..2]).await.unwrap();

    tokio::time::timeout(WAIT, async {
        while !server
            .server
            .connection_states()
            .iter()
            .any(|(_, state)| *state == ConnectionState::Authenticating)
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection never reached authenticating");

    let client = Client::connect(&server.target(), client_config("fn-a", ClientType::StreamFunction))
        .await
        .unwrap();
    server.wait_for_peers(1).await;
    let peer = server.server.connections().remove(0);
    assert_eq!(
        server.server.connection_state(peer.id),
        Some(ConnectionState::Connected)
    );

    client.close().await.unwrap();
    tokio::time::timeout(WAIT, async {
        while server.server.connection_state(peer.id).is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("closed connection was not forgotten");
}
