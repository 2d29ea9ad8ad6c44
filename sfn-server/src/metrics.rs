//! Prometheus metrics for the processor.
//!
//! This module provides:
//! - Metrics registry with connection, handshake and frame counters
//! - HTTP server to expose metrics at `/metrics` and liveness at `/health`

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Counter, CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Prometheus metrics for one processor.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Total connections accepted.
    pub connections_total: Counter,
    /// Currently registered peers.
    pub connections_active: Gauge,
    /// Handshakes by outcome (`accepted`, `rejected`, `timeout`, `invalid`).
    pub handshakes_total: CounterVec,
    /// Frames received by frame type.
    pub frames_received_total: CounterVec,
    /// Data frames written to peers, by target role.
    pub frames_forwarded_total: CounterVec,
    /// Frames dropped by reason.
    pub frames_dropped_total: CounterVec,
}

impl Metrics {
    /// Creates a new Metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let connections_total = Counter::with_opts(Opts::new(
            "sfn_connections_total",
            "Total number of connections accepted",
        ))?;
        registry.register(Box::new(connections_total.clone()))?;

        let connections_active = Gauge::with_opts(Opts::new(
            "sfn_connections_active",
            "Number of currently registered peers",
        ))?;
        registry.register(Box::new(connections_active.clone()))?;

        let handshakes_total = CounterVec::new(
            Opts::new("sfn_handshakes_total", "Handshakes by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(handshakes_total.clone()))?;

        let frames_received_total = CounterVec::new(
            Opts::new("sfn_frames_received_total", "Frames received by type"),
            &["type"],
        )?;
        registry.register(Box::new(frames_received_total.clone()))?;

        let frames_forwarded_total = CounterVec::new(
            Opts::new(
                "sfn_frames_forwarded_total",
                "Data frames forwarded by target role",
            ),
            &["target"],
        )?;
        registry.register(Box::new(frames_forwarded_total.clone()))?;

        let frames_dropped_total = CounterVec::new(
            Opts::new("sfn_frames_dropped_total", "Frames dropped by reason"),
            &["reason"],
        )?;
        registry.register(Box::new(frames_dropped_total.clone()))?;

        Ok(Self {
            registry,
            connections_total,
            connections_active,
            handshakes_total,
            frames_received_total,
            frames_forwarded_total,
            frames_dropped_total,
        })
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::error!("Failed to encode metrics: {}", e);
        }
        buffer
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Runs the HTTP metrics server.
///
/// The server listens on the given address and serves metrics at `/metrics`.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let metrics = metrics.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                async move { handle_request(req, metrics).await }
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                tracing::debug!("Metrics connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Metrics server accept error: {}", e);
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Metrics server shutting down");
                break;
            }
        }
    }

    Ok(())
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let (status, content_type, body) = match req.uri().path() {
        "/metrics" => (
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            Bytes::from(metrics.encode()),
        ),
        "/health" | "/healthz" => (StatusCode::OK, "text/plain", Bytes::from("OK")),
        _ => (StatusCode::NOT_FOUND, "text/plain", Bytes::from("Not Found")),
    };

    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    if let Ok(value) = content_type.parse() {
        response
            .headers_mut()
            .insert(hyper::header::CONTENT_TYPE, value);
    }
    Ok(response)
}
