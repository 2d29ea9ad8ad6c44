//! Processor: one server, the workflow router and downstream connections.

use crate::auth::Authentication;
use crate::config::Config;
use crate::error::ServerError;
use crate::metrics::{run_metrics_server, Metrics};
use crate::server::{Server, ServerConfig};
use sfn_client::{Client, ClientConfig, Credential, TlsClientConfig};
use sfn_core::{Router, WorkflowConfig};
use sfn_protocol::ClientType;
use std::net::SocketAddr;
use std::sync::Arc;

/// A running workflow processor.
pub struct Processor {
    workflow: WorkflowConfig,
    config: Config,
    server: Arc<Server>,
    metrics: Option<Arc<Metrics>>,
}

impl Processor {
    /// Validates the workflow and binds the server on its listen address.
    pub async fn start(workflow: WorkflowConfig, config: Config) -> Result<Self, ServerError> {
        workflow.validate()?;
        config.validate()?;

        let listen = workflow.listen_addr();
        let bind_addr = tokio::net::lookup_host(&listen)
            .await?
            .next()
            .ok_or_else(|| {
                ServerError::Io(std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    format!("cannot resolve {}", listen),
                ))
            })?;

        let metrics = if config.metrics.enabled {
            Some(Arc::new(Metrics::new()?))
        } else {
            None
        };

        let mut server_config = ServerConfig::from_config(bind_addr, &config)?;
        if let Some(ref metrics) = metrics {
            server_config = server_config.with_metrics(metrics.clone());
        }

        let auth = Authentication::from_config(&config.auth)?;
        let router = Arc::new(Router::new(workflow.clone()));
        let server = Arc::new(Server::bind(server_config, router, auth)?);

        tracing::info!(
            "Processor '{}' bound to {} ({} function(s), {} downstream(s))",
            workflow.name,
            server.local_addr()?,
            workflow.functions.len(),
            workflow.downstreams.len()
        );

        Ok(Self {
            workflow,
            config,
            server,
            metrics,
        })
    }

    /// Connects downstreams, then serves until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let metrics_handle = self.metrics.as_ref().map(|metrics| {
            let addr = self.config.metrics.bind_addr;
            let metrics = metrics.clone();
            let shutdown = self.server.subscribe_shutdown();
            tokio::spawn(async move {
                if let Err(e) = run_metrics_server(addr, metrics, shutdown).await {
                    tracing::error!("Metrics server error: {}", e);
                }
            })
        });

        self.connect_downstreams().await?;

        let result = self.server.run().await;

        for client in self.server.downstreams() {
            if let Err(e) = client.close().await {
                tracing::debug!("Closing downstream {}: {}", client.remote_addr(), e);
            }
        }
        if let Some(handle) = metrics_handle {
            let _ = handle.await;
        }

        result
    }

    /// Dials every configured downstream processor.
    ///
    /// An unreachable downstream is logged and skipped.
    async fn connect_downstreams(&self) -> Result<(), ServerError> {
        if self.workflow.downstreams.is_empty() {
            return Ok(());
        }

        let credential = match self.config.auth.downstream_credential {
            Some(ref s) => s.parse::<Credential>()?,
            None => Credential::None,
        };
        let mut tls = TlsClientConfig::new();
        if let Some(ref ca) = self.config.tls.ca_path {
            tls = tls.with_ca_cert(ca);
        } else if self.config.tls.dev_mode {
            tls = tls.with_insecure();
        }

        for downstream in &self.workflow.downstreams {
            let client_config = ClientConfig::new(&self.workflow.name, ClientType::UpstreamProcessor)
                .with_app_id(&self.config.auth.app_id)
                .with_credential(credential.clone())
                .with_tls(tls.clone())
                .with_handshake_timeout(self.config.network.handshake_timeout())
                .with_idle_timeout(self.config.network.idle_timeout());

            match Client::connect(&downstream.addr(), client_config).await {
                Ok(client) => {
                    tracing::info!(
                        "Connected to downstream '{}' at {}",
                        downstream.name,
                        downstream.addr()
                    );
                    self.server.add_downstream(client);
                }
                Err(e) => {
                    tracing::error!(
                        "Failed to connect to downstream '{}' at {}: {}",
                        downstream.name,
                        downstream.addr(),
                        e
                    );
                }
            }
        }
        Ok(())
    }

    /// Stops the server and the metrics endpoint.
    pub fn shutdown(&self) {
        self.server.shutdown();
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.server.local_addr()
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    pub fn workflow(&self) -> &WorkflowConfig {
        &self.workflow
    }
}
