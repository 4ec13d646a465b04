use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::export::{ApiServer, ApiState};
use crate::fleet::{Fleet, Ingestor};
use crate::model::{DigestRegistry, TimeSeriesData};

/// Agent owns the shared store and registry and runs the fleet and the API
/// on top of them.
pub struct Agent {
    cfg: Config,
    store: Arc<TimeSeriesData>,
    registry: Arc<DigestRegistry>,
    health: Arc<HealthMetrics>,
    api: ApiServer,
    fleet: Option<Fleet>,
    api_addr: Option<SocketAddr>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent with an empty store and registry.
    pub fn new(cfg: Config) -> Result<Self> {
        let store = Arc::new(TimeSeriesData::new());
        let registry = Arc::new(DigestRegistry::new());
        let health = Arc::new(HealthMetrics::new().context("creating health metrics")?);

        let api = ApiServer::new(
            cfg.api.clone(),
            ApiState {
                store: Arc::clone(&store),
                registry: Arc::clone(&registry),
                health: Arc::clone(&health),
            },
        );

        Ok(Self {
            cfg,
            store,
            registry,
            health,
            api,
            fleet: None,
            api_addr: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Binds every fleet member and the API before serving any of them, so
    /// a bind failure leaves nothing listening.
    pub async fn start(&mut self) -> Result<()> {
        let addrs = self.cfg.grpc.member_addrs()?;

        info!(count = addrs.len(), "starting gRPC services");
        let listeners = Fleet::bind(&addrs).await?;
        let api_listener = self.api.bind().await.context("starting API server")?;

        let ingestor = Ingestor::new(
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            Arc::clone(&self.health),
        );
        self.fleet = Some(Fleet::spawn(listeners, ingestor, self.cancel.child_token())?);

        let api_addr = self.api.serve(api_listener).context("starting API server")?;
        self.api_addr = Some(api_addr);

        info!(api = %api_addr, "agent started");

        Ok(())
    }

    /// Stops the API and the fleet, waiting up to the configured shutdown
    /// timeout for open streams.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();
        self.api.stop();

        if let Some(fleet) = self.fleet.take() {
            fleet.shutdown(self.cfg.shutdown_timeout).await;
        }

        Ok(())
    }

    pub fn store(&self) -> &Arc<TimeSeriesData> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<DigestRegistry> {
        &self.registry
    }

    /// Fleet member addresses, empty before start.
    pub fn member_addrs(&self) -> &[SocketAddr] {
        self.fleet.as_ref().map(Fleet::addrs).unwrap_or(&[])
    }

    /// API address, once started.
    pub fn api_addr(&self) -> Option<SocketAddr> {
        self.api_addr
    }
}
