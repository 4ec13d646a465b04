//! The simulated agent fleet: one gRPC server per member, all writing into
//! the same store and registry.

pub mod service;
pub mod session;

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::{error, info, warn};

use crate::proto::resource_usage_agent::resource_usage_agent_server::ResourceUsageAgentServer;
use crate::proto::tipb::top_sql_agent_server::TopSqlAgentServer;

pub use service::{TiDbCollector, TiKvCollector};
pub use session::{Ingestor, Protocol, Session, SessionStats, StreamKind};

/// Running fleet members.
pub struct Fleet {
    addrs: Vec<SocketAddr>,
    tasks: JoinSet<()>,
    cancel: CancellationToken,
}

impl Fleet {
    /// Binds every member address before anything is served. The first
    /// address that cannot be bound fails the whole fleet.
    pub async fn bind(addrs: &[SocketAddr]) -> Result<Vec<TcpListener>> {
        let mut listeners = Vec::with_capacity(addrs.len());

        for (index, addr) in addrs.iter().enumerate() {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("gRPC service {index} failed to listen on {addr}"))?;

            info!(service = index, address = %addr, "gRPC service listening");
            listeners.push(listener);
        }

        Ok(listeners)
    }

    /// Serves both agent services on each listener until `cancel` fires.
    ///
    /// Instance ids derive from each listener's local port, so ephemeral
    /// listeners work.
    pub fn spawn(
        listeners: Vec<TcpListener>,
        ingestor: Ingestor,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let mut tasks = JoinSet::new();
        let mut addrs = Vec::with_capacity(listeners.len());

        for listener in listeners {
            let addr = listener
                .local_addr()
                .context("reading gRPC listener address")?;
            let port = addr.port();

            let router = Server::builder()
                .add_service(TopSqlAgentServer::new(TiDbCollector::new(
                    ingestor.clone(),
                    port,
                )))
                .add_service(ResourceUsageAgentServer::new(TiKvCollector::new(
                    ingestor.clone(),
                    port,
                )));

            let shutdown = cancel.clone();
            tasks.spawn(async move {
                let incoming = TcpListenerStream::new(listener);
                if let Err(e) = router
                    .serve_with_incoming_shutdown(incoming, shutdown.cancelled_owned())
                    .await
                {
                    error!(port, error = %e, "gRPC service error");
                }
            });

            addrs.push(addr);
        }

        info!(members = addrs.len(), "fleet started");

        Ok(Self {
            addrs,
            tasks,
            cancel,
        })
    }

    /// Bound address of every member, in start order.
    pub fn addrs(&self) -> &[SocketAddr] {
        &self.addrs
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    /// Stops accepting, waits up to `timeout` for open streams, then
    /// aborts whatever is left.
    pub async fn shutdown(mut self, timeout: Duration) {
        self.cancel.cancel();

        let tasks = &mut self.tasks;
        let drained = tokio::time::timeout(timeout, async {
            while let Some(res) = tasks.join_next().await {
                if let Err(e) = res {
                    if e.is_panic() {
                        error!(error = %e, "gRPC service panicked");
                    }
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = self.tasks.len(),
                "gRPC services did not stop in time, aborting"
            );
            self.tasks.shutdown().await;
        }

        info!("fleet stopped");
    }
}
