//! Read-side HTTP API over the store, the digest registry and the health
//! metrics.

pub mod health;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::{Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::config::ApiConfig;
use crate::model::{DigestKind, DigestRegistry, TimeSeries, TimeSeriesData};
use health::HealthMetrics;

/// Handles shared by every request.
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<TimeSeriesData>,
    pub registry: Arc<DigestRegistry>,
    pub health: Arc<HealthMetrics>,
}

/// Builds the API router.
pub fn router(state: ApiState, allow_all_origins: bool) -> Router {
    let app = Router::new()
        .route("/series/all", get(instances_handler))
        .route("/series/by_instance/:instance", get(series_handler))
        .route("/digests/sql", get(sql_digests_handler))
        .route("/digests/plan", get(plan_digests_handler))
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(Arc::new(state));

    if allow_all_origins {
        app.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET])
                .allow_headers(Any),
        )
    } else {
        app
    }
}

/// Serves [`router`] until stopped.
pub struct ApiServer {
    cfg: ApiConfig,
    state: ApiState,
    shutdown: Mutex<Option<CancellationToken>>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, state: ApiState) -> Self {
        Self {
            cfg,
            state,
            shutdown: Mutex::new(None),
        }
    }

    /// Binds the listen address without serving yet.
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = self.cfg.addr()?;
        TcpListener::bind(addr)
            .await
            .with_context(|| format!("listening on {addr}"))
    }

    /// Serves on `listener` in the background. Returns the bound address.
    pub fn serve(&self, listener: TcpListener) -> Result<SocketAddr> {
        let local_addr = listener.local_addr().context("getting local address")?;

        let app = router(self.state.clone(), self.cfg.allow_all_origins);

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "API server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "API server error");
            }
        });

        Ok(local_addr)
    }

    /// Binds and serves. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let listener = self.bind().await?;
        self.serve(listener)
    }

    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }
}

/// GET /series/all - Sorted instance ids.
async fn instances_handler(State(state): State<Arc<ApiState>>) -> Json<Vec<String>> {
    Json(state.store.instances())
}

/// GET /series/by_instance/:instance - Every series of one instance.
async fn series_handler(
    State(state): State<Arc<ApiState>>,
    Path(instance): Path<String>,
) -> Json<Vec<TimeSeries>> {
    Json(state.store.series_for_instance(&instance))
}

async fn sql_digests_handler(
    State(state): State<Arc<ApiState>>,
) -> Json<BTreeMap<String, String>> {
    Json(state.registry.snapshot(DigestKind::Sql))
}

async fn plan_digests_handler(
    State(state): State<Arc<ApiState>>,
) -> Json<BTreeMap<String, String>> {
    Json(state.registry.snapshot(DigestKind::Plan))
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    match state.health.encode() {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request};
    use tower::ServiceExt;

    fn state() -> ApiState {
        ApiState {
            store: Arc::new(TimeSeriesData::new()),
            registry: Arc::new(DigestRegistry::new()),
            health: Arc::new(HealthMetrics::new().unwrap()),
        }
    }

    async fn get_json(app: Router, uri: &str) -> serde_json::Value {
        let resp = app
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_instances_sorted() {
        let state = state();
        state.store.ingest("tikv-2", "aa", "", &[1], &[1]).unwrap();
        state.store.ingest("tidb-1", "aa", "", &[1], &[1]).unwrap();
        state.store.ingest("tidb-1", "bb", "", &[1], &[1]).unwrap();

        let body = get_json(router(state, true), "/series/all").await;
        assert_eq!(body, serde_json::json!(["tidb-1", "tikv-2"]));
    }

    #[tokio::test]
    async fn test_series_by_instance_shape() {
        let state = state();
        state
            .store
            .ingest("tidb-0", "ab12", "", &[100, 101], &[5, 10])
            .unwrap();
        state.store.ingest("tidb-9", "ab12", "", &[1], &[1]).unwrap();

        let body = get_json(router(state, true), "/series/by_instance/tidb-0").await;
        assert_eq!(
            body,
            serde_json::json!([{
                "Instance": "tidb-0",
                "SQLDigest": "ab12",
                "PlanDigest": "",
                "UnorderedValues": [
                    {"Timestamp": 100, "CPUInMS": 5},
                    {"Timestamp": 101, "CPUInMS": 10},
                ],
            }])
        );
    }

    #[tokio::test]
    async fn test_series_for_unknown_instance_is_empty() {
        let body = get_json(router(state(), true), "/series/by_instance/nope").await;
        assert_eq!(body, serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_digest_maps() {
        let state = state();
        state.registry.link(DigestKind::Sql, "ab12", "SELECT 1");
        state.registry.link(DigestKind::Plan, "cd34", "Point_Get");

        let sql = get_json(router(state.clone(), true), "/digests/sql").await;
        assert_eq!(sql, serde_json::json!({"ab12": "SELECT 1"}));

        let plan = get_json(router(state, true), "/digests/plan").await;
        assert_eq!(plan, serde_json::json!({"cd34": "Point_Get"}));
    }

    #[tokio::test]
    async fn test_metrics_and_healthz() {
        let state = state();
        state.health.samples_ingested.inc_by(2.0);
        let app = router(state, false);

        let resp = app
            .clone()
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("topsql_mock_samples_ingested_total 2"));

        let resp = app
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_cors_allows_any_origin() {
        let resp = router(state(), true)
            .oneshot(
                Request::get("/series/all")
                    .header(header::ORIGIN, "http://localhost:3000")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(
            resp.headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .and_then(|v| v.to_str().ok()),
            Some("*")
        );
    }

    #[tokio::test]
    async fn test_cors_disabled() {
        let resp = router(state(), false)
            .oneshot(
                Request::get("/series/all")
                    .header(header::ORIGIN, "http://localhost:3000")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert!(resp
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .is_none());
    }

    #[tokio::test]
    async fn test_server_start_and_stop() {
        let server = ApiServer::new(
            ApiConfig {
                listen: "127.0.0.1:0".to_string(),
                allow_all_origins: true,
            },
            state(),
        );

        let addr = server.start().await.unwrap();
        assert_ne!(addr.port(), 0);

        let resp = tokio::net::TcpStream::connect(addr).await;
        assert!(resp.is_ok());
        server.stop();
    }

    #[tokio::test]
    async fn test_bind_occupied_port_fails() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let server = ApiServer::new(
            ApiConfig {
                listen: taken.local_addr().unwrap().to_string(),
                allow_all_origins: true,
            },
            state(),
        );

        let err = server.bind().await.unwrap_err();
        assert!(err.to_string().starts_with("listening on"));
    }
}
