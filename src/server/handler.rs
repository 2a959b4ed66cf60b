// Axum request handler. Translates `/api/{W}x{H}/{url}` requests into
// pipeline resolves.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use super::request::{ImageRequest, RequestError};
use crate::config::ProxyConfig;
use crate::engine::pipeline::Pipeline;

/// Shared by every request task.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub config: Arc<ProxyConfig>,
}

impl AppState {
    pub fn new(pipeline: Pipeline, config: ProxyConfig) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            config: Arc::new(config),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/{dims}/{*rest}", get(image_handler))
        .route("/stats", get(stats_handler))
        .with_state(state)
}

pub struct ProxyServer {
    addr: SocketAddr,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<()>,
}

impl ProxyServer {
    /// Bind `addr` and serve in a background task.
    pub async fn start(addr: SocketAddr, state: AppState) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let app = router(state);

        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
            {
                error!("server error: {}", e);
            }
        });

        info!("listening on {}", addr);
        Ok(Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
            task,
        })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Build the proxy URL for `rest` (`host/path`) at `width`x`height`.
    pub fn url_for(&self, width: u32, height: u32, rest: &str) -> String {
        format!("http://{}/api/{}x{}/{}", self.addr, width, height, rest)
    }

    /// Stop accepting connections and wait for in-flight requests to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.task.await;
    }
}

/// GET /api/{W}x{H}/{host}/{path}
async fn image_handler(
    State(state): State<AppState>,
    Path((dims, rest)): Path<(String, String)>,
) -> Response {
    info!("request /api/{}/{}", dims, rest);

    let request = match ImageRequest::parse(&dims, &rest, &state.config) {
        Ok(r) => r,
        Err(e) => {
            debug!("rejected /api/{}/{}: {}", dims, rest, e);
            return (status_for(&e), e.to_string()).into_response();
        }
    };

    match state.pipeline.resolve(&request.url, request.dims).await {
        Ok(bytes) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, state.config.upscaler.content_type())],
            bytes,
        )
            .into_response(),
        Err(e) => {
            // Details stay in the log; every pipeline failure looks the same to clients.
            warn!("serving {} at {} failed: {}", request.url, request.dims, e);
            (StatusCode::NOT_FOUND, "Error getting image").into_response()
        }
    }
}

/// GET /stats
async fn stats_handler(State(state): State<AppState>) -> Response {
    Json(state.pipeline.stats()).into_response()
}

fn status_for(err: &RequestError) -> StatusCode {
    match err {
        RequestError::Host => StatusCode::BAD_REQUEST,
        RequestError::Dimensions | RequestError::Url | RequestError::Extension => {
            StatusCode::NOT_FOUND
        }
    }
}
