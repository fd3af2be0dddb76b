//! Health probe and metrics HTTP servers.
//!
//! `/healthz` answers as long as the process serves requests. `/readyz`
//! turns ready once the pod index finished its first list and the node
//! controller is running. `/metrics` is served from a separate listener.

use crate::error::ControllerError;
use crate::metrics::Metrics;
use axum::Router;
use axum::extract::State as AxumState;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Readiness flag shared between the controller and the probe server.
#[derive(Debug, Clone, Default)]
pub struct ReadyFlag(Arc<AtomicBool>);

impl ReadyFlag {
    pub fn set_ready(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn set_not_ready(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub enum Readiness {
    Ready,
    NotReady,
}

impl IntoResponse for Readiness {
    fn into_response(self) -> Response {
        match self {
            Readiness::Ready => (StatusCode::OK, "ok").into_response(),
            Readiness::NotReady => (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response(),
        }
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(AxumState(ready): AxumState<ReadyFlag>) -> Readiness {
    if ready.is_ready() {
        Readiness::Ready
    } else {
        Readiness::NotReady
    }
}

async fn scrape(AxumState(metrics): AxumState<Metrics>) -> Response {
    match metrics.encode() {
        Ok(body) => ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub fn health_router(ready: ReadyFlag) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(ready)
}

pub fn metrics_router(metrics: Metrics) -> Router {
    Router::new()
        .route("/metrics", get(scrape))
        .with_state(metrics)
}

/// Binds `addr`. Done before the controller starts so a taken port fails
/// startup instead of a background task.
pub async fn bind(addr: SocketAddr, what: &str) -> Result<TcpListener, ControllerError> {
    let listener = TcpListener::bind(addr).await?;
    info!("{} listening on {}", what, addr);
    Ok(listener)
}

/// Serves `router` until `shutdown` flips to true.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ControllerError> {
    axum::serve(listener, router.layer(TraceLayer::new_for_http()))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;
    Ok(())
}
