//! HTTP gateway: status, listing, streaming file reads and shutdown.

use axum::Router;
use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;

use crate::{
    engine::EngineHandle,
    fs::VirtualDirectory,
    pieces::PriorityScheduler,
    session::ShutdownTrigger,
};

mod cors;
mod error;
mod handlers;
mod range;
mod router;

#[cfg(test)]
mod tests;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug)]
pub enum ApiError {
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    Serve(std::io::Error),
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bind { addr, .. } => write!(f, "failed to bind http listener on {addr}"),
            Self::Serve(_) => write!(f, "http server failed"),
        }
    }
}

impl std::error::Error for ApiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Bind { source, .. } => Some(source),
            Self::Serve(source) => Some(source),
        }
    }
}

/// Everything the gateway needs from the rest of the process.
pub struct ApiServeDeps {
    pub engine: EngineHandle,
    pub directory: VirtualDirectory,
    pub scheduler: Arc<PriorityScheduler>,
    pub shutdown: ShutdownTrigger,
    /// Upper bound on a status round-trip through the engine worker.
    pub status_timeout: Duration,
    /// How long a file request waits for metadata before answering 503.
    pub metadata_wait: Duration,
}

#[derive(Clone)]
pub struct ApiState {
    pub(crate) engine: EngineHandle,
    pub(crate) directory: VirtualDirectory,
    pub(crate) scheduler: Arc<PriorityScheduler>,
    pub(crate) shutdown: ShutdownTrigger,
    pub(crate) status_timeout: Duration,
    pub(crate) metadata_wait: Duration,
}

impl From<ApiServeDeps> for ApiState {
    fn from(deps: ApiServeDeps) -> Self {
        Self {
            engine: deps.engine,
            directory: deps.directory,
            scheduler: deps.scheduler,
            shutdown: deps.shutdown,
            status_timeout: deps.status_timeout,
            metadata_wait: deps.metadata_wait,
        }
    }
}

pub fn build_app(deps: ApiServeDeps) -> Router {
    router::build_app(ApiState::from(deps))
}

pub async fn bind(addr: SocketAddr) -> ApiResult<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ApiError::Bind { addr, source })
}

/// Serves until `stop` resolves, then stops accepting and lets in-flight responses finish.
pub async fn serve(
    listener: TcpListener,
    deps: ApiServeDeps,
    stop: impl Future<Output = ()> + Send + 'static,
) -> ApiResult<()> {
    let app = build_app(deps);
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(addr = %addr, "http gateway listening");
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(stop)
        .await
        .map_err(ApiError::Serve)
}
