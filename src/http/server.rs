//! HTTP server implementation.

use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::{FloodgateError, Result};

use super::handlers;
use super::state::AppState;

/// HTTP server for the admission control API.
pub struct HttpServer {
    listener: TcpListener,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Bind the listener. Passing port 0 binds an ephemeral port, which
    /// `local_addr` then reports.
    pub async fn bind(addr: SocketAddr, state: Arc<AppState>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, state })
    }

    /// Address the server is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let addr = self.listener.local_addr()?;
        info!(addr = %addr, "Starting HTTP server with graceful shutdown");

        axum::serve(
            self.listener,
            router(self.state).into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            FloodgateError::Io(e)
        })
    }
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(handlers::index))
        .route("/home", get(handlers::home))
        .route("/monitor", get(handlers::monitor))
        .route("/monitor-urls", get(handlers::monitor_urls))
        .route("/monitor-custom", get(handlers::monitor_custom))
        .route("/test-url", post(handlers::test_url))
        .route("/test-custom", post(handlers::test_custom))
        .route("/analytics", get(handlers::analytics))
        .route("/health", get(handlers::health))
        .route("/clear-data", post(handlers::clear_data))
        .with_state(state)
}
