//! `GET /health` over axum.

use super::{HealthReport, HealthService};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::info;

async fn health_handler(State(service): State<HealthService>) -> (StatusCode, Json<HealthReport>) {
    let report = service.check().await;
    let status = if report.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

/// Builds the health router.
pub fn router(service: HealthService) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .with_state(service)
}

/// A bound health endpoint.
#[derive(Debug)]
pub struct HealthServer {
    listener: TcpListener,
    service: HealthService,
}

impl HealthServer {
    /// Binds the listener.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn bind(addr: &str, service: HealthService) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, service })
    }

    /// The bound address.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket has no local address.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves until `shutdown` resolves.
    ///
    /// # Errors
    ///
    /// Returns an error if the server fails.
    pub async fn run<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Ok(addr) = self.listener.local_addr() {
            info!(%addr, "Health endpoint listening");
        }
        axum::serve(self.listener, router(self.service))
            .with_graceful_shutdown(shutdown)
            .await
    }
}
