//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "HTTP scrape endpoint for the metrics registry."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{TextEncoder, TEXT_FORMAT};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::SharedRegistry;

/// Bind `addr` and serve the registry at `/metrics` until [`MetricsServer::shutdown`].
///
/// Port `0` binds an ephemeral port; [`MetricsServer::addr`] reports the real one.
pub async fn serve_metrics(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get(move || render(registry.clone())),
    );

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    let bound = listener
        .local_addr()
        .context("metrics listener has no local address")?;
    info!(address = %bound, "metrics exporter listening");

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics exporter stopped with an error")
    });

    Ok(MetricsServer {
        addr: bound,
        shutdown: Some(shutdown_tx),
        task,
    })
}

async fn render(registry: SharedRegistry) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&registry.gather()) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(TEXT_FORMAT),
            )],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error").into_response()
        }
    }
}

/// Running exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting scrapes and wait for the server task.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.task.await.context("metrics exporter task panicked")?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{new_registry, RunMetrics};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn scrape_returns_registered_families() {
        let registry = new_registry();
        let metrics = RunMetrics::new(registry.clone()).unwrap();
        metrics.record_tick();

        let server = serve_metrics(registry, "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let mut stream = TcpStream::connect(server.addr()).await.unwrap();
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response
            .to_ascii_lowercase()
            .contains("content-type: text/plain; version=0.0.4"));
        assert!(response.contains("paraload_ticks_total 1"));
        server.shutdown().await.unwrap();
    }
}
