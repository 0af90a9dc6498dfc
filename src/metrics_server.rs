//! HTTP exposition of the counter registry.
//!
//! The server runs on its own small tokio runtime so scrapes never wait on the
//! perf buffer loop, which stays on a plain thread.

use std::io;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use log::{info, warn};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::runtime::Runtime;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub const METRICS_PATH: &str = "/metrics";
const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// `GET /metrics` rendering the registry; nothing else is routed.
pub fn router(handle: PrometheusHandle) -> Router {
    Router::new()
        .route(METRICS_PATH, get(render_metrics))
        .with_state(handle)
}

async fn render_metrics(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)], handle.render())
}

pub struct MetricsServer {
    runtime: Runtime,
    local_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<io::Result<()>>,
}

impl MetricsServer {
    /// Bind `addr` and start serving in the background.
    pub fn start(addr: SocketAddr, handle: PrometheusHandle) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("metrics_server")
            .enable_all()
            .build()
            .context("Failed to create metrics server runtime")?;

        let listener = runtime
            .block_on(TcpListener::bind(addr))
            .with_context(|| format!("Failed to bind metrics listener to {addr}"))?;
        let local_addr = listener
            .local_addr()
            .context("Failed to get metrics listener address")?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let app = router(handle);
        let task = runtime.spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        info!("Prometheus metrics available at http://{local_addr}{METRICS_PATH}");
        Ok(Self {
            runtime,
            local_addr,
            shutdown_tx,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting scrapes and wait for in-flight ones to finish.
    pub fn shutdown(self) -> Result<()> {
        let MetricsServer {
            runtime,
            shutdown_tx,
            task,
            ..
        } = self;

        let _ = shutdown_tx.send(());
        match runtime.block_on(task) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                warn!("Metrics server exited with error: {e}");
                Ok(())
            }
            Err(e) => Err(e).context("Metrics server task panicked"),
        }
    }
}
