use anyhow::{Context, Result};
use axum::{Json, Router, extract::State, routing::get};
use axum_server::{Handle, tls_rustls::RustlsConfig};
use log::info;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::protocol::config::ServerTlsConfig;
use crate::servermetric::{HealthMeta, MetricSink};

const TLS_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

pub fn router(metric: Arc<dyn MetricSink>) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(metric)
}

async fn health(State(metric): State<Arc<dyn MetricSink>>) -> Json<HealthMeta> {
    Json(metric.health())
}

/// Serves the health query on `addr` until `token` is cancelled, over https
/// when `tls` is given.
pub async fn run_metric(
    addr: SocketAddr,
    metric: Arc<dyn MetricSink>,
    tls: Option<ServerTlsConfig>,
    token: CancellationToken,
) -> Result<()> {
    let app = router(metric);
    match tls {
        None => {
            let listener = TcpListener::bind(addr).await?;
            info!("run metric: listening on {}", listener.local_addr()?);
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await?;
        }
        Some(tls) => {
            let config = RustlsConfig::from_pem_file(&tls.cert_file, &tls.key_file)
                .await
                .with_context(|| {
                    format!("load metric tls from {} and {}", tls.cert_file, tls.key_file)
                })?;
            let handle = Handle::new();
            let shutdown = handle.clone();
            tokio::spawn(async move {
                token.cancelled().await;
                shutdown.graceful_shutdown(Some(TLS_SHUTDOWN_GRACE));
            });
            info!("run metric: listening with tls on {addr}");
            axum_server::bind_rustls(addr, config)
                .handle(handle)
                .serve(app.into_make_service())
                .await?;
        }
    }

    info!("metric server exited");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::servermetric::{Role, ServerMetric};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_health_endpoint() {
        let metric = Arc::new(ServerMetric::new());
        metric.set_role(Role::Master);
        metric.set_cluster_status(true, "master run ok");
        metric.set_dc_status(true);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let token = CancellationToken::new();
        let shutdown = token.clone();
        let server = tokio::spawn(async move {
            axum::serve(listener, router(metric))
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
        });

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut buf = String::new();
        stream.read_to_string(&mut buf).await.unwrap();

        assert!(buf.starts_with("HTTP/1.1 200"), "unexpected response: {buf}");
        assert!(buf.contains(r#""current_role":"master""#));
        assert!(buf.contains(r#""is_healthy":true"#));

        token.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_plain_metric_stops_on_cancel() {
        let token = CancellationToken::new();
        token.cancel();
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        run_metric(addr, Arc::new(ServerMetric::new()), None, token)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_tls_metric_rejects_missing_cert() {
        let tls = ServerTlsConfig {
            cert_file: "/nonexistent/watch.pem".to_string(),
            key_file: "/nonexistent/watch-key.pem".to_string(),
        };
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let err = run_metric(
            addr,
            Arc::new(ServerMetric::new()),
            Some(tls),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("load metric tls"), "{err}");
    }
}
