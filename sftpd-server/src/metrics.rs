//! Prometheus metrics for the sftpd server.
//!
//! This module provides:
//! - Metrics registry with counters and gauges for each dispatch level
//! - HTTP server to expose metrics at `/metrics` endpoint

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Counter, CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Prometheus metrics for the sftpd server.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Total connections accepted.
    pub connections_total: Counter,
    /// Currently active connections.
    pub connections_active: Gauge,
    /// Connections dropped because of the connection limit.
    pub connections_rejected_total: Counter,
    /// Connections that failed before the SSH session was established.
    pub handshake_failures_total: Counter,
    /// Established sessions that ended with an error.
    pub session_errors_total: Counter,
    /// Password attempts by result.
    pub auth_attempts_total: CounterVec,
    /// Channel offers by outcome.
    pub channels_total: CounterVec,
    /// In-band requests by request type and reply.
    pub requests_total: CounterVec,
    /// Currently running subsystem engines.
    pub engines_active: Gauge,
    /// Subsystem engine terminations by reason.
    pub engine_terminations_total: CounterVec,
}

impl Metrics {
    /// Creates a new Metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let connections_total = Counter::with_opts(Opts::new(
            "sftpd_connections_total",
            "Total number of connections accepted",
        ))?;
        registry.register(Box::new(connections_total.clone()))?;

        let connections_active = Gauge::with_opts(Opts::new(
            "sftpd_connections_active",
            "Number of currently active connections",
        ))?;
        registry.register(Box::new(connections_active.clone()))?;

        let connections_rejected_total = Counter::with_opts(Opts::new(
            "sftpd_connections_rejected_total",
            "Connections dropped at the connection limit",
        ))?;
        registry.register(Box::new(connections_rejected_total.clone()))?;

        let handshake_failures_total = Counter::with_opts(Opts::new(
            "sftpd_handshake_failures_total",
            "Connections abandoned before the SSH session was established",
        ))?;
        registry.register(Box::new(handshake_failures_total.clone()))?;

        let session_errors_total = Counter::with_opts(Opts::new(
            "sftpd_session_errors_total",
            "Established SSH sessions that ended with an error",
        ))?;
        registry.register(Box::new(session_errors_total.clone()))?;

        let auth_attempts_total = CounterVec::new(
            Opts::new("sftpd_auth_attempts_total", "Password attempts by result"),
            &["result"],
        )?;
        registry.register(Box::new(auth_attempts_total.clone()))?;

        let channels_total = CounterVec::new(
            Opts::new("sftpd_channels_total", "Channel offers by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(channels_total.clone()))?;

        let requests_total = CounterVec::new(
            Opts::new(
                "sftpd_channel_requests_total",
                "In-band channel requests by type and reply",
            ),
            &["request", "reply"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let engines_active = Gauge::with_opts(Opts::new(
            "sftpd_engines_active",
            "Number of running subsystem engines",
        ))?;
        registry.register(Box::new(engines_active.clone()))?;

        let engine_terminations_total = CounterVec::new(
            Opts::new(
                "sftpd_engine_terminations_total",
                "Subsystem engine terminations by reason",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(engine_terminations_total.clone()))?;

        Ok(Self {
            registry,
            connections_total,
            connections_active,
            connections_rejected_total,
            handshake_failures_total,
            session_errors_total,
            auth_attempts_total,
            channels_total,
            requests_total,
            engines_active,
            engine_terminations_total,
        })
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
        }
        buffer
    }
}

/// Runs the HTTP metrics server.
///
/// The server listens on the given address and serves metrics at `/metrics`.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let metrics = metrics.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                async move { handle_request(req, metrics).await }
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                tracing::debug!("Metrics connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Metrics server accept error: {}", e);
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Metrics server shutting down");
                break;
            }
        }
    }

    Ok(())
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
) -> Result<Response<Full<Bytes>>, hyper::http::Error> {
    match req.uri().path() {
        "/metrics" => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
            .body(Full::new(Bytes::from(metrics.encode()))),
        "/health" | "/healthz" => Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::from("OK"))),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("Not Found"))),
    }
}
