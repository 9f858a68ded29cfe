//! Prometheus metrics for the fuzzystore server.
//!
//! This module provides:
//! - Metrics registry with counters, gauges, and histograms
//! - HTTP server to expose metrics at `/metrics` endpoint

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Request duration histogram buckets (in seconds).
const DURATION_BUCKETS: &[f64] = &[0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5];

/// Prometheus metrics for the fuzzystore server.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Total TCP connections accepted.
    pub connections_total: Counter,
    /// Currently open TCP connections.
    pub connections_active: Gauge,
    /// Requests by command.
    pub requests_total: CounterVec,
    /// CHECKs by epoch.
    pub hashes_checked: CounterVec,
    /// CHECKs that matched, by epoch.
    pub hashes_found: CounterVec,
    /// CHECKs that carried shingles, by epoch.
    pub shingle_checks: CounterVec,
    /// Requests answered with a format error.
    pub invalid_requests: Counter,
    /// Requests not answered or refused, by reason.
    pub dropped_total: CounterVec,
    /// Encrypted request outcomes by key id.
    pub key_requests: CounterVec,
    /// Entries currently stored.
    pub stored_hashes: Gauge,
    /// Applied queued updates by kind.
    pub updates_applied: CounterVec,
    /// Request duration histogram by command.
    pub request_duration: HistogramVec,
}

impl Metrics {
    /// Creates a new Metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        // Connections
        let connections_total = Counter::with_opts(Opts::new(
            "fuzzystore_connections_total",
            "Total number of TCP connections accepted",
        ))?;
        registry.register(Box::new(connections_total.clone()))?;

        let connections_active = Gauge::with_opts(Opts::new(
            "fuzzystore_connections_active",
            "Number of currently open TCP connections",
        ))?;
        registry.register(Box::new(connections_active.clone()))?;

        // Requests
        let requests_total = CounterVec::new(
            Opts::new("fuzzystore_requests_total", "Total requests by command"),
            &["command"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let hashes_checked = CounterVec::new(
            Opts::new("fuzzystore_hashes_checked_total", "CHECK requests by epoch"),
            &["epoch"],
        )?;
        registry.register(Box::new(hashes_checked.clone()))?;

        let hashes_found = CounterVec::new(
            Opts::new("fuzzystore_hashes_found_total", "Matched CHECK requests by epoch"),
            &["epoch"],
        )?;
        registry.register(Box::new(hashes_found.clone()))?;

        let shingle_checks = CounterVec::new(
            Opts::new(
                "fuzzystore_shingle_checks_total",
                "CHECK requests carrying shingles by epoch",
            ),
            &["epoch"],
        )?;
        registry.register(Box::new(shingle_checks.clone()))?;

        // Failures
        let invalid_requests = Counter::with_opts(Opts::new(
            "fuzzystore_invalid_requests_total",
            "Malformed requests",
        ))?;
        registry.register(Box::new(invalid_requests.clone()))?;

        let dropped_total = CounterVec::new(
            Opts::new(
                "fuzzystore_dropped_total",
                "Requests dropped or refused by reason",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(dropped_total.clone()))?;

        let key_requests = CounterVec::new(
            Opts::new(
                "fuzzystore_key_requests_total",
                "Encrypted requests by key id and outcome",
            ),
            &["key", "outcome"],
        )?;
        registry.register(Box::new(key_requests.clone()))?;

        // Storage
        let stored_hashes = Gauge::with_opts(Opts::new(
            "fuzzystore_stored_hashes",
            "Number of stored entries",
        ))?;
        registry.register(Box::new(stored_hashes.clone()))?;

        let updates_applied = CounterVec::new(
            Opts::new(
                "fuzzystore_updates_applied_total",
                "Queued updates applied by kind",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(updates_applied.clone()))?;

        // Request duration
        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "fuzzystore_request_duration_seconds",
                "Request duration in seconds by command",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            &["command"],
        )?;
        registry.register(Box::new(request_duration.clone()))?;

        Ok(Self {
            registry,
            connections_total,
            connections_active,
            requests_total,
            hashes_checked,
            hashes_found,
            shingle_checks,
            invalid_requests,
            dropped_total,
            key_requests,
            stored_hashes,
            updates_applied,
            request_duration,
        })
    }

    /// Records the outcome of a flushed update batch.
    pub fn record_updates(&self, summary: &fuzzystore_storage::UpdateSummary) {
        for (kind, count) in [
            ("added", summary.added),
            ("deleted", summary.deleted),
            ("extended", summary.extended),
            ("ignored", summary.ignored),
        ] {
            if count > 0 {
                self.updates_applied
                    .with_label_values(&[kind])
                    .inc_by(f64::from(count));
            }
        }
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

    /// Returns a reference to the registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
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

fn text_response(
    status: StatusCode,
    content_type: &'static str,
    body: Vec<u8>,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match req.uri().path() {
        "/metrics" => text_response(
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            metrics.encode(),
        ),
        "/health" | "/healthz" => text_response(StatusCode::OK, "text/plain", b"OK".to_vec()),
        "/" => text_response(
            StatusCode::OK,
            "text/html",
            br#"<!DOCTYPE html>
<html>
<head><title>fuzzystore Metrics</title></head>
<body>
<h1>fuzzystore Metrics</h1>
<p><a href="/metrics">Metrics</a></p>
</body>
</html>"#
                .to_vec(),
        ),
        _ => text_response(StatusCode::NOT_FOUND, "text/plain", b"Not Found".to_vec()),
    };

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fuzzystore_storage::UpdateSummary;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();

        metrics.connections_total.inc();
        metrics.requests_total.with_label_values(&["CHECK"]).inc();
        metrics.hashes_checked.with_label_values(&["epoch11"]).inc();
        metrics.dropped_total.with_label_values(&["crypto"]).inc();
        metrics
            .request_duration
            .with_label_values(&["CHECK"])
            .observe(0.0002);

        let encoded = String::from_utf8(metrics.encode()).unwrap();
        assert!(encoded.contains("fuzzystore_connections_total"));
        assert!(encoded.contains("fuzzystore_requests_total"));
        assert!(encoded.contains("fuzzystore_hashes_checked_total"));
        assert!(encoded.contains("fuzzystore_dropped_total"));
        assert!(encoded.contains("fuzzystore_request_duration_seconds"));
    }

    #[test]
    fn test_record_updates() {
        let metrics = Metrics::new().unwrap();
        metrics.record_updates(&UpdateSummary {
            added: 3,
            deleted: 0,
            extended: 2,
            ignored: 1,
        });
        metrics.stored_hashes.set(42.0);

        let encoded = String::from_utf8(metrics.encode()).unwrap();
        assert!(encoded.contains("fuzzystore_updates_applied_total{kind=\"added\"} 3"));
        assert!(encoded.contains("fuzzystore_updates_applied_total{kind=\"extended\"} 2"));
        assert!(!encoded.contains("kind=\"deleted\""));
        assert!(encoded.contains("fuzzystore_stored_hashes 42"));
    }

    #[test]
    fn test_text_response() {
        let response = text_response(StatusCode::NOT_FOUND, "text/plain", b"x".to_vec());
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[CONTENT_TYPE], "text/plain");
    }
}
