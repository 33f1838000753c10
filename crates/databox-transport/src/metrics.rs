//! Prometheus metrics for DataBox hosts
//!
//! Metrics are exposed in Prometheus text format via HTTP.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{error, info};

/// DataBox metrics collector
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    // Socket metrics
    pub sockets_total: IntCounter,
    pub sockets_active: IntGauge,

    // Connect metrics
    pub connects_total: IntCounter,
    pub connect_errors: IntCounterVec,

    // Delivery metrics
    pub frames_received: IntCounter,
    pub events_sent: IntCounterVec,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let sockets_total = IntCounter::new("databox_sockets_total", "Total number of sockets accepted")?;
        let sockets_active = IntGauge::new("databox_sockets_active", "Number of connected sockets")?;

        let connects_total = IntCounter::new(
            "databox_connects_total",
            "Total number of successful DataBox connects",
        )?;
        let connect_errors = IntCounterVec::new(
            Opts::new("databox_connect_errors_total", "Total number of rejected DataBox connects"),
            &["error"],
        )?;

        let frames_received = IntCounter::new("databox_frames_received_total", "Total frames received from clients")?;
        let events_sent = IntCounterVec::new(
            Opts::new("databox_events_sent_total", "Total DataBox events pushed to clients"),
            &["action"],
        )?;

        registry.register(Box::new(sockets_total.clone()))?;
        registry.register(Box::new(sockets_active.clone()))?;
        registry.register(Box::new(connects_total.clone()))?;
        registry.register(Box::new(connect_errors.clone()))?;
        registry.register(Box::new(frames_received.clone()))?;
        registry.register(Box::new(events_sent.clone()))?;

        Ok(Self {
            registry,
            sockets_total,
            sockets_active,
            connects_total,
            connect_errors,
            frames_received,
            events_sent,
        })
    }

    pub fn record_socket_open(&self) {
        self.sockets_total.inc();
        self.sockets_active.inc();
    }

    pub fn record_socket_close(&self) {
        self.sockets_active.dec();
    }

    pub fn record_connect(&self) {
        self.connects_total.inc();
    }

    pub fn record_connect_error(&self, error: &str) {
        self.connect_errors.with_label_values(&[error]).inc();
    }

    pub fn record_frame(&self) {
        self.frames_received.inc();
    }

    /// Record an event pushed to a client, labeled by its `a` field
    pub fn record_event(&self, action: &str) {
        self.events_sent.with_label_values(&[action]).inc();
    }

    /// Export metrics in Prometheus text format
    pub fn export(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            error!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

/// HTTP server for the metrics endpoint
pub struct MetricsServer {
    metrics: Arc<Metrics>,
    addr: SocketAddr,
}

impl MetricsServer {
    pub fn new(metrics: Arc<Metrics>, addr: SocketAddr) -> Self {
        Self { metrics, addr }
    }

    /// Run the metrics HTTP server
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "Metrics server listening on http://{}/metrics", self.addr);

        loop {
            match listener.accept().await {
                Ok((mut stream, _)) => {
                    let metrics = self.metrics.clone();

                    tokio::spawn(async move {
                        let mut buf = [0u8; 1024];
                        let n = match stream.read(&mut buf).await {
                            Ok(n) if n > 0 => n,
                            _ => return,
                        };
                        let request = String::from_utf8_lossy(&buf[..n]);
                        let response = respond(&request, &metrics);
                        let _ = stream.write_all(response.as_bytes()).await;
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept metrics connection");
                }
            }
        }
    }
}

fn respond(request: &str, metrics: &Metrics) -> String {
    if request.starts_with("GET /metrics") || request.starts_with("GET / ") {
        let body = metrics.export();
        format!(
            "HTTP/1.1 200 OK\r\n\
             Content-Type: text/plain; version=0.0.4; charset=utf-8\r\n\
             Content-Length: {}\r\n\
             \r\n\
             {}",
            body.len(),
            body
        )
    } else if request.starts_with("GET /health") {
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: 2\r\n\
         \r\n\
         OK"
        .to_string()
    } else {
        "HTTP/1.1 404 Not Found\r\n\
         Content-Length: 0\r\n\
         \r\n"
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_contains_recorded_values() {
        let metrics = Metrics::new().unwrap();
        metrics.record_socket_open();
        metrics.record_connect_error("AccessDenied");
        metrics.record_event("cud");

        let text = metrics.export();
        assert!(text.contains("databox_sockets_active 1"));
        assert!(text.contains(r#"databox_connect_errors_total{error="AccessDenied"} 1"#));
        assert!(text.contains(r#"databox_events_sent_total{action="cud"} 1"#));
    }

    #[test]
    fn test_routes() {
        let metrics = Metrics::new().unwrap();
        assert!(respond("GET /health HTTP/1.1", &metrics).ends_with("OK"));
        assert!(respond("GET /metrics HTTP/1.1", &metrics).starts_with("HTTP/1.1 200"));
        assert!(respond("POST /x HTTP/1.1", &metrics).starts_with("HTTP/1.1 404"));
    }
}
