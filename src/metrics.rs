//! The four process-wide counters the pipeline exposes on `/metrics`,
//! plus the small HTTP responder that serves them.
//!
//! Registered once at process start via `lazy_static!`, in the same style
//! the prometheus sink uses for its own per-config `CounterVec`s. Pipeline
//! components take a `Counters` handle rather than reaching for the
//! globals directly, so tests can construct an isolated registry.

use anyhow::Result;
use lazy_static::lazy_static;
use prometheus::{register_int_counter_with_registry, IntCounter, Registry};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
}

/// Admission/loss counters for the ingress buffer and the output buffers
/// combined. `input_*` count admissions into the shared ingress buffer;
/// `output_*` count admissions into any output's own buffer.
#[derive(Clone)]
pub struct Counters {
    pub input_recv_total: IntCounter,
    pub input_lost_total: IntCounter,
    pub output_recv_total: IntCounter,
    pub output_lost_total: IntCounter,
}

impl Counters {
    /// Registers the four counters against the process-wide registry.
    pub fn new() -> Result<Self> {
        Self::with_registry(&REGISTRY)
    }

    /// Registers against a caller-supplied registry; used by tests that
    /// want an isolated counter set.
    pub fn with_registry(registry: &Registry) -> Result<Self> {
        Ok(Self {
            input_recv_total: register_int_counter_with_registry!(
                "dnstap_input_recv_total",
                "Frames admitted into the ingress buffer.",
                registry
            )?,
            input_lost_total: register_int_counter_with_registry!(
                "dnstap_input_lost_total",
                "Frames displaced from the ingress buffer before being read.",
                registry
            )?,
            output_recv_total: register_int_counter_with_registry!(
                "dnstap_output_recv_total",
                "Frames admitted into an output's buffer.",
                registry
            )?,
            output_lost_total: register_int_counter_with_registry!(
                "dnstap_output_lost_total",
                "Frames displaced from an output's buffer before being written.",
                registry
            )?,
        })
    }
}

/// Serves `GET /metrics` in Prometheus text exposition format. Mirrors the
/// minimal hand-rolled HTTP/1.1 responder this binary used before it grew
/// a real metrics surface: an accept loop, a bounded read with a timeout,
/// and an explicit `shutdown().await` so the client doesn't see an RST.
pub async fn serve(addr: std::net::SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "metrics exporter listening");
    loop {
        let (stream, _) = listener.accept().await?;
        tokio::spawn(async move {
            if let Err(err) = handle_request(stream).await {
                tracing::debug!(%err, "metrics request failed");
            }
        });
    }
}

async fn handle_request(mut stream: tokio::net::TcpStream) -> Result<()> {
    let mut buf = [0u8; 8192];
    let n = tokio::time::timeout(std::time::Duration::from_secs(2), stream.read(&mut buf)).await??;
    if n == 0 || !buf.starts_with(b"GET ") {
        return Ok(());
    }

    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let mut metric_families = REGISTRY.gather();
    metric_families.extend(prometheus::gather());
    let mut body = Vec::new();
    encoder.encode(&metric_families, &mut body)?;

    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        encoder.format_type(),
        body.len()
    );
    let mut response = header.into_bytes();
    response.extend_from_slice(&body);

    tokio::time::timeout(std::time::Duration::from_secs(2), stream.write_all(&response)).await??;
    stream.flush().await?;
    stream.shutdown().await?;
    Ok(())
}

/// Shared handle threaded through every pipeline component that needs to
/// observe admission/loss.
pub type SharedCounters = Arc<Counters>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_register_against_isolated_registry() {
        let registry = Registry::new();
        let counters = Counters::with_registry(&registry).unwrap();
        counters.input_recv_total.inc();
        counters.input_lost_total.inc();
        assert_eq!(counters.input_recv_total.get(), 1);
        assert_eq!(counters.input_lost_total.get(), 1);
        assert_eq!(counters.output_recv_total.get(), 0);
    }
}
