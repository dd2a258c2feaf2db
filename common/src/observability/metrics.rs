//! Prometheus metrics (Rust `prometheus` crate).
//!
//! One `MetricsContext` is intended per process. Each binary owns its registry
//! and controls which metrics it reports.

use anyhow::Result;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Configuration for the built-in Prometheus scrape endpoint.
#[derive(Debug, Clone)]
pub struct MetricsServerConfig {
    // ---
    /// Address to bind, e.g. `127.0.0.1:9100`.
    pub bind: SocketAddr,
}

impl MetricsServerConfig {
    // ---
    pub fn new(bind: SocketAddr) -> Self {
        // ---
        Self { bind }
    }
}

/// Prometheus metrics registry + handles.
///
/// This is a thin, explicit wrapper around the `prometheus` crate so hot-path
/// instrumentation is just counter increments / histogram observations.
#[derive(Clone)]
pub struct MetricsContext {
    // ---
    registry: Registry,

    // Wire counters
    pub packets_sent_total: IntCounter,
    pub packets_received_total: IntCounter,
    pub packets_missing_total: IntCounter,
    pub packets_duplicate_total: IntCounter,
    pub packets_out_of_order_total: IntCounter,
    pub short_datagrams_total: IntCounter,
    pub decode_failures_total: IntCounter,

    pub bytes_sent_total: IntCounter,
    pub bytes_received_total: IntCounter,

    // Playout
    pub rebuffer_events_total: IntCounter,
    pub jitter_buffer_occupancy_frames: IntGauge,

    // Latency histograms (seconds)
    pub opus_encode_seconds: Histogram,
    pub opus_decode_seconds: Histogram,
}

impl MetricsContext {
    // ---
    /// Create a new registry and register the standard metrics.
    ///
    /// `process_name` is applied as a constant label (`process=<name>`).
    pub fn new(process_name: &str) -> Result<Self> {
        // ---
        let registry = Registry::new_custom(
            Some("voicelink".into()),
            Some(prometheus::labels! { "process".to_string() => process_name.to_string() }),
        )?;

        let packets_sent_total = IntCounter::with_opts(Opts::new(
            "voice_packets_sent_total",
            "Total voice packets sent",
        ))?;
        let packets_received_total = IntCounter::with_opts(Opts::new(
            "voice_packets_received_total",
            "Total voice packets received",
        ))?;
        let packets_missing_total = IntCounter::with_opts(Opts::new(
            "voice_packets_missing_total",
            "Total voice packets detected as missing via sequence gaps",
        ))?;
        let packets_duplicate_total = IntCounter::with_opts(Opts::new(
            "voice_packets_duplicate_total",
            "Total duplicate voice packets received",
        ))?;
        let packets_out_of_order_total = IntCounter::with_opts(Opts::new(
            "voice_packets_out_of_order_total",
            "Total voice packets received out of order",
        ))?;
        let short_datagrams_total = IntCounter::with_opts(Opts::new(
            "short_datagrams_total",
            "Total datagrams dropped for being shorter than a packet header",
        ))?;
        let decode_failures_total = IntCounter::with_opts(Opts::new(
            "decode_failures_total",
            "Total received frames the audio decoder rejected",
        ))?;

        let bytes_sent_total = IntCounter::with_opts(Opts::new(
            "voice_bytes_sent_total",
            "Total voice datagram bytes sent",
        ))?;
        let bytes_received_total = IntCounter::with_opts(Opts::new(
            "voice_bytes_received_total",
            "Total voice datagram bytes received",
        ))?;

        let rebuffer_events_total = IntCounter::with_opts(Opts::new(
            "rebuffer_events_total",
            "Times playback fell back to buffering after an underrun",
        ))?;
        let jitter_buffer_occupancy_frames = IntGauge::with_opts(Opts::new(
            "jitter_buffer_occupancy_frames",
            "Current jitter buffer occupancy in frames",
        ))?;

        let opus_encode_seconds = Histogram::with_opts(HistogramOpts::new(
            "opus_encode_seconds",
            "Opus encode duration in seconds",
        ))?;
        let opus_decode_seconds = Histogram::with_opts(HistogramOpts::new(
            "opus_decode_seconds",
            "Opus decode duration in seconds",
        ))?;

        // Register all metrics
        registry.register(Box::new(packets_sent_total.clone()))?;
        registry.register(Box::new(packets_received_total.clone()))?;
        registry.register(Box::new(packets_missing_total.clone()))?;
        registry.register(Box::new(packets_duplicate_total.clone()))?;
        registry.register(Box::new(packets_out_of_order_total.clone()))?;
        registry.register(Box::new(short_datagrams_total.clone()))?;
        registry.register(Box::new(decode_failures_total.clone()))?;
        registry.register(Box::new(bytes_sent_total.clone()))?;
        registry.register(Box::new(bytes_received_total.clone()))?;
        registry.register(Box::new(rebuffer_events_total.clone()))?;
        registry.register(Box::new(jitter_buffer_occupancy_frames.clone()))?;
        registry.register(Box::new(opus_encode_seconds.clone()))?;
        registry.register(Box::new(opus_decode_seconds.clone()))?;

        Ok(Self {
            registry,
            packets_sent_total,
            packets_received_total,
            packets_missing_total,
            packets_duplicate_total,
            packets_out_of_order_total,
            short_datagrams_total,
            decode_failures_total,
            bytes_sent_total,
            bytes_received_total,
            rebuffer_events_total,
            jitter_buffer_occupancy_frames,
            opus_encode_seconds,
            opus_decode_seconds,
        })
    }

    /// Gather metric families from this registry.
    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        // ---
        self.registry.gather()
    }

    /// Spawns a minimal HTTP server that serves `GET /metrics`.
    ///
    /// This is intentionally explicit (callers decide whether to run it).
    pub fn spawn_metrics_server(&self, cfg: MetricsServerConfig) -> JoinHandle<Result<()>> {
        // ---
        let registry = Arc::new(self.registry.clone());
        tokio::spawn(async move {
            // ---
            let make_svc = make_service_fn(move |_conn| {
                let registry = Arc::clone(&registry);
                async move {
                    Ok::<_, hyper::Error>(service_fn(move |req| {
                        let registry = Arc::clone(&registry);
                        async move { handle_metrics_request(req, registry).await }
                    }))
                }
            });

            let server = Server::bind(&cfg.bind).serve(make_svc);
            server.await.map_err(|e| anyhow::anyhow!(e))?;
            Ok(())
        })
    }
}

async fn handle_metrics_request(
    req: Request<Body>,
    registry: Arc<Registry>,
) -> Result<Response<Body>, hyper::Error> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let encoder = TextEncoder::new();
            let metric_families = registry.gather();
            let mut buffer = Vec::new();

            if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
                let mut resp = Response::new(Body::from(format!("encode error: {e}")));
                *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                return Ok(resp);
            }

            let mut resp = Response::new(Body::from(buffer));
            resp.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            Ok(resp)
        }
        _ => {
            let mut resp = Response::new(Body::from("not found"));
            *resp.status_mut() = StatusCode::NOT_FOUND;
            Ok(resp)
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn metrics_context_gathers_something() {
        // ---
        let ctx = MetricsContext::new("test").expect("MetricsContext should init");
        let families = ctx.gather();
        assert!(!families.is_empty());
    }

    #[test]
    fn counters_start_at_zero() {
        // ---
        let ctx = MetricsContext::new("test").expect("MetricsContext should init");
        assert_eq!(ctx.packets_sent_total.get(), 0);
        assert_eq!(ctx.rebuffer_events_total.get(), 0);
        ctx.packets_missing_total.inc_by(3);
        assert_eq!(ctx.packets_missing_total.get(), 3);
    }
}
