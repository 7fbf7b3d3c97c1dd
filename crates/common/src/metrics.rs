//! Metrics collection for ChatRelay
//!
//! This module provides Prometheus metrics for observability.
//! Everything here is touched once or twice per request, never per chunk
//! except the active stream gauge.

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::Arc;

/// Metrics registry for ChatRelay
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub requests: RequestMetrics,
    pub routing: RoutingMetrics,
    pub upstream: UpstreamMetrics,
}

/// Inbound request metrics
#[derive(Debug, Clone)]
pub struct RequestMetrics {
    /// Total number of chat requests received
    pub requests_total: IntCounter,

    /// Requests rejected before routing, by reason
    pub requests_rejected: IntCounterVec,

    /// Requests that failed with an internal error
    pub internal_errors: IntCounter,
}

/// Routing and truncation metrics
#[derive(Debug, Clone)]
pub struct RoutingMetrics {
    /// Requests routed, by node endpoint
    pub requests_routed: IntCounterVec,

    /// History messages evicted by the sliding window
    pub messages_evicted: IntCounter,

    /// Requests whose final user turn had to be cut
    pub final_turn_truncations: IntCounter,

    /// Prompt size after truncation
    pub prompt_tokens: Histogram,
}

/// Upstream streaming metrics
#[derive(Debug, Clone)]
pub struct UpstreamMetrics {
    /// Streams currently relaying backend output
    pub active_streams: IntGauge,

    /// Upstream failures surfaced as in-band error chunks, by kind
    pub upstream_errors: IntCounterVec,

    /// Wall-clock duration of a relayed stream
    pub stream_duration: Histogram,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        // Request metrics
        let requests_total = IntCounter::new(
            "relay_requests_total",
            "Total number of chat requests received"
        ).unwrap();

        let requests_rejected = IntCounterVec::new(
            Opts::new(
                "relay_requests_rejected_total",
                "Chat requests rejected during validation"
            ),
            &["reason"]
        ).unwrap();

        let internal_errors = IntCounter::new(
            "relay_internal_errors_total",
            "Chat requests that failed with an internal error"
        ).unwrap();

        // Routing metrics
        let requests_routed = IntCounterVec::new(
            Opts::new(
                "relay_requests_routed_total",
                "Chat requests routed to each node"
            ),
            &["endpoint"]
        ).unwrap();

        let messages_evicted = IntCounter::new(
            "relay_messages_evicted_total",
            "History messages evicted to fit node context windows"
        ).unwrap();

        let final_turn_truncations = IntCounter::new(
            "relay_final_turn_truncations_total",
            "Requests whose final user message was truncated"
        ).unwrap();

        let prompt_tokens = Histogram::with_opts(
            HistogramOpts::new(
                "relay_prompt_tokens",
                "Estimated prompt tokens forwarded after truncation"
            ).buckets(vec![64.0, 256.0, 512.0, 1024.0, 2048.0, 4096.0, 8192.0, 16384.0, 65536.0])
        ).unwrap();

        // Upstream metrics
        let active_streams = IntGauge::new(
            "relay_active_streams",
            "Streams currently relaying backend output"
        ).unwrap();

        let upstream_errors = IntCounterVec::new(
            Opts::new(
                "relay_upstream_errors_total",
                "Upstream failures reported as in-band error chunks"
            ),
            &["kind"]
        ).unwrap();

        let stream_duration = Histogram::with_opts(
            HistogramOpts::new(
                "relay_stream_duration_seconds",
                "Duration of relayed backend streams in seconds"
            ).buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0])
        ).unwrap();

        // Register all metrics
        registry.register(Box::new(requests_total.clone())).unwrap();
        registry.register(Box::new(requests_rejected.clone())).unwrap();
        registry.register(Box::new(internal_errors.clone())).unwrap();

        registry.register(Box::new(requests_routed.clone())).unwrap();
        registry.register(Box::new(messages_evicted.clone())).unwrap();
        registry.register(Box::new(final_turn_truncations.clone())).unwrap();
        registry.register(Box::new(prompt_tokens.clone())).unwrap();

        registry.register(Box::new(active_streams.clone())).unwrap();
        registry.register(Box::new(upstream_errors.clone())).unwrap();
        registry.register(Box::new(stream_duration.clone())).unwrap();

        let requests = RequestMetrics {
            requests_total,
            requests_rejected,
            internal_errors,
        };

        let routing = RoutingMetrics {
            requests_routed,
            messages_evicted,
            final_turn_truncations,
            prompt_tokens,
        };

        let upstream = UpstreamMetrics {
            active_streams,
            upstream_errors,
            stream_duration,
        };

        MetricsRegistry {
            registry,
            requests,
            routing,
            upstream,
        }
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::error!("Failed to encode metrics: {}", e);
            return String::new();
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
