//! Metrics module for Prometheus
//!
//! This module provides metrics collection for the gateway service:
//! - Request count by method, path, and status
//! - Request latency histogram

use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use std::time::Duration;

/// Gateway metrics collector
#[derive(Clone)]
pub struct GatewayMetrics {
    registry: Registry,
    request_counter: CounterVec,
    request_latency: HistogramVec,
}

impl GatewayMetrics {
    /// Create a new metrics instance
    pub fn new() -> Self {
        let registry = Registry::new();

        let request_counter = CounterVec::new(
            Opts::new("gateway_requests_total", "Total number of requests"),
            &["method", "path", "status"],
        )
        .expect("Failed to create request counter");

        let request_latency = HistogramVec::new(
            HistogramOpts::new(
                "gateway_request_latency_seconds",
                "Request latency in seconds",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
            &["method", "path"],
        )
        .expect("Failed to create latency histogram");

        registry
            .register(Box::new(request_counter.clone()))
            .expect("Failed to register request counter");
        registry
            .register(Box::new(request_latency.clone()))
            .expect("Failed to register latency histogram");

        Self {
            registry,
            request_counter,
            request_latency,
        }
    }

    /// Record a request with its status and latency
    pub fn record_request(&self, method: &str, path: &str, status: u16, latency: Duration) {
        let status_str = status.to_string();

        // Normalize path for metrics (to avoid high cardinality)
        let normalized_path = Self::normalize_path(path);

        self.request_counter
            .with_label_values(&[method, &normalized_path, &status_str])
            .inc();

        self.request_latency
            .with_label_values(&[method, &normalized_path])
            .observe(latency.as_secs_f64());
    }

    /// Get the Prometheus metrics output
    pub fn prometheus_output(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap_or_default();
        String::from_utf8(buffer).unwrap_or_default()
    }

    /// Normalize path to reduce cardinality
    /// Replace IDs and numbers with placeholders
    fn normalize_path(path: &str) -> String {
        let parts: Vec<&str> = path.split('/').collect();
        let normalized: Vec<String> = parts
            .iter()
            .map(|part| {
                if part.chars().all(|c| c.is_ascii_digit()) && !part.is_empty() {
                    ":id".to_string()
                } else if part.chars().all(|c| c.is_ascii_hexdigit()) && part.len() >= 8 {
                    ":uuid".to_string()
                } else {
                    (*part).to_string()
                }
            })
            .collect();
        normalized.join("/")
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}
