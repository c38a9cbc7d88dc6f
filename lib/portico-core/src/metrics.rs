//! Prometheus metrics for the request path

use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramTimer, HistogramVec, Opts, Registry, TextEncoder,
};

use crate::error::{GatewayError, Result};

/// Request/response counters and latency histogram
pub struct MetricsCollector {
    http_requests_total: CounterVec,
    http_responses_total: CounterVec,
    http_request_duration_seconds: HistogramVec,
    registry: Registry,
}

impl MetricsCollector {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let http_requests_total = CounterVec::new(
            Opts::new("http_requests_total", "Total HTTP requests"),
            &["method"],
        )
        .map_err(internal)?;
        registry
            .register(Box::new(http_requests_total.clone()))
            .map_err(internal)?;

        let http_responses_total = CounterVec::new(
            Opts::new("http_responses_total", "Total HTTP responses by status"),
            &["status"],
        )
        .map_err(internal)?;
        registry
            .register(Box::new(http_responses_total.clone()))
            .map_err(internal)?;

        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "HTTP request latency in seconds",
            ),
            &["method"],
        )
        .map_err(internal)?;
        registry
            .register(Box::new(http_request_duration_seconds.clone()))
            .map_err(internal)?;

        Ok(Self {
            http_requests_total,
            http_responses_total,
            http_request_duration_seconds,
            registry,
        })
    }

    pub(crate) fn start_request(&self, method: &str) -> HistogramTimer {
        self.http_requests_total.with_label_values(&[method]).inc();
        self.http_request_duration_seconds
            .with_label_values(&[method])
            .start_timer()
    }

    pub(crate) fn observe_response(&self, status: u16, timer: HistogramTimer) {
        self.http_responses_total
            .with_label_values(&[&status.to_string()])
            .inc();
        timer.observe_duration();
    }

    /// Render the metrics in the Prometheus text exposition format
    pub fn export(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(internal)?;
        String::from_utf8(buffer).map_err(|err| GatewayError::Internal(err.to_string()))
    }
}

fn internal(err: prometheus::Error) -> GatewayError {
    GatewayError::Internal(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_response_counters() {
        let metrics = MetricsCollector::new().unwrap();
        let timer = metrics.start_request("GET");
        metrics.observe_response(502, timer);

        let exported = metrics.export().unwrap();
        assert!(exported.contains("http_requests_total{method=\"GET\"} 1"));
        assert!(exported.contains("http_responses_total{status=\"502\"} 1"));
        assert!(exported.contains("http_request_duration_seconds"));
    }
}
