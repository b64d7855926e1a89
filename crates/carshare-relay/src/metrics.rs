//! Metrics collection and export

use std::time::{Duration, Instant};

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};

/// Relay metrics
pub struct RelayMetrics {
    connections_total: Counter,
    active_connections: Gauge,
    requests: CounterVec,
    failure_replies: CounterVec,
    protocol_errors: Counter,
    handler_errors: Counter,
    abandoned_requests: Counter,
    request_duration: Histogram,
    registry: Registry,
    start_time: Instant,
}

impl RelayMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let connections_total = Counter::with_opts(Opts::new(
            "carshare_relay_connections_total",
            "Total number of terminal connections accepted",
        ))?;
        registry.register(Box::new(connections_total.clone()))?;

        let active_connections = Gauge::with_opts(Opts::new(
            "carshare_relay_active_connections",
            "Number of terminal connections being served",
        ))?;
        registry.register(Box::new(active_connections.clone()))?;

        let requests = CounterVec::new(
            Opts::new("carshare_relay_requests_total", "Requests handled, by tag"),
            &["tag"],
        )?;
        registry.register(Box::new(requests.clone()))?;

        let failure_replies = CounterVec::new(
            Opts::new(
                "carshare_relay_failure_replies_total",
                "Requests answered with an empty reply, by tag",
            ),
            &["tag"],
        )?;
        registry.register(Box::new(failure_replies.clone()))?;

        let protocol_errors = Counter::with_opts(Opts::new(
            "carshare_relay_protocol_errors_total",
            "Requests rejected as malformed, oversize or with an unknown tag",
        ))?;
        registry.register(Box::new(protocol_errors.clone()))?;

        let handler_errors = Counter::with_opts(Opts::new(
            "carshare_relay_handler_errors_total",
            "Connections ended by an I/O error, timeout or store loss",
        ))?;
        registry.register(Box::new(handler_errors.clone()))?;

        let abandoned_requests = Counter::with_opts(Opts::new(
            "carshare_relay_abandoned_requests_total",
            "Requests dropped because the terminal reset the connection mid-dispatch",
        ))?;
        registry.register(Box::new(abandoned_requests.clone()))?;

        let request_duration = Histogram::with_opts(HistogramOpts::new(
            "carshare_relay_request_duration_seconds",
            "Time from request read to reply written",
        ))?;
        registry.register(Box::new(request_duration.clone()))?;

        Ok(Self {
            connections_total,
            active_connections,
            requests,
            failure_replies,
            protocol_errors,
            handler_errors,
            abandoned_requests,
            request_duration,
            registry,
            start_time: Instant::now(),
        })
    }

    pub fn record_connection_opened(&self) {
        self.connections_total.inc();
        self.active_connections.inc();
    }

    pub fn record_connection_closed(&self) {
        self.active_connections.dec();
    }

    pub fn record_request(&self, tag: &str, failed: bool, duration: Duration) {
        self.requests.with_label_values(&[tag]).inc();
        if failed {
            self.failure_replies.with_label_values(&[tag]).inc();
        }
        self.request_duration.observe(duration.as_secs_f64());
    }

    pub fn record_protocol_error(&self) {
        self.protocol_errors.inc();
    }

    pub fn record_handler_error(&self) {
        self.handler_errors.inc();
    }

    pub fn record_abandoned_request(&self) {
        self.abandoned_requests.inc();
    }

    /// Export Prometheus format
    pub fn export(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).to_string())
    }

    pub fn active_connections(&self) -> u64 {
        self.active_connections.get() as u64
    }

    pub fn total_connections(&self) -> u64 {
        self.connections_total.get() as u64
    }

    pub fn protocol_errors(&self) -> u64 {
        self.protocol_errors.get() as u64
    }

    pub fn handler_errors(&self) -> u64 {
        self.handler_errors.get() as u64
    }

    pub fn abandoned_requests(&self) -> u64 {
        self.abandoned_requests.get() as u64
    }

    pub fn requests(&self, tag: &str) -> u64 {
        self.requests.with_label_values(&[tag]).get() as u64
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }
}
