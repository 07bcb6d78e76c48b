//! Metrics for the control plane
//!
//! ## Table of Contents
//! - **CoreMetrics**: Prometheus metrics registry
//! - **Timer**: small duration-measuring helper

use crate::error::Result;
use prometheus::{Counter, CounterVec, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry};

/// Process-wide metrics for the server lifecycle engine.
pub struct CoreMetrics {
    registry: Registry,

    // Server lifecycle
    pub servers_created: Counter,
    pub server_transitions: CounterVec,
    pub servers_by_status: GaugeVec,

    // Allocation
    pub allocation_attempts: CounterVec,
    pub port_slots_in_use: GaugeVec,

    // Reconciler
    pub reconcile_ticks: Counter,
    pub reconcile_errors: CounterVec,
    pub reconcile_duration: HistogramVec,

    // Billing
    pub webhooks_processed: CounterVec,

    // HTTP
    pub requests_total: CounterVec,
    pub request_duration: HistogramVec,
}

impl CoreMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let servers_created = Counter::new("cp_servers_created_total", "Total servers created")?;
        let server_transitions = CounterVec::new(
            Opts::new("cp_server_transitions_total", "Server status transitions"),
            &["from", "to"],
        )?;
        let servers_by_status = GaugeVec::new(
            Opts::new("cp_servers_by_status", "Current server count per status"),
            &["status"],
        )?;

        let allocation_attempts = CounterVec::new(
            Opts::new("cp_allocation_attempts_total", "Port allocation attempts"),
            &["outcome"],
        )?;
        let port_slots_in_use = GaugeVec::new(
            Opts::new("cp_port_slots_in_use", "Reserved port slots per node"),
            &["node"],
        )?;

        let reconcile_ticks = Counter::new("cp_reconcile_ticks_total", "Reconciler sweeps run")?;
        let reconcile_errors = CounterVec::new(
            Opts::new("cp_reconcile_errors_total", "Reconciler errors"),
            &["status"],
        )?;
        let reconcile_duration = HistogramVec::new(
            HistogramOpts::new("cp_reconcile_duration_seconds", "Reconciler sweep duration")
                .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]),
            &["phase"],
        )?;

        let webhooks_processed = CounterVec::new(
            Opts::new("cp_webhooks_processed_total", "Billing webhooks processed"),
            &["event_type", "outcome"],
        )?;

        let requests_total = CounterVec::new(
            Opts::new("cp_http_requests_total", "Total HTTP requests"),
            &["method", "path", "status"],
        )?;
        let request_duration = HistogramVec::new(
            HistogramOpts::new("cp_http_request_duration_seconds", "HTTP request duration")
                .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["method", "path"],
        )?;

        registry.register(Box::new(servers_created.clone()))?;
        registry.register(Box::new(server_transitions.clone()))?;
        registry.register(Box::new(servers_by_status.clone()))?;
        registry.register(Box::new(allocation_attempts.clone()))?;
        registry.register(Box::new(port_slots_in_use.clone()))?;
        registry.register(Box::new(reconcile_ticks.clone()))?;
        registry.register(Box::new(reconcile_errors.clone()))?;
        registry.register(Box::new(reconcile_duration.clone()))?;
        registry.register(Box::new(webhooks_processed.clone()))?;
        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;

        Ok(Self {
            registry,
            servers_created,
            server_transitions,
            servers_by_status,
            allocation_attempts,
            port_slots_in_use,
            reconcile_ticks,
            reconcile_errors,
            reconcile_duration,
            webhooks_processed,
            requests_total,
            request_duration,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_server_created(&self) {
        self.servers_created.inc();
    }

    pub fn record_transition(&self, from: &str, to: &str) {
        self.server_transitions.with_label_values(&[from, to]).inc();
    }

    pub fn set_servers_by_status(&self, status: &str, count: f64) {
        self.servers_by_status.with_label_values(&[status]).set(count);
    }

    pub fn record_allocation_attempt(&self, succeeded: bool) {
        let outcome = if succeeded { "success" } else { "exhausted" };
        self.allocation_attempts.with_label_values(&[outcome]).inc();
    }

    pub fn record_reconcile_tick(&self, phase: &str, duration_secs: f64) {
        self.reconcile_ticks.inc();
        self.reconcile_duration.with_label_values(&[phase]).observe(duration_secs);
    }

    pub fn record_reconcile_error(&self, status: &str) {
        self.reconcile_errors.with_label_values(&[status]).inc();
    }

    pub fn record_webhook(&self, event_type: &str, succeeded: bool) {
        let outcome = if succeeded { "success" } else { "failed" };
        self.webhooks_processed.with_label_values(&[event_type, outcome]).inc();
    }

    pub fn record_http_request(&self, method: &str, path: &str, status: u16, duration_secs: f64) {
        let status_str = status.to_string();
        self.requests_total.with_label_values(&[method, path, &status_str]).inc();
        self.request_duration.with_label_values(&[method, path]).observe(duration_secs);
    }

    /// Gather all metrics in Prometheus text-exposition format.
    pub fn gather_text(&self) -> Result<String> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).map_err(|e| crate::error::CoreError::internal(format!("metrics encode: {e}")))?;
        String::from_utf8(buffer).map_err(|e| crate::error::CoreError::internal(format!("metrics utf8: {e}")))
    }
}

impl Default for CoreMetrics {
    fn default() -> Self {
        Self::new().expect("prometheus metric registration is infallible for static metric names")
    }
}

/// Small helper for timing an operation and recording its duration.
pub struct Timer {
    start: std::time::Instant,
}

impl Timer {
    pub fn start() -> Self {
        Self { start: std::time::Instant::now() }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}
