//! Metrics collection and text exposition.

use std::time::Instant;

use chrono::Utc;
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};

/// Content type of the text exposition format.
pub const TEXT_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Thread-safe counters and gauges backing the `/metrics` endpoint.
///
/// Each sink owns its registry so tests can create sinks independently.
pub struct MetricsSink {
    registry: Registry,
    updates: IntCounterVec,
    rollbacks: IntCounterVec,
    restarts: IntCounterVec,
    failures: IntCounterVec,
    healthy: IntGaugeVec,
    blocked: IntGaugeVec,
    poll_cycles: IntCounter,
    last_poll_timestamp: IntGauge,
    uptime_seconds: IntGauge,
    started_at: Instant,
}

impl Default for MetricsSink {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSink {
    pub fn new() -> Self {
        let registry = Registry::new();

        let per_service = |name: &str, help: &str| {
            let vec = IntCounterVec::new(Opts::new(name, help), &["service"])
                .expect("create counter vec");
            registry
                .register(Box::new(vec.clone()))
                .expect("register counter vec");
            vec
        };
        let per_service_gauge = |name: &str, help: &str| {
            let vec =
                IntGaugeVec::new(Opts::new(name, help), &["service"]).expect("create gauge vec");
            registry
                .register(Box::new(vec.clone()))
                .expect("register gauge vec");
            vec
        };

        let updates = per_service("warden_updates_total", "Total successful image updates");
        let rollbacks = per_service(
            "warden_rollbacks_total",
            "Total rollbacks after failed updates",
        );
        let restarts = per_service("warden_restarts_total", "Total auto-heal restarts");
        let failures = per_service("warden_failures_total", "Total failures (critical events)");
        let healthy = per_service_gauge(
            "warden_service_healthy",
            "Whether each service is healthy (1) or not (0)",
        );
        let blocked = per_service_gauge(
            "warden_service_blocked",
            "Whether a service has a blocked digest (1) or not (0)",
        );

        let poll_cycles = IntCounter::new("warden_poll_cycles_total", "Total registry poll cycles")
            .expect("create counter");
        registry
            .register(Box::new(poll_cycles.clone()))
            .expect("register counter");

        let last_poll_timestamp = IntGauge::new(
            "warden_last_poll_timestamp_seconds",
            "Unix timestamp of the last poll cycle",
        )
        .expect("create gauge");
        registry
            .register(Box::new(last_poll_timestamp.clone()))
            .expect("register gauge");

        let uptime_seconds =
            IntGauge::new("warden_uptime_seconds", "Seconds since warden started")
                .expect("create gauge");
        registry
            .register(Box::new(uptime_seconds.clone()))
            .expect("register gauge");

        Self {
            registry,
            updates,
            rollbacks,
            restarts,
            failures,
            healthy,
            blocked,
            poll_cycles,
            last_poll_timestamp,
            uptime_seconds,
            started_at: Instant::now(),
        }
    }

    pub fn inc_updates(&self, service: &str) {
        self.updates.with_label_values(&[service]).inc();
    }

    pub fn inc_rollbacks(&self, service: &str) {
        self.rollbacks.with_label_values(&[service]).inc();
    }

    pub fn inc_restarts(&self, service: &str) {
        self.restarts.with_label_values(&[service]).inc();
    }

    pub fn inc_failures(&self, service: &str) {
        self.failures.with_label_values(&[service]).inc();
    }

    pub fn set_healthy(&self, service: &str, healthy: bool) {
        self.healthy
            .with_label_values(&[service])
            .set(i64::from(healthy));
    }

    pub fn set_blocked(&self, service: &str, blocked: bool) {
        self.blocked
            .with_label_values(&[service])
            .set(i64::from(blocked));
    }

    /// Counts a poll cycle and stamps its wall-clock time.
    pub fn record_poll(&self) {
        self.poll_cycles.inc();
        self.last_poll_timestamp.set(Utc::now().timestamp());
    }

    /// Renders the text exposition format.
    pub fn export(&self) -> String {
        self.uptime_seconds
            .set(self.started_at.elapsed().as_secs() as i64);

        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .expect("encode metrics");
        String::from_utf8(buffer).expect("metrics are utf-8")
    }
}
