//! Prometheus metrics for PulseHub
//!
//! Exposed at `/metrics` on the management server.

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};

/// All PulseHub metrics in one place
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // Connection metrics
    pub connections_total: IntCounter,
    pub connections_current: IntGauge,
    pub connections_maximum: IntGauge,
    pub connections_by_endpoint: IntGaugeVec,
    pub connections_rejected_total: IntCounterVec,
    pub connections_closed_total: IntCounterVec,

    // Authentication metrics
    pub authentications_total: IntCounter,
    pub authentication_failures_total: IntCounter,
    pub evictions_total: IntCounter,

    // Message metrics
    pub messages_received_total: IntCounterVec,
    pub messages_bytes_received: IntCounter,
    pub publish_total: IntCounter,
    pub deliveries_total: IntCounter,
    pub delivery_failures_total: IntCounter,
    pub publish_fanout: Histogram,

    // Subscription metrics
    pub subscriptions_current: IntGauge,
    pub subscriptions_total: IntCounter,
    pub unsubscriptions_total: IntCounter,

    // Health metrics
    pub connections_in_error: IntGauge,
    pub errors_total: IntCounterVec,
    pub recovery_attempts_total: IntCounter,
    pub recovery_successes_total: IntCounter,
    pub recovery_exhausted_total: IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        // Connection metrics
        let connections_total = IntCounter::with_opts(Opts::new(
            "pulsehub_connections_total",
            "Total number of admitted connections since startup",
        ))
        .unwrap();

        let connections_current = IntGauge::with_opts(Opts::new(
            "pulsehub_connections_current",
            "Current number of live connections",
        ))
        .unwrap();

        let connections_maximum = IntGauge::with_opts(Opts::new(
            "pulsehub_connections_maximum",
            "Maximum concurrent connections since startup",
        ))
        .unwrap();

        let connections_by_endpoint = IntGaugeVec::new(
            Opts::new(
                "pulsehub_connections_by_endpoint",
                "Current connections by endpoint",
            ),
            &["endpoint"],
        )
        .unwrap();

        let connections_rejected_total = IntCounterVec::new(
            Opts::new(
                "pulsehub_connections_rejected_total",
                "Connections refused before admission, by reason",
            ),
            &["reason"],
        )
        .unwrap();

        let connections_closed_total = IntCounterVec::new(
            Opts::new(
                "pulsehub_connections_closed_total",
                "Connections removed from the registry, by close reason",
            ),
            &["reason"],
        )
        .unwrap();

        // Authentication metrics
        let authentications_total = IntCounter::with_opts(Opts::new(
            "pulsehub_authentications_total",
            "Successful authentications",
        ))
        .unwrap();

        let authentication_failures_total = IntCounter::with_opts(Opts::new(
            "pulsehub_authentication_failures_total",
            "Rejected authentication attempts",
        ))
        .unwrap();

        let evictions_total = IntCounter::with_opts(Opts::new(
            "pulsehub_evictions_total",
            "Connections evicted by the per-user connection cap",
        ))
        .unwrap();

        // Message metrics
        let messages_received_total = IntCounterVec::new(
            Opts::new(
                "pulsehub_messages_received_total",
                "Inbound envelopes by type",
            ),
            &["type"],
        )
        .unwrap();

        let messages_bytes_received = IntCounter::with_opts(Opts::new(
            "pulsehub_messages_bytes_received_total",
            "Total inbound bytes",
        ))
        .unwrap();

        let publish_total = IntCounter::with_opts(Opts::new(
            "pulsehub_publish_total",
            "Messages published to topics or users",
        ))
        .unwrap();

        let deliveries_total = IntCounter::with_opts(Opts::new(
            "pulsehub_deliveries_total",
            "Messages handed to connection writers",
        ))
        .unwrap();

        let delivery_failures_total = IntCounter::with_opts(Opts::new(
            "pulsehub_delivery_failures_total",
            "Deliveries that failed or timed out",
        ))
        .unwrap();

        let publish_fanout = Histogram::with_opts(
            HistogramOpts::new(
                "pulsehub_publish_fanout",
                "Number of recipients per published message",
            )
            .buckets(vec![0.0, 1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0]),
        )
        .unwrap();

        // Subscription metrics
        let subscriptions_current = IntGauge::with_opts(Opts::new(
            "pulsehub_subscriptions_current",
            "Current number of topic subscriptions",
        ))
        .unwrap();

        let subscriptions_total = IntCounter::with_opts(Opts::new(
            "pulsehub_subscriptions_total",
            "Total subscriptions since startup",
        ))
        .unwrap();

        let unsubscriptions_total = IntCounter::with_opts(Opts::new(
            "pulsehub_unsubscriptions_total",
            "Total unsubscriptions since startup",
        ))
        .unwrap();

        // Health metrics
        let connections_in_error = IntGauge::with_opts(Opts::new(
            "pulsehub_connections_in_error",
            "Connections currently in the ERROR state",
        ))
        .unwrap();

        let errors_total = IntCounterVec::new(
            Opts::new(
                "pulsehub_connection_errors_total",
                "Transitions into ERROR, by cause",
            ),
            &["cause"],
        )
        .unwrap();

        let recovery_attempts_total = IntCounter::with_opts(Opts::new(
            "pulsehub_recovery_attempts_total",
            "Recovery probes sent",
        ))
        .unwrap();

        let recovery_successes_total = IntCounter::with_opts(Opts::new(
            "pulsehub_recovery_successes_total",
            "Connections restored by recovery",
        ))
        .unwrap();

        let recovery_exhausted_total = IntCounter::with_opts(Opts::new(
            "pulsehub_recovery_exhausted_total",
            "Connections removed after exhausting recovery",
        ))
        .unwrap();

        // Register all metrics
        registry
            .register(Box::new(connections_total.clone()))
            .unwrap();
        registry
            .register(Box::new(connections_current.clone()))
            .unwrap();
        registry
            .register(Box::new(connections_maximum.clone()))
            .unwrap();
        registry
            .register(Box::new(connections_by_endpoint.clone()))
            .unwrap();
        registry
            .register(Box::new(connections_rejected_total.clone()))
            .unwrap();
        registry
            .register(Box::new(connections_closed_total.clone()))
            .unwrap();
        registry
            .register(Box::new(authentications_total.clone()))
            .unwrap();
        registry
            .register(Box::new(authentication_failures_total.clone()))
            .unwrap();
        registry.register(Box::new(evictions_total.clone())).unwrap();
        registry
            .register(Box::new(messages_received_total.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_bytes_received.clone()))
            .unwrap();
        registry.register(Box::new(publish_total.clone())).unwrap();
        registry.register(Box::new(deliveries_total.clone())).unwrap();
        registry
            .register(Box::new(delivery_failures_total.clone()))
            .unwrap();
        registry.register(Box::new(publish_fanout.clone())).unwrap();
        registry
            .register(Box::new(subscriptions_current.clone()))
            .unwrap();
        registry
            .register(Box::new(subscriptions_total.clone()))
            .unwrap();
        registry
            .register(Box::new(unsubscriptions_total.clone()))
            .unwrap();
        registry
            .register(Box::new(connections_in_error.clone()))
            .unwrap();
        registry.register(Box::new(errors_total.clone())).unwrap();
        registry
            .register(Box::new(recovery_attempts_total.clone()))
            .unwrap();
        registry
            .register(Box::new(recovery_successes_total.clone()))
            .unwrap();
        registry
            .register(Box::new(recovery_exhausted_total.clone()))
            .unwrap();

        Self {
            registry,
            connections_total,
            connections_current,
            connections_maximum,
            connections_by_endpoint,
            connections_rejected_total,
            connections_closed_total,
            authentications_total,
            authentication_failures_total,
            evictions_total,
            messages_received_total,
            messages_bytes_received,
            publish_total,
            deliveries_total,
            delivery_failures_total,
            publish_fanout,
            subscriptions_current,
            subscriptions_total,
            unsubscriptions_total,
            connections_in_error,
            errors_total,
            recovery_attempts_total,
            recovery_successes_total,
            recovery_exhausted_total,
        }
    }

    // Connection helpers

    pub fn connection_admitted(&self, endpoint: &str) {
        self.connections_total.inc();
        self.connections_current.inc();
        self.connections_by_endpoint
            .with_label_values(&[endpoint])
            .inc();

        let current = self.connections_current.get();
        if current > self.connections_maximum.get() {
            self.connections_maximum.set(current);
        }
    }

    pub fn connection_removed(&self, endpoint: &str, reason: &str) {
        self.connections_current.dec();
        self.connections_by_endpoint
            .with_label_values(&[endpoint])
            .dec();
        self.connections_closed_total
            .with_label_values(&[reason])
            .inc();
    }

    pub fn connection_rejected(&self, reason: &str) {
        self.connections_rejected_total
            .with_label_values(&[reason])
            .inc();
    }

    // Authentication helpers

    pub fn authenticated(&self) {
        self.authentications_total.inc();
    }

    pub fn authentication_failed(&self) {
        self.authentication_failures_total.inc();
    }

    pub fn evicted(&self) {
        self.evictions_total.inc();
    }

    // Message helpers

    pub fn message_received(&self, msg_type: &str, bytes: usize) {
        self.messages_received_total
            .with_label_values(&[msg_type])
            .inc();
        self.messages_bytes_received.inc_by(bytes as u64);
    }

    pub fn published(&self, attempted: usize, delivered: usize) {
        self.publish_total.inc();
        self.publish_fanout.observe(attempted as f64);
        self.deliveries_total.inc_by(delivered as u64);
        self.delivery_failures_total
            .inc_by(attempted.saturating_sub(delivered) as u64);
    }

    // Subscription helpers

    pub fn subscription_added(&self) {
        self.subscriptions_current.inc();
        self.subscriptions_total.inc();
    }

    pub fn subscription_removed(&self) {
        self.subscriptions_current.dec();
        self.unsubscriptions_total.inc();
    }

    /// Subscriptions dropped along with a removed connection
    pub fn subscriptions_dropped(&self, count: usize) {
        self.subscriptions_current.sub(count as i64);
    }

    // Health helpers

    pub fn entered_error(&self, cause: &str) {
        self.connections_in_error.inc();
        self.errors_total.with_label_values(&[cause]).inc();
    }

    pub fn left_error(&self) {
        self.connections_in_error.dec();
    }

    pub fn recovery_attempted(&self) {
        self.recovery_attempts_total.inc();
    }

    pub fn recovery_succeeded(&self) {
        self.recovery_successes_total.inc();
    }

    pub fn recovery_exhausted(&self) {
        self.recovery_exhausted_total.inc();
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
