//! Prometheus Metrics Registry - Market Sync Observability
//!
//! Gauges refreshed from supervisor snapshots: service status, restarts,
//! open circuits, poll counters, stream traffic and connection state.
//! Values are cumulative totals copied from the services' own stats, so
//! they are exported as gauges rather than counters.

use std::collections::BTreeMap;

use prometheus::{Encoder, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use serde_json::Value;

use crate::domain::{ConnectionState, ServiceRuntimeState, ServiceStatus};

/// Centralized Prometheus metrics.
///
/// All metrics follow the naming convention `market_sync_*` and carry a
/// `service` label.
pub struct MetricsRegistry {
    registry: Registry,
    /// Service status code (see `ServiceStatus::code`).
    pub service_status: IntGaugeVec,
    /// Restarts performed by the supervisor.
    pub service_restarts: IntGaugeVec,
    /// Failed checks since the last healthy one.
    pub consecutive_failures: IntGaugeVec,
    /// 1 when the service's circuit is open.
    pub circuit_open: IntGaugeVec,
    /// Completed poll runs.
    pub polls_completed: IntGaugeVec,
    /// Poll run and record errors.
    pub poll_errors: IntGaugeVec,
    /// Overlapping scheduled firings that were skipped.
    pub polls_skipped: IntGaugeVec,
    /// Records fetched by REST polling.
    pub items_fetched: IntGaugeVec,
    /// Stream messages received.
    pub stream_messages: IntGaugeVec,
    /// Stream reconnects.
    pub stream_reconnects: IntGaugeVec,
    /// Stream connection status (1 = connected, 0 = not connected).
    pub stream_connected: IntGaugeVec,
    /// Prices held in the hybrid cache.
    pub cached_prices: IntGauge,
}

impl MetricsRegistry {
    /// Create and register all Prometheus metrics.
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();
        let labelled = |name: &str, help: &str| IntGaugeVec::new(Opts::new(name, help), &["service"]);

        let service_status = labelled("market_sync_service_status", "Service status code")?;
        let service_restarts = labelled("market_sync_service_restarts", "Supervisor restarts per service")?;
        let consecutive_failures = labelled(
            "market_sync_service_consecutive_failures",
            "Failed health checks since the last healthy one",
        )?;
        let circuit_open = labelled(
            "market_sync_service_circuit_open",
            "Whether the service circuit is open (1=yes, 0=no)",
        )?;
        let polls_completed = labelled("market_sync_polls_completed", "Completed poll runs")?;
        let poll_errors = labelled("market_sync_poll_errors", "Poll run and record errors")?;
        let polls_skipped = labelled("market_sync_polls_skipped", "Skipped overlapping poll firings")?;
        let items_fetched = labelled("market_sync_items_fetched", "Records fetched by REST polling")?;
        let stream_messages = labelled("market_sync_stream_messages", "Stream messages received")?;
        let stream_reconnects = labelled("market_sync_stream_reconnects", "Stream reconnects")?;
        let stream_connected = labelled(
            "market_sync_stream_connected",
            "Stream connection status (1=connected, 0=not connected)",
        )?;
        let cached_prices = IntGauge::new("market_sync_cached_prices", "Prices held in the hybrid cache")?;

        // Register all metrics
        registry.register(Box::new(service_status.clone()))?;
        registry.register(Box::new(service_restarts.clone()))?;
        registry.register(Box::new(consecutive_failures.clone()))?;
        registry.register(Box::new(circuit_open.clone()))?;
        registry.register(Box::new(polls_completed.clone()))?;
        registry.register(Box::new(poll_errors.clone()))?;
        registry.register(Box::new(polls_skipped.clone()))?;
        registry.register(Box::new(items_fetched.clone()))?;
        registry.register(Box::new(stream_messages.clone()))?;
        registry.register(Box::new(stream_reconnects.clone()))?;
        registry.register(Box::new(stream_connected.clone()))?;
        registry.register(Box::new(cached_prices.clone()))?;

        Ok(Self {
            registry,
            service_status,
            service_restarts,
            consecutive_failures,
            circuit_open,
            polls_completed,
            poll_errors,
            polls_skipped,
            items_fetched,
            stream_messages,
            stream_reconnects,
            stream_connected,
            cached_prices,
        })
    }

    /// Refresh every gauge from supervisor snapshots.
    pub fn observe(
        &self,
        status: &BTreeMap<String, ServiceRuntimeState>,
        stats: &BTreeMap<String, Value>,
    ) {
        for (name, state) in status {
            let labels = [name.as_str()];
            self.service_status.with_label_values(&labels).set(state.status.code());
            self.service_restarts
                .with_label_values(&labels)
                .set(i64::from(state.restarts));
            self.consecutive_failures
                .with_label_values(&labels)
                .set(i64::from(state.consecutive_failures));
            self.circuit_open
                .with_label_values(&labels)
                .set(i64::from(state.status == ServiceStatus::Failed));
        }

        for (name, value) in stats {
            self.observe_stats(name, value);
        }
    }

    /// Service stats come in three shapes: bare poll stats, stream stats
    /// under `stream`, or the hybrid aggregate with both `poll` and
    /// `stream`.
    fn observe_stats(&self, name: &str, value: &Value) {
        let labels = [name];

        let poll = value.get("poll").unwrap_or(value);
        if poll.get("polls_completed").is_some() {
            self.polls_completed
                .with_label_values(&labels)
                .set(int_field(poll, "polls_completed"));
            self.poll_errors.with_label_values(&labels).set(int_field(poll, "errors"));
            self.polls_skipped
                .with_label_values(&labels)
                .set(int_field(poll, "runs_skipped"));
            self.items_fetched
                .with_label_values(&labels)
                .set(int_field(poll, "items_fetched"));
        }

        if let Some(stream) = value.get("stream") {
            self.stream_messages
                .with_label_values(&labels)
                .set(int_field(stream, "messages_received"));
            self.stream_reconnects
                .with_label_values(&labels)
                .set(int_field(stream, "reconnects"));
        }

        let state = value
            .get("connection_state")
            .or_else(|| value.get("state"))
            .and_then(|v| serde_json::from_value::<ConnectionState>(v.clone()).ok());
        if let Some(state) = state {
            self.stream_connected
                .with_label_values(&labels)
                .set(i64::from(state == ConnectionState::Connected));
        }

        if let Some(cached) = value.get("cached_prices").and_then(Value::as_i64) {
            self.cached_prices.set(cached);
        }
    }

    /// Prometheus text exposition of every registered metric.
    pub fn render(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

fn int_field(value: &Value, key: &str) -> i64 {
    value
        .get(key)
        .and_then(Value::as_u64)
        .map_or(0, |n| i64::try_from(n).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::domain::ServiceKind;

    #[test]
    fn test_observe_status_and_hybrid_stats() {
        let metrics = MetricsRegistry::new().unwrap();

        let mut state = ServiceRuntimeState::registered(ServiceKind::HybridMarketData);
        state.status = ServiceStatus::Failed;
        state.restarts = 2;
        let status = BTreeMap::from([("market_data".to_string(), state)]);
        let stats = BTreeMap::from([(
            "market_data".to_string(),
            json!({
                "connection_state": "connected",
                "cached_prices": 12,
                "subscriptions": 3,
                "poll": {"polls_completed": 4, "errors": 1, "runs_skipped": 0, "items_fetched": 40},
                "stream": {"messages_received": 99, "reconnects": 1},
            }),
        )]);

        metrics.observe(&status, &stats);

        let labels = ["market_data"];
        assert_eq!(metrics.circuit_open.with_label_values(&labels).get(), 1);
        assert_eq!(metrics.service_restarts.with_label_values(&labels).get(), 2);
        assert_eq!(metrics.polls_completed.with_label_values(&labels).get(), 4);
        assert_eq!(metrics.stream_messages.with_label_values(&labels).get(), 99);
        assert_eq!(metrics.stream_connected.with_label_values(&labels).get(), 1);
        assert_eq!(metrics.cached_prices.get(), 12);
    }

    #[test]
    fn test_bare_poller_stats() {
        let metrics = MetricsRegistry::new().unwrap();
        let stats = BTreeMap::from([(
            "kalshi_poller".to_string(),
            json!({"polls_completed": 7, "errors": 2, "runs_skipped": 1, "items_fetched": 70}),
        )]);

        metrics.observe(&BTreeMap::new(), &stats);

        let labels = ["kalshi_poller"];
        assert_eq!(metrics.poll_errors.with_label_values(&labels).get(), 2);
        assert_eq!(metrics.polls_skipped.with_label_values(&labels).get(), 1);
    }

    #[test]
    fn test_render_contains_metric_names() {
        let metrics = MetricsRegistry::new().unwrap();
        metrics.cached_prices.set(3);
        let text = metrics.render().unwrap();
        assert!(text.contains("market_sync_cached_prices 3"));
    }
}
