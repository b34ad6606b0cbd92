//! Prometheus metrics for the relay.

use lazy_static::lazy_static;
use prometheus::{Counter, CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};

lazy_static! {
    /// Relay metrics registry.
    pub static ref REGISTRY: Registry = Registry::new();

    /// Total EVENT frames received.
    pub static ref EVENTS_RECEIVED: Counter = Counter::new(
        "nostrum_events_received_total",
        "Total EVENT frames received"
    ).expect("metric creation failed");

    /// Total events persisted.
    pub static ref EVENTS_STORED: Counter = Counter::new(
        "nostrum_events_stored_total",
        "Total events persisted to the store"
    ).expect("metric creation failed");

    /// Rejected events by taxonomy prefix.
    pub static ref EVENTS_REJECTED: CounterVec = CounterVec::new(
        Opts::new("nostrum_events_rejected_total", "Rejected events by reason"),
        &["reason"]
    ).expect("metric creation failed");

    /// Live WebSocket connections.
    pub static ref ACTIVE_CONNECTIONS: Gauge = Gauge::new(
        "nostrum_active_connections",
        "Live WebSocket connections"
    ).expect("metric creation failed");

    /// Live subscriptions across all connections.
    pub static ref ACTIVE_SUBSCRIPTIONS: Gauge = Gauge::new(
        "nostrum_active_subscriptions",
        "Live subscriptions across all connections"
    ).expect("metric creation failed");

    /// Events fanned out to subscribers.
    pub static ref EVENTS_BROADCAST: Counter = Counter::new(
        "nostrum_events_broadcast_total",
        "Events fanned out to subscribers"
    ).expect("metric creation failed");

    /// Broadcasts dropped by the dedup window.
    pub static ref DUPLICATES_DROPPED: Counter = Counter::new(
        "nostrum_duplicates_dropped_total",
        "Broadcasts dropped by the dedup window"
    ).expect("metric creation failed");
}

/// Register every metric once at startup.
pub fn register_all() {
    let _ = REGISTRY.register(Box::new(EVENTS_RECEIVED.clone()));
    let _ = REGISTRY.register(Box::new(EVENTS_STORED.clone()));
    let _ = REGISTRY.register(Box::new(EVENTS_REJECTED.clone()));
    let _ = REGISTRY.register(Box::new(ACTIVE_CONNECTIONS.clone()));
    let _ = REGISTRY.register(Box::new(ACTIVE_SUBSCRIPTIONS.clone()));
    let _ = REGISTRY.register(Box::new(EVENTS_BROADCAST.clone()));
    let _ = REGISTRY.register(Box::new(DUPLICATES_DROPPED.clone()));
}

/// Render the registry in the Prometheus text exposition format.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if encoder.encode(&REGISTRY.gather(), &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}
