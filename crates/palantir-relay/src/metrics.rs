//! Prometheus metrics for the relay.

use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};

/// Relay counters, registered in a private registry.
pub struct RelayMetrics {
    pub connections: IntCounter,
    pub active_sessions: IntGauge,
    pub frames_forwarded: IntCounter,
    pub bytes_forwarded: IntCounter,
    pub frames_dropped: IntCounter,
    pub evictions: IntCounter,
    pub protocol_violations: IntCounter,
    pub handshake_failures: IntCounter,
    registry: Registry,
}

impl RelayMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let connections = counter(
            &registry,
            "palantir_relay_connections_total",
            "Accepted connections",
        )?;
        let active_sessions = IntGauge::with_opts(Opts::new(
            "palantir_relay_active_sessions",
            "Authenticated sessions currently registered",
        ))?;
        registry.register(Box::new(active_sessions.clone()))?;
        let frames_forwarded = counter(
            &registry,
            "palantir_relay_frames_forwarded_total",
            "Data frames queued to a destination",
        )?;
        let bytes_forwarded = counter(
            &registry,
            "palantir_relay_bytes_forwarded_total",
            "Data frame bytes queued to a destination",
        )?;
        let frames_dropped = counter(
            &registry,
            "palantir_relay_frames_dropped_total",
            "Data frames dropped for an offline or saturated destination",
        )?;
        let evictions = counter(
            &registry,
            "palantir_relay_evictions_total",
            "Sessions replaced by a newer connection for the same peer",
        )?;
        let protocol_violations = counter(
            &registry,
            "palantir_relay_protocol_violations_total",
            "Connections closed for sending malformed or unexpected frames",
        )?;
        let handshake_failures = counter(
            &registry,
            "palantir_relay_handshake_failures_total",
            "Connections that failed to authenticate",
        )?;

        Ok(Self {
            connections,
            active_sessions,
            frames_forwarded,
            bytes_forwarded,
            frames_dropped,
            evictions,
            protocol_violations,
            handshake_failures,
            registry,
        })
    }

    /// Record one frame handed to a destination queue.
    pub fn record_forward(&self, bytes: usize) {
        self.frames_forwarded.inc();
        self.bytes_forwarded.inc_by(bytes as u64);
    }

    /// Export in the Prometheus text format.
    pub fn export(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
    let counter = IntCounter::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}
