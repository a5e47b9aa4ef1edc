use prometheus::{Encoder, Histogram, HistogramOpts, IntGauge, Registry, TextEncoder};

/// Component counters and latency histograms, exposed at `/metrics`.
pub struct Metrics {
    registry: Registry,
    pub sessions: IntGauge,
    pub producers: IntGauge,
    pub consumers: IntGauge,
    pub transports: IntGauge,
    pub routers: IntGauge,
    pub workers_live: IntGauge,
    pub rooms: IntGauge,
    pub recordings_active: IntGauge,
    pub db_latency: Histogram,
    pub store_latency: Histogram,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let sessions = IntGauge::new("connect_signaling_sessions", "Connected signaling sessions")?;
        let producers = IntGauge::new("connect_producers", "Local media producers")?;
        let consumers = IntGauge::new("connect_consumers", "Local media consumers")?;
        let transports = IntGauge::new("connect_transports", "Local WebRTC transports")?;
        let routers = IntGauge::new("connect_routers", "Local routers")?;
        let workers_live = IntGauge::new("connect_workers_live", "Live media workers")?;
        let rooms = IntGauge::new("connect_rooms", "Rooms assigned to this server")?;
        let recordings_active =
            IntGauge::new("connect_recordings_active", "Active composite recordings")?;
        let db_latency = Histogram::with_opts(HistogramOpts::new(
            "connect_db_call_seconds",
            "Database call latency",
        ))?;
        let store_latency = Histogram::with_opts(HistogramOpts::new(
            "connect_store_call_seconds",
            "Shared-store call latency",
        ))?;

        registry.register(Box::new(sessions.clone()))?;
        registry.register(Box::new(producers.clone()))?;
        registry.register(Box::new(consumers.clone()))?;
        registry.register(Box::new(transports.clone()))?;
        registry.register(Box::new(routers.clone()))?;
        registry.register(Box::new(workers_live.clone()))?;
        registry.register(Box::new(rooms.clone()))?;
        registry.register(Box::new(recordings_active.clone()))?;
        registry.register(Box::new(db_latency.clone()))?;
        registry.register(Box::new(store_latency.clone()))?;

        Ok(Self {
            registry,
            sessions,
            producers,
            consumers,
            transports,
            routers,
            workers_live,
            rooms,
            recordings_active,
            db_latency,
            store_latency,
        })
    }

    pub fn export(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&self.registry.gather(), &mut buf).is_err() {
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_contains_registered_gauges() {
        let metrics = Metrics::new().unwrap();
        metrics.sessions.set(3);
        let out = metrics.export();
        assert!(out.contains("connect_signaling_sessions 3"));
    }
}
