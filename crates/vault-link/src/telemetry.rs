use serde_json::Value;

/// Usage-telemetry queue owned by the embedding application.
pub trait TelemetrySink: Send + Sync {
    fn record(&self, _event: &str, _properties: Value) {}

    /// Best-effort synchronous drain, called once on shutdown.
    fn flush_blocking(&self);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {
    fn flush_blocking(&self) {}
}
