//! Best-effort metrics emission through a narrow sink interface.
//!
//! The core never talks to a metrics backend directly: it holds an
//! `Arc<dyn MetricsSink>` and emits named samples through it. The default
//! sink discards everything, so running without metrics costs two virtual
//! calls per sample and can never block or fail a core operation. The
//! binary installs [`RecorderSink`] backed by the `metrics` facade and a
//! prometheus exporter when a metrics address is configured.

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Narrow interface the core emits samples through. Implementations must
/// be cheap and infallible; a sink failure is the sink's problem.
pub trait MetricsSink: Send + Sync + 'static {
    /// Adds `value` to a named monotonic counter.
    fn incr_counter(&self, name: &'static str, value: u64);

    /// Sets a named gauge to `value`.
    fn set_gauge(&self, name: &'static str, value: f64);
}

/// Discards every sample. The default when no metrics address is set.
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn incr_counter(&self, _name: &'static str, _value: u64) {}
    fn set_gauge(&self, _name: &'static str, _value: f64) {}
}

/// Forwards samples into the `metrics` facade's global recorder.
pub struct RecorderSink;

impl MetricsSink for RecorderSink {
    fn incr_counter(&self, name: &'static str, value: u64) {
        metrics::counter!(name).increment(value);
    }

    fn set_gauge(&self, name: &'static str, value: f64) {
        metrics::gauge!(name).set(value);
    }
}

/// Installs the prometheus recorder with its built-in HTTP listener.
///
/// Called once from the binary during startup; samples emitted through
/// [`RecorderSink`] afterwards show up on `http://{addr}/metrics`.
pub fn install_prometheus(addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("failed to install prometheus exporter: {e}"))
}

// sample names emitted by the core, kept in one place
pub const SESSIONS_ACCEPTED: &str = "shoal_sessions_accepted_total";
pub const SESSIONS_ACTIVE: &str = "shoal_sessions_active";
pub const COMMANDS_FORWARDED: &str = "shoal_commands_forwarded_total";
pub const COMMANDS_REJECTED: &str = "shoal_commands_rejected_total";
pub const BACKEND_ERRORS: &str = "shoal_backend_errors_total";
pub const POOLS_LIVE: &str = "shoal_pools_live";
pub const PUBSUB_MESSAGES: &str = "shoal_pubsub_messages_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_sink_accepts_samples() {
        let sink = NoopSink;
        sink.incr_counter(COMMANDS_FORWARDED, 1);
        sink.set_gauge(SESSIONS_ACTIVE, 3.0);
    }

    #[test]
    fn sink_is_object_safe() {
        let sink: std::sync::Arc<dyn MetricsSink> = std::sync::Arc::new(NoopSink);
        sink.incr_counter(SESSIONS_ACCEPTED, 1);
    }
}
