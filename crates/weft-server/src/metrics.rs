//! Process-wide prometheus metrics for the multiplexer.
//!
//! Counters are global so every server in the process reports into the same
//! registry; [`Metrics::render`] produces the prometheus text format.

use std::sync::OnceLock;

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

/// Metric handles.
pub struct Metrics {
    registry: Registry,
    /// Sockets accepted and registered.
    pub connections_accepted: IntCounter,
    /// Connections removed from the registry.
    pub connections_closed: IntCounter,
    /// Accepted sockets that could not be registered.
    pub registration_failures: IntCounter,
    /// Frames handed to the application.
    pub frames: IntCounter,
    /// Drains that ended in an error other than end of stream.
    pub frame_errors: IntCounter,
    /// Currently registered connections.
    pub connections_active: IntGauge,
    /// Currently running connection workers.
    pub workers_active: IntGauge,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

impl Metrics {
    /// Returns the process-wide metrics.
    pub fn global() -> &'static Metrics {
        METRICS.get_or_init(Metrics::new)
    }

    fn new() -> Self {
        let registry = Registry::new();

        let connections_accepted = counter(
            &registry,
            "weft_connections_accepted_total",
            "Connections accepted and registered",
        );
        let connections_closed = counter(
            &registry,
            "weft_connections_closed_total",
            "Connections removed from the registry",
        );
        let registration_failures = counter(
            &registry,
            "weft_registration_failures_total",
            "Accepted sockets that failed poll registration",
        );
        let frames = counter(&registry, "weft_frames_total", "Frames delivered to the handler");
        let frame_errors = counter(
            &registry,
            "weft_frame_errors_total",
            "Connection drains that failed",
        );
        let connections_active = gauge(
            &registry,
            "weft_connections_active",
            "Currently registered connections",
        );
        let workers_active = gauge(
            &registry,
            "weft_workers_active",
            "Currently running connection workers",
        );

        Self {
            registry,
            connections_accepted,
            connections_closed,
            registration_failures,
            frames,
            frame_errors,
            connections_active,
            workers_active,
        }
    }

    /// Renders all metrics in the prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut out = Vec::new();
        let families = self.registry.gather();
        if let Err(e) = TextEncoder::new().encode(&families, &mut out) {
            tracing::warn!(error = %e, "failed to encode metrics");
        }
        String::from_utf8_lossy(&out).into_owned()
    }
}

// Names and help strings are fixed literals, so construction cannot fail.
fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let c = IntCounter::new(name, help).expect("valid counter definition");
    registry
        .register(Box::new(c.clone()))
        .expect("counter registered once");
    c
}

fn gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let g = IntGauge::new(name, help).expect("valid gauge definition");
    registry
        .register(Box::new(g.clone()))
        .expect("gauge registered once");
    g
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_is_a_singleton() {
        assert!(std::ptr::eq(Metrics::global(), Metrics::global()));
    }

    #[test]
    fn render_lists_every_metric() {
        let metrics = Metrics::global();
        metrics.frames.inc();

        let text = metrics.render();
        for name in [
            "weft_connections_accepted_total",
            "weft_connections_closed_total",
            "weft_registration_failures_total",
            "weft_frames_total",
            "weft_frame_errors_total",
            "weft_connections_active",
            "weft_workers_active",
        ] {
            assert!(text.contains(name), "missing {name}");
        }
    }
}
