//! Performance instrumentation: threshold-filtered timing spans and a few
//! standard events for the runtime's hot paths.
//!
//! ```rust
//! use hstreams_tracing::performance::{record_transfer, PerformanceSpan};
//!
//! let span = PerformanceSpan::new("enqueue_transfer", Some(100));
//! // ... do work ...
//! drop(span); // logged only if it took at least 100µs
//!
//! record_transfer(4096, "src_to_sink", 25);
//! ```

use std::time::Instant;
use tracing::Level;

use crate::targets;

/// RAII guard that measures its own lifetime and logs it on drop when the
/// optional threshold is met.
pub struct PerformanceSpan {
    name: String,
    threshold_us: Option<u64>,
    start_time: Instant,
    span: tracing::Span,
}

impl PerformanceSpan {
    /// Create a span at debug level; `threshold_us = None` always logs.
    pub fn new(span_name: impl Into<String>, threshold_us: Option<u64>) -> Self {
        Self::with_level(Level::DEBUG, span_name, threshold_us)
    }

    /// Create a span at the given level.
    pub fn with_level(level: Level, span_name: impl Into<String>, threshold_us: Option<u64>) -> Self {
        let name = span_name.into();
        let span = match level {
            Level::TRACE => tracing::trace_span!("perf", name = %name),
            Level::DEBUG => tracing::debug_span!("perf", name = %name),
            Level::INFO => tracing::info_span!("perf", name = %name),
            Level::WARN => tracing::warn_span!("perf", name = %name),
            Level::ERROR => tracing::error_span!("perf", name = %name),
        };

        Self {
            name,
            threshold_us,
            start_time: Instant::now(),
            span,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn elapsed_us(&self) -> u64 {
        self.start_time.elapsed().as_micros() as u64
    }

    /// Enter this span's context.
    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }
}

impl Drop for PerformanceSpan {
    fn drop(&mut self) {
        let elapsed_us = self.elapsed_us();
        if self.threshold_us.map_or(true, |t| elapsed_us >= t) {
            let _entered = self.span.enter();
            tracing::debug!(
                duration_us = elapsed_us,
                duration_ms = elapsed_us as f64 / 1000.0,
                "performance_span_complete"
            );
        }
    }
}

/// Record a buffer instantiation in one logical domain.
pub fn record_instantiation(size_bytes: u64, kind: &str, padding: u64, duration_us: u64) {
    tracing::debug!(
        target: targets::MEM,
        event = "instantiation",
        size_bytes = size_bytes,
        kind = kind,
        padding = padding,
        duration_us = duration_us,
        "buffer_instantiation"
    );
}

/// Record a data transfer with its bandwidth.
pub fn record_transfer(bytes: u64, direction: &str, duration_us: u64) {
    let bandwidth_mbps = if duration_us > 0 {
        (bytes as f64 / duration_us as f64) * 1_000_000.0 / (1024.0 * 1024.0)
    } else {
        0.0
    };

    tracing::debug!(
        target: targets::MEM,
        event = "transfer",
        bytes = bytes,
        direction = direction,
        duration_us = duration_us,
        bandwidth_mbps = bandwidth_mbps,
        "data_transfer"
    );
}

/// Record a completed wait on a set of events.
pub fn record_wait(num_events: usize, num_signaled: usize, duration_us: u64) {
    tracing::debug!(
        target: targets::SYNC,
        event = "wait",
        num_events = num_events,
        num_signaled = num_signaled,
        duration_us = duration_us,
        "event_wait"
    );
}
