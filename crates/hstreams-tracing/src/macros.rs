//! Convenience macros for performance tracing.

/// Create a [`crate::performance::PerformanceSpan`] guard, optionally with
/// extra fields recorded on an enclosing debug span.
///
/// ```rust
/// use hstreams_tracing::perf_span;
///
/// {
///     let _span = perf_span!("enqueue_function", args = 4);
///     // ... operation code ...
/// }
/// ```
#[macro_export]
macro_rules! perf_span {
    ($name:expr) => {{
        $crate::performance::PerformanceSpan::new($name, None)
    }};
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {{
        let _span = tracing::debug_span!(
            "perf",
            name = $name,
            $($field = $value),+
        ).entered();
        $crate::performance::PerformanceSpan::new($name, None)
    }};
}

/// Like [`perf_span!`] but only logs when the span lasts at least
/// `threshold_us` microseconds.
#[macro_export]
macro_rules! perf_span_threshold {
    ($name:expr, $threshold_us:expr) => {{
        $crate::performance::PerformanceSpan::new($name, Some($threshold_us))
    }};
    ($name:expr, $threshold_us:expr, $($field:tt = $value:expr),+ $(,)?) => {{
        let _span = tracing::debug_span!(
            "perf",
            name = $name,
            $($field = $value),+
        ).entered();
        $crate::performance::PerformanceSpan::new($name, Some($threshold_us))
    }};
}

/// Emit a debug-level performance event.
///
/// ```rust
/// use hstreams_tracing::perf_event;
///
/// perf_event!("pending_actions_pruned", before = 100, after = 3);
/// ```
#[macro_export]
macro_rules! perf_event {
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {
        tracing::debug!(
            event = $name,
            $($field = $value),+
        );
    };
}

/// Run a block and return `(result, duration_us)`.
///
/// ```rust
/// use hstreams_tracing::timed_block;
///
/// let (sum, _us) = timed_block!("sum", { (1..=10).sum::<i32>() });
/// assert_eq!(sum, 55);
/// ```
#[macro_export]
macro_rules! timed_block {
    ($name:expr, $block:block) => {{
        let start = std::time::Instant::now();
        let result = $block;
        let duration_us = start.elapsed().as_micros() as u64;
        tracing::debug!(
            operation = $name,
            duration_us = duration_us,
            "timed_block_complete"
        );
        (result, duration_us)
    }};
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    #[test]
    fn perf_span_with_and_without_fields() {
        let _a = perf_span!("plain");
        let _b = perf_span!("with_fields", bytes = 1024, stream = 3);
    }

    #[test]
    fn perf_span_threshold_forms() {
        let _a = perf_span_threshold!("threshold", 1000);
        let _b = perf_span_threshold!("threshold_fields", 1000, bytes = 64);
    }

    #[test]
    fn perf_event_emits() {
        perf_event!("pruned", before = 100, after = 0);
    }

    #[test]
    fn timed_block_returns_value_and_duration() {
        let (result, duration_us) = timed_block!("sleep", {
            thread::sleep(Duration::from_millis(5));
            7
        });
        assert_eq!(result, 7);
        assert!(duration_us >= 5_000);
    }
}
