//! Shared tracing configuration for the hstreams workspace.
//!
//! Every diagnostic the runtime emits goes through `tracing` with one of the
//! [`targets`] below, one per library info type. This crate owns how those
//! events are filtered and formatted: profile presets, environment overrides,
//! and the translation of the library's own log level / info-type bitmask
//! into `EnvFilter` directives.

pub mod performance;

#[macro_use]
pub mod macros;

use std::env;
use std::error::Error;
use std::fmt;

pub use tracing::{debug, error, info, trace, warn};

use tracing::Subscriber;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt as tracing_fmt, EnvFilter, Registry};

/// Event targets, one per info type.
pub mod targets {
    /// Entry/exit of public operations.
    pub const TRACE: &str = "hstreams::trace";
    /// Sink-side function invocation and argument decoding.
    pub const SINK_INVOKE: &str = "hstreams::sink_invoke";
    /// Buffer instantiation, allocation and release.
    pub const MEM: &str = "hstreams::mem";
    /// Events, waits and dependency bookkeeping.
    pub const SYNC: &str = "hstreams::sync";
    /// Everything else.
    pub const MISC: &str = "hstreams::misc";
}

/// Library log level, ordered from silent to most verbose.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    NoLogging = 0,
    FatalError = 1,
    Error = 2,
    Warn = 3,
    Log = 4,
    Debug1 = 5,
    Debug2 = 6,
    Debug3 = 7,
    Debug4 = 8,
}

impl LogLevel {
    /// Convert a raw numeric level, `None` when out of range.
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::NoLogging,
            1 => Self::FatalError,
            2 => Self::Error,
            3 => Self::Warn,
            4 => Self::Log,
            5 => Self::Debug1,
            6 => Self::Debug2,
            7 => Self::Debug3,
            8 => Self::Debug4,
            _ => return None,
        })
    }

    /// The `tracing` level name this library level maps to.
    pub fn directive_level(self) -> &'static str {
        match self {
            Self::NoLogging => "off",
            Self::FatalError | Self::Error => "error",
            Self::Warn => "warn",
            Self::Log => "info",
            Self::Debug1 => "debug",
            Self::Debug2 | Self::Debug3 | Self::Debug4 => "trace",
        }
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Warn
    }
}

/// Bitmask of info types that should be emitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InfoTypes(u64);

impl InfoTypes {
    pub const TRACE: Self = Self(1 << 5);
    pub const SINK_INVOKE: Self = Self(1 << 6);
    pub const MEM: Self = Self(1 << 7);
    pub const SYNC: Self = Self(1 << 8);
    pub const MISC: Self = Self(1 << 9);
    pub const ALL: Self = Self((1 << 5) | (1 << 6) | (1 << 7) | (1 << 8) | (1 << 9));
    pub const NONE: Self = Self(0);

    /// Build from raw bits. Bits outside the known info types are dropped.
    pub const fn from_bits_truncate(bits: u64) -> Self {
        Self(bits & Self::ALL.0)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Every (info type, target) pair in bit order.
    pub fn each_target() -> [(Self, &'static str); 5] {
        [
            (Self::TRACE, targets::TRACE),
            (Self::SINK_INVOKE, targets::SINK_INVOKE),
            (Self::MEM, targets::MEM),
            (Self::SYNC, targets::SYNC),
            (Self::MISC, targets::MISC),
        ]
    }
}

impl Default for InfoTypes {
    fn default() -> Self {
        Self::ALL
    }
}

impl std::ops::BitOr for InfoTypes {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Compile a library level and info-type mask into `EnvFilter` directives.
///
/// Disabled info types get an explicit `off` so that a permissive default
/// directive does not let them through.
pub fn library_directives(level: LogLevel, info_types: InfoTypes) -> String {
    InfoTypes::each_target()
        .iter()
        .map(|(info_type, target)| {
            let lvl = if info_types.contains(*info_type) {
                level.directive_level()
            } else {
                "off"
            };
            format!("{target}={lvl}")
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Configuration describing how the shared tracing subscriber should behave.
#[derive(Clone, Debug)]
pub struct TracingConfig {
    /// Explicit directives (e.g. `hstreams::sync=debug,info`). When absent
    /// `RUST_LOG` is consulted, then [`TracingConfig::default_directive`].
    pub directives: Option<String>,
    /// Fallback directive used when neither `directives` nor `RUST_LOG`
    /// resolve to a valid filter.
    pub default_directive: String,
    /// Controls whether event targets appear in output.
    pub include_targets: bool,
    /// Controls ANSI formatting.
    pub ansi: bool,
    /// Span lifecycle events to emit.
    pub span_events: FmtSpan,
    /// Output format for the formatter layer.
    pub output: TracingOutput,
    /// When false, performance spans are no-ops.
    pub enable_performance_tracing: bool,
    /// Minimum duration in microseconds for a performance span to be logged.
    pub performance_threshold_us: Option<u64>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::for_local()
    }
}

impl TracingConfig {
    /// Pretty, ANSI-enabled output for local development.
    pub fn for_local() -> Self {
        Self {
            directives: None,
            default_directive: "warn".to_string(),
            include_targets: true,
            ansi: true,
            span_events: FmtSpan::NONE,
            output: TracingOutput::Pretty,
            enable_performance_tracing: cfg!(debug_assertions),
            performance_threshold_us: None,
        }
    }

    /// JSON output without colour codes for CI and log collectors.
    pub fn for_ci() -> Self {
        Self {
            directives: None,
            default_directive: "warn".to_string(),
            include_targets: true,
            ansi: false,
            span_events: FmtSpan::NONE,
            output: TracingOutput::Json,
            enable_performance_tracing: false,
            performance_threshold_us: None,
        }
    }

    /// JSON output with span events and debug directives for the core.
    pub fn for_performance() -> Self {
        Self {
            directives: Some("hstreams_core=debug,hstreams::sync=debug,hstreams::mem=debug".to_string()),
            default_directive: "info".to_string(),
            include_targets: true,
            ansi: false,
            span_events: FmtSpan::ENTER | FmtSpan::EXIT | FmtSpan::CLOSE,
            output: TracingOutput::Json,
            enable_performance_tracing: true,
            performance_threshold_us: None,
        }
    }

    /// Build a configuration using environment hints.
    ///
    /// # Environment Variables
    ///
    /// - `HSTREAMS_TRACING_PROFILE` - `local` (default), `ci`, or `performance`
    /// - `HSTREAMS_TRACING_DIRECTIVES` - overrides tracing directives
    /// - `HSTREAMS_TRACING_FORMAT` - `pretty`, `compact`, or `json`
    /// - `HSTREAMS_PERF_TRACING` - `true`/`1`/`yes` enables performance spans
    /// - `HSTREAMS_PERF_THRESHOLD_US` - minimum span duration to log
    pub fn from_env() -> Self {
        let profile = env::var("HSTREAMS_TRACING_PROFILE")
            .unwrap_or_else(|_| "local".to_string())
            .to_ascii_lowercase();

        let mut config = match profile.as_str() {
            "ci" => Self::for_ci(),
            "performance" => Self::for_performance(),
            _ => Self::for_local(),
        };

        if let Ok(directives) = env::var("HSTREAMS_TRACING_DIRECTIVES") {
            if !directives.trim().is_empty() {
                config.directives = Some(directives);
            }
        }

        if let Ok(format) = env::var("HSTREAMS_TRACING_FORMAT") {
            if let Some(parsed) = TracingOutput::from_env_value(&format) {
                config.output = parsed;
                if matches!(config.output, TracingOutput::Json) {
                    config.ansi = false;
                }
            }
        }

        if let Ok(perf_tracing) = env::var("HSTREAMS_PERF_TRACING") {
            config.enable_performance_tracing = perf_tracing.eq_ignore_ascii_case("true")
                || perf_tracing == "1"
                || perf_tracing.eq_ignore_ascii_case("yes");
        }

        if let Ok(threshold) = env::var("HSTREAMS_PERF_THRESHOLD_US") {
            if let Ok(threshold_us) = threshold.parse::<u64>() {
                config.performance_threshold_us = Some(threshold_us);
            }
        }

        config
    }

    /// Append the directives of a library log level / info-type mask.
    ///
    /// Explicit directives already present keep precedence for targets they
    /// name because `EnvFilter` applies the most specific match.
    pub fn with_library_level(mut self, level: LogLevel, info_types: InfoTypes) -> Self {
        let library = library_directives(level, info_types);
        self.directives = Some(match self.directives.take() {
            Some(existing) if !existing.trim().is_empty() => format!("{library},{existing}"),
            _ => format!("{},{library}", self.default_directive),
        });
        self
    }

    fn resolve_filter(&self) -> Result<EnvFilter, TracingSetupError> {
        if let Some(directives) = &self.directives {
            EnvFilter::try_new(directives).map_err(|err| TracingSetupError::InvalidFilter(err.to_string()))
        } else {
            match EnvFilter::try_from_default_env() {
                Ok(filter) => Ok(filter),
                Err(_) => Ok(EnvFilter::new(self.default_directive.clone())),
            }
        }
    }
}

/// Errors surfaced when configuring the shared tracing subscriber fails.
#[derive(Debug)]
pub enum TracingSetupError {
    /// The directive string could not be parsed.
    InvalidFilter(String),
    /// Installing the global subscriber failed (usually one is already set).
    SubscriberInit(tracing_subscriber::util::TryInitError),
}

impl fmt::Display for TracingSetupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TracingSetupError::InvalidFilter(msg) => {
                write!(f, "invalid tracing directive: {msg}")
            }
            TracingSetupError::SubscriberInit(err) => {
                write!(f, "failed to install global tracing subscriber: {err}")
            }
        }
    }
}

impl Error for TracingSetupError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TracingSetupError::SubscriberInit(err) => Some(err),
            _ => None,
        }
    }
}

/// Build a `tracing` subscriber using the provided configuration.
pub fn build_subscriber(config: &TracingConfig) -> Result<impl Subscriber + Send + Sync, TracingSetupError> {
    let (filter, fmt_layer) = subscriber_layers(config)?;
    Ok(Registry::default().with(fmt_layer).with(filter))
}

/// Build the filter and formatting layers for external composition.
pub fn subscriber_layers(
    config: &TracingConfig,
) -> Result<(EnvFilter, Box<dyn Layer<Registry> + Send + Sync>), TracingSetupError> {
    let filter = config.resolve_filter()?;
    let span_events = config.span_events.clone();

    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.output {
        TracingOutput::Compact => Box::new(
            tracing_fmt::layer()
                .compact()
                .with_target(config.include_targets)
                .with_ansi(config.ansi)
                .with_thread_names(true)
                .with_span_events(span_events),
        ),
        TracingOutput::Pretty => Box::new(
            tracing_fmt::layer()
                .pretty()
                .with_target(config.include_targets)
                .with_ansi(config.ansi)
                .with_thread_names(true)
                .with_span_events(span_events),
        ),
        TracingOutput::Json => Box::new(
            tracing_fmt::layer()
                .json()
                .with_target(config.include_targets)
                .with_thread_names(true)
                .with_span_events(span_events)
                .with_ansi(false),
        ),
    };

    Ok((filter, layer))
}

/// Install the configured subscriber as the process-wide default.
pub fn init_global_tracing(config: &TracingConfig) -> Result<(), TracingSetupError> {
    build_subscriber(config)?
        .try_init()
        .map_err(TracingSetupError::SubscriberInit)
}

/// Output format choices for the tracing formatter layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TracingOutput {
    Compact,
    Pretty,
    Json,
}

impl TracingOutput {
    fn from_env_value(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Some(Self::Compact),
            "pretty" => Some(Self::Pretty),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}
