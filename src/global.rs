//! Process-wide runtime slot, pending configuration and the last-error
//! record.
//!
//! ## Thread Safety
//!
//! The runtime lives behind an `RwLock<Option<Arc<Runtime>>>`. Operations
//! clone the `Arc` and release the lock before doing any work, so `fini`
//! never waits on an in-flight enqueue; the runtime is torn down when the
//! last clone goes away.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use hstreams_core::{Engine, Error, Options, Result, ResultCode, Runtime, SinkRegistry};
use hstreams_tracing::{targets, InfoTypes, LogLevel, TracingConfig};

static LAST_ERROR: AtomicU32 = AtomicU32::new(0);

#[derive(Debug, Clone, Copy, Default)]
struct LogSettings {
    level: LogLevel,
    info_types: InfoTypes,
}

lazy_static::lazy_static! {
    static ref RUNTIME: RwLock<Option<Arc<Runtime>>> = RwLock::new(None);

    /// Options the next `init` will use.
    static ref PENDING_OPTIONS: RwLock<Options> = RwLock::new(Options::from_env());

    static ref LOG_SETTINGS: RwLock<LogSettings> = RwLock::new(LogSettings::default());
}

/// Store the code of a failed result in the last-error slot.
pub(crate) fn record<T>(result: Result<T>) -> Result<T> {
    if let Err(err) = &result {
        LAST_ERROR.store(err.code().code(), Ordering::SeqCst);
        tracing::debug!(target: targets::TRACE, code = %err.code(), error = %err, "call failed");
    }
    result
}

/// Run `f` against the live runtime, recording any failure.
pub(crate) fn with_runtime<T>(f: impl FnOnce(&Runtime) -> Result<T>) -> Result<T> {
    let runtime = RUNTIME.read().clone();
    record(match runtime {
        Some(rt) => f(&rt),
        None => Err(Error::NotInitialized("call init first".to_string())),
    })
}

/// Most recent failure code recorded by any thread; `Success` when none.
pub fn last_error() -> ResultCode {
    ResultCode::from_code(LAST_ERROR.load(Ordering::SeqCst)).unwrap_or(ResultCode::InternalError)
}

pub fn clear_last_error() {
    LAST_ERROR.store(ResultCode::Success.code(), Ordering::SeqCst);
}

pub fn is_initialized() -> bool {
    RUNTIME.read().is_some()
}

/// Initialize over a loopback engine built from the pending options.
///
/// Calling it again while initialized is a no-op.
pub fn init() -> Result<()> {
    install(|options| Runtime::loopback(options))
}

/// Initialize over a caller-provided engine and sink registry.
pub fn init_with_engine(engine: Arc<dyn Engine>, registry: Arc<SinkRegistry>) -> Result<()> {
    install(move |options| Runtime::new(engine, registry, options))
}

fn install(build: impl FnOnce(Options) -> Result<Runtime>) -> Result<()> {
    let mut slot = RUNTIME.write();
    if slot.is_some() {
        return Ok(());
    }
    install_tracing();
    let options = PENDING_OPTIONS.read().clone();
    let runtime = record(build(options))?;
    *slot = Some(Arc::new(runtime));
    Ok(())
}

fn install_tracing() {
    let settings = *LOG_SETTINGS.read();
    let config = TracingConfig::from_env().with_library_level(settings.level, settings.info_types);
    if let Err(err) = hstreams_tracing::init_global_tracing(&config) {
        tracing::debug!(target: targets::MISC, error = %err, "keeping the existing tracing subscriber");
    }
}

/// Tear the runtime down: streams drain, then buffers and domains go.
///
/// Succeeds when nothing is initialized.
pub fn fini() -> Result<()> {
    let runtime = RUNTIME.write().take();
    if let Some(rt) = runtime {
        if Arc::strong_count(&rt) > 1 {
            tracing::warn!(target: targets::MISC, "runtime still in use; teardown deferred to the last caller");
        }
        drop(rt);
    }
    Ok(())
}

/// Replace the options the next `init` will use.
pub fn set_options(options: Options) -> Result<()> {
    record((|| {
        if is_initialized() {
            return Err(Error::NotPermitted("options cannot change after init".to_string()));
        }
        options.validate()?;
        *PENDING_OPTIONS.write() = options;
        Ok(())
    })())
}

/// The live snapshot when initialized, otherwise the pending options.
pub fn current_options() -> Options {
    match RUNTIME.read().as_ref() {
        Some(rt) => rt.options().as_ref().clone(),
        None => PENDING_OPTIONS.read().clone(),
    }
}

/// Set the library log level (0 = no logging .. 8 = most verbose).
pub fn set_log_level(raw: u32) -> Result<()> {
    record((|| {
        if is_initialized() {
            return Err(Error::NotPermitted("log level cannot change after init".to_string()));
        }
        let level = LogLevel::from_raw(raw).ok_or_else(|| Error::OutOfRange(format!("log level {raw}")))?;
        LOG_SETTINGS.write().level = level;
        Ok(())
    })())
}

/// Choose which info types are logged. Unknown bits are ignored.
pub fn set_log_info_types(bits: u64) -> Result<()> {
    record((|| {
        if is_initialized() {
            return Err(Error::NotPermitted("info types cannot change after init".to_string()));
        }
        LOG_SETTINGS.write().info_types = InfoTypes::from_bits_truncate(bits);
        Ok(())
    })())
}

/// Registry the live runtime resolves sink functions in.
pub fn sink_registry() -> Result<Arc<SinkRegistry>> {
    with_runtime(|rt| Ok(Arc::clone(rt.registry())))
}
