//! Error taxonomy of the runtime and the stable numeric result space.

use std::fmt;

use crate::engine::EngineError;

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, Error>;

/// Stable numeric result codes.
///
/// The numeric values never change; `name()` yields the `HSTR_RESULT_*`
/// spelling used in logs and by polling callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum ResultCode {
    Success = 0,
    RemoteError = 1,
    NotInitialized = 2,
    NotFound = 3,
    AlreadyFound = 4,
    OutOfRange = 5,
    DomainOutOfRange = 6,
    CpuMaskOutOfRange = 7,
    OutOfMemory = 8,
    InvalidStreamType = 9,
    OverlappingResources = 10,
    DeviceNotInitialized = 11,
    BadName = 12,
    TooManyArgs = 13,
    TimeOutReached = 14,
    EventCanceled = 15,
    InconsistentArgs = 16,
    BuffTooSmall = 17,
    MemoryOperandInconsistent = 18,
    NullPtr = 19,
    InternalError = 20,
    ResourceExhausted = 21,
    NotImplemented = 22,
    NotPermitted = 23,
}

impl ResultCode {
    /// Every code, indexed by its numeric value.
    pub const ALL: [ResultCode; 24] = [
        ResultCode::Success,
        ResultCode::RemoteError,
        ResultCode::NotInitialized,
        ResultCode::NotFound,
        ResultCode::AlreadyFound,
        ResultCode::OutOfRange,
        ResultCode::DomainOutOfRange,
        ResultCode::CpuMaskOutOfRange,
        ResultCode::OutOfMemory,
        ResultCode::InvalidStreamType,
        ResultCode::OverlappingResources,
        ResultCode::DeviceNotInitialized,
        ResultCode::BadName,
        ResultCode::TooManyArgs,
        ResultCode::TimeOutReached,
        ResultCode::EventCanceled,
        ResultCode::InconsistentArgs,
        ResultCode::BuffTooSmall,
        ResultCode::MemoryOperandInconsistent,
        ResultCode::NullPtr,
        ResultCode::InternalError,
        ResultCode::ResourceExhausted,
        ResultCode::NotImplemented,
        ResultCode::NotPermitted,
    ];

    pub const fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    pub const fn name(self) -> &'static str {
        match self {
            ResultCode::Success => "HSTR_RESULT_SUCCESS",
            ResultCode::RemoteError => "HSTR_RESULT_REMOTE_ERROR",
            ResultCode::NotInitialized => "HSTR_RESULT_NOT_INITIALIZED",
            ResultCode::NotFound => "HSTR_RESULT_NOT_FOUND",
            ResultCode::AlreadyFound => "HSTR_RESULT_ALREADY_FOUND",
            ResultCode::OutOfRange => "HSTR_RESULT_OUT_OF_RANGE",
            ResultCode::DomainOutOfRange => "HSTR_RESULT_DOMAIN_OUT_OF_RANGE",
            ResultCode::CpuMaskOutOfRange => "HSTR_RESULT_CPU_MASK_OUT_OF_RANGE",
            ResultCode::OutOfMemory => "HSTR_RESULT_OUT_OF_MEMORY",
            ResultCode::InvalidStreamType => "HSTR_RESULT_INVALID_STREAM_TYPE",
            ResultCode::OverlappingResources => "HSTR_RESULT_OVERLAPPING_RESOURCES",
            ResultCode::DeviceNotInitialized => "HSTR_RESULT_DEVICE_NOT_INITIALIZED",
            ResultCode::BadName => "HSTR_RESULT_BAD_NAME",
            ResultCode::TooManyArgs => "HSTR_RESULT_TOO_MANY_ARGS",
            ResultCode::TimeOutReached => "HSTR_RESULT_TIME_OUT_REACHED",
            ResultCode::EventCanceled => "HSTR_RESULT_EVENT_CANCELED",
            ResultCode::InconsistentArgs => "HSTR_RESULT_INCONSISTENT_ARGS",
            ResultCode::BuffTooSmall => "HSTR_RESULT_BUFF_TOO_SMALL",
            ResultCode::MemoryOperandInconsistent => "HSTR_RESULT_MEMORY_OPERAND_INCONSISTENT",
            ResultCode::NullPtr => "HSTR_RESULT_NULL_PTR",
            ResultCode::InternalError => "HSTR_RESULT_INTERNAL_ERROR",
            ResultCode::ResourceExhausted => "HSTR_RESULT_RESOURCE_EXHAUSTED",
            ResultCode::NotImplemented => "HSTR_RESULT_NOT_IMPLEMENTED",
            ResultCode::NotPermitted => "HSTR_RESULT_NOT_PERMITTED",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Name of a raw numeric result, `HSTR_RESULT_UNKNOWN` for unassigned values.
pub fn result_name(code: u32) -> &'static str {
    ResultCode::from_code(code).map_or("HSTR_RESULT_UNKNOWN", ResultCode::name)
}

/// Errors returned by runtime operations.
///
/// One variant per failure kind; the payload is a human-readable context
/// message. [`Error::code`] maps each variant onto [`ResultCode`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("remote error: {0}")]
    Remote(String),

    #[error("library not initialized: {0}")]
    NotInitialized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already found: {0}")]
    AlreadyFound(String),

    #[error("out of range: {0}")]
    OutOfRange(String),

    #[error("domain out of range: {0}")]
    DomainOutOfRange(String),

    #[error("cpu mask out of range: {0}")]
    CpuMaskOutOfRange(String),

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("overlapping resources: {0}")]
    OverlappingResources(String),

    #[error("bad name: {0}")]
    BadName(String),

    #[error("too many arguments: {0}")]
    TooManyArgs(String),

    #[error("timeout reached: {0}")]
    TimeOutReached(String),

    #[error("event canceled: {0}")]
    EventCanceled(String),

    #[error("inconsistent arguments: {0}")]
    InconsistentArgs(String),

    #[error("null pointer: {0}")]
    NullPtr(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("not permitted: {0}")]
    NotPermitted(String),
}

impl Error {
    /// Numeric result code of this error.
    pub fn code(&self) -> ResultCode {
        match self {
            Error::Remote(_) => ResultCode::RemoteError,
            Error::NotInitialized(_) => ResultCode::NotInitialized,
            Error::NotFound(_) => ResultCode::NotFound,
            Error::AlreadyFound(_) => ResultCode::AlreadyFound,
            Error::OutOfRange(_) => ResultCode::OutOfRange,
            Error::DomainOutOfRange(_) => ResultCode::DomainOutOfRange,
            Error::CpuMaskOutOfRange(_) => ResultCode::CpuMaskOutOfRange,
            Error::OutOfMemory(_) => ResultCode::OutOfMemory,
            Error::OverlappingResources(_) => ResultCode::OverlappingResources,
            Error::BadName(_) => ResultCode::BadName,
            Error::TooManyArgs(_) => ResultCode::TooManyArgs,
            Error::TimeOutReached(_) => ResultCode::TimeOutReached,
            Error::EventCanceled(_) => ResultCode::EventCanceled,
            Error::InconsistentArgs(_) => ResultCode::InconsistentArgs,
            Error::NullPtr(_) => ResultCode::NullPtr,
            Error::Internal(_) => ResultCode::InternalError,
            Error::ResourceExhausted(_) => ResultCode::ResourceExhausted,
            Error::NotImplemented(_) => ResultCode::NotImplemented,
            Error::NotPermitted(_) => ResultCode::NotPermitted,
        }
    }

    /// Map an Engine failure outside of a wait.
    ///
    /// Memory exhaustion of either kind becomes out-of-memory, a copy between
    /// overlapping regions becomes overlapping-resources, and everything else
    /// is an opaque remote error.
    pub fn from_engine(context: &str, err: EngineError) -> Self {
        let msg = format!("{context}: {err}");
        match err {
            EngineError::OutOfMemory | EngineError::ResourceExhausted => Error::OutOfMemory(msg),
            EngineError::MemoryOverlap => Error::OverlappingResources(msg),
            _ => Error::Remote(msg),
        }
    }

    /// Map an Engine failure returned by an event wait.
    pub fn from_wait(err: EngineError) -> Self {
        let msg = err.to_string();
        match err {
            EngineError::ProcessDied => Error::Remote(format!("sink-side process died: {msg}")),
            EngineError::EventCanceled => Error::EventCanceled(format!("at least one event was canceled: {msg}")),
            EngineError::TimedOut => Error::TimeOutReached(format!(
                "{msg}; consider raising the time_out_ms option"
            )),
            EngineError::OutOfRange => Error::OutOfRange(msg),
            EngineError::InvalidPointer => Error::NullPtr(msg),
            EngineError::ArgumentMismatch => Error::InconsistentArgs(msg),
            _ => Error::Internal(format!("unexpected engine result while waiting: {msg}")),
        }
    }
}
