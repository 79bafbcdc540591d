//! Offload Engine boundary.
//!
//! The runtime drives every remote effect (pipelines, buffers, copies,
//! events, library loading) through the object-safe [`Engine`] trait. The
//! in-process [`LoopbackEngine`] emulates accelerator domains with host
//! threads and host memory.

mod loopback;

pub use loopback::LoopbackEngine;

use crate::config::Timeout;
use crate::cpu_mask::CpuMask;
use crate::sink::ReturnValue;
use crate::types::{EngineBufferHandle, Event, Isa, PhysDomainId, PipelineHandle, WaitOutcome};

/// Result type of Engine calls
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Failures reported by the Engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("sink-side process died")]
    ProcessDied,

    #[error("event canceled")]
    EventCanceled,

    #[error("timed out")]
    TimedOut,

    #[error("out of memory")]
    OutOfMemory,

    #[error("resource exhausted")]
    ResourceExhausted,

    #[error("memory regions overlap")]
    MemoryOverlap,

    #[error("argument out of range")]
    OutOfRange,

    #[error("invalid pointer or handle")]
    InvalidPointer,

    #[error("argument mismatch")]
    ArgumentMismatch,

    #[error("does not exist")]
    DoesNotExist,

    #[error("engine failure: {0}")]
    Failed(String),
}

/// Static description of one accelerator reported by the Engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineInfo {
    pub isa: Isa,
    pub num_threads: u32,
    pub core_max_freq_mhz: u32,
    pub physical_memory: u64,
}

/// Creation flags for Engine buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineBufferFlags {
    /// Wrapped memory is not pinned for DMA.
    pub no_dma: bool,
    /// Request huge-page backing.
    pub huge_pages: bool,
}

/// The offload transport.
///
/// Every call is synchronous and fallible. Asynchronous work (function
/// runs, copies, marker writes) returns a completion [`Event`] that becomes
/// signaled once the work and all of its `deps` have completed. Work whose
/// dependency was canceled is itself canceled.
pub trait Engine: Send + Sync {
    /// Number of accelerators this Engine can drive.
    fn engine_count(&self) -> u32;

    fn engine_info(&self, index: u32) -> EngineResult<EngineInfo>;

    /// Load a named library into an accelerator's sink process.
    fn load_library(&self, domain: PhysDomainId, name: &str) -> EngineResult<()>;

    /// Resolve a sink function by name. `Ok(None)` when no loaded library
    /// exports it.
    fn lookup_function(&self, domain: PhysDomainId, name: &str) -> EngineResult<Option<u64>>;

    fn create_pipeline(&self, domain: PhysDomainId, mask: &CpuMask) -> EngineResult<PipelineHandle>;

    fn destroy_pipeline(&self, pipeline: PipelineHandle) -> EngineResult<()>;

    /// Run the marshalled argument block in a pipeline.
    fn run_function(
        &self,
        pipeline: PipelineHandle,
        args: &[u64],
        deps: &[Event],
        ret: Option<ReturnValue>,
    ) -> EngineResult<Event>;

    /// Allocate a fresh buffer owned by the Engine.
    fn create_buffer(
        &self,
        domain: PhysDomainId,
        len: u64,
        flags: EngineBufferFlags,
    ) -> EngineResult<EngineBufferHandle>;

    /// Wrap existing memory. The memory must outlive the buffer.
    fn create_buffer_from_memory(
        &self,
        domain: PhysDomainId,
        addr: u64,
        len: u64,
        flags: EngineBufferFlags,
    ) -> EngineResult<EngineBufferHandle>;

    fn destroy_buffer(&self, buffer: EngineBufferHandle) -> EngineResult<()>;

    /// Mark a buffer's contents valid or invalid on one endpoint.
    fn set_buffer_state(
        &self,
        buffer: EngineBufferHandle,
        endpoint: PhysDomainId,
        valid: bool,
    ) -> EngineResult<()>;

    fn add_buffer_ref(&self, buffer: EngineBufferHandle, domain: PhysDomainId, delta: i32) -> EngineResult<()>;

    /// Sink-side start address of a buffer.
    fn sink_address(&self, buffer: EngineBufferHandle, domain: PhysDomainId) -> EngineResult<u64>;

    #[allow(clippy::too_many_arguments)]
    fn copy(
        &self,
        dst: EngineBufferHandle,
        src: EngineBufferHandle,
        dst_offset: u64,
        src_offset: u64,
        len: u64,
        deps: &[Event],
    ) -> EngineResult<Event>;

    /// A 1-byte dummy write whose only purpose is to carry dependencies.
    fn write_marker(&self, deps: &[Event]) -> EngineResult<Event>;

    /// Wait for all (or any) of `events`.
    ///
    /// `TimedOut` when the condition is not met in time, `EventCanceled`
    /// when a waited-on event was canceled.
    fn wait(&self, events: &[Event], wait_all: bool, timeout: Timeout) -> EngineResult<WaitOutcome>;

    fn register_user_event(&self) -> EngineResult<Event>;

    fn signal_user_event(&self, event: Event) -> EngineResult<()>;

    fn cancel_user_event(&self, event: Event) -> EngineResult<()>;
}
