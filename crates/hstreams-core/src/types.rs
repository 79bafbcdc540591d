//! Identifiers, handles and small value types shared across the runtime.

use std::fmt;
use std::ops::BitOr;

use serde::{Deserialize, Serialize};

/// Cache line size used for sink-side buffer padding.
pub const CACHE_LINE_SIZE: u64 = 64;

/// Maximum size in bytes of a sink function's return value.
pub const RETURN_SIZE_LIMIT: usize = 64;

/// Names of sink functions must be strictly shorter than this.
pub const MAX_FUNC_NAME_SIZE: usize = 80;

/// Size of the per-invocation argument block handed to the Engine.
pub const MISC_DATA_SIZE: usize = 4096;

/// Upper bound on marshalled words that fit the argument block.
pub const ARGS_SUPPORTED: usize = (MISC_DATA_SIZE - MAX_FUNC_NAME_SIZE) / std::mem::size_of::<u64>();

/// Number of scalar + heap arguments an invocation may carry.
pub const ARGS_IMPLEMENTED: usize = 19;

/// ID of a physical domain. `-1` is the host; accelerators count from 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PhysDomainId(pub i32);

impl PhysDomainId {
    pub const HOST: PhysDomainId = PhysDomainId(-1);

    pub const fn new(id: i32) -> Self {
        PhysDomainId(id)
    }

    pub const fn id(self) -> i32 {
        self.0
    }

    pub const fn is_host(self) -> bool {
        self.0 == Self::HOST.0
    }
}

impl fmt::Display for PhysDomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_host() {
            write!(f, "phys(host)")
        } else {
            write!(f, "phys{}", self.0)
        }
    }
}

/// ID of a logical domain. `0` is the source domain, created at init.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogDomainId(pub u32);

impl LogDomainId {
    pub const SOURCE: LogDomainId = LogDomainId(0);

    pub const fn new(id: u32) -> Self {
        LogDomainId(id)
    }

    pub const fn id(self) -> u32 {
        self.0
    }

    pub const fn is_source(self) -> bool {
        self.0 == Self::SOURCE.0
    }
}

impl fmt::Display for LogDomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "logdom{}", self.0)
    }
}

/// User-chosen ID of a logical stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogStreamId(pub u32);

impl LogStreamId {
    pub const fn new(id: u32) -> Self {
        LogStreamId(id)
    }

    pub const fn id(self) -> u32 {
        self.0
    }
}

impl fmt::Display for LogStreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream{}", self.0)
    }
}

/// Completion event issued by the Engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Event(pub u64);

impl Event {
    pub const fn new(id: u64) -> Self {
        Event(id)
    }

    pub const fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event{}", self.0)
    }
}

/// Engine execution pipeline bound to a CPU mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineHandle(pub u64);

impl PipelineHandle {
    pub const fn new(id: u64) -> Self {
        PipelineHandle(id)
    }

    pub const fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PipelineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pipe{}", self.0)
    }
}

/// Engine-level memory buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EngineBufferHandle(pub u64);

impl EngineBufferHandle {
    pub const fn new(id: u64) -> Self {
        EngineBufferHandle(id)
    }

    pub const fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EngineBufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ebuf{}", self.0)
    }
}

/// How a queried mask or address range relates to existing resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Overlap {
    NoOverlap,
    Exact,
    Partial,
}

/// Instruction set of a physical domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Isa {
    Invalid,
    X86_64,
    Mic,
    Knf,
    Knc,
    Knl,
}

/// Direction of a transfer relative to the stream's endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum XferDirection {
    SinkToSrc,
    SrcToSink,
}

/// Kind of memory a buffer should live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemType {
    Any,
    Normal,
    HighBandwidth,
}

/// What to do when the requested memory type is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AllocPolicy {
    Preferred,
    Strict,
}

/// Buffer property flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BufferFlags(u32);

impl BufferFlags {
    pub const NONE: BufferFlags = BufferFlags(0);
    /// Instantiations in logical domains of the same physical domain share storage.
    pub const ALIASED: BufferFlags = BufferFlags(1);
    /// The source instantiation is pinned at creation.
    pub const SRC_PINNED: BufferFlags = BufferFlags(2);
    /// Newly added logical domains get an instantiation automatically.
    pub const INCREMENTAL: BufferFlags = BufferFlags(4);
    /// First touch bound to the logical domain's CPUs. Not implemented.
    pub const AFFINITIZED: BufferFlags = BufferFlags(8);
    /// First bit that is not a flag.
    pub const INVALID: BufferFlags = BufferFlags(16);

    pub const fn from_bits_retain(bits: u32) -> Self {
        BufferFlags(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: BufferFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// True when any bit at or above [`BufferFlags::INVALID`] is set.
    pub const fn has_unknown_bits(self) -> bool {
        self.0 >= Self::INVALID.0
    }
}

impl BitOr for BufferFlags {
    type Output = BufferFlags;

    fn bitor(self, rhs: BufferFlags) -> BufferFlags {
        BufferFlags(self.0 | rhs.0)
    }
}

/// Properties a logical buffer is created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BufferProps {
    pub mem_type: MemType,
    pub alloc_policy: AllocPolicy,
    pub flags: BufferFlags,
}

impl BufferProps {
    pub const fn new(mem_type: MemType, alloc_policy: AllocPolicy, flags: BufferFlags) -> Self {
        Self {
            mem_type,
            alloc_policy,
            flags,
        }
    }
}

impl Default for BufferProps {
    fn default() -> Self {
        Self::new(MemType::Normal, AllocPolicy::Preferred, BufferFlags::SRC_PINNED)
    }
}

/// Which logical domains an allocation or detach applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferDomains {
    All,
    Only(Vec<LogDomainId>),
}

/// Output dependencies requested by an event-stream wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitAddresses {
    /// Later actions depend on the wait (control dependence on everything).
    Control,
    /// The wait creates no output dependence.
    NoDeps,
    /// Later actions touching these buffer addresses depend on the wait.
    Buffers(Vec<u64>),
}

/// Result of an event wait.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WaitOutcome {
    pub num_signaled: usize,
    pub signaled_indices: Vec<usize>,
}
