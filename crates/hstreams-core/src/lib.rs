//! # hstreams-core - Domains, Streams and Buffers
//!
//! The resource model and scheduler behind the `hstreams` runtime.
//!
//! ## Architecture
//!
//! - **Physical domains** are the host and every accelerator the [`Engine`]
//!   reports. Each carries a CPU mask of hardware threads and per-thread
//!   oversubscription counters.
//! - **Logical domains** carve a physical domain into disjoint (or exactly
//!   equal) CPU masks. Logical domain 0 is the source domain on the host.
//! - **Streams** are FIFO queues bound to a mask inside a logical domain.
//!   Logical streams with the same mask share one physical stream.
//! - **Buffers** are host address ranges instantiated in any subset of
//!   logical domains. Aliased buffers share one instantiation per physical
//!   domain.
//!
//! Ordering between actions in a stream comes from a [`DependencyPolicy`]
//! selected by [`DepPolicy`]: conservative FIFO, reader/writer tracking per
//! buffer, or none.
//!
//! ## Example
//!
//! ```text
//! use hstreams_core::{CpuMask, LogStreamId, Options, PhysDomainId, Runtime, XferDirection};
//!
//! let rt = Runtime::loopback(Options::default())?;
//! let (domain, _) = rt.add_log_domain(PhysDomainId::new(0), CpuMask::from_range(0..4))?;
//! rt.stream_create(LogStreamId::new(0), domain, CpuMask::from_range(0..4))?;
//!
//! let mut data = vec![0u8; 4096];
//! let base = data.as_mut_ptr() as u64;
//! rt.alloc1d(base, 4096)?;
//! rt.app_memset(LogStreamId::new(0), base, 7, 4096)?;
//! rt.enqueue_data_1d(LogStreamId::new(0), base, base, 4096, XferDirection::SinkToSrc)?;
//! rt.stream_synchronize(LogStreamId::new(0))?;
//! ```

pub mod buffer_collection;
pub mod config;
pub mod cpu_mask;
pub mod dependency;
pub mod engine;
pub mod error;
pub mod host_alloc;
mod host_worker;
pub mod log_buffer;
pub mod log_domain;
pub mod partition;
pub mod phys_buffer;
pub mod phys_domain;
pub mod phys_stream;
pub mod runtime;
pub mod sink;
pub mod types;

// Re-export primary types
pub use config::{DepPolicy, KmpAffinity, OpenMpPolicy, Options, Timeout};
pub use cpu_mask::CpuMask;
pub use dependency::{policy_for, DepKind, DependencyPolicy};
pub use engine::{Engine, EngineError, EngineInfo, LoopbackEngine};
pub use error::{result_name, Error, Result, ResultCode};
pub use log_domain::{LogDomainDetails, LogStreamDetails};
pub use partition::PartitionPlan;
pub use phys_domain::{host_cpu_mask, PhysDomainDetails};
pub use runtime::{PhysDomainCounts, Runtime};
pub use sink::{ReturnValue, SinkArgs, SinkRegistry, MEMCPY_SINK, MEMSET_SINK};
pub use types::{
    AllocPolicy, BufferDomains, BufferFlags, BufferProps, Event, Isa, LogDomainId, LogStreamId, MemType, Overlap,
    PhysDomainId, WaitAddresses, WaitOutcome, XferDirection,
};
