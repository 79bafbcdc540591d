//! # hstreams - Heterogeneous Streaming Runtime
//!
//! Process-wide API over one [`Runtime`]: physical domains (the host and
//! each accelerator), logical domains carved out of them by CPU mask,
//! FIFO streams inside logical domains, and buffers that follow host
//! address ranges into any set of logical domains.
//!
//! ## Architecture
//!
//! - **Global state**: [`init`] builds the runtime from the pending
//!   [`Options`]; [`fini`] drains and releases everything.
//! - **Last error**: every failing call stores its [`ResultCode`]; poll it
//!   with [`last_error`].
//! - **Engine**: the default engine is the in-process loopback engine.
//!   [`init_with_engine`] accepts any [`Engine`] implementation.
//!
//! ## Example
//!
//! ```text
//! use hstreams::{app_init_domains, app_memset, alloc1d, enqueue_data_1d, stream_synchronize, LogStreamId, XferDirection};
//!
//! let plan = app_init_domains(1, &[2], 1)?;
//! let mut data = vec![0u8; 1 << 20];
//! let base = data.as_mut_ptr() as u64;
//! alloc1d(base, data.len() as u64)?;
//!
//! let stream = LogStreamId::new(0);
//! app_memset(stream, base, 0xff, 1 << 20)?;
//! enqueue_data_1d(stream, base, base, 1 << 20, XferDirection::SinkToSrc)?;
//! stream_synchronize(stream)?;
//! ```

mod app;
mod buffers;
mod domains;
mod global;
mod streams;

pub use app::{app_init, app_init_domains, app_log_domains, app_memcpy, app_memset};
pub use buffers::{
    add_buffer_log_domains, alloc1d, alloc1d_ex, buffer_log_domains, buffer_num_log_domains, buffer_props, dealloc,
    remove_buffer_log_domains,
};
pub use domains::{
    add_log_domain, available_stream_cpu_mask, log_domain_details, log_domain_ids, num_phys_domains,
    oversubscription_level, phys_domain_details, phys_domain_ids, remove_log_domains,
};
pub use global::{
    clear_last_error, current_options, fini, init, init_with_engine, is_initialized, last_error, set_log_info_types,
    set_log_level, set_options, sink_registry,
};
pub use streams::{
    enqueue_compute, enqueue_data_1d, enqueue_data_xdomain_1d, event_stream_wait, event_wait, log_stream_details,
    log_stream_ids, num_log_streams, stream_create, stream_destroy, stream_synchronize, thread_synchronize,
};

pub use hstreams_core::{
    result_name, AllocPolicy, BufferDomains, BufferFlags, BufferProps, CpuMask, DepPolicy, Engine, Error, Event, Isa,
    LogDomainDetails, LogDomainId, LogStreamDetails, LogStreamId, LoopbackEngine, MemType, Options, Overlap,
    PartitionPlan, PhysDomainCounts, PhysDomainDetails, PhysDomainId, Result, ResultCode, ReturnValue, Runtime,
    SinkArgs, SinkRegistry, Timeout, WaitAddresses, WaitOutcome, XferDirection, MEMCPY_SINK, MEMSET_SINK,
};
pub use hstreams_tracing::{InfoTypes, LogLevel};
