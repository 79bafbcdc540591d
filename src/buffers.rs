//! Buffer calls. Addresses are source-side and may point anywhere inside
//! a buffer.

use hstreams_core::{BufferDomains, BufferProps, LogDomainId, Result};

use crate::global::with_runtime;

/// Register `[base, base + len)` in every logical domain with default
/// properties.
pub fn alloc1d(base: u64, len: u64) -> Result<()> {
    with_runtime(|rt| rt.alloc1d(base, len))
}

pub fn alloc1d_ex(base: u64, len: u64, props: BufferProps, domains: BufferDomains) -> Result<()> {
    with_runtime(|rt| rt.alloc1d_ex(base, len, props, domains))
}

pub fn add_buffer_log_domains(addr: u64, ids: &[LogDomainId]) -> Result<()> {
    with_runtime(|rt| rt.add_buffer_log_domains(addr, ids))
}

pub fn remove_buffer_log_domains(addr: u64, domains: BufferDomains) -> Result<()> {
    with_runtime(|rt| rt.remove_buffer_log_domains(addr, domains))
}

pub fn buffer_num_log_domains(addr: u64) -> Result<usize> {
    with_runtime(|rt| rt.buffer_num_log_domains(addr))
}

pub fn buffer_log_domains(addr: u64) -> Result<Vec<LogDomainId>> {
    with_runtime(|rt| rt.buffer_log_domains(addr))
}

pub fn buffer_props(addr: u64) -> Result<BufferProps> {
    with_runtime(|rt| rt.buffer_props(addr))
}

pub fn dealloc(addr: u64) -> Result<()> {
    with_runtime(|rt| rt.dealloc(addr))
}
