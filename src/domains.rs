//! Physical and logical domain calls.

use hstreams_core::{
    CpuMask, LogDomainDetails, LogDomainId, Overlap, PhysDomainCounts, PhysDomainDetails, PhysDomainId, Result,
};

use crate::global::with_runtime;

/// `(total, active, homogeneous)` accelerator counts.
pub fn num_phys_domains() -> Result<PhysDomainCounts> {
    with_runtime(|rt| Ok(rt.num_phys_domains()))
}

/// IDs of the active accelerator domains.
pub fn phys_domain_ids() -> Result<Vec<PhysDomainId>> {
    with_runtime(|rt| Ok(rt.phys_domain_ids()))
}

pub fn phys_domain_details(id: PhysDomainId) -> Result<PhysDomainDetails> {
    with_runtime(|rt| rt.phys_domain_details(id))
}

/// Threads of a physical domain not covered by any live stream.
pub fn available_stream_cpu_mask(id: PhysDomainId) -> Result<CpuMask> {
    with_runtime(|rt| rt.available_stream_cpu_mask(id))
}

/// Live streams per hardware thread of a physical domain.
pub fn oversubscription_level(id: PhysDomainId) -> Result<Vec<u32>> {
    with_runtime(|rt| rt.oversubscription_level(id))
}

pub fn add_log_domain(phys: PhysDomainId, mask: CpuMask) -> Result<(LogDomainId, Overlap)> {
    with_runtime(|rt| rt.add_log_domain(phys, mask))
}

pub fn remove_log_domains(ids: &[LogDomainId]) -> Result<()> {
    with_runtime(|rt| rt.remove_log_domains(ids))
}

pub fn log_domain_ids(phys: PhysDomainId) -> Result<Vec<LogDomainId>> {
    with_runtime(|rt| rt.log_domain_ids(phys))
}

pub fn log_domain_details(id: LogDomainId) -> Result<LogDomainDetails> {
    with_runtime(|rt| rt.log_domain_details(id))
}
