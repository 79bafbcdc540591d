//! One-call setup and the built-in fill/copy helpers.

use hstreams_core::{Event, LogDomainId, LogStreamId, PartitionPlan, Result, Runtime};
use hstreams_tracing::targets;

use crate::global::{fini, init, is_initialized, with_runtime};

/// Initialize if needed and partition the machine into `num_log_domains`
/// logical domains with `streams_per_domain[i]` streams each, repeated
/// `oversubscription` times.
///
/// When this call performed the initialization and partitioning fails, the
/// library is finalized again.
pub fn app_init_domains(
    num_log_domains: usize,
    streams_per_domain: &[u32],
    oversubscription: u32,
) -> Result<PartitionPlan> {
    partition_after_init(|rt| rt.partition(num_log_domains, streams_per_domain, oversubscription))
}

/// One logical domain per active physical domain with the same number of
/// streams in each.
pub fn app_init(streams_per_domain: u32, oversubscription: u32) -> Result<PartitionPlan> {
    partition_after_init(|rt| rt.partition_evenly(streams_per_domain, oversubscription))
}

fn partition_after_init(partition: impl FnOnce(&Runtime) -> Result<PartitionPlan>) -> Result<PartitionPlan> {
    let initialized_here = !is_initialized();
    init()?;
    let result = with_runtime(partition);
    if result.is_err() && initialized_here {
        if let Err(err) = fini() {
            tracing::warn!(target: targets::MISC, error = %err, "finalizing after failed partitioning");
        }
    }
    result
}

/// Logical domains created by the app-level partitioning, in order.
pub fn app_log_domains() -> Result<Vec<LogDomainId>> {
    with_runtime(|rt| Ok(rt.partitioned_domains()))
}

/// Fill `len` bytes at `dst` with `value` inside the stream's domain.
pub fn app_memset(stream: LogStreamId, dst: u64, value: u8, len: u64) -> Result<Event> {
    with_runtime(|rt| rt.app_memset(stream, dst, value, len))
}

/// Copy `len` bytes from `src` to `dst` inside the stream's domain.
pub fn app_memcpy(stream: LogStreamId, src: u64, dst: u64, len: u64) -> Result<Event> {
    with_runtime(|rt| rt.app_memcpy(stream, dst, src, len))
}
