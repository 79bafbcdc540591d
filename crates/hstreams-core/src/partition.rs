//! Partitioning of physical domains into logical domains and streams.
//!
//! Planning is pure: it validates the request and produces every mask and
//! stream ID up front, so that the runtime only starts creating resources
//! once the whole request is known to be satisfiable.

use serde::{Deserialize, Serialize};

use crate::cpu_mask::CpuMask;
use crate::error::{Error, Result};
use crate::types::{LogDomainId, LogStreamId, PhysDomainId};

/// A physical domain offered to the partitioner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionTarget {
    pub phys: PhysDomainId,
    pub max_mask: CpuMask,
    pub avoid_mask: CpuMask,
}

impl PartitionTarget {
    /// Threads usable by logical domains.
    pub fn usable_mask(&self) -> CpuMask {
        self.max_mask.xor(&self.avoid_mask.and(&self.max_mask))
    }
}

/// One logical domain of a plan. `existing` is set when the domain is
/// reused from an earlier partitioning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedDomain {
    pub phys: PhysDomainId,
    pub mask: CpuMask,
    pub existing: Option<LogDomainId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedStream {
    pub id: LogStreamId,
    /// Index into [`PartitionPlan::domains`].
    pub domain: usize,
    pub mask: CpuMask,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionPlan {
    pub domains: Vec<PlannedDomain>,
    pub streams: Vec<PlannedStream>,
}

impl PartitionPlan {
    /// Number of stream IDs the plan issues.
    pub fn num_streams(&self) -> usize {
        self.streams.len()
    }
}

/// Reject requests that cannot be satisfied regardless of hardware.
pub fn validate_request(num_domains: usize, streams_per_domain: &[u32], oversubscription: u32) -> Result<()> {
    if num_domains == 0 {
        return Err(Error::OutOfRange("at least one logical domain is required".to_string()));
    }
    if oversubscription == 0 {
        return Err(Error::OutOfRange("oversubscription must be at least 1".to_string()));
    }
    if streams_per_domain.len() != num_domains {
        return Err(Error::InconsistentArgs(format!(
            "{} stream counts given for {num_domains} logical domains",
            streams_per_domain.len()
        )));
    }
    if streams_per_domain.iter().all(|s| *s == 0) {
        return Err(Error::OutOfRange("no streams requested".to_string()));
    }
    Ok(())
}

/// Split `mask` into consecutive groups of the given sizes, walking its
/// set bits in ascending order.
fn split_bits(mask: &CpuMask, sizes: &[usize]) -> Vec<CpuMask> {
    let mut bits = mask.iter();
    sizes
        .iter()
        .map(|size| CpuMask::from_bits(bits.by_ref().take(*size)))
        .collect()
}

/// Distribute `num_domains` logical domains over at most `limit` targets.
///
/// The first `num_domains % used` targets get one domain more than the
/// rest. Within a target every domain gets `usable / count` threads and
/// the last one also takes the remainder.
pub fn plan_domains(targets: &[PartitionTarget], num_domains: usize, limit: usize) -> Result<Vec<PlannedDomain>> {
    let used = limit.min(targets.len()).min(num_domains);
    if used == 0 {
        return Err(Error::DomainOutOfRange("no physical domain available for partitioning".to_string()));
    }
    let lower = num_domains / used;
    let remainder = num_domains % used;

    let mut planned = Vec::with_capacity(num_domains);
    for (index, target) in targets.iter().take(used).enumerate() {
        let count = if index < remainder { lower + 1 } else { lower };
        let usable = target.usable_mask();
        let threads = usable.count();
        let size = threads / count;
        if size == 0 {
            return Err(Error::OutOfRange(format!(
                "{} has {threads} usable threads for {count} logical domains",
                target.phys
            )));
        }
        let mut sizes = vec![size; count];
        if let Some(last) = sizes.last_mut() {
            *last += threads % count;
        }
        planned.extend(split_bits(&usable, &sizes).into_iter().map(|mask| PlannedDomain {
            phys: target.phys,
            mask,
            existing: None,
        }));
    }
    Ok(planned)
}

/// Places (stream masks) and stream IDs for already planned domains.
///
/// Each domain's threads are split evenly over its streams with the
/// remainder going one thread each to the first places. IDs are issued
/// wide first starting at `first_id`: pass `k` covers every place of every
/// domain, so stream `first_id + i + k * total_places` reuses the mask of
/// stream `first_id + i`.
pub fn plan_streams(
    domains: Vec<PlannedDomain>,
    streams_per_domain: &[u32],
    oversubscription: u32,
    first_id: u32,
) -> Result<PartitionPlan> {
    if domains.len() != streams_per_domain.len() {
        return Err(Error::InconsistentArgs(format!(
            "{} stream counts given for {} logical domains",
            streams_per_domain.len(),
            domains.len()
        )));
    }

    let mut places: Vec<(usize, CpuMask)> = Vec::new();
    for (index, (domain, requested)) in domains.iter().zip(streams_per_domain).enumerate() {
        let requested = *requested as usize;
        if requested == 0 {
            continue;
        }
        let threads = domain.mask.count();
        if requested > threads {
            return Err(Error::OutOfRange(format!(
                "{requested} streams requested for a logical domain of {threads} threads"
            )));
        }
        let (size, extra) = (threads / requested, threads % requested);
        let sizes: Vec<usize> = (0..requested).map(|p| size + usize::from(p < extra)).collect();
        places.extend(split_bits(&domain.mask, &sizes).into_iter().map(|mask| (index, mask)));
    }

    let total = places.len() as u64;
    let last_id = u64::from(first_id) + total * u64::from(oversubscription);
    if last_id > u64::from(u32::MAX) + 1 {
        return Err(Error::OutOfRange("stream IDs exhausted".to_string()));
    }

    let mut streams = Vec::with_capacity(places.len() * oversubscription as usize);
    let mut next = first_id;
    for _ in 0..oversubscription {
        for (domain, mask) in &places {
            streams.push(PlannedStream {
                id: LogStreamId::new(next),
                domain: *domain,
                mask: *mask,
            });
            next = next.wrapping_add(1);
        }
    }
    Ok(PartitionPlan { domains, streams })
}
