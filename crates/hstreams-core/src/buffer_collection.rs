//! Address-ordered store of logical buffers.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use crate::log_buffer::LogBuffer;
use crate::phys_buffer::PhysBuffer;
use crate::types::{LogDomainId, Overlap};

/// Logical buffers keyed by start address. Ranges never overlap.
#[derive(Debug, Default)]
pub struct LogBufferCollection {
    buffers: BTreeMap<u64, Arc<LogBuffer>>,
}

impl LogBufferCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<LogBuffer>> {
        self.buffers.values()
    }

    pub(crate) fn insert(&mut self, buffer: Arc<LogBuffer>) {
        self.buffers.insert(buffer.start(), buffer);
    }

    pub(crate) fn remove(&mut self, start: u64) -> Option<Arc<LogBuffer>> {
        self.buffers.remove(&start)
    }

    pub(crate) fn drain(&mut self) -> Vec<Arc<LogBuffer>> {
        std::mem::take(&mut self.buffers).into_values().collect()
    }

    /// The buffer containing `addr`.
    pub fn lookup(&self, addr: u64) -> Option<Arc<LogBuffer>> {
        match self.lookup_range(addr, 1) {
            (Some(buffer), Overlap::Exact) => Some(buffer),
            _ => None,
        }
    }

    /// Classify `[addr, addr + len)` against the stored buffers.
    ///
    /// `Exact` (with the buffer) when one buffer contains the whole range,
    /// `Partial` when the range touches any buffer without being contained,
    /// `NoOverlap` otherwise.
    pub fn lookup_range(&self, addr: u64, len: u64) -> (Option<Arc<LogBuffer>>, Overlap) {
        let end = addr.saturating_add(len.max(1));
        if let Some((_, candidate)) = self.buffers.range(..=addr).next_back() {
            if candidate.contains(addr) {
                if end <= candidate.end() {
                    return (Some(Arc::clone(candidate)), Overlap::Exact);
                }
                return (None, Overlap::Partial);
            }
        }
        if self
            .buffers
            .range((Bound::Excluded(addr), Bound::Excluded(end)))
            .next()
            .is_some()
        {
            return (None, Overlap::Partial);
        }
        (None, Overlap::NoOverlap)
    }

    /// Instantiations of every buffer in `domain`, deduplicated.
    pub fn phys_buffers_in(&self, domain: LogDomainId) -> Vec<Arc<PhysBuffer>> {
        let mut out: Vec<Arc<PhysBuffer>> = Vec::new();
        for phys in self.buffers.values().filter_map(|b| b.instantiation(domain)) {
            if !out.iter().any(|seen| seen.handle() == phys.handle()) {
                out.push(phys);
            }
        }
        out
    }
}
