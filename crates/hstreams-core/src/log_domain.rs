//! Logical domains and logical streams.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::cpu_mask::CpuMask;
use crate::phys_domain::PhysDomain;
use crate::phys_stream::PhysStream;
use crate::types::{LogDomainId, LogStreamId, PhysDomainId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogDomainDetails {
    pub id: LogDomainId,
    pub phys_domain: PhysDomainId,
    pub mask: CpuMask,
    pub num_streams: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogStreamDetails {
    pub id: LogStreamId,
    pub log_domain: LogDomainId,
    pub phys_domain: PhysDomainId,
    pub mask: CpuMask,
}

/// User handle on a physical stream. Streams with identical masks in one
/// logical domain share the physical stream.
#[derive(Debug)]
pub struct LogStream {
    id: LogStreamId,
    mask: CpuMask,
    log_domain: LogDomainId,
    phys_stream: Arc<PhysStream>,
}

impl LogStream {
    pub(crate) fn new(id: LogStreamId, mask: CpuMask, log_domain: LogDomainId, phys_stream: Arc<PhysStream>) -> Self {
        Self {
            id,
            mask,
            log_domain,
            phys_stream,
        }
    }

    pub fn id(&self) -> LogStreamId {
        self.id
    }

    pub fn mask(&self) -> &CpuMask {
        &self.mask
    }

    pub fn log_domain(&self) -> LogDomainId {
        self.log_domain
    }

    pub fn phys_stream(&self) -> &Arc<PhysStream> {
        &self.phys_stream
    }

    pub fn details(&self) -> LogStreamDetails {
        LogStreamDetails {
            id: self.id,
            log_domain: self.log_domain,
            phys_domain: self.phys_stream.phys_domain().id(),
            mask: self.mask,
        }
    }
}

/// A CPU-mask partition of a physical domain.
#[derive(Debug)]
pub struct LogDomain {
    id: LogDomainId,
    mask: CpuMask,
    phys: Arc<PhysDomain>,
    streams: Mutex<BTreeMap<LogStreamId, Arc<LogStream>>>,
}

impl LogDomain {
    pub(crate) fn new(id: LogDomainId, phys: Arc<PhysDomain>, mask: CpuMask) -> Self {
        Self {
            id,
            mask,
            phys,
            streams: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn id(&self) -> LogDomainId {
        self.id
    }

    pub fn mask(&self) -> &CpuMask {
        &self.mask
    }

    pub fn phys_domain(&self) -> &Arc<PhysDomain> {
        &self.phys
    }

    pub fn stream_ids(&self) -> Vec<LogStreamId> {
        self.streams.lock().keys().copied().collect()
    }

    pub fn num_streams(&self) -> usize {
        self.streams.lock().len()
    }

    /// Physical stream of an existing logical stream with exactly `mask`.
    pub fn lookup_phys_stream_by_mask(&self, mask: &CpuMask) -> Option<Arc<PhysStream>> {
        self.streams
            .lock()
            .values()
            .find(|s| s.mask() == mask)
            .map(|s| Arc::clone(s.phys_stream()))
    }

    pub(crate) fn add_stream(&self, stream: Arc<LogStream>) {
        self.streams.lock().insert(stream.id(), stream);
    }

    pub(crate) fn remove_stream(&self, id: LogStreamId) -> Option<Arc<LogStream>> {
        self.streams.lock().remove(&id)
    }

    pub(crate) fn take_streams(&self) -> Vec<Arc<LogStream>> {
        std::mem::take(&mut *self.streams.lock()).into_values().collect()
    }

    pub fn details(&self) -> LogDomainDetails {
        LogDomainDetails {
            id: self.id,
            phys_domain: self.phys.id(),
            mask: self.mask,
            num_streams: self.num_streams(),
        }
    }
}
