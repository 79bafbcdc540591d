//! Logical buffers and their per-domain instantiations.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use hstreams_tracing::{performance, targets};

use crate::engine::{Engine, EngineBufferFlags};
use crate::error::{Error, Result};
use crate::host_alloc::AlignedBlock;
use crate::log_domain::LogDomain;
use crate::phys_buffer::PhysBuffer;
use crate::types::{BufferFlags, BufferProps, EngineBufferHandle, LogDomainId, PhysDomainId, CACHE_LINE_SIZE};

/// A user address range with one instantiation per attached logical domain.
pub struct LogBuffer {
    start: u64,
    len: u64,
    props: BufferProps,
    instantiations: Mutex<BTreeMap<LogDomainId, Arc<PhysBuffer>>>,
}

impl LogBuffer {
    pub(crate) fn new(start: u64, len: u64, props: BufferProps) -> Self {
        Self {
            start,
            len,
            props,
            instantiations: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// One past the last byte.
    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.len)
    }

    pub fn props(&self) -> BufferProps {
        self.props
    }

    /// Cache-line phase of the start address, replicated in sink copies.
    pub fn cache_line_offset(&self) -> u64 {
        self.start % CACHE_LINE_SIZE
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end()
    }

    pub fn instantiation(&self, domain: LogDomainId) -> Option<Arc<PhysBuffer>> {
        self.instantiations.lock().get(&domain).cloned()
    }

    pub fn is_attached(&self, domain: LogDomainId) -> bool {
        self.instantiations.lock().contains_key(&domain)
    }

    /// Attached logical domains, the source domain included.
    pub fn log_domain_ids(&self) -> Vec<LogDomainId> {
        self.instantiations.lock().keys().copied().collect()
    }

    /// Attached logical domains other than the source domain.
    pub fn num_attached_log_domains(&self) -> usize {
        self.instantiations.lock().keys().filter(|id| !id.is_source()).count()
    }

    /// Instantiate the buffer in `domain`.
    ///
    /// Aliased buffers reuse an instantiation that already lives in the
    /// same physical domain.
    pub fn attach(&self, domain: &LogDomain) -> Result<()> {
        let mut instantiations = self.instantiations.lock();
        if instantiations.contains_key(&domain.id()) {
            return Err(Error::AlreadyFound(format!(
                "buffer {:#x} is already instantiated in {}",
                self.start,
                domain.id()
            )));
        }

        let phys_id = domain.phys_domain().id();
        if self.props.flags.contains(BufferFlags::ALIASED) {
            let shared = instantiations.values().find(|pb| pb.phys_domain() == phys_id).cloned();
            if let Some(shared) = shared {
                let refs = shared.attach();
                tracing::debug!(target: targets::MEM, start = self.start, domain = %domain.id(), refs, "aliased instantiation reused");
                instantiations.insert(domain.id(), shared);
                return Ok(());
            }
        }

        let started = Instant::now();
        let (phys, kind) = self.instantiate(domain)?;
        performance::record_instantiation(self.len, kind, phys.padding(), started.elapsed().as_micros() as u64);
        phys.attach();
        instantiations.insert(domain.id(), Arc::new(phys));
        Ok(())
    }

    fn instantiate(&self, domain: &LogDomain) -> Result<(PhysBuffer, &'static str)> {
        let phys_domain = domain.phys_domain();
        let engine = Arc::clone(phys_domain.engine());
        let options = phys_domain.options();
        let aliased = self.props.flags.contains(BufferFlags::ALIASED);
        let prune_interval = options.pending_action_prune_interval;

        if domain.id().is_source() {
            let flags = EngineBufferFlags {
                no_dma: !self.props.flags.contains(BufferFlags::SRC_PINNED),
                huge_pages: false,
            };
            let handle = engine
                .create_buffer_from_memory(PhysDomainId::HOST, self.start, self.len, flags)
                .map_err(|e| Error::from_engine("wrapping source memory", e))?;
            let phys = PhysBuffer::new(engine, handle, PhysDomainId::HOST, self.start, 0, aliased, prune_interval, None);
            return Ok((phys, "source"));
        }

        let padding = self.cache_line_offset();
        let size = self.len + padding;
        let huge_pages = size > options.huge_page_threshold;

        if phys_domain.is_host() {
            let block = AlignedBlock::with_huge_pages(size, huge_pages)?;
            let handle = engine
                .create_buffer_from_memory(PhysDomainId::HOST, block.addr(), size, EngineBufferFlags::default())
                .map_err(|e| Error::from_engine("wrapping host sink memory", e))?;
            let start = block.addr();
            let phys = PhysBuffer::new(
                engine,
                handle,
                PhysDomainId::HOST,
                start,
                padding,
                aliased,
                prune_interval,
                Some(block),
            );
            return Ok((phys, "host_sink"));
        }

        let flags = EngineBufferFlags {
            no_dma: false,
            huge_pages,
        };
        let handle = engine
            .create_buffer(phys_domain.id(), size, flags)
            .map_err(|e| Error::from_engine(&format!("allocating {size} bytes in {}", phys_domain.id()), e))?;
        match prepare_remote(engine.as_ref(), handle, phys_domain.id()) {
            Ok(start) => {
                let phys = PhysBuffer::new(engine, handle, phys_domain.id(), start, padding, aliased, prune_interval, None);
                Ok((phys, "remote"))
            }
            Err(err) => {
                if let Err(cleanup) = engine.destroy_buffer(handle) {
                    tracing::warn!(target: targets::MEM, buffer = %handle, error = %cleanup, "failed to release half-built instantiation");
                }
                Err(err)
            }
        }
    }

    /// Detach the instantiation of `domain` and hand it back. Dropping the
    /// last handle waits for the actions still using it, so callers holding
    /// collection locks release those first.
    pub fn detach(&self, domain: LogDomainId) -> Result<Arc<PhysBuffer>> {
        let removed = self.instantiations.lock().remove(&domain);
        let phys = removed.ok_or_else(|| {
            Error::NotFound(format!("buffer {:#x} has no instantiation in {domain}", self.start))
        })?;
        let remaining = phys.detach();
        tracing::debug!(target: targets::MEM, start = self.start, %domain, remaining, "instantiation detached");
        Ok(phys)
    }

    /// Drop every instantiation. Storage is released once in-flight
    /// actions holding it finish.
    pub(crate) fn detach_all(&self) {
        let drained = std::mem::take(&mut *self.instantiations.lock());
        for phys in drained.values() {
            phys.detach();
        }
    }
}

/// Mark a fresh remote buffer valid only on its sink and take a reference.
fn prepare_remote(engine: &dyn Engine, handle: EngineBufferHandle, sink: PhysDomainId) -> Result<u64> {
    let remote = |e| Error::from_engine("preparing remote instantiation", e);
    engine.set_buffer_state(handle, sink, true).map_err(remote)?;
    engine.set_buffer_state(handle, PhysDomainId::HOST, false).map_err(remote)?;
    engine.add_buffer_ref(handle, sink, 1).map_err(remote)?;
    engine.sink_address(handle, sink).map_err(remote)
}

impl std::fmt::Debug for LogBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogBuffer")
            .field("start", &format_args!("{:#x}", self.start))
            .field("len", &self.len)
            .field("props", &self.props)
            .field("domains", &self.log_domain_ids())
            .finish()
    }
}
