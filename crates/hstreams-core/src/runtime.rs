//! The runtime instance: physical domains plus the logical domain, stream
//! and buffer collections.
//!
//! Lock order is logical domains, then logical streams, then logical
//! buffers. Physical streams and buffers are dropped after the collection
//! locks are released wherever a drain may block.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use hstreams_tracing::{performance, targets};

use crate::buffer_collection::LogBufferCollection;
use crate::config::{DepPolicy, Options, Timeout};
use crate::cpu_mask::CpuMask;
use crate::dependency::DepKind;
use crate::engine::{Engine, LoopbackEngine};
use crate::error::{Error, Result};
use crate::log_buffer::LogBuffer;
use crate::log_domain::{LogDomain, LogDomainDetails, LogStream, LogStreamDetails};
use crate::partition::{self, PartitionPlan, PartitionTarget, PlannedDomain};
use crate::phys_buffer::PhysBuffer;
use crate::phys_domain::{PhysDomain, PhysDomainDetails};
use crate::phys_stream::{HeapOperand, PhysStream};
use crate::sink::{ReturnValue, SinkRegistry, MEMCPY_SINK, MEMSET_SINK};
use crate::types::{
    BufferDomains, BufferFlags, BufferProps, Event, LogDomainId, LogStreamId, MemType, Overlap, PhysDomainId,
    WaitAddresses, WaitOutcome, XferDirection, ARGS_IMPLEMENTED, ARGS_SUPPORTED, MAX_FUNC_NAME_SIZE,
    RETURN_SIZE_LIMIT,
};

/// Words of the marshalled block that are not user arguments.
const MARSHAL_OVERHEAD: usize = 3;

/// Physical domain counts reported by [`Runtime::num_phys_domains`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysDomainCounts {
    /// Accelerators the Engine reports.
    pub total: u32,
    /// Accelerators brought up.
    pub active: u32,
    /// Whether every active accelerator has the same hardware.
    pub homogeneous: bool,
}

struct LogDomainTable {
    domains: BTreeMap<LogDomainId, Arc<LogDomain>>,
    next_id: u32,
}

#[derive(Debug, Default)]
struct AppState {
    domains: Vec<LogDomainId>,
    next_stream: u32,
}

pub struct Runtime {
    engine: Arc<dyn Engine>,
    registry: Arc<SinkRegistry>,
    options: Arc<Options>,
    accelerators: Vec<Arc<PhysDomain>>,
    host: Arc<PhysDomain>,
    log_domains: RwLock<LogDomainTable>,
    log_streams: RwLock<BTreeMap<LogStreamId, Arc<LogStream>>>,
    log_buffers: RwLock<LogBufferCollection>,
    app: Mutex<AppState>,
}

impl Runtime {
    /// Bring up every reachable accelerator (up to the configured limit),
    /// the host domain and the source logical domain.
    pub fn new(engine: Arc<dyn Engine>, registry: Arc<SinkRegistry>, options: Options) -> Result<Self> {
        options.validate()?;
        let options = Arc::new(options);

        let wanted = engine.engine_count().min(options.phys_domains_limit);
        let mut accelerators = Vec::new();
        for index in 0..wanted {
            if let Err(err) = engine.engine_info(index) {
                tracing::warn!(target: targets::MISC, index, error = %err, "skipping unreachable accelerator");
                continue;
            }
            let domain = PhysDomain::accelerator(index, Arc::clone(&engine), Arc::clone(&options))?;
            accelerators.push(Arc::new(domain));
        }

        let host = Arc::new(PhysDomain::host(
            Arc::clone(&engine),
            Arc::clone(&registry),
            Arc::clone(&options),
        )?);
        host.add_log_domain_mapping(LogDomainId::SOURCE, CpuMask::new());
        let source = Arc::new(LogDomain::new(LogDomainId::SOURCE, Arc::clone(&host), CpuMask::new()));
        let mut domains = BTreeMap::new();
        domains.insert(LogDomainId::SOURCE, source);

        tracing::info!(
            target: targets::MISC,
            accelerators = accelerators.len(),
            host_threads = host.details().num_threads,
            dep_policy = ?options.dep_policy,
            "runtime initialized"
        );
        Ok(Self {
            engine,
            registry,
            options,
            accelerators,
            host,
            log_domains: RwLock::new(LogDomainTable { domains, next_id: 1 }),
            log_streams: RwLock::new(BTreeMap::new()),
            log_buffers: RwLock::new(LogBufferCollection::new()),
            app: Mutex::new(AppState::default()),
        })
    }

    /// A runtime over a fresh [`LoopbackEngine`] sized by the options.
    pub fn loopback(options: Options) -> Result<Self> {
        let registry = Arc::new(SinkRegistry::new());
        let engine: Arc<dyn Engine> = Arc::new(LoopbackEngine::from_options(&options, Arc::clone(&registry)));
        Self::new(engine, registry, options)
    }

    pub fn options(&self) -> &Arc<Options> {
        &self.options
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    /// Registry sink functions are looked up in.
    pub fn registry(&self) -> &Arc<SinkRegistry> {
        &self.registry
    }

    // ----- physical domains -----

    fn phys_domain(&self, id: PhysDomainId) -> Result<&Arc<PhysDomain>> {
        if id.is_host() {
            return Ok(&self.host);
        }
        self.accelerators
            .iter()
            .find(|d| d.id() == id)
            .ok_or_else(|| Error::DomainOutOfRange(format!("{id} is not an active physical domain")))
    }

    pub fn num_phys_domains(&self) -> PhysDomainCounts {
        let homogeneous = self
            .accelerators
            .first()
            .map_or(true, |first| self.accelerators.iter().all(|d| d.same_hardware(first)));
        PhysDomainCounts {
            total: self.engine.engine_count(),
            active: self.accelerators.len() as u32,
            homogeneous,
        }
    }

    /// Active accelerator IDs in enumeration order.
    pub fn phys_domain_ids(&self) -> Vec<PhysDomainId> {
        self.accelerators.iter().map(|d| d.id()).collect()
    }

    pub fn phys_domain_details(&self, id: PhysDomainId) -> Result<PhysDomainDetails> {
        Ok(self.phys_domain(id)?.details().clone())
    }

    pub fn available_stream_cpu_mask(&self, id: PhysDomainId) -> Result<CpuMask> {
        Ok(self.phys_domain(id)?.available_stream_cpu_mask())
    }

    pub fn oversubscription_level(&self, id: PhysDomainId) -> Result<Vec<u32>> {
        Ok(self.phys_domain(id)?.oversubscription_level())
    }

    // ----- logical domains -----

    /// Carve a logical domain out of a physical domain.
    ///
    /// An exact mask match with an existing logical domain is allowed and
    /// reported; a partial overlap is rejected.
    #[tracing::instrument(target = "hstreams::trace", level = "debug", skip(self), err)]
    pub fn add_log_domain(&self, phys: PhysDomainId, mask: CpuMask) -> Result<(LogDomainId, Overlap)> {
        if mask.is_empty() {
            return Err(Error::CpuMaskOutOfRange("logical domain mask is empty".to_string()));
        }
        let phys_domain = Arc::clone(self.phys_domain(phys)?);
        if !mask.is_subset_of(phys_domain.max_mask()) {
            return Err(Error::CpuMaskOutOfRange(format!(
                "{mask} is not within {} of {phys}",
                phys_domain.max_mask()
            )));
        }

        let mut table = self.log_domains.write();
        let (_, overlap) = phys_domain.lookup_log_domain_by_mask(&mask);
        if overlap == Overlap::Partial {
            return Err(Error::OverlappingResources(format!(
                "{mask} partially overlaps a logical domain of {phys}"
            )));
        }
        let id = LogDomainId::new(table.next_id);
        table.next_id += 1;
        let domain = Arc::new(LogDomain::new(id, Arc::clone(&phys_domain), mask));

        {
            let buffers = self.log_buffers.read();
            let incremental = buffers
                .iter()
                .filter(|b| b.props().flags.contains(BufferFlags::INCREMENTAL));
            for buffer in incremental {
                if let Err(err) = buffer.attach(&domain) {
                    for attached in buffers.iter().filter(|b| b.is_attached(id)) {
                        if let Err(cleanup) = attached.detach(id) {
                            tracing::warn!(target: targets::MEM, error = %cleanup, "rollback of incremental buffer failed");
                        }
                    }
                    return Err(err);
                }
            }
        }

        table.domains.insert(id, domain);
        phys_domain.add_log_domain_mapping(id, mask);
        tracing::debug!(target: targets::MISC, %id, %phys, %mask, ?overlap, "logical domain added");
        Ok((id, overlap))
    }

    /// Remove logical domains, draining their streams and dropping their
    /// buffer instantiations.
    #[tracing::instrument(target = "hstreams::trace", level = "debug", skip(self), err)]
    pub fn remove_log_domains(&self, ids: &[LogDomainId]) -> Result<()> {
        if ids.is_empty() {
            return Err(Error::OutOfRange("no logical domains given".to_string()));
        }
        if ids.iter().any(|id| id.is_source()) {
            return Err(Error::DomainOutOfRange("the source logical domain cannot be removed".to_string()));
        }

        let mut released_streams = Vec::new();
        let mut released_buffers = Vec::new();
        let mut released_domains = Vec::with_capacity(ids.len());
        {
            let mut table = self.log_domains.write();
            if let Some(missing) = ids.iter().find(|id| !table.domains.contains_key(id)) {
                return Err(Error::NotFound(format!("logical domain {missing}")));
            }
            let mut streams = self.log_streams.write();
            let buffers = self.log_buffers.read();

            for id in ids {
                let Some(domain) = table.domains.remove(id) else {
                    continue;
                };
                let drained = domain.take_streams();
                for stream in &drained {
                    streams.remove(&stream.id());
                }
                released_streams.extend(drained);

                domain.phys_domain().remove_log_domain_mapping(*id);
                for buffer in buffers.iter().filter(|b| b.is_attached(*id)) {
                    match buffer.detach(*id) {
                        Ok(phys) => released_buffers.push(phys),
                        Err(err) => {
                            tracing::warn!(target: targets::MEM, domain = %id, error = %err, "failed to detach buffer");
                        }
                    }
                }
                released_domains.push(domain);
            }
        }

        // Streams drain and instantiations wait on their actions here, with
        // every collection lock released.
        drop(released_streams);
        drop(released_buffers);
        for domain in released_domains {
            tracing::debug!(target: targets::MISC, domain = %domain.id(), "logical domain removed");
        }
        Ok(())
    }

    fn log_domain(&self, id: LogDomainId) -> Result<Arc<LogDomain>> {
        self.log_domains
            .read()
            .domains
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::DomainOutOfRange(format!("unknown logical domain {id}")))
    }

    /// Logical domains of a physical domain.
    pub fn log_domain_ids(&self, phys: PhysDomainId) -> Result<Vec<LogDomainId>> {
        Ok(self.phys_domain(phys)?.log_domain_ids())
    }

    pub fn log_domain_details(&self, id: LogDomainId) -> Result<LogDomainDetails> {
        Ok(self.log_domain(id)?.details())
    }

    // ----- logical streams -----

    /// Create logical stream `id` in `log_domain`. A stream whose mask
    /// equals an existing stream's shares that physical stream.
    #[tracing::instrument(target = "hstreams::trace", level = "debug", skip(self), err)]
    pub fn stream_create(&self, id: LogStreamId, log_domain: LogDomainId, mask: CpuMask) -> Result<()> {
        if mask.is_empty() {
            return Err(Error::CpuMaskOutOfRange("stream mask is empty".to_string()));
        }
        let table = self.log_domains.read();
        let mut streams = self.log_streams.write();
        if streams.contains_key(&id) {
            return Err(Error::AlreadyFound(format!("logical stream {id}")));
        }
        let domain = table
            .domains
            .get(&log_domain)
            .ok_or_else(|| Error::DomainOutOfRange(format!("unknown logical domain {log_domain}")))?;
        if !mask.is_subset_of(domain.mask()) {
            return Err(Error::CpuMaskOutOfRange(format!(
                "{mask} is not within {} of {log_domain}",
                domain.mask()
            )));
        }

        let phys_stream = match domain.lookup_phys_stream_by_mask(&mask) {
            Some(shared) => shared,
            None => domain.phys_domain().create_phys_stream(log_domain, mask)?,
        };
        let stream = Arc::new(LogStream::new(id, mask, log_domain, phys_stream));
        domain.add_stream(Arc::clone(&stream));
        streams.insert(id, stream);
        Ok(())
    }

    /// Destroy a logical stream; the physical stream drains once its last
    /// logical stream is gone.
    #[tracing::instrument(target = "hstreams::trace", level = "debug", skip(self), err)]
    pub fn stream_destroy(&self, id: LogStreamId) -> Result<()> {
        let removed = {
            let table = self.log_domains.read();
            let mut streams = self.log_streams.write();
            let stream = streams
                .remove(&id)
                .ok_or_else(|| Error::NotFound(format!("logical stream {id}")))?;
            let owned = table
                .domains
                .get(&stream.log_domain())
                .and_then(|domain| domain.remove_stream(id));
            (stream, owned)
        };
        drop(removed);
        Ok(())
    }

    fn stream(&self, id: LogStreamId) -> Result<Arc<LogStream>> {
        self.log_streams
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("logical stream {id}")))
    }

    pub fn num_log_streams(&self, log_domain: LogDomainId) -> Result<usize> {
        Ok(self.log_domain(log_domain)?.num_streams())
    }

    pub fn log_stream_ids(&self, log_domain: LogDomainId) -> Result<Vec<LogStreamId>> {
        Ok(self.log_domain(log_domain)?.stream_ids())
    }

    pub fn log_stream_details(&self, id: LogStreamId) -> Result<LogStreamDetails> {
        Ok(self.stream(id)?.details())
    }

    // ----- enqueue -----

    /// Invoke sink function `name` in a stream. Heap arguments are
    /// addresses inside logical buffers instantiated in the stream's domain.
    #[tracing::instrument(target = "hstreams::trace", level = "debug", skip(self, scalars, heap_addrs, ret), err)]
    pub fn enqueue_compute(
        &self,
        stream: LogStreamId,
        name: &str,
        scalars: &[u64],
        heap_addrs: &[u64],
        ret: Option<ReturnValue>,
    ) -> Result<Event> {
        if name.is_empty() || name.len() >= MAX_FUNC_NAME_SIZE {
            return Err(Error::BadName(format!(
                "function names must be 1 to {} bytes",
                MAX_FUNC_NAME_SIZE - 1
            )));
        }
        if let Some(ret) = &ret {
            if ret.len() > RETURN_SIZE_LIMIT {
                return Err(Error::OutOfRange(format!(
                    "return value of {} bytes exceeds {RETURN_SIZE_LIMIT}",
                    ret.len()
                )));
            }
        }
        let cap = ARGS_SUPPORTED.min(ARGS_IMPLEMENTED);
        if MARSHAL_OVERHEAD + scalars.len() + heap_addrs.len() > cap {
            return Err(Error::TooManyArgs(format!(
                "{} scalar and {} heap arguments exceed the limit of {}",
                scalars.len(),
                heap_addrs.len(),
                cap - MARSHAL_OVERHEAD
            )));
        }

        let stream = self.stream(stream)?;
        let operands = {
            let buffers = self.log_buffers.read();
            heap_addrs
                .iter()
                .map(|addr| {
                    let (buffer, phys) = instantiation_at(&buffers, *addr, stream.log_domain())?;
                    Ok(HeapOperand {
                        buffer: phys,
                        offset: addr - buffer.start(),
                    })
                })
                .collect::<Result<Vec<_>>>()?
        };
        stream.phys_stream().enqueue_function(name, scalars, &operands, ret)
    }

    /// Move `len` bytes between the source domain and the stream's domain.
    pub fn enqueue_data_1d(
        &self,
        stream: LogStreamId,
        dst: u64,
        src: u64,
        len: u64,
        direction: XferDirection,
    ) -> Result<Event> {
        let domain = self.stream(stream)?.log_domain();
        let (dst_domain, src_domain) = match direction {
            XferDirection::SrcToSink => (domain, LogDomainId::SOURCE),
            XferDirection::SinkToSrc => (LogDomainId::SOURCE, domain),
        };
        self.enqueue_data_xdomain_1d(stream, dst, src, len, dst_domain, src_domain)
    }

    /// Copy `len` bytes from `src` in `src_domain` to `dst` in `dst_domain`.
    /// The stream must belong to one of the two domains.
    #[tracing::instrument(target = "hstreams::trace", level = "debug", skip(self), err)]
    pub fn enqueue_data_xdomain_1d(
        &self,
        stream: LogStreamId,
        dst: u64,
        src: u64,
        len: u64,
        dst_domain: LogDomainId,
        src_domain: LogDomainId,
    ) -> Result<Event> {
        if dst == 0 || src == 0 {
            return Err(Error::NullPtr("transfer address is null".to_string()));
        }
        if len == 0 {
            return Err(Error::OutOfRange("transfer length is zero".to_string()));
        }
        let stream = self.stream(stream)?;
        let domain = stream.log_domain();
        if domain != dst_domain && domain != src_domain {
            return Err(Error::OutOfRange(format!(
                "stream of {domain} cannot move data between {src_domain} and {dst_domain}"
            )));
        }
        if dst_domain == src_domain && dst < src.saturating_add(len) && src < dst.saturating_add(len) {
            return Err(Error::OutOfRange("overlapping ranges within one logical domain".to_string()));
        }

        let (dst_phys, dst_offset, src_phys, src_offset) = {
            let buffers = self.log_buffers.read();
            let (dst_buf, dst_phys) = checked_range(&buffers, dst, len, dst_domain)?;
            let (src_buf, src_phys) = checked_range(&buffers, src, len, src_domain)?;
            (dst_phys, dst - dst_buf.start(), src_phys, src - src_buf.start())
        };
        stream
            .phys_stream()
            .enqueue_transfer(&dst_phys, &src_phys, dst_offset, src_offset, len)
    }

    /// Make later actions of a stream wait on `events`.
    ///
    /// Returns the marker event, or `None` when dependencies are disabled.
    #[tracing::instrument(target = "hstreams::trace", level = "debug", skip(self), err)]
    pub fn event_stream_wait(
        &self,
        stream: LogStreamId,
        events: &[Event],
        addresses: WaitAddresses,
    ) -> Result<Option<Event>> {
        let stream = self.stream(stream)?;
        if self.options.dep_policy == DepPolicy::None {
            return Ok(None);
        }

        let (listed, domain_buffers) = {
            let buffers = self.log_buffers.read();
            let listed = match &addresses {
                WaitAddresses::Buffers(addrs) => addrs
                    .iter()
                    .map(|addr| instantiation_at(&buffers, *addr, stream.log_domain()).map(|(_, phys)| phys))
                    .collect::<Result<Vec<_>>>()?,
                _ => Vec::new(),
            };
            let domain_buffers = if addresses == WaitAddresses::Control {
                buffers.phys_buffers_in(stream.log_domain())
            } else {
                Vec::new()
            };
            (listed, domain_buffers)
        };

        let input = if addresses == WaitAddresses::Control {
            DepKind::Barrier
        } else {
            DepKind::Transfer
        };
        let output: Option<(DepKind, &[Arc<PhysBuffer>])> = match addresses {
            WaitAddresses::Control => Some((DepKind::Barrier, &domain_buffers)),
            WaitAddresses::NoDeps => None,
            WaitAddresses::Buffers(_) => Some((DepKind::Transfer, &listed)),
        };
        stream
            .phys_stream()
            .enqueue_marker(input, &listed, events, output)
            .map(Some)
    }

    // ----- synchronization -----

    /// Wait for everything enqueued in a stream so far.
    pub fn stream_synchronize(&self, stream: LogStreamId) -> Result<()> {
        self.stream(stream)?.phys_stream().synchronize(self.options.time_out_ms)
    }

    /// Wait for everything enqueued in every stream so far.
    pub fn thread_synchronize(&self) -> Result<()> {
        let mut phys: Vec<Arc<PhysStream>> = Vec::new();
        for stream in self.log_streams.read().values() {
            if !phys.iter().any(|p| p.serial() == stream.phys_stream().serial()) {
                phys.push(Arc::clone(stream.phys_stream()));
            }
        }
        let events: Vec<Event> = phys.iter().flat_map(|p| p.all_events()).collect();
        if events.is_empty() {
            return Ok(());
        }
        self.engine
            .wait(&events, true, self.options.time_out_ms)
            .map(|_| ())
            .map_err(Error::from_wait)
    }

    /// Wait for all or any of `events`.
    pub fn event_wait(&self, events: &[Event], wait_all: bool, timeout: Timeout) -> Result<WaitOutcome> {
        if self.options.dep_policy == DepPolicy::None {
            return Ok(WaitOutcome::default());
        }
        if events.is_empty() {
            return Err(Error::OutOfRange("no events to wait on".to_string()));
        }
        let started = Instant::now();
        let outcome = self.engine.wait(events, wait_all, timeout).map_err(Error::from_wait)?;
        performance::record_wait(events.len(), outcome.num_signaled, started.elapsed().as_micros() as u64);
        Ok(outcome)
    }

    // ----- buffers -----

    /// Create a buffer over `[base, base + len)` in every logical domain.
    pub fn alloc1d(&self, base: u64, len: u64) -> Result<()> {
        self.alloc1d_ex(base, len, BufferProps::default(), BufferDomains::All)
    }

    #[tracing::instrument(target = "hstreams::trace", level = "debug", skip(self), err)]
    pub fn alloc1d_ex(&self, base: u64, len: u64, props: BufferProps, domains: BufferDomains) -> Result<()> {
        if props.mem_type != MemType::Normal || props.flags.contains(BufferFlags::AFFINITIZED) {
            return Err(Error::NotImplemented(format!(
                "{:?} memory with flags {:#x}",
                props.mem_type,
                props.flags.bits()
            )));
        }
        if props.flags.has_unknown_bits() {
            return Err(Error::OutOfRange(format!("unknown buffer flags {:#x}", props.flags.bits())));
        }
        if len == 0 || base.checked_add(len).is_none() {
            return Err(Error::OutOfRange(format!("invalid buffer range {base:#x}+{len}")));
        }
        if base == 0 {
            return Err(Error::NullPtr("buffer base address is null".to_string()));
        }

        let table = self.log_domains.read();
        let targets: Vec<Arc<LogDomain>> = match &domains {
            BufferDomains::All => table.domains.values().cloned().collect(),
            BufferDomains::Only(ids) => {
                let mut targets = Vec::with_capacity(ids.len() + 1);
                if let Some(source) = table.domains.get(&LogDomainId::SOURCE) {
                    targets.push(Arc::clone(source));
                }
                for (index, id) in ids.iter().enumerate() {
                    if id.is_source() {
                        return Err(Error::DomainOutOfRange(
                            "the source logical domain is always attached".to_string(),
                        ));
                    }
                    let domain = table
                        .domains
                        .get(id)
                        .ok_or_else(|| Error::DomainOutOfRange(format!("unknown logical domain {id}")))?;
                    if ids[..index].contains(id) {
                        return Err(Error::InconsistentArgs(format!("{id} listed twice")));
                    }
                    targets.push(Arc::clone(domain));
                }
                targets
            }
        };

        let mut buffers = self.log_buffers.write();
        match buffers.lookup_range(base, len) {
            (_, Overlap::Exact) => {
                return Err(Error::AlreadyFound(format!("{base:#x}+{len} lies in an existing buffer")));
            }
            (_, Overlap::Partial) => {
                return Err(Error::OverlappingResources(format!(
                    "{base:#x}+{len} overlaps an existing buffer"
                )));
            }
            (_, Overlap::NoOverlap) => {}
        }

        let buffer = Arc::new(LogBuffer::new(base, len, props));
        for domain in &targets {
            if let Err(err) = buffer.attach(domain) {
                buffer.detach_all();
                return Err(err);
            }
        }
        buffers.insert(buffer);
        tracing::debug!(target: targets::MEM, base, len, domains = targets.len(), "logical buffer created");
        Ok(())
    }

    /// Instantiate an existing buffer in more logical domains.
    pub fn add_buffer_log_domains(&self, addr: u64, ids: &[LogDomainId]) -> Result<()> {
        if ids.is_empty() {
            return Err(Error::OutOfRange("no logical domains given".to_string()));
        }
        if ids.iter().any(|id| id.is_source()) {
            return Err(Error::DomainOutOfRange("the source logical domain is always attached".to_string()));
        }
        let table = self.log_domains.read();
        let buffers = self.log_buffers.read();
        let buffer = buffers
            .lookup(addr)
            .ok_or_else(|| Error::NotFound(format!("no buffer at {addr:#x}")))?;

        let mut targets = Vec::with_capacity(ids.len());
        for (index, id) in ids.iter().enumerate() {
            let domain = table
                .domains
                .get(id)
                .ok_or_else(|| Error::DomainOutOfRange(format!("unknown logical domain {id}")))?;
            if ids[..index].contains(id) {
                return Err(Error::InconsistentArgs(format!("{id} listed twice")));
            }
            if buffer.is_attached(*id) {
                return Err(Error::AlreadyFound(format!("buffer {addr:#x} is already in {id}")));
            }
            targets.push(domain);
        }

        for (index, domain) in targets.iter().enumerate() {
            if let Err(err) = buffer.attach(domain) {
                for attached in &targets[..index] {
                    if let Err(cleanup) = buffer.detach(attached.id()) {
                        tracing::warn!(target: targets::MEM, error = %cleanup, "rollback of buffer attach failed");
                    }
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Drop instantiations of a buffer. `All` keeps the source instantiation.
    pub fn remove_buffer_log_domains(&self, addr: u64, domains: BufferDomains) -> Result<()> {
        let ids = match &domains {
            BufferDomains::Only(ids) if ids.is_empty() => {
                return Err(Error::OutOfRange("no logical domains given".to_string()));
            }
            BufferDomains::Only(ids) if ids.iter().any(|id| id.is_source()) => {
                return Err(Error::DomainOutOfRange(
                    "the source instantiation cannot be removed".to_string(),
                ));
            }
            BufferDomains::Only(ids) => Some(ids),
            BufferDomains::All => None,
        };

        let table = self.log_domains.read();
        let buffers = self.log_buffers.read();
        let buffer = buffers
            .lookup(addr)
            .ok_or_else(|| Error::NotFound(format!("no buffer at {addr:#x}")))?;

        let detach: Vec<LogDomainId> = match ids {
            None => buffer.log_domain_ids().into_iter().filter(|id| !id.is_source()).collect(),
            Some(ids) => {
                for (index, id) in ids.iter().enumerate() {
                    if !table.domains.contains_key(id) {
                        return Err(Error::DomainOutOfRange(format!("unknown logical domain {id}")));
                    }
                    if ids[..index].contains(id) {
                        return Err(Error::InconsistentArgs(format!("{id} listed twice")));
                    }
                    if !buffer.is_attached(*id) {
                        return Err(Error::NotFound(format!("buffer {addr:#x} is not in {id}")));
                    }
                }
                ids.clone()
            }
        };
        let mut released = Vec::with_capacity(detach.len());
        for id in detach {
            released.push(buffer.detach(id)?);
        }
        drop(buffers);
        drop(table);
        drop(released);
        Ok(())
    }

    /// Logical domains (other than the source) a buffer is instantiated in.
    pub fn buffer_num_log_domains(&self, addr: u64) -> Result<usize> {
        Ok(self.buffer_at(addr)?.num_attached_log_domains())
    }

    pub fn buffer_log_domains(&self, addr: u64) -> Result<Vec<LogDomainId>> {
        Ok(self
            .buffer_at(addr)?
            .log_domain_ids()
            .into_iter()
            .filter(|id| !id.is_source())
            .collect())
    }

    pub fn buffer_props(&self, addr: u64) -> Result<BufferProps> {
        Ok(self.buffer_at(addr)?.props())
    }

    /// Destroy the buffer containing `addr`.
    #[tracing::instrument(target = "hstreams::trace", level = "debug", skip(self), err)]
    pub fn dealloc(&self, addr: u64) -> Result<()> {
        let removed = {
            let mut buffers = self.log_buffers.write();
            let start = buffers
                .lookup(addr)
                .map(|b| b.start())
                .ok_or_else(|| Error::NotFound(format!("no buffer at {addr:#x}")))?;
            buffers.remove(start)
        };
        if let Some(buffer) = removed {
            buffer.detach_all();
        }
        Ok(())
    }

    /// Number of live logical buffers.
    pub fn num_buffers(&self) -> usize {
        self.log_buffers.read().len()
    }

    fn buffer_at(&self, addr: u64) -> Result<Arc<LogBuffer>> {
        self.log_buffers
            .read()
            .lookup(addr)
            .ok_or_else(|| Error::NotFound(format!("no buffer at {addr:#x}")))
    }

    // ----- partitioning -----

    fn partition_targets(&self) -> Vec<PartitionTarget> {
        let domains: Vec<&Arc<PhysDomain>> = if self.accelerators.is_empty() {
            vec![&self.host]
        } else {
            self.accelerators.iter().collect()
        };
        domains
            .into_iter()
            .map(|d| PartitionTarget {
                phys: d.id(),
                max_mask: *d.max_mask(),
                avoid_mask: *d.avoid_mask(),
            })
            .collect()
    }

    /// Split the physical domains into `num_domains` logical domains with
    /// `streams_per_domain[i]` streams each, `oversubscription` times over.
    ///
    /// A later call must ask for the same number of logical domains; it
    /// reuses them and issues new stream IDs after the previous ones.
    #[tracing::instrument(target = "hstreams::trace", level = "debug", skip(self), err)]
    pub fn partition(
        &self,
        num_domains: usize,
        streams_per_domain: &[u32],
        oversubscription: u32,
    ) -> Result<PartitionPlan> {
        partition::validate_request(num_domains, streams_per_domain, oversubscription)?;
        let mut app = self.app.lock();

        let domains = if app.domains.is_empty() {
            partition::plan_domains(
                &self.partition_targets(),
                num_domains,
                self.options.phys_domains_limit as usize,
            )?
        } else {
            if app.domains.len() != num_domains {
                return Err(Error::InconsistentArgs(format!(
                    "{num_domains} logical domains requested after an earlier {}",
                    app.domains.len()
                )));
            }
            let table = self.log_domains.read();
            app.domains
                .iter()
                .map(|id| {
                    table
                        .domains
                        .get(id)
                        .map(|d| PlannedDomain {
                            phys: d.phys_domain().id(),
                            mask: *d.mask(),
                            existing: Some(*id),
                        })
                        .ok_or_else(|| Error::NotFound(format!("partitioned logical domain {id} was removed")))
                })
                .collect::<Result<Vec<_>>>()?
        };
        let plan = partition::plan_streams(domains, streams_per_domain, oversubscription, app.next_stream)?;

        let mut created_domains = Vec::new();
        let mut created_streams = Vec::new();
        match self.apply_plan(&plan, &mut created_domains, &mut created_streams) {
            Ok(ids) => {
                if app.domains.is_empty() {
                    app.domains = ids;
                }
                if let Some(last) = plan.streams.last() {
                    app.next_stream = last.id.id().saturating_add(1);
                }
                tracing::info!(
                    target: targets::MISC,
                    domains = plan.domains.len(),
                    streams = plan.num_streams(),
                    "partitioning complete"
                );
                Ok(plan)
            }
            Err(err) => {
                for id in created_streams.iter().rev() {
                    if let Err(cleanup) = self.stream_destroy(*id) {
                        tracing::warn!(target: targets::MISC, stream = %id, error = %cleanup, "rollback failed");
                    }
                }
                if !created_domains.is_empty() {
                    if let Err(cleanup) = self.remove_log_domains(&created_domains) {
                        tracing::warn!(target: targets::MISC, error = %cleanup, "rollback failed");
                    }
                }
                Err(err)
            }
        }
    }

    fn apply_plan(
        &self,
        plan: &PartitionPlan,
        created_domains: &mut Vec<LogDomainId>,
        created_streams: &mut Vec<LogStreamId>,
    ) -> Result<Vec<LogDomainId>> {
        let mut ids = Vec::with_capacity(plan.domains.len());
        for planned in &plan.domains {
            let id = match planned.existing {
                Some(id) => id,
                None => {
                    let (id, _) = self.add_log_domain(planned.phys, planned.mask)?;
                    created_domains.push(id);
                    id
                }
            };
            ids.push(id);
        }
        for stream in &plan.streams {
            self.stream_create(stream.id, ids[stream.domain], stream.mask)?;
            created_streams.push(stream.id);
        }
        Ok(ids)
    }

    /// One logical domain per partition target, `streams_per_domain`
    /// streams each.
    pub fn partition_evenly(&self, streams_per_domain: u32, oversubscription: u32) -> Result<PartitionPlan> {
        let limit = self.options.phys_domains_limit as usize;
        let count = self.partition_targets().len().min(limit).max(1);
        self.partition(count, &vec![streams_per_domain; count], oversubscription)
    }

    /// Logical domains created by partitioning, in plan order.
    pub fn partitioned_domains(&self) -> Vec<LogDomainId> {
        self.app.lock().domains.clone()
    }

    // ----- app helpers -----

    /// Fill `len` bytes at `dst` (in the stream's domain) with `value`.
    pub fn app_memset(&self, stream: LogStreamId, dst: u64, value: u8, len: u64) -> Result<Event> {
        self.enqueue_compute(stream, MEMSET_SINK, &[len, u64::from(value)], &[dst], None)
    }

    /// Copy `len` bytes from `src` to `dst`, both in the stream's domain.
    pub fn app_memcpy(&self, stream: LogStreamId, dst: u64, src: u64, len: u64) -> Result<Event> {
        self.enqueue_compute(stream, MEMCPY_SINK, &[len], &[src, dst], None)
    }
}

/// The buffer containing `addr` and its instantiation in `domain`.
fn instantiation_at(
    buffers: &LogBufferCollection,
    addr: u64,
    domain: LogDomainId,
) -> Result<(Arc<LogBuffer>, Arc<PhysBuffer>)> {
    let buffer = buffers
        .lookup(addr)
        .ok_or_else(|| Error::NotFound(format!("no buffer at {addr:#x}")))?;
    let phys = buffer
        .instantiation(domain)
        .ok_or_else(|| Error::NotFound(format!("buffer {:#x} is not instantiated in {domain}", buffer.start())))?;
    Ok((buffer, phys))
}

/// Like [`instantiation_at`] but also checks `[addr, addr + len)` stays in
/// the buffer.
fn checked_range(
    buffers: &LogBufferCollection,
    addr: u64,
    len: u64,
    domain: LogDomainId,
) -> Result<(Arc<LogBuffer>, Arc<PhysBuffer>)> {
    let buffer = buffers
        .lookup(addr)
        .ok_or_else(|| Error::NotFound(format!("no buffer at {addr:#x}")))?;
    if addr.checked_add(len).map_or(true, |end| end > buffer.end()) {
        return Err(Error::OutOfRange(format!(
            "{addr:#x}+{len} runs past the buffer end {:#x}",
            buffer.end()
        )));
    }
    let phys = buffer
        .instantiation(domain)
        .ok_or_else(|| Error::NotFound(format!("buffer {:#x} is not instantiated in {domain}", buffer.start())))?;
    Ok((buffer, phys))
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("accelerators", &self.phys_domain_ids())
            .field("log_domains", &self.log_domains.read().domains.len())
            .field("log_streams", &self.log_streams.read().len())
            .field("log_buffers", &self.log_buffers.read().len())
            .finish()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        let streams = std::mem::take(self.log_streams.get_mut());
        for domain in self.log_domains.get_mut().domains.values() {
            drop(domain.take_streams());
        }
        drop(streams);

        for buffer in self.log_buffers.get_mut().drain() {
            buffer.detach_all();
        }

        let domains = std::mem::take(&mut self.log_domains.get_mut().domains);
        for (id, domain) in domains {
            domain.phys_domain().remove_log_domain_mapping(id);
        }
        tracing::info!(target: targets::MISC, "runtime finalized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DepPolicy;

    fn runtime(devices: u32, threads: u32) -> Runtime {
        let options = Options {
            loopback_devices: devices,
            loopback_threads_per_device: threads,
            time_out_ms: Timeout::Millis(10_000),
            ..Options::default()
        };
        Runtime::loopback(options).unwrap()
    }

    fn addr(bytes: &mut [u8]) -> u64 {
        bytes.as_mut_ptr() as u64
    }

    #[test]
    fn source_domain_is_created_on_the_host() {
        let rt = runtime(2, 8);
        let counts = rt.num_phys_domains();
        assert_eq!(counts.total, 2);
        assert_eq!(counts.active, 2);
        assert!(counts.homogeneous);

        let source = rt.log_domain_details(LogDomainId::SOURCE).unwrap();
        assert_eq!(source.phys_domain, PhysDomainId::HOST);
        assert!(source.mask.is_empty());
        assert_eq!(rt.log_domain_ids(PhysDomainId::HOST).unwrap(), vec![LogDomainId::SOURCE]);
        assert!(matches!(
            rt.phys_domain_details(PhysDomainId::new(7)),
            Err(Error::DomainOutOfRange(_))
        ));
    }

    #[test]
    fn phys_domains_limit_caps_accelerators() {
        let options = Options {
            loopback_devices: 3,
            loopback_threads_per_device: 4,
            phys_domains_limit: 1,
            ..Options::default()
        };
        let rt = Runtime::loopback(options).unwrap();
        let counts = rt.num_phys_domains();
        assert_eq!((counts.total, counts.active), (3, 1));
    }

    #[test]
    fn log_domain_overlap_rules() {
        let rt = runtime(1, 8);
        let phys = PhysDomainId::new(0);

        let (first, overlap) = rt.add_log_domain(phys, CpuMask::from_range(0..4)).unwrap();
        assert_eq!(overlap, Overlap::NoOverlap);
        let (second, overlap) = rt.add_log_domain(phys, CpuMask::from_range(0..4)).unwrap();
        assert_eq!(overlap, Overlap::Exact);
        assert_ne!(first, second);

        assert!(matches!(
            rt.add_log_domain(phys, CpuMask::from_range(2..6)),
            Err(Error::OverlappingResources(_))
        ));
        assert!(matches!(
            rt.add_log_domain(phys, CpuMask::new()),
            Err(Error::CpuMaskOutOfRange(_))
        ));
        assert!(matches!(
            rt.add_log_domain(phys, CpuMask::from_range(6..9)),
            Err(Error::CpuMaskOutOfRange(_))
        ));
        assert!(matches!(
            rt.add_log_domain(PhysDomainId::new(3), CpuMask::from_range(0..1)),
            Err(Error::DomainOutOfRange(_))
        ));
    }

    #[test]
    fn streams_with_equal_masks_share_hardware() {
        let rt = runtime(1, 8);
        let (domain, _) = rt.add_log_domain(PhysDomainId::new(0), CpuMask::from_range(0..8)).unwrap();
        let mask = CpuMask::from_range(0..2);

        rt.stream_create(LogStreamId::new(0), domain, mask).unwrap();
        rt.stream_create(LogStreamId::new(1), domain, mask).unwrap();
        let level = rt.oversubscription_level(PhysDomainId::new(0)).unwrap();
        assert_eq!(&level[..3], &[1, 1, 0]);
        assert!(matches!(
            rt.stream_create(LogStreamId::new(1), domain, mask),
            Err(Error::AlreadyFound(_))
        ));

        rt.stream_destroy(LogStreamId::new(0)).unwrap();
        assert_eq!(rt.oversubscription_level(PhysDomainId::new(0)).unwrap()[0], 1);
        rt.stream_destroy(LogStreamId::new(1)).unwrap();
        assert_eq!(rt.oversubscription_level(PhysDomainId::new(0)).unwrap()[0], 0);
        assert!(matches!(rt.stream_destroy(LogStreamId::new(1)), Err(Error::NotFound(_))));
    }

    #[test]
    fn memset_on_sink_then_copy_back() {
        let rt = runtime(1, 4);
        let (domain, _) = rt.add_log_domain(PhysDomainId::new(0), CpuMask::from_range(0..4)).unwrap();
        let stream = LogStreamId::new(0);
        rt.stream_create(stream, domain, CpuMask::from_range(0..4)).unwrap();

        let mut data = vec![0u8; 256];
        rt.alloc1d(addr(&mut data), data.len() as u64).unwrap();
        rt.app_memset(stream, addr(&mut data), 0x5a, 256).unwrap();
        rt.enqueue_data_1d(stream, addr(&mut data) + 16, addr(&mut data) + 16, 64, XferDirection::SinkToSrc)
            .unwrap();
        rt.stream_synchronize(stream).unwrap();

        assert!(data[..16].iter().all(|b| *b == 0));
        assert!(data[16..80].iter().all(|b| *b == 0x5a));
        assert!(data[80..].iter().all(|b| *b == 0));
        rt.dealloc(addr(&mut data)).unwrap();
    }

    #[test]
    fn transfer_validation_order() {
        let rt = runtime(1, 4);
        let (domain, _) = rt.add_log_domain(PhysDomainId::new(0), CpuMask::from_range(0..4)).unwrap();
        let stream = LogStreamId::new(3);
        rt.stream_create(stream, domain, CpuMask::from_range(0..1)).unwrap();
        let mut data = vec![0u8; 64];
        rt.alloc1d(addr(&mut data), 64).unwrap();
        let base = addr(&mut data);

        let xdomain = |dst, src, len, dst_domain, src_domain| {
            rt.enqueue_data_xdomain_1d(stream, dst, src, len, dst_domain, src_domain)
        };
        assert!(matches!(xdomain(0, base, 0, domain, LogDomainId::SOURCE), Err(Error::NullPtr(_))));
        assert!(matches!(xdomain(base, 0, 8, domain, LogDomainId::SOURCE), Err(Error::NullPtr(_))));
        assert!(matches!(xdomain(base, base, 0, domain, LogDomainId::SOURCE), Err(Error::OutOfRange(_))));
        assert!(matches!(
            xdomain(base, base, 8, LogDomainId::SOURCE, LogDomainId::SOURCE),
            Err(Error::OutOfRange(_))
        ));
        assert!(matches!(xdomain(base, base + 4, 8, domain, domain), Err(Error::OutOfRange(_))));
        assert!(matches!(xdomain(base + 60, base, 8, domain, LogDomainId::SOURCE), Err(Error::OutOfRange(_))));
        assert!(matches!(xdomain(0x10, base, 8, domain, LogDomainId::SOURCE), Err(Error::NotFound(_))));
        assert!(xdomain(base + 32, base, 32, domain, domain).is_ok());
        rt.thread_synchronize().unwrap();
    }

    #[test]
    fn compute_argument_checks() {
        let rt = runtime(1, 4);
        let (domain, _) = rt.add_log_domain(PhysDomainId::new(0), CpuMask::from_range(0..4)).unwrap();
        let stream = LogStreamId::new(0);
        rt.stream_create(stream, domain, CpuMask::from_range(0..4)).unwrap();

        assert!(matches!(rt.enqueue_compute(stream, "", &[], &[], None), Err(Error::BadName(_))));
        let long = "f".repeat(MAX_FUNC_NAME_SIZE);
        assert!(matches!(rt.enqueue_compute(stream, &long, &[], &[], None), Err(Error::BadName(_))));
        assert!(matches!(
            rt.enqueue_compute(stream, MEMSET_SINK, &[], &[], Some(ReturnValue::new(65))),
            Err(Error::OutOfRange(_))
        ));
        assert!(matches!(
            rt.enqueue_compute(stream, MEMSET_SINK, &[0; 17], &[], None),
            Err(Error::TooManyArgs(_))
        ));
        assert!(matches!(
            rt.enqueue_compute(LogStreamId::new(9), MEMSET_SINK, &[], &[], None),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            rt.enqueue_compute(stream, MEMSET_SINK, &[1, 0], &[0x40], None),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn compute_return_value_is_filled() {
        let rt = runtime(1, 2);
        rt.registry().register("answer", |_, ret| {
            ret[..8].copy_from_slice(&42u64.to_ne_bytes());
        });
        let (domain, _) = rt.add_log_domain(PhysDomainId::new(0), CpuMask::from_range(0..2)).unwrap();
        let stream = LogStreamId::new(0);
        rt.stream_create(stream, domain, CpuMask::from_range(0..2)).unwrap();

        let ret = ReturnValue::new(8);
        let event = rt.enqueue_compute(stream, "answer", &[], &[], Some(ret.clone())).unwrap();
        let outcome = rt.event_wait(&[event], true, Timeout::Millis(5_000)).unwrap();
        assert_eq!(outcome.num_signaled, 1);
        assert_eq!(ret.read::<u64>(), Some(42));
    }

    #[test]
    fn alloc_rejections() {
        let rt = runtime(1, 4);
        let mut data = vec![0u8; 128];
        let base = addr(&mut data);
        let props = |mem, flags| BufferProps::new(mem, crate::types::AllocPolicy::Preferred, flags);

        assert!(matches!(
            rt.alloc1d_ex(base, 8, props(MemType::HighBandwidth, BufferFlags::NONE), BufferDomains::All),
            Err(Error::NotImplemented(_))
        ));
        assert!(matches!(
            rt.alloc1d_ex(base, 8, props(MemType::Normal, BufferFlags::INVALID), BufferDomains::All),
            Err(Error::OutOfRange(_))
        ));
        assert!(matches!(rt.alloc1d(base, 0), Err(Error::OutOfRange(_))));
        assert!(matches!(rt.alloc1d(0, 8), Err(Error::NullPtr(_))));
        assert!(matches!(
            rt.alloc1d_ex(base, 8, BufferProps::default(), BufferDomains::Only(vec![LogDomainId::SOURCE])),
            Err(Error::DomainOutOfRange(_))
        ));

        rt.alloc1d(base, 64).unwrap();
        assert!(matches!(rt.alloc1d(base + 8, 8), Err(Error::AlreadyFound(_))));
        assert!(matches!(rt.alloc1d(base + 32, 64), Err(Error::OverlappingResources(_))));
        rt.alloc1d(base + 64, 64).unwrap();
        assert_eq!(rt.num_buffers(), 2);
        assert!(matches!(rt.dealloc(base + 200), Err(Error::NotFound(_))));
    }

    #[test]
    fn incremental_buffers_follow_new_domains() {
        let rt = runtime(1, 8);
        let mut plain = vec![0u8; 64];
        let mut growing = vec![0u8; 64];
        rt.alloc1d(addr(&mut plain), 64).unwrap();
        let incremental = BufferProps::new(
            MemType::Normal,
            crate::types::AllocPolicy::Preferred,
            BufferFlags::INCREMENTAL,
        );
        rt.alloc1d_ex(addr(&mut growing), 64, incremental, BufferDomains::All).unwrap();

        let (domain, _) = rt.add_log_domain(PhysDomainId::new(0), CpuMask::from_range(0..2)).unwrap();
        assert_eq!(rt.buffer_log_domains(addr(&mut growing)).unwrap(), vec![domain]);
        assert_eq!(rt.buffer_num_log_domains(addr(&mut plain)).unwrap(), 0);

        rt.add_buffer_log_domains(addr(&mut plain), &[domain]).unwrap();
        assert!(matches!(
            rt.add_buffer_log_domains(addr(&mut plain), &[domain]),
            Err(Error::AlreadyFound(_))
        ));
        rt.remove_log_domains(&[domain]).unwrap();
        assert_eq!(rt.buffer_num_log_domains(addr(&mut plain)).unwrap(), 0);
        assert_eq!(rt.buffer_num_log_domains(addr(&mut growing)).unwrap(), 0);
    }

    #[test]
    fn removing_buffer_domains() {
        let rt = runtime(1, 8);
        let (a, _) = rt.add_log_domain(PhysDomainId::new(0), CpuMask::from_range(0..2)).unwrap();
        let (b, _) = rt.add_log_domain(PhysDomainId::new(0), CpuMask::from_range(2..4)).unwrap();
        let mut data = vec![0u8; 64];
        rt.alloc1d(addr(&mut data), 64).unwrap();
        assert_eq!(rt.buffer_log_domains(addr(&mut data)).unwrap(), vec![a, b]);

        rt.remove_buffer_log_domains(addr(&mut data), BufferDomains::Only(vec![a])).unwrap();
        assert!(matches!(
            rt.remove_buffer_log_domains(addr(&mut data), BufferDomains::Only(vec![a])),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            rt.remove_buffer_log_domains(addr(&mut data), BufferDomains::Only(vec![LogDomainId::SOURCE])),
            Err(Error::DomainOutOfRange(_))
        ));
        rt.remove_buffer_log_domains(addr(&mut data), BufferDomains::All).unwrap();
        assert!(rt.buffer_log_domains(addr(&mut data)).unwrap().is_empty());
    }

    #[test]
    fn remove_log_domains_checks() {
        let rt = runtime(1, 8);
        assert!(matches!(rt.remove_log_domains(&[]), Err(Error::OutOfRange(_))));
        assert!(matches!(
            rt.remove_log_domains(&[LogDomainId::SOURCE]),
            Err(Error::DomainOutOfRange(_))
        ));
        assert!(matches!(rt.remove_log_domains(&[LogDomainId::new(5)]), Err(Error::NotFound(_))));

        let (domain, _) = rt.add_log_domain(PhysDomainId::new(0), CpuMask::from_range(0..4)).unwrap();
        rt.stream_create(LogStreamId::new(0), domain, CpuMask::from_range(0..4)).unwrap();
        rt.remove_log_domains(&[domain]).unwrap();
        assert!(matches!(rt.log_stream_details(LogStreamId::new(0)), Err(Error::NotFound(_))));
        assert_eq!(rt.oversubscription_level(PhysDomainId::new(0)).unwrap(), vec![0; 8]);
        assert!(rt.add_log_domain(PhysDomainId::new(0), CpuMask::from_range(2..6)).is_ok());
    }

    #[test]
    fn draining_a_removed_domain_leaves_other_domains_usable() {
        use std::time::Duration;

        let rt = runtime(2, 8);
        let (a, _) = rt.add_log_domain(PhysDomainId::new(0), CpuMask::from_range(0..4)).unwrap();
        let (b, _) = rt.add_log_domain(PhysDomainId::new(1), CpuMask::from_range(0..4)).unwrap();
        let (on_a, on_b) = (LogStreamId::new(0), LogStreamId::new(1));
        rt.stream_create(on_a, a, CpuMask::from_range(0..4)).unwrap();
        rt.stream_create(on_b, b, CpuMask::from_range(0..4)).unwrap();
        let mut data = vec![0u8; 64];
        let base = addr(&mut data);
        rt.alloc1d(base, 64).unwrap();

        let gate = rt.engine().register_user_event().unwrap();
        rt.event_stream_wait(on_a, &[gate], WaitAddresses::Control).unwrap();
        rt.app_memset(on_a, base, 1, 64).unwrap();

        std::thread::scope(|scope| {
            let engine = Arc::clone(rt.engine());
            scope.spawn(move || {
                std::thread::sleep(Duration::from_secs(3));
                let _ = engine.signal_user_event(gate);
            });
            let removal = scope.spawn(|| rt.remove_log_domains(&[a]));

            let started = Instant::now();
            while rt.log_domain_details(a).is_ok() {
                std::thread::yield_now();
            }
            rt.app_memset(on_b, base, 2, 64).unwrap();
            rt.stream_synchronize(on_b).unwrap();
            assert_eq!(rt.num_log_streams(b).unwrap(), 1);
            assert!(started.elapsed() < Duration::from_secs(2));
            assert!(!removal.is_finished());

            rt.engine().signal_user_event(gate).unwrap();
            removal.join().unwrap().unwrap();
        });
        assert!(matches!(rt.log_domain_details(a), Err(Error::DomainOutOfRange(_))));
        assert_eq!(rt.buffer_log_domains(base).unwrap(), vec![b]);
    }

    #[test]
    fn partition_reuses_domains_on_second_call() {
        let rt = runtime(1, 14);
        let plan = rt.partition(1, &[3], 1).unwrap();
        let sizes: Vec<usize> = plan.streams.iter().map(|s| s.mask.count()).collect();
        assert_eq!(sizes, vec![4, 3, 3]);
        let domains = rt.partitioned_domains();
        assert_eq!(domains.len(), 1);

        let again = rt.partition(1, &[3], 1).unwrap();
        assert_eq!(again.streams[0].id, LogStreamId::new(3));
        assert_eq!(rt.partitioned_domains(), domains);
        assert_eq!(rt.num_log_streams(domains[0]).unwrap(), 6);
        assert!(matches!(rt.partition(2, &[1, 1], 1), Err(Error::InconsistentArgs(_))));
    }

    #[test]
    fn failed_partition_leaves_nothing_behind() {
        let rt = runtime(1, 8);
        assert!(matches!(rt.partition(1, &[20], 1), Err(Error::OutOfRange(_))));

        // A user stream already holds ID 1, so the plan fails part way.
        let (user, _) = rt.add_log_domain(PhysDomainId::new(0), CpuMask::from_range(0..1)).unwrap();
        rt.stream_create(LogStreamId::new(1), user, CpuMask::from_range(0..1)).unwrap();
        let before = rt.log_domain_ids(PhysDomainId::new(0)).unwrap();

        let result = rt.partition(1, &[3], 1);
        assert!(matches!(result, Err(Error::AlreadyFound(_))));
        assert_eq!(rt.log_domain_ids(PhysDomainId::new(0)).unwrap(), before);
        assert!(matches!(rt.log_stream_details(LogStreamId::new(0)), Err(Error::NotFound(_))));
        assert_eq!(rt.log_stream_details(LogStreamId::new(1)).unwrap().log_domain, user);
        assert!(rt.partitioned_domains().is_empty());
        assert_eq!(rt.oversubscription_level(PhysDomainId::new(0)).unwrap()[1..].iter().sum::<u32>(), 0);
    }

    #[test]
    fn no_dependency_policy_skips_waits() {
        let options = Options {
            dep_policy: DepPolicy::None,
            loopback_devices: 1,
            loopback_threads_per_device: 2,
            ..Options::default()
        };
        let rt = Runtime::loopback(options).unwrap();
        let (domain, _) = rt.add_log_domain(PhysDomainId::new(0), CpuMask::from_range(0..2)).unwrap();
        rt.stream_create(LogStreamId::new(0), domain, CpuMask::from_range(0..2)).unwrap();
        assert_eq!(rt.event_wait(&[], true, Timeout::Infinite).unwrap(), WaitOutcome::default());
        assert_eq!(
            rt.event_stream_wait(LogStreamId::new(0), &[], WaitAddresses::Control).unwrap(),
            None
        );
    }

    #[test]
    fn event_stream_wait_gates_the_stream() {
        let rt = runtime(1, 2);
        let (domain, _) = rt.add_log_domain(PhysDomainId::new(0), CpuMask::from_range(0..2)).unwrap();
        let stream = LogStreamId::new(0);
        rt.stream_create(stream, domain, CpuMask::from_range(0..2)).unwrap();
        let mut data = vec![0u8; 32];
        rt.alloc1d(addr(&mut data), 32).unwrap();

        let gate = rt.engine().register_user_event().unwrap();
        let marker = rt
            .event_stream_wait(stream, &[gate], WaitAddresses::Buffers(vec![addr(&mut data)]))
            .unwrap();
        assert!(marker.is_some());
        let fill = rt.app_memset(stream, addr(&mut data), 1, 32).unwrap();
        assert!(matches!(
            rt.event_wait(&[fill], true, Timeout::Millis(50)),
            Err(Error::TimeOutReached(_))
        ));
        rt.engine().signal_user_event(gate).unwrap();
        rt.event_wait(&[fill], true, Timeout::Millis(5_000)).unwrap();

        assert!(matches!(
            rt.event_stream_wait(stream, &[], WaitAddresses::Buffers(vec![0x20])),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(rt.event_wait(&[], true, Timeout::Infinite), Err(Error::OutOfRange(_))));
    }

    #[test]
    fn zero_accelerators_partition_the_host() {
        let rt = runtime(0, 4);
        assert_eq!(rt.num_phys_domains().active, 0);
        let plan = rt.partition_evenly(1, 1).unwrap();
        assert_eq!(plan.domains[0].phys, PhysDomainId::HOST);
        assert_eq!(plan.num_streams(), 1);
    }

    #[test]
    fn drop_releases_engine_resources() {
        let registry = Arc::new(SinkRegistry::new());
        let engine = Arc::new(LoopbackEngine::new(Arc::clone(&registry), 1, 4));
        let dyn_engine: Arc<dyn Engine> = Arc::clone(&engine) as Arc<dyn Engine>;
        let mut data = vec![0u8; 64];
        {
            let rt = Runtime::new(dyn_engine, registry, Options::default()).unwrap();
            let (domain, _) = rt.add_log_domain(PhysDomainId::new(0), CpuMask::from_range(0..4)).unwrap();
            rt.stream_create(LogStreamId::new(0), domain, CpuMask::from_range(0..4)).unwrap();
            rt.alloc1d(addr(&mut data), 64).unwrap();
            assert_eq!(engine.live_pipelines(), 1);
            assert!(engine.live_buffers() >= 2);
        }
        assert_eq!(engine.live_pipelines(), 0);
        assert_eq!(engine.live_buffers(), 0);
    }
}
