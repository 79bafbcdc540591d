//! In-process Engine.
//!
//! Emulated accelerator domains share the host address space: buffers are
//! host allocations, every pipeline is a dedicated thread and copies run on
//! a single copy thread. Events live in one table guarded by a mutex and a
//! condition variable.
//!
//! Copies and markers are parked in the event table until their
//! dependencies resolve, so the copy thread only ever sees ready work and a
//! gated transfer never holds back an unrelated one. Signaled events are
//! retired from the table; an ID that was handed out and is no longer
//! tracked reads as signaled.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use hstreams_tracing::{performance, targets};

use super::{Engine, EngineBufferFlags, EngineError, EngineInfo, EngineResult};
use crate::config::{Options, Timeout};
use crate::cpu_mask::CpuMask;
use crate::host_alloc::AlignedBlock;
use crate::sink::{self, ReturnValue, SinkRegistry};
use crate::types::{EngineBufferHandle, Event, Isa, PhysDomainId, PipelineHandle, WaitOutcome};

const EMULATED_FREQ_MHZ: u32 = 1100;
const EMULATED_MEMORY: u64 = 16 << 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventState {
    Pending,
    Signaled,
    Canceled,
}

enum Job {
    Run {
        block: Vec<u64>,
        ret: Option<ReturnValue>,
    },
    Copy {
        dst: u64,
        src: u64,
        len: u64,
    },
    Marker,
}

/// Action queued on a pipeline; the pipeline thread resolves `deps`.
struct Submission {
    job: Job,
    deps: Vec<Event>,
    completion: Event,
}

/// Action whose dependencies are all signaled.
struct ReadyJob {
    job: Job,
    completion: Event,
}

struct Parked {
    job: Job,
    remaining: usize,
}

struct EventBook {
    next: u64,
    /// Pending events, each with the parked actions (by completion ID) it gates.
    pending: HashMap<u64, Vec<u64>>,
    canceled: HashSet<u64>,
    parked: HashMap<u64, Parked>,
}

impl EventBook {
    fn state(&self, id: u64) -> Option<EventState> {
        if id == 0 || id >= self.next {
            None
        } else if self.pending.contains_key(&id) {
            Some(EventState::Pending)
        } else if self.canceled.contains(&id) {
            Some(EventState::Canceled)
        } else {
            Some(EventState::Signaled)
        }
    }

    fn allocate(&mut self) -> u64 {
        let id = self.next;
        self.next += 1;
        id
    }

    /// Finish `id` and everything parked behind it. Returns the actions that
    /// became ready.
    fn settle(&mut self, id: u64, state: EventState) -> Vec<ReadyJob> {
        let mut ready = Vec::new();
        let mut work = vec![(id, state)];
        while let Some((id, state)) = work.pop() {
            let Some(gated) = self.pending.remove(&id) else {
                continue;
            };
            if state == EventState::Canceled {
                self.canceled.insert(id);
            }
            for completion in gated {
                if state == EventState::Canceled {
                    if self.parked.remove(&completion).is_some() {
                        tracing::warn!(target: targets::SYNC, completion, "dependency canceled; canceling action");
                        work.push((completion, EventState::Canceled));
                    }
                    continue;
                }
                let Some(parked) = self.parked.get_mut(&completion) else {
                    continue;
                };
                parked.remaining -= 1;
                if parked.remaining > 0 {
                    continue;
                }
                match self.parked.remove(&completion).map(|p| p.job) {
                    Some(Job::Marker) => work.push((completion, EventState::Signaled)),
                    Some(job) => ready.push(ReadyJob {
                        job,
                        completion: Event::new(completion),
                    }),
                    None => {}
                }
            }
        }
        ready
    }
}

struct EventTable {
    book: Mutex<EventBook>,
    changed: Condvar,
    ready_tx: Mutex<Option<Sender<ReadyJob>>>,
}

impl EventTable {
    fn new(ready_tx: Sender<ReadyJob>) -> Self {
        Self {
            book: Mutex::new(EventBook {
                next: 1,
                pending: HashMap::new(),
                canceled: HashSet::new(),
                parked: HashMap::new(),
            }),
            changed: Condvar::new(),
            ready_tx: Mutex::new(Some(ready_tx)),
        }
    }

    fn register(&self) -> Event {
        let mut book = self.book.lock();
        let id = book.allocate();
        book.pending.insert(id, Vec::new());
        Event::new(id)
    }

    fn finish(&self, event: Event, state: EventState) -> EngineResult<()> {
        let mut book = self.book.lock();
        match book.state(event.id()) {
            None => return Err(EngineError::InvalidPointer),
            Some(EventState::Pending) => {}
            Some(_) => return Err(EngineError::ArgumentMismatch),
        }
        let ready = book.settle(event.id(), state);
        drop(book);
        self.changed.notify_all();
        self.dispatch(ready);
        Ok(())
    }

    /// Queue `job` for the copy thread once every event in `deps` is
    /// signaled. Markers complete in the table without reaching the thread.
    fn submit(&self, job: Job, deps: &[Event]) -> EngineResult<Event> {
        let mut book = self.book.lock();
        let mut blocking: Vec<u64> = Vec::new();
        let mut canceled = false;
        for dep in deps {
            match book.state(dep.id()) {
                None => return Err(EngineError::InvalidPointer),
                Some(EventState::Pending) if !blocking.contains(&dep.id()) => blocking.push(dep.id()),
                Some(EventState::Canceled) => canceled = true,
                Some(_) => {}
            }
        }

        let id = book.allocate();
        let completion = Event::new(id);
        if canceled {
            book.canceled.insert(id);
            tracing::warn!(target: targets::SYNC, %completion, "dependency canceled; canceling action");
            return Ok(completion);
        }
        if blocking.is_empty() {
            if matches!(job, Job::Marker) {
                return Ok(completion);
            }
            book.pending.insert(id, Vec::new());
            drop(book);
            self.dispatch(vec![ReadyJob { job, completion }]);
            return Ok(completion);
        }

        book.pending.insert(id, Vec::new());
        for dep in &blocking {
            if let Some(gated) = book.pending.get_mut(dep) {
                gated.push(id);
            }
        }
        book.parked.insert(
            id,
            Parked {
                job,
                remaining: blocking.len(),
            },
        );
        Ok(completion)
    }

    fn dispatch(&self, ready: Vec<ReadyJob>) {
        if ready.is_empty() {
            return;
        }
        let tx = self.ready_tx.lock().clone();
        for job in ready {
            let completion = job.completion;
            let sent = tx.as_ref().map_or(false, |tx| tx.send(job).is_ok());
            if !sent {
                tracing::warn!(target: targets::SYNC, %completion, "copy thread is gone; canceling action");
                let _ = self.finish(completion, EventState::Canceled);
            }
        }
    }

    fn close(&self) {
        drop(self.ready_tx.lock().take());
    }

    /// Events still tracked: pending ones plus canceled ones.
    fn tracked(&self) -> usize {
        let book = self.book.lock();
        book.pending.len() + book.canceled.len()
    }

    fn wait(&self, events: &[Event], wait_all: bool, timeout: Timeout) -> EngineResult<WaitOutcome> {
        let deadline = timeout.as_duration().map(|d| Instant::now() + d);
        let mut book = self.book.lock();
        let mut timed_out = false;
        loop {
            let mut signaled_indices = Vec::new();
            for (index, event) in events.iter().enumerate() {
                match book.state(event.id()) {
                    None => return Err(EngineError::InvalidPointer),
                    Some(EventState::Canceled) => return Err(EngineError::EventCanceled),
                    Some(EventState::Signaled) => signaled_indices.push(index),
                    Some(EventState::Pending) => {}
                }
            }
            let done = if wait_all {
                signaled_indices.len() == events.len()
            } else {
                events.is_empty() || !signaled_indices.is_empty()
            };
            if done {
                return Ok(WaitOutcome {
                    num_signaled: signaled_indices.len(),
                    signaled_indices,
                });
            }
            if timed_out {
                return Err(EngineError::TimedOut);
            }
            match deadline {
                None => self.changed.wait(&mut book),
                Some(deadline) => timed_out = self.changed.wait_until(&mut book, deadline).timed_out(),
            }
        }
    }
}

fn run_job(job: Job, registry: &SinkRegistry) {
    match job {
        Job::Run { block, ret } => sink::thunk(registry, &block, ret.as_ref()),
        Job::Copy { dst, src, len } => {
            let started = Instant::now();
            // SAFETY: both ranges were bounds-checked against live buffers at
            // submission and proven disjoint; buffers are destroyed only after
            // their pending actions complete.
            unsafe {
                std::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, len as usize);
            }
            performance::record_transfer(len, "loopback_copy", started.elapsed().as_micros() as u64);
        }
        Job::Marker => {}
    }
}

fn spawn_pipeline_worker(
    name: String,
    rx: Receiver<Submission>,
    events: Arc<EventTable>,
    registry: Arc<SinkRegistry>,
) -> EngineResult<JoinHandle<()>> {
    thread::Builder::new()
        .name(name)
        .spawn(move || {
            while let Ok(Submission { job, deps, completion }) = rx.recv() {
                if let Err(err) = events.wait(&deps, true, Timeout::Infinite) {
                    tracing::warn!(target: targets::SYNC, %completion, error = %err, "dependency failed; canceling action");
                    let _ = events.finish(completion, EventState::Canceled);
                    continue;
                }
                run_job(job, &registry);
                let _ = events.finish(completion, EventState::Signaled);
            }
        })
        .map_err(|e| EngineError::Failed(format!("failed to spawn worker thread: {e}")))
}

fn spawn_copy_worker(
    rx: Receiver<ReadyJob>,
    events: Arc<EventTable>,
    registry: Arc<SinkRegistry>,
) -> EngineResult<JoinHandle<()>> {
    thread::Builder::new()
        .name("hstreams-loopback-copy".to_string())
        .spawn(move || {
            while let Ok(ReadyJob { job, completion }) = rx.recv() {
                run_job(job, &registry);
                let _ = events.finish(completion, EventState::Signaled);
            }
        })
        .map_err(|e| EngineError::Failed(format!("failed to spawn copy thread: {e}")))
}

struct Pipeline {
    domain: PhysDomainId,
    tx: Sender<Submission>,
    thread: JoinHandle<()>,
}

struct LoopbackBuffer {
    domain: PhysDomainId,
    addr: u64,
    len: u64,
    refs: i64,
    valid: BTreeMap<PhysDomainId, bool>,
    _storage: Option<AlignedBlock>,
}

#[derive(Default)]
struct State {
    pipelines: HashMap<u64, Pipeline>,
    buffers: HashMap<u64, LoopbackBuffer>,
    libraries: HashMap<PhysDomainId, Vec<String>>,
    failed: HashSet<PhysDomainId>,
}

/// In-process Engine emulating `devices` accelerators of
/// `threads_per_device` hardware threads each.
pub struct LoopbackEngine {
    registry: Arc<SinkRegistry>,
    devices: u32,
    threads_per_device: u32,
    events: Arc<EventTable>,
    state: Mutex<State>,
    copy_rx: Mutex<Option<Receiver<ReadyJob>>>,
    copy_thread: Mutex<Option<JoinHandle<()>>>,
    next_handle: AtomicU64,
}

impl LoopbackEngine {
    pub fn new(registry: Arc<SinkRegistry>, devices: u32, threads_per_device: u32) -> Self {
        let (ready_tx, ready_rx) = unbounded();
        Self {
            registry,
            devices,
            threads_per_device,
            events: Arc::new(EventTable::new(ready_tx)),
            state: Mutex::new(State::default()),
            copy_rx: Mutex::new(Some(ready_rx)),
            copy_thread: Mutex::new(None),
            next_handle: AtomicU64::new(1),
        }
    }

    pub fn from_options(options: &Options, registry: Arc<SinkRegistry>) -> Self {
        Self::new(registry, options.loopback_devices, options.loopback_threads_per_device)
    }

    pub fn registry(&self) -> &Arc<SinkRegistry> {
        &self.registry
    }

    /// Make every later call touching `domain` fail as if its sink process
    /// had died (or recover it with `failed = false`).
    pub fn set_domain_failed(&self, domain: PhysDomainId, failed: bool) {
        let mut state = self.state.lock();
        if failed {
            state.failed.insert(domain);
        } else {
            state.failed.remove(&domain);
        }
    }

    /// Number of Engine buffers currently alive.
    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    /// Number of events the table still tracks (pending or canceled).
    pub fn tracked_events(&self) -> usize {
        self.events.tracked()
    }

    /// Number of pipelines currently alive.
    pub fn live_pipelines(&self) -> usize {
        self.state.lock().pipelines.len()
    }

    /// Engine-level reference count of a buffer.
    pub fn buffer_refs(&self, buffer: EngineBufferHandle) -> Option<i64> {
        self.state.lock().buffers.get(&buffer.id()).map(|b| b.refs)
    }

    /// Validity of a buffer on one endpoint, when it was ever set.
    pub fn buffer_valid_on(&self, buffer: EngineBufferHandle, endpoint: PhysDomainId) -> Option<bool> {
        self.state
            .lock()
            .buffers
            .get(&buffer.id())
            .and_then(|b| b.valid.get(&endpoint).copied())
    }

    fn next_id(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn check_domain(&self, state: &State, domain: PhysDomainId) -> EngineResult<()> {
        if state.failed.contains(&domain) {
            return Err(EngineError::ProcessDied);
        }
        if domain.is_host() || (domain.id() >= 0 && (domain.id() as u32) < self.devices) {
            Ok(())
        } else {
            Err(EngineError::DoesNotExist)
        }
    }

    /// Submit a copy or marker; the copy thread starts on first use.
    fn submit_copy(&self, job: Job, deps: &[Event]) -> EngineResult<Event> {
        let mut worker = self.copy_thread.lock();
        if worker.is_none() {
            if let Some(rx) = self.copy_rx.lock().take() {
                *worker = Some(spawn_copy_worker(rx, Arc::clone(&self.events), Arc::clone(&self.registry))?);
            }
        }
        drop(worker);
        self.events.submit(job, deps)
    }
}

impl Engine for LoopbackEngine {
    fn engine_count(&self) -> u32 {
        self.devices
    }

    fn engine_info(&self, index: u32) -> EngineResult<EngineInfo> {
        if index >= self.devices {
            return Err(EngineError::DoesNotExist);
        }
        if self.state.lock().failed.contains(&PhysDomainId::new(index as i32)) {
            return Err(EngineError::ProcessDied);
        }
        Ok(EngineInfo {
            isa: Isa::Knl,
            num_threads: self.threads_per_device,
            core_max_freq_mhz: EMULATED_FREQ_MHZ,
            physical_memory: EMULATED_MEMORY,
        })
    }

    fn load_library(&self, domain: PhysDomainId, name: &str) -> EngineResult<()> {
        let mut state = self.state.lock();
        self.check_domain(&state, domain)?;
        if !self.registry.has_library(name) {
            return Err(EngineError::DoesNotExist);
        }
        let loaded = state.libraries.entry(domain).or_default();
        if !loaded.iter().any(|l| l == name) {
            loaded.push(name.to_string());
        }
        tracing::debug!(target: targets::MISC, %domain, library = name, "library loaded");
        Ok(())
    }

    fn lookup_function(&self, domain: PhysDomainId, name: &str) -> EngineResult<Option<u64>> {
        let state = self.state.lock();
        self.check_domain(&state, domain)?;
        let loaded = state.libraries.get(&domain).map(Vec::as_slice).unwrap_or(&[]);
        Ok(self.registry.resolve(name, loaded))
    }

    fn create_pipeline(&self, domain: PhysDomainId, mask: &CpuMask) -> EngineResult<PipelineHandle> {
        let mut state = self.state.lock();
        self.check_domain(&state, domain)?;
        if mask.is_empty() {
            return Err(EngineError::OutOfRange);
        }
        if !domain.is_host() && mask.highest_set().map_or(false, |b| b >= self.threads_per_device as usize) {
            return Err(EngineError::OutOfRange);
        }

        let id = self.next_id();
        let (tx, rx) = unbounded();
        let thread = spawn_pipeline_worker(
            format!("hstreams-loopback-{domain}-pipe{id}"),
            rx,
            Arc::clone(&self.events),
            Arc::clone(&self.registry),
        )?;
        state.pipelines.insert(id, Pipeline { domain, tx, thread });
        tracing::debug!(target: targets::MISC, %domain, pipeline = id, %mask, "pipeline created");
        Ok(PipelineHandle::new(id))
    }

    fn destroy_pipeline(&self, pipeline: PipelineHandle) -> EngineResult<()> {
        let removed = self.state.lock().pipelines.remove(&pipeline.id());
        let Pipeline { tx, thread, domain } = removed.ok_or(EngineError::InvalidPointer)?;
        drop(tx);
        thread
            .join()
            .map_err(|_| EngineError::Failed(format!("pipeline {pipeline} on {domain} panicked")))
    }

    fn run_function(
        &self,
        pipeline: PipelineHandle,
        args: &[u64],
        deps: &[Event],
        ret: Option<ReturnValue>,
    ) -> EngineResult<Event> {
        let tx = {
            let state = self.state.lock();
            let entry = state.pipelines.get(&pipeline.id()).ok_or(EngineError::InvalidPointer)?;
            if state.failed.contains(&entry.domain) {
                return Err(EngineError::ProcessDied);
            }
            entry.tx.clone()
        };
        let completion = self.events.register();
        let submission = Submission {
            job: Job::Run {
                block: args.to_vec(),
                ret,
            },
            deps: deps.to_vec(),
            completion,
        };
        if tx.send(submission).is_err() {
            let _ = self.events.finish(completion, EventState::Canceled);
            return Err(EngineError::Failed(format!("pipeline {pipeline} is gone")));
        }
        Ok(completion)
    }

    fn create_buffer(
        &self,
        domain: PhysDomainId,
        len: u64,
        flags: EngineBufferFlags,
    ) -> EngineResult<EngineBufferHandle> {
        if len == 0 {
            return Err(EngineError::OutOfRange);
        }
        self.check_domain(&self.state.lock(), domain)?;
        let block = AlignedBlock::with_huge_pages(len, flags.huge_pages).map_err(|_| EngineError::OutOfMemory)?;
        let id = self.next_id();
        let buffer = LoopbackBuffer {
            domain,
            addr: block.addr(),
            len,
            refs: 0,
            valid: BTreeMap::new(),
            _storage: Some(block),
        };
        self.state.lock().buffers.insert(id, buffer);
        tracing::trace!(target: targets::MEM, %domain, buffer = id, len, "engine buffer allocated");
        Ok(EngineBufferHandle::new(id))
    }

    fn create_buffer_from_memory(
        &self,
        domain: PhysDomainId,
        addr: u64,
        len: u64,
        flags: EngineBufferFlags,
    ) -> EngineResult<EngineBufferHandle> {
        if addr == 0 {
            return Err(EngineError::InvalidPointer);
        }
        if len == 0 || addr.checked_add(len).is_none() {
            return Err(EngineError::OutOfRange);
        }
        let mut state = self.state.lock();
        self.check_domain(&state, domain)?;
        let id = self.next_id();
        state.buffers.insert(
            id,
            LoopbackBuffer {
                domain,
                addr,
                len,
                refs: 0,
                valid: BTreeMap::new(),
                _storage: None,
            },
        );
        tracing::trace!(target: targets::MEM, %domain, buffer = id, len, no_dma = flags.no_dma, "engine buffer wraps memory");
        Ok(EngineBufferHandle::new(id))
    }

    fn destroy_buffer(&self, buffer: EngineBufferHandle) -> EngineResult<()> {
        let removed = self.state.lock().buffers.remove(&buffer.id());
        removed.map(drop).ok_or(EngineError::InvalidPointer)
    }

    fn set_buffer_state(&self, buffer: EngineBufferHandle, endpoint: PhysDomainId, valid: bool) -> EngineResult<()> {
        let mut state = self.state.lock();
        let entry = state.buffers.get_mut(&buffer.id()).ok_or(EngineError::InvalidPointer)?;
        entry.valid.insert(endpoint, valid);
        Ok(())
    }

    fn add_buffer_ref(&self, buffer: EngineBufferHandle, domain: PhysDomainId, delta: i32) -> EngineResult<()> {
        let mut state = self.state.lock();
        self.check_domain(&state, domain)?;
        let entry = state.buffers.get_mut(&buffer.id()).ok_or(EngineError::InvalidPointer)?;
        let refs = entry.refs + i64::from(delta);
        if refs < 0 {
            return Err(EngineError::OutOfRange);
        }
        entry.refs = refs;
        Ok(())
    }

    fn sink_address(&self, buffer: EngineBufferHandle, domain: PhysDomainId) -> EngineResult<u64> {
        let state = self.state.lock();
        let entry = state.buffers.get(&buffer.id()).ok_or(EngineError::InvalidPointer)?;
        if entry.domain != domain {
            return Err(EngineError::ArgumentMismatch);
        }
        Ok(entry.addr)
    }

    fn copy(
        &self,
        dst: EngineBufferHandle,
        src: EngineBufferHandle,
        dst_offset: u64,
        src_offset: u64,
        len: u64,
        deps: &[Event],
    ) -> EngineResult<Event> {
        let (dst_addr, src_addr) = {
            let state = self.state.lock();
            let d = state.buffers.get(&dst.id()).ok_or(EngineError::InvalidPointer)?;
            let s = state.buffers.get(&src.id()).ok_or(EngineError::InvalidPointer)?;
            for (buffer, offset) in [(d, dst_offset), (s, src_offset)] {
                if state.failed.contains(&buffer.domain) {
                    return Err(EngineError::ProcessDied);
                }
                if offset.checked_add(len).map_or(true, |end| end > buffer.len) {
                    return Err(EngineError::OutOfRange);
                }
            }
            (d.addr + dst_offset, s.addr + src_offset)
        };
        if dst_addr < src_addr + len && src_addr < dst_addr + len {
            return Err(EngineError::MemoryOverlap);
        }
        self.submit_copy(
            Job::Copy {
                dst: dst_addr,
                src: src_addr,
                len,
            },
            deps,
        )
    }

    fn write_marker(&self, deps: &[Event]) -> EngineResult<Event> {
        self.submit_copy(Job::Marker, deps)
    }

    fn wait(&self, events: &[Event], wait_all: bool, timeout: Timeout) -> EngineResult<WaitOutcome> {
        self.events.wait(events, wait_all, timeout)
    }

    fn register_user_event(&self) -> EngineResult<Event> {
        Ok(self.events.register())
    }

    fn signal_user_event(&self, event: Event) -> EngineResult<()> {
        self.events.finish(event, EventState::Signaled)
    }

    fn cancel_user_event(&self, event: Event) -> EngineResult<()> {
        self.events.finish(event, EventState::Canceled)
    }
}

impl Drop for LoopbackEngine {
    fn drop(&mut self) {
        let pipelines: Vec<Pipeline> = self.state.lock().pipelines.drain().map(|(_, p)| p).collect();
        for Pipeline { tx, thread, domain } in pipelines {
            drop(tx);
            if thread.join().is_err() {
                tracing::warn!(target: targets::MISC, %domain, "pipeline thread panicked");
            }
        }
        self.events.close();
        if let Some(thread) = self.copy_thread.lock().take() {
            if thread.join().is_err() {
                tracing::warn!(target: targets::MISC, "copy thread panicked");
            }
        }
    }
}

impl std::fmt::Debug for LoopbackEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackEngine")
            .field("devices", &self.devices)
            .field("threads_per_device", &self.threads_per_device)
            .finish()
    }
}
