//! Physical streams: FIFO queues bound to a CPU mask.
//!
//! Admission (dependency lookup, submission, output recording) is
//! serialized by the stream's policy lock; execution is asynchronous.
//! Pending actions are registered on the touched buffers after the lock is
//! released.

use std::sync::Arc;

use parking_lot::Mutex;

use hstreams_tracing::targets;

use crate::config::Timeout;
use crate::cpu_mask::CpuMask;
use crate::dependency::{policy_for, BufferAccess, DepKind, DependencyPolicy};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::host_worker::HostSinkWorker;
use crate::phys_buffer::PhysBuffer;
use crate::phys_domain::PhysDomain;
use crate::sink::{marshal_args, ReturnValue};
use crate::types::{Event, LogDomainId, PipelineHandle};

/// Where a stream's compute actions execute.
pub(crate) trait StreamExecutor: Send + Sync {
    fn submit(&self, args: Vec<u64>, deps: Vec<Event>, ret: Option<ReturnValue>) -> Result<Event>;
}

pub(crate) struct PipelineExecutor {
    engine: Arc<dyn Engine>,
    pipeline: PipelineHandle,
}

impl PipelineExecutor {
    pub(crate) fn new(engine: Arc<dyn Engine>, pipeline: PipelineHandle) -> Self {
        Self { engine, pipeline }
    }
}

impl StreamExecutor for PipelineExecutor {
    fn submit(&self, args: Vec<u64>, deps: Vec<Event>, ret: Option<ReturnValue>) -> Result<Event> {
        self.engine
            .run_function(self.pipeline, &args, &deps, ret)
            .map_err(|e| Error::from_engine(&format!("running function in {}", self.pipeline), e))
    }
}

impl Drop for PipelineExecutor {
    fn drop(&mut self) {
        if let Err(err) = self.engine.destroy_pipeline(self.pipeline) {
            tracing::warn!(target: targets::MISC, pipeline = %self.pipeline, error = %err, "failed to destroy pipeline");
        }
    }
}

pub(crate) struct HostExecutor {
    engine: Arc<dyn Engine>,
    worker: HostSinkWorker,
}

impl HostExecutor {
    pub(crate) fn new(engine: Arc<dyn Engine>, worker: HostSinkWorker) -> Self {
        Self { engine, worker }
    }
}

impl StreamExecutor for HostExecutor {
    fn submit(&self, args: Vec<u64>, deps: Vec<Event>, ret: Option<ReturnValue>) -> Result<Event> {
        let completion = self
            .engine
            .register_user_event()
            .map_err(|e| Error::Internal(format!("registering completion event: {e}")))?;
        if let Err(err) = self.worker.put(args, deps, ret, completion) {
            if let Err(cancel) = self.engine.cancel_user_event(completion) {
                tracing::warn!(target: targets::SYNC, %completion, error = %cancel, "failed to cancel orphaned completion event");
            }
            return Err(err);
        }
        Ok(completion)
    }
}

/// A buffer argument of a compute action.
#[derive(Debug, Clone)]
pub struct HeapOperand {
    pub buffer: Arc<PhysBuffer>,
    pub offset: u64,
}

pub struct PhysStream {
    serial: u64,
    domain: Arc<PhysDomain>,
    log_domain: LogDomainId,
    mask: CpuMask,
    policy: Mutex<Box<dyn DependencyPolicy>>,
    executor: Box<dyn StreamExecutor>,
}

impl PhysStream {
    pub(crate) fn new(
        serial: u64,
        domain: Arc<PhysDomain>,
        log_domain: LogDomainId,
        mask: CpuMask,
        executor: Box<dyn StreamExecutor>,
    ) -> Self {
        let policy = policy_for(domain.options().dep_policy);
        Self {
            serial,
            domain,
            log_domain,
            mask,
            policy: Mutex::new(policy),
            executor,
        }
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn mask(&self) -> &CpuMask {
        &self.mask
    }

    pub fn log_domain(&self) -> LogDomainId {
        self.log_domain
    }

    pub fn phys_domain(&self) -> &Arc<PhysDomain> {
        &self.domain
    }

    /// Enqueue a sink function invocation.
    ///
    /// Heap operands are translated to sink-side addresses and every one of
    /// them is treated as written.
    pub fn enqueue_function(
        &self,
        name: &str,
        scalars: &[u64],
        heap: &[HeapOperand],
        ret: Option<ReturnValue>,
    ) -> Result<Event> {
        let _span = hstreams_tracing::perf_span!("enqueue_function", args = scalars.len() + heap.len());
        let address = self
            .domain
            .fetch_sink_function_address(name)?
            .ok_or_else(|| Error::BadName(format!("{name} is not exported to {}", self.domain.id())))?;
        let heap_addrs: Vec<u64> = heap.iter().map(|op| op.buffer.translate(op.offset)).collect();
        let args = marshal_args(scalars, &heap_addrs, address);
        let accesses: Vec<BufferAccess> = heap.iter().map(|op| BufferAccess::write(op.buffer.handle())).collect();

        let completion = {
            let mut policy = self.policy.lock();
            let deps = policy.input_deps(DepKind::Compute, &accesses);
            let completion = self.executor.submit(args, deps, ret)?;
            policy.record_output(DepKind::Compute, &accesses, completion);
            completion
        };
        tracing::trace!(target: targets::SINK_INVOKE, stream = self.serial, name, %completion, "function enqueued");

        for op in heap {
            op.buffer.add_pending_action(completion);
        }
        Ok(completion)
    }

    /// Enqueue a copy of `len` bytes between two instantiations. Offsets are
    /// relative to the logical buffer start.
    pub fn enqueue_transfer(
        &self,
        dst: &Arc<PhysBuffer>,
        src: &Arc<PhysBuffer>,
        dst_offset: u64,
        src_offset: u64,
        len: u64,
    ) -> Result<Event> {
        let _span = hstreams_tracing::perf_span!("enqueue_transfer", bytes = len);
        let same_storage = dst.handle() == src.handle();
        if same_storage && dst_offset == src_offset {
            // Aliased instantiations: only the ordering matters.
            let accesses = [BufferAccess::write(dst.handle())];
            let completion = {
                let mut policy = self.policy.lock();
                let deps = policy.input_deps(DepKind::Transfer, &accesses);
                let completion = self
                    .domain
                    .engine()
                    .write_marker(&deps)
                    .map_err(|e| Error::from_engine("dependency marker", e))?;
                policy.record_output(DepKind::Transfer, &accesses, completion);
                completion
            };
            dst.add_pending_action(completion);
            return Ok(completion);
        }

        let accesses = if same_storage {
            vec![BufferAccess::write(dst.handle())]
        } else {
            vec![BufferAccess::write(dst.handle()), BufferAccess::read(src.handle())]
        };
        let completion = {
            let mut policy = self.policy.lock();
            let deps = policy.input_deps(DepKind::Transfer, &accesses);
            let completion = self
                .domain
                .engine()
                .copy(
                    dst.handle(),
                    src.handle(),
                    dst.padding() + dst_offset,
                    src.padding() + src_offset,
                    len,
                    &deps,
                )
                .map_err(|e| Error::from_engine(&format!("copying {len} bytes"), e))?;
            policy.record_output(DepKind::Transfer, &accesses, completion);
            completion
        };
        tracing::trace!(target: targets::SYNC, stream = self.serial, len, %completion, "transfer enqueued");

        dst.add_pending_action(completion);
        if !same_storage {
            src.add_pending_action(completion);
        }
        Ok(completion)
    }

    /// Enqueue a dependency-only marker.
    ///
    /// The marker waits on the `input` dependencies of `input_buffers` plus
    /// `extra_deps`; with `output` set, later actions depend on it the way
    /// they would on an action of that kind touching those buffers.
    pub(crate) fn enqueue_marker(
        &self,
        input: DepKind,
        input_buffers: &[Arc<PhysBuffer>],
        extra_deps: &[Event],
        output: Option<(DepKind, &[Arc<PhysBuffer>])>,
    ) -> Result<Event> {
        let input_accesses: Vec<BufferAccess> = input_buffers.iter().map(|b| BufferAccess::write(b.handle())).collect();
        let mut policy = self.policy.lock();
        let mut deps = policy.input_deps(input, &input_accesses);
        deps.extend_from_slice(extra_deps);
        let completion = self
            .domain
            .engine()
            .write_marker(&deps)
            .map_err(|e| Error::from_engine("dependency marker", e))?;
        if let Some((kind, buffers)) = output {
            let accesses: Vec<BufferAccess> = buffers.iter().map(|b| BufferAccess::write(b.handle())).collect();
            policy.record_output(kind, &accesses, completion);
        }
        Ok(completion)
    }

    /// Every event the stream still tracks.
    pub fn all_events(&self) -> Vec<Event> {
        self.policy.lock().all_events()
    }

    /// Wait for everything enqueued so far.
    pub fn synchronize(&self, timeout: Timeout) -> Result<()> {
        let events = self.all_events();
        if events.is_empty() {
            return Ok(());
        }
        self.domain
            .engine()
            .wait(&events, true, timeout)
            .map(|_| ())
            .map_err(Error::from_wait)
    }
}

impl std::fmt::Debug for PhysStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysStream")
            .field("serial", &self.serial)
            .field("domain", &self.domain.id())
            .field("log_domain", &self.log_domain)
            .field("mask", &self.mask)
            .finish()
    }
}

impl Drop for PhysStream {
    fn drop(&mut self) {
        let events = self.policy.get_mut().all_events();
        if !events.is_empty() {
            if let Err(err) = self.domain.engine().wait(&events, true, Timeout::Infinite) {
                tracing::warn!(target: targets::SYNC, stream = self.serial, error = %err, "stream drained with failures");
            }
        }
        self.domain.release_stream_mask(&self.mask);
        tracing::debug!(target: targets::MISC, stream = self.serial, mask = %self.mask, "physical stream destroyed");
    }
}
