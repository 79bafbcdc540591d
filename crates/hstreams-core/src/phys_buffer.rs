//! Domain-local instantiation of a logical buffer.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use hstreams_tracing::targets;

use crate::config::Timeout;
use crate::engine::{Engine, EngineError};
use crate::host_alloc::AlignedBlock;
use crate::types::{EngineBufferHandle, Event, PhysDomainId};

#[derive(Debug, Default)]
struct PendingActions {
    events: Vec<Event>,
    since_prune: u32,
}

/// One Engine buffer backing a logical buffer in one physical domain.
///
/// Shared by every logical domain that aliases it. The explicit reference
/// count tracks attachments; the `Arc` holding it keeps the storage alive
/// while in-flight enqueues still reference it.
pub struct PhysBuffer {
    engine: Arc<dyn Engine>,
    handle: EngineBufferHandle,
    phys_domain: PhysDomainId,
    sink_start: u64,
    padding: u64,
    aliased: bool,
    refcount: AtomicUsize,
    pending: Mutex<PendingActions>,
    prune_interval: u32,
    _host_block: Option<AlignedBlock>,
}

impl PhysBuffer {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        engine: Arc<dyn Engine>,
        handle: EngineBufferHandle,
        phys_domain: PhysDomainId,
        sink_start: u64,
        padding: u64,
        aliased: bool,
        prune_interval: u32,
        host_block: Option<AlignedBlock>,
    ) -> Self {
        Self {
            engine,
            handle,
            phys_domain,
            sink_start,
            padding,
            aliased,
            refcount: AtomicUsize::new(0),
            pending: Mutex::new(PendingActions::default()),
            prune_interval: prune_interval.max(1),
            _host_block: host_block,
        }
    }

    pub fn handle(&self) -> EngineBufferHandle {
        self.handle
    }

    pub fn phys_domain(&self) -> PhysDomainId {
        self.phys_domain
    }

    /// Sink-side start of the allocation.
    pub fn sink_start(&self) -> u64 {
        self.sink_start
    }

    /// Bytes between the allocation start and the buffer's first byte;
    /// keeps sink copies on the same cache-line phase as the source.
    pub fn padding(&self) -> u64 {
        self.padding
    }

    pub fn is_aliased(&self) -> bool {
        self.aliased
    }

    /// Sink-side address of the byte at `offset`.
    pub fn translate(&self, offset: u64) -> u64 {
        self.sink_start + self.padding + offset
    }

    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    /// Add one attachment; returns the new count.
    pub(crate) fn attach(&self) -> usize {
        self.refcount.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop one attachment; returns the remaining count.
    pub(crate) fn detach(&self) -> usize {
        let previous = self
            .refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    /// Number of recorded actions not yet pruned.
    pub fn pending_actions(&self) -> usize {
        self.pending.lock().events.len()
    }

    /// Remember an action touching this buffer. Every `prune_interval`
    /// calls, already-completed actions are dropped without blocking.
    pub(crate) fn add_pending_action(&self, event: Event) {
        let mut pending = self.pending.lock();
        pending.events.push(event);
        pending.since_prune += 1;
        if pending.since_prune >= self.prune_interval {
            pending.since_prune = 0;
            self.prune(&mut pending.events);
        }
    }

    fn prune(&self, events: &mut Vec<Event>) {
        let before = events.len();
        match self.engine.wait(events, false, Timeout::Millis(0)) {
            Ok(outcome) => {
                let mut done = outcome.signaled_indices;
                done.sort_unstable();
                for index in done.into_iter().rev() {
                    if index < events.len() {
                        events.swap_remove(index);
                    }
                }
            }
            Err(EngineError::TimedOut) => {}
            Err(EngineError::EventCanceled) => {
                // Canceled events never complete; poll one at a time.
                events.retain(|event| {
                    matches!(
                        self.engine.wait(std::slice::from_ref(event), true, Timeout::Millis(0)),
                        Err(EngineError::TimedOut)
                    )
                });
            }
            Err(err) => {
                tracing::warn!(target: targets::MEM, buffer = %self.handle, error = %err, "failed to prune pending actions");
            }
        }
        hstreams_tracing::perf_event!("pending_actions_pruned", before = before, after = events.len());
    }
}

impl PartialEq for PhysBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle
    }
}

impl Eq for PhysBuffer {}

impl std::fmt::Debug for PhysBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysBuffer")
            .field("handle", &self.handle)
            .field("phys_domain", &self.phys_domain)
            .field("sink_start", &format_args!("{:#x}", self.sink_start))
            .field("padding", &self.padding)
            .field("refcount", &self.refcount())
            .finish()
    }
}

impl Drop for PhysBuffer {
    fn drop(&mut self) {
        let events = std::mem::take(&mut self.pending.get_mut().events);
        if !events.is_empty() {
            if let Err(err) = self.engine.wait(&events, true, Timeout::Infinite) {
                tracing::warn!(target: targets::MEM, buffer = %self.handle, error = %err, "pending actions failed before buffer release");
            }
        }
        if let Err(err) = self.engine.destroy_buffer(self.handle) {
            tracing::warn!(target: targets::MEM, buffer = %self.handle, error = %err, "failed to destroy engine buffer");
        }
    }
}
