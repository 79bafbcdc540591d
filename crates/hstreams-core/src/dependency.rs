//! Per-stream dependency policies.
//!
//! A physical stream owns one [`DependencyPolicy`] behind its admission
//! lock. For every action the stream asks the policy for the events the
//! action must wait on, issues the action, then records the action's
//! completion event as an output.

use std::collections::BTreeMap;

use crate::config::DepPolicy;
use crate::types::{EngineBufferHandle, Event};

/// How an action relates to the rest of its stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DepKind {
    /// Only ordered against earlier actions on the same buffers.
    Transfer,
    /// Ordered after the previous compute-class action and after earlier
    /// actions on the same buffers.
    Compute,
    /// Ordered after everything previously recorded in the stream.
    Barrier,
}

/// One buffer referenced by an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferAccess {
    pub buffer: EngineBufferHandle,
    pub write: bool,
}

impl BufferAccess {
    pub const fn read(buffer: EngineBufferHandle) -> Self {
        Self { buffer, write: false }
    }

    pub const fn write(buffer: EngineBufferHandle) -> Self {
        Self { buffer, write: true }
    }
}

/// Dependency bookkeeping of one stream.
pub trait DependencyPolicy: Send {
    /// Events an action of `kind` touching `accesses` must wait on.
    fn input_deps(&self, kind: DepKind, accesses: &[BufferAccess]) -> Vec<Event>;

    /// Record that `completion` finishes an action of `kind`.
    fn record_output(&mut self, kind: DepKind, accesses: &[BufferAccess], completion: Event);

    /// Every event the stream still tracks; what a drain must wait on.
    fn all_events(&self) -> Vec<Event> {
        self.input_deps(DepKind::Barrier, &[])
    }
}

/// Build the policy selected by the options.
pub fn policy_for(policy: DepPolicy) -> Box<dyn DependencyPolicy> {
    match policy {
        DepPolicy::Conservative => Box::new(Conservative::default()),
        DepPolicy::Buffers => Box::new(BufferTracking::default()),
        DepPolicy::None => Box::new(NoDependencies),
    }
}

/// Total order: every action waits on the previous one.
#[derive(Debug, Default)]
pub struct Conservative {
    last_action: Option<Event>,
}

impl DependencyPolicy for Conservative {
    fn input_deps(&self, _kind: DepKind, _accesses: &[BufferAccess]) -> Vec<Event> {
        self.last_action.into_iter().collect()
    }

    fn record_output(&mut self, _kind: DepKind, _accesses: &[BufferAccess], completion: Event) {
        self.last_action = Some(completion);
    }
}

#[derive(Debug, Default, Clone)]
struct BufferEvents {
    last_write: Option<Event>,
    reads_since_write: Vec<Event>,
}

impl BufferEvents {
    fn events(&self) -> impl Iterator<Item = Event> + '_ {
        self.last_write.iter().copied().chain(self.reads_since_write.iter().copied())
    }
}

/// Buffer-granular tracking.
///
/// Each buffer remembers its last writer and the readers issued since. A
/// write waits on both (WAW, WAR), a read waits on the last writer (RAW).
/// Transfers write their destination and read their source; compute
/// actions and barriers write every listed buffer.
#[derive(Debug, Default)]
pub struct BufferTracking {
    last_action: Option<Event>,
    pending: BTreeMap<EngineBufferHandle, BufferEvents>,
}

impl BufferTracking {
    /// Number of buffers with recorded events.
    pub fn tracked_buffers(&self) -> usize {
        self.pending.len()
    }
}

impl DependencyPolicy for BufferTracking {
    fn input_deps(&self, kind: DepKind, accesses: &[BufferAccess]) -> Vec<Event> {
        let mut deps = Vec::new();
        if kind != DepKind::Transfer {
            deps.extend(self.last_action);
        }
        if kind == DepKind::Barrier {
            deps.extend(self.pending.values().flat_map(BufferEvents::events));
        } else {
            for access in accesses {
                let Some(entry) = self.pending.get(&access.buffer) else {
                    continue;
                };
                if access.write || kind == DepKind::Compute {
                    deps.extend(entry.events());
                } else {
                    deps.extend(entry.last_write);
                }
            }
        }
        deps.sort_unstable();
        deps.dedup();
        deps
    }

    fn record_output(&mut self, kind: DepKind, accesses: &[BufferAccess], completion: Event) {
        if kind != DepKind::Transfer {
            self.last_action = Some(completion);
        }
        for access in accesses {
            let entry = self.pending.entry(access.buffer).or_default();
            if access.write || kind != DepKind::Transfer {
                entry.last_write = Some(completion);
                entry.reads_since_write.clear();
            } else {
                entry.reads_since_write.push(completion);
            }
        }
    }
}

/// No tracking at all.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDependencies;

impl DependencyPolicy for NoDependencies {
    fn input_deps(&self, _kind: DepKind, _accesses: &[BufferAccess]) -> Vec<Event> {
        Vec::new()
    }

    fn record_output(&mut self, _kind: DepKind, _accesses: &[BufferAccess], _completion: Event) {}
}
