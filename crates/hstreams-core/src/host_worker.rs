//! Host-side sink worker.
//!
//! A stream whose physical domain is the host executes on one dedicated
//! thread. Actions arrive over a single-producer queue (admission is
//! already serialized by the stream lock); each one waits for its input
//! dependencies, runs the thunk and signals its completion event.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;

use hstreams_tracing::targets;

use crate::config::Timeout;
use crate::cpu_mask::CpuMask;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::sink::{self, ReturnValue, SinkRegistry};
use crate::types::Event;

enum Action {
    Compute {
        args: Vec<u64>,
        deps: Vec<Event>,
        ret: Option<ReturnValue>,
        completion: Event,
    },
    Stop,
}

/// Worker thread bound to a CPU mask.
pub(crate) struct HostSinkWorker {
    tx: Sender<Action>,
    thread: Option<JoinHandle<()>>,
    status: Arc<Mutex<Option<Error>>>,
    name: String,
}

impl HostSinkWorker {
    pub(crate) fn spawn(
        name: String,
        mask: CpuMask,
        engine: Arc<dyn Engine>,
        registry: Arc<SinkRegistry>,
    ) -> Result<Self> {
        let (tx, rx) = unbounded::<Action>();
        let status = Arc::new(Mutex::new(None));
        let worker_status = Arc::clone(&status);

        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                if let Err(err) = pin_current_thread(&mask) {
                    tracing::error!(target: targets::MISC, %mask, error = %err, "failed to pin host sink worker");
                    *worker_status.lock() = Some(err);
                }
                while let Ok(action) = rx.recv() {
                    match action {
                        Action::Compute {
                            args,
                            deps,
                            ret,
                            completion,
                        } => run_compute(engine.as_ref(), &registry, &args, &deps, ret.as_ref(), completion),
                        Action::Stop => break,
                    }
                }
            })
            .map_err(|e| Error::ResourceExhausted(format!("failed to spawn host sink worker: {e}")))?;

        Ok(Self {
            tx,
            thread: Some(thread),
            status,
            name,
        })
    }

    /// Queue one invocation. Fails with the worker's recorded status when
    /// the thread could not be set up.
    pub(crate) fn put(
        &self,
        args: Vec<u64>,
        deps: Vec<Event>,
        ret: Option<ReturnValue>,
        completion: Event,
    ) -> Result<()> {
        if let Some(err) = self.status.lock().clone() {
            return Err(err);
        }
        self.tx
            .send(Action::Compute {
                args,
                deps,
                ret,
                completion,
            })
            .map_err(|_| Error::Internal(format!("host sink worker {} has exited", self.name)))
    }
}

fn run_compute(
    engine: &dyn Engine,
    registry: &SinkRegistry,
    args: &[u64],
    deps: &[Event],
    ret: Option<&ReturnValue>,
    completion: Event,
) {
    if !deps.is_empty() {
        if let Err(err) = engine.wait(deps, true, Timeout::Infinite) {
            tracing::error!(target: targets::SYNC, %completion, error = %err, "dependency wait failed; skipping action");
            if let Err(err) = engine.cancel_user_event(completion) {
                tracing::warn!(target: targets::SYNC, %completion, error = %err, "failed to cancel completion event");
            }
            return;
        }
    }
    sink::thunk(registry, args, ret);
    if let Err(err) = engine.signal_user_event(completion) {
        tracing::error!(target: targets::SYNC, %completion, error = %err, "failed to signal completion event");
    }
}

#[cfg(target_os = "linux")]
fn pin_current_thread(mask: &CpuMask) -> Result<()> {
    let set = mask.to_native();
    let rc = unsafe { libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) };
    if rc != 0 {
        return Err(Error::Internal(format!(
            "sched_setaffinity({mask}) failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn pin_current_thread(_mask: &CpuMask) -> Result<()> {
    Ok(())
}

impl Drop for HostSinkWorker {
    fn drop(&mut self) {
        if self.tx.send(Action::Stop).is_err() {
            tracing::warn!(target: targets::MISC, worker = %self.name, "host sink worker already gone");
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!(target: targets::MISC, worker = %self.name, "host sink worker panicked");
            }
        }
    }
}
