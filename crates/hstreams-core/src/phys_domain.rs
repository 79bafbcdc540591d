//! Physical domains: one per compute engine (the host or an accelerator).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use hstreams_tracing::targets;

use crate::config::Options;
use crate::cpu_mask::CpuMask;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::host_worker::HostSinkWorker;
use crate::phys_stream::{HostExecutor, PhysStream, PipelineExecutor, StreamExecutor};
use crate::sink::SinkRegistry;
use crate::types::{Isa, LogDomainId, Overlap, PhysDomainId};

/// Accelerators with at most this many threads reserve nothing for the
/// sink-side runtime.
const MIN_THREADS_FOR_AVOID_MASK: u32 = 4;

/// Trailing threads reserved on each accelerator.
const RESERVED_TAIL_THREADS: u32 = 3;

/// Static description of a physical domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysDomainDetails {
    pub id: PhysDomainId,
    pub num_threads: u32,
    pub isa: Isa,
    pub core_max_freq_mhz: u32,
    pub max_mask: CpuMask,
    pub avoid_mask: CpuMask,
    pub physical_memory: u64,
}

enum DomainKind {
    /// Streams run on host worker threads and resolve functions in the
    /// registry directly.
    Host {
        registry: Arc<SinkRegistry>,
        libraries: Vec<String>,
    },
    /// Streams run in Engine pipelines.
    Accelerator,
}

pub struct PhysDomain {
    details: PhysDomainDetails,
    kind: DomainKind,
    engine: Arc<dyn Engine>,
    options: Arc<Options>,
    oversubscription: Mutex<Vec<u32>>,
    function_cache: RwLock<HashMap<String, u64>>,
    log_domains: Mutex<Vec<(LogDomainId, CpuMask)>>,
    next_stream_serial: AtomicU64,
}

impl PhysDomain {
    /// Bring up accelerator `index`: query its description and load the
    /// configured sink libraries.
    pub fn accelerator(index: u32, engine: Arc<dyn Engine>, options: Arc<Options>) -> Result<Self> {
        let id = PhysDomainId::new(index as i32);
        let info = engine
            .engine_info(index)
            .map_err(|e| Error::from_engine(&format!("querying {id}"), e))?;
        if info.num_threads == 0 {
            return Err(Error::Remote(format!("{id} reports no hardware threads")));
        }
        for library in &options.sink_libraries {
            engine
                .load_library(id, library)
                .map_err(|e| Error::from_engine(&format!("loading {library} into {id}"), e))?;
        }

        let max_mask = CpuMask::from_range(0..info.num_threads as usize);
        let avoid_mask = accelerator_avoid_mask(info.num_threads);
        let details = PhysDomainDetails {
            id,
            num_threads: info.num_threads,
            isa: info.isa,
            core_max_freq_mhz: info.core_max_freq_mhz,
            max_mask,
            avoid_mask,
            physical_memory: info.physical_memory,
        };
        tracing::info!(target: targets::MISC, %id, threads = info.num_threads, %avoid_mask, "accelerator domain ready");
        Ok(Self::with_details(details, DomainKind::Accelerator, engine, options))
    }

    /// The host domain. Its max mask is the calling process's affinity.
    pub fn host(engine: Arc<dyn Engine>, registry: Arc<SinkRegistry>, options: Arc<Options>) -> Result<Self> {
        if let Some(missing) = options.host_libraries.iter().find(|lib| !registry.has_library(lib)) {
            return Err(Error::NotFound(format!("host library {missing} is not registered")));
        }
        let max_mask = host_cpu_mask();
        let details = PhysDomainDetails {
            id: PhysDomainId::HOST,
            num_threads: max_mask.count() as u32,
            isa: Isa::X86_64,
            core_max_freq_mhz: host_max_freq_mhz(),
            max_mask,
            avoid_mask: CpuMask::new(),
            physical_memory: host_physical_memory(),
        };
        let kind = DomainKind::Host {
            registry,
            libraries: options.host_libraries.clone(),
        };
        Ok(Self::with_details(details, kind, engine, options))
    }

    fn with_details(details: PhysDomainDetails, kind: DomainKind, engine: Arc<dyn Engine>, options: Arc<Options>) -> Self {
        let width = details.max_mask.highest_set().map_or(0, |bit| bit + 1);
        Self {
            details,
            kind,
            engine,
            options,
            oversubscription: Mutex::new(vec![0; width]),
            function_cache: RwLock::new(HashMap::new()),
            log_domains: Mutex::new(Vec::new()),
            next_stream_serial: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> PhysDomainId {
        self.details.id
    }

    pub fn details(&self) -> &PhysDomainDetails {
        &self.details
    }

    pub fn max_mask(&self) -> &CpuMask {
        &self.details.max_mask
    }

    pub fn avoid_mask(&self) -> &CpuMask {
        &self.details.avoid_mask
    }

    pub fn is_host(&self) -> bool {
        matches!(self.kind, DomainKind::Host { .. })
    }

    pub(crate) fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    pub(crate) fn options(&self) -> &Arc<Options> {
        &self.options
    }

    /// Same hardware as `other`, ignoring identity.
    pub fn same_hardware(&self, other: &PhysDomain) -> bool {
        let (a, b) = (&self.details, &other.details);
        a.isa == b.isa
            && a.num_threads == b.num_threads
            && a.core_max_freq_mhz == b.core_max_freq_mhz
            && a.max_mask == b.max_mask
            && a.avoid_mask == b.avoid_mask
            && a.physical_memory == b.physical_memory
    }

    /// The logical domain whose mask equals `mask`, or how `mask` relates to
    /// the existing ones.
    pub fn lookup_log_domain_by_mask(&self, mask: &CpuMask) -> (Option<LogDomainId>, Overlap) {
        let mappings = self.log_domains.lock();
        if let Some((id, _)) = mappings.iter().find(|(_, m)| m == mask) {
            return (Some(*id), Overlap::Exact);
        }
        if mappings.iter().any(|(_, m)| m.intersects(mask)) {
            return (None, Overlap::Partial);
        }
        (None, Overlap::NoOverlap)
    }

    pub(crate) fn add_log_domain_mapping(&self, id: LogDomainId, mask: CpuMask) {
        self.log_domains.lock().push((id, mask));
    }

    pub(crate) fn remove_log_domain_mapping(&self, id: LogDomainId) {
        let mut mappings = self.log_domains.lock();
        if let Some(index) = mappings.iter().position(|(mapped, _)| *mapped == id) {
            mappings.remove(index);
        }
    }

    pub fn log_domain_ids(&self) -> Vec<LogDomainId> {
        self.log_domains.lock().iter().map(|(id, _)| *id).collect()
    }

    /// Threads currently covered by no stream.
    pub fn available_stream_cpu_mask(&self) -> CpuMask {
        let counts = self.oversubscription.lock();
        let mut busy = CpuMask::new();
        for (bit, count) in counts.iter().enumerate() {
            if *count > 0 {
                busy.set(bit);
            }
        }
        self.details.max_mask.xor(&busy.and(&self.details.max_mask))
    }

    /// Number of live streams covering each hardware thread.
    pub fn oversubscription_level(&self) -> Vec<u32> {
        self.oversubscription.lock().clone()
    }

    /// Create the physical stream of a logical domain and account its mask.
    pub fn create_phys_stream(self: &Arc<Self>, log_domain: LogDomainId, mask: CpuMask) -> Result<Arc<PhysStream>> {
        let serial = self.next_stream_serial.fetch_add(1, Ordering::Relaxed);
        let executor: Box<dyn StreamExecutor> = match &self.kind {
            DomainKind::Host { registry, .. } => {
                let name = format!("hstreams-host-{serial}");
                let worker = HostSinkWorker::spawn(name, mask, Arc::clone(&self.engine), Arc::clone(registry))?;
                Box::new(HostExecutor::new(Arc::clone(&self.engine), worker))
            }
            DomainKind::Accelerator => {
                let pipeline = self
                    .engine
                    .create_pipeline(self.id(), &mask)
                    .map_err(|e| Error::Remote(format!("creating pipeline on {} with {mask}: {e}", self.id())))?;
                Box::new(PipelineExecutor::new(Arc::clone(&self.engine), pipeline))
            }
        };

        {
            let mut counts = self.oversubscription.lock();
            let width = counts.len();
            for bit in mask.iter().filter(|bit| *bit < width) {
                counts[bit] += 1;
            }
        }
        tracing::debug!(target: targets::MISC, domain = %self.id(), %log_domain, %mask, serial, "physical stream created");
        Ok(Arc::new(PhysStream::new(serial, Arc::clone(self), log_domain, mask, executor)))
    }

    /// Undo the accounting of a destroyed stream's mask.
    pub(crate) fn release_stream_mask(&self, mask: &CpuMask) {
        let mut counts = self.oversubscription.lock();
        let width = counts.len();
        for bit in mask.iter().filter(|bit| *bit < width) {
            counts[bit] = counts[bit].saturating_sub(1);
        }
    }

    /// Resolve a sink function, caching the result.
    pub fn fetch_sink_function_address(&self, name: &str) -> Result<Option<u64>> {
        if let Some(address) = self.function_cache.read().get(name) {
            return Ok(Some(*address));
        }
        let resolved = match &self.kind {
            DomainKind::Host { registry, libraries } => registry.resolve(name, libraries),
            DomainKind::Accelerator => self
                .engine
                .lookup_function(self.id(), name)
                .map_err(|e| Error::from_engine(&format!("looking up {name} on {}", self.id()), e))?,
        };
        if let Some(address) = resolved {
            self.function_cache.write().insert(name.to_string(), address);
        }
        Ok(resolved)
    }
}

impl std::fmt::Debug for PhysDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysDomain")
            .field("details", &self.details)
            .field("host", &self.is_host())
            .field("log_domains", &self.log_domain_ids())
            .finish()
    }
}

fn accelerator_avoid_mask(num_threads: u32) -> CpuMask {
    if num_threads <= MIN_THREADS_FOR_AVOID_MASK {
        return CpuMask::new();
    }
    let mut mask = CpuMask::from_range((num_threads - RESERVED_TAIL_THREADS) as usize..num_threads as usize);
    mask.set(0);
    mask
}

/// Hardware threads the current process may run on.
#[cfg(target_os = "linux")]
pub fn host_cpu_mask() -> CpuMask {
    let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut set) };
    if rc == 0 {
        let mask = CpuMask::from_native(&set);
        if !mask.is_empty() {
            return mask;
        }
    }
    tracing::debug!(target: targets::MISC, "sched_getaffinity unavailable; using online CPU count");
    online_cpu_mask()
}

#[cfg(not(target_os = "linux"))]
pub fn host_cpu_mask() -> CpuMask {
    online_cpu_mask()
}

fn online_cpu_mask() -> CpuMask {
    let online = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    CpuMask::from_range(0..online.max(1) as usize)
}

fn host_physical_memory() -> u64 {
    let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if pages <= 0 || page_size <= 0 {
        return 0;
    }
    (pages as u64).saturating_mul(page_size as u64)
}

// 0 when the kernel does not expose cpufreq.
fn host_max_freq_mhz() -> u32 {
    std::fs::read_to_string("/sys/devices/system/cpu/cpu0/cpufreq/cpuinfo_max_freq")
        .ok()
        .and_then(|khz| khz.trim().parse::<u64>().ok())
        .map_or(0, |khz| (khz / 1000) as u32)
}
