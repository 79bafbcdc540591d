//! Sink-side function registry and invocation thunk.
//!
//! Sink functions are plain Rust closures registered by name. A function is
//! visible to a domain when it is registered globally or when the library
//! it belongs to was loaded into that domain. Resolution hands out a
//! non-zero synthetic address; the thunk maps it back to the closure.
//!
//! The marshalled argument block is a slice of 64-bit words:
//!
//! ```text
//! [n_scalars, n_heap, scalar_0 .. scalar_{n-1}, heap_0 .. heap_{m-1}, function_address]
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytemuck::Pod;
use parking_lot::{Mutex, RwLock};

use hstreams_tracing::targets;

/// Name of the built-in byte fill. Scalars `[num_bytes, value]`, heap `[dst]`.
pub const MEMSET_SINK: &str = "hstreams_memset_sink";

/// Name of the built-in byte copy. Scalars `[num_bytes]`, heap `[src, dst]`.
pub const MEMCPY_SINK: &str = "hstreams_memcpy_sink";

const FIRST_FUNCTION_ADDRESS: u64 = 0x1000;
const FUNCTION_ADDRESS_STRIDE: u64 = 0x10;

/// A registered sink function. The second argument is the return area.
pub type SinkFn = Arc<dyn Fn(&SinkArgs, &mut [u8]) + Send + Sync>;

/// Decoded arguments of one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkArgs {
    scalars: Vec<u64>,
    heap: Vec<u64>,
}

impl SinkArgs {
    pub fn new(scalars: Vec<u64>, heap: Vec<u64>) -> Self {
        Self { scalars, heap }
    }

    pub fn scalars(&self) -> &[u64] {
        &self.scalars
    }

    /// Translated sink-side addresses of the heap arguments.
    pub fn heap_addrs(&self) -> &[u64] {
        &self.heap
    }

    pub fn scalar(&self, index: usize) -> Option<u64> {
        self.scalars.get(index).copied()
    }

    /// Reinterpret the low bytes of a scalar word as `T`.
    ///
    /// `None` when the index is out of range or `T` is wider than a word.
    pub fn scalar_as<T: Pod>(&self, index: usize) -> Option<T> {
        let size = std::mem::size_of::<T>();
        if size > std::mem::size_of::<u64>() {
            return None;
        }
        let word = self.scalar(index)?.to_le_bytes();
        Some(bytemuck::pod_read_unaligned(&word[..size]))
    }

    pub fn heap_ptr<T>(&self, index: usize) -> Option<*mut T> {
        self.heap.get(index).map(|addr| *addr as *mut T)
    }

    /// View a heap argument as a mutable slice of `len` elements.
    ///
    /// # Safety
    ///
    /// The heap address must point to at least `len` valid, suitably aligned
    /// `T`s that no other live reference aliases for the returned lifetime.
    pub unsafe fn heap_slice_mut<'a, T: Pod>(&self, index: usize, len: usize) -> Option<&'a mut [T]> {
        let ptr = self.heap_ptr::<T>(index)?;
        if ptr.is_null() {
            return None;
        }
        Some(std::slice::from_raw_parts_mut(ptr, len))
    }

    /// Pack a plain value into one scalar word (zero-extended).
    pub fn pack_scalar<T: Pod>(value: T) -> u64 {
        let bytes = bytemuck::bytes_of(&value);
        let mut word = [0u8; 8];
        let len = bytes.len().min(word.len());
        word[..len].copy_from_slice(&bytes[..len]);
        u64::from_le_bytes(word)
    }
}

/// Where a sink function's return bytes land.
///
/// Cloned handles share the same storage, so the caller keeps one clone and
/// reads it back after the completion event is signaled.
#[derive(Clone, Default)]
pub struct ReturnValue {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl ReturnValue {
    /// A zeroed return area of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(vec![0; size])),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    /// Read the leading bytes as `T`; `None` when the area is too small.
    pub fn read<T: Pod>(&self) -> Option<T> {
        let bytes = self.bytes.lock();
        let size = std::mem::size_of::<T>();
        (bytes.len() >= size).then(|| bytemuck::pod_read_unaligned(&bytes[..size]))
    }

    pub(crate) fn with_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut bytes = self.bytes.lock();
        f(&mut bytes)
    }
}

impl fmt::Debug for ReturnValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReturnValue").field("len", &self.len()).finish()
    }
}

/// Why a marshalled block could not be invoked.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ThunkError {
    #[error("argument block of {0} words is too small")]
    BlockTooSmall(usize),

    #[error("argument block declares {scalars} scalars and {heap} heap args but holds {len} words")]
    LengthMismatch { scalars: u64, heap: u64, len: usize },

    #[error("no sink function at address {0:#x}")]
    UnknownFunction(u64),
}

struct RegisteredFunction {
    name: String,
    func: SinkFn,
}

#[derive(Default)]
struct RegistryInner {
    global: HashMap<String, u64>,
    libraries: HashMap<String, HashMap<String, u64>>,
    functions: HashMap<u64, RegisteredFunction>,
    next_address: u64,
}

impl RegistryInner {
    fn insert(&mut self, name: &str, func: SinkFn) -> u64 {
        if self.next_address == 0 {
            self.next_address = FIRST_FUNCTION_ADDRESS;
        }
        let address = self.next_address;
        self.next_address += FUNCTION_ADDRESS_STRIDE;
        self.functions.insert(
            address,
            RegisteredFunction {
                name: name.to_string(),
                func,
            },
        );
        address
    }
}

/// Registry of sink functions shared by the host domain and the Engine.
pub struct SinkRegistry {
    inner: RwLock<RegistryInner>,
}

impl SinkRegistry {
    /// A registry holding the built-in memset and memcpy functions.
    pub fn new() -> Self {
        let registry = Self::empty();
        registry.register(MEMSET_SINK, memset_sink);
        registry.register(MEMCPY_SINK, memcpy_sink);
        registry
    }

    pub fn empty() -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    /// Register a function visible in every domain.
    ///
    /// Re-registering a name replaces the previous binding.
    pub fn register<F>(&self, name: &str, func: F) -> u64
    where
        F: Fn(&SinkArgs, &mut [u8]) + Send + Sync + 'static,
    {
        let mut inner = self.inner.write();
        let address = inner.insert(name, Arc::new(func));
        inner.global.insert(name.to_string(), address);
        tracing::debug!(target: targets::SINK_INVOKE, name, address, "registered sink function");
        address
    }

    /// Register a function that only resolves in domains where `library`
    /// has been loaded.
    pub fn register_in_library<F>(&self, library: &str, name: &str, func: F) -> u64
    where
        F: Fn(&SinkArgs, &mut [u8]) + Send + Sync + 'static,
    {
        let mut inner = self.inner.write();
        let address = inner.insert(name, Arc::new(func));
        inner
            .libraries
            .entry(library.to_string())
            .or_default()
            .insert(name.to_string(), address);
        tracing::debug!(target: targets::SINK_INVOKE, library, name, address, "registered library sink function");
        address
    }

    /// Declare a library without registering any function in it.
    pub fn declare_library(&self, library: &str) {
        self.inner.write().libraries.entry(library.to_string()).or_default();
    }

    pub fn has_library(&self, library: &str) -> bool {
        self.inner.read().libraries.contains_key(library)
    }

    /// Resolve `name`, searching `loaded` libraries in order before the
    /// global namespace.
    pub fn resolve(&self, name: &str, loaded: &[String]) -> Option<u64> {
        let inner = self.inner.read();
        loaded
            .iter()
            .filter_map(|library| inner.libraries.get(library))
            .find_map(|functions| functions.get(name).copied())
            .or_else(|| inner.global.get(name).copied())
    }

    pub fn function(&self, address: u64) -> Option<SinkFn> {
        self.inner.read().functions.get(&address).map(|f| Arc::clone(&f.func))
    }

    pub fn function_name(&self, address: u64) -> Option<String> {
        self.inner.read().functions.get(&address).map(|f| f.name.clone())
    }

    /// Decode a marshalled block and invoke the function it names.
    pub fn invoke(&self, block: &[u64], ret: Option<&ReturnValue>) -> Result<(), ThunkError> {
        if block.len() < 2 {
            return Err(ThunkError::BlockTooSmall(block.len()));
        }
        let (scalars, heap) = (block[0], block[1]);
        let expected = scalars
            .checked_add(heap)
            .and_then(|n| n.checked_add(3))
            .and_then(|n| usize::try_from(n).ok());
        if expected != Some(block.len()) {
            return Err(ThunkError::LengthMismatch {
                scalars,
                heap,
                len: block.len(),
            });
        }
        let scalar_end = 2 + scalars as usize;
        let heap_end = scalar_end + heap as usize;
        let address = block[heap_end];
        let func = self.function(address).ok_or(ThunkError::UnknownFunction(address))?;
        let args = SinkArgs::new(block[2..scalar_end].to_vec(), block[scalar_end..heap_end].to_vec());

        match ret {
            Some(ret) => ret.with_mut(|bytes| func(&args, bytes)),
            None => func(&args, &mut []),
        }
        Ok(())
    }
}

impl Default for SinkRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SinkRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("SinkRegistry")
            .field("functions", &inner.functions.len())
            .field("libraries", &inner.libraries.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Build the marshalled block for one invocation.
pub fn marshal_args(scalars: &[u64], heap: &[u64], function_address: u64) -> Vec<u64> {
    let mut block = Vec::with_capacity(3 + scalars.len() + heap.len());
    block.push(scalars.len() as u64);
    block.push(heap.len() as u64);
    block.extend_from_slice(scalars);
    block.extend_from_slice(heap);
    block.push(function_address);
    block
}

/// Invoke a block, logging instead of failing. Used by execution threads
/// that have nobody to report to.
pub(crate) fn thunk(registry: &SinkRegistry, block: &[u64], ret: Option<&ReturnValue>) {
    if let Err(err) = registry.invoke(block, ret) {
        tracing::error!(target: targets::SINK_INVOKE, error = %err, "sink invocation failed");
    }
}

fn memset_sink(args: &SinkArgs, _ret: &mut [u8]) {
    let (Some(len), Some(value), Some(dst)) = (args.scalar(0), args.scalar_as::<u8>(1), args.heap_ptr::<u8>(0)) else {
        tracing::error!(target: targets::SINK_INVOKE, "{MEMSET_SINK} called with missing arguments");
        return;
    };
    // SAFETY: the runtime translated `dst` from a buffer instantiation covering `len` bytes.
    unsafe { std::ptr::write_bytes(dst, value, len as usize) };
}

fn memcpy_sink(args: &SinkArgs, _ret: &mut [u8]) {
    let (Some(len), Some(src), Some(dst)) = (args.scalar(0), args.heap_ptr::<u8>(0), args.heap_ptr::<u8>(1)) else {
        tracing::error!(target: targets::SINK_INVOKE, "{MEMCPY_SINK} called with missing arguments");
        return;
    };
    // SAFETY: both ranges come from buffer instantiations covering `len` bytes.
    unsafe { std::ptr::copy(src as *const u8, dst, len as usize) };
}
