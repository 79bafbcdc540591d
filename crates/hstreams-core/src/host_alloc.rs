//! Cache-line aligned host memory for sink-side buffer instantiations.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

use hstreams_tracing::targets;

use crate::error::{Error, Result};
use crate::types::CACHE_LINE_SIZE;

/// Alignment used when huge-page backing is requested.
const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

/// Zeroed, aligned block of host memory owned exclusively by its holder.
pub struct AlignedBlock {
    data: NonNull<u8>,
    layout: Layout,
    huge_pages: bool,
}

impl AlignedBlock {
    /// Allocate `len` zeroed bytes aligned to the cache line.
    pub fn new(len: u64) -> Result<Self> {
        Self::with_huge_pages(len, false)
    }

    /// Allocate `len` zeroed bytes; with `huge_pages` the block is aligned
    /// to 2 MiB and the kernel is advised to back it with huge pages.
    pub fn with_huge_pages(len: u64, huge_pages: bool) -> Result<Self> {
        let size = usize::try_from(len.max(1))
            .map_err(|_| Error::OutOfMemory(format!("{len} bytes do not fit the address space")))?;
        let align = if huge_pages { HUGE_PAGE_SIZE } else { CACHE_LINE_SIZE as usize };
        let layout = Layout::from_size_align(size, align)
            .map_err(|e| Error::OutOfMemory(format!("invalid layout for {len} bytes: {e}")))?;

        let data = unsafe {
            let ptr = alloc_zeroed(layout);
            NonNull::new(ptr).ok_or_else(|| Error::OutOfMemory(format!("failed to allocate {len} bytes")))?
        };

        let huge_pages = huge_pages && advise_huge_pages(data.as_ptr(), size);
        tracing::trace!(target: targets::MEM, len, align, huge_pages, "allocated host block");

        Ok(Self {
            data,
            layout,
            huge_pages,
        })
    }

    pub fn addr(&self) -> u64 {
        self.data.as_ptr() as u64
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.data.as_ptr()
    }

    pub fn len(&self) -> u64 {
        self.layout.size() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    /// Whether the kernel accepted the huge-page advice.
    pub fn huge_pages(&self) -> bool {
        self.huge_pages
    }
}

#[cfg(target_os = "linux")]
fn advise_huge_pages(ptr: *mut u8, size: usize) -> bool {
    let rc = unsafe { libc::madvise(ptr as *mut libc::c_void, size, libc::MADV_HUGEPAGE) };
    if rc != 0 {
        tracing::debug!(target: targets::MEM, size, "huge-page advice rejected");
    }
    rc == 0
}

#[cfg(not(target_os = "linux"))]
fn advise_huge_pages(_ptr: *mut u8, _size: usize) -> bool {
    false
}

impl Drop for AlignedBlock {
    fn drop(&mut self) {
        unsafe {
            dealloc(self.data.as_ptr(), self.layout);
        }
    }
}

impl std::fmt::Debug for AlignedBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBlock")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("len", &self.len())
            .field("huge_pages", &self.huge_pages)
            .finish()
    }
}

// Safety: the block owns its memory exclusively; access goes through raw
// addresses whose synchronization is provided by event dependencies.
unsafe impl Send for AlignedBlock {}
unsafe impl Sync for AlignedBlock {}
