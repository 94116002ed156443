//! Sources of raw pages for the heap.
//!
//! The heap only needs to request page-aligned, zero-filled ranges and give
//! them back; it does not care which OS API (or test double) provides them.

use core::{
  ptr::{NonNull, null_mut},
  sync::atomic::{AtomicUsize, Ordering},
};
use std::alloc;

use crate::tag::{ALIGNMENT, checked_align_up};

/// Page-granular memory provider consumed by [`crate::Heap`].
///
/// Ranges must be zero-filled, aligned to [`RegionSupplier::page_size`] and at
/// least [`crate::ALIGNMENT`]-aligned. A supplier that may hand out a range
/// starting exactly where a previous one ended must accept
/// [`RegionSupplier::unmap_pages`] calls spanning several of its ranges, because
/// the heap merges contiguous ranges into a single region.
pub trait RegionSupplier {
  /// Maps at least `min_bytes` bytes, rounded up to the page size. Returns the
  /// base and the actual length, or `None` when no memory is available.
  fn map_pages(&mut self, min_bytes: usize) -> Option<(NonNull<u8>, usize)>;

  /// Returns a range back to the supplier.
  ///
  /// # Safety
  ///
  /// `ptr..ptr + size` must be the exact union of ranges previously returned
  /// by [`RegionSupplier::map_pages`] on this supplier and not yet unmapped,
  /// and nothing may reference it afterwards.
  unsafe fn unmap_pages(&mut self, ptr: NonNull<u8>, size: usize);

  fn page_size(&self) -> usize;
}

// =============================================================================
// Platform
// =============================================================================

/// Cached `sysconf(_SC_PAGE_SIZE)`.
static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

pub(crate) fn os_page_size() -> usize {
  let cached = PAGE_SIZE.load(Ordering::Relaxed);
  if cached != 0 {
    return cached;
  }
  let size = unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) };
  let size = if size > 0 { size as usize } else { 4096 };
  PAGE_SIZE.store(size, Ordering::Relaxed);
  size
}

unsafe fn os_mmap(size: usize, flags: libc::c_int) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | flags,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  if unsafe { libc::munmap(ptr.cast(), size) } != 0 {
    crate::debug!("munmap({:p}, {}) failed, range leaked", ptr, size);
  }
}

// =============================================================================
// Mmap
// =============================================================================

/// One anonymous private mapping per region.
#[derive(Clone, Copy, Debug, Default)]
pub struct Mmap;

impl Mmap {
  pub const fn new() -> Self {
    Mmap
  }
}

impl RegionSupplier for Mmap {
  fn map_pages(&mut self, min_bytes: usize) -> Option<(NonNull<u8>, usize)> {
    let length = checked_align_up(min_bytes.max(1), self.page_size())?;
    let ptr = unsafe { os_mmap(length, 0) };
    NonNull::new(ptr).map(|ptr| (ptr, length))
  }

  unsafe fn unmap_pages(&mut self, ptr: NonNull<u8>, size: usize) {
    unsafe { os_munmap(ptr.as_ptr(), size) }
  }

  fn page_size(&self) -> usize {
    os_page_size()
  }
}

// =============================================================================
// Reserved
// =============================================================================

/// Carves page runs, in address order, out of one large reservation, the way
/// a program break grows. Consecutive requests are contiguous, so the heap
/// merges them into one region.
///
/// The reservation is made lazily with `MAP_NORESERVE`; untouched pages cost no
/// physical memory.
#[derive(Debug)]
pub struct Reserved {
  capacity: usize,
  base: *mut u8,
  brk: usize,
}

unsafe impl Send for Reserved {}

impl Reserved {
  /// A supplier that will never hand out more than `capacity` bytes (rounded
  /// up to the page size) in total.
  pub const fn new(capacity: usize) -> Self {
    Self {
      capacity,
      base: null_mut(),
      brk: 0,
    }
  }

  /// Bytes currently handed out, counted from the start of the reservation.
  pub fn used(&self) -> usize {
    self.brk
  }

  fn reserve(&mut self) -> Option<()> {
    if self.base.is_null() {
      self.capacity = checked_align_up(self.capacity, self.page_size())?;
      let base = unsafe { os_mmap(self.capacity, libc::MAP_NORESERVE) };
      if base.is_null() {
        return None;
      }
      crate::debug!("reserved {} bytes at {:p}", self.capacity, base);
      self.base = base;
    }
    Some(())
  }
}

impl RegionSupplier for Reserved {
  fn map_pages(&mut self, min_bytes: usize) -> Option<(NonNull<u8>, usize)> {
    self.reserve()?;
    let length = checked_align_up(min_bytes.max(1), self.page_size())?;
    if length > self.capacity - self.brk {
      return None;
    }
    let ptr = unsafe { self.base.add(self.brk) };
    self.brk += length;
    NonNull::new(ptr).map(|ptr| (ptr, length))
  }

  unsafe fn unmap_pages(&mut self, ptr: NonNull<u8>, size: usize) {
    let offset = ptr.as_ptr() as usize - self.base as usize;
    debug_assert!(offset + size <= self.brk, "unmap outside of the break");

    // Hand the physical pages back; the range must read as zeroes if reused.
    #[cfg(target_os = "linux")]
    unsafe {
      libc::madvise(ptr.as_ptr().cast(), size, libc::MADV_DONTNEED)
    };
    #[cfg(not(target_os = "linux"))]
    unsafe {
      ptr.as_ptr().write_bytes(0, size)
    };

    if offset + size == self.brk {
      self.brk = offset;
    }
  }

  fn page_size(&self) -> usize {
    os_page_size()
  }
}

impl Drop for Reserved {
  fn drop(&mut self) {
    if !self.base.is_null() {
      unsafe { os_munmap(self.base, self.capacity) };
    }
  }
}

// =============================================================================
// Hosted
// =============================================================================

/// Backs regions with the Rust global allocator.
///
/// Useful where system calls are unavailable (Miri) and for deterministic tests:
/// the page size is fixed, an optional limit simulates memory exhaustion, and
/// every range is followed by one unused page so two ranges are never
/// contiguous.
#[derive(Debug)]
pub struct Hosted {
  page_size: usize,
  limit: usize,
  mapped: usize,
}

impl Hosted {
  pub const DEFAULT_PAGE_SIZE: usize = 4096;

  pub const fn new() -> Self {
    Self::with_page_size(Self::DEFAULT_PAGE_SIZE)
  }

  /// `page_size` must be a power of two of at least [`crate::ALIGNMENT`].
  pub const fn with_page_size(page_size: usize) -> Self {
    assert!(page_size.is_power_of_two() && page_size >= ALIGNMENT);
    Self {
      page_size,
      limit: usize::MAX,
      mapped: 0,
    }
  }

  /// Caps the total bytes mapped at any one time.
  pub const fn with_limit(mut self, limit: usize) -> Self {
    self.limit = limit;
    self
  }

  /// Bytes currently mapped.
  pub fn mapped(&self) -> usize {
    self.mapped
  }

  fn layout(&self, length: usize) -> Option<alloc::Layout> {
    let padded = length.checked_add(self.page_size)?;
    alloc::Layout::from_size_align(padded, self.page_size).ok()
  }
}

impl Default for Hosted {
  fn default() -> Self {
    Self::new()
  }
}

impl RegionSupplier for Hosted {
  fn map_pages(&mut self, min_bytes: usize) -> Option<(NonNull<u8>, usize)> {
    let length = checked_align_up(min_bytes.max(1), self.page_size)?;
    if length > self.limit.saturating_sub(self.mapped) {
      return None;
    }
    let ptr = unsafe { alloc::alloc_zeroed(self.layout(length)?) };
    let ptr = NonNull::new(ptr)?;
    self.mapped += length;
    Some((ptr, length))
  }

  unsafe fn unmap_pages(&mut self, ptr: NonNull<u8>, size: usize) {
    if let Some(layout) = self.layout(size) {
      self.mapped -= size;
      unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
    }
  }

  fn page_size(&self) -> usize {
    self.page_size
  }
}

/// Supplier used by [`crate::Allocator`].
#[cfg(not(miri))]
pub type DefaultSupplier = Mmap;

#[cfg(miri)]
pub type DefaultSupplier = Hosted;
