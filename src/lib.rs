//! A boundary-tag allocator with an explicit free list.
//!
//! Memory is obtained from a [`RegionSupplier`] in page-granular regions and
//! carved into blocks. Each block carries its size and allocated flag in a
//! header and a matching footer, so both physical neighbours of a released
//! block can be found in constant time and merged. Free blocks are threaded
//! into one LIFO list that is searched first-fit.
//!
//! [`Heap`] is the single-owner core. [`Allocator`] puts one behind a spin lock
//! and implements [`GlobalAlloc`]:
//!
//! ```no_run
//! #[global_allocator]
//! static GLOBAL: tagalloc::Allocator = tagalloc::Allocator::new();
//! ```
//!
//! With the `c_api` feature the crate also exports the C `malloc` family.

#![allow(clippy::missing_safety_doc)]

use core::{
  alloc::{GlobalAlloc, Layout},
  cell::UnsafeCell,
  hint,
  ptr::{self, NonNull, null_mut},
  sync::atomic::{AtomicBool, Ordering},
};

// =============================================================================
// Logging
// =============================================================================

#[cfg(feature = "logging")]
macro_rules! trace {
  ($($arg:tt)*) => { ::log::trace!($($arg)*) };
}

#[cfg(not(feature = "logging"))]
macro_rules! trace {
  ($($arg:tt)*) => {{
    if false {
      let _ = format_args!($($arg)*);
    }
  }};
}

#[cfg(feature = "logging")]
macro_rules! debug {
  ($($arg:tt)*) => { ::log::debug!($($arg)*) };
}

#[cfg(not(feature = "logging"))]
macro_rules! debug {
  ($($arg:tt)*) => {{
    if false {
      let _ = format_args!($($arg)*);
    }
  }};
}

pub(crate) use {debug, trace};

mod config;
mod error;
mod free_list;
mod heap;
#[cfg(feature = "logging")]
pub mod logging;
mod region;
mod supplier;
mod tag;

pub use config::{CHUNK_MINIMUM, HeapConfig};
pub use error::{Error, Result};
pub use heap::{Heap, HeapStats};
pub use supplier::{DefaultSupplier, Hosted, Mmap, RegionSupplier, Reserved};
pub use tag::{ALIGNMENT, MIN_BLOCK_SIZE};

// =============================================================================
// Spin Lock
// =============================================================================

struct SpinLock {
  locked: AtomicBool,
}

impl SpinLock {
  const fn new() -> Self {
    Self {
      locked: AtomicBool::new(false),
    }
  }

  #[inline]
  fn lock(&self) -> SpinGuard<'_> {
    while self
      .locked
      .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      while self.locked.load(Ordering::Relaxed) {
        hint::spin_loop();
      }
    }
    SpinGuard(self)
  }
}

/// Unlocks on drop, also when a tripwire assertion unwinds.
struct SpinGuard<'a>(&'a SpinLock);

impl Drop for SpinGuard<'_> {
  #[inline]
  fn drop(&mut self) {
    self.0.locked.store(false, Ordering::Release);
  }
}

// =============================================================================
// GlobalAlloc
// =============================================================================

/// A [`Heap`] over the [`DefaultSupplier`], shared behind a spin lock.
///
/// Every call holds the lock for the duration of one heap operation, including
/// any region mapping. A `log` backend installed while this is the global
/// allocator must not allocate, or it will deadlock on the lock; the one in
/// `tagalloc::logging` does not.
pub struct Allocator {
  lock: SpinLock,
  heap: UnsafeCell<Heap<DefaultSupplier>>,
}

// All access to `heap` goes through `lock`.
unsafe impl Sync for Allocator {}

impl Allocator {
  pub const fn new() -> Self {
    Self::with_config(HeapConfig::DEFAULT)
  }

  pub const fn with_config(config: HeapConfig) -> Self {
    Self {
      lock: SpinLock::new(),
      heap: UnsafeCell::new(Heap::new(DefaultSupplier::new(), config)),
    }
  }

  #[inline]
  fn with_heap<R>(&self, f: impl FnOnce(&mut Heap<DefaultSupplier>) -> R) -> R {
    let _guard = self.lock.lock();
    f(unsafe { &mut *self.heap.get() })
  }

  pub fn stats(&self) -> HeapStats {
    self.with_heap(|heap| heap.stats())
  }

  /// See [`Heap::check`].
  pub fn check(&self) -> Result<()> {
    self.with_heap(|heap| heap.check())
  }

  /// Usable bytes behind `ptr`, 0 for null.
  pub unsafe fn usable_size(&self, ptr: *mut u8) -> usize {
    match NonNull::new(ptr) {
      Some(ptr) => self.with_heap(|heap| unsafe { heap.usable_size(ptr) }),
      None => 0,
    }
  }
}

impl Default for Allocator {
  fn default() -> Self {
    Self::new()
  }
}

#[inline]
fn into_raw(ptr: Option<NonNull<u8>>) -> *mut u8 {
  ptr.map_or(null_mut(), NonNull::as_ptr)
}

unsafe impl GlobalAlloc for Allocator {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    let size = layout.size().max(1);

    into_raw(self.with_heap(|heap| {
      if layout.align() > ALIGNMENT {
        heap.allocate_aligned(size, layout.align()).ok().flatten()
      } else {
        heap.allocate(size)
      }
    }))
  }

  unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
    self.with_heap(|heap| unsafe { heap.release(ptr) })
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    if layout.align() <= ALIGNMENT {
      return into_raw(self.with_heap(|heap| unsafe { heap.reallocate(ptr, new_size.max(1)) }));
    }

    // A moved block would only be guaranteed the default alignment.
    let new_ptr =
      unsafe { self.alloc(Layout::from_size_align_unchecked(new_size, layout.align())) };

    if !new_ptr.is_null() && !ptr.is_null() {
      unsafe { ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size)) };
      unsafe { self.dealloc(ptr, layout) };
    }

    new_ptr
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    if layout.align() <= ALIGNMENT {
      return into_raw(self.with_heap(|heap| heap.allocate_zeroed(1, layout.size().max(1))));
    }

    let ptr = unsafe { self.alloc(layout) };
    if !ptr.is_null() {
      unsafe { ptr::write_bytes(ptr, 0, layout.size()) }
    }
    ptr
  }
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

/// Heap behind the C API and the `tagalloc_*` helpers.
static SHARED: Allocator = Allocator::new();

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut u8 {
  into_raw(SHARED.with_heap(|heap| heap.allocate(size)))
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut u8) {
  if ptr.is_null() {
    return;
  }
  SHARED.with_heap(|heap| unsafe { heap.release(ptr) })
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut u8 {
  into_raw(SHARED.with_heap(|heap| heap.allocate_zeroed(nmemb, size)))
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
  into_raw(SHARED.with_heap(|heap| unsafe { heap.reallocate(ptr, size) }))
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn posix_memalign(
  memptr: *mut *mut u8,
  alignment: usize,
  size: usize,
) -> i32 {
  if !alignment.is_power_of_two() || alignment < core::mem::size_of::<*mut u8>() {
    return libc::EINVAL;
  }

  match SHARED.with_heap(|heap| heap.allocate_aligned(size.max(1), alignment)) {
    Ok(Some(ptr)) => {
      unsafe { *memptr = ptr.as_ptr() };
      0
    }
    _ => libc::ENOMEM,
  }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut u8) -> usize {
  unsafe { SHARED.usable_size(ptr) }
}

pub unsafe fn tagalloc_malloc(size: usize) -> *mut u8 {
  into_raw(SHARED.with_heap(|heap| heap.allocate(size)))
}

pub unsafe fn tagalloc_free(ptr: *mut u8) {
  SHARED.with_heap(|heap| unsafe { heap.release(ptr) })
}
