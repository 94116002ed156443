use core::ptr::{self, NonNull};

use crate::{
  config::HeapConfig,
  error::{Error, Result},
  free_list::FreeList,
  region::{self, REGION_OVERHEAD, RegionHeader},
  supplier::RegionSupplier,
  tag::{ALIGNMENT, Block, MIN_BLOCK_SIZE, Tag, WORD, adjusted_size, align_up, checked_align_up},
};

/// Snapshot of heap occupancy, see [`Heap::stats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
  /// Regions currently mapped (contiguous mappings count once).
  pub regions: usize,
  /// Bytes obtained from the supplier and not yet returned.
  pub mapped_bytes: usize,
  pub allocated_blocks: usize,
  /// Sum of allocated block sizes, tags included.
  pub allocated_bytes: usize,
  pub free_blocks: usize,
  /// Sum of free block sizes, tags included.
  pub free_bytes: usize,
}

/// Explicit free-list heap with boundary-tag coalescing.
///
/// A `Heap` is a single-owner context: every mutating operation takes
/// `&mut self`. Wrap it in a lock (see [`crate::Allocator`]) to share it.
/// Dropping the heap returns every region to its supplier, invalidating all
/// outstanding payloads.
pub struct Heap<S: RegionSupplier> {
  supplier: S,
  config: HeapConfig,
  free: FreeList,
  /// Most recently mapped region first.
  regions: Option<NonNull<RegionHeader>>,
  /// Region that the next mapping may extend in place, when contiguous.
  tail: Option<NonNull<RegionHeader>>,
  region_count: usize,
  mapped_bytes: usize,
  allocated_blocks: usize,
  allocated_bytes: usize,
}

// The heap exclusively owns every region it points into.
unsafe impl<S: RegionSupplier + Send> Send for Heap<S> {}

impl<S: RegionSupplier> Heap<S> {
  pub const fn new(supplier: S, config: HeapConfig) -> Self {
    Self {
      supplier,
      config,
      free: FreeList::new(),
      regions: None,
      tail: None,
      region_count: 0,
      mapped_bytes: 0,
      allocated_blocks: 0,
      allocated_bytes: 0,
    }
  }

  pub fn with_supplier(supplier: S) -> Self {
    Self::new(supplier, HeapConfig::DEFAULT)
  }

  pub fn config(&self) -> &HeapConfig {
    &self.config
  }

  pub fn supplier(&self) -> &S {
    &self.supplier
  }

  /// Resets the heap: every region goes back to the supplier, then
  /// [`HeapConfig::initial_chunk`] bytes are mapped up front if configured.
  ///
  /// All payloads handed out before the call become invalid.
  pub fn init(&mut self) -> Result<()> {
    self.release_all();
    crate::debug!("heap reset, {:?}", self.config);

    if self.config.initial_chunk > 0 {
      let asize = adjusted_size(self.config.initial_chunk).ok_or(Error::OutOfMemory {
        requested: self.config.initial_chunk,
      })?;
      unsafe { self.extend(asize)? };
    }
    Ok(())
  }

  // ===========================================================================
  // Allocation
  // ===========================================================================

  /// Returns a [`ALIGNMENT`]-aligned pointer to at least `size` writable bytes,
  /// or `None` when `size` is zero or memory is exhausted.
  pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
    self.try_allocate(size).ok().flatten()
  }

  /// Like [`Heap::allocate`], but tells a zero-size request (`Ok(None)`) apart
  /// from exhaustion (`Err`).
  pub fn try_allocate(&mut self, size: usize) -> Result<Option<NonNull<u8>>> {
    if size == 0 {
      return Ok(None);
    }
    let asize = adjusted_size(size).ok_or(Error::OutOfMemory { requested: size })?;

    unsafe {
      let block = match self.free.find_fit(asize) {
        Some(block) => block,
        None => self.extend(asize).inspect_err(|_| {
          crate::debug!("out of memory serving {} bytes", size);
        })?,
      };
      Ok(Some(self.place(block, asize).payload()))
    }
  }

  /// `count * size` zeroed bytes, `None` on overflow, zero size or exhaustion.
  pub fn allocate_zeroed(&mut self, count: usize, size: usize) -> Option<NonNull<u8>> {
    let total = count.checked_mul(size)?;
    let ptr = self.allocate(total)?;
    unsafe { ptr.as_ptr().write_bytes(0, total) };
    Some(ptr)
  }

  /// Allocates `size` bytes at an address that is a multiple of `align`.
  ///
  /// Alignments up to [`ALIGNMENT`] are served by [`Heap::try_allocate`]. Larger
  /// ones over-reserve and split off a free leading block, so the returned
  /// pointer can be released like any other.
  pub fn allocate_aligned(&mut self, size: usize, align: usize) -> Result<Option<NonNull<u8>>> {
    if !align.is_power_of_two() {
      return Err(Error::InvalidAlignment { align });
    }
    if align <= ALIGNMENT {
      return self.try_allocate(size);
    }
    if size == 0 {
      return Ok(None);
    }

    let oom = Error::OutOfMemory { requested: size };
    let asize = adjusted_size(size).ok_or(oom)?;
    let search = asize
      .checked_add(align)
      .and_then(|s| s.checked_add(MIN_BLOCK_SIZE))
      .ok_or(oom)?;

    unsafe {
      let mut block = match self.free.find_fit(search) {
        Some(block) => block,
        None => self.extend(search)?,
      };

      let mut aligned = align_up(block.addr(), align);
      if aligned != block.addr() {
        // The leading gap must be able to stand alone as a free block.
        if aligned - block.addr() < MIN_BLOCK_SIZE {
          aligned += align;
        }
        let gap = aligned - block.addr();
        let total = block.size();
        self.free.remove(block);
        block.set(gap, false);
        self.free.insert(block);

        block = block.offset(gap);
        block.set(total - gap, false);
        self.free.insert(block);
      }
      debug_assert_eq!(block.addr() % align, 0);

      Ok(Some(self.place(block, asize).payload()))
    }
  }

  /// Takes `block` off the free list and marks its first `asize` bytes
  /// allocated, returning the rest to the free list when it is large enough
  /// to be a block of its own.
  unsafe fn place(&mut self, block: Block, asize: usize) -> Block {
    unsafe {
      let size = block.size();
      debug_assert!(!block.is_allocated() && size >= asize);

      self.free.remove(block);
      if size - asize >= MIN_BLOCK_SIZE {
        block.set(asize, true);
        let rest = block.next();
        rest.set(size - asize, false);
        self.free.insert(rest);
        self.note_allocated(asize);
      } else {
        block.set(size, true);
        self.note_allocated(size);
      }
      block
    }
  }

  #[inline]
  fn note_allocated(&mut self, size: usize) {
    self.allocated_blocks += 1;
    self.allocated_bytes += size;
  }

  #[inline]
  fn note_released(&mut self, size: usize) {
    self.allocated_blocks -= 1;
    self.allocated_bytes -= size;
  }

  // ===========================================================================
  // Release
  // ===========================================================================

  /// Returns the block behind `ptr` to the heap. A null `ptr` is ignored.
  ///
  /// # Safety
  ///
  /// `ptr` must be null or a payload pointer returned by this heap and not
  /// released since. With `debug_assertions` or the `debug-tripwire` feature,
  /// obviously bogus pointers and double releases panic instead of corrupting
  /// the heap.
  pub unsafe fn release(&mut self, ptr: *mut u8) {
    let Some(payload) = NonNull::new(ptr) else {
      return;
    };

    unsafe {
      let block = Block::from_payload(payload);
      tripwire(block);

      let size = block.size();
      self.note_released(size);
      block.set(size, false);

      let merged = self.coalesce(block);
      if self.config.release_empty_regions {
        self.release_region_if_empty(merged);
      }
    }
  }

  /// Merges a block whose tags read free with its free physical neighbours
  /// and inserts the result into the free list. The block itself must not be
  /// in the list yet.
  unsafe fn coalesce(&mut self, block: Block) -> Block {
    unsafe {
      let prev_free = !block.prev_tag().is_allocated();
      let next = block.next();
      let next_free = !next.is_allocated();

      let mut start = block;
      let mut size = block.size();

      match (prev_free, next_free) {
        (false, false) => {}
        (false, true) => {
          self.free.remove(next);
          size += next.size();
        }
        (true, false) => {
          let prev = block.prev();
          self.free.remove(prev);
          size += prev.size();
          start = prev;
        }
        (true, true) => {
          let prev = block.prev();
          self.free.remove(prev);
          self.free.remove(next);
          size += prev.size() + next.size();
          start = prev;
        }
      }

      start.set(size, false);
      self.free.insert(start);
      start
    }
  }

  // ===========================================================================
  // Reallocation
  // ===========================================================================

  /// Resizes the allocation behind `ptr`, preserving its contents up to the
  /// smaller of the two sizes.
  ///
  /// Shrinks happen in place. Growth happens in place when the next physical
  /// block is free and large enough, otherwise the contents move. A null `ptr`
  /// behaves like [`Heap::allocate`]; a zero `new_size` releases `ptr` and
  /// returns `None`. When growing fails, `None` is returned and `ptr` is left
  /// untouched.
  ///
  /// # Safety
  ///
  /// Same contract as [`Heap::release`].
  pub unsafe fn reallocate(&mut self, ptr: *mut u8, new_size: usize) -> Option<NonNull<u8>> {
    let Some(payload) = NonNull::new(ptr) else {
      return self.allocate(new_size);
    };
    if new_size == 0 {
      unsafe { self.release(ptr) };
      return None;
    }

    let asize = adjusted_size(new_size)?;

    unsafe {
      let block = Block::from_payload(payload);
      tripwire(block);
      let size = block.size();

      if asize <= size {
        self.shrink(block, asize);
        return Some(payload);
      }

      let next = block.next();
      if !next.is_allocated() && size + next.size() >= asize {
        let total = size + next.size();
        self.free.remove(next);
        self.note_released(size);
        if total - asize >= MIN_BLOCK_SIZE {
          block.set(asize, true);
          let rest = block.next();
          rest.set(total - asize, false);
          self.free.insert(rest);
          self.note_allocated(asize);
        } else {
          block.set(total, true);
          self.note_allocated(total);
        }
        return Some(payload);
      }

      let moved = self.allocate(new_size)?;
      ptr::copy_nonoverlapping(payload.as_ptr(), moved.as_ptr(), block.usable().min(new_size));
      self.release(ptr);
      Some(moved)
    }
  }

  /// Cuts an allocated block down to `asize`, returning the tail to the heap
  /// when it can form a block.
  unsafe fn shrink(&mut self, block: Block, asize: usize) {
    unsafe {
      let size = block.size();
      if size - asize < MIN_BLOCK_SIZE {
        return;
      }
      self.note_released(size);
      block.set(asize, true);
      self.note_allocated(asize);

      let rest = block.next();
      rest.set(size - asize, false);
      self.coalesce(rest);
    }
  }

  /// Bytes usable behind `ptr`, at least what was requested.
  ///
  /// # Safety
  ///
  /// `ptr` must be a live payload pointer returned by this heap.
  pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
    unsafe { Block::from_payload(ptr).usable() }
  }

  // ===========================================================================
  // Regions
  // ===========================================================================

  /// Maps a new region able to hold a block of `asize` bytes. The new free
  /// block is coalesced and inserted before being returned.
  ///
  /// Nothing is modified when the supplier fails.
  unsafe fn extend(&mut self, asize: usize) -> Result<Block> {
    let oom = Error::OutOfMemory { requested: asize };
    let wanted = asize
      .checked_add(REGION_OVERHEAD)
      .ok_or(oom)?
      .max(self.config.chunk_size);
    let length = checked_align_up(wanted, self.supplier.page_size()).ok_or(oom)?;

    let Some((base, len)) = self.supplier.map_pages(length) else {
      crate::debug!("supplier refused {} bytes", length);
      return Err(oom);
    };
    debug_assert!(len >= length && len % ALIGNMENT == 0);
    debug_assert!(base.as_ptr() as usize % ALIGNMENT == 0);
    self.mapped_bytes += len;

    unsafe {
      let block = match self.tail {
        Some(tail) if RegionHeader::end(tail) == base.as_ptr() as usize => {
          crate::trace!("absorbing {} bytes at {:p} into region {:p}", len, base, tail);
          region::absorb(tail, base, len)
        }
        _ => {
          let (region, block) = region::format(base, len);
          self.link_region(region);
          crate::trace!("mapped region {:p}, {} bytes", region, len);
          block
        }
      };
      Ok(self.coalesce(block))
    }
  }

  unsafe fn link_region(&mut self, region: NonNull<RegionHeader>) {
    unsafe {
      (*region.as_ptr()).next = self.regions;
      (*region.as_ptr()).prev = None;
      if let Some(head) = self.regions {
        (*head.as_ptr()).prev = Some(region);
      }
    }
    self.regions = Some(region);
    self.tail = Some(region);
    self.region_count += 1;
  }

  unsafe fn unlink_region(&mut self, region: NonNull<RegionHeader>) {
    unsafe {
      let RegionHeader { next, prev, .. } = region.read();
      match prev {
        Some(prev) => (*prev.as_ptr()).next = next,
        None => self.regions = next,
      }
      if let Some(next) = next {
        (*next.as_ptr()).prev = prev;
      }
    }
    if self.tail == Some(region) {
      self.tail = None;
    }
    self.region_count -= 1;
  }

  /// Unmaps the region of `block` if `block` is free and fills it entirely,
  /// unless it is the last region left.
  unsafe fn release_region_if_empty(&mut self, block: Block) {
    unsafe {
      if self.region_count <= 1 || !RegionHeader::is_spanned_by(block) {
        return;
      }

      let region = RegionHeader::of_first_block(block);
      let len = (*region.as_ptr()).len;
      debug_assert_eq!(block.size() + REGION_OVERHEAD, len);

      self.free.remove(block);
      self.unlink_region(region);
      self.mapped_bytes -= len;
      crate::trace!("returning region {:p}, {} bytes", region, len);
      self.supplier.unmap_pages(RegionHeader::base(region), len);
    }
  }

  /// Returns every region to the supplier and forgets all blocks.
  fn release_all(&mut self) {
    let mut cursor = self.regions;
    while let Some(region) = cursor {
      unsafe {
        let len = (*region.as_ptr()).len;
        cursor = (*region.as_ptr()).next;
        self.supplier.unmap_pages(RegionHeader::base(region), len);
      }
    }

    self.free = FreeList::new();
    self.regions = None;
    self.tail = None;
    self.region_count = 0;
    self.mapped_bytes = 0;
    self.allocated_blocks = 0;
    self.allocated_bytes = 0;
  }

  // ===========================================================================
  // Introspection
  // ===========================================================================

  pub fn stats(&self) -> HeapStats {
    let free_bytes: usize = unsafe { self.free.iter().map(|block| block.size()).sum() };
    HeapStats {
      regions: self.region_count,
      mapped_bytes: self.mapped_bytes,
      allocated_blocks: self.allocated_blocks,
      allocated_bytes: self.allocated_bytes,
      free_blocks: self.free.len(),
      free_bytes,
    }
  }

  /// Walks every region and the free list, verifying:
  ///
  /// - prologue and epilogue sentinels are intact,
  /// - each block is aligned, at least [`MIN_BLOCK_SIZE`] and its header
  ///   matches its footer,
  /// - no two physically adjacent blocks are both free,
  /// - the free list links agree in both directions and hold exactly the
  ///   blocks marked free,
  /// - the allocation counters match the blocks found.
  pub fn check(&self) -> Result<()> {
    fn fail(reason: &'static str, address: usize) -> Result<()> {
      Err(Error::Inconsistent { reason, address })
    }

    let mut free_blocks = 0;
    let mut allocated_blocks = 0;
    let mut allocated_bytes = 0;
    let mut regions = 0;

    let mut cursor = self.regions;
    while let Some(region) = cursor {
      regions += 1;
      unsafe {
        let end = RegionHeader::end(region);
        let mut block = RegionHeader::first_block(region);
        if block.prev_tag() != Tag::PROLOGUE || Tag::read(block.prev_footer().sub(1)) != Tag::PROLOGUE {
          return fail("damaged prologue", region.as_ptr() as usize);
        }

        let mut prev_free = false;
        loop {
          let tag = block.tag();
          if tag == Tag::EPILOGUE {
            break;
          }
          let size = tag.size();
          if block.addr() % ALIGNMENT != 0 {
            return fail("misaligned payload", block.addr());
          }
          if size < MIN_BLOCK_SIZE || block.addr() + size > end {
            return fail("block size out of bounds", block.addr());
          }
          if Tag::read(block.footer()) != tag {
            return fail("header and footer disagree", block.addr());
          }
          if tag.is_allocated() {
            allocated_blocks += 1;
            allocated_bytes += size;
            prev_free = false;
          } else {
            if prev_free {
              return fail("adjacent free blocks were not coalesced", block.addr());
            }
            free_blocks += 1;
            prev_free = true;
          }
          block = block.next();
        }
        if block.header() as usize != end - WORD {
          return fail("epilogue not at region end", block.addr());
        }
        cursor = (*region.as_ptr()).next;
      }
    }

    if regions != self.region_count {
      return fail("region count mismatch", 0);
    }
    if allocated_blocks != self.allocated_blocks || allocated_bytes != self.allocated_bytes {
      return fail("allocation counters out of sync", 0);
    }

    let mut listed = 0;
    let mut expected_prev = None;
    unsafe {
      for block in self.free.iter() {
        listed += 1;
        if listed > free_blocks {
          return fail("free list longer than the free blocks in the heap", block.addr());
        }
        if block.is_allocated() {
          return fail("allocated block in free list", block.addr());
        }
        if (*block.links()).prev != expected_prev {
          return fail("free list back link broken", block.addr());
        }
        expected_prev = Some(block);
      }
    }
    if listed != free_blocks || listed != self.free.len() {
      return fail("free list does not match the free blocks in the heap", 0);
    }

    Ok(())
  }

  /// Payload address of the first block in the free list.
  #[cfg(test)]
  fn free_head(&self) -> Option<usize> {
    self.free.head().map(Block::addr)
  }
}

impl<S: RegionSupplier> Drop for Heap<S> {
  fn drop(&mut self) {
    self.release_all();
  }
}

/// Cheap sanity checks on a block about to be released or resized.
#[inline(always)]
unsafe fn tripwire(block: Block) {
  if cfg!(any(debug_assertions, feature = "debug-tripwire")) {
    let tag = unsafe { block.tag() };
    assert!(block.addr() % ALIGNMENT == 0, "release of misaligned pointer {:p}", block.payload());
    assert!(tag.is_allocated(), "double release of {:p}", block.payload());
    assert!(tag.size() >= MIN_BLOCK_SIZE, "release of foreign pointer {:p}", block.payload());
    assert!(
      unsafe { Tag::read(block.footer()) } == tag,
      "boundary tags of {:p} are damaged",
      block.payload()
    );
  }
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;
  use crate::{supplier::Hosted, tag::OVERHEAD};

  const PAGE: usize = Hosted::DEFAULT_PAGE_SIZE;

  fn heap() -> Heap<Hosted> {
    Heap::with_supplier(Hosted::new())
  }

  fn addr(ptr: NonNull<u8>) -> usize {
    ptr.as_ptr() as usize
  }

  #[test]
  fn zero_size_is_not_an_error() {
    let mut heap = heap();
    assert_eq!(heap.try_allocate(0), Ok(None));
    assert_eq!(heap.allocate(0), None);
    assert_eq!(heap.stats(), HeapStats::default());
  }

  #[test]
  fn overflowing_request_is_out_of_memory() {
    let mut heap = heap();
    assert!(matches!(heap.try_allocate(usize::MAX), Err(Error::OutOfMemory { .. })));
    assert!(matches!(
      heap.try_allocate(usize::MAX - PAGE),
      Err(Error::OutOfMemory { .. })
    ));
    assert_eq!(heap.stats().regions, 0);
  }

  #[test]
  fn first_allocation_maps_one_chunk() {
    let mut heap = heap();
    let ptr = heap.allocate(1).unwrap();
    assert_eq!(addr(ptr) % ALIGNMENT, 0);

    assert_eq!(
      heap.stats(),
      HeapStats {
        regions: 1,
        mapped_bytes: PAGE,
        allocated_blocks: 1,
        allocated_bytes: MIN_BLOCK_SIZE,
        free_blocks: 1,
        free_bytes: PAGE - REGION_OVERHEAD - MIN_BLOCK_SIZE,
      }
    );
    heap.check().unwrap();
  }

  #[test]
  fn split_leaves_remainder_at_list_head() {
    let mut heap = heap();
    let a = heap.allocate(100).unwrap();
    let asize = adjusted_size(100).unwrap();
    assert_eq!(heap.free_head(), Some(addr(a) + asize));
    heap.check().unwrap();
  }

  #[test]
  fn small_remainder_is_not_split() {
    let mut heap = heap();
    // Region of 2 pages: one block of 2 * PAGE - REGION_OVERHEAD bytes.
    let whole = 2 * PAGE - REGION_OVERHEAD;
    let ptr = heap.allocate(whole - OVERHEAD - ALIGNMENT).unwrap();
    assert_eq!(unsafe { heap.usable_size(ptr) }, whole - OVERHEAD);
    assert_eq!(heap.stats().free_blocks, 0);
    heap.check().unwrap();
  }

  #[test]
  fn coalesce_with_next() {
    let mut heap = heap();
    let a = heap.allocate(64).unwrap();
    let b = heap.allocate(64).unwrap();
    unsafe {
      heap.release(b.as_ptr());
      // b merged into the trailing free block.
      assert_eq!(heap.stats().free_blocks, 1);
      assert_eq!(heap.free_head(), Some(addr(b)));
      heap.release(a.as_ptr());
    }
    assert_eq!(heap.stats().free_blocks, 1);
    assert_eq!(heap.free_head(), Some(addr(a)));
    heap.check().unwrap();
  }

  #[test]
  fn coalesce_with_previous_and_both() {
    let mut heap = heap();
    let a = heap.allocate(64).unwrap();
    let b = heap.allocate(64).unwrap();
    let c = heap.allocate(64).unwrap();
    let _d = heap.allocate(64).unwrap();

    unsafe {
      heap.release(a.as_ptr());
      heap.release(b.as_ptr());
      // Previous only: a absorbs b.
      assert_eq!(heap.stats().free_blocks, 2);
      assert_eq!(heap.free_head(), Some(addr(a)));
      heap.check().unwrap();

      heap.release(c.as_ptr());
      // c sits between the a+b block and d; only the previous side is free.
      assert_eq!(heap.stats().free_blocks, 2);
      assert_eq!(Block::from_payload(a).size(), 3 * adjusted_size(64).unwrap());
    }
    heap.check().unwrap();
  }

  #[test]
  fn coalesce_both_sides() {
    let mut heap = heap();
    let a = heap.allocate(64).unwrap();
    let b = heap.allocate(64).unwrap();
    let c = heap.allocate(64).unwrap();
    let _d = heap.allocate(64).unwrap();

    unsafe {
      heap.release(a.as_ptr());
      heap.release(c.as_ptr());
      assert_eq!(heap.stats().free_blocks, 3);
      heap.release(b.as_ptr());
      assert_eq!(heap.stats().free_blocks, 2);
      assert_eq!(heap.free_head(), Some(addr(a)));
      assert_eq!(Block::from_payload(a).size(), 3 * adjusted_size(64).unwrap());
    }
    heap.check().unwrap();
  }

  #[test]
  fn release_null_is_noop() {
    let mut heap = heap();
    unsafe { heap.release(ptr::null_mut()) };
    assert_eq!(heap.stats(), HeapStats::default());
  }

  #[test]
  #[should_panic(expected = "double release")]
  #[cfg(debug_assertions)]
  fn double_release_trips() {
    let mut heap = heap();
    let a = heap.allocate(64).unwrap();
    let _b = heap.allocate(64).unwrap();
    unsafe {
      heap.release(a.as_ptr());
      heap.release(a.as_ptr());
    }
  }

  #[test]
  fn failed_extension_leaves_heap_untouched() {
    let mut heap = Heap::with_supplier(Hosted::new().with_limit(2 * PAGE));
    let a = heap.allocate(100).unwrap();
    let before = heap.stats();

    assert!(matches!(heap.try_allocate(4 * PAGE), Err(Error::OutOfMemory { .. })));
    assert_eq!(heap.stats(), before);
    heap.check().unwrap();

    // The heap still works afterwards.
    unsafe { heap.release(a.as_ptr()) };
    assert!(heap.allocate(100).is_some());
    heap.check().unwrap();
  }

  #[test]
  fn empty_region_is_returned_unless_last() {
    let config = HeapConfig::new().with_release_empty_regions(true);
    let mut heap = Heap::new(Hosted::new(), config);

    let a = heap.allocate(3 * PAGE).unwrap();
    let b = heap.allocate(3 * PAGE).unwrap();
    assert_eq!(heap.stats().regions, 2);

    unsafe { heap.release(a.as_ptr()) };
    assert_eq!(heap.stats().regions, 1);
    assert_eq!(heap.supplier().mapped(), heap.stats().mapped_bytes);
    heap.check().unwrap();

    unsafe { heap.release(b.as_ptr()) };
    assert_eq!(heap.stats().regions, 1);
    assert_eq!(heap.stats().allocated_blocks, 0);
    heap.check().unwrap();
  }

  #[test]
  fn empty_regions_are_kept_when_disabled() {
    let config = HeapConfig::new().with_release_empty_regions(false);
    let mut heap = Heap::new(Hosted::new(), config);

    let a = heap.allocate(3 * PAGE).unwrap();
    let _b = heap.allocate(3 * PAGE).unwrap();
    unsafe { heap.release(a.as_ptr()) };
    assert_eq!(heap.stats().regions, 2);
    heap.check().unwrap();
  }

  #[test]
  fn init_resets_and_preallocates() {
    let config = HeapConfig::new().with_initial_chunk(10 * PAGE);
    let mut heap = Heap::new(Hosted::new(), config);
    heap.allocate(100).unwrap();

    heap.init().unwrap();
    let stats = heap.stats();
    assert_eq!(stats.regions, 1);
    assert_eq!(stats.allocated_blocks, 0);
    assert_eq!(stats.free_blocks, 1);
    assert!(stats.free_bytes >= 10 * PAGE);
    assert_eq!(heap.supplier().mapped(), stats.mapped_bytes);

    let limited = HeapConfig::new().with_initial_chunk(10 * PAGE);
    let mut heap = Heap::new(Hosted::new().with_limit(PAGE), limited);
    assert!(matches!(heap.init(), Err(Error::OutOfMemory { .. })));
  }

  #[test]
  fn zeroed_allocation_clears_reused_memory() {
    let mut heap = heap();
    let a = heap.allocate(256).unwrap();
    unsafe {
      a.as_ptr().write_bytes(0xFF, 256);
      heap.release(a.as_ptr());
    }
    let z = heap.allocate_zeroed(16, 16).unwrap();
    assert_eq!(z, a);
    let bytes = unsafe { core::slice::from_raw_parts(z.as_ptr(), 256) };
    assert!(bytes.iter().all(|&b| b == 0));

    assert_eq!(heap.allocate_zeroed(usize::MAX, 2), None);
    assert_eq!(heap.allocate_zeroed(0, 8), None);
  }

  #[test]
  fn aligned_allocation() {
    let mut heap = heap();
    assert_eq!(
      heap.allocate_aligned(8, 48),
      Err(Error::InvalidAlignment { align: 48 })
    );

    for align in [32, 64, 256, 4096] {
      let ptr = heap.allocate_aligned(100, align).unwrap().unwrap();
      assert_eq!(addr(ptr) % align, 0);
      unsafe {
        ptr.as_ptr().write_bytes(0xAA, 100);
        assert!(heap.usable_size(ptr) >= 100);
      }
      heap.check().unwrap();
    }

    let small = heap.allocate_aligned(8, 8).unwrap().unwrap();
    assert_eq!(addr(small) % ALIGNMENT, 0);
    heap.check().unwrap();
  }

  #[test]
  fn reallocate_in_place_and_moving() {
    let mut heap = heap();
    unsafe {
      let a = heap.allocate(64).unwrap();
      a.as_ptr().write_bytes(0x11, 64);

      // Next neighbour is the free remainder: grows in place.
      let grown = heap.reallocate(a.as_ptr(), 512).unwrap();
      assert_eq!(grown, a);
      assert!(heap.usable_size(grown) >= 512);
      heap.check().unwrap();

      // Shrinking keeps the address and frees the tail.
      let shrunk = heap.reallocate(grown.as_ptr(), 32).unwrap();
      assert_eq!(shrunk, a);
      assert_eq!(Block::from_payload(shrunk).size(), adjusted_size(32).unwrap());
      heap.check().unwrap();

      // Pin the neighbour so growth has to move.
      let pin = heap.allocate(16).unwrap();
      let moved = heap.reallocate(shrunk.as_ptr(), 1024).unwrap();
      assert_ne!(moved, a);
      let bytes = core::slice::from_raw_parts(moved.as_ptr(), 32);
      assert!(bytes.iter().all(|&b| b == 0x11));
      heap.check().unwrap();

      assert_eq!(heap.reallocate(moved.as_ptr(), 0), None);
      heap.release(pin.as_ptr());
      assert_eq!(heap.stats().allocated_blocks, 0);

      let fresh = heap.reallocate(ptr::null_mut(), 40).unwrap();
      assert_eq!(addr(fresh) % ALIGNMENT, 0);
      heap.check().unwrap();
    }
  }

  #[test]
  fn failed_reallocation_keeps_original() {
    let mut heap = Heap::with_supplier(Hosted::new().with_limit(2 * PAGE));
    unsafe {
      let a = heap.allocate(64).unwrap();
      a.as_ptr().write_bytes(0x22, 64);
      let _pin = heap.allocate(16).unwrap();

      assert_eq!(heap.reallocate(a.as_ptr(), 8 * PAGE), None);
      let bytes = core::slice::from_raw_parts(a.as_ptr(), 64);
      assert!(bytes.iter().all(|&b| b == 0x22));
      assert_eq!(heap.stats().allocated_blocks, 2);
      heap.check().unwrap();
    }
  }

  #[test]
  fn drop_returns_all_regions() {
    let mut heap = heap();
    heap.allocate(10 * PAGE).unwrap();
    heap.allocate(10).unwrap();
    heap.init().unwrap();
    assert_eq!(heap.supplier().mapped(), 0);
  }
}
