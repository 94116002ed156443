//! Boundary tags and block addressing.
//!
//! Every block is framed by two one-word tags holding its size with the
//! allocated flag packed into the low bit. The payload handed to callers starts
//! right after the header, and the footer is the last word of the block:
//!
//! ```text
//!   block start                                              block end
//!   ┌────────┬───────────────────────────────────────────┬────────┐
//!   │ header │ payload (free: prev link, next link, ...)  │ footer │
//!   └────────┴───────────────────────────────────────────┴────────┘
//!            ▲
//!            └── Block handle / pointer returned to the caller
//! ```
//!
//! Sizes are multiples of [`ALIGNMENT`], so the low four bits of a tag are
//! always free for flags. This module is the only place that turns a payload
//! address into header, footer or neighbour addresses.

use core::{
  mem::size_of,
  ptr::{self, NonNull},
};

/// Tag width in bytes.
pub(crate) const WORD: usize = size_of::<usize>();

/// Every payload address and every block size is a multiple of this.
pub const ALIGNMENT: usize = 16;

/// Header plus footer.
pub(crate) const OVERHEAD: usize = 2 * WORD;

/// Large enough for both tags and the two free-list links of a free block.
pub const MIN_BLOCK_SIZE: usize = {
  let needed = align_up(OVERHEAD + size_of::<Links>(), ALIGNMENT);
  if needed < 2 * ALIGNMENT { 2 * ALIGNMENT } else { needed }
};

const ALLOCATED: usize = 0x1;
const FLAG_MASK: usize = ALIGNMENT - 1;

const _: () = assert!(ALIGNMENT.is_power_of_two());
const _: () = assert!(ALIGNMENT >= 2 * WORD);
const _: () = assert!(MIN_BLOCK_SIZE % ALIGNMENT == 0);
const _: () = assert!(MIN_BLOCK_SIZE >= OVERHEAD + size_of::<Links>());

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
pub(crate) const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

/// Overflow-checked [`align_up`].
#[inline(always)]
pub(crate) const fn checked_align_up(x: usize, align: usize) -> Option<usize> {
  match x.checked_add(align - 1) {
    Some(v) => Some(v & !(align - 1)),
    None => None,
  }
}

/// Block size needed to hand out `size` payload bytes, or `None` on overflow.
#[inline]
pub(crate) const fn adjusted_size(size: usize) -> Option<usize> {
  let Some(with_tags) = size.checked_add(OVERHEAD) else {
    return None;
  };
  match checked_align_up(with_tags, ALIGNMENT) {
    Some(asize) if asize < MIN_BLOCK_SIZE => Some(MIN_BLOCK_SIZE),
    other => other,
  }
}

// =============================================================================
// Tag
// =============================================================================

/// One boundary tag word.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct Tag(usize);

impl Tag {
  /// Zero-size allocated tag closing every region.
  pub const EPILOGUE: Tag = Tag::pack(0, true);

  /// Both tags of the allocated sentinel block opening every region. No real
  /// block is this small, which makes the prologue recognizable.
  pub const PROLOGUE: Tag = Tag::pack(ALIGNMENT, true);

  #[inline(always)]
  pub const fn pack(size: usize, allocated: bool) -> Self {
    debug_assert!(size & FLAG_MASK == 0);
    Tag(size | allocated as usize)
  }

  #[inline(always)]
  pub const fn size(self) -> usize {
    self.0 & !FLAG_MASK
  }

  #[inline(always)]
  pub const fn is_allocated(self) -> bool {
    self.0 & ALLOCATED != 0
  }

  #[inline(always)]
  pub unsafe fn read(at: *const Tag) -> Tag {
    unsafe { ptr::read(at) }
  }

  #[inline(always)]
  pub unsafe fn write(self, at: *mut Tag) {
    unsafe { ptr::write(at, self) }
  }
}

impl core::fmt::Debug for Tag {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    write!(f, "Tag({}, {})", self.size(), if self.is_allocated() { "a" } else { "f" })
  }
}

// =============================================================================
// Block
// =============================================================================

/// Free-list links living in the first two words of a free payload.
#[repr(C)]
pub(crate) struct Links {
  pub prev: Option<Block>,
  pub next: Option<Block>,
}

/// Handle to a block, represented by its payload address.
///
/// All accessors are `unsafe`: the handle must point at the payload of a block
/// whose header (and, where read, footer) were written by this crate.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct Block(NonNull<u8>);

impl Block {
  /// Block whose payload starts at `payload`.
  #[inline(always)]
  pub unsafe fn from_payload(payload: NonNull<u8>) -> Self {
    Block(payload)
  }

  #[inline(always)]
  pub fn payload(self) -> NonNull<u8> {
    self.0
  }

  #[inline(always)]
  pub fn addr(self) -> usize {
    self.0.as_ptr() as usize
  }

  #[inline(always)]
  pub fn header(self) -> *mut Tag {
    self.0.as_ptr().wrapping_sub(WORD).cast()
  }

  #[inline(always)]
  pub unsafe fn tag(self) -> Tag {
    unsafe { Tag::read(self.header()) }
  }

  #[inline(always)]
  pub unsafe fn size(self) -> usize {
    unsafe { self.tag().size() }
  }

  #[inline(always)]
  pub unsafe fn is_allocated(self) -> bool {
    unsafe { self.tag().is_allocated() }
  }

  /// Footer address, derived from the size currently in the header.
  #[inline(always)]
  pub unsafe fn footer(self) -> *mut Tag {
    unsafe { self.0.as_ptr().add(self.size()).sub(OVERHEAD).cast() }
  }

  /// Writes matching header and footer.
  #[inline(always)]
  pub unsafe fn set(self, size: usize, allocated: bool) {
    let tag = Tag::pack(size, allocated);
    unsafe {
      tag.write(self.header());
      tag.write(self.footer());
    }
  }

  /// Physically next block. For the last block of a region this is the
  /// epilogue, whose tag reads as zero-size allocated.
  #[inline(always)]
  pub unsafe fn next(self) -> Block {
    unsafe { Block(self.0.add(self.size())) }
  }

  /// Slot of the physically previous block's footer.
  #[inline(always)]
  pub fn prev_footer(self) -> *mut Tag {
    self.header().wrapping_sub(1)
  }

  /// Footer of the physically previous block.
  #[inline(always)]
  pub unsafe fn prev_tag(self) -> Tag {
    unsafe { Tag::read(self.prev_footer()) }
  }

  /// Physically previous block. Only meaningful when [`Self::prev_tag`] is a
  /// real block, never the prologue.
  #[inline(always)]
  pub unsafe fn prev(self) -> Block {
    unsafe { Block(self.0.sub(self.prev_tag().size())) }
  }

  /// Block starting `offset` bytes into this one.
  #[inline(always)]
  pub unsafe fn offset(self, offset: usize) -> Block {
    unsafe { Block(self.0.add(offset)) }
  }

  /// Bytes the caller may use.
  #[inline(always)]
  pub unsafe fn usable(self) -> usize {
    unsafe { self.size() - OVERHEAD }
  }

  #[inline(always)]
  pub unsafe fn links(self) -> *mut Links {
    debug_assert!(unsafe { !self.is_allocated() }, "links of allocated block {:p}", self.0);
    self.0.as_ptr().cast()
  }
}
