//! Layout of a mapped region.
//!
//! ```text
//!   base                                                           base + len
//!   ┌───────────────┬─────┬──────────────┬──────────────────────┬──────────┐
//!   │ RegionHeader  │ pad │   prologue   │  blocks ...          │ epilogue │
//!   │ next,prev,len │     │ hdr  │ ftr   │                      │ 0 | a    │
//!   └───────────────┴─────┴──────────────┴──────────────────────┴──────────┘
//!                                        ▲
//!                                        └── first block header
//! ```
//!
//! The prologue is an allocated block of [`ALIGNMENT`] bytes, smaller than any
//! real block, so the first block's previous neighbour always reads as
//! allocated. The epilogue is a zero-size allocated header that stops forward
//! walks at the end of the region.

use core::{mem::size_of, ptr::NonNull};

use crate::tag::{ALIGNMENT, Block, MIN_BLOCK_SIZE, Tag, WORD};

/// Bookkeeping at the base of every region; regions form a doubly-linked list
/// owned by the heap.
#[repr(C, align(16))]
pub(crate) struct RegionHeader {
  pub next: Option<NonNull<RegionHeader>>,
  pub prev: Option<NonNull<RegionHeader>>,
  /// Length of the whole region, header and sentinels included.
  pub len: usize,
}

pub(crate) const REGION_HEADER_SIZE: usize = size_of::<RegionHeader>();

/// Offset of the first real block's payload from the region base.
const FIRST_PAYLOAD_OFFSET: usize = REGION_HEADER_SIZE + 2 * ALIGNMENT;

/// Bytes of every region not available to blocks.
pub(crate) const REGION_OVERHEAD: usize = FIRST_PAYLOAD_OFFSET;

const _: () = assert!(REGION_HEADER_SIZE % ALIGNMENT == 0);
const _: () = assert!(FIRST_PAYLOAD_OFFSET % ALIGNMENT == 0);

impl RegionHeader {
  #[inline]
  pub fn base(region: NonNull<Self>) -> NonNull<u8> {
    region.cast()
  }

  /// One past the last byte of the region.
  #[inline]
  pub unsafe fn end(region: NonNull<Self>) -> usize {
    region.as_ptr() as usize + unsafe { (*region.as_ptr()).len }
  }

  /// First block of the region.
  #[inline]
  pub unsafe fn first_block(region: NonNull<Self>) -> Block {
    unsafe { Block::from_payload(region.cast::<u8>().add(FIRST_PAYLOAD_OFFSET)) }
  }

  /// Region whose first block is `block`.
  #[inline]
  pub unsafe fn of_first_block(block: Block) -> NonNull<Self> {
    unsafe { block.payload().sub(FIRST_PAYLOAD_OFFSET).cast() }
  }

  /// Whether `block` covers every byte of its region between the sentinels.
  #[inline]
  pub unsafe fn is_spanned_by(block: Block) -> bool {
    unsafe { block.prev_tag() == Tag::PROLOGUE && block.next().tag() == Tag::EPILOGUE }
  }

  /// Address of the epilogue header.
  #[inline]
  pub unsafe fn epilogue(region: NonNull<Self>) -> *mut Tag {
    unsafe { (Self::end(region) - WORD) as *mut Tag }
  }
}

/// Lays out a freshly mapped range as a region holding one free block and
/// returns the header and that block. Neither is linked anywhere yet.
///
/// # Safety
///
/// `base..base + len` must be writable, [`ALIGNMENT`]-aligned, with `len` a
/// multiple of [`ALIGNMENT`] and at least [`REGION_OVERHEAD`] +
/// [`MIN_BLOCK_SIZE`].
pub(crate) unsafe fn format(base: NonNull<u8>, len: usize) -> (NonNull<RegionHeader>, Block) {
  debug_assert!(base.as_ptr() as usize % ALIGNMENT == 0);
  debug_assert!(len % ALIGNMENT == 0 && len >= REGION_OVERHEAD + MIN_BLOCK_SIZE);

  let region = base.cast::<RegionHeader>();
  unsafe {
    region.write(RegionHeader {
      next: None,
      prev: None,
      len,
    });

    let block = RegionHeader::first_block(region);
    Tag::PROLOGUE.write(block.prev_footer());
    Tag::PROLOGUE.write(block.prev_footer().sub(1));
    block.set(len - REGION_OVERHEAD, false);
    Tag::EPILOGUE.write(RegionHeader::epilogue(region));

    (region, block)
  }
}

/// Grows `region` over a range mapped right after it. The old epilogue becomes
/// the header of a new free block covering the added range; the returned block
/// still needs coalescing with whatever precedes it.
///
/// # Safety
///
/// `region` must be a live region and `base..base + len` writable memory
/// starting exactly at its end, `len` a multiple of [`ALIGNMENT`] no smaller
/// than [`MIN_BLOCK_SIZE`].
pub(crate) unsafe fn absorb(region: NonNull<RegionHeader>, base: NonNull<u8>, len: usize) -> Block {
  unsafe {
    debug_assert_eq!(RegionHeader::end(region), base.as_ptr() as usize);
    debug_assert!(len % ALIGNMENT == 0 && len >= MIN_BLOCK_SIZE);

    let block = Block::from_payload(base);
    debug_assert_eq!(block.tag(), Tag::EPILOGUE);

    (*region.as_ptr()).len += len;
    block.set(len, false);
    Tag::EPILOGUE.write(RegionHeader::epilogue(region));
    block
  }
}
