use crate::tag::{Block, Links};

/// Intrusive LIFO list of free blocks, threaded through their payloads.
///
/// The list never owns memory: [`FreeList::insert`] writes the links into the
/// block itself, so a block must be marked free (tags written) before it is
/// inserted and must be removed before its payload is handed out.
pub(crate) struct FreeList {
  head: Option<Block>,
  len: usize,
}

impl FreeList {
  pub const fn new() -> Self {
    Self { head: None, len: 0 }
  }

  #[inline]
  pub fn len(&self) -> usize {
    self.len
  }

  #[cfg(test)]
  pub fn head(&self) -> Option<Block> {
    self.head
  }

  /// Pushes `block` at the front.
  pub unsafe fn insert(&mut self, block: Block) {
    unsafe {
      let links = block.links();
      (*links).prev = None;
      (*links).next = self.head;
      if let Some(head) = self.head {
        (*head.links()).prev = Some(block);
      }
    }
    self.head = Some(block);
    self.len += 1;
  }

  /// Unlinks `block`, which must currently be in this list.
  pub unsafe fn remove(&mut self, block: Block) {
    debug_assert!(self.len > 0, "remove from empty free list");
    unsafe {
      let Links { prev, next } = block.links().read();
      match prev {
        Some(prev) => (*prev.links()).next = next,
        None => {
          debug_assert_eq!(self.head, Some(block));
          self.head = next;
        }
      }
      if let Some(next) = next {
        (*next.links()).prev = prev;
      }
    }
    self.len -= 1;
  }

  /// First block, from the head, of at least `min_size` bytes.
  pub unsafe fn find_fit(&self, min_size: usize) -> Option<Block> {
    unsafe { self.iter().find(|block| block.size() >= min_size) }
  }

  /// Walks the list from the head. The list must not be mutated while the
  /// iterator is alive.
  pub unsafe fn iter(&self) -> Iter {
    Iter { cursor: self.head }
  }
}

pub(crate) struct Iter {
  cursor: Option<Block>,
}

impl Iterator for Iter {
  type Item = Block;

  fn next(&mut self) -> Option<Block> {
    let block = self.cursor?;
    self.cursor = unsafe { (*block.links()).next };
    Some(block)
  }
}
