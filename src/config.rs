use crate::tag::align_up;

/// Smallest number of bytes requested from the supplier in one go.
pub const CHUNK_MINIMUM: usize = 1 << 12; // 4KB

/// Runtime knobs of a [`crate::Heap`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeapConfig {
  /// Lower bound for each extension request, region overhead included, before
  /// page rounding.
  pub chunk_size: usize,
  /// Bytes mapped eagerly by [`crate::Heap::init`]. 0 maps nothing until the
  /// first allocation.
  pub initial_chunk: usize,
  /// Return a region to the supplier once all of its blocks are free. The last
  /// remaining region is always kept.
  pub release_empty_regions: bool,
}

impl HeapConfig {
  pub const DEFAULT: Self = Self {
    chunk_size: CHUNK_MINIMUM,
    initial_chunk: 0,
    release_empty_regions: cfg!(feature = "release-mem"),
  };

  pub const fn new() -> Self {
    Self::DEFAULT
  }

  /// Values below [`CHUNK_MINIMUM`] are raised to it; others are rounded up to
  /// the block alignment.
  pub const fn with_chunk_size(mut self, chunk_size: usize) -> Self {
    self.chunk_size = if chunk_size < CHUNK_MINIMUM {
      CHUNK_MINIMUM
    } else {
      align_up(chunk_size, crate::tag::ALIGNMENT)
    };
    self
  }

  pub const fn with_initial_chunk(mut self, initial_chunk: usize) -> Self {
    self.initial_chunk = initial_chunk;
    self
  }

  pub const fn with_release_empty_regions(mut self, release: bool) -> Self {
    self.release_empty_regions = release;
    self
  }
}

impl Default for HeapConfig {
  fn default() -> Self {
    Self::DEFAULT
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn chunk_size_is_clamped_and_aligned() {
    assert_eq!(HeapConfig::new().with_chunk_size(10).chunk_size, CHUNK_MINIMUM);
    assert_eq!(HeapConfig::new().with_chunk_size(5000).chunk_size, 5008);
    assert_eq!(HeapConfig::new().with_chunk_size(1 << 20).chunk_size, 1 << 20);
  }

  #[test]
  fn default_follows_release_mem_feature() {
    assert_eq!(
      HeapConfig::default().release_empty_regions,
      cfg!(feature = "release-mem")
    );
  }
}
