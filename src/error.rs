use thiserror::Error;

/// Failures surfaced by the fallible [`crate::Heap`] operations.
///
/// No variant owns heap memory: the heap may itself be the global allocator,
/// so building an error must never allocate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum Error {
  /// The region supplier could not provide enough pages, or the request size
  /// overflowed once metadata was added.
  #[error("out of memory: could not satisfy a request of {requested} bytes")]
  OutOfMemory { requested: usize },

  #[error("alignment {align} is not a power of two")]
  InvalidAlignment { align: usize },

  /// Reported by [`crate::Heap::check`] when a heap invariant does not hold.
  #[error("heap inconsistent at {address:#x}: {reason}")]
  Inconsistent { reason: &'static str, address: usize },
}

pub type Result<T> = core::result::Result<T, Error>;
