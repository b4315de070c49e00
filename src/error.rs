//! Heap errors and their reporting.

use crate::config;

/// Failures inside the heap.
///
/// The C-facing entry points never return these. They map them to a null
/// pointer or an errno and hand them to [`report`] for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HeapError {
  #[error("out of memory: the OS refused a {0}-byte mapping")]
  OutOfMemory(usize),
  #[error("allocation size overflows the address space")]
  SizeOverflow,
  #[error("alignment {0} is not a power of two multiple of the pointer size")]
  InvalidAlignment(usize),
  #[error("bootstrap heap exhausted: {requested} bytes requested with {used} of {capacity} used")]
  BootstrapExhausted {
    requested: usize,
    used: usize,
    capacity: usize,
  },
  #[error("superblock {addr:#x} has bad magic {found:#010x}")]
  BadSuperblockMagic { addr: usize, found: u32 },
  #[error("block {0:#x} has a bad magic value")]
  BadBlockMagic(usize),
  #[error("chunk {0:#x} failed its header checksum")]
  ChecksumMismatch(usize),
  #[error("chunk {ptr:#x} claims class {header} inside a block of class {block}")]
  ClassMismatch {
    ptr: usize,
    header: usize,
    block: usize,
  },
  #[error("free list of block {0:#x} holds a link outside the block")]
  CorruptFreeList(usize),
  #[error("double free of {0:#x}")]
  DoubleFree(usize),
  #[error("{0:#x} is not a live allocation of this heap")]
  ForeignPointer(usize),
}

impl HeapError {
  /// True for errors that mean heap metadata can no longer be trusted.
  pub const fn is_corruption(&self) -> bool {
    matches!(
      self,
      Self::BadSuperblockMagic { .. }
        | Self::BadBlockMagic(_)
        | Self::ChecksumMismatch(_)
        | Self::ClassMismatch { .. }
        | Self::CorruptFreeList(_)
        | Self::DoubleFree(_)
    )
  }

  pub const fn errno(&self) -> i32 {
    match self {
      Self::OutOfMemory(_) | Self::SizeOverflow | Self::BootstrapExhausted { .. } => libc::ENOMEM,
      _ => libc::EINVAL,
    }
  }
}

/// Logs `err` at a level matching its severity. Corruption aborts the process
/// when `opt.abort_on_corruption` is set.
#[cold]
pub(crate) fn report(err: HeapError) {
  if err.is_corruption() {
    log::error!("strata: heap corruption: {err}");
    if config::abort_on_corruption() {
      unsafe { libc::abort() };
    }
    return;
  }
  match err {
    HeapError::BootstrapExhausted { .. } => log::error!("strata: fatal: {err}"),
    HeapError::ForeignPointer(_) => log::error!("strata: refusing free: {err}"),
    _ => log::debug!("strata: {err}"),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn classifies_corruption() {
    assert!(HeapError::DoubleFree(0x10).is_corruption());
    assert!(HeapError::CorruptFreeList(0x10).is_corruption());
    assert!(!HeapError::ForeignPointer(0x10).is_corruption());
    assert!(!HeapError::OutOfMemory(4096).is_corruption());
  }

  #[test]
  fn maps_errno() {
    assert_eq!(HeapError::SizeOverflow.errno(), libc::ENOMEM);
    assert_eq!(HeapError::InvalidAlignment(3).errno(), libc::EINVAL);
  }

  #[test]
  fn messages() {
    assert_eq!(HeapError::DoubleFree(0x1000).to_string(), "double free of 0x1000");
    let err = HeapError::BadSuperblockMagic {
      addr: 0x20_0000,
      found: 0xdead_beef,
    };
    assert_eq!(err.to_string(), "superblock 0x200000 has bad magic 0xdeadbeef");
  }
}
