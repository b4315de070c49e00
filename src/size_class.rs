//! Size-class index: 64 classes from 16 bytes to 32 KiB.
//!
//! Classes 0..16 step by 16 bytes up to 256. Above that each power-of-two
//! range is split into 8 classes up to 8 KiB, followed by a coarse tail up to
//! [`MAX_SIZE`]. Worst-case internal fragmentation is 12.5% below 8 KiB.

use crate::{BLOCK_SIZE, block::BLOCK_HEADER_SIZE, chunk::CHUNK_HEADER_SIZE};

pub const CLASS_COUNT: usize = 64;
/// Smallest chunk payload.
pub const MIN_SIZE: usize = 16;
/// Largest request served from blocks; anything above goes to a direct mapping.
pub const MAX_SIZE: usize = 32 * 1024;

const LINEAR_LIMIT: usize = 256;
const LINEAR_CLASSES: usize = LINEAR_LIMIT / MIN_SIZE;

const CLASS_SIZES: [u32; CLASS_COUNT] = [
  16, 32, 48, 64, 80, 96, 112, 128, 144, 160, 176, 192, 208, 224, 240, 256, // step 16
  288, 320, 352, 384, 416, 448, 480, 512, // step 32
  576, 640, 704, 768, 832, 896, 960, 1024, // step 64
  1152, 1280, 1408, 1536, 1664, 1792, 1920, 2048, // step 128
  2304, 2560, 2816, 3072, 3328, 3584, 3840, 4096, // step 256
  4608, 5120, 5632, 6144, 6656, 7168, 7680, 8192, // step 512
  9216, 10240, 11264, 12288, 16384, 20480, 24576, 32768,
];

const _: () = assert!(CLASS_SIZES[LINEAR_CLASSES - 1] as usize == LINEAR_LIMIT);
const _: () = assert!(CLASS_SIZES[CLASS_COUNT - 1] as usize == MAX_SIZE);

/// Smallest class whose size is at least `size`, or `None` above [`MAX_SIZE`].
/// A zero-byte request maps to class 0.
#[inline]
pub fn size_to_class(size: usize) -> Option<usize> {
  if size <= LINEAR_LIMIT {
    return Some(size.saturating_sub(1) >> 4);
  }
  if size > MAX_SIZE {
    return None;
  }

  let (mut lo, mut hi) = (LINEAR_CLASSES, CLASS_COUNT - 1);
  while lo < hi {
    let mid = (lo + hi) / 2;
    if (CLASS_SIZES[mid] as usize) < size {
      lo = mid + 1;
    } else {
      hi = mid;
    }
  }
  Some(lo)
}

/// Payload size of `class`, 0 past the table.
#[inline]
pub const fn class_to_size(class: usize) -> usize {
  if class < CLASS_COUNT { CLASS_SIZES[class] as usize } else { 0 }
}

/// Chunks of `class` that fit in one block next to its header.
#[inline]
pub const fn class_to_count(class: usize) -> usize {
  (BLOCK_SIZE - BLOCK_HEADER_SIZE) / (class_to_size(class) + CHUNK_HEADER_SIZE)
}

/// Percentage of the class size wasted when serving `requested` bytes from `class`.
pub fn fragmentation(class: usize, requested: usize) -> u8 {
  if class >= CLASS_COUNT {
    return 0;
  }
  let size = class_to_size(class);
  (size.saturating_sub(requested) * 100 / size) as u8
}
