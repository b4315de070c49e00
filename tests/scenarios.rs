use std::collections::HashSet;
use std::ptr::null_mut;

use rand::prelude::*;
use strata::{BLOCK_SIZE, free, malloc, malloc_usable_size, size_class};

// Tests in this file run in parallel on one heap: each one sticks to its own
// size classes.

fn block_of(addr: usize) -> usize {
  addr & !(BLOCK_SIZE - 1)
}

#[test]
fn freed_chunks_are_reused_before_new_blocks() {
  unsafe {
    let first: Vec<usize> = (0..10_000).map(|_| malloc(64) as usize).collect();
    assert!(first.iter().all(|&p| p != 0 && p % 16 == 0));
    assert_eq!(first.iter().collect::<HashSet<_>>().len(), first.len());
    let blocks: HashSet<usize> = first.iter().map(|&p| block_of(p)).collect();

    let mut freed = HashSet::new();
    for &p in first.iter().step_by(2) {
      free(p as *mut u8);
      freed.insert(p);
    }

    let second: Vec<usize> = (0..5_000).map(|_| malloc(64) as usize).collect();
    assert!(second.iter().all(|&p| blocks.contains(&block_of(p))));
    let reused = second.iter().filter(|&p| freed.contains(p)).count();
    // Only the unbumped tail of the current block may supply fresh chunks.
    let per_block = size_class::class_to_count(size_class::size_to_class(64).unwrap());
    assert!(reused >= 5_000 - per_block, "only {reused} chunks reused");

    for &p in first.iter().skip(1).step_by(2).chain(&second) {
      free(p as *mut u8);
    }
  }
}

#[test]
fn free_null_is_a_no_op() {
  for _ in 0..3 {
    unsafe { free(null_mut()) };
  }
  assert_eq!(strata::thread_stats().free_count, 0);
  assert_eq!(unsafe { malloc_usable_size(null_mut()) }, 0);
}

#[test]
fn same_size_round_trip_returns_same_address() {
  unsafe {
    for _ in 0..100 {
      let p = malloc(500);
      free(p);
      assert_eq!(malloc(500), p);
      free(p);
    }
  }
}

#[test]
fn random_workload_keeps_contents() {
  let mut rng = StdRng::seed_from_u64(0x5eed);
  let mut live: Vec<(*mut u8, usize, u8)> = Vec::new();

  unsafe {
    for _ in 0..20_000 {
      if live.is_empty() || rng.gen_bool(0.6) {
        // Mix of small classes above 1 KiB and large mappings.
        let size = if rng.gen_ratio(1, 50) {
          rng.gen_range(40_000..200_000)
        } else {
          rng.gen_range(1_100..=1_150)
        };
        let p = malloc(size);
        assert!(!p.is_null());
        assert!(malloc_usable_size(p) >= size);
        let tag = rng.r#gen::<u8>();
        p.write_bytes(tag, size);
        live.push((p, size, tag));
      } else {
        let (p, size, tag) = live.swap_remove(rng.gen_range(0..live.len()));
        assert_eq!(p.read(), tag);
        assert_eq!(p.add(size - 1).read(), tag);
        free(p);
      }
    }
    for (p, _, _) in live {
      free(p);
    }
  }
}

#[test]
fn realloc_preserves_prefix_across_paths() {
  unsafe {
    let mut p = strata::realloc(null_mut(), 10);
    for i in 0..10 {
      p.add(i).write(i as u8);
    }
    // Small to small, small to large, large grows, large back to small.
    for size in [2_000, 50_000, 1 << 21, 12] {
      p = strata::realloc(p, size);
      assert!(!p.is_null());
      assert!((0..10).all(|i| p.add(i).read() == i as u8));
    }
    assert!(strata::realloc(p, 0).is_null());
  }
}

#[test]
fn calloc_and_aligned_variants() {
  unsafe {
    let p = strata::calloc(100, 30);
    assert!((0..3_000).all(|i| p.add(i).read() == 0));
    free(p);

    let q = strata::memalign(4096, 3_000);
    assert_eq!(q as usize % 4096, 0);
    assert!(malloc_usable_size(q) >= 3_000);
    free(q);

    let mut out = null_mut();
    assert_eq!(strata::posix_memalign(&mut out, 64, 3_000), 0);
    assert_eq!(out as usize % 64, 0);
    free(out);
    assert_eq!(strata::posix_memalign(&mut out, 3, 8), libc::EINVAL);
  }
}
