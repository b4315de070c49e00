use strata::{CtlError, ctl, free, malloc};

fn read(op: &str) -> u64 {
  let mut buf = [0u8; 8];
  assert_eq!(ctl(op, Some(&mut buf), None), Ok(8));
  u64::from_ne_bytes(buf)
}

#[test]
fn statistics_follow_allocations() {
  let p = unsafe { malloc(10_000) };
  assert!(read("stats.peak") >= 10_000);
  assert!(read("stats.active") >= 1);
  assert!(read("stats.resident") >= strata::BLOCK_SIZE as u64);
  assert!(read("stats.fragmentation") <= 100);
  assert_eq!(read("opt.block_size"), strata::BLOCK_SIZE as u64);
  unsafe { free(p) };

  let global = strata::global_stats();
  assert!(global.superblocks_active >= 1);
  assert!(global.peak_allocated_bytes >= 10_000);
  assert!(global.total_freed_bytes >= 10_000);
}

#[test]
fn errors() {
  let mut buf = [0u8; 8];
  assert_eq!(ctl("stats.nothing", Some(&mut buf), None), Err(CtlError::UnknownOperation));
  assert_eq!(ctl("stats.peak", Some(&mut buf), Some(&[1])), Err(CtlError::ReadOnly));
  assert_eq!(ctl("stats.peak", Some(&mut buf[..4]), None), Err(CtlError::BufferTooSmall { needed: 8 }));
  assert_eq!(ctl("stats.peak", None, None), Ok(8));
  assert_eq!(CtlError::UnknownOperation.errno(), libc::ENOENT);
  assert_eq!(CtlError::ReadOnly.errno(), libc::EPERM);
}

#[test]
fn corruption_policy_round_trips() {
  let old = read("opt.abort_on_corruption");
  let mut prev = [0u8; 8];
  assert_eq!(ctl("opt.abort_on_corruption", Some(&mut prev), Some(&[1])), Ok(8));
  assert_eq!(u64::from_ne_bytes(prev), old);
  assert_eq!(read("opt.abort_on_corruption"), 1);
  assert_eq!(ctl("opt.abort_on_corruption", None, Some(&[2])), Err(CtlError::InvalidInput));
  ctl("opt.abort_on_corruption", None, Some(&old.to_ne_bytes())).unwrap();
  assert_eq!(read("opt.abort_on_corruption"), old);
}

#[test]
fn thread_reset_detaches_cached_blocks() {
  std::thread::spawn(|| unsafe {
    let p = malloc(20_000);
    free(p);
    assert_eq!(strata::thread_stats().malloc_count, 1);
    assert_eq!(ctl("thread.reset", None, None), Ok(0));
    assert_eq!(strata::thread_stats(), strata::ThreadStats::default());

    // The cache was emptied: the next request is a miss.
    let q = malloc(20_000);
    assert_eq!(strata::thread_stats().cache_misses, 1);
    free(q);
  })
  .join()
  .unwrap();
}

#[test]
fn purge_keeps_live_data() {
  unsafe {
    let p = malloc(9_000);
    p.write_bytes(0x5a, 9_000);
    assert_eq!(ctl("arena.purge", None, None), Ok(0));
    assert!((0..9_000).all(|i| p.add(i).read() == 0x5a));
    free(p);
    assert!(read("bootstrap.used") <= strata::bootstrap::BOOTSTRAP_HEAP_SIZE as u64);
  }
}

#[test]
fn access_pattern_hints() {
  unsafe {
    let p = malloc(7_500);
    for op in ["arena.prefetch", "arena.sequential", "arena.random"] {
      let mut accepted = [0u8; 8];
      assert_eq!(ctl(op, Some(&mut accepted), None), Ok(8));
      assert!(u64::from_ne_bytes(accepted) >= 1, "{op}");
    }
    assert_eq!(ctl("arena.random", None, None), Ok(0));
    free(p);
  }
}
