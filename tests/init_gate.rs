//! Needs a heap that is not yet initialized: keep this the only test here.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use log::{LevelFilter, Log, Metadata, Record};
use strata::{bootstrap, free, malloc, malloc_usable_size, realloc};

static ARMED: AtomicBool = AtomicBool::new(true);
static INNER: AtomicUsize = AtomicUsize::new(0);

/// Allocates once, from inside the first record it receives.
struct AllocatingLogger;

impl Log for AllocatingLogger {
  fn enabled(&self, _: &Metadata) -> bool {
    true
  }

  fn log(&self, _: &Record) {
    if ARMED.swap(false, Ordering::SeqCst) {
      let p = unsafe { malloc(40) };
      if !p.is_null() {
        unsafe { p.write_bytes(0x5a, 40) };
      }
      INNER.store(p as usize, Ordering::SeqCst);
    }
  }

  fn flush(&self) {}
}

static LOGGER: AllocatingLogger = AllocatingLogger;

#[test]
fn requests_made_during_initialization_use_the_bootstrap_heap() {
  log::set_logger(&LOGGER).unwrap();
  log::set_max_level(LevelFilter::Trace);

  // The first request runs initialization, which logs.
  let outer = unsafe { malloc(64) };
  assert!(!outer.is_null());
  assert!(!bootstrap::is_bootstrap_pointer(outer));
  assert!(!ARMED.load(Ordering::SeqCst));

  let inner = INNER.load(Ordering::SeqCst) as *mut u8;
  assert!(!inner.is_null());
  assert!(bootstrap::is_bootstrap_pointer(inner));
  assert_eq!(unsafe { malloc_usable_size(inner) }, 40);

  unsafe {
    let moved = realloc(inner, 4_000);
    assert!(!moved.is_null());
    assert!(!bootstrap::is_bootstrap_pointer(moved));
    assert!(malloc_usable_size(moved) >= 4_000);
    assert!((0..40).all(|i| moved.add(i).read() == 0x5a));
    free(moved);
    free(outer);
  }
}
