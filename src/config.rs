//! Runtime configuration.
//!
//! Read once, inside the init gate, straight from `getenv` so that parsing never
//! allocates:
//!
//! | Variable                     | Values                | Default |
//! |------------------------------|-----------------------|---------|
//! | `STRATA_HUGE_PAGES`          | `1`/`0` (`on`/`off`)  | auto    |
//! | `STRATA_RETAIN_SUPERBLOCKS`  | count                 | 1       |
//! | `STRATA_ABORT_ON_CORRUPTION` | `1`/`0`               | 0       |
//!
//! Unparseable values are ignored with a warning.

use core::{
  ffi::CStr,
  sync::atomic::{AtomicBool, Ordering},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Config {
  /// `None` follows the kernel's THP setting.
  pub(crate) huge_pages: Option<bool>,
  /// Empty superblocks kept mapped instead of being returned to the OS.
  pub(crate) retain_superblocks: usize,
  pub(crate) abort_on_corruption: bool,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      huge_pages: None,
      retain_superblocks: 1,
      abort_on_corruption: false,
    }
  }
}

impl Config {
  pub(crate) fn from_env() -> Self {
    let mut config = Self::default();
    if let Some(on) = env(c"STRATA_HUGE_PAGES", parse_flag) {
      config.huge_pages = Some(on);
    }
    if let Some(n) = env(c"STRATA_RETAIN_SUPERBLOCKS", parse_count) {
      config.retain_superblocks = n;
    }
    if let Some(on) = env(c"STRATA_ABORT_ON_CORRUPTION", parse_flag) {
      config.abort_on_corruption = on;
    }
    config
  }
}

fn env<T>(name: &CStr, parse: fn(&[u8]) -> Option<T>) -> Option<T> {
  let raw = unsafe { libc::getenv(name.as_ptr()) };
  if raw.is_null() {
    return None;
  }
  let value = unsafe { CStr::from_ptr(raw) }.to_bytes();
  let parsed = parse(value);
  if parsed.is_none() {
    log::warn!("strata: ignoring unparseable {}", name.to_string_lossy());
  }
  parsed
}

pub(crate) fn parse_flag(raw: &[u8]) -> Option<bool> {
  let raw = raw.trim_ascii();
  const ON: [&[u8]; 4] = [b"1", b"true", b"yes", b"on"];
  const OFF: [&[u8]; 4] = [b"0", b"false", b"no", b"off"];
  if ON.iter().any(|v| raw.eq_ignore_ascii_case(v)) {
    Some(true)
  } else if OFF.iter().any(|v| raw.eq_ignore_ascii_case(v)) {
    Some(false)
  } else {
    None
  }
}

pub(crate) fn parse_count(raw: &[u8]) -> Option<usize> {
  let raw = raw.trim_ascii();
  if raw.is_empty() {
    return None;
  }
  raw.iter().try_fold(0usize, |acc, &d| {
    if !d.is_ascii_digit() {
      return None;
    }
    acc.checked_mul(10)?.checked_add((d - b'0') as usize)
  })
}

// =============================================================================
// Corruption Policy
// =============================================================================

static ABORT_ON_CORRUPTION: AtomicBool = AtomicBool::new(false);

/// Whether detected corruption aborts the process instead of refusing the operation.
#[inline]
pub(crate) fn abort_on_corruption() -> bool {
  ABORT_ON_CORRUPTION.load(Ordering::Relaxed)
}

pub(crate) fn set_abort_on_corruption(on: bool) {
  ABORT_ON_CORRUPTION.store(on, Ordering::Relaxed);
}
