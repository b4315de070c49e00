use core::{
  cell::UnsafeCell,
  hint,
  sync::atomic::{AtomicBool, Ordering},
};

/// Test-and-test-and-set lock. Critical sections are a handful of pointer
/// writes, so spinning beats parking.
pub(crate) struct SpinLock {
  locked: AtomicBool,
}

impl SpinLock {
  pub(crate) const fn new() -> Self {
    Self {
      locked: AtomicBool::new(false),
    }
  }

  #[inline]
  pub(crate) fn lock(&self) {
    while self
      .locked
      .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      while self.locked.load(Ordering::Relaxed) {
        hint::spin_loop();
      }
    }
  }

  #[inline]
  pub(crate) fn unlock(&self) {
    self.locked.store(false, Ordering::Release);
  }
}

/// A value only reachable while holding its spin lock.
pub(crate) struct Locked<T> {
  lock: SpinLock,
  value: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for Locked<T> {}

impl<T> Locked<T> {
  pub(crate) const fn new(value: T) -> Self {
    Self {
      lock: SpinLock::new(),
      value: UnsafeCell::new(value),
    }
  }

  #[inline]
  pub(crate) fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
    struct Unlock<'a>(&'a SpinLock);
    impl Drop for Unlock<'_> {
      fn drop(&mut self) {
        self.0.unlock();
      }
    }

    self.lock.lock();
    let _unlock = Unlock(&self.lock);
    f(unsafe { &mut *self.value.get() })
  }
}
