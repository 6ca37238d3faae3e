//! Spin lock implementations

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam::utils::Backoff;

/// Sleep used once the back-off has saturated
const SATURATED_SLEEP: Duration = Duration::from_micros(10);

/// Drives one waiting step: pause/yield while the back-off has budget,
/// sleep afterwards.
#[inline]
fn wait_step(backoff: &Backoff) {
    if backoff.is_completed() {
        thread::sleep(SATURATED_SLEEP);
    } else {
        backoff.snooze();
    }
}

// =============================================================================
// SpinLock
// =============================================================================

/// Exclusive spin lock protecting a value
pub struct SpinLock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is serialized by `locked`.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    #[inline]
    fn try_acquire(&self) -> bool {
        !self.locked.load(Ordering::Relaxed)
            && self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
    }

    /// Acquire the lock, waiting as long as necessary
    pub fn lock(&self) -> SpinGuard<'_, T> {
        let backoff = Backoff::new();
        while !self.try_acquire() {
            wait_step(&backoff);
        }
        SpinGuard { lock: self }
    }

    /// Single acquisition attempt
    pub fn try_lock(&self) -> Option<SpinGuard<'_, T>> {
        if self.try_acquire() {
            Some(SpinGuard { lock: self })
        } else {
            None
        }
    }

    /// Acquire the lock, giving up after `tries` failed attempts
    pub fn try_lock_for(&self, tries: usize) -> Option<SpinGuard<'_, T>> {
        let backoff = Backoff::new();
        for _ in 0..tries {
            if self.try_acquire() {
                return Some(SpinGuard { lock: self });
            }
            wait_step(&backoff);
        }
        None
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> std::fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpinLock")
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

/// Guard releasing a [`SpinLock`] on drop
pub struct SpinGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves exclusive ownership of the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves exclusive ownership of the lock.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

// =============================================================================
// SpinRwLock
// =============================================================================

const WRITER: u32 = 1 << 31;
const READER_MASK: u32 = WRITER - 1;

/// Reader/writer spin lock
///
/// Writers announce themselves through `queued_writers`; new readers stand
/// back while a writer is queued so a steady read load cannot starve
/// writers.
pub struct SpinRwLock<T> {
    state: AtomicU32,
    queued_writers: AtomicU32,
    data: UnsafeCell<T>,
}

// SAFETY: shared access is handed out only to readers, exclusive access only
// to a single writer, both tracked by `state`.
unsafe impl<T: Send> Send for SpinRwLock<T> {}
unsafe impl<T: Send + Sync> Sync for SpinRwLock<T> {}

impl<T> SpinRwLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            state: AtomicU32::new(0),
            queued_writers: AtomicU32::new(0),
            data: UnsafeCell::new(value),
        }
    }

    #[inline]
    fn try_acquire_read(&self) -> bool {
        if self.queued_writers.load(Ordering::Relaxed) > 0 {
            return false;
        }
        let state = self.state.load(Ordering::Relaxed);
        if state & WRITER != 0 || state & READER_MASK == READER_MASK {
            return false;
        }
        self.state
            .compare_exchange_weak(state, state + 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    fn try_acquire_write(&self) -> bool {
        self.state.load(Ordering::Relaxed) == 0
            && self
                .state
                .compare_exchange_weak(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
    }

    pub fn read(&self) -> SpinReadGuard<'_, T> {
        let backoff = Backoff::new();
        while !self.try_acquire_read() {
            wait_step(&backoff);
        }
        SpinReadGuard { lock: self }
    }

    pub fn try_read_for(&self, tries: usize) -> Option<SpinReadGuard<'_, T>> {
        let backoff = Backoff::new();
        for _ in 0..tries {
            if self.try_acquire_read() {
                return Some(SpinReadGuard { lock: self });
            }
            wait_step(&backoff);
        }
        None
    }

    pub fn write(&self) -> SpinWriteGuard<'_, T> {
        self.queued_writers.fetch_add(1, Ordering::Relaxed);
        let backoff = Backoff::new();
        while !self.try_acquire_write() {
            wait_step(&backoff);
        }
        self.queued_writers.fetch_sub(1, Ordering::Relaxed);
        SpinWriteGuard { lock: self }
    }

    /// Acquire for writing, giving up after `tries` failed attempts
    pub fn try_write_for(&self, tries: usize) -> Option<SpinWriteGuard<'_, T>> {
        self.queued_writers.fetch_add(1, Ordering::Relaxed);
        let backoff = Backoff::new();
        let mut acquired = false;
        for _ in 0..tries {
            if self.try_acquire_write() {
                acquired = true;
                break;
            }
            wait_step(&backoff);
        }
        self.queued_writers.fetch_sub(1, Ordering::Relaxed);
        acquired.then_some(SpinWriteGuard { lock: self })
    }

    pub fn is_write_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) & WRITER != 0
    }
}

impl<T: Default> Default for SpinRwLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> std::fmt::Debug for SpinRwLock<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpinRwLock")
            .field("state", &self.state.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Shared guard for [`SpinRwLock`]
pub struct SpinReadGuard<'a, T> {
    lock: &'a SpinRwLock<T>,
}

impl<T> Deref for SpinReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: readers exclude writers.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for SpinReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.fetch_sub(1, Ordering::Release);
    }
}

/// Exclusive guard for [`SpinRwLock`]
pub struct SpinWriteGuard<'a, T> {
    lock: &'a SpinRwLock<T>,
}

impl<'a, T> SpinWriteGuard<'a, T> {
    /// Release the lock, run `f`, then reacquire it
    ///
    /// Used where a callee must not run under the lock (it may need the
    /// lock itself).
    pub fn unlocked<R>(self, f: impl FnOnce() -> R) -> (Self, R) {
        let lock = self.lock;
        drop(self);
        let result = f();
        (lock.write(), result)
    }
}

impl<T> Deref for SpinWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the writer bit grants exclusive access.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the writer bit grants exclusive access.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.fetch_and(!WRITER, Ordering::Release);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_spin_lock_exclusive() {
        let lock = SpinLock::new(0u64);
        {
            let mut guard = lock.lock();
            *guard += 1;
            assert!(lock.try_lock().is_none());
            assert!(lock.try_lock_for(5).is_none());
        }
        assert_eq!(*lock.lock(), 1);
    }

    #[test]
    fn test_spin_lock_concurrent_increments() {
        let lock = Arc::new(SpinLock::new(0u64));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        *lock.lock() += 1;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*lock.lock(), 40_000);
    }

    #[test]
    fn test_rw_lock_readers_share() {
        let lock = SpinRwLock::new(7u32);
        let a = lock.read();
        let b = lock.read();
        assert_eq!(*a + *b, 14);
        assert!(lock.try_write_for(3).is_none());
        drop(a);
        drop(b);
        let mut w = lock.try_write_for(3).unwrap();
        *w = 9;
        assert!(lock.try_read_for(3).is_none());
        drop(w);
        assert_eq!(*lock.read(), 9);
    }

    #[test]
    fn test_write_guard_unlocked_reacquires() {
        let lock = SpinRwLock::new(1u32);
        let guard = lock.write();
        let (mut guard, seen) = guard.unlocked(|| *lock.read());
        assert_eq!(seen, 1);
        *guard = 2;
        drop(guard);
        assert_eq!(*lock.read(), 2);
    }

    #[test]
    fn test_rw_lock_concurrent_writers() {
        let lock = Arc::new(SpinRwLock::new(0u64));
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    for _ in 0..5_000 {
                        if i % 2 == 0 {
                            *lock.write() += 1;
                        } else {
                            let _ = *lock.read();
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*lock.read(), 10_000);
    }
}
