use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

// A lock word living in shared memory. The holder stamps the word with its
// owner id so the monitor can recover a lock held by a dead process. The
// waiting side spins a bounded number of times, then sleeps in short slices
// until the caller's deadline.

const UNLOCKED: u64 = 0;

// Non-blocking attempts before the waiter starts sleeping.
const LOCK_SPIN_COUNT: u32 = 1000;

const LOCK_SLEEP: Duration = Duration::from_micros(100);

pub struct SpinLock<'a> {
    word: *const AtomicU64,
    _segment: PhantomData<&'a ()>,
}

unsafe impl<'a> Send for SpinLock<'a> {}

impl<'a> SpinLock<'a> {
    pub fn size_in_bytes() -> usize {
        return 8;
    }

    /// Safety: `base` must point at 8 aligned bytes of shared mapping,
    /// zeroed at segment creation.
    pub unsafe fn at(base: *mut u8) -> SpinLock<'a> {
        return SpinLock {
            word: base as *const AtomicU64,
            _segment: PhantomData,
        };
    }

    fn word(&self) -> &AtomicU64 {
        return unsafe { &*self.word };
    }

    /// Single attempt. `id` must be a non-zero owner id value.
    pub fn try_lock(&self, id: u64) -> bool {
        debug_assert!(id != UNLOCKED);
        return self
            .word()
            .compare_exchange(UNLOCKED, id, Ordering::Acquire, Ordering::Relaxed)
            .is_ok();
    }

    /// Spin then sleep until `deadline`; false if the deadline passed first.
    pub fn lock(&self, id: u64, deadline: Instant) -> bool {
        for _ in 0..LOCK_SPIN_COUNT {
            if self.try_lock(id) {
                return true;
            }
            std::hint::spin_loop();
        }
        loop {
            if self.try_lock(id) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(LOCK_SLEEP);
        }
    }

    pub fn unlock(&self) {
        self.word().store(UNLOCKED, Ordering::Release);
    }

    pub fn holder(&self) -> u64 {
        return self.word().load(Ordering::Relaxed);
    }

    /// Crash recovery: release the lock iff `id` still holds it.
    pub fn force_unlock_if_held_by(&self, id: u64) -> bool {
        return self
            .word()
            .compare_exchange(id, UNLOCKED, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word() -> Box<AtomicU64> {
        return Box::new(AtomicU64::new(0));
    }

    #[test]
    fn try_lock_and_unlock() {
        let w = word();
        let lock = unsafe { SpinLock::at(w.as_ref() as *const AtomicU64 as *mut u8) };
        assert!(lock.try_lock(7));
        assert!(!lock.try_lock(8));
        assert_eq!(lock.holder(), 7);
        lock.unlock();
        assert!(lock.try_lock(8));
    }

    #[test]
    fn lock_respects_deadline() {
        let w = word();
        let lock = unsafe { SpinLock::at(w.as_ref() as *const AtomicU64 as *mut u8) };
        assert!(lock.try_lock(1));
        let start = Instant::now();
        assert!(!lock.lock(2, Instant::now() + Duration::from_millis(50)));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn recovery_unlock_checks_holder() {
        let w = word();
        let lock = unsafe { SpinLock::at(w.as_ref() as *const AtomicU64 as *mut u8) };
        assert!(lock.try_lock(3));
        assert!(!lock.force_unlock_if_held_by(4));
        assert!(lock.force_unlock_if_held_by(3));
        assert!(lock.try_lock(4));
    }
}
