use crate::error::Error;
use crate::spin_lock::SpinLock;
use crate::wake_event::SharedSemaphore;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

// Multi-producer multi-consumer bounded FIFO living in the segment: the
// container behind the shared chunk pool, the scheduler free-channel-number
// queues and the client number pool. A spin-then-block push/pop: bounded
// non-blocking attempts first, then the lock plus a timed wait on the
// not_empty/not_full semaphore. One post per successful push/pop; waiters
// re-check under the lock, stale credits only cause a spurious re-check.

// layout
//  0   -- uint64 lock word (see spin_lock)
//  8   -- uint32 capacity
// 12   -- uint32 head, read position, only touched under the lock
// 16   -- uint32 length, atomic so diagnostics can read it lock free
// 20   -- uint8[4] padding
// 24   -- sem_t not_empty
// 24+S -- sem_t not_full
// 24+2S (rounded up to 8) -- uint32[capacity] elements

const POS_LOCK: usize = 0;
const POS_CAPACITY: usize = 8;
const POS_HEAD: usize = 12;
const POS_LEN: usize = 16;
const POS_SEMS: usize = 24;

fn pos_not_full() -> usize {
    return POS_SEMS + SharedSemaphore::size_in_bytes();
}

fn pos_elems() -> usize {
    let end = POS_SEMS + 2 * SharedSemaphore::size_in_bytes();
    return (end + 7) & !7;
}

pub struct BoundedQueue<'a> {
    base: *mut u8,
    capacity: u32,
    _segment: PhantomData<&'a ()>,
}

unsafe impl<'a> Send for BoundedQueue<'a> {}

impl<'a> BoundedQueue<'a> {
    pub fn size_in_bytes(capacity: u32) -> usize {
        return pos_elems() + capacity as usize * 4;
    }

    /// Safety: `base` must point at `size_in_bytes(capacity)` zeroed,
    /// 8-aligned bytes of shared mapping. Call once per location.
    pub unsafe fn init_at(base: *mut u8, capacity: u32) -> Result<BoundedQueue<'a>, Error> {
        assert!(capacity > 0);
        std::ptr::write(base.add(POS_CAPACITY) as *mut u32, capacity);
        std::ptr::write(base.add(POS_HEAD) as *mut u32, 0);
        SharedSemaphore::init_at(base.add(POS_SEMS))?;
        SharedSemaphore::init_at(base.add(pos_not_full()))?;
        let queue = BoundedQueue {
            base: base,
            capacity: capacity,
            _segment: PhantomData,
        };
        queue.len_word().store(0, Ordering::Relaxed);
        return Ok(queue);
    }

    /// Safety: `base` must point at a location set up with `init_at`.
    pub unsafe fn at(base: *mut u8) -> BoundedQueue<'a> {
        let capacity = std::ptr::read(base.add(POS_CAPACITY) as *const u32);
        assert!(capacity > 0);
        return BoundedQueue {
            base: base,
            capacity: capacity,
            _segment: PhantomData,
        };
    }

    pub fn capacity(&self) -> u32 {
        return self.capacity;
    }

    pub fn len(&self) -> u32 {
        return self.len_word().load(Ordering::Relaxed);
    }

    fn len_word(&self) -> &AtomicU32 {
        return unsafe { &*(self.base.add(POS_LEN) as *const AtomicU32) };
    }

    fn head(&self) -> u32 {
        return unsafe { std::ptr::read(self.base.add(POS_HEAD) as *const u32) };
    }

    fn set_head(&self, head: u32) {
        unsafe {
            std::ptr::write(self.base.add(POS_HEAD) as *mut u32, head);
        }
    }

    fn elem_ptr(&self, slot: u32) -> *mut u32 {
        return unsafe { self.base.add(pos_elems() + (slot % self.capacity) as usize * 4) as *mut u32 };
    }

    // The lock and both semaphores are exposed so the shared chunk pool can
    // run multi-element operations under one critical section.

    pub fn lock(&self) -> SpinLock<'a> {
        return unsafe { SpinLock::at(self.base.add(POS_LOCK)) };
    }

    pub fn not_empty(&self) -> SharedSemaphore<'a> {
        return unsafe { SharedSemaphore::at(self.base.add(POS_SEMS)) };
    }

    pub fn not_full(&self) -> SharedSemaphore<'a> {
        return unsafe { SharedSemaphore::at(self.base.add(pos_not_full())) };
    }

    /// Caller must hold the lock. False when full.
    pub fn push_locked(&self, item: u32) -> bool {
        let len = self.len_word().load(Ordering::Relaxed);
        if len == self.capacity {
            return false;
        }
        unsafe {
            std::ptr::write_volatile(self.elem_ptr(self.head().wrapping_add(len)), item);
        }
        self.len_word().store(len + 1, Ordering::Release);
        return true;
    }

    /// Caller must hold the lock. None when empty.
    pub fn pop_locked(&self) -> Option<u32> {
        let len = self.len_word().load(Ordering::Relaxed);
        if len == 0 {
            return None;
        }
        let head = self.head();
        let item = unsafe { std::ptr::read_volatile(self.elem_ptr(head)) };
        self.set_head(head.wrapping_add(1));
        self.len_word().store(len - 1, Ordering::Release);
        return Some(item);
    }

    /// One non-blocking attempt: try the lock once, push if there is room.
    pub fn try_push(&self, item: u32, lock_id: u64) -> bool {
        let lock = self.lock();
        if !lock.try_lock(lock_id) {
            return false;
        }
        let pushed = self.push_locked(item);
        lock.unlock();
        if pushed {
            // a failed post only costs a waiter one timed recheck
            let _ = self.not_empty().post();
        }
        return pushed;
    }

    pub fn try_pop(&self, lock_id: u64) -> Option<u32> {
        let lock = self.lock();
        if !lock.try_lock(lock_id) {
            return None;
        }
        let item = self.pop_locked();
        lock.unlock();
        if item.is_some() {
            let _ = self.not_full().post();
        }
        return item;
    }

    /// Spin `spin_count` attempts, then lock + wait on not_full until
    /// `deadline`.
    pub fn push(
        &self,
        item: u32,
        lock_id: u64,
        spin_count: u32,
        deadline: Instant,
    ) -> Result<(), Error> {
        for _ in 0..spin_count {
            if self.try_push(item, lock_id) {
                return Ok(());
            }
            std::hint::spin_loop();
        }

        loop {
            let lock = self.lock();
            if !lock.lock(lock_id, deadline) {
                return Err(Error::Timeout);
            }
            let pushed = self.push_locked(item);
            lock.unlock();
            if pushed {
                let _ = self.not_empty().post();
                return Ok(());
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout);
            }
            if !self.not_full().wait_timeout(remaining)? {
                return Err(Error::Timeout);
            }
        }
    }

    pub fn pop(&self, lock_id: u64, spin_count: u32, deadline: Instant) -> Result<u32, Error> {
        for _ in 0..spin_count {
            if let Some(item) = self.try_pop(lock_id) {
                return Ok(item);
            }
            std::hint::spin_loop();
        }

        loop {
            let lock = self.lock();
            if !lock.lock(lock_id, deadline) {
                return Err(Error::Timeout);
            }
            let item = self.pop_locked();
            lock.unlock();
            if let Some(item) = item {
                let _ = self.not_full().post();
                return Ok(item);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout);
            }
            if !self.not_empty().wait_timeout(remaining)? {
                return Err(Error::Timeout);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const ID: u64 = 9;

    fn queue(capacity: u32) -> (Vec<u64>, BoundedQueue<'static>) {
        let mut backing = vec![0u64; BoundedQueue::size_in_bytes(capacity) / 8 + 1];
        let base = backing.as_mut_ptr() as *mut u8;
        let queue = unsafe { BoundedQueue::init_at(base, capacity).expect("init") };
        return (backing, queue);
    }

    fn soon(ms: u64) -> Instant {
        return Instant::now() + Duration::from_millis(ms);
    }

    #[test]
    fn fifo_order() {
        let (_backing, q) = queue(4);
        assert!(q.try_push(3, ID));
        assert!(q.try_push(1, ID));
        assert!(q.try_push(2, ID));
        assert_eq!(q.try_pop(ID), Some(3));
        assert_eq!(q.try_pop(ID), Some(1));
        assert_eq!(q.try_pop(ID), Some(2));
        assert_eq!(q.try_pop(ID), None);
    }

    #[test]
    fn capacity_conservation() {
        let (_backing, q) = queue(4);
        for i in 0..4 {
            assert!(q.try_push(i, ID));
        }
        assert!(!q.try_push(99, ID));
        assert_eq!(q.len(), 4);
        for _ in 0..100 {
            let item = q.try_pop(ID).unwrap();
            assert!(q.try_push(item, ID));
            assert_eq!(q.len(), 4);
        }
    }

    #[test]
    fn zero_timeout_fails_immediately() {
        let (_backing, q) = queue(1);
        let start = Instant::now();
        assert_eq!(q.pop(ID, 0, Instant::now()), Err(Error::Timeout));
        assert!(q.try_push(5, ID));
        assert_eq!(q.push(6, ID, 0, Instant::now()), Err(Error::Timeout));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn pop_wakes_before_deadline() {
        let (backing, q) = queue(2);
        let base_addr = backing.as_ptr() as usize;

        let pusher = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            let q = unsafe { BoundedQueue::at(base_addr as *mut u8) };
            q.push(42, ID + 1, 10, soon(1000)).expect("push");
        });

        let start = Instant::now();
        let item = q.pop(ID, 10, soon(2000)).expect("pop");
        assert_eq!(item, 42);
        // woke well before the 2s deadline
        assert!(start.elapsed() < Duration::from_millis(1500));
        pusher.join().unwrap();
        let _keep_alive = backing;
    }

    #[test]
    fn push_wakes_when_room_appears() {
        let (backing, q) = queue(1);
        let base_addr = backing.as_ptr() as usize;
        assert!(q.try_push(7, ID));

        let popper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            let q = unsafe { BoundedQueue::at(base_addr as *mut u8) };
            assert_eq!(q.pop(ID + 1, 10, soon(1000)).expect("pop"), 7);
        });

        q.push(8, ID, 10, soon(2000)).expect("push");
        popper.join().unwrap();
        assert_eq!(q.try_pop(ID), Some(8));
        let _keep_alive = backing;
    }

    #[test]
    fn many_producers_many_consumers() {
        let (backing, q) = queue(8);
        let base_addr = backing.as_ptr() as usize;
        let n_per_thread = 1000u32;

        let mut producers = Vec::new();
        for t in 0..4u64 {
            producers.push(std::thread::spawn(move || {
                let q = unsafe { BoundedQueue::at(base_addr as *mut u8) };
                for i in 0..n_per_thread {
                    q.push(i, 100 + t, 10, soon(10_000)).expect("push");
                }
            }));
        }

        let mut popped = 0u32;
        while popped < 4 * n_per_thread {
            q.pop(ID, 10, soon(10_000)).expect("pop");
            popped += 1;
        }
        for p in producers {
            p.join().unwrap();
        }
        assert_eq!(q.len(), 0);
        let _keep_alive = backing;
    }
}
