use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};

// Single-producer single-consumer ring used for a channel's in and out
// queues. Each direction has exactly one pusher and one popper (the client
// thread and the scheduler), so free-running head/tail indices with
// release/acquire publication are enough; no lock.

// layout
//  0   -- uint32 capacity (power of two)
//  4   -- uint8[60] padding
// 64   -- uint32 head, producer index, own cache line
// 68   -- uint8[60] padding
// 128  -- uint32 tail, consumer index, own cache line
// 132  -- uint8[60] padding
// 192  -- uint32[capacity] elements

const POS_CAPACITY: usize = 0;
const POS_HEAD: usize = 64;
const POS_TAIL: usize = 128;
const POS_ELEMS: usize = 192;

pub struct AtomicBuffer<'a> {
    base: *mut u8,
    capacity: u32,
    _segment: PhantomData<&'a ()>,
}

unsafe impl<'a> Send for AtomicBuffer<'a> {}

impl<'a> AtomicBuffer<'a> {
    pub fn size_in_bytes(capacity: u32) -> usize {
        assert!(capacity.is_power_of_two());
        return POS_ELEMS + capacity as usize * 4;
    }

    /// Safety: `base` must point at `size_in_bytes(capacity)` zeroed,
    /// 64-aligned bytes of shared mapping. Call once per location.
    pub unsafe fn init_at(base: *mut u8, capacity: u32) -> AtomicBuffer<'a> {
        assert!(capacity.is_power_of_two());
        std::ptr::write(base.add(POS_CAPACITY) as *mut u32, capacity);
        let buffer = AtomicBuffer {
            base: base,
            capacity: capacity,
            _segment: PhantomData,
        };
        buffer.head().store(0, Ordering::Relaxed);
        buffer.tail().store(0, Ordering::Relaxed);
        return buffer;
    }

    /// Safety: `base` must point at a location set up with `init_at`.
    pub unsafe fn at(base: *mut u8) -> AtomicBuffer<'a> {
        let capacity = std::ptr::read(base.add(POS_CAPACITY) as *const u32);
        assert!(capacity.is_power_of_two());
        return AtomicBuffer {
            base: base,
            capacity: capacity,
            _segment: PhantomData,
        };
    }

    fn head(&self) -> &AtomicU32 {
        return unsafe { &*(self.base.add(POS_HEAD) as *const AtomicU32) };
    }

    fn tail(&self) -> &AtomicU32 {
        return unsafe { &*(self.base.add(POS_TAIL) as *const AtomicU32) };
    }

    fn elem_ptr(&self, index: u32) -> *mut u32 {
        let slot = (index & (self.capacity - 1)) as usize;
        return unsafe { self.base.add(POS_ELEMS + slot * 4) as *mut u32 };
    }

    pub fn capacity(&self) -> u32 {
        return self.capacity;
    }

    pub fn len(&self) -> u32 {
        return self
            .head()
            .load(Ordering::Acquire)
            .wrapping_sub(self.tail().load(Ordering::Acquire));
    }

    pub fn has_more(&self) -> bool {
        return self.len() != 0;
    }

    /// Producer side. False if the ring is full.
    pub fn try_push(&self, item: u32) -> bool {
        let head = self.head().load(Ordering::Relaxed);
        let tail = self.tail().load(Ordering::Acquire);
        if head.wrapping_sub(tail) == self.capacity {
            return false;
        }
        unsafe {
            std::ptr::write_volatile(self.elem_ptr(head), item);
        }
        // publish the element to the consumer
        self.head().store(head.wrapping_add(1), Ordering::Release);
        return true;
    }

    /// Consumer side. None if the ring is empty.
    pub fn try_pop(&self) -> Option<u32> {
        let tail = self.tail().load(Ordering::Relaxed);
        let head = self.head().load(Ordering::Acquire);
        if tail == head {
            return None;
        }
        let item = unsafe { std::ptr::read_volatile(self.elem_ptr(tail)) };
        // hand the slot back to the producer
        self.tail().store(tail.wrapping_add(1), Ordering::Release);
        return Some(item);
    }

    /// Retry `try_push` up to `spin_count` extra times. Blocking on top of
    /// this happens at the call site via the peer's wake event.
    pub fn push(&self, item: u32, spin_count: u32) -> bool {
        if self.try_push(item) {
            return true;
        }
        for _ in 0..spin_count {
            std::hint::spin_loop();
            if self.try_push(item) {
                return true;
            }
        }
        return false;
    }

    pub fn pop(&self, spin_count: u32) -> Option<u32> {
        if let Some(item) = self.try_pop() {
            return Some(item);
        }
        for _ in 0..spin_count {
            std::hint::spin_loop();
            if let Some(item) = self.try_pop() {
                return Some(item);
            }
        }
        return None;
    }
}
