use crate::atomic_buffer::AtomicBuffer;
use crate::constants::NO_CLIENT;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};

// One channel slot: the in ring (client -> scheduler), the out ring
// (scheduler -> client), the fixed scheduler number and the currently bound
// client number. Slots exist for the lifetime of the segment; acquiring a
// channel only moves its *number* out of a scheduler's free queue and binds
// a client, releasing is requested by the client (flag) and performed by
// the scheduler (drain, unbind, requeue the number).
//
// State machine: Free (number queued, no client) -> Bound (client number
// set) -> PendingRelease (to_be_released set) -> Free.

// layout
//  0   -- uint32 scheduler number, fixed at creation
//  4   -- uint32 client number, NO_CLIENT when unbound
//  8   -- uint32 to_be_released flag
// 12   -- uint8[52] padding
// 64   -- in ring  (atomic_buffer)
//  +R  -- out ring (atomic_buffer), R rounded up to 64

const POS_SCHEDULER_NUMBER: usize = 0;
const POS_CLIENT_NUMBER: usize = 4;
const POS_TO_BE_RELEASED: usize = 8;
const POS_IN: usize = 64;

fn ring_stride(queue_capacity: u32) -> usize {
    return (AtomicBuffer::size_in_bytes(queue_capacity) + 63) & !63;
}

pub struct Channel<'a> {
    base: *mut u8,
    queue_capacity: u32,
    _segment: PhantomData<&'a ()>,
}

unsafe impl<'a> Send for Channel<'a> {}

impl<'a> Channel<'a> {
    pub fn size_in_bytes(queue_capacity: u32) -> usize {
        return POS_IN + 2 * ring_stride(queue_capacity);
    }

    /// Safety: `base` must point at `size_in_bytes(..)` zeroed, 64-aligned
    /// bytes of shared mapping. Call once per slot.
    pub unsafe fn init_at(
        base: *mut u8,
        queue_capacity: u32,
        scheduler_number: u32,
    ) -> Channel<'a> {
        std::ptr::write(base.add(POS_SCHEDULER_NUMBER) as *mut u32, scheduler_number);
        AtomicBuffer::init_at(base.add(POS_IN), queue_capacity);
        AtomicBuffer::init_at(base.add(POS_IN + ring_stride(queue_capacity)), queue_capacity);
        let channel = Channel {
            base: base,
            queue_capacity: queue_capacity,
            _segment: PhantomData,
        };
        channel.client_number_word().store(NO_CLIENT, Ordering::Relaxed);
        channel.release_word().store(0, Ordering::Relaxed);
        return channel;
    }

    /// Safety: `base` must point at a slot set up with `init_at`.
    pub unsafe fn at(base: *mut u8, queue_capacity: u32) -> Channel<'a> {
        return Channel {
            base: base,
            queue_capacity: queue_capacity,
            _segment: PhantomData,
        };
    }

    fn client_number_word(&self) -> &AtomicU32 {
        return unsafe { &*(self.base.add(POS_CLIENT_NUMBER) as *const AtomicU32) };
    }

    fn release_word(&self) -> &AtomicU32 {
        return unsafe { &*(self.base.add(POS_TO_BE_RELEASED) as *const AtomicU32) };
    }

    pub fn scheduler_number(&self) -> u32 {
        return unsafe { std::ptr::read(self.base.add(POS_SCHEDULER_NUMBER) as *const u32) };
    }

    pub fn client_number(&self) -> Option<u32> {
        let raw = self.client_number_word().load(Ordering::Acquire);
        if raw == NO_CLIENT {
            return None;
        }
        return Some(raw);
    }

    pub fn bind_client(&self, client_number: u32) {
        assert!(client_number != NO_CLIENT);
        self.release_word().store(0, Ordering::Relaxed);
        self.client_number_word()
            .store(client_number, Ordering::Release);
    }

    pub fn unbind_client(&self) {
        self.client_number_word().store(NO_CLIENT, Ordering::Release);
    }

    pub fn is_bound(&self) -> bool {
        return self.client_number().is_some();
    }

    pub fn set_to_be_released(&self) {
        self.release_word().store(1, Ordering::Release);
    }

    pub fn clear_to_be_released(&self) {
        self.release_word().store(0, Ordering::Release);
    }

    pub fn is_to_be_released(&self) -> bool {
        return self.release_word().load(Ordering::Acquire) != 0;
    }

    /// Client -> scheduler direction.
    pub fn in_queue(&self) -> AtomicBuffer<'a> {
        return unsafe { AtomicBuffer::at(self.base.add(POS_IN)) };
    }

    /// Scheduler -> client direction.
    pub fn out_queue(&self) -> AtomicBuffer<'a> {
        return unsafe {
            AtomicBuffer::at(self.base.add(POS_IN + ring_stride(self.queue_capacity)))
        };
    }
}

/// The dense channel slot array of a segment.
pub struct ChannelTable<'a> {
    base: *mut u8,
    n_channels: u32,
    queue_capacity: u32,
    _segment: PhantomData<&'a ()>,
}

unsafe impl<'a> Send for ChannelTable<'a> {}

impl<'a> ChannelTable<'a> {
    pub fn size_in_bytes(n_channels: u32, queue_capacity: u32) -> usize {
        return n_channels as usize * Channel::size_in_bytes(queue_capacity);
    }

    /// Safety: `base` must point at `size_in_bytes(..)` mapped bytes.
    pub unsafe fn at(base: *mut u8, n_channels: u32, queue_capacity: u32) -> ChannelTable<'a> {
        return ChannelTable {
            base: base,
            n_channels: n_channels,
            queue_capacity: queue_capacity,
            _segment: PhantomData,
        };
    }

    pub fn n_channels(&self) -> u32 {
        return self.n_channels;
    }

    pub fn channel(&self, number: u32) -> Channel<'a> {
        assert!(number < self.n_channels);
        let stride = Channel::size_in_bytes(self.queue_capacity);
        unsafe {
            return Channel::at(self.base.add(number as usize * stride), self.queue_capacity);
        }
    }
}
