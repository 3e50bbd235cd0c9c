use crate::bounded_queue::BoundedQueue;
use crate::error::Error;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};

// Per-scheduler control block: the notify flag the scheduler raises before
// sleeping on its wake event, and the queue of channel numbers this
// scheduler still has free. The wake event is a named object (see
// constants::scheduler_event_name).

// layout (per scheduler slot)
//  0   -- uint32 notify flag
//  4   -- uint8[4] padding
//  8   -- bounded_queue of free channel numbers

const POS_NOTIFY: usize = 0;
const POS_CHANNEL_NUMBERS: usize = 8;

pub struct SchedulerInterface<'a> {
    base: *mut u8,
    _segment: PhantomData<&'a ()>,
}

unsafe impl<'a> Send for SchedulerInterface<'a> {}

impl<'a> SchedulerInterface<'a> {
    pub fn size_in_bytes(n_channels: u32) -> usize {
        // the queue's lock word and semaphores need 8-aligned bases, so the
        // inter-slot stride must stay a multiple of 8
        let bytes = POS_CHANNEL_NUMBERS + BoundedQueue::size_in_bytes(n_channels);
        return (bytes + 7) & !7;
    }

    /// Safety: `base` must point at `size_in_bytes(..)` zeroed, 8-aligned
    /// bytes of shared mapping. Call once per slot; the free-number queue
    /// starts empty, the creator pushes this scheduler's channel numbers.
    pub unsafe fn init_at(base: *mut u8, n_channels: u32) -> Result<SchedulerInterface<'a>, Error> {
        BoundedQueue::init_at(base.add(POS_CHANNEL_NUMBERS), n_channels)?;
        let iface = SchedulerInterface {
            base: base,
            _segment: PhantomData,
        };
        iface.notify_word().store(0, Ordering::Relaxed);
        return Ok(iface);
    }

    /// Safety: `base` must point at a slot set up with `init_at`.
    pub unsafe fn at(base: *mut u8) -> SchedulerInterface<'a> {
        return SchedulerInterface {
            base: base,
            _segment: PhantomData,
        };
    }

    fn notify_word(&self) -> &AtomicU32 {
        return unsafe { &*(self.base.add(POS_NOTIFY) as *const AtomicU32) };
    }

    /// True while the scheduler asked to be signaled about new work.
    pub fn wants_notification(&self) -> bool {
        return self.notify_word().load(Ordering::Acquire) != 0;
    }

    pub fn set_notify(&self, wanted: bool) {
        self.notify_word()
            .store(if wanted { 1 } else { 0 }, Ordering::Release);
    }

    /// Channel numbers this scheduler can still hand out.
    pub fn channel_number_queue(&self) -> BoundedQueue<'a> {
        return unsafe { BoundedQueue::at(self.base.add(POS_CHANNEL_NUMBERS)) };
    }
}

/// The dense scheduler interface array of a segment.
pub struct SchedulerInterfaceTable<'a> {
    base: *mut u8,
    n_schedulers: u32,
    n_channels: u32,
    _segment: PhantomData<&'a ()>,
}

unsafe impl<'a> Send for SchedulerInterfaceTable<'a> {}

impl<'a> SchedulerInterfaceTable<'a> {
    pub fn size_in_bytes(n_schedulers: u32, n_channels: u32) -> usize {
        return n_schedulers as usize * SchedulerInterface::size_in_bytes(n_channels);
    }

    /// Safety: `base` must point at `size_in_bytes(..)` mapped bytes.
    pub unsafe fn at(
        base: *mut u8,
        n_schedulers: u32,
        n_channels: u32,
    ) -> SchedulerInterfaceTable<'a> {
        return SchedulerInterfaceTable {
            base: base,
            n_schedulers: n_schedulers,
            n_channels: n_channels,
            _segment: PhantomData,
        };
    }

    pub fn n_schedulers(&self) -> u32 {
        return self.n_schedulers;
    }

    pub fn scheduler(&self, number: u32) -> SchedulerInterface<'a> {
        assert!(number < self.n_schedulers);
        let stride = SchedulerInterface::size_in_bytes(self.n_channels);
        unsafe {
            return SchedulerInterface::at(self.base.add(number as usize * stride));
        }
    }
}
