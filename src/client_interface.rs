use crate::owner_id::OwnerId;
use crate::resource_map::ResourceMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

// Per-client control block: who owns the slot, whether the client wants a
// wake signal, how many channels it holds, and the resource map recording
// everything it owns. The wake event itself is a named object each process
// opens by itself (see constants::client_event_name); only the flag lives
// here.

// layout (per client slot)
//  0   -- uint64 owner id, zero when the slot is free
//  8   -- uint32 notify flag, set while the client sleeps on its event
// 12   -- uint32 allocated channel count
// 16   -- resource map

const POS_OWNER_ID: usize = 0;
const POS_NOTIFY: usize = 8;
const POS_ALLOCATED_CHANNELS: usize = 12;
const POS_RESOURCE_MAP: usize = 16;

pub struct ClientInterface<'a> {
    base: *mut u8,
    n_chunks: u32,
    n_channels: u32,
    _segment: PhantomData<&'a ()>,
}

unsafe impl<'a> Send for ClientInterface<'a> {}

impl<'a> ClientInterface<'a> {
    pub fn size_in_bytes(n_chunks: u32, n_channels: u32) -> usize {
        return POS_RESOURCE_MAP + ResourceMap::size_in_bytes(n_chunks, n_channels);
    }

    /// Safety: `base` must point at `size_in_bytes(..)` zeroed, 8-aligned
    /// bytes of shared mapping. Zero state is a valid free slot.
    pub unsafe fn at(base: *mut u8, n_chunks: u32, n_channels: u32) -> ClientInterface<'a> {
        return ClientInterface {
            base: base,
            n_chunks: n_chunks,
            n_channels: n_channels,
            _segment: PhantomData,
        };
    }

    fn owner_word(&self) -> &AtomicU64 {
        return unsafe { &*(self.base.add(POS_OWNER_ID) as *const AtomicU64) };
    }

    fn notify_word(&self) -> &AtomicU32 {
        return unsafe { &*(self.base.add(POS_NOTIFY) as *const AtomicU32) };
    }

    fn channels_word(&self) -> &AtomicU32 {
        return unsafe { &*(self.base.add(POS_ALLOCATED_CHANNELS) as *const AtomicU32) };
    }

    pub fn owner_id(&self) -> OwnerId {
        return OwnerId::from_raw(self.owner_word().load(Ordering::Acquire));
    }

    pub fn set_owner_id(&self, owner_id: OwnerId) {
        self.owner_word().store(owner_id.raw(), Ordering::Release);
    }

    /// True while the client asked to be signaled on new out-queue traffic.
    pub fn wants_notification(&self) -> bool {
        return self.notify_word().load(Ordering::Acquire) != 0;
    }

    pub fn set_notify(&self, wanted: bool) {
        self.notify_word()
            .store(if wanted { 1 } else { 0 }, Ordering::Release);
    }

    pub fn allocated_channels(&self) -> u32 {
        return self.channels_word().load(Ordering::Relaxed);
    }

    pub fn increment_allocated_channels(&self) {
        self.channels_word().fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement_allocated_channels(&self) {
        self.channels_word().fetch_sub(1, Ordering::Relaxed);
    }

    pub fn resource_map(&self) -> ResourceMap<'a> {
        return unsafe {
            ResourceMap::at(
                self.base.add(POS_RESOURCE_MAP),
                self.n_chunks,
                self.n_channels,
            )
        };
    }
}

/// The dense client interface array of a segment.
pub struct ClientInterfaceTable<'a> {
    base: *mut u8,
    n_clients: u32,
    n_chunks: u32,
    n_channels: u32,
    _segment: PhantomData<&'a ()>,
}

unsafe impl<'a> Send for ClientInterfaceTable<'a> {}

impl<'a> ClientInterfaceTable<'a> {
    pub fn size_in_bytes(n_clients: u32, n_chunks: u32, n_channels: u32) -> usize {
        return n_clients as usize * ClientInterface::size_in_bytes(n_chunks, n_channels);
    }

    /// Safety: `base` must point at `size_in_bytes(..)` mapped bytes.
    pub unsafe fn at(
        base: *mut u8,
        n_clients: u32,
        n_chunks: u32,
        n_channels: u32,
    ) -> ClientInterfaceTable<'a> {
        return ClientInterfaceTable {
            base: base,
            n_clients: n_clients,
            n_chunks: n_chunks,
            n_channels: n_channels,
            _segment: PhantomData,
        };
    }

    pub fn n_clients(&self) -> u32 {
        return self.n_clients;
    }

    pub fn client(&self, number: u32) -> ClientInterface<'a> {
        assert!(number < self.n_clients);
        let stride = ClientInterface::size_in_bytes(self.n_chunks, self.n_channels);
        unsafe {
            return ClientInterface::at(
                self.base.add(number as usize * stride),
                self.n_chunks,
                self.n_channels,
            );
        }
    }
}
