use crate::constants::{
    CHUNK_PAYLOAD_CAPACITY, CHUNK_POS_HANDLER_ID, CHUNK_POS_NEXT_LINK, CHUNK_POS_PAYLOAD,
    CHUNK_POS_REQUEST_SIZE, CHUNK_POS_STREAM_LINK, CHUNK_SIZE, LINK_TERMINATOR,
};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};

pub type ChunkIndex = u32;

/// Chunks a message of `byte_size` bytes needs. Zero-length messages still
/// occupy one chunk for the header.
pub fn chunks_needed(byte_size: usize) -> usize {
    if byte_size == 0 {
        return 1;
    }
    return (byte_size + CHUNK_PAYLOAD_CAPACITY - 1) / CHUNK_PAYLOAD_CAPACITY;
}

/// View over one chunk's bytes inside the segment. The two link fields are
/// independent: the stream link chains chunks of one message, the next link
/// chains free-list/queue membership. Neither ever means the other.
pub struct Chunk<'a> {
    base: *mut u8,
    _segment: PhantomData<&'a ()>,
}

impl<'a> Chunk<'a> {
    /// Safety: `base` must point at CHUNK_SIZE bytes of mapped segment and
    /// the caller must hold the chunk per the ownership invariant.
    pub unsafe fn at(base: *mut u8) -> Chunk<'a> {
        return Chunk {
            base: base,
            _segment: PhantomData,
        };
    }

    pub fn payload_capacity() -> usize {
        return CHUNK_PAYLOAD_CAPACITY;
    }

    fn link_word(&self, pos: usize) -> &AtomicU32 {
        return unsafe { &*(self.base.add(pos) as *const AtomicU32) };
    }

    pub fn set_handler_id(&self, handler_id: u64) {
        unsafe {
            std::ptr::write_unaligned(self.base.add(CHUNK_POS_HANDLER_ID) as *mut u64, handler_id);
        }
    }

    pub fn handler_id(&self) -> u64 {
        unsafe {
            return std::ptr::read_unaligned(self.base.add(CHUNK_POS_HANDLER_ID) as *const u64);
        }
    }

    pub fn set_request_size(&self, size: u32) {
        unsafe {
            std::ptr::write_unaligned(self.base.add(CHUNK_POS_REQUEST_SIZE) as *mut u32, size);
        }
    }

    pub fn request_size(&self) -> u32 {
        unsafe {
            return std::ptr::read_unaligned(self.base.add(CHUNK_POS_REQUEST_SIZE) as *const u32);
        }
    }

    pub fn payload(&self) -> &[u8] {
        unsafe {
            return std::slice::from_raw_parts(
                self.base.add(CHUNK_POS_PAYLOAD),
                CHUNK_PAYLOAD_CAPACITY,
            );
        }
    }

    pub fn payload_mut(&self) -> &mut [u8] {
        unsafe {
            return std::slice::from_raw_parts_mut(
                self.base.add(CHUNK_POS_PAYLOAD),
                CHUNK_PAYLOAD_CAPACITY,
            );
        }
    }

    // stream link: message chaining

    pub fn set_link(&self, next: ChunkIndex) {
        assert!(next != LINK_TERMINATOR);
        self.link_word(CHUNK_POS_STREAM_LINK)
            .store(next, Ordering::Relaxed);
    }

    pub fn terminate_link(&self) {
        self.link_word(CHUNK_POS_STREAM_LINK)
            .store(LINK_TERMINATOR, Ordering::Relaxed);
    }

    pub fn get_link(&self) -> Option<ChunkIndex> {
        let raw = self.link_word(CHUNK_POS_STREAM_LINK).load(Ordering::Relaxed);
        if raw == LINK_TERMINATOR {
            return None;
        }
        return Some(raw);
    }

    pub fn is_terminated(&self) -> bool {
        return self.get_link().is_none();
    }

    // next link: free-list/queue chaining

    pub fn set_next(&self, next: ChunkIndex) {
        assert!(next != LINK_TERMINATOR);
        self.link_word(CHUNK_POS_NEXT_LINK)
            .store(next, Ordering::Relaxed);
    }

    pub fn terminate_next(&self) {
        self.link_word(CHUNK_POS_NEXT_LINK)
            .store(LINK_TERMINATOR, Ordering::Relaxed);
    }

    pub fn get_next(&self) -> Option<ChunkIndex> {
        let raw = self.link_word(CHUNK_POS_NEXT_LINK).load(Ordering::Relaxed);
        if raw == LINK_TERMINATOR {
            return None;
        }
        return Some(raw);
    }

    pub fn is_next_terminated(&self) -> bool {
        return self.get_next().is_none();
    }
}

/// The dense chunk array of a segment.
pub struct ChunkTable<'a> {
    base: *mut u8,
    n_chunks: u32,
    _segment: PhantomData<&'a ()>,
}

impl<'a> ChunkTable<'a> {
    pub fn size_in_bytes(n_chunks: u32) -> usize {
        return n_chunks as usize * CHUNK_SIZE;
    }

    /// Safety: `base` must point at `size_in_bytes(n_chunks)` mapped bytes.
    pub unsafe fn at(base: *mut u8, n_chunks: u32) -> ChunkTable<'a> {
        return ChunkTable {
            base: base,
            n_chunks: n_chunks,
            _segment: PhantomData,
        };
    }

    pub fn n_chunks(&self) -> u32 {
        return self.n_chunks;
    }

    pub fn chunk(&self, index: ChunkIndex) -> Chunk<'a> {
        assert!(index < self.n_chunks);
        unsafe {
            return Chunk::at(self.base.add(index as usize * CHUNK_SIZE));
        }
    }

    /// Walk a message chain from `head`, yielding each index. The chain must
    /// be properly terminated.
    pub fn for_each_in_chain<F: FnMut(ChunkIndex)>(&self, head: ChunkIndex, mut f: F) {
        let mut current = Some(head);
        while let Some(index) = current {
            current = self.chunk(index).get_link();
            f(index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::CHUNK_SIZE;

    // u64 backing keeps the link words aligned
    fn table(n: u32) -> (Vec<u64>, *mut u8) {
        let mut backing = vec![0u64; ChunkTable::size_in_bytes(n) / 8];
        let base = backing.as_mut_ptr() as *mut u8;
        return (backing, base);
    }

    #[test]
    fn chunks_needed_boundaries() {
        assert_eq!(chunks_needed(0), 1);
        assert_eq!(chunks_needed(1), 1);
        assert_eq!(chunks_needed(CHUNK_PAYLOAD_CAPACITY), 1);
        assert_eq!(chunks_needed(CHUNK_PAYLOAD_CAPACITY + 1), 2);
        assert_eq!(chunks_needed(3 * CHUNK_PAYLOAD_CAPACITY), 3);
    }

    #[test]
    fn header_fields_round_trip() {
        let (_backing, base) = table(1);
        let chunk = unsafe { Chunk::at(base) };
        chunk.set_handler_id(0x1122_3344_5566_7788);
        chunk.set_request_size(16);
        assert_eq!(chunk.handler_id(), 0x1122_3344_5566_7788);
        assert_eq!(chunk.request_size(), 16);
        chunk.payload_mut()[0..4].copy_from_slice(b"PING");
        assert_eq!(&chunk.payload()[0..4], b"PING");
    }

    #[test]
    fn links_are_independent() {
        let (_backing, base) = table(1);
        let chunk = unsafe { Chunk::at(base) };
        chunk.terminate_link();
        chunk.terminate_next();
        assert!(chunk.is_terminated());
        assert!(chunk.is_next_terminated());

        // index zero is a valid target, not a terminator
        chunk.set_link(0);
        assert_eq!(chunk.get_link(), Some(0));
        assert!(chunk.is_next_terminated());

        chunk.set_next(5);
        assert_eq!(chunk.get_next(), Some(5));
        assert_eq!(chunk.get_link(), Some(0));
    }

    #[test]
    fn table_addresses_do_not_overlap() {
        let (_backing, base) = table(3);
        let t = unsafe { ChunkTable::at(base, 3) };
        t.chunk(0).set_handler_id(1);
        t.chunk(1).set_handler_id(2);
        t.chunk(2).set_handler_id(3);
        assert_eq!(t.chunk(0).handler_id(), 1);
        assert_eq!(t.chunk(1).handler_id(), 2);
        assert_eq!(t.chunk(2).handler_id(), 3);
        assert_eq!(ChunkTable::size_in_bytes(3), 3 * CHUNK_SIZE);
    }

    #[test]
    fn chain_walk_visits_in_order() {
        let (_backing, base) = table(4);
        let t = unsafe { ChunkTable::at(base, 4) };
        t.chunk(2).set_link(0);
        t.chunk(0).set_link(3);
        t.chunk(3).terminate_link();

        let mut seen = Vec::new();
        t.for_each_in_chain(2, |i| seen.push(i));
        assert_eq!(seen, vec![2, 0, 3]);
    }
}
