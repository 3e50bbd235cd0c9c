use crate::chunk::{chunks_needed, ChunkIndex, ChunkTable};
use std::collections::VecDeque;

/// A process-local free list of chunk indices. Not thread safe; a scheduler
/// (or a client managing a private reserve) serializes access itself. The
/// chunks referenced still live in the segment, only the bookkeeping is
/// private.
pub struct ChunkPool {
    chunks: VecDeque<ChunkIndex>,
    capacity: usize,
}

impl ChunkPool {
    pub fn new(capacity: usize) -> ChunkPool {
        return ChunkPool {
            chunks: VecDeque::with_capacity(capacity),
            capacity: capacity,
        };
    }

    pub fn len(&self) -> usize {
        return self.chunks.len();
    }

    pub fn is_empty(&self) -> bool {
        return self.chunks.is_empty();
    }

    pub fn is_full(&self) -> bool {
        return self.chunks.len() >= self.capacity;
    }

    pub fn push(&mut self, index: ChunkIndex) -> bool {
        if self.is_full() {
            return false;
        }
        self.chunks.push_back(index);
        return true;
    }

    pub fn pop(&mut self) -> Option<ChunkIndex> {
        return self.chunks.pop_front();
    }

    /// Pop enough chunks for `byte_size` bytes of payload, link them in pop
    /// order via the stream link, terminate the last, return the head.
    /// Fails atomically: if the pool holds too few chunks nothing is popped.
    pub fn acquire_linked_chunks(
        &mut self,
        table: &ChunkTable,
        byte_size: usize,
    ) -> Option<ChunkIndex> {
        return self.acquire_linked_chunks_counted(table, chunks_needed(byte_size));
    }

    /// Count-based variant of `acquire_linked_chunks`.
    pub fn acquire_linked_chunks_counted(
        &mut self,
        table: &ChunkTable,
        n_chunks: usize,
    ) -> Option<ChunkIndex> {
        if n_chunks == 0 || self.chunks.len() < n_chunks {
            return None;
        }

        let head = self.chunks.pop_front().unwrap();
        let mut previous = head;
        for _ in 1..n_chunks {
            let index = self.chunks.pop_front().unwrap();
            table.chunk(previous).set_link(index);
            previous = index;
        }
        table.chunk(previous).terminate_link();
        return Some(head);
    }

    /// Walk the message chain from `head` pushing every chunk back. If the
    /// pool fills partway, the unreleased sub-chain head comes back in `Err`
    /// so no index is lost.
    pub fn release_linked_chunks(
        &mut self,
        table: &ChunkTable,
        head: ChunkIndex,
    ) -> Result<(), ChunkIndex> {
        let mut current = Some(head);
        while let Some(index) = current {
            if self.is_full() {
                return Err(index);
            }
            let next = table.chunk(index).get_link();
            self.chunks.push_back(index);
            current = next;
        }
        return Ok(());
    }
}
