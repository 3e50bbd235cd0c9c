use crate::bounded_queue::BoundedQueue;
use crate::chunk::{chunks_needed, ChunkIndex, ChunkTable};
use crate::chunk_pool::ChunkPool;
use crate::error::Error;
use crate::resource_map::ResourceMap;
use std::sync::atomic::{fence, Ordering};
use std::time::{Duration, Instant};

// The one cross-process free list of every chunk in the segment. The
// container is a bounded queue whose lock guards each whole operation, so
// multi-chunk acquires are atomic and ownership bits are always written
// between "removed from the free list" and "visible to anyone else".
//
// Crash ordering invariant: an index is never simultaneously in the free
// queue and flagged in a resource map. Acquire pops first, then marks;
// release clears first, then pushes. A crash between the two steps leaks
// the chunk until sweep, it never double-frees it.

const POOL_SPIN_COUNT: u32 = 100;

pub struct SharedChunkPool<'a> {
    queue: BoundedQueue<'a>,
}

impl<'a> SharedChunkPool<'a> {
    pub fn size_in_bytes(n_chunks: u32) -> usize {
        return BoundedQueue::size_in_bytes(n_chunks);
    }

    /// Set up the pool holding every chunk index, done once by the segment
    /// creator. Safety: as `BoundedQueue::init_at`.
    pub unsafe fn init_at(base: *mut u8, n_chunks: u32) -> Result<SharedChunkPool<'a>, Error> {
        let queue = BoundedQueue::init_at(base, n_chunks)?;
        for index in 0..n_chunks {
            // single threaded during creation, no lock needed
            assert!(queue.push_locked(index));
        }
        return Ok(SharedChunkPool { queue: queue });
    }

    /// Safety: as `BoundedQueue::at`.
    pub unsafe fn at(base: *mut u8) -> SharedChunkPool<'a> {
        return SharedChunkPool {
            queue: BoundedQueue::at(base),
        };
    }

    /// Free chunks right now; advisory, for diagnostics and tests.
    pub fn len(&self) -> u32 {
        return self.queue.len();
    }

    pub fn capacity(&self) -> u32 {
        return self.queue.capacity();
    }

    fn post_not_empty(&self, count: usize) {
        for _ in 0..count {
            let _ = self.queue.not_empty().post();
        }
    }

    fn post_not_full(&self, count: usize) {
        for _ in 0..count {
            let _ = self.queue.not_full().post();
        }
    }

    /// Pop `chunks_needed(byte_size)` chunks, mark each owned by the client
    /// behind `map`, link them into a terminated stream chain and return the
    /// head. All or nothing; waits for stock until `timeout`.
    pub fn acquire_linked_chunks(
        &self,
        table: &ChunkTable,
        byte_size: usize,
        map: &ResourceMap,
        lock_id: u64,
        timeout: Duration,
    ) -> Result<ChunkIndex, Error> {
        return self.acquire_linked_chunks_counted(
            table,
            chunks_needed(byte_size),
            map,
            lock_id,
            timeout,
        );
    }

    /// Count-based variant of `acquire_linked_chunks`.
    pub fn acquire_linked_chunks_counted(
        &self,
        table: &ChunkTable,
        n_chunks: usize,
        map: &ResourceMap,
        lock_id: u64,
        timeout: Duration,
    ) -> Result<ChunkIndex, Error> {
        if n_chunks == 0 {
            return Err(Error::InvariantViolation(
                "acquire of zero chunks".to_string(),
            ));
        }
        let deadline = Instant::now() + timeout;

        loop {
            let lock = self.queue.lock();
            if !lock.lock(lock_id, deadline) {
                return Err(Error::Timeout);
            }

            if (self.queue.len() as usize) >= n_chunks {
                let head = self.queue.pop_locked().unwrap();
                map.set_chunk_flag(head);
                let mut previous = head;
                for _ in 1..n_chunks {
                    let index = self.queue.pop_locked().unwrap();
                    map.set_chunk_flag(index);
                    table.chunk(previous).set_link(index);
                    previous = index;
                }
                table.chunk(previous).terminate_link();
                // ownership bits land before the chunks become reachable
                fence(Ordering::SeqCst);
                lock.unlock();
                self.post_not_full(n_chunks);
                return Ok(head);
            }
            lock.unlock();

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout);
            }
            if !self.queue.not_empty().wait_timeout(remaining)? {
                return Err(Error::Timeout);
            }
        }
    }

    /// Walk the stream chain from `head`, clearing each ownership bit and
    /// pushing the index back. Timeout on the lock releases nothing; a full
    /// container partway through reports the unreleased sub-chain.
    pub fn release_linked_chunks(
        &self,
        table: &ChunkTable,
        head: ChunkIndex,
        map: &ResourceMap,
        lock_id: u64,
        timeout: Duration,
    ) -> Result<(), Error> {
        let deadline = Instant::now() + timeout;
        let lock = self.queue.lock();
        if !lock.lock(lock_id, deadline) {
            return Err(Error::Timeout);
        }

        let mut released = 0;
        let mut current = Some(head);
        while let Some(index) = current {
            let next = table.chunk(index).get_link();
            map.clear_chunk_flag(index);
            if !self.queue.push_locked(index) {
                // still owned, undo the clear and hand the rest back
                map.set_chunk_flag(index);
                fence(Ordering::SeqCst);
                lock.unlock();
                self.post_not_empty(released);
                return Err(Error::PartialRelease {
                    remaining_head: index,
                });
            }
            released += 1;
            current = next;
        }
        fence(Ordering::SeqCst);
        lock.unlock();
        self.post_not_empty(released);
        return Ok(());
    }

    /// Move up to `n_chunks` unlinked chunks into a private pool, marking
    /// ownership when `map` is given (clients mark, schedulers do not).
    /// Stops early when either side runs out; never waits beyond the lock.
    pub fn acquire_to_private(
        &self,
        private: &mut ChunkPool,
        n_chunks: usize,
        map: Option<&ResourceMap>,
        lock_id: u64,
        timeout: Duration,
    ) -> Result<usize, Error> {
        let deadline = Instant::now() + timeout;
        let lock = self.queue.lock();
        if !lock.lock(lock_id, deadline) {
            return Err(Error::Timeout);
        }

        let mut moved = 0;
        while moved < n_chunks && !private.is_full() {
            let index = match self.queue.pop_locked() {
                Some(index) => index,
                None => break,
            };
            if let Some(map) = map {
                map.set_chunk_flag(index);
            }
            assert!(private.push(index));
            moved += 1;
        }
        fence(Ordering::SeqCst);
        lock.unlock();
        self.post_not_full(moved);
        return Ok(moved);
    }

    /// Inverse of `acquire_to_private`.
    pub fn release_from_private(
        &self,
        private: &mut ChunkPool,
        n_chunks: usize,
        map: Option<&ResourceMap>,
        lock_id: u64,
        timeout: Duration,
    ) -> Result<usize, Error> {
        let deadline = Instant::now() + timeout;
        let lock = self.queue.lock();
        if !lock.lock(lock_id, deadline) {
            return Err(Error::Timeout);
        }

        let mut moved = 0;
        while moved < n_chunks {
            let index = match private.pop() {
                Some(index) => index,
                None => break,
            };
            if let Some(map) = map {
                map.clear_chunk_flag(index);
            }
            if !self.queue.push_locked(index) {
                if let Some(map) = map {
                    map.set_chunk_flag(index);
                }
                assert!(private.push(index));
                break;
            }
            moved += 1;
        }
        fence(Ordering::SeqCst);
        lock.unlock();
        self.post_not_empty(moved);
        return Ok(moved);
    }

    /// Crash sweep: return every chunk flagged in `map` to the free queue
    /// and clear the mask. Cost is O(chunks owned). Returns how many came
    /// back.
    pub fn release_owned_by(
        &self,
        map: &ResourceMap,
        lock_id: u64,
        timeout: Duration,
    ) -> Result<usize, Error> {
        let deadline = Instant::now() + timeout;
        let lock = self.queue.lock();
        if !lock.lock(lock_id, deadline) {
            return Err(Error::Timeout);
        }

        let mut owned = Vec::new();
        map.for_each_owned_chunk(|index| owned.push(index));
        for &index in &owned {
            map.clear_chunk_flag(index);
            if !self.queue.push_locked(index) {
                lock.unlock();
                return Err(Error::InvariantViolation(format!(
                    "free queue full while sweeping chunk {}, some chunk was double released",
                    index
                )));
            }
        }
        fence(Ordering::SeqCst);
        lock.unlock();
        self.post_not_empty(owned.len());
        return Ok(owned.len());
    }

    /// Break the pool lock if a dead process still holds it. Monitor only.
    pub fn recover_lock_held_by(&self, owner: u64) -> bool {
        return self.queue.lock().force_unlock_if_held_by(owner);
    }

    /// One non-blocking push of a single free chunk, used by queue drains.
    pub fn try_push_free(&self, index: ChunkIndex, lock_id: u64) -> bool {
        return self.queue.try_push(index, lock_id);
    }

    /// Blocking single-chunk pop; rarely used directly, the linked variants
    /// cover normal traffic.
    pub fn pop_free(&self, lock_id: u64, timeout: Duration) -> Result<ChunkIndex, Error> {
        let deadline = Instant::now() + timeout;
        return self.queue.pop(lock_id, POOL_SPIN_COUNT, deadline);
    }
}
