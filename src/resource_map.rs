use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

// Per-client ownership record: one bit per chunk index, one bit per channel
// index, and for each owned channel the scheduler number it came from
// (releasing a channel must return the number to the right scheduler's free
// queue). Bit i set iff this client owns resource i. The owning client sets
// bits; the scheduler/monitor clears them during release and crash sweep.
// Reclaiming costs O(owned), not O(total), which is the whole point.

// layout
//  0                      uint64[chunk_words] chunk mask
//  8*chunk_words          uint64[channel_words] channel mask
//  8*(chunk+channel words) uint8[n_channels] channel -> scheduler number

fn words_for(bits: u32) -> usize {
    return ((bits as usize) + 63) / 64;
}

pub struct ResourceMap<'a> {
    base: *mut u8,
    n_chunks: u32,
    n_channels: u32,
    _segment: PhantomData<&'a ()>,
}

unsafe impl<'a> Send for ResourceMap<'a> {}

impl<'a> ResourceMap<'a> {
    pub fn size_in_bytes(n_chunks: u32, n_channels: u32) -> usize {
        let bytes = 8 * (words_for(n_chunks) + words_for(n_channels)) + n_channels as usize;
        return (bytes + 7) & !7;
    }

    /// Safety: `base` must point at `size_in_bytes(..)` zeroed, 8-aligned
    /// bytes of shared mapping.
    pub unsafe fn at(base: *mut u8, n_chunks: u32, n_channels: u32) -> ResourceMap<'a> {
        return ResourceMap {
            base: base,
            n_chunks: n_chunks,
            n_channels: n_channels,
            _segment: PhantomData,
        };
    }

    fn chunk_word(&self, word: usize) -> &AtomicU64 {
        assert!(word < words_for(self.n_chunks));
        return unsafe { &*(self.base.add(word * 8) as *const AtomicU64) };
    }

    fn channel_word(&self, word: usize) -> &AtomicU64 {
        assert!(word < words_for(self.n_channels));
        let offset = 8 * words_for(self.n_chunks) + word * 8;
        return unsafe { &*(self.base.add(offset) as *const AtomicU64) };
    }

    fn scheduler_byte(&self, channel: u32) -> &AtomicU8 {
        assert!(channel < self.n_channels);
        let offset =
            8 * (words_for(self.n_chunks) + words_for(self.n_channels)) + channel as usize;
        return unsafe { &*(self.base.add(offset) as *const AtomicU8) };
    }

    pub fn set_chunk_flag(&self, chunk: u32) {
        assert!(chunk < self.n_chunks);
        self.chunk_word(chunk as usize / 64)
            .fetch_or(1 << (chunk % 64), Ordering::SeqCst);
    }

    pub fn clear_chunk_flag(&self, chunk: u32) {
        assert!(chunk < self.n_chunks);
        self.chunk_word(chunk as usize / 64)
            .fetch_and(!(1 << (chunk % 64)), Ordering::SeqCst);
    }

    pub fn owns_chunk(&self, chunk: u32) -> bool {
        assert!(chunk < self.n_chunks);
        let word = self.chunk_word(chunk as usize / 64).load(Ordering::SeqCst);
        return word & (1 << (chunk % 64)) != 0;
    }

    pub fn set_channel_flag(&self, channel: u32, scheduler_number: u8) {
        assert!(channel < self.n_channels);
        self.scheduler_byte(channel)
            .store(scheduler_number, Ordering::SeqCst);
        self.channel_word(channel as usize / 64)
            .fetch_or(1 << (channel % 64), Ordering::SeqCst);
    }

    pub fn clear_channel_flag(&self, channel: u32) {
        assert!(channel < self.n_channels);
        self.channel_word(channel as usize / 64)
            .fetch_and(!(1 << (channel % 64)), Ordering::SeqCst);
    }

    pub fn owns_channel(&self, channel: u32) -> bool {
        assert!(channel < self.n_channels);
        let word = self.channel_word(channel as usize / 64).load(Ordering::SeqCst);
        return word & (1 << (channel % 64)) != 0;
    }

    pub fn channel_scheduler(&self, channel: u32) -> u8 {
        return self.scheduler_byte(channel).load(Ordering::SeqCst);
    }

    /// Visit every owned chunk index without clearing anything.
    pub fn for_each_owned_chunk<F: FnMut(u32)>(&self, mut f: F) {
        for word_index in 0..words_for(self.n_chunks) {
            let mut mask = self.chunk_word(word_index).load(Ordering::SeqCst);
            while mask != 0 {
                let bit = mask.trailing_zeros();
                f(word_index as u32 * 64 + bit);
                mask &= mask - 1;
            }
        }
    }

    pub fn owned_channels(&self) -> Vec<u32> {
        let mut channels = Vec::new();
        for word_index in 0..words_for(self.n_channels) {
            let mut mask = self.channel_word(word_index).load(Ordering::SeqCst);
            while mask != 0 {
                let bit = mask.trailing_zeros();
                channels.push(word_index as u32 * 64 + bit);
                mask &= mask - 1;
            }
        }
        return channels;
    }

    pub fn count_owned_chunks(&self) -> usize {
        let mut n = 0;
        self.for_each_owned_chunk(|_| n += 1);
        return n;
    }

    pub fn clear_all(&self) {
        for word_index in 0..words_for(self.n_chunks) {
            self.chunk_word(word_index).store(0, Ordering::SeqCst);
        }
        for word_index in 0..words_for(self.n_channels) {
            self.channel_word(word_index).store(0, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(n_chunks: u32, n_channels: u32) -> (Vec<u64>, ResourceMap<'static>) {
        let mut backing = vec![0u64; ResourceMap::size_in_bytes(n_chunks, n_channels) / 8];
        let base = backing.as_mut_ptr() as *mut u8;
        let map = unsafe { ResourceMap::at(base, n_chunks, n_channels) };
        return (backing, map);
    }

    #[test]
    fn chunk_bits_round_trip() {
        let (_backing, m) = map(200, 8);
        for i in [0u32, 63, 64, 65, 199] {
            assert!(!m.owns_chunk(i));
            m.set_chunk_flag(i);
            assert!(m.owns_chunk(i));
        }
        m.clear_chunk_flag(64);
        assert!(!m.owns_chunk(64));
        assert!(m.owns_chunk(63));
        assert!(m.owns_chunk(65));
    }

    #[test]
    fn channel_bits_record_the_scheduler() {
        let (_backing, m) = map(8, 8);
        m.set_channel_flag(2, 5);
        assert!(m.owns_channel(2));
        assert!(!m.owns_channel(3));
        assert_eq!(m.channel_scheduler(2), 5);
        assert_eq!(m.owned_channels(), vec![2]);
        m.clear_channel_flag(2);
        assert!(!m.owns_channel(2));
    }

    #[test]
    fn owned_chunk_iteration_is_exact() {
        let (_backing, m) = map(300, 8);
        let owned = [3u32, 7, 9, 64, 128, 299];
        for &i in &owned {
            m.set_chunk_flag(i);
        }
        let mut seen = Vec::new();
        m.for_each_owned_chunk(|i| seen.push(i));
        assert_eq!(seen, owned);
        assert_eq!(m.count_owned_chunks(), owned.len());
    }

    #[test]
    fn clear_all_wipes_both_masks() {
        let (_backing, m) = map(100, 10);
        m.set_chunk_flag(50);
        m.set_channel_flag(9, 1);
        m.clear_all();
        assert_eq!(m.count_owned_chunks(), 0);
        assert!(m.owned_channels().is_empty());
    }
}
