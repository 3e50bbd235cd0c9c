// Chunk layout. Every chunk is the same fixed size and lives in one dense
// array inside the segment, addressed by a u32 index.

// layout (per chunk)
//  0    -- uint64 handler id, which application handler owns this message
//  8    -- uint32 request size, bytes of payload actually used
// 12    -- payload, up to CHUNK_SIZE - 20 bytes
// N-8   -- uint32 stream link, next chunk of the *message* chain
// N-4   -- uint32 next link, next chunk of a *free-list/queue* chain

// The two link fields are independent; the terminator is u32::MAX because
// index zero is a valid chunk.

pub const CHUNK_SIZE: usize = 4096;

pub const CHUNK_POS_HANDLER_ID: usize = 0;
pub const CHUNK_POS_REQUEST_SIZE: usize = 8;
pub const CHUNK_POS_PAYLOAD: usize = 12;
pub const CHUNK_POS_STREAM_LINK: usize = CHUNK_SIZE - 8;
pub const CHUNK_POS_NEXT_LINK: usize = CHUNK_SIZE - 4;

pub const LINK_TERMINATOR: u32 = u32::MAX;

/// Bytes of message payload one chunk can carry.
pub const CHUNK_PAYLOAD_CAPACITY: usize = CHUNK_POS_STREAM_LINK - CHUNK_POS_PAYLOAD;

/// Sentinel for "no client bound" in a channel slot.
pub const NO_CLIENT: u32 = u32::MAX;

// Non-blocking attempts before a push/pop falls back to the lock + wait
// path. Contention is normally resolved in a handful of iterations.
pub const DEFAULT_SPIN_COUNT: u32 = 1000;

// Used by Drop paths and demos; every public operation takes its own
// timeout.
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Segment names follow `<prefix>_<name>_<sequence>`, handed to us by
/// whoever bootstraps the database or the client.
pub fn segment_name(prefix: &str, database_name: &str, sequence: u64) -> String {
    return format!("{}_{}_{}", prefix, database_name, sequence);
}

/// Name of the wake event the scheduler waits on.
pub fn scheduler_event_name(segment_name: &str, scheduler_number: u32) -> String {
    return format!("{}_scheduler_{}", segment_name, scheduler_number);
}

/// Name of the wake event a client waits on.
pub fn client_event_name(segment_name: &str, client_number: u32) -> String {
    return format!("{}_client_{}", segment_name, client_number);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_capacity_accounts_for_header_and_footer() {
        // 12 byte header, two u32 links at the tail
        assert_eq!(CHUNK_PAYLOAD_CAPACITY, CHUNK_SIZE - 12 - 8);
        assert!(CHUNK_POS_STREAM_LINK < CHUNK_POS_NEXT_LINK);
    }

    #[test]
    fn naming_convention() {
        assert_eq!(segment_name("starcounter", "mydb", 0), "starcounter_mydb_0");
        assert_eq!(scheduler_event_name("starcounter_mydb_0", 3), "starcounter_mydb_0_scheduler_3");
        assert_eq!(client_event_name("starcounter_mydb_0", 7), "starcounter_mydb_0_client_7");
    }
}
