use crate::bounded_queue::BoundedQueue;
use crate::channel::{Channel, ChannelTable};
use crate::chunk::ChunkTable;
use crate::client_interface::{ClientInterface, ClientInterfaceTable};
use crate::error::Error;
use crate::owner_id::OwnerId;
use crate::scheduler_interface::{SchedulerInterface, SchedulerInterfaceTable};
use crate::shared_chunk_pool::SharedChunkPool;
use crate::shm_segment::ShmSegment;
use log::info;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

// Segment layout. One named shared memory region per database instance; a
// small header with a linear table of named blocks locates every fixed-size
// table. All capacities come from the config the creator passes in, stored
// in the header so openers need nothing but the name.

// layout (header)
//  0   -- uint64 magic
//  8   -- uint32 version
// 12   -- uint32 block count
// 16   -- uint32 n_chunks
// 20   -- uint32 n_channels
// 24   -- uint32 n_schedulers
// 28   -- uint32 n_clients
// 32   -- uint32 channel queue capacity
// 36   -- uint8[4] padding
// 40   -- block table, 8 entries x (char[16] name, uint64 offset, uint64 len)
// 296  -- padding up to 512, blocks start here, each 64 aligned

const MAGIC: u64 = 0x5343_4348_554e_4b53; // "SCCHUNKS"
const VERSION: u32 = 1;

const POS_MAGIC: usize = 0;
const POS_VERSION: usize = 8;
const POS_N_BLOCKS: usize = 12;
const POS_CONFIG: usize = 16;
const POS_BLOCK_TABLE: usize = 40;

const MAX_BLOCKS: usize = 8;
const BLOCK_NAME_LEN: usize = 16;
const BLOCK_ENTRY_SIZE: usize = BLOCK_NAME_LEN + 16;
const HEADER_SIZE: usize = 512;

const BLOCK_CHUNKS: &str = "chunks";
const BLOCK_CHUNK_POOL: &str = "chunk_pool";
const BLOCK_CHANNELS: &str = "channels";
const BLOCK_SCHEDULERS: &str = "schedulers";
const BLOCK_CLIENTS: &str = "clients";
const BLOCK_CLIENT_NUMBERS: &str = "client_numbers";
const BLOCK_COMMON: &str = "common";

// common block
//  0   -- uint32 database state (0 normal, 1 graceful, 2 unexpected)
//  4   -- uint8[4] padding
//  8   -- uint64 next owner id
const COMMON_POS_STATE: usize = 0;
const COMMON_POS_NEXT_OWNER_ID: usize = 8;
const COMMON_SIZE: usize = 16;

fn align_up(value: usize, alignment: usize) -> usize {
    return (value + alignment - 1) & !(alignment - 1);
}

/// Capacities of one segment, fixed for its whole life.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentConfig {
    pub n_chunks: u32,
    pub n_channels: u32,
    pub n_schedulers: u32,
    pub n_clients: u32,
    /// Per-direction channel queue capacity, a power of two.
    pub channel_capacity: u32,
}

impl SegmentConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.n_chunks == 0
            || self.n_channels == 0
            || self.n_schedulers == 0
            || self.n_clients == 0
        {
            return Err(Error::InvariantViolation(
                "segment capacities must be non-zero".to_string(),
            ));
        }
        if !self.channel_capacity.is_power_of_two() {
            return Err(Error::InvariantViolation(format!(
                "channel capacity {} is not a power of two",
                self.channel_capacity
            )));
        }
        if self.n_chunks == u32::MAX || self.n_channels == u32::MAX || self.n_clients == u32::MAX {
            // u32::MAX doubles as the link/client sentinel
            return Err(Error::InvariantViolation(
                "capacity collides with the sentinel value".to_string(),
            ));
        }
        return Ok(());
    }
}

/// How the monitor currently judges the database process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DatabaseState {
    Normal,
    TerminatedGracefully,
    TerminatedUnexpectedly,
}

impl DatabaseState {
    fn to_raw(self) -> u32 {
        match self {
            DatabaseState::Normal => return 0,
            DatabaseState::TerminatedGracefully => return 1,
            DatabaseState::TerminatedUnexpectedly => return 2,
        }
    }

    fn from_raw(raw: u32) -> Option<DatabaseState> {
        match raw {
            0 => return Some(DatabaseState::Normal),
            1 => return Some(DatabaseState::TerminatedGracefully),
            2 => return Some(DatabaseState::TerminatedUnexpectedly),
            _ => return None,
        }
    }
}

struct BlockLayout {
    name: &'static str,
    offset: usize,
    len: usize,
}

fn compute_layout(config: &SegmentConfig) -> (Vec<BlockLayout>, usize) {
    let mut blocks = Vec::new();
    let mut position = HEADER_SIZE;
    let mut add = |name: &'static str, len: usize| {
        let offset = align_up(position, 64);
        position = offset + len;
        blocks.push(BlockLayout {
            name: name,
            offset: offset,
            len: len,
        });
    };

    add(BLOCK_CHUNKS, ChunkTable::size_in_bytes(config.n_chunks));
    add(
        BLOCK_CHUNK_POOL,
        SharedChunkPool::size_in_bytes(config.n_chunks),
    );
    add(
        BLOCK_CHANNELS,
        ChannelTable::size_in_bytes(config.n_channels, config.channel_capacity),
    );
    add(
        BLOCK_SCHEDULERS,
        SchedulerInterfaceTable::size_in_bytes(config.n_schedulers, config.n_channels),
    );
    add(
        BLOCK_CLIENTS,
        ClientInterfaceTable::size_in_bytes(config.n_clients, config.n_chunks, config.n_channels),
    );
    add(
        BLOCK_CLIENT_NUMBERS,
        BoundedQueue::size_in_bytes(config.n_clients),
    );
    add(BLOCK_COMMON, COMMON_SIZE);

    let total = align_up(position, 4096);
    return (blocks, total);
}

/// An attached chunk/channel segment: the mapping plus resolved block
/// offsets. Both the creating database process and opening clients hold one
/// of these; every other type in the crate is a view into it.
pub struct Segment {
    shm: ShmSegment,
    config: SegmentConfig,
    chunks_offset: usize,
    chunk_pool_offset: usize,
    channels_offset: usize,
    schedulers_offset: usize,
    clients_offset: usize,
    client_numbers_offset: usize,
    common_offset: usize,
}

impl Segment {
    /// Create and fully initialize a segment: all chunks free, channel
    /// numbers dealt round-robin to the schedulers, all client numbers
    /// available.
    pub fn create(name: &str, config: SegmentConfig) -> Result<Segment, Error> {
        config.validate()?;
        let (blocks, total) = compute_layout(&config);
        assert!(blocks.len() <= MAX_BLOCKS);

        let shm = ShmSegment::create(name, total)?;
        info!(
            "Creating segment {} ({} bytes, {} chunks, {} channels, {} schedulers, {} clients)",
            name, total, config.n_chunks, config.n_channels, config.n_schedulers, config.n_clients
        );

        shm.write_u32_at(POS_VERSION, VERSION);
        shm.write_u32_at(POS_N_BLOCKS, blocks.len() as u32);
        shm.write_u32_at(POS_CONFIG, config.n_chunks);
        shm.write_u32_at(POS_CONFIG + 4, config.n_channels);
        shm.write_u32_at(POS_CONFIG + 8, config.n_schedulers);
        shm.write_u32_at(POS_CONFIG + 12, config.n_clients);
        shm.write_u32_at(POS_CONFIG + 16, config.channel_capacity);
        for (i, block) in blocks.iter().enumerate() {
            let entry = POS_BLOCK_TABLE + i * BLOCK_ENTRY_SIZE;
            let mut name_bytes = [0u8; BLOCK_NAME_LEN];
            name_bytes[..block.name.len()].copy_from_slice(block.name.as_bytes());
            shm.write_bytes_at(entry, &name_bytes);
            shm.write_u64_at(entry + BLOCK_NAME_LEN, block.offset as u64);
            shm.write_u64_at(entry + BLOCK_NAME_LEN + 8, block.len as u64);
        }

        let segment = Segment::resolve(shm, config)?;

        // chunk pool starts holding every chunk
        unsafe {
            SharedChunkPool::init_at(segment.ptr(segment.chunk_pool_offset), config.n_chunks)?;
        }

        // channel slots, numbers dealt round-robin across schedulers
        for number in 0..config.n_channels {
            let scheduler_number = number % config.n_schedulers;
            let stride = Channel::size_in_bytes(config.channel_capacity);
            unsafe {
                Channel::init_at(
                    segment.ptr(segment.channels_offset + number as usize * stride),
                    config.channel_capacity,
                    scheduler_number,
                );
            }
        }

        // scheduler slots plus their share of the channel numbers
        for scheduler_number in 0..config.n_schedulers {
            let stride = SchedulerInterface::size_in_bytes(config.n_channels);
            let iface = unsafe {
                SchedulerInterface::init_at(
                    segment.ptr(segment.schedulers_offset + scheduler_number as usize * stride),
                    config.n_channels,
                )?
            };
            let queue = iface.channel_number_queue();
            for number in 0..config.n_channels {
                if number % config.n_schedulers == scheduler_number {
                    assert!(queue.push_locked(number));
                }
            }
        }

        // client slots are valid all-zero; the number pool starts full
        let client_numbers = unsafe {
            BoundedQueue::init_at(segment.ptr(segment.client_numbers_offset), config.n_clients)?
        };
        for number in 0..config.n_clients {
            assert!(client_numbers.push_locked(number));
        }

        segment.next_owner_word().store(1, Ordering::Relaxed);
        segment
            .state_word()
            .store(DatabaseState::Normal.to_raw(), Ordering::Relaxed);

        // magic written last, an opener that raced creation sees garbage
        // magic and fails cleanly
        shm_write_magic(&segment.shm);
        return Ok(segment);
    }

    /// Attach to an existing segment by name.
    pub fn open(name: &str) -> Result<Segment, Error> {
        let shm = ShmSegment::open(name)?;
        if shm.len() < HEADER_SIZE {
            return Err(Error::InvariantViolation(format!(
                "segment {} is too small to hold a header",
                name
            )));
        }
        if shm.read_u64_at(POS_MAGIC) != MAGIC {
            return Err(Error::InvariantViolation(format!(
                "segment {} has a bad magic number",
                name
            )));
        }
        let version = shm.read_u32_at(POS_VERSION);
        if version != VERSION {
            return Err(Error::InvariantViolation(format!(
                "segment {} is version {}, this build understands {}",
                name, version, VERSION
            )));
        }
        let config = SegmentConfig {
            n_chunks: shm.read_u32_at(POS_CONFIG),
            n_channels: shm.read_u32_at(POS_CONFIG + 4),
            n_schedulers: shm.read_u32_at(POS_CONFIG + 8),
            n_clients: shm.read_u32_at(POS_CONFIG + 12),
            channel_capacity: shm.read_u32_at(POS_CONFIG + 16),
        };
        config.validate()?;
        return Segment::resolve(shm, config);
    }

    fn resolve(shm: ShmSegment, config: SegmentConfig) -> Result<Segment, Error> {
        let find = |name: &str| -> Result<usize, Error> {
            // creation writes the table before this runs in either process
            let n_blocks = shm.read_u32_at(POS_N_BLOCKS) as usize;
            for i in 0..n_blocks.min(MAX_BLOCKS) {
                let entry = POS_BLOCK_TABLE + i * BLOCK_ENTRY_SIZE;
                let stored = shm.read_bytes_at(entry, BLOCK_NAME_LEN);
                let end = stored.iter().position(|&b| b == 0).unwrap_or(BLOCK_NAME_LEN);
                if &stored[..end] == name.as_bytes() {
                    return Ok(shm.read_u64_at(entry + BLOCK_NAME_LEN) as usize);
                }
            }
            return Err(Error::InvariantViolation(format!(
                "segment has no block named {:?}",
                name
            )));
        };

        let chunks_offset = find(BLOCK_CHUNKS)?;
        let chunk_pool_offset = find(BLOCK_CHUNK_POOL)?;
        let channels_offset = find(BLOCK_CHANNELS)?;
        let schedulers_offset = find(BLOCK_SCHEDULERS)?;
        let clients_offset = find(BLOCK_CLIENTS)?;
        let client_numbers_offset = find(BLOCK_CLIENT_NUMBERS)?;
        let common_offset = find(BLOCK_COMMON)?;

        return Ok(Segment {
            shm: shm,
            config: config,
            chunks_offset: chunks_offset,
            chunk_pool_offset: chunk_pool_offset,
            channels_offset: channels_offset,
            schedulers_offset: schedulers_offset,
            clients_offset: clients_offset,
            client_numbers_offset: client_numbers_offset,
            common_offset: common_offset,
        });
    }

    fn ptr(&self, offset: usize) -> *mut u8 {
        return self.shm.ptr_to(offset);
    }

    pub fn name(&self) -> &str {
        return self.shm.name();
    }

    pub fn config(&self) -> &SegmentConfig {
        return &self.config;
    }

    pub fn chunk_table(&self) -> ChunkTable<'_> {
        return unsafe { ChunkTable::at(self.ptr(self.chunks_offset), self.config.n_chunks) };
    }

    pub fn shared_chunk_pool(&self) -> SharedChunkPool<'_> {
        return unsafe { SharedChunkPool::at(self.ptr(self.chunk_pool_offset)) };
    }

    pub fn channel_table(&self) -> ChannelTable<'_> {
        return unsafe {
            ChannelTable::at(
                self.ptr(self.channels_offset),
                self.config.n_channels,
                self.config.channel_capacity,
            )
        };
    }

    pub fn scheduler_interfaces(&self) -> SchedulerInterfaceTable<'_> {
        return unsafe {
            SchedulerInterfaceTable::at(
                self.ptr(self.schedulers_offset),
                self.config.n_schedulers,
                self.config.n_channels,
            )
        };
    }

    pub fn client_interfaces(&self) -> ClientInterfaceTable<'_> {
        return unsafe {
            ClientInterfaceTable::at(
                self.ptr(self.clients_offset),
                self.config.n_clients,
                self.config.n_chunks,
                self.config.n_channels,
            )
        };
    }

    pub fn client_interface(&self, number: u32) -> ClientInterface<'_> {
        return self.client_interfaces().client(number);
    }

    pub fn client_number_queue(&self) -> BoundedQueue<'_> {
        return unsafe { BoundedQueue::at(self.ptr(self.client_numbers_offset)) };
    }

    fn state_word(&self) -> &AtomicU32 {
        return unsafe { &*(self.ptr(self.common_offset + COMMON_POS_STATE) as *const AtomicU32) };
    }

    fn next_owner_word(&self) -> &AtomicU64 {
        return unsafe {
            &*(self.ptr(self.common_offset + COMMON_POS_NEXT_OWNER_ID) as *const AtomicU64)
        };
    }

    pub fn database_state(&self) -> Result<DatabaseState, Error> {
        match DatabaseState::from_raw(self.state_word().load(Ordering::Acquire)) {
            Some(state) => return Ok(state),
            None => return Err(Error::DatabaseStateUnknown),
        }
    }

    pub fn set_database_state(&self, state: DatabaseState) {
        self.state_word().store(state.to_raw(), Ordering::Release);
    }

    /// Monotonic owner id issue; never recycled while the segment lives.
    pub fn issue_owner_id(&self) -> OwnerId {
        let id = self.next_owner_word().fetch_add(1, Ordering::AcqRel);
        return OwnerId::new(id);
    }
}

fn shm_write_magic(shm: &ShmSegment) {
    shm.write_u64_at(POS_MAGIC, MAGIC);
}
