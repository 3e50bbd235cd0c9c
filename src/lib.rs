mod atomic_buffer;
mod bounded_queue;
mod channel;
mod chunk;
mod chunk_pool;
mod client_interface;
pub mod constants;
mod error;
mod monitor_interface;
mod owner_id;
mod resource_map;
mod scheduler_interface;
mod segment;
mod server_port;
mod shared_chunk_pool;
mod shared_interface;
mod shm_segment;
mod spin_lock;
mod wake_event;

pub use crate::chunk::{chunks_needed, Chunk, ChunkIndex, ChunkTable};
pub use crate::chunk_pool::ChunkPool;
pub use crate::error::Error;
pub use crate::monitor_interface::MonitorInterface;
pub use crate::owner_id::OwnerId;
pub use crate::segment::{DatabaseState, Segment, SegmentConfig};
pub use crate::server_port::SchedulerPort;
pub use crate::shared_interface::SharedInterface;
pub use crate::wake_event::WakeEvent;
