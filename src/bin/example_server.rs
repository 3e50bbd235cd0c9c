use log::info;
use shm_channels::{DatabaseState, MonitorInterface, SchedulerPort, Segment, SegmentConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

// Creates a segment, registers as the database and answers every request
// with "PONG" in place until ctrl-c.

fn main() {
    env_logger::init();
    let name = std::env::args().nth(1).unwrap_or("demo".to_string());

    let config = SegmentConfig {
        n_chunks: 1024,
        n_channels: 32,
        n_schedulers: 1,
        n_clients: 16,
        channel_capacity: 64,
    };
    let segment = Segment::create(&name, config).expect("Create segment");
    info!("Created segment {}", segment.name());

    let mut monitor = MonitorInterface::open(&name).expect("Open monitor");
    let owner_id = monitor
        .register_process(std::process::id(), Duration::from_secs(1))
        .expect("Register");

    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    ctrlc::set_handler(move || {
        flag.store(false, Ordering::SeqCst);
    })
    .expect("Install ctrl-c handler");

    let mut port = SchedulerPort::open(&name, 0, owner_id).expect("Open scheduler port");
    while running.load(Ordering::SeqCst) {
        let (channel, request_head) = match port
            .get_next_request(Duration::from_millis(500))
            .expect("Scan channels")
        {
            Some(found) => found,
            None => continue,
        };

        let chunk = port.chunk_table().chunk(request_head);
        info!(
            "Request on channel {}: handler {}, {} bytes",
            channel,
            chunk.handler_id(),
            chunk.request_size()
        );
        chunk.payload_mut()[0..4].copy_from_slice(b"PONG");
        chunk.set_request_size(4);
        port.send_response(channel, request_head, Duration::from_secs(1))
            .expect("Respond");
    }

    monitor
        .set_database_state(DatabaseState::TerminatedGracefully)
        .expect("Publish state");
    info!("Done");
}
