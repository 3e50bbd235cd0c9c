use log::info;
use shm_channels::{MonitorInterface, SharedInterface};
use std::time::Duration;

// Sends one "PING" to a running example_server and prints the response.

fn main() {
    env_logger::init();
    let name = std::env::args().nth(1).unwrap_or("demo".to_string());
    let timeout = Duration::from_secs(5);

    let mut monitor = MonitorInterface::open(&name).expect("Open monitor");
    let owner_id = monitor
        .register_process(std::process::id(), timeout)
        .expect("Register");

    let mut client = SharedInterface::open(&name, owner_id).expect("Open segment");
    client.acquire_client_number(timeout).expect("Client number");
    let channel = client.acquire_channel(0, timeout).expect("Channel");

    let request = b"PING";
    let head = client
        .client_acquire_linked_chunks(request.len(), timeout)
        .expect("Chunks");
    {
        let segment = shm_channels::Segment::open(&name).expect("Map segment");
        let chunk = segment.chunk_table().chunk(head);
        chunk.set_handler_id(1);
        chunk.set_request_size(request.len() as u32);
        chunk.payload_mut()[0..request.len()].copy_from_slice(request);
    }

    let response_head = client
        .send_to_server_and_wait_response(channel, head, timeout, 10_000)
        .expect("Round trip");
    {
        let segment = shm_channels::Segment::open(&name).expect("Map segment");
        let chunk = segment.chunk_table().chunk(response_head);
        let size = chunk.request_size() as usize;
        info!(
            "Response: {}",
            String::from_utf8_lossy(&chunk.payload()[0..size])
        );
    }

    client
        .client_release_linked_chunks(response_head, timeout)
        .expect("Release chunks");
    client.release_channel(channel).expect("Release channel");
    // hands the client number back
    drop(client);

    monitor
        .unregister_process(std::process::id(), owner_id, timeout)
        .expect("Unregister");
}
