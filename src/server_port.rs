use crate::chunk::{ChunkIndex, ChunkTable};
use crate::chunk_pool::ChunkPool;
use crate::constants::{client_event_name, scheduler_event_name, DEFAULT_SPIN_COUNT};
use crate::error::Error;
use crate::owner_id::OwnerId;
use crate::segment::Segment;
use crate::wake_event::WakeEvent;
use log::{info, warn};
use std::collections::HashMap;
use std::sync::atomic::{fence, Ordering};
use std::time::{Duration, Instant};

// Scheduler-side facade, one per scheduler thread inside the database
// process. Scans the channels bound to this scheduler, performs pending
// channel releases (only the scheduler may drain in-flight messages), pops
// requests and pushes responses. Also keeps a private chunk reserve so
// responses larger than their request do not hit the shared pool on the
// fast path.

const RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SchedulerPort {
    segment: Segment,
    scheduler_number: u32,
    owner_id: OwnerId,
    work_event: WakeEvent,
    client_events: HashMap<u32, WakeEvent>,
    private_pool: ChunkPool,
}

impl SchedulerPort {
    /// Attach scheduler `scheduler_number` to the segment. `owner_id` is
    /// the database process's registration.
    pub fn open(
        segment_name: &str,
        scheduler_number: u32,
        owner_id: OwnerId,
    ) -> Result<SchedulerPort, Error> {
        if owner_id.is_none() {
            return Err(Error::InvariantViolation(
                "cannot open without a registered owner id".to_string(),
            ));
        }
        let segment = Segment::open(segment_name)?;
        if scheduler_number >= segment.config().n_schedulers {
            return Err(Error::InvariantViolation(format!(
                "no scheduler {}",
                scheduler_number
            )));
        }
        let work_event =
            WakeEvent::open_or_create(&scheduler_event_name(segment.name(), scheduler_number))?;
        let private_capacity = segment.config().n_chunks as usize;
        return Ok(SchedulerPort {
            segment: segment,
            scheduler_number: scheduler_number,
            owner_id: owner_id,
            work_event: work_event,
            client_events: HashMap::new(),
            private_pool: ChunkPool::new(private_capacity),
        });
    }

    pub fn scheduler_number(&self) -> u32 {
        return self.scheduler_number;
    }

    fn lock_id(&self) -> u64 {
        return self.owner_id.id();
    }

    /// One pass over this scheduler's channels: reclaim anything flagged
    /// for release, then pop the first request found.
    fn scan(&mut self) -> Result<Option<(u32, ChunkIndex)>, Error> {
        let n_channels = self.segment.config().n_channels;
        for channel_number in 0..n_channels {
            let channel = self.segment.channel_table().channel(channel_number);
            if channel.scheduler_number() != self.scheduler_number {
                continue;
            }
            if !channel.is_bound() {
                continue;
            }
            if channel.is_to_be_released() {
                self.perform_release(channel_number)?;
                continue;
            }
            if let Some(request_head) = channel.in_queue().try_pop() {
                return Ok(Some((channel_number, request_head)));
            }
        }
        return Ok(None);
    }

    /// Next request on any of this scheduler's channels, or Ok(None) after
    /// a quiet `timeout`. Raises the notify flag only while actually about
    /// to sleep.
    pub fn get_next_request(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<(u32, ChunkIndex)>, Error> {
        let deadline = Instant::now() + timeout;
        if let Some(found) = self.scan()? {
            return Ok(Some(found));
        }

        self.scheduler_interface().set_notify(true);
        // the flag store must be ordered before the re-scan; the client
        // orders its push before reading the flag
        fence(Ordering::SeqCst);
        loop {
            // a client may have pushed between the scan and the flag
            if let Some(found) = self.scan()? {
                self.scheduler_interface().set_notify(false);
                return Ok(Some(found));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.scheduler_interface().set_notify(false);
                return Ok(None);
            }
            self.work_event.wait_timeout(remaining)?;
        }
    }

    /// Push `response_head` to the channel's out queue and wake the client
    /// if it asked to be woken.
    pub fn send_response(
        &mut self,
        channel_number: u32,
        response_head: ChunkIndex,
        timeout: Duration,
    ) -> Result<(), Error> {
        let deadline = Instant::now() + timeout;
        let channel = self.segment.channel_table().channel(channel_number);
        let client_number = match channel.client_number() {
            Some(number) => number,
            None => {
                return Err(Error::InvariantViolation(format!(
                    "channel {} has no client bound",
                    channel_number
                )))
            }
        };

        // the client is the only consumer; it drains, we retry until then
        while !channel.out_queue().push(response_head, DEFAULT_SPIN_COUNT) {
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        // pairs with the client's fence between raising its notify flag and
        // re-checking the out queue
        fence(Ordering::SeqCst);
        if self
            .segment
            .client_interface(client_number)
            .wants_notification()
        {
            self.client_event(client_number)?.signal()?;
        }
        return Ok(());
    }

    /// Drain both queues of a channel flagged for release, free every
    /// in-flight chain, unbind the client and requeue the channel number.
    fn perform_release(&mut self, channel_number: u32) -> Result<(), Error> {
        let channel = self.segment.channel_table().channel(channel_number);
        let client_number = match channel.client_number() {
            Some(number) => number,
            None => return Ok(()),
        };
        info!(
            "Scheduler {} reclaiming channel {} from client {}",
            self.scheduler_number, channel_number, client_number
        );

        let map = self.segment.client_interface(client_number).resource_map();
        let table = self.segment.chunk_table();
        let pool = self.segment.shared_chunk_pool();
        let drain = |head: ChunkIndex| {
            if let Err(err) =
                pool.release_linked_chunks(&table, head, &map, self.owner_id.id(), RELEASE_TIMEOUT)
            {
                warn!(
                    "Failed to free in-flight chain {} on channel {}: {}",
                    head, channel_number, err
                );
            }
        };
        while let Some(head) = channel.in_queue().try_pop() {
            drain(head);
        }
        while let Some(head) = channel.out_queue().try_pop() {
            drain(head);
        }

        channel.clear_to_be_released();
        channel.unbind_client();

        let deadline = Instant::now() + RELEASE_TIMEOUT;
        return self
            .scheduler_interface()
            .channel_number_queue()
            .push(channel_number, self.lock_id(), DEFAULT_SPIN_COUNT, deadline);
    }

    fn scheduler_interface(&self) -> crate::scheduler_interface::SchedulerInterface<'_> {
        return self
            .segment
            .scheduler_interfaces()
            .scheduler(self.scheduler_number);
    }

    fn client_event(&mut self, client_number: u32) -> Result<&WakeEvent, Error> {
        if !self.client_events.contains_key(&client_number) {
            let name = client_event_name(self.segment.name(), client_number);
            self.client_events
                .insert(client_number, WakeEvent::open_or_create(&name)?);
        }
        match self.client_events.get(&client_number) {
            Some(event) => return Ok(event),
            None => {
                return Err(Error::InvariantViolation(
                    "client event vanished from the cache".to_string(),
                ))
            }
        }
    }

    /// Top up the private reserve to `n_chunks` from the shared pool.
    /// Database-owned chunks carry no resource map marking.
    pub fn refill_private_pool(&mut self, n_chunks: usize, timeout: Duration) -> Result<usize, Error> {
        let missing = n_chunks.saturating_sub(self.private_pool.len());
        if missing == 0 {
            return Ok(0);
        }
        let pool = self.segment.shared_chunk_pool();
        return pool.acquire_to_private(
            &mut self.private_pool,
            missing,
            None,
            self.owner_id.id(),
            timeout,
        );
    }

    /// Hand the whole private reserve back to the shared pool.
    pub fn flush_private_pool(&mut self, timeout: Duration) -> Result<usize, Error> {
        let n = self.private_pool.len();
        let pool = self.segment.shared_chunk_pool();
        return pool.release_from_private(
            &mut self.private_pool,
            n,
            None,
            self.owner_id.id(),
            timeout,
        );
    }

    /// Build a response chain from the private reserve without touching the
    /// shared pool.
    pub fn acquire_linked_from_private(&mut self, byte_size: usize) -> Option<ChunkIndex> {
        let table = self.segment.chunk_table();
        return self.private_pool.acquire_linked_chunks(&table, byte_size);
    }

    pub fn chunk_table(&self) -> ChunkTable<'_> {
        return self.segment.chunk_table();
    }

    pub fn private_pool(&self) -> &ChunkPool {
        return &self.private_pool;
    }
}

impl Drop for SchedulerPort {
    fn drop(&mut self) {
        if self.private_pool.len() > 0 {
            if let Err(err) = self.flush_private_pool(RELEASE_TIMEOUT) {
                warn!(
                    "Scheduler {} failed to flush its private pool: {}",
                    self.scheduler_number, err
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegmentConfig;
    use crate::shared_interface::SharedInterface;
    use rand::Rng;

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn unique_name(prefix: &str) -> String {
        let mut rng = rand::thread_rng();
        return format!("{}_{}", prefix, rng.gen::<u32>());
    }

    fn small_config() -> SegmentConfig {
        return SegmentConfig {
            n_chunks: 64,
            n_channels: 4,
            n_schedulers: 1,
            n_clients: 2,
            channel_capacity: 8,
        };
    }

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn ping_pong_round_trip() {
        init();
        let name = unique_name("port_ping");
        let segment = Segment::create(&name, small_config()).expect("create");
        let initial_free = segment.shared_chunk_pool().len();

        let database_id = segment.issue_owner_id();
        let client_id = segment.issue_owner_id();

        // one scheduler answering one request, then reclaiming the channel
        let scheduler_name = name.clone();
        let scheduler = std::thread::spawn(move || {
            let mut port =
                SchedulerPort::open(&scheduler_name, 0, database_id).expect("open port");
            let (channel_number, request_head) = port
                .get_next_request(TIMEOUT)
                .expect("scan")
                .expect("a request");

            let chunk = port.chunk_table().chunk(request_head);
            assert_eq!(chunk.handler_id(), 7);
            assert_eq!(chunk.request_size(), 16);
            assert_eq!(&chunk.payload()[0..4], b"PING");

            // answer in place
            chunk.payload_mut()[0..4].copy_from_slice(b"PONG");
            chunk.set_request_size(4);
            port.send_response(channel_number, request_head, TIMEOUT)
                .expect("respond");

            // stay alive until the client's release request is served
            loop {
                match port.get_next_request(Duration::from_millis(50)) {
                    Ok(None) => {
                        let bound = (0..port.segment.config().n_channels).any(|i| {
                            port.segment.channel_table().channel(i).is_bound()
                        });
                        if !bound {
                            return;
                        }
                    }
                    Ok(Some(_)) => panic!("unexpected second request"),
                    Err(err) => panic!("scheduler failed: {}", err),
                }
            }
        });

        let mut client = SharedInterface::open(&name, client_id).expect("open client");
        client.acquire_client_number(TIMEOUT).expect("client number");
        let channel = client.acquire_channel(0, TIMEOUT).expect("channel");

        let head = client
            .client_acquire_linked_chunks(16, TIMEOUT)
            .expect("chunks");
        {
            let segment_view = Segment::open(&name).expect("view");
            let chunk = segment_view.chunk_table().chunk(head);
            chunk.set_handler_id(7);
            chunk.set_request_size(16);
            chunk.payload_mut()[0..4].copy_from_slice(b"PING");
        }

        let response_head = client
            .send_to_server_and_wait_response(channel, head, TIMEOUT, 10_000)
            .expect("round trip");
        assert_eq!(response_head, head);
        {
            let segment_view = Segment::open(&name).expect("view");
            let chunk = segment_view.chunk_table().chunk(response_head);
            assert_eq!(chunk.request_size(), 4);
            assert_eq!(&chunk.payload()[0..4], b"PONG");
        }

        client
            .client_release_linked_chunks(response_head, TIMEOUT)
            .expect("release chunks");
        client.release_channel(channel).expect("release channel");
        drop(client);
        scheduler.join().expect("scheduler thread");

        // back to the initial free counts
        assert_eq!(segment.shared_chunk_pool().len(), initial_free);
        assert_eq!(segment.client_number_queue().len(), 2);
        assert_eq!(
            segment
                .scheduler_interfaces()
                .scheduler(0)
                .channel_number_queue()
                .len(),
            4
        );

        WakeEvent::unlink(&scheduler_event_name(&name, 0)).expect("unlink");
        WakeEvent::unlink(&client_event_name(&name, 0)).expect("unlink");
    }

    #[test]
    fn notify_handshake_survives_zero_spin_load() {
        init();
        let name = unique_name("port_notify");
        let segment = Segment::create(&name, small_config()).expect("create");
        let database_id = segment.issue_owner_id();
        let client_id = segment.issue_owner_id();
        const ROUNDS: u32 = 200;

        let scheduler_name = name.clone();
        let scheduler = std::thread::spawn(move || {
            let mut port =
                SchedulerPort::open(&scheduler_name, 0, database_id).expect("open port");
            loop {
                match port.get_next_request(Duration::from_millis(50)) {
                    Ok(Some((channel_number, head))) => {
                        let chunk = port.chunk_table().chunk(head);
                        chunk.set_request_size(chunk.request_size() + 1);
                        port.send_response(channel_number, head, TIMEOUT)
                            .expect("respond");
                    }
                    Ok(None) => {
                        let bound = (0..port.segment.config().n_channels)
                            .any(|i| port.segment.channel_table().channel(i).is_bound());
                        if !bound {
                            return;
                        }
                    }
                    Err(err) => panic!("scheduler failed: {}", err),
                }
            }
        });

        let mut client = SharedInterface::open(&name, client_id).expect("open client");
        client.acquire_client_number(TIMEOUT).expect("client number");
        let channel = client.acquire_channel(0, TIMEOUT).expect("channel");
        let head = client
            .client_acquire_linked_chunks(16, TIMEOUT)
            .expect("chunks");

        // zero spins: every round goes flag -> recheck -> sleep on the event
        let view = Segment::open(&name).expect("view");
        for i in 0..ROUNDS {
            view.chunk_table().chunk(head).set_request_size(i);
            let response_head = client
                .send_to_server_and_wait_response(channel, head, TIMEOUT, 0)
                .expect("round trip");
            assert_eq!(response_head, head);
            assert_eq!(view.chunk_table().chunk(response_head).request_size(), i + 1);
        }

        client
            .client_release_linked_chunks(head, TIMEOUT)
            .expect("release chunks");
        client.release_channel(channel).expect("release channel");
        drop(client);
        scheduler.join().expect("scheduler thread");

        assert_eq!(segment.shared_chunk_pool().len(), 64);
        assert_eq!(segment.client_number_queue().len(), 2);

        WakeEvent::unlink(&scheduler_event_name(&name, 0)).expect("unlink");
        WakeEvent::unlink(&client_event_name(&name, 0)).expect("unlink");
    }

    #[test]
    fn pending_release_frees_in_flight_chunks() {
        init();
        let name = unique_name("port_release");
        let segment = Segment::create(&name, small_config()).expect("create");
        let database_id = segment.issue_owner_id();
        let client_id = segment.issue_owner_id();

        let mut client = SharedInterface::open(&name, client_id).expect("open client");
        client.acquire_client_number(TIMEOUT).expect("client number");
        let channel = client.acquire_channel(0, TIMEOUT).expect("channel");

        // leave a request in flight, then ask for release
        let head = client
            .client_acquire_linked_chunks(16, TIMEOUT)
            .expect("chunks");
        {
            let view = Segment::open(&name).expect("view");
            assert!(view.channel_table().channel(channel).in_queue().try_push(head));
        }
        client.release_channel(channel).expect("request release");

        let mut port = SchedulerPort::open(&name, 0, database_id).expect("open port");
        assert!(port.get_next_request(Duration::from_millis(200)).expect("scan").is_none());

        // the drain freed the chain and unbound the channel
        assert_eq!(segment.shared_chunk_pool().len(), 64);
        assert!(!segment.channel_table().channel(channel).is_bound());
        assert_eq!(
            segment
                .scheduler_interfaces()
                .scheduler(0)
                .channel_number_queue()
                .len(),
            4
        );

        client.release_client_number(TIMEOUT).expect("release number");
        WakeEvent::unlink(&scheduler_event_name(&name, 0)).expect("unlink");
        WakeEvent::unlink(&client_event_name(&name, 0)).expect("unlink");
    }

    #[test]
    fn private_pool_refill_and_flush() {
        init();
        let name = unique_name("port_private");
        let segment = Segment::create(&name, small_config()).expect("create");
        let database_id = segment.issue_owner_id();

        let mut port = SchedulerPort::open(&name, 0, database_id).expect("open port");
        assert_eq!(port.refill_private_pool(8, TIMEOUT).expect("refill"), 8);
        assert_eq!(segment.shared_chunk_pool().len(), 64 - 8);

        let head = port.acquire_linked_from_private(16).expect("from private");
        assert!(port.chunk_table().chunk(head).is_terminated());
        assert_eq!(port.private_pool().len(), 7);

        // give the chain back to the private pool, then flush everything
        assert!(port.private_pool.push(head));
        assert_eq!(port.flush_private_pool(TIMEOUT).expect("flush"), 8);
        assert_eq!(segment.shared_chunk_pool().len(), 64);

        WakeEvent::unlink(&scheduler_event_name(&name, 0)).expect("unlink");
    }
}
