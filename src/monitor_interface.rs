use crate::constants::{client_event_name, scheduler_event_name, DEFAULT_SPIN_COUNT};
use crate::error::Error;
use crate::owner_id::OwnerId;
use crate::segment::{DatabaseState, Segment};
use crate::wake_event::WakeEvent;
use log::{info, warn};
use std::collections::HashMap;
use std::sync::atomic::{fence, Ordering};
use std::time::{Duration, Instant};

// The monitor boundary: issues owner ids, records which process carries
// which id, flips the shared database state, and sweeps everything a dead
// client still owned. The sweep order matters: channels must be reclaimed
// by their schedulers (only a scheduler may drain in-flight chains) before
// the chunk bitmask is swept, and the client number comes back last so the
// slot is never reused while its resources are in limbo.

pub struct MonitorInterface {
    segment: Segment,
    monitor_id: OwnerId,
    registered: HashMap<u64, u32>,
}

impl MonitorInterface {
    pub fn open(segment_name: &str) -> Result<MonitorInterface, Error> {
        let segment = Segment::open(segment_name)?;
        let monitor_id = segment.issue_owner_id();
        return Ok(MonitorInterface {
            segment: segment,
            monitor_id: monitor_id,
            registered: HashMap::new(),
        });
    }

    /// Hand out a fresh owner id for `pid`. Ids are monotonic and never
    /// recycled, so a stale id found in a lock word or client slot always
    /// identifies exactly one past process.
    pub fn register_process(&mut self, pid: u32, _timeout: Duration) -> Result<OwnerId, Error> {
        let owner_id = self.segment.issue_owner_id();
        self.registered.insert(owner_id.id(), pid);
        info!("Registered process {} as {:?}", pid, owner_id);
        return Ok(owner_id);
    }

    /// Graceful goodbye. A well-behaved process released everything before
    /// calling this; anything still held is swept as if it had crashed.
    pub fn unregister_process(
        &mut self,
        pid: u32,
        owner_id: OwnerId,
        timeout: Duration,
    ) -> Result<(), Error> {
        self.registered.remove(&owner_id.id());
        let leaked = self.release_dead_client_resources(owner_id, timeout)?;
        if leaked != 0 {
            warn!(
                "Process {} ({:?}) unregistered with {} chunks still owned",
                pid, owner_id, leaked
            );
        } else {
            info!("Unregistered process {} ({:?})", pid, owner_id);
        }
        return Ok(());
    }

    pub fn database_state(&self) -> Result<DatabaseState, Error> {
        return self.segment.database_state();
    }

    /// Publish the database state and wake every sleeping party so their
    /// retry loops observe it instead of running out the clock.
    pub fn set_database_state(&self, state: DatabaseState) -> Result<(), Error> {
        self.segment.set_database_state(state);
        if state == DatabaseState::Normal {
            return Ok(());
        }
        for scheduler_number in 0..self.segment.config().n_schedulers {
            let name = scheduler_event_name(self.segment.name(), scheduler_number);
            WakeEvent::open_or_create(&name)?.signal()?;
        }
        for client_number in 0..self.segment.config().n_clients {
            let interface = self.segment.client_interface(client_number);
            if interface.owner_id().is_none() {
                continue;
            }
            let name = client_event_name(self.segment.name(), client_number);
            WakeEvent::open_or_create(&name)?.signal()?;
        }
        return Ok(());
    }

    /// Crash sweep for one dead owner. Returns how many chunks came back.
    ///
    /// Order: break any queue lock the process died holding, then for every
    /// client slot the owner id matches: flag its channels for release and
    /// wait until the schedulers have actually unbound them (they drain the
    /// in-flight chains first), then sweep the chunk bitmask, then requeue
    /// the client number. The cleanup flag stays on the slot's owner word
    /// while the sweep runs so a half-swept slot is recognizable.
    pub fn release_dead_client_resources(
        &mut self,
        owner_id: OwnerId,
        timeout: Duration,
    ) -> Result<usize, Error> {
        if owner_id.is_none() {
            return Err(Error::InvariantViolation(
                "cannot sweep the null owner".to_string(),
            ));
        }
        let deadline = Instant::now() + timeout;
        self.recover_locks_held_by(owner_id);

        let mut total_swept = 0;
        for client_number in 0..self.segment.config().n_clients {
            let interface = self.segment.client_interface(client_number);
            let slot_owner = interface.owner_id();
            if slot_owner.is_none() || slot_owner.id() != owner_id.id() {
                continue;
            }
            interface.set_owner_id(owner_id.with_cleanup_flag());
            let map = interface.resource_map();

            // channels first: only the owning scheduler may drain them
            let channels = map.owned_channels();
            for &channel_number in &channels {
                let channel = self.segment.channel_table().channel(channel_number);
                channel.set_to_be_released();
                self.wake_scheduler(channel.scheduler_number())?;
            }
            for &channel_number in &channels {
                let channel = self.segment.channel_table().channel(channel_number);
                while channel.is_bound() {
                    if Instant::now() >= deadline {
                        return Err(Error::Timeout);
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                map.clear_channel_flag(channel_number);
                interface.decrement_allocated_channels();
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let swept = self.segment.shared_chunk_pool().release_owned_by(
                &map,
                self.monitor_id.id(),
                remaining,
            )?;
            total_swept += swept;

            interface.set_notify(false);
            interface.set_owner_id(OwnerId::none());
            let requeue_deadline = Instant::now() + Duration::from_secs(1);
            self.segment.client_number_queue().push(
                client_number,
                self.monitor_id.id(),
                DEFAULT_SPIN_COUNT,
                requeue_deadline,
            )?;
            info!(
                "Swept client {} of dead owner {:?}: {} chunks, {} channels",
                client_number,
                owner_id,
                swept,
                channels.len()
            );
        }
        self.registered.remove(&owner_id.id());
        return Ok(total_swept);
    }

    /// A process can die inside any spin-locked critical section; its stamp
    /// in the lock word says so. Forced unlocks here keep every queue live.
    fn recover_locks_held_by(&self, owner_id: OwnerId) {
        let id = owner_id.id();
        if self.segment.shared_chunk_pool().recover_lock_held_by(id) {
            warn!("Broke the shared pool lock held by dead owner {}", id);
        }
        if self
            .segment
            .client_number_queue()
            .lock()
            .force_unlock_if_held_by(id)
        {
            warn!("Broke the client number queue lock held by dead owner {}", id);
        }
        for scheduler_number in 0..self.segment.config().n_schedulers {
            let unlocked = self
                .segment
                .scheduler_interfaces()
                .scheduler(scheduler_number)
                .channel_number_queue()
                .lock()
                .force_unlock_if_held_by(id);
            if unlocked {
                warn!(
                    "Broke scheduler {}'s channel queue lock held by dead owner {}",
                    scheduler_number, id
                );
            }
        }
    }

    fn wake_scheduler(&self, scheduler_number: u32) -> Result<(), Error> {
        // pairs with the scheduler's fence between raising its notify flag
        // and re-scanning; the release flag store must precede this load
        fence(Ordering::SeqCst);
        if !self
            .segment
            .scheduler_interfaces()
            .scheduler(scheduler_number)
            .wants_notification()
        {
            return Ok(());
        }
        let name = scheduler_event_name(self.segment.name(), scheduler_number);
        WakeEvent::open_or_create(&name)?.signal()?;
        return Ok(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::CHUNK_PAYLOAD_CAPACITY;
    use crate::segment::SegmentConfig;
    use crate::server_port::SchedulerPort;
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
    fn owner_ids_are_monotonic() {
        init();
        let name = unique_name("mon_ids");
        let _segment = Segment::create(&name, small_config()).expect("create");
        let mut monitor = MonitorInterface::open(&name).expect("open");

        let a = monitor.register_process(100, TIMEOUT).expect("register");
        let b = monitor.register_process(101, TIMEOUT).expect("register");
        let c = monitor.register_process(100, TIMEOUT).expect("register");
        assert!(a.id() < b.id());
        assert!(b.id() < c.id());
        assert!(!a.needs_cleanup());
    }

    #[test]
    fn sweep_without_channels_reclaims_chunks_and_number() {
        init();
        let name = unique_name("mon_sweep");
        let segment = Segment::create(&name, small_config()).expect("create");
        let mut monitor = MonitorInterface::open(&name).expect("open");
        let owner = monitor.register_process(200, TIMEOUT).expect("register");

        // simulate a client that acquired chunks and died
        let mut client = SharedInterface::open(&name, owner).expect("client");
        let number = client.acquire_client_number(TIMEOUT).expect("number");
        let _head = client
            .client_acquire_linked_chunks(2 * CHUNK_PAYLOAD_CAPACITY + 1, TIMEOUT)
            .expect("chunks");
        assert_eq!(segment.shared_chunk_pool().len(), 64 - 3);
        std::mem::forget(client); // the crash: Drop never runs

        let swept = monitor
            .release_dead_client_resources(owner, TIMEOUT)
            .expect("sweep");
        assert_eq!(swept, 3);
        assert_eq!(segment.shared_chunk_pool().len(), 64);
        assert_eq!(segment.client_number_queue().len(), 2);
        assert!(segment.client_interface(number).owner_id().is_none());

        WakeEvent::unlink(&client_event_name(&name, number)).expect("unlink");
    }

    #[test]
    fn sweep_waits_for_scheduler_to_reclaim_channels() {
        init();
        let name = unique_name("mon_channels");
        let segment = Segment::create(&name, small_config()).expect("create");
        let mut monitor = MonitorInterface::open(&name).expect("open");
        let database_id = monitor.register_process(1, TIMEOUT).expect("register db");
        let owner = monitor.register_process(300, TIMEOUT).expect("register");

        let mut client = SharedInterface::open(&name, owner).expect("client");
        client.acquire_client_number(TIMEOUT).expect("number");
        let channel = client.acquire_channel(0, TIMEOUT).expect("channel");
        let head = client
            .client_acquire_linked_chunks(16, TIMEOUT)
            .expect("chunks");
        {
            let view = Segment::open(&name).expect("view");
            assert!(view.channel_table().channel(channel).in_queue().try_push(head));
        }
        std::mem::forget(client);

        // a scheduler must be serving releases or the sweep cannot finish
        let scheduler_name = name.clone();
        let scheduler = std::thread::spawn(move || {
            let mut port = SchedulerPort::open(&scheduler_name, 0, database_id).expect("port");
            loop {
                match port.get_next_request(Duration::from_millis(50)) {
                    Ok(None) => {
                        let view = Segment::open(&scheduler_name).expect("view");
                        if view.client_number_queue().len() == 2 {
                            return;
                        }
                    }
                    // the request may race the release flag; the sender is
                    // dead, dropping it leaves the chunk to the sweep
                    Ok(Some(_)) => continue,
                    Err(err) => panic!("scheduler failed: {}", err),
                }
            }
        });

        let swept = monitor
            .release_dead_client_resources(owner, TIMEOUT)
            .expect("sweep");
        scheduler.join().expect("scheduler thread");

        // freed either by the scheduler's drain or by the sweep
        assert!(swept <= 1);
        assert_eq!(segment.shared_chunk_pool().len(), 64);
        assert!(!segment.channel_table().channel(channel).is_bound());
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
    fn terminated_state_fails_sends_fast() {
        init();
        let name = unique_name("mon_state");
        let _segment = Segment::create(&name, small_config()).expect("create");
        let mut monitor = MonitorInterface::open(&name).expect("open");
        let owner = monitor.register_process(400, TIMEOUT).expect("register");

        let mut client = SharedInterface::open(&name, owner).expect("client");
        client.acquire_client_number(TIMEOUT).expect("number");
        let channel = client.acquire_channel(0, TIMEOUT).expect("channel");

        monitor
            .set_database_state(DatabaseState::TerminatedUnexpectedly)
            .expect("state");
        let start = Instant::now();
        let err = client
            .send_to_server_and_wait_response(channel, 0, Duration::from_secs(30), 10)
            .expect_err("dead database");
        assert_eq!(err, Error::DatabaseTerminatedUnexpectedly);
        assert!(start.elapsed() < Duration::from_secs(5));

        // back to normal so the Drop cleanup path can run
        monitor
            .set_database_state(DatabaseState::Normal)
            .expect("state");
        client.release_channel(channel).expect("release channel");
        {
            // no scheduler is running, reclaim the channel by hand
            let view = Segment::open(&name).expect("view");
            let c = view.channel_table().channel(channel);
            c.clear_to_be_released();
            c.unbind_client();
            assert!(view
                .scheduler_interfaces()
                .scheduler(0)
                .channel_number_queue()
                .try_push(channel, 999));
        }
        drop(client);

        WakeEvent::unlink(&client_event_name(&name, 0)).expect("unlink");
        WakeEvent::unlink(&scheduler_event_name(&name, 0)).expect("unlink");
    }
}
