use crate::chunk::ChunkIndex;
use crate::constants::{
    client_event_name, scheduler_event_name, DEFAULT_SPIN_COUNT, DEFAULT_TIMEOUT_MS,
};
use crate::error::Error;
use crate::owner_id::OwnerId;
use crate::segment::{DatabaseState, Segment, SegmentConfig};
use crate::wake_event::WakeEvent;
use log::warn;
use std::sync::atomic::{fence, Ordering};
use std::time::{Duration, Instant};

// The client-side facade: one coherent lifecycle over the shared tables.
// open -> acquire client number -> acquire channels/chunks -> exchange
// messages -> release -> close, with everything still owned released on
// Drop. No business logic lives here, only composition of the pools,
// queues and flags plus the wake protocol.

pub struct SharedInterface {
    segment: Segment,
    owner_id: OwnerId,
    client_number: Option<u32>,
    work_event: Option<WakeEvent>,
    scheduler_events: Vec<Option<WakeEvent>>,
}

impl SharedInterface {
    /// Attach to a segment. `owner_id` must come from the monitor's
    /// `register_process`; nothing can be acquired without it.
    pub fn open(segment_name: &str, owner_id: OwnerId) -> Result<SharedInterface, Error> {
        if owner_id.is_none() {
            return Err(Error::InvariantViolation(
                "cannot open without a registered owner id".to_string(),
            ));
        }
        let segment = Segment::open(segment_name)?;
        let n_schedulers = segment.config().n_schedulers as usize;
        let mut scheduler_events = Vec::with_capacity(n_schedulers);
        scheduler_events.resize_with(n_schedulers, || None);
        return Ok(SharedInterface {
            segment: segment,
            owner_id: owner_id,
            client_number: None,
            work_event: None,
            scheduler_events: scheduler_events,
        });
    }

    pub fn config(&self) -> &SegmentConfig {
        return self.segment.config();
    }

    pub fn owner_id(&self) -> OwnerId {
        return self.owner_id;
    }

    pub fn client_number(&self) -> Option<u32> {
        return self.client_number;
    }

    fn lock_id(&self) -> u64 {
        return self.owner_id.id();
    }

    fn bound_client_number(&self) -> Result<u32, Error> {
        match self.client_number {
            Some(number) => return Ok(number),
            None => {
                return Err(Error::InvariantViolation(
                    "no client number acquired".to_string(),
                ))
            }
        }
    }

    /// Map the shared database state onto the send-path error taxonomy.
    fn check_database_state(&self) -> Result<(), Error> {
        match self.segment.database_state()? {
            DatabaseState::Normal => return Ok(()),
            DatabaseState::TerminatedGracefully => return Err(Error::DatabaseTerminatedGracefully),
            DatabaseState::TerminatedUnexpectedly => {
                return Err(Error::DatabaseTerminatedUnexpectedly)
            }
        }
    }

    pub fn database_state(&self) -> Result<DatabaseState, Error> {
        return self.segment.database_state();
    }

    /// Reserve a client interface slot and open this client's wake event.
    pub fn acquire_client_number(&mut self, timeout: Duration) -> Result<u32, Error> {
        if self.client_number.is_some() {
            return Err(Error::InvariantViolation(
                "client number already acquired".to_string(),
            ));
        }
        let deadline = Instant::now() + timeout;
        let number = self
            .segment
            .client_number_queue()
            .pop(self.lock_id(), DEFAULT_SPIN_COUNT, deadline)?;

        let interface = self.segment.client_interface(number);
        interface.set_owner_id(self.owner_id);
        interface.set_notify(false);

        let event = WakeEvent::open_or_create(&client_event_name(self.segment.name(), number))?;
        self.work_event = Some(event);
        self.client_number = Some(number);
        return Ok(number);
    }

    /// Hand the slot back. Everything else must have been released first.
    pub fn release_client_number(&mut self, timeout: Duration) -> Result<(), Error> {
        let number = self.bound_client_number()?;
        let interface = self.segment.client_interface(number);
        if interface.allocated_channels() != 0
            || interface.resource_map().count_owned_chunks() != 0
        {
            return Err(Error::InvariantViolation(format!(
                "client {} still owns resources",
                number
            )));
        }

        interface.set_owner_id(OwnerId::none());
        let deadline = Instant::now() + timeout;
        self.segment
            .client_number_queue()
            .push(number, self.lock_id(), DEFAULT_SPIN_COUNT, deadline)?;
        self.client_number = None;
        self.work_event = None;
        return Ok(());
    }

    /// Pop a channel number from `scheduler_number`'s free queue and bind
    /// it to this client.
    pub fn acquire_channel(
        &mut self,
        scheduler_number: u32,
        timeout: Duration,
    ) -> Result<u32, Error> {
        let client_number = self.bound_client_number()?;
        if scheduler_number >= self.segment.config().n_schedulers {
            return Err(Error::InvariantViolation(format!(
                "no scheduler {}",
                scheduler_number
            )));
        }

        let deadline = Instant::now() + timeout;
        let channel_number = self
            .segment
            .scheduler_interfaces()
            .scheduler(scheduler_number)
            .channel_number_queue()
            .pop(self.lock_id(), DEFAULT_SPIN_COUNT, deadline)?;

        let interface = self.segment.client_interface(client_number);
        let channel = self.segment.channel_table().channel(channel_number);
        channel.bind_client(client_number);
        interface
            .resource_map()
            .set_channel_flag(channel_number, scheduler_number as u8);
        interface.increment_allocated_channels();
        return Ok(channel_number);
    }

    /// Ask the owning scheduler to reclaim the channel. Non-blocking from
    /// this side; the scheduler drains the queues and requeues the number.
    pub fn release_channel(&mut self, channel_number: u32) -> Result<(), Error> {
        let client_number = self.bound_client_number()?;
        let interface = self.segment.client_interface(client_number);
        if !interface.resource_map().owns_channel(channel_number) {
            return Err(Error::InvariantViolation(format!(
                "channel {} is not owned by client {}",
                channel_number, client_number
            )));
        }

        let channel = self.segment.channel_table().channel(channel_number);
        let scheduler_number = channel.scheduler_number();
        interface.resource_map().clear_channel_flag(channel_number);
        interface.decrement_allocated_channels();
        channel.set_to_be_released();
        self.notify_scheduler(scheduler_number)?;
        return Ok(());
    }

    /// Acquire a terminated stream chain big enough for `byte_size` bytes,
    /// owned by this client.
    pub fn client_acquire_linked_chunks(
        &self,
        byte_size: usize,
        timeout: Duration,
    ) -> Result<ChunkIndex, Error> {
        let client_number = self.bound_client_number()?;
        let interface = self.segment.client_interface(client_number);
        return self.segment.shared_chunk_pool().acquire_linked_chunks(
            &self.segment.chunk_table(),
            byte_size,
            &interface.resource_map(),
            self.lock_id(),
            timeout,
        );
    }

    /// Release a stream chain acquired by this client.
    pub fn client_release_linked_chunks(
        &self,
        head: ChunkIndex,
        timeout: Duration,
    ) -> Result<(), Error> {
        let client_number = self.bound_client_number()?;
        let interface = self.segment.client_interface(client_number);
        return self.segment.shared_chunk_pool().release_linked_chunks(
            &self.segment.chunk_table(),
            head,
            &interface.resource_map(),
            self.lock_id(),
            timeout,
        );
    }

    fn notify_scheduler(&mut self, scheduler_number: u32) -> Result<(), Error> {
        // pairs with the scheduler's fence between raising its notify flag
        // and re-scanning: our queue/flag writes must be ordered before this
        // load or the wakeup is lost
        fence(Ordering::SeqCst);
        if !self
            .segment
            .scheduler_interfaces()
            .scheduler(scheduler_number)
            .wants_notification()
        {
            return Ok(());
        }
        let slot = scheduler_number as usize;
        if self.scheduler_events[slot].is_none() {
            let name = scheduler_event_name(self.segment.name(), scheduler_number);
            self.scheduler_events[slot] = Some(WakeEvent::open_or_create(&name)?);
        }
        if let Some(event) = &self.scheduler_events[slot] {
            event.signal()?;
        }
        return Ok(());
    }

    /// Push `request_head` to the channel's in queue, wake the scheduler,
    /// wait for a response head on the out queue. Spin first, then sleep on
    /// this client's wake event; the database state is rechecked on every
    /// wakeup so a dead database fails fast instead of timing out.
    pub fn send_to_server_and_wait_response(
        &mut self,
        channel_number: u32,
        request_head: ChunkIndex,
        timeout: Duration,
        spin_count: u32,
    ) -> Result<ChunkIndex, Error> {
        let client_number = self.bound_client_number()?;
        let deadline = Instant::now() + timeout;
        self.check_database_state()?;

        let interface = self.segment.client_interface(client_number);
        if !interface.resource_map().owns_channel(channel_number) {
            return Err(Error::InvariantViolation(format!(
                "channel {} is not owned by client {}",
                channel_number, client_number
            )));
        }
        let channel = self.segment.channel_table().channel(channel_number);
        let scheduler_number = channel.scheduler_number();

        // push the request
        if !channel.in_queue().push(request_head, spin_count) {
            interface.set_notify(true);
            // the flag store must be ordered before the re-check, or the
            // scheduler's skipped signal leaves us asleep until the deadline
            fence(Ordering::SeqCst);
            loop {
                if let Err(err) = self.check_database_state() {
                    interface.set_notify(false);
                    return Err(err);
                }
                if channel.in_queue().try_push(request_head) {
                    break;
                }
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    interface.set_notify(false);
                    return Err(Error::Timeout);
                }
                self.wait_for_work(remaining)?;
            }
            interface.set_notify(false);
        }

        self.notify_scheduler(scheduler_number)?;

        // pop the response
        let interface = self.segment.client_interface(client_number);
        let channel = self.segment.channel_table().channel(channel_number);
        if let Some(response_head) = channel.out_queue().pop(spin_count) {
            return Ok(response_head);
        }
        interface.set_notify(true);
        fence(Ordering::SeqCst);
        loop {
            if let Err(err) = self.check_database_state() {
                interface.set_notify(false);
                return Err(err);
            }
            if let Some(response_head) = channel.out_queue().try_pop() {
                interface.set_notify(false);
                return Ok(response_head);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                interface.set_notify(false);
                return Err(Error::Timeout);
            }
            self.wait_for_work(remaining)?;
        }
    }

    fn wait_for_work(&self, remaining: Duration) -> Result<bool, Error> {
        match &self.work_event {
            Some(event) => return event.wait_timeout(remaining),
            None => {
                return Err(Error::InvariantViolation(
                    "waiting without a work event".to_string(),
                ))
            }
        }
    }
}

impl Drop for SharedInterface {
    /// Guaranteed release on every exit path: request release of any still
    /// owned channels, wait for the schedulers to reclaim them, sweep owned
    /// chunks back, hand the client number back. Failures are logged, a
    /// dead database cannot be helped from here.
    fn drop(&mut self) {
        let client_number = match self.client_number {
            Some(number) => number,
            None => return,
        };
        let timeout = Duration::from_millis(DEFAULT_TIMEOUT_MS);
        let interface = self.segment.client_interface(client_number);
        let map = interface.resource_map();

        let channels = map.owned_channels();
        for &channel_number in &channels {
            if let Err(err) = self.release_channel(channel_number) {
                warn!(
                    "Dropping client {}: failed to release channel {}: {}",
                    client_number, channel_number, err
                );
            }
        }
        // the schedulers drain in-flight chunks before unbinding; only then
        // is the chunk sweep safe
        let unbind_deadline = Instant::now() + timeout;
        for &channel_number in &channels {
            let channel = self.segment.channel_table().channel(channel_number);
            while channel.is_bound() && Instant::now() < unbind_deadline {
                std::thread::sleep(Duration::from_millis(1));
            }
            if channel.is_bound() {
                warn!(
                    "Dropping client {}: channel {} was never reclaimed",
                    client_number, channel_number
                );
            }
        }

        let interface = self.segment.client_interface(client_number);
        if interface.resource_map().count_owned_chunks() != 0 {
            if let Err(err) = self.segment.shared_chunk_pool().release_owned_by(
                &interface.resource_map(),
                self.lock_id(),
                timeout,
            ) {
                warn!(
                    "Dropping client {}: failed to sweep owned chunks: {}",
                    client_number, err
                );
            }
        }

        if let Err(err) = self.release_client_number(timeout) {
            warn!(
                "Dropping client {}: failed to release client number: {}",
                client_number, err
            );
        }
    }
}
