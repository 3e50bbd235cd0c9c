use crate::error::Error;
use std::ffi::CString;
use std::marker::PhantomData;
use std::time::Duration;

// Two flavors of the same OS primitive. WakeEvent is the nameable wake
// object a scheduler or client sleeps on; SharedSemaphore lives inside the
// segment and backs the not_empty/not_full conditions of the shared queues.

fn sem_name(name: &str) -> Result<CString, Error> {
    match CString::new(format!("/{}", name)) {
        Ok(c) => return Ok(c),
        Err(_) => {
            return Err(Error::InvariantViolation(format!(
                "event name contains a nul byte: {:?}",
                name
            )))
        }
    }
}

/// Absolute CLOCK_REALTIME timespec `remaining` from now, for sem_timedwait.
fn abs_timespec(remaining: Duration) -> libc::timespec {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_REALTIME, &mut now);
    }
    let mut sec = now.tv_sec + remaining.as_secs() as libc::time_t;
    let mut nsec = now.tv_nsec + remaining.subsec_nanos() as libc::c_long;
    if nsec >= 1_000_000_000 {
        sec += 1;
        nsec -= 1_000_000_000;
    }
    return libc::timespec {
        tv_sec: sec,
        tv_nsec: nsec,
    };
}

fn timed_wait(sem: *mut libc::sem_t, remaining: Duration) -> Result<bool, Error> {
    if remaining.is_zero() {
        let ret = unsafe { libc::sem_trywait(sem) };
        if ret == 0 {
            return Ok(true);
        }
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        if errno == libc::EAGAIN {
            return Ok(false);
        }
        return Err(Error::os("Failed to try-wait on semaphore"));
    }

    let ts = abs_timespec(remaining);
    loop {
        let ret = unsafe { libc::sem_timedwait(sem, &ts) };
        if ret == 0 {
            return Ok(true);
        }
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        if errno == libc::ETIMEDOUT {
            return Ok(false);
        }
        if errno == libc::EINTR {
            continue;
        }
        return Err(Error::os("Failed to wait on semaphore"));
    }
}

/// A named wake primitive: signal from any process, timed wait in the
/// owner. Spurious wakeups are fine, every waiter re-checks its predicate.
pub struct WakeEvent {
    name: String,
    sem: *mut libc::sem_t,
}

unsafe impl Send for WakeEvent {}

impl WakeEvent {
    /// Open the event, creating it (count zero) if no one has yet. Creation
    /// order between signaler and waiter does not matter.
    pub fn open_or_create(name: &str) -> Result<WakeEvent, Error> {
        let path = sem_name(name)?;
        let sem = unsafe {
            libc::sem_open(
                path.as_ptr(),
                libc::O_CREAT,
                0o600 as libc::mode_t,
                0 as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(Error::os("Failed to open wake event"));
        }
        return Ok(WakeEvent {
            name: name.to_string(),
            sem: sem,
        });
    }

    pub fn signal(&self) -> Result<(), Error> {
        let ret = unsafe { libc::sem_post(self.sem) };
        if ret != 0 {
            return Err(Error::os("Failed to signal wake event"));
        }
        return Ok(());
    }

    /// Returns Ok(true) if signaled, Ok(false) if `remaining` elapsed.
    pub fn wait_timeout(&self, remaining: Duration) -> Result<bool, Error> {
        return timed_wait(self.sem, remaining);
    }

    pub fn name(&self) -> &str {
        return &self.name;
    }

    /// Remove the name from the system. Existing handles stay usable.
    pub fn unlink(name: &str) -> Result<(), Error> {
        let path = sem_name(name)?;
        unsafe {
            libc::sem_unlink(path.as_ptr());
        }
        return Ok(());
    }
}

impl Drop for WakeEvent {
    fn drop(&mut self) {
        unsafe {
            libc::sem_close(self.sem);
        }
    }
}

/// An unnamed process-shared semaphore embedded in the segment. The segment
/// creator calls `init_at` exactly once per location; everyone else attaches
/// with `at`.
pub struct SharedSemaphore<'a> {
    sem: *mut libc::sem_t,
    _segment: PhantomData<&'a ()>,
}

unsafe impl<'a> Send for SharedSemaphore<'a> {}

impl<'a> SharedSemaphore<'a> {
    /// Bytes to reserve in the segment layout.
    pub fn size_in_bytes() -> usize {
        return std::mem::size_of::<libc::sem_t>();
    }

    /// Safety: `base` must point at `size_in_bytes()` writable bytes inside
    /// a mapping shared by every participating process.
    pub unsafe fn init_at(base: *mut u8) -> Result<SharedSemaphore<'a>, Error> {
        let sem = base as *mut libc::sem_t;
        if libc::sem_init(sem, 1 /* pshared */, 0) != 0 {
            return Err(Error::os("Failed to init shared semaphore"));
        }
        return Ok(SharedSemaphore {
            sem: sem,
            _segment: PhantomData,
        });
    }

    /// Safety: `base` must point at a location previously set up with
    /// `init_at` in this or another process.
    pub unsafe fn at(base: *mut u8) -> SharedSemaphore<'a> {
        return SharedSemaphore {
            sem: base as *mut libc::sem_t,
            _segment: PhantomData,
        };
    }

    pub fn post(&self) -> Result<(), Error> {
        let ret = unsafe { libc::sem_post(self.sem) };
        if ret != 0 {
            return Err(Error::os("Failed to post shared semaphore"));
        }
        return Ok(());
    }

    pub fn wait_timeout(&self, remaining: Duration) -> Result<bool, Error> {
        return timed_wait(self.sem, remaining);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::time::Instant;

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn unique_name(prefix: &str) -> String {
        let mut rng = rand::thread_rng();
        return format!("{}_{}", prefix, rng.gen::<u32>());
    }

    #[test]
    fn signal_then_wait() {
        init();
        let name = unique_name("wake_test");
        let event = WakeEvent::open_or_create(&name).expect("create");
        event.signal().expect("signal");
        assert!(event.wait_timeout(Duration::from_secs(1)).expect("wait"));
        WakeEvent::unlink(&name).expect("unlink");
    }

    #[test]
    fn wait_times_out() {
        init();
        let name = unique_name("wake_timeout");
        let event = WakeEvent::open_or_create(&name).expect("create");
        let start = Instant::now();
        assert!(!event.wait_timeout(Duration::from_millis(50)).expect("wait"));
        assert!(start.elapsed() < Duration::from_secs(2));
        WakeEvent::unlink(&name).expect("unlink");
    }

    #[test]
    fn zero_timeout_never_blocks() {
        init();
        let name = unique_name("wake_zero");
        let event = WakeEvent::open_or_create(&name).expect("create");
        assert!(!event.wait_timeout(Duration::ZERO).expect("wait"));
        event.signal().expect("signal");
        assert!(event.wait_timeout(Duration::ZERO).expect("wait"));
        WakeEvent::unlink(&name).expect("unlink");
    }

    #[test]
    fn shared_semaphore_crosses_handles() {
        init();
        // u64 backing keeps the semaphore aligned
        let mut backing = vec![0u64; SharedSemaphore::size_in_bytes() / 8 + 1];
        let base = backing.as_mut_ptr() as *mut u8;
        let a = unsafe { SharedSemaphore::init_at(base).expect("init") };
        let b = unsafe { SharedSemaphore::at(base) };
        a.post().expect("post");
        assert!(b.wait_timeout(Duration::ZERO).expect("wait"));
        assert!(!b.wait_timeout(Duration::ZERO).expect("wait"));
    }
}
