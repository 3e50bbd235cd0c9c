use crate::error::Error;
use std::ffi::CString;
use std::os::fd::AsRawFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;

/// A named shared memory mapping. The database process creates the segment,
/// every other participant opens it by name. The creator unlinks the name
/// when it drops the segment; open mappings stay valid until the last
/// munmap.
pub struct ShmSegment {
    name: String,
    // held only so the descriptor outlives the mapping
    _file_fd: OwnedFd,
    addr: *mut u8,
    n_bytes: usize,
    is_creator: bool,
}

// The mapping is plain memory; all shared state inside it is accessed
// through atomics or under in-segment locks.
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

fn shm_path(name: &str) -> Result<CString, Error> {
    match CString::new(format!("/{}", name)) {
        Ok(c) => return Ok(c),
        Err(_) => {
            return Err(Error::InvariantViolation(format!(
                "segment name contains a nul byte: {:?}",
                name
            )))
        }
    }
}

impl ShmSegment {
    /// Create a fresh segment of `n_bytes`, failing if the name is taken.
    /// The mapping starts zero filled.
    pub fn create(name: &str, n_bytes: usize) -> Result<ShmSegment, Error> {
        let path = shm_path(name)?;
        unsafe {
            let raw_fd = libc::shm_open(
                path.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600 as libc::mode_t,
            );
            if raw_fd < 0 {
                return Err(Error::os("Failed to create shared memory segment"));
            }
            let file_fd = OwnedFd::from_raw_fd(raw_fd);

            if libc::ftruncate(file_fd.as_raw_fd(), n_bytes as i64) < 0 {
                libc::shm_unlink(path.as_ptr());
                return Err(Error::os("Failed to resize shared memory segment"));
            }

            let hint: *mut libc::c_void = std::ptr::null_mut();
            let addr = libc::mmap64(
                hint,
                n_bytes,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file_fd.as_raw_fd(),
                0,
            );
            if addr == libc::MAP_FAILED {
                libc::shm_unlink(path.as_ptr());
                return Err(Error::os("Failed to map segment"));
            }

            return Ok(ShmSegment {
                name: name.to_string(),
                _file_fd: file_fd,
                addr: addr as *mut u8,
                n_bytes: n_bytes,
                is_creator: true,
            });
        }
    }

    /// Open an existing segment by name; the size comes from the segment
    /// itself.
    pub fn open(name: &str) -> Result<ShmSegment, Error> {
        let path = shm_path(name)?;
        unsafe {
            let raw_fd = libc::shm_open(path.as_ptr(), libc::O_RDWR, 0 as libc::mode_t);
            if raw_fd < 0 {
                return Err(Error::os("Failed to open shared memory segment"));
            }
            let file_fd = OwnedFd::from_raw_fd(raw_fd);

            let n_bytes = libc::lseek(file_fd.as_raw_fd(), 0, libc::SEEK_END);
            if n_bytes <= 0 {
                return Err(Error::os("Failed to seek to end of segment"));
            }

            let hint: *mut libc::c_void = std::ptr::null_mut();
            let addr = libc::mmap64(
                hint,
                n_bytes as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file_fd.as_raw_fd(),
                0,
            );
            if addr == libc::MAP_FAILED {
                return Err(Error::os("Failed to map segment"));
            }

            return Ok(ShmSegment {
                name: name.to_string(),
                _file_fd: file_fd,
                addr: addr as *mut u8,
                n_bytes: n_bytes as usize,
                is_creator: false,
            });
        }
    }

    pub fn name(&self) -> &str {
        return &self.name;
    }

    pub fn len(&self) -> usize {
        return self.n_bytes;
    }

    pub fn read_u32_at(&self, start: usize) -> u32 {
        let slice = self.slice();
        let end: usize = start + 4;
        assert!(end <= slice.len());
        let data: &[u8; 4] = &slice[start..end].try_into().unwrap();
        return u32::from_ne_bytes(*data);
    }

    pub fn read_u64_at(&self, start: usize) -> u64 {
        let slice = self.slice();
        let end: usize = start + 8;
        assert!(end <= slice.len());
        let data: &[u8; 8] = &slice[start..end].try_into().unwrap();
        return u64::from_ne_bytes(*data);
    }

    pub fn write_u32_at(&self, start: usize, value: u32) {
        let slice = self.slice();
        let end: usize = start + 4;
        assert!(end <= slice.len());
        slice[start..end].clone_from_slice(&value.to_ne_bytes());
    }

    pub fn write_u64_at(&self, start: usize, value: u64) {
        let slice = self.slice();
        let end: usize = start + 8;
        assert!(end <= slice.len());
        slice[start..end].clone_from_slice(&value.to_ne_bytes());
    }

    pub fn write_bytes_at(&self, start: usize, bytes: &[u8]) {
        let slice = self.slice();
        let end = start + bytes.len();
        assert!(end <= slice.len());
        slice[start..end].clone_from_slice(bytes);
    }

    pub fn read_bytes_at(&self, start: usize, len: usize) -> &[u8] {
        let slice = self.slice();
        assert!(start + len <= slice.len());
        return &slice[start..start + len];
    }

    pub fn ptr_to(&self, start: usize) -> *mut u8 {
        assert!(start < self.n_bytes);
        unsafe {
            return self.addr.add(start);
        }
    }

    pub fn slice(&self) -> &mut [u8] {
        assert!(!self.addr.is_null());
        let slice = unsafe { std::slice::from_raw_parts_mut(self.addr, self.n_bytes) };
        return slice;
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.addr as *mut libc::c_void, self.n_bytes);
            if self.is_creator {
                if let Ok(path) = shm_path(&self.name) {
                    libc::shm_unlink(path.as_ptr());
                }
            }
        }
    }
}
