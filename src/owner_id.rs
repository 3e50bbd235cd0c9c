use std::fmt;

// 64-bit owner identity issued by the monitor: low 63 bits are a monotonic
// id (never recycled while a monitor session lives), the high bit flags
// "this owner died, its resources need cleanup". All zero means no owner.

const CLEAN_UP_FLAG: u64 = 1 << 63;
const ID_MASK: u64 = !CLEAN_UP_FLAG;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerId(u64);

impl OwnerId {
    pub fn none() -> OwnerId {
        return OwnerId(0);
    }

    pub fn new(id: u64) -> OwnerId {
        assert!(id & CLEAN_UP_FLAG == 0);
        return OwnerId(id);
    }

    pub fn from_raw(raw: u64) -> OwnerId {
        return OwnerId(raw);
    }

    pub fn raw(&self) -> u64 {
        return self.0;
    }

    /// The identity without the cleanup flag.
    pub fn id(&self) -> u64 {
        return self.0 & ID_MASK;
    }

    pub fn is_none(&self) -> bool {
        return self.id() == 0;
    }

    pub fn needs_cleanup(&self) -> bool {
        return self.0 & CLEAN_UP_FLAG != 0;
    }

    pub fn with_cleanup_flag(&self) -> OwnerId {
        return OwnerId(self.0 | CLEAN_UP_FLAG);
    }
}

impl fmt::Debug for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.needs_cleanup() {
            return write!(f, "OwnerId({}, cleanup)", self.id());
        }
        return write!(f, "OwnerId({})", self.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_is_zero() {
        assert!(OwnerId::none().is_none());
        assert_eq!(OwnerId::none().raw(), 0);
    }

    #[test]
    fn cleanup_flag_is_the_high_bit() {
        let id = OwnerId::new(42);
        assert!(!id.needs_cleanup());
        let flagged = id.with_cleanup_flag();
        assert!(flagged.needs_cleanup());
        assert_eq!(flagged.id(), 42);
        assert_eq!(flagged.raw(), 42 | (1 << 63));
        // still the same owner for comparisons on id()
        assert_eq!(flagged.id(), id.id());
    }
}
