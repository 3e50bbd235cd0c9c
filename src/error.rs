use std::fmt;

/// Crate wide error type. Timeouts and exhausted capacity are normal,
/// retryable outcomes; invariant violations mean the caller misused the API
/// but must not be able to bring the database down, so they are reported
/// rather than aborting.
#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    /// A lock or condition wait ran past the caller's deadline.
    Timeout,

    /// A chain release stopped partway; `remaining_head` is the first chunk
    /// of the sub-chain that was not released.
    PartialRelease { remaining_head: u32 },

    /// Double release, owner mismatch, out-of-range index and friends.
    InvariantViolation(String),

    /// The database process shut down in an orderly fashion.
    DatabaseTerminatedGracefully,

    /// The monitor flagged the database process as dead.
    DatabaseTerminatedUnexpectedly,

    /// The shared state flag held a value this build does not know.
    DatabaseStateUnknown,

    /// An OS call failed.
    Os(String),
}

impl Error {
    pub fn os(what: &str) -> Error {
        return Error::Os(format!("{}: {}", what, std::io::Error::last_os_error()));
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        return Error::Os(format!("{}", err));
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Timeout => write!(f, "timed out"),
            Error::PartialRelease { remaining_head } => {
                write!(f, "partial release, remaining head chunk {}", remaining_head)
            }
            Error::InvariantViolation(descr) => write!(f, "invariant violation: {}", descr),
            Error::DatabaseTerminatedGracefully => {
                write!(f, "database terminated gracefully")
            }
            Error::DatabaseTerminatedUnexpectedly => {
                write!(f, "database terminated unexpectedly")
            }
            Error::DatabaseStateUnknown => write!(f, "database state unknown"),
            Error::Os(descr) => write!(f, "{}", descr),
        }
    }
}
