//! The closed error set at the simulator boundary.
//!
//! Everything a simulated operation can surface to the code under test is
//! one of these variants. Anything else escaping a continuation is a bug in
//! the code under test and is handled by the driver (severe trace followed
//! by an instant kill of the offending process), never returned.

use thiserror::Error;

/// Errors surfaced by simulated operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SimError {
    /// Transient disk failure; injectable, retried by callers.
    #[error("io error")]
    IoError,

    /// Transient disk timeout; injectable, retried by callers.
    #[error("io timeout")]
    IoTimeout,

    /// The connection died (random close, peer kill).
    #[error("connection failed")]
    ConnectionFailed,

    /// A connection was still referenced 20 virtual seconds after its peer
    /// closed. Reported via an error-severity trace; fatal only by severity.
    #[error("connection leaked")]
    ConnectionLeaked,

    /// ENOENT at open time.
    #[error("file not found")]
    FileNotFound,

    /// The waiting task's process died; dependents should tear down.
    #[error("actor cancelled")]
    ActorCancelled,

    /// The other end of a oneshot signal was dropped without firing.
    #[error("broken promise")]
    BrokenPromise,

    /// Soft open-file exhaustion (the hard limit panics instead).
    #[error("too many open files")]
    TooManyFiles,

    /// A telemetry attribute was not (yet) published; transient.
    #[error("attribute not found")]
    AttributeNotFound,

    /// A timed request did not complete in its window; transient.
    #[error("timed out")]
    TimedOut,
}

/// Result alias for simulator operations.
pub type SimResult<T> = Result<T, SimError>;

impl From<SimError> for std::io::Error {
    fn from(e: SimError) -> Self {
        let kind = match e {
            SimError::FileNotFound => std::io::ErrorKind::NotFound,
            SimError::ConnectionFailed => std::io::ErrorKind::ConnectionReset,
            SimError::TimedOut => std::io::ErrorKind::TimedOut,
            SimError::ActorCancelled => std::io::ErrorKind::Interrupted,
            _ => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, e)
    }
}
