use std::fmt::Display;
use std::io::ErrorKind;
use std::sync::Arc;
use thiserror::Error;

/// Result type used throughout spout.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An error raised by a pull, a resource handle, a signal or a join.
///
/// Errors are cheap to clone: a failed [`Signal`](crate::Signal) hands the
/// stored error to every pending and subsequent caller, and a failed join
/// reports the same error to its consumer after all branches have shut down.
#[derive(Clone, Error, Debug)]
pub enum Error {
    /// I/O error raised by the backing resource.
    #[error("{kind}: {message}")]
    Io { kind: ErrorKind, message: String },

    /// The signal was closed and no further value is forthcoming.
    ///
    /// Discrete signal streams treat this as normal termination.
    #[error("End of signal")]
    EndOfSignal,

    /// The resource was closed before or while the operation ran.
    #[error("{0} is closed")]
    Closed(&'static str),

    /// The operation did not complete within its deadline.
    #[error("Operation timed out")]
    Timeout,

    /// A configuration value was rejected.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The requested backend is not registered.
    #[error("The requested backend ({0:?}) is not available")]
    BackendNotSupported(String),

    /// A concurrently running task panicked.
    #[error("Task panicked: {0}")]
    Panicked(String),

    /// Failure raised by user code.
    #[error("{0}")]
    Custom(Arc<anyhow::Error>),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io {
            kind: value.kind(),
            message: value.to_string(),
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(value: anyhow::Error) -> Self {
        Self::Custom(Arc::new(value))
    }
}

impl Error {
    /// Wraps an arbitrary message as a [`Error::Custom`].
    pub fn msg<M>(message: M) -> Self
    where
        M: Display + std::fmt::Debug + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(anyhow::Error::msg(message)))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io { kind, .. } => *kind,
            Error::EndOfSignal => ErrorKind::BrokenPipe,
            Error::Closed(_) => ErrorKind::NotConnected,
            Error::Timeout => ErrorKind::TimedOut,
            Error::InvalidConfig(_) => ErrorKind::InvalidInput,
            Error::BackendNotSupported(_) => ErrorKind::Unsupported,
            Error::Panicked(_) => ErrorKind::Other,
            Error::Custom(_) => ErrorKind::Other,
        }
    }

    pub fn is_end_of_signal(&self) -> bool {
        matches!(self, Error::EndOfSignal)
    }

    /// Returns true if `self` and `other` are the same failure.
    ///
    /// Custom errors compare by identity, everything else by value.
    pub fn same_as(&self, other: &Error) -> bool {
        match (self, other) {
            (Error::Io { kind, message }, Error::Io { kind: k, message: m }) => {
                kind == k && message == m
            }
            (Error::EndOfSignal, Error::EndOfSignal) => true,
            (Error::Closed(a), Error::Closed(b)) => a == b,
            (Error::Timeout, Error::Timeout) => true,
            (Error::InvalidConfig(a), Error::InvalidConfig(b)) => a == b,
            (Error::BackendNotSupported(a), Error::BackendNotSupported(b)) => a == b,
            (Error::Panicked(a), Error::Panicked(b)) => a == b,
            (Error::Custom(a), Error::Custom(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}
