use std::fmt;

use thiserror::Error;

use crate::reverse::protocol::ProtocolError;

/// Which component reported a closed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Dialer,
    Listener,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Component::Dialer => write!(f, "dialer"),
            Component::Listener => write!(f, "listener"),
        }
    }
}

/// Coarse classification of [`Error`], stable across wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Closed,
    Protocol,
    Timeout,
    Canceled,
    Io,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0} already closed")]
    Closed(Component),
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("deadline exceeded")]
    Timeout,
    #[error("context canceled")]
    Canceled,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Closed(_) => ErrorKind::Closed,
            Error::Protocol(_) => ErrorKind::Protocol,
            Error::Timeout => ErrorKind::Timeout,
            Error::Canceled => ErrorKind::Canceled,
            Error::Io(_) => ErrorKind::Io,
        }
    }

    /// True for the closed sentinel of either component.
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Closed(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout
    }
}
