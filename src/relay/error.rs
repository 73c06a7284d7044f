//! Error types for relay operations

use std::fmt;

/// Result type alias for relay operations
pub type RelayResult<T> = Result<T, RelayError>;

/// Errors that can occur while talking to the server or managing collectors
#[derive(Debug)]
pub enum RelayError {
    /// Dialing or handshaking with the server failed
    Connection(std::io::Error),

    /// The server did not answer the handshake with `ok`
    UnableToIdentify(String),

    /// The collector name is reserved or contains a protocol metacharacter
    ReservedName(String),

    /// A collector with this name is already registered
    DuplicateCollector(String),

    /// The relay has been closed
    Closed,
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::Connection(err) => write!(f, "failed to connect to server: {}", err),
            RelayError::UnableToIdentify(reply) => {
                write!(f, "unable to identify with server (got '{}')", reply)
            }
            RelayError::ReservedName(name) => write!(f, "collector name '{}' is reserved", name),
            RelayError::DuplicateCollector(name) => {
                write!(f, "collector '{}' is already registered", name)
            }
            RelayError::Closed => write!(f, "relay is closed"),
        }
    }
}

impl std::error::Error for RelayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RelayError::Connection(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        RelayError::Connection(err)
    }
}
