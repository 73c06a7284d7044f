//! Errors raised while starting the server

use std::fmt;
use std::time::Duration;

#[derive(Debug)]
pub enum ServerError {
    /// The listen address could not be bound
    Bind(std::io::Error),

    /// Relays are told the heartbeat in whole seconds, so it must be at least one
    InvalidHeartbeat(Duration),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Bind(err) => write!(f, "failed to listen: {err}"),
            ServerError::InvalidHeartbeat(heartbeat) => {
                write!(f, "heartbeat must be at least one second, got {heartbeat:?}")
            }
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Bind(err) => Some(err),
            ServerError::InvalidHeartbeat(_) => None,
        }
    }
}
