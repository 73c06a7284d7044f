//! Commands sent from a [`Relay`](super::Relay) handle to its actor
//!
//! Wire traffic and these commands are drained by the same loop, so the
//! collector set is only ever touched from one task.

use std::collections::HashMap;

use tokio::sync::oneshot;

use crate::collector::Collector;

use super::error::RelayResult;

pub enum RelayCommand {
    /// Register a collector and announce it to the server
    Add {
        name: String,
        tags: Vec<String>,
        collector: Box<dyn Collector>,
        respond_to: oneshot::Sender<RelayResult<()>>,
    },

    /// Drop a collector; no-op when it is not registered
    Remove {
        name: String,
        respond_to: oneshot::Sender<()>,
    },

    /// Sample every collector, plus the `_connected` flag
    Info {
        respond_to: oneshot::Sender<HashMap<String, f64>>,
    },

    /// Names of the registered collectors, sorted
    Collectors {
        respond_to: oneshot::Sender<Vec<String>>,
    },

    /// Say `close` to the server and stop for good
    Close { respond_to: oneshot::Sender<()> },
}
