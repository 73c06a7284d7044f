//! Commands understood by the [`RegistryActor`](super::registry::RegistryActor)
//!
//! Connection tasks, the scheduler and the public [`Server`](super::Server)
//! API all reach the client table through these, so registry mutation and
//! iteration never race.
//!
//! Every command that refers to a client carries the connection number it
//! was registered with. A command from a superseded connection is ignored
//! instead of touching the record that replaced it.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::oneshot;

use crate::transport::Link;

/// Tags per collector name, as announced with `add`
pub type CollectorTags = BTreeMap<String, Vec<String>>;

#[derive(Debug)]
pub enum RegistryCommand {
    /// A relay completed its handshake
    ///
    /// Replaces (and thereby closes) any previous connection with the same id.
    Register {
        id: String,
        conn: u64,
        link: Arc<Link>,
        /// Dropped when the record goes away, which ends the connection task
        shutdown: oneshot::Sender<()>,
    },

    /// The connection ended
    Deregister { id: String, conn: u64 },

    /// `add name[:tags]`
    Add {
        id: String,
        conn: u64,
        name: String,
        tags: Vec<String>,
    },

    /// `remove name`
    Remove { id: String, conn: u64, name: String },

    /// Snapshot of one client's collector tags, used to resolve `got`
    Tags {
        id: String,
        conn: u64,
        respond_to: oneshot::Sender<Option<CollectorTags>>,
    },

    /// Send one shared `get` to every client that has any of `names`
    Poll {
        names: Vec<String>,
        respond_to: oneshot::Sender<usize>,
    },

    /// Send every client a `get` for its own collectors
    PollAll { respond_to: oneshot::Sender<usize> },

    /// Send `get` to the listed clients only; `None` names asks each of
    /// them for its own collectors
    PollIds {
        ids: Vec<String>,
        names: Option<Vec<String>>,
        respond_to: oneshot::Sender<usize>,
    },

    /// Snapshot of every connected client
    Clients {
        respond_to: oneshot::Sender<Vec<ClientSummary>>,
    },

    /// A write to this client failed
    Evict { id: String, conn: u64 },
}

/// Read-only view of a connected relay
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientSummary {
    pub id: String,
    pub peer: String,
    pub collectors: CollectorTags,
}
