//! Relay client
//!
//! A [`Relay`] owns a named set of collectors, keeps a connection to the
//! server and answers its `get` requests. Connection loss is healed by
//! redialing forever; see [`actor`] for the state machine.
//!
//! ## Usage
//!
//! ```no_run
//! use pulse::{Relay, collector};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let relay = Relay::connect("127.0.0.1:3000", "web-1").await?;
//!     relay
//!         .add_collector("cpu", vec!["role:web".into()], collector::point(|| 42.0))
//!         .await?;
//!     relay.close().await?;
//!     Ok(())
//! }
//! ```

mod actor;
pub mod error;
pub mod messages;

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::collector::Collector;
use crate::protocol::is_valid_name;

pub use error::{RelayError, RelayResult};
use messages::RelayCommand;

/// Delay between two reconnection attempts
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Heartbeat interval used until the server assigns one
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(30);

/// How a relay connects and heals
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Server address, `host:port`
    pub address: String,

    /// Name this relay identifies with
    pub id: String,

    /// Pause before each redial after the connection is lost
    pub reconnect_delay: Duration,

    /// Ping interval until the server sends `beat`
    pub heartbeat: Duration,
}

impl RelayOptions {
    pub fn new(address: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            id: id.into(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            heartbeat: DEFAULT_HEARTBEAT,
        }
    }

    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }
}

/// Handle to a running relay
///
/// All operations are forwarded to the relay's actor, so they are
/// serialized with the wire traffic it handles.
#[derive(Debug)]
pub struct Relay {
    sender: mpsc::Sender<RelayCommand>,
    task: JoinHandle<()>,
    id: String,
}

impl Relay {
    /// Connect with default options.
    pub async fn connect(address: impl Into<String>, id: impl Into<String>) -> RelayResult<Self> {
        Self::connect_with(RelayOptions::new(address, id)).await
    }

    /// Dial the server and identify.
    ///
    /// Fails if the server is unreachable or does not accept the `id`;
    /// there is no retry at construction time.
    pub async fn connect_with(options: RelayOptions) -> RelayResult<Self> {
        let session = actor::identify(&options.address, &options.id).await?;

        let (sender, command_rx) = mpsc::channel(32);
        let id = options.id.clone();
        let task = tokio::spawn(actor::RelayActor::new(options, command_rx).run(session));

        Ok(Self { sender, task, id })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Register `collector` under `name` and announce it to the server.
    pub async fn add_collector(
        &self,
        name: impl Into<String>,
        tags: Vec<String>,
        collector: Box<dyn Collector>,
    ) -> RelayResult<()> {
        let name = name.into();
        if !is_valid_name(&name) {
            return Err(RelayError::ReservedName(name));
        }

        let (tx, rx) = oneshot::channel();
        self.send(RelayCommand::Add {
            name,
            tags,
            collector,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| RelayError::Closed)?
    }

    /// Drop the collector registered under `name`, if any.
    pub async fn remove_collector(&self, name: impl Into<String>) -> RelayResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(RelayCommand::Remove {
            name: name.into(),
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| RelayError::Closed)
    }

    /// Current readings of every collector plus `_connected`.
    ///
    /// This samples each collector, so stateful collectors advance.
    pub async fn info(&self) -> RelayResult<HashMap<String, f64>> {
        let (tx, rx) = oneshot::channel();
        self.send(RelayCommand::Info { respond_to: tx }).await?;
        rx.await.map_err(|_| RelayError::Closed)
    }

    /// Names of the registered collectors, sorted.
    pub async fn collectors(&self) -> RelayResult<Vec<String>> {
        let (tx, rx) = oneshot::channel();
        self.send(RelayCommand::Collectors { respond_to: tx }).await?;
        rx.await.map_err(|_| RelayError::Closed)
    }

    /// Send `close`, tear the socket down and stop reconnecting.
    pub async fn close(self) -> RelayResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(RelayCommand::Close { respond_to: tx }).await?;
        rx.await.map_err(|_| RelayError::Closed)?;
        let _ = self.task.await;
        Ok(())
    }

    async fn send(&self, command: RelayCommand) -> RelayResult<()> {
        self.sender
            .send(command)
            .await
            .map_err(|_| RelayError::Closed)
    }
}
