//! Protocol server
//!
//! Accepts relay connections, keeps the [`registry`] of what each relay can
//! answer for and turns their `got` replies into [`MessageSet`]s handed to a
//! [`Publisher`] (usually a [`Plexer`](crate::Plexer)).
//!
//! [`MessageSet`]: crate::MessageSet

mod connection;
pub mod error;
pub mod messages;
pub mod registry;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::plexer::Publisher;
use crate::protocol::MAX_HEARTBEAT_SECS;
use crate::scheduler;

pub use connection::{METRICS_TAG, message_set};
pub use error::ServerError;
pub use messages::{ClientSummary, CollectorTags};
pub use registry::RegistryHandle;

/// Heartbeat interval pushed to relays after the handshake
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(30);

/// Pause after a failed accept, e.g. when out of file descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Address to listen on, `host:port`
    pub address: String,

    /// Interval announced to relays with `beat`; silence for twice this
    /// long drops the relay
    pub heartbeat: Duration,
}

impl ServerOptions {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            heartbeat: DEFAULT_HEARTBEAT,
        }
    }

    pub fn heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }
}

/// A listening server
///
/// Dropping or closing it stops accepting new relays; live connections keep
/// running until they end on their own.
pub struct Server {
    registry: RegistryHandle,
    local_addr: SocketAddr,
    accept: JoinHandle<()>,
}

impl Server {
    /// Listen with the default heartbeat.
    pub async fn listen(
        address: impl Into<String>,
        publisher: Arc<dyn Publisher>,
    ) -> Result<Self, ServerError> {
        Self::listen_with(ServerOptions::new(address), publisher).await
    }

    pub async fn listen_with(
        options: ServerOptions,
        publisher: Arc<dyn Publisher>,
    ) -> Result<Self, ServerError> {
        let secs = options.heartbeat.as_secs();
        if secs == 0 || secs > MAX_HEARTBEAT_SECS {
            return Err(ServerError::InvalidHeartbeat(options.heartbeat));
        }

        let listener = TcpListener::bind(&options.address)
            .await
            .map_err(ServerError::Bind)?;
        let local_addr = listener.local_addr().map_err(ServerError::Bind)?;
        info!("listening for relays on {local_addr}");

        let registry = RegistryHandle::spawn();
        let accept = tokio::spawn(accept_loop(
            listener,
            options.heartbeat,
            registry.clone(),
            publisher,
        ));

        Ok(Self {
            registry,
            local_addr,
            accept,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle to the client registry, e.g. for a [`TagPoller`](crate::scheduler::TagPoller).
    pub fn registry(&self) -> RegistryHandle {
        self.registry.clone()
    }

    /// Poll relays that have any of `names`; `None` polls every collector.
    pub async fn poll(&self, names: Option<Vec<String>>) -> Result<usize> {
        self.registry.poll(names).await
    }

    pub async fn poll_all(&self) -> Result<usize> {
        self.registry.poll_all().await
    }

    /// Poll the listed relay ids only; `None` names asks for everything they have.
    pub async fn poll_ids(&self, ids: Vec<String>, names: Option<Vec<String>>) -> Result<usize> {
        self.registry.poll_ids(ids, names).await
    }

    pub async fn clients(&self) -> Result<Vec<ClientSummary>> {
        self.registry.clients().await
    }

    /// Poll on a fixed interval until `done` fires or is dropped.
    ///
    /// See [`scheduler::start_polling`] for how `ids` and `names` combine.
    pub fn start_polling(
        &self,
        ids: Option<Vec<String>>,
        names: Option<Vec<String>>,
        interval: Duration,
        done: oneshot::Receiver<()>,
    ) -> JoinHandle<()> {
        scheduler::start_polling(self.registry.clone(), ids, names, interval, done)
    }

    /// Stop accepting connections.
    pub fn close(&self) {
        self.accept.abort();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

#[instrument(skip_all, fields(heartbeat = ?heartbeat))]
async fn accept_loop(
    listener: TcpListener,
    heartbeat: Duration,
    registry: RegistryHandle,
    publisher: Arc<dyn Publisher>,
) {
    let mut next_conn = 0u64;

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("failed to accept connection: {e}");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };

        next_conn += 1;
        let connection = connection::Connection {
            conn: next_conn,
            heartbeat,
            registry: registry.clone(),
            publisher: publisher.clone(),
        };
        tracing::trace!("accepted {peer}");
        tokio::spawn(connection.run(stream));
    }
}
