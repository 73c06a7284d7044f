//! RegistryActor - owns the table of connected relays
//!
//! The actor is the only place the id → client map lives. Everything else
//! holds a [`RegistryHandle`] and talks to it over a channel.
//!
//! ## Polling
//!
//! - [`RegistryHandle::poll`] sends one shared `get n1,n2` line to every
//!   client that registered at least one of the names. A client that only
//!   has some of them simply skips the others.
//! - [`RegistryHandle::poll_all`] sends each client a personalised `get`
//!   listing exactly its own collectors.
//!
//! Writes happen concurrently on a spawned task. A client whose write fails
//! is evicted right away; its relay is expected to reconnect on its own.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, instrument, trace, warn};

use crate::protocol::Command;
use crate::transport::Link;

use super::messages::{ClientSummary, CollectorTags, RegistryCommand};

/// Server-side record of one connected relay
struct ClientRecord {
    conn: u64,
    link: Arc<Link>,
    collectors: CollectorTags,
    /// Never sent on; dropping it tells the connection task to stop
    _shutdown: oneshot::Sender<()>,
}

impl ClientRecord {
    fn includes_any(&self, names: &[String]) -> bool {
        names.iter().any(|name| self.collectors.contains_key(name))
    }
}

/// A pending `get` write
struct Dispatch {
    id: String,
    conn: u64,
    link: Arc<Link>,
    line: String,
}

pub struct RegistryActor {
    clients: HashMap<String, ClientRecord>,
    command_rx: mpsc::Receiver<RegistryCommand>,
    /// Used by write tasks to report failures without keeping the actor alive
    evict_tx: mpsc::WeakSender<RegistryCommand>,
}

impl RegistryActor {
    pub fn new(
        command_rx: mpsc::Receiver<RegistryCommand>,
        evict_tx: mpsc::WeakSender<RegistryCommand>,
    ) -> Self {
        Self {
            clients: HashMap::new(),
            command_rx,
            evict_tx,
        }
    }

    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("starting registry actor");

        while let Some(command) = self.command_rx.recv().await {
            self.handle(command);
        }

        debug!("registry actor stopped");
    }

    fn handle(&mut self, command: RegistryCommand) {
        match command {
            RegistryCommand::Register {
                id,
                conn,
                link,
                shutdown,
            } => {
                let record = ClientRecord {
                    conn,
                    link,
                    collectors: CollectorTags::new(),
                    _shutdown: shutdown,
                };
                if let Some(old) = self.clients.insert(id.clone(), record) {
                    warn!(
                        "'{id}' re-identified, closing superseded connection from {}",
                        old.link.peer()
                    );
                } else {
                    debug!("registered '{id}'");
                }
            }

            RegistryCommand::Deregister { id, conn } => {
                if self.remove_if_current(&id, conn) {
                    debug!("deregistered '{id}'");
                }
            }

            RegistryCommand::Evict { id, conn } => {
                if self.remove_if_current(&id, conn) {
                    warn!("evicted '{id}' after a failed write");
                }
            }

            RegistryCommand::Add {
                id,
                conn,
                name,
                tags,
            } => {
                if let Some(record) = self.current_mut(&id, conn) {
                    trace!("'{id}' added collector '{name}' with tags {tags:?}");
                    record.collectors.insert(name, dedup(tags));
                }
            }

            RegistryCommand::Remove { id, conn, name } => {
                if let Some(record) = self.current_mut(&id, conn) {
                    trace!("'{id}' removed collector '{name}'");
                    record.collectors.remove(&name);
                }
            }

            RegistryCommand::Tags {
                id,
                conn,
                respond_to,
            } => {
                let tags = self
                    .current_mut(&id, conn)
                    .map(|record| record.collectors.clone());
                let _ = respond_to.send(tags);
            }

            RegistryCommand::Poll { names, respond_to } => {
                let line = Command::Get(names.clone()).to_line();
                let targets: Vec<_> = self
                    .clients
                    .iter()
                    .filter(|(_, record)| record.includes_any(&names))
                    .map(|(id, record)| Dispatch {
                        id: id.clone(),
                        conn: record.conn,
                        link: record.link.clone(),
                        line: line.clone(),
                    })
                    .collect();
                let _ = respond_to.send(self.dispatch(targets));
            }

            RegistryCommand::PollAll { respond_to } => {
                let targets: Vec<_> = self
                    .clients
                    .iter()
                    .filter(|(_, record)| !record.collectors.is_empty())
                    .map(|(id, record)| Dispatch {
                        id: id.clone(),
                        conn: record.conn,
                        link: record.link.clone(),
                        line: Command::Get(record.collectors.keys().cloned().collect())
                            .to_line(),
                    })
                    .collect();
                let _ = respond_to.send(self.dispatch(targets));
            }

            RegistryCommand::PollIds {
                ids,
                names,
                respond_to,
            } => {
                let shared = names.map(|names| Command::Get(names).to_line());
                let targets: Vec<_> = ids
                    .iter()
                    .filter_map(|id| self.clients.get(id).map(|record| (id, record)))
                    .filter(|(_, record)| shared.is_some() || !record.collectors.is_empty())
                    .map(|(id, record)| Dispatch {
                        id: id.clone(),
                        conn: record.conn,
                        link: record.link.clone(),
                        line: shared.clone().unwrap_or_else(|| {
                            Command::Get(record.collectors.keys().cloned().collect()).to_line()
                        }),
                    })
                    .collect();
                let _ = respond_to.send(self.dispatch(targets));
            }

            RegistryCommand::Clients { respond_to } => {
                let mut clients: Vec<_> = self
                    .clients
                    .iter()
                    .map(|(id, record)| ClientSummary {
                        id: id.clone(),
                        peer: record.link.peer().to_string(),
                        collectors: record.collectors.clone(),
                    })
                    .collect();
                clients.sort_by(|a, b| a.id.cmp(&b.id));
                let _ = respond_to.send(clients);
            }
        }
    }

    fn current_mut(&mut self, id: &str, conn: u64) -> Option<&mut ClientRecord> {
        self.clients
            .get_mut(id)
            .filter(|record| record.conn == conn)
    }

    fn remove_if_current(&mut self, id: &str, conn: u64) -> bool {
        if self.current_mut(id, conn).is_some() {
            self.clients.remove(id);
            true
        } else {
            false
        }
    }

    /// Write every `get` concurrently; report failed clients for eviction.
    fn dispatch(&self, targets: Vec<Dispatch>) -> usize {
        let count = targets.len();
        if count == 0 {
            return 0;
        }

        trace!("dispatching get to {count} clients");
        let evict_tx = self.evict_tx.clone();
        tokio::spawn(async move {
            let writes = targets.into_iter().map(|target| async move {
                match target.link.send_raw(&target.line).await {
                    Ok(()) => None,
                    Err(e) => {
                        warn!("failed to poll '{}': {e}", target.id);
                        Some((target.id, target.conn))
                    }
                }
            });

            let failed: Vec<_> = join_all(writes).await.into_iter().flatten().collect();
            if failed.is_empty() {
                return;
            }

            let Some(evict_tx) = evict_tx.upgrade() else {
                return;
            };
            for (id, conn) in failed {
                let _ = evict_tx.send(RegistryCommand::Evict { id, conn }).await;
            }
        });

        count
    }
}

fn dedup(tags: Vec<String>) -> Vec<String> {
    let mut unique = Vec::with_capacity(tags.len());
    for tag in tags {
        if !unique.contains(&tag) {
            unique.push(tag);
        }
    }
    unique
}

/// Handle for talking to a [`RegistryActor`]
///
/// Cloneable; the actor stops once every handle is dropped.
#[derive(Clone)]
pub struct RegistryHandle {
    sender: mpsc::Sender<RegistryCommand>,
}

impl RegistryHandle {
    /// Spawn a new registry actor.
    pub fn spawn() -> Self {
        let (sender, command_rx) = mpsc::channel(256);
        let actor = RegistryActor::new(command_rx, sender.downgrade());
        tokio::spawn(actor.run());
        Self { sender }
    }

    pub(super) async fn send(&self, command: RegistryCommand) -> Result<()> {
        self.sender
            .send(command)
            .await
            .context("registry actor is gone")
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> RegistryCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send(command(tx)).await?;
        rx.await.context("registry actor dropped the request")
    }

    /// Poll the clients that have any of `names`; `None` polls everything.
    ///
    /// Returns the number of clients a `get` was sent to.
    pub async fn poll(&self, names: Option<Vec<String>>) -> Result<usize> {
        match names {
            None => self.poll_all().await,
            Some(names) => {
                self.request(|respond_to| RegistryCommand::Poll { names, respond_to })
                    .await
            }
        }
    }

    /// Poll every client for all of its own collectors.
    pub async fn poll_all(&self) -> Result<usize> {
        self.request(|respond_to| RegistryCommand::PollAll { respond_to })
            .await
    }

    /// Poll the listed client ids only; `None` names works like [`poll_all`](Self::poll_all).
    pub async fn poll_ids(&self, ids: Vec<String>, names: Option<Vec<String>>) -> Result<usize> {
        self.request(|respond_to| RegistryCommand::PollIds {
            ids,
            names,
            respond_to,
        })
        .await
    }

    pub async fn clients(&self) -> Result<Vec<ClientSummary>> {
        self.request(|respond_to| RegistryCommand::Clients { respond_to })
            .await
    }

    pub(super) async fn tags(&self, id: &str, conn: u64) -> Result<Option<CollectorTags>> {
        self.request(|respond_to| RegistryCommand::Tags {
            id: id.to_string(),
            conn,
            respond_to,
        })
        .await
    }
}
