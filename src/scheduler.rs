//! Poll scheduling
//!
//! Two ways to drive the registry:
//!
//! - [`start_polling`] ticks at one fixed interval and polls a fixed
//!   selection, once immediately and then on every tick.
//! - [`TagPoller`] lets many subscribers ask for individual metric names at
//!   their own intervals. It ticks every second and polls every name whose
//!   interval divides the current unix second, so subscribers with the same
//!   interval are polled on the same tick.
//!
//! Missed ticks are skipped, never queued.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, instrument, trace, warn};

use crate::server::RegistryHandle;

/// Used instead of a zero polling period
pub const MIN_PERIOD: Duration = Duration::from_secs(1);

/// Poll the registry every `period` until `done` fires or is dropped.
///
/// | `ids`   | `names` | each tick                                      |
/// |---------|---------|------------------------------------------------|
/// | `None`  | `None`  | poll every client for all its collectors       |
/// | `None`  | `Some`  | shared `get names` to clients that have any    |
/// | `Some`  | either  | same, restricted to the listed client ids      |
///
/// A zero `period` is replaced by [`MIN_PERIOD`].
pub fn start_polling(
    registry: RegistryHandle,
    ids: Option<Vec<String>>,
    names: Option<Vec<String>>,
    period: Duration,
    mut done: oneshot::Receiver<()>,
) -> JoinHandle<()> {
    let period = if period.is_zero() {
        warn!("zero polling period, polling every {MIN_PERIOD:?}");
        MIN_PERIOD
    } else {
        period
    };

    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        debug!("polling every {period:?}");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let polled = match &ids {
                        Some(ids) => registry.poll_ids(ids.clone(), names.clone()).await,
                        None => registry.poll(names.clone()).await,
                    };
                    match polled {
                        Ok(count) => trace!("polled {count} clients"),
                        Err(e) => {
                            warn!("stopping scheduler: {e:#}");
                            break;
                        }
                    }
                }

                _ = &mut done => break,
            }
        }

        debug!("scheduler stopped");
    })
}

/// Names due on unix second `secs`, sorted and deduplicated.
pub fn names_due<'a>(
    subscriptions: impl IntoIterator<Item = (&'a String, &'a u64)>,
    secs: u64,
) -> Vec<String> {
    subscriptions
        .into_iter()
        .filter(|(_, interval)| **interval > 0 && secs % **interval == 0)
        .map(|(name, _)| name.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

enum PollerCommand {
    Register {
        respond_to: oneshot::Sender<u64>,
    },
    Subscribe {
        client: u64,
        name: String,
        interval: u64,
    },
    CloseClient {
        client: u64,
    },
    Subscriptions {
        respond_to: oneshot::Sender<HashMap<String, Vec<u64>>>,
    },
    Shutdown,
}

struct TagPollerActor {
    registry: RegistryHandle,
    clients: HashMap<u64, HashMap<String, u64>>,
    next_client: u64,
    command_rx: mpsc::Receiver<PollerCommand>,
}

impl TagPollerActor {
    #[instrument(skip(self))]
    async fn run(mut self) {
        debug!("starting tag poller");

        let mut ticker = interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,

                command = self.command_rx.recv() => match command {
                    Some(PollerCommand::Register { respond_to }) => {
                        self.next_client += 1;
                        self.clients.insert(self.next_client, HashMap::new());
                        let _ = respond_to.send(self.next_client);
                    }
                    Some(PollerCommand::Subscribe { client, name, interval }) => {
                        let Some(names) = self.clients.get_mut(&client) else {
                            continue;
                        };
                        if interval == 0 {
                            trace!("client {client} unsubscribed from '{name}'");
                            names.remove(&name);
                        } else {
                            trace!("client {client} polls '{name}' every {interval}s");
                            names.insert(name, interval);
                        }
                    }
                    Some(PollerCommand::CloseClient { client }) => {
                        self.clients.remove(&client);
                    }
                    Some(PollerCommand::Subscriptions { respond_to }) => {
                        let _ = respond_to.send(self.subscriptions());
                    }
                    Some(PollerCommand::Shutdown) | None => break,
                },
            }
        }

        debug!("tag poller stopped");
    }

    async fn tick(&self) {
        let secs = Utc::now().timestamp().max(0) as u64;
        let due = names_due(self.clients.values().flatten(), secs);
        if due.is_empty() {
            return;
        }

        trace!("polling {due:?}");
        if let Err(e) = self.registry.poll(Some(due)).await {
            warn!("tag poll failed: {e:#}");
        }
    }

    fn subscriptions(&self) -> HashMap<String, Vec<u64>> {
        let mut all: HashMap<String, Vec<u64>> = HashMap::new();
        for (name, interval) in self.clients.values().flatten() {
            all.entry(name.clone()).or_default().push(*interval);
        }
        for intervals in all.values_mut() {
            intervals.sort_unstable();
        }
        all
    }
}

/// Handle to the shared per-name poller
#[derive(Clone)]
pub struct TagPoller {
    sender: mpsc::Sender<PollerCommand>,
}

impl TagPoller {
    pub fn spawn(registry: RegistryHandle) -> Self {
        let (sender, command_rx) = mpsc::channel(64);
        let actor = TagPollerActor {
            registry,
            clients: HashMap::new(),
            next_client: 0,
            command_rx,
        };
        tokio::spawn(actor.run());
        Self { sender }
    }

    /// Open a new subscriber.
    pub async fn client(&self) -> Result<PollerClient> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PollerCommand::Register { respond_to: tx })
            .await
            .context("tag poller is gone")?;
        let id = rx.await.context("tag poller dropped the request")?;
        Ok(PollerClient {
            id,
            sender: self.sender.clone(),
        })
    }

    /// Every subscribed name with the intervals asked for it.
    pub async fn subscriptions(&self) -> Result<HashMap<String, Vec<u64>>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PollerCommand::Subscriptions { respond_to: tx })
            .await
            .context("tag poller is gone")?;
        rx.await.context("tag poller dropped the request")
    }

    /// Stop ticking. Clients left open become no-ops.
    pub async fn close(&self) {
        let _ = self.sender.send(PollerCommand::Shutdown).await;
    }
}

/// One subscriber of a [`TagPoller`]
pub struct PollerClient {
    id: u64,
    sender: mpsc::Sender<PollerCommand>,
}

impl PollerClient {
    /// Poll `name` every `interval` seconds; `0` unsubscribes.
    pub async fn subscribe(&self, name: impl Into<String>, interval: u64) -> Result<()> {
        self.sender
            .send(PollerCommand::Subscribe {
                client: self.id,
                name: name.into(),
                interval,
            })
            .await
            .context("tag poller is gone")
    }

    /// Drop every name this client subscribed to.
    pub async fn close(self) {
        let _ = self
            .sender
            .send(PollerCommand::CloseClient { client: self.id })
            .await;
    }
}
