//! One accepted relay connection
//!
//! The task performs the handshake, registers the client and then drains
//! the reader channel until the peer says `close`, goes silent for twice the
//! heartbeat interval, fails a read, or is superseded by a newer connection
//! with the same id.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::oneshot;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, instrument, trace, warn};

use crate::plexer::{Message, MessageSet, Publisher};
use crate::protocol::{Command, ProtocolError, Reading};
use crate::transport::{self, Link, ReaderEvent};

use super::messages::{CollectorTags, RegistryCommand};
use super::registry::RegistryHandle;

/// Shared tag marking every set produced from a `got`
pub const METRICS_TAG: &str = "metrics";

/// Bound on how long a fresh connection may take to say `id`
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Why the command loop stopped
#[derive(Debug)]
enum Exit {
    Closed,
    Superseded,
    Failed(io::Error),
    Protocol(ProtocolError),
}

pub(super) struct Connection {
    pub conn: u64,
    pub heartbeat: Duration,
    pub registry: RegistryHandle,
    pub publisher: Arc<dyn Publisher>,
}

impl Connection {
    #[instrument(skip_all, fields(peer = tracing::field::Empty, conn = self.conn))]
    pub(super) async fn run(self, stream: TcpStream) {
        let (mut reader, link) = match transport::split(stream) {
            Ok(parts) => parts,
            Err(e) => {
                warn!("unable to set up connection: {e}");
                return;
            }
        };
        tracing::Span::current().record("peer", tracing::field::display(link.peer()));

        let id = match tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake(&mut reader, &link)).await
        {
            Ok(Some(id)) => id,
            Ok(None) => {
                link.shutdown().await;
                return;
            }
            Err(_) => {
                debug!("no handshake within {HANDSHAKE_TIMEOUT:?}");
                link.shutdown().await;
                return;
            }
        };

        let link = Arc::new(link);
        let (shutdown, shutdown_rx) = oneshot::channel();
        let registered = self
            .registry
            .send(RegistryCommand::Register {
                id: id.clone(),
                conn: self.conn,
                link: link.clone(),
                shutdown,
            })
            .await;
        if let Err(e) = registered {
            warn!("unable to register '{id}': {e:#}");
            link.shutdown().await;
            return;
        }

        let greeting = async {
            link.send(&Command::Ok).await?;
            link.send(&Command::Beat(self.heartbeat.as_secs())).await
        };
        let exit = match greeting.await {
            Ok(()) => {
                debug!("'{id}' identified");
                self.serve(&id, reader, &link, shutdown_rx).await
            }
            Err(e) => Exit::Failed(e),
        };

        match &exit {
            Exit::Closed => debug!("'{id}' closed the session"),
            Exit::Superseded => debug!("'{id}' superseded by a newer connection"),
            Exit::Failed(e) => debug!("'{id}' dropped: {e}"),
            Exit::Protocol(e) => warn!("'{id}' sent an invalid command: {e}"),
        }

        if !matches!(exit, Exit::Superseded) {
            let _ = self
                .registry
                .send(RegistryCommand::Deregister {
                    id,
                    conn: self.conn,
                })
                .await;
        }
        link.shutdown().await;
    }

    async fn serve(
        &self,
        id: &str,
        reader: BufReader<OwnedReadHalf>,
        link: &Link,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) -> Exit {
        let (reader, mut lines) = transport::spawn_reader(reader);
        let silence = self.heartbeat * 2;
        let mut deadline = Instant::now() + silence;

        let exit = loop {
            tokio::select! {
                event = lines.recv() => {
                    let line = match event {
                        Some(ReaderEvent::Line(line)) => line,
                        Some(ReaderEvent::Failed(e)) => break Exit::Failed(e),
                        None => break Exit::Failed(io::Error::other("reader stopped")),
                    };
                    deadline = Instant::now() + silence;
                    trace!("{id} -> {line}");

                    if let Some(exit) = self.handle_line(id, &line, link).await {
                        break exit;
                    }
                }

                _ = sleep_until(deadline) => {
                    break Exit::Failed(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("silent for {silence:?}"),
                    ));
                }

                _ = &mut shutdown_rx => break Exit::Superseded,
            }
        };

        reader.abort();
        exit
    }

    async fn handle_line(&self, id: &str, line: &str, link: &Link) -> Option<Exit> {
        let command = match Command::parse(line) {
            Ok(command) => command,
            Err(e @ ProtocolError::UnknownCommand(_)) => {
                let _ = link.send_raw("unknown command\n").await;
                return Some(Exit::Protocol(e));
            }
            Err(e) => {
                warn!("ignoring line from '{id}': {e}");
                return None;
            }
        };

        let result = match command {
            Command::Ping => link.send(&Command::Pong).await,
            Command::Ok | Command::Pong => Ok(()),
            Command::Close => return Some(Exit::Closed),
            Command::Got(readings) => {
                self.publish(id, readings).await;
                Ok(())
            }
            Command::Add { name, tags } => {
                self.update(RegistryCommand::Add {
                    id: id.to_string(),
                    conn: self.conn,
                    name,
                    tags,
                })
                .await
            }
            Command::Remove(name) => {
                self.update(RegistryCommand::Remove {
                    id: id.to_string(),
                    conn: self.conn,
                    name,
                })
                .await
            }
            other => {
                warn!("unexpected command from '{id}': {other}");
                Ok(())
            }
        };

        result.err().map(Exit::Failed)
    }

    async fn update(&self, command: RegistryCommand) -> io::Result<()> {
        self.registry
            .send(command)
            .await
            .map_err(|e| io::Error::other(format!("{e:#}")))
    }

    async fn publish(&self, id: &str, readings: Vec<Reading>) {
        if readings.is_empty() {
            trace!("empty got from '{id}'");
            return;
        }

        let tags = match self.registry.tags(id, self.conn).await {
            Ok(Some(tags)) => tags,
            Ok(None) => {
                trace!("dropping got from unregistered '{id}'");
                return;
            }
            Err(e) => {
                warn!("unable to resolve tags for '{id}': {e:#}");
                return;
            }
        };

        let set = message_set(id, readings, &tags);
        if let Err(e) = self.publisher.publish(set).await {
            warn!("publishing readings from '{id}' failed: {e:#}");
        }
    }
}

/// Read the first line and accept only `id <name>`.
///
/// Anything else gets a diagnostic and `None`.
async fn handshake(reader: &mut BufReader<OwnedReadHalf>, link: &Link) -> Option<String> {
    let line = match transport::read_line(reader).await {
        Ok(line) => line,
        Err(e) => {
            debug!("connection dropped before handshake: {e}");
            return None;
        }
    };

    let diagnostic = match Command::parse(&line) {
        Ok(Command::Id(id)) => return Some(id),
        Err(ProtocolError::MissingArgument("id")) => "missing id",
        _ => "identify first with the 'id' command",
    };

    debug!("rejected handshake '{line}'");
    let _ = link.send_raw(&format!("{diagnostic}\n")).await;
    None
}

/// Build the set published for one `got` from client `id`.
pub fn message_set(id: &str, readings: Vec<Reading>, tags: &CollectorTags) -> MessageSet {
    let messages = readings
        .into_iter()
        .map(|reading| Message {
            tags: tags.get(&reading.name).cloned().unwrap_or_default(),
            id: reading.key,
            data: reading.value,
        })
        .collect();

    MessageSet {
        tags: vec![METRICS_TAG.to_string(), format!("host:{id}")],
        messages,
    }
}
