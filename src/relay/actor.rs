//! RelayActor - owns the collector set and the server connection
//!
//! ## State machine
//!
//! ```text
//! Connecting → Identified → Serving ⇄ Reconnecting
//!                              │            │
//!                              └──► Closed ◄┘
//! ```
//!
//! While serving, a single loop selects over:
//!
//! 1. lines pushed by the reader task (or its failure)
//! 2. the heartbeat timer, which writes `ping` and arms a pong deadline of
//!    half the interval
//! 3. the pong deadline itself
//! 4. commands from the [`Relay`](super::Relay) handle
//!
//! Any transport failure drops the socket and moves to reconnecting, which
//! redials forever with a fixed delay and re-announces every collector
//! before serving again.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep_until, timeout};
use tracing::{debug, info, instrument, trace, warn};

use crate::collector::Collector;
use crate::protocol::{CONNECTED, Command, MAX_HEARTBEAT_SECS, format_reading};
use crate::transport::{self, Link, ReaderEvent};

use super::{DEFAULT_HEARTBEAT, RelayOptions};
use super::error::{RelayError, RelayResult};
use super::messages::RelayCommand;

/// Upper bound for dialing plus the `id`/`ok` exchange
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A collector with the tags announced alongside it
struct TaggedCollector {
    collector: Box<dyn Collector>,
    tags: Vec<String>,
}

/// A live, identified connection
pub(super) struct Session {
    link: Link,
    lines: mpsc::Receiver<ReaderEvent>,
    reader: JoinHandle<()>,
}

impl Session {
    fn start(reader: BufReader<OwnedReadHalf>, link: Link) -> Self {
        let (reader, lines) = transport::spawn_reader(reader);
        Self {
            link,
            lines,
            reader,
        }
    }

    async fn end(self) {
        self.reader.abort();
        self.link.shutdown().await;
    }
}

/// Why the serving loop stopped
enum Disconnect {
    /// The connection broke; reconnect
    Lost(io::Error),
    /// The relay was closed; stop for good
    Closed,
}

/// What to do after handling a command
enum Flow {
    Continue,
    Lost(io::Error),
    Close,
}

/// Dial the server and perform the `id`/`ok` handshake.
pub(super) async fn identify(address: &str, id: &str) -> RelayResult<Session> {
    match timeout(CONNECT_TIMEOUT, handshake(address, id)).await {
        Ok(result) => result,
        Err(_) => Err(RelayError::Connection(io::Error::new(
            io::ErrorKind::TimedOut,
            "timed out while identifying",
        ))),
    }
}

async fn handshake(address: &str, id: &str) -> RelayResult<Session> {
    let stream = TcpStream::connect(address).await?;
    let (mut reader, link) = transport::split(stream)?;

    link.send(&Command::Id(id.to_string())).await?;
    let reply = transport::read_line(&mut reader).await?;
    if reply != "ok" {
        return Err(RelayError::UnableToIdentify(reply));
    }

    Ok(Session::start(reader, link))
}

async fn announce(link: &Link, adds: Vec<Command>) -> io::Result<()> {
    for add in &adds {
        link.send(add).await?;
    }
    Ok(())
}

/// Keep `heartbeat` if a timer can run on it, else fall back to the default.
fn usable_heartbeat(heartbeat: Duration) -> Duration {
    if heartbeat.is_zero() || heartbeat > Duration::from_secs(MAX_HEARTBEAT_SECS) {
        warn!("unusable heartbeat interval {heartbeat:?}, using {DEFAULT_HEARTBEAT:?}");
        DEFAULT_HEARTBEAT
    } else {
        heartbeat
    }
}

pub(super) struct RelayActor {
    options: RelayOptions,
    collectors: BTreeMap<String, TaggedCollector>,
    command_rx: mpsc::Receiver<RelayCommand>,
    heartbeat: Duration,
}

impl RelayActor {
    pub(super) fn new(options: RelayOptions, command_rx: mpsc::Receiver<RelayCommand>) -> Self {
        let heartbeat = usable_heartbeat(options.heartbeat);
        Self {
            options,
            collectors: BTreeMap::new(),
            command_rx,
            heartbeat,
        }
    }

    #[instrument(skip_all, fields(relay = %self.options.id))]
    pub(super) async fn run(mut self, session: Session) {
        debug!("relay identified with {}", self.options.address);
        let mut session = session;

        loop {
            match self.serve(&mut session).await {
                Disconnect::Closed => {
                    session.end().await;
                    break;
                }
                Disconnect::Lost(e) => {
                    warn!("lost connection to {}: {e}", self.options.address);
                    session.end().await;
                    match self.reconnect().await {
                        Some(fresh) => session = fresh,
                        None => break,
                    }
                }
            }
        }

        debug!("relay stopped");
    }

    async fn serve(&mut self, session: &mut Session) -> Disconnect {
        let mut period = self.heartbeat;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pong_deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                event = session.lines.recv() => {
                    let line = match event {
                        Some(ReaderEvent::Line(line)) => line,
                        Some(ReaderEvent::Failed(e)) => return Disconnect::Lost(e),
                        None => return Disconnect::Lost(io::Error::other("reader stopped")),
                    };
                    pong_deadline = None;

                    if let Err(e) = self.handle_line(&line, &session.link).await {
                        return Disconnect::Lost(e);
                    }

                    if self.heartbeat != period {
                        period = self.heartbeat;
                        heartbeat = interval_at(Instant::now() + period, period);
                        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    }
                }

                _ = heartbeat.tick() => {
                    if let Err(e) = session.link.send(&Command::Ping).await {
                        return Disconnect::Lost(e);
                    }
                    if pong_deadline.is_none() {
                        pong_deadline = Some(Instant::now() + period / 2);
                    }
                }

                _ = sleep_until(pong_deadline.unwrap_or_else(Instant::now)), if pong_deadline.is_some() => {
                    return Disconnect::Lost(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "no pong within half a heartbeat",
                    ));
                }

                command = self.command_rx.recv() => {
                    match self.handle_command(command, Some(&session.link)).await {
                        Flow::Continue => {}
                        Flow::Lost(e) => return Disconnect::Lost(e),
                        Flow::Close => return Disconnect::Closed,
                    }
                }
            }
        }
    }

    /// Redial until a session is established or the relay is closed.
    async fn reconnect(&mut self) -> Option<Session> {
        let mut attempt = 0u64;

        loop {
            let delay = tokio::time::sleep(self.options.reconnect_delay);
            tokio::pin!(delay);

            loop {
                tokio::select! {
                    _ = &mut delay => break,
                    command = self.command_rx.recv() => {
                        if let Flow::Close = self.handle_command(command, None).await {
                            debug!("closed while reconnecting");
                            return None;
                        }
                    }
                }
            }

            attempt += 1;
            trace!("reconnect attempt {attempt} to {}", self.options.address);

            let session = match identify(&self.options.address, &self.options.id).await {
                Ok(session) => session,
                Err(e) => {
                    debug!("reconnect attempt {attempt} failed: {e}");
                    continue;
                }
            };

            match announce(&session.link, self.announcements()).await {
                Ok(()) => {
                    info!(
                        "reconnected to {} after {attempt} attempts, re-announced {} collectors",
                        self.options.address,
                        self.collectors.len()
                    );
                    return Some(session);
                }
                Err(e) => {
                    debug!("re-announcing collectors failed: {e}");
                    session.end().await;
                }
            }
        }
    }

    /// One `add` per registered collector, in name order.
    fn announcements(&self) -> Vec<Command> {
        self.collectors
            .iter()
            .map(|(name, tagged)| Command::Add {
                name: name.clone(),
                tags: tagged.tags.clone(),
            })
            .collect()
    }

    async fn handle_line(&mut self, line: &str, link: &Link) -> io::Result<()> {
        let command = match Command::parse(line) {
            Ok(command) => command,
            Err(e) => {
                warn!("ignoring line from server: {e}");
                return Ok(());
            }
        };

        match command {
            Command::Ok | Command::Pong => {}
            Command::Beat(0) => warn!("ignoring zero heartbeat interval"),
            Command::Beat(secs) if secs > MAX_HEARTBEAT_SECS => {
                warn!("ignoring heartbeat interval of {secs}s, above {MAX_HEARTBEAT_SECS}s")
            }
            Command::Beat(secs) => {
                debug!("adopting heartbeat interval of {secs}s");
                self.heartbeat = Duration::from_secs(secs);
            }
            Command::Get(names) => {
                let readings = self.collect(&names);
                link.send_raw(&format!("got {}\n", readings.join(",")))
                    .await?;
            }
            Command::Close => {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "server closed the session",
                ));
            }
            other => warn!("unexpected command from server: {other}"),
        }

        Ok(())
    }

    /// Sample the requested collectors, skipping unknown names.
    fn collect(&mut self, names: &[String]) -> Vec<String> {
        let mut readings = vec![];
        for name in names {
            let Some(tagged) = self.collectors.get_mut(name) else {
                trace!("skipping unknown collector '{name}'");
                continue;
            };
            let mut values: Vec<_> = tagged.collector.collect().into_iter().collect();
            values.sort_by(|a, b| a.0.cmp(&b.0));
            readings.extend(
                values
                    .into_iter()
                    .map(|(sub, value)| format_reading(name, &sub, value)),
            );
        }
        readings
    }

    async fn handle_command(&mut self, command: Option<RelayCommand>, link: Option<&Link>) -> Flow {
        let Some(command) = command else {
            debug!("all relay handles dropped, closing");
            if let Some(link) = link {
                let _ = link.send(&Command::Close).await;
            }
            return Flow::Close;
        };

        match command {
            RelayCommand::Add {
                name,
                tags,
                collector,
                respond_to,
            } => {
                if self.collectors.contains_key(&name) {
                    let _ = respond_to.send(Err(RelayError::DuplicateCollector(name)));
                    return Flow::Continue;
                }

                let mut flow = Flow::Continue;
                if let Some(link) = link {
                    let add = Command::Add {
                        name: name.clone(),
                        tags: tags.clone(),
                    };
                    if let Err(e) = link.send(&add).await {
                        flow = Flow::Lost(e);
                    }
                }

                debug!("registered collector '{name}'");
                self.collectors
                    .insert(name, TaggedCollector { collector, tags });
                let _ = respond_to.send(Ok(()));
                flow
            }

            RelayCommand::Remove { name, respond_to } => {
                let mut flow = Flow::Continue;
                if self.collectors.remove(&name).is_some() {
                    debug!("removed collector '{name}'");
                    if let Some(link) = link
                        && let Err(e) = link.send(&Command::Remove(name)).await
                    {
                        flow = Flow::Lost(e);
                    }
                }
                let _ = respond_to.send(());
                flow
            }

            RelayCommand::Info { respond_to } => {
                let connected = if link.is_some() { 1.0 } else { 0.0 };
                let mut info = HashMap::from([(CONNECTED.to_string(), connected)]);
                for (name, tagged) in self.collectors.iter_mut() {
                    for (sub, value) in tagged.collector.collect() {
                        let key = if sub.is_empty() {
                            name.clone()
                        } else {
                            format!("{name}-{sub}")
                        };
                        info.insert(key, value);
                    }
                }
                let _ = respond_to.send(info);
                Flow::Continue
            }

            RelayCommand::Collectors { respond_to } => {
                let _ = respond_to.send(self.collectors.keys().cloned().collect());
                Flow::Continue
            }

            RelayCommand::Close { respond_to } => {
                if let Some(link) = link {
                    let _ = link.send(&Command::Close).await;
                }
                let _ = respond_to.send(());
                Flow::Close
            }
        }
    }
}
