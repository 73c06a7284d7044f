//! Helpers shared by the integration tests

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use pulse::server::{ClientSummary, Server, ServerOptions};
use pulse::MessageSet;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

pub const WAIT: Duration = Duration::from_secs(2);

/// Start a server on an ephemeral port whose published sets land in a channel.
pub async fn start_server() -> (Server, mpsc::UnboundedReceiver<MessageSet>) {
    start_server_with(ServerOptions::new("127.0.0.1:0")).await
}

pub async fn start_server_with(
    options: ServerOptions,
) -> (Server, mpsc::UnboundedReceiver<MessageSet>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let publisher = Arc::new(move |set: MessageSet| -> anyhow::Result<()> {
        tx.send(set)?;
        Ok(())
    });
    let server = Server::listen_with(options, publisher).await.unwrap();
    (server, rx)
}

pub async fn next_set(rx: &mut mpsc::UnboundedReceiver<MessageSet>) -> MessageSet {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("no message set published in time")
        .expect("publisher channel closed")
}

/// Wait until the registry satisfies `ready`.
pub async fn wait_for_clients<F>(server: &Server, ready: F) -> Vec<ClientSummary>
where
    F: Fn(&[ClientSummary]) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            let clients = server.clients().await.unwrap();
            if ready(&clients) {
                return clients;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("registry never reached the expected state")
}

/// Wait until client `id` has registered collector `name`.
pub async fn wait_for_collector(server: &Server, id: &str, name: &str) {
    wait_for_clients(server, |clients| {
        clients
            .iter()
            .any(|client| client.id == id && client.collectors.contains_key(name))
    })
    .await;
}

/// A hand-driven end of a protocol connection
pub struct Peer {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Peer {
    pub fn new(stream: TcpStream) -> Self {
        let (read, write) = stream.into_split();
        Self {
            reader: BufReader::new(read),
            writer: write,
        }
    }

    pub async fn connect(addr: SocketAddr) -> Self {
        Self::new(TcpStream::connect(addr).await.unwrap())
    }

    /// Connect to a real server and complete the handshake as `id`.
    pub async fn identify(addr: SocketAddr, id: &str) -> Self {
        let mut peer = Self::connect(addr).await;
        peer.send(&format!("id {id}")).await;
        assert_eq!(peer.recv().await.as_deref(), Some("ok"));
        assert_eq!(peer.recv().await.as_deref(), Some("beat 30"));
        peer
    }

    pub async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\n").as_bytes())
            .await
            .unwrap();
    }

    /// Next line, or `None` once the other side closed the connection.
    pub async fn recv(&mut self) -> Option<String> {
        let mut line = String::new();
        let read = tokio::time::timeout(WAIT, self.reader.read_line(&mut line))
            .await
            .expect("no line received in time");
        match read {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line.trim_end().to_string()),
        }
    }
}

/// Accept one relay on a fake server and answer its handshake.
pub async fn accept_relay(listener: &TcpListener, id: &str) -> Peer {
    let (stream, _) = tokio::time::timeout(WAIT, listener.accept())
        .await
        .expect("relay never connected")
        .unwrap();
    let mut peer = Peer::new(stream);
    assert_eq!(peer.recv().await, Some(format!("id {id}")));
    peer.send("ok").await;
    peer
}
