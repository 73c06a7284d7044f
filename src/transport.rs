//! Socket plumbing shared by the relay and the server
//!
//! A connection is split in two: the read half is drained by a dedicated
//! reader task that funnels decoded lines into a channel, the write half is
//! wrapped in a [`Link`] that can be shared between the owner of the
//! connection and whoever needs to write to it.

use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::trace;

use crate::protocol::Command;

/// Longest line accepted from a peer, terminator included
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// What the reader task reports
#[derive(Debug)]
pub enum ReaderEvent {
    /// A complete line, without its terminator
    Line(String),

    /// The read failed or the peer closed the socket; the reader has exited
    Failed(io::Error),
}

/// Write half of a connection
#[derive(Debug)]
pub struct Link {
    writer: Mutex<OwnedWriteHalf>,
    peer: SocketAddr,
}

impl Link {
    pub fn new(writer: OwnedWriteHalf, peer: SocketAddr) -> Self {
        Self {
            writer: Mutex::new(writer),
            peer,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Write one command followed by a newline.
    pub async fn send(&self, command: &Command) -> io::Result<()> {
        self.send_raw(&command.to_line()).await
    }

    /// Write a raw, already terminated line.
    pub async fn send_raw(&self, line: &str) -> io::Result<()> {
        trace!("{} <- {}", self.peer, line.trim_end());
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await
    }

    /// Shut the write direction down, which the peer sees as EOF.
    pub async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

/// Read one line from a buffered reader, failing on EOF or on a line
/// longer than [`MAX_LINE_LENGTH`].
pub async fn read_line(reader: &mut BufReader<OwnedReadHalf>) -> io::Result<String> {
    let mut line = String::new();
    let read = (&mut *reader)
        .take(MAX_LINE_LENGTH as u64)
        .read_line(&mut line)
        .await?;
    if read == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed by peer",
        ));
    }
    if read == MAX_LINE_LENGTH && !line.ends_with('\n') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("line longer than {MAX_LINE_LENGTH} bytes"),
        ));
    }
    Ok(line.trim_end_matches(['\n', '\r']).to_string())
}

/// Spawn a task that reads lines until the socket fails.
///
/// The task exits after reporting the first failure, or as soon as the
/// receiving side is dropped.
pub fn spawn_reader(
    mut reader: BufReader<OwnedReadHalf>,
) -> (JoinHandle<()>, mpsc::Receiver<ReaderEvent>) {
    let (tx, rx) = mpsc::channel(32);

    let handle = tokio::spawn(async move {
        loop {
            match read_line(&mut reader).await {
                Ok(line) => {
                    if tx.send(ReaderEvent::Line(line)).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    let _ = tx.send(ReaderEvent::Failed(e)).await;
                    return;
                }
            }
        }
    });

    (handle, rx)
}

/// Split a stream into a buffered read half and a [`Link`].
pub fn split(stream: TcpStream) -> io::Result<(BufReader<OwnedReadHalf>, Link)> {
    let peer = stream.peer_addr()?;
    let (read, write) = stream.into_split();
    Ok((BufReader::new(read), Link::new(write, peer)))
}
