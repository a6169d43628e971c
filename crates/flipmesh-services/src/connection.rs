//! A single TCP link to a peer.
//!
//! The stream is split: the read half is used only by the connection's
//! receive task, the write half is shared by everyone who sends (the owning
//! task, broadcasts) and is serialised behind a mutex. Closing is a watch
//! flag that every pending read or write races, so `close()` unblocks a
//! reader parked on a silent peer.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};

use flipmesh_core::wire::{self, PortPreamble};
use flipmesh_core::{Packet, WireError};

pub struct Connection {
    remote_addr: SocketAddr,
    reader: Mutex<BufReader<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    closed: watch::Sender<bool>,
}

impl Connection {
    /// Wrap an established stream (inbound accept or finished dial).
    pub fn from_stream(stream: TcpStream) -> Result<Self, ConnectionError> {
        let remote_addr = stream.peer_addr()?;
        // Packets are a few bytes each; don't let Nagle sit on them.
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, %remote_addr, "failed to set TCP_NODELAY");
        }
        let (read_half, write_half) = stream.into_split();
        let (closed, _) = watch::channel(false);
        Ok(Self {
            remote_addr,
            reader: Mutex::new(BufReader::new(read_half)),
            writer: Mutex::new(Some(write_half)),
            closed,
        })
    }

    /// Dial `addr`, giving up after `timeout`.
    pub async fn dial(addr: SocketAddr, timeout: Duration) -> Result<Self, ConnectionError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ConnectionError::Timeout(timeout))??;
        Self::from_stream(stream)
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Write `data` with a single write call.
    ///
    /// Fails with `ShortWrite` if the transport accepted fewer bytes than
    /// given. There is no retry of the remainder.
    pub async fn send(&self, data: &[u8]) -> Result<(), ConnectionError> {
        tokio::select! {
            biased;
            _ = self.wait_closed() => Err(ConnectionError::ConnectionClosed),
            result = self.write_once(data) => result,
        }
    }

    pub async fn send_packet(&self, packet: &Packet) -> Result<(), ConnectionError> {
        self.send(&packet.encode()).await
    }

    /// Send the untagged listen-port preamble.
    pub async fn send_preamble(&self, listen_port: u16) -> Result<(), ConnectionError> {
        self.send(&PortPreamble::new(listen_port).to_bytes()).await
    }

    /// Read exactly `len` bytes, accumulating partial reads.
    pub async fn receive(&self, len: usize) -> Result<Bytes, ConnectionError> {
        tokio::select! {
            biased;
            _ = self.wait_closed() => Err(ConnectionError::ConnectionClosed),
            result = self.read_bytes(len) => result,
        }
    }

    /// Read one tagged packet.
    pub async fn receive_packet(&self) -> Result<Packet, ConnectionError> {
        tokio::select! {
            biased;
            _ = self.wait_closed() => Err(ConnectionError::ConnectionClosed),
            result = self.read_packet() => result,
        }
    }

    /// Read the untagged listen-port preamble.
    pub async fn receive_preamble(&self) -> Result<u16, ConnectionError> {
        tokio::select! {
            biased;
            _ = self.wait_closed() => Err(ConnectionError::ConnectionClosed),
            result = self.read_preamble() => result,
        }
    }

    /// Release the stream. Safe to call any number of times; every later
    /// operation fails with `ConnectionClosed`.
    pub async fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        tracing::trace!(remote_addr = %self.remote_addr, "closing connection");
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }

    async fn write_once(&self, data: &[u8]) -> Result<(), ConnectionError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ConnectionError::ConnectionClosed)?;
        let written = writer.write(data).await?;
        if written != data.len() {
            return Err(ConnectionError::ShortWrite {
                written,
                expected: data.len(),
            });
        }
        Ok(())
    }

    async fn read_bytes(&self, len: usize) -> Result<Bytes, ConnectionError> {
        let mut reader = self.reader.lock().await;
        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    async fn read_packet(&self) -> Result<Packet, ConnectionError> {
        let mut reader = self.reader.lock().await;
        Ok(wire::read_packet(&mut *reader).await?)
    }

    async fn read_preamble(&self) -> Result<u16, ConnectionError> {
        let mut reader = self.reader.lock().await;
        Ok(wire::read_preamble(&mut *reader).await?)
    }

    async fn wait_closed(&self) {
        let mut rx = self.closed.subscribe();
        // The sender lives as long as `self`, so this only returns once closed.
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Failures local to one connection. Any of them ends that connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("stream ended before the requested bytes were read")]
    ShortRead,

    #[error("short write: {written} of {expected} bytes accepted")]
    ShortWrite { written: usize, expected: usize },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("dial timed out after {0:?}")]
    Timeout(Duration),

    #[error("i/o error: {0}")]
    Io(io::Error),

    #[error("protocol error: {0}")]
    Wire(WireError),
}

impl From<io::Error> for ConnectionError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            ConnectionError::ShortRead
        } else {
            ConnectionError::Io(e)
        }
    }
}

impl From<WireError> for ConnectionError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::ShortRead => ConnectionError::ShortRead,
            WireError::Io(io) => ConnectionError::from(io),
            other => ConnectionError::Wire(other),
        }
    }
}
