//! Peer link connections

use crate::reactor::Direction;
use mio::event::Source;
use mio::net::TcpStream;
use parking_lot::Mutex;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Socket channel shared between a connection and its handlers
pub type SocketChannel = Arc<Mutex<dyn Source + Send>>;

/// Process-unique connection identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// Allocate the next identifier
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A peer link as seen by its selection handlers
pub trait Connection: Send + Sync {
    fn id(&self) -> ConnectionId;

    /// The non-blocking channel the handler for `direction` registers with
    /// its readiness loop.
    ///
    /// A poller may own a source only once, so each direction gets its own
    /// handle on the same socket.
    fn socket_channel(&self, direction: Direction) -> SocketChannel;

    /// Whether the link is still open
    fn live(&self) -> bool;

    /// Close the link. Safe to call any number of times; only the first call
    /// has an effect.
    fn close(&self);
}

/// TCP peer link
pub struct TcpConnection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    reader: Arc<Mutex<TcpStream>>,
    writer: Arc<Mutex<TcpStream>>,
    live: AtomicBool,
}

impl TcpConnection {
    /// Wrap a connected stream, switching it to non-blocking mode
    pub fn from_std(stream: std::net::TcpStream) -> io::Result<Self> {
        let peer_addr = stream.peer_addr()?;
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let dup = stream.try_clone()?;

        Ok(Self {
            id: ConnectionId::next(),
            peer_addr,
            reader: Arc::new(Mutex::new(TcpStream::from_std(stream))),
            writer: Arc::new(Mutex::new(TcpStream::from_std(dup))),
            live: AtomicBool::new(true),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Handle registered with the inbound loop
    pub fn reader(&self) -> &Arc<Mutex<TcpStream>> {
        &self.reader
    }

    /// Handle registered with the outbound loop
    pub fn writer(&self) -> &Arc<Mutex<TcpStream>> {
        &self.writer
    }
}

impl Connection for TcpConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn socket_channel(&self, direction: Direction) -> SocketChannel {
        match direction {
            Direction::Inbound => self.reader.clone(),
            Direction::Outbound => self.writer.clone(),
        }
    }

    fn live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    fn close(&self) {
        if !self.live.swap(false, Ordering::AcqRel) {
            return;
        }
        // NotConnected here just means the peer beat us to it
        if let Err(e) = self.reader.lock().shutdown(Shutdown::Both) {
            debug!("{} shutdown: {}", self.id, e);
        }
        debug!("{} to {} closed", self.id, self.peer_addr);
    }
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("live", &self.live())
            .finish()
    }
}
