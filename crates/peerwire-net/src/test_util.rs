//! Loopback sockets and a recording connection for tests

use crate::connection::{Connection, ConnectionId, SocketChannel, TcpConnection};
use crate::reactor::Direction;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// A connected pair: our non-blocking side and the peer's blocking std stream
pub fn tcp_pair() -> (TcpConnection, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let peer = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (ours, _) = listener.accept().unwrap();
    (TcpConnection::from_std(ours).unwrap(), peer)
}

/// Connection that counts close side effects
pub struct RecordingConnection {
    inner: TcpConnection,
    live: AtomicBool,
    closes: AtomicUsize,
}

impl RecordingConnection {
    pub fn new() -> (Self, TcpStream) {
        let (inner, peer) = tcp_pair();
        let conn = Self {
            inner,
            live: AtomicBool::new(true),
            closes: AtomicUsize::new(0),
        };
        (conn, peer)
    }

    /// Pretend the link died without closing it
    pub fn set_live(&self, live: bool) {
        self.live.store(live, Ordering::SeqCst);
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl Connection for RecordingConnection {
    fn id(&self) -> ConnectionId {
        self.inner.id()
    }

    fn socket_channel(&self, direction: Direction) -> SocketChannel {
        self.inner.socket_channel(direction)
    }

    fn live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if self.live.swap(false, Ordering::SeqCst) {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.inner.close();
        }
    }
}

/// Spin until `cond` holds or two seconds pass
pub fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}
