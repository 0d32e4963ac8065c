//! Concrete socket handlers
//!
//! Byte pumps only; nothing here frames messages. The inbound handler drains
//! whatever the peer sends, the outbound handler flushes queued bytes and
//! parks itself once the queue is empty.
//!
//! Each `send` is sealed on its own and written back to back with no length
//! prefix, so the inbound side cannot split the stream into ciphertexts. It
//! counts ciphertext bytes and does not decrypt; a framing layer above this
//! one is what would call the reader cipher.

use mio::{Interest, Token};
use parking_lot::Mutex;
use peerwire_crypto::CipherStrategy;
use peerwire_net::{
    Connection, ConnectionId, HandlerError, InterestOps, ReadinessLoop, Readiness, ReadyHandler,
    SelectionHandler, TcpConnection,
};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Read buffer size per readiness event
const READ_BUFFER_SIZE: usize = 32 * 1024;

/// Called once when a handler's connection has been torn down
pub type ShutdownHook = Arc<dyn Fn(ConnectionId) + Send + Sync>;

enum ReadOutcome {
    Drained(usize),
    Eof(usize),
    Failed(io::Error),
}

/// Inbound side: drains the socket
pub struct InboundHandler {
    base: SelectionHandler,
    conn: Arc<TcpConnection>,
    received: AtomicU64,
    on_shutdown: Option<ShutdownHook>,
}

impl InboundHandler {
    pub fn new(
        conn: Arc<TcpConnection>,
        io_loop: Arc<ReadinessLoop>,
        cipher: Option<Arc<CipherStrategy>>,
        on_shutdown: Option<ShutdownHook>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<Self>| {
            let target: Weak<dyn ReadyHandler> = me.clone();
            let link: Arc<dyn Connection> = conn.clone();
            Self {
                base: SelectionHandler::new(link, io_loop, cipher, target),
                conn,
                received: AtomicU64::new(0),
                on_shutdown,
            }
        })
    }

    pub fn base(&self) -> &SelectionHandler {
        &self.base
    }

    /// Bytes read so far
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    fn drain(&self) -> ReadOutcome {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        let mut total = 0;
        let mut stream = self.conn.reader().lock();
        loop {
            match stream.read(&mut buf) {
                Ok(0) => return ReadOutcome::Eof(total),
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return ReadOutcome::Drained(total),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return ReadOutcome::Failed(e),
            }
        }
    }
}

impl ReadyHandler for InboundHandler {
    fn handle(&self, ready: Readiness) {
        if !self.base.check_readiness(ready) || !ready.readable {
            return;
        }

        // The reader lock is released before any teardown
        let outcome = self.drain();
        match outcome {
            ReadOutcome::Drained(n) => {
                self.received.fetch_add(n as u64, Ordering::Relaxed);
            }
            ReadOutcome::Eof(n) => {
                self.received.fetch_add(n as u64, Ordering::Relaxed);
                self.base.handle_socket_exception(HandlerError::PeerClosed);
            }
            ReadOutcome::Failed(e) => self.base.handle_socket_exception(HandlerError::Io(e)),
        }
    }

    fn shutdown(&self) {
        if let Some(hook) = &self.on_shutdown {
            hook(self.conn.id());
        }
    }
}

/// Outbound side: flushes queued bytes
pub struct OutboundHandler {
    base: SelectionHandler,
    conn: Arc<TcpConnection>,
    pending: Mutex<Vec<u8>>,
    sent: AtomicU64,
    on_shutdown: Option<ShutdownHook>,
}

impl OutboundHandler {
    pub fn new(
        conn: Arc<TcpConnection>,
        io_loop: Arc<ReadinessLoop>,
        cipher: Option<Arc<CipherStrategy>>,
        on_shutdown: Option<ShutdownHook>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<Self>| {
            let target: Weak<dyn ReadyHandler> = me.clone();
            let link: Arc<dyn Connection> = conn.clone();
            Self {
                base: SelectionHandler::new(link, io_loop, cipher, target),
                conn,
                pending: Mutex::new(Vec::new()),
                sent: AtomicU64::new(0),
                on_shutdown,
            }
        })
    }

    pub fn base(&self) -> &SelectionHandler {
        &self.base
    }

    /// Bytes written so far
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Bytes queued but not yet written
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Queue `payload`, encrypted with the writer cipher when one is set,
    /// and ask for write readiness.
    pub fn send(&self, payload: &[u8]) -> Result<(), HandlerError> {
        if self.base.is_closed() {
            return Err(HandlerError::PeerClosed);
        }
        let bytes = match self.base.cipher_strategy() {
            Some(strategy) => strategy.writer_cipher().encrypt(payload)?,
            None => payload.to_vec(),
        };
        self.pending.lock().extend_from_slice(&bytes);
        self.base.register_op(InterestOps::WRITE);
        Ok(())
    }

    fn flush(&self) -> io::Result<bool> {
        let mut pending = self.pending.lock();
        let mut stream = self.conn.writer().lock();
        let mut written = 0;

        let result = loop {
            if written == pending.len() {
                break Ok(true);
            }
            match stream.write(&pending[written..]) {
                Ok(0) => break Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => break Err(e),
            }
        };

        pending.drain(..written);
        self.sent.fetch_add(written as u64, Ordering::Relaxed);
        result
    }
}

impl ReadyHandler for OutboundHandler {
    fn handle(&self, ready: Readiness) {
        if !self.base.check_readiness(ready) || !ready.writable {
            return;
        }

        match self.flush() {
            // Queue empty: park until the next send. A send racing the park
            // has already queued its bytes, so look once more.
            Ok(true) => {
                self.base.register_op(InterestOps::NONE);
                if self.pending() > 0 {
                    self.base.register_op(InterestOps::WRITE);
                }
            }
            Ok(false) => {}
            Err(e) => self.base.handle_socket_exception(HandlerError::Io(e)),
        }
    }

    fn shutdown(&self) {
        let dropped = std::mem::take(&mut *self.pending.lock()).len();
        if dropped > 0 {
            debug!("{} dropped {} unsent bytes", self.conn.id(), dropped);
        }
        if let Some(hook) = &self.on_shutdown {
            hook(self.conn.id());
        }
    }
}

/// Called with each accepted stream
pub type AcceptHook = Box<dyn Fn(TcpStream) + Send + Sync>;

/// Listener side: accepts node links on the inbound loop.
///
/// Accepts go through the std listener so streams come out as std streams;
/// the poller watches a clone of the same socket.
pub struct AcceptHandler {
    listener: TcpListener,
    source: Mutex<mio::net::TcpListener>,
    token: Mutex<Option<Token>>,
    on_accept: AcceptHook,
    accepted: AtomicU64,
}

impl AcceptHandler {
    pub fn new(listener: TcpListener, on_accept: AcceptHook) -> io::Result<Arc<Self>> {
        listener.set_nonblocking(true)?;
        let source = mio::net::TcpListener::from_std(listener.try_clone()?);
        Ok(Arc::new(Self {
            listener,
            source: Mutex::new(source),
            token: Mutex::new(None),
            on_accept,
            accepted: AtomicU64::new(0),
        }))
    }

    /// Register the listener with `io_loop`
    pub fn register(self: &Arc<Self>, io_loop: &ReadinessLoop) -> io::Result<()> {
        let mut slot = self.token.lock();
        if slot.is_some() {
            return Ok(());
        }
        let token = io_loop.allocate_token();
        let target: Arc<dyn ReadyHandler> = self.clone();
        io_loop.attach(token, Arc::downgrade(&target));
        if let Err(e) = io_loop.register(&mut *self.source.lock(), token, Interest::READABLE) {
            io_loop.detach(token);
            return Err(e);
        }
        *slot = Some(token);
        Ok(())
    }

    /// Stop accepting on `io_loop`. Does nothing if not registered.
    pub fn deregister(&self, io_loop: &ReadinessLoop) -> io::Result<()> {
        let Some(token) = self.token.lock().take() else {
            return Ok(());
        };
        let result = io_loop.deregister(&mut *self.source.lock());
        io_loop.detach(token);
        result
    }

    pub fn is_registered(&self) -> bool {
        self.token.lock().is_some()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }
}

impl ReadyHandler for AcceptHandler {
    fn handle(&self, _ready: Readiness) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    debug!("Accepted link from {}", addr);
                    self.accepted.fetch_add(1, Ordering::Relaxed);
                    (self.on_accept)(stream);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Accept error: {}", e);
                    return;
                }
            }
        }
    }
}
