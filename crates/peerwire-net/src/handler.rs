//! Selection handlers
//!
//! A [`SelectionHandler`] binds one direction of one connection to the
//! readiness loop for that direction. Concrete handlers embed it, implement
//! [`ReadyHandler`] for the actual read or write reaction, and route every I/O
//! fault through [`SelectionHandler::handle_socket_exception`].
//!
//! ```text
//! Unregistered --register_op--> Registered --register_op--> Registered
//!      |                            |        (mask updated in place)
//!      +---handle_socket_exception--+-----> Closed (terminal)
//! ```

use crate::connection::{Connection, SocketChannel};
use crate::interest::InterestOps;
use crate::reactor::{Direction, ReadinessLoop, Readiness};
use mio::Token;
use parking_lot::Mutex;
use peerwire_crypto::{CipherError, CipherStrategy};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tracing::{debug, trace};

/// Faults that end a connection
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("registration failed: {0}")]
    Registration(#[source] io::Error),
    #[error("cipher error: {0}")]
    Cipher(#[from] CipherError),
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("socket error reported by poller")]
    SocketError,
}

/// Event target invoked by a readiness loop
pub trait ReadyHandler: Send + Sync {
    /// React to readiness. Runs on the loop thread and must not block.
    fn handle(&self, ready: Readiness);

    /// Release handler-specific resources after the connection is torn down
    fn shutdown(&self) {}
}

/// Association between a channel, a loop, an interest mask and a handler
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Registration {
    pub token: Token,
    pub interest: InterestOps,
    /// Whether the channel is currently registered with the poller. An empty
    /// mask parks the registration without giving up the token.
    pub armed: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandlerState {
    Unregistered,
    Registered,
    Closed,
}

/// Per-connection, per-direction registration and fault handling
pub struct SelectionHandler {
    connection: Arc<dyn Connection>,
    channel: SocketChannel,
    io_loop: Arc<ReadinessLoop>,
    cipher: Option<Arc<CipherStrategy>>,
    target: Weak<dyn ReadyHandler>,
    registration: Mutex<Option<Registration>>,
    closed: AtomicBool,
}

impl SelectionHandler {
    /// Bind `connection` to `io_loop`.
    ///
    /// `target` is the concrete handler embedding this one; build it with
    /// `Arc::new_cyclic` so the handler can name itself as event target.
    pub fn new(
        connection: Arc<dyn Connection>,
        io_loop: Arc<ReadinessLoop>,
        cipher: Option<Arc<CipherStrategy>>,
        target: Weak<dyn ReadyHandler>,
    ) -> Self {
        let channel = connection.socket_channel(io_loop.direction());
        Self {
            connection,
            channel,
            io_loop,
            cipher,
            target,
            registration: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    pub fn direction(&self) -> Direction {
        self.io_loop.direction()
    }

    pub fn cipher_strategy(&self) -> Option<&Arc<CipherStrategy>> {
        self.cipher.as_ref()
    }

    /// Snapshot of the current registration
    pub fn registration(&self) -> Option<Registration> {
        *self.registration.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn state(&self) -> HandlerState {
        if self.is_closed() {
            HandlerState::Closed
        } else if self.registration.lock().is_some() {
            HandlerState::Registered
        } else {
            HandlerState::Unregistered
        }
    }

    /// Declare interest in `interest` on this handler's loop.
    ///
    /// Does nothing once the connection is no longer live. The first call
    /// creates the registration; later calls change its mask in place, so a
    /// handler can flip between read and write interest without churn.
    pub fn register_op(&self, interest: InterestOps) {
        if !self.connection.live() {
            return;
        }

        let result = {
            let mut registration = self.registration.lock();
            if self.is_closed() {
                return;
            }
            self.apply_interest(&mut registration, interest)
        };

        if let Err(e) = result {
            self.handle_socket_exception(HandlerError::Registration(e));
        }
    }

    fn apply_interest(
        &self,
        registration: &mut Option<Registration>,
        interest: InterestOps,
    ) -> io::Result<()> {
        let mut channel = self.channel.lock();

        if let Some(reg) = registration.as_mut() {
            match (interest.to_mio(), reg.armed) {
                (Some(i), true) => self.io_loop.reregister(&mut *channel, reg.token, i)?,
                (Some(i), false) => {
                    self.io_loop.register(&mut *channel, reg.token, i)?;
                    reg.armed = true;
                }
                (None, true) => {
                    self.io_loop.deregister(&mut *channel)?;
                    reg.armed = false;
                }
                (None, false) => {}
            }
            reg.interest = interest;
            return Ok(());
        }

        let token = self.io_loop.allocate_token();
        self.io_loop.attach(token, self.target.clone());
        let reg = registration.insert(Registration {
            token,
            interest,
            armed: false,
        });
        if let Some(i) = interest.to_mio() {
            self.io_loop.register(&mut *channel, token, i)?;
            reg.armed = true;
        }
        debug!(
            "{} registered with {:?} loop as {:?} for {:?}",
            self.connection.id(),
            self.direction(),
            token,
            interest
        );
        Ok(())
    }

    /// Tear the connection down after `fault`.
    ///
    /// Cancels the registration if there is one, closes the connection and
    /// runs the handler's shutdown hook. Only the first call has any effect;
    /// later calls, from either loop thread, return immediately. Nothing is
    /// retried here.
    pub fn handle_socket_exception(&self, fault: HandlerError) {
        let registration = {
            let mut registration = self.registration.lock();
            if self.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            registration.take()
        };

        trace!(
            "{} closing socket on {}. cause: {}",
            self.connection.id(),
            std::thread::current().name().unwrap_or("<unnamed>"),
            fault
        );

        if let Some(reg) = registration {
            self.cancel(reg);
        }
        self.connection.close();

        if let Some(target) = self.target.upgrade() {
            target.shutdown();
        }
    }

    fn cancel(&self, reg: Registration) {
        if reg.armed {
            if let Err(e) = self.io_loop.deregister(&mut *self.channel.lock()) {
                trace!("{} deregister: {}", self.connection.id(), e);
            }
        }
        self.io_loop.detach(reg.token);
    }

    /// Route poller-reported faults; returns whether the handler should go
    /// on to read or write.
    ///
    /// A read-closed event that is still readable is left to the reader, which
    /// sees end of stream on its next read.
    pub fn check_readiness(&self, ready: Readiness) -> bool {
        if self.is_closed() {
            return false;
        }
        if ready.error {
            self.handle_socket_exception(HandlerError::SocketError);
            return false;
        }
        if ready.closed && !ready.readable && !ready.writable {
            self.handle_socket_exception(HandlerError::PeerClosed);
            return false;
        }
        true
    }
}

impl Drop for SelectionHandler {
    fn drop(&mut self) {
        if let Some(reg) = self.registration.get_mut().take() {
            self.cancel(reg);
        }
    }
}

impl std::fmt::Debug for SelectionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectionHandler")
            .field("connection", &self.connection.id())
            .field("direction", &self.direction())
            .field("registration", &self.registration())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::ReadinessLoops;
    use crate::connection::ConnectionId;
    use crate::test_util::{wait_for, RecordingConnection};
    use mio::event::Source;
    use mio::{Interest, Registry};
    use peerwire_crypto::{
        AsymmetricConfig, EncryptionConfig, KeyMaterialProvider, KeyPairMaterial, SymmetricConfig,
    };
    use std::io::Write;
    use std::net::TcpStream;
    use std::sync::atomic::AtomicUsize;

    struct NoKeys;

    impl KeyMaterialProvider for NoKeys {
        fn load_key_pair(&self, config: &AsymmetricConfig) -> peerwire_crypto::Result<KeyPairMaterial> {
            Err(CipherError::UnknownAlias(config.key_alias.clone()))
        }
    }

    struct TestHandler {
        base: SelectionHandler,
        events: AtomicUsize,
        shutdowns: AtomicUsize,
    }

    impl ReadyHandler for TestHandler {
        fn handle(&self, ready: Readiness) {
            if self.base.check_readiness(ready) {
                self.events.fetch_add(1, Ordering::SeqCst);
                // Edge triggered: park until asked again
                self.base.register_op(InterestOps::NONE);
            }
        }

        fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        loops: ReadinessLoops,
        conn: Arc<RecordingConnection>,
        peer: TcpStream,
    }

    fn fixture() -> Fixture {
        let (conn, peer) = RecordingConnection::new();
        Fixture {
            loops: ReadinessLoops::start().unwrap(),
            conn: Arc::new(conn),
            peer,
        }
    }

    fn handler(f: &Fixture, direction: Direction) -> Arc<TestHandler> {
        let conn: Arc<dyn Connection> = f.conn.clone();
        let io_loop = f.loops.for_direction(direction).clone();
        Arc::new_cyclic(|me: &Weak<TestHandler>| {
            let target: Weak<dyn ReadyHandler> = me.clone();
            TestHandler {
                base: SelectionHandler::new(conn, io_loop, None, target),
                events: AtomicUsize::new(0),
                shutdowns: AtomicUsize::new(0),
            }
        })
    }

    #[test]
    fn test_register_twice_keeps_one_token() {
        let f = fixture();
        let h = handler(&f, Direction::Inbound);
        assert_eq!(h.base.state(), HandlerState::Unregistered);

        h.base.register_op(InterestOps::READ);
        let first = h.base.registration().unwrap();
        assert_eq!(h.base.state(), HandlerState::Registered);

        h.base.register_op(InterestOps::WRITE);
        let second = h.base.registration().unwrap();

        assert_eq!(first.token, second.token);
        assert_eq!(second.interest, InterestOps::WRITE);
        assert!(second.armed);
        assert_eq!(f.loops.inbound.attached(), 1);
        assert!(!h.base.is_closed());
    }

    #[test]
    fn test_register_on_dead_connection_is_noop() {
        let f = fixture();
        let h = handler(&f, Direction::Inbound);

        f.conn.set_live(false);
        h.base.register_op(InterestOps::READ);
        assert_eq!(h.base.registration(), None);
        assert_eq!(f.loops.inbound.attached(), 0);

        f.conn.set_live(true);
        h.base.register_op(InterestOps::READ);
        let before = h.base.registration();

        f.conn.set_live(false);
        h.base.register_op(InterestOps::WRITE);
        assert_eq!(h.base.registration(), before);
    }

    #[test]
    fn test_exception_closes_exactly_once() {
        let f = fixture();
        let h = handler(&f, Direction::Inbound);
        h.base.register_op(InterestOps::READ);

        for _ in 0..3 {
            h.base.handle_socket_exception(HandlerError::PeerClosed);
        }

        assert_eq!(f.conn.close_count(), 1);
        assert_eq!(h.shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(h.base.registration(), None);
        assert_eq!(h.base.state(), HandlerState::Closed);
        assert_eq!(f.loops.inbound.attached(), 0);
    }

    #[test]
    fn test_exception_when_unregistered() {
        let f = fixture();
        let h = handler(&f, Direction::Outbound);

        h.base.handle_socket_exception(HandlerError::SocketError);
        assert_eq!(h.base.state(), HandlerState::Closed);
        assert_eq!(f.conn.close_count(), 1);

        // Closed is terminal
        f.conn.set_live(true);
        h.base.register_op(InterestOps::WRITE);
        assert_eq!(h.base.registration(), None);
    }

    #[test]
    fn test_concurrent_exceptions_from_both_directions() {
        let f = fixture();
        let inbound = handler(&f, Direction::Inbound);
        let outbound = handler(&f, Direction::Outbound);
        inbound.base.register_op(InterestOps::READ);
        outbound.base.register_op(InterestOps::WRITE);

        let threads: Vec<_> = [inbound.clone(), outbound.clone()]
            .into_iter()
            .map(|h| {
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        h.base.handle_socket_exception(HandlerError::PeerClosed);
                        h.base.register_op(InterestOps::READ);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(f.conn.close_count(), 1);
        assert!(inbound.base.is_closed() && outbound.base.is_closed());
        assert_eq!(f.loops.inbound.attached(), 0);
        assert_eq!(f.loops.outbound.attached(), 0);
    }

    #[test]
    fn test_empty_mask_parks_and_rearms() {
        let f = fixture();
        let h = handler(&f, Direction::Outbound);

        h.base.register_op(InterestOps::WRITE);
        let token = h.base.registration().unwrap().token;

        h.base.register_op(InterestOps::NONE);
        let parked = h.base.registration().unwrap();
        assert!(!parked.armed);
        assert_eq!(parked.token, token);

        h.base.register_op(InterestOps::WRITE);
        let rearmed = h.base.registration().unwrap();
        assert!(rearmed.armed);
        assert_eq!(rearmed.token, token);
    }

    /// Channel the poller refuses
    struct RefusedSource;

    impl Source for RefusedSource {
        fn register(&mut self, _: &Registry, _: Token, _: Interest) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "register refused"))
        }

        fn reregister(&mut self, _: &Registry, _: Token, _: Interest) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "reregister refused"))
        }

        fn deregister(&mut self, _: &Registry) -> io::Result<()> {
            Ok(())
        }
    }

    struct RefusedConnection {
        id: ConnectionId,
        channel: Arc<parking_lot::Mutex<RefusedSource>>,
        live: AtomicBool,
        closes: AtomicUsize,
    }

    impl Connection for RefusedConnection {
        fn id(&self) -> ConnectionId {
            self.id
        }

        fn socket_channel(&self, _direction: Direction) -> SocketChannel {
            self.channel.clone()
        }

        fn live(&self) -> bool {
            self.live.load(Ordering::SeqCst)
        }

        fn close(&self) {
            if self.live.swap(false, Ordering::SeqCst) {
                self.closes.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn test_registration_error_closes() {
        let loops = ReadinessLoops::start().unwrap();
        let conn = Arc::new(RefusedConnection {
            id: ConnectionId::next(),
            channel: Arc::new(parking_lot::Mutex::new(RefusedSource)),
            live: AtomicBool::new(true),
            closes: AtomicUsize::new(0),
        });
        let link: Arc<dyn Connection> = conn.clone();
        let io_loop = loops.inbound.clone();
        let h = Arc::new_cyclic(|me: &Weak<TestHandler>| {
            let target: Weak<dyn ReadyHandler> = me.clone();
            TestHandler {
                base: SelectionHandler::new(link, io_loop, None, target),
                events: AtomicUsize::new(0),
                shutdowns: AtomicUsize::new(0),
            }
        });

        h.base.register_op(InterestOps::READ);

        assert_eq!(h.base.state(), HandlerState::Closed);
        assert_eq!(h.base.registration(), None);
        assert_eq!(conn.closes.load(Ordering::SeqCst), 1);
        assert_eq!(h.shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(loops.inbound.attached(), 0);
    }

    #[test]
    fn test_drop_detaches() {
        let f = fixture();
        let h = handler(&f, Direction::Inbound);
        h.base.register_op(InterestOps::READ);
        assert_eq!(f.loops.inbound.attached(), 1);

        drop(h);
        assert_eq!(f.loops.inbound.attached(), 0);
        // Dropping is not closing
        assert_eq!(f.conn.close_count(), 0);
    }

    #[test]
    fn test_loop_dispatches_readable() {
        let mut f = fixture();
        let h = handler(&f, Direction::Inbound);
        h.base.register_op(InterestOps::READ);

        f.peer.write_all(b"HELLO").unwrap();
        assert!(wait_for(|| h.events.load(Ordering::SeqCst) >= 1));
        assert!(!h.base.registration().unwrap().armed);
    }

    #[test]
    fn test_cipher_strategy_is_shared() {
        let f = fixture();
        let config = EncryptionConfig {
            symmetric: SymmetricConfig::enabled(),
            ..Default::default()
        };
        let strategy = Arc::new(CipherStrategy::from_config(&config, &NoKeys).unwrap().unwrap());

        let conn: Arc<dyn Connection> = f.conn.clone();
        let io_loop = f.loops.outbound.clone();
        let h = Arc::new_cyclic(|me: &Weak<TestHandler>| {
            let target: Weak<dyn ReadyHandler> = me.clone();
            TestHandler {
                base: SelectionHandler::new(conn, io_loop, Some(strategy.clone()), target),
                events: AtomicUsize::new(0),
                shutdowns: AtomicUsize::new(0),
            }
        });

        let shared = h.base.cipher_strategy().unwrap();
        assert!(Arc::ptr_eq(shared, &strategy));
        assert!(!shared.is_asymmetric());
    }

    #[test]
    fn test_check_readiness_routes_faults() {
        let f = fixture();
        let h = handler(&f, Direction::Inbound);
        h.base.register_op(InterestOps::READ);

        let eof_with_data = Readiness {
            readable: true,
            closed: true,
            ..Default::default()
        };
        assert!(h.base.check_readiness(eof_with_data));

        let error = Readiness {
            error: true,
            ..Default::default()
        };
        assert!(!h.base.check_readiness(error));
        assert!(h.base.is_closed());
        assert_eq!(f.conn.close_count(), 1);
    }
}
