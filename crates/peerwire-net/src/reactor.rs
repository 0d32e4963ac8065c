//! Readiness loops
//!
//! Each loop is one thread polling one `mio::Poll`. When a registered channel
//! becomes ready the loop looks up the handler attached to its token and
//! calls it synchronously on the loop thread. A node runs two loops, one for
//! inbound (read) interest and one for outbound (write/connect) interest.

use crate::handler::ReadyHandler;
use mio::event::{Event, Source};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info};

/// Token reserved for the loop's own waker
const WAKE_TOKEN: Token = Token(0);

/// Events drained per poll
const EVENTS_CAPACITY: usize = 1024;

/// Upper bound on one poll so a stop request is never missed
const POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// Readiness loop errors
#[derive(Debug, Error)]
pub enum LoopError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("loop thread panicked")]
    Panicked,
}

/// Traffic direction a loop serves
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    fn thread_name(self) -> &'static str {
        match self {
            Direction::Inbound => "peerwire-in",
            Direction::Outbound => "peerwire-out",
        }
    }
}

/// What a channel is ready for
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    /// Peer closed one or both halves
    pub closed: bool,
    pub error: bool,
}

impl From<&Event> for Readiness {
    fn from(event: &Event) -> Self {
        Self {
            readable: event.is_readable(),
            writable: event.is_writable(),
            closed: event.is_read_closed() || event.is_write_closed(),
            error: event.is_error(),
        }
    }
}

type TargetTable = RwLock<HashMap<Token, Weak<dyn ReadyHandler>>>;

/// A single-threaded readiness loop
pub struct ReadinessLoop {
    direction: Direction,
    registry: Registry,
    waker: Waker,
    targets: Arc<TargetTable>,
    next_token: AtomicUsize,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ReadinessLoop {
    /// Create the poller and start its thread
    pub fn start(direction: Direction) -> Result<Arc<Self>, LoopError> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        let targets: Arc<TargetTable> = Arc::new(RwLock::new(HashMap::new()));
        let running = Arc::new(AtomicBool::new(true));

        let thread = {
            let targets = targets.clone();
            let running = running.clone();
            std::thread::Builder::new()
                .name(direction.thread_name().to_string())
                .spawn(move || run(poll, targets, running, direction))?
        };

        info!("{:?} readiness loop started", direction);
        Ok(Arc::new(Self {
            direction,
            registry,
            waker,
            targets,
            next_token: AtomicUsize::new(WAKE_TOKEN.0 + 1),
            running,
            thread: Mutex::new(Some(thread)),
        }))
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Reserve a fresh token
    pub fn allocate_token(&self) -> Token {
        Token(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    /// Route events for `token` to `target`
    pub fn attach(&self, token: Token, target: Weak<dyn ReadyHandler>) {
        self.targets.write().insert(token, target);
    }

    /// Stop routing events for `token`. Unknown tokens are ignored.
    pub fn detach(&self, token: Token) -> bool {
        self.targets.write().remove(&token).is_some()
    }

    /// Number of attached event targets
    pub fn attached(&self) -> usize {
        self.targets.read().len()
    }

    pub fn register(
        &self,
        source: &mut (dyn Source + Send),
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.registry.register(source, token, interest)
    }

    pub fn reregister(
        &self,
        source: &mut (dyn Source + Send),
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.registry.reregister(source, token, interest)
    }

    pub fn deregister(&self, source: &mut (dyn Source + Send)) -> io::Result<()> {
        self.registry.deregister(source)
    }

    /// Stop the loop thread and wait for it
    pub fn stop(&self) -> Result<(), LoopError> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        self.waker.wake()?;
        if let Some(thread) = self.thread.lock().take() {
            // Last reference dropped by a handler on the loop thread itself
            if thread.thread().id() != std::thread::current().id() {
                thread.join().map_err(|_| LoopError::Panicked)?;
            }
        }
        info!("{:?} readiness loop stopped", self.direction);
        Ok(())
    }
}

impl Drop for ReadinessLoop {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!("{:?} readiness loop: {}", self.direction, e);
        }
    }
}

fn run(mut poll: Poll, targets: Arc<TargetTable>, running: Arc<AtomicBool>, direction: Direction) {
    let mut events = Events::with_capacity(EVENTS_CAPACITY);

    while running.load(Ordering::Acquire) {
        if let Err(e) = poll.poll(&mut events, Some(POLL_TIMEOUT)) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!("{:?} poll failed: {}", direction, e);
            running.store(false, Ordering::Release);
            break;
        }

        for event in events.iter() {
            if event.token() == WAKE_TOKEN {
                continue;
            }
            let target = targets.read().get(&event.token()).and_then(Weak::upgrade);
            match target {
                Some(handler) => handler.handle(Readiness::from(event)),
                None => debug!("{:?} event for detached {:?}", direction, event.token()),
            }
        }
    }
}

/// The inbound and outbound loops of one node
pub struct ReadinessLoops {
    pub inbound: Arc<ReadinessLoop>,
    pub outbound: Arc<ReadinessLoop>,
}

impl ReadinessLoops {
    pub fn start() -> Result<Self, LoopError> {
        Ok(Self {
            inbound: ReadinessLoop::start(Direction::Inbound)?,
            outbound: ReadinessLoop::start(Direction::Outbound)?,
        })
    }

    pub fn for_direction(&self, direction: Direction) -> &Arc<ReadinessLoop> {
        match direction {
            Direction::Inbound => &self.inbound,
            Direction::Outbound => &self.outbound,
        }
    }

    pub fn stop(&self) -> Result<(), LoopError> {
        self.inbound.stop()?;
        self.outbound.stop()
    }
}
