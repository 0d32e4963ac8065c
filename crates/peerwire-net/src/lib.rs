//! Non-blocking I/O plumbing for peerwire node links
//!
//! This crate provides:
//! - The [`Connection`] contract and a TCP implementation
//! - Inbound and outbound readiness loops over `mio`
//! - [`SelectionHandler`], the registration and fault path every socket
//!   handler is built on

pub mod connection;
pub mod handler;
pub mod interest;
pub mod reactor;

#[cfg(test)]
mod test_util;

pub use connection::{Connection, ConnectionId, SocketChannel, TcpConnection};
pub use handler::{HandlerError, HandlerState, ReadyHandler, Registration, SelectionHandler};
pub use interest::InterestOps;
pub use reactor::{Direction, LoopError, ReadinessLoop, ReadinessLoops, Readiness};
