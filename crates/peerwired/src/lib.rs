//! peerwired - encrypted node link daemon
//!
//! This daemon provides:
//! - Accepting and dialing node-to-node TCP links
//! - Per-process link encryption chosen at bootstrap (symmetric or RSA)
//! - Key-store generation for the asymmetric mode

pub mod config;
pub mod handlers;
pub mod server;

#[cfg(test)]
mod test_util;

pub use config::Config;
pub use server::{build_cipher_strategy, keygen, Node, NodeError, NodeStats};
