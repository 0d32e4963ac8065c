//! peerwired node - link table and bootstrap

use crate::config::KeygenArgs;
use crate::handlers::{AcceptHandler, InboundHandler, OutboundHandler, ShutdownHook};
use parking_lot::{Mutex, RwLock};
use peerwire_crypto::{
    CipherError, CipherMode, CipherStrategy, EncryptionConfig, FileKeyStore, KeyPairMaterial,
    KeyStoreWriter, Secret,
};
use peerwire_net::{
    Connection, ConnectionId, HandlerError, InterestOps, LoopError, ReadinessLoops, TcpConnection,
};
use std::collections::HashMap;
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Node errors
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cipher setup failed: {0}")]
    Cipher(#[from] CipherError),
    #[error("readiness loop error: {0}")]
    Loop(#[from] LoopError),
    #[error("link error: {0}")]
    Handler(#[from] HandlerError),
    #[error("unknown link: {0}")]
    UnknownLink(ConnectionId),
    #[error("already listening on {0}")]
    AlreadyListening(SocketAddr),
}

/// Build the process-wide cipher strategy from the key-store on disk.
///
/// `Ok(None)` means encryption is off. An error is fatal: a node that was
/// asked to encrypt never comes up in the clear.
pub fn build_cipher_strategy(
    config: &EncryptionConfig,
) -> Result<Option<Arc<CipherStrategy>>, CipherError> {
    Ok(CipherStrategy::from_config(config, &FileKeyStore)?.map(Arc::new))
}

/// Generate a key pair and write it to a new key-store
pub fn keygen(args: &KeygenArgs) -> anyhow::Result<PathBuf> {
    args.validate()?;
    if args.keystore.exists() && !args.force {
        anyhow::bail!(
            "{} already exists (pass --force to overwrite)",
            args.keystore.display()
        );
    }

    info!("Generating {}-bit RSA key pair '{}'", args.bits, args.alias);
    let key_pair = KeyPairMaterial::generate(args.bits)?;

    let mut writer = KeyStoreWriter::new().with_iterations(args.iterations);
    writer.insert(
        args.alias.as_str(),
        &key_pair,
        &Secret::new(args.key_credential.as_str()),
    )?;
    let path = writer.write(&args.keystore, &Secret::new(args.store_credential.as_str()))?;
    info!("Key-store written to {}", path.display());
    Ok(path)
}

/// Which side opened a link
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkOrigin {
    Accepted,
    Dialed,
}

/// An open node link
pub struct Link {
    pub conn: Arc<TcpConnection>,
    pub inbound: Arc<InboundHandler>,
    pub outbound: Arc<OutboundHandler>,
    pub origin: LinkOrigin,
    pub opened_at: Instant,
}

/// Node state
pub struct Node {
    loops: ReadinessLoops,
    cipher: Option<Arc<CipherStrategy>>,
    links: RwLock<HashMap<ConnectionId, Link>>,
    acceptor: Mutex<Option<Arc<AcceptHandler>>>,
    me: Weak<Node>,
}

impl Node {
    /// Start both readiness loops. Every link shares `cipher`.
    pub fn new(cipher: Option<Arc<CipherStrategy>>) -> Result<Arc<Self>, NodeError> {
        let loops = ReadinessLoops::start()?;
        Ok(Arc::new_cyclic(|me| Self {
            loops,
            cipher,
            links: RwLock::new(HashMap::new()),
            acceptor: Mutex::new(None),
            me: me.clone(),
        }))
    }

    pub fn cipher_mode(&self) -> CipherMode {
        self.cipher
            .as_ref()
            .map(|c| c.mode())
            .unwrap_or(CipherMode::None)
    }

    /// Take over a connected stream
    pub fn adopt(&self, stream: TcpStream, origin: LinkOrigin) -> Result<ConnectionId, NodeError> {
        let conn = Arc::new(TcpConnection::from_std(stream)?);
        let id = conn.id();

        let hook: ShutdownHook = {
            let node = self.me.clone();
            Arc::new(move |id| {
                if let Some(node) = node.upgrade() {
                    node.forget(id);
                }
            })
        };
        let inbound = InboundHandler::new(
            conn.clone(),
            self.loops.inbound.clone(),
            self.cipher.clone(),
            Some(hook.clone()),
        );
        let outbound = OutboundHandler::new(
            conn.clone(),
            self.loops.outbound.clone(),
            self.cipher.clone(),
            Some(hook),
        );

        info!("{} {:?} link to {}", id, origin, conn.peer_addr());
        // In the table before the first event can tear it down
        self.links.write().insert(
            id,
            Link {
                conn,
                inbound: inbound.clone(),
                outbound,
                origin,
                opened_at: Instant::now(),
            },
        );
        inbound.base().register_op(InterestOps::READ);
        Ok(id)
    }

    /// Connect to `addr` and adopt the link
    pub fn dial(&self, addr: SocketAddr, timeout: Duration) -> Result<ConnectionId, NodeError> {
        debug!("Dialing {}", addr);
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        self.adopt(stream, LinkOrigin::Dialed)
    }

    /// Accept links on `addr`; returns the bound address
    pub fn listen(&self, addr: SocketAddr) -> Result<SocketAddr, NodeError> {
        let mut acceptor = self.acceptor.lock();
        if let Some(existing) = acceptor.as_ref() {
            return Err(NodeError::AlreadyListening(existing.local_addr()?));
        }

        let listener = std::net::TcpListener::bind(addr)?;
        let node = self.me.clone();
        let handler = AcceptHandler::new(
            listener,
            Box::new(move |stream| {
                let Some(node) = node.upgrade() else { return };
                if let Err(e) = node.adopt(stream, LinkOrigin::Accepted) {
                    warn!("Failed to adopt link: {}", e);
                }
            }),
        )?;
        handler.register(&self.loops.inbound)?;

        let bound = handler.local_addr()?;
        info!("Listening on {}", bound);
        *acceptor = Some(handler);
        Ok(bound)
    }

    /// Queue `payload` on a link
    pub fn send(&self, id: ConnectionId, payload: &[u8]) -> Result<(), NodeError> {
        let outbound = self
            .links
            .read()
            .get(&id)
            .map(|link| link.outbound.clone())
            .ok_or(NodeError::UnknownLink(id))?;
        outbound.send(payload)?;
        Ok(())
    }

    /// Queue `payload` on every link; returns how many accepted it
    pub fn broadcast(&self, payload: &[u8]) -> usize {
        let outbound: Vec<_> = self
            .links
            .read()
            .values()
            .map(|link| link.outbound.clone())
            .collect();
        outbound
            .iter()
            .filter(|handler| handler.send(payload).is_ok())
            .count()
    }

    /// Whether a listener is registered with the inbound loop
    pub fn is_listening(&self) -> bool {
        self.acceptor
            .lock()
            .as_ref()
            .map(|a| a.is_registered())
            .unwrap_or(false)
    }

    pub fn link_count(&self) -> usize {
        self.links.read().len()
    }

    pub fn link_ids(&self) -> Vec<ConnectionId> {
        self.links.read().keys().copied().collect()
    }

    /// Drop a link from the table and tear down both of its handlers.
    ///
    /// Runs as the shutdown hook of either handler, so it may arrive twice
    /// for the same link; the second arrival finds nothing.
    pub fn forget(&self, id: ConnectionId) {
        let Some(link) = self.links.write().remove(&id) else {
            return;
        };
        link.inbound.base().handle_socket_exception(HandlerError::PeerClosed);
        link.outbound.base().handle_socket_exception(HandlerError::PeerClosed);
        info!(
            "{} closed after {:?} ({} bytes in, {} bytes out)",
            id,
            link.opened_at.elapsed(),
            link.inbound.received(),
            link.outbound.sent()
        );
    }

    /// Stop accepting, close every link and stop the loops
    pub fn shutdown(&self) -> Result<(), NodeError> {
        info!("Shutting down node with {} links", self.link_count());
        if let Some(acceptor) = self.acceptor.lock().take() {
            if let Err(e) = acceptor.deregister(&self.loops.inbound) {
                warn!("Listener deregister: {}", e);
            }
        }
        for id in self.link_ids() {
            self.forget(id);
        }
        self.loops.stop()?;
        Ok(())
    }

    /// Get node statistics
    pub fn stats(&self) -> NodeStats {
        let links = self.links.read();
        let mut stats = NodeStats {
            link_count: links.len(),
            accepted_total: self.acceptor.lock().as_ref().map(|a| a.accepted()).unwrap_or(0),
            cipher_mode: self.cipher_mode(),
            ..Default::default()
        };
        for link in links.values() {
            if !link.conn.live() {
                continue;
            }
            stats.bytes_received += link.inbound.received();
            stats.bytes_sent += link.outbound.sent();
            stats.bytes_pending += link.outbound.pending() as u64;
        }
        stats
    }
}

/// Node statistics
#[derive(Debug, Clone)]
pub struct NodeStats {
    pub link_count: usize,
    pub accepted_total: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub bytes_pending: u64,
    pub cipher_mode: CipherMode,
}

impl Default for NodeStats {
    fn default() -> Self {
        Self {
            link_count: 0,
            accepted_total: 0,
            bytes_received: 0,
            bytes_sent: 0,
            bytes_pending: 0,
            cipher_mode: CipherMode::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::wait_for;
    use peerwire_crypto::{AsymmetricConfig, SymmetricConfig};
    use std::io::{Read, Write};
    use tempfile::tempdir;

    fn symmetric_config() -> EncryptionConfig {
        EncryptionConfig {
            symmetric: SymmetricConfig::enabled(),
            ..Default::default()
        }
    }

    #[test]
    fn test_no_strategy_when_disabled() {
        let strategy = build_cipher_strategy(&EncryptionConfig::default()).unwrap();
        assert!(strategy.is_none());
    }

    #[test]
    fn test_missing_keystore_is_fatal() {
        let dir = tempdir().unwrap();
        let config = EncryptionConfig {
            asymmetric: AsymmetricConfig::enabled(
                dir.path().join("absent.json"),
                "store",
                "local",
                "key",
            ),
            ..Default::default()
        };
        assert!(matches!(
            build_cipher_strategy(&config),
            Err(CipherError::KeyStoreIo { .. })
        ));
    }

    #[test]
    fn test_keygen_then_bootstrap() {
        let dir = tempdir().unwrap();
        let args = KeygenArgs {
            keystore: dir.path().join("node.json"),
            alias: "local".to_string(),
            store_credential: "store".to_string(),
            key_credential: "key".to_string(),
            bits: 1024,
            iterations: 16,
            force: false,
        };
        let path = keygen(&args).unwrap();

        // Refuses to clobber without --force
        assert!(keygen(&args).is_err());

        let config = EncryptionConfig {
            asymmetric: AsymmetricConfig::enabled(path, "store", "local", "key"),
            ..Default::default()
        };
        let strategy = build_cipher_strategy(&config).unwrap().unwrap();
        assert_eq!(strategy.mode(), CipherMode::Asymmetric);

        let sealed = strategy.writer_cipher().encrypt(b"HELLO").unwrap();
        assert_eq!(strategy.reader_cipher().decrypt(&sealed).unwrap(), b"HELLO");
    }

    #[test]
    fn test_accept_and_receive() {
        let node = Node::new(None).unwrap();
        let addr = node.listen("127.0.0.1:0".parse().unwrap()).unwrap();
        assert!(node.listen(addr).is_err());

        let mut peer = TcpStream::connect(addr).unwrap();
        assert!(wait_for(|| node.link_count() == 1));

        peer.write_all(b"HELLO").unwrap();
        assert!(wait_for(|| node.stats().bytes_received == 5));

        drop(peer);
        assert!(wait_for(|| node.link_count() == 0));
        node.shutdown().unwrap();
    }

    #[test]
    fn test_shutdown_detaches_listener() {
        let node = Node::new(None).unwrap();
        let addr = node.listen("127.0.0.1:0".parse().unwrap()).unwrap();
        assert!(node.is_listening());

        let _peer = TcpStream::connect(addr).unwrap();
        // Listener plus the link's inbound handler
        assert!(wait_for(|| node.loops.inbound.attached() == 2));

        node.shutdown().unwrap();
        assert!(!node.is_listening());
        assert_eq!(node.link_count(), 0);
        assert_eq!(node.loops.inbound.attached(), 0);
    }

    #[test]
    fn test_dial_and_send_encrypted() {
        let strategy = build_cipher_strategy(&symmetric_config()).unwrap();
        let node = Node::new(strategy.clone()).unwrap();
        assert_eq!(node.cipher_mode(), CipherMode::Symmetric);

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let id = node
            .dial(listener.local_addr().unwrap(), Duration::from_secs(1))
            .unwrap();
        let (mut peer, _) = listener.accept().unwrap();

        node.send(id, b"HELLO").unwrap();
        let mut buf = vec![0u8; 24 + 5 + 16];
        peer.read_exact(&mut buf).unwrap();

        let strategy = strategy.unwrap();
        assert_eq!(strategy.reader_cipher().decrypt(&buf).unwrap(), b"HELLO");
        assert_ne!(&buf[24..29], b"HELLO");
    }

    #[test]
    fn test_two_nodes_exchange() {
        let strategy = build_cipher_strategy(&symmetric_config()).unwrap();
        let a = Node::new(strategy.clone()).unwrap();
        let b = Node::new(strategy).unwrap();

        let addr = b.listen("127.0.0.1:0".parse().unwrap()).unwrap();
        a.dial(addr, Duration::from_secs(1)).unwrap();
        assert!(wait_for(|| b.link_count() == 1));

        assert_eq!(a.broadcast(b"HELLO"), 1);
        assert!(wait_for(|| b.stats().bytes_received == 45));
        assert!(wait_for(|| a.stats().bytes_pending == 0));

        a.shutdown().unwrap();
        assert_eq!(a.link_count(), 0);
        assert!(wait_for(|| b.link_count() == 0));
    }

    #[test]
    fn test_send_unknown_link() {
        let node = Node::new(None).unwrap();
        assert!(matches!(
            node.send(ConnectionId(u64::MAX), b"x"),
            Err(NodeError::UnknownLink(_))
        ));
    }
}
