//! Loopback sockets and fixtures for tests

use peerwire_crypto::{AsymmetricConfig, CipherError, KeyMaterialProvider, KeyPairMaterial};
use peerwire_net::TcpConnection;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A connected pair: our non-blocking side and the peer's blocking std stream
pub fn tcp_pair() -> (Arc<TcpConnection>, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let peer = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (ours, _) = listener.accept().unwrap();
    (Arc::new(TcpConnection::from_std(ours).unwrap()), peer)
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

/// Provider for symmetric-only tests; never asked for a key pair
pub struct NoKeys;

impl KeyMaterialProvider for NoKeys {
    fn load_key_pair(&self, config: &AsymmetricConfig) -> peerwire_crypto::Result<KeyPairMaterial> {
        Err(CipherError::UnknownAlias(config.key_alias.clone()))
    }
}
