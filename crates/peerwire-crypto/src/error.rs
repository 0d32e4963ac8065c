//! Error types for cipher construction and use

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using [`CipherError`]
pub type Result<T> = std::result::Result<T, CipherError>;

/// Cipher strategy errors
///
/// Any of these raised while building a [`crate::CipherStrategy`] is fatal to
/// process startup; raised while encrypting or decrypting it is fatal to the
/// connection only.
#[derive(Debug, Error)]
pub enum CipherError {
    /// Salt does not have the fixed length
    #[error("invalid salt length: {0} bytes (expected {})", crate::SALT_LEN)]
    InvalidSaltLength(usize),

    /// Iteration count must be positive
    #[error("iteration count must be greater than zero")]
    ZeroIterations,

    /// Passphrase must not be empty
    #[error("passphrase cannot be empty")]
    EmptyPassphrase,

    /// Key-store could not be read
    #[error("key-store {path} unreadable: {source}")]
    KeyStoreIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Key-store document could not be parsed
    #[error("malformed key-store: {0}")]
    MalformedKeyStore(String),

    /// Store credential did not authenticate the entry table
    #[error("key-store integrity check failed (wrong store credential?)")]
    StoreIntegrity,

    /// No entry under the requested alias
    #[error("no key entry under alias {0:?}")]
    UnknownAlias(String),

    /// Key credential did not unseal the private key
    #[error("cannot unseal private key for alias {0:?} (wrong key credential?)")]
    KeyCredential(String),

    /// RSA key could not be decoded, encoded or generated
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Public key is not the public half of the private key
    #[error("public key does not match private key")]
    KeyPairMismatch,

    /// Encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// Decryption failed (authentication, padding or length)
    #[error("decryption failed")]
    DecryptionFailed,
}

impl From<rsa::Error> for CipherError {
    fn from(e: rsa::Error) -> Self {
        CipherError::InvalidKey(e.to_string())
    }
}
