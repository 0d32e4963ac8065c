//! Cipher strategy selection
//!
//! The strategy is chosen once, at bootstrap, from the two encryption toggles.
//! Symmetric wins when both are set. When neither is set there is no strategy
//! and links run in the clear.

use crate::asymmetric::{AsymmetricCipherStrategy, AsymmetricReader, AsymmetricWriter};
use crate::config::EncryptionConfig;
use crate::error::Result;
use crate::keystore::KeyMaterialProvider;
use crate::symmetric::{SymmetricCipherStrategy, SymmetricReader, SymmetricWriter};
use tracing::info;

/// Which encryption protects inter-node traffic
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CipherMode {
    Symmetric,
    Asymmetric,
    None,
}

impl CipherMode {
    /// Evaluate the toggles
    pub fn select(config: &EncryptionConfig) -> Self {
        if config.symmetric.enabled {
            CipherMode::Symmetric
        } else if config.asymmetric.enabled {
            CipherMode::Asymmetric
        } else {
            CipherMode::None
        }
    }
}

/// Encrypt-mode cipher handed to outbound handlers
#[derive(Clone)]
pub enum WriterCipher {
    Symmetric(SymmetricWriter),
    Asymmetric(AsymmetricWriter),
}

impl WriterCipher {
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        match self {
            WriterCipher::Symmetric(c) => c.encrypt(plaintext),
            WriterCipher::Asymmetric(c) => c.encrypt(plaintext),
        }
    }
}

/// Decrypt-mode cipher handed to inbound handlers
#[derive(Clone)]
pub enum ReaderCipher {
    Symmetric(SymmetricReader),
    Asymmetric(AsymmetricReader),
}

impl ReaderCipher {
    pub fn decrypt(&self, message: &[u8]) -> Result<Vec<u8>> {
        match self {
            ReaderCipher::Symmetric(c) => c.decrypt(message),
            ReaderCipher::Asymmetric(c) => c.decrypt(message),
        }
    }
}

/// Process-wide encryption strategy
///
/// Built once and shared read-only by every handler. Both ciphers take
/// `&self` and keep no per-message state, so concurrent use from any number of
/// connections needs no locking.
pub struct CipherStrategy {
    writer: WriterCipher,
    reader: ReaderCipher,
    asymmetric: bool,
}

impl CipherStrategy {
    /// Build the strategy selected by `config`.
    ///
    /// Returns `Ok(None)` when encryption is off. Any error means the
    /// configured encryption could not be set up; callers must not fall back
    /// to running unencrypted.
    pub fn from_config(
        config: &EncryptionConfig,
        keys: &dyn KeyMaterialProvider,
    ) -> Result<Option<Self>> {
        let strategy = match CipherMode::select(config) {
            CipherMode::Symmetric => {
                Self::symmetric(SymmetricCipherStrategy::new(&config.symmetric)?)
            }
            CipherMode::Asymmetric => {
                let key_pair = keys.load_key_pair(&config.asymmetric)?;
                Self::asymmetric(AsymmetricCipherStrategy::new(key_pair))
            }
            CipherMode::None => {
                info!("Node link encryption disabled");
                return Ok(None);
            }
        };
        info!("Node link encryption: {:?}", strategy.mode());
        Ok(Some(strategy))
    }

    pub fn symmetric(s: SymmetricCipherStrategy) -> Self {
        Self {
            writer: WriterCipher::Symmetric(s.writer().clone()),
            reader: ReaderCipher::Symmetric(s.reader().clone()),
            asymmetric: false,
        }
    }

    pub fn asymmetric(s: AsymmetricCipherStrategy) -> Self {
        Self {
            writer: WriterCipher::Asymmetric(s.writer().clone()),
            reader: ReaderCipher::Asymmetric(s.reader().clone()),
            asymmetric: true,
        }
    }

    pub fn writer_cipher(&self) -> &WriterCipher {
        &self.writer
    }

    pub fn reader_cipher(&self) -> &ReaderCipher {
        &self.reader
    }

    pub fn is_asymmetric(&self) -> bool {
        self.asymmetric
    }

    pub fn mode(&self) -> CipherMode {
        if self.asymmetric {
            CipherMode::Asymmetric
        } else {
            CipherMode::Symmetric
        }
    }
}

impl std::fmt::Debug for CipherStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherStrategy")
            .field("mode", &self.mode())
            .finish_non_exhaustive()
    }
}
