//! peerwire cipher strategy
//!
//! This crate decides, once per process, how node-to-node links are
//! encrypted:
//!
//! - [`symmetric`]: PBKDF2-derived shared key, XChaCha20-Poly1305
//! - [`asymmetric`]: RSA PKCS#1 v1.5, public key writes, private key reads
//! - [`keystore`]: where the asymmetric key pair comes from
//! - [`strategy`]: toggle evaluation and the [`CipherStrategy`] handed to
//!   connection handlers

pub mod asymmetric;
pub mod config;
pub mod error;
pub mod keystore;
pub mod strategy;
pub mod symmetric;

#[cfg(test)]
mod test_keys;

pub use asymmetric::KeyPairMaterial;
pub use config::{AsymmetricConfig, EncryptionConfig, Secret, SymmetricConfig, SALT_LEN};
pub use error::{CipherError, Result};
pub use keystore::{FileKeyStore, KeyMaterialProvider, KeyStoreWriter, StaticKeyPair};
pub use strategy::{CipherMode, CipherStrategy, ReaderCipher, WriterCipher};
