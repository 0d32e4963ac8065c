//! Shared-passphrase encryption
//!
//! One 32-byte secret is derived with PBKDF2-HMAC-SHA256 from the configured
//! passphrase, salt and iteration count. Both directions use that secret with
//! XChaCha20-Poly1305. Every message carries its own random nonce:
//!
//! ```text
//! [ nonce (24) | ciphertext (N) | tag (16) ]
//! ```
//!
//! so neither cipher keeps state between messages and both can be shared by
//! every connection at once.

use crate::config::{SymmetricConfig, SALT_LEN};
use crate::error::{CipherError, Result};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    Key, XChaCha20Poly1305, XNonce,
};
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

/// Derived key size (32 bytes for XChaCha20)
pub const KEY_LEN: usize = 32;

/// XChaCha20 nonce size
pub const NONCE_LEN: usize = 24;

/// Poly1305 tag size
pub const TAG_LEN: usize = 16;

/// Derive a secret key from a passphrase.
///
/// `key = PBKDF2-HMAC-SHA256(passphrase, salt, iterations)`
pub fn derive_key(
    passphrase: &[u8],
    salt: &[u8; SALT_LEN],
    iterations: u32,
) -> Result<Zeroizing<[u8; KEY_LEN]>> {
    if iterations == 0 {
        return Err(CipherError::ZeroIterations);
    }
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2_hmac::<Sha256>(passphrase, salt, iterations, &mut key[..]);
    Ok(key)
}

/// Build an XChaCha20-Poly1305 cipher from a derived key
pub(crate) fn cipher_for(key: &[u8; KEY_LEN]) -> XChaCha20Poly1305 {
    XChaCha20Poly1305::new(Key::from_slice(key))
}

/// Seal `plaintext`, prefixing a fresh random nonce
pub(crate) fn seal(cipher: &XChaCha20Poly1305, plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let sealed = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|_| CipherError::EncryptionFailed)?;

    let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Open a message produced by [`seal`]
pub(crate) fn open(cipher: &XChaCha20Poly1305, message: &[u8]) -> Result<Vec<u8>> {
    if message.len() < NONCE_LEN + TAG_LEN {
        return Err(CipherError::DecryptionFailed);
    }
    let (nonce, sealed) = message.split_at(NONCE_LEN);
    cipher
        .decrypt(XNonce::from_slice(nonce), sealed)
        .map_err(|_| CipherError::DecryptionFailed)
}

/// Encrypt-mode half of the symmetric strategy
#[derive(Clone)]
pub struct SymmetricWriter {
    cipher: XChaCha20Poly1305,
}

impl SymmetricWriter {
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        seal(&self.cipher, plaintext)
    }
}

/// Decrypt-mode half of the symmetric strategy
#[derive(Clone)]
pub struct SymmetricReader {
    cipher: XChaCha20Poly1305,
}

impl SymmetricReader {
    pub fn decrypt(&self, message: &[u8]) -> Result<Vec<u8>> {
        open(&self.cipher, message)
    }
}

/// Symmetric strategy: one derived key, two ciphers
pub struct SymmetricCipherStrategy {
    writer: SymmetricWriter,
    reader: SymmetricReader,
}

impl SymmetricCipherStrategy {
    /// Derive the key and build both ciphers
    pub fn new(config: &SymmetricConfig) -> Result<Self> {
        let salt = config.validate()?;
        let key = derive_key(config.passphrase.expose(), &salt, config.iteration_count)?;

        let writer = SymmetricWriter {
            cipher: cipher_for(&key),
        };
        let reader = SymmetricReader {
            cipher: cipher_for(&key),
        };

        Ok(Self { writer, reader })
    }

    pub fn writer(&self) -> &SymmetricWriter {
        &self.writer
    }

    pub fn reader(&self) -> &SymmetricReader {
        &self.reader
    }
}
