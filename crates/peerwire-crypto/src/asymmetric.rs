//! Public-key encryption
//!
//! Writers encrypt with the RSA public key, readers decrypt with the private
//! key, PKCS#1 v1.5 padding. A single RSA block holds at most
//! `modulus_len - 11` bytes, so payloads are split into blocks of that size and
//! each block encrypts to exactly `modulus_len` bytes:
//!
//! ```text
//! [ block 0 (k) | block 1 (k) | ... ]      k = modulus length in bytes
//! ```
//!
//! An empty payload encrypts to an empty message.

use crate::error::{CipherError, Result};
use rand::rngs::OsRng;
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};

/// PKCS#1 v1.5 padding overhead per block
pub const PKCS1_OVERHEAD: usize = 11;

/// Default modulus size for generated keys
pub const DEFAULT_KEY_BITS: usize = 2048;

/// RSA key pair used by the asymmetric strategy
#[derive(Clone)]
pub struct KeyPairMaterial {
    public: RsaPublicKey,
    private: RsaPrivateKey,
}

impl KeyPairMaterial {
    /// Pair a public key with its private key.
    ///
    /// Fails if `public` is not the public half of `private`.
    pub fn new(public: RsaPublicKey, private: RsaPrivateKey) -> Result<Self> {
        if private.to_public_key() != public {
            return Err(CipherError::KeyPairMismatch);
        }
        if public.size() <= PKCS1_OVERHEAD {
            return Err(CipherError::InvalidKey(format!(
                "modulus too small: {} bytes",
                public.size()
            )));
        }
        Ok(Self { public, private })
    }

    /// Build from a private key alone
    pub fn from_private(private: RsaPrivateKey) -> Result<Self> {
        Self::new(private.to_public_key(), private)
    }

    /// Generate a new random key pair
    pub fn generate(bits: usize) -> Result<Self> {
        let private = RsaPrivateKey::new(&mut OsRng, bits)?;
        Self::from_private(private)
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private
    }
}

impl std::fmt::Debug for KeyPairMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPairMaterial")
            .field("modulus_bits", &(self.public.size() * 8))
            .finish_non_exhaustive()
    }
}

/// Encrypt-mode half of the asymmetric strategy
#[derive(Clone)]
pub struct AsymmetricWriter {
    key: RsaPublicKey,
}

impl AsymmetricWriter {
    /// Largest plaintext carried by one block
    pub fn max_block_payload(&self) -> usize {
        self.key.size() - PKCS1_OVERHEAD
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let block_len = self.key.size();
        let chunk_len = self.max_block_payload();
        let mut out = Vec::with_capacity(plaintext.len().div_ceil(chunk_len) * block_len);
        let mut rng = OsRng;

        for chunk in plaintext.chunks(chunk_len) {
            let block = self
                .key
                .encrypt(&mut rng, Pkcs1v15Encrypt, chunk)
                .map_err(|_| CipherError::EncryptionFailed)?;
            out.extend_from_slice(&block);
        }
        Ok(out)
    }
}

/// Decrypt-mode half of the asymmetric strategy
#[derive(Clone)]
pub struct AsymmetricReader {
    key: RsaPrivateKey,
}

impl AsymmetricReader {
    /// Ciphertext block size
    pub fn block_len(&self) -> usize {
        self.key.size()
    }

    pub fn decrypt(&self, message: &[u8]) -> Result<Vec<u8>> {
        let block_len = self.block_len();
        if message.len() % block_len != 0 {
            return Err(CipherError::DecryptionFailed);
        }

        let mut out = Vec::with_capacity(message.len());
        for block in message.chunks(block_len) {
            let plain = self
                .key
                .decrypt(Pkcs1v15Encrypt, block)
                .map_err(|_| CipherError::DecryptionFailed)?;
            out.extend_from_slice(&plain);
        }
        Ok(out)
    }
}

/// Asymmetric strategy: public key writes, private key reads
pub struct AsymmetricCipherStrategy {
    writer: AsymmetricWriter,
    reader: AsymmetricReader,
}

impl AsymmetricCipherStrategy {
    pub fn new(key_pair: KeyPairMaterial) -> Self {
        let KeyPairMaterial { public, private } = key_pair;
        Self {
            writer: AsymmetricWriter { key: public },
            reader: AsymmetricReader { key: private },
        }
    }

    pub fn writer(&self) -> &AsymmetricWriter {
        &self.writer
    }

    pub fn reader(&self) -> &AsymmetricReader {
        &self.reader
    }
}
