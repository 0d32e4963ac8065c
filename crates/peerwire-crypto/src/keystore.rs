//! Key material providers
//!
//! The asymmetric strategy never reads keys itself; it asks a
//! [`KeyMaterialProvider`] for the pair described by an [`AsymmetricConfig`].
//!
//! [`FileKeyStore`] reads a JSON key-store:
//!
//! ```text
//! {
//!   "version": 1,
//!   "salt": hex(8), "iterations": n,
//!   "entries": { alias: { public_key, salt, iterations, sealed_private_key } },
//!   "mac": hex(HMAC-SHA256(PBKDF2(store credential), version || entries))
//! }
//! ```
//!
//! The store credential authenticates the entry table. Each private key is
//! PKCS#8 DER sealed with XChaCha20-Poly1305 under a PBKDF2 derivation of its
//! key credential. Public keys are PKCS#1 DER in the clear.

use crate::asymmetric::KeyPairMaterial;
use crate::config::{AsymmetricConfig, Secret, SALT_LEN};
use crate::error::{CipherError, Result};
use crate::symmetric::{cipher_for, derive_key, open, seal};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// Key-store document version
pub const KEY_STORE_VERSION: u32 = 1;

/// Default PBKDF2 iteration count for key-store credentials
pub const DEFAULT_STORE_ITERATIONS: u32 = 100_000;

/// Source of the asymmetric key pair
pub trait KeyMaterialProvider: Send + Sync {
    /// Load the key pair located by `config`
    fn load_key_pair(&self, config: &AsymmetricConfig) -> Result<KeyPairMaterial>;
}

/// Provider returning a fixed, already loaded key pair
#[derive(Clone, Debug)]
pub struct StaticKeyPair(pub KeyPairMaterial);

impl KeyMaterialProvider for StaticKeyPair {
    fn load_key_pair(&self, _config: &AsymmetricConfig) -> Result<KeyPairMaterial> {
        Ok(self.0.clone())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct KeyEntry {
    public_key: String,
    salt: String,
    iterations: u32,
    sealed_private_key: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct KeyStoreDocument {
    version: u32,
    salt: String,
    iterations: u32,
    entries: BTreeMap<String, KeyEntry>,
    mac: String,
}

fn random_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

fn decode_hex(field: &str, value: &str) -> Result<Vec<u8>> {
    hex::decode(value).map_err(|e| CipherError::MalformedKeyStore(format!("{field}: {e}")))
}

fn decode_salt(field: &str, value: &str) -> Result<[u8; SALT_LEN]> {
    decode_hex(field, value)?
        .as_slice()
        .try_into()
        .map_err(|_| CipherError::MalformedKeyStore(format!("{field}: bad salt length")))
}

/// MAC over the version and entry table, keyed by the store credential
fn entries_mac(
    store_credential: &Secret,
    salt: &[u8; SALT_LEN],
    iterations: u32,
    version: u32,
    entries: &BTreeMap<String, KeyEntry>,
) -> Result<HmacSha256> {
    let key = derive_key(store_credential.expose(), salt, iterations)?;
    let table = serde_json::to_vec(entries)
        .map_err(|e| CipherError::MalformedKeyStore(e.to_string()))?;

    let mut mac = <HmacSha256 as Mac>::new_from_slice(&key[..])
        .map_err(|_| CipherError::InvalidKey("hmac key".into()))?;
    mac.update(&version.to_be_bytes());
    mac.update(&table);
    Ok(mac)
}

/// A key-store opened with its store credential
#[derive(Debug)]
pub struct OpenedKeyStore {
    entries: BTreeMap<String, KeyEntry>,
}

impl OpenedKeyStore {
    /// Parse and authenticate a key-store document
    pub fn from_json(json: &str, store_credential: &Secret) -> Result<Self> {
        let doc: KeyStoreDocument = serde_json::from_str(json)
            .map_err(|e| CipherError::MalformedKeyStore(e.to_string()))?;

        if doc.version != KEY_STORE_VERSION {
            return Err(CipherError::MalformedKeyStore(format!(
                "unsupported version {}",
                doc.version
            )));
        }

        let salt = decode_salt("salt", &doc.salt)?;
        let tag = decode_hex("mac", &doc.mac)?;
        entries_mac(store_credential, &salt, doc.iterations, doc.version, &doc.entries)?
            .verify_slice(&tag)
            .map_err(|_| CipherError::StoreIntegrity)?;

        Ok(Self {
            entries: doc.entries,
        })
    }

    /// Aliases present in the store
    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Unseal the key pair stored under `alias`
    pub fn key_pair(&self, alias: &str, key_credential: &Secret) -> Result<KeyPairMaterial> {
        let entry = self
            .entries
            .get(alias)
            .ok_or_else(|| CipherError::UnknownAlias(alias.to_string()))?;

        let salt = decode_salt("entry salt", &entry.salt)?;
        let sealed = decode_hex("sealed_private_key", &entry.sealed_private_key)?;
        let key = derive_key(key_credential.expose(), &salt, entry.iterations)?;
        let der = Zeroizing::new(
            open(&cipher_for(&key), &sealed)
                .map_err(|_| CipherError::KeyCredential(alias.to_string()))?,
        );

        let private = RsaPrivateKey::from_pkcs8_der(&der)
            .map_err(|e| CipherError::InvalidKey(e.to_string()))?;
        let public = RsaPublicKey::from_pkcs1_der(&decode_hex("public_key", &entry.public_key)?)
            .map_err(|e| CipherError::InvalidKey(e.to_string()))?;

        KeyPairMaterial::new(public, private)
    }
}

/// Key-store file on disk, located by [`AsymmetricConfig::key_store`]
#[derive(Clone, Copy, Debug, Default)]
pub struct FileKeyStore;

impl FileKeyStore {
    /// Read and authenticate the key-store at `path`
    pub fn open(path: &Path, store_credential: &Secret) -> Result<OpenedKeyStore> {
        let json = std::fs::read_to_string(path).map_err(|source| CipherError::KeyStoreIo {
            path: path.to_path_buf(),
            source,
        })?;
        OpenedKeyStore::from_json(&json, store_credential)
    }
}

impl KeyMaterialProvider for FileKeyStore {
    fn load_key_pair(&self, config: &AsymmetricConfig) -> Result<KeyPairMaterial> {
        debug!(
            "Loading key pair {:?} from {}",
            config.key_alias,
            config.key_store.display()
        );
        Self::open(&config.key_store, &config.store_credential)?
            .key_pair(&config.key_alias, &config.key_credential)
    }
}

/// Builds key-store documents
pub struct KeyStoreWriter {
    iterations: u32,
    entries: BTreeMap<String, KeyEntry>,
}

impl KeyStoreWriter {
    pub fn new() -> Self {
        Self {
            iterations: DEFAULT_STORE_ITERATIONS,
            entries: BTreeMap::new(),
        }
    }

    /// Set PBKDF2 iterations used for the credentials
    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = iterations;
        self
    }

    /// Seal `key_pair` under `key_credential` and store it as `alias`
    pub fn insert(
        &mut self,
        alias: impl Into<String>,
        key_pair: &KeyPairMaterial,
        key_credential: &Secret,
    ) -> Result<()> {
        let salt = random_salt();
        let key = derive_key(key_credential.expose(), &salt, self.iterations)?;

        let der = key_pair
            .private_key()
            .to_pkcs8_der()
            .map_err(|e| CipherError::InvalidKey(e.to_string()))?;
        let sealed = seal(&cipher_for(&key), der.as_bytes())?;
        let public = key_pair
            .public_key()
            .to_pkcs1_der()
            .map_err(|e| CipherError::InvalidKey(e.to_string()))?;

        self.entries.insert(
            alias.into(),
            KeyEntry {
                public_key: hex::encode(public.as_bytes()),
                salt: hex::encode(salt),
                iterations: self.iterations,
                sealed_private_key: hex::encode(sealed),
            },
        );
        Ok(())
    }

    /// Render the document, authenticated with `store_credential`
    pub fn to_json(&self, store_credential: &Secret) -> Result<String> {
        let salt = random_salt();
        let tag = entries_mac(
            store_credential,
            &salt,
            self.iterations,
            KEY_STORE_VERSION,
            &self.entries,
        )?
        .finalize()
        .into_bytes();

        let doc = KeyStoreDocument {
            version: KEY_STORE_VERSION,
            salt: hex::encode(salt),
            iterations: self.iterations,
            entries: self.entries.clone(),
            mac: hex::encode(tag),
        };
        serde_json::to_string_pretty(&doc).map_err(|e| CipherError::MalformedKeyStore(e.to_string()))
    }

    /// Write the document to `path`
    pub fn write(&self, path: &Path, store_credential: &Secret) -> Result<PathBuf> {
        let json = self.to_json(store_credential)?;
        std::fs::write(path, json).map_err(|source| CipherError::KeyStoreIo {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(path.to_path_buf())
    }
}

impl Default for KeyStoreWriter {
    fn default() -> Self {
        Self::new()
    }
}
