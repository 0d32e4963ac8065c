//! Encryption configuration values
//!
//! These are plain values; where they come from (flags, environment, files)
//! is the caller's business.

use crate::error::{CipherError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use zeroize::Zeroizing;

/// Salt length in bytes for password-based key derivation
pub const SALT_LEN: usize = 8;

/// Default passphrase for symmetric encryption
pub const DEFAULT_PASSPHRASE: &str = "hazelcast";

/// Default 8-byte salt
pub const DEFAULT_SALT: [u8; SALT_LEN] = [0xA9, 0x9B, 0xC8, 0x32, 0x56, 0x35, 0xE3, 0x03];

/// Default PBKDF2 iteration count
pub const DEFAULT_ITERATIONS: u32 = 32;

/// Default key-store alias
pub const DEFAULT_KEY_ALIAS: &str = "local";

/// A secret string, wiped on drop and never printed
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(Zeroizing<String>);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    /// Expose the secret bytes
    pub fn expose(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Parameters for the symmetric (shared passphrase) strategy
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SymmetricConfig {
    /// Toggle
    pub enabled: bool,
    /// Passphrase fed to the key derivation
    pub passphrase: Secret,
    /// Salt, exactly [`SALT_LEN`] bytes
    pub salt: Vec<u8>,
    /// PBKDF2 iteration count
    pub iteration_count: u32,
}

impl Default for SymmetricConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            passphrase: Secret::new(DEFAULT_PASSPHRASE),
            salt: DEFAULT_SALT.to_vec(),
            iteration_count: DEFAULT_ITERATIONS,
        }
    }
}

impl SymmetricConfig {
    /// Enabled config with the default key material
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    /// Check derivation parameters and return the fixed-length salt
    pub fn validate(&self) -> Result<[u8; SALT_LEN]> {
        if self.passphrase.is_empty() {
            return Err(CipherError::EmptyPassphrase);
        }
        if self.iteration_count == 0 {
            return Err(CipherError::ZeroIterations);
        }
        self.salt
            .as_slice()
            .try_into()
            .map_err(|_| CipherError::InvalidSaltLength(self.salt.len()))
    }
}

/// Locator for the asymmetric key pair
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AsymmetricConfig {
    /// Toggle
    pub enabled: bool,
    /// Key-store location
    pub key_store: PathBuf,
    /// Credential authenticating the key-store
    pub store_credential: Secret,
    /// Alias of the key pair entry
    pub key_alias: String,
    /// Credential sealing the private key
    pub key_credential: Secret,
}

impl AsymmetricConfig {
    pub fn enabled(
        key_store: impl Into<PathBuf>,
        store_credential: impl Into<Secret>,
        key_alias: impl Into<String>,
        key_credential: impl Into<Secret>,
    ) -> Self {
        Self {
            enabled: true,
            key_store: key_store.into(),
            store_credential: store_credential.into(),
            key_alias: key_alias.into(),
            key_credential: key_credential.into(),
        }
    }
}

/// Both encryption toggles and their parameters
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EncryptionConfig {
    pub symmetric: SymmetricConfig,
    pub asymmetric: AsymmetricConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_disabled() {
        let config = EncryptionConfig::default();
        assert!(!config.symmetric.enabled);
        assert!(!config.asymmetric.enabled);
        assert_eq!(config.symmetric.validate().unwrap(), DEFAULT_SALT);
    }

    #[test]
    fn test_validate_rejects_bad_parameters() {
        let mut config = SymmetricConfig::enabled();
        config.salt = vec![1, 2, 3];
        assert!(matches!(
            config.validate(),
            Err(CipherError::InvalidSaltLength(3))
        ));

        let mut config = SymmetricConfig::enabled();
        config.iteration_count = 0;
        assert!(matches!(config.validate(), Err(CipherError::ZeroIterations)));

        let mut config = SymmetricConfig::enabled();
        config.passphrase = Secret::new("");
        assert!(matches!(config.validate(), Err(CipherError::EmptyPassphrase)));
    }

    #[test]
    fn test_secret_not_printed() {
        let secret = Secret::new("thestorepass");
        assert_eq!(format!("{:?}", secret), "Secret(***)");
        assert_eq!(secret.expose(), b"thestorepass");
    }
}
