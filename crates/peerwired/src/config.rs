//! Configuration for peerwired

use clap::{Args, Parser, Subcommand};
use peerwire_crypto::config::{
    DEFAULT_ITERATIONS, DEFAULT_KEY_ALIAS, DEFAULT_PASSPHRASE, DEFAULT_SALT,
};
use peerwire_crypto::keystore::DEFAULT_STORE_ITERATIONS;
use peerwire_crypto::{AsymmetricConfig, EncryptionConfig, Secret, SymmetricConfig, SALT_LEN};
use std::net::SocketAddr;
use std::path::PathBuf;

/// peerwired - encrypted node link daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "peerwired")]
#[command(about = "peerwire encrypted node link daemon")]
pub struct Config {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty", global = true)]
    pub log_format: String,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Accept and dial node links
    Serve(ServeArgs),
    /// Generate an RSA key pair into a key-store
    Keygen(KeygenArgs),
}

/// Encryption toggles and key material
#[derive(Args, Debug, Clone)]
pub struct EncryptionArgs {
    /// Encrypt links with a shared passphrase
    #[arg(long, env = "PEERWIRE_SYMMETRIC_ENABLED")]
    pub symmetric_encryption: bool,

    /// Passphrase for symmetric encryption
    #[arg(long, env = "PEERWIRE_PASSPHRASE", default_value = DEFAULT_PASSPHRASE, hide_env_values = true)]
    pub passphrase: String,

    /// Key derivation salt (hex, 8 bytes)
    #[arg(long, env = "PEERWIRE_SALT", default_value_t = hex::encode(DEFAULT_SALT))]
    pub salt: String,

    /// Key derivation iteration count
    #[arg(long, env = "PEERWIRE_ITERATIONS", default_value_t = DEFAULT_ITERATIONS)]
    pub iterations: u32,

    /// Encrypt links with the key pair from the key-store
    #[arg(long, env = "PEERWIRE_ASYMMETRIC_ENABLED")]
    pub asymmetric_encryption: bool,

    /// Key-store path
    #[arg(long, env = "PEERWIRE_KEYSTORE")]
    pub keystore: Option<PathBuf>,

    /// Key-store credential
    #[arg(long, env = "PEERWIRE_STORE_CREDENTIAL", default_value = "", hide_env_values = true)]
    pub store_credential: String,

    /// Alias of the key pair in the key-store
    #[arg(long, env = "PEERWIRE_KEY_ALIAS", default_value = DEFAULT_KEY_ALIAS)]
    pub key_alias: String,

    /// Credential sealing the private key
    #[arg(long, env = "PEERWIRE_KEY_CREDENTIAL", default_value = "", hide_env_values = true)]
    pub key_credential: String,
}

impl EncryptionArgs {
    /// Validate and convert into crypto configuration
    pub fn to_config(&self) -> anyhow::Result<EncryptionConfig> {
        let salt = hex::decode(&self.salt)
            .map_err(|e| anyhow::anyhow!("salt must be hex: {}", e))?;
        if salt.len() != SALT_LEN {
            anyhow::bail!("salt must be {} bytes, got {}", SALT_LEN, salt.len());
        }

        let symmetric = SymmetricConfig {
            enabled: self.symmetric_encryption,
            passphrase: Secret::new(self.passphrase.as_str()),
            salt,
            iteration_count: self.iterations,
        };

        let key_store = match (&self.keystore, self.asymmetric_encryption) {
            (Some(path), _) => path.clone(),
            (None, true) => anyhow::bail!("asymmetric encryption needs --keystore"),
            (None, false) => PathBuf::new(),
        };
        let asymmetric = AsymmetricConfig {
            enabled: self.asymmetric_encryption,
            key_store,
            store_credential: Secret::new(self.store_credential.as_str()),
            key_alias: self.key_alias.clone(),
            key_credential: Secret::new(self.key_credential.as_str()),
        };

        Ok(EncryptionConfig {
            symmetric,
            asymmetric,
        })
    }
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Listen address for node links
    #[arg(short, long, env = "PEERWIRE_LISTEN", default_value = "127.0.0.1:5701")]
    pub listen: SocketAddr,

    /// Peers to dial at startup (comma-separated addresses)
    #[arg(long, value_delimiter = ',')]
    pub peers: Vec<SocketAddr>,

    /// Dial timeout in seconds
    #[arg(long, default_value = "5")]
    pub connect_timeout_secs: u64,

    /// Link statistics interval in seconds
    #[arg(long, default_value = "60")]
    pub stats_interval_secs: u64,

    #[command(flatten)]
    pub encryption: EncryptionArgs,
}

#[derive(Args, Debug, Clone)]
pub struct KeygenArgs {
    /// Key-store path to write
    #[arg(long, env = "PEERWIRE_KEYSTORE")]
    pub keystore: PathBuf,

    /// Alias for the new key pair
    #[arg(long, default_value = DEFAULT_KEY_ALIAS)]
    pub alias: String,

    /// Key-store credential
    #[arg(long, env = "PEERWIRE_STORE_CREDENTIAL", hide_env_values = true)]
    pub store_credential: String,

    /// Credential sealing the private key
    #[arg(long, env = "PEERWIRE_KEY_CREDENTIAL", hide_env_values = true)]
    pub key_credential: String,

    /// RSA modulus size
    #[arg(long, default_value = "2048")]
    pub bits: usize,

    /// PBKDF2 iterations protecting the credentials
    #[arg(long, default_value_t = DEFAULT_STORE_ITERATIONS)]
    pub iterations: u32,

    /// Overwrite an existing key-store
    #[arg(long)]
    pub force: bool,
}

impl KeygenArgs {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.store_credential.is_empty() || self.key_credential.is_empty() {
            anyhow::bail!("Key-store and key credentials cannot be empty");
        }
        if self.bits < 1024 {
            anyhow::bail!("RSA keys below 1024 bits are not accepted");
        }
        Ok(())
    }
}
