//! Shared RSA keys for tests
//!
//! Key generation is slow in debug builds, so each key is generated once per
//! test binary.

use crate::asymmetric::KeyPairMaterial;
use std::sync::OnceLock;

const TEST_KEY_BITS: usize = 1024;

static KEY_PAIR: OnceLock<KeyPairMaterial> = OnceLock::new();
static OTHER_KEY_PAIR: OnceLock<KeyPairMaterial> = OnceLock::new();

pub fn key_pair() -> KeyPairMaterial {
    KEY_PAIR
        .get_or_init(|| KeyPairMaterial::generate(TEST_KEY_BITS).unwrap())
        .clone()
}

pub fn other_key_pair() -> KeyPairMaterial {
    OTHER_KEY_PAIR
        .get_or_init(|| KeyPairMaterial::generate(TEST_KEY_BITS).unwrap())
        .clone()
}
