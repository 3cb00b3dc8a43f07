//! Key schedule: key phrase --Argon2id--> master key --HKDF-SHA256--> content key
//!
//! The salt lives on the mirror root, so the same phrase always opens the
//! same mirror and two mirrors never share a content key.

use crate::config::EncryptionConfig;
use crate::crypto::{ContentKey, KEY_SIZE, SALT_SIZE};
use crate::error::{Error, Result};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use ring::hkdf::{KeyType, Salt, HKDF_SHA256};
use zeroize::Zeroizing;

/// HKDF info string for the file content key
const CONTENT_KEY_PURPOSE: &[u8] = b"mirrorcryptfs-content-v1";

/// Argon2id output for a key phrase under one mirror's salt
pub struct MasterKey {
    key: Zeroizing<[u8; KEY_SIZE]>,
    salt: [u8; SALT_SIZE],
}

impl MasterKey {
    pub fn salt(&self) -> &[u8; SALT_SIZE] {
        &self.salt
    }
}

/// Stretch a key phrase with Argon2id using the configured cost
pub fn derive_master_key(
    phrase: &[u8],
    salt: &[u8; SALT_SIZE],
    config: &EncryptionConfig,
) -> Result<MasterKey> {
    let params = Params::new(
        config.argon2_memory_kib,
        config.argon2_iterations,
        config.argon2_parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| Error::KeyDerivation(format!("Invalid Argon2 parameters: {}", e)))?;

    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
        .hash_password_into(phrase, salt, &mut key[..])
        .map_err(|e| Error::KeyDerivation(format!("Argon2 failed: {}", e)))?;

    Ok(MasterKey { key, salt: *salt })
}

/// Fresh random salt for a new mirror
pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Expand the master key into the AES-256 key used for file content
pub fn derive_content_key(master: &MasterKey) -> Result<ContentKey> {
    let prk = Salt::new(HKDF_SHA256, &master.salt).extract(&master.key[..]);

    let mut output = Zeroizing::new([0u8; KEY_SIZE]);
    prk.expand(&[CONTENT_KEY_PURPOSE], ContentKeyLen)
        .map_err(|_| Error::KeyDerivation("HKDF expansion failed".to_string()))?
        .fill(&mut output[..])
        .map_err(|_| Error::KeyDerivation("HKDF fill failed".to_string()))?;

    Ok(ContentKey::from_bytes(*output))
}

struct ContentKeyLen;

impl KeyType for ContentKeyLen {
    fn len(&self) -> usize {
        KEY_SIZE
    }
}
