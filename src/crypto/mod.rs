//! Cryptography module for mirrorcryptfs
//!
//! Provides AES-256-GCM whole-buffer encryption with an Argon2id + HKDF key
//! schedule. The rest of the crate only sees [`transform`].

mod encryption;
mod kdf;

pub use encryption::{decrypt, encrypt, ContentKey};
pub use kdf::{derive_content_key, derive_master_key, generate_salt, MasterKey};

use crate::error::Result;

/// Size of AES-256 key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of GCM nonce in bytes
pub const NONCE_SIZE: usize = 12;

/// Size of GCM authentication tag in bytes
pub const TAG_SIZE: usize = 16;

/// Bytes added to every non-empty ciphertext
pub const OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

/// Size of salt for key derivation
pub const SALT_SIZE: usize = 32;

/// What to do with a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Encrypt,
    Decrypt,
    /// Identity, used for files stored as plaintext
    Passthrough,
}

/// Run `action` over the whole of `content`
pub fn transform(content: &[u8], action: Action, key: &ContentKey) -> Result<Vec<u8>> {
    match action {
        Action::Encrypt => encrypt(key, content),
        Action::Decrypt => decrypt(key, content),
        Action::Passthrough => Ok(content.to_vec()),
    }
}

/// Plaintext length for a stored ciphertext of `raw_len` bytes
pub fn plaintext_len(raw_len: u64) -> u64 {
    raw_len.saturating_sub(OVERHEAD as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passthrough_is_identity() {
        let key = ContentKey::from_bytes([7u8; KEY_SIZE]);
        let out = transform(b"plain bytes", Action::Passthrough, &key).unwrap();
        assert_eq!(out, b"plain bytes");
    }

    #[test]
    fn test_transform_round_trip() {
        let key = ContentKey::from_bytes([9u8; KEY_SIZE]);
        for size in [0usize, 1, 4096, 1_000_000] {
            let plain: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            let sealed = transform(&plain, Action::Encrypt, &key).unwrap();
            assert_eq!(sealed.len(), size + OVERHEAD);
            let opened = transform(&sealed, Action::Decrypt, &key).unwrap();
            assert_eq!(opened, plain);
        }
    }

    #[test]
    fn test_plaintext_len() {
        assert_eq!(plaintext_len(0), 0);
        assert_eq!(plaintext_len(OVERHEAD as u64), 0);
        assert_eq!(plaintext_len(OVERHEAD as u64 + 5), 5);
    }
}
