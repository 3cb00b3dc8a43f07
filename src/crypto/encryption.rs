//! AES-256-GCM encryption of whole file contents
//!
//! Layout on disk: `nonce || ciphertext || tag`. A zero-length buffer is the
//! state of a freshly created file and decrypts to an empty plaintext.

use crate::crypto::{KEY_SIZE, NONCE_SIZE, OVERHEAD};
use crate::error::{Error, Result};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use zeroize::Zeroizing;

/// Key used for file contents (zeroized on drop)
#[derive(Clone)]
pub struct ContentKey {
    key: Zeroizing<[u8; KEY_SIZE]>,
}

impl ContentKey {
    /// Wrap raw key bytes
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        ContentKey {
            key: Zeroizing::new(bytes),
        }
    }

    fn aead_key(&self) -> Result<LessSafeKey> {
        let unbound = UnboundKey::new(&AES_256_GCM, self.key.as_ref())
            .map_err(|_| Error::Encryption("Invalid AES-256 key".to_string()))?;
        Ok(LessSafeKey::new(unbound))
    }
}

impl std::fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ContentKey(..)")
    }
}

/// Encrypt `plaintext` under a fresh random nonce
pub fn encrypt(key: &ContentKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let aead_key = key.aead_key()?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    SystemRandom::new()
        .fill(&mut nonce_bytes)
        .map_err(|_| Error::Encryption("Failed to generate nonce".to_string()))?;
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);

    let mut in_out = Vec::with_capacity(plaintext.len() + OVERHEAD);
    in_out.extend_from_slice(plaintext);
    aead_key
        .seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
        .map_err(|_| Error::Encryption("AES-GCM seal failed".to_string()))?;

    let mut output = Vec::with_capacity(NONCE_SIZE + in_out.len());
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&in_out);
    Ok(output)
}

/// Decrypt a buffer produced by [`encrypt`]
pub fn decrypt(key: &ContentKey, data: &[u8]) -> Result<Vec<u8>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }

    if data.len() < OVERHEAD {
        return Err(Error::Decryption(format!(
            "Ciphertext too short: {} bytes, need at least {}",
            data.len(),
            OVERHEAD
        )));
    }

    let aead_key = key.aead_key()?;
    let (nonce_bytes, sealed) = data.split_at(NONCE_SIZE);
    let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
        .map_err(|_| Error::Decryption("Invalid nonce".to_string()))?;

    let mut in_out = sealed.to_vec();
    let plaintext_len = aead_key
        .open_in_place(nonce, Aad::empty(), &mut in_out)
        .map_err(|_| Error::Decryption("Authentication failed (wrong key or corrupt data)".to_string()))?
        .len();
    in_out.truncate(plaintext_len);

    Ok(in_out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> ContentKey {
        ContentKey::from_bytes([byte; KEY_SIZE])
    }

    #[test]
    fn test_encrypt_hides_plaintext() {
        let sealed = encrypt(&key(1), b"TOPSECRET").unwrap();
        assert_ne!(&sealed[..], b"TOPSECRET");
        assert!(!sealed.windows(9).any(|w| w == b"TOPSECRET"));
    }

    #[test]
    fn test_nonce_is_fresh_per_call() {
        let a = encrypt(&key(1), b"same").unwrap();
        let b = encrypt(&key(1), b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = encrypt(&key(1), b"data").unwrap();
        assert!(matches!(decrypt(&key(2), &sealed), Err(Error::Decryption(_))));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let mut sealed = encrypt(&key(1), b"data").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert!(decrypt(&key(1), &sealed).is_err());
    }

    #[test]
    fn test_empty_input_decrypts_to_empty() {
        assert!(decrypt(&key(1), &[]).unwrap().is_empty());
    }

    #[test]
    fn test_truncated_input_is_rejected() {
        assert!(matches!(
            decrypt(&key(1), &[0u8; OVERHEAD - 1]),
            Err(Error::Decryption(_))
        ));
    }

    #[test]
    fn test_debug_does_not_leak_key() {
        assert_eq!(format!("{:?}", key(0x41)), "ContentKey(..)");
    }
}
