//! Mount session: key material and the two roots, built once at startup
//!
//! The session is immutable and handed to the dispatcher behind an `Arc`;
//! there is no global state.

use crate::config::EncryptionConfig;
use crate::crypto::{derive_content_key, derive_master_key, generate_salt, ContentKey, SALT_SIZE};
use crate::error::{Error, Result};
use crate::fs::xattr;
use std::path::{Path, PathBuf};
use tracing::info;

/// Attribute on the mirror root holding the key-derivation salt (hex)
pub const SALT_XATTR: &str = "user.mirrorcryptfs.salt";

/// Immutable per-mount context
#[derive(Debug)]
pub struct MountSession {
    key: ContentKey,
    backing_root: PathBuf,
    mount_root: PathBuf,
}

impl MountSession {
    /// Build a session from the startup arguments
    ///
    /// Both directories are canonicalized. The mirror's salt is created on
    /// first use and reused afterwards, so a key phrase always maps to the
    /// same content key for a given mirror.
    pub fn open(
        key_phrase: &str,
        mirror_dir: &Path,
        mount_point: &Path,
        config: &EncryptionConfig,
    ) -> Result<Self> {
        if key_phrase.is_empty() {
            return Err(Error::InvalidArgument("Key phrase must not be empty".to_string()));
        }

        let backing_root = mirror_dir.canonicalize()?;
        let mount_root = mount_point.canonicalize()?;

        let salt = load_or_create_salt(&backing_root)?;
        let master = derive_master_key(key_phrase.as_bytes(), &salt, config)?;
        let key = derive_content_key(&master)?;

        info!("Mirror {:?} mapped to {:?}", backing_root, mount_root);

        Ok(Self {
            key,
            backing_root,
            mount_root,
        })
    }

    /// Build a session from an already derived key
    pub fn with_key(key: ContentKey, mirror_dir: &Path, mount_point: &Path) -> Result<Self> {
        Ok(Self {
            key,
            backing_root: mirror_dir.canonicalize()?,
            mount_root: mount_point.canonicalize()?,
        })
    }

    pub fn key(&self) -> &ContentKey {
        &self.key
    }

    pub fn backing_root(&self) -> &Path {
        &self.backing_root
    }

    pub fn mount_root(&self) -> &Path {
        &self.mount_root
    }
}

fn load_or_create_salt(backing_root: &Path) -> Result<[u8; SALT_SIZE]> {
    match xattr::get(backing_root, SALT_XATTR.as_bytes()) {
        Ok(stored) => {
            let bytes = hex::decode(&stored)
                .map_err(|e| Error::KeyDerivation(format!("Corrupt salt on mirror root: {}", e)))?;
            if bytes.len() != SALT_SIZE {
                return Err(Error::KeyDerivation(format!(
                    "Salt on mirror root has {} bytes, expected {}",
                    bytes.len(),
                    SALT_SIZE
                )));
            }
            let mut salt = [0u8; SALT_SIZE];
            salt.copy_from_slice(&bytes);
            Ok(salt)
        }
        Err(e) if xattr::is_missing(&e) => {
            let salt = generate_salt();
            xattr::set(
                backing_root,
                SALT_XATTR.as_bytes(),
                hex::encode(salt).as_bytes(),
                libc::XATTR_CREATE,
            )?;
            info!("Initialized new mirror at {:?}", backing_root);
            Ok(salt)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{decrypt, encrypt};
    use tempfile::tempdir;

    fn test_config() -> EncryptionConfig {
        EncryptionConfig {
            argon2_memory_kib: 1024,
            argon2_iterations: 1,
            argon2_parallelism: 1,
        }
    }

    #[test]
    fn test_open_canonicalizes_roots() {
        let mirror = tempdir().unwrap();
        let mount = tempdir().unwrap();
        let dotted = mirror.path().join(".");

        let session = MountSession::open("phrase", &dotted, mount.path(), &test_config()).unwrap();
        assert_eq!(session.backing_root(), mirror.path().canonicalize().unwrap());
        assert_eq!(session.mount_root(), mount.path().canonicalize().unwrap());
    }

    #[test]
    fn test_empty_key_phrase_rejected() {
        let mirror = tempdir().unwrap();
        let mount = tempdir().unwrap();
        let err = MountSession::open("", mirror.path(), mount.path(), &test_config()).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_missing_mirror_fails() {
        let mount = tempdir().unwrap();
        let missing = mount.path().join("nope");
        assert!(MountSession::open("phrase", &missing, mount.path(), &test_config()).is_err());
    }

    #[test]
    fn test_same_phrase_same_key_across_mounts() {
        let mirror = tempdir().unwrap();
        let mount = tempdir().unwrap();

        let first = MountSession::open("phrase", mirror.path(), mount.path(), &test_config()).unwrap();
        let sealed = encrypt(first.key(), b"persisted").unwrap();

        let second = MountSession::open("phrase", mirror.path(), mount.path(), &test_config()).unwrap();
        assert_eq!(decrypt(second.key(), &sealed).unwrap(), b"persisted");

        let other = MountSession::open("other", mirror.path(), mount.path(), &test_config()).unwrap();
        assert!(decrypt(other.key(), &sealed).is_err());
    }

    #[test]
    fn test_salt_is_stored_on_root() {
        let mirror = tempdir().unwrap();
        let mount = tempdir().unwrap();
        MountSession::open("phrase", mirror.path(), mount.path(), &test_config()).unwrap();

        let stored = xattr::get(mirror.path(), SALT_XATTR.as_bytes()).unwrap();
        assert_eq!(stored.len(), SALT_SIZE * 2);
    }
}
