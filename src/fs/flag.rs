//! Per-file encryption flag, persisted as an extended attribute
//!
//! The flag is an ordinary `user.*` attribute, so `getfattr`/`setfattr`
//! through the mount see and change the real state.

use super::xattr;
use crate::crypto::Action;
use crate::error::Result;
use std::path::Path;
use tracing::{debug, warn};

/// Attribute holding the flag
pub const FLAG_NAME: &str = "user.mirrorcryptfs.encrypted";

const TRUE_VALUE: &[u8] = b"true";
const FALSE_VALUE: &[u8] = b"false";

/// Whether a backing file's content is stored as ciphertext
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionFlag {
    Encrypted,
    NotEncrypted,
}

impl EncryptionFlag {
    /// Attribute value for this flag
    pub fn as_value(&self) -> &'static [u8] {
        match self {
            EncryptionFlag::Encrypted => TRUE_VALUE,
            EncryptionFlag::NotEncrypted => FALSE_VALUE,
        }
    }

    /// Parse an attribute value. A trailing NUL is tolerated since C tools
    /// often store `sizeof("true")` bytes.
    pub fn parse(value: &[u8]) -> Option<Self> {
        let end = value
            .iter()
            .rposition(|b| *b != 0 && !b.is_ascii_whitespace())
            .map_or(0, |i| i + 1);
        match &value[..end] {
            TRUE_VALUE => Some(EncryptionFlag::Encrypted),
            FALSE_VALUE => Some(EncryptionFlag::NotEncrypted),
            _ => None,
        }
    }

    /// Transform applied when storing plaintext
    pub fn store_action(&self) -> Action {
        match self {
            EncryptionFlag::Encrypted => Action::Encrypt,
            EncryptionFlag::NotEncrypted => Action::Passthrough,
        }
    }

    /// Transform applied when loading stored bytes
    pub fn load_action(&self) -> Action {
        match self {
            EncryptionFlag::Encrypted => Action::Decrypt,
            EncryptionFlag::NotEncrypted => Action::Passthrough,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self, EncryptionFlag::Encrypted)
    }
}

/// True if `name` is the flag attribute
pub fn is_flag_name(name: &[u8]) -> bool {
    name == FLAG_NAME.as_bytes()
}

/// Read the flag of a backing file
///
/// A missing or unrecognised attribute reads as [`EncryptionFlag::NotEncrypted`]
/// so files placed in the mirror from outside stay readable.
pub fn get_flag(backing_path: &Path) -> Result<EncryptionFlag> {
    match xattr::get(backing_path, FLAG_NAME.as_bytes()) {
        Ok(value) => match EncryptionFlag::parse(&value) {
            Some(flag) => Ok(flag),
            None => {
                warn!(
                    "Unrecognised {} value {:?} on {:?}, treating as not encrypted",
                    FLAG_NAME,
                    String::from_utf8_lossy(&value),
                    backing_path
                );
                Ok(EncryptionFlag::NotEncrypted)
            }
        },
        Err(e) if xattr::is_missing(&e) => {
            debug!("No {} on {:?}, treating as not encrypted", FLAG_NAME, backing_path);
            Ok(EncryptionFlag::NotEncrypted)
        }
        Err(e) => Err(e),
    }
}

/// Persist the flag of a backing file
pub fn set_flag(backing_path: &Path, flag: EncryptionFlag) -> Result<()> {
    xattr::set(backing_path, FLAG_NAME.as_bytes(), flag.as_value(), 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_values() {
        assert_eq!(EncryptionFlag::parse(b"true"), Some(EncryptionFlag::Encrypted));
        assert_eq!(EncryptionFlag::parse(b"false"), Some(EncryptionFlag::NotEncrypted));
        assert_eq!(EncryptionFlag::parse(b"true\0"), Some(EncryptionFlag::Encrypted));
        assert_eq!(EncryptionFlag::parse(b"false\n"), Some(EncryptionFlag::NotEncrypted));
        assert_eq!(EncryptionFlag::parse(b"TRUE"), None);
        assert_eq!(EncryptionFlag::parse(b""), None);
    }

    #[test]
    fn test_actions() {
        assert_eq!(EncryptionFlag::Encrypted.load_action(), Action::Decrypt);
        assert_eq!(EncryptionFlag::Encrypted.store_action(), Action::Encrypt);
        assert_eq!(EncryptionFlag::NotEncrypted.load_action(), Action::Passthrough);
        assert_eq!(EncryptionFlag::NotEncrypted.store_action(), Action::Passthrough);
    }

    #[test]
    fn test_set_and_get_both_values() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, b"").unwrap();

        set_flag(&file, EncryptionFlag::Encrypted).unwrap();
        assert_eq!(get_flag(&file).unwrap(), EncryptionFlag::Encrypted);
        assert_eq!(xattr::get(&file, FLAG_NAME.as_bytes()).unwrap(), b"true");

        set_flag(&file, EncryptionFlag::NotEncrypted).unwrap();
        assert_eq!(get_flag(&file).unwrap(), EncryptionFlag::NotEncrypted);
        assert_eq!(xattr::get(&file, FLAG_NAME.as_bytes()).unwrap(), b"false");
    }

    #[test]
    fn test_missing_attribute_is_not_encrypted() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("plain");
        std::fs::write(&file, b"outside").unwrap();
        assert_eq!(get_flag(&file).unwrap(), EncryptionFlag::NotEncrypted);
    }

    #[test]
    fn test_garbage_value_is_not_encrypted() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("odd");
        std::fs::write(&file, b"").unwrap();
        xattr::set(&file, FLAG_NAME.as_bytes(), b"maybe", 0).unwrap();
        assert_eq!(get_flag(&file).unwrap(), EncryptionFlag::NotEncrypted);
    }

    #[test]
    fn test_missing_file_propagates() {
        let dir = tempdir().unwrap();
        let err = get_flag(&dir.path().join("absent")).unwrap_err();
        assert_eq!(err.to_errno(), libc::ENOENT);
    }
}
