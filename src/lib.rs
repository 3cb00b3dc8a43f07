//! MirrorCryptFS - Transparent encrypting mirror filesystem
//!
//! This library provides a FUSE-based filesystem that exposes a backing
//! directory at a mount point, storing the content of flagged regular files
//! encrypted with AES-256-GCM under a key derived from a key phrase.

pub mod config;
pub mod crypto;
pub mod error;
pub mod fs;
pub mod session;

pub use config::Config;
pub use error::{Error, Result};
pub use fs::{Dispatcher, MirrorFs};
pub use session::MountSession;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::fs::{Dispatcher, EncryptionFlag};
    pub use crate::session::MountSession;
}
