//! Error types for mirrorcryptfs
//!
//! Every failure that reaches the FUSE bridge is translated into a POSIX
//! error code through [`Error::to_errno`].

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the filesystem core
#[derive(Debug, Error)]
pub enum Error {
    /// Backing-store I/O failure, carries the OS error verbatim
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Backing path would exceed the platform path limit
    #[error("Path too long: {len} bytes exceeds limit of {max}")]
    PathTooLong { len: usize, max: usize },

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Convert to a (positive) libc error code for the FUSE reply
    pub fn to_errno(&self) -> i32 {
        match self {
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::PathTooLong { .. } => libc::ENAMETOOLONG,
            Error::InvalidArgument(_) => libc::EINVAL,
            // No dedicated crypto channel exists at the FUSE boundary
            Error::Encryption(_) | Error::Decryption(_) | Error::KeyDerivation(_) => libc::EIO,
            Error::Config(_) | Error::InvalidConfig(_) | Error::Internal(_) => libc::EIO,
        }
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(errno: nix::errno::Errno) -> Self {
        Error::Io(std::io::Error::from_raw_os_error(errno as i32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_keeps_os_code() {
        let err = Error::from(std::io::Error::from_raw_os_error(libc::EACCES));
        assert_eq!(err.to_errno(), libc::EACCES);
    }

    #[test]
    fn test_io_error_without_code_is_eio() {
        let err = Error::from(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert_eq!(err.to_errno(), libc::EIO);
    }

    #[test]
    fn test_crypto_errors_surface_as_eio() {
        assert_eq!(Error::Decryption("bad tag".into()).to_errno(), libc::EIO);
        assert_eq!(Error::Encryption("bad key".into()).to_errno(), libc::EIO);
    }

    #[test]
    fn test_path_too_long_is_enametoolong() {
        let err = Error::PathTooLong { len: 5000, max: 4096 };
        assert_eq!(err.to_errno(), libc::ENAMETOOLONG);
    }

    #[test]
    fn test_nix_errno_conversion() {
        let err = Error::from(nix::errno::Errno::ENOENT);
        assert_eq!(err.to_errno(), libc::ENOENT);
    }
}
