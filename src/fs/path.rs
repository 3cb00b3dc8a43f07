//! Virtual path to backing path mapping

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

/// Longest backing path accepted, counting the trailing NUL the syscalls need
pub const MAX_PATH_LEN: usize = libc::PATH_MAX as usize;

/// Maps paths under the mount point onto the mirror directory
#[derive(Debug, Clone)]
pub struct PathResolver {
    /// Root of the backing store
    root: PathBuf,
}

impl PathResolver {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Get the root path
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a virtual path (`/a/b`) to `<backing_root>/a/b`
    ///
    /// Fails with [`Error::PathTooLong`] instead of truncating.
    pub fn resolve(&self, virtual_path: &Path) -> Result<PathBuf> {
        let relative = virtual_path.strip_prefix("/").unwrap_or(virtual_path);
        let resolved = if relative.as_os_str().is_empty() {
            self.root.clone()
        } else {
            self.root.join(relative)
        };

        let len = resolved.as_os_str().len();
        if len + 1 > MAX_PATH_LEN {
            return Err(Error::PathTooLong {
                len,
                max: MAX_PATH_LEN - 1,
            });
        }

        Ok(resolved)
    }
}
