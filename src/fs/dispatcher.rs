//! Operation dispatcher
//!
//! One method per filesystem verb, all keyed by virtual path. Every method
//! resolves its path(s) through the [`PathResolver`] first and never touches
//! a raw virtual path. Content verbs go through the crypto pipeline under the
//! per-path lock; everything else forwards to the backing store and returns
//! its OS error unchanged.

use super::attr::{FileKind, FileStat};
use super::flag::{self, EncryptionFlag};
use super::lock::PathLocks;
use super::path::PathResolver;
use super::{pipeline, xattr};
use crate::crypto::plaintext_len;
use crate::error::{Error, Result};
use crate::session::MountSession;
use filetime::FileTime;
use nix::dir::Dir;
use nix::fcntl::OFlag;
use nix::sys::stat::{Mode, SFlag};
use nix::sys::statvfs::Statvfs;
use nix::unistd::AccessFlags;
use std::ffi::{OsStr, OsString};
use std::fs::{self, DirBuilder, OpenOptions, Permissions};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, warn};

/// A directory entry as listed from the backing store
///
/// Only the inode number and type are filled in; no per-entry `stat` is done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: OsString,
    pub ino: u64,
    pub kind: FileKind,
}

/// New value for one timestamp in [`Dispatcher::utimens`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetTime {
    Now,
    At(SystemTime),
}

/// Filesystem verbs over a mirror directory
pub struct Dispatcher {
    session: Arc<MountSession>,
    resolver: PathResolver,
    locks: PathLocks,
}

impl Dispatcher {
    pub fn new(session: Arc<MountSession>) -> Self {
        let resolver = PathResolver::new(session.backing_root().to_path_buf());
        Self {
            session,
            resolver,
            locks: PathLocks::new(),
        }
    }

    pub fn session(&self) -> &MountSession {
        &self.session
    }

    /// Backing path for a virtual path
    pub fn resolve(&self, path: &Path) -> Result<PathBuf> {
        self.resolver.resolve(path)
    }

    /// `lstat` of the backing entry, with plaintext size for encrypted files
    pub fn getattr(&self, path: &Path) -> Result<FileStat> {
        debug!("getattr({:?})", path);
        let backing = self.resolve(path)?;
        let metadata = fs::symlink_metadata(&backing)?;

        let mut size = metadata.len();
        if metadata.file_type().is_file() {
            match flag::get_flag(&backing) {
                Ok(EncryptionFlag::Encrypted) => size = plaintext_len(size),
                Ok(EncryptionFlag::NotEncrypted) => {}
                Err(e) => debug!("getattr({:?}): flag unavailable, raw size: {}", path, e),
            }
        }

        Ok(FileStat { metadata, size })
    }

    pub fn access(&self, path: &Path, mask: i32) -> Result<()> {
        debug!("access({:?}, {:#o})", path, mask);
        let backing = self.resolve(path)?;
        nix::unistd::access(&backing, AccessFlags::from_bits_truncate(mask))?;
        Ok(())
    }

    /// Raw symlink target
    pub fn readlink(&self, path: &Path) -> Result<PathBuf> {
        debug!("readlink({:?})", path);
        let backing = self.resolve(path)?;
        Ok(fs::read_link(&backing)?)
    }

    /// List a directory, including `.` and `..`
    pub fn readdir(&self, path: &Path) -> Result<Vec<DirEntry>> {
        debug!("readdir({:?})", path);
        let backing = self.resolve(path)?;
        let mut dir = Dir::open(
            &backing,
            OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )?;

        let mut entries = Vec::new();
        for entry in dir.iter() {
            let entry = entry?;
            let name = OsStr::from_bytes(entry.file_name().to_bytes()).to_os_string();
            // DT_UNKNOWN is reported as a regular file rather than stat'ing
            let kind = entry.file_type().map_or(FileKind::RegularFile, FileKind::from);
            entries.push(DirEntry {
                name,
                ino: entry.ino(),
                kind,
            });
        }

        Ok(entries)
    }

    /// Create a regular file, FIFO, or device node
    pub fn mknod(&self, path: &Path, mode: u32, rdev: u64) -> Result<()> {
        debug!("mknod({:?}, {:#o}, {})", path, mode, rdev);
        let backing = self.resolve(path)?;
        let kind = SFlag::from_bits_truncate((mode & libc::S_IFMT as u32) as libc::mode_t);
        let perm = Mode::from_bits_truncate((mode & 0o7777) as libc::mode_t);

        if kind == SFlag::S_IFREG || kind.is_empty() {
            OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(mode & 0o7777)
                .open(&backing)?;
        } else if kind == SFlag::S_IFIFO {
            nix::unistd::mkfifo(&backing, perm)?;
        } else {
            nix::sys::stat::mknod(&backing, kind, perm, rdev as libc::dev_t)?;
        }
        Ok(())
    }

    pub fn mkdir(&self, path: &Path, mode: u32) -> Result<()> {
        debug!("mkdir({:?}, {:#o})", path, mode);
        let backing = self.resolve(path)?;
        DirBuilder::new().mode(mode & 0o7777).create(&backing)?;
        Ok(())
    }

    pub fn unlink(&self, path: &Path) -> Result<()> {
        debug!("unlink({:?})", path);
        let backing = self.resolve(path)?;
        self.locks.with_write(&backing, || fs::remove_file(&backing))?;
        Ok(())
    }

    pub fn rmdir(&self, path: &Path) -> Result<()> {
        debug!("rmdir({:?})", path);
        let backing = self.resolve(path)?;
        fs::remove_dir(&backing)?;
        Ok(())
    }

    /// Create `link` pointing at `target`; the target is stored as given
    pub fn symlink(&self, target: &Path, link: &Path) -> Result<()> {
        debug!("symlink({:?} -> {:?})", link, target);
        let backing_link = self.resolve(link)?;
        std::os::unix::fs::symlink(target, &backing_link)?;
        Ok(())
    }

    pub fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        debug!("rename({:?} -> {:?})", from, to);
        let backing_from = self.resolve(from)?;
        let backing_to = self.resolve(to)?;
        self.locks
            .with_write_pair(&backing_from, &backing_to, || fs::rename(&backing_from, &backing_to))?;
        Ok(())
    }

    /// Hard link `to` to the existing `from`
    pub fn link(&self, from: &Path, to: &Path) -> Result<()> {
        debug!("link({:?} -> {:?})", from, to);
        let backing_from = self.resolve(from)?;
        let backing_to = self.resolve(to)?;
        fs::hard_link(&backing_from, &backing_to)?;
        Ok(())
    }

    pub fn chmod(&self, path: &Path, mode: u32) -> Result<()> {
        debug!("chmod({:?}, {:#o})", path, mode);
        let backing = self.resolve(path)?;
        fs::set_permissions(&backing, Permissions::from_mode(mode & 0o7777))?;
        Ok(())
    }

    /// `None` leaves the respective id unchanged
    pub fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        debug!("chown({:?}, {:?}, {:?})", path, uid, gid);
        let backing = self.resolve(path)?;
        std::os::unix::fs::lchown(&backing, uid, gid)?;
        Ok(())
    }

    /// Set the logical (plaintext) size of a file
    pub fn truncate(&self, path: &Path, size: u64) -> Result<()> {
        debug!("truncate({:?}, {})", path, size);
        let backing = self.resolve(path)?;
        let key = self.session.key();
        self.locks
            .with_write(&backing, || pipeline::truncate(&backing, key, size))
    }

    /// `None` leaves the respective timestamp unchanged
    pub fn utimens(&self, path: &Path, atime: Option<SetTime>, mtime: Option<SetTime>) -> Result<()> {
        debug!("utimens({:?}, {:?}, {:?})", path, atime, mtime);
        let backing = self.resolve(path)?;
        let current = fs::symlink_metadata(&backing)?;

        let to_filetime = |value: SetTime| match value {
            SetTime::Now => FileTime::now(),
            SetTime::At(t) => FileTime::from_system_time(t),
        };
        let atime = atime
            .map(to_filetime)
            .unwrap_or_else(|| FileTime::from_last_access_time(&current));
        let mtime = mtime
            .map(to_filetime)
            .unwrap_or_else(|| FileTime::from_last_modification_time(&current));

        filetime::set_symlink_file_times(&backing, atime, mtime)?;
        Ok(())
    }

    /// Check that the backing file can be opened with `flags`; nothing is kept open
    pub fn open(&self, path: &Path, flags: i32) -> Result<()> {
        debug!("open({:?}, {:#x})", path, flags);
        let backing = self.resolve(path)?;
        let accmode = flags & libc::O_ACCMODE;
        let passthrough = flags & !(libc::O_ACCMODE | libc::O_CREAT | libc::O_EXCL | libc::O_TRUNC);

        OpenOptions::new()
            .read(accmode == libc::O_RDONLY || accmode == libc::O_RDWR)
            .write(accmode == libc::O_WRONLY || accmode == libc::O_RDWR)
            .custom_flags(passthrough)
            .open(&backing)?;
        Ok(())
    }

    /// Read up to `size` plaintext bytes at `offset`
    pub fn read(&self, path: &Path, offset: u64, size: usize) -> Result<Vec<u8>> {
        debug!("read({:?}, offset={}, size={})", path, offset, size);
        let backing = self.resolve(path)?;
        let key = self.session.key();
        self.locks
            .with_read(&backing, || pipeline::read(&backing, key, offset, size))
    }

    /// Write `data` at `offset`, returning the byte count
    pub fn write(&self, path: &Path, offset: u64, data: &[u8]) -> Result<usize> {
        debug!("write({:?}, offset={}, size={})", path, offset, data.len());
        let backing = self.resolve(path)?;
        let key = self.session.key();
        self.locks
            .with_write(&backing, || pipeline::write(&backing, key, offset, data))
    }

    pub fn statfs(&self, path: &Path) -> Result<Statvfs> {
        debug!("statfs({:?})", path);
        let backing = self.resolve(path)?;
        Ok(nix::sys::statvfs::statvfs(&backing)?)
    }

    /// Create (or truncate) a regular file and flag it encrypted
    ///
    /// A new file is created owner-writable so the flag can be set, then
    /// given the requested mode. If either step fails the file is removed,
    /// so no unflagged file is left behind.
    pub fn create(&self, path: &Path, mode: u32, flags: i32) -> Result<()> {
        debug!("create({:?}, {:#o}, {:#x})", path, mode, flags);
        let backing = self.resolve(path)?;
        let exclusive = flags & libc::O_EXCL != 0;
        let mode = mode & 0o7777;

        self.locks.with_write(&backing, || {
            let created = OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(mode | 0o600)
                .open(&backing);

            match created {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && !exclusive => {
                    OpenOptions::new().write(true).truncate(true).open(&backing)?;
                    return flag::set_flag(&backing, EncryptionFlag::Encrypted);
                }
                Err(e) => return Err(e.into()),
            }

            let finish = flag::set_flag(&backing, EncryptionFlag::Encrypted).and_then(|()| {
                if mode | 0o600 != mode {
                    fs::set_permissions(&backing, Permissions::from_mode(mode))?;
                }
                Ok(())
            });

            if let Err(e) = finish {
                warn!("create({:?}) failed after creating the file, removing it: {}", path, e);
                if let Err(remove) = fs::remove_file(&backing) {
                    warn!("Could not remove {:?}: {}", backing, remove);
                }
                return Err(e);
            }
            Ok(())
        })
    }

    pub fn release(&self, path: &Path) -> Result<()> {
        debug!("release({:?})", path);
        Ok(())
    }

    /// Flush the backing file to stable storage
    pub fn fsync(&self, path: &Path, datasync: bool) -> Result<()> {
        debug!("fsync({:?}, datasync={})", path, datasync);
        let backing = self.resolve(path)?;
        let file = fs::File::open(&backing)?;
        if datasync {
            file.sync_data()?;
        } else {
            file.sync_all()?;
        }
        Ok(())
    }

    /// Set an extended attribute
    ///
    /// Changing the encryption flag of a regular file re-encodes its content
    /// so the bytes at rest always match the flag.
    pub fn setxattr(&self, path: &Path, name: &OsStr, value: &[u8], flags: i32) -> Result<()> {
        debug!("setxattr({:?}, {:?})", path, name);
        let backing = self.resolve(path)?;
        let name = name.as_bytes();

        if !flag::is_flag_name(name) {
            return xattr::set(&backing, name, value, flags);
        }

        let new_flag = EncryptionFlag::parse(value).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "{} accepts only \"true\" or \"false\"",
                flag::FLAG_NAME
            ))
        })?;

        self.locks.with_write(&backing, || {
            self.reencode(&backing, new_flag, |b| xattr::set(b, name, new_flag.as_value(), flags))
        })
    }

    pub fn getxattr(&self, path: &Path, name: &OsStr) -> Result<Vec<u8>> {
        debug!("getxattr({:?}, {:?})", path, name);
        let backing = self.resolve(path)?;
        xattr::get(&backing, name.as_bytes())
    }

    /// NUL-separated attribute names
    pub fn listxattr(&self, path: &Path) -> Result<Vec<u8>> {
        debug!("listxattr({:?})", path);
        let backing = self.resolve(path)?;
        xattr::list(&backing)
    }

    /// Remove an attribute; removing the flag stores the file as plaintext
    pub fn removexattr(&self, path: &Path, name: &OsStr) -> Result<()> {
        debug!("removexattr({:?}, {:?})", path, name);
        let backing = self.resolve(path)?;
        let name = name.as_bytes();

        if !flag::is_flag_name(name) {
            return xattr::remove(&backing, name);
        }

        self.locks.with_write(&backing, || {
            self.reencode(&backing, EncryptionFlag::NotEncrypted, |b| xattr::remove(b, name))
        })
    }

    /// Switch a file to `new_flag`, converting its content, with `apply`
    /// performing the attribute change. Caller holds the write lock.
    fn reencode(
        &self,
        backing: &Path,
        new_flag: EncryptionFlag,
        apply: impl FnOnce(&Path) -> Result<()>,
    ) -> Result<()> {
        let is_file = fs::symlink_metadata(backing)?.file_type().is_file();
        let old_flag = if is_file {
            flag::get_flag(backing)?
        } else {
            new_flag
        };

        if old_flag == new_flag {
            return apply(backing);
        }

        let key = self.session.key();
        let plaintext = pipeline::load_plaintext(backing, old_flag, key)?;
        apply(backing)?;

        if let Err(e) = pipeline::store_plaintext(backing, new_flag, key, &plaintext) {
            warn!("Re-encoding {:?} failed, restoring flag: {}", backing, e);
            if let Err(restore) = flag::set_flag(backing, old_flag) {
                warn!("Could not restore flag on {:?}: {}", backing, restore);
            }
            return Err(e);
        }
        Ok(())
    }
}
