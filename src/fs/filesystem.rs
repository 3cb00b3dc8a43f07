//! FUSE bridge: translates inode-based kernel requests into dispatcher calls

use fuser::{
    FileAttr, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use libc::{EINVAL, ENOENT, ERANGE};
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, error};

use super::attr::FileStat;
use super::dispatcher::{DirEntry, Dispatcher, SetTime};
use super::inode::InodeTable;
use crate::error::{Error, Result};

/// FUSE filesystem over a [`Dispatcher`]
pub struct MirrorFs {
    dispatcher: Dispatcher,
    inodes: InodeTable,
    ttl: Duration,
}

impl MirrorFs {
    pub fn new(dispatcher: Dispatcher, ttl: Duration) -> Self {
        Self {
            dispatcher,
            inodes: InodeTable::new(),
            ttl,
        }
    }

    /// Attributes for an entry reply; counts as one kernel lookup
    fn attr_of(&self, path: &Path) -> Result<FileAttr> {
        let stat = self.dispatcher.getattr(path)?;
        Ok(stat.to_fuser_attr(self.inodes.lookup(path)))
    }

    /// Reply with the entry for a freshly created or looked-up path
    fn reply_entry(&self, path: &Path, reply: ReplyEntry) {
        match self.attr_of(path) {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(e) => reply.error(errno(&e)),
        }
    }
}

fn errno(e: &Error) -> i32 {
    let code = e.to_errno();
    if code == libc::EIO {
        error!("I/O failure surfaced to kernel: {}", e);
    }
    code
}

fn set_time(value: Option<TimeOrNow>) -> Option<SetTime> {
    value.map(|t| match t {
        TimeOrNow::Now => SetTime::Now,
        TimeOrNow::SpecificTime(at) => SetTime::At(at),
    })
}

/// What a getxattr/listxattr reply carries for a caller buffer of `size`
#[derive(Debug, PartialEq, Eq)]
enum XattrReply {
    /// Caller asked for the length only
    Size(u32),
    Data,
    TooSmall,
}

fn xattr_reply(len: usize, size: u32) -> XattrReply {
    if size == 0 {
        XattrReply::Size(len as u32)
    } else if len > size as usize {
        XattrReply::TooSmall
    } else {
        XattrReply::Data
    }
}

fn reply_xattr(value: Vec<u8>, size: u32, reply: ReplyXattr) {
    match xattr_reply(value.len(), size) {
        XattrReply::Size(len) => reply.size(len),
        XattrReply::TooSmall => reply.error(ERANGE),
        XattrReply::Data => reply.data(&value),
    }
}

/// Attribute changes carried by one setattr call
#[derive(Debug, Default)]
struct AttrChanges {
    mode: Option<u32>,
    uid: Option<u32>,
    gid: Option<u32>,
    size: Option<u64>,
    atime: Option<SetTime>,
    mtime: Option<SetTime>,
}

/// Apply `changes` in chmod, chown, truncate, utimens order and return the new stat
fn apply_changes(d: &Dispatcher, path: &Path, changes: &AttrChanges) -> Result<FileStat> {
    if let Some(mode) = changes.mode {
        d.chmod(path, mode)?;
    }
    if changes.uid.is_some() || changes.gid.is_some() {
        d.chown(path, changes.uid, changes.gid)?;
    }
    if let Some(size) = changes.size {
        d.truncate(path, size)?;
    }
    if changes.atime.is_some() || changes.mtime.is_some() {
        d.utimens(path, changes.atime, changes.mtime)?;
    }
    d.getattr(path)
}

/// Directory entries from `offset` on, each with the inode and resume cookie
/// it is reported under
///
/// `.` is the directory itself and `..` its parent (the root is its own
/// parent). Names the kernel already knows keep their table inode; others
/// report the backing inode, so listing allocates nothing in the table.
fn listing<'a>(
    dir: &Path,
    dir_ino: u64,
    entries: &'a [DirEntry],
    offset: i64,
    inodes: &InodeTable,
) -> Vec<(u64, i64, &'a DirEntry)> {
    entries
        .iter()
        .enumerate()
        .skip(offset.max(0) as usize)
        .map(|(i, entry)| {
            let ino = match entry.name.as_bytes() {
                b"." => dir_ino,
                b".." => match dir.parent() {
                    Some(parent) => inodes.ino(parent).unwrap_or(entry.ino),
                    None => dir_ino,
                },
                _ => inodes.ino(&dir.join(&entry.name)).unwrap_or(entry.ino),
            };
            (ino, (i + 1) as i64, entry)
        })
        .collect()
}

macro_rules! path_or_reply {
    ($self:ident, $ino:expr, $reply:ident) => {
        match $self.inodes.path($ino) {
            Some(path) => path,
            None => {
                $reply.error(ENOENT);
                return;
            }
        }
    };
    ($self:ident, $parent:expr, $name:expr, $reply:ident) => {
        match $self.inodes.child_path($parent, $name) {
            Some(path) => path,
            None => {
                $reply.error(ENOENT);
                return;
            }
        }
    };
}

impl Filesystem for MirrorFs {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let path = path_or_reply!(self, parent, name, reply);
        debug!("lookup({:?})", path);

        match self.dispatcher.getattr(&path) {
            Ok(stat) => {
                let attr = stat.to_fuser_attr(self.inodes.lookup(&path));
                reply.entry(&self.ttl, &attr, 0);
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn forget(&mut self, _req: &Request, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        let path = path_or_reply!(self, ino, reply);
        match self.dispatcher.getattr(&path) {
            Ok(stat) => reply.attr(&self.ttl, &stat.to_fuser_attr(ino)),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let path = path_or_reply!(self, ino, reply);
        let changes = AttrChanges {
            mode,
            uid,
            gid,
            size,
            atime: set_time(atime),
            mtime: set_time(mtime),
        };

        match apply_changes(&self.dispatcher, &path, &changes) {
            Ok(stat) => reply.attr(&self.ttl, &stat.to_fuser_attr(ino)),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        let path = path_or_reply!(self, ino, reply);
        match self.dispatcher.readlink(&path) {
            Ok(target) => reply.data(target.as_os_str().as_bytes()),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let path = path_or_reply!(self, parent, name, reply);
        match self.dispatcher.mknod(&path, mode, rdev as u64) {
            Ok(()) => self.reply_entry(&path, reply),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let path = path_or_reply!(self, parent, name, reply);
        match self.dispatcher.mkdir(&path, mode) {
            Ok(()) => self.reply_entry(&path, reply),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = path_or_reply!(self, parent, name, reply);
        match self.dispatcher.unlink(&path) {
            Ok(()) => {
                self.inodes.remove_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = path_or_reply!(self, parent, name, reply);
        match self.dispatcher.rmdir(&path) {
            Ok(()) => {
                self.inodes.remove_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let path = path_or_reply!(self, parent, link_name, reply);
        match self.dispatcher.symlink(target, &path) {
            Ok(()) => self.reply_entry(&path, reply),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        // RENAME_NOREPLACE / RENAME_EXCHANGE are not forwarded
        if flags != 0 {
            reply.error(EINVAL);
            return;
        }
        let from = path_or_reply!(self, parent, name, reply);
        let to = path_or_reply!(self, newparent, newname, reply);

        match self.dispatcher.rename(&from, &to) {
            Ok(()) => {
                self.inodes.rename(&from, &to);
                reply.ok();
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn link(
        &mut self,
        _req: &Request,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let from = path_or_reply!(self, ino, reply);
        let to = path_or_reply!(self, newparent, newname, reply);
        match self.dispatcher.link(&from, &to) {
            Ok(()) => self.reply_entry(&to, reply),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        let path = path_or_reply!(self, ino, reply);
        // Stateless: every read/write reloads the backing file
        match self.dispatcher.open(&path, flags) {
            Ok(()) => reply.opened(0, 0),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let path = path_or_reply!(self, ino, reply);
        if offset < 0 {
            reply.error(EINVAL);
            return;
        }
        match self.dispatcher.read(&path, offset as u64, size as usize) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let path = path_or_reply!(self, ino, reply);
        if offset < 0 {
            reply.error(EINVAL);
            return;
        }
        match self.dispatcher.write(&path, offset as u64, data) {
            Ok(written) => reply.written(written as u32),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let path = path_or_reply!(self, ino, reply);
        match self.dispatcher.release(&path) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn fsync(&mut self, _req: &Request, ino: u64, _fh: u64, datasync: bool, reply: ReplyEmpty) {
        let path = path_or_reply!(self, ino, reply);
        match self.dispatcher.fsync(&path, datasync) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let path = path_or_reply!(self, ino, reply);

        let entries = match self.dispatcher.readdir(&path) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(errno(&e));
                return;
            }
        };

        for (child_ino, cookie, entry) in listing(&path, ino, &entries, offset, &self.inodes) {
            // add() returns true once the reply buffer is full
            if reply.add(child_ino, cookie, entry.kind.to_fuser_type(), &entry.name) {
                break;
            }
        }

        reply.ok();
    }

    fn statfs(&mut self, _req: &Request, ino: u64, reply: ReplyStatfs) {
        let path = self.inodes.path(ino).unwrap_or_else(|| PathBuf::from("/"));
        match self.dispatcher.statfs(&path) {
            Ok(st) => reply.statfs(
                st.blocks() as u64,
                st.blocks_free() as u64,
                st.blocks_available() as u64,
                st.files() as u64,
                st.files_free() as u64,
                st.block_size() as u32,
                st.name_max() as u32,
                st.fragment_size() as u32,
            ),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        position: u32,
        reply: ReplyEmpty,
    ) {
        if position != 0 {
            reply.error(EINVAL);
            return;
        }
        let path = path_or_reply!(self, ino, reply);
        match self.dispatcher.setxattr(&path, name, value, flags) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn getxattr(&mut self, _req: &Request, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        let path = path_or_reply!(self, ino, reply);
        match self.dispatcher.getxattr(&path, name) {
            Ok(value) => reply_xattr(value, size, reply),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn listxattr(&mut self, _req: &Request, ino: u64, size: u32, reply: ReplyXattr) {
        let path = path_or_reply!(self, ino, reply);
        match self.dispatcher.listxattr(&path) {
            Ok(names) => reply_xattr(names, size, reply),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn removexattr(&mut self, _req: &Request, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = path_or_reply!(self, ino, reply);
        match self.dispatcher.removexattr(&path, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn access(&mut self, _req: &Request, ino: u64, mask: i32, reply: ReplyEmpty) {
        let path = path_or_reply!(self, ino, reply);
        match self.dispatcher.access(&path, mask) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let path = path_or_reply!(self, parent, name, reply);

        let result = self
            .dispatcher
            .create(&path, mode, flags)
            .and_then(|()| self.attr_of(&path));

        match result {
            Ok(attr) => reply.created(&self.ttl, &attr, 0, 0, 0),
            Err(e) => reply.error(errno(&e)),
        }
    }
}
