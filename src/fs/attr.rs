//! File types and attribute conversion for the FUSE bridge

use std::fs::Metadata;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::time::{Duration, SystemTime};

/// File type of a backing entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    RegularFile,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

impl From<std::fs::FileType> for FileKind {
    fn from(ft: std::fs::FileType) -> Self {
        if ft.is_dir() {
            FileKind::Directory
        } else if ft.is_symlink() {
            FileKind::Symlink
        } else if ft.is_block_device() {
            FileKind::BlockDevice
        } else if ft.is_char_device() {
            FileKind::CharDevice
        } else if ft.is_fifo() {
            FileKind::Fifo
        } else if ft.is_socket() {
            FileKind::Socket
        } else {
            FileKind::RegularFile
        }
    }
}

impl From<nix::dir::Type> for FileKind {
    fn from(dt: nix::dir::Type) -> Self {
        match dt {
            nix::dir::Type::Directory => FileKind::Directory,
            nix::dir::Type::Symlink => FileKind::Symlink,
            nix::dir::Type::File => FileKind::RegularFile,
            nix::dir::Type::BlockDevice => FileKind::BlockDevice,
            nix::dir::Type::CharacterDevice => FileKind::CharDevice,
            nix::dir::Type::Fifo => FileKind::Fifo,
            nix::dir::Type::Socket => FileKind::Socket,
        }
    }
}

impl FileKind {
    pub fn to_fuser_type(&self) -> fuser::FileType {
        match self {
            FileKind::RegularFile => fuser::FileType::RegularFile,
            FileKind::Directory => fuser::FileType::Directory,
            FileKind::Symlink => fuser::FileType::Symlink,
            FileKind::BlockDevice => fuser::FileType::BlockDevice,
            FileKind::CharDevice => fuser::FileType::CharDevice,
            FileKind::Fifo => fuser::FileType::NamedPipe,
            FileKind::Socket => fuser::FileType::Socket,
        }
    }

    /// `S_IFMT` bits for this type
    pub fn type_bits(&self) -> u32 {
        let bits = match self {
            FileKind::RegularFile => libc::S_IFREG,
            FileKind::Directory => libc::S_IFDIR,
            FileKind::Symlink => libc::S_IFLNK,
            FileKind::BlockDevice => libc::S_IFBLK,
            FileKind::CharDevice => libc::S_IFCHR,
            FileKind::Fifo => libc::S_IFIFO,
            FileKind::Socket => libc::S_IFSOCK,
        };
        bits as u32
    }
}

/// Backing `lstat` result with the size clients should see
#[derive(Debug, Clone)]
pub struct FileStat {
    pub metadata: Metadata,
    /// Plaintext size for encrypted files, raw size otherwise
    pub size: u64,
}

impl FileStat {
    pub fn kind(&self) -> FileKind {
        FileKind::from(self.metadata.file_type())
    }

    /// Convert to fuser FileAttr under the bridge's inode number
    pub fn to_fuser_attr(&self, ino: u64) -> fuser::FileAttr {
        let meta = &self.metadata;
        fuser::FileAttr {
            ino,
            size: self.size,
            blocks: meta.blocks(),
            atime: timestamp(meta.atime(), meta.atime_nsec()),
            mtime: timestamp(meta.mtime(), meta.mtime_nsec()),
            ctime: timestamp(meta.ctime(), meta.ctime_nsec()),
            crtime: meta.created().unwrap_or(SystemTime::UNIX_EPOCH),
            kind: self.kind().to_fuser_type(),
            perm: (meta.mode() & 0o7777) as u16,
            nlink: meta.nlink() as u32,
            uid: meta.uid(),
            gid: meta.gid(),
            rdev: meta.rdev() as u32,
            blksize: meta.blksize() as u32,
            flags: 0,
        }
    }
}

fn timestamp(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        SystemTime::UNIX_EPOCH + Duration::new(secs as u64, nsecs as u32)
    } else {
        SystemTime::UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}
