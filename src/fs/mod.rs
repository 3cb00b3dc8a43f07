//! FUSE filesystem implementation
//!
//! Mirrors a backing directory at the mount point, encrypting the content
//! of regular files whose encryption flag is set.

mod attr;
mod dispatcher;
mod filesystem;
mod flag;
mod inode;
mod lock;
pub mod path;
mod pipeline;
pub mod xattr;

pub use attr::{FileKind, FileStat};
pub use dispatcher::{DirEntry, Dispatcher, SetTime};
pub use filesystem::MirrorFs;
pub use flag::{EncryptionFlag, FLAG_NAME};
pub use inode::{InodeTable, ROOT_INO};
pub use lock::PathLocks;
pub use path::PathResolver;
