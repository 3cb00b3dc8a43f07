//! Whole-file crypto transform pipeline
//!
//! Every read and write loads the complete backing file, transforms it, and
//! (for writes) stores the complete result again. Cost is O(file size) per
//! call regardless of the requested range. Callers hold the path lock.

use super::flag::{self, EncryptionFlag};
use crate::crypto::{transform, ContentKey};
use crate::error::{Error, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use tracing::debug;

/// Load a backing file and return its plaintext
pub fn load_plaintext(backing_path: &Path, flag: EncryptionFlag, key: &ContentKey) -> Result<Vec<u8>> {
    let stored = fs::read(backing_path)?;
    transform(&stored, flag.load_action(), key)
}

/// Transform `plaintext` per `flag` and overwrite the backing file with it
pub fn store_plaintext(
    backing_path: &Path,
    flag: EncryptionFlag,
    key: &ContentKey,
    plaintext: &[u8],
) -> Result<()> {
    let stored = transform(plaintext, flag.store_action(), key)?;

    let mut file = OpenOptions::new().write(true).open(backing_path)?;
    // A full disk or file size limit must fail before the old bytes change
    reserve(&file, stored.len() as u64)?;
    file.write_all(&stored)?;
    file.set_len(stored.len() as u64)?;
    Ok(())
}

/// Allocate backing blocks for the first `len` bytes of `file`
#[cfg(target_os = "linux")]
fn reserve(file: &File, len: u64) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    if len == 0 {
        return Ok(());
    }
    let len = libc::off_t::try_from(len).map_err(|_| io::Error::from_raw_os_error(libc::EFBIG))?;

    // posix_fallocate returns the error number instead of setting errno
    let rc = unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, len) };
    match rc {
        0 => Ok(()),
        libc::EOPNOTSUPP => {
            debug!("posix_fallocate unsupported on backing store, writing in place");
            Ok(())
        }
        errno => Err(Error::Io(io::Error::from_raw_os_error(errno))),
    }
}

#[cfg(not(target_os = "linux"))]
fn reserve(_file: &File, _len: u64) -> Result<()> {
    Ok(())
}

/// Read `size` plaintext bytes at `offset`, clipped to the content length
pub fn read(backing_path: &Path, key: &ContentKey, offset: u64, size: usize) -> Result<Vec<u8>> {
    let flag = flag::get_flag(backing_path)?;
    let plaintext = load_plaintext(backing_path, flag, key)?;
    Ok(slice(&plaintext, offset, size).to_vec())
}

/// Write `data` at `offset`, returning the number of bytes written
///
/// The existing content is decrypted with the file's current flag, the new
/// bytes are spliced in (zero-filling any gap), and the result is stored
/// with the same flag.
pub fn write(backing_path: &Path, key: &ContentKey, offset: u64, data: &[u8]) -> Result<usize> {
    let flag = flag::get_flag(backing_path)?;
    let mut plaintext = load_plaintext(backing_path, flag, key)?;

    let start = checked_len(offset, 0)?;
    checked_len(offset, data.len())?;
    splice(&mut plaintext, start, data);

    debug!(
        "write {:?}: {} bytes at {}, new length {} ({:?})",
        backing_path,
        data.len(),
        offset,
        plaintext.len(),
        flag
    );

    store_plaintext(backing_path, flag, key, &plaintext)?;
    Ok(data.len())
}

/// Set the plaintext length of a file, zero-filling when growing
pub fn truncate(backing_path: &Path, key: &ContentKey, size: u64) -> Result<()> {
    let flag = flag::get_flag(backing_path)?;
    if !flag.is_encrypted() {
        let file = OpenOptions::new().write(true).open(backing_path)?;
        file.set_len(size)?;
        return Ok(());
    }

    let mut plaintext = load_plaintext(backing_path, flag, key)?;
    plaintext.resize(checked_len(size, 0)?, 0);
    store_plaintext(backing_path, flag, key, &plaintext)
}

/// `content[offset..offset + size]`, clipped; empty when `offset` is past the end
pub fn slice(content: &[u8], offset: u64, size: usize) -> &[u8] {
    let len = content.len() as u64;
    if offset >= len {
        return &[];
    }
    let start = offset as usize;
    let end = start.saturating_add(size).min(content.len());
    &content[start..end]
}

/// Copy `data` into `buf` at `offset`, growing `buf` with zeros as needed
pub fn splice(buf: &mut Vec<u8>, offset: usize, data: &[u8]) {
    let end = offset + data.len();
    if end > buf.len() {
        buf.resize(end, 0);
    }
    buf[offset..end].copy_from_slice(data);
}

/// `offset + extra` as an in-memory length, or `EFBIG`
fn checked_len(offset: u64, extra: usize) -> Result<usize> {
    usize::try_from(offset)
        .ok()
        .and_then(|o| o.checked_add(extra))
        .filter(|end| *end <= isize::MAX as usize)
        .ok_or_else(|| Error::Io(io::Error::from_raw_os_error(libc::EFBIG)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KEY_SIZE;
    use tempfile::tempdir;

    fn key() -> ContentKey {
        ContentKey::from_bytes([3u8; KEY_SIZE])
    }

    fn new_file(dir: &Path, name: &str, flag: EncryptionFlag) -> std::path::PathBuf {
        let path = dir.join(name);
        fs::write(&path, b"").unwrap();
        flag::set_flag(&path, flag).unwrap();
        path
    }

    #[test]
    fn test_slice_clipping() {
        let content = b"0123456789";
        assert_eq!(slice(content, 2, 3), b"234");
        assert_eq!(slice(content, 8, 10), b"89");
        assert_eq!(slice(content, 10, 5), b"");
        assert_eq!(slice(content, 100, 5), b"");
        assert_eq!(slice(content, 0, usize::MAX), content);
    }

    #[test]
    fn test_splice_overwrite_and_extend() {
        let mut buf = b"hello world".to_vec();
        splice(&mut buf, 6, b"there");
        assert_eq!(buf, b"hello there");

        splice(&mut buf, 9, b"rapy");
        assert_eq!(buf, b"hello therapy");

        let mut empty = Vec::new();
        splice(&mut empty, 3, b"x");
        assert_eq!(empty, vec![0, 0, 0, b'x']);
    }

    #[test]
    fn test_encrypted_write_then_read() {
        let dir = tempdir().unwrap();
        let path = new_file(dir.path(), "enc", EncryptionFlag::Encrypted);

        assert_eq!(write(&path, &key(), 0, b"TOPSECRET").unwrap(), 9);
        assert_ne!(fs::read(&path).unwrap(), b"TOPSECRET");
        assert_eq!(read(&path, &key(), 0, 100).unwrap(), b"TOPSECRET");
        assert_eq!(read(&path, &key(), 3, 3).unwrap(), b"SEC");
    }

    #[test]
    fn test_plain_write_is_literal() {
        let dir = tempdir().unwrap();
        let path = new_file(dir.path(), "plain", EncryptionFlag::NotEncrypted);

        write(&path, &key(), 0, b"hello").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"hello");
    }

    #[test]
    fn test_sparse_extension() {
        let dir = tempdir().unwrap();
        let path = new_file(dir.path(), "sparse", EncryptionFlag::Encrypted);

        write(&path, &key(), 100, b"0123456789").unwrap();
        let content = read(&path, &key(), 0, 110).unwrap();
        assert_eq!(content.len(), 110);
        assert!(content[..100].iter().all(|b| *b == 0));
        assert_eq!(&content[100..], b"0123456789");
    }

    #[test]
    fn test_overwrite_in_middle() {
        let dir = tempdir().unwrap();
        let path = new_file(dir.path(), "over", EncryptionFlag::Encrypted);

        write(&path, &key(), 0, b"abcdefgh").unwrap();
        write(&path, &key(), 2, b"XY").unwrap();
        assert_eq!(read(&path, &key(), 0, 64).unwrap(), b"abXYefgh");
    }

    #[test]
    fn test_truncate_encrypted_keeps_prefix() {
        let dir = tempdir().unwrap();
        let path = new_file(dir.path(), "trunc", EncryptionFlag::Encrypted);

        write(&path, &key(), 0, b"abcdefgh").unwrap();
        truncate(&path, &key(), 3).unwrap();
        assert_eq!(read(&path, &key(), 0, 64).unwrap(), b"abc");

        truncate(&path, &key(), 5).unwrap();
        assert_eq!(read(&path, &key(), 0, 64).unwrap(), b"abc\0\0");
    }

    #[test]
    fn test_truncate_plain_forwards() {
        let dir = tempdir().unwrap();
        let path = new_file(dir.path(), "plain", EncryptionFlag::NotEncrypted);

        write(&path, &key(), 0, b"abcdefgh").unwrap();
        truncate(&path, &key(), 4).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"abcd");
    }

    /// Runs in a child test process since the file size limit is per process
    #[test]
    fn test_failed_grow_keeps_old_content() {
        const CHILD_ENV: &str = "MIRRORCRYPTFS_FSIZE_CHILD";

        if std::env::var_os(CHILD_ENV).is_none() {
            let status = std::process::Command::new(std::env::current_exe().unwrap())
                .args(["--exact", "fs::pipeline::tests::test_failed_grow_keeps_old_content"])
                .arg("--test-threads=1")
                .env(CHILD_ENV, "1")
                .status()
                .unwrap();
            assert!(status.success());
            return;
        }

        let dir = tempdir().unwrap();
        let path = new_file(dir.path(), "grow", EncryptionFlag::Encrypted);
        let original = vec![7u8; 10_000];
        write(&path, &key(), 0, &original).unwrap();

        unsafe {
            libc::signal(libc::SIGXFSZ, libc::SIG_IGN);
            let mut limit: libc::rlimit = std::mem::zeroed();
            assert_eq!(libc::getrlimit(libc::RLIMIT_FSIZE, &mut limit), 0);
            limit.rlim_cur = 15_000;
            assert_eq!(libc::setrlimit(libc::RLIMIT_FSIZE, &limit), 0);
        }

        let err = write(&path, &key(), 10_000, &[1u8; 10_000]).unwrap_err();
        assert_eq!(err.to_errno(), libc::EFBIG);
        assert_eq!(read(&path, &key(), 0, 20_000).unwrap(), original);
    }

    #[test]
    fn test_read_with_wrong_key_is_eio() {
        let dir = tempdir().unwrap();
        let path = new_file(dir.path(), "enc", EncryptionFlag::Encrypted);
        write(&path, &key(), 0, b"data").unwrap();

        let other = ContentKey::from_bytes([4u8; KEY_SIZE]);
        let err = read(&path, &other, 0, 4).unwrap_err();
        assert_eq!(err.to_errno(), libc::EIO);
    }

    #[test]
    fn test_read_missing_file_is_enoent() {
        let dir = tempdir().unwrap();
        let err = read(&dir.path().join("absent"), &key(), 0, 1).unwrap_err();
        assert_eq!(err.to_errno(), libc::ENOENT);
    }
}
