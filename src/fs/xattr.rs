//! Extended attribute syscalls on backing paths
//!
//! Thin wrappers over the `l*xattr` family (symlinks are not followed),
//! returning OS errors verbatim.

use crate::error::{Error, Result};
use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

fn path_cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::InvalidArgument(format!("NUL byte in path {:?}", path)))
}

fn name_cstring(name: &[u8]) -> Result<CString> {
    CString::new(name).map_err(|_| Error::InvalidArgument("NUL byte in attribute name".to_string()))
}

/// True if the error means "attribute not present"
pub fn is_missing(err: &Error) -> bool {
    match err {
        Error::Io(e) => e.raw_os_error() == Some(missing_errno()),
        _ => false,
    }
}

#[cfg(target_os = "linux")]
fn missing_errno() -> i32 {
    libc::ENODATA
}

#[cfg(target_os = "macos")]
fn missing_errno() -> i32 {
    libc::ENOATTR
}

#[cfg(target_os = "linux")]
mod sys {
    use std::ffi::CStr;

    pub unsafe fn get(path: &CStr, name: &CStr, buf: *mut u8, len: usize) -> isize {
        libc::lgetxattr(path.as_ptr(), name.as_ptr(), buf as *mut libc::c_void, len)
    }

    pub unsafe fn set(path: &CStr, name: &CStr, value: &[u8], flags: i32) -> i32 {
        libc::lsetxattr(
            path.as_ptr(),
            name.as_ptr(),
            value.as_ptr() as *const libc::c_void,
            value.len(),
            flags,
        )
    }

    pub unsafe fn list(path: &CStr, buf: *mut u8, len: usize) -> isize {
        libc::llistxattr(path.as_ptr(), buf as *mut libc::c_char, len)
    }

    pub unsafe fn remove(path: &CStr, name: &CStr) -> i32 {
        libc::lremovexattr(path.as_ptr(), name.as_ptr())
    }
}

#[cfg(target_os = "macos")]
mod sys {
    use std::ffi::CStr;

    pub unsafe fn get(path: &CStr, name: &CStr, buf: *mut u8, len: usize) -> isize {
        libc::getxattr(
            path.as_ptr(),
            name.as_ptr(),
            buf as *mut libc::c_void,
            len,
            0,
            libc::XATTR_NOFOLLOW,
        )
    }

    pub unsafe fn set(path: &CStr, name: &CStr, value: &[u8], flags: i32) -> i32 {
        libc::setxattr(
            path.as_ptr(),
            name.as_ptr(),
            value.as_ptr() as *const libc::c_void,
            value.len(),
            0,
            flags | libc::XATTR_NOFOLLOW,
        )
    }

    pub unsafe fn list(path: &CStr, buf: *mut u8, len: usize) -> isize {
        libc::listxattr(path.as_ptr(), buf as *mut libc::c_char, len, libc::XATTR_NOFOLLOW)
    }

    pub unsafe fn remove(path: &CStr, name: &CStr) -> i32 {
        libc::removexattr(path.as_ptr(), name.as_ptr(), libc::XATTR_NOFOLLOW)
    }
}

/// Size of an attribute value in bytes
pub fn size(path: &Path, name: &[u8]) -> Result<usize> {
    let cpath = path_cstring(path)?;
    let cname = name_cstring(name)?;
    let res = unsafe { sys::get(&cpath, &cname, std::ptr::null_mut(), 0) };
    if res < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(res as usize)
}

/// Read an attribute value
pub fn get(path: &Path, name: &[u8]) -> Result<Vec<u8>> {
    let cpath = path_cstring(path)?;
    let cname = name_cstring(name)?;

    // The value can change between the size query and the read
    loop {
        let needed = unsafe { sys::get(&cpath, &cname, std::ptr::null_mut(), 0) };
        if needed < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let mut buf = vec![0u8; needed as usize];
        let res = unsafe { sys::get(&cpath, &cname, buf.as_mut_ptr(), buf.len()) };
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ERANGE) {
                continue;
            }
            return Err(err.into());
        }
        buf.truncate(res as usize);
        return Ok(buf);
    }
}

/// Write an attribute value; `flags` is `XATTR_CREATE`/`XATTR_REPLACE` or 0
pub fn set(path: &Path, name: &[u8], value: &[u8], flags: i32) -> Result<()> {
    let cpath = path_cstring(path)?;
    let cname = name_cstring(name)?;
    let res = unsafe { sys::set(&cpath, &cname, value, flags) };
    if res < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}

/// NUL-separated list of attribute names
pub fn list(path: &Path) -> Result<Vec<u8>> {
    let cpath = path_cstring(path)?;

    loop {
        let needed = unsafe { sys::list(&cpath, std::ptr::null_mut(), 0) };
        if needed < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let mut buf = vec![0u8; needed as usize];
        let res = unsafe { sys::list(&cpath, buf.as_mut_ptr(), buf.len()) };
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ERANGE) {
                continue;
            }
            return Err(err.into());
        }
        buf.truncate(res as usize);
        return Ok(buf);
    }
}

/// Remove an attribute
pub fn remove(path: &Path, name: &[u8]) -> Result<()> {
    let cpath = path_cstring(path)?;
    let cname = name_cstring(name)?;
    let res = unsafe { sys::remove(&cpath, &cname) };
    if res < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_set_get_remove() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, b"x").unwrap();

        set(&file, b"user.test.attr", b"value", 0).unwrap();
        assert_eq!(get(&file, b"user.test.attr").unwrap(), b"value");
        assert_eq!(size(&file, b"user.test.attr").unwrap(), 5);

        let names = list(&file).unwrap();
        assert!(names
            .split(|b| *b == 0)
            .any(|name| name == b"user.test.attr"));

        remove(&file, b"user.test.attr").unwrap();
        let err = get(&file, b"user.test.attr").unwrap_err();
        assert!(is_missing(&err));
    }

    #[test]
    fn test_missing_file_is_enoent() {
        let dir = tempdir().unwrap();
        let err = get(&dir.path().join("absent"), b"user.x").unwrap_err();
        assert_eq!(err.to_errno(), libc::ENOENT);
    }

    #[test]
    fn test_nul_in_name_is_invalid() {
        let dir = tempdir().unwrap();
        let err = get(dir.path(), b"user.\0bad").unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
