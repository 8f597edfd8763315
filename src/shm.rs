// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// POSIX shared-memory segments: open, truncate, map, unlink.
//
// `ShmSegment` owns one mapping of one named segment. Dropping it only
// unmaps; removing the name is always an explicit call, because the buffer
// lifecycle decides who unlinks (the producer) and who merely releases its
// mapping (the consumer).

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr::{self, NonNull};

use crate::error::NamespaceError;
use crate::shm_name;

/// One mapping of a named POSIX shared-memory segment.
pub struct ShmSegment {
    mem: NonNull<u8>,
    len: usize,
    key: String,
}

// Safety: the segment is shared between processes by design; all mutable
// state inside it is accessed through atomics or under the roles defined
// by the buffer protocol.
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

fn c_key(key: &str) -> Result<CString, NamespaceError> {
    CString::new(key.as_bytes())
        .map_err(|e| NamespaceError::new("key conversion", key, io::Error::new(io::ErrorKind::InvalidInput, e)))
}

impl ShmSegment {
    /// Create (or truncate) the named segment with `len` bytes and map it.
    ///
    /// This is the producer-side entry: an existing segment under the same
    /// key is reset. On partial failure the name is unlinked again.
    pub fn create(key: &str, len: usize, mode: libc::mode_t) -> Result<Self, NamespaceError> {
        shm_name::validate_key(key)?;
        let cname = c_key(key)?;

        let raw = unsafe {
            libc::shm_open(
                cname.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_TRUNC,
                mode as libc::c_uint,
            )
        };
        if raw == -1 {
            return Err(NamespaceError::new("shm_open", key, io::Error::last_os_error()));
        }
        // Close on every exit path below.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        if unsafe { libc::ftruncate(fd.as_raw_fd(), len as libc::off_t) } != 0 {
            let err = io::Error::last_os_error();
            drop(fd);
            unsafe { libc::shm_unlink(cname.as_ptr()) };
            return Err(NamespaceError::new("ftruncate", key, err));
        }

        match Self::map(&fd, len, key) {
            Ok(seg) => Ok(seg),
            Err(e) => {
                drop(fd);
                unsafe { libc::shm_unlink(cname.as_ptr()) };
                Err(e)
            }
        }
    }

    /// Open the named segment read-write without mapping it.
    ///
    /// Attach paths use this to `pread` a size field out of the header
    /// before deciding how much to map.
    pub fn open_fd(key: &str) -> Result<OwnedFd, NamespaceError> {
        shm_name::validate_key(key)?;
        let cname = c_key(key)?;

        let raw = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR, 0 as libc::c_uint) };
        if raw == -1 {
            return Err(NamespaceError::new("shm_open", key, io::Error::last_os_error()));
        }
        Ok(unsafe { OwnedFd::from_raw_fd(raw) })
    }

    /// Map `len` bytes of an already-open segment. The fd is closed
    /// afterwards; the mapping keeps the memory alive.
    pub fn from_fd(fd: OwnedFd, len: usize, key: &str) -> Result<Self, NamespaceError> {
        Self::map(&fd, len, key)
    }

    fn map(fd: &OwnedFd, len: usize, key: &str) -> Result<Self, NamespaceError> {
        let mem = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if mem == libc::MAP_FAILED {
            return Err(NamespaceError::new("mmap", key, io::Error::last_os_error()));
        }

        Ok(Self {
            mem: NonNull::new(mem as *mut u8).expect("mmap returned a null mapping"),
            len,
            key: key.to_string(),
        })
    }

    /// Read a `u64` header field at `offset` through an unmapped fd.
    pub fn pread_u64(fd: &OwnedFd, offset: usize, key: &str) -> Result<u64, NamespaceError> {
        let mut buf = [0u8; 8];
        let n = unsafe {
            libc::pread(
                fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                offset as libc::off_t,
            )
        };
        if n != buf.len() as isize {
            let err = if n < 0 {
                io::Error::last_os_error()
            } else {
                io::Error::new(io::ErrorKind::UnexpectedEof, "short read on segment header")
            };
            return Err(NamespaceError::new("pread", key, err));
        }
        Ok(u64::from_ne_bytes(buf))
    }

    /// Remove the name of a segment. Existing mappings stay valid until
    /// they are unmapped.
    pub fn unlink(key: &str) -> Result<(), NamespaceError> {
        let cname = c_key(key)?;
        if unsafe { libc::shm_unlink(cname.as_ptr()) } != 0 {
            return Err(NamespaceError::new("shm_unlink", key, io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Base of the mapping.
    pub fn as_ptr(&self) -> *mut u8 {
        self.mem.as_ptr()
    }

    /// Mapped length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping is empty (it never is for a live segment).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The key the segment was opened under.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.mem.as_ptr() as *mut libc::c_void, self.len) };
    }
}

/// System page size, queried fresh on every call.
pub(crate) fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique(prefix: &str) -> String {
        format!("/{prefix}.{}", std::process::id())
    }

    #[test]
    fn create_map_write_read() {
        let key = unique("shm_basic");
        let _ = ShmSegment::unlink(&key);

        let seg = ShmSegment::create(&key, 4096, 0o700).expect("create");
        assert_eq!(seg.len(), 4096);

        unsafe { seg.as_ptr().write(0xAB) };

        let fd = ShmSegment::open_fd(&key).expect("open");
        let other = ShmSegment::from_fd(fd, 4096, &key).expect("map");
        assert_eq!(unsafe { other.as_ptr().read() }, 0xAB);

        ShmSegment::unlink(&key).expect("unlink");
    }

    #[test]
    fn open_missing_fails() {
        let key = unique("shm_missing");
        let _ = ShmSegment::unlink(&key);
        assert!(ShmSegment::open_fd(&key).is_err());
    }

    #[test]
    fn pread_reads_header_fields() {
        let key = unique("shm_pread");
        let _ = ShmSegment::unlink(&key);

        let seg = ShmSegment::create(&key, 4096, 0o700).expect("create");
        unsafe {
            (seg.as_ptr().add(8) as *mut u64).write(0xDEAD_BEEF);
        }

        let fd = ShmSegment::open_fd(&key).expect("open");
        assert_eq!(ShmSegment::pread_u64(&fd, 8, &key).expect("pread"), 0xDEAD_BEEF);

        ShmSegment::unlink(&key).expect("unlink");
    }

    #[test]
    fn unlink_removes_the_name() {
        let key = unique("shm_unlink");
        let _ = ShmSegment::unlink(&key);

        let seg = ShmSegment::create(&key, 1024, 0o700).expect("create");
        ShmSegment::unlink(&key).expect("unlink");
        // The mapping stays valid after the name is gone.
        unsafe { seg.as_ptr().write(1) };
        assert!(ShmSegment::open_fd(&key).is_err());
    }
}
