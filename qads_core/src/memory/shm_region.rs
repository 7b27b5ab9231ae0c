//! POSIX shared memory region backing one arena.
//!
//! The writer creates the object with create-exclusive semantics — that
//! exclusivity is the single-writer mutual exclusion for a channel — and
//! unlinks it on close. Readers open the existing object and size the
//! mapping from `fstat`, so they never need the writer's configuration.

use std::ffi::CString;
use std::fs::File;
use std::os::unix::io::FromRawFd;

use memmap2::{MmapMut, MmapOptions};

use crate::error::{QadsError, QadsResult};

/// A mapped POSIX shared memory object (`shm_open` + `mmap`).
pub struct ShmRegion {
    mmap: MmapMut,
    /// Owns the descriptor; closed when the region is dropped.
    _file: File,
    shm_name: CString,
    owner: bool,
}

impl ShmRegion {
    /// Create the object `name` with create-exclusive semantics, size it,
    /// and map it read-write shared.
    ///
    /// Fails with a name-in-use resource error if the object already exists,
    /// including the stale remains of a crashed writer; reclaim is an
    /// explicit operator action (see [`crate::arena::purge_channel`]).
    pub fn create(name: &str, size: usize) -> QadsResult<Self> {
        let c_name = cstring(name)?;

        // SAFETY: c_name is a valid NUL-terminated string; flags and mode
        // are plain POSIX constants.
        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o644,
            )
        };
        if fd < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EEXIST) {
                return Err(QadsError::Resource(format!(
                    "shared memory object '{}' already exists (name in use); \
                     if its writer is dead, remove the stale objects first",
                    name
                )));
            }
            return Err(QadsError::Resource(format!(
                "failed to create shared memory object '{}': {}",
                name, err
            )));
        }

        // SAFETY: fd is the valid descriptor returned above; from here on
        // the File owns it and closes it on drop.
        let file = unsafe { File::from_raw_fd(fd) };

        if let Err(err) = file.set_len(size as u64) {
            // SAFETY: c_name is a valid NUL-terminated string.
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
            return Err(QadsError::Resource(format!(
                "failed to size shared memory object '{}' to {} bytes: {}",
                name, size, err
            )));
        }

        // SAFETY: file is open read-write with at least `size` bytes.
        let mmap = match unsafe { MmapOptions::new().len(size).map_mut(&file) } {
            Ok(m) => m,
            Err(err) => {
                // SAFETY: c_name is a valid NUL-terminated string.
                unsafe { libc::shm_unlink(c_name.as_ptr()) };
                return Err(QadsError::Resource(format!(
                    "failed to map shared memory object '{}': {}",
                    name, err
                )));
            }
        };

        log::debug!("shm: created {} ({} bytes)", name, size);
        Ok(Self {
            mmap,
            _file: file,
            shm_name: c_name,
            owner: true,
        })
    }

    /// Open the existing object `name` read-write and map it whole, taking
    /// the size from `fstat`.
    pub fn open(name: &str) -> QadsResult<Self> {
        let c_name = cstring(name)?;

        // SAFETY: c_name is a valid NUL-terminated string.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0o644) };
        if fd < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENOENT) {
                return Err(QadsError::Resource(format!(
                    "no such channel: shared memory object '{}' does not exist",
                    name
                )));
            }
            return Err(QadsError::Resource(format!(
                "failed to open shared memory object '{}': {}",
                name, err
            )));
        }

        // SAFETY: fd is the valid descriptor returned above.
        let file = unsafe { File::from_raw_fd(fd) };

        let size = file
            .metadata()
            .map_err(|err| {
                QadsError::Resource(format!(
                    "failed to stat shared memory object '{}': {}",
                    name, err
                ))
            })?
            .len() as usize;

        // SAFETY: file is open read-write and `size` matches the object.
        let mmap = unsafe { MmapOptions::new().len(size).map_mut(&file) }.map_err(|err| {
            QadsError::Resource(format!(
                "failed to map shared memory object '{}': {}",
                name, err
            ))
        })?;

        log::debug!("shm: opened {} ({} bytes)", name, size);
        Ok(Self {
            mmap,
            _file: file,
            shm_name: c_name,
            owner: false,
        })
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.mmap.as_ptr() as *mut u8
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    /// Whether this handle created the object and will unlink it on drop.
    #[inline]
    pub fn is_owner(&self) -> bool {
        self.owner
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        // Unmap and close happen via the MmapMut and File drops; the owner
        // also removes the name so a future create-exclusive succeeds.
        if self.owner {
            // SAFETY: shm_name is a valid NUL-terminated string.
            unsafe { libc::shm_unlink(self.shm_name.as_ptr()) };
        }
    }
}

// SAFETY: the region is plain OS shared memory with no thread affinity;
// concurrent access is coordinated by the arena's atomics and semaphores.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

fn cstring(name: &str) -> QadsResult<CString> {
    CString::new(name)
        .map_err(|_| QadsError::config(format!("object name '{}' contains a NUL byte", name)))
}
