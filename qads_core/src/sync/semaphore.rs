//! Named POSIX counting semaphores.
//!
//! The arena uses one semaphore pair per channel: the free-slot semaphore
//! starts at the slot count and the ready-slot semaphore at zero. The writer
//! creates both (removing stale same-named leftovers first) and unlinks them
//! on close; readers open and close without unlinking.
//!
//! Waits retry transparently on `EINTR`. A relative millisecond timeout is
//! converted to a `CLOCK_REALTIME` absolute deadline for `sem_timedwait`;
//! zero degenerates to a non-blocking poll and a negative value waits
//! indefinitely.

use std::ffi::CString;
use std::ptr::NonNull;
use std::time::Duration;

use crate::error::{QadsError, QadsResult};

/// Handle to a named counting semaphore.
pub struct NamedSemaphore {
    sem: NonNull<libc::sem_t>,
    name: CString,
    owner: bool,
}

impl NamedSemaphore {
    /// Create the semaphore `name` with `initial` tokens, removing any stale
    /// semaphore of the same name first.
    pub fn create(name: &str, initial: u32) -> QadsResult<Self> {
        let c_name = cstring(name)?;

        // A crashed writer leaves its semaphores behind; the shm object's
        // create-exclusive check has already established ownership of the
        // channel, so stale names are safe to remove here.
        // SAFETY: c_name is a valid NUL-terminated string.
        unsafe { libc::sem_unlink(c_name.as_ptr()) };

        // SAFETY: c_name is valid; mode and initial value are passed as the
        // variadic mode_t / unsigned int pair sem_open expects with O_CREAT.
        let sem = unsafe {
            libc::sem_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                0o644 as libc::c_uint,
                initial as libc::c_uint,
            )
        };
        let sem = NonNull::new(sem).filter(|p| p.as_ptr() != libc::SEM_FAILED);
        let Some(sem) = sem else {
            return Err(QadsError::resource_errno(format!(
                "failed to create semaphore '{}'",
                name
            )));
        };

        log::debug!("sem: created {} (initial {})", name, initial);
        Ok(Self {
            sem,
            name: c_name,
            owner: true,
        })
    }

    /// Open the existing semaphore `name`.
    pub fn open(name: &str) -> QadsResult<Self> {
        let c_name = cstring(name)?;

        // SAFETY: c_name is a valid NUL-terminated string; no O_CREAT, so
        // no variadic arguments are read.
        let sem = unsafe { libc::sem_open(c_name.as_ptr(), 0) };
        let sem = NonNull::new(sem).filter(|p| p.as_ptr() != libc::SEM_FAILED);
        let Some(sem) = sem else {
            return Err(QadsError::resource_errno(format!(
                "failed to open semaphore '{}'",
                name
            )));
        };

        Ok(Self {
            sem,
            name: c_name,
            owner: false,
        })
    }

    /// Block until a token is available.
    pub fn wait(&self) -> QadsResult<()> {
        loop {
            // SAFETY: self.sem is a valid open semaphore handle.
            if unsafe { libc::sem_wait(self.sem.as_ptr()) } == 0 {
                return Ok(());
            }
            match errno() {
                libc::EINTR => continue,
                _ => {
                    return Err(QadsError::resource_errno(format!(
                        "sem_wait on '{}' failed",
                        self.name_str()
                    )))
                }
            }
        }
    }

    /// Take a token without blocking; [`QadsError::Timeout`] if none is
    /// available right now.
    pub fn try_wait(&self) -> QadsResult<()> {
        loop {
            // SAFETY: self.sem is a valid open semaphore handle.
            if unsafe { libc::sem_trywait(self.sem.as_ptr()) } == 0 {
                return Ok(());
            }
            match errno() {
                libc::EINTR => continue,
                libc::EAGAIN => return Err(QadsError::Timeout),
                _ => {
                    return Err(QadsError::resource_errno(format!(
                        "sem_trywait on '{}' failed",
                        self.name_str()
                    )))
                }
            }
        }
    }

    /// Block until a token is available or `timeout` elapses;
    /// [`QadsError::Timeout`] on expiry.
    #[cfg(not(target_os = "macos"))]
    pub fn timed_wait(&self, timeout: Duration) -> QadsResult<()> {
        let deadline = realtime_deadline(timeout);
        loop {
            // SAFETY: self.sem is a valid open semaphore handle; deadline is
            // a well-formed timespec.
            if unsafe { libc::sem_timedwait(self.sem.as_ptr(), &deadline) } == 0 {
                return Ok(());
            }
            match errno() {
                libc::EINTR => continue,
                libc::ETIMEDOUT => return Err(QadsError::Timeout),
                _ => {
                    return Err(QadsError::resource_errno(format!(
                        "sem_timedwait on '{}' failed",
                        self.name_str()
                    )))
                }
            }
        }
    }

    /// Block until a token is available or `timeout` elapses.
    ///
    /// macOS has no `sem_timedwait`; poll `sem_trywait` against the same
    /// deadline instead.
    #[cfg(target_os = "macos")]
    pub fn timed_wait(&self, timeout: Duration) -> QadsResult<()> {
        const POLL_INTERVAL: Duration = Duration::from_micros(200);
        let deadline = std::time::Instant::now() + timeout;
        loop {
            match self.try_wait() {
                Err(QadsError::Timeout) => {}
                other => return other,
            }
            if std::time::Instant::now() >= deadline {
                return Err(QadsError::Timeout);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Dispatch on the arena timeout convention: negative waits forever,
    /// zero polls, positive waits up to that many milliseconds.
    pub fn wait_timeout_ms(&self, timeout_ms: i32) -> QadsResult<()> {
        if timeout_ms < 0 {
            self.wait()
        } else if timeout_ms == 0 {
            self.try_wait()
        } else {
            self.timed_wait(Duration::from_millis(timeout_ms as u64))
        }
    }

    /// Release one token.
    pub fn post(&self) -> QadsResult<()> {
        // SAFETY: self.sem is a valid open semaphore handle.
        if unsafe { libc::sem_post(self.sem.as_ptr()) } == 0 {
            Ok(())
        } else {
            Err(QadsError::resource_errno(format!(
                "sem_post on '{}' failed",
                self.name_str()
            )))
        }
    }

    fn name_str(&self) -> &str {
        self.name.to_str().unwrap_or("<non-utf8>")
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        // SAFETY: self.sem is a valid open semaphore handle, closed exactly
        // once here.
        unsafe { libc::sem_close(self.sem.as_ptr()) };
        if self.owner {
            // SAFETY: self.name is a valid NUL-terminated string.
            unsafe { libc::sem_unlink(self.name.as_ptr()) };
        }
    }
}

// SAFETY: sem_t handles are process-shared kernel objects; the libc calls
// used here are thread-safe.
unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn cstring(name: &str) -> QadsResult<CString> {
    CString::new(name)
        .map_err(|_| QadsError::config(format!("semaphore name '{}' contains a NUL byte", name)))
}

/// Now + timeout on CLOCK_REALTIME, normalized.
#[cfg(not(target_os = "macos"))]
fn realtime_deadline(timeout: Duration) -> libc::timespec {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: now is a valid out-pointer; CLOCK_REALTIME is always available.
    unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) };

    let mut sec = now.tv_sec + timeout.as_secs() as libc::time_t;
    let mut nsec = now.tv_nsec + timeout.subsec_nanos() as libc::c_long;
    if nsec >= 1_000_000_000 {
        sec += 1;
        nsec -= 1_000_000_000;
    }
    libc::timespec {
        tv_sec: sec,
        tv_nsec: nsec,
    }
}
