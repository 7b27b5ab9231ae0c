//! Arena configuration: channel naming, sizing, and validation.
//!
//! A channel name `C` derives three POSIX object names:
//!
//! - shared memory object `/qads_<C>`
//! - free-slot semaphore `/qads_w_<C>`
//! - ready-slot semaphore `/qads_r_<C>`
//!
//! The semaphore names are embedded in the arena header as fixed 64-byte
//! NUL-terminated fields, so names that would not fit are rejected up front
//! rather than truncated.

use serde::{Deserialize, Serialize};

use crate::error::{QadsError, QadsResult};
use crate::memory::layout::{self, SEM_NAME_LEN};

/// Longest derived prefix: `/qads_w_` and `/qads_r_` are 8 bytes.
const DERIVED_PREFIX_LEN: usize = 8;

/// Maximum channel name length such that every derived name fits its
/// 64-byte header field, NUL terminator included.
pub const MAX_CHANNEL_NAME_LEN: usize = SEM_NAME_LEN - DERIVED_PREFIX_LEN - 1;

/// Default arena size when none is configured (100 MiB, matching the
/// historical factory default).
pub const DEFAULT_TOTAL_SIZE: usize = 100 * 1024 * 1024;

/// Default number of ring slots.
pub const DEFAULT_BUFFER_COUNT: usize = 3;

/// Upper sanity bound on the slot count; rings are typically 3-16 deep and
/// anything past this is a configuration mistake, not a workload.
pub const MAX_BUFFER_COUNT: usize = 4096;

/// Configuration for one arena, fixed at writer creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArenaConfig {
    /// Channel name; ASCII `[A-Za-z0-9_.-]`, at most [`MAX_CHANNEL_NAME_LEN`] bytes.
    pub name: String,
    /// Total size of the shared region in bytes, header included.
    pub total_size: usize,
    /// Number of ring slots.
    pub buffer_count: usize,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            total_size: DEFAULT_TOTAL_SIZE,
            buffer_count: DEFAULT_BUFFER_COUNT,
        }
    }
}

impl ArenaConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the total arena size in bytes.
    pub fn with_total_size(mut self, bytes: usize) -> Self {
        self.total_size = bytes;
        self
    }

    /// Set the total arena size in mebibytes.
    pub fn with_total_size_mb(mut self, mb: usize) -> Self {
        self.total_size = mb * 1024 * 1024;
        self
    }

    /// Set the number of ring slots.
    pub fn with_buffer_count(mut self, count: usize) -> Self {
        self.buffer_count = count;
        self
    }

    /// Validate the configuration, including that the derived geometry can
    /// hold at least one cache line of payload per slot.
    pub fn validate(&self) -> QadsResult<()> {
        if self.name.is_empty() {
            return Err(QadsError::config("channel name must not be empty"));
        }
        if self.name.len() > MAX_CHANNEL_NAME_LEN {
            return Err(QadsError::Config(format!(
                "channel name '{}' is {} bytes; derived semaphore names must fit \
                 {} bytes, so names are capped at {}",
                self.name,
                self.name.len(),
                SEM_NAME_LEN,
                MAX_CHANNEL_NAME_LEN
            )));
        }
        if let Some(bad) = self
            .name
            .bytes()
            .find(|b| !(b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-')))
        {
            return Err(QadsError::Config(format!(
                "channel name '{}' contains illegal byte 0x{:02X}; \
                 allowed characters are [A-Za-z0-9_.-]",
                self.name, bad
            )));
        }
        if self.buffer_count > MAX_BUFFER_COUNT {
            return Err(QadsError::Config(format!(
                "buffer count {} exceeds the maximum of {}",
                self.buffer_count, MAX_BUFFER_COUNT
            )));
        }
        // Delegates the zero-count and minimum-size checks.
        layout::ring_geometry(self.total_size, self.buffer_count)?;
        Ok(())
    }

    /// Name of the shared memory object, e.g. `/qads_demo`.
    pub fn shm_name(&self) -> String {
        format!("/qads_{}", self.name)
    }

    /// Name of the free-slot semaphore, e.g. `/qads_w_demo`.
    pub fn write_sem_name(&self) -> String {
        format!("/qads_w_{}", self.name)
    }

    /// Name of the ready-slot semaphore, e.g. `/qads_r_demo`.
    pub fn read_sem_name(&self) -> String {
        format!("/qads_r_{}", self.name)
    }
}
