//! Unified error handling for the shared-memory transport.
//!
//! Every fallible operation in this crate returns [`QadsResult`], so callers
//! deal with a single error type whatever layer the failure came from
//! (mapping, semaphores, ring protocol, or the Arrow codec).

use thiserror::Error;

/// Main error type for arena operations.
#[derive(Debug, Error)]
pub enum QadsError {
    /// I/O related errors (shm object create/open, ftruncate, mmap)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration (bad channel name, zero buffer count, size too small)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Shared memory or semaphore resource errors
    #[error("Resource error: {0}")]
    Resource(String),

    /// The shared object exists but does not start with the expected magic
    #[error("Bad magic: expected 0x{expected:08X}, found 0x{found:08X}")]
    BadMagic { expected: u32, found: u32 },

    /// The shared object was laid out by an incompatible version
    #[error("Layout version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    /// Operation not permitted in the arena's current role
    #[error("Invalid state: {0}")]
    State(String),

    /// Ring protocol violation (e.g. woken for a slot that is not ready)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Encoded batch does not fit the slot payload region
    #[error("Payload of {len} bytes exceeds slot capacity of {capacity} bytes")]
    PayloadTooLarge { len: usize, capacity: usize },

    /// Reader wait deadline reached; a normal flow-control outcome
    #[error("Timed out waiting for data")]
    Timeout,

    /// Serializer/deserializer failure, propagated from the codec
    #[error("Codec error: {0}")]
    Codec(String),
}

/// Convenience type alias for Results using QadsError
pub type QadsResult<T> = std::result::Result<T, QadsError>;

impl From<arrow::error::ArrowError> for QadsError {
    fn from(err: arrow::error::ArrowError) -> Self {
        QadsError::Codec(err.to_string())
    }
}

// Helper methods
impl QadsError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(msg: S) -> Self {
        QadsError::Config(msg.into())
    }

    /// Create a resource error with a custom message
    pub fn resource<S: Into<String>>(msg: S) -> Self {
        QadsError::Resource(msg.into())
    }

    /// Create a resource error carrying the current `errno` context
    pub fn resource_errno<S: Into<String>>(msg: S) -> Self {
        QadsError::Resource(format!(
            "{}: {}",
            msg.into(),
            std::io::Error::last_os_error()
        ))
    }

    /// Create an invalid-state error
    pub fn state<S: Into<String>>(msg: S) -> Self {
        QadsError::State(msg.into())
    }

    /// Create a transport (ring protocol) error
    pub fn transport<S: Into<String>>(msg: S) -> Self {
        QadsError::Transport(msg.into())
    }

    /// True iff this is the distinguished timeout outcome
    pub fn is_timeout(&self) -> bool {
        matches!(self, QadsError::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_distinguished() {
        assert!(QadsError::Timeout.is_timeout());
        assert!(!QadsError::config("x").is_timeout());
    }

    #[test]
    fn messages_carry_context() {
        let e = QadsError::PayloadTooLarge {
            len: 20480,
            capacity: 16320,
        };
        let msg = e.to_string();
        assert!(msg.contains("20480"));
        assert!(msg.contains("16320"));

        let e = QadsError::VersionMismatch {
            expected: 1,
            found: 2,
        };
        assert!(e.to_string().contains("expected 1"));
    }
}
