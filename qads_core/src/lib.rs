//! # qads_core
//!
//! Cross-process, zero-copy transport for Arrow record batches over POSIX
//! shared memory.
//!
//! One writer and one or more readers on the same host exchange tabular
//! batches through a named channel: a shared memory object holding a ring of
//! fixed-size slots, coordinated by atomic sequence counters and a pair of
//! named counting semaphores. Batches are encoded with the Arrow IPC stream
//! format directly into the mapped slot, so a commit is one serialization
//! pass with no intermediate copy; the schema travels inside every payload.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use qads_core::{Arena, ArenaConfig};
//!
//! # fn demo(batch: qads_core::arrow::record_batch::RecordBatch) -> qads_core::QadsResult<()> {
//! // Producer process
//! let mut writer = Arena::new(ArenaConfig::new("ticks").with_total_size_mb(64))?;
//! writer.bind_writer()?;
//! writer.write(&batch)?;
//!
//! // Consumer process
//! let mut reader = Arena::new(ArenaConfig::new("ticks"))?;
//! reader.bind_reader()?;
//! let received = reader.read(5000)?; // up to 5 s; -1 blocks, 0 polls
//! # Ok(())
//! # }
//! ```
//!
//! ## Guarantees and limits
//!
//! - Batches arrive in commit order, byte-for-byte through the codec.
//! - Exactly one writer per channel, enforced by create-exclusive creation
//!   of the shared object; a second `bind_writer` fails with name-in-use.
//! - Multiple readers compete for batches; each batch goes to exactly one.
//! - No compression, encryption, networking, or persistence across reboots;
//!   access control is the filesystem mode on `/dev/shm/qads_<name>`.

// Cross-process coordination relies on lock-free native 64-bit atomics in
// the shared mapping.
#[cfg(not(target_has_atomic = "64"))]
compile_error!("qads_core requires native lock-free 64-bit atomics");

#[cfg(not(unix))]
compile_error!("qads_core requires a POSIX platform (shm_open / sem_open)");

pub mod arena;
pub mod codec;
pub mod config;
pub mod error;
pub mod memory;
pub mod sync;

pub use arena::{purge_channel, Arena, ArenaRole, ArenaStats, Batches};
pub use codec::{ArrowIpcCodec, BatchCodec, BytesCodec};
pub use config::ArenaConfig;
pub use error::{QadsError, QadsResult};

// Batches are built against this exact arrow version; re-exported so
// downstream crates never mix two copies of the type definitions.
pub use arrow;
