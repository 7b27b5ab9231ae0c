//! Shared-memory primitives: the mapped POSIX object and the arena layout
//! over it.
//!
//! [`ShmRegion`](shm_region::ShmRegion) owns the `shm_open` + `mmap`
//! lifecycle; [`layout`] defines the header, the per-slot state array, and
//! the bounds-checked [`HeaderView`](layout::HeaderView) the arena works
//! through. Nothing here knows about batches or semaphores.

pub mod layout;
pub mod shm_region;

pub use layout::{ArenaHeader, HeaderView, RingGeometry, SlotState, LAYOUT_VERSION, MAGIC};
pub use shm_region::ShmRegion;
