//! The per-channel arena: mapping, ring protocol, and lifecycle.
//!
//! An [`Arena`] starts unbound, then binds as the channel's single writer or
//! as one of its readers. The writer publishes sequentially numbered batches
//! into a ring of fixed-size slots inside the shared mapping; readers
//! consume them in commit order. Slot hand-off is a semaphore pair (free
//! slots / ready slots) plus per-slot `ready` flags with release/acquire
//! ordering, so payload bytes written before a commit are visible to the
//! reader that observes the commit.
//!
//! Multiple readers on one channel compete for the same ready slots — each
//! batch is delivered to exactly one of them. Fan-out broadcast is not a
//! goal of this transport.

use std::sync::atomic::Ordering;

use serde::Serialize;

use crate::codec::{ArrowIpcCodec, BatchCodec};
use crate::config::ArenaConfig;
use crate::error::{QadsError, QadsResult};
use crate::memory::layout::{ring_geometry, HeaderView};
use crate::memory::shm_region::ShmRegion;
use crate::sync::semaphore::NamedSemaphore;

/// Where an arena is in its lifecycle. Transitions into `Closed` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaRole {
    /// Constructed but not yet bound to the channel.
    Unbound,
    /// Bound as the channel's single writer.
    Writer,
    /// Bound as one of the channel's readers.
    Reader,
    /// Closed; every operation except `close` fails.
    Closed,
}

/// In-process counters, updated by the owning role's thread only.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ArenaStats {
    /// Payload bytes committed by this writer handle.
    pub bytes_written: u64,
    /// Payload bytes consumed by this reader handle.
    pub bytes_read: u64,
    /// Successful `write` calls.
    pub writes_count: u64,
    /// Successful `read` calls.
    pub reads_count: u64,
    /// Waits that ended in a timeout.
    pub wait_timeouts: u64,
}

/// Everything bound to the live channel: the mapping, the typed header
/// view into it, and the semaphore pair. Dropped as a unit on close, which
/// unmaps, closes the descriptor and semaphores, and (for the writer, via
/// the owner flags) unlinks all three names.
struct Attachment {
    region: ShmRegion,
    view: HeaderView,
    free_slots: NamedSemaphore,
    ready_slots: NamedSemaphore,
    buffer_count: usize,
    slot_size: usize,
    buffers_offset: usize,
}

impl Attachment {
    /// Exclusive view of slot `idx`'s payload region.
    ///
    /// # Safety
    ///
    /// Caller must hold write ownership of the slot: the writer role, after
    /// taking a free-slot token, while `ready == false`.
    unsafe fn payload_mut(&self, idx: usize) -> &mut [u8] {
        debug_assert!(idx < self.buffer_count);
        let offset = self.buffers_offset + idx * self.slot_size;
        // Bounds were validated against the mapping length at bind time.
        std::slice::from_raw_parts_mut(self.region.as_ptr().add(offset), self.slot_size)
    }

    /// Shared view of the first `len` payload bytes of slot `idx`.
    ///
    /// # Safety
    ///
    /// Caller must hold read ownership of the slot: the reader role, after
    /// taking a ready-slot token, while `ready == true`, with
    /// `len <= slot_size`.
    unsafe fn payload(&self, idx: usize, len: usize) -> &[u8] {
        debug_assert!(idx < self.buffer_count && len <= self.slot_size);
        let offset = self.buffers_offset + idx * self.slot_size;
        std::slice::from_raw_parts(self.region.as_ptr().add(offset), len)
    }
}

/// A shared-memory channel endpoint, generic over the batch codec.
///
/// The codec is plugged in at compile time; [`ArrowIpcCodec`] is the
/// default. The arena never inspects payload bytes itself.
pub struct Arena<C: BatchCodec = ArrowIpcCodec> {
    config: ArenaConfig,
    codec: C,
    role: ArenaRole,
    attachment: Option<Attachment>,
    stats: ArenaStats,
}

// SAFETY: the attachment's raw pointers target OS shared memory whose
// address is stable for the mapping's lifetime; all cross-thread state in it
// is atomic or semaphore-guarded. Methods take &mut self, so a single
// handle is never used concurrently.
unsafe impl<C: BatchCodec + Send> Send for Arena<C> {}

impl Arena<ArrowIpcCodec> {
    /// New unbound arena carrying Arrow record batches.
    pub fn new(config: ArenaConfig) -> QadsResult<Self> {
        Self::with_codec(config, ArrowIpcCodec)
    }
}

impl<C: BatchCodec> Arena<C> {
    /// New unbound arena with an explicit codec.
    pub fn with_codec(config: ArenaConfig, codec: C) -> QadsResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            codec,
            role: ArenaRole::Unbound,
            attachment: None,
            stats: ArenaStats::default(),
        })
    }

    pub fn role(&self) -> ArenaRole {
        self.role
    }

    pub fn config(&self) -> &ArenaConfig {
        &self.config
    }

    /// Snapshot of this handle's counters.
    pub fn stats(&self) -> ArenaStats {
        self.stats
    }

    /// Bind as the channel's writer: create the shared object exclusively,
    /// lay out the header, and create the semaphore pair (free = slot
    /// count, ready = 0).
    ///
    /// Fails with a name-in-use resource error when the channel already
    /// exists — including stale remains of a crashed writer, which must be
    /// reclaimed explicitly (see [`purge_channel`]).
    pub fn bind_writer(&mut self) -> QadsResult<()> {
        self.expect_role(ArenaRole::Unbound, "bind_writer")?;

        let geometry = ring_geometry(self.config.total_size, self.config.buffer_count)?;
        let write_sem_name = self.config.write_sem_name();
        let read_sem_name = self.config.read_sem_name();

        let region = ShmRegion::create(&self.config.shm_name(), self.config.total_size)?;

        // SAFETY: region is a fresh zeroed mapping of total_size bytes,
        // exclusively ours until the semaphores below are created and the
        // role is published.
        let view = unsafe {
            HeaderView::init(
                std::ptr::NonNull::new(region.as_ptr())
                    .ok_or_else(|| QadsError::resource("mapping returned a null base address"))?,
                self.config.total_size,
                self.config.buffer_count,
                geometry,
                &write_sem_name,
                &read_sem_name,
            )?
        };

        // Failure past this point drops `region` (which unlinks the shm
        // name) and any semaphore already created (which unlinks its name):
        // a failed bind leaves nothing behind.
        let free_slots = NamedSemaphore::create(&write_sem_name, self.config.buffer_count as u32)?;
        let ready_slots = NamedSemaphore::create(&read_sem_name, 0)?;

        view.header().writer_active.store(true, Ordering::Release);

        log::info!(
            "arena: writer bound '{}' ({} bytes, {} slots of {} bytes)",
            self.config.name,
            self.config.total_size,
            self.config.buffer_count,
            geometry.slot_size,
        );

        self.attachment = Some(Attachment {
            region,
            view,
            free_slots,
            ready_slots,
            buffer_count: self.config.buffer_count,
            slot_size: geometry.slot_size,
            buffers_offset: geometry.buffers_offset,
        });
        self.role = ArenaRole::Writer;
        Ok(())
    }

    /// Bind as a reader: open and map the existing channel, validate magic
    /// and version, and open the semaphores named in its header.
    ///
    /// On any validation failure the mapping is torn down before returning.
    pub fn bind_reader(&mut self) -> QadsResult<()> {
        self.expect_role(ArenaRole::Unbound, "bind_reader")?;

        let region = ShmRegion::open(&self.config.shm_name())?;

        // SAFETY: region maps the whole object; attach validates magic,
        // version, and geometry before any of it is trusted. An error here
        // drops `region`, leaving no in-process mapping behind.
        let view = unsafe {
            HeaderView::attach(
                std::ptr::NonNull::new(region.as_ptr())
                    .ok_or_else(|| QadsError::resource("mapping returned a null base address"))?,
                region.len(),
            )?
        };

        let free_slots = NamedSemaphore::open(view.write_sem_name()?)?;
        let ready_slots = NamedSemaphore::open(view.read_sem_name()?)?;

        let buffer_count = view.slot_count();
        let slot_size = view.slot_size();
        let buffers_offset = view.buffers_offset();

        view.header().reader_count.fetch_add(1, Ordering::AcqRel);

        log::info!(
            "arena: reader bound '{}' ({} slots of {} bytes)",
            self.config.name,
            buffer_count,
            slot_size,
        );

        self.attachment = Some(Attachment {
            region,
            view,
            free_slots,
            ready_slots,
            buffer_count,
            slot_size,
            buffers_offset,
        });
        self.role = ArenaRole::Reader;
        Ok(())
    }

    /// Commit one batch to the ring, blocking while the ring is full.
    ///
    /// On a codec failure — including a payload that does not fit the slot —
    /// the ring is left unchanged: the slot stays un-ready, the free-slot
    /// token is restored, and the write sequence does not advance.
    pub fn write(&mut self, batch: &C::Batch) -> QadsResult<()> {
        self.expect_role(ArenaRole::Writer, "write")?;
        let Some(att) = self.attachment.as_ref() else {
            return Err(QadsError::state("arena is bound but has no attachment"));
        };

        att.free_slots.wait()?;

        let header = att.view.header();
        let seq = header.write_sequence.load(Ordering::Acquire);
        let idx = (seq % att.buffer_count as u64) as usize;

        // SAFETY: we hold a free-slot token and are the only writer, so the
        // slot at the write sequence is ours while `ready == false`.
        let payload = unsafe { att.payload_mut(idx) };

        let written = match self.codec.encode(batch, payload) {
            Ok(n) => n,
            Err(err) => {
                // Nothing was published; put the free token back so the
                // slot count invariant holds.
                if let Err(post_err) = att.free_slots.post() {
                    log::warn!(
                        "arena '{}': failed to restore free-slot token: {}",
                        self.config.name,
                        post_err
                    );
                }
                return Err(err);
            }
        };
        debug_assert!(written <= att.slot_size, "codec overran the slot");

        let slot = att.view.slot(idx);
        slot.data_size.store(written as u64, Ordering::Relaxed);
        slot.timestamp.store(monotonic_micros(), Ordering::Relaxed);
        // The release publishes the payload and both stores above to the
        // reader that acquires `ready`.
        slot.ready.store(true, Ordering::Release);
        header.write_sequence.fetch_add(1, Ordering::AcqRel);
        att.ready_slots.post()?;

        self.stats.bytes_written += written as u64;
        self.stats.writes_count += 1;
        Ok(())
    }

    /// Consume the next batch in commit order.
    ///
    /// `timeout_ms < 0` waits indefinitely, `0` polls, `> 0` waits up to
    /// that many milliseconds; expiry returns [`QadsError::Timeout`] and
    /// counts in [`ArenaStats::wait_timeouts`].
    ///
    /// A reader blocked with an infinite timeout on a channel whose writer
    /// has closed stays blocked; use finite timeouts where that matters.
    pub fn read(&mut self, timeout_ms: i32) -> QadsResult<C::Batch> {
        self.expect_role(ArenaRole::Reader, "read")?;
        let Some(att) = self.attachment.as_ref() else {
            return Err(QadsError::state("arena is bound but has no attachment"));
        };

        if let Err(err) = att.ready_slots.wait_timeout_ms(timeout_ms) {
            if err.is_timeout() {
                self.stats.wait_timeouts += 1;
            }
            return Err(err);
        }

        let header = att.view.header();
        let seq = header.read_sequence.load(Ordering::Acquire);
        let idx = (seq % att.buffer_count as u64) as usize;

        let slot = att.view.slot(idx);
        if !slot.ready.load(Ordering::Acquire) {
            // Woken for a slot that holds nothing: the ring state and the
            // semaphore disagree. Hand the token to the free side so the
            // writer is not starved, and report the violation.
            if let Err(post_err) = att.free_slots.post() {
                log::warn!(
                    "arena '{}': failed to post free-slot token after protocol violation: {}",
                    self.config.name,
                    post_err
                );
            }
            return Err(QadsError::Transport(format!(
                "slot {} not ready at read sequence {} (ring protocol violation)",
                idx, seq
            )));
        }

        let size = slot.data_size.load(Ordering::Acquire) as usize;
        let result = if size > att.slot_size {
            Err(QadsError::Transport(format!(
                "slot {} claims {} payload bytes but slots hold {}",
                idx, size, att.slot_size
            )))
        } else {
            // SAFETY: we hold the ready-slot token for this slot and
            // acquired `ready`, so the writer's payload bytes are visible
            // and no one rewrites them until we release the slot below.
            self.codec.decode(unsafe { att.payload(idx, size) })
        };

        // The slot is done either way — a decode failure must not wedge the
        // ring.
        slot.ready.store(false, Ordering::Release);
        header.read_sequence.fetch_add(1, Ordering::AcqRel);
        att.free_slots.post()?;

        if result.is_ok() {
            self.stats.bytes_read += size as u64;
            self.stats.reads_count += 1;
        }
        result
    }

    /// Consume the next batch only if one is ready right now.
    pub fn try_read(&mut self) -> QadsResult<C::Batch> {
        self.read(0)
    }

    /// Wait until at least one slot is ready, without consuming it.
    ///
    /// Advisory peek: the ready token is taken and immediately put back, so
    /// a concurrent reader on the same channel can still win the race to
    /// the next [`read`](Self::read). Timeouts count in
    /// [`ArenaStats::wait_timeouts`].
    pub fn wait_for_data(&mut self, timeout_ms: i32) -> QadsResult<()> {
        self.expect_role(ArenaRole::Reader, "wait_for_data")?;
        let Some(att) = self.attachment.as_ref() else {
            return Err(QadsError::state("arena is bound but has no attachment"));
        };

        match att.ready_slots.wait_timeout_ms(timeout_ms) {
            Ok(()) => att.ready_slots.post(),
            Err(err) => {
                if err.is_timeout() {
                    self.stats.wait_timeouts += 1;
                }
                Err(err)
            }
        }
    }

    /// Blocking iterator over incoming batches.
    ///
    /// Yields until a wait times out (end of iteration) or a non-timeout
    /// error occurs (yielded once, then the iterator is fused).
    pub fn iter(&mut self, timeout_ms: i32) -> Batches<'_, C> {
        Batches {
            arena: self,
            timeout_ms,
            done: false,
        }
    }

    /// Writer liveness flag from the shared header, if bound.
    pub fn writer_active(&self) -> Option<bool> {
        self.attachment
            .as_ref()
            .map(|att| att.view.header().writer_active.load(Ordering::Acquire))
    }

    /// Number of attached readers from the shared header, if bound.
    pub fn reader_count(&self) -> Option<i32> {
        self.attachment
            .as_ref()
            .map(|att| att.view.header().reader_count.load(Ordering::Acquire))
    }

    /// Release the binding. Idempotent; transitions to `Closed`.
    ///
    /// The writer clears `writer_active`, unmaps, and unlinks the shared
    /// object and both semaphore names; a reader decrements `reader_count`
    /// and unmaps without unlinking anything. Callers must drive any
    /// in-flight waits to completion before closing (enforced by `&mut
    /// self`: a blocked `read` cannot overlap a `close` on the same
    /// handle).
    pub fn close(&mut self) {
        if let Some(att) = self.attachment.take() {
            match self.role {
                ArenaRole::Writer => {
                    att.view.header().writer_active.store(false, Ordering::Release);
                    log::info!("arena: writer closed '{}'", self.config.name);
                }
                ArenaRole::Reader => {
                    att.view.header().reader_count.fetch_sub(1, Ordering::AcqRel);
                    log::info!("arena: reader closed '{}'", self.config.name);
                }
                ArenaRole::Unbound | ArenaRole::Closed => {}
            }
            // Dropping the attachment unmaps, closes the descriptor and
            // semaphore handles, and unlinks whatever this role owns.
            drop(att);
        }
        self.role = ArenaRole::Closed;
    }

    fn expect_role(&self, wanted: ArenaRole, op: &str) -> QadsResult<()> {
        if self.role == wanted {
            Ok(())
        } else {
            Err(QadsError::State(format!(
                "{} requires the {:?} role, but arena '{}' is {:?}",
                op, wanted, self.config.name, self.role
            )))
        }
    }
}

impl<C: BatchCodec> Drop for Arena<C> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Blocking batch iterator returned by [`Arena::iter`].
pub struct Batches<'a, C: BatchCodec> {
    arena: &'a mut Arena<C>,
    timeout_ms: i32,
    done: bool,
}

impl<C: BatchCodec> Iterator for Batches<'_, C> {
    type Item = QadsResult<C::Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.arena.read(self.timeout_ms) {
            Ok(batch) => Some(Ok(batch)),
            Err(QadsError::Timeout) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

/// Remove a channel's shared object and semaphore names.
///
/// Out-of-band reclaim for channels whose writer died without closing.
/// Never call this while a writer might be live — removal is not
/// synchronized with anything and a racing writer would be stranded on
/// unlinked objects. Missing names are not an error.
pub fn purge_channel(name: &str) -> QadsResult<()> {
    // Borrow the name rules so we never unlink outside the /qads_ namespace.
    let config = ArenaConfig::new(name);
    config.validate()?;

    for object in [config.write_sem_name(), config.read_sem_name()] {
        let c_name = std::ffi::CString::new(object)
            .map_err(|_| QadsError::config("derived name contains a NUL byte"))?;
        // SAFETY: c_name is a valid NUL-terminated string.
        unsafe { libc::sem_unlink(c_name.as_ptr()) };
    }
    let c_name = std::ffi::CString::new(config.shm_name())
        .map_err(|_| QadsError::config("derived name contains a NUL byte"))?;
    // SAFETY: c_name is a valid NUL-terminated string.
    unsafe { libc::shm_unlink(c_name.as_ptr()) };

    log::info!("arena: purged channel '{}'", name);
    Ok(())
}

/// CLOCK_MONOTONIC now, in microseconds.
fn monotonic_micros() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is a valid out-pointer; CLOCK_MONOTONIC is always available.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000 + ts.tv_nsec as u64 / 1_000
}
