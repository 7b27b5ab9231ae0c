//! On-disk layout of the arena: fixed header, per-slot state array, and the
//! geometry derived from the configured size and slot count.
//!
//! The header lives at offset 0 of the mapping and is shared across
//! processes, so its definition is `repr(C)` with cache-line alignment on the
//! outer boundaries. All cross-process coordination fields are native
//! atomics; the scalar geometry fields are written exactly once by the
//! writer, before `magic` is published with Release ordering, and only read
//! by parties that have already acquire-loaded a matching `magic`.

use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};

use crate::error::{QadsError, QadsResult};

/// Alignment unit for the header, the slot-state array, and slot payloads.
pub const CACHE_LINE: usize = 64;

/// 'QDAS' — first field of every arena mapping.
pub const MAGIC: u32 = 0x5144_4153;

/// Layout version stamped by the writer; readers refuse anything else.
pub const LAYOUT_VERSION: u32 = 1;

/// Fixed capacity of the embedded semaphore-name fields, NUL included.
pub const SEM_NAME_LEN: usize = 64;

/// Fixed header at offset 0 of the shared mapping.
///
/// Field order is part of the wire contract; do not reorder. Little-endian
/// byte order and lock-free 64-bit atomics are assumed on both sides.
#[repr(C, align(64))]
pub struct ArenaHeader {
    magic: AtomicU32,
    version: AtomicU32,
    total_size: u64,
    header_size: u64,
    buffer_count: u64,
    slot_size: u64,
    buffers_offset: u64,
    /// Count of slots ever committed by the writer.
    pub write_sequence: AtomicU64,
    /// Count of slots ever consumed by readers.
    pub read_sequence: AtomicU64,
    /// True between writer bind and writer close.
    pub writer_active: AtomicBool,
    /// Number of currently attached readers (diagnostic).
    pub reader_count: AtomicI32,
    write_sem_name: [u8; SEM_NAME_LEN],
    read_sem_name: [u8; SEM_NAME_LEN],
    // Per-slot state array follows as a trailing region; see `HeaderView::slot`.
}

/// Per-slot coordination state, one per ring slot, trailing the fixed header.
#[repr(C, align(64))]
pub struct SlotState {
    /// Length in bytes of the valid payload; meaningful only while `ready`.
    pub data_size: AtomicU64,
    /// True iff the slot holds an unread batch.
    pub ready: AtomicBool,
    /// Monotonic microseconds at commit time (diagnostic only).
    pub timestamp: AtomicU64,
}

/// Sizes and offsets derived from `(total_size, buffer_count)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingGeometry {
    /// Fixed header plus slot-state array, rounded up to [`CACHE_LINE`].
    pub header_size: usize,
    /// Payload capacity of one slot, rounded down to [`CACHE_LINE`].
    pub slot_size: usize,
    /// Byte offset of slot 0's payload.
    pub buffers_offset: usize,
}

/// Compute the ring geometry, rejecting configurations where the region
/// cannot hold the header plus at least one cache line of payload per slot.
pub fn ring_geometry(total_size: usize, buffer_count: usize) -> QadsResult<RingGeometry> {
    if buffer_count == 0 {
        return Err(QadsError::config("buffer count must be positive"));
    }

    let raw_header = std::mem::size_of::<ArenaHeader>()
        + buffer_count
            .checked_mul(std::mem::size_of::<SlotState>())
            .ok_or_else(|| QadsError::config("buffer count overflows header size"))?;
    let header_size = raw_header.div_ceil(CACHE_LINE) * CACHE_LINE;
    let buffers_offset = header_size;

    let payload_total = total_size
        .checked_sub(buffers_offset)
        .ok_or_else(|| QadsError::config("total size does not cover the header"))?;
    let slot_size = (payload_total / buffer_count) & !(CACHE_LINE - 1);

    if slot_size < CACHE_LINE {
        return Err(QadsError::Config(format!(
            "total size {} leaves {} bytes per slot; each of the {} slots needs at least {}",
            total_size,
            payload_total / buffer_count,
            buffer_count,
            CACHE_LINE
        )));
    }

    Ok(RingGeometry {
        header_size,
        slot_size,
        buffers_offset,
    })
}

/// Typed, bounds-checked view over a mapped arena region.
///
/// Construction validates magic, version, and geometry against the mapping
/// length; thereafter slot access is checked against the slot count.
pub struct HeaderView {
    header: NonNull<ArenaHeader>,
    slot_count: usize,
}

impl HeaderView {
    /// Lay out a fresh arena over `base` and return a view of it.
    ///
    /// Publishes `magic`/`version` last, with Release ordering, so a racing
    /// reader either sees a fully initialized header or refuses to attach.
    ///
    /// # Safety
    ///
    /// `base` must point to a zero-initialized, writable mapping of at least
    /// `total_size` bytes with cache-line alignment (mmap guarantees page
    /// alignment), exclusively owned by the caller until this returns.
    pub unsafe fn init(
        base: NonNull<u8>,
        total_size: usize,
        buffer_count: usize,
        geometry: RingGeometry,
        write_sem_name: &str,
        read_sem_name: &str,
    ) -> QadsResult<Self> {
        let hdr = base.as_ptr() as *mut ArenaHeader;

        std::ptr::addr_of_mut!((*hdr).total_size).write(total_size as u64);
        std::ptr::addr_of_mut!((*hdr).header_size).write(geometry.header_size as u64);
        std::ptr::addr_of_mut!((*hdr).buffer_count).write(buffer_count as u64);
        std::ptr::addr_of_mut!((*hdr).slot_size).write(geometry.slot_size as u64);
        std::ptr::addr_of_mut!((*hdr).buffers_offset).write(geometry.buffers_offset as u64);

        write_name_field(&mut (*hdr).write_sem_name, write_sem_name)?;
        write_name_field(&mut (*hdr).read_sem_name, read_sem_name)?;

        (*hdr).write_sequence.store(0, Ordering::Relaxed);
        (*hdr).read_sequence.store(0, Ordering::Relaxed);
        (*hdr).writer_active.store(false, Ordering::Relaxed);
        (*hdr).reader_count.store(0, Ordering::Relaxed);

        // The mapping is fresh from ftruncate, but initialize the slot array
        // explicitly rather than relying on zero pages.
        let slots = base.as_ptr().add(std::mem::size_of::<ArenaHeader>()) as *mut SlotState;
        for i in 0..buffer_count {
            let s = &*slots.add(i);
            s.data_size.store(0, Ordering::Relaxed);
            s.ready.store(false, Ordering::Relaxed);
            s.timestamp.store(0, Ordering::Relaxed);
        }

        // Publish last: a reader that acquire-loads a matching magic is
        // guaranteed to see every store above.
        fence(Ordering::Release);
        (*hdr).version.store(LAYOUT_VERSION, Ordering::Relaxed);
        (*hdr).magic.store(MAGIC, Ordering::Release);

        Ok(HeaderView {
            header: NonNull::new_unchecked(hdr),
            slot_count: buffer_count,
        })
    }

    /// Attach to an already-initialized arena at `base`.
    ///
    /// # Safety
    ///
    /// `base` must point to a readable, writable shared mapping of `map_len`
    /// bytes that outlives the returned view.
    pub unsafe fn attach(base: NonNull<u8>, map_len: usize) -> QadsResult<Self> {
        if map_len < std::mem::size_of::<ArenaHeader>() {
            return Err(QadsError::resource(format!(
                "mapping of {} bytes is too small for the arena header",
                map_len
            )));
        }

        let hdr = base.as_ptr() as *const ArenaHeader;

        let magic = (*hdr).magic.load(Ordering::Acquire);
        if magic != MAGIC {
            return Err(QadsError::BadMagic {
                expected: MAGIC,
                found: magic,
            });
        }
        let version = (*hdr).version.load(Ordering::Relaxed);
        if version != LAYOUT_VERSION {
            return Err(QadsError::VersionMismatch {
                expected: LAYOUT_VERSION,
                found: version,
            });
        }

        // Geometry sanity before trusting any offset: everything must land
        // inside the mapping we were handed.
        let buffer_count = (*hdr).buffer_count as usize;
        let header_size = (*hdr).header_size as usize;
        let slot_size = (*hdr).slot_size as usize;
        let buffers_offset = (*hdr).buffers_offset as usize;
        let total_size = (*hdr).total_size as usize;

        let min_header = std::mem::size_of::<ArenaHeader>()
            + buffer_count * std::mem::size_of::<SlotState>();
        let ring_end = buffers_offset
            .checked_add(buffer_count.checked_mul(slot_size).unwrap_or(usize::MAX))
            .unwrap_or(usize::MAX);
        if buffer_count == 0
            || header_size < min_header
            || buffers_offset < header_size
            || total_size > map_len
            || ring_end > total_size
        {
            return Err(QadsError::resource(format!(
                "arena header geometry is inconsistent \
                 (count={}, header={}, slot={}, offset={}, total={}, mapped={})",
                buffer_count, header_size, slot_size, buffers_offset, total_size, map_len
            )));
        }

        Ok(HeaderView {
            header: NonNull::new_unchecked(hdr as *mut ArenaHeader),
            slot_count: buffer_count,
        })
    }

    #[inline]
    pub fn header(&self) -> &ArenaHeader {
        // SAFETY: the pointer was validated at construction and the mapping
        // outlives the view (the Arena holds both).
        unsafe { self.header.as_ref() }
    }

    /// Bounds-checked access to slot `idx`'s state in the trailing array.
    #[inline]
    pub fn slot(&self, idx: usize) -> &SlotState {
        assert!(
            idx < self.slot_count,
            "slot index {} out of range ({} slots)",
            idx,
            self.slot_count
        );
        // SAFETY: the trailing array holds `slot_count` entries starting
        // right after the fixed header; `attach`/`init` verified it lies
        // within the mapping.
        unsafe {
            let base = (self.header.as_ptr() as *const u8)
                .add(std::mem::size_of::<ArenaHeader>()) as *const SlotState;
            &*base.add(idx)
        }
    }

    #[inline]
    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub fn total_size(&self) -> usize {
        self.header().total_size as usize
    }

    pub fn slot_size(&self) -> usize {
        self.header().slot_size as usize
    }

    pub fn buffers_offset(&self) -> usize {
        self.header().buffers_offset as usize
    }

    /// Semaphore name for free slots, as embedded by the writer.
    pub fn write_sem_name(&self) -> QadsResult<&str> {
        read_name_field(&self.header().write_sem_name)
    }

    /// Semaphore name for ready slots, as embedded by the writer.
    pub fn read_sem_name(&self) -> QadsResult<&str> {
        read_name_field(&self.header().read_sem_name)
    }
}

fn write_name_field(field: &mut [u8; SEM_NAME_LEN], name: &str) -> QadsResult<()> {
    let bytes = name.as_bytes();
    // Config validation already bounds the channel name; this guards the
    // layout contract itself.
    if bytes.len() >= SEM_NAME_LEN {
        return Err(QadsError::Config(format!(
            "semaphore name '{}' does not fit the {}-byte header field",
            name, SEM_NAME_LEN
        )));
    }
    field[..bytes.len()].copy_from_slice(bytes);
    field[bytes.len()..].fill(0);
    Ok(())
}

fn read_name_field(field: &[u8; SEM_NAME_LEN]) -> QadsResult<&str> {
    let end = field
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| QadsError::resource("semaphore name field is not NUL-terminated"))?;
    std::str::from_utf8(&field[..end])
        .map_err(|_| QadsError::resource("semaphore name field is not valid UTF-8"))
}
