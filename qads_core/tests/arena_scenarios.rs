//! End-to-end scenarios for the arena, writer and reader in one process
//! over the real shared memory objects.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::{batch_larger_than, batch_with_rows, init_logging, unique_channel};
use qads_core::{purge_channel, Arena, ArenaConfig, ArenaRole, QadsError};

#[test]
fn scenario_single_small_batch() {
    // Given: a 1 MiB channel with 3 slots and both roles bound
    // When: the writer commits one {id, v} batch of three rows
    // Then: the reader receives exactly those rows and both sides count 1
    init_logging();
    let config = ArenaConfig::new(unique_channel("demoA"))
        .with_total_size(1 << 20)
        .with_buffer_count(3);

    let mut writer = Arena::new(config.clone()).unwrap();
    writer.bind_writer().unwrap();
    let mut reader = Arena::new(config).unwrap();
    reader.bind_reader().unwrap();

    let batch = batch_with_rows(&[(1, 1.0), (2, 2.0), (3, 3.0)]);
    writer.write(&batch).unwrap();

    let received = reader.read(5000).unwrap();
    assert_eq!(received, batch);
    assert_eq!(received.num_rows(), 3);

    assert_eq!(writer.stats().writes_count, 1);
    assert_eq!(reader.stats().reads_count, 1);
    assert_eq!(writer.stats().bytes_written, reader.stats().bytes_read);
}

#[test]
fn scenario_ring_fills_and_fourth_write_blocks() {
    // Given: 3 slots and no reader
    // When: the writer commits 4 batches
    // Then: the 4th write blocks until a reader frees a slot, and the
    //       reader receives all 4 in commit order
    init_logging();
    let config = ArenaConfig::new(unique_channel("demoB"))
        .with_total_size(1 << 20)
        .with_buffer_count(3);

    let mut writer = Arena::new(config.clone()).unwrap();
    writer.bind_writer().unwrap();

    let committed = Arc::new(AtomicUsize::new(0));
    let progress = Arc::clone(&committed);
    let writer_thread = thread::spawn(move || {
        for i in 0..4i64 {
            writer
                .write(&batch_with_rows(&[(i, i as f64)]))
                .unwrap();
            progress.fetch_add(1, Ordering::SeqCst);
        }
        writer
    });

    // The ring has 3 slots; the 4th commit must be parked in the free-slot
    // wait.
    thread::sleep(Duration::from_millis(300));
    assert_eq!(committed.load(Ordering::SeqCst), 3);

    let mut reader = Arena::new(config).unwrap();
    reader.bind_reader().unwrap();
    for i in 0..4i64 {
        let received = reader.read(-1).unwrap();
        assert_eq!(received, batch_with_rows(&[(i, i as f64)]));
    }

    let writer = writer_thread.join().unwrap();
    assert_eq!(committed.load(Ordering::SeqCst), 4);
    assert_eq!(writer.stats().writes_count, 4);
    assert_eq!(reader.stats().reads_count, 4);
}

#[test]
fn scenario_read_timeout() {
    // Given: a bound channel with nothing written
    // When: the reader waits 100 ms
    // Then: it gets the timeout outcome in roughly that window and the
    //       timeout counter advances
    init_logging();
    let config = ArenaConfig::new(unique_channel("demoC"))
        .with_total_size(1 << 20)
        .with_buffer_count(1);

    let mut writer = Arena::new(config.clone()).unwrap();
    writer.bind_writer().unwrap();
    let mut reader = Arena::new(config).unwrap();
    reader.bind_reader().unwrap();

    let start = Instant::now();
    let err = reader.read(100).unwrap_err();
    let elapsed = start.elapsed();

    assert!(err.is_timeout(), "{:?}", err);
    assert!(elapsed >= Duration::from_millis(95), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(1000), "{:?}", elapsed);
    assert_eq!(reader.stats().wait_timeouts, 1);
    assert_eq!(reader.stats().reads_count, 0);
}

#[test]
fn scenario_oversize_payload_leaves_ring_unchanged() {
    // Given: 64 KiB over 4 slots (~16 KiB of payload each)
    // When: a batch whose encoding exceeds one slot is written
    // Then: the write fails payload-too-large, nothing advances, and the
    //       next small batch flows through untouched
    init_logging();
    let config = ArenaConfig::new(unique_channel("demoD"))
        .with_total_size(64 * 1024)
        .with_buffer_count(4);

    let mut writer = Arena::new(config.clone()).unwrap();
    writer.bind_writer().unwrap();
    let mut reader = Arena::new(config).unwrap();
    reader.bind_reader().unwrap();

    let oversize = batch_larger_than(20 * 1024);
    match writer.write(&oversize) {
        Err(QadsError::PayloadTooLarge { capacity, .. }) => {
            assert!(capacity <= 16 * 1024, "slot capacity {}", capacity)
        }
        other => panic!("expected PayloadTooLarge, got {:?}", other.map(|_| ())),
    }
    assert_eq!(writer.stats().writes_count, 0);

    // Ring is untouched: nothing to read...
    assert!(reader.read(0).unwrap_err().is_timeout());

    // ...and the next commit lands in the same slot the failed one leased.
    let small = batch_with_rows(&[(42, 0.5); 8]);
    writer.write(&small).unwrap();
    assert_eq!(reader.read(1000).unwrap(), small);
    assert_eq!(writer.stats().writes_count, 1);
    assert_eq!(reader.stats().reads_count, 1);
}

#[cfg(target_os = "linux")]
#[test]
fn scenario_version_mismatch_refuses_reader() {
    // Given: a live channel whose header claims a future layout version
    // When: a reader binds
    // Then: it fails with a version error and holds no mapping
    use std::io::{Seek, SeekFrom, Write};

    init_logging();
    let name = unique_channel("demoE");
    let config = ArenaConfig::new(name.clone()).with_total_size(1 << 20);

    let mut writer = Arena::new(config.clone()).unwrap();
    writer.bind_writer().unwrap();

    // The version field sits at byte offset 4, right after the magic.
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(format!("/dev/shm/qads_{}", name))
        .unwrap();
    file.seek(SeekFrom::Start(4)).unwrap();
    file.write_all(&2u32.to_le_bytes()).unwrap();
    drop(file);

    let mut reader = Arena::new(config).unwrap();
    match reader.bind_reader() {
        Err(QadsError::VersionMismatch { expected: 1, found: 2 }) => {}
        other => panic!("expected VersionMismatch, got {:?}", other),
    }
    assert_eq!(reader.role(), ArenaRole::Unbound);
}

#[test]
fn scenario_stale_channel_needs_explicit_reclaim() {
    // Given: a writer that died without closing (objects left behind)
    // When: a new writer binds the same name
    // Then: it fails name-in-use until the objects are purged, after which
    //       the channel works end to end
    init_logging();
    let name = unique_channel("demoF");
    let config = ArenaConfig::new(name.clone())
        .with_total_size(1 << 20)
        .with_buffer_count(3);

    let mut crashed = Arena::new(config.clone()).unwrap();
    crashed.bind_writer().unwrap();
    // A SIGKILLed process runs no destructors; leak the handle to match.
    std::mem::forget(crashed);

    let mut replacement = Arena::new(config.clone()).unwrap();
    match replacement.bind_writer() {
        Err(QadsError::Resource(msg)) => assert!(msg.contains("name in use"), "{}", msg),
        other => panic!("expected name-in-use, got {:?}", other),
    }

    purge_channel(&name).unwrap();

    replacement.bind_writer().unwrap();
    let mut reader = Arena::new(config).unwrap();
    reader.bind_reader().unwrap();

    let batch = batch_with_rows(&[(7, 7.0)]);
    replacement.write(&batch).unwrap();
    assert_eq!(reader.read(1000).unwrap(), batch);
}

#[test]
fn wait_for_data_peeks_without_consuming() {
    init_logging();
    let config = ArenaConfig::new(unique_channel("peek"))
        .with_total_size(1 << 20)
        .with_buffer_count(3);

    let mut writer = Arena::new(config.clone()).unwrap();
    writer.bind_writer().unwrap();
    let mut reader = Arena::new(config).unwrap();
    reader.bind_reader().unwrap();

    // Nothing there yet.
    assert!(reader.wait_for_data(50).unwrap_err().is_timeout());
    assert_eq!(reader.stats().wait_timeouts, 1);

    let batch = batch_with_rows(&[(1, 1.0)]);
    writer.write(&batch).unwrap();

    // With a single reader, a successful peek guarantees the poll-read wins.
    reader.wait_for_data(1000).unwrap();
    assert_eq!(reader.read(0).unwrap(), batch);
}

#[test]
fn infinite_read_blocks_until_a_commit() {
    init_logging();
    let config = ArenaConfig::new(unique_channel("block"))
        .with_total_size(1 << 20)
        .with_buffer_count(3);

    let mut writer = Arena::new(config.clone()).unwrap();
    writer.bind_writer().unwrap();
    let mut reader = Arena::new(config).unwrap();
    reader.bind_reader().unwrap();

    let reader_thread = thread::spawn(move || {
        let start = Instant::now();
        let batch = reader.read(-1).unwrap();
        (batch, start.elapsed())
    });

    thread::sleep(Duration::from_millis(200));
    let batch = batch_with_rows(&[(9, 9.0)]);
    writer.write(&batch).unwrap();

    let (received, waited) = reader_thread.join().unwrap();
    assert_eq!(received, batch);
    assert!(waited >= Duration::from_millis(150), "{:?}", waited);
}

#[test]
fn blocking_iterator_drains_until_timeout() {
    init_logging();
    let config = ArenaConfig::new(unique_channel("iter"))
        .with_total_size(1 << 20)
        .with_buffer_count(4);

    let mut writer = Arena::new(config.clone()).unwrap();
    writer.bind_writer().unwrap();
    let mut reader = Arena::new(config).unwrap();
    reader.bind_reader().unwrap();

    let expected: Vec<_> = (0..3i64)
        .map(|i| batch_with_rows(&[(i, i as f64)]))
        .collect();
    for batch in &expected {
        writer.write(batch).unwrap();
    }

    let drained: Vec<_> = reader.iter(100).map(Result::unwrap).collect();
    assert_eq!(drained, expected);
    assert_eq!(reader.stats().wait_timeouts, 1);
}

#[test]
fn close_is_idempotent_and_reader_outlives_writer() {
    init_logging();
    let config = ArenaConfig::new(unique_channel("close"))
        .with_total_size(1 << 20)
        .with_buffer_count(3);

    let mut writer = Arena::new(config.clone()).unwrap();
    writer.bind_writer().unwrap();
    let mut reader = Arena::new(config).unwrap();
    reader.bind_reader().unwrap();

    let batch = batch_with_rows(&[(3, 0.25)]);
    writer.write(&batch).unwrap();

    writer.close();
    writer.close();
    assert_eq!(writer.role(), ArenaRole::Closed);

    // The reader's mapping stays valid after the writer unlinked the
    // object; the committed batch is still there, then no more arrive.
    assert_eq!(reader.read(1000).unwrap(), batch);
    assert!(reader.read(50).unwrap_err().is_timeout());

    reader.close();
    reader.close();
    assert_eq!(reader.role(), ArenaRole::Closed);
}
