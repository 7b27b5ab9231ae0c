//! Shared helpers for the integration tests.
#![allow(dead_code)] // each test binary uses a subset of these

use std::sync::Arc;

use qads_core::arrow::array::{Float64Array, Int64Array};
use qads_core::arrow::datatypes::{DataType, Field, Schema};
use qads_core::arrow::record_batch::RecordBatch;

/// Unique channel name per test run so parallel tests and leftover objects
/// from aborted runs never collide.
pub fn unique_channel(prefix: &str) -> String {
    format!(
        "{}_{}_{}",
        prefix,
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    )
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// `{id: int64, v: float64}` with the given rows.
pub fn batch_with_rows(rows: &[(i64, f64)]) -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("v", DataType::Float64, false),
    ]));
    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from(
                rows.iter().map(|r| r.0).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                rows.iter().map(|r| r.1).collect::<Vec<_>>(),
            )),
        ],
    )
    .unwrap()
}

/// A batch whose IPC encoding comfortably exceeds `min_encoded_bytes`.
pub fn batch_larger_than(min_encoded_bytes: usize) -> RecordBatch {
    let rows: Vec<(i64, f64)> = (0..min_encoded_bytes as i64 / 8)
        .map(|i| (i, i as f64 * 0.5))
        .collect();
    batch_with_rows(&rows)
}
