//! Record-batch codecs.
//!
//! The arena treats each slot payload as opaque bytes; the codec plugged in
//! at compile time turns a batch into those bytes and back. A codec must
//! serialize self-describingly into a bounded region, reporting the bytes
//! written, and deserialize from a region of known size without any
//! out-of-band schema channel.
//!
//! [`ArrowIpcCodec`] is the production codec: the Arrow IPC stream format
//! carries the schema in-band, and encoding writes straight into the mapped
//! slot, so a commit is a single serialization pass with no intermediate
//! buffer.

use std::io;
use std::sync::Arc;

use arrow::datatypes::Schema;
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;

use crate::error::{QadsError, QadsResult};

/// Serialize/deserialize one batch to/from a slot's byte region.
pub trait BatchCodec {
    /// The batch type carried over the channel.
    type Batch;

    /// Encode `batch` into `dst`, returning the number of bytes written.
    ///
    /// Must fail with [`QadsError::PayloadTooLarge`] — before producing a
    /// partial payload the reader could mistake for a whole one — when the
    /// encoding does not fit `dst`.
    fn encode(&self, batch: &Self::Batch, dst: &mut [u8]) -> QadsResult<usize>;

    /// Decode a batch from the `src` bytes a writer committed.
    fn decode(&self, src: &[u8]) -> QadsResult<Self::Batch>;
}

/// Arrow IPC stream-format codec: schema plus columns, self-describing.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArrowIpcCodec;

impl BatchCodec for ArrowIpcCodec {
    type Batch = RecordBatch;

    fn encode(&self, batch: &RecordBatch, dst: &mut [u8]) -> QadsResult<usize> {
        let capacity = dst.len();
        let mut sink = BoundedWriter::new(dst);

        let schema: Arc<Schema> = batch.schema();
        let result = (|| {
            let mut writer = StreamWriter::try_new(&mut sink, schema.as_ref())?;
            writer.write(batch)?;
            writer.finish()
        })();

        match result {
            Ok(()) => Ok(sink.written()),
            Err(_) if sink.overflowed() => Err(QadsError::PayloadTooLarge {
                len: sink.needed(),
                capacity,
            }),
            Err(err) => Err(err.into()),
        }
    }

    fn decode(&self, src: &[u8]) -> QadsResult<RecordBatch> {
        let mut reader = StreamReader::try_new(io::Cursor::new(src), None)?;
        match reader.next() {
            Some(Ok(batch)) => Ok(batch),
            Some(Err(err)) => Err(err.into()),
            None => Err(QadsError::Codec(
                "IPC stream holds no record batch".to_string(),
            )),
        }
    }
}

/// Pass-through codec for payloads that are already encoded bytes.
///
/// Useful when a producer has IPC bytes in hand (e.g. relayed from another
/// channel) and for exercising the ring protocol in tests; also the one
/// codec for which a zero-length payload is a meaningful batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesCodec;

impl BatchCodec for BytesCodec {
    type Batch = Vec<u8>;

    fn encode(&self, batch: &Vec<u8>, dst: &mut [u8]) -> QadsResult<usize> {
        if batch.len() > dst.len() {
            return Err(QadsError::PayloadTooLarge {
                len: batch.len(),
                capacity: dst.len(),
            });
        }
        dst[..batch.len()].copy_from_slice(batch);
        Ok(batch.len())
    }

    fn decode(&self, src: &[u8]) -> QadsResult<Vec<u8>> {
        Ok(src.to_vec())
    }
}

/// `io::Write` over a fixed byte region that refuses to overflow.
///
/// Rejects the whole chunk that would cross the end, so the region never
/// holds a torn suffix; records how many bytes the writer was trying to
/// reach for diagnostics.
struct BoundedWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
    needed: usize,
    overflowed: bool,
}

impl<'a> BoundedWriter<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            needed: 0,
            overflowed: false,
        }
    }

    fn written(&self) -> usize {
        self.pos
    }

    fn overflowed(&self) -> bool {
        self.overflowed
    }

    /// Bytes the encoder had reached for when it overflowed (a lower bound
    /// on the full encoding size).
    fn needed(&self) -> usize {
        self.needed
    }
}

impl io::Write for BoundedWriter<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let end = self.pos + data.len();
        if end > self.buf.len() {
            self.overflowed = true;
            self.needed = end;
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "slot capacity exceeded",
            ));
        }
        self.buf[self.pos..end].copy_from_slice(data);
        self.pos = end;
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
