//! Bounded per-thread record buffers
//!
//! A [`Channel`] decouples the per-instruction hot path from file I/O. Each
//! traced thread owns one channel per record stream, so appends never take a
//! lock. When the buffer is full the next append first hands the filled
//! region to the channel's [`FlushSink`] and rewinds the cursor.
//!
//! ```text
//! capture callback ──push──▶ [ r0 | r1 | ... | rN-1 ]   (thread private)
//!                                      │ full
//!                                      ▼
//!                        FlushSink::flush_records(&bytes)  ──▶ trace file
//! ```
//!
//! The buffer holds whole records only, so every flush is an exact multiple
//! of the record size. The backing storage is allocated once, at creation.

use std::io;

use crate::error::{Result, TraceError};
use crate::records::Record;

/// Destination of a channel's filled buffer
pub trait FlushSink {
    /// Write exactly `bytes` to the destination
    fn flush_records(&mut self, bytes: &[u8]) -> io::Result<()>;
}

impl<F> FlushSink for F
where
    F: FnMut(&[u8]) -> io::Result<()>,
{
    fn flush_records(&mut self, bytes: &[u8]) -> io::Result<()> {
        self(bytes)
    }
}

/// Fixed-capacity, single-owner record buffer
pub struct Channel<T: Record, S: FlushSink> {
    buf: Vec<T>,
    capacity: usize,
    sink: S,
    total_appended: u64,
    total_flushed: u64,
    flushes: u64,
    /// False for a copy made by [`Channel::inherited`], whose pending
    /// records belong to another owner
    owns_pending: bool,
}

impl<T: Record, S: FlushSink> Channel<T, S> {
    /// Create a channel holding `capacity_bytes / T::SIZE` whole records
    ///
    /// Fails if the capacity cannot hold a single record.
    pub fn new(capacity_bytes: usize, sink: S) -> Result<Self> {
        let capacity = capacity_bytes / T::SIZE;
        if capacity == 0 {
            return Err(TraceError::CapacityTooSmall {
                capacity: capacity_bytes,
                record_size: T::SIZE,
            });
        }
        Ok(Self {
            buf: Vec::with_capacity(capacity),
            capacity,
            sink,
            total_appended: 0,
            total_flushed: 0,
            flushes: 0,
            owns_pending: true,
        })
    }

    /// Copy of this channel as seen by a forked child
    ///
    /// The copy shares the sink and holds the same pending records, but
    /// never writes them when dropped.
    pub fn inherited(&self) -> Self
    where
        S: Clone,
    {
        Self {
            buf: self.buf.clone(),
            capacity: self.capacity,
            sink: self.sink.clone(),
            total_appended: self.total_appended,
            total_flushed: self.total_flushed,
            flushes: self.flushes,
            owns_pending: false,
        }
    }

    /// Create a channel sized for `records` records
    pub fn with_records(records: usize, sink: S) -> Result<Self> {
        Self::new(records.saturating_mul(T::SIZE), sink)
    }

    /// Append one record, flushing first if the buffer is full
    pub fn push(&mut self, record: T) -> io::Result<()> {
        *self.next_slot()? = record;
        Ok(())
    }

    /// Reserve the next record in place and return it zero-filled
    ///
    /// Lets large records be filled without building them on the stack.
    pub fn next_slot(&mut self) -> io::Result<&mut T> {
        if self.buf.len() == self.capacity {
            self.flush()?;
        }
        self.buf.push(T::zeroed());
        self.total_appended += 1;
        let last = self.buf.len() - 1;
        Ok(&mut self.buf[last])
    }

    /// Write all pending records to the sink and rewind
    ///
    /// Returns the number of bytes written. A failed write leaves the
    /// pending records in place.
    pub fn flush(&mut self) -> io::Result<usize> {
        if self.buf.is_empty() {
            return Ok(0);
        }
        let bytes: &[u8] = bytemuck::cast_slice(&self.buf);
        let written = bytes.len();
        self.sink.flush_records(bytes)?;
        self.buf.clear();
        self.total_flushed += written as u64;
        self.flushes += 1;
        Ok(written)
    }

    /// Flush pending records and release the buffer
    pub fn close(mut self) -> io::Result<()> {
        self.flush().map(|_| ())
    }

    /// Release the buffer without writing pending records
    ///
    /// Used for buffers inherited across a fork, whose contents belong to
    /// the parent.
    pub fn discard(mut self) {
        self.buf.clear();
    }

    /// Whether `records` more records fit without a flush
    pub fn has_room(&self, records: usize) -> bool {
        self.capacity - self.buf.len() >= records
    }

    /// Records currently buffered
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Maximum records held before a flush
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            record_size: T::SIZE,
            total_appended: self.total_appended,
            total_flushed_bytes: self.total_flushed,
            flushes: self.flushes,
            pending: self.buf.len(),
            capacity: self.capacity,
        }
    }
}

impl<T: Record, S: FlushSink> Drop for Channel<T, S> {
    fn drop(&mut self) {
        if !self.owns_pending {
            return;
        }
        if let Err(e) = self.flush() {
            tracing::warn!(
                "Dropping {} unflushed records after write failure: {}",
                self.buf.len(),
                e
            );
        }
    }
}

/// Channel statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStats {
    pub record_size: usize,
    pub total_appended: u64,
    pub total_flushed_bytes: u64,
    pub flushes: u64,
    pub pending: usize,
    pub capacity: usize,
}

impl ChannelStats {
    /// Bytes appended so far, flushed or not
    pub fn total_appended_bytes(&self) -> u64 {
        self.total_appended * self.record_size as u64
    }

    /// Bytes still sitting in the buffer
    pub fn pending_bytes(&self) -> u64 {
        (self.pending * self.record_size) as u64
    }

    /// Buffer utilization (0.0 to 1.0)
    pub fn utilization(&self) -> f64 {
        self.pending as f64 / self.capacity as f64
    }
}
