//! The circular buffer: a fixed-capacity FIFO sitting between the data
//! queue consumer and the Oracle writer. Overflow evicts the oldest entry
//! rather than rejecting the new one; utilisation crossing 80% upward fires
//! one warning event, re-armed only once utilisation falls back below 70%
//! (hysteresis, so the warning never flaps).
//!
//! Single-writer (the buffer consumer) / single-reader (the writer) in
//! normal operation, but every operation is still serialised under one
//! mutex since the control surface's observers may be called concurrently.

use crate::metrics::{BUFFER_OVERFLOW, BUFFER_UTILISATION};
use crate::sample::BufferEntry;
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::warn;

const DEFAULT_CAPACITY: usize = 10_000;
const HIGH_WATERMARK_PCT: f64 = 80.0;
const LOW_WATERMARK_PCT: f64 = 70.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Accepted,
    AcceptedWithOverflow,
}

struct Inner {
    entries: VecDeque<BufferEntry>,
    capacity: usize,
    overflow_count: u64,
    total_put: u64,
    warned_high: bool,
}

/// Fixed-capacity FIFO buffer of [`BufferEntry`] values.
pub struct CircularBuffer {
    inner: Mutex<Inner>,
}

impl CircularBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: VecDeque::with_capacity(capacity),
                capacity,
                overflow_count: 0,
                total_put: 0,
                warned_high: false,
            }),
        }
    }

    /// Push one entry. Evicts the oldest entry and increments
    /// `overflow_count` if the buffer is already at capacity.
    pub fn put(&self, entry: BufferEntry) -> PutOutcome {
        let mut inner = self.inner.lock().expect("buffer mutex poisoned");
        inner.total_put += 1;

        let outcome = if inner.entries.len() >= inner.capacity {
            inner.entries.pop_front();
            inner.overflow_count += 1;
            inner.entries.push_back(entry);
            PutOutcome::AcceptedWithOverflow
        } else {
            inner.entries.push_back(entry);
            PutOutcome::Accepted
        };

        let utilisation = Self::utilisation_of(&inner);
        BUFFER_UTILISATION.set(utilisation);
        BUFFER_OVERFLOW.set(inner.overflow_count as f64);
        if !inner.warned_high && utilisation >= HIGH_WATERMARK_PCT {
            inner.warned_high = true;
            warn!(utilisation, "circular buffer utilisation crossed 80%");
        } else if inner.warned_high && utilisation < LOW_WATERMARK_PCT {
            inner.warned_high = false;
        }

        outcome
    }

    /// Remove and return up to `n` oldest entries, in order. Never blocks.
    pub fn get(&self, n: usize) -> Vec<BufferEntry> {
        let mut inner = self.inner.lock().expect("buffer mutex poisoned");
        let take = n.min(inner.entries.len());
        inner.entries.drain(..take).collect()
    }

    /// Remove and return every entry currently buffered. Used by the writer
    /// at shutdown to flush whatever remains straight to CSV.
    pub fn drain_all(&self) -> Vec<BufferEntry> {
        let mut inner = self.inner.lock().expect("buffer mutex poisoned");
        inner.entries.drain(..).collect()
    }

    pub fn size(&self) -> usize {
        self.inner.lock().expect("buffer mutex poisoned").entries.len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().expect("buffer mutex poisoned").capacity
    }

    pub fn utilisation(&self) -> f64 {
        let inner = self.inner.lock().expect("buffer mutex poisoned");
        Self::utilisation_of(&inner)
    }

    fn utilisation_of(inner: &Inner) -> f64 {
        if inner.capacity == 0 {
            return 0.0;
        }
        (inner.entries.len() as f64 / inner.capacity as f64) * 100.0
    }

    pub fn overflow_count(&self) -> u64 {
        self.inner.lock().expect("buffer mutex poisoned").overflow_count
    }

    /// Overflow events as a percentage of all puts since creation.
    pub fn overflow_rate(&self) -> f64 {
        let inner = self.inner.lock().expect("buffer mutex poisoned");
        if inner.total_put == 0 {
            return 0.0;
        }
        (inner.overflow_count as f64 / inner.total_put as f64) * 100.0
    }
}

impl Default for CircularBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mc3e::DeviceCode;
    use crate::sample::{RawValue, Sample, TagKind};
    use crate::mc3e::DeviceAddress;

    fn entry(offset: u32) -> BufferEntry {
        let addr = DeviceAddress::new(DeviceCode::D, offset);
        let sample = Sample::new(
            "PLC01",
            addr,
            "EQUIP0000000001",
            TagKind::WordHost,
            RawValue::Word(offset as u16),
            1.0,
            crate::sample::Quality::Good,
        );
        BufferEntry::new(sample)
    }

    #[test]
    fn put_under_capacity_never_overflows() {
        let buf = CircularBuffer::new(5);
        for i in 0..5 {
            assert_eq!(buf.put(entry(i)), PutOutcome::Accepted);
        }
        assert_eq!(buf.size(), 5);
        assert_eq!(buf.overflow_count(), 0);
        assert_eq!(buf.utilisation(), 100.0);
    }

    #[test]
    fn overflow_evicts_oldest_and_counts() {
        let buf = CircularBuffer::new(5);
        for i in 0..5 {
            buf.put(entry(i));
        }
        let outcome = buf.put(entry(5));
        assert_eq!(outcome, PutOutcome::AcceptedWithOverflow);
        assert_eq!(buf.size(), 5);
        assert_eq!(buf.overflow_count(), 1);
    }

    #[test]
    fn overflow_scenario_from_spec_seven_entries_capacity_five() {
        let buf = CircularBuffer::new(5);
        for i in 0..7 {
            buf.put(entry(i));
        }
        assert_eq!(buf.size(), 5);
        assert_eq!(buf.overflow_count(), 2);
        let got = buf.get(5);
        let offsets: Vec<u32> = got.iter().map(|e| e.sample.address.offset).collect();
        assert_eq!(offsets, vec![2, 3, 4, 5, 6]);
    }

    #[test]
    fn get_removes_entries_and_preserves_fifo_order() {
        let buf = CircularBuffer::new(10);
        for i in 0..3 {
            buf.put(entry(i));
        }
        let got = buf.get(2);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].sample.address.offset, 0);
        assert_eq!(got[1].sample.address.offset, 1);
        assert_eq!(buf.size(), 1);
    }

    #[test]
    fn get_never_blocks_on_empty_buffer() {
        let buf = CircularBuffer::new(10);
        assert!(buf.get(5).is_empty());
    }

    #[test]
    fn exactly_full_buffer_reports_100_percent_and_next_put_overflows() {
        let buf = CircularBuffer::new(3);
        for i in 0..3 {
            assert_eq!(buf.put(entry(i)), PutOutcome::Accepted);
        }
        assert_eq!(buf.utilisation(), 100.0);
        assert_eq!(buf.put(entry(3)), PutOutcome::AcceptedWithOverflow);
    }

    #[test]
    fn drain_all_empties_the_buffer() {
        let buf = CircularBuffer::new(10);
        for i in 0..4 {
            buf.put(entry(i));
        }
        let drained = buf.drain_all();
        assert_eq!(drained.len(), 4);
        assert_eq!(buf.size(), 0);
    }
}
