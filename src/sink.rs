//! Bounded per-channel chunk sink.
//!
//! Single producer (the channel's parser worker), single consumer (the
//! downstream forwarder). Capacity is fixed at configuration time and the
//! overflow policy is explicit: the producer never blocks, it sheds.

use crossbeam_queue::ArrayQueue;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::frame::Chunk;

/// What to shed when the sink is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Displace the oldest queued chunk to make room for the new one.
    DropOldest,
    /// Reject the new chunk and keep the queue as is.
    #[default]
    DropNewest,
}

/// Bounded SPSC queue of chunks with shedding overflow behavior.
pub struct ChunkSink {
    queue: ArrayQueue<Chunk>,
    policy: OverflowPolicy,
    pushed: AtomicU64,
    dropped: AtomicU64,
}

impl ChunkSink {
    /// Create a sink with the given capacity and overflow policy.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero (rejected earlier by config validation).
    #[must_use]
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
            policy,
            pushed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Offer a chunk; returns whether it was stored.
    ///
    /// Under `DropOldest` the chunk is always stored (possibly displacing the
    /// oldest queued one); under `DropNewest` a full queue rejects it. Either
    /// way the drop counter advances by one per shed chunk.
    pub fn push(&self, chunk: Chunk) -> bool {
        match self.policy {
            OverflowPolicy::DropOldest => {
                if self.queue.force_push(chunk).is_some() {
                    self.dropped.fetch_add(1, Ordering::AcqRel);
                }
                self.pushed.fetch_add(1, Ordering::AcqRel);
                true
            }
            OverflowPolicy::DropNewest => {
                if self.queue.push(chunk).is_ok() {
                    self.pushed.fetch_add(1, Ordering::AcqRel);
                    true
                } else {
                    self.dropped.fetch_add(1, Ordering::AcqRel);
                    false
                }
            }
        }
    }

    /// Take the oldest queued chunk.
    #[must_use]
    pub fn pop(&self) -> Option<Chunk> {
        self.queue.pop()
    }

    /// Chunks currently queued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Configured capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Chunks stored since creation.
    #[must_use]
    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Acquire)
    }

    /// Chunks shed since creation; monotonically increasing.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn chunk(seq: u8) -> Chunk {
        Chunk {
            channel_id: 0,
            stream_tag: 0xAA,
            seq,
            payload: Bytes::from_static(&[1, 2, 3, 4]),
            subchunk_lengths: vec![4],
            checksum: 0,
            valid: true,
        }
    }

    #[test]
    fn test_drop_newest_rejects_on_full() {
        let sink = ChunkSink::new(2, OverflowPolicy::DropNewest);
        assert!(sink.push(chunk(0)));
        assert!(sink.push(chunk(1)));
        assert!(!sink.push(chunk(2)));
        assert_eq!(sink.dropped(), 1);
        // The queued chunks are the two oldest.
        assert_eq!(sink.pop().map(|c| c.seq), Some(0));
        assert_eq!(sink.pop().map(|c| c.seq), Some(1));
        assert!(sink.pop().is_none());
    }

    #[test]
    fn test_drop_oldest_displaces_on_full() {
        let sink = ChunkSink::new(2, OverflowPolicy::DropOldest);
        assert!(sink.push(chunk(0)));
        assert!(sink.push(chunk(1)));
        assert!(sink.push(chunk(2)));
        assert_eq!(sink.dropped(), 1);
        // Chunk 0 was displaced; 1 and 2 remain in order.
        assert_eq!(sink.pop().map(|c| c.seq), Some(1));
        assert_eq!(sink.pop().map(|c| c.seq), Some(2));
    }

    #[test]
    fn test_counters_are_monotonic() {
        let sink = ChunkSink::new(1, OverflowPolicy::DropNewest);
        for i in 0..5 {
            sink.push(chunk(i));
        }
        assert_eq!(sink.pushed(), 1);
        assert_eq!(sink.dropped(), 4);
    }
}
