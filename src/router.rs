#![allow(unsafe_code)]
//! Channel router.
//!
//! Maps each incoming block to the handler registered for its channel id.
//! Dispatch is O(1) and never blocks: the handler table is append-only and
//! populated at configuration time, so the hot path takes no lock, and a
//! full channel queue is the channel's problem, not the ring's.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::warn;

use crate::block::{peek_channel_id, BlockAddr};
use crate::channel::ChannelHandler;

/// Why a block was not delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// No handler registered for the block's channel id.
    UnknownChannel,
    /// The channel's inbound queue rejected the block.
    QueueFull,
}

/// Outcome of one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The block address was queued on the channel.
    Queued,
    /// The block was dropped and counted.
    Dropped(DropReason),
}

/// Router counter snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    /// Blocks delivered to a channel queue.
    pub dispatched: u64,
    /// Blocks dropped for an unregistered channel id.
    pub unknown_dropped: u64,
    /// Blocks dropped because a channel queue was full.
    pub full_dropped: u64,
}

/// Dispatches block addresses to per-channel handlers.
pub struct BlockRouter {
    handlers: HashMap<u16, Arc<dyn ChannelHandler>>,
    dispatched: AtomicU64,
    unknown_dropped: AtomicU64,
    full_dropped: AtomicU64,
}

impl Default for BlockRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockRouter {
    /// Create an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            dispatched: AtomicU64::new(0),
            unknown_dropped: AtomicU64::new(0),
            full_dropped: AtomicU64::new(0),
        }
    }

    /// Register a handler for its channel id.
    ///
    /// Configuration-time only; the table is never mutated once dispatch
    /// starts, which is what makes the lock-free lookup sound. A duplicate
    /// id replaces the previous handler with a warning.
    pub fn register(&mut self, handler: Arc<dyn ChannelHandler>) {
        let id = handler.channel_id();
        if self.handlers.insert(id, handler).is_some() {
            warn!(channel = id, "replaced existing handler registration");
        }
    }

    /// Registered channel ids.
    #[must_use]
    pub fn channel_ids(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self.handlers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Handler registered for `id`, if any.
    #[must_use]
    pub fn handler(&self, id: u16) -> Option<&Arc<dyn ChannelHandler>> {
        self.handlers.get(&id)
    }

    /// Route one block address by its embedded channel id.
    pub fn dispatch(&self, addr: BlockAddr) -> DispatchOutcome {
        // SAFETY: addresses come from the ring engine and point at whole
        // blocks, which always carry a header.
        let channel_id = unsafe { peek_channel_id(addr) };
        let Some(handler) = self.handlers.get(&channel_id) else {
            self.unknown_dropped.fetch_add(1, Ordering::AcqRel);
            return DispatchOutcome::Dropped(DropReason::UnknownChannel);
        };
        if handler.enqueue_block(addr) {
            self.dispatched.fetch_add(1, Ordering::AcqRel);
            DispatchOutcome::Queued
        } else {
            self.full_dropped.fetch_add(1, Ordering::AcqRel);
            DispatchOutcome::Dropped(DropReason::QueueFull)
        }
    }

    /// Start every registered handler.
    pub fn start_all(&self) {
        for handler in self.handlers.values() {
            handler.start();
        }
    }

    /// Stop every registered handler.
    pub fn stop_all(&self) {
        for handler in self.handlers.values() {
            handler.stop();
        }
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            dispatched: self.dispatched.load(Ordering::Acquire),
            unknown_dropped: self.unknown_dropped.load(Ordering::Acquire),
            full_dropped: self.full_dropped.load(Ordering::Acquire),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::build_block;
    use crate::channel::{ChannelConfig, ParserChannel};
    use crate::checksum::Polynomial;
    use crate::sink::OverflowPolicy;

    fn channel(id: u16, queue_capacity: usize) -> Arc<ParserChannel> {
        Arc::new(ParserChannel::new(&ChannelConfig {
            id,
            block_bytes: 256,
            queue_capacity,
            sink_capacity: 16,
            overflow_policy: OverflowPolicy::DropNewest,
            forward_invalid: false,
            polynomial: Polynomial::Current,
        }))
    }

    #[test]
    fn test_dispatch_routes_by_embedded_channel_id() {
        let mut router = BlockRouter::new();
        let ch5 = channel(5, 8);
        router.register(ch5.clone());

        let block = build_block(5, 0, &[], 256);
        let outcome = router.dispatch(BlockAddr(block.as_ptr() as usize));
        assert_eq!(outcome, DispatchOutcome::Queued);
        assert_eq!(router.stats().dispatched, 1);
    }

    #[test]
    fn test_unknown_channel_dropped_and_counted() {
        let mut router = BlockRouter::new();
        router.register(channel(1, 8));

        let block = build_block(9, 0, &[], 256);
        let outcome = router.dispatch(BlockAddr(block.as_ptr() as usize));
        assert_eq!(outcome, DispatchOutcome::Dropped(DropReason::UnknownChannel));
        assert_eq!(router.stats().unknown_dropped, 1);
        assert_eq!(router.stats().dispatched, 0);
    }

    #[test]
    fn test_full_queue_reported_as_queue_full() {
        let mut router = BlockRouter::new();
        // Worker never started, capacity 1: the second dispatch must shed.
        router.register(channel(2, 1));

        let block = build_block(2, 0, &[], 256);
        let addr = BlockAddr(block.as_ptr() as usize);
        assert_eq!(router.dispatch(addr), DispatchOutcome::Queued);
        assert_eq!(
            router.dispatch(addr),
            DispatchOutcome::Dropped(DropReason::QueueFull)
        );
        assert_eq!(router.stats().full_dropped, 1);
    }
}
