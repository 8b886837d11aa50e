#![allow(unsafe_code)]
//! Per-channel block handlers.
//!
//! One handler exists per enabled channel. The router enqueues block
//! addresses into the handler's bounded inbound queue without blocking; a
//! dedicated worker drains the queue in order, runs the frame decoder over
//! each block's lanes, and pushes completed chunks into the channel's sink.
//! Integrity failures are counted and the stream continues.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_queue::ArrayQueue;
use tracing::{debug, warn};

use crate::block::{BlockAddr, BlockView};
use crate::checksum::Polynomial;
use crate::frame::decoder::FrameDecoder;
use crate::frame::FrameEvent;
use crate::sink::{ChunkSink, OverflowPolicy};

/// Backoff when the inbound queue is empty; channel workers suspend only
/// here.
const EMPTY_QUEUE_BACKOFF: Duration = Duration::from_micros(100);

/// Counter snapshot for one channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    /// Blocks taken off the inbound queue.
    pub blocks_processed: u64,
    /// Chunks delivered to the sink with a matching checksum.
    pub chunks_completed: u64,
    /// Chunks discarded (or forwarded invalid) on checksum mismatch.
    pub checksum_errors: u64,
    /// Framing violations observed.
    pub malformed: u64,
    /// Block addresses rejected because the inbound queue was full or
    /// closed.
    pub inbound_dropped: u64,
    /// Chunks shed by the sink's overflow policy.
    pub sink_dropped: u64,
    /// Chunks currently waiting in the sink.
    pub sink_depth: usize,
}

/// A registered per-channel consumer of block addresses.
///
/// The router holds handlers behind this interface; the parser/queue pair
/// below is the one concrete implementation in the core.
pub trait ChannelHandler: Send + Sync {
    /// Channel id this handler is registered for.
    fn channel_id(&self) -> u16;

    /// Spawn the handler's worker. Idempotent.
    fn start(&self);

    /// Close the inbound queue, discard in-flight work, join the worker.
    /// Idempotent.
    fn stop(&self);

    /// Offer a block address; `false` means full or closed, and the block is
    /// the caller's to account for.
    fn enqueue_block(&self, addr: BlockAddr) -> bool;

    /// Current counters.
    fn stats(&self) -> ChannelStats;
}

/// Configuration for one parser channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Channel id the handler answers to.
    pub id: u16,
    /// Block size of the ring the addresses point into.
    pub block_bytes: usize,
    /// Capacity of the inbound block-address queue.
    pub queue_capacity: usize,
    /// Capacity of the chunk sink.
    pub sink_capacity: usize,
    /// Sink overflow policy.
    pub overflow_policy: OverflowPolicy,
    /// Deliver checksum-failed chunks (marked invalid) instead of only
    /// counting them.
    pub forward_invalid: bool,
    /// Checksum polynomial the front end uses on this stream.
    pub polynomial: Polynomial,
}

struct ChannelShared {
    id: u16,
    block_bytes: usize,
    forward_invalid: bool,
    inbound: ArrayQueue<BlockAddr>,
    decoder: Mutex<FrameDecoder>,
    sink: Arc<ChunkSink>,
    accepting: AtomicBool,
    running: AtomicBool,
    blocks_processed: AtomicU64,
    chunks_completed: AtomicU64,
    checksum_errors: AtomicU64,
    malformed: AtomicU64,
    inbound_dropped: AtomicU64,
}

impl ChannelShared {
    fn process_block(&self, addr: BlockAddr) {
        // SAFETY: the address came from the ring engine, which holds back
        // `margin_blocks` from reclamation; the block stays valid until well
        // after this handler is done with it.
        let view = unsafe { BlockView::from_addr(addr, self.block_bytes) };
        let Some(view) = view else {
            self.malformed.fetch_add(1, Ordering::AcqRel);
            return;
        };
        self.blocks_processed.fetch_add(1, Ordering::AcqRel);

        let Ok(mut decoder) = self.decoder.lock() else {
            return;
        };
        decoder.begin_block();
        for lane in view.lanes() {
            match decoder.feed(lane) {
                FrameEvent::ChunkComplete(chunk) => {
                    self.chunks_completed.fetch_add(1, Ordering::AcqRel);
                    self.sink.push(chunk);
                }
                FrameEvent::ChecksumError(chunk) => {
                    self.checksum_errors.fetch_add(1, Ordering::AcqRel);
                    if self.forward_invalid {
                        self.sink.push(chunk);
                    }
                }
                FrameEvent::Malformed => {
                    self.malformed.fetch_add(1, Ordering::AcqRel);
                }
                FrameEvent::Idle | FrameEvent::HeaderOpen | FrameEvent::PayloadWord => {}
            }
        }
    }
}

/// Parser/queue pair: the concrete [`ChannelHandler`] of the core.
pub struct ParserChannel {
    shared: Arc<ChannelShared>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ParserChannel {
    /// Build a handler from its configuration.
    #[must_use]
    pub fn new(cfg: &ChannelConfig) -> Self {
        Self {
            shared: Arc::new(ChannelShared {
                id: cfg.id,
                block_bytes: cfg.block_bytes,
                forward_invalid: cfg.forward_invalid,
                inbound: ArrayQueue::new(cfg.queue_capacity),
                decoder: Mutex::new(FrameDecoder::new(cfg.id, cfg.polynomial)),
                sink: Arc::new(ChunkSink::new(cfg.sink_capacity, cfg.overflow_policy)),
                accepting: AtomicBool::new(true),
                running: AtomicBool::new(false),
                blocks_processed: AtomicU64::new(0),
                chunks_completed: AtomicU64::new(0),
                checksum_errors: AtomicU64::new(0),
                malformed: AtomicU64::new(0),
                inbound_dropped: AtomicU64::new(0),
            }),
            worker: Mutex::new(None),
        }
    }

    /// The channel's sink, for the downstream consumer.
    #[must_use]
    pub fn sink(&self) -> Arc<ChunkSink> {
        Arc::clone(&self.shared.sink)
    }
}

impl ChannelHandler for ParserChannel {
    fn channel_id(&self) -> u16 {
        self.shared.id
    }

    fn start(&self) {
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.accepting.store(true, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(format!("elink-{}", self.shared.id))
            .spawn(move || {
                debug!(channel = shared.id, "channel worker started");
                while shared.running.load(Ordering::Acquire) {
                    match shared.inbound.pop() {
                        Some(addr) => shared.process_block(addr),
                        None => thread::sleep(EMPTY_QUEUE_BACKOFF),
                    }
                }
                debug!(channel = shared.id, "channel worker finished");
            });
        match handle {
            Ok(handle) => {
                if let Ok(mut slot) = self.worker.lock() {
                    *slot = Some(handle);
                }
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::Release);
                warn!(channel = self.shared.id, error = %e, "failed to spawn channel worker");
            }
        }
    }

    fn stop(&self) {
        // Close the inbound queue first so dispatch starts reporting drops,
        // then let the worker wind down.
        self.shared.accepting.store(false, Ordering::Release);
        self.shared.running.store(false, Ordering::Release);
        if let Ok(mut slot) = self.worker.lock() {
            if let Some(handle) = slot.take() {
                if handle.join().is_err() {
                    warn!(channel = self.shared.id, "channel worker panicked");
                }
            }
        }
        // Discard anything still queued and any half-assembled chunk.
        while self.shared.inbound.pop().is_some() {}
        if let Ok(mut decoder) = self.shared.decoder.lock() {
            decoder.reset();
        }
    }

    fn enqueue_block(&self, addr: BlockAddr) -> bool {
        if !self.shared.accepting.load(Ordering::Acquire)
            || self.shared.inbound.push(addr).is_err()
        {
            self.shared.inbound_dropped.fetch_add(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    fn stats(&self) -> ChannelStats {
        ChannelStats {
            blocks_processed: self.shared.blocks_processed.load(Ordering::Acquire),
            chunks_completed: self.shared.chunks_completed.load(Ordering::Acquire),
            checksum_errors: self.shared.checksum_errors.load(Ordering::Acquire),
            malformed: self.shared.malformed.load(Ordering::Acquire),
            inbound_dropped: self.shared.inbound_dropped.load(Ordering::Acquire),
            sink_dropped: self.shared.sink.dropped(),
            sink_depth: self.shared.sink.len(),
        }
    }
}

impl Drop for ParserChannel {
    fn drop(&mut self) {
        self.stop();
    }
}
