//! DMA ring-buffer consumption engine.
//!
//! Owns the circular DMA region for its lifetime, tracks the hardware write
//! pointer, emits one block address per consumed block, and tells the
//! hardware when space may be reused. The run loop has exactly two wait
//! states — pointer-not-yet-valid and insufficient-data — and both re-check
//! the stop flag before resuming, so `stop()` is observable within one
//! poll/notification interval.
//!
//! The collaborator handle lives behind one exclusive lock shared with
//! whoever opens/closes the device; the lock is taken per call and released
//! before any sleep.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::block::BlockAddr;
use crate::card::{CardOps, CardSelector, DmaRegion};
use crate::error::{AppResult, IngestError};

/// Fixed backoff while the hardware write pointer is not yet valid.
const POINTER_POLL: Duration = Duration::from_millis(5);

/// Ring engine parameters.
#[derive(Debug, Clone)]
pub struct RingConfig {
    /// DMA descriptor to drive.
    pub dma_id: u8,
    /// Region size in bytes; must be a whole number of blocks.
    pub memory_bytes: u64,
    /// Fixed block size in bytes.
    pub block_bytes: u32,
    /// Blocks held back from reclamation so the hardware never overwrites a
    /// dispatched-but-unprocessed block.
    pub margin_blocks: u32,
    /// Minimum available blocks before draining starts.
    pub threshold_blocks: u32,
    /// Wait on the card notification instead of sleeping.
    pub interrupt_mode: bool,
    /// Sleep between pointer polls when not in interrupt mode.
    pub poll_interval: Duration,
    /// NUMA node preference for the region allocation.
    pub numa_node: u8,
    /// Arm the descriptor in wrap-around mode.
    pub wraparound: bool,
}

/// Unread bytes between the read cursor and the hardware write pointer.
///
/// Defined for any `write_ptr` inside `[base, base + total]`; the result is
/// always in `[0, total)`.
#[must_use]
pub fn ring_available(
    write_ptr: u64,
    read_index: u64,
    block_bytes: u64,
    base: u64,
    total: u64,
) -> u64 {
    (write_ptr + total - (read_index * block_bytes + base)) % total
}

fn pointer_valid(ptr: u64, base: u64, total: u64) -> bool {
    // The upper bound is inclusive: a fully-wrapped pointer may sit exactly
    // at the region end.
    ptr >= base && ptr <= base + total
}

/// DMA ring engine over one collaborator card.
pub struct RingEngine<C: CardOps + 'static> {
    card: Arc<Mutex<C>>,
    selector: CardSelector,
    cfg: RingConfig,
    region: Option<DmaRegion>,
    run_marker: Arc<AtomicBool>,
    bytes_consumed: Arc<AtomicU64>,
    worker: Option<thread::JoinHandle<AppResult<u64>>>,
}

impl<C: CardOps + 'static> RingEngine<C> {
    /// Create an engine over a shared card handle.
    ///
    /// The handle is shared so that device open/close performed elsewhere
    /// stays mutually exclusive with the engine's pointer operations.
    pub fn new(card: Arc<Mutex<C>>, selector: CardSelector, cfg: RingConfig) -> AppResult<Self> {
        if cfg.block_bytes == 0 || u64::from(cfg.block_bytes) > cfg.memory_bytes {
            return Err(IngestError::Configuration(format!(
                "block size {} incompatible with ring of {} bytes",
                cfg.block_bytes, cfg.memory_bytes
            )));
        }
        if cfg.memory_bytes % u64::from(cfg.block_bytes) != 0 {
            // The cursor and margin arithmetic silently corrupts otherwise.
            return Err(IngestError::Configuration(format!(
                "ring size {} is not a multiple of the block size {}",
                cfg.memory_bytes, cfg.block_bytes
            )));
        }
        if u64::from(cfg.margin_blocks) >= cfg.memory_bytes / u64::from(cfg.block_bytes) {
            return Err(IngestError::Configuration(format!(
                "margin of {} blocks swallows the whole ring",
                cfg.margin_blocks
            )));
        }
        Ok(Self {
            card,
            selector,
            cfg,
            region: None,
            run_marker: Arc::new(AtomicBool::new(false)),
            bytes_consumed: Arc::new(AtomicU64::new(0)),
            worker: None,
        })
    }

    /// Open the card, allocate the region and force-stop any running DMA.
    pub fn configure(&mut self) -> AppResult<()> {
        let mut card = self.lock_card()?;
        card.open(self.selector)?;
        debug!(card = %self.selector, "card opened");
        let region = card.allocate_region(self.cfg.memory_bytes, self.cfg.numa_node)?;
        debug!(card = %self.selector, bytes = region.bytes, "DMA region allocated");
        card.disarm_dma(self.cfg.dma_id)?;
        drop(card);
        self.region = Some(region);
        info!(card = %self.selector, "configured for datataking");
        Ok(())
    }

    /// The allocated region, once configured.
    #[must_use]
    pub fn region(&self) -> Option<DmaRegion> {
        self.region
    }

    /// Total bytes handed to the block handler so far.
    #[must_use]
    pub fn bytes_consumed(&self) -> u64 {
        self.bytes_consumed.load(Ordering::Acquire)
    }

    /// Arm DMA and spawn the ring worker, feeding every block address to
    /// `handler` in cursor order.
    pub fn start<F>(&mut self, handler: F) -> AppResult<()>
    where
        F: FnMut(BlockAddr) + Send + 'static,
    {
        let Some(region) = self.region else {
            return Err(IngestError::Configuration(
                "engine started before configure".into(),
            ));
        };
        if self.run_marker.swap(true, Ordering::AcqRel) {
            warn!(card = %self.selector, "ring engine already running");
            return Ok(());
        }

        let armed = self.lock_card().and_then(|mut card| {
            card.arm_dma(
                self.cfg.dma_id,
                region.physical_base,
                region.bytes,
                self.cfg.wraparound,
            )
            .map_err(IngestError::from)
        });
        if let Err(e) = armed {
            self.run_marker.store(false, Ordering::Release);
            return Err(e);
        }

        let card = Arc::clone(&self.card);
        let cfg = self.cfg.clone();
        let run = Arc::clone(&self.run_marker);
        let consumed = Arc::clone(&self.bytes_consumed);
        let worker = thread::Builder::new()
            .name(format!("ring-{}", self.cfg.dma_id))
            .spawn(move || run_loop(&card, &cfg, region, &run, &consumed, handler))
            .map_err(IngestError::Io)?;
        self.worker = Some(worker);
        info!(card = %self.selector, dma_id = self.cfg.dma_id, "ring engine started");
        Ok(())
    }

    /// Cooperative stop: flip the stop flag, join the worker, disarm DMA.
    ///
    /// Idempotent. Returns the bytes consumed by the worker, or the terminal
    /// error the run loop exited with.
    pub fn stop(&mut self) -> AppResult<u64> {
        self.run_marker.store(false, Ordering::Release);
        let Some(worker) = self.worker.take() else {
            return Ok(0);
        };
        let result = worker
            .join()
            .map_err(|_| IngestError::WorkerLost("ring"))?;
        let mut card = self.lock_card()?;
        card.disarm_dma(self.cfg.dma_id)?;
        drop(card);
        match &result {
            Ok(bytes) => info!(card = %self.selector, bytes, "ring engine stopped"),
            Err(e) => warn!(card = %self.selector, error = %e, "ring engine stopped on error"),
        }
        result
    }

    /// Close the card. Call after [`RingEngine::stop`].
    pub fn close(&mut self) -> AppResult<()> {
        let mut card = self.lock_card()?;
        card.close()?;
        Ok(())
    }

    fn lock_card(&self) -> AppResult<std::sync::MutexGuard<'_, C>> {
        self.card.lock().map_err(|_| IngestError::Poisoned("card"))
    }
}

/// Read the pointer under the card lock, held only for the call.
fn read_pointer<C: CardOps>(card: &Mutex<C>, dma_id: u8) -> AppResult<u64> {
    let mut card = card.lock().map_err(|_| IngestError::Poisoned("card"))?;
    Ok(card.read_write_pointer(dma_id)?)
}

fn run_loop<C, F>(
    card: &Mutex<C>,
    cfg: &RingConfig,
    region: DmaRegion,
    run: &AtomicBool,
    consumed_total: &AtomicU64,
    mut handler: F,
) -> AppResult<u64>
where
    C: CardOps,
    F: FnMut(BlockAddr),
{
    debug!("ring worker starts processing blocks");
    let base = region.physical_base;
    let total = region.bytes;
    let block = u64::from(cfg.block_bytes);
    let nblocks = total / block;
    let threshold = u64::from(cfg.threshold_blocks) * block;

    // The descriptor starts at the region base; the pointer-validity poll
    // below covers hardware that has not initialized it yet.
    let mut current_addr = base;
    let mut read_index: u64 = 0;
    let mut consumed: u64 = 0;

    'outer: while run.load(Ordering::Acquire) {
        // Wait state 1: poll until the write pointer makes sense.
        while !pointer_valid(current_addr, base, total) {
            if !run.load(Ordering::Acquire) {
                debug!("stop issued during pointer poll");
                return Ok(consumed);
            }
            current_addr = read_pointer(card, cfg.dma_id)?;
            thread::sleep(POINTER_POLL);
        }

        // Wait state 2: notification or poll until enough data arrived.
        while ring_available(current_addr, read_index, block, base, total) < threshold {
            if !run.load(Ordering::Acquire) {
                debug!("stop issued while waiting for data");
                return Ok(consumed);
            }
            if cfg.interrupt_mode {
                let mut card = card.lock().map_err(|_| IngestError::Poisoned("card"))?;
                card.wait_for_notification(cfg.dma_id)?;
            } else {
                thread::sleep(cfg.poll_interval);
            }
            current_addr = read_pointer(card, cfg.dma_id)?;
            if !pointer_valid(current_addr, base, total) {
                continue 'outer;
            }
        }

        // Drain: emit one address per block up to the observed pointer. A
        // pointer at the inclusive region end is a whole wrap, index 0.
        let write_index = ((current_addr - base) / block) % nblocks;
        while read_index != write_index {
            handler(BlockAddr(
                region.virtual_base + (read_index * block) as usize,
            ));
            read_index = (read_index + 1) % nblocks;
            consumed += block;
            consumed_total.fetch_add(block, Ordering::AcqRel);
        }

        // Reclaim everything up to the margin behind the write pointer.
        let margin = u64::from(cfg.margin_blocks) * block;
        let offset = write_index * block;
        let destination = if offset >= margin {
            base + offset - margin
        } else {
            base + offset + total - margin
        };
        let mut card = card.lock().map_err(|_| IngestError::Poisoned("card"))?;
        card.advance_read_pointer(cfg.dma_id, destination)?;
    }
    debug!("ring worker finished");
    Ok(consumed)
}
