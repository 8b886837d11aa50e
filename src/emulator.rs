#![allow(unsafe_code)]
//! Emulated acquisition card.
//!
//! Implements [`CardOps`] over an anonymous memory mapping so the full
//! pipeline can run without hardware: tests and the demo binary load
//! generated blocks into the "DMA" region and publish write-pointer progress
//! block by block, including wrap-around.
//!
//! The emulated pointer is reported as invalid (zero) until the first
//! publish, which exercises the ring engine's pointer-validity poll exactly
//! like a front end that has not yet initialized its descriptor.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use memmap2::MmapMut;
use tracing::debug;

use crate::card::{CardOps, CardResult, CardSelector, DmaRegion};
use crate::error::{CardError, CardErrorKind};

/// Pointer progress shared with [`EmulatorHandle`] clones.
struct EmuShared {
    /// Monotonic count of bytes made visible to the reader.
    published: AtomicU64,
    /// False until the first publish; pointer reads report zero before that.
    powered: AtomicBool,
    /// Fault injection: fail the next pointer reads.
    fail_pointer_reads: AtomicBool,
    /// Wakes notification waiters on publish.
    publish_seq: Mutex<u64>,
    publish_cv: Condvar,
}

/// Handle for driving pointer progress without holding the card lock.
#[derive(Clone)]
pub struct EmulatorHandle {
    shared: Arc<EmuShared>,
}

impl EmulatorHandle {
    /// Make `bytes` more data visible to the reader and wake any
    /// notification waiter.
    pub fn publish(&self, bytes: u64) {
        self.shared.powered.store(true, Ordering::Release);
        self.shared.published.fetch_add(bytes, Ordering::AcqRel);
        if let Ok(mut seq) = self.shared.publish_seq.lock() {
            *seq += 1;
            self.shared.publish_cv.notify_all();
        }
    }

    /// Total bytes published so far.
    #[must_use]
    pub fn published(&self) -> u64 {
        self.shared.published.load(Ordering::Acquire)
    }

    /// Make every subsequent pointer read fail with a hardware error.
    pub fn inject_pointer_failure(&self) {
        self.shared.fail_pointer_reads.store(true, Ordering::Release);
    }
}

/// In-process stand-in for the acquisition card.
pub struct EmulatorCard {
    label: String,
    opened: Option<CardSelector>,
    map: Option<MmapMut>,
    region: Option<DmaRegion>,
    armed: Option<u8>,
    /// Next load offset into the region, wrapping.
    load_offset: u64,
    shared: Arc<EmuShared>,
}

impl Default for EmulatorCard {
    fn default() -> Self {
        Self::new()
    }
}

impl EmulatorCard {
    /// Create a closed, empty emulator.
    #[must_use]
    pub fn new() -> Self {
        Self {
            label: "emu[closed]".to_string(),
            opened: None,
            map: None,
            region: None,
            armed: None,
            load_offset: 0,
            shared: Arc::new(EmuShared {
                published: AtomicU64::new(0),
                powered: AtomicBool::new(false),
                fail_pointer_reads: AtomicBool::new(false),
                publish_seq: Mutex::new(0),
                publish_cv: Condvar::new(),
            }),
        }
    }

    /// A handle for publishing pointer progress from another thread.
    #[must_use]
    pub fn handle(&self) -> EmulatorHandle {
        EmulatorHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// The armed region, once allocated.
    #[must_use]
    pub fn region(&self) -> Option<DmaRegion> {
        self.region
    }

    fn err(&self, kind: CardErrorKind, op: &'static str, message: &str) -> CardError {
        CardError::new(&self.label, kind, op, message)
    }

    /// Copy pre-built blocks into the region at the current load offset,
    /// wrapping at the region end. Loading does not publish; pair with
    /// [`EmulatorHandle::publish`] (or [`EmulatorCard::publish`]) to make the
    /// data visible.
    pub fn load_blocks(&mut self, blocks: &[Vec<u8>]) -> CardResult<()> {
        let total = match self.region {
            Some(r) => r.bytes,
            None => {
                return Err(self.err(
                    CardErrorKind::Allocation,
                    "load_blocks",
                    "no region allocated",
                ))
            }
        };
        let Some(map) = self.map.as_mut() else {
            return Err(CardError::new(
                &self.label,
                CardErrorKind::Allocation,
                "load_blocks",
                "no region allocated",
            ));
        };
        for block in blocks {
            let at = (self.load_offset % total) as usize;
            debug_assert!(at + block.len() <= map.len(), "block crosses region end");
            map[at..at + block.len()].copy_from_slice(block);
            self.load_offset += block.len() as u64;
        }
        Ok(())
    }

    /// Publish `bytes` of already-loaded data (see [`EmulatorHandle::publish`]).
    pub fn publish(&self, bytes: u64) {
        self.handle().publish(bytes);
    }

    fn pointer(&self) -> u64 {
        if !self.shared.powered.load(Ordering::Acquire) {
            // The front end has not initialized its descriptor yet.
            return 0;
        }
        match self.region {
            Some(r) => r.physical_base + (self.shared.published.load(Ordering::Acquire) % r.bytes),
            None => 0,
        }
    }
}

impl CardOps for EmulatorCard {
    fn open(&mut self, selector: CardSelector) -> CardResult<()> {
        if self.opened.is_some() {
            return Err(self.err(CardErrorKind::Device, "open", "already open"));
        }
        self.label = format!("emu{}", selector);
        self.opened = Some(selector);
        debug!(card = %self.label, "emulator opened");
        Ok(())
    }

    fn close(&mut self) -> CardResult<()> {
        self.opened = None;
        self.armed = None;
        debug!(card = %self.label, "emulator closed");
        Ok(())
    }

    fn allocate_region(&mut self, bytes: u64, numa_node: u8) -> CardResult<DmaRegion> {
        if self.opened.is_none() {
            return Err(self.err(CardErrorKind::Allocation, "allocate_region", "not open"));
        }
        let map = MmapMut::map_anon(bytes as usize).map_err(|e| {
            CardError::new(
                &self.label,
                CardErrorKind::Allocation,
                "allocate_region",
                e.to_string(),
            )
        })?;
        let base = map.as_ptr() as usize;
        // The emulator has no bus translation; both sides address the map.
        let region = DmaRegion {
            physical_base: base as u64,
            virtual_base: base,
            bytes,
        };
        debug!(card = %self.label, bytes, numa_node, "emulator region mapped");
        self.map = Some(map);
        self.region = Some(region);
        self.load_offset = 0;
        Ok(region)
    }

    fn arm_dma(
        &mut self,
        dma_id: u8,
        physical_base: u64,
        bytes: u64,
        _wraparound: bool,
    ) -> CardResult<()> {
        let Some(region) = self.region else {
            return Err(self.err(CardErrorKind::Dma, "arm_dma", "no region allocated"));
        };
        if physical_base != region.physical_base || bytes != region.bytes {
            return Err(self.err(CardErrorKind::Dma, "arm_dma", "descriptor/region mismatch"));
        }
        self.armed = Some(dma_id);
        debug!(card = %self.label, dma_id, "emulator DMA armed");
        Ok(())
    }

    fn disarm_dma(&mut self, dma_id: u8) -> CardResult<()> {
        if self.armed == Some(dma_id) {
            self.armed = None;
            debug!(card = %self.label, dma_id, "emulator DMA disarmed");
        }
        Ok(())
    }

    fn read_write_pointer(&mut self, _dma_id: u8) -> CardResult<u64> {
        if self.shared.fail_pointer_reads.load(Ordering::Acquire) {
            return Err(self.err(
                CardErrorKind::Pointer,
                "read_write_pointer",
                "register file unavailable",
            ));
        }
        Ok(self.pointer())
    }

    fn advance_read_pointer(&mut self, _dma_id: u8, addr: u64) -> CardResult<()> {
        // Space below `addr` may be reused; the emulator only sanity-checks
        // that the address lands inside the region.
        if let Some(r) = self.region {
            if addr < r.physical_base || addr >= r.physical_base + r.bytes {
                return Err(self.err(
                    CardErrorKind::Pointer,
                    "advance_read_pointer",
                    "address outside region",
                ));
            }
        }
        Ok(())
    }

    fn wait_for_notification(&mut self, _dma_id: u8) -> CardResult<()> {
        let guard = self
            .shared
            .publish_seq
            .lock()
            .map_err(|_| self.err(CardErrorKind::Notification, "wait_for_notification", "poisoned"))?;
        // Bounded wait; a timeout is a spurious wakeup the caller re-checks.
        let _unused = self
            .shared
            .publish_cv
            .wait_timeout(guard, Duration::from_millis(50))
            .map_err(|_| {
                self.err(CardErrorKind::Notification, "wait_for_notification", "poisoned")
            })?;
        Ok(())
    }

    fn supports_notification(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_allocate_arm_lifecycle() {
        let mut card = EmulatorCard::new();
        assert!(card.allocate_region(4096, 0).is_err());

        card.open(CardSelector::default()).unwrap();
        let region = card.allocate_region(4096, 0).unwrap();
        assert_eq!(region.bytes, 4096);
        assert_eq!(region.physical_base as usize, region.virtual_base);

        card.arm_dma(0, region.physical_base, region.bytes, true)
            .unwrap();
        card.disarm_dma(0).unwrap();
        card.close().unwrap();
    }

    #[test]
    fn test_pointer_invalid_until_first_publish() {
        let mut card = EmulatorCard::new();
        card.open(CardSelector::default()).unwrap();
        let region = card.allocate_region(4096, 0).unwrap();

        assert_eq!(card.read_write_pointer(0).unwrap(), 0);
        card.publish(1024);
        assert_eq!(
            card.read_write_pointer(0).unwrap(),
            region.physical_base + 1024
        );
    }

    #[test]
    fn test_pointer_wraps_modulo_region() {
        let mut card = EmulatorCard::new();
        card.open(CardSelector::default()).unwrap();
        let region = card.allocate_region(4096, 0).unwrap();
        card.publish(4096 + 512);
        assert_eq!(
            card.read_write_pointer(0).unwrap(),
            region.physical_base + 512
        );
    }

    #[test]
    fn test_load_blocks_lands_in_region() {
        let mut card = EmulatorCard::new();
        card.open(CardSelector::default()).unwrap();
        let region = card.allocate_region(1024, 0).unwrap();
        card.load_blocks(&[vec![0xAB; 256], vec![0xCD; 256]]).unwrap();

        // SAFETY: the map stays alive inside `card` and nothing else writes.
        let bytes =
            unsafe { std::slice::from_raw_parts(region.virtual_base as *const u8, 512) };
        assert!(bytes[..256].iter().all(|&b| b == 0xAB));
        assert!(bytes[256..].iter().all(|&b| b == 0xCD));
    }

    #[test]
    fn test_injected_pointer_failure() {
        let mut card = EmulatorCard::new();
        card.open(CardSelector::default()).unwrap();
        card.allocate_region(4096, 0).unwrap();
        card.handle().inject_pointer_failure();
        assert!(card.read_write_pointer(0).is_err());
    }
}
