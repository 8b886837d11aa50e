//! Hardware collaborator capability surface.
//!
//! The readout core never talks to a device directly; everything it needs
//! from the acquisition card is expressed by [`CardOps`]: open/close the
//! device, allocate the DMA region, arm/disarm a DMA descriptor, read the
//! hardware write pointer, advance the read pointer, and (optionally) block
//! on the data-available notification.
//!
//! Production implementations wrap a vendor register file; [`the
//! emulator`](crate::emulator::EmulatorCard) backs the same surface with an
//! in-process memory mapping for tests and demos.

use crate::error::CardError;

/// Result alias for collaborator calls.
pub type CardResult<T> = std::result::Result<T, CardError>;

/// Identifies one device endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CardSelector {
    /// Device index on the host.
    pub device_id: u32,
    /// Logical unit within the device.
    pub logical_unit: u32,
}

impl std::fmt::Display for CardSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[id:{} slr:{}]", self.device_id, self.logical_unit)
    }
}

/// A DMA-capable memory region as seen by both sides.
///
/// The hardware writes through `physical_base`; the readout reads through
/// `virtual_base`. Both address the same `bytes`-long allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaRegion {
    /// Bus address programmed into the DMA descriptor.
    pub physical_base: u64,
    /// Process-local mapping of the same memory.
    pub virtual_base: usize,
    /// Region size in bytes.
    pub bytes: u64,
}

/// Capability set the readout core consumes.
///
/// All calls are serialized by the caller behind one exclusive lock (see the
/// concurrency contract in `ring`): implementations may assume no two
/// methods run concurrently.
pub trait CardOps: Send {
    /// Open the device endpoint.
    fn open(&mut self, selector: CardSelector) -> CardResult<()>;

    /// Close the device endpoint. Idempotent.
    fn close(&mut self) -> CardResult<()>;

    /// Allocate a DMA-capable region of `bytes`, preferring `numa_node`.
    fn allocate_region(&mut self, bytes: u64, numa_node: u8) -> CardResult<DmaRegion>;

    /// Point DMA descriptor `dma_id` at the region and start transfers.
    fn arm_dma(
        &mut self,
        dma_id: u8,
        physical_base: u64,
        bytes: u64,
        wraparound: bool,
    ) -> CardResult<()>;

    /// Stop transfers on descriptor `dma_id`.
    fn disarm_dma(&mut self, dma_id: u8) -> CardResult<()>;

    /// Current hardware write pointer of descriptor `dma_id`.
    ///
    /// The value is only meaningful once it falls inside the armed region;
    /// callers poll until it does.
    fn read_write_pointer(&mut self, dma_id: u8) -> CardResult<u64>;

    /// Tell the hardware that everything below `addr` may be overwritten.
    fn advance_read_pointer(&mut self, dma_id: u8, addr: u64) -> CardResult<()>;

    /// Block until the device signals data available on `dma_id`.
    ///
    /// Interrupt-equivalent; spurious wakeups are allowed, callers re-check
    /// availability. Only used when [`CardOps::supports_notification`] is
    /// true, otherwise the engine paces itself by polling.
    fn wait_for_notification(&mut self, dma_id: u8) -> CardResult<()>;

    /// Whether [`CardOps::wait_for_notification`] is implemented.
    fn supports_notification(&self) -> bool {
        false
    }
}
