//! `daq-readout`
//!
//! Readout pipeline for data-acquisition front ends that deliver a
//! continuous byte stream over a memory-mapped DMA ring buffer.
//!
//! ## Data flow
//!
//! ```text
//! hardware write pointer
//!        │
//!        ▼
//! ┌──────────────┐   block addresses   ┌─────────────┐
//! │  RingEngine  ├────────────────────►│ BlockRouter │
//! └──────────────┘  (cursor order)     └──────┬──────┘
//!                                             │ channel id
//!                                             ▼
//!                                   ┌──────────────────┐
//!                                   │  ParserChannel   │ (one per channel)
//!                                   │ FrameDecoder     │
//!                                   │ CRC-20 verify    │
//!                                   └────────┬─────────┘
//!                                            ▼
//!                                       ChunkSink ──► external consumer
//! ```
//!
//! The ring engine paces itself against the hardware write pointer and
//! never stalls on a slow channel: back-pressure is channel-local, with
//! explicit drop counters at every shedding point. Integrity failures
//! (checksum mismatch, malformed framing) are counted per channel and the
//! stream resynchronizes at the next start-of-chunk symbol.
//!
//! The hardware itself sits behind the [`card::CardOps`] capability trait;
//! [`emulator::EmulatorCard`] implements it in-process for tests and demos.

pub mod block;
pub mod card;
pub mod channel;
pub mod checksum;
pub mod config;
pub mod emulator;
pub mod error;
pub mod frame;
pub mod ring;
pub mod router;
pub mod sink;

pub use block::{BlockAddr, BlockView};
pub use card::{CardOps, CardSelector, DmaRegion};
pub use channel::{ChannelConfig, ChannelHandler, ChannelStats, ParserChannel};
pub use checksum::{crc20, Polynomial};
pub use config::Settings;
pub use error::{AppResult, CardError, IngestError};
pub use frame::{decoder::FrameDecoder, Chunk, FrameEvent};
pub use ring::{RingConfig, RingEngine};
pub use router::{BlockRouter, DispatchOutcome, DropReason};
pub use sink::{ChunkSink, OverflowPolicy};
