//! Error types for the readout pipeline.
//!
//! The primary error type, [`IngestError`], consolidates the failure modes
//! that can terminate ingest: configuration problems caught at load or
//! validation time and hardware-collaborator failures reported by the card.
//!
//! Per-chunk integrity errors (checksum mismatch, malformed framing) are
//! deliberately *not* represented here. They are stream conditions, recorded
//! in channel counters and recovered from in-line, and never surface as an
//! `IngestError`.

use thiserror::Error;

// =============================================================================
// Card Errors
// =============================================================================

/// Category of a hardware-collaborator failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardErrorKind {
    /// Device open/close failed.
    Device,
    /// DMA region allocation failed.
    Allocation,
    /// Arming or disarming a DMA descriptor failed.
    Dma,
    /// Reading or advancing a DMA pointer failed.
    Pointer,
    /// Waiting on the data-available notification failed.
    Notification,
}

impl std::fmt::Display for CardErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            CardErrorKind::Device => "device",
            CardErrorKind::Allocation => "allocation",
            CardErrorKind::Dma => "dma",
            CardErrorKind::Pointer => "pointer",
            CardErrorKind::Notification => "notification",
        };
        write!(f, "{}", label)
    }
}

/// Structured error reported by the hardware collaborator.
///
/// Any `CardError` observed by the ring engine's run loop is terminal for
/// ingest: the loop exits with it and the caller is responsible for teardown.
#[derive(Error, Debug, Clone)]
#[error("Card '{card}' {kind} error during {op}: {message}")]
pub struct CardError {
    /// Identifier of the card that reported the failure.
    pub card: String,
    /// Failure category.
    pub kind: CardErrorKind,
    /// Operation that was being performed.
    pub op: &'static str,
    /// Collaborator-provided detail.
    pub message: String,
}

impl CardError {
    /// Build a card error for operation `op`.
    pub fn new(
        card: impl Into<String>,
        kind: CardErrorKind,
        op: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            card: card.into(),
            kind,
            op,
            message: message.into(),
        }
    }
}

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, IngestError>;

/// Primary error type for the readout application.
///
/// Errors fall into two broad categories:
///
/// 1. **Configuration errors** - `Config`, `Configuration`: occur during
///    startup; permanent, require fixing the configuration file.
/// 2. **Terminal runtime errors** - `Card`, `Io`: a hardware-collaborator
///    call failed or file I/O broke. The run loop exits and owned regions
///    are left in a releasable state.
#[derive(Error, Debug)]
pub enum IngestError {
    /// Configuration file parsing failed.
    ///
    /// Wraps `config::ConfigError` from the `config` crate: syntax errors,
    /// missing required fields, or type mismatches in the TOML input.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Configuration validation failed.
    ///
    /// The values parsed correctly but are semantically invalid, e.g. a ring
    /// size that is not a whole number of blocks, or a zero queue capacity.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Standard I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The hardware collaborator reported a failure.
    #[error("{0}")]
    Card(#[from] CardError),

    /// A worker thread ended without reporting a result.
    ///
    /// The thread panicked or was torn down without running to completion;
    /// the payload is the worker's name.
    #[error("Worker '{0}' terminated abnormally")]
    WorkerLost(&'static str),

    /// A shared lock was poisoned by a panicking holder.
    #[error("Lock '{0}' poisoned")]
    Poisoned(&'static str),
}
