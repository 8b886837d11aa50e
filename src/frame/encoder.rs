//! Lane-stream generator.
//!
//! Produces the exact inverse of the decoder's wire format, in the shape the
//! front-end emulator consumes: a fixed number of 64-bit slots, two leading
//! IDLEs, then chunks separated by a configurable number of IDLE lanes, with
//! IDLE fill at the tail. Supports the four reference payload patterns,
//! random chunk sizing, busy brackets, and deliberate fault injection
//! (dropped SOP, dropped EOP, corrupted checksum) for negative tests.

use rand::Rng;
use std::io::Write;

use super::{
    encode_header, eop_lane, idle_lane, lane, sop_lane, CHUNK_HEADER_BYTES, DEFAULT_STREAM_TAG,
    TAG_EOB, TAG_SOB, WIDTH_WORD,
};
use crate::checksum::{crc20, Polynomial};
use crate::error::IngestError;

/// Payload fill pattern, by front-end pattern id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pattern {
    /// Pattern 0: incrementing byte counter, restarting at each chunk.
    #[default]
    Counter,
    /// Pattern 1: every word `0xAA55AA55`.
    Alternating,
    /// Pattern 2: all-ones words.
    Ones,
    /// Pattern 3: all-zeros words.
    Zeros,
}

impl Pattern {
    /// Map a front-end pattern id to a pattern.
    #[must_use]
    pub fn from_id(id: u32) -> Option<Self> {
        match id {
            0 => Some(Pattern::Counter),
            1 => Some(Pattern::Alternating),
            2 => Some(Pattern::Ones),
            3 => Some(Pattern::Zeros),
            _ => None,
        }
    }
}

/// Generator parameters.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// Number of 64-bit output slots.
    pub slots: usize,
    /// Chunk size in bytes, including the 8-byte chunk header.
    pub chunk_size: u32,
    /// Payload fill pattern.
    pub pattern: Pattern,
    /// IDLE lanes between consecutive chunks.
    pub idles: u32,
    /// Randomize each chunk's size within `[chunk_size/2, chunk_size]`,
    /// rounded up to a multiple of 4.
    pub random_size: bool,
    /// Checksum polynomial.
    pub poly: Polynomial,
    /// Tag headers with the chunk counter as a stream id instead of the
    /// fixed reference tag.
    pub use_stream_id: bool,
    /// Bracket the first chunk's trailing IDLEs with SOB/EOB.
    pub add_busy: bool,
    /// Drop the SOP of chunk index 2.
    pub omit_one_sop: bool,
    /// Drop the EOP of chunk index 2.
    pub omit_one_eop: bool,
    /// Corrupt the checksum of chunk index 3.
    pub corrupt_one_crc: bool,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            slots: 8192,
            chunk_size: 464,
            pattern: Pattern::Counter,
            idles: 1,
            random_size: false,
            poly: Polynomial::default(),
            use_stream_id: false,
            add_busy: false,
            omit_one_sop: false,
            omit_one_eop: false,
            corrupt_one_crc: false,
        }
    }
}

/// A generated lane stream.
#[derive(Debug, Clone)]
pub struct GeneratedStream {
    /// The 64-bit output slots.
    pub lanes: Vec<u64>,
    /// Chunks actually emitted.
    pub chunk_count: u32,
    /// Whether the expected chunk count fit into the slot budget.
    pub complete: bool,
}

/// Chunks that fit into `slots` output slots: two leading IDLEs, then per
/// chunk one SOP, `chunk_size / 4` data words, one EOP and `idles` IDLEs.
#[must_use]
pub fn expected_chunk_count(slots: usize, chunk_size: u32, idles: u32) -> u32 {
    (slots as u32 - 2) / (1 + chunk_size / 4 + 1 + idles)
}

/// Generate a lane stream.
///
/// Fails only on invalid parameters: chunk sizes must be multiples of 4 and
/// at least the 8-byte chunk header, and the slot budget must cover the two
/// leading IDLEs.
pub fn generate(cfg: &GeneratorConfig) -> Result<GeneratedStream, IngestError> {
    if cfg.chunk_size < CHUNK_HEADER_BYTES || cfg.chunk_size % 4 != 0 {
        return Err(IngestError::Configuration(format!(
            "chunk size {} must be a multiple of 4 and >= {}",
            cfg.chunk_size, CHUNK_HEADER_BYTES
        )));
    }
    if cfg.slots < 2 {
        return Err(IngestError::Configuration(format!(
            "slot count {} too small for the IDLE preamble",
            cfg.slots
        )));
    }

    let mut lanes = vec![0u64; cfg.slots];
    let max_chunks = expected_chunk_count(cfg.slots, cfg.chunk_size, cfg.idles);
    let mut rng = rand::thread_rng();

    let mut index = 0;
    lanes[index] = idle_lane();
    index += 1;
    lanes[index] = idle_lane();
    index += 1;

    let mut chunk_count: u32 = 0;
    let mut complete = true;
    while index < cfg.slots && chunk_count < max_chunks {
        let chunk_size = if cfg.random_size && cfg.chunk_size > 8 {
            // Between half and full requested size, rounded up to words.
            let half = (cfg.chunk_size + 1) / 2;
            let r: f64 = rng.gen();
            let d = 0.5 * f64::from(1 - (cfg.chunk_size & 1));
            ((half + (f64::from(half) * r + d) as u32 + 3) / 4) * 4
        } else {
            cfg.chunk_size
        };

        // Will SOP + data words + EOP fit?
        let next_index = index + (1 + chunk_size as usize / 4 + 1);
        if next_index >= cfg.slots {
            while index < cfg.slots {
                lanes[index] = idle_lane();
                index += 1;
            }
            // The loop should have ended on the chunk counter.
            complete = false;
            continue;
        }

        lanes[index] = sop_lane();
        index += 1;
        if cfg.omit_one_sop && chunk_count == 2 {
            index -= 1;
        }

        let payload_bytes = chunk_size - CHUNK_HEADER_BYTES;
        let stream_tag = if cfg.use_stream_id {
            (chunk_count & 0xFF) as u8
        } else {
            DEFAULT_STREAM_TAG
        };
        lanes[index] = u64::from(encode_header(
            stream_tag,
            payload_bytes,
            (chunk_count & 0xFF) as u8,
        ));
        index += 1;
        lanes[index] = u64::from(WIDTH_WORD);
        index += 1;

        let mut counter: u32 = 0;
        for _ in 0..payload_bytes / 4 {
            let word = match cfg.pattern {
                Pattern::Counter => {
                    ((counter + 3) & 0xFF) << 24
                        | ((counter + 2) & 0xFF) << 16
                        | ((counter + 1) & 0xFF) << 8
                        | (counter & 0xFF)
                }
                Pattern::Alternating => 0xAA55_AA55,
                Pattern::Ones => 0xFFFF_FFFF,
                Pattern::Zeros => 0x0000_0000,
            };
            lanes[index] = u64::from(word);
            index += 1;
            counter += 4;
        }

        // CRC over the header, width and payload words just written.
        let words: Vec<u32> = lanes[index - chunk_size as usize / 4..index]
            .iter()
            .map(|&l| l as u32)
            .collect();
        let mut crc = crc20(&words, cfg.poly);
        if cfg.corrupt_one_crc && chunk_count == 3 {
            crc += 1;
        }
        lanes[index] = eop_lane(crc);
        index += 1;
        if cfg.omit_one_eop && chunk_count == 2 {
            index -= 1;
        }

        if cfg.add_busy && chunk_count == 0 {
            lanes[index] = lane(TAG_SOB, 0);
            index += 1;
        }
        for _ in 0..cfg.idles {
            lanes[index] = idle_lane();
            index += 1;
        }
        if cfg.add_busy && chunk_count == 0 {
            lanes[index] = lane(TAG_EOB, 0);
            index += 1;
        }

        chunk_count += 1;
    }

    while index < cfg.slots {
        lanes[index] = idle_lane();
        index += 1;
    }

    if chunk_count < max_chunks {
        complete = false;
    }

    Ok(GeneratedStream {
        lanes,
        chunk_count,
        complete,
    })
}

/// Write a register-write script reproducing `lanes` on the front end, one
/// address/value/write-enable line group per 64-bit slot.
pub fn write_register_script<W: Write>(out: &mut W, lanes: &[u64]) -> std::io::Result<()> {
    for (addr, lane) in lanes.iter().enumerate() {
        writeln!(out, "FE_EMU_CONFIG_WRADDR=0x{:x}", addr)?;
        writeln!(out, "FE_EMU_CONFIG_WRDATA=0x{:x}", lane)?;
        writeln!(out, "FE_EMU_CONFIG_WE=1")?;
        writeln!(out, "FE_EMU_CONFIG_WE=0")?;
    }
    Ok(())
}
