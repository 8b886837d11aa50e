//! Streaming chunk decoder.
//!
//! One [`FrameDecoder`] exists per channel. Lanes are fed in wire order;
//! every lane produces exactly one [`FrameEvent`]. Integrity failures never
//! stop the stream: the open chunk (if any) is discarded and the machine
//! resynchronizes on the next SOP.

use bytes::BytesMut;

use super::{
    classify, decode_header, Chunk, ChunkHeader, FrameEvent, Lane, MAX_PAYLOAD_BYTES,
};
use crate::checksum::{Crc20, Polynomial};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Between chunks; only SOP opens one.
    Idle,
    /// SOP seen, awaiting the header word.
    Header,
    /// Header seen, awaiting the width word.
    Width,
    /// Consuming declared payload words.
    Payload,
    /// All payload consumed, awaiting EOP.
    Trailer,
}

/// Accumulation state of the chunk currently being reassembled.
struct OpenChunk {
    crc: Crc20,
    header: Option<ChunkHeader>,
    payload: BytesMut,
    words_remaining: u32,
    /// Payload length at the last recorded sub-chunk boundary.
    subchunk_mark: usize,
    subchunk_lengths: Vec<u32>,
}

/// Per-channel frame decoder state machine.
pub struct FrameDecoder {
    channel_id: u16,
    poly: Polynomial,
    state: State,
    open: Option<OpenChunk>,
    busy_lanes: u64,
    stray_words: u64,
}

impl FrameDecoder {
    /// Create a decoder for one channel.
    #[must_use]
    pub fn new(channel_id: u16, poly: Polynomial) -> Self {
        Self {
            channel_id,
            poly,
            state: State::Idle,
            open: None,
            busy_lanes: 0,
            stray_words: 0,
        }
    }

    /// Record a sub-chunk boundary.
    ///
    /// Called by the channel handler at the start of every block, so a chunk
    /// straddling blocks reports one payload range per block it touched.
    pub fn begin_block(&mut self) {
        if let Some(open) = &mut self.open {
            let len = open.payload.len();
            if len > open.subchunk_mark {
                open.subchunk_lengths.push((len - open.subchunk_mark) as u32);
                open.subchunk_mark = len;
            }
        }
    }

    /// Feed one lane and report what happened.
    pub fn feed(&mut self, raw: u64) -> FrameEvent {
        match classify(raw) {
            // Busy brackets are out-of-band flow markers; they never disturb
            // an open chunk.
            Lane::Sob | Lane::Eob => {
                self.busy_lanes += 1;
                FrameEvent::Idle
            }
            Lane::Idle => {
                if self.state == State::Idle {
                    FrameEvent::Idle
                } else {
                    // A comma cannot appear inside a chunk.
                    self.abort();
                    FrameEvent::Malformed
                }
            }
            Lane::Sop => {
                let event = if self.state == State::Idle {
                    FrameEvent::HeaderOpen
                } else {
                    FrameEvent::Malformed
                };
                // Resynchronize on this SOP either way.
                self.open_chunk();
                event
            }
            Lane::Eop { crc } => match self.state {
                // EOP with no open chunk: the SOP was lost upstream.
                State::Idle => FrameEvent::Malformed,
                State::Trailer => self.finish(crc),
                // Fewer payload words arrived than the header declared;
                // defends against corrupted length fields.
                _ => {
                    self.abort();
                    FrameEvent::Malformed
                }
            },
            Lane::Unknown(_) => {
                self.abort();
                FrameEvent::Malformed
            }
            Lane::Data(word) => self.feed_data(word),
        }
    }

    /// Lanes classified as out-of-band busy markers so far.
    #[must_use]
    pub fn busy_lanes(&self) -> u64 {
        self.busy_lanes
    }

    /// Data words observed outside any chunk (lost-SOP debris).
    #[must_use]
    pub fn stray_words(&self) -> u64 {
        self.stray_words
    }

    /// Discard any open chunk and return to the idle state.
    pub fn reset(&mut self) {
        self.abort();
    }

    fn feed_data(&mut self, word: u32) -> FrameEvent {
        let Some(open) = &mut self.open else {
            // Data outside a chunk is skipped, not an error: this is what the
            // stream looks like after a lost SOP until the next one arrives.
            self.stray_words += 1;
            return FrameEvent::Idle;
        };
        match self.state {
            State::Header => {
                let hdr = decode_header(word);
                if hdr.payload_bytes % 4 != 0 || hdr.payload_bytes > MAX_PAYLOAD_BYTES {
                    self.abort();
                    return FrameEvent::Malformed;
                }
                open.crc.update(word);
                open.payload.reserve(hdr.payload_bytes as usize);
                open.words_remaining = hdr.payload_bytes / 4;
                open.header = Some(hdr);
                self.state = State::Width;
                FrameEvent::HeaderOpen
            }
            State::Width => {
                open.crc.update(word);
                self.state = if open.words_remaining == 0 {
                    State::Trailer
                } else {
                    State::Payload
                };
                FrameEvent::HeaderOpen
            }
            State::Payload => {
                open.crc.update(word);
                open.payload.extend_from_slice(&word.to_le_bytes());
                open.words_remaining -= 1;
                if open.words_remaining == 0 {
                    self.state = State::Trailer;
                }
                FrameEvent::PayloadWord
            }
            // Expected EOP, got a data word: the declared length was shorter
            // than the transmitted payload.
            State::Trailer => {
                self.abort();
                FrameEvent::Malformed
            }
            State::Idle => {
                // Unreachable: `open` is `None` whenever the state is idle.
                self.stray_words += 1;
                FrameEvent::Idle
            }
        }
    }

    fn open_chunk(&mut self) {
        self.open = Some(OpenChunk {
            crc: Crc20::new(self.poly),
            header: None,
            payload: BytesMut::new(),
            words_remaining: 0,
            subchunk_mark: 0,
            subchunk_lengths: Vec::new(),
        });
        self.state = State::Header;
    }

    fn abort(&mut self) {
        self.open = None;
        self.state = State::Idle;
    }

    fn finish(&mut self, received_crc: u32) -> FrameEvent {
        self.state = State::Idle;
        let Some(mut open) = self.open.take() else {
            return FrameEvent::Malformed;
        };
        let Some(hdr) = open.header else {
            return FrameEvent::Malformed;
        };
        // Close the final sub-chunk range; an empty payload still reports one
        // zero-length range.
        open.subchunk_lengths
            .push((open.payload.len() - open.subchunk_mark) as u32);

        let computed = open.crc.finalize();
        let chunk = Chunk {
            channel_id: self.channel_id,
            stream_tag: hdr.stream_tag,
            seq: hdr.seq,
            payload: open.payload.freeze(),
            subchunk_lengths: open.subchunk_lengths,
            checksum: received_crc,
            valid: computed == received_crc,
        };
        if chunk.valid {
            FrameEvent::ChunkComplete(chunk)
        } else {
            FrameEvent::ChecksumError(chunk)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::crc20;
    use crate::frame::{
        encode_header, eop_lane, idle_lane, lane, sop_lane, DEFAULT_STREAM_TAG, TAG_SOB,
        WIDTH_WORD,
    };

    fn data_lane(word: u32) -> u64 {
        u64::from(word)
    }

    /// Lanes for one well-formed chunk with the given payload words.
    fn chunk_lanes(payload: &[u32], seq: u8, poly: Polynomial) -> Vec<u64> {
        let hdr = encode_header(DEFAULT_STREAM_TAG, (payload.len() * 4) as u32, seq);
        let mut words = vec![hdr, WIDTH_WORD];
        words.extend_from_slice(payload);
        let crc = crc20(&words, poly);

        let mut lanes = vec![sop_lane()];
        lanes.extend(words.iter().map(|&w| data_lane(w)));
        lanes.push(eop_lane(crc));
        lanes
    }

    fn feed_all(dec: &mut FrameDecoder, lanes: &[u64]) -> Vec<FrameEvent> {
        lanes.iter().map(|&l| dec.feed(l)).collect()
    }

    #[test]
    fn test_decodes_single_chunk() {
        let mut dec = FrameDecoder::new(7, Polynomial::Current);
        let payload = [0x0302_0100, 0x0706_0504];
        let lanes = chunk_lanes(&payload, 5, Polynomial::Current);
        let events = feed_all(&mut dec, &lanes);

        let Some(FrameEvent::ChunkComplete(chunk)) = events.last() else {
            panic!("expected ChunkComplete, got {:?}", events.last());
        };
        assert_eq!(chunk.channel_id, 7);
        assert_eq!(chunk.stream_tag, DEFAULT_STREAM_TAG);
        assert_eq!(chunk.seq, 5);
        assert!(chunk.valid);
        assert_eq!(chunk.payload.as_ref(), &[0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(chunk.subchunk_lengths, vec![8]);
    }

    #[test]
    fn test_empty_payload_chunk() {
        let mut dec = FrameDecoder::new(0, Polynomial::Current);
        let lanes = chunk_lanes(&[], 0, Polynomial::Current);
        let events = feed_all(&mut dec, &lanes);
        let Some(FrameEvent::ChunkComplete(chunk)) = events.last() else {
            panic!("expected ChunkComplete, got {:?}", events.last());
        };
        assert!(chunk.is_empty());
        assert_eq!(chunk.subchunk_lengths, vec![0]);
    }

    #[test]
    fn test_checksum_mismatch_reported_and_resynchronized() {
        let mut dec = FrameDecoder::new(0, Polynomial::Current);
        let mut lanes = chunk_lanes(&[0xAA55_AA55], 0, Polynomial::Current);
        // Corrupt one payload bit.
        let n = lanes.len();
        lanes[n - 2] ^= 1;
        let events = feed_all(&mut dec, &lanes);
        assert!(matches!(events.last(), Some(FrameEvent::ChecksumError(c)) if !c.valid));

        // The next chunk decodes normally.
        let lanes = chunk_lanes(&[0xDEAD_BEEF], 1, Polynomial::Current);
        let events = feed_all(&mut dec, &lanes);
        assert!(matches!(events.last(), Some(FrameEvent::ChunkComplete(_))));
    }

    #[test]
    fn test_wrong_polynomial_fails_verification() {
        let mut dec = FrameDecoder::new(0, Polynomial::Legacy);
        let lanes = chunk_lanes(&[0x0102_0304], 0, Polynomial::Current);
        let events = feed_all(&mut dec, &lanes);
        assert!(matches!(events.last(), Some(FrameEvent::ChecksumError(_))));
    }

    #[test]
    fn test_early_eop_is_malformed() {
        let mut dec = FrameDecoder::new(0, Polynomial::Current);
        let hdr = encode_header(DEFAULT_STREAM_TAG, 8, 0);
        // Declares two payload words but EOP arrives after one.
        let lanes = [
            sop_lane(),
            data_lane(hdr),
            data_lane(WIDTH_WORD),
            data_lane(1),
            eop_lane(0),
        ];
        let events = feed_all(&mut dec, &lanes);
        assert!(matches!(events.last(), Some(FrameEvent::Malformed)));

        let lanes = chunk_lanes(&[2], 1, Polynomial::Current);
        let events = feed_all(&mut dec, &lanes);
        assert!(matches!(events.last(), Some(FrameEvent::ChunkComplete(_))));
    }

    #[test]
    fn test_idle_inside_chunk_is_malformed() {
        let mut dec = FrameDecoder::new(0, Polynomial::Current);
        let hdr = encode_header(DEFAULT_STREAM_TAG, 4, 0);
        assert!(matches!(dec.feed(sop_lane()), FrameEvent::HeaderOpen));
        assert!(matches!(dec.feed(data_lane(hdr)), FrameEvent::HeaderOpen));
        assert!(matches!(dec.feed(idle_lane()), FrameEvent::Malformed));
        assert!(matches!(dec.feed(idle_lane()), FrameEvent::Idle));
    }

    #[test]
    fn test_sop_inside_chunk_resynchronizes_immediately() {
        let mut dec = FrameDecoder::new(0, Polynomial::Current);
        let hdr = encode_header(DEFAULT_STREAM_TAG, 4, 0);
        dec.feed(sop_lane());
        dec.feed(data_lane(hdr));
        // Second SOP abandons the open chunk but opens the next one.
        assert!(matches!(dec.feed(sop_lane()), FrameEvent::Malformed));

        // Remainder of a valid chunk follows the new SOP directly.
        let lanes = chunk_lanes(&[9], 3, Polynomial::Current);
        let events = feed_all(&mut dec, &lanes[1..]);
        assert!(matches!(events.last(), Some(FrameEvent::ChunkComplete(_))));
    }

    #[test]
    fn test_stray_eop_after_lost_sop() {
        let mut dec = FrameDecoder::new(0, Polynomial::Current);
        // Header and payload arrive without SOP: skipped as stray words.
        let hdr = encode_header(DEFAULT_STREAM_TAG, 4, 0);
        assert!(matches!(dec.feed(data_lane(hdr)), FrameEvent::Idle));
        assert!(matches!(dec.feed(data_lane(WIDTH_WORD)), FrameEvent::Idle));
        assert!(matches!(dec.feed(data_lane(0)), FrameEvent::Idle));
        assert!(matches!(dec.feed(eop_lane(0)), FrameEvent::Malformed));
        assert_eq!(dec.stray_words(), 3);
    }

    #[test]
    fn test_busy_markers_do_not_disturb_chunk() {
        let mut dec = FrameDecoder::new(0, Polynomial::Current);
        let lanes = chunk_lanes(&[0x1111_1111], 0, Polynomial::Current);
        // Inject SOB mid-payload.
        let mut injected = lanes.clone();
        injected.insert(3, lane(TAG_SOB, 0));
        let events = feed_all(&mut dec, &injected);
        assert!(matches!(events.last(), Some(FrameEvent::ChunkComplete(_))));
        assert_eq!(dec.busy_lanes(), 1);
    }

    #[test]
    fn test_subchunk_boundaries_across_blocks() {
        let mut dec = FrameDecoder::new(0, Polynomial::Current);
        let lanes = chunk_lanes(&[1, 2, 3, 4], 0, Polynomial::Current);
        // Split after two payload words, as a block boundary would.
        for &l in &lanes[..5] {
            dec.feed(l);
        }
        dec.begin_block();
        let mut last = FrameEvent::Idle;
        for &l in &lanes[5..] {
            last = dec.feed(l);
        }
        let FrameEvent::ChunkComplete(chunk) = last else {
            panic!("expected ChunkComplete, got {:?}", last);
        };
        assert_eq!(chunk.subchunk_lengths, vec![8, 8]);
        assert_eq!(chunk.len(), 16);
    }

    #[test]
    fn test_corrupted_length_field_cannot_complete() {
        let mut dec = FrameDecoder::new(0, Polynomial::Current);
        let mut lanes = chunk_lanes(&[1, 2, 3], 0, Polynomial::Current);
        // Flip a length bit in the header word so fewer words are declared.
        lanes[1] ^= 1 << 16;
        let events = feed_all(&mut dec, &lanes);
        assert!(!events
            .iter()
            .any(|e| matches!(e, FrameEvent::ChunkComplete(_))));
    }
}
