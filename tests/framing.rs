//! Codec-level properties: encode/decode round trips, checksum
//! sensitivity, and resynchronization after injected framing faults.

use rand::Rng;

use daq_readout::checksum::Polynomial;
use daq_readout::frame::decoder::FrameDecoder;
use daq_readout::frame::encoder::{generate, GeneratorConfig, Pattern};
use daq_readout::frame::{Chunk, FrameEvent};

struct DecodeOutcome {
    completed: Vec<Chunk>,
    errored: Vec<Chunk>,
    malformed: u64,
}

fn decode(lanes: &[u64], poly: Polynomial) -> DecodeOutcome {
    let mut decoder = FrameDecoder::new(0, poly);
    let mut outcome = DecodeOutcome {
        completed: Vec::new(),
        errored: Vec::new(),
        malformed: 0,
    };
    for &lane in lanes {
        match decoder.feed(lane) {
            FrameEvent::ChunkComplete(chunk) => outcome.completed.push(chunk),
            FrameEvent::ChecksumError(chunk) => outcome.errored.push(chunk),
            FrameEvent::Malformed => outcome.malformed += 1,
            FrameEvent::Idle | FrameEvent::HeaderOpen | FrameEvent::PayloadWord => {}
        }
    }
    outcome
}

#[test]
fn roundtrip_across_chunk_sizes_and_polynomials() {
    for poly in [Polynomial::Legacy, Polynomial::Current] {
        for chunk_size in [8u32, 12, 64, 464, 2048] {
            let cfg = GeneratorConfig {
                slots: 4096,
                chunk_size,
                poly,
                ..GeneratorConfig::default()
            };
            let stream = generate(&cfg).unwrap();
            assert!(stream.chunk_count > 0, "no chunks at size {}", chunk_size);

            let outcome = decode(&stream.lanes, poly);
            assert_eq!(
                outcome.completed.len() as u32,
                stream.chunk_count,
                "size {} poly {:?}",
                chunk_size,
                poly
            );
            assert!(outcome.errored.is_empty());
            assert_eq!(outcome.malformed, 0);

            for (i, chunk) in outcome.completed.iter().enumerate() {
                assert_eq!(u32::from(chunk.seq), i as u32 & 0xFF);
                assert_eq!(chunk.len() as u32, chunk_size - 8);
                assert!(chunk.valid);
                // Pattern 0: the payload is a byte counter restarting per chunk.
                for (j, &byte) in chunk.payload.iter().enumerate() {
                    assert_eq!(byte, (j & 0xFF) as u8);
                }
            }
        }
    }
}

#[test]
fn roundtrip_all_fill_patterns() {
    for (pattern, expect) in [
        (Pattern::Alternating, Some([0x55u8, 0xAA, 0x55, 0xAA])),
        (Pattern::Ones, Some([0xFF, 0xFF, 0xFF, 0xFF])),
        (Pattern::Zeros, Some([0, 0, 0, 0])),
        (Pattern::Counter, None),
    ] {
        let cfg = GeneratorConfig {
            slots: 512,
            chunk_size: 32,
            pattern,
            ..GeneratorConfig::default()
        };
        let stream = generate(&cfg).unwrap();
        let outcome = decode(&stream.lanes, cfg.poly);
        assert_eq!(outcome.completed.len() as u32, stream.chunk_count);
        if let Some(word_bytes) = expect {
            for chunk in &outcome.completed {
                for word in chunk.payload.chunks_exact(4) {
                    assert_eq!(word, word_bytes);
                }
            }
        }
    }
}

#[test]
fn checksum_sensitivity_to_single_bit_flips() {
    let mut rng = rand::thread_rng();
    for chunk_size in [16u32, 64, 464] {
        let cfg = GeneratorConfig {
            slots: 2048,
            chunk_size,
            ..GeneratorConfig::default()
        };
        let stream = generate(&cfg).unwrap();
        let total = stream.chunk_count as usize;

        // Chunk 0 occupies lanes [2, 2 + 1 + chunk_size/4 + 1): its data
        // words (header, width, payload) sit between the SOP and the EOP.
        let words = 3..(3 + chunk_size as usize / 4);

        for _ in 0..100 {
            let mut lanes = stream.lanes.clone();
            let lane_index = rng.gen_range(words.clone());
            let bit = rng.gen_range(0..32);
            lanes[lane_index] ^= 1u64 << bit;

            let outcome = decode(&lanes, cfg.poly);
            // Never a false ChunkComplete: the corrupted chunk is reported
            // as a checksum error, or as malformed when the flip hit the
            // length field and broke the framing itself.
            assert_eq!(
                outcome.completed.len(),
                total - 1,
                "size {} flip lane {} bit {}",
                chunk_size,
                lane_index,
                bit
            );
            assert!(
                !outcome.errored.is_empty() || outcome.malformed > 0,
                "corruption went unreported (size {} lane {} bit {})",
                chunk_size,
                lane_index,
                bit
            );
        }
    }
}

#[test]
fn resynchronizes_after_omitted_sop() {
    let cfg = GeneratorConfig {
        slots: 2048,
        chunk_size: 64,
        omit_one_sop: true,
        ..GeneratorConfig::default()
    };
    let stream = generate(&cfg).unwrap();
    let outcome = decode(&stream.lanes, cfg.poly);

    // Chunk index 2 lost its SOP: its words are skipped and its EOP is
    // reported stray; every other chunk decodes cleanly.
    assert_eq!(outcome.completed.len() as u32, stream.chunk_count - 1);
    assert!(outcome.malformed >= 1);
    let seqs: Vec<u8> = outcome.completed.iter().map(|c| c.seq).collect();
    assert!(!seqs.contains(&2));
    assert!(seqs.contains(&3), "decoder failed to recover after the gap");
    for window in seqs.windows(2) {
        assert!(window[0] < window[1], "chunk order broken: {:?}", seqs);
    }
}

#[test]
fn resynchronizes_after_omitted_eop() {
    let cfg = GeneratorConfig {
        slots: 2048,
        chunk_size: 64,
        omit_one_eop: true,
        ..GeneratorConfig::default()
    };
    let stream = generate(&cfg).unwrap();
    let outcome = decode(&stream.lanes, cfg.poly);

    assert_eq!(outcome.completed.len() as u32, stream.chunk_count - 1);
    assert!(outcome.malformed >= 1);
    let seqs: Vec<u8> = outcome.completed.iter().map(|c| c.seq).collect();
    assert!(!seqs.contains(&2));
    assert!(seqs.contains(&3));
}

#[test]
fn reference_scenario_recovers_68_chunks() {
    // chunkSize=464, idles=1, pattern=0, 8192 slots:
    // (8192-2)/(1 + 464/4 + 1 + 1) chunks.
    let cfg = GeneratorConfig::default();
    assert_eq!(cfg.slots, 8192);
    assert_eq!(cfg.chunk_size, 464);
    assert_eq!(cfg.idles, 1);
    assert_eq!(cfg.pattern, Pattern::Counter);
    assert_eq!(cfg.poly, Polynomial::Current);

    let stream = generate(&cfg).unwrap();
    assert_eq!(stream.chunk_count, (8192 - 2) / (1 + 464 / 4 + 1 + 1));
    assert_eq!(stream.chunk_count, 68);

    let outcome = decode(&stream.lanes, cfg.poly);
    assert_eq!(outcome.completed.len(), 68);
    assert!(outcome.errored.is_empty());
    assert_eq!(outcome.malformed, 0);

    for (i, chunk) in outcome.completed.iter().enumerate() {
        assert!(chunk.valid);
        assert_eq!(usize::from(chunk.seq), i);
        assert_eq!(chunk.len(), 456);
        // Strictly increasing byte counter within each chunk.
        for (j, &byte) in chunk.payload.iter().enumerate() {
            assert_eq!(byte, (j & 0xFF) as u8);
        }
    }
}

#[test]
fn reference_scenario_with_corrupted_checksum() {
    let cfg = GeneratorConfig {
        corrupt_one_crc: true,
        ..GeneratorConfig::default()
    };
    let stream = generate(&cfg).unwrap();
    let outcome = decode(&stream.lanes, cfg.poly);

    // Exactly one checksum error, at chunk index 3; all others complete.
    assert_eq!(outcome.completed.len(), 67);
    assert_eq!(outcome.errored.len(), 1);
    assert_eq!(outcome.errored[0].seq, 3);
    assert!(!outcome.errored[0].valid);
    assert_eq!(outcome.malformed, 0);
    assert!(!outcome.completed.iter().any(|c| c.seq == 3));
}

#[test]
fn stream_id_tagging_reaches_decoded_chunks() {
    let cfg = GeneratorConfig {
        slots: 1024,
        chunk_size: 32,
        use_stream_id: true,
        ..GeneratorConfig::default()
    };
    let stream = generate(&cfg).unwrap();
    let outcome = decode(&stream.lanes, cfg.poly);
    assert_eq!(outcome.completed.len() as u32, stream.chunk_count);
    for chunk in &outcome.completed {
        assert_eq!(chunk.stream_tag, chunk.seq);
    }
}

#[test]
fn busy_brackets_are_transparent_to_decoding() {
    let cfg = GeneratorConfig {
        slots: 1024,
        chunk_size: 32,
        add_busy: true,
        ..GeneratorConfig::default()
    };
    let stream = generate(&cfg).unwrap();
    let outcome = decode(&stream.lanes, cfg.poly);
    assert_eq!(outcome.completed.len() as u32, stream.chunk_count);
    assert_eq!(outcome.malformed, 0);
}
