//! `confgen` - front-end emulator configuration generator.
//!
//! Produces a register-write script that loads the front-end emulator with a
//! reference lane stream: IDLE preamble, control-symbol delimited chunks
//! with CRC-20 trailers, configurable inter-chunk IDLEs and payload
//! patterns, plus deliberate fault injection for negative testing.

use std::fs::File;
use std::io::BufWriter;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use daq_readout::checksum::Polynomial;
use daq_readout::frame::encoder::{
    generate, write_register_script, GeneratorConfig, Pattern,
};

#[derive(Parser, Debug)]
#[command(
    name = "confgen",
    about = "Create front-end emulator configurations for the register loader"
)]
struct Args {
    /// Output configuration filename; chunk size, idle count and pattern id
    /// are appended.
    #[arg(long, default_value = "emuconfigreg")]
    filename: String,

    /// Chunk size of each block of data, in bytes (includes the 8-byte
    /// chunk header).
    #[arg(long = "chunkSize", default_value_t = 464)]
    chunk_size: u32,

    /// Number of idle characters between chunks.
    #[arg(long, default_value_t = 1)]
    idles: u32,

    /// Type of data to write: 0 is incremental, 1 sets all to 0xAA55AA55,
    /// 2 sets all to 0xFFFFFFFF, 3 sets all to 0x00000000.
    #[arg(long, default_value_t = 0)]
    pattern: u32,

    /// Randomize chunk sizes between half and full size.
    #[arg(long = "randomSize")]
    random_size: bool,

    /// Checksum with the legacy polynomial instead of the current one.
    #[arg(long = "oldCrc")]
    old_crc: bool,

    /// Tag chunk headers with the chunk counter as a stream id.
    #[arg(long = "streamId")]
    stream_id: bool,

    /// Bracket the first chunk's trailing idles with busy markers.
    #[arg(long)]
    busy: bool,

    /// Drop one start-of-chunk symbol (chunk index 2), for testing.
    #[arg(long = "omitSop")]
    omit_sop: bool,

    /// Drop one end-of-chunk symbol (chunk index 2), for testing.
    #[arg(long = "omitEop")]
    omit_eop: bool,

    /// Corrupt one checksum (chunk index 3), for testing.
    #[arg(long = "crcError")]
    crc_error: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let Some(pattern) = Pattern::from_id(args.pattern) else {
        bail!("pattern {} not recognized (expected 0..3)", args.pattern);
    };

    let cfg = GeneratorConfig {
        chunk_size: args.chunk_size,
        idles: args.idles,
        pattern,
        random_size: args.random_size,
        poly: if args.old_crc {
            Polynomial::Legacy
        } else {
            Polynomial::Current
        },
        use_stream_id: args.stream_id,
        add_busy: args.busy,
        omit_one_sop: args.omit_sop,
        omit_one_eop: args.omit_eop,
        corrupt_one_crc: args.crc_error,
        ..GeneratorConfig::default()
    };

    info!("chunk size      : {}", args.chunk_size);
    info!("idle characters : {}", args.idles);
    info!("pattern type    : {}", args.pattern);

    let filename = format!(
        "{}_{}_{}_{}",
        args.filename, args.chunk_size, args.idles, args.pattern
    );
    info!("output file     : {}", filename);

    let stream = generate(&cfg)?;
    if !stream.complete {
        info!(
            chunks = stream.chunk_count,
            "stream truncated: not all expected chunks fit"
        );
    }

    let file = File::create(&filename)
        .with_context(|| format!("failed to create output file {}", filename))?;
    let mut out = BufWriter::new(file);
    write_register_script(&mut out, &stream.lanes)?;

    info!("Config file written.");
    Ok(())
}
