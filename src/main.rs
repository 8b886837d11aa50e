//! `readout` demo binary.
//!
//! Runs the full pipeline against the emulated card: generates a reference
//! lane stream per channel, loads it into the emulated DMA region, then
//! lets the ring engine, router and channel workers reassemble the chunks
//! while a feeder thread publishes write-pointer progress.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use daq_readout::block::blocks_from_lanes;
use daq_readout::config::{
    CardSettings, ChannelSettings, FramingSettings, RingSettings, Settings,
};
use daq_readout::emulator::EmulatorCard;
use daq_readout::frame::encoder::{generate, GeneratorConfig};
use daq_readout::{BlockRouter, ChannelHandler, ParserChannel, RingEngine};

#[derive(Parser, Debug)]
#[command(name = "readout", about = "DMA ring-buffer readout demo (emulated card)")]
struct Args {
    /// Configuration name under config/, or a path via --config-file.
    #[arg(long)]
    config: Option<String>,

    /// Explicit configuration file path.
    #[arg(long = "config-file")]
    config_file: Option<String>,

    /// How long to run before stopping.
    #[arg(long = "run-secs", default_value_t = 5)]
    run_secs: u64,
}

/// Built-in settings for running without a config file.
fn demo_settings() -> Settings {
    Settings {
        card: CardSettings::default(),
        ring: RingSettings {
            dma_id: 0,
            memory_bytes: 256 * 4096,
            block_bytes: 4096,
            margin_blocks: 4,
            threshold_blocks: 1,
            interrupt_mode: false,
            poll_interval: Duration::from_millis(2),
            wraparound: true,
        },
        framing: FramingSettings::default(),
        channels: (0..4)
            .map(|i| ChannelSettings {
                id: i * 64,
                enabled: true,
                queue_capacity: 1024,
                sink_capacity: 4096,
                overflow_policy: Default::default(),
                forward_invalid: false,
            })
            .collect(),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let settings = match (&args.config_file, &args.config) {
        (Some(path), _) => Settings::load_from(path)?,
        (None, Some(name)) => Settings::new(Some(name))?,
        (None, None) => {
            let settings = demo_settings();
            settings.validate()?;
            settings
        }
    };

    let card = Arc::new(Mutex::new(EmulatorCard::new()));
    let mut engine = RingEngine::new(Arc::clone(&card), settings.selector(), settings.ring_config())?;
    engine.configure()?;

    // One reference stream per channel, split into blocks and interleaved
    // round-robin, the way a front end multiplexes its links.
    let block_bytes = settings.ring_config().block_bytes as usize;
    let nblocks = (settings.ring_config().memory_bytes / settings.ring_config().block_bytes as u64)
        as usize;
    let stream = generate(&GeneratorConfig {
        poly: settings.framing.polynomial,
        ..GeneratorConfig::default()
    })?;

    let channel_cfgs = settings.channel_configs();
    let per_channel: Vec<Vec<Vec<u8>>> = channel_cfgs
        .iter()
        .map(|cfg| blocks_from_lanes(cfg.id, &stream.lanes, block_bytes))
        .collect();
    let mut blocks: Vec<Vec<u8>> = Vec::new();
    let depth = per_channel.iter().map(Vec::len).max().unwrap_or(0);
    for i in 0..depth {
        for channel_blocks in &per_channel {
            if let Some(block) = channel_blocks.get(i) {
                blocks.push(block.clone());
            }
        }
    }
    // Keep the load within one ring lap; the emulator has no flow control.
    blocks.truncate(nblocks);
    info!(
        chunks_per_channel = stream.chunk_count,
        blocks = blocks.len(),
        "emulator stream generated"
    );

    {
        let mut card = card.lock().map_err(|_| anyhow::anyhow!("card lock poisoned"))?;
        card.load_blocks(&blocks)?;
    }

    let mut router = BlockRouter::new();
    let mut channels: Vec<Arc<ParserChannel>> = Vec::new();
    for cfg in &channel_cfgs {
        let channel = Arc::new(ParserChannel::new(cfg));
        router.register(channel.clone());
        channels.push(channel);
    }
    let router = Arc::new(router);
    router.start_all();

    let dispatcher = Arc::clone(&router);
    engine.start(move |addr| {
        dispatcher.dispatch(addr);
    })?;

    // Feeder: publish pointer progress a few blocks at a time.
    let handle = {
        let card = card.lock().map_err(|_| anyhow::anyhow!("card lock poisoned"))?;
        card.handle()
    };
    let total_bytes = (blocks.len() * block_bytes) as u64;
    let feeder = thread::spawn(move || {
        let step = 8 * block_bytes as u64;
        let mut published = 0u64;
        while published < total_bytes {
            let next = step.min(total_bytes - published);
            handle.publish(next);
            published += next;
            thread::sleep(Duration::from_millis(1));
        }
    });

    let deadline = Instant::now() + Duration::from_secs(args.run_secs);
    let mut delivered = 0u64;
    while Instant::now() < deadline {
        thread::sleep(Duration::from_secs(1));
        for channel in &channels {
            let sink = channel.sink();
            while sink.pop().is_some() {
                delivered += 1;
            }
            let stats = channel.stats();
            info!(
                channel = channel.channel_id(),
                chunks = stats.chunks_completed,
                crc_errors = stats.checksum_errors,
                malformed = stats.malformed,
                dropped = stats.inbound_dropped + stats.sink_dropped,
                "channel progress"
            );
        }
    }

    if feeder.join().is_err() {
        anyhow::bail!("feeder thread panicked");
    }
    let consumed = engine.stop()?;
    router.stop_all();
    engine.close()?;

    for channel in &channels {
        let sink = channel.sink();
        while sink.pop().is_some() {
            delivered += 1;
        }
    }
    let router_stats = router.stats();
    info!(
        bytes_consumed = consumed,
        blocks_dispatched = router_stats.dispatched,
        unknown_dropped = router_stats.unknown_dropped,
        chunks_delivered = delivered,
        "readout finished"
    );
    Ok(())
}
