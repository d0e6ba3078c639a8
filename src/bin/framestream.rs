//! Demo driver: stream a sliding window over an image sequence.
//!
//! Scans a directory, then advances a playhead at the requested rate,
//! asking the player for the current frame each cycle while preloading the
//! next few. Uses the counting stub device, so it exercises scan, IO,
//! decode, pooling, and eviction without a GPU.

use anyhow::{Context, Result};
use clap::Parser;
use framestream::{CycleInput, ImagePlayer, NullDevice, PlayerConfig, TextureDevice, Workers};
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Image sequence streaming demo
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory containing the image sequence
    #[arg(value_name = "DIR")]
    directory: PathBuf,

    /// Filemask(s) to match (can be specified multiple times)
    #[arg(short = 'm', long = "mask", value_name = "MASK", default_value = "*.png")]
    masks: Vec<String>,

    /// Frames to preload ahead of the playhead
    #[arg(short = 'p', long = "preload", value_name = "N", default_value = "4")]
    preload: usize,

    /// Playback rate in frames per second
    #[arg(long = "fps", value_name = "FPS", default_value = "24.0")]
    fps: f64,

    /// Number of cycles to run (default: one pass over the sequence)
    #[arg(short = 'n', long = "cycles", value_name = "N")]
    cycles: Option<usize>,

    /// IO worker threads (0 or negative: one worker)
    #[arg(long = "io-threads", value_name = "N")]
    io_threads: Option<i32>,

    /// IO buffer size hint in bytes
    #[arg(long = "buffer-size", value_name = "BYTES", default_value = "262144")]
    buffer_size: usize,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if !args.directory.is_dir() {
        anyhow::bail!("not a directory: {}", args.directory.display());
    }

    // Leave a few cores for the host; same sizing rule the decode-heavy
    // players use
    let io_threads = args
        .io_threads
        .unwrap_or_else(|| (num_cpus::get() * 3 / 4).max(1) as i32);

    let device = Arc::new(NullDevice::new());
    let mut player = ImagePlayer::new(
        PlayerConfig {
            io_workers: Workers::from_config(io_threads),
            upload_workers: Workers::Bounded(1),
        },
        Arc::clone(&device) as Arc<dyn TextureDevice>,
    );

    let directories = vec![args.directory.clone()];
    let frame_count = {
        let input = CycleInput {
            directories: &directories,
            filemasks: &args.masks,
            buffer_size: args.buffer_size,
            visible: &[],
            preload: &[],
            reload: false,
        };
        player.evaluate(&input).frame_count
    };
    if frame_count == 0 {
        if let Some(e) = player.last_scan_error() {
            return Err(anyhow::anyhow!(e.to_string())).context("scan failed");
        }
        anyhow::bail!(
            "no files matching {:?} in {}",
            args.masks,
            args.directory.display()
        );
    }
    info!("Streaming {} frames at {} fps", frame_count, args.fps);

    let cycles = args.cycles.unwrap_or(frame_count);
    let tick = Duration::from_secs_f64(1.0 / args.fps.max(0.001));
    let mut missed = 0usize;

    for cycle in 0..cycles {
        let playhead = cycle % frame_count;
        let visible = [playhead];
        let preload: Vec<usize> = (1..=args.preload)
            .map(|offset| (playhead + offset) % frame_count)
            .collect();

        let input = CycleInput {
            directories: &directories,
            filemasks: &args.masks,
            buffer_size: args.buffer_size,
            visible: &visible,
            preload: &preload,
            reload: false,
        };
        let out = player.evaluate(&input);

        if !out.loaded[0] {
            missed += 1;
        }
        info!(
            "frame {:>5} loaded={} unused={} io={:.2?} upload={:.2?} live={}",
            playhead, out.loaded[0], out.unused_frames, out.io_duration, out.upload_duration,
            device.live()
        );

        std::thread::sleep(tick);
    }

    player.drain();
    info!(
        "Done: {} cycles, {} not-yet-loaded on arrival, {} uploads total",
        cycles,
        missed,
        device.uploads()
    );
    Ok(())
}
