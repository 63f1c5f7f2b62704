use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, anyhow};
use clap::{ArgAction, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use soundfind::audio::estimate_level;
use soundfind::sphere::{golden_spiral, max_min_angle};
use soundfind::{
    Config, DirectionLut, FrameBoard, FrameSource, LutParams, Pipeline, RawFrameSource, Reporter,
    ReporterOptions, SoundReport, Tracker, TrackerSettings, WavFrameSource,
};

const REPORT_INTERVAL: Duration = Duration::from_millis(250);
const LEVEL_BAR_WIDTH: usize = 60;
const LEVEL_PER_MARK: f32 = 100.0;

#[derive(Parser)]
#[command(name = "soundfind", version, about = "Locate and track sounds with a tetrahedral 4-mic array")]
struct Cli {
    /// YAML file overriding the built-in constants
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Cached direction lookup table
    #[arg(long, global = true, default_value = "location_lut.csv")]
    lut: PathBuf,

    /// Where the reporter writes the JSON sound report
    #[arg(long, global = true)]
    report: Option<PathBuf>,

    /// Where the reporter writes a PNG of the latest frame and sound map
    #[arg(long, global = true)]
    snapshot: Option<PathBuf>,

    /// Stop after this many frames
    #[arg(long, global = true)]
    max_frames: Option<u64>,

    /// More logging (-v debug, -vv trace); RUST_LOG takes precedence
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load or build the direction lookup table
    Lut {
        /// Ignore the cached file and build from scratch
        #[arg(long)]
        rebuild: bool,
        /// Also report the worst point spacing of an N-point spiral
        #[arg(long, value_name = "N")]
        spacing_sample: Option<usize>,
    },
    /// Run the tracker over a 4-channel 16-bit WAV recording
    Locate { wav: PathBuf },
    /// Run the tracker over raw S16LE interleaved frames on stdin
    Listen,
    /// Print the level of every frame of a recording
    Level { wav: PathBuf },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match &cli.config {
        Some(path) => Config::from_yaml_file(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => Config::default(),
    };
    config.validate().context("invalid configuration")?;

    match &cli.command {
        Command::Lut {
            rebuild,
            spacing_sample,
        } => run_lut(&cli, &config, *rebuild, *spacing_sample),
        Command::Locate { wav } => {
            let source = WavFrameSource::open(wav, config.channels, config.sample_rate, config.frame_len())
                .with_context(|| format!("opening {}", wav.display()))?;
            track(&cli, config, source)
        }
        Command::Listen => {
            let source = RawFrameSource::new(io::stdin().lock(), config.channels, config.frame_len());
            track(&cli, config, source)
        }
        Command::Level { wav } => run_level(&config, wav),
    }
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn run_lut(cli: &Cli, config: &Config, rebuild: bool, spacing_sample: Option<usize>) -> anyhow::Result<()> {
    let params = LutParams::from_config(config)?;
    let lut = if rebuild {
        let lut = DirectionLut::build(&params);
        lut.save(&cli.lut)
            .with_context(|| format!("saving {}", cli.lut.display()))?;
        lut
    } else {
        DirectionLut::load_or_build(&cli.lut, &params)
    };
    println!(
        "{}: {} keys at {} samples per key",
        cli.lut.display(),
        lut.len(),
        lut.precision()
    );

    if let Some(n) = spacing_sample {
        let worst = max_min_angle(&golden_spiral(n));
        println!("{} spiral points: worst nearest-neighbour angle {:.3} deg", n, worst.to_degrees());
    }
    Ok(())
}

/// Full tracking run: LUT first, then the reporter thread, then the
/// pipeline loop on this thread.
fn track<S: FrameSource>(cli: &Cli, config: Config, mut source: S) -> anyhow::Result<()> {
    let params = LutParams::from_config(&config)?;
    let lut = Arc::new(DirectionLut::load_or_build(&cli.lut, &params));

    let tracker = Arc::new(Tracker::new(TrackerSettings::from_config(&config)));
    let board = Arc::new(FrameBoard::new());
    let pipeline = Pipeline::new(config, lut, tracker.clone(), board.clone())?;
    let silence_loudness = pipeline.config().silence_loudness;

    let running = Arc::new(AtomicBool::new(true));
    stop_on_interrupt(running.clone())?;
    let reporter = Reporter::new(
        tracker.clone(),
        board.clone(),
        ReporterOptions {
            interval: REPORT_INTERVAL,
            silence_loudness,
            json_path: cli.report.clone(),
            snapshot_path: cli.snapshot.clone(),
        },
    );
    let handle = reporter.spawn(running.clone())?;

    let result = pipeline.run(&mut source, &running, cli.max_frames);
    running.store(false, Ordering::Release);
    if handle.join().is_err() {
        warn!("reporter thread panicked");
    }
    let frames = result.context("pipeline stopped")?;

    let current_frame = board.current_frame();
    let report = SoundReport::new(current_frame, &tracker.sounds_since(current_frame), silence_loudness);
    info!(frames, sounds = report.sounds.len(), "done");
    println!("{}", report.to_json()?);
    Ok(())
}

/// Clears `running` on Ctrl-C so the pipeline finishes its current frame
/// and the reporter writes a final report.
fn stop_on_interrupt(running: Arc<AtomicBool>) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("starting signal runtime")?;
    thread::Builder::new()
        .name("signals".into())
        .spawn(move || {
            runtime.block_on(async {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        info!("interrupt received, stopping");
                        running.store(false, Ordering::Release);
                    }
                    Err(e) => warn!(error = %e, "cannot listen for interrupts"),
                }
            });
        })
        .context("spawning signal thread")?;
    Ok(())
}

fn run_level(config: &Config, wav: &Path) -> anyhow::Result<()> {
    let mut source = WavFrameSource::open(wav, config.channels, config.sample_rate, config.frame_len())
        .with_context(|| format!("opening {}", wav.display()))?;
    let mut frame_number = 0u64;
    while let Some(frame) = source.next_frame()? {
        frame_number += 1;
        let level = estimate_level(&frame);
        let marks = ((level / LEVEL_PER_MARK) as usize).min(LEVEL_BAR_WIDTH);
        println!("{:>6} {:>8.1} {}", frame_number, level, "#".repeat(marks));
    }
    if frame_number == 0 {
        return Err(anyhow!("{} is shorter than one frame", wav.display()));
    }
    Ok(())
}
