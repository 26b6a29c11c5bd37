use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use cadenza_engine::{
    AudioEngine, EngineConfig, EngineEvent, LatencyStatus, MeasurementKind, Session,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    match cli.command {
        Commands::Backends => list_backends(config),
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Run(args) => run(config, &args),
        Commands::Measure(args) => measure(config, &args),
    }
}

#[derive(Parser)]
#[command(author, version, about = "Smoke-test front end for the Cadenza engine core")]
struct Cli {
    /// Engine configuration (JSON). Defaults to the per-user file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the backends the engine can select.
    Backends,
    /// Print the effective engine configuration.
    Config,
    /// Run a backend with a counting session and report cycle timing.
    Run(RunArgs),
    /// Measure round-trip latency through a loopback device.
    Measure(MeasureArgs),
}

#[derive(Args)]
struct StreamArgs {
    #[arg(long, default_value = "dummy")]
    backend: String,
    /// First backend argument; the device name for the dummy backend.
    #[arg(long, default_value = "")]
    device: String,
    /// Backend options, e.g. `speed=4,latency=128` for the dummy backend.
    #[arg(long, default_value = "")]
    options: String,
    #[arg(long)]
    sample_rate: Option<u32>,
    #[arg(long)]
    buffer_size: Option<u32>,
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    stream: StreamArgs,
    /// Wall-clock run time.
    #[arg(long, default_value_t = 2.0)]
    seconds: f64,
}

#[derive(Args)]
struct MeasureArgs {
    #[command(flatten)]
    stream: StreamArgs,
    #[arg(long, value_enum, default_value_t = Kind::Audio)]
    kind: Kind,
    /// Physical capture port; defaults to the first port of the kind.
    #[arg(long)]
    input: Option<String>,
    /// Physical playback port; defaults to the first port of the kind.
    #[arg(long)]
    output: Option<String>,
    /// Give up after this many wall-clock seconds.
    #[arg(long, default_value_t = 20.0)]
    timeout: f64,
}

#[derive(Clone, Copy, ValueEnum)]
enum Kind {
    Audio,
    Midi,
}

impl From<Kind> for MeasurementKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Audio => MeasurementKind::Audio,
            Kind::Midi => MeasurementKind::Midi,
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("failed to load engine configuration {}", path.display())),
        None => Ok(EngineConfig::load_or_default()),
    }
}

fn list_backends(config: EngineConfig) -> Result<()> {
    let engine = AudioEngine::new(config).context("failed to create engine")?;
    engine
        .discover_builtin()
        .context("backend discovery failed")?;
    let backends = engine.available_backends();
    if backends.is_empty() {
        println!("No backends available.");
        return Ok(());
    }
    println!("Available backends:");
    for backend in backends {
        let caps = backend.capabilities;
        println!(
            "  - {} (realtime: {}, driver selection: {}, control app: {})",
            backend.name, caps.realtime, caps.requires_driver_selection, caps.has_control_app
        );
    }
    Ok(())
}

fn open(config: EngineConfig, stream: &StreamArgs) -> Result<Arc<AudioEngine>> {
    let engine = AudioEngine::new(config).context("failed to create engine")?;
    engine
        .discover_builtin()
        .context("backend discovery failed")?;
    engine
        .select(&stream.backend, &stream.device, &stream.options)
        .with_context(|| format!("failed to select backend {}", stream.backend))?;
    if let Some(rate) = stream.sample_rate {
        engine
            .set_sample_rate(rate)
            .with_context(|| format!("sample rate {rate} rejected"))?;
    }
    if let Some(frames) = stream.buffer_size {
        engine
            .set_buffer_size(frames)
            .with_context(|| format!("buffer size {frames} rejected"))?;
    }
    Ok(engine)
}

#[derive(Default)]
struct CountingSession {
    cycles: AtomicU64,
    frames: AtomicU64,
}

impl Session for CountingSession {
    fn process(&self, nframes: u32) -> bool {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.frames.fetch_add(u64::from(nframes), Ordering::Relaxed);
        true
    }
}

fn run(config: EngineConfig, args: &RunArgs) -> Result<()> {
    if !(args.seconds > 0.0) {
        bail!("--seconds must be positive");
    }
    let engine = open(config, &args.stream)?;
    let events = engine.subscribe();
    let session = Arc::new(CountingSession::default());
    engine.set_session(session.clone());
    engine.start(false).context("failed to start engine")?;

    let deadline = Instant::now() + Duration::from_secs_f64(args.seconds);
    while Instant::now() < deadline {
        if let Ok(event) = events.recv_timeout(Duration::from_millis(50)) {
            println!("event: {event:?}");
            if matches!(event, EngineEvent::Halted(_)) {
                break;
            }
        }
    }
    let load = engine.get_dsp_load();
    engine.remove_session();
    engine.stop(false).context("failed to stop engine")?;
    for event in events.try_iter() {
        println!("event: {event:?}");
    }

    let metrics = engine.cycle_metrics();
    println!(
        "{} Hz / {} frames ({} us per cycle)",
        engine.sample_rate(),
        engine.samples_per_cycle(),
        engine.usecs_per_cycle()
    );
    println!(
        "session: {} cycles, {} frames",
        session.cycles.load(Ordering::Relaxed),
        session.frames.load(Ordering::Relaxed)
    );
    println!(
        "callback: {} cycles, {} overruns, last {} ns, max {} ns, load {:.1}%",
        metrics.cycles,
        metrics.overruns,
        metrics.last_cycle_ns,
        metrics.max_cycle_ns,
        load * 100.0
    );
    Ok(())
}

fn measure(config: EngineConfig, args: &MeasureArgs) -> Result<()> {
    let engine = open(config, &args.stream)?;
    let (default_in, default_out) = match args.kind {
        Kind::Audio => ("system:capture_1", "system:playback_1"),
        Kind::Midi => ("system:midi_capture_1", "system:midi_playback_1"),
    };
    engine.set_latency_input_port(args.input.as_deref().unwrap_or(default_in));
    engine.set_latency_output_port(args.output.as_deref().unwrap_or(default_out));
    engine
        .start_latency_detection(args.kind.into())
        .context("failed to start latency measurement")?;

    let deadline = Instant::now() + Duration::from_secs_f64(args.timeout.max(0.0));
    let status = loop {
        let status = engine.latency_status();
        if matches!(status, LatencyStatus::Converged | LatencyStatus::TimedOut)
            || Instant::now() >= deadline
        {
            break status;
        }
        thread::sleep(Duration::from_millis(20));
    };
    engine.stop_latency_detection();

    match (status, engine.latency_signal_delay()) {
        (LatencyStatus::Converged, Some(delay)) => {
            let systemic = engine.loopback_systemic_latency();
            let rate = f64::from(engine.sample_rate().max(1));
            println!(
                "round trip: {delay} frames ({:.2} ms), systemic {systemic} frames",
                f64::from(delay) * 1000.0 / rate
            );
            Ok(())
        }
        (status, delay) => bail!("measurement did not converge (status {status:?}, last {delay:?})"),
    }
}
