use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use visor_assistant::coordinator::{Coordinator, ScorerFactory};
use visor_assistant::session::{
    AssistantSession, CAPTURE_STOP_TIMEOUT, CaptureWorker, PlaybackWorker, RealtimeConnector,
};
use visor_assistant::tools::{CommandRecorder, SystemTelemetry, ToolDispatcher, WebSearchTool};
use visor_assistant::voice::{
    CpalBackend, EnergyScorer, KeywordScorer, LeaseAuthority, PROTOCOL_SAMPLE_RATE, list_devices,
    rms, samples_to_wav,
};
use visor_assistant::{Config, Error};

/// Sustained level treated as a full-confidence keyword by the energy scorer
const ENERGY_REFERENCE_RMS: f32 = 0.1;

/// Gate frames the energy scorer must stay loud for (80 ms each)
const ENERGY_WINDOW_FRAMES: usize = 6;

/// Extension of recorder output files
const RECORDING_EXTENSION: &str = "mp4";

/// Visor - wake word gated realtime voice assistant
#[derive(Parser)]
#[command(name = "visor", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Config file (defaults to ~/.config/visor/config.toml)
    #[arg(short, long, env = "VISOR_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
#[allow(clippy::enum_variant_names)]
enum Command {
    /// Listen for the wake word and run the assistant (default)
    Run,
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
        /// Save the captured audio as WAV
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Test speaker output
    TestSpeaker,
    /// List audio devices
    Devices,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,visor_assistant=info",
        1 => "info,visor_assistant=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(cli.config.as_deref());

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_assistant(config).await,
        Command::TestMic { duration, output } => test_mic(&config, duration, output).await,
        Command::TestSpeaker => test_speaker(&config).await,
        Command::Devices => show_devices(),
    }
}

async fn run_assistant(config: Config) -> anyhow::Result<()> {
    config.validate()?;
    let api_key = config
        .realtime
        .api_key
        .clone()
        .ok_or_else(|| Error::Config("OPENAI_API_KEY is not set".to_string()))?;

    let session_backend = Arc::new(CpalBackend::new(
        config.audio.input_device.clone(),
        config.audio.output_device.clone(),
    ));
    let gate_backend = Arc::new(CpalBackend::new(
        config.wake.device.clone().or_else(|| config.audio.input_device.clone()),
        None,
    ));

    let dispatcher = Arc::new(build_dispatcher(&config)?);
    let connector = Arc::new(RealtimeConnector::new(config.realtime.endpoint(), api_key));

    let (events_tx, events_rx) = mpsc::channel(8);
    let (session, session_task) = AssistantSession::spawn(
        config.session_settings(),
        session_backend,
        connector,
        dispatcher,
        events_tx,
    );

    let keyword = config
        .wake
        .keywords
        .iter()
        .find(|k| !k.trim().is_empty())
        .cloned()
        .unwrap_or_else(|| "hey_jarvis".to_string());
    if config.wake.keywords.len() > 1 {
        tracing::warn!(keyword = %keyword, "energy scorer listens for a single keyword");
    }
    let scorers: ScorerFactory = Box::new(move || -> Box<dyn KeywordScorer> {
        Box::new(EnergyScorer::new(
            keyword.clone(),
            ENERGY_REFERENCE_RMS,
            ENERGY_WINDOW_FRAMES,
        ))
    });

    let coordinator = Coordinator::new(
        config.wake.gate_settings(),
        gate_backend,
        scorers,
        session,
        events_rx,
    );

    tracing::info!(
        model = %config.realtime.model,
        voice = %config.realtime.voice,
        "visor ready"
    );

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };
    let outcome = coordinator.run(shutdown).await;

    if tokio::time::timeout(Duration::from_secs(5), session_task)
        .await
        .is_err()
    {
        tracing::warn!("session did not stop in time");
    }

    outcome.map_err(Into::into)
}

fn build_dispatcher(config: &Config) -> anyhow::Result<ToolDispatcher> {
    let tools = &config.tools;
    let mut dispatcher =
        ToolDispatcher::new(tools.timeout).with_telemetry(Arc::new(SystemTelemetry::new()));

    if let Some(provider) = tools.search.clone() {
        let search = WebSearchTool::new(provider, tools.timeout)?;
        tracing::info!(provider = search.provider_name(), "web search enabled");
        dispatcher = dispatcher.with_search(search);
    }

    if let Some(command) = &tools.recorder_command {
        let recorder =
            CommandRecorder::new(command, tools.recording_dir.clone(), RECORDING_EXTENSION)?;
        tracing::info!(dir = %tools.recording_dir.display(), "video recorder enabled");
        dispatcher = dispatcher.with_recorder(Arc::new(recorder));
    }

    Ok(dispatcher)
}

/// Test microphone input
async fn test_mic(config: &Config, duration: u64, output: Option<PathBuf>) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let backend = Arc::new(CpalBackend::new(config.audio.input_device.clone(), None));
    let authority = LeaseAuthority::new();
    let lease = authority
        .acquire()
        .ok_or_else(|| Error::Handoff("microphone already leased".to_string()))?;

    let (frames_tx, mut frames_rx) = mpsc::channel(64);
    let rates = config.audio.input_rates.clone();
    let frame_ms = config.audio.frame_ms;
    let worker = tokio::task::spawn_blocking(move || {
        CaptureWorker::start(backend, lease, rates, frame_ms, frames_tx)
    })
    .await?
    .map_err(|failure| failure.error)?;

    println!("Native rate: {} Hz", worker.native_rate());
    println!("---");

    let mut recorded: Vec<i16> = Vec::new();
    for second in 1..=duration {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        let mut window: Vec<i16> = Vec::new();
        while let Ok(Some(frame)) = tokio::time::timeout_at(deadline, frames_rx.recv()).await {
            window.extend_from_slice(frame.samples());
        }

        let energy = rms(&window);
        let peak = window.iter().map(|s| s.unsigned_abs()).max().unwrap_or(0);

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "#".repeat(meter_len) + &" ".repeat(50 - meter_len);
        println!("[{second:2}s] RMS: {energy:.4} | Peak: {peak:5} | [{meter}]");

        recorded.extend(window);
    }

    let _ = tokio::task::spawn_blocking(move || worker.stop(CAPTURE_STOP_TIMEOUT).wait()).await;

    if let Some(path) = output {
        let wav = samples_to_wav(&recorded, PROTOCOL_SAMPLE_RATE)?;
        tokio::fs::write(&path, wav).await?;
        println!("\nSaved {} samples to {}", recorded.len(), path.display());
    }

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: visor devices");
    println!("  3. Set [audio] input_device in the config file");

    Ok(())
}

/// Test speaker output with a sine wave
async fn test_speaker(config: &Config) -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let backend = Arc::new(CpalBackend::new(None, config.audio.output_device.clone()));
    let rates = config.audio.output_rates.clone();
    let volume = config.audio.volume;
    let worker =
        tokio::task::spawn_blocking(move || PlaybackWorker::start(backend, rates, volume, 256))
            .await??;

    println!("Native rate: {} Hz", worker.native_rate());

    let sample_rate = PROTOCOL_SAMPLE_RATE;
    let frequency = 440.0_f32;
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    let samples: Vec<i16> = (0..sample_rate * 2)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            ((2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3 * 32767.0) as i16
        })
        .collect();

    // Queue in the same chunk size the session receives
    for chunk in samples.chunks(4800) {
        worker.enqueue(chunk.to_vec());
    }
    tokio::task::spawn_blocking(move || worker.stop()).await?;

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: visor devices");
    println!("  2. Set [audio] output_device in the config file");

    Ok(())
}

/// List audio devices
fn show_devices() -> anyhow::Result<()> {
    let (inputs, outputs) = list_devices()?;

    println!("Input devices:");
    for device in inputs {
        println!("  {} ({}-{} Hz)", device.name, device.min_rate, device.max_rate);
    }
    println!("\nOutput devices:");
    for device in outputs {
        println!("  {} ({}-{} Hz)", device.name, device.min_rate, device.max_rate);
    }

    Ok(())
}
