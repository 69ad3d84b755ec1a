use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

use talkback::config::file::config_file_path;
use talkback::voice::Microphone;
use talkback::{
    AudioClip, AudioOutput, CaptureRecognizer, Config, HttpExchange, RemoteExchange, SpeakerOutput,
    TurnController, TurnHandle, TurnUpdate,
};

/// Talkback - push-to-talk voice turns against a remote answering service
#[derive(Parser)]
#[command(name = "talkback", version, about)]
struct Cli {
    /// Endpoint receiving the transcript
    #[arg(long, env = "TALKBACK_ENDPOINT")]
    endpoint: Option<String>,

    /// Recognition locale (e.g. "pt-BR")
    #[arg(long)]
    language: Option<String>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
    /// Send text to the endpoint and play the answer
    Ask {
        /// Question to send
        text: String,
    },
    /// Show the resolved configuration
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,talkback=info",
        1 => "info,talkback=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Some(Command::TestMic { duration }) => return test_mic(duration).await,
        Some(Command::TestSpeaker) => return test_speaker().await,
        _ => {}
    }

    let mut config = Config::load()?;
    if let Some(endpoint) = cli.endpoint {
        config.exchange.endpoint = Some(endpoint);
    }
    if let Some(language) = cli.language {
        config.recognition.language = language;
    }
    config.validate()?;
    tracing::debug!(?config, "loaded configuration");

    match cli.command {
        Some(Command::Ask { text }) => ask(&config, &text).await,
        Some(Command::Config) => {
            show_config(&config);
            Ok(())
        }
        _ => interactive(&config).await,
    }
}

/// Run turns until the user quits
async fn interactive(config: &Config) -> anyhow::Result<()> {
    let recognizer = CaptureRecognizer::from_config(config);
    let exchange = HttpExchange::from_config(config)?;
    let output = SpeakerOutput::new()?;

    tracing::info!(
        endpoint = exchange.endpoint(),
        language = %config.recognition.language,
        speaker = output.device_name(),
        "starting talkback"
    );

    let controller = TurnController::new(
        config.turn,
        Box::new(recognizer),
        Arc::new(exchange),
        Arc::new(output),
    );
    let handle = controller.handle();

    // Blocking stdin reads live outside the runtime
    let input = handle.clone();
    std::thread::Builder::new()
        .name("talkback-stdin".to_string())
        .spawn(move || input.read_triggers(std::io::stdin().lock()))?;

    tokio::spawn(print_updates(controller.subscribe()));
    tokio::spawn(shutdown_on_ctrl_c(handle));

    println!("Press Enter to talk, Enter again to stop early, q to quit.");
    controller.run().await;
    Ok(())
}

async fn shutdown_on_ctrl_c(handle: TurnHandle) {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("interrupted, shutting down");
        handle.shutdown();
    }
}

async fn print_updates(mut updates: broadcast::Receiver<TurnUpdate>) {
    loop {
        match updates.recv().await {
            Ok(TurnUpdate::Status { status, message }) => match message {
                Some(message) => println!("[{status}] {message}"),
                None => println!("[{status}]"),
            },
            Ok(TurnUpdate::Transcript { finalized, interim }) => {
                if !finalized.is_empty() || !interim.is_empty() {
                    println!("  > {finalized}{interim}");
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "update printer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Send text straight to the endpoint and play the reply
async fn ask(config: &Config, text: &str) -> anyhow::Result<()> {
    let exchange = HttpExchange::from_config(config)?;
    println!("Asking {}: \"{text}\"", exchange.endpoint());

    let payload = exchange.send(text).await?;
    println!("Got {} bytes of audio data", payload.len());

    let output = SpeakerOutput::new()?;
    let clip = output.prepare(&payload)?;
    println!(
        "Playing {:.1}s of audio at {} Hz...",
        clip.duration().as_secs_f32(),
        clip.sample_rate()
    );
    output.play(&clip).await?;

    Ok(())
}

fn show_config(config: &Config) {
    match config_file_path() {
        Some(path) if path.exists() => println!("Config file: {}", path.display()),
        Some(path) => println!("Config file: {} (not found, using defaults)", path.display()),
        None => println!("Config file: unavailable (no home directory)"),
    }
    println!("{config:#?}");
}

/// Test microphone input
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    // The stream is not Send, so the meter runs on a blocking thread
    tokio::task::spawn_blocking(move || mic_meter(duration)).await??;

    println!("\n---");
    println!("If the meter moved, the microphone is working.");
    println!("If RMS stayed near 0, check the default source (pactl info) and input levels.");

    Ok(())
}

fn mic_meter(duration: u64) -> talkback::Result<()> {
    let microphone = Microphone::open()?;

    println!("Device: {}", microphone.device_name());
    println!("Sample rate: {} Hz", microphone.sample_rate());
    println!("---");

    for i in 0..duration {
        let samples = microphone.read(Duration::from_secs(1))?;
        let energy = talkback::recognition::calculate_energy(&samples);
        let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!("[{:2}s] RMS: {energy:.4} | Peak: {peak:.4} | [{meter}]", i + 1);
    }

    Ok(())
}

/// Test speaker output with a sine wave
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let output = SpeakerOutput::new()?;
    println!("Output device: {}", output.device_name());

    let sample_rate = 24000_u32;
    let frequency = 440.0_f32;
    let num_samples = sample_rate as usize * 2;

    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..num_samples)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3
        })
        .collect();

    let clip = AudioClip::new(samples, sample_rate);
    println!("Playing {} samples at {} Hz...", clip.len(), clip.sample_rate());
    output.play(&clip).await?;

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");

    Ok(())
}
