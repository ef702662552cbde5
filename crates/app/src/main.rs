use std::{path::PathBuf, time::Duration};

use clap::{Parser, Subcommand, ValueEnum};
use lipsync_audio_core::{
    analysis, decode_all, BackendKind, ClipCallbacks, PlaybackSession, SoundConfig, SoundRegistry,
};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> lipsync_audio_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Play {
            uris,
            backend,
            volume,
            fps,
            config,
        } => run_play(&uris, backend, volume, fps, config.as_ref()).await,
        Commands::Analyze { uri, window } => run_analyze(&uri, window),
    }
}

async fn run_play(
    uris: &[String],
    backend: Option<BackendArg>,
    volume: Option<f32>,
    fps: u32,
    config: Option<&PathBuf>,
) -> lipsync_audio_core::Result<()> {
    let mut settings = match config {
        Some(path) => SoundConfig::load(path)?,
        None => SoundConfig::default(),
    };
    if let Some(backend) = backend {
        settings.backend = backend.into();
    }
    if let Some(volume) = volume {
        settings.volume = volume;
    }
    tracing::info!(backend = ?settings.backend, volume = settings.volume, clips = uris.len(), "starting playback");

    let registry = SoundRegistry::new(settings)?;
    // A command line invocation is the user's gesture.
    registry.notify_user_activation();

    let mut sessions: Vec<PlaybackSession> = uris
        .iter()
        .map(|uri| {
            let source = uri.clone();
            let callbacks = ClipCallbacks::new()
                .on_finish(move || tracing::info!(source = %source, "clip finished"))
                .on_error(|err| tracing::error!(error = %err, "clip failed"));
            registry.add_and_play(uri, callbacks)
        })
        .collect();

    for session in sessions.iter_mut() {
        if let Err(err) = session.ready().await {
            tracing::warn!(clip = %session.clip().id(), error = %err, "play request failed");
        }
    }

    let frame = Duration::from_secs_f64(1.0 / f64::from(fps.max(1)));
    let mut ticker = tokio::time::interval(frame);
    let mut tick = 0u64;
    while sessions.iter().any(|session| !session.is_settled()) {
        ticker.tick().await;
        let readings: Vec<String> = sessions
            .iter()
            .filter(|session| !session.is_settled())
            .map(|session| format!("{}={:.1}", session.clip().id(), session.loudness()))
            .collect();
        println!("{tick:>6} {}", readings.join(" "));
        tick += 1;
    }

    for session in sessions.iter_mut() {
        let outcome = session.finished().await;
        tracing::debug!(clip = %session.clip().id(), ?outcome, "session settled");
    }
    Ok(())
}

fn run_analyze(uri: &str, window: usize) -> lipsync_audio_core::Result<()> {
    tracing::info!(uri, window, "computing loudness envelope");

    let audio = decode_all(uri)?;
    let window = window.max(1);
    let seconds_per_window = window as f64 / f64::from(audio.sample_rate);
    for (index, value) in analysis::envelope(&audio.samples, window).iter().enumerate() {
        println!("{:>9.3} {value:.1}", index as f64 * seconds_per_window);
    }
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Clip playback with live loudness for lip-sync", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Play clips concurrently and print their loudness every frame.
    Play {
        /// Paths or file:// URIs of the clips to play.
        #[arg(required = true)]
        uris: Vec<String>,
        /// Playback technology; overrides the config file.
        #[arg(short, long, value_enum)]
        backend: Option<BackendArg>,
        /// Volume in [0, 1]; overrides the config file.
        #[arg(long)]
        volume: Option<f32>,
        /// Loudness readings per second.
        #[arg(long, default_value_t = 30)]
        fps: u32,
        /// JSON configuration file.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Print the loudness envelope of a clip without playing it.
    Analyze {
        /// Path or file:// URI of the clip.
        uri: String,
        /// Samples per loudness reading.
        #[arg(short, long, default_value_t = 256)]
        window: usize,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BackendArg {
    Element,
    Library,
}

impl From<BackendArg> for BackendKind {
    fn from(value: BackendArg) -> Self {
        match value {
            BackendArg::Element => BackendKind::Element,
            BackendArg::Library => BackendKind::Library,
        }
    }
}
