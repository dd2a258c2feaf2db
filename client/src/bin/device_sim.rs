//! Device simulator - CLI binary.
//!
//! Streams a WAV file to the voice gateway as if it were a microphone,
//! and plays whatever the gateway sends back. Useful for exercising a
//! gateway without real hardware.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::info;

use voicelink_client::{NullSink, SpeakerSink, WavClip, WavSource};
use voicelink_common::{init_tracing, ColorWhen, MetricsContext, MetricsServerConfig};
use voicelink_transport::{
    AudioSink, PipelineSet, RuntimeConfig, Session, WatchdogVerdict,
};

/// Voicelink device simulator - stream a WAV file as microphone input
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    // ---
    /// Session descriptor file (JSON handshake result)
    #[arg(short, long)]
    session: String,

    /// Input audio file (WAV format)
    #[arg(short, long)]
    input: String,

    /// Replay input audio continuously (default). Use `--no-loop` to play once and exit.
    #[arg(long = "no-loop", default_value_t = true, action = clap::ArgAction::SetFalse)]
    loop_audio: bool,

    /// Discard received audio instead of playing it (no sound device needed)
    #[arg(long)]
    mute: bool,

    /// Prometheus metrics bind address (serves `GET /metrics`).
    #[arg(long, default_value = "127.0.0.1:9100")]
    metrics_bind: String,

    /// Coloring
    #[arg(long, value_enum, default_value = "auto")]
    color: ColorWhen,
}

/// Capture version number from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    let args = Args::parse();

    init_tracing(args.color)?;

    info!("Starting voicelink device simulator v{VERSION}");
    info!("Session descriptor: {}", args.session);
    info!("Input file: {}", args.input);
    info!("Loop audio: {}", args.loop_audio);
    info!("Metrics bind: {}", args.metrics_bind);

    let metrics = MetricsContext::new("device-sim")?;
    let metrics_bind = args.metrics_bind.parse().context("invalid metrics bind")?;
    let _metrics_task = metrics.spawn_metrics_server(MetricsServerConfig::new(metrics_bind));

    let descriptor = voicelink_client::load_descriptor(&args.session)?;
    let session = Arc::new(Session::from_descriptor(&descriptor)?);
    info!("Session {} established", session.session_id);

    let clip = WavClip::load(&args.input, &session.capture_params)?;
    info!(
        "Loaded {:.2}s of audio ({} frames)",
        clip.duration_secs(),
        clip.frame_count()
    );
    let source = WavSource::new(clip, args.loop_audio);

    let sink: Box<dyn AudioSink + Send> = if args.mute {
        Box::new(NullSink)
    } else {
        Box::new(SpeakerSink::new(&session.playback_params)?)
    };

    let set = PipelineSet::spawn(
        Arc::clone(&session),
        Box::new(source),
        sink,
        RuntimeConfig::default(),
        Some(metrics),
    )?;

    info!("Streaming... press Ctrl-C to stop");
    set.begin_capture();

    let mut watchdog = set.watchdog();
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(2));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            _ = ticker.tick() => {
                // Only treat silence as a fault once the gateway has
                // actually started replying.
                let expecting = set.stats().total_received > 0;
                if watchdog.check(expecting) == WatchdogVerdict::Expired {
                    break;
                }
            }
        }
    }

    set.stream_stop();
    set.shutdown_and_join();
    info!("Sent {} packets this session", session.pending_sequence());

    Ok(())
}
