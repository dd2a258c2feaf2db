//! Push-to-talk client - CLI binary.
//!
//! Streams the default microphone to the voice gateway while a talk turn
//! is open and plays the gateway's replies. Turns are toggled from the
//! terminal: press Enter to start talking, Enter again to stop.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use voicelink_client::{MicSource, SpeakerSink};
use voicelink_common::{init_tracing, ColorWhen, MetricsContext, MetricsServerConfig};
use voicelink_transport::{PipelineSet, RuntimeConfig, Session};

/// Voicelink push-to-talk client - talk to a voice gateway from the terminal
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    // ---
    /// Session descriptor file (JSON handshake result)
    #[arg(short, long)]
    session: String,

    /// Prometheus metrics bind address (serves `GET /metrics`).
    #[arg(long, default_value = "127.0.0.1:9200")]
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

    info!("Starting voicelink push-to-talk client v{VERSION}");
    info!("Session descriptor: {}", args.session);
    info!("Metrics bind: {}", args.metrics_bind);

    let metrics = MetricsContext::new("ptt-client")?;
    let metrics_bind = args.metrics_bind.parse().context("invalid metrics bind")?;
    let _metrics_task = metrics.spawn_metrics_server(MetricsServerConfig::new(metrics_bind));

    let descriptor = voicelink_client::load_descriptor(&args.session)?;
    let session = Arc::new(Session::from_descriptor(&descriptor)?);
    info!("Session {} established", session.session_id);

    let source = MicSource::new(&session.capture_params)?;
    let sink = SpeakerSink::new(&session.playback_params)?;

    let set = PipelineSet::spawn(
        Arc::clone(&session),
        Box::new(source),
        Box::new(sink),
        RuntimeConfig::default(),
        Some(metrics),
    )?;

    println!("Commands: Enter = toggle talk, r = stream report, q = quit");

    let mut talking = false;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line? {
                Some(line) => line,
                None => break,
            },
        };

        match line.trim() {
            "q" => break,
            "r" => {
                let stats = set.stats();
                println!(
                    "received {} packets, {} missing ({:.2}% loss), {} duplicates",
                    stats.total_received,
                    stats.missing_count,
                    stats.loss_rate() * 100.0,
                    stats.duplicate_count
                );
            }
            _ if !talking => {
                talking = true;
                println!("[talking] press Enter to finish");
                set.begin_capture();
            }
            _ => {
                talking = false;
                println!("[listening]");
                set.end_capture();
                // The reply stream restarts its numbering at 1.
                set.stream_start();
            }
        }
    }

    set.stream_stop();
    set.shutdown_and_join();

    Ok(())
}
