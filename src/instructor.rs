use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::Parser;
use env_logger::Env;
use rand::distributions::{Alphanumeric, DistString};

use lectern::broadcast::Broadcaster;
use lectern::capture::IvfFileSource;
use lectern::peer::WebRtcFactory;
use lectern::signal::{personal, RelayClient};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Instructor id announced to viewers
    name: Option<String>,

    #[arg(short, long)]
    url: Option<String>,

    /// Pre-encoded IVF file fed as the shared display
    #[arg(short, long)]
    video: PathBuf,

    /// Turn debugging information on
    #[arg(short, long, action = clap::ArgAction::Count)]
    debug: u8,
}

fn init_logging(debug: u8) {
    if debug > 0 {
        env_logger::Builder::new()
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{}:{} [{}] {} - {}",
                    record.file().unwrap_or("unknown"),
                    record.line().unwrap_or(0),
                    record.level(),
                    chrono::Local::now().format("%H:%M:%S.%6f"),
                    record.args()
                )
            })
            .filter(None, log::LevelFilter::Trace)
            .init();
    } else {
        env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let name = cli.name.clone().unwrap_or_else(|| {
        format!(
            "instructor-{}",
            Alphanumeric.sample_string(&mut rand::thread_rng(), 8)
        )
    });
    let url = cli
        .url
        .clone()
        .unwrap_or_else(|| "ws://localhost:8002/signaling".into());

    loop {
        log::info!("Starting broadcast session as {name}");
        match run(&name, &url, &cli.video).await {
            Ok(()) => return Ok(()),
            Err(e) => log::error!("Error while running broadcaster: {e}"),
        }
        tokio::time::sleep(Duration::from_secs(3)).await;
    }
}

async fn run(name: &str, url: &str, video: &Path) -> Result<()> {
    let (relay, mut inbox) = RelayClient::connect(url, &[personal(name)]).await?;
    let peers = Arc::new(WebRtcFactory::new()?);
    let capture = Arc::new(IvfFileSource::new(video));
    let (broadcaster, events) = Broadcaster::new(name, relay, peers, capture);
    tokio::spawn(Arc::clone(&broadcaster).run(events));

    broadcaster.start_broadcast().await?;

    loop {
        tokio::select! {
            envelope = inbox.recv() => {
                let Some(envelope) = envelope else { break };
                broadcaster.handle_envelope(envelope).await;
            }
            _ = tokio::signal::ctrl_c() => {
                broadcaster.stop_broadcast().await;
                return Ok(());
            }
        }
    }
    broadcaster.stop_broadcast().await;
    Err(anyhow!("relay connection lost"))
}
