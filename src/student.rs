use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::Parser;
use env_logger::Env;
use rand::distributions::{Alphanumeric, DistString};

use lectern::peer::WebRtcFactory;
use lectern::signal::{personal, AvailabilityAction, Envelope, RelayClient, AVAILABILITY};
use lectern::viewer::{ViewError, Viewer};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Instructor whose stream to watch
    instructor: String,

    /// Student id announced to the instructor
    name: Option<String>,

    #[arg(short, long)]
    url: Option<String>,

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
            "student-{}",
            Alphanumeric.sample_string(&mut rand::thread_rng(), 8)
        )
    });
    let url = cli
        .url
        .clone()
        .unwrap_or_else(|| "ws://localhost:8002/signaling".into());

    loop {
        log::info!("Watching {} as {name}", cli.instructor);
        match run(&name, &url, &cli.instructor).await {
            Ok(()) => return Ok(()),
            Err(e) => log::error!("Error while running viewer: {e}"),
        }
        tokio::time::sleep(Duration::from_secs(3)).await;
    }
}

async fn run(name: &str, url: &str, instructor: &str) -> Result<()> {
    let topics = [personal(name), AVAILABILITY.to_owned()];
    let (relay, mut inbox) = RelayClient::connect(url, &topics).await?;
    let peers = Arc::new(WebRtcFactory::new()?);
    let (viewer, events) = Viewer::new(name, relay, peers);
    tokio::spawn(Arc::clone(&viewer).run(events));

    // The user asked for this instructor; the first join attempt may
    // predate the broadcast and simply go unanswered.
    try_join(&viewer, instructor).await;

    loop {
        tokio::select! {
            envelope = inbox.recv() => {
                let Some(envelope) = envelope else { break };
                let went_live = matches!(
                    &envelope,
                    Envelope::Availability { action: AvailabilityAction::Start, instructor_id }
                        if instructor_id == instructor
                );
                viewer.handle_envelope(envelope).await;
                if went_live && !viewer.is_receiving() {
                    try_join(&viewer, instructor).await;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                viewer.stop_receiving().await;
                return Ok(());
            }
        }
    }
    viewer.stop_receiving().await;
    Err(anyhow!("relay connection lost"))
}

async fn try_join(viewer: &Arc<Viewer<RelayClient>>, instructor: &str) {
    match viewer.start_receiving(instructor).await {
        Ok(()) | Err(ViewError::AlreadyReceiving) => {}
        Err(e) => log::warn!("Join attempt failed: {e}"),
    }
}
