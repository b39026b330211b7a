use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures::StreamExt;
use tracing_subscriber::EnvFilter;

use a3s_relay::endpoint::sim::frames_by_word;
use a3s_relay::{
    prompt, EntryKind, FileStateStore, GzipCodec, LocalHost, Persistence, Probes, RelayConfig,
    RelayError, RelayService, RelaySettings, Result, SessionController, SimulatedEndpoint,
    SimulatedEndpoints,
};

const ALPHA: &str = "sim://alpha";
const BRAVO: &str = "sim://bravo";

#[derive(Parser)]
#[command(
    name = "a3s-relay-sim",
    about = "Run a relay conversation between two simulated endpoints"
)]
struct Cli {
    /// Conversation topic
    #[arg(short, long, default_value = "Is remote work better than office work?")]
    topic: String,

    /// Stop after this many relayed replies
    #[arg(short = 'n', long, default_value_t = 6)]
    turns: usize,

    /// Relay config file (JSON, camelCase)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Persist state under this directory instead of in memory
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Delay between streamed frames, in milliseconds
    #[arg(long, default_value_t = 150)]
    frame_ms: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("[a3s-relay-sim] {e}");
        std::process::exit(1);
    }
}

/// Canned debater cycling through its stance lines
fn debater(
    stance: &'static [&'static str],
) -> impl Fn(&str) -> Vec<String> + Send + Sync + 'static {
    let turn = Arc::new(AtomicUsize::new(0));
    move |text: &str| {
        if text == prompt::holding() {
            return frames_by_word("Understood, I will wait for the opening statement.");
        }
        let n = turn.fetch_add(1, Ordering::SeqCst);
        let line = stance[n % stance.len()];
        frames_by_word(&format!("{} (round {})", line, n + 1))
    }
}

const PRO: &[&str] = &[
    "Remote work removes the commute and gives people hours of their week back.",
    "Distributed teams can hire the best person regardless of where they live.",
    "Written, asynchronous communication leaves a record that offices rarely do.",
];

const CON: &[&str] = &[
    "Offices make spontaneous collaboration easy in a way video calls cannot.",
    "Junior staff learn faster when they can watch experienced colleagues work.",
    "A shared space builds trust that is hard to recreate through a screen.",
];

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => RelayConfig::from_file(path)?,
        None => RelayConfig::default(),
    };
    let frame_interval = Duration::from_millis(cli.frame_ms);

    let sims = SimulatedEndpoints::new();
    sims.insert(
        SimulatedEndpoint::new(ALPHA)
            .with_responder(debater(PRO))
            .with_frame_interval(frame_interval),
    );
    sims.insert(
        SimulatedEndpoint::new(BRAVO)
            .with_responder(debater(CON))
            .with_frame_interval(frame_interval),
    );

    let persistence = match &cli.state_dir {
        Some(dir) => Persistence::new(
            Arc::new(FileStateStore::new(dir)),
            Arc::new(GzipCodec::default()),
            config.persistence.clone(),
        ),
        None => Persistence::in_memory(config.persistence.clone()),
    };

    let (host, agent_events) = LocalHost::new(Arc::new(sims), &config, Probes::default());
    let controller = SessionController::new(config, Arc::new(host), persistence).with_settings(
        RelaySettings::new([ALPHA, BRAVO], cli.topic.clone()).with_timeout_ms(200),
    );
    let (service, relay) = RelayService::new(controller, agent_events);
    let task = service.spawn();

    let mut updates = Box::pin(relay.status_stream());
    relay.start(cli.topic.clone()).await?;

    while let Some(status) = updates.next().await {
        if status.stats.messages_exchanged >= cli.turns as u64 || !status.phase.is_active() {
            break;
        }
    }

    // a persisted log may hold earlier sessions
    let log = relay.conversation_log().await?;
    let session = log
        .iter()
        .rev()
        .find(|e| e.kind == EntryKind::Topic)
        .and_then(|e| e.session_id.clone());
    println!("Topic: {}\n", cli.topic);
    for entry in log
        .iter()
        .filter(|e| e.session_id == session && e.speaker_index.is_some())
    {
        let who = match entry.speaker_index {
            Some(0) => "alpha",
            _ => "bravo",
        };
        println!("[{}] {}", who, entry.content);
    }

    let stats = relay.stats().await?;
    println!(
        "\n{} replies, {:.0} ms average, {:.0}% success",
        stats.messages_exchanged, stats.average_response_time_ms, stats.success_rate
    );

    relay.shutdown().await?;
    task.await
        .map_err(|e| RelayError::Channel(format!("relay service panicked: {}", e)))?;
    Ok(())
}
