use anyhow::{bail, Context, Result};
use pixelarena::arena::{run, ArenaStateMachine, RunOutcome};
use pixelarena::channel::{CommandChannel, MemoryTransport, NatsTransport, Transport};
use pixelarena::config::load_config;
use pixelarena::marker::ReplaySource;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pixelarena=info".into()),
        )
        .init();

    info!("Pixel arena starting...");

    let config_path = std::env::var("ARENA_CONFIG").unwrap_or_else(|_| "arena.toml".to_string());
    let config = load_config(&config_path)?;
    info!(
        config = %config_path,
        agents = config.agents.len(),
        bases = config.base_count(),
        "Configuration loaded"
    );

    let frames = std::env::var("ARENA_FRAMES")
        .context("ARENA_FRAMES must name a recorded marker frame file")?;
    let mut source = ReplaySource::open(&frames)?;

    let dry_run = std::env::var("ARENA_DRY_RUN")
        .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
        .unwrap_or(false);

    let transport: Arc<dyn Transport> = if dry_run {
        info!("Dry run: commands stay in process");
        Arc::new(MemoryTransport::new())
    } else {
        Arc::new(NatsTransport::new(config.broker.clone()))
    };

    let channel = CommandChannel::from_config(transport, &config.broker);
    channel
        .connect()
        .await
        .with_context(|| format!("Connect step failed: broker at {}", config.broker.url))?;

    let mut machine = ArenaStateMachine::new(&config, channel)?;
    info!(session = %machine.session(), frames = %frames, "Arena session started");

    match run(&mut machine, &mut source, config.arena.tick_interval()).await {
        RunOutcome::Failed(failure) => bail!("Arena stopped: {}", failure),
        outcome => {
            info!(outcome = ?outcome, ticks = machine.tick_count(), "Arena stopped");
            Ok(())
        }
    }
}
