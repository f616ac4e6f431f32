use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use signal_hook::consts::signal::*;
use signal_hook_tokio::Signals;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bothost_supervisor::{
    BotRepository, BotStatus, SqliteRepository, Supervisor, SupervisorConfig,
};

#[derive(Parser)]
#[command(name = "bothost")]
#[command(about = "Bothost process supervisor", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file
    #[arg(short, long, default_value = "config/bothost.yaml", global = true)]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Supervise bots until SIGTERM/SIGINT
    Run {
        /// Bots to start in addition to autostart and previously running ones
        bots: Vec<String>,
    },

    /// List registered bots
    List,

    /// Delete a bot record and its working directory
    Remove {
        /// Bot id
        id: String,
    },
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bothost=info,bothost_supervisor=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();
    let config = SupervisorConfig::load(&cli.config).await?;
    let repository: Arc<dyn BotRepository> =
        Arc::new(SqliteRepository::new(&config.database.to_string_lossy()).await?);

    for seed in &config.bots {
        repository.upsert_bot(seed.to_record()).await?;
    }

    match cli.command {
        Commands::Run { bots } => run(config, repository, bots).await,
        Commands::List => list(repository.as_ref()).await,
        Commands::Remove { id } => {
            let supervisor = Supervisor::new(config, repository);
            if !supervisor.delete(&id).await {
                bail!("bot {} could not be deleted", id);
            }
            println!("🗑️  Deleted {}", id);
            Ok(())
        }
    }
}

async fn run(
    config: SupervisorConfig,
    repository: Arc<dyn BotRepository>,
    requested: Vec<String>,
) -> Result<()> {
    println!("{}", "=".repeat(90));
    println!("Bothost Supervisor v{}", bothost_supervisor::VERSION);
    println!("Database: {}", config.database.display());
    println!("Settings: {}", config);
    if let Some(dir) = &config.log_dir {
        println!("Bot logs: {}", dir.display());
    }
    println!("{}", "=".repeat(90));

    let mut to_start: BTreeSet<String> = requested.into_iter().collect();
    to_start.extend(
        config
            .bots
            .iter()
            .filter(|seed| seed.autostart)
            .map(|seed| seed.id.clone()),
    );
    // Bots that were running when the host last went down
    to_start.extend(
        repository
            .list_bots()
            .await?
            .into_iter()
            .filter(|bot| bot.status == BotStatus::Running)
            .map(|bot| bot.id),
    );

    let status_interval = config.status_interval();
    let supervisor = Supervisor::new(config, repository);

    // Registered before any child exists so no signal can orphan one
    let mut signals = Signals::new([SIGTERM, SIGINT])?;
    let handle = signals.handle();

    let result = supervise(&supervisor, &to_start, status_interval, &mut signals).await;

    handle.close();
    info!("🧹 Cleaning up...");
    supervisor.shutdown().await;
    info!("✅ Supervisor stopped");

    result
}

/// Start the bots, then print status until a signal arrives
async fn supervise(
    supervisor: &Supervisor,
    to_start: &BTreeSet<String>,
    status_interval: Duration,
    signals: &mut Signals,
) -> Result<()> {
    info!("🤖 Starting {} bot(s)...", to_start.len());
    for id in to_start {
        if !supervisor.start(id).await {
            warn!("⚠️  {}: Not started", id);
        }

        tokio::select! {
            biased;
            signal = signals.next() => {
                info!("🛑 Received signal {:?} during startup, shutting down...", signal);
                return Ok(());
            }
            _ = sleep(Duration::from_millis(500)) => {}
        }
    }

    print_status(supervisor).await?;

    loop {
        tokio::select! {
            signal = signals.next() => {
                info!("🛑 Received signal {:?}, shutting down...", signal);
                return Ok(());
            }
            _ = sleep(status_interval) => print_status(supervisor).await?,
        }
    }
}

async fn print_status(supervisor: &Supervisor) -> Result<()> {
    println!("\n{}", "=".repeat(90));
    println!("Bothost Supervisor - Status");
    println!("{}", "=".repeat(90));

    for bot in supervisor.repository().list_bots().await? {
        let status = supervisor.status(&bot.id).await;
        let running = if status.is_running {
            "🟢 RUNNING"
        } else if bot.status == BotStatus::Error {
            "🟠 ERROR"
        } else {
            "🔴 STOPPED"
        };
        let pid = match (status.is_running, bot.process_id) {
            (true, Some(pid)) => format!("PID {}", pid),
            _ => "N/A".to_string(),
        };

        println!(
            "     {:20} {:12} {:12} CPU: {:6.1}%  Mem: {:8.1} MB  Uptime: {}s",
            bot.id,
            running,
            pid,
            status.metrics.cpu,
            status.metrics.memory as f64 / (1024.0 * 1024.0),
            status.metrics.uptime
        );
    }

    println!("{}\n", "=".repeat(90));
    Ok(())
}

async fn list(repository: &dyn BotRepository) -> Result<()> {
    let bots = repository.list_bots().await?;
    if bots.is_empty() {
        println!("No bots registered");
        return Ok(());
    }

    println!("📋 {} bot(s):", bots.len());
    for bot in bots {
        println!(
            "   {:20} {:8} {:14} {} ({})",
            bot.id,
            bot.status,
            bot.runtime,
            bot.start_command,
            bot.file_path.display()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bothost_supervisor::{BotRecord, MemoryRepository};

    #[tokio::test]
    async fn test_signal_during_startup_stops_remaining_starts() {
        let dir = tempfile::tempdir().unwrap();
        let mut bots = Vec::new();
        for id in ["first", "second"] {
            let work = dir.path().join(id);
            std::fs::create_dir_all(&work).unwrap();
            std::fs::write(work.join("bot.sh"), "sleep 30\n").unwrap();
            bots.push(BotRecord::new(id, "Shell", "sh bot.sh", work.join("bot.sh")));
        }
        let repository = Arc::new(MemoryRepository::with_bots(bots));
        let supervisor = Supervisor::new(SupervisorConfig::default(), repository.clone());

        let mut signals = Signals::new([SIGUSR1]).unwrap();
        signal_hook::low_level::raise(SIGUSR1).unwrap();

        let to_start: BTreeSet<String> = ["first", "second"].map(String::from).into();
        supervise(&supervisor, &to_start, Duration::from_secs(30), &mut signals)
            .await
            .unwrap();

        assert_eq!(supervisor.running_bots().await, vec!["first"]);
        supervisor.shutdown().await;
        assert!(supervisor.running_bots().await.is_empty());
        let first = repository.get_bot("first").await.unwrap().unwrap();
        assert_eq!(first.status, BotStatus::Stopped);
        let second = repository.get_bot("second").await.unwrap().unwrap();
        assert_eq!(second.process_id, None);
    }
}
