//! Per-bot resource sampling.
//!
//! One loop per running bot. It stops on cancellation, when its table
//! entry disappears, or when the process can no longer be sampled.

use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::{BotUpdate, MetricsSnapshot};
use crate::process::ProcessTable;
use crate::repository::BotRepository;

/// Running metrics loop of one bot
#[derive(Debug)]
pub struct CollectorTask {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl CollectorTask {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancel and wait for the loop to finish its current tick
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.join.await {
            if e.is_panic() {
                warn!("⚠️  Metrics loop panicked: {}", e);
            }
        }
    }
}

/// Spawns metrics loops that write into the process table and the repository
#[derive(Clone)]
pub struct MetricsCollector {
    table: Arc<ProcessTable>,
    repository: Arc<dyn BotRepository>,
    interval: Duration,
}

impl MetricsCollector {
    pub fn new(
        table: Arc<ProcessTable>,
        repository: Arc<dyn BotRepository>,
        interval: Duration,
    ) -> Self {
        Self {
            table,
            repository,
            interval,
        }
    }

    /// Start sampling `pid`. The first tick fires one interval after the call.
    pub fn spawn(
        &self,
        bot_id: &str,
        pid: u32,
        generation: u64,
        started_at: Instant,
    ) -> CollectorTask {
        let cancel = CancellationToken::new();
        let join = tokio::spawn(run_loop(
            self.clone(),
            bot_id.to_string(),
            pid,
            generation,
            started_at,
            cancel.clone(),
        ));
        CollectorTask { cancel, join }
    }
}

async fn run_loop(
    collector: MetricsCollector,
    bot_id: String,
    pid: u32,
    generation: u64,
    started_at: Instant,
    cancel: CancellationToken,
) {
    let mut system = System::new();
    let mut ticker = interval_at(Instant::now() + collector.interval, collector.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if !collector.table.is_current(&bot_id, generation).await {
            break;
        }

        let Some((cpu, memory)) = sample(&mut system, pid) else {
            debug!("{}: PID {} vanished, metrics loop done", bot_id, pid);
            break;
        };

        let snapshot = MetricsSnapshot {
            cpu,
            memory,
            uptime: started_at.elapsed().as_secs(),
        };

        if !collector
            .table
            .update_metrics(&bot_id, generation, snapshot)
            .await
        {
            break;
        }

        if let Err(e) = collector
            .repository
            .update_bot(&bot_id, BotUpdate::metrics(&snapshot))
            .await
        {
            warn!("⚠️  {}: Failed to persist metrics: {}", bot_id, e);
        }
    }
}

/// CPU percent and resident bytes of a live process; None if it is gone or a zombie.
pub fn sample(system: &mut System, pid: u32) -> Option<(f32, u64)> {
    let pid = Pid::from_u32(pid);
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);

    let process = system.process(pid)?;
    if matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead) {
        return None;
    }
    Some((process.cpu_usage(), process.memory()))
}
