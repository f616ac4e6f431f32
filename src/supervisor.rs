use futures::future::join_all;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::SupervisorConfig;
use crate::core::{BotRuntimeStatus, BotUpdate};
use crate::error::{Result, SupervisorError};
use crate::metrics::MetricsCollector;
use crate::process::termination::{self, TerminationOutcome};
use crate::process::{self, ProcessControl, ProcessExit, ProcessHandle, ProcessTable, SpawnSpec};
use crate::repository::BotRepository;
use crate::resolver;

/// Owns every live bot process and serializes operations per bot id.
///
/// Cloning is cheap and shares the same state; build one at startup and
/// pass it to whatever needs it.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

struct Inner {
    config: SupervisorConfig,
    repository: Arc<dyn BotRepository>,
    table: Arc<ProcessTable>,
    collector: MetricsCollector,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    closing: AtomicBool,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, repository: Arc<dyn BotRepository>) -> Self {
        Self::with_table(config, repository, Arc::new(ProcessTable::new()))
    }

    /// Build around an existing process table
    pub fn with_table(
        config: SupervisorConfig,
        repository: Arc<dyn BotRepository>,
        table: Arc<ProcessTable>,
    ) -> Self {
        let collector = MetricsCollector::new(
            Arc::clone(&table),
            Arc::clone(&repository),
            config.metrics_interval(),
        );

        info!("📋 Supervisor initialized ({})", config);

        Self {
            inner: Arc::new(Inner {
                config,
                repository,
                table,
                collector,
                locks: Mutex::new(HashMap::new()),
                closing: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    pub fn repository(&self) -> &Arc<dyn BotRepository> {
        &self.inner.repository
    }

    pub fn table(&self) -> &Arc<ProcessTable> {
        &self.inner.table
    }

    // ------------------------------------------------------------------
    // Route-layer surface: failures are logged and reported as `false`
    // ------------------------------------------------------------------

    pub async fn start(&self, bot_id: &str) -> bool {
        match self.try_start(bot_id).await {
            Ok(_) => true,
            Err(e) => {
                error!("❌ {}: Failed to start: {}", bot_id, e);
                false
            }
        }
    }

    /// Returns false if the bot was not running
    pub async fn stop(&self, bot_id: &str) -> bool {
        let guard = self.lock_bot(bot_id).await;
        let stopped = self.stop_locked(bot_id).await;
        self.release(bot_id, guard);
        stopped
    }

    pub async fn restart(&self, bot_id: &str) -> bool {
        match self.try_restart(bot_id).await {
            Ok(_) => true,
            Err(e) => {
                error!("❌ {}: Failed to restart: {}", bot_id, e);
                false
            }
        }
    }

    pub async fn delete(&self, bot_id: &str) -> bool {
        match self.try_delete(bot_id).await {
            Ok(deleted) => deleted,
            Err(e) => {
                error!("❌ {}: Failed to delete: {}", bot_id, e);
                false
            }
        }
    }

    /// Live state from the process table, never from storage
    pub async fn status(&self, bot_id: &str) -> BotRuntimeStatus {
        match self.inner.table.metrics(bot_id).await {
            Some(metrics) => BotRuntimeStatus::running(metrics),
            None => BotRuntimeStatus::stopped(),
        }
    }

    pub async fn running_bots(&self) -> Vec<String> {
        self.inner.table.ids().await
    }

    // ------------------------------------------------------------------
    // Fallible variants
    // ------------------------------------------------------------------

    /// Start a bot, stopping its current process first. Returns the new PID.
    pub async fn try_start(&self, bot_id: &str) -> Result<u32> {
        let guard = self.lock_bot(bot_id).await;
        let started = self.start_locked(bot_id).await;
        self.release(bot_id, guard);
        started
    }

    /// Stop, pause, start. Returns the new PID.
    pub async fn try_restart(&self, bot_id: &str) -> Result<u32> {
        let guard = self.lock_bot(bot_id).await;
        info!("🔄 {}: Restarting...", bot_id);

        self.stop_locked(bot_id).await;
        sleep(self.inner.config.restart_delay()).await;
        let started = self.start_locked(bot_id).await;
        self.release(bot_id, guard);
        started
    }

    /// Stop the bot, remove its working directory, then delete its record.
    /// Returns whether the record was removed.
    pub async fn try_delete(&self, bot_id: &str) -> Result<bool> {
        let guard = self.lock_bot(bot_id).await;
        let deleted = self.delete_locked(bot_id).await;
        self.release(bot_id, guard);
        deleted
    }

    /// Kill every tracked process and refuse further starts.
    pub async fn shutdown(&self) {
        self.inner.closing.store(true, Ordering::SeqCst);

        let handles = self.inner.table.drain().await;
        if handles.is_empty() {
            return;
        }

        info!("🧹 Stopping {} bot process(es)...", handles.len());
        let grace = self.inner.config.shutdown_grace();
        join_all(handles.into_iter().map(|handle| self.sweep(handle, grace))).await;
        info!("✅ All bot processes stopped");
    }

    // ------------------------------------------------------------------
    // Internals; callers hold the bot's lock
    // ------------------------------------------------------------------

    async fn start_locked(&self, bot_id: &str) -> Result<u32> {
        if self.inner.closing.load(Ordering::SeqCst) {
            return Err(SupervisorError::ShuttingDown);
        }

        let bot = self
            .inner
            .repository
            .get_bot(bot_id)
            .await?
            .ok_or_else(|| SupervisorError::NotFound(bot_id.to_string()))?;

        if self.inner.table.contains(bot_id).await {
            self.stop_locked(bot_id).await;
        }

        let invocation = match resolver::resolve(&bot.runtime, &bot.start_command) {
            Ok(invocation) => invocation,
            Err(e) => {
                self.persist(bot_id, BotUpdate::failed()).await;
                return Err(e);
            }
        };

        let spec = SpawnSpec {
            bot_id,
            invocation: &invocation,
            working_dir: bot.working_dir(),
            env: &bot.env_variables,
            log_file: self.inner.config.log_file(bot_id),
            generation: self.inner.table.next_generation(),
        };

        let mut handle = match process::spawn(spec).await {
            Ok(handle) => handle,
            Err(e) => {
                self.persist(bot_id, BotUpdate::failed()).await;
                return Err(e);
            }
        };

        let pid = handle.pid();
        handle.attach_collector(self.inner.collector.spawn(
            bot_id,
            pid,
            handle.generation(),
            handle.started_at(),
        ));
        let control = handle.control().clone();

        if let Err(rejected) = self.inner.table.insert(handle).await {
            let control = rejected.control().clone();
            rejected.shutdown_collector().await;
            termination::kill(&control).await;
            return Err(SupervisorError::AlreadyRunning(bot_id.to_string()));
        }

        // Shutdown began while this start was in flight
        if self.inner.closing.load(Ordering::SeqCst) {
            // None means the sweep drained it and is waiting on this bot's lock
            if let Some(handle) = self.inner.table.remove_if(bot_id, control.generation()).await {
                handle.shutdown_collector().await;
                termination::kill(&control).await;
                self.persist(bot_id, BotUpdate::stopped()).await;
            }
            return Err(SupervisorError::ShuttingDown);
        }

        self.watch_exit(control);
        self.persist(bot_id, BotUpdate::running(pid)).await;

        info!("✅ {}: Started (PID {}) → {}", bot_id, pid, invocation);
        Ok(pid)
    }

    async fn delete_locked(&self, bot_id: &str) -> Result<bool> {
        self.stop_locked(bot_id).await;

        if let Some(bot) = self.inner.repository.get_bot(bot_id).await? {
            remove_working_dir(bot_id, &bot.file_path, bot.working_dir()).await;
        }

        let deleted = self.inner.repository.delete_bot(bot_id).await?;
        if deleted {
            info!("🗑️  {}: Deleted", bot_id);
        }
        Ok(deleted)
    }

    async fn stop_locked(&self, bot_id: &str) -> bool {
        let Some(control) = self.inner.table.get(bot_id).await else {
            debug!("{}: Not running", bot_id);
            return false;
        };

        let outcome = termination::terminate(&control, self.inner.config.termination_grace()).await;

        if let Some(handle) = self.inner.table.remove_if(bot_id, control.generation()).await {
            handle.shutdown_collector().await;
        }

        match outcome {
            TerminationOutcome::AlreadyExited(exit) => {
                info!("{}: Had already exited with {} (PID {})", bot_id, exit, control.pid());
                self.persist(bot_id, BotUpdate::exited(exit.success())).await;
            }
            TerminationOutcome::Forced(_) => {
                warn!("⚠️  {}: Stopped by SIGKILL (PID {})", bot_id, control.pid());
                self.persist(bot_id, BotUpdate::stopped()).await;
            }
            TerminationOutcome::Graceful(_) => {
                info!("✅ {}: Stopped (PID {})", bot_id, control.pid());
                self.persist(bot_id, BotUpdate::stopped()).await;
            }
        }
        true
    }

    /// Clean up after a process that exits on its own
    fn watch_exit(&self, control: ProcessControl) {
        let supervisor = self.clone();
        tokio::spawn(async move {
            let exit = control.wait().await;
            let guard = supervisor.lock_bot(control.bot_id()).await;
            supervisor.handle_exit(&control, exit).await;
            supervisor.release(control.bot_id(), guard);
        });
    }

    /// Caller holds the bot's lock
    async fn handle_exit(&self, control: &ProcessControl, exit: ProcessExit) {
        let bot_id = control.bot_id();

        // Already removed by stop/delete/shutdown, or replaced by a newer process
        let Some(handle) = self
            .inner
            .table
            .remove_if(bot_id, control.generation())
            .await
        else {
            return;
        };
        handle.shutdown_collector().await;

        if exit.success() {
            info!("✅ {}: Exited cleanly (PID {})", bot_id, control.pid());
        } else {
            warn!("⚠️  {}: Exited with {} (PID {})", bot_id, exit, control.pid());
        }
        self.persist(bot_id, BotUpdate::exited(exit.success())).await;
    }

    async fn sweep(&self, handle: ProcessHandle, grace: std::time::Duration) {
        let control = handle.control().clone();
        // Waits out a start that inserted this handle and is still persisting
        let guard = self.lock_bot(control.bot_id()).await;
        handle.shutdown_collector().await;
        termination::terminate(&control, grace).await;
        self.persist(control.bot_id(), BotUpdate::stopped()).await;
        self.release(control.bot_id(), guard);
    }

    async fn persist(&self, bot_id: &str, update: BotUpdate) {
        match self.inner.repository.update_bot(bot_id, update).await {
            Ok(Some(_)) => {}
            Ok(None) => debug!("{}: Record gone, status not persisted", bot_id),
            Err(e) => warn!("⚠️  {}: Failed to persist status: {}", bot_id, e),
        }
    }

    async fn lock_bot(&self, bot_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.inner.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(bot_id.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    /// Unlock and drop the bot's lock entry if it is uncontended
    fn release(&self, bot_id: &str, guard: OwnedMutexGuard<()>) {
        drop(guard);
        self.forget_lock(bot_id);
    }

    fn forget_lock(&self, bot_id: &str) {
        let mut locks = self.inner.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(lock) = locks.get(bot_id) {
            // Only drop it if nobody else is waiting on it
            if Arc::strong_count(lock) == 1 {
                locks.remove(bot_id);
            }
        }
    }
}

/// Best-effort removal of a bot's directory tree; failures are only logged.
async fn remove_working_dir(bot_id: &str, file_path: &Path, working_dir: &Path) {
    match tokio::fs::try_exists(file_path).await {
        Ok(true) => {}
        Ok(false) => return,
        Err(e) => {
            warn!("⚠️  {}: Cannot check {}: {}", bot_id, file_path.display(), e);
            return;
        }
    }

    if working_dir == Path::new(".") || working_dir.parent().is_none() {
        warn!(
            "⚠️  {}: Refusing to remove working directory {}",
            bot_id,
            working_dir.display()
        );
        return;
    }

    if let Err(e) = tokio::fs::remove_dir_all(working_dir).await {
        warn!(
            "⚠️  {}: Failed to clean up {}: {}",
            bot_id,
            working_dir.display(),
            e
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{BotRecord, BotStatus};
    use crate::repository::MemoryRepository;

    fn supervisor_with(bots: Vec<BotRecord>) -> (Supervisor, Arc<MemoryRepository>) {
        let repository = Arc::new(MemoryRepository::with_bots(bots));
        let config = SupervisorConfig {
            termination_grace_secs: 1,
            restart_delay_ms: 10,
            ..Default::default()
        };
        (Supervisor::new(config, repository.clone()), repository)
    }

    #[tokio::test]
    async fn test_start_unknown_bot() {
        let (supervisor, _) = supervisor_with(vec![]);
        assert!(matches!(
            supervisor.try_start("ghost").await,
            Err(SupervisorError::NotFound(_))
        ));
        assert!(!supervisor.start("ghost").await);
    }

    #[tokio::test]
    async fn test_stop_not_running_is_noop() {
        let (supervisor, repository) =
            supervisor_with(vec![BotRecord::new("idle", "Other", "true", "/tmp/idle/run")]);
        assert!(!supervisor.stop("idle").await);
        let stored = repository.get_bot("idle").await.unwrap().unwrap();
        assert_eq!(stored.status, BotStatus::Stopped);
    }

    #[tokio::test]
    async fn test_empty_command_marks_error() {
        let (supervisor, repository) =
            supervisor_with(vec![BotRecord::new("blank", "Node.js 18", "  ", "/tmp/blank/x")]);

        assert!(matches!(
            supervisor.try_start("blank").await,
            Err(SupervisorError::InvalidCommand(_))
        ));
        let stored = repository.get_bot("blank").await.unwrap().unwrap();
        assert_eq!(stored.status, BotStatus::Error);
        assert_eq!(stored.process_id, None);
    }

    #[tokio::test]
    async fn test_start_refused_after_shutdown() {
        let (supervisor, _) =
            supervisor_with(vec![BotRecord::new("late", "Other", "sleep 30", "/tmp/late/run")]);
        supervisor.shutdown().await;
        assert!(matches!(
            supervisor.try_start("late").await,
            Err(SupervisorError::ShuttingDown)
        ));
        assert!(supervisor.running_bots().await.is_empty());
    }

    fn lock_count(supervisor: &Supervisor) -> usize {
        supervisor.inner.locks.lock().unwrap().len()
    }

    #[tokio::test]
    async fn test_unknown_ids_leave_no_lock_behind() {
        let (supervisor, _) = supervisor_with(vec![]);
        for id in ["ghost-1", "ghost-2", "ghost-3"] {
            assert!(!supervisor.start(id).await);
            assert!(!supervisor.stop(id).await);
            assert!(!supervisor.restart(id).await);
            assert!(!supervisor.delete(id).await);
        }
        assert_eq!(lock_count(&supervisor), 0);
    }

    #[tokio::test]
    async fn test_stop_after_crash_keeps_error_status() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("crash.sh");
        std::fs::write(&file, "sleep 0.2\nexit 3\n").unwrap();
        let (supervisor, repository) =
            supervisor_with(vec![BotRecord::new("crash", "Other", "sh crash.sh", file)]);

        assert!(supervisor.start("crash").await);

        // Hold the lock so the exit watcher cannot record the crash first
        let guard = supervisor.lock_bot("crash").await;
        tokio::time::sleep(std::time::Duration::from_millis(700)).await;
        assert!(supervisor.stop_locked("crash").await);
        supervisor.release("crash", guard);

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let stored = repository.get_bot("crash").await.unwrap().unwrap();
        assert_eq!(stored.status, BotStatus::Error);
        assert_eq!(stored.process_id, None);
        assert!(!supervisor.status("crash").await.is_running);
    }

    #[tokio::test]
    async fn test_status_of_unknown_bot() {
        let (supervisor, _) = supervisor_with(vec![]);
        assert_eq!(supervisor.status("nobody").await, BotRuntimeStatus::stopped());
    }

    #[tokio::test]
    async fn test_remove_working_dir_skips_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("bot");
        std::fs::create_dir(&work).unwrap();

        remove_working_dir("b", &work.join("missing.js"), &work).await;
        assert!(work.exists());

        std::fs::write(work.join("index.js"), "").unwrap();
        remove_working_dir("b", &work.join("index.js"), &work).await;
        assert!(!work.exists());
    }

    #[tokio::test]
    async fn test_remove_working_dir_refuses_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("index.js");
        std::fs::write(&file, "").unwrap();

        remove_working_dir("b", &file, Path::new(".")).await;
        assert!(file.exists());
    }
}
