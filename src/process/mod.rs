//! Live bot processes.
//!
//! Each spawned child is owned by a single waiter task. Everything else
//! talks to it through a [`ProcessControl`]: signals go over a channel and
//! are only delivered while the child is still unreaped, so a recycled PID
//! can never be hit. The exit status is published on a watch channel.

pub mod table;
pub mod termination;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Result, SupervisorError};
use crate::metrics::CollectorTask;
use crate::resolver::Invocation;

pub use table::ProcessTable;
pub use termination::{terminate, TerminationOutcome};

/// How a bot process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ProcessExit {
    /// Exit could not be observed (wait failed or the waiter went away)
    pub fn lost() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for ProcessExit {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl std::fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => write!(f, "unknown status"),
        }
    }
}

/// Signals the supervisor may ask the waiter task to deliver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// SIGTERM
    Terminate,
    /// SIGKILL
    Kill,
}

/// Cloneable view of a live process: identity, signalling and exit watch
#[derive(Debug, Clone)]
pub struct ProcessControl {
    bot_id: String,
    pid: u32,
    generation: u64,
    signals: mpsc::UnboundedSender<ControlSignal>,
    exit: watch::Receiver<Option<ProcessExit>>,
}

impl ProcessControl {
    pub fn bot_id(&self) -> &str {
        &self.bot_id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Ask the waiter to deliver `signal`. Returns false once the process has been reaped.
    pub fn signal(&self, signal: ControlSignal) -> bool {
        self.signals.send(signal).is_ok()
    }

    /// Exit status, if the process has already exited
    pub fn exit_status(&self) -> Option<ProcessExit> {
        *self.exit.borrow()
    }

    /// Wait for the process to exit
    pub async fn wait(&self) -> ProcessExit {
        let mut exit = self.exit.clone();
        let observed = match exit.wait_for(Option::is_some).await {
            Ok(value) => *value,
            Err(_) => None,
        };
        observed.unwrap_or_else(ProcessExit::lost)
    }
}

/// Supervisor-side record of one spawned bot process
#[derive(Debug)]
pub struct ProcessHandle {
    control: ProcessControl,
    started_at: Instant,
    collector: Option<CollectorTask>,
}

impl ProcessHandle {
    pub fn control(&self) -> &ProcessControl {
        &self.control
    }

    pub fn bot_id(&self) -> &str {
        &self.control.bot_id
    }

    pub fn pid(&self) -> u32 {
        self.control.pid
    }

    pub fn generation(&self) -> u64 {
        self.control.generation
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn attach_collector(&mut self, collector: CollectorTask) {
        if let Some(previous) = self.collector.replace(collector) {
            previous.cancel();
        }
    }

    /// Cancel the metrics loop and wait until it can no longer write
    pub async fn shutdown_collector(mut self) {
        if let Some(collector) = self.collector.take() {
            collector.shutdown().await;
        }
    }

    #[cfg(test)]
    pub(crate) fn detached(bot_id: &str, generation: u64) -> Self {
        let (signals, _) = mpsc::unbounded_channel();
        let (_, exit) = watch::channel(None);
        Self {
            control: ProcessControl {
                bot_id: bot_id.to_string(),
                pid: 0,
                generation,
                signals,
                exit,
            },
            started_at: Instant::now(),
            collector: None,
        }
    }
}

/// Everything needed to launch one bot process
#[derive(Debug, Clone)]
pub struct SpawnSpec<'a> {
    pub bot_id: &'a str,
    pub invocation: &'a Invocation,
    pub working_dir: &'a Path,
    /// Overlaid on the supervisor's own environment
    pub env: &'a HashMap<String, String>,
    /// Append stdout/stderr here instead of discarding them
    pub log_file: Option<PathBuf>,
    pub generation: u64,
}

async fn open_log(path: &Path) -> std::io::Result<(Stdio, Stdio)> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?
        .into_std()
        .await;
    let stderr = file.try_clone()?;
    Ok((Stdio::from(file), Stdio::from(stderr)))
}

/// Spawn a bot process in its own process group and hand the child to a waiter task.
pub async fn spawn(spec: SpawnSpec<'_>) -> Result<ProcessHandle> {
    let spawn_error = |source: std::io::Error| SupervisorError::SpawnFailure {
        bot_id: spec.bot_id.to_string(),
        program: spec.invocation.program.clone(),
        source,
    };

    let (stdout, stderr) = match &spec.log_file {
        Some(path) => open_log(path).await.map_err(spawn_error)?,
        None => (Stdio::null(), Stdio::null()),
    };

    let mut cmd = Command::new(&spec.invocation.program);
    cmd.args(&spec.invocation.args)
        .current_dir(spec.working_dir)
        .envs(spec.env)
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .kill_on_drop(true);

    #[cfg(unix)]
    cmd.process_group(0);

    let child = cmd.spawn().map_err(spawn_error)?;
    let pid = child.id().ok_or_else(|| {
        spawn_error(std::io::Error::new(
            std::io::ErrorKind::Other,
            "child exited before its pid could be read",
        ))
    })?;

    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    let (exit_tx, exit_rx) = watch::channel(None);

    tokio::spawn(own_child(spec.bot_id.to_string(), child, signal_rx, exit_tx));

    Ok(ProcessHandle {
        control: ProcessControl {
            bot_id: spec.bot_id.to_string(),
            pid,
            generation: spec.generation,
            signals: signal_tx,
            exit: exit_rx,
        },
        started_at: Instant::now(),
        collector: None,
    })
}

/// Sole owner of the `Child`: reaps it and delivers signals while it is unreaped.
///
/// When the leader goes down after a stop request, whatever is left of its
/// process group is SIGKILLed before the exit is published.
async fn own_child(
    bot_id: String,
    mut child: Child,
    mut signals: mpsc::UnboundedReceiver<ControlSignal>,
    exit_tx: watch::Sender<Option<ProcessExit>>,
) {
    let pgid = child.id();
    let mut stopping = false;

    let exit = loop {
        tokio::select! {
            status = child.wait() => {
                break match status {
                    Ok(status) => ProcessExit::from(status),
                    Err(e) => {
                        warn!("⚠️  {}: wait failed: {}", bot_id, e);
                        ProcessExit::lost()
                    }
                };
            }
            Some(signal) = signals.recv() => {
                stopping = true;
                deliver(&bot_id, &mut child, signal);
            }
        }
    };

    debug!("{}: process exited ({})", bot_id, exit);
    if let (true, Some(pgid)) = (stopping, pgid) {
        sweep_group(&bot_id, pgid);
    }
    exit_tx.send_replace(Some(exit));
}

/// SIGKILL any members left in the group the leader `pgid` created.
///
/// The id stays reserved while the group has members, so this can only
/// reach leftovers of the bot or nothing at all.
fn sweep_group(bot_id: &str, pgid: u32) {
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        match killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
            Ok(()) => debug!("{}: swept leftovers of group {}", bot_id, pgid),
            Err(Errno::ESRCH) => {}
            Err(e) => warn!("⚠️  {}: killpg({}, SIGKILL) failed: {}", bot_id, pgid, e),
        }
    }

    #[cfg(not(unix))]
    let _ = (bot_id, pgid);
}

fn deliver(bot_id: &str, child: &mut Child, signal: ControlSignal) {
    // `id()` is None once the child has been reaped
    let Some(pid) = child.id() else {
        return;
    };

    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let sig = match signal {
            ControlSignal::Terminate => Signal::SIGTERM,
            ControlSignal::Kill => Signal::SIGKILL,
        };
        match killpg(Pid::from_raw(pid as i32), sig) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => {
                warn!("⚠️  {}: killpg({}, {:?}) failed: {}", bot_id, pid, sig, e);
                if signal == ControlSignal::Kill {
                    let _ = child.start_kill();
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        debug!("{}: stopping PID {} ({:?})", bot_id, pid, signal);
        let _ = child.start_kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sh(script: &str) -> Invocation {
        Invocation {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
        }
    }

    async fn spawn_sh(script: &str) -> ProcessHandle {
        let invocation = sh(script);
        let env = HashMap::new();
        spawn(SpawnSpec {
            bot_id: "test-bot",
            invocation: &invocation,
            working_dir: Path::new("."),
            env: &env,
            log_file: None,
            generation: 1,
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_exit_code_is_published() {
        let handle = spawn_sh("exit 3").await;
        let exit = handle.control().wait().await;
        assert_eq!(exit.code, Some(3));
        assert!(!exit.success());
        assert_eq!(handle.control().exit_status(), Some(exit));
    }

    #[tokio::test]
    async fn test_terminate_signal_is_delivered() {
        let handle = spawn_sh("sleep 30").await;
        assert!(handle.pid() > 0);
        assert!(handle.control().signal(ControlSignal::Terminate));

        let exit = tokio::time::timeout(Duration::from_secs(5), handle.control().wait())
            .await
            .unwrap();
        assert_eq!(exit.code, None);
        assert_eq!(exit.signal, Some(15));
    }

    /// Present and not a zombie
    fn alive(pid: i32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat
                .rsplit_once(')')
                .is_some_and(|(_, rest)| !rest.trim_start().starts_with('Z')),
            Err(_) => false,
        }
    }

    #[tokio::test]
    async fn test_stop_sweeps_rest_of_group() {
        let dir = tempfile::tempdir().unwrap();
        let invocation = sh(
            "sh -c 'trap \"\" TERM; while true; do sleep 0.1; done' & echo $! > child.pid; wait",
        );
        let env = HashMap::new();
        let handle = spawn(SpawnSpec {
            bot_id: "group-bot",
            invocation: &invocation,
            working_dir: dir.path(),
            env: &env,
            log_file: None,
            generation: 1,
        })
        .await
        .unwrap();

        let pid_file = dir.path().join("child.pid");
        let mut child_pid = None;
        for _ in 0..50 {
            if let Ok(text) = std::fs::read_to_string(&pid_file) {
                if let Ok(pid) = text.trim().parse::<i32>() {
                    child_pid = Some(pid);
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let child_pid = child_pid.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        // The leader dies on SIGTERM; its child ignores it
        assert!(handle.control().signal(ControlSignal::Terminate));
        let exit = tokio::time::timeout(Duration::from_secs(5), handle.control().wait())
            .await
            .unwrap();
        assert_eq!(exit.signal, Some(15));

        let mut gone = false;
        for _ in 0..50 {
            if !alive(child_pid) {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(gone);
    }

    #[tokio::test]
    async fn test_signal_after_exit_is_not_delivered() {
        let handle = spawn_sh("true").await;
        let exit = handle.control().wait().await;
        assert!(exit.success());

        // The waiter is gone; the PID may already belong to someone else
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.control().signal(ControlSignal::Kill));
    }

    #[tokio::test]
    async fn test_env_and_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let invocation = sh("printf '%s' \"$BOT_GREETING\" > out.txt");
        let mut env = HashMap::new();
        env.insert("BOT_GREETING".to_string(), "hello".to_string());

        let handle = spawn(SpawnSpec {
            bot_id: "env-bot",
            invocation: &invocation,
            working_dir: dir.path(),
            env: &env,
            log_file: None,
            generation: 1,
        })
        .await
        .unwrap();
        assert!(handle.control().wait().await.success());

        let out = std::fs::read_to_string(dir.path().join("out.txt")).unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn test_output_goes_to_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("logs").join("log-bot.log");
        let invocation = sh("echo out; echo err >&2");
        let env = HashMap::new();

        let handle = spawn(SpawnSpec {
            bot_id: "log-bot",
            invocation: &invocation,
            working_dir: dir.path(),
            env: &env,
            log_file: Some(log.clone()),
            generation: 1,
        })
        .await
        .unwrap();
        handle.control().wait().await;

        let content = std::fs::read_to_string(log).unwrap();
        assert!(content.contains("out"));
        assert!(content.contains("err"));
    }

    #[tokio::test]
    async fn test_missing_executable_is_spawn_failure() {
        let invocation = Invocation {
            program: "definitely-not-a-real-binary-xyz".to_string(),
            args: vec![],
        };
        let env = HashMap::new();
        let result = spawn(SpawnSpec {
            bot_id: "ghost",
            invocation: &invocation,
            working_dir: Path::new("."),
            env: &env,
            log_file: None,
            generation: 1,
        })
        .await;
        assert!(matches!(result, Err(SupervisorError::SpawnFailure { .. })));
    }

    #[test]
    fn test_exit_display() {
        assert_eq!(ProcessExit { code: Some(0), signal: None }.to_string(), "code 0");
        assert_eq!(ProcessExit { code: None, signal: Some(9) }.to_string(), "signal 9");
        assert_eq!(ProcessExit::lost().to_string(), "unknown status");
    }
}
