use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::error::SupervisorError;
use crate::process::{ControlSignal, ProcessControl, ProcessExit};

/// How a tracked process went away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationOutcome {
    /// It had already exited before any signal was sent
    AlreadyExited(ProcessExit),
    /// It honored SIGTERM within the grace period
    Graceful(ProcessExit),
    /// It had to be SIGKILLed
    Forced(ProcessExit),
}

impl TerminationOutcome {
    pub fn exit(&self) -> ProcessExit {
        match self {
            TerminationOutcome::AlreadyExited(exit)
            | TerminationOutcome::Graceful(exit)
            | TerminationOutcome::Forced(exit) => *exit,
        }
    }

    pub fn was_forced(&self) -> bool {
        matches!(self, TerminationOutcome::Forced(_))
    }
}

/// SIGTERM, then SIGKILL if the process is still alive after `grace`.
///
/// The escalation timer is dropped as soon as the exit is observed, and
/// every signal goes through the child's owner, so a reaped PID is never hit.
/// A zero grace skips SIGTERM entirely.
pub async fn terminate(control: &ProcessControl, grace: Duration) -> TerminationOutcome {
    if let Some(exit) = control.exit_status() {
        return TerminationOutcome::AlreadyExited(exit);
    }

    if grace.is_zero() {
        return kill(control).await;
    }

    info!(
        "🛑 {}: Sending SIGTERM (PID {})",
        control.bot_id(),
        control.pid()
    );
    control.signal(ControlSignal::Terminate);

    match timeout(grace, control.wait()).await {
        Ok(exit) => {
            info!("✅ {}: Stopped gracefully ({})", control.bot_id(), exit);
            TerminationOutcome::Graceful(exit)
        }
        Err(_) => {
            let timed_out = SupervisorError::TerminationTimeout {
                bot_id: control.bot_id().to_string(),
                pid: control.pid(),
            };
            warn!("⚠️  {}", timed_out);
            match kill(control).await {
                TerminationOutcome::AlreadyExited(exit) => TerminationOutcome::Graceful(exit),
                outcome => outcome,
            }
        }
    }
}

/// SIGKILL right away and wait for the exit
pub async fn kill(control: &ProcessControl) -> TerminationOutcome {
    if let Some(exit) = control.exit_status() {
        return TerminationOutcome::AlreadyExited(exit);
    }

    control.signal(ControlSignal::Kill);
    let exit = control.wait().await;
    info!("✅ {}: Killed ({})", control.bot_id(), exit);
    TerminationOutcome::Forced(exit)
}
