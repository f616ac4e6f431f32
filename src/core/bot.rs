use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::core::MetricsSnapshot;

/// Persisted lifecycle status of a bot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BotStatus {
    #[default]
    Stopped,
    Running,
    Error,
}

impl BotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BotStatus::Stopped => "stopped",
            BotStatus::Running => "running",
            BotStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for BotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for BotStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stopped" => Ok(BotStatus::Stopped),
            "running" => Ok(BotStatus::Running),
            "error" => Ok(BotStatus::Error),
            other => Err(format!("Unknown bot status: {}", other)),
        }
    }
}

/// A hosted bot as stored by the repository
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BotRecord {
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Free-form runtime label, e.g. "Node.js 18" or "Python 3.11"
    pub runtime: String,

    /// Raw start command as entered by the owner
    pub start_command: String,

    #[serde(default)]
    pub env_variables: HashMap<String, String>,

    /// Entry file; its parent directory is the bot's working root
    pub file_path: PathBuf,

    #[serde(default)]
    pub is_public: bool,

    #[serde(default)]
    pub category: Option<String>,

    #[serde(default)]
    pub status: BotStatus,

    #[serde(default)]
    pub process_id: Option<u32>,

    #[serde(default)]
    pub cpu_usage: f32,

    /// Resident memory in bytes
    #[serde(default)]
    pub memory_usage: u64,

    /// Seconds since the current process was spawned
    #[serde(default)]
    pub uptime: u64,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl BotRecord {
    /// Create a stopped bot with empty metrics
    pub fn new(
        id: impl Into<String>,
        runtime: impl Into<String>,
        start_command: impl Into<String>,
        file_path: impl Into<PathBuf>,
    ) -> Self {
        let id = id.into();
        let now = Utc::now();
        Self {
            name: id.clone(),
            id,
            description: None,
            runtime: runtime.into(),
            start_command: start_command.into(),
            env_variables: HashMap::new(),
            file_path: file_path.into(),
            is_public: false,
            category: None,
            status: BotStatus::Stopped,
            process_id: None,
            cpu_usage: 0.0,
            memory_usage: 0,
            uptime: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Directory the bot runs in and that is removed on delete
    pub fn working_dir(&self) -> &Path {
        match self.file_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }

    /// Apply a partial update in place, bumping `updated_at`
    pub fn apply(&mut self, update: &BotUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(pid) = update.process_id {
            self.process_id = pid;
        }
        if let Some(cpu) = update.cpu_usage {
            self.cpu_usage = cpu;
        }
        if let Some(memory) = update.memory_usage {
            self.memory_usage = memory;
        }
        if let Some(uptime) = update.uptime {
            self.uptime = uptime;
        }
        self.updated_at = Utc::now();
    }
}

/// Partial update of a bot record. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BotUpdate {
    pub status: Option<BotStatus>,
    /// `Some(None)` clears the stored pid
    pub process_id: Option<Option<u32>>,
    pub cpu_usage: Option<f32>,
    pub memory_usage: Option<u64>,
    pub uptime: Option<u64>,
}

impl BotUpdate {
    pub fn running(pid: u32) -> Self {
        Self {
            status: Some(BotStatus::Running),
            process_id: Some(Some(pid)),
            ..Default::default()
        }
    }

    /// Explicit stop: status, pid and every usage figure reset
    pub fn stopped() -> Self {
        Self {
            status: Some(BotStatus::Stopped),
            process_id: Some(None),
            cpu_usage: Some(0.0),
            memory_usage: Some(0),
            uptime: Some(0),
        }
    }

    /// Spawn or resolve failure
    pub fn failed() -> Self {
        Self {
            status: Some(BotStatus::Error),
            process_id: Some(None),
            cpu_usage: Some(0.0),
            memory_usage: Some(0),
            ..Default::default()
        }
    }

    /// Self-exit of the process; usage figures keep their last sample
    pub fn exited(success: bool) -> Self {
        Self {
            status: Some(if success {
                BotStatus::Stopped
            } else {
                BotStatus::Error
            }),
            process_id: Some(None),
            ..Default::default()
        }
    }

    pub fn metrics(snapshot: &MetricsSnapshot) -> Self {
        Self {
            cpu_usage: Some(snapshot.cpu),
            memory_usage: Some(snapshot.memory),
            uptime: Some(snapshot.uptime),
            ..Default::default()
        }
    }
}
