//! Supervisor configuration, loaded from `bothost.yaml`.
//!
//! Every field has a default, so an empty or missing file is a valid config.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::BotRecord;
use crate::error::{Result, SupervisorError};

fn default_database() -> PathBuf {
    PathBuf::from("bothost.db")
}

fn default_termination_grace_secs() -> u64 {
    5
}

fn default_metrics_interval_secs() -> u64 {
    5
}

fn default_restart_delay_ms() -> u64 {
    1000
}

fn default_status_interval_secs() -> u64 {
    30
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// SQLite database holding bot records
    #[serde(default = "default_database")]
    pub database: PathBuf,

    /// SIGTERM → SIGKILL escalation delay
    #[serde(default = "default_termination_grace_secs")]
    pub termination_grace_secs: u64,

    /// Metrics sampling period per running bot
    #[serde(default = "default_metrics_interval_secs")]
    pub metrics_interval_secs: u64,

    /// Pause between stop and start on restart
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,

    /// Grace given to each bot on host shutdown (0 = SIGKILL right away)
    #[serde(default)]
    pub shutdown_grace_secs: u64,

    /// Status table period for `bothost run`
    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,

    /// When set, bot stdout/stderr is appended to `<log_dir>/<bot id>.log`
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Bots registered at startup
    #[serde(default)]
    pub bots: Vec<BotSeed>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            termination_grace_secs: default_termination_grace_secs(),
            metrics_interval_secs: default_metrics_interval_secs(),
            restart_delay_ms: default_restart_delay_ms(),
            shutdown_grace_secs: 0,
            status_interval_secs: default_status_interval_secs(),
            log_dir: None,
            bots: Vec::new(),
        }
    }
}

impl SupervisorConfig {
    /// Load from a YAML file. A missing file yields the defaults.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Self::from_yaml(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!("⚠️  Config {} not found, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.metrics_interval_secs == 0 {
            return Err(SupervisorError::Config(
                "metrics_interval_secs must be at least 1".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for seed in &self.bots {
            if !seen.insert(seed.id.as_str()) {
                return Err(SupervisorError::Config(format!(
                    "duplicate bot id in config: {}",
                    seed.id
                )));
            }
        }
        Ok(())
    }

    pub fn termination_grace(&self) -> Duration {
        Duration::from_secs(self.termination_grace_secs)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs.max(1))
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs.max(1))
    }

    pub fn log_file(&self, bot_id: &str) -> Option<PathBuf> {
        self.log_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.log", bot_id)))
    }
}

impl std::fmt::Display for SupervisorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "grace={}s, metrics={}s, restart_delay={}ms, shutdown_grace={}s",
            self.termination_grace_secs,
            self.metrics_interval_secs,
            self.restart_delay_ms,
            self.shutdown_grace_secs
        )
    }
}

/// Bot definition declared in the config file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotSeed {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub runtime: String,
    pub start_command: String,
    pub file_path: PathBuf,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub category: Option<String>,
    /// Start this bot when `bothost run` comes up
    #[serde(default)]
    pub autostart: bool,
}

impl BotSeed {
    pub fn to_record(&self) -> BotRecord {
        let mut record = BotRecord::new(
            self.id.clone(),
            self.runtime.clone(),
            self.start_command.clone(),
            self.file_path.clone(),
        );
        if let Some(name) = &self.name {
            record.name = name.clone();
        }
        record.env_variables = self.env.clone();
        record.category = self.category.clone();
        record
    }
}
