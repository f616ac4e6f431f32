use serde::{Deserialize, Serialize};

/// Resource usage of one running bot, derived from the live process
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// CPU usage in percent (can exceed 100 on multi-core)
    pub cpu: f32,
    /// Resident memory in bytes
    pub memory: u64,
    /// Seconds since spawn
    pub uptime: u64,
}

/// What the route layer sees for `status(id)`
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotRuntimeStatus {
    pub is_running: bool,
    pub metrics: MetricsSnapshot,
}

impl BotRuntimeStatus {
    pub fn stopped() -> Self {
        Self::default()
    }

    pub fn running(metrics: MetricsSnapshot) -> Self {
        Self {
            is_running: true,
            metrics,
        }
    }
}
