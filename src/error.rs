use thiserror::Error;

/// Main error type for the bot supervisor
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// Unknown bot id
    #[error("Bot not found: {0}")]
    NotFound(String),

    /// Empty or unresolvable start command
    #[error("Invalid start command: {0}")]
    InvalidCommand(String),

    /// The OS could not create the process
    #[error("Failed to spawn '{program}' for bot {bot_id}: {source}")]
    SpawnFailure {
        bot_id: String,
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// A live entry already exists for this bot
    #[error("Bot already running: {0}")]
    AlreadyRunning(String),

    /// Graceful termination deadline passed and the process was killed
    #[error("Bot {bot_id} (PID {pid}) ignored SIGTERM, escalated to SIGKILL")]
    TerminationTimeout { bot_id: String, pid: u32 },

    /// The supervisor is sweeping its processes and accepts no new starts
    #[error("Supervisor is shutting down")]
    ShuttingDown,

    /// Repository errors not covered by a more specific variant
    #[error("Repository error: {0}")]
    Repository(String),

    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML config errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Filesystem errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, SupervisorError>;
