//! # Bothost Supervisor
//!
//! Runs user-supplied bots as supervised child processes:
//! - Runtime-aware start command resolution (Node.js, Python, anything else)
//! - Per-bot serialized start/stop/restart/delete
//! - SIGTERM → SIGKILL termination that never signals a reaped PID
//! - Real CPU/memory sampling per running bot
//! - Pluggable bot repository (SQLite or in-memory)
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use bothost_supervisor::{BotRecord, BotRepository, SqliteRepository, Supervisor, SupervisorConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let repository = Arc::new(SqliteRepository::new("bothost.db").await?);
//!     repository
//!         .upsert_bot(BotRecord::new("echo", "Node.js 18", "index.js", "/srv/bots/echo/index.js"))
//!         .await?;
//!
//!     let supervisor = Supervisor::new(SupervisorConfig::default(), repository);
//!     if supervisor.start("echo").await {
//!         println!("{:?}", supervisor.status("echo").await);
//!     }
//!
//!     supervisor.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod metrics;
pub mod process;
pub mod repository;
pub mod resolver;
pub mod supervisor;

// Re-export primary types
pub use config::{BotSeed, SupervisorConfig};
pub use core::{BotRecord, BotRuntimeStatus, BotStatus, BotUpdate, MetricsSnapshot};
pub use error::{Result, SupervisorError};
pub use repository::{BotRepository, MemoryRepository, SqliteRepository};
pub use resolver::{resolve, Invocation};
pub use supervisor::Supervisor;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
