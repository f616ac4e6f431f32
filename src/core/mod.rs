pub mod bot;
pub mod metrics;

pub use bot::{BotRecord, BotStatus, BotUpdate};
pub use metrics::{BotRuntimeStatus, MetricsSnapshot};
