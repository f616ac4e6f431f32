pub mod memory;
pub mod sqlite;

use async_trait::async_trait;

use crate::core::{BotRecord, BotUpdate};
use crate::error::Result;

pub use memory::MemoryRepository;
pub use sqlite::SqliteRepository;

/// Storage of bot records. The supervisor only reads definitions and
/// writes status/metrics through this trait; it never touches storage directly.
#[async_trait]
pub trait BotRepository: Send + Sync {
    /// Get a bot by id
    async fn get_bot(&self, id: &str) -> Result<Option<BotRecord>>;

    /// Apply a partial update, returning the updated record if it exists
    async fn update_bot(&self, id: &str, update: BotUpdate) -> Result<Option<BotRecord>>;

    /// Delete a bot record. Returns false if there was nothing to delete.
    async fn delete_bot(&self, id: &str) -> Result<bool>;

    /// Insert a bot, or refresh the definition of an existing one.
    /// Status, pid and usage figures of an existing record are kept.
    async fn upsert_bot(&self, bot: BotRecord) -> Result<BotRecord>;

    /// All bots, ordered by id
    async fn list_bots(&self) -> Result<Vec<BotRecord>>;
}
