use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::core::{BotRecord, BotUpdate};
use crate::error::Result;
use crate::repository::BotRepository;

/// In-process repository, for embedding and tests
#[derive(Default)]
pub struct MemoryRepository {
    bots: RwLock<HashMap<String, BotRecord>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bots(bots: impl IntoIterator<Item = BotRecord>) -> Self {
        Self {
            bots: RwLock::new(bots.into_iter().map(|b| (b.id.clone(), b)).collect()),
        }
    }
}

#[async_trait]
impl BotRepository for MemoryRepository {
    async fn get_bot(&self, id: &str) -> Result<Option<BotRecord>> {
        Ok(self.bots.read().await.get(id).cloned())
    }

    async fn update_bot(&self, id: &str, update: BotUpdate) -> Result<Option<BotRecord>> {
        let mut bots = self.bots.write().await;
        Ok(bots.get_mut(id).map(|bot| {
            bot.apply(&update);
            bot.clone()
        }))
    }

    async fn delete_bot(&self, id: &str) -> Result<bool> {
        Ok(self.bots.write().await.remove(id).is_some())
    }

    async fn upsert_bot(&self, bot: BotRecord) -> Result<BotRecord> {
        let mut bots = self.bots.write().await;
        let stored = match bots.remove(&bot.id) {
            Some(existing) => BotRecord {
                status: existing.status,
                process_id: existing.process_id,
                cpu_usage: existing.cpu_usage,
                memory_usage: existing.memory_usage,
                uptime: existing.uptime,
                created_at: existing.created_at,
                updated_at: chrono::Utc::now(),
                ..bot
            },
            None => bot,
        };
        bots.insert(stored.id.clone(), stored.clone());
        Ok(stored)
    }

    async fn list_bots(&self) -> Result<Vec<BotRecord>> {
        let mut bots: Vec<BotRecord> = self.bots.read().await.values().cloned().collect();
        bots.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(bots)
    }
}
