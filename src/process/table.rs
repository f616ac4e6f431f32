use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

use crate::core::MetricsSnapshot;
use crate::process::{ProcessControl, ProcessHandle};

struct TableEntry {
    handle: ProcessHandle,
    metrics: MetricsSnapshot,
}

/// Registry of live bot processes: bot id → handle + latest metrics.
///
/// An id has at most one entry. Removal by generation makes the exit path
/// and the stop path converge: whichever removes first does the cleanup.
#[derive(Default)]
pub struct ProcessTable {
    entries: RwLock<HashMap<String, TableEntry>>,
    next_generation: AtomicU64,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh generation number for the next spawned handle
    pub fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Register a handle. Gives it back if the id already has a live entry.
    pub async fn insert(&self, handle: ProcessHandle) -> Result<(), ProcessHandle> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(handle.bot_id()) {
            return Err(handle);
        }
        entries.insert(
            handle.bot_id().to_string(),
            TableEntry {
                handle,
                metrics: MetricsSnapshot::default(),
            },
        );
        Ok(())
    }

    pub async fn get(&self, bot_id: &str) -> Option<ProcessControl> {
        self.entries
            .read()
            .await
            .get(bot_id)
            .map(|entry| entry.handle.control().clone())
    }

    pub async fn contains(&self, bot_id: &str) -> bool {
        self.entries.read().await.contains_key(bot_id)
    }

    /// True while the entry for `bot_id` is still the given generation
    pub async fn is_current(&self, bot_id: &str, generation: u64) -> bool {
        self.entries
            .read()
            .await
            .get(bot_id)
            .is_some_and(|entry| entry.handle.generation() == generation)
    }

    pub async fn metrics(&self, bot_id: &str) -> Option<MetricsSnapshot> {
        self.entries.read().await.get(bot_id).map(|entry| entry.metrics)
    }

    /// Store a sample. Returns false if the entry is gone or was replaced.
    pub async fn update_metrics(
        &self,
        bot_id: &str,
        generation: u64,
        snapshot: MetricsSnapshot,
    ) -> bool {
        match self.entries.write().await.get_mut(bot_id) {
            Some(entry) if entry.handle.generation() == generation => {
                entry.metrics = snapshot;
                true
            }
            _ => false,
        }
    }

    pub async fn remove(&self, bot_id: &str) -> Option<ProcessHandle> {
        self.entries
            .write()
            .await
            .remove(bot_id)
            .map(|entry| entry.handle)
    }

    /// Remove only if the entry still belongs to `generation`
    pub async fn remove_if(&self, bot_id: &str, generation: u64) -> Option<ProcessHandle> {
        let mut entries = self.entries.write().await;
        let current = entries
            .get(bot_id)
            .is_some_and(|entry| entry.handle.generation() == generation);
        if !current {
            return None;
        }
        entries.remove(bot_id).map(|entry| entry.handle)
    }

    pub async fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&ProcessControl, &MetricsSnapshot),
    {
        for entry in self.entries.read().await.values() {
            f(entry.handle.control(), &entry.metrics);
        }
    }

    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Take every entry out of the table (shutdown sweep)
    pub async fn drain(&self) -> Vec<ProcessHandle> {
        self.entries
            .write()
            .await
            .drain()
            .map(|(_, entry)| entry.handle)
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
