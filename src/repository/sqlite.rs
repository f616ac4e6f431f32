use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::core::{BotRecord, BotStatus, BotUpdate};
use crate::error::{Result, SupervisorError};
use crate::repository::BotRepository;

const SELECT_COLUMNS: &str = "id, name, description, runtime, start_command, env_variables, \
     is_public, status, file_path, category, process_id, cpu_usage, memory_usage, uptime, \
     created_at, updated_at";

/// SQLite-backed bot repository
///
/// Schema follows the hosting service's `bots` table:
/// ```sql
/// CREATE TABLE bots (
///     id TEXT PRIMARY KEY,
///     name TEXT NOT NULL,
///     description TEXT,
///     runtime TEXT NOT NULL,
///     start_command TEXT NOT NULL,
///     env_variables TEXT NOT NULL DEFAULT '{}',
///     is_public INTEGER NOT NULL DEFAULT 0,
///     status TEXT NOT NULL DEFAULT 'stopped',
///     file_path TEXT NOT NULL,
///     category TEXT,
///     process_id INTEGER,
///     cpu_usage REAL NOT NULL DEFAULT 0,
///     memory_usage INTEGER NOT NULL DEFAULT 0,
///     uptime INTEGER NOT NULL DEFAULT 0,
///     created_at TEXT NOT NULL,
///     updated_at TEXT NOT NULL
/// );
/// ```
pub struct SqliteRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRepository {
    /// Open (or create) the database at `db_path`. `:memory:` is accepted.
    pub async fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS bots (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT,
                runtime TEXT NOT NULL,
                start_command TEXT NOT NULL,
                env_variables TEXT NOT NULL DEFAULT '{}',
                is_public INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'stopped',
                file_path TEXT NOT NULL,
                category TEXT,
                process_id INTEGER,
                cpu_usage REAL NOT NULL DEFAULT 0,
                memory_usage INTEGER NOT NULL DEFAULT 0,
                uptime INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_bots_status ON bots(status)",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SupervisorError::Repository("sqlite connection poisoned".to_string()))
    }

    fn select_bot(conn: &Connection, id: &str) -> Result<Option<BotRecord>> {
        let bot = conn
            .query_row(
                &format!("SELECT {} FROM bots WHERE id = ?", SELECT_COLUMNS),
                params![id],
                row_to_bot,
            )
            .optional()?;
        Ok(bot)
    }
}

fn conversion_error(
    index: usize,
    err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, Type::Text, err.into())
}

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_bot(row: &Row<'_>) -> rusqlite::Result<BotRecord> {
    let env_json: String = row.get(5)?;
    let env_variables: HashMap<String, String> =
        serde_json::from_str(&env_json).map_err(|e| conversion_error(5, e))?;

    let status: String = row.get(7)?;
    let status: BotStatus = status.parse().map_err(|e: String| conversion_error(7, e))?;

    let file_path: String = row.get(8)?;
    let cpu_usage: f64 = row.get(11)?;
    let memory_usage: i64 = row.get(12)?;
    let uptime: i64 = row.get(13)?;
    let created_at: String = row.get(14)?;
    let updated_at: String = row.get(15)?;

    Ok(BotRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        runtime: row.get(3)?,
        start_command: row.get(4)?,
        env_variables,
        is_public: row.get(6)?,
        status,
        file_path: PathBuf::from(file_path),
        category: row.get(9)?,
        process_id: row.get(10)?,
        cpu_usage: cpu_usage as f32,
        memory_usage: memory_usage.max(0) as u64,
        uptime: uptime.max(0) as u64,
        created_at: parse_timestamp(&created_at),
        updated_at: parse_timestamp(&updated_at),
    })
}

#[async_trait]
impl BotRepository for SqliteRepository {
    async fn get_bot(&self, id: &str) -> Result<Option<BotRecord>> {
        let conn = self.conn()?;
        Self::select_bot(&conn, id)
    }

    async fn update_bot(&self, id: &str, update: BotUpdate) -> Result<Option<BotRecord>> {
        let conn = self.conn()?;

        let Some(mut bot) = Self::select_bot(&conn, id)? else {
            return Ok(None);
        };
        bot.apply(&update);

        conn.execute(
            "UPDATE bots
             SET status = ?2, process_id = ?3, cpu_usage = ?4, memory_usage = ?5,
                 uptime = ?6, updated_at = ?7
             WHERE id = ?1",
            params![
                bot.id,
                bot.status.as_str(),
                bot.process_id,
                bot.cpu_usage as f64,
                bot.memory_usage as i64,
                bot.uptime as i64,
                bot.updated_at.to_rfc3339(),
            ],
        )?;

        Ok(Some(bot))
    }

    async fn delete_bot(&self, id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM bots WHERE id = ?", params![id])?;
        Ok(deleted > 0)
    }

    async fn upsert_bot(&self, bot: BotRecord) -> Result<BotRecord> {
        let conn = self.conn()?;
        let env_json = serde_json::to_string(&bot.env_variables)?;

        conn.execute(
            "INSERT INTO bots (id, name, description, runtime, start_command, env_variables,
                               is_public, status, file_path, category, process_id, cpu_usage,
                               memory_usage, uptime, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                runtime = excluded.runtime,
                start_command = excluded.start_command,
                env_variables = excluded.env_variables,
                is_public = excluded.is_public,
                file_path = excluded.file_path,
                category = excluded.category,
                updated_at = excluded.updated_at",
            params![
                bot.id,
                bot.name,
                bot.description,
                bot.runtime,
                bot.start_command,
                env_json,
                bot.is_public,
                bot.status.as_str(),
                bot.file_path.to_string_lossy().into_owned(),
                bot.category,
                bot.process_id,
                bot.cpu_usage as f64,
                bot.memory_usage as i64,
                bot.uptime as i64,
                bot.created_at.to_rfc3339(),
                Utc::now().to_rfc3339(),
            ],
        )?;

        Self::select_bot(&conn, &bot.id)?
            .ok_or_else(|| SupervisorError::Repository(format!("upsert of {} lost", bot.id)))
    }

    async fn list_bots(&self) -> Result<Vec<BotRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {} FROM bots ORDER BY id", SELECT_COLUMNS))?;
        let bots = stmt
            .query_map([], row_to_bot)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(bots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MetricsSnapshot;

    fn bot(id: &str) -> BotRecord {
        let mut bot = BotRecord::new(id, "Python 3.11", "main.py", format!("/srv/{}/main.py", id));
        bot.env_variables.insert("API_KEY".into(), "secret".into());
        bot.category = Some("utility".into());
        bot
    }

    #[tokio::test]
    async fn test_repository_create() {
        let repo = SqliteRepository::new(":memory:").await.unwrap();
        assert!(repo.list_bots().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upsert_and_get() {
        let repo = SqliteRepository::new(":memory:").await.unwrap();
        repo.upsert_bot(bot("alpha")).await.unwrap();

        let stored = repo.get_bot("alpha").await.unwrap().unwrap();
        assert_eq!(stored.runtime, "Python 3.11");
        assert_eq!(stored.file_path, PathBuf::from("/srv/alpha/main.py"));
        assert_eq!(stored.env_variables.get("API_KEY").map(String::as_str), Some("secret"));
        assert_eq!(stored.category.as_deref(), Some("utility"));
        assert_eq!(stored.status, BotStatus::Stopped);
        assert_eq!(stored.process_id, None);
    }

    #[tokio::test]
    async fn test_update_status_and_metrics() {
        let repo = SqliteRepository::new(":memory:").await.unwrap();
        repo.upsert_bot(bot("alpha")).await.unwrap();

        repo.update_bot("alpha", BotUpdate::running(1234)).await.unwrap();
        repo.update_bot(
            "alpha",
            BotUpdate::metrics(&MetricsSnapshot {
                cpu: 7.5,
                memory: 50 * 1024 * 1024,
                uptime: 15,
            }),
        )
        .await
        .unwrap();

        let stored = repo.get_bot("alpha").await.unwrap().unwrap();
        assert_eq!(stored.status, BotStatus::Running);
        assert_eq!(stored.process_id, Some(1234));
        assert_eq!(stored.cpu_usage, 7.5);
        assert_eq!(stored.memory_usage, 50 * 1024 * 1024);
        assert_eq!(stored.uptime, 15);

        repo.update_bot("alpha", BotUpdate::exited(false)).await.unwrap();
        let stored = repo.get_bot("alpha").await.unwrap().unwrap();
        assert_eq!(stored.status, BotStatus::Error);
        assert_eq!(stored.process_id, None);
    }

    #[tokio::test]
    async fn test_update_unknown_bot() {
        let repo = SqliteRepository::new(":memory:").await.unwrap();
        assert!(repo.update_bot("ghost", BotUpdate::stopped()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_keeps_runtime_state() {
        let repo = SqliteRepository::new(":memory:").await.unwrap();
        repo.upsert_bot(bot("alpha")).await.unwrap();
        repo.update_bot("alpha", BotUpdate::running(99)).await.unwrap();

        let mut changed = bot("alpha");
        changed.start_command = "python3 -u main.py".into();
        let stored = repo.upsert_bot(changed).await.unwrap();

        assert_eq!(stored.start_command, "python3 -u main.py");
        assert_eq!(stored.status, BotStatus::Running);
        assert_eq!(stored.process_id, Some(99));
    }

    #[tokio::test]
    async fn test_delete_and_list() {
        let repo = SqliteRepository::new(":memory:").await.unwrap();
        repo.upsert_bot(bot("b")).await.unwrap();
        repo.upsert_bot(bot("a")).await.unwrap();

        let ids: Vec<String> = repo.list_bots().await.unwrap().into_iter().map(|b| b.id).collect();
        assert_eq!(ids, vec!["a", "b"]);

        assert!(repo.delete_bot("a").await.unwrap());
        assert!(!repo.delete_bot("a").await.unwrap());
        assert_eq!(repo.list_bots().await.unwrap().len(), 1);
    }
}
