use crate::constants::DB_PRAGMAS;
use crate::types::{ChatMessage, ChatStreamError, MessageId, Result, Role, ThreadId};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::RwLock;

pub type DbPool = SqlitePool;

/// Persistence for finished chat records.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn save(&self, thread_id: &ThreadId, message: &ChatMessage) -> Result<()>;
    /// Messages of one thread, oldest first.
    async fn load(&self, thread_id: &ThreadId) -> Result<Vec<ChatMessage>>;
    async fn delete(&self, thread_id: &ThreadId) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryChatStore {
    threads: RwLock<HashMap<ThreadId, Vec<ChatMessage>>>,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn save(&self, thread_id: &ThreadId, message: &ChatMessage) -> Result<()> {
        let mut threads = self.threads.write().await;
        let messages = threads.entry(thread_id.clone()).or_default();
        match messages.iter_mut().find(|m| m.id == message.id) {
            Some(existing) => *existing = message.clone(),
            None => messages.push(message.clone()),
        }
        Ok(())
    }

    async fn load(&self, thread_id: &ThreadId) -> Result<Vec<ChatMessage>> {
        let threads = self.threads.read().await;
        let mut messages = threads.get(thread_id).cloned().unwrap_or_default();
        messages.sort_by_key(|m| m.created_at);
        Ok(messages)
    }

    async fn delete(&self, thread_id: &ThreadId) -> Result<()> {
        self.threads.write().await.remove(thread_id);
        Ok(())
    }
}

pub struct SqliteChatStore {
    pool: DbPool,
}

impl SqliteChatStore {
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_str = match path.as_ref().to_str() {
            Some(s) => s,
            None => {
                return Err(ChatStreamError::Config(
                    "Invalid database path: Path contains non-UTF8 characters".to_string(),
                )
                .into())
            }
        };
        let url = format!("sqlite:{}?mode=rwc", path_str);
        let pool = SqlitePool::connect(&url).await?;

        configure_db(&pool).await?;

        if let Err(e) = sqlx::migrate!("./migrations").run(&pool).await {
            return Err(ChatStreamError::Internal(
                format!("Migration failed: {}", e),
                tracing_error::SpanTrace::capture(),
            )
            .into());
        }

        verify_schema_version(&pool).await;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

async fn configure_db(pool: &DbPool) -> Result<()> {
    for pragma in DB_PRAGMAS.iter().copied() {
        sqlx::query(pragma).execute(pool).await?;
    }
    Ok(())
}

async fn verify_schema_version(pool: &DbPool) {
    let version_row: std::result::Result<(String,), sqlx::Error> =
        sqlx::query_as("SELECT value FROM schema_metadata WHERE key = 'schema_version'")
            .fetch_one(pool)
            .await;

    match version_row {
        Ok((version,)) => {
            tracing::info!("Database initialized. Schema version: {}", version);
        }
        Err(e) => {
            tracing::warn!("Could not verify schema version: {}", e);
        }
    }
}

fn corrupt_row(what: &str, value: &str) -> ChatStreamError {
    ChatStreamError::Internal(
        format!("Stored message has invalid {}: {}", what, value),
        tracing_error::SpanTrace::capture(),
    )
}

#[async_trait]
impl ChatStore for SqliteChatStore {
    async fn save(&self, thread_id: &ThreadId, message: &ChatMessage) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO messages (id, thread_id, role, content, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(message.id.to_string())
        .bind(thread_id.0.as_str())
        .bind(message.role.as_str())
        .bind(message.content.as_str())
        .bind(message.created_at.to_rfc3339_opts(SecondsFormat::Micros, true))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load(&self, thread_id: &ThreadId) -> Result<Vec<ChatMessage>> {
        let rows = sqlx::query(
            "SELECT id, role, content, created_at FROM messages WHERE thread_id = ? ORDER BY created_at ASC, rowid ASC",
        )
        .bind(thread_id.0.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id")?;
            let role: String = row.try_get("role")?;
            let content: String = row.try_get("content")?;
            let created_at: String = row.try_get("created_at")?;

            let id = uuid::Uuid::parse_str(&id).map_err(|_| corrupt_row("id", &id))?;
            let role = Role::parse(&role).ok_or_else(|| corrupt_row("role", &role))?;
            let created_at = DateTime::parse_from_rfc3339(&created_at)
                .map_err(|_| corrupt_row("timestamp", &created_at))?
                .with_timezone(&Utc);

            messages.push(ChatMessage {
                id: MessageId(id),
                thread_id: thread_id.clone(),
                role,
                content,
                created_at,
            });
        }
        Ok(messages)
    }

    async fn delete(&self, thread_id: &ThreadId) -> Result<()> {
        let deleted = sqlx::query("DELETE FROM messages WHERE thread_id = ?")
            .bind(thread_id.0.as_str())
            .execute(&self.pool)
            .await?;
        tracing::debug!(
            "Deleted {} message(s) of thread {}",
            deleted.rows_affected(),
            thread_id.short()
        );
        Ok(())
    }
}
