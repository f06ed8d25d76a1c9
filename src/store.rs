use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::conversation::{Conversation, ConversationId, Message, MessageId, Role, Source};
use crate::error::Result;

/// Persistence for conversations.  The orchestrator only sees this trait.
#[async_trait::async_trait]
pub trait ConversationStore: Send + Sync {
    /// Insert or fully replace a conversation and its messages.
    async fn save(&self, conversation: &Conversation) -> Result<()>;

    async fn load(&self, id: ConversationId) -> Result<Option<Conversation>>;

    /// Conversations ordered by most recent activity.
    async fn list(&self) -> Result<Vec<ConversationSummary>>;

    async fn delete(&self, id: ConversationId) -> Result<bool>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub title: String,
    pub message_count: usize,
    pub updated_at: DateTime<Utc>,
}

/// SQLite-backed store.
pub struct SqliteStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        info!("opening database at {}", path.display());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;

        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        migrate(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        migrate(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }
}

pub(crate) fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS conversations (
            id          TEXT PRIMARY KEY,
            title       TEXT NOT NULL,
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS messages (
            id              TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
            position        INTEGER NOT NULL,
            role            TEXT NOT NULL,
            text            TEXT NOT NULL DEFAULT '',
            created_at      TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, position);
        CREATE INDEX IF NOT EXISTS idx_conversations_updated ON conversations(updated_at);
        ",
    )?;

    add_column_if_missing(conn, "messages", "sources_json", "TEXT NOT NULL DEFAULT '[]'");
    // NULL = not yet classified
    add_column_if_missing(conn, "messages", "censored", "INTEGER");

    debug!("database migrations complete");
    Ok(())
}

fn add_column_if_missing(conn: &Connection, table: &str, column: &str, col_type: &str) {
    let has_col = conn
        .prepare(&format!("SELECT {column} FROM {table} LIMIT 0"))
        .is_ok();
    if !has_col {
        let sql = format!("ALTER TABLE {table} ADD COLUMN {column} {col_type}");
        if let Err(e) = conn.execute_batch(&sql) {
            tracing::warn!(table, column, err = %e, "failed to add column (may already exist)");
        } else {
            info!(table, column, "added column via migration");
        }
    }
}

fn parse_time(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_uuid(idx: usize, raw: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

#[async_trait::async_trait]
impl ConversationStore for SqliteStore {
    async fn save(&self, conversation: &Conversation) -> Result<()> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;

        tx.execute(
            "INSERT INTO conversations (id, title, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET title = excluded.title, updated_at = excluded.updated_at",
            params![
                conversation.id.to_string(),
                conversation.title,
                conversation.created_at.to_rfc3339(),
                conversation.updated_at.to_rfc3339(),
            ],
        )?;
        tx.execute(
            "DELETE FROM messages WHERE conversation_id = ?1",
            [conversation.id.to_string()],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO messages (id, conversation_id, position, role, text, sources_json, censored, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for (position, m) in conversation.messages.iter().enumerate() {
                stmt.execute(params![
                    m.id.to_string(),
                    conversation.id.to_string(),
                    position as i64,
                    m.role.as_str(),
                    m.text,
                    serde_json::to_string(&m.sources)?,
                    m.censored,
                    m.created_at.to_rfc3339(),
                ])?;
            }
        }
        tx.commit()?;

        debug!(
            conversation = %conversation.id,
            messages = conversation.messages.len(),
            "conversation saved"
        );
        Ok(())
    }

    async fn load(&self, id: ConversationId) -> Result<Option<Conversation>> {
        let db = self.db.lock().await;

        let header = db
            .query_row(
                "SELECT title, created_at, updated_at FROM conversations WHERE id = ?1",
                [id.to_string()],
                |row| {
                    let title: String = row.get(0)?;
                    let created: String = row.get(1)?;
                    let updated: String = row.get(2)?;
                    Ok((title, parse_time(1, &created)?, parse_time(2, &updated)?))
                },
            )
            .optional()?;

        let Some((title, created_at, updated_at)) = header else {
            return Ok(None);
        };

        let mut stmt = db.prepare(
            "SELECT id, role, text, sources_json, censored, created_at FROM messages
             WHERE conversation_id = ?1 ORDER BY position",
        )?;
        let rows = stmt.query_map([id.to_string()], |row| {
            let msg_id: String = row.get(0)?;
            let role: String = row.get(1)?;
            let sources: String = row.get(3)?;
            let created: String = row.get(5)?;
            Ok(Message {
                id: MessageId(parse_uuid(0, &msg_id)?),
                role: Role::parse(&role).unwrap_or(Role::Assistant),
                text: row.get(2)?,
                sources: serde_json::from_str::<Vec<Source>>(&sources).unwrap_or_default(),
                censored: row.get(4)?,
                created_at: parse_time(5, &created)?,
            })
        })?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }

        Ok(Some(Conversation {
            id,
            title,
            messages,
            created_at,
            updated_at,
        }))
    }

    async fn list(&self) -> Result<Vec<ConversationSummary>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT c.id, c.title, c.updated_at, COUNT(m.id) FROM conversations c
             LEFT JOIN messages m ON m.conversation_id = c.id
             GROUP BY c.id ORDER BY c.updated_at DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            let id: String = row.get(0)?;
            let updated: String = row.get(2)?;
            let count: i64 = row.get(3)?;
            Ok(ConversationSummary {
                id: ConversationId(parse_uuid(0, &id)?),
                title: row.get(1)?,
                message_count: count as usize,
                updated_at: parse_time(2, &updated)?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    async fn delete(&self, id: ConversationId) -> Result<bool> {
        let db = self.db.lock().await;
        let changed = db.execute("DELETE FROM conversations WHERE id = ?1", [id.to_string()])?;
        Ok(changed > 0)
    }
}
