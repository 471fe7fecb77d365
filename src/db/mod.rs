//! Durable store
//!
//! Typed CRUD over an embedded SQLite database: sessions, messages,
//! file-version snapshots, and persisted auto-approvals. Every successful
//! mutation publishes a snapshot event on the bus strictly after the
//! commit, so a subscriber that reads the store after observing an event
//! always finds a state at least as recent as the event.
//!
//! The pool is capped at one connection, which serialises all writes.
//! Only per-session serialisation is actually required, so this is the
//! conservative choice.

use crate::bus::{Bus, EventKind};
use crate::message::{ContentPart, Message, Role};
use crate::session::{FileVersion, Session, INITIAL_VERSION};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Streaming updates to the same message within this window are merged
/// into one commit. The window also bounds worst-case flush latency: the
/// timer starts at the first staged update, so no delta waits longer than
/// one window.
const COALESCE_WINDOW: Duration = Duration::from_millis(50);

pub struct Store {
    pool: SqlitePool,
    bus: Arc<Bus>,
    /// Streaming writes staged per message id, awaiting their flush timer.
    staged: Arc<Mutex<HashMap<String, Message>>>,
}

impl Store {
    pub async fn open(path: &Path, bus: Arc<Bus>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .context("Invalid database path")?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);
        Self::connect(options, bus).await
    }

    pub async fn in_memory(bus: Arc<Bus>) -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("Invalid database path")?
            .foreign_keys(true);
        Self::connect(options, bus).await
    }

    async fn connect(options: SqliteConnectOptions, bus: Arc<Bus>) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("Failed to open database")?;
        let store = Self {
            pool,
            bus,
            staged: Arc::new(Mutex::new(HashMap::new())),
        };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                parent_id TEXT,
                title TEXT NOT NULL DEFAULT '',
                prompt_tokens INTEGER NOT NULL DEFAULT 0,
                completion_tokens INTEGER NOT NULL DEFAULT 0,
                cost REAL NOT NULL DEFAULT 0,
                message_count INTEGER NOT NULL DEFAULT 0,
                summary_message_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create sessions table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                role TEXT NOT NULL,
                parts TEXT NOT NULL,
                model TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                finished_at TEXT,
                FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create messages table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS files (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                path TEXT NOT NULL,
                content TEXT NOT NULL,
                version TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create files table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS approvals (
                session_id TEXT NOT NULL,
                tool TEXT NOT NULL,
                path TEXT NOT NULL,
                PRIMARY KEY (session_id, tool, path),
                FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create approvals table")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_files_session ON files(session_id, path)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ── Sessions ─────────────────────────────────────────────────────

    pub async fn create_session(&self, parent_id: Option<&str>) -> Result<Session> {
        let session = Session::new(parent_id.map(|s| s.to_string()));
        sqlx::query(
            r#"
            INSERT INTO sessions (id, parent_id, title, prompt_tokens, completion_tokens,
                                  cost, message_count, summary_message_id, created_at, updated_at)
            VALUES (?1, ?2, ?3, 0, 0, 0, 0, NULL, ?4, ?5)
            "#,
        )
        .bind(&session.id)
        .bind(&session.parent_id)
        .bind(&session.title)
        .bind(session.created_at.to_rfc3339())
        .bind(session.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("Failed to insert session")?;

        self.bus.sessions.publish(EventKind::Created, session.clone());
        Ok(session)
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch session")?;
        row.map(session_from_row).transpose()
    }

    pub async fn list_sessions(&self) -> Result<Vec<Session>> {
        let rows = sqlx::query("SELECT * FROM sessions ORDER BY updated_at DESC")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list sessions")?;
        rows.into_iter().map(session_from_row).collect()
    }

    pub async fn update_session_title(&self, id: &str, title: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET title = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(title)
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to update session title")?;
        self.publish_session_updated(id).await
    }

    /// Add token usage and cost to a session. Counters only grow.
    pub async fn add_usage(
        &self,
        id: &str,
        prompt_tokens: i64,
        completion_tokens: i64,
        cost: f64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sessions
            SET prompt_tokens = prompt_tokens + ?1,
                completion_tokens = completion_tokens + ?2,
                cost = cost + ?3,
                updated_at = ?4
            WHERE id = ?5
            "#,
        )
        .bind(prompt_tokens.max(0))
        .bind(completion_tokens.max(0))
        .bind(cost.max(0.0))
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to add session usage")?;
        self.publish_session_updated(id).await
    }

    pub async fn set_summary_message(&self, id: &str, message_id: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET summary_message_id = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(message_id)
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to set summary message")?;
        self.publish_session_updated(id).await
    }

    pub async fn delete_session(&self, id: &str) -> Result<()> {
        let session = self.get_session(id).await?;
        sqlx::query("DELETE FROM sessions WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to delete session")?;
        if let Some(session) = session {
            self.bus.sessions.publish(EventKind::Deleted, session);
        }
        Ok(())
    }

    async fn publish_session_updated(&self, id: &str) -> Result<()> {
        if let Some(session) = self.get_session(id).await? {
            self.bus.sessions.publish(EventKind::Updated, session);
        }
        Ok(())
    }

    // ── Messages ─────────────────────────────────────────────────────

    pub async fn create_message(&self, message: &Message) -> Result<()> {
        let parts =
            serde_json::to_string(&message.parts).context("Failed to serialize message parts")?;
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        sqlx::query(
            r#"
            INSERT INTO messages (id, session_id, role, parts, model, created_at, updated_at, finished_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(&message.id)
        .bind(&message.session_id)
        .bind(role_str(message.role))
        .bind(parts)
        .bind(&message.model)
        .bind(message.created_at.to_rfc3339())
        .bind(message.updated_at.to_rfc3339())
        .bind(message.finished_at.map(|t| t.to_rfc3339()))
        .execute(&mut *tx)
        .await
        .context("Failed to insert message")?;

        sqlx::query(
            "UPDATE sessions SET message_count = message_count + 1, updated_at = ?1 WHERE id = ?2",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(&message.session_id)
        .execute(&mut *tx)
        .await
        .context("Failed to bump message count")?;
        tx.commit().await.context("Failed to commit message")?;

        self.bus.messages.publish(EventKind::Created, message.clone());
        self.publish_session_updated(&message.session_id).await
    }

    /// Commit a message update immediately, discarding any staged
    /// streaming write for the same id. The `finished` transition always
    /// goes through here so it is never coalesced away.
    pub async fn update_message(&self, message: &Message) -> Result<()> {
        self.staged.lock().remove(&message.id);
        persist_update(&self.pool, &self.bus, message).await
    }

    /// Stage a streaming update. Bursts within the coalescing window are
    /// merged into one commit; the last staged snapshot always lands.
    pub fn write_message_streaming(&self, message: &Message) {
        let first = {
            let mut staged = self.staged.lock();
            let first = !staged.contains_key(&message.id);
            staged.insert(message.id.clone(), message.clone());
            first
        };
        if !first {
            return;
        }
        let id = message.id.clone();
        let pool = self.pool.clone();
        let bus = self.bus.clone();
        let staged = self.staged.clone();
        tokio::spawn(async move {
            tokio::time::sleep(COALESCE_WINDOW).await;
            let snapshot = staged.lock().remove(&id);
            if let Some(msg) = snapshot {
                if let Err(err) = persist_update(&pool, &bus, &msg).await {
                    tracing::error!(message_id = %id, error = %err, "Streaming flush failed");
                }
            }
        });
    }

    /// Flush any staged streaming write for a message right now.
    pub async fn flush_message(&self, message_id: &str) -> Result<()> {
        let snapshot = self.staged.lock().remove(message_id);
        if let Some(msg) = snapshot {
            persist_update(&self.pool, &self.bus, &msg).await?;
        }
        Ok(())
    }

    pub async fn get_message(&self, id: &str) -> Result<Option<Message>> {
        let row = sqlx::query("SELECT * FROM messages WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch message")?;
        row.map(message_from_row).transpose()
    }

    /// Messages of a session in insertion order.
    pub async fn list_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        let rows = sqlx::query("SELECT * FROM messages WHERE session_id = ?1 ORDER BY rowid")
            .bind(session_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list messages")?;
        rows.into_iter().map(message_from_row).collect()
    }

    pub async fn delete_message(&self, id: &str) -> Result<()> {
        let message = self.get_message(id).await?;
        let Some(message) = message else { return Ok(()) };
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        sqlx::query("DELETE FROM messages WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .context("Failed to delete message")?;
        sqlx::query(
            "UPDATE sessions SET message_count = message_count - 1, updated_at = ?1 WHERE id = ?2",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(&message.session_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await.context("Failed to commit delete")?;
        let session_id = message.session_id.clone();
        self.bus.messages.publish(EventKind::Deleted, message);
        self.publish_session_updated(&session_id).await
    }

    // ── File versions ────────────────────────────────────────────────

    /// Record a snapshot of a file the session touched. The first
    /// snapshot for a `(session, path)` pair is labelled `initial`;
    /// later ones get monotonic `v1`, `v2`, ... tags.
    pub async fn create_file_version(
        &self,
        session_id: &str,
        path: &str,
        content: &str,
    ) -> Result<FileVersion> {
        let existing: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM files WHERE session_id = ?1 AND path = ?2",
        )
        .bind(session_id)
        .bind(path)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count file versions")?;

        let version = if existing == 0 {
            INITIAL_VERSION.to_string()
        } else {
            format!("v{existing}")
        };
        let file = FileVersion::new(session_id, path, content, version);
        sqlx::query(
            r#"
            INSERT INTO files (id, session_id, path, content, version, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&file.id)
        .bind(&file.session_id)
        .bind(&file.path)
        .bind(&file.content)
        .bind(&file.version)
        .bind(file.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("Failed to insert file version")?;

        self.bus.files.publish(EventKind::Created, file.clone());
        Ok(file)
    }

    pub async fn has_file_version(&self, session_id: &str, path: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM files WHERE session_id = ?1 AND path = ?2",
        )
        .bind(session_id)
        .bind(path)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    pub async fn list_file_versions(&self, session_id: &str) -> Result<Vec<FileVersion>> {
        let rows = sqlx::query("SELECT * FROM files WHERE session_id = ?1 ORDER BY rowid")
            .bind(session_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list file versions")?;
        rows.into_iter().map(file_from_row).collect()
    }

    // ── Auto-approvals ───────────────────────────────────────────────

    pub async fn add_approval(&self, session_id: &str, tool: &str, path: &str) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO approvals (session_id, tool, path) VALUES (?1, ?2, ?3)",
        )
        .bind(session_id)
        .bind(tool)
        .bind(path)
        .execute(&self.pool)
        .await
        .context("Failed to insert approval")?;
        Ok(())
    }

    pub async fn has_approval(&self, session_id: &str, tool: &str, path: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM approvals WHERE session_id = ?1 AND tool = ?2 AND path = ?3",
        )
        .bind(session_id)
        .bind(tool)
        .bind(path)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }
}

/// Commit a message update. Rows already carrying `finished_at` are left
/// untouched, which keeps finished messages immutable even if a stale
/// streaming flush races a finish.
async fn persist_update(pool: &SqlitePool, bus: &Bus, message: &Message) -> Result<()> {
    let parts =
        serde_json::to_string(&message.parts).context("Failed to serialize message parts")?;
    let result = sqlx::query(
        r#"
        UPDATE messages
        SET parts = ?1, updated_at = ?2, finished_at = ?3
        WHERE id = ?4 AND finished_at IS NULL
        "#,
    )
    .bind(parts)
    .bind(message.updated_at.to_rfc3339())
    .bind(message.finished_at.map(|t| t.to_rfc3339()))
    .bind(&message.id)
    .execute(pool)
    .await
    .context("Failed to update message")?;

    if result.rows_affected() > 0 {
        bus.messages.publish(EventKind::Updated, message.clone());
    }
    Ok(())
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn role_from_str(s: &str) -> Result<Role> {
    Ok(match s {
        "system" => Role::System,
        "user" => Role::User,
        "assistant" => Role::Assistant,
        "tool" => Role::Tool,
        other => anyhow::bail!("Unknown message role: {other}"),
    })
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Bad timestamp: {s}"))?
        .with_timezone(&Utc))
}

fn session_from_row(row: sqlx::sqlite::SqliteRow) -> Result<Session> {
    Ok(Session {
        id: row.try_get("id")?,
        parent_id: row.try_get("parent_id")?,
        title: row.try_get("title")?,
        prompt_tokens: row.try_get("prompt_tokens")?,
        completion_tokens: row.try_get("completion_tokens")?,
        cost: row.try_get("cost")?,
        message_count: row.try_get("message_count")?,
        summary_message_id: row.try_get("summary_message_id")?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?)?,
    })
}

fn message_from_row(row: sqlx::sqlite::SqliteRow) -> Result<Message> {
    let parts: Vec<ContentPart> = serde_json::from_str(&row.try_get::<String, _>("parts")?)
        .context("Failed to deserialize message parts")?;
    Ok(Message {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        role: role_from_str(&row.try_get::<String, _>("role")?)?,
        parts,
        model: row.try_get("model")?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?)?,
        finished_at: row
            .try_get::<Option<String>, _>("finished_at")?
            .map(|s| parse_ts(&s))
            .transpose()?,
    })
}

fn file_from_row(row: sqlx::sqlite::SqliteRow) -> Result<FileVersion> {
    Ok(FileVersion {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        path: row.try_get("path")?,
        content: row.try_get("content")?,
        version: row.try_get("version")?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
    })
}
