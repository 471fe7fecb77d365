//! Session domain types
//!
//! Sessions own their messages, file-version snapshots, and permission
//! requests. The structs here are the snapshots that travel through the
//! store and the event bus; all mutation goes through `db::Store`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A conversation session.
///
/// Token counters and cost only ever grow; `message_count` tracks the
/// number of non-deleted messages. `parent_id` is set iff the session was
/// spawned by a delegated sub-task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub parent_id: Option<String>,
    pub title: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub cost: f64,
    pub message_count: i64,
    pub summary_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(parent_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            parent_id,
            title: String::new(),
            prompt_tokens: 0,
            completion_tokens: 0,
            cost: 0.0,
            message_count: 0,
            summary_message_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A stored snapshot of a file the session touched.
///
/// The first version for a `(session, path)` pair is labelled `initial`
/// and holds the on-disk content before the session's first read or
/// write; later versions carry monotonic `v1`, `v2`, ... tags. Used for
/// the UI modified-files panel, not for inference correctness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileVersion {
    pub id: String,
    pub session_id: String,
    pub path: String,
    pub content: String,
    pub version: String,
    pub created_at: DateTime<Utc>,
}

pub const INITIAL_VERSION: &str = "initial";

impl FileVersion {
    pub fn new(
        session_id: impl Into<String>,
        path: impl Into<String>,
        content: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            path: path.into(),
            content: content.into(),
            version: version.into(),
            created_at: Utc::now(),
        }
    }
}
