//! Read-only access to the SQLite store a crush run writes into its data dir.

use std::path::Path;

use serde::Serialize;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::error::StoreError;

/// File name of the database inside the data directory.
pub const DB_FILE: &str = "crush.db";

const ROOT_SESSIONS_SQL: &str = r#"
SELECT id, title, prompt_tokens, completion_tokens, cost, created_at, updated_at
FROM sessions
WHERE parent_session_id IS NULL
"#;

const SESSION_TREE_SQL: &str = r#"
SELECT id, title, prompt_tokens, completion_tokens, cost, created_at, updated_at
FROM sessions
WHERE id = ?1 OR parent_session_id = ?1
ORDER BY created_at ASC
"#;

const ASSISTANT_MODELS_SQL: &str = r#"
SELECT DISTINCT model
FROM messages
WHERE session_id = ?1
  AND role = 'assistant'
  AND COALESCE(is_summary_message, 0) = 0
ORDER BY model ASC
"#;

const LLM_CALLS_SQL: &str = r#"
SELECT COUNT(*) AS llm_calls
FROM messages
WHERE session_id IN (SELECT id FROM sessions WHERE id = ?1 OR parent_session_id = ?1)
  AND role = 'assistant'
  AND COALESCE(is_summary_message, 0) = 0
"#;

const TOOL_CALLS_SQL: &str = r#"
SELECT COUNT(*) AS tool_calls
FROM messages m, json_each(m.parts) p
WHERE m.session_id IN (SELECT id FROM sessions WHERE id = ?1 OR parent_session_id = ?1)
  AND m.role = 'assistant'
  AND COALESCE(m.is_summary_message, 0) = 0
  AND json_extract(p.value, '$.type') = 'tool_call'
"#;

const MESSAGES_SQL: &str = r#"
SELECT id, session_id, role, model, provider, is_summary_message, created_at, finished_at, parts
FROM messages
WHERE session_id IN (SELECT id FROM sessions WHERE id = ?1 OR parent_session_id = ?1)
ORDER BY created_at ASC
"#;

/// One row of the `sessions` table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CrushSession {
    pub id: String,
    pub title: Option<String>,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub cost: f64,
    pub created_at: Option<i64>,
    pub updated_at: Option<i64>,
}

/// One row of the `messages` table with `parts` decoded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CrushMessage {
    pub id: String,
    pub session_id: String,
    pub role: String,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub is_summary_message: Option<i64>,
    pub created_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub parts: Value,
}

/// Aggregates for a root session and its child sessions.
#[derive(Debug, Clone, PartialEq)]
pub struct CrushTotals {
    pub root: CrushSession,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost: f64,
    pub llm_calls: u64,
    pub tool_calls: u64,
}

/// Read-only connection to a run's crush database.
#[derive(Clone)]
pub struct CrushStore {
    pool: SqlitePool,
}

impl CrushStore {
    /// Opens `<data_dir>/crush.db` read-only.
    pub async fn open(data_dir: &Path) -> Result<Self, StoreError> {
        let path = data_dir.join(DB_FILE);
        if !path.is_file() {
            return Err(StoreError::NotFound(path));
        }

        let opts = SqliteConnectOptions::new().filename(&path).read_only(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;

        debug!(path = %path.display(), "crush store opened");
        Ok(Self { pool })
    }

    /// The single root session of the run.
    pub async fn root_session(&self) -> Result<CrushSession, StoreError> {
        let rows = sqlx::query(ROOT_SESSIONS_SQL).fetch_all(&self.pool).await?;
        if rows.len() != 1 {
            return Err(StoreError::Shape(format!(
                "expected exactly one root session, found {}",
                rows.len()
            )));
        }
        session_from_row(&rows[0])
    }

    /// The root session and its direct children.
    pub async fn session_tree(&self, root_id: &str) -> Result<Vec<CrushSession>, StoreError> {
        let rows = sqlx::query(SESSION_TREE_SQL)
            .bind(root_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(session_from_row).collect()
    }

    /// The one model used by assistant messages of a session.
    pub async fn assistant_model(&self, session_id: &str) -> Result<String, StoreError> {
        let rows = sqlx::query(ASSISTANT_MODELS_SQL)
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?;
        let mut models = Vec::with_capacity(rows.len());
        for row in &rows {
            let model: Option<String> = row.try_get("model")?;
            match model.map(|m| m.trim().to_string()).filter(|m| !m.is_empty()) {
                Some(model) => models.push(model),
                None => {
                    return Err(StoreError::Shape(
                        "assistant message without a model".to_string(),
                    ))
                }
            }
        }
        if models.len() != 1 {
            return Err(StoreError::Shape(format!(
                "expected exactly one assistant model, found {}",
                models.len()
            )));
        }
        Ok(models.remove(0))
    }

    pub async fn llm_calls(&self, root_id: &str) -> Result<u64, StoreError> {
        count(&self.pool, LLM_CALLS_SQL, root_id, "llm_calls").await
    }

    pub async fn tool_calls(&self, root_id: &str) -> Result<u64, StoreError> {
        count(&self.pool, TOOL_CALLS_SQL, root_id, "tool_calls").await
    }

    /// All messages of the session tree, oldest first.
    pub async fn messages(&self, root_id: &str) -> Result<Vec<CrushMessage>, StoreError> {
        let rows = sqlx::query(MESSAGES_SQL)
            .bind(root_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(message_from_row).collect()
    }

    /// Runs every documented query and aggregates the results.
    pub async fn totals(&self) -> Result<CrushTotals, StoreError> {
        let root = self.root_session().await?;
        let model = self.assistant_model(&root.id).await?;
        let tree = self.session_tree(&root.id).await?;

        let mut prompt_tokens = 0u64;
        let mut completion_tokens = 0u64;
        let mut cost = 0.0;
        for session in &tree {
            prompt_tokens += non_negative(session.prompt_tokens, "prompt_tokens")?;
            completion_tokens += non_negative(session.completion_tokens, "completion_tokens")?;
            cost += session.cost;
        }

        let llm_calls = self.llm_calls(&root.id).await?;
        let tool_calls = self.tool_calls(&root.id).await?;

        Ok(CrushTotals {
            root,
            model,
            prompt_tokens,
            completion_tokens,
            cost,
            llm_calls,
            tool_calls,
        })
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

async fn count(pool: &SqlitePool, sql: &str, root_id: &str, column: &str) -> Result<u64, StoreError> {
    let row = sqlx::query(sql).bind(root_id).fetch_one(pool).await?;
    let value: i64 = row.try_get(column)?;
    non_negative(value, column)
}

fn non_negative(value: i64, column: &str) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Shape(format!("negative {}: {}", column, value)))
}

fn session_from_row(row: &SqliteRow) -> Result<CrushSession, StoreError> {
    let id: String = row.try_get("id")?;
    if id.trim().is_empty() {
        return Err(StoreError::Shape("session with empty id".to_string()));
    }
    Ok(CrushSession {
        id,
        title: row.try_get("title")?,
        prompt_tokens: row.try_get("prompt_tokens")?,
        completion_tokens: row.try_get("completion_tokens")?,
        cost: row.try_get("cost")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<CrushMessage, StoreError> {
    let parts: Option<String> = row.try_get("parts")?;
    let parts = match parts {
        Some(text) => serde_json::from_str(&text).unwrap_or(Value::String(text)),
        None => Value::Null,
    };
    Ok(CrushMessage {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        role: row.try_get("role")?,
        model: row.try_get("model")?,
        provider: row.try_get("provider")?,
        is_summary_message: row.try_get("is_summary_message")?,
        created_at: row.try_get("created_at")?,
        finished_at: row.try_get("finished_at")?,
        parts,
    })
}
