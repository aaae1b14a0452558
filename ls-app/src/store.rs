//! SQLite persistence for conversations, comparisons and stored API keys.
//!
//! One connection behind a mutex; every query runs on the blocking pool so
//! handlers never hold the lock across an await point.

use crate::error::ApiError;
use chrono::{DateTime, Utc};
use ls_llm::{InvocationResult, Provider, Role};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS conversations (
    id              TEXT PRIMARY KEY,
    user_id         TEXT NOT NULL,
    provider        TEXT NOT NULL,
    model           TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    last_message_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS messages (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    role            TEXT NOT NULL,
    content         TEXT NOT NULL,
    created_at      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id);
CREATE TABLE IF NOT EXISTS comparisons (
    id              TEXT PRIMARY KEY,
    user_id         TEXT NOT NULL,
    prompt          TEXT NOT NULL,
    results         TEXT NOT NULL,
    preferred_index INTEGER,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS api_keys (
    user_id  TEXT NOT NULL,
    provider TEXT NOT NULL,
    api_key  TEXT NOT NULL,
    PRIMARY KEY (user_id, provider)
);
";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    #[serde(skip_serializing)]
    pub user_id: String,
    pub provider: Provider,
    pub model: String,
    pub created_at: DateTime<Utc>,
    pub last_message_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub id: i64,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Comparison {
    pub id: String,
    #[serde(skip_serializing)]
    pub user_id: String,
    pub prompt: String,
    pub results: Vec<InvocationResult>,
    pub preferred_index: Option<usize>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct Store {
    db: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> anyhow::Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    async fn call<T, F>(&self, f: F) -> Result<T, ApiError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let conn = db.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&conn)
        })
        .await
        .map_err(|e| ApiError::Internal(format!("storage task join failed: {e}")))?
        .map_err(|e| ApiError::Store(e.to_string()))
    }

    /// Find or create the conversation a chat turn belongs to.
    ///
    /// With an id: the conversation must exist and belong to the user; if the
    /// caller switched provider or model mid-conversation the row is updated
    /// to match. Without an id: a fresh conversation is created.
    pub async fn ensure_conversation(
        &self,
        user_id: &str,
        provider: Provider,
        model: &str,
        conversation_id: Option<String>,
    ) -> Result<Conversation, ApiError> {
        let user_id = user_id.to_string();
        let model = model.to_string();
        match conversation_id {
            Some(id) => {
                let found = self
                    .call(move |conn| {
                        let existing = conn
                            .query_row(
                                "SELECT id, user_id, provider, model, created_at, last_message_at
                                 FROM conversations WHERE id = ?1 AND user_id = ?2",
                                params![id, user_id],
                                conversation_from_row,
                            )
                            .optional()?;
                        let Some(mut conversation) = existing else {
                            return Ok(None);
                        };
                        if conversation.provider != provider || conversation.model != model {
                            let now = Utc::now();
                            conn.execute(
                                "UPDATE conversations
                                 SET provider = ?1, model = ?2, last_message_at = ?3
                                 WHERE id = ?4",
                                params![
                                    provider.as_str(),
                                    model,
                                    now.to_rfc3339(),
                                    conversation.id
                                ],
                            )?;
                            conversation.provider = provider;
                            conversation.model = model;
                            conversation.last_message_at = now;
                        }
                        Ok(Some(conversation))
                    })
                    .await?;
                found.ok_or_else(|| ApiError::NotFound("conversation not found".to_string()))
            }
            None => {
                self.call(move |conn| {
                    let now = Utc::now();
                    let conversation = Conversation {
                        id: Uuid::new_v4().to_string(),
                        user_id,
                        provider,
                        model,
                        created_at: now,
                        last_message_at: now,
                    };
                    conn.execute(
                        "INSERT INTO conversations
                         (id, user_id, provider, model, created_at, last_message_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        params![
                            conversation.id,
                            conversation.user_id,
                            conversation.provider.as_str(),
                            conversation.model,
                            conversation.created_at.to_rfc3339(),
                            conversation.last_message_at.to_rfc3339(),
                        ],
                    )?;
                    Ok(conversation)
                })
                .await
            }
        }
    }

    /// Append one message and bump the conversation's `last_message_at`.
    pub async fn append_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str,
    ) -> Result<(), ApiError> {
        let conversation_id = conversation_id.to_string();
        let content = content.to_string();
        self.call(move |conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO messages (conversation_id, role, content, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![conversation_id, role.as_str(), content, now],
            )?;
            conn.execute(
                "UPDATE conversations SET last_message_at = ?1 WHERE id = ?2",
                params![now, conversation_id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>, ApiError> {
        let user_id = user_id.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, provider, model, created_at, last_message_at
                 FROM conversations WHERE user_id = ?1
                 ORDER BY last_message_at DESC",
            )?;
            let rows = stmt.query_map(params![user_id], conversation_from_row)?;
            rows.collect()
        })
        .await
    }

    pub async fn get_conversation(
        &self,
        id: &str,
        user_id: &str,
    ) -> Result<(Conversation, Vec<StoredMessage>), ApiError> {
        let id = id.to_string();
        let user_id = user_id.to_string();
        let found = self
            .call(move |conn| {
                let conversation = conn
                    .query_row(
                        "SELECT id, user_id, provider, model, created_at, last_message_at
                         FROM conversations WHERE id = ?1 AND user_id = ?2",
                        params![id, user_id],
                        conversation_from_row,
                    )
                    .optional()?;
                let Some(conversation) = conversation else {
                    return Ok(None);
                };
                let mut stmt = conn.prepare(
                    "SELECT id, role, content, created_at FROM messages
                     WHERE conversation_id = ?1 ORDER BY id ASC",
                )?;
                let messages = stmt
                    .query_map(params![conversation.id], message_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(Some((conversation, messages)))
            })
            .await?;
        found.ok_or_else(|| ApiError::NotFound("conversation not found".to_string()))
    }

    /// Delete a conversation; its messages go with it via the cascade.
    pub async fn delete_conversation(&self, id: &str, user_id: &str) -> Result<(), ApiError> {
        let id = id.to_string();
        let user_id = user_id.to_string();
        let deleted = self
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM conversations WHERE id = ?1 AND user_id = ?2",
                    params![id, user_id],
                )
            })
            .await?;
        if deleted == 0 {
            return Err(ApiError::NotFound("conversation not found".to_string()));
        }
        Ok(())
    }

    pub async fn save_comparison(
        &self,
        user_id: &str,
        prompt: &str,
        results: Vec<InvocationResult>,
    ) -> Result<Comparison, ApiError> {
        let user_id = user_id.to_string();
        let prompt = prompt.to_string();
        self.call(move |conn| {
            let now = Utc::now();
            let comparison = Comparison {
                id: Uuid::new_v4().to_string(),
                user_id,
                prompt,
                results,
                preferred_index: None,
                created_at: now,
                updated_at: now,
            };
            conn.execute(
                "INSERT INTO comparisons
                 (id, user_id, prompt, results, preferred_index, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, NULL, ?5, ?6)",
                params![
                    comparison.id,
                    comparison.user_id,
                    comparison.prompt,
                    encode_results(&comparison.results)?,
                    comparison.created_at.to_rfc3339(),
                    comparison.updated_at.to_rfc3339(),
                ],
            )?;
            Ok(comparison)
        })
        .await
    }

    pub async fn list_comparisons(
        &self,
        user_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Comparison>, ApiError> {
        let user_id = user_id.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, prompt, results, preferred_index, created_at, updated_at
                 FROM comparisons WHERE user_id = ?1
                 ORDER BY created_at DESC LIMIT ?2 OFFSET ?3",
            )?;
            let rows = stmt.query_map(params![user_id, limit, offset], comparison_from_row)?;
            rows.collect()
        })
        .await
    }

    pub async fn get_comparison(&self, id: &str, user_id: &str) -> Result<Comparison, ApiError> {
        let id = id.to_string();
        let user_id = user_id.to_string();
        let found = self
            .call(move |conn| {
                conn.query_row(
                    "SELECT id, user_id, prompt, results, preferred_index, created_at, updated_at
                     FROM comparisons WHERE id = ?1 AND user_id = ?2",
                    params![id, user_id],
                    comparison_from_row,
                )
                .optional()
            })
            .await?;
        found.ok_or_else(|| ApiError::NotFound("comparison not found".to_string()))
    }

    /// Record which result the user preferred. The index must address one of
    /// the stored results.
    pub async fn set_vote(
        &self,
        id: &str,
        user_id: &str,
        preferred_index: usize,
    ) -> Result<Comparison, ApiError> {
        let mut comparison = self.get_comparison(id, user_id).await?;
        if preferred_index >= comparison.results.len() {
            return Err(ApiError::BadRequest(format!(
                "preferredIndex {preferred_index} is out of range for {} result(s)",
                comparison.results.len()
            )));
        }
        let comparison_id = comparison.id.clone();
        let now = self
            .call(move |conn| {
                let now = Utc::now();
                conn.execute(
                    "UPDATE comparisons SET preferred_index = ?1, updated_at = ?2 WHERE id = ?3",
                    params![preferred_index as i64, now.to_rfc3339(), comparison_id],
                )?;
                Ok(now)
            })
            .await?;
        comparison.preferred_index = Some(preferred_index);
        comparison.updated_at = now;
        Ok(comparison)
    }

    pub async fn delete_comparison(&self, id: &str, user_id: &str) -> Result<(), ApiError> {
        let id = id.to_string();
        let user_id = user_id.to_string();
        let deleted = self
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM comparisons WHERE id = ?1 AND user_id = ?2",
                    params![id, user_id],
                )
            })
            .await?;
        if deleted == 0 {
            return Err(ApiError::NotFound("comparison not found".to_string()));
        }
        Ok(())
    }

    /// Upsert per-user provider keys. Blank values are ignored, so submitting
    /// a partial form never clears a previously stored key.
    pub async fn set_api_keys(
        &self,
        user_id: &str,
        entries: Vec<(Provider, String)>,
    ) -> Result<(), ApiError> {
        let user_id = user_id.to_string();
        self.call(move |conn| {
            for (provider, key) in entries {
                let key = key.trim();
                if key.is_empty() {
                    continue;
                }
                conn.execute(
                    "INSERT INTO api_keys (user_id, provider, api_key) VALUES (?1, ?2, ?3)
                     ON CONFLICT(user_id, provider) DO UPDATE SET api_key = excluded.api_key",
                    params![user_id, provider.as_str(), key],
                )?;
            }
            Ok(())
        })
        .await
    }

    pub async fn get_api_key(
        &self,
        user_id: &str,
        provider: Provider,
    ) -> Result<Option<String>, ApiError> {
        let user_id = user_id.to_string();
        self.call(move |conn| {
            conn.query_row(
                "SELECT api_key FROM api_keys WHERE user_id = ?1 AND provider = ?2",
                params![user_id, provider.as_str()],
                |row| row.get(0),
            )
            .optional()
        })
        .await
    }

    /// Providers the user has stored a key for. Never returns the keys.
    pub async fn configured_providers(&self, user_id: &str) -> Result<Vec<Provider>, ApiError> {
        let user_id = user_id.to_string();
        self.call(move |conn| {
            let mut stmt =
                conn.prepare("SELECT provider FROM api_keys WHERE user_id = ?1 ORDER BY provider")?;
            let rows = stmt.query_map(params![user_id], |row| {
                let raw: String = row.get(0)?;
                parse_provider(&raw)
            })?;
            rows.collect()
        })
        .await
    }
}

fn conversation_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let provider: String = row.get(2)?;
    let created_at: String = row.get(4)?;
    let last_message_at: String = row.get(5)?;
    Ok(Conversation {
        id: row.get(0)?,
        user_id: row.get(1)?,
        provider: parse_provider(&provider)?,
        model: row.get(3)?,
        created_at: parse_timestamp(&created_at)?,
        last_message_at: parse_timestamp(&last_message_at)?,
    })
}

fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    let role: String = row.get(1)?;
    let created_at: String = row.get(3)?;
    Ok(StoredMessage {
        id: row.get(0)?,
        role: parse_role(&role)?,
        content: row.get(2)?,
        created_at: parse_timestamp(&created_at)?,
    })
}

fn comparison_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Comparison> {
    let results: String = row.get(3)?;
    let preferred_index: Option<i64> = row.get(4)?;
    let created_at: String = row.get(5)?;
    let updated_at: String = row.get(6)?;
    Ok(Comparison {
        id: row.get(0)?,
        user_id: row.get(1)?,
        prompt: row.get(2)?,
        results: decode_results(&results)?,
        preferred_index: preferred_index.map(|i| i as usize),
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

fn encode_results(results: &[InvocationResult]) -> rusqlite::Result<String> {
    serde_json::to_string(results)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn decode_results(raw: &str) -> rusqlite::Result<Vec<InvocationResult>> {
    serde_json::from_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))
}

fn parse_provider(raw: &str) -> rusqlite::Result<Provider> {
    Provider::from_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, e.into()))
}

fn parse_role(raw: &str) -> rusqlite::Result<Role> {
    match raw {
        "system" => Ok(Role::System),
        "user" => Ok(Role::User),
        "assistant" => Ok(Role::Assistant),
        other => Err(rusqlite::Error::FromSqlConversionFailure(
            0,
            Type::Text,
            format!("unknown role '{other}'").into(),
        )),
    }
}

fn parse_timestamp(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(provider: Provider, response: &str) -> InvocationResult {
        InvocationResult::completed(provider, "test-model".to_string(), response.to_string(), 12.5)
    }

    #[tokio::test]
    async fn ensure_conversation_creates_then_reuses() {
        let store = Store::open_in_memory().expect("open");
        let created = store
            .ensure_conversation("alice", Provider::OpenAi, "gpt-4o", None)
            .await
            .expect("create");
        let reused = store
            .ensure_conversation("alice", Provider::OpenAi, "gpt-4o", Some(created.id.clone()))
            .await
            .expect("reuse");
        assert_eq!(reused.id, created.id);
        assert_eq!(store.list_conversations("alice").await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn ensure_conversation_reconciles_provider_switch() {
        let store = Store::open_in_memory().expect("open");
        let created = store
            .ensure_conversation("alice", Provider::OpenAi, "gpt-4o", None)
            .await
            .expect("create");
        let switched = store
            .ensure_conversation(
                "alice",
                Provider::Anthropic,
                "claude-sonnet-4-20250514",
                Some(created.id.clone()),
            )
            .await
            .expect("switch");
        assert_eq!(switched.id, created.id);
        assert_eq!(switched.provider, Provider::Anthropic);
        assert_eq!(switched.model, "claude-sonnet-4-20250514");
    }

    #[tokio::test]
    async fn unknown_conversation_id_is_not_found() {
        let store = Store::open_in_memory().expect("open");
        let err = store
            .ensure_conversation("alice", Provider::OpenAi, "gpt-4o", Some("missing".to_string()))
            .await
            .expect_err("missing id");
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn conversations_are_scoped_to_their_user() {
        let store = Store::open_in_memory().expect("open");
        let created = store
            .ensure_conversation("alice", Provider::OpenAi, "gpt-4o", None)
            .await
            .expect("create");
        let err = store
            .get_conversation(&created.id, "bob")
            .await
            .expect_err("wrong user");
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn append_bumps_last_message_at_and_orders_messages() {
        let store = Store::open_in_memory().expect("open");
        let conversation = store
            .ensure_conversation("alice", Provider::OpenAi, "gpt-4o", None)
            .await
            .expect("create");
        store
            .append_message(&conversation.id, Role::User, "hello")
            .await
            .expect("append user");
        store
            .append_message(&conversation.id, Role::Assistant, "hi there")
            .await
            .expect("append assistant");

        let (updated, messages) = store
            .get_conversation(&conversation.id, "alice")
            .await
            .expect("get");
        assert!(updated.last_message_at >= conversation.last_message_at);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].content, "hi there");
    }

    #[tokio::test]
    async fn delete_conversation_cascades_to_messages() {
        let store = Store::open_in_memory().expect("open");
        let conversation = store
            .ensure_conversation("alice", Provider::OpenAi, "gpt-4o", None)
            .await
            .expect("create");
        store
            .append_message(&conversation.id, Role::User, "hello")
            .await
            .expect("append");
        store
            .delete_conversation(&conversation.id, "alice")
            .await
            .expect("delete");

        let orphans: i64 = store
            .call(|conn| conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0)))
            .await
            .expect("count");
        assert_eq!(orphans, 0);
    }

    #[tokio::test]
    async fn vote_accepts_in_range_index_and_rejects_out_of_range() {
        let store = Store::open_in_memory().expect("open");
        let comparison = store
            .save_comparison(
                "alice",
                "What is Rust?",
                vec![result(Provider::OpenAi, "A language"), result(Provider::Anthropic, "A metal")],
            )
            .await
            .expect("save");

        let voted = store
            .set_vote(&comparison.id, "alice", 0)
            .await
            .expect("vote at low bound");
        assert_eq!(voted.preferred_index, Some(0));

        let voted = store
            .set_vote(&comparison.id, "alice", 1)
            .await
            .expect("vote in range");
        assert_eq!(voted.preferred_index, Some(1));

        let err = store
            .set_vote(&comparison.id, "alice", 2)
            .await
            .expect_err("vote out of range");
        assert!(matches!(err, ApiError::BadRequest(_)));

        let reread = store
            .get_comparison(&comparison.id, "alice")
            .await
            .expect("reread");
        assert_eq!(reread.preferred_index, Some(1));
    }

    #[tokio::test]
    async fn comparison_results_round_trip_through_storage() {
        let store = Store::open_in_memory().expect("open");
        let saved = store
            .save_comparison("alice", "prompt", vec![result(Provider::Gemini, "answer text")])
            .await
            .expect("save");
        let loaded = store
            .get_comparison(&saved.id, "alice")
            .await
            .expect("load");
        assert_eq!(loaded.results.len(), 1);
        assert_eq!(loaded.results[0].provider, Provider::Gemini);
        assert_eq!(loaded.results[0].response, "answer text");
        assert!(!loaded.results[0].error);
    }

    #[tokio::test]
    async fn list_comparisons_honors_limit_and_offset() {
        let store = Store::open_in_memory().expect("open");
        for i in 0..3 {
            store
                .save_comparison("alice", &format!("prompt {i}"), vec![result(Provider::OpenAi, "a")])
                .await
                .expect("save");
        }
        let page = store
            .list_comparisons("alice", 2, 1)
            .await
            .expect("list");
        assert_eq!(page.len(), 2);
    }

    #[tokio::test]
    async fn blank_key_submission_keeps_existing_key() {
        let store = Store::open_in_memory().expect("open");
        store
            .set_api_keys("alice", vec![(Provider::OpenAi, "sk-first".to_string())])
            .await
            .expect("set");
        store
            .set_api_keys("alice", vec![(Provider::OpenAi, "   ".to_string())])
            .await
            .expect("set blank");

        let key = store
            .get_api_key("alice", Provider::OpenAi)
            .await
            .expect("get");
        assert_eq!(key.as_deref(), Some("sk-first"));
        assert_eq!(
            store.configured_providers("alice").await.expect("providers"),
            vec![Provider::OpenAi]
        );
    }

    #[tokio::test]
    async fn stored_key_overwrites_previous_value() {
        let store = Store::open_in_memory().expect("open");
        store
            .set_api_keys("alice", vec![(Provider::Mistral, "sk-old".to_string())])
            .await
            .expect("set");
        store
            .set_api_keys("alice", vec![(Provider::Mistral, "sk-new".to_string())])
            .await
            .expect("overwrite");
        let key = store
            .get_api_key("alice", Provider::Mistral)
            .await
            .expect("get");
        assert_eq!(key.as_deref(), Some("sk-new"));
    }
}
