//! Async store facade: `spawn_blocking` dispatch plus read caches.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::cipher::SecretCipher;
use crate::db::Database;
use crate::StoreError;

/// Message rows are cached for this many conversations, LRU.
const MAX_MESSAGES_CACHE_CONVERSATIONS: usize = 24;
/// Recent-input history cache upper bound.
const MAX_RECENT_HISTORY_CACHE: usize = 500;
/// Hard cap on a single history query.
const HISTORY_QUERY_LIMIT: usize = 1000;

#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub role: String,
    pub content: String,
    /// OpenAI-shaped tool_calls array, kept as raw JSON.
    pub tool_calls: Option<String>,
    pub reasoning: Option<String>,
}

#[derive(Default)]
struct Caches {
    conversations: Mutex<Option<Vec<Conversation>>>,
    /// LRU: most recently used at the back.
    messages: Mutex<Vec<(String, Vec<StoredMessage>)>>,
    api_keys: Mutex<HashMap<String, String>>,
    recent_history: Mutex<Option<Vec<String>>>,
}

/// Shared handle to the SQLite store. Cloning shares the connection,
/// the cipher, and all caches.
#[derive(Clone)]
pub struct Store {
    db: Arc<Database>,
    cipher: Arc<SecretCipher>,
    caches: Arc<Caches>,
}

impl Store {
    /// Open (or create) the database and its key file, creating the schema.
    pub fn open(db_path: &Path, key_file: &Path) -> Result<Self, StoreError> {
        let db = Database::open(db_path)?;
        let cipher = SecretCipher::load_or_create(key_file)?;
        Ok(Self {
            db: Arc::new(db),
            cipher: Arc::new(cipher),
            caches: Arc::new(Caches::default()),
        })
    }

    /// Close the handle. Later calls fail with [`StoreError::Closed`].
    pub fn shutdown(&self) {
        self.db.shutdown();
    }

    async fn run<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: Fn(&Connection) -> rusqlite::Result<T> + Send + Sync + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || db.with_conn(op))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }

    // ─── API keys ───────────────────────────────────────────────────────────

    pub async fn save_api_key(&self, provider: &str, api_key: &str) -> Result<(), StoreError> {
        let encrypted = self.cipher.encrypt(api_key);
        let provider_owned = provider.to_string();
        self.run(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO api_keys (provider, encrypted_key) VALUES (?1, ?2)",
                params![provider_owned, encrypted],
            )
            .map(|_| ())
        })
        .await?;
        self.caches
            .api_keys
            .lock()
            .expect("api key cache poisoned")
            .insert(provider.to_string(), api_key.to_string());
        Ok(())
    }

    pub async fn get_api_key(&self, provider: &str) -> Result<Option<String>, StoreError> {
        if let Some(key) = self
            .caches
            .api_keys
            .lock()
            .expect("api key cache poisoned")
            .get(provider)
        {
            return Ok(Some(key.clone()));
        }
        let provider_owned = provider.to_string();
        let encrypted: Option<String> = self
            .run(move |conn| {
                conn.query_row(
                    "SELECT encrypted_key FROM api_keys WHERE provider = ?1",
                    params![provider_owned],
                    |row| row.get(0),
                )
                .optional()
            })
            .await?;
        let Some(encrypted) = encrypted else {
            return Ok(None);
        };
        let key = self.cipher.decrypt(&encrypted)?;
        self.caches
            .api_keys
            .lock()
            .expect("api key cache poisoned")
            .insert(provider.to_string(), key.clone());
        Ok(Some(key))
    }

    // ─── Conversations ──────────────────────────────────────────────────────

    pub async fn create_conversation(&self, id: &str, title: &str) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let id_owned = id.to_string();
        let title_owned = title.to_string();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO conversations (id, title, created_at, updated_at) VALUES (?1, ?2, ?3, ?4)",
                params![id_owned, title_owned, now, now],
            )
            .map(|_| ())
        })
        .await?;
        self.invalidate_conversations();
        Ok(())
    }

    pub async fn update_conversation_title(
        &self,
        id: &str,
        title: &str,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let id_owned = id.to_string();
        let title_owned = title.to_string();
        self.run(move |conn| {
            conn.execute(
                "UPDATE conversations SET title = ?1, updated_at = ?2 WHERE id = ?3",
                params![title_owned, now, id_owned],
            )
            .map(|_| ())
        })
        .await?;
        self.invalidate_conversations();
        Ok(())
    }

    pub async fn list_conversations(&self) -> Result<Vec<Conversation>, StoreError> {
        if let Some(cached) = self
            .caches
            .conversations
            .lock()
            .expect("conversations cache poisoned")
            .clone()
        {
            return Ok(cached);
        }
        let conversations = self
            .run(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, title, updated_at FROM conversations ORDER BY updated_at DESC",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok(Conversation {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        updated_at: row.get(2)?,
                    })
                })?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .await?;
        *self
            .caches
            .conversations
            .lock()
            .expect("conversations cache poisoned") = Some(conversations.clone());
        Ok(conversations)
    }

    /// Delete every conversation except the given one (all of them when `None`).
    pub async fn delete_conversations_except(
        &self,
        keep_id: Option<&str>,
    ) -> Result<(), StoreError> {
        let keep = keep_id.map(str::to_string);
        self.run(move |conn| {
            match &keep {
                Some(id) => {
                    conn.execute("DELETE FROM history WHERE conversation_id != ?1", params![id])?;
                    conn.execute("DELETE FROM messages WHERE conversation_id != ?1", params![id])?;
                    conn.execute("DELETE FROM conversations WHERE id != ?1", params![id])?;
                }
                None => {
                    conn.execute("DELETE FROM history", [])?;
                    conn.execute("DELETE FROM messages", [])?;
                    conn.execute("DELETE FROM conversations", [])?;
                }
            }
            Ok(())
        })
        .await?;

        let mut messages = self.caches.messages.lock().expect("messages cache poisoned");
        match keep_id {
            Some(id) => messages.retain(|(conv, _)| conv == id),
            None => messages.clear(),
        }
        drop(messages);
        self.invalidate_conversations();
        *self
            .caches
            .recent_history
            .lock()
            .expect("history cache poisoned") = None;
        Ok(())
    }

    // ─── Messages ───────────────────────────────────────────────────────────

    /// Append a message, advance the conversation's `updated_at`, and mirror
    /// user messages into the input-history table.
    pub async fn save_message(
        &self,
        conversation_id: &str,
        role: &str,
        content: &str,
        tool_calls: Option<&str>,
        reasoning: Option<&str>,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let conv = conversation_id.to_string();
        let role_owned = role.to_string();
        let content_owned = content.to_string();
        let tool_calls_owned = tool_calls.map(str::to_string);
        let reasoning_owned = reasoning.map(str::to_string);
        let is_user = role == "user";

        self.run(move |conn| {
            conn.execute(
                "INSERT INTO messages (conversation_id, role, content, tool_calls, reasoning, timestamp) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![conv, role_owned, content_owned, tool_calls_owned, reasoning_owned, now],
            )?;
            conn.execute(
                "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
                params![now, conv],
            )?;
            if is_user {
                conn.execute(
                    "INSERT INTO history (conversation_id, content, timestamp) VALUES (?1, ?2, ?3)",
                    params![conv, content_owned, now],
                )?;
            }
            Ok(())
        })
        .await?;

        self.invalidate_conversations();
        self.caches
            .messages
            .lock()
            .expect("messages cache poisoned")
            .retain(|(conv, _)| conv != conversation_id);
        if is_user {
            *self
                .caches
                .recent_history
                .lock()
                .expect("history cache poisoned") = None;
        }
        Ok(())
    }

    pub async fn get_messages(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        {
            let mut cache = self.caches.messages.lock().expect("messages cache poisoned");
            if let Some(pos) = cache.iter().position(|(conv, _)| conv == conversation_id) {
                let entry = cache.remove(pos);
                let messages = entry.1.clone();
                cache.push(entry);
                return Ok(messages);
            }
        }

        let conv = conversation_id.to_string();
        let messages = self
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT role, content, tool_calls, reasoning FROM messages \
                     WHERE conversation_id = ?1 ORDER BY id ASC",
                )?;
                let rows = stmt.query_map(params![conv], |row| {
                    Ok(StoredMessage {
                        role: row.get(0)?,
                        content: row.get(1)?,
                        tool_calls: row.get(2)?,
                        reasoning: row.get(3)?,
                    })
                })?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .await?;

        let mut cache = self.caches.messages.lock().expect("messages cache poisoned");
        cache.push((conversation_id.to_string(), messages.clone()));
        while cache.len() > MAX_MESSAGES_CACHE_CONVERSATIONS {
            cache.remove(0);
        }
        Ok(messages)
    }

    // ─── Input history ──────────────────────────────────────────────────────

    /// Recent user inputs, oldest first, for line-editor history.
    pub async fn recent_user_history(&self, limit: usize) -> Result<Vec<String>, StoreError> {
        let safe_limit = limit.clamp(1, HISTORY_QUERY_LIMIT);
        if let Some(cached) = self
            .caches
            .recent_history
            .lock()
            .expect("history cache poisoned")
            .as_ref()
        {
            let tail = cached.len().saturating_sub(safe_limit);
            return Ok(cached[tail..].to_vec());
        }

        let query_limit = safe_limit as i64;
        let mut rows = self
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT content FROM history \
                     WHERE content IS NOT NULL AND TRIM(content) != '' \
                     ORDER BY id DESC LIMIT ?1",
                )?;
                let rows = stmt.query_map(params![query_limit], |row| row.get::<_, String>(0))?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .await?;
        rows.reverse();
        if rows.len() > MAX_RECENT_HISTORY_CACHE {
            rows = rows[rows.len() - MAX_RECENT_HISTORY_CACHE..].to_vec();
        }
        *self
            .caches
            .recent_history
            .lock()
            .expect("history cache poisoned") = Some(rows.clone());
        Ok(rows)
    }

    // ─── Settings ───────────────────────────────────────────────────────────

    pub async fn save_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let key_owned = key.to_string();
        let value_owned = value.to_string();
        self.run(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
                params![key_owned, value_owned],
            )
            .map(|_| ())
        })
        .await
    }

    /// Raw settings map; callers layer their defaults on top.
    pub async fn get_all_settings(&self) -> Result<HashMap<String, String>, StoreError> {
        self.run(|conn| {
            let mut stmt = conn.prepare("SELECT key, value FROM settings")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<rusqlite::Result<HashMap<String, String>>>()
        })
        .await
    }

    fn invalidate_conversations(&self) {
        *self
            .caches
            .conversations
            .lock()
            .expect("conversations cache poisoned") = None;
    }
}
