// src/store.rs
//! The find/save persistence contract the engine consumes. Chats, branch
//! message lists, and log payloads are stored as opaque JSON blobs; the
//! engine does not care what sits behind the trait. `PgStore` is the
//! production backend, `MemStore` backs tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::chat::{Chat, Message};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Row of the chat sidebar listing.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ChatTitle {
    pub id: Uuid,
    pub title: String,
}

/// A recorded chat-to-chat reference, the raw material of the graph view.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Mention {
    pub source_id: Uuid,
    pub target_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn find_chat(&self, id: Uuid) -> Result<Option<Chat>, StoreError>;
    async fn save_chat(&self, chat: &Chat) -> Result<(), StoreError>;
    async fn save_chat_title(&self, id: Uuid, title: &str) -> Result<(), StoreError>;
    async fn update_chat_messages(&self, id: Uuid, messages: &[Message]) -> Result<(), StoreError>;
    async fn delete_chat(&self, id: Uuid) -> Result<(), StoreError>;
    async fn chat_titles(&self) -> Result<Vec<ChatTitle>, StoreError>;

    async fn find_branch(
        &self,
        chat_id: Uuid,
        branch_id: Uuid,
    ) -> Result<Option<Vec<Message>>, StoreError>;
    async fn save_branch_messages(
        &self,
        chat_id: Uuid,
        branch_id: Uuid,
        messages: &[Message],
    ) -> Result<(), StoreError>;

    async fn save_mention(&self, source_id: Uuid, target_id: Uuid) -> Result<(), StoreError>;
    async fn find_mentions(&self) -> Result<Vec<Mention>, StoreError>;

    /// Append one provenance record. Insertion order is the read order.
    async fn save_log_entry(
        &self,
        chat_id: Uuid,
        action: &str,
        payload: Value,
    ) -> Result<(), StoreError>;
    async fn find_log(&self, chat_id: Uuid) -> Result<Vec<(String, Value)>, StoreError>;

    async fn save_tag(&self, chat_id: Uuid, name: &str) -> Result<(), StoreError>;
    async fn find_tags(&self, chat_id: Uuid) -> Result<Vec<String>, StoreError>;
    async fn delete_tag(&self, chat_id: Uuid, name: &str) -> Result<(), StoreError>;
}

pub type SharedStore = Arc<dyn ChatStore>;

// ---------------------------------------------------------------------------
// Postgres backend
// ---------------------------------------------------------------------------

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect and run pending migrations, like every service start does.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await?;

        tracing::info!("Running database migrations...");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(sqlx::Error::from)?;
        tracing::info!("Database migrations completed");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn encode_messages(messages: &[Message]) -> Result<String, StoreError> {
    Ok(serde_json::to_string(messages)?)
}

fn decode_messages(blob: &str) -> Result<Vec<Message>, StoreError> {
    Ok(serde_json::from_str(blob)?)
}

#[async_trait]
impl ChatStore for PgStore {
    async fn find_chat(&self, id: Uuid) -> Result<Option<Chat>, StoreError> {
        let row = sqlx::query_as::<_, (String, String)>(
            "SELECT title, messages FROM chats WHERE id = $1",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((title, blob)) => Ok(Some(Chat {
                id,
                title,
                messages: decode_messages(&blob)?,
            })),
            None => Ok(None),
        }
    }

    async fn save_chat(&self, chat: &Chat) -> Result<(), StoreError> {
        tracing::info!(chat_id = %chat.id, "saving chat");
        sqlx::query(
            "INSERT INTO chats (id, title, messages) VALUES ($1, $2, $3)
             ON CONFLICT (id) DO UPDATE SET title = EXCLUDED.title, messages = EXCLUDED.messages",
        )
        .bind(chat.id.to_string())
        .bind(&chat.title)
        .bind(encode_messages(&chat.messages)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_chat_title(&self, id: Uuid, title: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE chats SET title = $2 WHERE id = $1")
            .bind(id.to_string())
            .bind(title)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_chat_messages(&self, id: Uuid, messages: &[Message]) -> Result<(), StoreError> {
        tracing::info!(chat_id = %id, "updating chat messages");
        sqlx::query("UPDATE chats SET messages = $2 WHERE id = $1")
            .bind(id.to_string())
            .bind(encode_messages(messages)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_chat(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM chats WHERE id = $1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn chat_titles(&self) -> Result<Vec<ChatTitle>, StoreError> {
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT id, title FROM chats ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(id, title)| {
                let id = Uuid::parse_str(&id)
                    .map_err(|e| StoreError::Corrupt(format!("chat id: {e}")))?;
                Ok(ChatTitle { id, title })
            })
            .collect()
    }

    async fn find_branch(
        &self,
        chat_id: Uuid,
        branch_id: Uuid,
    ) -> Result<Option<Vec<Message>>, StoreError> {
        let row = sqlx::query_as::<_, (String,)>(
            "SELECT messages FROM branches WHERE id = $1 AND chat_id = $2",
        )
        .bind(branch_id.to_string())
        .bind(chat_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((blob,)) => Ok(Some(decode_messages(&blob)?)),
            None => Ok(None),
        }
    }

    async fn save_branch_messages(
        &self,
        chat_id: Uuid,
        branch_id: Uuid,
        messages: &[Message],
    ) -> Result<(), StoreError> {
        tracing::info!(chat_id = %chat_id, branch_id = %branch_id, "updating branch messages");
        sqlx::query(
            "INSERT INTO branches (id, chat_id, messages) VALUES ($1, $2, $3)
             ON CONFLICT (id, chat_id) DO UPDATE SET messages = EXCLUDED.messages",
        )
        .bind(branch_id.to_string())
        .bind(chat_id.to_string())
        .bind(encode_messages(messages)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_mention(&self, source_id: Uuid, target_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO mentions (source_id, target_id) VALUES ($1, $2)
             ON CONFLICT (source_id, target_id) DO NOTHING",
        )
        .bind(source_id.to_string())
        .bind(target_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_mentions(&self) -> Result<Vec<Mention>, StoreError> {
        let rows = sqlx::query_as::<_, (String, String, DateTime<Utc>)>(
            "SELECT source_id, target_id, created_at FROM mentions ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(source, target, created_at)| {
                let parse = |s: &str| {
                    Uuid::parse_str(s).map_err(|e| StoreError::Corrupt(format!("mention id: {e}")))
                };
                Ok(Mention {
                    source_id: parse(&source)?,
                    target_id: parse(&target)?,
                    created_at,
                })
            })
            .collect()
    }

    async fn save_log_entry(
        &self,
        chat_id: Uuid,
        action: &str,
        payload: Value,
    ) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO chat_log (chat_id, action, meta) VALUES ($1, $2, $3)")
            .bind(chat_id.to_string())
            .bind(action)
            .bind(payload.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_log(&self, chat_id: Uuid) -> Result<Vec<(String, Value)>, StoreError> {
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT action, meta FROM chat_log WHERE chat_id = $1 ORDER BY id",
        )
        .bind(chat_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(action, meta)| Ok((action, serde_json::from_str(&meta)?)))
            .collect()
    }

    async fn save_tag(&self, chat_id: Uuid, name: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO tags (chat_id, name) VALUES ($1, $2)
             ON CONFLICT (chat_id, name) DO NOTHING",
        )
        .bind(chat_id.to_string())
        .bind(name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_tags(&self, chat_id: Uuid) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query_as::<_, (String,)>(
            "SELECT name FROM tags WHERE chat_id = $1 ORDER BY name",
        )
        .bind(chat_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    async fn delete_tag(&self, chat_id: Uuid, name: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM tags WHERE chat_id = $1 AND name = $2")
            .bind(chat_id.to_string())
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemInner {
    chats: HashMap<Uuid, Chat>,
    // Chat listing keeps insertion order, newest first on read.
    chat_order: Vec<Uuid>,
    branches: HashMap<(Uuid, Uuid), Vec<Message>>,
    log: HashMap<Uuid, Vec<(String, Value)>>,
    mentions: Vec<Mention>,
    tags: HashMap<Uuid, Vec<String>>,
}

/// Hash-map implementation of the store contract. Used by unit tests and
/// handy for running the service without a database.
#[derive(Default)]
pub struct MemStore {
    inner: RwLock<MemInner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChatStore for MemStore {
    async fn find_chat(&self, id: Uuid) -> Result<Option<Chat>, StoreError> {
        Ok(self.inner.read().await.chats.get(&id).cloned())
    }

    async fn save_chat(&self, chat: &Chat) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if !inner.chats.contains_key(&chat.id) {
            inner.chat_order.push(chat.id);
        }
        inner.chats.insert(chat.id, chat.clone());
        Ok(())
    }

    async fn save_chat_title(&self, id: Uuid, title: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(chat) = inner.chats.get_mut(&id) {
            chat.title = title.to_string();
        }
        Ok(())
    }

    async fn update_chat_messages(&self, id: Uuid, messages: &[Message]) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(chat) = inner.chats.get_mut(&id) {
            chat.messages = messages.to_vec();
        }
        Ok(())
    }

    async fn delete_chat(&self, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.chats.remove(&id);
        inner.chat_order.retain(|c| *c != id);
        inner.branches.retain(|(_, chat_id), _| *chat_id != id);
        inner.log.remove(&id);
        inner.tags.remove(&id);
        Ok(())
    }

    async fn chat_titles(&self) -> Result<Vec<ChatTitle>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .chat_order
            .iter()
            .rev()
            .filter_map(|id| {
                inner.chats.get(id).map(|chat| ChatTitle {
                    id: chat.id,
                    title: chat.title.clone(),
                })
            })
            .collect())
    }

    async fn find_branch(
        &self,
        chat_id: Uuid,
        branch_id: Uuid,
    ) -> Result<Option<Vec<Message>>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .branches
            .get(&(branch_id, chat_id))
            .cloned())
    }

    async fn save_branch_messages(
        &self,
        chat_id: Uuid,
        branch_id: Uuid,
        messages: &[Message],
    ) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .branches
            .insert((branch_id, chat_id), messages.to_vec());
        Ok(())
    }

    async fn save_mention(&self, source_id: Uuid, target_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let exists = inner
            .mentions
            .iter()
            .any(|m| m.source_id == source_id && m.target_id == target_id);
        if !exists {
            inner.mentions.push(Mention {
                source_id,
                target_id,
                created_at: Utc::now(),
            });
        }
        Ok(())
    }

    async fn find_mentions(&self) -> Result<Vec<Mention>, StoreError> {
        Ok(self.inner.read().await.mentions.clone())
    }

    async fn save_log_entry(
        &self,
        chat_id: Uuid,
        action: &str,
        payload: Value,
    ) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .log
            .entry(chat_id)
            .or_default()
            .push((action.to_string(), payload));
        Ok(())
    }

    async fn find_log(&self, chat_id: Uuid) -> Result<Vec<(String, Value)>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .log
            .get(&chat_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_tag(&self, chat_id: Uuid, name: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let tags = inner.tags.entry(chat_id).or_default();
        if !tags.iter().any(|t| t == name) {
            tags.push(name.to_string());
        }
        Ok(())
    }

    async fn find_tags(&self, chat_id: Uuid) -> Result<Vec<String>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .tags
            .get(&chat_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_tag(&self, chat_id: Uuid, name: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(tags) = inner.tags.get_mut(&chat_id) {
            tags.retain(|t| t != name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::chat::PLACEHOLDER_TITLE;

    #[tokio::test]
    async fn test_mem_store_chat_round_trip() {
        let store = MemStore::new();
        let id = Uuid::new_v4();
        assert!(store.find_chat(id).await.unwrap().is_none());

        let chat = Chat::new(id);
        store.save_chat(&chat).await.unwrap();
        let found = store.find_chat(id).await.unwrap().unwrap();
        assert_eq!(found.title, PLACEHOLDER_TITLE);

        store.save_chat_title(id, "Compiler questions").await.unwrap();
        let found = store.find_chat(id).await.unwrap().unwrap();
        assert_eq!(found.title, "Compiler questions");
    }

    #[tokio::test]
    async fn test_mem_store_branch_upsert() {
        let store = MemStore::new();
        let chat_id = Uuid::new_v4();
        let branch_id = Uuid::new_v4();

        assert!(store.find_branch(chat_id, branch_id).await.unwrap().is_none());

        let first = vec![Message::user("hi")];
        store
            .save_branch_messages(chat_id, branch_id, &first)
            .await
            .unwrap();
        let grown = vec![Message::user("hi"), Message::model("hello")];
        store
            .save_branch_messages(chat_id, branch_id, &grown)
            .await
            .unwrap();

        let found = store.find_branch(chat_id, branch_id).await.unwrap().unwrap();
        assert_eq!(found.len(), 2);
    }

    #[tokio::test]
    async fn test_mem_store_log_preserves_insertion_order() {
        let store = MemStore::new();
        let chat_id = Uuid::new_v4();
        for i in 0..5 {
            store
                .save_log_entry(chat_id, "branch-created", serde_json::json!({ "i": i }))
                .await
                .unwrap();
        }
        let log = store.find_log(chat_id).await.unwrap();
        let order: Vec<i64> = log.iter().map(|(_, v)| v["i"].as_i64().unwrap()).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_mem_store_mentions_deduplicate() {
        let store = MemStore::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        store.save_mention(a, b).await.unwrap();
        store.save_mention(a, b).await.unwrap();
        assert_eq!(store.find_mentions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_mem_store_delete_chat_cascades() {
        let store = MemStore::new();
        let chat_id = Uuid::new_v4();
        let branch_id = Uuid::new_v4();
        store.save_chat(&Chat::new(chat_id)).await.unwrap();
        store
            .save_branch_messages(chat_id, branch_id, &[Message::user("hi")])
            .await
            .unwrap();
        store.save_tag(chat_id, "rust").await.unwrap();

        store.delete_chat(chat_id).await.unwrap();
        assert!(store.find_chat(chat_id).await.unwrap().is_none());
        assert!(store.find_branch(chat_id, branch_id).await.unwrap().is_none());
        assert!(store.find_tags(chat_id).await.unwrap().is_empty());
    }
}
