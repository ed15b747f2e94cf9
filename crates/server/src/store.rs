use std::{cmp::Reverse, collections::HashMap, sync::Arc};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nkata_core::{Envelope, PageRequest, SearchQuery};
use nkata_storage::{MessageRepository, StoragePool};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("message not found")]
    NotFound,
    #[error("storage error: {0}")]
    Backend(#[from] anyhow::Error),
}

/// Durable message rows. Implementations are shared across sessions and
/// must be safe to call concurrently.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn insert(&self, envelope: &Envelope) -> Result<(), StoreError>;
    async fn get(&self, message_id: &str) -> Result<Envelope, StoreError>;
    /// Newest-first page plus the conversation total.
    async fn list(
        &self,
        conversation_id: &str,
        request: PageRequest,
    ) -> Result<(Vec<Envelope>, i64), StoreError>;
    async fn search(
        &self,
        conversation_id: &str,
        query: &SearchQuery,
        request: PageRequest,
    ) -> Result<(Vec<Envelope>, i64), StoreError>;
    async fn update_text(
        &self,
        message_id: &str,
        text_content: &str,
        modified_at: DateTime<Utc>,
    ) -> Result<Envelope, StoreError>;
    async fn delete(&self, message_id: &str) -> Result<(), StoreError>;
}

pub struct PostgresMessageStore {
    repository: Arc<MessageRepository>,
}

impl PostgresMessageStore {
    pub fn new(pool: StoragePool) -> Self {
        Self {
            repository: MessageRepository::new(pool),
        }
    }
}

#[async_trait]
impl MessageStore for PostgresMessageStore {
    async fn insert(&self, envelope: &Envelope) -> Result<(), StoreError> {
        Ok(self.repository.insert(envelope).await?)
    }

    async fn get(&self, message_id: &str) -> Result<Envelope, StoreError> {
        self.repository
            .get(message_id)
            .await?
            .ok_or(StoreError::NotFound)
    }

    async fn list(
        &self,
        conversation_id: &str,
        request: PageRequest,
    ) -> Result<(Vec<Envelope>, i64), StoreError> {
        Ok(self.repository.list(conversation_id, request).await?)
    }

    async fn search(
        &self,
        conversation_id: &str,
        query: &SearchQuery,
        request: PageRequest,
    ) -> Result<(Vec<Envelope>, i64), StoreError> {
        Ok(self
            .repository
            .search(conversation_id, query, request)
            .await?)
    }

    async fn update_text(
        &self,
        message_id: &str,
        text_content: &str,
        modified_at: DateTime<Utc>,
    ) -> Result<Envelope, StoreError> {
        self.repository
            .update_text(message_id, text_content, modified_at)
            .await?
            .ok_or(StoreError::NotFound)
    }

    async fn delete(&self, message_id: &str) -> Result<(), StoreError> {
        if self.repository.delete(message_id).await? {
            Ok(())
        } else {
            Err(StoreError::NotFound)
        }
    }
}

/// Process-local store used when no database is configured.
#[derive(Default)]
pub struct InMemoryMessageStore {
    messages: RwLock<HashMap<String, Envelope>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn newest_first<F>(&self, conversation_id: &str, keep: F) -> Vec<Envelope>
    where
        F: Fn(&Envelope) -> bool,
    {
        let messages = self.messages.read().await;
        let mut matching: Vec<Envelope> = messages
            .values()
            .filter(|envelope| envelope.conversation_id == conversation_id && keep(envelope))
            .cloned()
            .collect();
        matching.sort_by_key(|envelope| {
            (
                Reverse(envelope.created_at),
                Reverse(envelope.message_id.clone()),
            )
        });
        matching
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn insert(&self, envelope: &Envelope) -> Result<(), StoreError> {
        let mut messages = self.messages.write().await;
        if messages.contains_key(&envelope.message_id) {
            return Err(anyhow!("duplicate message id {}", envelope.message_id).into());
        }
        messages.insert(envelope.message_id.clone(), envelope.clone());
        Ok(())
    }

    async fn get(&self, message_id: &str) -> Result<Envelope, StoreError> {
        self.messages
            .read()
            .await
            .get(message_id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn list(
        &self,
        conversation_id: &str,
        request: PageRequest,
    ) -> Result<(Vec<Envelope>, i64), StoreError> {
        let matching = self.newest_first(conversation_id, |_| true).await;
        Ok((request.slice(&matching), matching.len() as i64))
    }

    async fn search(
        &self,
        conversation_id: &str,
        query: &SearchQuery,
        request: PageRequest,
    ) -> Result<(Vec<Envelope>, i64), StoreError> {
        let matching = self
            .newest_first(conversation_id, |envelope| query.matches(envelope))
            .await;
        Ok((request.slice(&matching), matching.len() as i64))
    }

    async fn update_text(
        &self,
        message_id: &str,
        text_content: &str,
        modified_at: DateTime<Utc>,
    ) -> Result<Envelope, StoreError> {
        let mut messages = self.messages.write().await;
        let envelope = messages.get_mut(message_id).ok_or(StoreError::NotFound)?;
        envelope.text_content = Some(text_content.to_string());
        envelope.modified_at = modified_at;
        Ok(envelope.clone())
    }

    async fn delete(&self, message_id: &str) -> Result<(), StoreError> {
        self.messages
            .write()
            .await
            .remove(message_id)
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }
}

/// Stands in for a configured database that could not be reached at startup.
/// Every call fails, so sessions report each message as not persisted.
pub struct UnavailableMessageStore {
    reason: String,
}

impl UnavailableMessageStore {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    fn unavailable<T>(&self) -> Result<T, StoreError> {
        Err(anyhow!("database unavailable: {}", self.reason).into())
    }
}

#[async_trait]
impl MessageStore for UnavailableMessageStore {
    async fn insert(&self, _envelope: &Envelope) -> Result<(), StoreError> {
        self.unavailable()
    }

    async fn get(&self, _message_id: &str) -> Result<Envelope, StoreError> {
        self.unavailable()
    }

    async fn list(
        &self,
        _conversation_id: &str,
        _request: PageRequest,
    ) -> Result<(Vec<Envelope>, i64), StoreError> {
        self.unavailable()
    }

    async fn search(
        &self,
        _conversation_id: &str,
        _query: &SearchQuery,
        _request: PageRequest,
    ) -> Result<(Vec<Envelope>, i64), StoreError> {
        self.unavailable()
    }

    async fn update_text(
        &self,
        _message_id: &str,
        _text_content: &str,
        _modified_at: DateTime<Utc>,
    ) -> Result<Envelope, StoreError> {
        self.unavailable()
    }

    async fn delete(&self, _message_id: &str) -> Result<(), StoreError> {
        self.unavailable()
    }
}
