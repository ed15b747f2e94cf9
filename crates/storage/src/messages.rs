use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use nkata_core::{Envelope, Media, MediaKind, MessageKind, PageRequest, SearchQuery};
use sqlx::FromRow;
use thiserror::Error;

use crate::StoragePool;

const COLUMNS: &str = "message_id, conversation_id, sender_handle, kind, text_content, \
                       media_url, media_type, created_at, modified_at";

#[derive(Debug, Error)]
pub enum RowError {
    #[error("stored message {message_id} has unrecognized {column} '{value}'")]
    UnknownVariant {
        message_id: String,
        column: &'static str,
        value: String,
    },
}

#[derive(Debug, Clone, FromRow)]
pub struct MessageRow {
    pub message_id: String,
    pub conversation_id: String,
    pub sender_handle: String,
    pub kind: String,
    pub text_content: Option<String>,
    pub media_url: Option<String>,
    pub media_type: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl MessageRow {
    pub fn into_envelope(self) -> Result<Envelope, RowError> {
        let kind = self
            .kind
            .parse::<MessageKind>()
            .map_err(|_| RowError::UnknownVariant {
                message_id: self.message_id.clone(),
                column: "kind",
                value: self.kind.clone(),
            })?;
        let media_type = self
            .media_type
            .parse::<MediaKind>()
            .map_err(|_| RowError::UnknownVariant {
                message_id: self.message_id.clone(),
                column: "media_type",
                value: self.media_type.clone(),
            })?;
        let media = match self.media_url {
            Some(url) if !url.is_empty() => Media::stored(url, media_type),
            _ => Media::none(),
        };

        Ok(Envelope {
            message_id: self.message_id,
            conversation_id: self.conversation_id,
            sender_handle: self.sender_handle,
            kind,
            text_content: self.text_content,
            media,
            created_at: self.created_at,
            modified_at: self.modified_at,
        })
    }
}

fn into_envelopes(rows: Vec<MessageRow>) -> Result<Vec<Envelope>> {
    rows.into_iter()
        .map(|row| row.into_envelope().map_err(anyhow::Error::from))
        .collect()
}

/// Escape `LIKE` metacharacters so user text matches literally.
fn like_pattern(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len() + 2);
    escaped.push('%');
    for c in text.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

#[derive(Clone)]
pub struct MessageRepository {
    pool: StoragePool,
}

impl MessageRepository {
    pub fn new(pool: StoragePool) -> Arc<Self> {
        Arc::new(Self { pool })
    }

    pub async fn insert(&self, envelope: &Envelope) -> Result<()> {
        let media_url = envelope
            .media
            .is_present()
            .then(|| envelope.media.media_url.clone());

        sqlx::query(
            r#"
            INSERT INTO messages (
                message_id, conversation_id, sender_handle, kind, text_content,
                media_url, media_type, created_at, modified_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&envelope.message_id)
        .bind(&envelope.conversation_id)
        .bind(&envelope.sender_handle)
        .bind(envelope.kind.as_str())
        .bind(envelope.text_content.as_deref())
        .bind(media_url)
        .bind(envelope.media.media_type.as_str())
        .bind(envelope.created_at)
        .bind(envelope.modified_at)
        .execute(self.pool.pool())
        .await?;
        Ok(())
    }

    pub async fn get(&self, message_id: &str) -> Result<Option<Envelope>> {
        let row = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {COLUMNS} FROM messages WHERE message_id = $1"
        ))
        .bind(message_id)
        .fetch_optional(self.pool.pool())
        .await?;

        Ok(row.map(MessageRow::into_envelope).transpose()?)
    }

    /// Newest-first page of a conversation plus the conversation's total.
    pub async fn list(
        &self,
        conversation_id: &str,
        request: PageRequest,
    ) -> Result<(Vec<Envelope>, i64)> {
        let total = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = $1",
        )
        .bind(conversation_id)
        .fetch_one(self.pool.pool())
        .await?;

        let rows = sqlx::query_as::<_, MessageRow>(&format!(
            r#"
            SELECT {COLUMNS}
            FROM messages
            WHERE conversation_id = $1
            ORDER BY created_at DESC, message_id DESC
            LIMIT $2 OFFSET $3
            "#
        ))
        .bind(conversation_id)
        .bind(request.limit())
        .bind(request.offset())
        .fetch_all(self.pool.pool())
        .await?;

        Ok((into_envelopes(rows)?, total))
    }

    pub async fn search(
        &self,
        conversation_id: &str,
        query: &SearchQuery,
        request: PageRequest,
    ) -> Result<(Vec<Envelope>, i64)> {
        let pattern = like_pattern(query.text());

        let total = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM messages
            WHERE conversation_id = $1
              AND text_content ILIKE $2 ESCAPE '\'
              AND created_at BETWEEN $3 AND $4
            "#,
        )
        .bind(conversation_id)
        .bind(&pattern)
        .bind(query.start())
        .bind(query.end())
        .fetch_one(self.pool.pool())
        .await?;

        let rows = sqlx::query_as::<_, MessageRow>(&format!(
            r#"
            SELECT {COLUMNS}
            FROM messages
            WHERE conversation_id = $1
              AND text_content ILIKE $2 ESCAPE '\'
              AND created_at BETWEEN $3 AND $4
            ORDER BY created_at DESC, message_id DESC
            LIMIT $5 OFFSET $6
            "#
        ))
        .bind(conversation_id)
        .bind(&pattern)
        .bind(query.start())
        .bind(query.end())
        .bind(request.limit())
        .bind(request.offset())
        .fetch_all(self.pool.pool())
        .await?;

        Ok((into_envelopes(rows)?, total))
    }

    /// Replace the text of a message. Returns `None` when the id is unknown.
    pub async fn update_text(
        &self,
        message_id: &str,
        text_content: &str,
        modified_at: DateTime<Utc>,
    ) -> Result<Option<Envelope>> {
        let row = sqlx::query_as::<_, MessageRow>(&format!(
            r#"
            UPDATE messages
            SET text_content = $2, modified_at = $3
            WHERE message_id = $1
            RETURNING {COLUMNS}
            "#
        ))
        .bind(message_id)
        .bind(text_content)
        .bind(modified_at)
        .fetch_optional(self.pool.pool())
        .await?;

        Ok(row.map(MessageRow::into_envelope).transpose()?)
    }

    /// Returns whether a row was removed.
    pub async fn delete(&self, message_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM messages WHERE message_id = $1")
            .bind(message_id)
            .execute(self.pool.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
