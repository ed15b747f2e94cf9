use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use nkata_core::{Envelope, FieldError, Page, PageRequest, SearchQuery};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error};

use crate::{
    auth::Authenticated,
    store::{MessageStore, StoreError},
    AppState, ErrorBody,
};

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("request failed validation")]
    Validation(Vec<FieldError>),
    #[error("message not found")]
    NotFound,
    #[error("storage error: {0}")]
    Storage(#[source] anyhow::Error),
}

impl From<StoreError> for HistoryError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => HistoryError::NotFound,
            StoreError::Backend(err) => HistoryError::Storage(err),
        }
    }
}

impl HistoryError {
    fn status(&self) -> StatusCode {
        match self {
            HistoryError::Validation(_) => StatusCode::BAD_REQUEST,
            HistoryError::NotFound => StatusCode::NOT_FOUND,
            HistoryError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for HistoryError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            HistoryError::Validation(details) => {
                (status, Json(ErrorBody::validation(details))).into_response()
            }
            HistoryError::NotFound => (status, Json(ErrorBody::new("not_found"))).into_response(),
            HistoryError::Storage(err) => {
                error!(?err, "history storage call failed");
                (status, Json(ErrorBody::new("server_error"))).into_response()
            }
        }
    }
}

/// Read, edit and delete paths over the persisted messages.
pub struct HistoryService {
    store: Arc<dyn MessageStore>,
}

impl HistoryService {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }

    pub async fn get_by_id(&self, message_id: &str) -> Result<Envelope, HistoryError> {
        Ok(self.store.get(message_id).await?)
    }

    pub async fn list(
        &self,
        conversation_id: &str,
        request: PageRequest,
    ) -> Result<Page<Envelope>, HistoryError> {
        let (data, total) = self.store.list(conversation_id, request).await?;
        Ok(Page::new(data, total, request))
    }

    pub async fn search(
        &self,
        conversation_id: &str,
        query: &SearchQuery,
        request: PageRequest,
    ) -> Result<Page<Envelope>, HistoryError> {
        let (data, total) = self.store.search(conversation_id, query, request).await?;
        Ok(Page::new(data, total, request))
    }

    /// Replace the text of a text message. Media messages carry no text and
    /// cannot be edited.
    pub async fn edit(&self, message_id: &str, text_content: &str) -> Result<Envelope, HistoryError> {
        let text_content = text_content.trim();
        if text_content.is_empty() {
            return Err(HistoryError::Validation(vec![FieldError::new(
                "text_content",
                "must be provided",
            )]));
        }

        let existing = self.store.get(message_id).await?;
        if existing.media.is_present() {
            return Err(HistoryError::Validation(vec![FieldError::new(
                "text_content",
                "media messages cannot be edited",
            )]));
        }

        Ok(self
            .store
            .update_text(message_id, text_content, Utc::now())
            .await?)
    }

    /// Deleting an unknown id is reported as not found.
    pub async fn delete(&self, message_id: &str) -> Result<(), HistoryError> {
        Ok(self.store.delete(message_id).await?)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct PageParams {
    pub page: Option<String>,
    pub limit: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SearchParams {
    pub query: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub page: Option<String>,
    pub limit: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EditMessageRequest {
    #[serde(default)]
    pub text_content: Option<String>,
}

#[derive(Debug, Serialize)]
struct Deleted {
    message_id: String,
    deleted: bool,
}

fn parse_integer(
    raw: Option<&str>,
    field: &'static str,
    errors: &mut Vec<FieldError>,
) -> Option<i64> {
    let raw = raw.map(str::trim).filter(|raw| !raw.is_empty())?;
    match raw.parse::<i64>() {
        Ok(value) => Some(value),
        Err(_) => {
            errors.push(FieldError::new(field, "must be a positive integer"));
            None
        }
    }
}

fn page_request(page: Option<&str>, limit: Option<&str>) -> Result<PageRequest, HistoryError> {
    let mut errors = Vec::new();
    let page = parse_integer(page, "page", &mut errors);
    let limit = parse_integer(limit, "limit", &mut errors);
    if !errors.is_empty() {
        return Err(HistoryError::Validation(errors));
    }
    PageRequest::from_params(page, limit).map_err(HistoryError::Validation)
}

/// RFC 3339 timestamps, or plain `YYYY-MM-DD` dates covering the whole day.
fn parse_bound(raw: Option<&str>, end_of_day: bool) -> Option<DateTime<Utc>> {
    let raw = raw.map(str::trim).filter(|raw| !raw.is_empty())?;
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(raw) {
        return Some(timestamp.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()?;
    let naive = if end_of_day {
        date.and_hms_nano_opt(23, 59, 59, 999_999_999)?
    } else {
        date.and_hms_opt(0, 0, 0)?
    };
    Some(Utc.from_utc_datetime(&naive))
}

fn search_request(params: &SearchParams) -> Result<(SearchQuery, PageRequest), HistoryError> {
    let query = SearchQuery::new(
        params.query.as_deref(),
        parse_bound(params.start.as_deref(), false),
        parse_bound(params.end.as_deref(), true),
    );
    let request = page_request(params.page.as_deref(), params.limit.as_deref());

    match (query, request) {
        (Ok(query), Ok(request)) => Ok((query, request)),
        (Err(mut errors), Err(HistoryError::Validation(more))) => {
            errors.extend(more);
            Err(HistoryError::Validation(errors))
        }
        (Err(errors), _) => Err(HistoryError::Validation(errors)),
        (_, Err(err)) => Err(err),
    }
}

fn respond<T: Serialize>(
    state: &AppState,
    route: &'static str,
    result: Result<T, HistoryError>,
) -> Response {
    let response = match result {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(err) => err.into_response(),
    };
    state.record_http_request(route, response.status().as_u16());
    response
}

pub async fn get_message(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    Path(message_id): Path<String>,
) -> Response {
    debug!(requester = %identity, %message_id, "fetching message");
    let result = state.history().get_by_id(&message_id).await;
    respond(&state, "messages.get", result)
}

pub async fn edit_message(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    Path(message_id): Path<String>,
    Json(body): Json<EditMessageRequest>,
) -> Response {
    debug!(requester = %identity, %message_id, "editing message");
    let text = body.text_content.unwrap_or_default();
    let result = state.history().edit(&message_id, &text).await;
    respond(&state, "messages.edit", result)
}

pub async fn delete_message(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    Path(message_id): Path<String>,
) -> Response {
    debug!(requester = %identity, %message_id, "deleting message");
    let result = state
        .history()
        .delete(&message_id)
        .await
        .map(|()| Deleted {
            message_id,
            deleted: true,
        });
    respond(&state, "messages.delete", result)
}

pub async fn list_messages(
    State(state): State<AppState>,
    Authenticated(_identity): Authenticated,
    Path(conversation_id): Path<String>,
    Query(params): Query<PageParams>,
) -> Response {
    let result = match page_request(params.page.as_deref(), params.limit.as_deref()) {
        Ok(request) => state.history().list(&conversation_id, request).await,
        Err(err) => Err(err),
    };
    respond(&state, "conversations.messages.list", result)
}

pub async fn search_messages(
    State(state): State<AppState>,
    Authenticated(_identity): Authenticated,
    Path(conversation_id): Path<String>,
    Query(params): Query<SearchParams>,
) -> Response {
    let result = match search_request(&params) {
        Ok((query, request)) => state.history().search(&conversation_id, &query, request).await,
        Err(err) => Err(err),
    };
    respond(&state, "conversations.messages.search", result)
}
