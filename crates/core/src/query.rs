use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{messaging::Envelope, validation::FieldError};

pub const DEFAULT_PAGE_LIMIT: i64 = 20;
pub const MAX_PAGE_LIMIT: i64 = 100;

/// A validated `page`/`limit` pair. Pages are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    page: i64,
    limit: i64,
}

impl PageRequest {
    pub fn new(page: i64, limit: i64) -> Result<Self, Vec<FieldError>> {
        let mut errors = Vec::new();
        if page < 1 {
            errors.push(FieldError::new("page", "must be a positive integer"));
        }
        if limit < 1 {
            errors.push(FieldError::new("limit", "must be a positive integer"));
        } else if limit > MAX_PAGE_LIMIT {
            errors.push(FieldError::new("limit", "must not exceed 100"));
        }

        if errors.is_empty() && (page - 1).checked_mul(limit).is_none() {
            errors.push(FieldError::new("page", "is too large"));
        }

        if errors.is_empty() {
            Ok(Self { page, limit })
        } else {
            Err(errors)
        }
    }

    /// Apply defaults for absent parameters, then validate.
    pub fn from_params(page: Option<i64>, limit: Option<i64>) -> Result<Self, Vec<FieldError>> {
        Self::new(page.unwrap_or(1), limit.unwrap_or(DEFAULT_PAGE_LIMIT))
    }

    pub fn page(&self) -> i64 {
        self.page
    }

    pub fn limit(&self) -> i64 {
        self.limit
    }

    /// Never overflows; `new` rejects pages whose offset does not fit.
    pub fn offset(&self) -> i64 {
        (self.page - 1) * self.limit
    }

    /// Slice an already-ordered collection down to this page.
    pub fn slice<T: Clone>(&self, items: &[T]) -> Vec<T> {
        let offset = usize::try_from(self.offset()).unwrap_or(usize::MAX);
        let limit = usize::try_from(self.limit).unwrap_or(usize::MAX);
        items.iter().skip(offset).take(limit).cloned().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub total_count: i64,
    pub page: i64,
    pub limit: i64,
}

impl<T> Page<T> {
    pub fn new(data: Vec<T>, total_count: i64, request: PageRequest) -> Self {
        Self {
            data,
            total_count,
            page: request.page(),
            limit: request.limit(),
        }
    }
}

/// Case-insensitive substring filter over text content, bounded by an
/// inclusive creation-time range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    text: String,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl SearchQuery {
    pub fn new(
        text: Option<&str>,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Self, Vec<FieldError>> {
        let mut errors = Vec::new();
        let text = text.map(str::trim).unwrap_or_default();
        if text.is_empty() {
            errors.push(FieldError::new("query", "must be provided"));
        }
        if start.is_none() {
            errors.push(FieldError::new("start", "must be an RFC 3339 timestamp"));
        }
        if end.is_none() {
            errors.push(FieldError::new("end", "must be an RFC 3339 timestamp"));
        }

        match (start, end) {
            (Some(start), Some(end)) if errors.is_empty() => {
                if start > end {
                    return Err(vec![FieldError::new("start", "must not be after end")]);
                }
                Ok(Self {
                    text: text.to_string(),
                    start,
                    end,
                })
            }
            _ => Err(errors),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn matches(&self, envelope: &Envelope) -> bool {
        let in_range = envelope.created_at >= self.start && envelope.created_at <= self.end;
        in_range
            && envelope.text_content.as_deref().is_some_and(|text| {
                text.to_lowercase().contains(&self.text.to_lowercase())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::{Media, MessageKind, Submission};
    use chrono::Duration;
    use proptest::prelude::*;

    fn text_envelope(text: &str, created_at: DateTime<Utc>) -> Envelope {
        let mut envelope = Envelope::compose(
            "c1",
            "alice",
            Submission {
                kind: MessageKind::ChatText,
                text_content: Some(text.to_string()),
                media: Media::none(),
            },
        );
        envelope.created_at = created_at;
        envelope.modified_at = created_at;
        envelope
    }

    #[test]
    fn rejects_non_positive_page_and_limit() {
        let errors = PageRequest::new(0, -1).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field).collect();
        assert_eq!(fields, vec!["page", "limit"]);
        assert!(PageRequest::new(1, MAX_PAGE_LIMIT + 1).is_err());
    }

    #[test]
    fn rejects_pages_whose_offset_overflows() {
        let errors = PageRequest::new(i64::MAX, MAX_PAGE_LIMIT).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "page");

        let last = i64::MAX / MAX_PAGE_LIMIT + 1;
        let request = PageRequest::new(last, MAX_PAGE_LIMIT).unwrap();
        assert_eq!(request.offset(), (last - 1) * MAX_PAGE_LIMIT);
        assert!(request.slice(&[1, 2, 3]).is_empty());
        assert!(PageRequest::new(i64::MAX, 1).is_ok());
    }

    #[test]
    fn defaults_apply_to_missing_params() {
        let request = PageRequest::from_params(None, None).unwrap();
        assert_eq!(request.page(), 1);
        assert_eq!(request.limit(), DEFAULT_PAGE_LIMIT);
    }

    #[test]
    fn slice_returns_requested_window() {
        let items = vec![1, 2, 3];
        assert_eq!(PageRequest::new(1, 2).unwrap().slice(&items), vec![1, 2]);
        assert_eq!(PageRequest::new(2, 2).unwrap().slice(&items), vec![3]);
        assert!(PageRequest::new(3, 2).unwrap().slice(&items).is_empty());
    }

    #[test]
    fn search_filters_by_substring_and_inclusive_range() {
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(10);
        let t2 = t0 + Duration::seconds(20);
        let hello = text_envelope("hello world", t1);
        let goodbye = text_envelope("goodbye", t2);

        let query = SearchQuery::new(Some("hello"), Some(t0), Some(t1 + Duration::seconds(1)))
            .expect("valid query");
        assert!(query.matches(&hello));
        assert!(!query.matches(&goodbye));

        let exact = SearchQuery::new(Some("HELLO"), Some(t1), Some(t1)).unwrap();
        assert!(exact.matches(&hello));
    }

    #[test]
    fn search_requires_ordered_range() {
        let now = Utc::now();
        let errors =
            SearchQuery::new(Some("x"), Some(now), Some(now - Duration::seconds(1))).unwrap_err();
        assert_eq!(errors[0].field, "start");

        let errors = SearchQuery::new(None, None, Some(now)).unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    proptest! {
        #[test]
        fn offset_is_page_minus_one_times_limit(page in 1i64..10_000, limit in 1i64..=MAX_PAGE_LIMIT) {
            let request = PageRequest::new(page, limit).unwrap();
            prop_assert_eq!(request.offset(), (page - 1) * limit);
        }
    }
}
