use serde::Serialize;

/// A single field-level validation failure, reported back to the caller
/// verbatim in JSON error bodies and in-band rejection frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: &'static str,
    pub message: &'static str,
}

impl FieldError {
    pub const fn new(field: &'static str, message: &'static str) -> Self {
        Self { field, message }
    }
}
