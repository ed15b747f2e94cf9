use std::fmt;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("user handle must not be blank")]
    Blank,
}

/// A caller identity resolved once from a bearer credential and threaded
/// explicitly through every layer that needs it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    handle: String,
}

impl Identity {
    pub fn new(handle: impl Into<String>) -> Result<Self, IdentityError> {
        let handle = handle.into().trim().to_string();
        if handle.is_empty() {
            return Err(IdentityError::Blank);
        }
        Ok(Self { handle })
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.handle)
    }
}
