//! Core domain types for the Nkata messaging core: the message envelope, its
//! wire formats, caller identity, and history query shapes.

pub mod identity;
pub mod messaging;
pub mod query;
pub mod validation;

pub use identity::{Identity, IdentityError};
pub use messaging::{
    Envelope, FrameRejection, Media, MediaKind, MessageId, MessageKind, OutboundFrame,
    PersistenceNotice, Submission, SubmissionFrame,
};
pub use query::{Page, PageRequest, SearchQuery};
pub use validation::FieldError;
