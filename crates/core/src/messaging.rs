use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{de::Error as DeError, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use uuid::Uuid;

use crate::validation::FieldError;

/// Opaque message identifier, assigned by the session before any I/O.
pub type MessageId = String;

pub fn new_message_id() -> MessageId {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unrecognized {kind} '{value}'")]
pub struct UnknownVariant {
    kind: &'static str,
    value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    ChatText,
    Reaction,
    SystemInfo,
}

impl MessageKind {
    pub const ALL: [MessageKind; 3] = [
        MessageKind::ChatText,
        MessageKind::Reaction,
        MessageKind::SystemInfo,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            MessageKind::ChatText => "chat-text",
            MessageKind::Reaction => "reaction",
            MessageKind::SystemInfo => "system-info",
        }
    }
}

impl FromStr for MessageKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownVariant {
                kind: "message_type",
                value: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum MediaKind {
    #[default]
    None,
    Image,
    Video,
    Audio,
    VoiceNote,
    VideoNote,
    Document,
}

impl MediaKind {
    pub const ALL: [MediaKind; 7] = [
        MediaKind::None,
        MediaKind::Image,
        MediaKind::Video,
        MediaKind::Audio,
        MediaKind::VoiceNote,
        MediaKind::VideoNote,
        MediaKind::Document,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            MediaKind::None => "none",
            MediaKind::Image => "image",
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::VoiceNote => "voice-note",
            MediaKind::VideoNote => "video-note",
            MediaKind::Document => "document",
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, MediaKind::None)
    }
}

impl FromStr for MediaKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownVariant {
                kind: "media_type",
                value: s.to_string(),
            })
    }
}

macro_rules! string_enum_serde {
    ($ty:ty) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let value = String::deserialize(deserializer)?;
                <$ty>::from_str(&value).map_err(D::Error::custom)
            }
        }
    };
}

string_enum_serde!(MessageKind);
string_enum_serde!(MediaKind);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Media {
    #[serde(default)]
    pub media_url: String,
    #[serde(default)]
    pub media_type: MediaKind,
}

impl Media {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn stored(url: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            media_url: url.into(),
            media_type: kind,
        }
    }

    pub fn is_present(&self) -> bool {
        !self.media_url.is_empty()
    }
}

/// Canonical, validated representation of one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: MessageId,
    pub conversation_id: String,
    #[serde(rename = "sender_username")]
    pub sender_handle: String,
    #[serde(rename = "message_type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_content: Option<String>,
    #[serde(default)]
    pub media: Media,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl Envelope {
    /// Build an envelope from a validated submission. The id and timestamps
    /// are fixed here, before the envelope is written anywhere.
    pub fn compose(
        conversation_id: impl Into<String>,
        sender_handle: impl Into<String>,
        submission: Submission,
    ) -> Self {
        let now = Utc::now();
        let envelope = Self {
            message_id: new_message_id(),
            conversation_id: conversation_id.into(),
            sender_handle: sender_handle.into(),
            kind: submission.kind,
            text_content: submission.text_content,
            media: submission.media,
            created_at: now,
            modified_at: now,
        };
        debug_assert!(
            envelope.has_single_body(),
            "an envelope carries either text or media"
        );
        envelope
    }

    pub fn media_message(
        conversation_id: impl Into<String>,
        sender_handle: impl Into<String>,
        media: Media,
    ) -> Self {
        Self::compose(
            conversation_id,
            sender_handle,
            Submission {
                kind: MessageKind::ChatText,
                text_content: None,
                media,
            },
        )
    }

    /// Exactly one of text or media carries the message body.
    pub fn has_single_body(&self) -> bool {
        let has_text = self
            .text_content
            .as_deref()
            .is_some_and(|text| !text.trim().is_empty());
        has_text != self.media.is_present()
    }
}

/// A submission that passed boundary validation.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub kind: MessageKind,
    pub text_content: Option<String>,
    pub media: Media,
}

/// Inbound text-frame payload as it arrives on the wire. Enumerations stay
/// as raw strings here so unrecognized values surface as field errors
/// instead of opaque decode failures.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmissionFrame {
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub sender_username: Option<String>,
    #[serde(default)]
    pub message_type: Option<String>,
    #[serde(default)]
    pub text_content: Option<String>,
    #[serde(default)]
    pub media: Option<MediaFrame>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MediaFrame {
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub media_type: Option<String>,
}

impl SubmissionFrame {
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Validate against the conversation and sender bound to the session.
    pub fn validate(
        self,
        conversation_id: &str,
        sender_handle: &str,
    ) -> Result<Submission, Vec<FieldError>> {
        let mut errors = Vec::new();

        let kind = match self.message_type.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => match raw.parse::<MessageKind>() {
                Ok(kind) => Some(kind),
                Err(_) => {
                    errors.push(FieldError::new(
                        "message_type",
                        "must be one of chat-text, reaction, system-info",
                    ));
                    None
                }
            },
            _ => {
                errors.push(FieldError::new("message_type", "must be provided"));
                None
            }
        };

        if let Some(claimed) = non_blank(self.conversation_id.as_deref()) {
            if claimed != conversation_id {
                errors.push(FieldError::new(
                    "conversation_id",
                    "does not match the session conversation",
                ));
            }
        }

        if let Some(claimed) = non_blank(self.sender_username.as_deref()) {
            if claimed != sender_handle {
                errors.push(FieldError::new(
                    "sender_username",
                    "does not match the authenticated user",
                ));
            }
        }

        let media = match self.media {
            Some(frame) => match frame.validate() {
                Ok(media) => media,
                Err(error) => {
                    errors.push(error);
                    Media::none()
                }
            },
            None => Media::none(),
        };

        let text_content = self
            .text_content
            .filter(|text| !text.trim().is_empty());

        match (&text_content, media.is_present()) {
            (Some(_), true) => errors.push(FieldError::new(
                "text_content",
                "must not be combined with media",
            )),
            (None, false) if errors.is_empty() => errors.push(FieldError::new(
                "text_content",
                "text_content or media must be provided",
            )),
            _ => {}
        }

        if kind == Some(MessageKind::Reaction) && text_content.is_none() && errors.is_empty() {
            errors.push(FieldError::new(
                "text_content",
                "must be provided for reactions",
            ));
        }

        match kind {
            Some(kind) if errors.is_empty() => Ok(Submission {
                kind,
                text_content,
                media,
            }),
            _ => Err(errors),
        }
    }
}

impl MediaFrame {
    fn validate(self) -> Result<Media, FieldError> {
        let kind = match non_blank(self.media_type.as_deref()) {
            Some(raw) => raw.parse::<MediaKind>().map_err(|_| {
                FieldError::new(
                    "media.media_type",
                    "must be one of none, image, video, audio, voice-note, video-note, document",
                )
            })?,
            None => MediaKind::None,
        };
        let url = non_blank(self.media_url.as_deref()).unwrap_or_default();

        match (url.is_empty(), kind.is_none()) {
            (true, true) => Ok(Media::none()),
            (false, false) => Ok(Media::stored(url, kind)),
            (true, false) => Err(FieldError::new(
                "media.media_url",
                "must be provided when media_type is set",
            )),
            (false, true) => Err(FieldError::new(
                "media.media_type",
                "must not be none when media_url is set",
            )),
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

/// Advisory sent after the echo when the durability attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistenceNotice {
    pub message_id: MessageId,
    pub info: String,
}

impl PersistenceNotice {
    pub fn not_persisted(message_id: impl Into<MessageId>) -> Self {
        Self {
            message_id: message_id.into(),
            info: "message was delivered but could not be saved".to_string(),
        }
    }
}

/// In-band report for a frame that was dropped without an echo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FrameRejection {
    pub error: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<FieldError>,
}

impl FrameRejection {
    pub fn invalid_message(details: Vec<FieldError>) -> Self {
        Self {
            error: "invalid_message",
            details,
        }
    }

    pub fn malformed_frame() -> Self {
        Self {
            error: "malformed_frame",
            details: Vec::new(),
        }
    }

    pub fn media_rejected(reason: &'static str) -> Self {
        Self {
            error: "media_rejected",
            details: vec![FieldError::new("media", reason)],
        }
    }
}

/// Everything a session ever writes back to its peer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OutboundFrame {
    Envelope(Envelope),
    NotPersisted(PersistenceNotice),
    Rejected(FrameRejection),
}

impl OutboundFrame {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn frame(json: &str) -> SubmissionFrame {
        SubmissionFrame::parse(json).expect("frame parses")
    }

    #[test]
    fn chat_text_submission_validates() {
        let submission = frame(
            r#"{"conversation_id":"c1","sender_username":"alice","message_type":"chat-text","text_content":"hi"}"#,
        )
        .validate("c1", "alice")
        .expect("valid submission");

        assert_eq!(submission.kind, MessageKind::ChatText);
        assert_eq!(submission.text_content.as_deref(), Some("hi"));
        assert_eq!(submission.media, Media::none());
    }

    #[test]
    fn unrecognized_message_type_is_a_field_error() {
        let errors = frame(r#"{"message_type":"MessageChat","text_content":"hi"}"#)
            .validate("c1", "alice")
            .unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "message_type");
    }

    #[test]
    fn unrecognized_media_type_is_a_field_error() {
        let errors = frame(
            r#"{"message_type":"chat-text","media":{"media_url":"http://x/1.png","media_type":"hologram"}}"#,
        )
        .validate("c1", "alice")
        .unwrap_err();
        assert_eq!(errors[0].field, "media.media_type");
    }

    #[test]
    fn conversation_and_sender_must_match_binding() {
        let errors = frame(
            r#"{"conversation_id":"c2","sender_username":"mallory","message_type":"chat-text","text_content":"hi"}"#,
        )
        .validate("c1", "alice")
        .unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field).collect();
        assert_eq!(fields, vec!["conversation_id", "sender_username"]);
    }

    #[test]
    fn omitted_binding_fields_default_to_session() {
        let submission = frame(r#"{"message_type":"reaction","text_content":"+1"}"#)
            .validate("c1", "alice")
            .expect("valid");
        assert_eq!(submission.kind, MessageKind::Reaction);
    }

    #[test]
    fn text_and_media_are_mutually_exclusive() {
        let errors = frame(
            r#"{"message_type":"chat-text","text_content":"hi","media":{"media_url":"http://x/1.png","media_type":"image"}}"#,
        )
        .validate("c1", "alice")
        .unwrap_err();
        assert_eq!(errors[0].field, "text_content");

        let errors = frame(r#"{"message_type":"chat-text","text_content":"   "}"#)
            .validate("c1", "alice")
            .unwrap_err();
        assert_eq!(errors[0].message, "text_content or media must be provided");
    }

    #[test]
    fn media_only_submission_validates() {
        let submission = frame(
            r#"{"message_type":"chat-text","media":{"media_url":"http://x/1.ogg","media_type":"voice-note"}}"#,
        )
        .validate("c1", "alice")
        .expect("valid");
        assert_eq!(submission.media.media_type, MediaKind::VoiceNote);
        assert!(submission.text_content.is_none());
    }

    #[test]
    fn reactions_require_text() {
        let errors = frame(
            r#"{"message_type":"reaction","media":{"media_url":"http://x/1.png","media_type":"image"}}"#,
        )
        .validate("c1", "alice")
        .unwrap_err();
        assert_eq!(errors[0].message, "must be provided for reactions");
    }

    #[test]
    fn envelope_serializes_with_wire_names() {
        let envelope = Envelope::compose(
            "c1",
            "alice",
            Submission {
                kind: MessageKind::ChatText,
                text_content: Some("hi".into()),
                media: Media::none(),
            },
        );
        let value = serde_json::to_value(OutboundFrame::Envelope(envelope.clone())).unwrap();
        assert_eq!(value["message_id"], envelope.message_id.as_str());
        assert_eq!(value["sender_username"], "alice");
        assert_eq!(value["message_type"], "chat-text");
        assert_eq!(value["media"]["media_type"], "none");
        assert_eq!(value["text_content"], "hi");

        let decoded: Envelope = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, envelope);
        assert!(decoded.has_single_body());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "either text or media")]
    fn composing_without_a_body_is_caught_in_debug_builds() {
        Envelope::compose(
            "c1",
            "alice",
            Submission {
                kind: MessageKind::ChatText,
                text_content: None,
                media: Media::none(),
            },
        );
    }

    #[test]
    fn advisory_notice_is_a_small_object() {
        let frame = OutboundFrame::NotPersisted(PersistenceNotice::not_persisted("m-1"));
        let value: serde_json::Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        let object = value.as_object().unwrap();
        assert_eq!(object.len(), 2);
        assert_eq!(object["message_id"], "m-1");
        assert!(object.contains_key("info"));
    }

    #[test]
    fn kinds_round_trip_through_strings() {
        for kind in MediaKind::ALL {
            assert_eq!(kind.as_str().parse::<MediaKind>().unwrap(), kind);
        }
        assert!("MessageChat".parse::<MessageKind>().is_err());
    }

    proptest! {
        #[test]
        fn composed_envelopes_get_unique_ids(count in 1usize..64) {
            let mut seen = HashSet::new();
            for _ in 0..count {
                let envelope = Envelope::media_message(
                    "c1",
                    "alice",
                    Media::stored("http://localhost/media/chat/1.png", MediaKind::Image),
                );
                prop_assert!(seen.insert(envelope.message_id.clone()), "duplicate message id generated");
            }
        }
    }
}
