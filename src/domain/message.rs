//! Message domain types.
//!
//! Represents individual email messages as drivers hand them to callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Label;

/// Subject used when a message has none.
pub const NO_SUBJECT: &str = "(no subject)";

/// Returns the subject, or [`NO_SUBJECT`] when it is blank.
pub fn subject_or_default(subject: Option<String>) -> String {
    subject
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| NO_SUBJECT.to_string())
}

/// A sender or recipient as parsed from a provider message.
///
/// Unlike [`Address`](super::Address), the name is always present (possibly
/// empty) so consumers can destructure it without checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    pub name: String,
    pub email: String,
}

impl Sender {
    /// Creates a sender from a display name and address.
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }

    /// Placeholder used when the provider returns no sender.
    pub fn unknown() -> Self {
        Self::new("Unknown", "unknown@example.com")
    }
}

/// Attachment metadata and content on a fetched message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub attachment_id: String,
    pub filename: String,
    pub mime_type: String,
    /// Size in bytes as reported by the provider.
    pub size: u64,
    /// Base64 encoded content.
    pub body: String,
}

/// A single email message in canonical form.
///
/// `decoded_body` and `attachments` are only populated by a full fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedMessage {
    /// Provider message id; never empty.
    pub id: String,
    pub thread_id: String,
    /// Decoded preview text.
    pub title: String,
    pub subject: String,
    pub sender: Sender,
    pub to: Vec<Sender>,
    pub cc: Option<Vec<Sender>>,
    pub bcc: Vec<Sender>,
    pub received_on: DateTime<Utc>,
    pub unread: bool,
    /// RFC 5322 Message-ID header.
    pub message_id: String,
    pub in_reply_to: Option<String>,
    pub references: Option<String>,
    pub reply_to: Option<String>,
    pub list_unsubscribe: Option<String>,
    pub list_unsubscribe_post: Option<String>,
    pub tags: Vec<Label>,
    /// Whether the message was relayed over TLS.
    pub tls: bool,
    /// Render-ready HTML body.
    pub decoded_body: Option<String>,
    pub attachments: Vec<Attachment>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_subject_gets_placeholder() {
        assert_eq!(subject_or_default(None), NO_SUBJECT);
        assert_eq!(subject_or_default(Some("  ".to_string())), NO_SUBJECT);
        assert_eq!(subject_or_default(Some("Hi".to_string())), "Hi");
    }

    #[test]
    fn unknown_sender_placeholder() {
        let sender = Sender::unknown();
        assert_eq!(sender.name, "Unknown");
        assert_eq!(sender.email, "unknown@example.com");
    }

    #[test]
    fn parsed_message_serializes_camel_case() {
        let message = ParsedMessage {
            id: "m-1".to_string(),
            thread_id: "t-1".to_string(),
            title: "Preview".to_string(),
            subject: "Hello".to_string(),
            sender: Sender::new("Alice", "alice@example.com"),
            to: vec![Sender::new("", "bob@example.com")],
            cc: None,
            bcc: vec![],
            received_on: Utc::now(),
            unread: true,
            message_id: "<m-1@example.com>".to_string(),
            in_reply_to: None,
            references: None,
            reply_to: None,
            list_unsubscribe: None,
            list_unsubscribe_post: None,
            tags: vec![],
            tls: true,
            decoded_body: None,
            attachments: vec![],
        };

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["threadId"], "t-1");
        assert_eq!(json["messageId"], "<m-1@example.com>");
        assert!(json["cc"].is_null());
        assert_eq!(json["sender"]["email"], "alice@example.com");
    }

    #[test]
    fn attachment_serialization() {
        let attachment = Attachment {
            attachment_id: "att-1".to_string(),
            filename: "report.pdf".to_string(),
            mime_type: "application/pdf".to_string(),
            size: 2048,
            body: "JVBERg==".to_string(),
        };

        let json = serde_json::to_string(&attachment).unwrap();
        let deserialized: Attachment = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, attachment);
        assert!(json.contains("attachmentId"));
    }
}
