//! Outgoing message types.
//!
//! Payloads callers build to send a message or save a draft.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// An email address with optional display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    /// Email address.
    pub email: String,
    /// Display name (e.g., "John Doe").
    pub name: Option<String>,
}

impl Address {
    /// Creates a new address with just an email.
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: None,
        }
    }

    /// Creates a new address with email and display name.
    pub fn with_name(email: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: Some(name.into()),
        }
    }

    /// Returns the display representation of this address.
    ///
    /// If a name is present, returns "Name <email>", otherwise just the email.
    pub fn display(&self) -> String {
        match &self.name {
            Some(name) if !name.is_empty() => format!("{} <{}>", name, self.email),
            _ => self.email.clone(),
        }
    }
}

/// A message to be sent or saved as a draft.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub to: Vec<Address>,
    #[serde(default)]
    pub cc: Vec<Address>,
    #[serde(default)]
    pub bcc: Vec<Address>,
    pub subject: String,
    /// HTML body. Sanitized by the driver before it reaches a provider.
    pub message: String,
    #[serde(default)]
    pub attachments: Vec<OutgoingAttachment>,
    /// Extra headers to set on the message.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Alias to send from instead of the account's primary address.
    pub from_email: Option<String>,
    /// Conversation this message replies into.
    pub thread_id: Option<String>,
}

/// An attachment to be sent with an outgoing email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingAttachment {
    /// Filename for the attachment.
    pub filename: String,
    /// MIME content type.
    pub mime_type: String,
    /// Raw attachment data.
    #[serde(with = "base64_serde")]
    pub data: Vec<u8>,
}

mod base64_serde {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD
            .decode(&s)
            .map_err(|e| serde::de::Error::custom(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_display_with_name() {
        let addr = Address::with_name("test@example.com", "Test User");
        assert_eq!(addr.display(), "Test User <test@example.com>");
    }

    #[test]
    fn address_display_without_name() {
        let addr = Address::new("test@example.com");
        assert_eq!(addr.display(), "test@example.com");
    }

    #[test]
    fn outgoing_attachment_serialization() {
        let attachment = OutgoingAttachment {
            filename: "document.pdf".to_string(),
            mime_type: "application/pdf".to_string(),
            data: vec![0x25, 0x50, 0x44, 0x46], // PDF magic bytes
        };

        let json = serde_json::to_string(&attachment).unwrap();
        assert!(json.contains("JVBERg=="));

        let deserialized: OutgoingAttachment = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.data, vec![0x25, 0x50, 0x44, 0x46]);
    }

    #[test]
    fn outgoing_message_defaults_optional_lists() {
        let json = r#"{"to":[{"email":"a@example.com","name":null}],"subject":"Hi","message":"<p>Hi</p>","fromEmail":null,"threadId":null}"#;
        let message: OutgoingMessage = serde_json::from_str(json).unwrap();

        assert_eq!(message.to.len(), 1);
        assert!(message.cc.is_empty());
        assert!(message.attachments.is_empty());
        assert!(message.headers.is_empty());
    }
}
