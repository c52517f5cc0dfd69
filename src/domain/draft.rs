//! Draft domain types.

use serde::{Deserialize, Serialize};

use super::{OutgoingMessage, ParsedMessage};

/// Draft upsert payload.
///
/// When `id` is present the existing draft is updated in place; otherwise a
/// new draft is created.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftInput {
    pub id: Option<String>,
    #[serde(flatten)]
    pub message: OutgoingMessage,
}

/// A draft as loaded for editing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Draft {
    pub id: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    /// HTML content.
    pub content: String,
}

/// One page of drafts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftPage {
    /// Draft headers; `id` is the draft id.
    pub drafts: Vec<ParsedMessage>,
    pub next_page_token: Option<String>,
}

/// Result of saving a draft.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftReceipt {
    pub id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draft_input_flattens_message() {
        let json = r#"{"id":"d-1","to":[],"subject":"Draft","message":"<p>x</p>","fromEmail":null,"threadId":null}"#;
        let input: DraftInput = serde_json::from_str(json).unwrap();

        assert_eq!(input.id.as_deref(), Some("d-1"));
        assert_eq!(input.message.subject, "Draft");
    }

    #[test]
    fn draft_input_without_id_is_new() {
        let input = DraftInput::default();
        assert!(input.id.is_none());
    }
}
