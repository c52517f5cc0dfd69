//! Thread domain types.
//!
//! List results carry one [`Thread`] per upstream conversation (or message, for
//! providers without conversations). Full conversations are returned by `get`
//! as a [`ThreadDetail`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Label, ParsedMessage, Sender};

/// A lightweight projection of a conversation for list display.
///
/// Bodies are never fetched by `list`; `body` stays empty and
/// `total_replies` stays zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    pub id: String,
    pub title: String,
    pub subject: String,
    pub sender: Sender,
    pub unread: bool,
    pub received_on: DateTime<Utc>,
    pub tags: Vec<Label>,
    pub body: String,
    pub total_replies: u32,
}

/// One page of list results.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadPage {
    pub threads: Vec<Thread>,
    /// Opaque token for the next page, `None` on the last page.
    pub next_page_token: Option<String>,
}

/// A fully fetched conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadDetail {
    /// Messages in provider order.
    pub messages: Vec<ParsedMessage>,
    /// The most recent message.
    pub latest: Option<ParsedMessage>,
    /// Union of labels across all messages.
    pub labels: Vec<Label>,
    pub has_unread: bool,
    pub total_replies: u32,
}

impl ThreadDetail {
    /// Builds thread-level aggregates from the messages of one conversation.
    pub fn from_messages(messages: Vec<ParsedMessage>) -> Self {
        let mut labels: Vec<Label> = Vec::new();
        for message in &messages {
            for tag in &message.tags {
                if !labels.iter().any(|l| l.id == tag.id) {
                    labels.push(tag.clone());
                }
            }
        }

        Self {
            latest: messages.last().cloned(),
            has_unread: messages.iter().any(|m| m.unread),
            total_replies: messages.len() as u32,
            labels,
            messages,
        }
    }
}
