//! Gmail API driver implementation.
//!
//! This module provides a [`MailDriver`] implementation using the Gmail REST API.
//!
//! # API Usage
//!
//! This driver uses the Gmail API v1:
//! - `users.threads.list` / `users.threads.get` for listing and reading
//! - `users.threads.modify` for read state and labels, sent through the
//!   batch endpoint
//! - `users.messages.send` / `users.messages.trash` for sending and deleting
//! - `users.messages.attachments.get` for attachment content
//! - `users.labels.*` for label management
//! - `users.drafts.*` for drafts
//! - `users.settings.sendAs.list` for aliases
//!
//! Outgoing messages are built as RFC 5322 MIME with `lettre` and sent
//! base64url-encoded in the `raw` field.

use async_trait::async_trait;
use base64::prelude::*;
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use futures::{stream, StreamExt, TryStreamExt};
use lettre::message::header::{ContentType, HeaderName, HeaderValue};
use lettre::message::{Attachment as MimeAttachment, Mailbox, MultiPart, SinglePart};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::batch::{self, BatchCall, BATCH_LIMIT};
use super::factory::DriverContext;
use super::guard::ErrorGuard;
use super::html::{decode_entities, sanitize, text_to_html};
use super::http::{parse_error, ApiClient};
use super::oauth::OAuthClient;
use super::traits::cap_page;
use super::{
    strip_thread_prefix, DraftListParams, DriverResult, ListParams, MailDriver, ProviderError,
    Result,
};
use crate::domain::{
    id_or_unknown, subject_or_default, Address, Attachment, Draft, DraftInput, DraftPage,
    DraftReceipt, EmailAlias, FolderCount, Label, LabelChanges, LabelColor, LabelInput,
    OAuthTokens, OutgoingMessage, ParsedMessage, ProviderId, SendReceipt, Sender, Thread,
    ThreadDetail, ThreadPage, UserInfo,
};

/// OAuth scopes requested for Gmail connections.
const SCOPES: &[&str] = &[
    "https://mail.google.com/",
    "https://www.googleapis.com/auth/userinfo.profile",
    "https://www.googleapis.com/auth/userinfo.email",
];

/// Search that selects archived mail, which has no label of its own.
const ARCHIVE_QUERY: &str = "-in:inbox -in:spam -in:trash -in:drafts";

/// Folders reported by `count`, as (canonical token, label id).
const COUNTED_FOLDERS: &[(&str, &str)] = &[
    ("inbox", "INBOX"),
    ("sent", "SENT"),
    ("drafts", "DRAFT"),
    ("trash", "TRASH"),
    ("junk", "SPAM"),
];

/// Concurrent metadata lookups per list page.
const LIST_CONCURRENCY: usize = 10;

/// Batch endpoint used when the API base cannot be parsed.
const DEFAULT_BATCH_URL: &str = "https://gmail.googleapis.com/batch/gmail/v1";

/// Path prefix of batched calls when the API base cannot be parsed.
const DEFAULT_API_PATH: &str = "/gmail/v1/users/me";

/// Gmail API thread list response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThreadListResponse {
    #[serde(default)]
    threads: Vec<ThreadRef>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ThreadRef {
    id: String,
}

/// Gmail API thread.
#[derive(Debug, Deserialize)]
struct GmailThread {
    id: Option<String>,
    #[serde(default)]
    messages: Vec<GmailMessage>,
}

/// Gmail API message.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessage {
    id: Option<String>,
    thread_id: Option<String>,
    #[serde(default)]
    label_ids: Vec<String>,
    snippet: Option<String>,
    payload: Option<GmailPart>,
    internal_date: Option<String>,
}

/// Gmail message part. The top-level payload is a part too.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailPart {
    mime_type: Option<String>,
    filename: Option<String>,
    #[serde(default)]
    headers: Vec<GmailHeader>,
    body: Option<GmailBody>,
    #[serde(default)]
    parts: Vec<GmailPart>,
}

/// Gmail message header.
#[derive(Debug, Deserialize)]
struct GmailHeader {
    name: String,
    value: String,
}

/// Gmail message body, also returned by `attachments.get`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailBody {
    attachment_id: Option<String>,
    size: Option<u64>,
    data: Option<String>,
}

/// Gmail API label.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailLabel {
    id: String,
    name: String,
    #[serde(rename = "type")]
    label_type: Option<String>,
    color: Option<GmailLabelColor>,
    threads_unread: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailLabelColor {
    background_color: String,
    text_color: String,
}

/// Gmail labels list response.
#[derive(Debug, Deserialize)]
struct LabelsListResponse {
    #[serde(default)]
    labels: Vec<GmailLabel>,
}

/// Gmail label create/update body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LabelRequest<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    label_list_visibility: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message_list_visibility: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    color: Option<GmailLabelColor>,
}

/// Gmail modify request body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ModifyRequest<'a> {
    #[serde(skip_serializing_if = "no_ids")]
    add_label_ids: &'a [String],
    #[serde(skip_serializing_if = "no_ids")]
    remove_label_ids: &'a [String],
}

fn no_ids(ids: &&[String]) -> bool {
    ids.is_empty()
}

/// Gmail drafts list response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DraftListResponse {
    #[serde(default)]
    drafts: Vec<DraftRef>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DraftRef {
    id: String,
}

/// Gmail API draft.
#[derive(Debug, Deserialize)]
struct GmailDraft {
    id: Option<String>,
    message: Option<GmailMessage>,
}

/// Response of `messages.send` and `drafts.send`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SentMessage {
    id: Option<String>,
    thread_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendAsListResponse {
    #[serde(default)]
    send_as: Vec<SendAs>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendAs {
    send_as_email: String,
    display_name: Option<String>,
    #[serde(default)]
    is_primary: bool,
}

/// Google userinfo response.
#[derive(Debug, Deserialize)]
struct GoogleUserInfo {
    email: Option<String>,
    name: Option<String>,
    picture: Option<String>,
}

/// Where a canonical folder token points in Gmail.
#[derive(Debug, PartialEq, Eq)]
enum FolderTarget {
    Label(String),
    Search(&'static str),
    All,
}

/// Maps a canonical folder token to a Gmail label or search.
///
/// Unmapped names are treated as label ids.
fn folder_target(folder: &str) -> FolderTarget {
    match folder.trim().to_ascii_lowercase().as_str() {
        "" => FolderTarget::All,
        "inbox" => FolderTarget::Label("INBOX".to_string()),
        "sent" => FolderTarget::Label("SENT".to_string()),
        "drafts" | "draft" => FolderTarget::Label("DRAFT".to_string()),
        "trash" | "bin" => FolderTarget::Label("TRASH".to_string()),
        "junk" | "spam" => FolderTarget::Label("SPAM".to_string()),
        "archive" => FolderTarget::Search(ARCHIVE_QUERY),
        _ => FolderTarget::Label(folder.to_string()),
    }
}

/// Converts label changes into Gmail add/remove label ids.
///
/// Adding `archive` removes the thread from the inbox.
fn label_ids_for(changes: &LabelChanges) -> (Vec<String>, Vec<String>) {
    let mut add = Vec::new();
    let mut remove = Vec::new();

    for label in &changes.add_labels {
        match folder_target(label) {
            FolderTarget::Label(id) => add.push(id),
            FolderTarget::Search(_) => remove.push("INBOX".to_string()),
            FolderTarget::All => {}
        }
    }
    for label in &changes.remove_labels {
        if let FolderTarget::Label(id) = folder_target(label) {
            remove.push(id);
        }
    }

    (add, remove)
}

/// Classifies a Gmail label id.
fn label_from_id(id: &str) -> Label {
    let label_type = if id.starts_with("Label_") {
        "user"
    } else {
        "system"
    };
    Label::new(id, id, label_type)
}

impl From<GmailLabel> for Label {
    fn from(label: GmailLabel) -> Self {
        Self {
            label_type: label
                .label_type
                .map(|t| t.to_ascii_lowercase())
                .unwrap_or_else(|| "user".to_string()),
            color: label.color.map(|c| LabelColor {
                background_color: c.background_color,
                text_color: c.text_color,
            }),
            id: label.id,
            name: label.name,
        }
    }
}

/// Splits an address list on commas outside quotes and angle brackets.
fn split_addresses(value: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut in_angle = false;
    let mut start = 0;

    for (i, c) in value.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            '<' if !in_quotes => in_angle = true,
            '>' if !in_quotes => in_angle = false,
            ',' if !in_quotes && !in_angle => {
                parts.push(&value[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&value[start..]);

    parts
        .into_iter()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect()
}

/// Parses an address from a header value like "Name <email@example.com>".
fn parse_sender(value: &str) -> Sender {
    let value = value.trim();
    if let (Some(start), Some(end)) = (value.find('<'), value.rfind('>')) {
        if start < end {
            let email = value[start + 1..end].trim();
            let name = value[..start].trim().trim_matches('"').trim();
            return Sender::new(decode_entities(name), email);
        }
    }
    Sender::new("", value)
}

/// Parses multiple addresses from a comma-separated header value.
fn parse_senders(value: &str) -> Vec<Sender> {
    split_addresses(value).into_iter().map(parse_sender).collect()
}

/// Decodes Gmail's base64url data, with or without padding.
fn decode_data(data: &str) -> Option<Vec<u8>> {
    BASE64_URL_SAFE_NO_PAD
        .decode(data.trim_end_matches('='))
        .ok()
}

fn decode_text(data: &str) -> Option<String> {
    decode_data(data).map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}

impl GmailPart {
    fn header(&self, name: &str) -> Option<String> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.clone())
    }

    fn is_attachment(&self) -> bool {
        self.filename.as_deref().is_some_and(|f| !f.is_empty())
    }

    fn collect_bodies(&self, html: &mut Option<String>, text: &mut Option<String>) {
        if !self.is_attachment() {
            let data = self.body.as_ref().and_then(|b| b.data.as_deref());
            match (self.mime_type.as_deref(), data) {
                (Some("text/html"), Some(data)) if html.is_none() => *html = decode_text(data),
                (Some("text/plain"), Some(data)) if text.is_none() => *text = decode_text(data),
                _ => {}
            }
        }
        for part in &self.parts {
            part.collect_bodies(html, text);
        }
    }

    /// Returns render-ready HTML, preferring an HTML part over plain text.
    fn render_body(&self) -> Option<String> {
        let mut html = None;
        let mut text = None;
        self.collect_bodies(&mut html, &mut text);
        html.or_else(|| text.map(|t| text_to_html(&t)))
    }

    fn collect_attachments(&self, out: &mut Vec<Attachment>) {
        if self.is_attachment() {
            let body = self.body.as_ref();
            let attachment_id = body.and_then(|b| b.attachment_id.clone());
            let data = body.and_then(|b| b.data.clone());
            if attachment_id.is_some() || data.is_some() {
                out.push(Attachment {
                    attachment_id: attachment_id.unwrap_or_default(),
                    filename: self.filename.clone().unwrap_or_default(),
                    mime_type: self
                        .mime_type
                        .clone()
                        .unwrap_or_else(|| "application/octet-stream".to_string()),
                    size: body.and_then(|b| b.size).unwrap_or(0),
                    body: data.unwrap_or_default(),
                });
            }
        }
        for part in &self.parts {
            part.collect_attachments(out);
        }
    }
}

/// Converts a Gmail message to a canonical message.
///
/// Attachment entries carry metadata only; content is loaded by `get`.
fn parse_message(msg: &GmailMessage) -> ParsedMessage {
    let empty = GmailPart::default();
    let payload = msg.payload.as_ref().unwrap_or(&empty);
    let header = |name: &str| payload.header(name);

    let sender = header("From")
        .map(|v| parse_sender(&v))
        .filter(|s| !s.email.is_empty())
        .unwrap_or_else(Sender::unknown);

    let received_on = msg
        .internal_date
        .as_deref()
        .and_then(|d| d.parse::<i64>().ok())
        .and_then(DateTime::from_timestamp_millis)
        .or_else(|| {
            header("Date")
                .and_then(|d| DateTime::parse_from_rfc2822(d.trim()).ok())
                .map(|d| d.with_timezone(&Utc))
        })
        .unwrap_or_else(Utc::now);

    let tls = payload
        .headers
        .iter()
        .filter(|h| h.name.eq_ignore_ascii_case("Received"))
        .any(|h| h.value.contains("ESMTPS") || h.value.contains("TLS"));

    let mut attachments = Vec::new();
    payload.collect_attachments(&mut attachments);

    ParsedMessage {
        id: id_or_unknown(msg.id.as_deref()),
        thread_id: id_or_unknown(msg.thread_id.as_deref()),
        title: decode_entities(msg.snippet.as_deref().unwrap_or_default()),
        subject: subject_or_default(header("Subject").map(|s| decode_entities(&s))),
        sender,
        to: header("To").map(|v| parse_senders(&v)).unwrap_or_default(),
        cc: header("Cc")
            .map(|v| parse_senders(&v))
            .filter(|cc| !cc.is_empty()),
        bcc: header("Bcc").map(|v| parse_senders(&v)).unwrap_or_default(),
        received_on,
        unread: msg.label_ids.iter().any(|l| l == "UNREAD"),
        message_id: header("Message-ID").unwrap_or_default(),
        in_reply_to: header("In-Reply-To"),
        references: header("References"),
        reply_to: header("Reply-To"),
        list_unsubscribe: header("List-Unsubscribe"),
        list_unsubscribe_post: header("List-Unsubscribe-Post"),
        tags: msg.label_ids.iter().map(|id| label_from_id(id)).collect(),
        tls,
        decoded_body: payload.render_body(),
        attachments,
    }
}

/// Builds the list projection of a thread from its messages.
fn thread_projection(fallback_id: &str, thread: &GmailThread) -> Thread {
    let messages: Vec<ParsedMessage> = thread.messages.iter().map(parse_message).collect();
    let detail = ThreadDetail::from_messages(messages);
    let id = id_or_unknown(thread.id.as_deref().or(Some(fallback_id)));

    match detail.latest {
        Some(latest) => Thread {
            id,
            title: latest.title,
            subject: latest.subject,
            sender: latest.sender,
            unread: detail.has_unread,
            received_on: latest.received_on,
            tags: detail.labels,
            body: String::new(),
            total_replies: 0,
        },
        None => Thread {
            id,
            title: String::new(),
            subject: subject_or_default(None),
            sender: Sender::unknown(),
            unread: false,
            received_on: Utc::now(),
            tags: Vec::new(),
            body: String::new(),
            total_replies: 0,
        },
    }
}

fn mailbox(address: &Address) -> Result<Mailbox> {
    address
        .display()
        .parse()
        .map_err(|e| ProviderError::InvalidRequest(format!("invalid address {}: {}", address.email, e)))
}

/// Builds an RFC 5322 message for sending or saving as a draft.
///
/// The body is sanitized here. Bcc recipients are kept in the headers since
/// Gmail reads them from the raw message.
fn build_mime(from: &str, message: &OutgoingMessage) -> Result<Vec<u8>> {
    let from: Mailbox = from
        .parse()
        .map_err(|e| ProviderError::InvalidRequest(format!("invalid from address: {}", e)))?;

    let mut builder = lettre::Message::builder()
        .from(from)
        .subject(message.subject.clone())
        .keep_bcc();

    for addr in &message.to {
        builder = builder.to(mailbox(addr)?);
    }
    for addr in &message.cc {
        builder = builder.cc(mailbox(addr)?);
    }
    for addr in &message.bcc {
        builder = builder.bcc(mailbox(addr)?);
    }

    for (name, value) in &message.headers {
        let name = HeaderName::new_from_ascii(name.clone())
            .map_err(|e| ProviderError::InvalidRequest(format!("invalid header {}: {}", name, e)))?;
        builder = builder.raw_header(HeaderValue::new(name, value.clone()));
    }

    let html = SinglePart::html(sanitize(&message.message));
    let email = if message.attachments.is_empty() {
        builder.singlepart(html)
    } else {
        let mut parts = MultiPart::mixed().singlepart(html);
        for attachment in &message.attachments {
            let content_type = ContentType::parse(&attachment.mime_type)
                .or_else(|_| ContentType::parse("application/octet-stream"))
                .map_err(|e| ProviderError::InvalidRequest(format!("invalid mime type: {}", e)))?;
            parts = parts.singlepart(
                MimeAttachment::new(attachment.filename.clone())
                    .body(attachment.data.clone(), content_type),
            );
        }
        builder.multipart(parts)
    }
    .map_err(|e| ProviderError::InvalidRequest(format!("failed to build message: {}", e)))?;

    Ok(email.formatted())
}

/// Summarizes an outgoing message for error context, without bodies.
fn message_context(message: &OutgoingMessage) -> serde_json::Value {
    json!({
        "to": message.to.iter().map(|a| a.email.as_str()).collect::<Vec<_>>(),
        "subject": message.subject,
        "attachments": message.attachments.len(),
        "threadId": message.thread_id,
    })
}

/// Splits the API base into the batch endpoint and the path batched calls
/// use: `https://gmail.googleapis.com/gmail/v1/users/me` gives
/// `https://gmail.googleapis.com/batch/gmail/v1` and `/gmail/v1/users/me`.
fn batch_endpoint(api_base: &str) -> (String, String) {
    let Ok(url) = url::Url::parse(api_base) else {
        return (DEFAULT_BATCH_URL.to_string(), DEFAULT_API_PATH.to_string());
    };
    let path = url.path().trim_end_matches('/').to_string();
    let version = path.split_once("/users/").map_or(path.as_str(), |(v, _)| v);
    let batch_url = format!("{}/batch{}", url.origin().ascii_serialization(), version);
    (batch_url, path)
}

/// Gmail REST driver.
///
/// Implements [`MailDriver`] against the Gmail API v1 with bearer tokens from
/// the connection's token supplier.
pub struct GmailDriver {
    api: ApiClient,
    /// Google batch endpoint for the API version in use.
    batch_url: String,
    /// API base path that batched calls are addressed by.
    api_path: String,
    oauth: OAuthClient,
    guard: ErrorGuard,
    /// Address of the connected account, used as the default sender.
    email: String,
    userinfo_url: String,
}

impl GmailDriver {
    pub fn new(ctx: DriverContext) -> Self {
        let (batch_url, api_path) = batch_endpoint(&ctx.settings.api_base);
        Self {
            api: ApiClient::new(ctx.settings.api_base.clone(), ctx.http, ctx.tokens),
            batch_url,
            api_path,
            oauth: ctx.oauth,
            guard: ErrorGuard::new(ProviderId::Google, ctx.connection.id, ctx.store),
            email: ctx.connection.email,
            userinfo_url: ctx.settings.userinfo_url,
        }
    }

    fn sender_address<'a>(&'a self, message: &'a OutgoingMessage) -> &'a str {
        message
            .from_email
            .as_deref()
            .filter(|f| !f.is_empty())
            .unwrap_or(&self.email)
    }

    async fn list_threads(&self, params: &ListParams) -> Result<ThreadPage> {
        let mut query: Vec<(&str, String)> = Vec::new();
        let mut search: Vec<String> = params
            .query
            .iter()
            .filter(|q| !q.trim().is_empty())
            .cloned()
            .collect();

        match folder_target(&params.folder) {
            FolderTarget::Label(id) => query.push(("labelIds", id)),
            FolderTarget::Search(q) => search.push(q.to_string()),
            FolderTarget::All => {}
        }
        for id in &params.label_ids {
            query.push(("labelIds", id.clone()));
        }
        if !search.is_empty() {
            query.push(("q", search.join(" ")));
        }
        if let Some(max) = params.max_results {
            query.push(("maxResults", max.to_string()));
        }
        if let Some(token) = &params.page_token {
            query.push(("pageToken", token.clone()));
        }

        let mut response: ThreadListResponse = self.api.get_json("/threads", &query).await?;
        cap_page(&mut response.threads, params.max_results);

        let threads: Vec<Thread> = stream::iter(response.threads)
            .map(|t| self.thread_summary(t.id))
            .buffered(LIST_CONCURRENCY)
            .try_collect::<Vec<_>>()
            .await?
            .into_iter()
            .flatten()
            .collect();

        Ok(ThreadPage {
            threads,
            next_page_token: response.next_page_token,
        })
    }

    /// Fetches thread metadata. A thread deleted since listing yields `None`.
    async fn thread_summary(&self, id: String) -> Result<Option<Thread>> {
        let query = [
            ("format", "metadata".to_string()),
            ("metadataHeaders", "From".to_string()),
            ("metadataHeaders", "Subject".to_string()),
            ("metadataHeaders", "Date".to_string()),
        ];
        match self
            .api
            .get_json::<GmailThread>(&format!("/threads/{}", id), &query)
            .await
        {
            Ok(thread) => Ok(Some(thread_projection(&id, &thread))),
            Err(e) if e.is_not_found() => {
                tracing::debug!(thread_id = %id, "thread vanished while listing");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn get_thread(&self, id: &str) -> Result<ThreadDetail> {
        let thread: GmailThread = self
            .api
            .get_json(&format!("/threads/{}", id), &[("format", "full".to_string())])
            .await?;

        let messages =
            try_join_all(thread.messages.iter().map(|m| self.load_message(m))).await?;
        Ok(ThreadDetail::from_messages(messages))
    }

    /// Parses a message and loads its attachment content concurrently.
    async fn load_message(&self, msg: &GmailMessage) -> Result<ParsedMessage> {
        let mut parsed = parse_message(msg);
        let pending = std::mem::take(&mut parsed.attachments);
        let loaded = try_join_all(
            pending
                .into_iter()
                .map(|a| self.load_attachment(&parsed.id, a)),
        )
        .await?;
        parsed.attachments = loaded.into_iter().flatten().collect();
        Ok(parsed)
    }

    /// Fills in attachment content. Missing content yields `None`.
    async fn load_attachment(
        &self,
        message_id: &str,
        mut attachment: Attachment,
    ) -> Result<Option<Attachment>> {
        if !attachment.body.is_empty() {
            return Ok(Some(attachment));
        }
        match self.fetch_attachment(message_id, &attachment.attachment_id).await {
            Ok(GmailBody {
                data: Some(data), ..
            }) => {
                attachment.body = data;
                Ok(Some(attachment))
            }
            Ok(_) => Ok(None),
            Err(e) if e.is_not_found() => {
                tracing::debug!(
                    message_id,
                    attachment_id = %attachment.attachment_id,
                    "attachment content missing"
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch_attachment(&self, message_id: &str, attachment_id: &str) -> Result<GmailBody> {
        self.api
            .get_json(
                &format!("/messages/{}/attachments/{}", message_id, attachment_id),
                &[],
            )
            .await
    }

    async fn send_message(&self, message: &OutgoingMessage) -> Result<SendReceipt> {
        let raw = build_mime(self.sender_address(message), message)?;
        let mut body = json!({ "raw": BASE64_URL_SAFE_NO_PAD.encode(raw) });
        if let Some(thread_id) = &message.thread_id {
            body["threadId"] = json!(thread_id);
        }

        let sent: SentMessage = self
            .api
            .send_json(Method::POST, "/messages/send", &body)
            .await?;
        tracing::info!(message_id = ?sent.id, "message sent");

        Ok(SendReceipt {
            id: sent.id,
            thread_id: sent.thread_id,
        })
    }

    async fn trash_message(&self, id: &str) -> Result<()> {
        match self
            .api
            .send_empty(Method::POST, &format!("/messages/{}/trash", id), None)
            .await
        {
            Err(e) if e.is_not_found() => {
                tracing::debug!(message_id = %id, "message already deleted");
                Ok(())
            }
            other => other,
        }
    }

    /// Sends `threads.modify` for every id through the batch endpoint, one
    /// round trip per [`BATCH_LIMIT`] threads. Threads that no longer exist
    /// are skipped.
    async fn modify_threads(&self, ids: &[String], add: &[String], remove: &[String]) -> Result<()> {
        if add.is_empty() && remove.is_empty() {
            return Ok(());
        }
        let body = serde_json::to_value(ModifyRequest {
            add_label_ids: add,
            remove_label_ids: remove,
        })
        .map_err(|e| ProviderError::Internal(format!("serialize request: {}", e)))?;

        let calls: Vec<BatchCall> = strip_thread_prefix(ids)
            .into_iter()
            .map(|id| BatchCall {
                method: Method::POST,
                path: format!("{}/threads/{}/modify", self.api_path, id),
                body: Some(body.clone()),
            })
            .collect();

        for chunk in calls.chunks(BATCH_LIMIT) {
            let boundary = batch::boundary();
            let (content_type, reply) = self
                .api
                .send_raw(
                    Method::POST,
                    &self.batch_url,
                    &batch::content_type(&boundary),
                    batch::encode(&boundary, chunk),
                )
                .await?;

            let replies = batch::decode(&content_type, &reply)?;
            if replies.len() != chunk.len() {
                return Err(ProviderError::Internal(format!(
                    "batch reply has {} parts for {} calls",
                    replies.len(),
                    chunk.len()
                )));
            }
            for reply in replies {
                if reply.is_success() {
                    continue;
                }
                if reply.status == 404 {
                    tracing::debug!(index = reply.index, "thread already gone");
                    continue;
                }
                return Err(parse_error(reply.status, reply.retry_after_secs, &reply.body));
            }
        }

        Ok(())
    }

    async fn unread_counts(&self) -> Result<Vec<FolderCount>> {
        let counts = try_join_all(COUNTED_FOLDERS.iter().map(|(token, id)| async move {
            match self
                .api
                .get_json::<GmailLabel>(&format!("/labels/{}", id), &[])
                .await
            {
                Ok(label) => Ok(Some(FolderCount {
                    label: token.to_string(),
                    count: label.threads_unread.unwrap_or(0),
                })),
                Err(e) if e.is_not_found() => Ok(None),
                Err(e) => Err(e),
            }
        }))
        .await?;
        Ok(counts.into_iter().flatten().collect())
    }

    async fn user_info(&self) -> Result<UserInfo> {
        let info: GoogleUserInfo = self.api.get_json(&self.userinfo_url, &[]).await?;
        Ok(UserInfo {
            address: info.email.unwrap_or_else(|| self.email.clone()),
            name: info.name.unwrap_or_default(),
            photo: info.picture.unwrap_or_default(),
        })
    }

    async fn labels(&self) -> Result<Vec<Label>> {
        let response: LabelsListResponse = self.api.get_json("/labels", &[]).await?;
        Ok(response.labels.into_iter().map(Label::from).collect())
    }

    async fn label(&self, id: &str) -> Result<Label> {
        let label: GmailLabel = self.api.get_json(&format!("/labels/{}", id), &[]).await?;
        Ok(label.into())
    }

    fn label_request(input: &LabelInput, create: bool) -> LabelRequest<'_> {
        LabelRequest {
            name: &input.name,
            label_list_visibility: create.then_some("labelShow"),
            message_list_visibility: create.then_some("show"),
            color: input.color.as_ref().map(|c| GmailLabelColor {
                background_color: c.background_color.clone(),
                text_color: c.text_color.clone(),
            }),
        }
    }

    async fn insert_label(&self, input: &LabelInput) -> Result<Label> {
        let label: GmailLabel = self
            .api
            .send_json(Method::POST, "/labels", &Self::label_request(input, true))
            .await?;
        Ok(label.into())
    }

    async fn patch_label(&self, id: &str, input: &LabelInput) -> Result<Label> {
        let label: GmailLabel = self
            .api
            .send_json(
                Method::PATCH,
                &format!("/labels/{}", id),
                &Self::label_request(input, false),
            )
            .await?;
        Ok(label.into())
    }

    async fn drafts(&self, params: &DraftListParams) -> Result<DraftPage> {
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(q) = params.query.as_ref().filter(|q| !q.trim().is_empty()) {
            query.push(("q", q.clone()));
        }
        if let Some(max) = params.max_results {
            query.push(("maxResults", max.to_string()));
        }
        if let Some(token) = &params.page_token {
            query.push(("pageToken", token.clone()));
        }

        let mut response: DraftListResponse = self.api.get_json("/drafts", &query).await?;
        cap_page(&mut response.drafts, params.max_results);

        let drafts = stream::iter(response.drafts)
            .map(|d| self.draft_summary(d.id))
            .buffered(LIST_CONCURRENCY)
            .try_collect::<Vec<_>>()
            .await?
            .into_iter()
            .flatten()
            .collect();

        Ok(DraftPage {
            drafts,
            next_page_token: response.next_page_token,
        })
    }

    async fn draft_summary(&self, id: String) -> Result<Option<ParsedMessage>> {
        match self
            .api
            .get_json::<GmailDraft>(
                &format!("/drafts/{}", id),
                &[("format", "metadata".to_string())],
            )
            .await
        {
            Ok(draft) => {
                let mut parsed = draft
                    .message
                    .as_ref()
                    .map(parse_message)
                    .unwrap_or_else(|| parse_message(&GmailMessage::empty()));
                parsed.id = id_or_unknown(draft.id.as_deref().or(Some(&id)));
                Ok(Some(parsed))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn draft(&self, id: &str) -> Result<Draft> {
        let draft: GmailDraft = self
            .api
            .get_json(&format!("/drafts/{}", id), &[("format", "full".to_string())])
            .await?;
        let message = draft
            .message
            .ok_or_else(|| ProviderError::NotFound(format!("draft {} has no message", id)))?;
        let parsed = parse_message(&message);
        let emails =
            |senders: Vec<Sender>| -> Vec<String> { senders.into_iter().map(|s| s.email).collect() };

        Ok(Draft {
            id: id_or_unknown(draft.id.as_deref().or(Some(id))),
            to: emails(parsed.to),
            cc: emails(parsed.cc.unwrap_or_default()),
            bcc: emails(parsed.bcc),
            subject: parsed.subject,
            content: parsed.decoded_body.unwrap_or_default(),
        })
    }

    fn draft_message(&self, message: &OutgoingMessage) -> Result<serde_json::Value> {
        let raw = build_mime(self.sender_address(message), message)?;
        let mut body = json!({ "raw": BASE64_URL_SAFE_NO_PAD.encode(raw) });
        if let Some(thread_id) = &message.thread_id {
            body["threadId"] = json!(thread_id);
        }
        Ok(body)
    }

    async fn save_draft(&self, input: &DraftInput) -> Result<DraftReceipt> {
        let message = self.draft_message(&input.message)?;
        let draft: GmailDraft = match &input.id {
            Some(id) => {
                self.api
                    .send_json(
                        Method::PUT,
                        &format!("/drafts/{}", id),
                        &json!({ "id": id, "message": message }),
                    )
                    .await?
            }
            None => {
                self.api
                    .send_json(Method::POST, "/drafts", &json!({ "message": message }))
                    .await?
            }
        };

        Ok(DraftReceipt {
            id: id_or_unknown(draft.id.as_deref().or(input.id.as_deref())),
        })
    }

    async fn send_existing_draft(&self, id: &str, message: &OutgoingMessage) -> Result<SendReceipt> {
        let body = json!({ "id": id, "message": self.draft_message(message)? });
        let sent: SentMessage = self
            .api
            .send_json(Method::POST, "/drafts/send", &body)
            .await?;
        tracing::info!(draft_id = %id, message_id = ?sent.id, "draft sent");

        Ok(SendReceipt {
            id: sent.id,
            thread_id: sent.thread_id,
        })
    }

    async fn attachment_bytes(&self, message_id: &str, attachment_id: &str) -> Result<Vec<u8>> {
        let body = self.fetch_attachment(message_id, attachment_id).await?;
        body.data
            .as_deref()
            .and_then(decode_data)
            .ok_or_else(|| {
                ProviderError::NotFound(format!("attachment {} has no content", attachment_id))
            })
    }

    async fn aliases(&self) -> Result<Vec<EmailAlias>> {
        let response: SendAsListResponse = self.api.get_json("/settings/sendAs", &[]).await?;
        if response.send_as.is_empty() {
            return Ok(vec![EmailAlias {
                email: self.email.clone(),
                name: None,
                primary: true,
            }]);
        }

        Ok(response
            .send_as
            .into_iter()
            .map(|alias| EmailAlias {
                email: alias.send_as_email,
                name: alias.display_name.filter(|n| !n.is_empty()),
                primary: alias.is_primary,
            })
            .collect())
    }
}

impl GmailMessage {
    fn empty() -> Self {
        Self {
            id: None,
            thread_id: None,
            label_ids: Vec::new(),
            snippet: None,
            payload: None,
            internal_date: None,
        }
    }
}

#[async_trait]
impl MailDriver for GmailDriver {
    fn provider(&self) -> ProviderId {
        ProviderId::Google
    }

    async fn list(&self, params: &ListParams) -> DriverResult<ThreadPage> {
        self.guard
            .run("list", json!(params), self.list_threads(params))
            .await
    }

    async fn get(&self, id: &str) -> DriverResult<ThreadDetail> {
        self.guard
            .run("get", json!({ "id": id }), self.get_thread(id))
            .await
    }

    async fn create(&self, message: &OutgoingMessage) -> DriverResult<SendReceipt> {
        self.guard
            .run("create", message_context(message), self.send_message(message))
            .await
    }

    async fn delete(&self, id: &str) -> DriverResult<()> {
        self.guard
            .run("delete", json!({ "id": id }), self.trash_message(id))
            .await
    }

    async fn mark_as_read(&self, ids: &[String]) -> DriverResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let remove = ["UNREAD".to_string()];
        self.guard
            .run(
                "mark_as_read",
                json!({ "ids": ids }),
                self.modify_threads(ids, &[], &remove),
            )
            .await
    }

    async fn mark_as_unread(&self, ids: &[String]) -> DriverResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let add = ["UNREAD".to_string()];
        self.guard
            .run(
                "mark_as_unread",
                json!({ "ids": ids }),
                self.modify_threads(ids, &add, &[]),
            )
            .await
    }

    async fn modify_labels(&self, ids: &[String], changes: &LabelChanges) -> DriverResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let (add, remove) = label_ids_for(changes);
        self.guard
            .run(
                "modify_labels",
                json!({ "ids": ids, "changes": changes }),
                self.modify_threads(ids, &add, &remove),
            )
            .await
    }

    fn normalize_ids(&self, ids: &[String]) -> DriverResult<Vec<String>> {
        self.guard
            .run_sync("normalize_ids", json!({ "ids": ids }), || {
                Ok(strip_thread_prefix(ids))
            })
    }

    async fn count(&self) -> DriverResult<Vec<FolderCount>> {
        self.guard.run("count", json!({}), self.unread_counts()).await
    }

    async fn get_user_info(&self) -> DriverResult<UserInfo> {
        self.guard
            .run("get_user_info", json!({}), self.user_info())
            .await
    }

    async fn get_tokens(&self, code: &str) -> DriverResult<OAuthTokens> {
        self.guard
            .run(
                "get_tokens",
                json!({ "code": code }),
                self.oauth.exchange_code(code),
            )
            .await
    }

    fn get_scope(&self) -> String {
        SCOPES.join(" ")
    }

    async fn get_user_labels(&self) -> DriverResult<Vec<Label>> {
        self.guard
            .run("get_user_labels", json!({}), self.labels())
            .await
    }

    async fn get_label(&self, id: &str) -> DriverResult<Label> {
        self.guard
            .run("get_label", json!({ "id": id }), self.label(id))
            .await
    }

    async fn create_label(&self, label: &LabelInput) -> DriverResult<Label> {
        self.guard
            .run("create_label", json!(label), self.insert_label(label))
            .await
    }

    async fn update_label(&self, id: &str, label: &LabelInput) -> DriverResult<Label> {
        self.guard
            .run(
                "update_label",
                json!({ "id": id, "label": label }),
                self.patch_label(id, label),
            )
            .await
    }

    async fn delete_label(&self, id: &str) -> DriverResult<()> {
        self.guard
            .run(
                "delete_label",
                json!({ "id": id }),
                self.api
                    .send_empty(Method::DELETE, &format!("/labels/{}", id), None),
            )
            .await
    }

    async fn list_drafts(&self, params: &DraftListParams) -> DriverResult<DraftPage> {
        self.guard
            .run("list_drafts", json!(params), self.drafts(params))
            .await
    }

    async fn get_draft(&self, id: &str) -> DriverResult<Draft> {
        self.guard
            .run("get_draft", json!({ "id": id }), self.draft(id))
            .await
    }

    async fn create_draft(&self, draft: &DraftInput) -> DriverResult<DraftReceipt> {
        let mut context = message_context(&draft.message);
        context["id"] = json!(draft.id);
        self.guard
            .run("create_draft", context, self.save_draft(draft))
            .await
    }

    async fn send_draft(&self, id: &str, message: &OutgoingMessage) -> DriverResult<SendReceipt> {
        let mut context = message_context(message);
        context["id"] = json!(id);
        self.guard
            .run("send_draft", context, self.send_existing_draft(id, message))
            .await
    }

    async fn get_attachment(
        &self,
        message_id: &str,
        attachment_id: &str,
    ) -> DriverResult<Vec<u8>> {
        self.guard
            .run(
                "get_attachment",
                json!({ "messageId": message_id, "attachmentId": attachment_id }),
                self.attachment_bytes(message_id, attachment_id),
            )
            .await
    }

    async fn revoke_refresh_token(&self, token: &str) -> DriverResult<bool> {
        self.guard
            .run(
                "revoke_refresh_token",
                json!({ "token": token }),
                self.oauth.revoke(token),
            )
            .await
    }

    async fn get_email_aliases(&self) -> DriverResult<Vec<EmailAlias>> {
        self.guard
            .run("get_email_aliases", json!({}), self.aliases())
            .await
    }
}
