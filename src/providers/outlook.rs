//! Microsoft Graph driver implementation.
//!
//! Outlook has no conversation-level API comparable to Gmail threads, so this
//! driver works on messages: list results carry one [`Thread`] per message and
//! `get` returns a single-message [`ThreadDetail`].
//!
//! Labels map onto two Graph concepts. Mail folders hold a message exclusively
//! while categories are free-form tags. Label CRUD tries folders first and
//! falls back to master categories; `modify_labels` moves messages when asked
//! to add a canonical folder and edits categories otherwise.
//!
//! Bulk operations go through `/$batch`, at most [`BATCH_LIMIT`] requests per
//! round trip.

use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::prelude::*;
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use url::Url;

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

const SCOPES: &[&str] = &[
    "https://graph.microsoft.com/User.Read",
    "https://graph.microsoft.com/Mail.ReadWrite",
    "https://graph.microsoft.com/Mail.Send",
    "offline_access",
];

/// Maximum requests Graph accepts in one `$batch` call.
pub const BATCH_LIMIT: usize = 20;

/// Fields fetched for list projections.
const LIST_SELECT: &str = "id,conversationId,subject,bodyPreview,from,toRecipients,ccRecipients,\
bccRecipients,receivedDateTime,isRead,internetMessageId,categories";

/// Fields fetched for a full message.
const MESSAGE_SELECT: &str = "id,conversationId,subject,bodyPreview,body,from,toRecipients,\
ccRecipients,bccRecipients,replyTo,receivedDateTime,isRead,internetMessageId,categories,\
internetMessageHeaders";

/// Folders reported by `count`, as (canonical token, well-known name).
const COUNTED_FOLDERS: &[(&str, &str)] = &[
    ("inbox", "inbox"),
    ("sent", "sentitems"),
    ("drafts", "drafts"),
    ("trash", "deleteditems"),
    ("archive", "archive"),
    ("junk", "junkemail"),
];

/// Graph collection response.
#[derive(Debug, Deserialize)]
struct GraphList<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphMessage {
    id: Option<String>,
    conversation_id: Option<String>,
    subject: Option<String>,
    body_preview: Option<String>,
    body: Option<ItemBody>,
    from: Option<Recipient>,
    #[serde(default)]
    to_recipients: Vec<Recipient>,
    cc_recipients: Option<Vec<Recipient>>,
    #[serde(default)]
    bcc_recipients: Vec<Recipient>,
    #[serde(default)]
    reply_to: Vec<Recipient>,
    received_date_time: Option<DateTime<Utc>>,
    is_read: Option<bool>,
    internet_message_id: Option<String>,
    #[serde(default)]
    categories: Vec<String>,
    #[serde(default)]
    internet_message_headers: Vec<MessageHeader>,
    #[serde(default)]
    attachments: Vec<GraphAttachment>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ItemBody {
    content_type: Option<String>,
    content: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Recipient {
    email_address: Option<EmailAddress>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct EmailAddress {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    address: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct MessageHeader {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphAttachment {
    id: Option<String>,
    name: Option<String>,
    content_type: Option<String>,
    size: Option<u64>,
    content_bytes: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MailFolder {
    id: String,
    display_name: Option<String>,
    unread_item_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Category {
    id: Option<String>,
    display_name: String,
    color: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphUser {
    display_name: Option<String>,
    mail: Option<String>,
    user_principal_name: Option<String>,
}

/// Outbound Graph message for `sendMail` and drafts.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OutgoingGraphMessage {
    subject: String,
    body: ItemBody,
    to_recipients: Vec<Recipient>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    cc_recipients: Vec<Recipient>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    bcc_recipients: Vec<Recipient>,
    #[serde(skip_serializing_if = "Option::is_none")]
    from: Option<Recipient>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    internet_message_headers: Vec<MessageHeader>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    attachments: Vec<FileAttachment>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FileAttachment {
    #[serde(rename = "@odata.type")]
    odata_type: &'static str,
    name: String,
    content_type: String,
    content_bytes: String,
}

/// One request inside a `$batch` call.
#[derive(Debug, Serialize)]
struct BatchRequest {
    method: &'static str,
    url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    headers: Option<BTreeMap<&'static str, &'static str>>,
}

impl BatchRequest {
    fn get(url: String) -> Self {
        Self {
            method: "GET",
            url,
            body: None,
            headers: None,
        }
    }

    fn with_body(method: &'static str, url: String, body: Value) -> Self {
        Self {
            method,
            url,
            body: Some(body),
            headers: Some(BTreeMap::from([("Content-Type", "application/json")])),
        }
    }
}

#[derive(Debug, Serialize)]
struct BatchEntry<'a> {
    id: String,
    #[serde(flatten)]
    request: &'a BatchRequest,
}

#[derive(Debug, Deserialize)]
struct BatchReply {
    #[serde(default)]
    responses: Vec<BatchResponse>,
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
    id: String,
    status: u16,
    #[serde(default)]
    body: Value,
}

impl BatchResponse {
    fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Maps a canonical folder token to a Graph well-known folder name.
fn well_known_folder(token: &str) -> Option<&'static str> {
    match token.trim().to_ascii_lowercase().as_str() {
        "inbox" => Some("inbox"),
        "sent" => Some("sentitems"),
        "drafts" | "draft" => Some("drafts"),
        "trash" | "bin" => Some("deleteditems"),
        "archive" => Some("archive"),
        "junk" | "spam" => Some("junkemail"),
        _ => None,
    }
}

/// Returns the messages collection for a folder token or native folder id.
fn messages_path(folder: &str) -> String {
    let folder = folder.trim();
    if folder.is_empty() {
        return "/me/messages".to_string();
    }
    let id = well_known_folder(folder).unwrap_or(folder);
    format!("/me/mailFolders/{}/messages", id)
}

/// Builds an OData filter matching messages tagged with every category.
fn category_filter(categories: &[String]) -> Option<String> {
    let clauses: Vec<String> = categories
        .iter()
        .filter(|c| !c.trim().is_empty())
        .map(|c| format!("categories/any(c:c eq '{}')", c.replace('\'', "''")))
        .collect();
    (!clauses.is_empty()).then(|| clauses.join(" and "))
}

/// Query for the first page of a message listing.
fn page_query(
    search: Option<&str>,
    categories: &[String],
    max_results: Option<u32>,
) -> Vec<(&'static str, String)> {
    let mut query = vec![("$select", LIST_SELECT.to_string())];
    if let Some(max) = max_results {
        query.push(("$top", max.to_string()));
    }
    match search.map(str::trim).filter(|q| !q.is_empty()) {
        // Graph rejects $search combined with $orderby or $filter on messages.
        Some(q) => {
            if !categories.is_empty() {
                tracing::warn!("ignoring label filter on a search query");
            }
            query.push(("$search", format!("\"{}\"", q.replace('"', ""))));
        }
        None => {
            query.push(("$orderby", "receivedDateTime desc".to_string()));
            if let Some(filter) = category_filter(categories) {
                query.push(("$filter", filter));
            }
        }
    }
    query
}

fn sender_from(recipient: &Recipient) -> Option<Sender> {
    let address = recipient.email_address.as_ref()?;
    let email = address.address.clone().filter(|a| !a.is_empty())?;
    Some(Sender::new(
        address.name.clone().unwrap_or_default(),
        email,
    ))
}

fn senders_from(recipients: &[Recipient]) -> Vec<Sender> {
    recipients.iter().filter_map(sender_from).collect()
}

fn category_tag(name: &str) -> Label {
    Label::new(name, name, "category")
}

/// Decodes a Graph body into render-ready HTML.
fn render_body(body: &ItemBody) -> Option<String> {
    let content = body.content.as_deref()?;
    let is_html = body
        .content_type
        .as_deref()
        .is_some_and(|t| t.eq_ignore_ascii_case("html"));
    Some(if is_html {
        decode_entities(content)
    } else {
        text_to_html(content)
    })
}

impl GraphMessage {
    fn header(&self, name: &str) -> Option<String> {
        self.internet_message_headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.clone())
    }
}

/// Converts a Graph message to a canonical message.
fn parse_message(msg: &GraphMessage) -> ParsedMessage {
    let id = id_or_unknown(msg.id.as_deref());
    let reply_to = msg.header("Reply-To").or_else(|| {
        let addresses: Vec<String> = senders_from(&msg.reply_to)
            .into_iter()
            .map(|s| s.email)
            .collect();
        (!addresses.is_empty()).then(|| addresses.join(", "))
    });
    let tls = msg
        .internet_message_headers
        .iter()
        .filter(|h| h.name.eq_ignore_ascii_case("Received"))
        .any(|h| h.value.contains("ESMTPS") || h.value.contains("TLS"));

    ParsedMessage {
        thread_id: id_or_unknown(msg.conversation_id.as_deref().or(msg.id.as_deref())),
        title: decode_entities(msg.body_preview.as_deref().unwrap_or_default())
            .trim()
            .to_string(),
        subject: subject_or_default(msg.subject.as_deref().map(|s| decode_entities(s).trim().to_string())),
        sender: msg
            .from
            .as_ref()
            .and_then(sender_from)
            .unwrap_or_else(Sender::unknown),
        to: senders_from(&msg.to_recipients),
        cc: msg.cc_recipients.as_deref().map(senders_from),
        bcc: senders_from(&msg.bcc_recipients),
        received_on: msg.received_date_time.unwrap_or_else(Utc::now),
        unread: !msg.is_read.unwrap_or(true),
        message_id: msg
            .header("Message-ID")
            .or_else(|| msg.internet_message_id.clone())
            .unwrap_or_else(|| id.clone()),
        in_reply_to: msg.header("In-Reply-To"),
        references: msg.header("References"),
        reply_to,
        list_unsubscribe: msg.header("List-Unsubscribe"),
        list_unsubscribe_post: msg.header("List-Unsubscribe-Post"),
        tags: msg.categories.iter().map(|c| category_tag(c)).collect(),
        tls,
        decoded_body: msg.body.as_ref().and_then(render_body),
        attachments: Vec::new(),
        id,
    }
}

/// List projection of a single message.
fn thread_from(msg: &GraphMessage) -> Thread {
    let parsed = parse_message(msg);
    Thread {
        id: parsed.id,
        title: parsed.title,
        subject: parsed.subject,
        sender: parsed.sender,
        unread: parsed.unread,
        received_on: parsed.received_on,
        tags: parsed.tags,
        body: String::new(),
        total_replies: 0,
    }
}

fn recipient(address: &Address) -> Recipient {
    Recipient {
        email_address: Some(EmailAddress {
            name: address.name.clone().filter(|n| !n.is_empty()),
            address: Some(address.email.clone()),
        }),
    }
}

fn recipients(addresses: &[Address]) -> Vec<Recipient> {
    addresses.iter().map(recipient).collect()
}

fn file_attachments(message: &OutgoingMessage) -> Vec<FileAttachment> {
    message
        .attachments
        .iter()
        .map(|a| FileAttachment {
            odata_type: "#microsoft.graph.fileAttachment",
            name: a.filename.clone(),
            content_type: if a.mime_type.is_empty() {
                "application/octet-stream".to_string()
            } else {
                a.mime_type.clone()
            },
            content_bytes: BASE64_STANDARD.encode(&a.data),
        })
        .collect()
}

/// Builds the Graph message body. The HTML body is sanitized here.
///
/// Graph only accepts custom headers prefixed with `X-`; others are dropped.
fn outgoing_message(
    message: &OutgoingMessage,
    account_email: &str,
    with_attachments: bool,
) -> OutgoingGraphMessage {
    let mut headers = Vec::new();
    for (name, value) in &message.headers {
        let custom = name.len() > 2 && name.get(..2).is_some_and(|p| p.eq_ignore_ascii_case("x-"));
        if custom {
            headers.push(MessageHeader {
                name: name.clone(),
                value: value.clone(),
            });
        } else {
            tracing::warn!(header = %name, "dropping header Graph cannot send");
        }
    }

    let from = message
        .from_email
        .as_deref()
        .filter(|f| !f.is_empty() && !f.eq_ignore_ascii_case(account_email))
        .map(|f| recipient(&Address::new(f)));

    OutgoingGraphMessage {
        subject: message.subject.clone(),
        body: ItemBody {
            content_type: Some("html".to_string()),
            content: Some(sanitize(&message.message)),
        },
        to_recipients: recipients(&message.to),
        cc_recipients: recipients(&message.cc),
        bcc_recipients: recipients(&message.bcc),
        from,
        internet_message_headers: headers,
        attachments: if with_attachments {
            file_attachments(message)
        } else {
            Vec::new()
        },
    }
}

fn message_context(message: &OutgoingMessage) -> Value {
    json!({
        "to": message.to.iter().map(|a| a.email.as_str()).collect::<Vec<_>>(),
        "subject": message.subject,
        "attachments": message.attachments.len(),
    })
}

fn folder_label(folder: MailFolder) -> Label {
    let name = folder.display_name.unwrap_or_else(|| folder.id.clone());
    Label::new(folder.id, name, "folder")
}

fn category_label(category: Category) -> Label {
    Label {
        id: category
            .id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| category.display_name.clone()),
        name: category.display_name,
        label_type: "category".to_string(),
        color: category.color.map(|preset| LabelColor {
            background_color: preset,
            text_color: String::new(),
        }),
    }
}

/// Whether a folder request failed in a way that suggests a category id.
fn try_category(err: &ProviderError) -> bool {
    matches!(err.status(), Some(400) | Some(404))
}

/// Microsoft Graph driver.
pub struct OutlookDriver {
    api: ApiClient,
    oauth: OAuthClient,
    guard: ErrorGuard,
    email: String,
    userinfo_url: String,
}

impl OutlookDriver {
    pub fn new(ctx: DriverContext) -> Self {
        Self {
            api: ApiClient::new(ctx.settings.api_base.clone(), ctx.http, ctx.tokens),
            oauth: ctx.oauth,
            guard: ErrorGuard::new(ProviderId::Microsoft, ctx.connection.id, ctx.store),
            email: ctx.connection.email,
            userinfo_url: ctx.settings.userinfo_url,
        }
    }

    /// Checks that a page token is a Graph `@odata.nextLink` for this API.
    ///
    /// Page tokens are absolute URLs followed with the account's bearer token,
    /// so anything outside the configured API base is rejected.
    fn next_link(&self, token: &str) -> Result<String> {
        let invalid = || ProviderError::InvalidRequest("page token is not a Graph link".to_string());
        let base = Url::parse(self.api.base()).map_err(|_| invalid())?;
        let link = Url::parse(token).map_err(|_| invalid())?;

        let base_path = base.path().trim_end_matches('/');
        let same_origin = link.scheme() == base.scheme()
            && link.host_str() == base.host_str()
            && link.port_or_known_default() == base.port_or_known_default();
        let under_base = link.path() == base_path
            || link.path().starts_with(&format!("{}/", base_path));

        if same_origin && under_base {
            Ok(link.into())
        } else {
            Err(invalid())
        }
    }

    /// Fetches one page of messages, either fresh or from a next link.
    async fn message_page(
        &self,
        path: &str,
        search: Option<&str>,
        categories: &[String],
        max_results: Option<u32>,
        page_token: Option<&str>,
    ) -> Result<GraphList<GraphMessage>> {
        let mut page: GraphList<GraphMessage> = match page_token.filter(|t| !t.is_empty()) {
            Some(token) => {
                let link = self.next_link(token)?;
                self.api.get_json(&link, &[]).await?
            }
            None => {
                let query = page_query(search, categories, max_results);
                self.api.get_json(path, &query).await?
            }
        };
        cap_page(&mut page.value, max_results);
        Ok(page)
    }

    async fn list_messages(&self, params: &ListParams) -> Result<ThreadPage> {
        let page = self
            .message_page(
                &messages_path(&params.folder),
                params.query.as_deref(),
                &params.label_ids,
                params.max_results,
                params.page_token.as_deref(),
            )
            .await?;

        let threads: Vec<Thread> = page.value.iter().map(thread_from).collect();

        Ok(ThreadPage {
            threads,
            next_page_token: page.next_link,
        })
    }

    async fn get_message(&self, id: &str) -> Result<ThreadDetail> {
        let message: GraphMessage = self
            .api
            .get_json(
                &format!("/me/messages/{}", id),
                &[
                    ("$select", MESSAGE_SELECT.to_string()),
                    (
                        "$expand",
                        "attachments($select=id,name,contentType,size)".to_string(),
                    ),
                ],
            )
            .await?;

        let mut parsed = parse_message(&message);
        let attachments = try_join_all(
            message
                .attachments
                .iter()
                .map(|a| self.load_attachment(&parsed.id, a)),
        )
        .await?;
        parsed.attachments = attachments.into_iter().flatten().collect();

        Ok(ThreadDetail::from_messages(vec![parsed]))
    }

    /// Fetches attachment content. Missing content yields `None`.
    async fn load_attachment(
        &self,
        message_id: &str,
        meta: &GraphAttachment,
    ) -> Result<Option<Attachment>> {
        let (Some(attachment_id), Some(filename)) = (meta.id.as_deref(), meta.name.as_deref())
        else {
            return Ok(None);
        };

        let content = match self.fetch_attachment(message_id, attachment_id).await {
            Ok(full) => full.content_bytes,
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        let Some(body) = content.filter(|c| !c.is_empty()) else {
            tracing::debug!(message_id, attachment_id, "attachment content missing");
            return Ok(None);
        };

        Ok(Some(Attachment {
            attachment_id: attachment_id.to_string(),
            filename: filename.to_string(),
            mime_type: meta
                .content_type
                .clone()
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            size: meta.size.unwrap_or(0),
            body,
        }))
    }

    async fn fetch_attachment(
        &self,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<GraphAttachment> {
        self.api
            .get_json(
                &format!("/me/messages/{}/attachments/{}", message_id, attachment_id),
                &[],
            )
            .await
    }

    async fn send_mail(&self, message: &OutgoingMessage) -> Result<SendReceipt> {
        let body = json!({
            "message": outgoing_message(message, &self.email, true),
            "saveToSentItems": true,
        });
        self.api
            .send_empty(Method::POST, "/me/sendMail", Some(body))
            .await?;
        tracing::info!(recipients = message.to.len(), "message sent");

        // sendMail answers 202 without the stored message.
        Ok(SendReceipt::default())
    }

    async fn delete_message(&self, id: &str) -> Result<()> {
        match self
            .api
            .send_empty(Method::DELETE, &format!("/me/messages/{}", id), None)
            .await
        {
            Err(e) if e.is_not_found() => {
                tracing::debug!(message_id = %id, "message already deleted");
                Ok(())
            }
            other => other,
        }
    }

    /// Runs requests through `$batch`, chunked, returning responses in
    /// request order.
    async fn batch(&self, requests: &[BatchRequest]) -> Result<Vec<BatchResponse>> {
        let mut results = Vec::with_capacity(requests.len());

        for chunk in requests.chunks(BATCH_LIMIT) {
            let entries: Vec<BatchEntry<'_>> = chunk
                .iter()
                .enumerate()
                .map(|(i, request)| BatchEntry {
                    id: i.to_string(),
                    request,
                })
                .collect();

            let mut reply: BatchReply = self
                .api
                .send_json(Method::POST, "/$batch", &json!({ "requests": entries }))
                .await?;
            reply
                .responses
                .sort_by_key(|r| r.id.parse::<usize>().unwrap_or(usize::MAX));
            results.extend(reply.responses);
        }

        Ok(results)
    }

    /// Fails on the first unsuccessful batch response other than a 404.
    fn check_batch(responses: &[BatchResponse]) -> Result<()> {
        for response in responses {
            if response.is_success() || response.status == 404 {
                continue;
            }
            return Err(parse_error(
                response.status,
                None,
                &response.body.to_string(),
            ));
        }
        Ok(())
    }

    async fn set_read(&self, ids: &[String], is_read: bool) -> Result<()> {
        let requests: Vec<BatchRequest> = strip_thread_prefix(ids)
            .into_iter()
            .map(|id| {
                BatchRequest::with_body(
                    "PATCH",
                    format!("/me/messages/{}", id),
                    json!({ "isRead": is_read }),
                )
            })
            .collect();
        let responses = self.batch(&requests).await?;
        Self::check_batch(&responses)
    }

    /// Applies label changes.
    ///
    /// Category edits run before the move since Graph assigns moved messages
    /// a new id.
    async fn apply_labels(&self, ids: &[String], changes: &LabelChanges) -> Result<()> {
        let ids = strip_thread_prefix(ids);

        let destination = changes
            .add_labels
            .iter()
            .find_map(|l| well_known_folder(l));
        let add: Vec<&String> = changes
            .add_labels
            .iter()
            .filter(|l| well_known_folder(l).is_none())
            .collect();
        let mut remove: Vec<&String> = Vec::new();
        for label in &changes.remove_labels {
            if well_known_folder(label).is_some() {
                tracing::warn!(label = %label, "cannot remove a message from a folder, ignoring");
            } else {
                remove.push(label);
            }
        }

        if !add.is_empty() || !remove.is_empty() {
            self.update_categories(&ids, &add, &remove).await?;
        }

        if let Some(folder) = destination {
            tracing::warn!(folder, "adding a folder label moves the messages");
            let requests: Vec<BatchRequest> = ids
                .iter()
                .map(|id| {
                    BatchRequest::with_body(
                        "POST",
                        format!("/me/messages/{}/move", id),
                        json!({ "destinationId": folder }),
                    )
                })
                .collect();
            let responses = self.batch(&requests).await?;
            Self::check_batch(&responses)?;
        }

        Ok(())
    }

    async fn update_categories(
        &self,
        ids: &[String],
        add: &[&String],
        remove: &[&String],
    ) -> Result<()> {
        let reads: Vec<BatchRequest> = ids
            .iter()
            .map(|id| BatchRequest::get(format!("/me/messages/{}?$select=categories", id)))
            .collect();
        let current = self.batch(&reads).await?;
        Self::check_batch(&current)?;

        let mut writes = Vec::new();
        for (id, response) in ids.iter().zip(&current) {
            if !response.is_success() {
                continue;
            }
            let mut categories: Vec<String> = response.body["categories"]
                .as_array()
                .map(|values| {
                    values
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();

            categories.retain(|c| !remove.iter().any(|r| *r == c));
            for label in add {
                if !categories.iter().any(|c| c == *label) {
                    categories.push((*label).clone());
                }
            }

            writes.push(BatchRequest::with_body(
                "PATCH",
                format!("/me/messages/{}", id),
                json!({ "categories": categories }),
            ));
        }

        let responses = self.batch(&writes).await?;
        Self::check_batch(&responses)
    }

    async fn unread_counts(&self) -> Result<Vec<FolderCount>> {
        let counts = try_join_all(COUNTED_FOLDERS.iter().map(|(token, name)| async move {
            match self
                .api
                .get_json::<MailFolder>(
                    &format!("/me/mailFolders/{}", name),
                    &[("$select", "id,displayName,unreadItemCount".to_string())],
                )
                .await
            {
                Ok(folder) => Ok(Some(FolderCount {
                    label: token.to_string(),
                    count: folder.unread_item_count.unwrap_or(0),
                })),
                Err(e) if e.is_not_found() => Ok(None),
                Err(e) => Err(e),
            }
        }))
        .await?;
        Ok(counts.into_iter().flatten().collect())
    }

    async fn me(&self) -> Result<GraphUser> {
        self.api
            .get_json(
                &self.userinfo_url,
                &[("$select", "displayName,mail,userPrincipalName".to_string())],
            )
            .await
    }

    fn primary_address(&self, user: &GraphUser) -> String {
        user.mail
            .clone()
            .or_else(|| user.user_principal_name.clone())
            .filter(|a| !a.is_empty())
            .unwrap_or_else(|| self.email.clone())
    }

    async fn user_info(&self) -> Result<UserInfo> {
        let user = self.me().await?;
        Ok(UserInfo {
            address: self.primary_address(&user),
            name: user.display_name.unwrap_or_default(),
            photo: String::new(),
        })
    }

    async fn aliases(&self) -> Result<Vec<EmailAlias>> {
        let user = self.me().await?;
        Ok(vec![EmailAlias {
            email: self.primary_address(&user),
            name: user.display_name.filter(|n| !n.is_empty()),
            primary: true,
        }])
    }

    async fn labels(&self) -> Result<Vec<Label>> {
        let categories: GraphList<Category> =
            self.api.get_json("/me/outlook/masterCategories", &[]).await?;
        let folders: GraphList<MailFolder> = self
            .api
            .get_json("/me/mailFolders", &[("$top", "100".to_string())])
            .await?;

        Ok(categories
            .value
            .into_iter()
            .map(category_label)
            .chain(folders.value.into_iter().map(folder_label))
            .collect())
    }

    async fn label(&self, id: &str) -> Result<Label> {
        match self
            .api
            .get_json::<MailFolder>(&format!("/me/mailFolders/{}", id), &[])
            .await
        {
            Ok(folder) => Ok(folder_label(folder)),
            Err(e) if try_category(&e) => self.category(id).await,
            Err(e) => Err(e),
        }
    }

    async fn category(&self, id: &str) -> Result<Label> {
        let category: Category = self
            .api
            .get_json(&format!("/me/outlook/masterCategories/{}", id), &[])
            .await?;
        Ok(category_label(category))
    }

    async fn insert_label(&self, input: &LabelInput) -> Result<Label> {
        match self
            .api
            .send_json::<MailFolder, _>(
                Method::POST,
                "/me/mailFolders",
                &json!({ "displayName": input.name }),
            )
            .await
        {
            Ok(folder) => Ok(folder_label(folder)),
            Err(e) if try_category(&e) => {
                let mut body = json!({ "displayName": input.name });
                if let Some(color) = &input.color {
                    body["color"] = json!(color.background_color);
                }
                let category: Category = self
                    .api
                    .send_json(Method::POST, "/me/outlook/masterCategories", &body)
                    .await?;
                Ok(category_label(category))
            }
            Err(e) => Err(e),
        }
    }

    async fn patch_label(&self, id: &str, input: &LabelInput) -> Result<Label> {
        match self
            .api
            .send_json::<MailFolder, _>(
                Method::PATCH,
                &format!("/me/mailFolders/{}", id),
                &json!({ "displayName": input.name }),
            )
            .await
        {
            Ok(folder) => Ok(folder_label(folder)),
            Err(e) if try_category(&e) => match &input.color {
                // Category names are immutable; only the color can change.
                Some(color) => {
                    let category: Category = self
                        .api
                        .send_json(
                            Method::PATCH,
                            &format!("/me/outlook/masterCategories/{}", id),
                            &json!({ "color": color.background_color }),
                        )
                        .await?;
                    Ok(category_label(category))
                }
                None => self.category(id).await,
            },
            Err(e) => Err(e),
        }
    }

    async fn remove_label(&self, id: &str) -> Result<()> {
        match self
            .api
            .send_empty(Method::DELETE, &format!("/me/mailFolders/{}", id), None)
            .await
        {
            Err(e) if try_category(&e) => {
                self.api
                    .send_empty(
                        Method::DELETE,
                        &format!("/me/outlook/masterCategories/{}", id),
                        None,
                    )
                    .await
            }
            other => other,
        }
    }

    async fn drafts(&self, params: &DraftListParams) -> Result<DraftPage> {
        let page = self
            .message_page(
                "/me/mailFolders/drafts/messages",
                params.query.as_deref(),
                &[],
                params.max_results,
                params.page_token.as_deref(),
            )
            .await?;

        Ok(DraftPage {
            drafts: page.value.iter().map(parse_message).collect(),
            next_page_token: page.next_link,
        })
    }

    async fn draft(&self, id: &str) -> Result<Draft> {
        let message: GraphMessage = self
            .api
            .get_json(
                &format!("/me/messages/{}", id),
                &[(
                    "$select",
                    "id,subject,body,toRecipients,ccRecipients,bccRecipients".to_string(),
                )],
            )
            .await?;

        let emails = |recipients: &[Recipient]| -> Vec<String> {
            senders_from(recipients).into_iter().map(|s| s.email).collect()
        };

        Ok(Draft {
            id: id_or_unknown(message.id.as_deref().or(Some(id))),
            to: emails(&message.to_recipients),
            cc: emails(message.cc_recipients.as_deref().unwrap_or_default()),
            bcc: emails(&message.bcc_recipients),
            subject: subject_or_default(message.subject.clone()),
            content: message
                .body
                .as_ref()
                .and_then(render_body)
                .unwrap_or_default(),
        })
    }

    /// Rewrites an existing draft. Graph does not accept attachments on
    /// PATCH, so they are added one by one afterwards.
    async fn rewrite_draft(&self, id: &str, message: &OutgoingMessage) -> Result<GraphMessage> {
        let updated: GraphMessage = self
            .api
            .send_json(
                Method::PATCH,
                &format!("/me/messages/{}", id),
                &outgoing_message(message, &self.email, false),
            )
            .await?;

        for attachment in file_attachments(message) {
            self.api
                .send_empty(
                    Method::POST,
                    &format!("/me/messages/{}/attachments", id),
                    Some(json!(attachment)),
                )
                .await?;
        }

        Ok(updated)
    }

    async fn save_draft(&self, input: &DraftInput) -> Result<DraftReceipt> {
        let saved = match &input.id {
            Some(id) => self.rewrite_draft(id, &input.message).await?,
            None => {
                self.api
                    .send_json::<GraphMessage, _>(
                        Method::POST,
                        "/me/messages",
                        &outgoing_message(&input.message, &self.email, true),
                    )
                    .await?
            }
        };

        Ok(DraftReceipt {
            id: id_or_unknown(saved.id.as_deref().or(input.id.as_deref())),
        })
    }

    async fn send_existing_draft(&self, id: &str, message: &OutgoingMessage) -> Result<SendReceipt> {
        let updated = self.rewrite_draft(id, message).await?;
        self.api
            .send_empty(Method::POST, &format!("/me/messages/{}/send", id), None)
            .await?;
        tracing::info!(draft_id = %id, "draft sent");

        Ok(SendReceipt {
            id: None,
            thread_id: updated.conversation_id,
        })
    }

    async fn attachment_bytes(&self, message_id: &str, attachment_id: &str) -> Result<Vec<u8>> {
        let attachment = self.fetch_attachment(message_id, attachment_id).await?;
        attachment
            .content_bytes
            .as_deref()
            .filter(|c| !c.is_empty())
            .and_then(|c| BASE64_STANDARD.decode(c).ok())
            .ok_or_else(|| {
                ProviderError::NotFound(format!("attachment {} has no content", attachment_id))
            })
    }
}

#[async_trait]
impl MailDriver for OutlookDriver {
    fn provider(&self) -> ProviderId {
        ProviderId::Microsoft
    }

    async fn list(&self, params: &ListParams) -> DriverResult<ThreadPage> {
        self.guard
            .run("list", json!(params), self.list_messages(params))
            .await
    }

    async fn get(&self, id: &str) -> DriverResult<ThreadDetail> {
        self.guard
            .run("get", json!({ "id": id }), self.get_message(id))
            .await
    }

    async fn create(&self, message: &OutgoingMessage) -> DriverResult<SendReceipt> {
        self.guard
            .run("create", message_context(message), self.send_mail(message))
            .await
    }

    async fn delete(&self, id: &str) -> DriverResult<()> {
        self.guard
            .run("delete", json!({ "id": id }), self.delete_message(id))
            .await
    }

    async fn mark_as_read(&self, ids: &[String]) -> DriverResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.guard
            .run("mark_as_read", json!({ "ids": ids }), self.set_read(ids, true))
            .await
    }

    async fn mark_as_unread(&self, ids: &[String]) -> DriverResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.guard
            .run(
                "mark_as_unread",
                json!({ "ids": ids }),
                self.set_read(ids, false),
            )
            .await
    }

    async fn modify_labels(&self, ids: &[String], changes: &LabelChanges) -> DriverResult<()> {
        if ids.is_empty() || changes.is_empty() {
            return Ok(());
        }
        self.guard
            .run(
                "modify_labels",
                json!({ "ids": ids, "changes": changes }),
                self.apply_labels(ids, changes),
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
            .run("delete_label", json!({ "id": id }), self.remove_label(id))
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
