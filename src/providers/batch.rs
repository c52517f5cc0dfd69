//! Google HTTP batch requests.
//!
//! Packs several API calls into one `multipart/mixed` POST and splits the
//! multipart reply back into per-call results. Each call is an
//! `application/http` part tagged `Content-ID: <item-N>`; Google answers with
//! `<response-item-N>` parts carrying a full HTTP response.

use chrono::Utc;
use reqwest::Method;
use serde_json::Value;

use super::{ProviderError, Result};

/// Most calls Google accepts in one batch request.
pub const BATCH_LIMIT: usize = 100;

/// One call inside a batch.
#[derive(Debug, Clone)]
pub struct BatchCall {
    pub method: Method,
    /// Absolute path including the API version, e.g. `/gmail/v1/users/me/...`.
    pub path: String,
    pub body: Option<Value>,
}

/// The reply to one [`BatchCall`].
#[derive(Debug, Clone, PartialEq)]
pub struct PartReply {
    /// Position of the call in the request.
    pub index: usize,
    pub status: u16,
    pub retry_after_secs: Option<u64>,
    pub body: String,
}

impl PartReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Returns a boundary for one batch request.
pub fn boundary() -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!("batch_mailbridge_{:x}", nanos)
}

/// Returns the request `Content-Type` for `boundary`.
pub fn content_type(boundary: &str) -> String {
    format!("multipart/mixed; boundary={}", boundary)
}

/// Encodes calls as a `multipart/mixed` body.
pub fn encode(boundary: &str, calls: &[BatchCall]) -> String {
    let mut body = String::new();
    for (index, call) in calls.iter().enumerate() {
        body.push_str(&format!("--{}\r\n", boundary));
        body.push_str("Content-Type: application/http\r\n");
        body.push_str(&format!("Content-ID: <item-{}>\r\n\r\n", index));
        body.push_str(&format!("{} {}\r\n", call.method, call.path));
        match &call.body {
            Some(json) => {
                body.push_str("Content-Type: application/json\r\n\r\n");
                body.push_str(&json.to_string());
                body.push_str("\r\n");
            }
            None => body.push_str("\r\n"),
        }
    }
    body.push_str(&format!("--{}--\r\n", boundary));
    body
}

/// Splits a `multipart/mixed` batch reply into per-call replies, ordered by
/// call index.
///
/// # Errors
///
/// Returns [`ProviderError::Internal`] if the reply has no boundary or a part
/// does not hold an HTTP response.
pub fn decode(content_type: &str, body: &str) -> Result<Vec<PartReply>> {
    let boundary = content_type
        .split(';')
        .filter_map(|param| param.trim().strip_prefix("boundary="))
        .map(|value| value.trim_matches('"'))
        .next()
        .ok_or_else(|| ProviderError::Internal("batch reply without boundary".to_string()))?;

    let normalized = body.replace("\r\n", "\n");
    let separator = format!("--{}", boundary);

    let mut replies = Vec::new();
    for (position, part) in normalized
        .split(separator.as_str())
        .skip(1)
        .map(|p| p.trim_start_matches('\n'))
        .filter(|p| !p.trim().is_empty() && !p.starts_with("--"))
        .enumerate()
    {
        replies.push(decode_part(position, part)?);
    }

    replies.sort_by_key(|r| r.index);
    Ok(replies)
}

fn decode_part(position: usize, part: &str) -> Result<PartReply> {
    let malformed = || ProviderError::Internal("malformed batch reply part".to_string());

    let (part_headers, http) = part.split_once("\n\n").ok_or_else(malformed)?;
    let index = header(part_headers, "content-id")
        .and_then(|id| {
            id.trim_matches(|c| c == '<' || c == '>')
                .strip_prefix("response-item-")
                .and_then(|n| n.parse().ok())
        })
        .unwrap_or(position);

    let http = http.trim_start();
    let (status_line, rest) = http.split_once('\n').unwrap_or((http, ""));
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(malformed)?;
    let (headers, body) = rest.split_once("\n\n").unwrap_or((rest, ""));

    Ok(PartReply {
        index,
        status,
        retry_after_secs: header(headers, "retry-after").and_then(|v| v.parse().ok()),
        body: body.trim().to_string(),
    })
}

/// Finds a header value in a block of `Name: value` lines.
fn header<'a>(block: &'a str, name: &str) -> Option<&'a str> {
    block.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim().eq_ignore_ascii_case(name).then(|| value.trim())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn encodes_calls_as_http_parts() {
        let calls = vec![
            BatchCall {
                method: Method::POST,
                path: "/gmail/v1/users/me/threads/t1/modify".to_string(),
                body: Some(json!({"removeLabelIds": ["UNREAD"]})),
            },
            BatchCall {
                method: Method::GET,
                path: "/gmail/v1/users/me/labels/INBOX".to_string(),
                body: None,
            },
        ];

        let body = encode("b1", &calls);

        assert_eq!(
            body,
            "--b1\r\n\
             Content-Type: application/http\r\n\
             Content-ID: <item-0>\r\n\r\n\
             POST /gmail/v1/users/me/threads/t1/modify\r\n\
             Content-Type: application/json\r\n\r\n\
             {\"removeLabelIds\":[\"UNREAD\"]}\r\n\
             --b1\r\n\
             Content-Type: application/http\r\n\
             Content-ID: <item-1>\r\n\r\n\
             GET /gmail/v1/users/me/labels/INBOX\r\n\r\n\
             --b1--\r\n"
        );
        assert_eq!(content_type("b1"), "multipart/mixed; boundary=b1");
    }

    #[test]
    fn decodes_replies_in_call_order() {
        let body = "--batch_x\r\n\
                    Content-Type: application/http\r\n\
                    Content-ID: <response-item-1>\r\n\r\n\
                    HTTP/1.1 404 Not Found\r\n\
                    Content-Type: application/json; charset=UTF-8\r\n\r\n\
                    {\"error\": {\"code\": 404, \"message\": \"Not Found\"}}\r\n\
                    --batch_x\r\n\
                    Content-Type: application/http\r\n\
                    Content-ID: <response-item-0>\r\n\r\n\
                    HTTP/1.1 200 OK\r\n\
                    Content-Type: application/json; charset=UTF-8\r\n\r\n\
                    {\"id\": \"t1\"}\r\n\
                    --batch_x\r\n\
                    Content-Type: application/http\r\n\
                    Content-ID: <response-item-2>\r\n\r\n\
                    HTTP/1.1 429 Too Many Requests\r\n\
                    Retry-After: 7\r\n\r\n\
                    --batch_x--\r\n";

        let replies = decode("multipart/mixed; boundary=\"batch_x\"", body).unwrap();

        assert_eq!(
            replies,
            vec![
                PartReply {
                    index: 0,
                    status: 200,
                    retry_after_secs: None,
                    body: "{\"id\": \"t1\"}".to_string(),
                },
                PartReply {
                    index: 1,
                    status: 404,
                    retry_after_secs: None,
                    body: "{\"error\": {\"code\": 404, \"message\": \"Not Found\"}}".to_string(),
                },
                PartReply {
                    index: 2,
                    status: 429,
                    retry_after_secs: Some(7),
                    body: String::new(),
                },
            ]
        );
        assert!(replies[0].is_success());
        assert!(!replies[1].is_success());
    }

    #[test]
    fn parts_without_content_id_use_position() {
        let body = "--b\nContent-Type: application/http\n\nHTTP/1.1 204 No Content\n\n--b--";
        let replies = decode("multipart/mixed; boundary=b", body).unwrap();

        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].index, 0);
        assert_eq!(replies[0].status, 204);
    }

    #[test]
    fn missing_boundary_is_internal_error() {
        assert!(matches!(
            decode("application/json", "{}"),
            Err(ProviderError::Internal(_))
        ));
    }

    #[test]
    fn part_without_status_line_is_malformed() {
        let body = "--b\nContent-Type: application/http\n\nnot http\n--b--";
        assert!(matches!(
            decode("multipart/mixed; boundary=b", body),
            Err(ProviderError::Internal(_))
        ));
    }
}
