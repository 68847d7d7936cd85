//! Wire logging for HTTP transports
//!
//! Enabled with `transport.debug`. Response bodies are buffered in full so
//! they can be logged and then handed back for normal parsing.

use bytes::Bytes;
use reqwest::{Method, Response};
use tracing::debug;
use url::Url;

use crate::Result;

/// Longest body excerpt written to the log
const BODY_LOG_LIMIT: usize = 2048;

/// Clip `text` to `limit` bytes on a char boundary
pub(crate) fn truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... ({} bytes total)", &text[..end], text.len())
}

pub(crate) fn log_request(method: &Method, url: &Url, body: Option<&[u8]>) {
    let body = body.map(|b| truncate(&String::from_utf8_lossy(b), BODY_LOG_LIMIT));
    debug!(%method, %url, body = body.as_deref().unwrap_or(""), "HTTP request");
}

/// Read the whole body, log it, and return it for parsing
pub(crate) async fn buffer(response: Response) -> Result<Bytes> {
    let status = response.status();
    let headers = response.headers().clone();
    let url = response.url().clone();
    let body = response.bytes().await?;
    debug!(
        %url,
        status = status.as_u16(),
        content_type = headers
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(""),
        body = %truncate(&String::from_utf8_lossy(&body), BODY_LOG_LIMIT),
        "HTTP response"
    );
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        let long = "é".repeat(10);
        let out = truncate(&long, 5);
        assert!(out.starts_with("éé"));
        assert!(out.ends_with("(20 bytes total)"));
    }
}
