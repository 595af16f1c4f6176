//! Received response.
//!
//! [`WireResponse`] adopts a hyper response and re-exposes it in the shape
//! the connection surface needs: a numeric status, an ordered header list
//! that keeps duplicates, and a body collected on demand. Lookups by name
//! return the last occurrence, matching the single-value accessor contract.

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use tracing::trace;

use crate::base::NetError;

pub struct WireResponse {
    status: u16,
    status_text: String,
    headers: Vec<(String, String)>,
    body: Option<Incoming>,
}

impl WireResponse {
    /// Adopt a response whose body has not been read yet.
    ///
    /// hyper does not surface the wire reason phrase, so the canonical
    /// reason for the status code stands in as the status text.
    pub fn adopt(response: http::Response<Incoming>) -> Self {
        let (parts, body) = response.into_parts();
        let headers = parts
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        Self {
            status: parts.status.as_u16(),
            status_text: parts
                .status
                .canonical_reason()
                .unwrap_or_default()
                .to_string(),
            headers,
            body: Some(body),
        }
    }

    /// A response rebuilt from the cache; the body is supplied separately.
    pub fn from_stored(status: u16, headers: Vec<(String, String)>) -> Self {
        let status_text = http::StatusCode::from_u16(status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or_default()
            .to_string();
        Self { status, status_text, headers, body: None }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn status_text(&self) -> &str {
        &self.status_text
    }

    /// Last value for `name`, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .rev()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Header value at position `n` in wire order.
    pub fn header_at(&self, n: usize) -> Option<&str> {
        self.headers.get(n).map(|(_, v)| v.as_str())
    }

    /// Header name at position `n` in wire order.
    pub fn header_name_at(&self, n: usize) -> Option<&str> {
        self.headers.get(n).map(|(n, _)| n.as_str())
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// All values for `name`, in wire order.
    pub fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Declared `Content-Length`, unparsed.
    pub fn content_length_header(&self) -> Option<&str> {
        self.header("Content-Length")
    }

    /// Read the entity to completion. Consumes the pending body; a second
    /// call, or a call on a cache-rebuilt response, yields nothing.
    pub async fn collect_body(&mut self) -> Result<Bytes, NetError> {
        let body = match self.body.take() {
            Some(body) => body,
            None => return Ok(Bytes::new()),
        };
        let collected = body.collect().await.map_err(|err| {
            trace!(%err, "body read failed");
            NetError::BodyReadFailed
        })?;
        Ok(collected.to_bytes())
    }

    /// Whether the entity is still unread (and the handle therefore not yet
    /// reusable).
    pub fn body_pending(&self) -> bool {
        self.body.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(status: u16, headers: &[(&str, &str)]) -> WireResponse {
        WireResponse::from_stored(
            status,
            headers.iter().map(|(n, v)| (n.to_string(), v.to_string())).collect(),
        )
    }

    #[test]
    fn test_last_value_wins() {
        let response = stored(200, &[("X-Tag", "first"), ("X-Tag", "second")]);
        assert_eq!(response.header("x-tag"), Some("second"));
        assert_eq!(response.header_values("X-Tag"), vec!["first", "second"]);
    }

    #[test]
    fn test_positional_access() {
        let response = stored(200, &[("A", "1"), ("B", "2")]);
        assert_eq!(response.header_name_at(0), Some("A"));
        assert_eq!(response.header_at(1), Some("2"));
        assert_eq!(response.header_at(2), None);
        assert_eq!(response.header_name_at(9), None);
    }

    #[test]
    fn test_status_text_from_code() {
        assert_eq!(stored(404, &[]).status_text(), "Not Found");
        assert_eq!(stored(599, &[]).status_text(), "");
    }

    #[tokio::test]
    async fn test_stored_response_has_no_pending_body() {
        let mut response = stored(200, &[]);
        assert!(!response.body_pending());
        assert!(response.collect_body().await.unwrap().is_empty());
    }
}
