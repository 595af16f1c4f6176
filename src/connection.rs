//! The connection surface.
//!
//! [`StreamConnection`] is the single-use, synchronous object the embedder
//! drives: configure it, `connect()`, read the response. Internally each
//! call hops onto the engine runtime with `block_on`; the caller never sees
//! the async machinery.
//!
//! Two failure regimes coexist here. Network and transport failures are
//! swallowed: `connect()` logs them and the connection reports status 0
//! with an empty body, because a renderer frame must render something even
//! when the network does not cooperate. Contract violations stay loud: an
//! unsupported method, a content length beyond 32-bit range, the
//! unimplemented `content()`.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use time::format_description::well_known::Rfc2822;
use time::OffsetDateTime;
use tracing::{debug, warn};
use url::Url;

use crate::base::NetError;
use crate::divert::{parse_attachment, write_download};
use crate::engine::InterceptEngine;
use crate::headers::{resolve_headers, RequestHeaders};
use crate::http::body::OutboundBody;
use crate::http::response::WireResponse;
use crate::http::stream::{handshake, HttpStream};
use crate::pipe::{BytePipe, PipeWriter};
use crate::session::{SessionId, SessionSettings};
use crate::socket::connectjob::ConnectJob;
use crate::socket::pool::{Permit, RouteKey};

const SUPPORTED_METHODS: [&str; 7] =
    ["OPTIONS", "GET", "HEAD", "POST", "PUT", "DELETE", "TRACE"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Idle,
    Connecting,
    Connected,
    Skipped,
}

/// One HTTP exchange. Created by [`InterceptEngine::open`]; configure, then
/// read. Every read accessor connects implicitly and is idempotent.
pub struct StreamConnection {
    engine: Arc<InterceptEngine>,
    url: Url,
    session: SessionId,

    method: String,
    request_headers: RequestHeaders,
    pipe: Arc<BytePipe>,
    connect_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    cache_enabled: bool,
    if_modified_since: Option<OffsetDateTime>,

    state: ConnState,
    response: Option<WireResponse>,
    route: Option<RouteKey>,
    stream: Option<HttpStream>,
    body: Option<Bytes>,
    from_cache: bool,
    consumed: bool,
    skip: bool,
}

impl std::fmt::Debug for StreamConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConnection")
            .field("url", &self.url)
            .field("session", &self.session)
            .field("method", &self.method)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl StreamConnection {
    pub(crate) fn new(
        engine: Arc<InterceptEngine>,
        url: Url,
        session: SessionId,
        settings: &SessionSettings,
    ) -> Self {
        let cache_enabled = engine.config.cache_by_default;
        // Seed the agent header the way an embedding renderer would; the
        // policy resolver substitutes the session's canonical value anyway.
        let mut request_headers = RequestHeaders::new();
        request_headers.set("User-Agent", &settings.user_agent);
        Self {
            engine,
            url,
            session,
            method: "GET".to_string(),
            request_headers,
            pipe: Arc::new(BytePipe::new()),
            connect_timeout: None,
            read_timeout: None,
            cache_enabled,
            if_modified_since: None,
            state: ConnState::Idle,
            response: None,
            route: None,
            stream: None,
            body: None,
            from_cache: false,
            consumed: false,
            skip: false,
        }
    }

    // --- pre-connect configuration ---------------------------------------

    /// Select the request method. Only the original seven verbs exist.
    pub fn set_method(&mut self, method: &str) -> Result<(), NetError> {
        let upper = method.to_ascii_uppercase();
        if !SUPPORTED_METHODS.contains(&upper.as_str()) {
            return Err(NetError::MethodNotSupported);
        }
        self.method = upper;
        Ok(())
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Replace all values of a request header.
    pub fn set_request_header(&mut self, name: &str, value: &str) {
        self.request_headers.set(name, value);
    }

    /// Append one request header value.
    pub fn add_request_header(&mut self, name: &str, value: &str) {
        self.request_headers.add(name, value);
    }

    pub fn request_header(&self, name: &str) -> Option<&str> {
        self.request_headers.get(name)
    }

    /// Zero disables the timeout.
    pub fn set_connect_timeout(&mut self, timeout: Duration) {
        self.connect_timeout = (!timeout.is_zero()).then_some(timeout);
    }

    /// Zero disables the timeout.
    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.read_timeout = (!timeout.is_zero()).then_some(timeout);
    }

    /// Opt this exchange in or out of the response cache.
    pub fn set_cache_enabled(&mut self, enabled: bool) {
        self.cache_enabled = enabled;
    }

    pub fn set_if_modified_since(&mut self, since: Option<OffsetDateTime>) {
        self.if_modified_since = since;
    }

    pub fn if_modified_since(&self) -> Option<OffsetDateTime> {
        self.if_modified_since
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn using_proxy(&self) -> bool {
        self.settings().map(|s| s.proxy.is_some()).unwrap_or(false)
    }

    /// Current settings for this connection's session, looked up fresh for
    /// every policy decision; never cached on the connection.
    fn settings(&self) -> Result<SessionSettings, NetError> {
        self.engine
            .sessions
            .settings(self.session)
            .ok_or(NetError::UnknownSession)
    }

    /// Writer for the request body. POST and PUT stream everything written
    /// here; a skipped exchange gets a sink that discards its input.
    pub fn request_writer(&mut self) -> RequestWriter {
        if self.skip || self.state == ConnState::Skipped {
            RequestWriter::Null
        } else {
            RequestWriter::Pipe(self.pipe.writer())
        }
    }

    // --- connect ----------------------------------------------------------

    /// Perform the exchange. Idempotent and never fails: a network failure
    /// leaves the connection reporting status 0 with no data.
    pub fn connect(&mut self) {
        if self.state != ConnState::Idle {
            return;
        }
        if self.engine.discards.is_discarded(&self.url) {
            debug!(url = %self.url, "exchange skipped, URL discarded");
            self.state = ConnState::Skipped;
            return;
        }
        if let Some(host) = self.url.host_str() {
            if self.engine.filter.is_blocked(host) {
                debug!(%host, "exchange skipped, host blocked");
                self.state = ConnState::Skipped;
                return;
            }
        }

        self.state = ConnState::Connecting;
        let engine = Arc::clone(&self.engine);
        if let Err(err) = engine.block_on(self.execute()) {
            warn!(url = %self.url, %err, "exchange failed");
            self.response = None;
        }
        self.state = ConnState::Connected;
    }

    async fn execute(&mut self) -> Result<(), NetError> {
        let settings = self.settings()?;
        let https = self.url.scheme() == "https";
        let cacheable = self.cache_enabled
            && (self.method == "GET" || self.method == "HEAD");

        if cacheable {
            if let Some(stored) = self.engine.cache.lookup(&self.url, &self.method) {
                self.response = Some(WireResponse::from_stored(stored.status, stored.headers));
                self.body = Some(stored.body);
                self.from_cache = true;
                return Ok(());
            }
        }
        let conditional = if cacheable {
            self.engine.cache.conditional_headers(&self.url, &self.method)
        } else {
            None
        };

        let mut wire = resolve_headers(
            &settings.header_rules,
            https,
            &self.request_headers,
            &settings.user_agent,
        );
        if !wire.iter().any(|(n, _)| n.eq_ignore_ascii_case("host")) {
            wire.insert(0, ("Host".to_string(), host_header(&self.url)?));
        }
        if let Some(since) = self.if_modified_since {
            if !wire.iter().any(|(n, _)| n.eq_ignore_ascii_case("if-modified-since")) {
                if let Ok(formatted) = since.format(&Rfc2822) {
                    wire.push(("If-Modified-Since".to_string(), formatted));
                }
            }
        }
        if let Some(cookie) = settings.cookies.cookie_header(&self.url) {
            if !cookie.is_empty() {
                wire.push(("Cookie".to_string(), cookie));
            }
        }
        if let Some(extra) = &conditional {
            wire.extend(extra.iter().cloned());
        }

        let key = RouteKey::from_url(&self.url)?;
        let sender = self.obtain_sender(&key, &settings).await?;
        let mut stream = HttpStream::new(sender);

        let body = if self.method == "POST" || self.method == "PUT" {
            OutboundBody::from_pipe(self.engine.handle(), Arc::clone(&self.pipe))
        } else {
            OutboundBody::Empty
        };
        let mut builder = http::Request::builder()
            .method(self.method.as_str())
            .uri(origin_form(&self.url));
        for (name, value) in &wire {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let request = match builder.body(body) {
            Ok(request) => request,
            Err(_) => {
                self.engine.pool.abandon(&key);
                return Err(NetError::InvalidHeader);
            }
        };

        let sent = stream.send(request);
        let response = match self.read_timeout {
            Some(limit) => match tokio::time::timeout(limit, sent).await {
                Ok(result) => result,
                Err(_) => {
                    self.engine.pool.abandon(&key);
                    return Err(NetError::ConnectionTimedOut);
                }
            },
            None => sent.await,
        };
        let response = match response {
            Ok(response) => response,
            Err(err) => {
                self.engine.pool.abandon(&key);
                return Err(err);
            }
        };
        let mut wire_response = WireResponse::adopt(response);

        for value in wire_response.header_values("Set-Cookie") {
            settings.cookies.store_cookie(&self.url, value);
        }
        if let Some(location) = wire_response.header("Location") {
            self.engine.discards.record_redirect(&self.url, location);
        }

        if wire_response.status() == 304 && conditional.is_some() {
            // Revalidated: refresh the stored entry and serve it.
            let _ = wire_response.collect_body().await;
            self.engine.pool.release(&key, stream.into_sender());
            if let Some(stored) =
                self.engine.cache.revalidated(&self.url, &self.method, wire_response.headers())
            {
                self.response = Some(WireResponse::from_stored(stored.status, stored.headers));
                self.body = Some(stored.body);
                self.from_cache = true;
            } else {
                self.response = Some(wire_response);
            }
            return Ok(());
        }

        self.response = Some(wire_response);
        self.route = Some(key);
        self.stream = Some(stream);
        Ok(())
    }

    /// Get a usable request handle: a pooled one that still answers, or a
    /// freshly dialed connection. A pooled handle whose connection died
    /// while idle is shed and the acquire retried; this never re-sends a
    /// request, it only re-establishes transport.
    async fn obtain_sender(
        &self,
        key: &RouteKey,
        settings: &SessionSettings,
    ) -> Result<crate::socket::pool::PooledSender, NetError> {
        loop {
            match self.engine.pool.acquire(key).await? {
                Permit::Reuse(mut sender) => {
                    if sender.ready().await.is_ok() {
                        return Ok(sender);
                    }
                    self.engine.pool.abandon(key);
                }
                Permit::Connect => {
                    let job = ConnectJob {
                        url: &self.url,
                        proxy: settings.proxy.as_ref(),
                        trust: self.engine.trust.as_ref(),
                        timeout: self.connect_timeout,
                    };
                    let socket = match job.run().await {
                        Ok(socket) => socket,
                        Err(err) => {
                            self.engine.pool.abandon(key);
                            return Err(err);
                        }
                    };
                    return match handshake(socket, self.engine.handle()).await {
                        Ok(sender) => Ok(sender),
                        Err(err) => {
                            self.engine.pool.abandon(key);
                            Err(err)
                        }
                    };
                }
            }
        }
    }

    // --- response surface -------------------------------------------------

    /// Response status: 204 for a skipped exchange, 0 when no response
    /// exists.
    pub fn status(&mut self) -> u16 {
        self.connect();
        if self.state == ConnState::Skipped {
            return 204;
        }
        self.response.as_ref().map(|r| r.status()).unwrap_or(0)
    }

    pub fn status_text(&mut self) -> Option<String> {
        self.connect();
        self.response.as_ref().map(|r| r.status_text().to_string())
    }

    /// Last value of a response header.
    pub fn header(&mut self, name: &str) -> Option<String> {
        self.connect();
        self.response.as_ref()?.header(name).map(str::to_string)
    }

    pub fn header_at(&mut self, n: usize) -> Option<String> {
        self.connect();
        self.response.as_ref()?.header_at(n).map(str::to_string)
    }

    pub fn header_name_at(&mut self, n: usize) -> Option<String> {
        self.connect();
        self.response.as_ref()?.header_name_at(n).map(str::to_string)
    }

    pub fn headers(&mut self) -> Vec<(String, String)> {
        self.connect();
        self.response
            .as_ref()
            .map(|r| r.headers().to_vec())
            .unwrap_or_default()
    }

    pub fn content_type(&mut self) -> Option<String> {
        self.header("Content-Type")
    }

    /// Whether the response is a directly streamable media resource.
    pub fn is_media(&mut self) -> bool {
        let content_type = self.content_type();
        crate::divert::is_media_type(content_type.as_deref())
    }

    /// `Content-Encoding`, suppressed once the exchange is skipped.
    pub fn content_encoding(&mut self) -> Option<String> {
        self.connect();
        if self.skip || self.state == ConnState::Skipped {
            return None;
        }
        self.header("Content-Encoding")
    }

    /// Declared content length as a 32-bit value. A declaration beyond
    /// `i32::MAX` is refused loudly rather than truncated.
    pub fn content_length(&mut self) -> Result<i32, NetError> {
        let wide = self.content_length_wide();
        if wide > i32::MAX as i64 {
            return Err(NetError::ContentLengthOverflow);
        }
        Ok(wide as i32)
    }

    /// Declared content length: 0 when skipped or without a response, -1
    /// when the header is missing or unparseable.
    pub fn content_length_wide(&mut self) -> i64 {
        self.connect();
        if self.skip || self.state == ConnState::Skipped {
            return 0;
        }
        match &self.response {
            None => 0,
            Some(response) => response
                .content_length_header()
                .and_then(|v| v.trim().parse::<i64>().ok())
                .unwrap_or(-1),
        }
    }

    /// The response entity. Consumed once: the first call drains it, later
    /// calls return nothing. Diverted and skipped exchanges yield nothing.
    pub fn body(&mut self) -> Result<Bytes, NetError> {
        self.connect();
        if self.consumed || self.skip || self.state == ConnState::Skipped {
            return Ok(Bytes::new());
        }
        self.consumed = true;
        if self.response.is_none() {
            return Ok(Bytes::new());
        }

        let data = match self.body.take() {
            Some(data) => data,
            None => {
                let engine = Arc::clone(&self.engine);
                let response = self.response.as_mut().unwrap();
                match engine.block_on(response.collect_body()) {
                    Ok(data) => data,
                    Err(err) => {
                        warn!(url = %self.url, %err, "body read failed");
                        self.abandon_lease();
                        return Ok(Bytes::new());
                    }
                }
            }
        };

        // Attachment diversion: the body goes to disk, not the renderer.
        let disposition = self
            .response
            .as_ref()
            .and_then(|r| r.header("Content-Disposition"))
            .map(str::to_string);
        if let Some(disposition) = disposition {
            if let Some(filename) = parse_attachment(&disposition) {
                self.skip = true;
                self.release_lease();
                let settings = self.settings()?;
                write_download(&settings.download_dir, filename.as_deref(), &data)?;
                return Ok(Bytes::new());
            }
        }

        if self.cache_enabled && !self.from_cache {
            let response = self.response.as_ref().unwrap();
            self.engine.cache.store(
                &self.url,
                &self.method,
                response.status(),
                response.headers(),
                data.clone(),
            );
        }
        self.release_lease();
        Ok(data)
    }

    /// The entity of an error response (status 400 and up); `None` for
    /// anything less.
    pub fn error_body(&mut self) -> Result<Option<Bytes>, NetError> {
        if self.status() >= 400 {
            self.body().map(Some)
        } else {
            Ok(None)
        }
    }

    /// Never supported; the embedder reads `body()` instead.
    pub fn content(&self) -> Result<Bytes, NetError> {
        Err(NetError::UnsupportedOperation)
    }

    /// Finish the exchange. A fully consumed connection returns its pooled
    /// handle; anything else discards it.
    pub fn close(&mut self) {
        if self.consumed {
            self.release_lease();
        } else {
            self.abandon_lease();
        }
    }

    fn release_lease(&mut self) {
        if let (Some(key), Some(stream)) = (self.route.take(), self.stream.take()) {
            if stream.is_open() {
                self.engine.pool.release(&key, stream.into_sender());
            } else {
                self.engine.pool.abandon(&key);
            }
        }
    }

    fn abandon_lease(&mut self) {
        if let Some(key) = self.route.take() {
            self.stream.take();
            self.engine.pool.abandon(&key);
        }
    }
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        // An unclosed lease would leak a pool slot.
        self.abandon_lease();
    }
}

/// Request-body writer handed to the embedder.
pub enum RequestWriter {
    Pipe(PipeWriter),
    Null,
}

impl RequestWriter {
    /// Mark the request body complete.
    pub fn finish(&self) {
        if let RequestWriter::Pipe(writer) = self {
            writer.finish();
        }
    }
}

impl Write for RequestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            RequestWriter::Pipe(writer) => writer.write(buf),
            RequestWriter::Null => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            RequestWriter::Pipe(writer) => writer.flush(),
            RequestWriter::Null => Ok(()),
        }
    }
}

/// `Host` header for a URL: the port appears only when explicit.
fn host_header(url: &Url) -> Result<String, NetError> {
    let host = url.host_str().ok_or(NetError::InvalidUrl)?;
    Ok(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

/// Origin-form request target: path plus query.
fn origin_form(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::EngineConfig;
    use crate::session::{NoDiscards, SessionSettings, StaticSessionStore};

    fn connection(url: &str) -> StreamConnection {
        let sessions = Arc::new(StaticSessionStore::new());
        let id = SessionId(7);
        sessions.insert(id, SessionSettings::plain("TestAgent/1.0"));
        let engine =
            InterceptEngine::new(EngineConfig::default(), sessions, Arc::new(NoDiscards)).unwrap();
        engine.open(url, id).unwrap()
    }

    #[test]
    fn test_set_method_accepts_original_verbs() {
        let mut conn = connection("http://example.com/");
        for method in ["OPTIONS", "GET", "HEAD", "POST", "PUT", "DELETE", "TRACE", "get"] {
            conn.set_method(method).unwrap();
        }
        assert_eq!(conn.method(), "GET");
    }

    #[test]
    fn test_set_method_rejects_others() {
        let mut conn = connection("http://example.com/");
        assert_eq!(conn.set_method("PATCH").unwrap_err(), NetError::MethodNotSupported);
        assert_eq!(conn.set_method("CONNECT").unwrap_err(), NetError::MethodNotSupported);
        // The method is unchanged after a rejection.
        assert_eq!(conn.method(), "GET");
    }

    #[test]
    fn test_content_is_always_unsupported() {
        let conn = connection("http://example.com/");
        assert_eq!(conn.content().unwrap_err(), NetError::UnsupportedOperation);
    }

    #[test]
    fn test_zero_timeout_disables() {
        let mut conn = connection("http://example.com/");
        conn.set_connect_timeout(Duration::ZERO);
        conn.set_read_timeout(Duration::ZERO);
        assert!(conn.connect_timeout.is_none());
        assert!(conn.read_timeout.is_none());
    }

    #[test]
    fn test_using_proxy_reflects_session() {
        let conn = connection("http://example.com/");
        assert!(!conn.using_proxy());
    }

    #[test]
    fn test_origin_form() {
        let url = Url::parse("http://example.com/a/b?x=1#frag").unwrap();
        assert_eq!(origin_form(&url), "/a/b?x=1");
        let url = Url::parse("http://example.com").unwrap();
        assert_eq!(origin_form(&url), "/");
    }

    #[test]
    fn test_host_header_port_only_when_explicit() {
        let url = Url::parse("http://example.com/").unwrap();
        assert_eq!(host_header(&url).unwrap(), "example.com");
        let url = Url::parse("http://example.com:8080/").unwrap();
        assert_eq!(host_header(&url).unwrap(), "example.com:8080");
    }

    #[test]
    fn test_request_header_round_trip() {
        let mut conn = connection("http://example.com/");
        conn.set_request_header("Accept", "text/html");
        conn.add_request_header("Accept-Language", "en");
        assert_eq!(conn.request_header("accept"), Some("text/html"));
        assert_eq!(conn.request_header("Accept-Language"), Some("en"));
    }
}
