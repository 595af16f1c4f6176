//! Session collaborators.
//!
//! Every connection is opened on behalf of a session, identified by an
//! explicit [`SessionId`]. The session carries the per-request policy the
//! embedder controls: the header rewrite rules, the user agent, the proxy,
//! the download directory, and the cookie seam. Cookie storage itself lives
//! outside this crate; only opaque header strings cross the
//! [`CookieSource`] boundary.

use std::path::PathBuf;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use dashmap::DashMap;
use zeroize::Zeroizing;

/// Opaque session identifier chosen by the embedder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

/// What to do with one request header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderPolicy {
    /// Send this exact value, regardless of what the caller set.
    Literal(String),
    /// Never send this header.
    Drop,
    /// Pass the caller's value through if one was set, otherwise omit.
    Dynamic,
}

/// Ordered header rewrite rules, one table per scheme. The table is
/// exhaustive: a header it does not name never reaches the wire, and rule
/// order is wire order.
#[derive(Debug, Clone, Default)]
pub struct HeaderRules {
    pub http: Vec<(String, HeaderPolicy)>,
    pub https: Vec<(String, HeaderPolicy)>,
}

impl HeaderRules {
    pub fn for_scheme(&self, https: bool) -> &[(String, HeaderPolicy)] {
        if https {
            &self.https
        } else {
            &self.http
        }
    }

    /// Pass-through table covering the headers a renderer ordinarily sends,
    /// in a browser-typical order. Both schemes share it.
    pub fn standard() -> Self {
        const NAMES: &[&str] = &[
            "Host",
            "Connection",
            "Cache-Control",
            "Pragma",
            "Origin",
            "User-Agent",
            "Content-Type",
            "Content-Length",
            "Accept",
            "Referer",
            "Accept-Encoding",
            "Accept-Language",
            "Cookie",
            "Range",
            "If-Modified-Since",
            "If-None-Match",
        ];
        let table: Vec<(String, HeaderPolicy)> = NAMES
            .iter()
            .map(|name| (name.to_string(), HeaderPolicy::Dynamic))
            .collect();
        Self { http: table.clone(), https: table }
    }
}

/// Upstream proxy for a session. All traffic tunnels through it with HTTP
/// CONNECT; the password is wiped from memory on drop.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<Zeroizing<String>>,
}

impl ProxyConfig {
    /// `Proxy-Authorization` value for the CONNECT request, if credentials
    /// are configured.
    pub fn auth_header(&self) -> Option<String> {
        let username = self.username.as_deref()?;
        let password = self.password.as_deref().map(|p| p.as_str()).unwrap_or("");
        let credentials = format!("{}:{}", username, password);
        Some(format!("Basic {}", BASE64.encode(credentials)))
    }
}

/// Per-session request policy.
#[derive(Clone)]
pub struct SessionSettings {
    pub header_rules: Arc<HeaderRules>,
    pub user_agent: String,
    pub proxy: Option<ProxyConfig>,
    pub download_dir: PathBuf,
    pub cookies: Arc<dyn CookieSource>,
}

/// Lookup from session id to settings. The embedder owns the store; the
/// engine only reads from it.
pub trait SessionStore: Send + Sync {
    fn settings(&self, id: SessionId) -> Option<SessionSettings>;
}

/// Cookie seam. Values are opaque header strings; this crate never parses
/// them.
pub trait CookieSource: Send + Sync {
    /// `Cookie` header value for a request to `url`, or `None` to send no
    /// cookie header.
    fn cookie_header(&self, url: &url::Url) -> Option<String>;

    /// Record one `Set-Cookie` response header value.
    fn store_cookie(&self, url: &url::Url, value: &str);
}

/// Marks URLs the embedder has abandoned (navigated away from) so that
/// in-flight connections for them can be skipped, and records where
/// redirects for a discarded URL would have led.
pub trait DiscardRegistry: Send + Sync {
    fn is_discarded(&self, url: &url::Url) -> bool;

    /// Called with the original URL and the redirect target when a skipped
    /// or completed exchange carried a `Location` header.
    fn record_redirect(&self, from: &url::Url, location: &str);
}

/// `SessionStore` over a concurrent map, for embedders without their own
/// registry.
#[derive(Default)]
pub struct StaticSessionStore {
    sessions: DashMap<SessionId, SessionSettings>,
}

impl StaticSessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: SessionId, settings: SessionSettings) {
        self.sessions.insert(id, settings);
    }

    pub fn remove(&self, id: SessionId) {
        self.sessions.remove(&id);
    }
}

impl SessionStore for StaticSessionStore {
    fn settings(&self, id: SessionId) -> Option<SessionSettings> {
        self.sessions.get(&id).map(|entry| entry.clone())
    }
}

/// Cookie source that stores nothing and sends nothing.
pub struct NullCookies;

impl CookieSource for NullCookies {
    fn cookie_header(&self, _url: &url::Url) -> Option<String> {
        None
    }

    fn store_cookie(&self, _url: &url::Url, _value: &str) {}
}

/// Discard registry that never discards.
pub struct NoDiscards;

impl DiscardRegistry for NoDiscards {
    fn is_discarded(&self, _url: &url::Url) -> bool {
        false
    }

    fn record_redirect(&self, _from: &url::Url, _location: &str) {}
}

impl SessionSettings {
    /// Settings with the standard pass-through rules, no proxy, and no
    /// cookies; downloads land in the system temp directory.
    pub fn plain(user_agent: impl Into<String>) -> Self {
        Self {
            header_rules: Arc::new(HeaderRules::standard()),
            user_agent: user_agent.into(),
            proxy: None,
            download_dir: std::env::temp_dir(),
            cookies: Arc::new(NullCookies),
        }
    }
}
