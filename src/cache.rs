//! In-memory response cache.
//!
//! Opt-in per connection: only exchanges opened with the cache flag consult
//! or populate it. Freshness comes from `Cache-Control: max-age`; stale
//! entries carrying a validator are revalidated with a conditional request,
//! and a 304 refreshes the stored entry in place.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use tracing::trace;
use url::Url;

const DEFAULT_MAX_ENTRIES: usize = 1000;
const DEFAULT_MAX_BYTES: usize = 50 * 1024 * 1024;

/// Cache key: fragment-stripped URL plus method. Only GET and HEAD ever
/// reach the cache, but they cache separately.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct EntryKey {
    url: String,
    method: String,
}

impl EntryKey {
    fn new(url: &Url, method: &str) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            url: url.to_string(),
            method: method.to_ascii_uppercase(),
        }
    }
}

/// One stored exchange. Headers keep wire order and duplicates, matching
/// what the connection surface exposes.
#[derive(Debug, Clone)]
pub struct StoredResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    stored_at: Instant,
    ttl: Option<Duration>,
    etag: Option<String>,
    last_modified: Option<String>,
}

impl StoredResponse {
    pub fn is_fresh(&self) -> bool {
        match self.ttl {
            Some(ttl) => self.stored_at.elapsed() < ttl,
            None => false,
        }
    }

    fn has_validator(&self) -> bool {
        self.etag.is_some() || self.last_modified.is_some()
    }
}

/// Shared cache for the whole engine.
pub struct ResponseCache {
    entries: DashMap<EntryKey, StoredResponse>,
    max_entries: usize,
    max_bytes: usize,
    total_bytes: AtomicUsize,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_ENTRIES, DEFAULT_MAX_BYTES)
    }

    pub fn with_limits(max_entries: usize, max_bytes: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries,
            max_bytes,
            total_bytes: AtomicUsize::new(0),
        }
    }

    /// A fresh stored response for this exchange, if any.
    pub fn lookup(&self, url: &Url, method: &str) -> Option<StoredResponse> {
        if !is_cacheable_method(method) {
            return None;
        }
        let entry = self.entries.get(&EntryKey::new(url, method))?;
        if entry.is_fresh() {
            trace!(%url, "cache hit");
            Some(entry.clone())
        } else {
            None
        }
    }

    /// Conditional headers for revalidating a stale entry. `None` when there
    /// is no entry, the entry is still fresh, or it carries no validator.
    pub fn conditional_headers(&self, url: &Url, method: &str) -> Option<Vec<(String, String)>> {
        if !is_cacheable_method(method) {
            return None;
        }
        let entry = self.entries.get(&EntryKey::new(url, method))?;
        if entry.is_fresh() || !entry.has_validator() {
            return None;
        }
        let mut headers = Vec::new();
        if let Some(etag) = &entry.etag {
            headers.push(("If-None-Match".to_string(), etag.clone()));
        }
        if let Some(last_modified) = &entry.last_modified {
            headers.push(("If-Modified-Since".to_string(), last_modified.clone()));
        }
        Some(headers)
    }

    /// Store a completed exchange. Uncacheable responses (wrong method,
    /// non-2xx status, `no-store`, no freshness information) are ignored.
    pub fn store(&self, url: &Url, method: &str, status: u16, headers: &[(String, String)], body: Bytes) {
        if !is_cacheable_method(method) || !(200..300).contains(&status) {
            return;
        }
        let directives = Directives::parse(headers);
        if directives.no_store {
            return;
        }
        let ttl = directives.max_age.map(Duration::from_secs);
        let etag = last_header(headers, "ETag");
        let last_modified = last_header(headers, "Last-Modified");
        if ttl.is_none() && etag.is_none() && last_modified.is_none() {
            // Neither freshness nor a validator; nothing to gain.
            return;
        }

        self.make_room(body.len());
        let entry = StoredResponse {
            status,
            headers: headers.to_vec(),
            body,
            stored_at: Instant::now(),
            ttl,
            etag,
            last_modified,
        };
        let key = EntryKey::new(url, method);
        self.total_bytes.fetch_add(entry.body.len(), Ordering::Relaxed);
        if let Some(previous) = self.entries.insert(key, entry) {
            self.total_bytes.fetch_sub(previous.body.len(), Ordering::Relaxed);
        }
    }

    /// Fold a 304 into the stored entry: refresh its clock and any headers
    /// the revalidation response restates. The stored body is then served.
    pub fn revalidated(
        &self,
        url: &Url,
        method: &str,
        headers_304: &[(String, String)],
    ) -> Option<StoredResponse> {
        let mut entry = self.entries.get_mut(&EntryKey::new(url, method))?;
        for (name, value) in headers_304 {
            if ["Cache-Control", "ETag", "Expires", "Date"]
                .iter()
                .any(|h| name.eq_ignore_ascii_case(h))
            {
                replace_header(&mut entry.headers, name, value);
            }
        }
        let directives = Directives::parse(headers_304);
        if let Some(max_age) = directives.max_age {
            entry.ttl = Some(Duration::from_secs(max_age));
        }
        if let Some(etag) = last_header(headers_304, "ETag") {
            entry.etag = Some(etag);
        }
        entry.stored_at = Instant::now();
        Some(entry.clone())
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.total_bytes.store(0, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn make_room(&self, incoming: usize) {
        while self.entries.len() >= self.max_entries {
            if !self.evict_one() {
                break;
            }
        }
        while self.total_bytes.load(Ordering::Relaxed) + incoming > self.max_bytes {
            if !self.evict_one() {
                break;
            }
        }
    }

    // Arbitrary-victim eviction, as iteration order has no access-time
    // meaning here.
    fn evict_one(&self) -> bool {
        let key = match self.entries.iter().next() {
            Some(entry) => entry.key().clone(),
            None => return false,
        };
        if let Some((_, removed)) = self.entries.remove(&key) {
            self.total_bytes.fetch_sub(removed.body.len(), Ordering::Relaxed);
        }
        true
    }
}

fn is_cacheable_method(method: &str) -> bool {
    method.eq_ignore_ascii_case("GET") || method.eq_ignore_ascii_case("HEAD")
}

fn last_header(headers: &[(String, String)], name: &str) -> Option<String> {
    headers
        .iter()
        .rev()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.clone())
}

fn replace_header(headers: &mut Vec<(String, String)>, name: &str, value: &str) {
    match headers.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
        Some((_, v)) => *v = value.to_string(),
        None => headers.push((name.to_string(), value.to_string())),
    }
}

#[derive(Debug, Default)]
struct Directives {
    no_store: bool,
    max_age: Option<u64>,
}

impl Directives {
    fn parse(headers: &[(String, String)]) -> Self {
        let mut parsed = Self::default();
        let value = match last_header(headers, "Cache-Control") {
            Some(v) => v,
            None => return parsed,
        };
        for directive in value.split(',') {
            let directive = directive.trim().to_ascii_lowercase();
            if directive == "no-store" {
                parsed.no_store = true;
            } else if let Some(age) = directive.strip_prefix("max-age=") {
                if let Ok(age) = age.parse::<u64>() {
                    parsed.max_age = Some(age);
                }
            }
        }
        parsed
    }
}
