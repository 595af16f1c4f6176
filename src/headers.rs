//! Request headers and the per-session rewrite pass.
//!
//! [`RequestHeaders`] is an ordered, case-insensitive multimap holding what
//! the caller asked to send. [`resolve_headers`] turns that plus the
//! session's [`HeaderRules`] into the final wire list. The rule table is
//! exhaustive: a header the table does not name is never sent, no matter
//! what the caller supplied.

use crate::session::{HeaderPolicy, HeaderRules};

/// Ordered request-header multimap. Lookups are case-insensitive; insertion
/// order is preserved for the wire.
#[derive(Debug, Clone, Default)]
pub struct RequestHeaders {
    entries: Vec<(String, String)>,
}

impl RequestHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace all values for `name` with a single value.
    pub fn set(&mut self, name: &str, value: &str) {
        self.remove(name);
        self.entries.push((name.to_string(), value.to_string()));
    }

    /// Append a value without disturbing existing ones.
    pub fn add(&mut self, name: &str, value: &str) {
        self.entries.push((name.to_string(), value.to_string()));
    }

    /// All values for `name`, in insertion order.
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Resolve the caller's headers against the session's rules into the list
/// actually sent.
///
/// Only headers the rule table enumerates for the active scheme can reach
/// the wire; anything else the caller supplied is discarded. Two special
/// cases: a caller `Cache-Control: no-cache` is stripped before the rules
/// run (a renderer default that does not match real-browser behavior), and
/// a `Dynamic` `User-Agent` entry substitutes the session's canonical user
/// agent for whatever the caller supplied.
pub fn resolve_headers(
    rules: &HeaderRules,
    https: bool,
    caller: &RequestHeaders,
    user_agent: &str,
) -> Vec<(String, String)> {
    let mut caller = caller.clone();
    if let Some(value) = caller.get("Cache-Control") {
        if value.eq_ignore_ascii_case("no-cache") {
            caller.remove("Cache-Control");
        }
    }

    let rules = rules.for_scheme(https);
    let mut wire: Vec<(String, String)> = Vec::new();
    for (name, policy) in rules {
        match policy {
            HeaderPolicy::Literal(value) => {
                wire.push((name.clone(), value.clone()));
            }
            HeaderPolicy::Drop => {}
            HeaderPolicy::Dynamic => {
                if name.eq_ignore_ascii_case("user-agent") {
                    if caller.get(name).is_some() {
                        wire.push((name.clone(), user_agent.to_string()));
                    }
                } else {
                    for value in caller.get_all(name) {
                        wire.push((name.clone(), value.to_string()));
                    }
                }
            }
        }
    }
    wire
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::HeaderPolicy;

    fn rules(http: Vec<(&str, HeaderPolicy)>) -> HeaderRules {
        HeaderRules {
            http: http.into_iter().map(|(n, p)| (n.to_string(), p)).collect(),
            https: Vec::new(),
        }
    }

    #[test]
    fn test_multimap_set_replaces_all_values() {
        let mut headers = RequestHeaders::new();
        headers.add("Accept", "text/html");
        headers.add("accept", "image/png");
        headers.set("ACCEPT", "*/*");
        assert_eq!(headers.get_all("Accept"), vec!["*/*"]);
    }

    #[test]
    fn test_multimap_case_insensitive_lookup() {
        let mut headers = RequestHeaders::new();
        headers.set("Content-Type", "text/plain");
        assert_eq!(headers.get("content-type"), Some("text/plain"));
    }

    fn pair(name: &str, value: &str) -> (String, String) {
        (name.to_string(), value.to_string())
    }

    #[test]
    fn test_literal_rule_overrides_caller() {
        let mut caller = RequestHeaders::new();
        caller.set("Accept", "caller-value");
        let rules = rules(vec![("Accept", HeaderPolicy::Literal("ruled-value".into()))]);
        let wire = resolve_headers(&rules, false, &caller, "UA");
        assert_eq!(wire, vec![pair("Accept", "ruled-value")]);
    }

    #[test]
    fn test_literal_rule_emits_without_caller_value() {
        let rules = rules(vec![("DNT", HeaderPolicy::Literal("1".into()))]);
        let wire = resolve_headers(&rules, false, &RequestHeaders::new(), "UA");
        assert_eq!(wire, vec![pair("DNT", "1")]);
    }

    #[test]
    fn test_drop_rule_suppresses_every_caller_value() {
        let mut caller = RequestHeaders::new();
        for i in 0..5 {
            caller.add("Referer", &format!("https://private.test/{i}"));
        }
        let rules = rules(vec![("Referer", HeaderPolicy::Drop)]);
        let wire = resolve_headers(&rules, false, &caller, "UA");
        assert!(wire.is_empty());
    }

    #[test]
    fn test_dynamic_rule_passes_caller_value_or_omits() {
        let rules = rules(vec![("Accept-Language", HeaderPolicy::Dynamic)]);

        let mut caller = RequestHeaders::new();
        caller.set("Accept-Language", "en-US");
        let wire = resolve_headers(&rules, false, &caller, "UA");
        assert_eq!(wire, vec![pair("Accept-Language", "en-US")]);

        let wire = resolve_headers(&rules, false, &RequestHeaders::new(), "UA");
        assert!(wire.is_empty());
    }

    #[test]
    fn test_dynamic_user_agent_substitutes_session_value() {
        let rules = rules(vec![("User-Agent", HeaderPolicy::Dynamic)]);

        let mut caller = RequestHeaders::new();
        caller.set("User-Agent", "CallerAgent/0.1");
        let wire = resolve_headers(&rules, false, &caller, "SessionAgent/2.0");
        assert_eq!(wire, vec![pair("User-Agent", "SessionAgent/2.0")]);

        // No caller value means no User-Agent at all.
        let wire = resolve_headers(&rules, false, &RequestHeaders::new(), "SessionAgent/2.0");
        assert!(wire.is_empty());
    }

    #[test]
    fn test_unruled_caller_headers_never_sent() {
        let mut caller = RequestHeaders::new();
        caller.set("X-Custom", "1");
        caller.set("Accept", "text/html");
        let rules = rules(vec![("Accept", HeaderPolicy::Dynamic)]);
        let wire = resolve_headers(&rules, false, &caller, "UA");
        assert_eq!(wire, vec![pair("Accept", "text/html")]);
    }

    #[test]
    fn test_no_cache_stripped() {
        let mut caller = RequestHeaders::new();
        caller.set("Cache-Control", "no-cache");
        let rules = rules(vec![("Cache-Control", HeaderPolicy::Dynamic)]);
        let wire = resolve_headers(&rules, false, &caller, "UA");
        assert!(wire.is_empty());
    }

    #[test]
    fn test_other_cache_control_values_survive() {
        let mut caller = RequestHeaders::new();
        caller.set("Cache-Control", "max-age=0");
        let rules = rules(vec![("Cache-Control", HeaderPolicy::Dynamic)]);
        let wire = resolve_headers(&rules, false, &caller, "UA");
        assert_eq!(wire, vec![pair("Cache-Control", "max-age=0")]);
    }

    #[test]
    fn test_rule_order_fixes_wire_order() {
        let mut caller = RequestHeaders::new();
        caller.set("Accept", "text/html");
        caller.set("Host", "example.com");
        let rules = rules(vec![
            ("Host", HeaderPolicy::Dynamic),
            ("Accept", HeaderPolicy::Dynamic),
        ]);
        let wire = resolve_headers(&rules, false, &caller, "UA");
        assert_eq!(wire, vec![pair("Host", "example.com"), pair("Accept", "text/html")]);
    }

    #[test]
    fn test_scheme_selects_rule_table() {
        let rules = HeaderRules {
            http: vec![("X-Proto".into(), HeaderPolicy::Literal("plain".into()))],
            https: vec![("X-Proto".into(), HeaderPolicy::Literal("secure".into()))],
        };
        let wire = resolve_headers(&rules, true, &RequestHeaders::new(), "UA");
        assert_eq!(wire, vec![pair("X-Proto", "secure")]);
    }
}
