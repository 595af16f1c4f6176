//! Ad-host blocklist.
//!
//! A host is blocked when it, or any parent domain of it, appears in the
//! list. The check walks the host's label suffixes: `a.ads.example.com`
//! tests `a.ads.example.com`, `ads.example.com`, `example.com`, `com` in
//! turn and blocks on the first hit.

use std::collections::HashSet;
use std::path::Path;

use tracing::warn;

const BUNDLED_HOSTS: &str = include_str!("../data/ad-hosts.txt");

/// Suffix-matching host blocklist. Construction never fails: an unreadable
/// override file falls back to the bundled list, and a disabled filter is an
/// empty set.
pub struct HostFilter {
    hosts: HashSet<String>,
}

impl HostFilter {
    /// Filter backed by the list compiled into the binary.
    pub fn bundled() -> Self {
        Self::parse(BUNDLED_HOSTS)
    }

    /// Filter backed by an override file, one host per line. Falls back to
    /// the bundled list if the file cannot be read.
    pub fn from_file(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::parse(&text),
            Err(err) => {
                warn!(path = %path.display(), %err, "blocklist unreadable, using bundled list");
                Self::bundled()
            }
        }
    }

    /// Filter that blocks nothing.
    pub fn disabled() -> Self {
        Self { hosts: HashSet::new() }
    }

    fn parse(text: &str) -> Self {
        let hosts = text
            .lines()
            .map(|line| line.trim())
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(|line| line.to_ascii_lowercase())
            .collect();
        Self { hosts }
    }

    /// Whether `host` or any parent domain of it is on the list.
    pub fn is_blocked(&self, host: &str) -> bool {
        if self.hosts.is_empty() {
            return false;
        }
        let host = host.to_ascii_lowercase();
        let mut suffix = host.as_str();
        loop {
            if self.hosts.contains(suffix) {
                return true;
            }
            match suffix.find('.') {
                Some(dot) => suffix = &suffix[dot + 1..],
                None => return false,
            }
        }
    }

    #[cfg(test)]
    fn from_lines(lines: &[&str]) -> Self {
        Self::parse(&lines.join("\n"))
    }
}
