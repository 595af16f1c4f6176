//! Engine configuration.
//!
//! All knobs live on an explicit [`EngineConfig`] owned by the constructed
//! engine; there is no ambient global state. `from_env()` reads the
//! `STREAMNET_*` environment variables for embedders that configure the
//! engine the property-file way.

use std::path::PathBuf;

/// Startup configuration for the interception engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum pooled connections per (scheme, host, port) route.
    pub max_route_connections: usize,

    /// Maximum pooled connections across all routes.
    pub max_total_connections: usize,

    /// Whether the ad-host filter is active.
    pub block_ads: bool,

    /// Optional override path for the blocklist; the bundled list is used
    /// when unset.
    pub blocklist_path: Option<PathBuf>,

    /// Certificate bundle location: a local path or an http(s) URL.
    /// Unset disables the trust bootstrap entirely.
    pub pem_source: Option<String>,

    /// Directory for the cached copy of a remotely fetched bundle.
    pub cache_dir: PathBuf,

    /// Default value of the per-connection cache flag.
    pub cache_by_default: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_route_connections: 16,
            max_total_connections: usize::MAX,
            block_ads: true,
            blocklist_path: None,
            pem_source: None,
            cache_dir: std::env::temp_dir(),
            cache_by_default: false,
        }
    }
}

impl EngineConfig {
    /// Build a configuration from `STREAMNET_*` environment variables,
    /// falling back to defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_route_connections: env_usize(
                "STREAMNET_MAX_ROUTE_CONNECTIONS",
                defaults.max_route_connections,
            ),
            max_total_connections: env_usize(
                "STREAMNET_MAX_TOTAL_CONNECTIONS",
                defaults.max_total_connections,
            ),
            // Matches the original semantics: anything but an explicit
            // "false" leaves blocking on.
            block_ads: std::env::var("STREAMNET_BLOCK_ADS")
                .map(|v| v != "false")
                .unwrap_or(defaults.block_ads),
            blocklist_path: std::env::var("STREAMNET_BLOCKLIST").ok().map(PathBuf::from),
            pem_source: std::env::var("STREAMNET_PEM_SOURCE").ok(),
            cache_dir: std::env::var("STREAMNET_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.cache_dir),
            cache_by_default: std::env::var("STREAMNET_CACHE_BY_DEFAULT")
                .map(|v| v == "true")
                .unwrap_or(defaults.cache_by_default),
        }
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
