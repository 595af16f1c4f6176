//! Download diversion.
//!
//! A response whose `Content-Disposition` header marks it as an attachment
//! never reaches the renderer: its body is written to the session's download
//! directory and the exchange is skipped from that point on.
//!
//! The attachment grammar is deliberately strict and must cover the whole
//! header value: `attachment`, optionally followed by a single
//! `filename=` parameter whose value may be wrapped in `"` or `'`. A header
//! with trailing parameters beyond the filename does not divert.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::base::NetError;

/// Parse a `Content-Disposition` value against the attachment grammar.
///
/// Returns `None` when the value is not an attachment. Returns
/// `Some(filename)` when it is; the filename is `None` when absent or
/// empty.
pub fn parse_attachment(value: &str) -> Option<Option<String>> {
    let rest = value.trim_start();
    let rest = strip_keyword(rest, "attachment")?;
    let rest = rest.trim_start();
    if rest.is_empty() {
        return Some(None);
    }

    let rest = rest.strip_prefix(';')?;
    let rest = rest.trim_start();
    let rest = strip_keyword(rest, "filename")?;
    let rest = rest.trim_start();
    let rest = rest.strip_prefix('=')?;
    let rest = rest.trim_start();

    let quote = rest.chars().next().filter(|c| *c == '"' || *c == '\'');
    let name = match quote {
        Some(q) => {
            // A quoted value may contain anything, semicolons included.
            // The closing quote is optional, but text after it falls
            // outside the grammar and defeats the match.
            let inner = &rest[1..];
            match inner.find(q) {
                Some(close) => {
                    if !inner[close + 1..].trim().is_empty() {
                        return None;
                    }
                    inner[..close].trim()
                }
                None => inner.trim(),
            }
        }
        None => {
            if rest.contains(';') {
                // Trailing parameters fall outside the grammar; the whole
                // value must be covered or the header does not divert.
                return None;
            }
            let name = rest.trim_end();
            let name = if name.ends_with('"') || name.ends_with('\'') {
                &name[..name.len() - 1]
            } else {
                name
            };
            name.trim()
        }
    };

    if name.is_empty() {
        Some(None)
    } else {
        Some(Some(name.to_string()))
    }
}

fn strip_keyword<'a>(input: &'a str, keyword: &str) -> Option<&'a str> {
    if input.len() >= keyword.len() && input[..keyword.len()].eq_ignore_ascii_case(keyword) {
        Some(&input[keyword.len()..])
    } else {
        None
    }
}

/// Whether a content type belongs to a media resource the renderer streams
/// directly.
pub fn is_media_type(content_type: Option<&str>) -> bool {
    match content_type {
        Some(ct) => {
            ct.starts_with("image/")
                || ct.starts_with("video/")
                || ct.starts_with("audio/")
                || ct.starts_with("model/")
        }
        None => false,
    }
}

/// Write a diverted body into `download_dir`. Path components in the
/// declared filename are discarded; a missing filename gets a
/// timestamp-derived name.
pub fn write_download(
    download_dir: &Path,
    filename: Option<&str>,
    body: &[u8],
) -> Result<PathBuf, NetError> {
    let name = match filename.map(sanitize_filename) {
        Some(name) if !name.is_empty() => name,
        _ => time::OffsetDateTime::now_utc().unix_timestamp_nanos().to_string(),
    };
    let path = download_dir.join(name);
    std::fs::write(&path, body).map_err(|err| {
        debug!(path = %path.display(), %err, "download write failed");
        NetError::DownloadWriteFailed
    })?;
    debug!(path = %path.display(), len = body.len(), "download diverted");
    Ok(path)
}

fn sanitize_filename(name: &str) -> String {
    name.rsplit(['/', '\\']).next().unwrap_or(name).to_string()
}
