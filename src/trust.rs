//! TLS trust bootstrap.
//!
//! The engine can replace the platform trust store with a PEM bundle named
//! by configuration, either a local file or an http(s) URL. A remote bundle
//! is fetched once with default trust and cached beside the engine's cache
//! directory; the cached copy is reused while younger than 48 hours.
//!
//! Certificates are deduplicated by subject: the first anchor seen for a
//! subject wins. Any failure along the way logs and yields no custom store,
//! leaving the platform defaults in effect. The bootstrap is never fatal.

use std::path::Path;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use boring::x509::X509;
use tracing::{debug, info, warn};
use url::Url;

use crate::base::NetError;
use crate::http;
use crate::socket::connectjob::ConnectJob;

const CACHE_FILE: &str = "pem_cached";
const CACHE_FRESHNESS: Duration = Duration::from_secs(48 * 60 * 60);
const PEM_BEGIN: &str = "-----BEGIN CERTIFICATE-----";
const PEM_END: &str = "-----END CERTIFICATE-----";

/// The engine's certificate anchors, applied to every TLS connector.
pub struct TrustAnchors {
    certs: Vec<X509>,
}

impl TrustAnchors {
    pub fn certs(&self) -> &[X509] {
        &self.certs
    }

    /// Resolve `source` into anchors. Returns `None` (platform trust) when
    /// the source cannot be read or parses to zero certificates.
    pub fn bootstrap(
        source: &str,
        cache_dir: &Path,
        handle: &tokio::runtime::Handle,
    ) -> Option<Self> {
        let text = if source.starts_with("http://") || source.starts_with("https://") {
            load_remote(source, cache_dir, handle)?
        } else {
            match std::fs::read_to_string(source) {
                Ok(text) => text,
                Err(err) => {
                    warn!(%source, %err, "trust bundle unreadable, keeping platform trust");
                    return None;
                }
            }
        };

        let certs = parse_bundle(&text);
        if certs.is_empty() {
            warn!(%source, "trust bundle contained no certificates, keeping platform trust");
            return None;
        }
        info!(anchors = certs.len(), "custom trust store active");
        Some(Self { certs })
    }
}

/// Scan a PEM bundle for certificate blocks. Malformed blocks are skipped;
/// later duplicates of an already-seen subject are dropped.
fn parse_bundle(text: &str) -> Vec<X509> {
    let mut certs = Vec::new();
    let mut seen_subjects = Vec::new();
    let mut rest = text;
    while let Some(begin) = rest.find(PEM_BEGIN) {
        let after_begin = &rest[begin + PEM_BEGIN.len()..];
        let Some(end) = after_begin.find(PEM_END) else {
            break;
        };
        let block: String = after_begin[..end]
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        rest = &after_begin[end + PEM_END.len()..];

        let Ok(der) = BASE64.decode(block) else {
            debug!("skipping undecodable certificate block");
            continue;
        };
        let Ok(cert) = X509::from_der(&der) else {
            debug!("skipping unparseable certificate");
            continue;
        };
        let subject = subject_key(&cert);
        if seen_subjects.contains(&subject) {
            continue;
        }
        seen_subjects.push(subject);
        certs.push(cert);
    }
    certs
}

/// Stable key for a certificate subject, built from its name entries.
fn subject_key(cert: &X509) -> Vec<u8> {
    let mut key = Vec::new();
    for entry in cert.subject_name().entries() {
        key.extend_from_slice(entry.object().nid().as_raw().to_be_bytes().as_slice());
        key.push(b'=');
        key.extend_from_slice(entry.data().as_slice());
        key.push(b';');
    }
    key
}

/// Fetch a remote bundle, going through the cached copy when fresh.
fn load_remote(source: &str, cache_dir: &Path, handle: &tokio::runtime::Handle) -> Option<String> {
    let cached = cache_dir.join(CACHE_FILE);
    if cache_is_fresh(&cached) {
        match std::fs::read_to_string(&cached) {
            Ok(text) => return Some(text),
            Err(err) => debug!(%err, "cached trust bundle unreadable, refetching"),
        }
    }

    let url = match Url::parse(source) {
        Ok(url) => url,
        Err(err) => {
            warn!(%source, %err, "trust bundle URL invalid");
            return None;
        }
    };
    match handle.block_on(fetch(&url)) {
        Ok(text) => {
            if let Err(err) = std::fs::write(&cached, &text) {
                debug!(path = %cached.display(), %err, "could not cache trust bundle");
            }
            Some(text)
        }
        Err(err) => {
            warn!(%source, %err, "trust bundle fetch failed, keeping platform trust");
            // A stale cached copy beats nothing.
            std::fs::read_to_string(&cached).ok()
        }
    }
}

fn cache_is_fresh(path: &Path) -> bool {
    std::fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|mtime| mtime.elapsed().ok())
        .map(|age| age < CACHE_FRESHNESS)
        .unwrap_or(false)
}

/// One-shot fetch with platform trust, outside the pool.
async fn fetch(url: &Url) -> Result<String, NetError> {
    let job = ConnectJob { url, proxy: None, trust: None, timeout: Some(Duration::from_secs(30)) };
    let socket = job.run().await?;
    let sender = http::stream::handshake(socket, &tokio::runtime::Handle::current()).await?;
    let mut stream = http::stream::HttpStream::new(sender);

    let mut path = url.path().to_string();
    if let Some(query) = url.query() {
        path.push('?');
        path.push_str(query);
    }
    let host = url.host_str().ok_or(NetError::InvalidUrl)?;
    let request = ::http::Request::builder()
        .method(::http::Method::GET)
        .uri(path)
        .header(::http::header::HOST, host)
        .body(http::body::OutboundBody::Empty)
        .map_err(|_| NetError::InvalidUrl)?;

    let response = stream.send(request).await?;
    if !response.status().is_success() {
        return Err(NetError::InvalidResponse);
    }
    let mut wire = http::response::WireResponse::adopt(response);
    let body = wire.collect_body().await?;
    String::from_utf8(body.to_vec()).map_err(|_| NetError::InvalidResponse)
}

#[cfg(test)]
mod tests {
    use super::*;
    use boring::asn1::Asn1Time;
    use boring::hash::MessageDigest;
    use boring::pkey::PKey;
    use boring::rsa::Rsa;
    use boring::x509::{X509Builder, X509NameBuilder};

    fn make_cert(common_name: &str) -> X509 {
        let rsa = Rsa::generate(2048).unwrap();
        let key = PKey::from_rsa(rsa).unwrap();

        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", common_name).unwrap();
        let name = name.build();

        let mut builder = X509Builder::new().unwrap();
        builder.set_version(2).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&key).unwrap();
        builder
            .set_not_before(&Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&Asn1Time::days_from_now(365).unwrap())
            .unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();
        builder.build()
    }

    fn to_pem(cert: &X509) -> String {
        String::from_utf8(cert.to_pem().unwrap()).unwrap()
    }

    #[test]
    fn test_parse_bundle_single_cert() {
        let cert = make_cert("anchor.test");
        let certs = parse_bundle(&to_pem(&cert));
        assert_eq!(certs.len(), 1);
    }

    #[test]
    fn test_parse_bundle_dedupes_by_subject() {
        let first = make_cert("dup.test");
        let second = make_cert("dup.test");
        let third = make_cert("other.test");
        let bundle = format!("{}{}{}", to_pem(&first), to_pem(&second), to_pem(&third));
        let certs = parse_bundle(&bundle);
        assert_eq!(certs.len(), 2);
        // First anchor for a subject wins.
        assert_eq!(
            certs[0].serial_number().to_bn().unwrap(),
            first.serial_number().to_bn().unwrap()
        );
    }

    #[test]
    fn test_parse_bundle_skips_garbage_between_blocks() {
        let cert = make_cert("padded.test");
        let bundle = format!("junk before\n{}\ntrailing junk", to_pem(&cert));
        assert_eq!(parse_bundle(&bundle).len(), 1);
    }

    #[test]
    fn test_parse_bundle_empty_input() {
        assert!(parse_bundle("no certificates here").is_empty());
        assert!(parse_bundle("").is_empty());
    }

    #[test]
    fn test_parse_bundle_skips_corrupt_block() {
        let cert = make_cert("good.test");
        let bundle = format!(
            "{}\nAAAA%%%not-base64\n{}\n{}",
            PEM_BEGIN, PEM_END, to_pem(&cert)
        );
        assert_eq!(parse_bundle(&bundle).len(), 1);
    }

    #[test]
    fn test_bootstrap_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.pem");
        std::fs::write(&path, to_pem(&make_cert("file.test"))).unwrap();

        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let anchors =
            TrustAnchors::bootstrap(path.to_str().unwrap(), dir.path(), runtime.handle());
        assert_eq!(anchors.unwrap().certs().len(), 1);
    }

    #[test]
    fn test_bootstrap_missing_file_keeps_platform_trust() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let anchors = TrustAnchors::bootstrap("/nonexistent.pem", dir.path(), runtime.handle());
        assert!(anchors.is_none());
    }

    #[test]
    fn test_fresh_cache_short_circuits_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let cached = dir.path().join(CACHE_FILE);
        std::fs::write(&cached, to_pem(&make_cert("cached.test"))).unwrap();

        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        // An unreachable URL must not matter while the cache is fresh.
        let anchors = TrustAnchors::bootstrap(
            "https://bundle.invalid/certs.pem",
            dir.path(),
            runtime.handle(),
        );
        assert_eq!(anchors.unwrap().certs().len(), 1);
    }
}
