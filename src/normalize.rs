//! Turns a raw request URL into the canonical form used for pattern matching
//! and cache key derivation.
//!
//! Canonicalization is intentionally shallow: percent-encoded bytes in the
//! path and query are never decoded, `+` is never turned into a space, and
//! unicode is passed through untouched. The only normalization performed is
//! host case-folding, fragment stripping, and query-parameter sorting.

use crate::error::{Error, Result};
use url::Url;

/// A normalized, absolute URL plus its parsed components, ready for pattern
/// matching and key derivation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedUrl {
    rendered: String,
    host: String,
    path: String,
}

impl NormalizedUrl {
    /// The full normalized URL string (scheme + host + path + sorted query).
    pub fn as_str(&self) -> &str {
        &self.rendered
    }

    /// The lower-cased host component.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The path component, byte-for-byte as received (no decoding).
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl std::fmt::Display for NormalizedUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.rendered)
    }
}

/// Normalize a raw request URL.
///
/// `raw` may be absolute (`https://example.com/a?b=1`) or path-only
/// (`/a?b=1`); in the latter case `host_header` and `scheme` supply the
/// missing authority. `host_header` is also used verbatim as the candidate
/// for pattern matching's host lookup.
pub fn normalize(
    raw: &str,
    host_header: &str,
    scheme: &str,
) -> Result<NormalizedUrl> {
    let absolute = if raw.starts_with("http://") || raw.starts_with("https://")
    {
        raw.to_string()
    } else {
        let host = host_header.trim_start_matches('/');
        format!("{scheme}://{host}{raw}")
    };

    let url = Url::parse(&absolute)
        .map_err(|e| Error::BadRequest(format!("unparseable URL: {e}")))?;

    let host = url
        .host_str()
        .ok_or_else(|| Error::BadRequest("URL has no host".to_string()))?
        .to_ascii_lowercase();

    let path = {
        let p = url.path();
        if p.is_empty() {
            "/".to_string()
        } else {
            p.to_string()
        }
    };

    let query = sorted_query(url.query());

    let scheme = url.scheme();
    let rendered = match &query {
        Some(q) => format!("{scheme}://{host}{path}?{q}"),
        None => format!("{scheme}://{host}{path}"),
    };

    Ok(NormalizedUrl { rendered, host, path })
}

/// Sort query parameters by name, stable within duplicate names, without
/// decoding any percent-encoded or `+`-encoded bytes.
///
/// `None` is returned for an absent or empty query string so that `?` alone
/// collapses to no query at all.
fn sorted_query(raw_query: Option<&str>) -> Option<String> {
    let raw = raw_query?;
    if raw.is_empty() {
        return None;
    }

    let mut pairs: Vec<&str> = raw.split('&').filter(|p| !p.is_empty()).collect();
    if pairs.is_empty() {
        return None;
    }

    // Stable sort by the parameter name (text before the first '='), leaving
    // relative order within a name unchanged.
    pairs.sort_by(|a, b| param_name(a).cmp(param_name(b)));

    Some(pairs.join("&"))
}

fn param_name(pair: &str) -> &str {
    match pair.find('=') {
        Some(idx) => &pair[..idx],
        None => pair,
    }
}
