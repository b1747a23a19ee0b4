//! src/url.rs
//!
//! Purpose:
//!   The URL value object the engine schedules on: defaulted accessors
//!   for scheme/host/port/path/query, the MD5 fingerprint used for
//!   de-duplication, and RFC 3986 reference resolution.
//!
//! Notes / assumptions:
//!   - `parse` never fails. The strict parsing is delegated to the `url`
//!     crate; anything it rejects degrades to best-effort defaults
//!     (empty host is legal and simply fails later at connect time).
//!   - The fingerprint hashes the raw string exactly as supplied. Two
//!     spellings of the same resource ("…/a" vs "…/a/", different query
//!     order) are deliberately distinct crawl targets.

use md5::{Digest, Md5};

/// A parsed crawl target.
///
/// Keeps the raw string around because the fingerprint and the join
/// base are defined over the bytes as supplied, not over any
/// normalized form.
#[derive(Debug, Clone)]
pub struct CrawlUrl {
    raw: String,
    parsed: Option<::url::Url>,
}

impl CrawlUrl {
    /// Parse a raw URL string. Never fails; malformed inputs yield
    /// best-effort fields.
    pub fn parse(raw: &str) -> Self {
        Self {
            raw: raw.to_string(),
            parsed: ::url::Url::parse(raw).ok(),
        }
    }

    /// The input string exactly as supplied.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// `"https"` when the URL says so, `"http"` for everything else
    /// (including inputs with no scheme at all).
    pub fn scheme(&self) -> &str {
        match &self.parsed {
            Some(u) if u.scheme() == "https" => "https",
            _ => "http",
        }
    }

    /// Lowercase host name, or `""` when the input has none.
    pub fn host(&self) -> &str {
        self.parsed
            .as_ref()
            .and_then(|u| u.host_str())
            .unwrap_or("")
    }

    /// Explicit port when one was written, otherwise 443 for https and
    /// 80 for everything else.
    pub fn port(&self) -> u16 {
        let fallback = if self.scheme() == "https" { 443 } else { 80 };
        match &self.parsed {
            Some(u) => u.port_or_known_default().unwrap_or(fallback),
            None => fallback,
        }
    }

    /// Request path, defaulting to `/`.
    pub fn path(&self) -> &str {
        match &self.parsed {
            Some(u) if !u.path().is_empty() => u.path(),
            _ => "/",
        }
    }

    /// Query string without the `?`, defaulting to `""`.
    pub fn query(&self) -> &str {
        self.parsed.as_ref().and_then(|u| u.query()).unwrap_or("")
    }

    /// MD5 of the UTF-8 bytes of `raw`, exactly as supplied.
    ///
    /// This is the de-dup key: two URLs are the same crawl target iff
    /// their fingerprints are equal. Stability across versions is a
    /// compatibility contract.
    pub fn fingerprint(raw: &str) -> [u8; 16] {
        let mut hasher = Md5::new();
        hasher.update(raw.as_bytes());
        hasher.finalize().into()
    }

    /// Hex rendering of [`CrawlUrl::fingerprint`], for logs and tests.
    pub fn fingerprint_hex(raw: &str) -> String {
        hex::encode(Self::fingerprint(raw))
    }

    /// Resolve `relative` against `base` per RFC 3986.
    ///
    /// Best-effort like `parse`: when the base is unusable the relative
    /// input comes back unchanged.
    pub fn join(base: &str, relative: &str) -> String {
        match ::url::Url::parse(base).and_then(|b| b.join(relative)) {
            Ok(u) => u.to_string(),
            Err(_) => relative.to_string(),
        }
    }
}
