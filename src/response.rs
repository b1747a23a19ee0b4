//! src/response.rs
//!
//! Purpose:
//!   Turn a raw HTTP/1.1 header block (ASCII lines, CRLF separated,
//!   terminated by a blank line) into a usable response object, and give
//!   the body a text view once the fetcher has filled it in.
//!
//! Notes / assumptions:
//!   - Header names are stored verbatim as received and looked up
//!     case-sensitively. Duplicate names collapse to the last value.
//!   - Charset detection requires a terminator after the value
//!     (`charset=utf-8;` matches, a bare trailing `charset=utf-8` does
//!     not); the text view falls back to UTF-8 either way and replaces
//!     undecodable bytes silently.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::FetchError;
use crate::url::CrawlUrl;

static CHARSET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"charset=(.*?)[;\s]").expect("charset pattern is valid"));

/// One HTTP response: status line, header map, and a body that the
/// fetcher sets after framing and content decoding.
#[derive(Debug)]
pub struct Response {
    url: String,
    code: Option<u16>,
    info: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl Response {
    /// Parse a raw header block.
    ///
    /// The first line must start with `HTTP`; its whitespace-split
    /// tokens are `[version, code, reason...]`. Every following line is
    /// split at the first `:`, name verbatim, value trimmed.
    ///
    /// Errors:
    ///   - `FetchError::Parse` when the block does not look like an HTTP
    ///     response. The caller logs it and continues with
    ///     [`Response::unparsed`]; nothing is thrown past the fetcher.
    pub fn parse(url: impl Into<String>, header_block: &[u8]) -> Result<Self, FetchError> {
        let url = url.into();
        let text = String::from_utf8_lossy(header_block);

        if !text.starts_with("HTTP") {
            let first = text.lines().next().unwrap_or("");
            return Err(FetchError::Parse(format!(
                "status line does not start with HTTP: {first:?}"
            )));
        }

        let mut lines = text.split("\r\n");
        let status = lines.next().unwrap_or("");

        let mut tokens = status.split_ascii_whitespace();
        let _version = tokens.next();
        let code = match tokens.next().and_then(|t| t.parse::<u16>().ok()) {
            Some(code) => code,
            None => {
                return Err(FetchError::Parse(format!("bad status line: {status:?}")));
            }
        };
        let info = tokens.collect::<Vec<_>>().join(" ");

        let mut headers = HashMap::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            // Split at the first colon; a colon-less line becomes a
            // valueless entry, matching how lenient servers are read.
            let (name, value) = match line.split_once(':') {
                Some((name, value)) => (name, value.trim()),
                None => (line, ""),
            };
            headers.insert(name.to_string(), value.to_string());
        }

        Ok(Self {
            url,
            code: Some(code),
            info,
            headers,
            body: Vec::new(),
        })
    }

    /// A response whose header block could not be parsed: status unset,
    /// no headers, empty body. Still carries the source URL so the
    /// fetcher can finish its bookkeeping.
    pub fn unparsed(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            code: None,
            info: String::new(),
            headers: HashMap::new(),
            body: Vec::new(),
        }
    }

    /// Source URL this response was fetched from.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Numeric status code; `None` when the header block was unparsable.
    pub fn code(&self) -> Option<u16> {
        self.code
    }

    /// Reason phrase from the status line.
    pub fn info(&self) -> &str {
        &self.info
    }

    /// Raw (decoded) body bytes.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Case-sensitive header lookup, name exactly as the server sent it.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Replace the body. Called by the fetcher after framing and
    /// content decoding.
    pub fn set_body(&mut self, body: Vec<u8>) {
        self.body = body;
    }

    /// Charset advertised in `Content-Type`, when one is present and
    /// terminated (see module notes).
    pub fn encoding(&self) -> Option<String> {
        let content_type = self.get("Content-Type")?;
        CHARSET_RE
            .captures(content_type)
            .map(|caps| caps[1].to_string())
    }

    /// Body as text: decoded with the advertised charset when the label
    /// is known, UTF-8 otherwise; undecodable bytes are replaced.
    pub fn text(&self) -> String {
        let encoding = self
            .encoding()
            .and_then(|label| encoding_rs::Encoding::for_label(label.as_bytes()))
            .unwrap_or(encoding_rs::UTF_8);
        let (text, _, _) = encoding.decode(&self.body);
        text.into_owned()
    }

    /// Resolve a document-relative link against this response's URL.
    pub fn url_join(&self, relative: &str) -> String {
        CrawlUrl::join(&self.url, relative)
    }
}
