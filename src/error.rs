//! src/error.rs
//!
//! Per-fetch error taxonomy.
//!
//! Every variant here is terminal for a single URL only: the fetcher
//! logs it through the sink, drops the connection, releases its gates
//! and moves on. Nothing in this enum ever aborts the crawl; the only
//! way `start` reports failure is an engine-init problem, which travels
//! separately as `anyhow::Error`.

use std::{error::Error, fmt, io};

/// What went wrong while fetching one URL.
///
/// The variants mirror the stages of a fetch: dial, send, read headers,
/// read body, decode, hand off to the user handler. A response that does
/// not look like HTTP at all is `Parse`.
#[derive(Debug)]
pub enum FetchError {
    /// DNS, TCP or TLS setup failed.
    Connect(io::Error),

    /// Writing the request to the socket failed.
    Write(io::Error),

    /// EOF or I/O failure before the header terminator was seen.
    ReadHeader(io::Error),

    /// Chunked or length-framed body read failed.
    Frame(io::Error),

    /// gzip/deflate inflation of the assembled body failed.
    Decode(io::Error),

    /// The user-supplied document handler returned an error.
    Handler(anyhow::Error),

    /// The header block was not recognizable as an HTTP response.
    Parse(String),

    /// The optional per-fetch deadline expired.
    Timeout,
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Connect(e) => write!(f, "connect error: {e}"),

            FetchError::Write(e) => write!(f, "send error: {e}"),

            FetchError::ReadHeader(e) => write!(f, "read header error: {e}"),

            FetchError::Frame(e) => write!(f, "read body error: {e}"),

            FetchError::Decode(e) => write!(f, "decode error: {e}"),

            FetchError::Handler(e) => write!(f, "handler error: {e:#}"),

            FetchError::Parse(msg) => write!(f, "malformed response: {msg}"),

            FetchError::Timeout => write!(f, "fetch timed out"),
        }
    }
}

impl Error for FetchError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            FetchError::Connect(e)
            | FetchError::Write(e)
            | FetchError::ReadHeader(e)
            | FetchError::Frame(e)
            | FetchError::Decode(e) => Some(e),

            FetchError::Handler(e) => Some(e.as_ref()),

            FetchError::Parse(_) | FetchError::Timeout => None,
        }
    }
}

/// Allow a handler's `anyhow::Error` to bubble into the taxonomy with `?`.
impl From<anyhow::Error> for FetchError {
    fn from(e: anyhow::Error) -> Self {
        FetchError::Handler(e)
    }
}
