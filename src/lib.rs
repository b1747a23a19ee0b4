//! src/lib.rs
//!
//! funnelweb: an asynchronous HTTP/1.1 crawl engine.
//!
//! Seed URLs fan out through per-host FIFO queues into fetch tasks that
//! are bounded twice: a global gate caps fetches in flight across the
//! whole run, and a per-host gate caps fetches against any one server.
//! Every downloaded document is handed to a user-supplied
//! [`DocumentHandler`], which may admit more URLs; the run ends when
//! that expanding frontier is exhausted.
//!
//! The transport is deliberately low-level: raw HTTP/1.1 over
//! `tokio::net::TcpStream` (TLS via `tokio-rustls`, certificate and
//! hostname verification disabled), with chunked/Content-Length framing
//! and gzip/deflate content decoding done in-crate. Redirects, cookies,
//! robots.txt and connection reuse are all out of scope.

mod agent; // User-Agent supplier seam + rotating default
mod error; // per-fetch error taxonomy
mod log; // logging sink seam + timestamped default
mod response; // raw header block -> response object
mod spider; // engine: admission, gates, monitors, termination
mod url; // URL value object: defaults, fingerprint, join

pub use agent::{RotatingAgent, UserAgentSource};
pub use error::FetchError;
pub use log::{LogSink, Stdout};
pub use response::Response;
pub use spider::{Crawl, DocumentHandler, MAX_WORKER, Spider, WORKER_DOMAIN};
pub use url::CrawlUrl;
