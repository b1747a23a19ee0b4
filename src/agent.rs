//! src/agent.rs
//!
//! User-Agent supplier seam. The fetcher asks for a fresh value on every
//! request; rotation (or the lack of it) is entirely the supplier's
//! business.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Supplies the `User-Agent` header value for outgoing requests.
pub trait UserAgentSource: Send + Sync {
    fn user_agent(&self) -> String;
}

/// Mainstream browser strings the default supplier cycles through.
const AGENTS: [&str; 3] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) \
     Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) \
     Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
];

/// Default supplier: round-robins over [`AGENTS`].
pub struct RotatingAgent {
    cursor: AtomicUsize,
}

impl RotatingAgent {
    pub fn new() -> Self {
        Self {
            cursor: AtomicUsize::new(0),
        }
    }
}

impl Default for RotatingAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl UserAgentSource for RotatingAgent {
    fn user_agent(&self) -> String {
        let i = self.cursor.fetch_add(1, Ordering::Relaxed);
        AGENTS[i % AGENTS.len()].to_string()
    }
}
