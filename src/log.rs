//! src/log.rs
//!
//! Logging sink seam. The engine never prints directly: every line goes
//! through a [`LogSink`], prefixed with a `[YYYY/MM/DD HH:MM:SS]` local
//! timestamp. The default sink writes to stdout.

use std::fmt;
use std::sync::Arc;

/// Where log lines go. Implementations receive one fully formatted line
/// per call, timestamp already applied.
pub trait LogSink: Send + Sync {
    fn emit(&self, line: &str);
}

/// Default sink: one line per call to stdout.
pub struct Stdout;

impl LogSink for Stdout {
    fn emit(&self, line: &str) {
        println!("{line}");
    }
}

/// Engine-side wrapper that owns the sink and applies the timestamp
/// prefix.
#[derive(Clone)]
pub(crate) struct Logger {
    sink: Arc<dyn LogSink>,
}

impl Logger {
    pub(crate) fn new(sink: Arc<dyn LogSink>) -> Self {
        Self { sink }
    }

    pub(crate) fn log(&self, msg: impl fmt::Display) {
        let now = chrono::Local::now().format("%Y/%m/%d %H:%M:%S");
        self.sink.emit(&format!("[{now}] {msg}"));
    }
}
