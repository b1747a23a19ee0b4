//! src/spider/mod.rs
//!
//! This module coordinates the whole crawl:
//!   - Admit URLs: allow-list filter, fingerprint de-dup, per-host FIFO
//!   - Create one queue + gate + monitor per host, on demand
//!   - Bound parallelism with a global gate and per-host gates
//!   - Detect termination: the run ends exactly when the start latch has
//!     fired and no admitted URL is still queued or in flight
//!
//! The heavy I/O work is delegated to submodules:
//!   - monitor.rs : long-lived per-host scheduling loop
//!   - fetch.rs   : one GET (dial, send, frame, decode, handler)
//!   - report.rs  : periodic progress line

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;

use crate::agent::{RotatingAgent, UserAgentSource};
use crate::log::{LogSink, Logger, Stdout};
use crate::response::Response;
use crate::url::CrawlUrl;

mod fetch;
mod monitor;
mod report;

/// Default cap on fetches in flight across all hosts.
pub const MAX_WORKER: usize = 20;

/// Default cap on fetches in flight against any single host.
pub const WORKER_DOMAIN: usize = 5;

/// The extension point: receives every fully-read response.
///
/// The handler may admit more URLs through the [`Crawl`] handle it is
/// given; the run keeps going until that expanding frontier drains. An
/// error returned here is logged and swallowed; it never aborts the
/// crawl.
#[async_trait]
pub trait DocumentHandler: Send + Sync {
    async fn handle_document(&self, crawl: &Crawl, response: Response) -> Result<()>;
}

/// Default handler: drop every document on the floor.
struct IgnoreDocuments;

#[async_trait]
impl DocumentHandler for IgnoreDocuments {
    async fn handle_document(&self, _crawl: &Crawl, _response: Response) -> Result<()> {
        Ok(())
    }
}

/// The crawl engine. Construct with [`Spider::new`], chain the
/// configuration you need, then call [`Spider::start`].
///
/// ```no_run
/// use funnelweb::Spider;
///
/// # async fn run() {
/// let done = Spider::new()
///     .max_workers(10)
///     .workers_per_host(2)
///     .allowed_domains(["example.com"])
///     .start(["https://example.com/"])
///     .await;
/// # let _ = done;
/// # }
/// ```
pub struct Spider {
    max_workers: usize,
    workers_per_host: usize,
    allowed_domains: Vec<String>,
    fetch_deadline: Option<Duration>,
    handler: Arc<dyn DocumentHandler>,
    sink: Arc<dyn LogSink>,
    agent: Arc<dyn UserAgentSource>,
}

impl Spider {
    pub fn new() -> Self {
        Self {
            max_workers: MAX_WORKER,
            workers_per_host: WORKER_DOMAIN,
            allowed_domains: Vec::new(),
            fetch_deadline: None,
            handler: Arc::new(IgnoreDocuments),
            sink: Arc::new(Stdout),
            agent: Arc::new(RotatingAgent::new()),
        }
    }

    /// Cap on fetches in flight across all hosts.
    pub fn max_workers(mut self, limit: usize) -> Self {
        self.max_workers = limit;
        self
    }

    /// Cap on fetches in flight against any single host.
    pub fn workers_per_host(mut self, limit: usize) -> Self {
        self.workers_per_host = limit;
        self
    }

    /// Restrict admission to hosts containing one of these substrings
    /// (case-sensitive). An empty list allows any host.
    pub fn allowed_domains<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_domains = domains.into_iter().map(Into::into).collect();
        self
    }

    /// Optional whole-fetch deadline. Off by default; expiry counts as
    /// an ordinary fetch failure and releases the gates normally.
    pub fn fetch_timeout(mut self, limit: Duration) -> Self {
        self.fetch_deadline = Some(limit);
        self
    }

    /// Install a document handler (default: no-op).
    pub fn handler(mut self, handler: impl DocumentHandler + 'static) -> Self {
        self.handler = Arc::new(handler);
        self
    }

    /// Install a log sink (default: stdout).
    pub fn log_sink(mut self, sink: impl LogSink + 'static) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    /// Install a User-Agent supplier (default: rotating browser strings).
    pub fn user_agent(mut self, agent: impl UserAgentSource + 'static) -> Self {
        self.agent = Arc::new(agent);
        self
    }

    /// Crawl the transitive closure of `seeds` and block until it is
    /// exhausted. Returns `false` only when the engine itself failed to
    /// initialize; per-URL failures are logged and absorbed.
    ///
    /// Termination is two-signal: the run ends once at least one fetch
    /// has been spawned AND nothing is queued or in flight. If every
    /// seed is rejected at admission (allow-list, duplicates), the first
    /// signal never fires and this call never returns.
    pub async fn start<I, S>(&self, seeds: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        match self.run(seeds).await {
            Ok(()) => true,
            Err(e) => {
                Logger::new(self.sink.clone()).log(format_args!("crawl failed to start: {e:#}"));
                false
            }
        }
    }

    async fn run<I, S>(&self, seeds: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let crawl = Crawl::new(self)?;

        crawl.add_task(seeds);
        crawl.wait_started().await;
        crawl.wait_idle().await;
        crawl.finish();

        Ok(())
    }
}

impl Default for Spider {
    fn default() -> Self {
        Self::new()
    }
}

/// One host's scheduling state: the admission side of its FIFO queue
/// plus the pending count the reporter reads.
struct HostEntry {
    queue: UnboundedSender<String>,
    pending: Arc<AtomicUsize>,
}

struct CrawlInner {
    workers_per_host: usize,
    allowed_domains: Vec<String>,
    fetch_deadline: Option<Duration>,

    // URL fingerprints ever admitted. Grows monotonically for the whole
    // run; a fingerprint in here is never dispatched again.
    seen: Mutex<HashSet<[u8; 16]>>,

    // host -> queue + pending count. Entries are created on first
    // admission for that host and live until the run ends.
    hosts: Mutex<HashMap<String, HostEntry>>,

    global_gate: Arc<Semaphore>,

    // Admitted-but-not-finished URLs: incremented at admission,
    // decremented when a fetch task has fully finished (handler
    // returned, gates released). Zero + start latch = termination.
    outstanding: AtomicUsize,

    completed: AtomicU64,

    started: AtomicBool,
    start_signal: Notify,
    idle_signal: Notify,

    base_time: Instant,

    // Monitors + reporter, aborted when the run completes so all engine
    // state dies with `start`.
    tasks: Mutex<Vec<JoinHandle<()>>>,

    tls: TlsConnector,
    handler: Arc<dyn DocumentHandler>,
    logger: Logger,
    agent: Arc<dyn UserAgentSource>,
}

/// Handle to a running crawl. Cheap to clone; this is what monitors and
/// fetch tasks capture, and what the document handler receives for
/// admitting more URLs.
#[derive(Clone)]
pub struct Crawl {
    inner: Arc<CrawlInner>,
}

impl Crawl {
    fn new(spider: &Spider) -> Result<Self> {
        let crawl = Crawl {
            inner: Arc::new(CrawlInner {
                workers_per_host: spider.workers_per_host,
                allowed_domains: spider.allowed_domains.clone(),
                fetch_deadline: spider.fetch_deadline,
                seen: Mutex::new(HashSet::new()),
                hosts: Mutex::new(HashMap::new()),
                global_gate: Arc::new(Semaphore::new(spider.max_workers)),
                outstanding: AtomicUsize::new(0),
                completed: AtomicU64::new(0),
                started: AtomicBool::new(false),
                start_signal: Notify::new(),
                idle_signal: Notify::new(),
                base_time: Instant::now(),
                tasks: Mutex::new(Vec::new()),
                tls: fetch::tls_connector(),
                handler: spider.handler.clone(),
                logger: Logger::new(spider.sink.clone()),
                agent: spider.agent.clone(),
            }),
        };

        let reporter = tokio::spawn(report::run(crawl.clone()));
        crawl.push_task(reporter);

        Ok(crawl)
    }

    /// Admit URLs: allow-list filter, fingerprint de-dup, then the
    /// per-host queue (created on demand together with its monitor).
    /// Safe to call from inside a running document handler.
    pub fn add_task<I, S>(&self, urls: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for url in urls {
            let url = url.as_ref();

            if !self.domain_allowed(url) {
                continue;
            }

            let fingerprint = CrawlUrl::fingerprint(url);
            if !self.lock_seen().insert(fingerprint) {
                continue;
            }

            self.enqueue(url);
        }
    }

    /// Fetches completed so far (handler invoked).
    pub fn completed(&self) -> u64 {
        self.inner.completed.load(Ordering::Acquire)
    }

    /// URLs admitted and still sitting in a per-host queue.
    pub fn queued(&self) -> usize {
        self.lock_hosts()
            .values()
            .map(|entry| entry.pending.load(Ordering::Acquire))
            .sum()
    }

    fn domain_allowed(&self, url: &str) -> bool {
        if self.inner.allowed_domains.is_empty() {
            return true;
        }
        let target = CrawlUrl::parse(url);
        let host = target.host();
        self.inner
            .allowed_domains
            .iter()
            .any(|domain| host.contains(domain.as_str()))
    }

    fn enqueue(&self, url: &str) {
        let target = CrawlUrl::parse(url);
        let host = target.host().to_string();

        // Queue creation, gate creation and monitor spawn form one
        // critical section: a host can never end up with two monitors.
        let mut hosts = self.lock_hosts();
        let entry = hosts.entry(host).or_insert_with(|| {
            let (queue, feed) = mpsc::unbounded_channel();
            let gate = Arc::new(Semaphore::new(self.inner.workers_per_host));
            let pending = Arc::new(AtomicUsize::new(0));
            let task = tokio::spawn(monitor::run(self.clone(), feed, gate, pending.clone()));
            self.push_task(task);
            HostEntry { queue, pending }
        });

        entry.pending.fetch_add(1, Ordering::AcqRel);
        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);

        // The receiver lives in the monitor, which outlives the whole
        // run; a send can only fail after shutdown, where the URL is
        // moot anyway.
        let _ = entry.queue.send(url.to_string());
    }

    /// First fetch spawned anywhere in the system.
    pub(crate) fn latch_start(&self) {
        if !self.inner.started.swap(true, Ordering::AcqRel) {
            self.inner.start_signal.notify_waiters();
        }
    }

    /// One admitted URL fully finished (handler returned, gates
    /// released). The last one out signals the idle waiter.
    pub(crate) fn task_done(&self) {
        if self.inner.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.idle_signal.notify_waiters();
        }
    }

    pub(crate) fn mark_completed(&self) {
        self.inner.completed.fetch_add(1, Ordering::AcqRel);
    }

    async fn wait_started(&self) {
        loop {
            let notified = self.inner.start_signal.notified();
            if self.inner.started.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle_signal.notified();
            if self.inner.outstanding.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    fn finish(&self) {
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }

        let elapsed = self.inner.base_time.elapsed();
        self.logger().log(format_args!(
            "crawl finished: {} documents, average {:.2}/min, elapsed {:.3}s",
            self.completed(),
            self.rate_per_minute(),
            elapsed.as_secs_f64(),
        ));
    }

    pub(crate) fn rate_per_minute(&self) -> f64 {
        let elapsed = self.inner.base_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.completed() as f64 / elapsed * 60.0
        } else {
            0.0
        }
    }

    pub(crate) fn global_gate(&self) -> Arc<Semaphore> {
        self.inner.global_gate.clone()
    }

    pub(crate) fn logger(&self) -> &Logger {
        &self.inner.logger
    }

    pub(crate) fn handler(&self) -> Arc<dyn DocumentHandler> {
        self.inner.handler.clone()
    }

    pub(crate) fn agent(&self) -> &dyn UserAgentSource {
        self.inner.agent.as_ref()
    }

    pub(crate) fn tls(&self) -> &TlsConnector {
        &self.inner.tls
    }

    pub(crate) fn deadline(&self) -> Option<Duration> {
        self.inner.fetch_deadline
    }

    fn push_task(&self, task: JoinHandle<()>) {
        self.lock_tasks().push(task);
    }

    // Lock helpers. None of these guards is ever held across an await.

    fn lock_seen(&self) -> std::sync::MutexGuard<'_, HashSet<[u8; 16]>> {
        self.inner.seen.lock().expect("seen set poisoned")
    }

    fn lock_hosts(&self) -> std::sync::MutexGuard<'_, HashMap<String, HostEntry>> {
        self.inner.hosts.lock().expect("host map poisoned")
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.inner.tasks.lock().expect("task list poisoned")
    }
}
