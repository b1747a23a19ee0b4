//! End-to-end crawls against in-process mock servers.
//!
//! Each test binds a real listener on 127.0.0.1, serves canned HTTP/1.1
//! bytes, and drives the engine through its public API. Connection
//! counters on the server side make the dedup and concurrency-cap
//! behavior observable from outside.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;

use funnelweb::{Crawl, DocumentHandler, LogSink, Response, Spider};

const RUN_LIMIT: Duration = Duration::from_secs(30);

/// Swallows engine output so test logs stay readable.
struct Quiet;

impl LogSink for Quiet {
    fn emit(&self, _line: &str) {}
}

#[derive(Default)]
struct ServerStats {
    connections: AtomicUsize,
    live: AtomicUsize,
    peak: AtomicUsize,
}

/// Serve `response` to every connection on `bind`, after an optional
/// delay that forces requests to overlap so the `peak` gauge means
/// something. `combined` is a second gauge shared between listeners, so
/// multi-host tests can watch the in-flight total across all of them.
async fn serve_on(
    bind: &str,
    stats: Arc<ServerStats>,
    combined: Arc<ServerStats>,
    response: Vec<u8>,
    delay: Duration,
) -> SocketAddr {
    let listener = TcpListener::bind(bind).await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let stats = stats.clone();
            let combined = combined.clone();
            let response = response.clone();

            tokio::spawn(async move {
                stats.connections.fetch_add(1, Ordering::SeqCst);
                let live = stats.live.fetch_add(1, Ordering::SeqCst) + 1;
                stats.peak.fetch_max(live, Ordering::SeqCst);
                let all = combined.live.fetch_add(1, Ordering::SeqCst) + 1;
                combined.peak.fetch_max(all, Ordering::SeqCst);

                // Read the request head; the engine always sends the
                // whole GET before it starts reading.
                let mut buf = [0u8; 4096];
                let mut request = Vec::new();
                loop {
                    let Ok(n) = socket.read(&mut buf).await else {
                        break;
                    };
                    if n == 0 {
                        break;
                    }
                    request.extend_from_slice(&buf[..n]);
                    if request.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }

                tokio::time::sleep(delay).await;
                let _ = socket.write_all(&response).await;
                let _ = socket.shutdown().await;

                stats.live.fetch_sub(1, Ordering::SeqCst);
                combined.live.fetch_sub(1, Ordering::SeqCst);
            });
        }
    });

    addr
}

/// Single-listener convenience wrapper around [`serve_on`].
async fn serve(stats: Arc<ServerStats>, response: Vec<u8>, delay: Duration) -> SocketAddr {
    let combined = Arc::new(ServerStats::default());
    serve_on("127.0.0.1:0", stats, combined, response, delay).await
}

fn ok_response(body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nContent-Type: text/html; charset=utf-8;\r\n\r\n{body}",
        body.len(),
    )
    .into_bytes()
}

#[derive(Default)]
struct Recorder {
    documents: Mutex<Vec<(Option<u16>, String, Vec<u8>)>>,
    completed_seen: AtomicU64,
}

impl Recorder {
    fn count(&self) -> usize {
        self.documents.lock().unwrap().len()
    }

    fn bodies(&self) -> Vec<Vec<u8>> {
        self.documents
            .lock()
            .unwrap()
            .iter()
            .map(|(_, _, body)| body.clone())
            .collect()
    }

    fn codes(&self) -> Vec<Option<u16>> {
        self.documents
            .lock()
            .unwrap()
            .iter()
            .map(|(code, _, _)| *code)
            .collect()
    }
}

/// Records every document it is handed.
struct Record(Arc<Recorder>);

#[async_trait]
impl DocumentHandler for Record {
    async fn handle_document(&self, crawl: &Crawl, response: Response) -> anyhow::Result<()> {
        self.0.documents.lock().unwrap().push((
            response.code(),
            response.url().to_string(),
            response.body().to_vec(),
        ));
        self.0
            .completed_seen
            .fetch_max(crawl.completed(), Ordering::SeqCst);
        Ok(())
    }
}

/// Records, and on the first document admits three same-host links.
struct FanOut {
    recorder: Arc<Recorder>,
    fanned: AtomicBool,
}

#[async_trait]
impl DocumentHandler for FanOut {
    async fn handle_document(&self, crawl: &Crawl, response: Response) -> anyhow::Result<()> {
        self.recorder.documents.lock().unwrap().push((
            response.code(),
            response.url().to_string(),
            response.body().to_vec(),
        ));
        self.recorder
            .completed_seen
            .fetch_max(crawl.completed(), Ordering::SeqCst);

        if !self.fanned.swap(true, Ordering::SeqCst) {
            crawl.add_task([
                response.url_join("a"),
                response.url_join("b"),
                response.url_join("c"),
            ]);
        }
        Ok(())
    }
}

#[tokio::test]
async fn single_seed_completes() {
    let stats = Arc::new(ServerStats::default());
    let addr = serve(stats.clone(), ok_response("hello"), Duration::ZERO).await;

    let recorder = Arc::new(Recorder::default());
    let spider = Spider::new()
        .handler(Record(recorder.clone()))
        .log_sink(Quiet);

    let done = timeout(RUN_LIMIT, spider.start([format!("http://{addr}/")]))
        .await
        .expect("crawl should terminate");

    assert!(done);
    assert_eq!(recorder.count(), 1);
    assert_eq!(recorder.bodies()[0], b"hello");
    assert_eq!(recorder.codes()[0], Some(200));
    assert_eq!(recorder.completed_seen.load(Ordering::SeqCst), 1);
    assert_eq!(stats.connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn default_handler_is_a_noop() {
    let stats = Arc::new(ServerStats::default());
    let addr = serve(stats.clone(), ok_response("x"), Duration::ZERO).await;

    let done = timeout(
        RUN_LIMIT,
        Spider::new().log_sink(Quiet).start([format!("http://{addr}/")]),
    )
    .await
    .expect("crawl should terminate");

    assert!(done);
    assert_eq!(stats.connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn handler_fanout_expands_the_frontier() {
    let stats = Arc::new(ServerStats::default());
    let addr = serve(stats.clone(), ok_response("x"), Duration::from_millis(30)).await;

    let recorder = Arc::new(Recorder::default());
    let spider = Spider::new()
        .workers_per_host(2)
        .handler(FanOut {
            recorder: recorder.clone(),
            fanned: AtomicBool::new(false),
        })
        .log_sink(Quiet);

    let done = timeout(RUN_LIMIT, spider.start([format!("http://{addr}/")]))
        .await
        .expect("crawl should terminate");

    assert!(done);
    assert_eq!(recorder.count(), 4);
    assert_eq!(recorder.completed_seen.load(Ordering::SeqCst), 4);
    assert_eq!(stats.connections.load(Ordering::SeqCst), 4);
    assert!(stats.peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn per_host_cap_bounds_parallelism() {
    let stats = Arc::new(ServerStats::default());
    let addr = serve(stats.clone(), ok_response("x"), Duration::from_millis(50)).await;

    let seeds: Vec<String> = (0..30).map(|i| format!("http://{addr}/p{i}")).collect();

    let recorder = Arc::new(Recorder::default());
    let spider = Spider::new()
        .max_workers(5)
        .workers_per_host(2)
        .handler(Record(recorder.clone()))
        .log_sink(Quiet);

    let done = timeout(RUN_LIMIT, spider.start(seeds))
        .await
        .expect("crawl should terminate");

    assert!(done);
    assert_eq!(recorder.count(), 30);
    assert!(stats.peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn global_cap_bounds_parallelism() {
    let stats = Arc::new(ServerStats::default());
    let addr = serve(stats.clone(), ok_response("x"), Duration::from_millis(50)).await;

    let seeds: Vec<String> = (0..20).map(|i| format!("http://{addr}/p{i}")).collect();

    let recorder = Arc::new(Recorder::default());
    let spider = Spider::new()
        .max_workers(3)
        .workers_per_host(10)
        .handler(Record(recorder.clone()))
        .log_sink(Quiet);

    let done = timeout(RUN_LIMIT, spider.start(seeds))
        .await
        .expect("crawl should terminate");

    assert!(done);
    assert_eq!(recorder.count(), 20);
    assert!(stats.peak.load(Ordering::SeqCst) <= 3);
}

#[tokio::test]
async fn caps_hold_per_host_and_globally_across_hosts() {
    // 127.0.0.2 is a distinct loopback address (the whole 127/8 block
    // terminates on this machine), so the engine sees two different
    // hosts with two different queues and gates.
    let combined = Arc::new(ServerStats::default());
    let stats_a = Arc::new(ServerStats::default());
    let stats_b = Arc::new(ServerStats::default());
    let addr_a = serve_on(
        "127.0.0.1:0",
        stats_a.clone(),
        combined.clone(),
        ok_response("x"),
        Duration::from_millis(50),
    )
    .await;
    let addr_b = serve_on(
        "127.0.0.2:0",
        stats_b.clone(),
        combined.clone(),
        ok_response("x"),
        Duration::from_millis(50),
    )
    .await;

    let mut seeds = Vec::new();
    for i in 0..12 {
        seeds.push(format!("http://{addr_a}/p{i}"));
        seeds.push(format!("http://{addr_b}/p{i}"));
    }

    // Per-host cap 2 on each of two hosts could field 4 fetches; the
    // global budget of 3 must bind first.
    let recorder = Arc::new(Recorder::default());
    let spider = Spider::new()
        .max_workers(3)
        .workers_per_host(2)
        .handler(Record(recorder.clone()))
        .log_sink(Quiet);

    let done = timeout(RUN_LIMIT, spider.start(seeds))
        .await
        .expect("crawl should terminate");

    assert!(done);
    assert_eq!(recorder.count(), 24);
    assert_eq!(stats_a.connections.load(Ordering::SeqCst), 12);
    assert_eq!(stats_b.connections.load(Ordering::SeqCst), 12);

    // Each host's own parallelism stays under its gate.
    assert!(stats_a.peak.load(Ordering::SeqCst) <= 2);
    assert!(stats_b.peak.load(Ordering::SeqCst) <= 2);

    // The global gate is one shared budget, not one per host.
    assert!(combined.peak.load(Ordering::SeqCst) <= 3);
}

#[tokio::test]
async fn connect_refused_does_not_abort_the_crawl() {
    let stats = Arc::new(ServerStats::default());
    let addr = serve(stats.clone(), ok_response("x"), Duration::ZERO).await;

    // Bind and immediately drop a listener: connections to that port
    // are refused.
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);

    let recorder = Arc::new(Recorder::default());
    let spider = Spider::new()
        .handler(Record(recorder.clone()))
        .log_sink(Quiet);

    let done = timeout(
        RUN_LIMIT,
        spider.start([
            format!("http://{dead_addr}/a"),
            format!("http://{addr}/1"),
            format!("http://{dead_addr}/b"),
            format!("http://{addr}/2"),
            format!("http://{addr}/3"),
        ]),
    )
    .await
    .expect("crawl should terminate");

    assert!(done);
    assert_eq!(recorder.count(), 3);
    assert_eq!(stats.connections.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn chunked_gzip_body_reaches_handler_decoded() {
    use std::io::Write;

    let payload = b"<html>hello compressed world</html>";
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(payload).unwrap();
    let compressed = encoder.finish().unwrap();

    // Split the gzip stream across two chunks.
    let mid = compressed.len() / 2;
    let mut response = Vec::new();
    response.extend_from_slice(
        b"HTTP/1.1 200 OK\r\n\
          Transfer-Encoding: chunked\r\n\
          Content-Encoding: gzip\r\n\
          Content-Type: text/html; charset=utf-8;\r\n\
          \r\n",
    );
    for chunk in [&compressed[..mid], &compressed[mid..]] {
        response.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
        response.extend_from_slice(chunk);
        response.extend_from_slice(b"\r\n");
    }
    response.extend_from_slice(b"0\r\n");

    let stats = Arc::new(ServerStats::default());
    let addr = serve(stats.clone(), response, Duration::ZERO).await;

    let recorder = Arc::new(Recorder::default());
    let spider = Spider::new()
        .handler(Record(recorder.clone()))
        .log_sink(Quiet);

    let done = timeout(RUN_LIMIT, spider.start([format!("http://{addr}/")]))
        .await
        .expect("crawl should terminate");

    assert!(done);
    assert_eq!(recorder.count(), 1);
    assert_eq!(recorder.bodies()[0], payload);
}

#[tokio::test]
async fn allow_list_drops_foreign_hosts_at_admission() {
    let stats = Arc::new(ServerStats::default());
    let addr = serve(stats.clone(), ok_response("x"), Duration::ZERO).await;

    let recorder = Arc::new(Recorder::default());
    let spider = Spider::new()
        .allowed_domains(["127.0.0.1"])
        .handler(Record(recorder.clone()))
        .log_sink(Quiet);

    let done = timeout(
        RUN_LIMIT,
        spider.start([
            format!("http://{addr}/"),
            "http://evil.test/steal".to_string(),
        ]),
    )
    .await
    .expect("crawl should terminate");

    assert!(done);
    assert_eq!(recorder.count(), 1);
    assert_eq!(stats.connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn duplicate_urls_are_fetched_once() {
    let stats = Arc::new(ServerStats::default());
    let addr = serve(stats.clone(), ok_response("x"), Duration::ZERO).await;

    let recorder = Arc::new(Recorder::default());
    let spider = Spider::new()
        .handler(Record(recorder.clone()))
        .log_sink(Quiet);

    let done = timeout(
        RUN_LIMIT,
        spider.start([
            format!("http://{addr}/same"),
            format!("http://{addr}/same"),
            format!("http://{addr}/other"),
            format!("http://{addr}/same"),
        ]),
    )
    .await
    .expect("crawl should terminate");

    assert!(done);
    assert_eq!(recorder.count(), 2);
    assert_eq!(stats.connections.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn empty_body_skips_the_handler() {
    let stats = Arc::new(ServerStats::default());
    let addr = serve(
        stats.clone(),
        b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_vec(),
        Duration::ZERO,
    )
    .await;

    let recorder = Arc::new(Recorder::default());
    let spider = Spider::new()
        .handler(Record(recorder.clone()))
        .log_sink(Quiet);

    let done = timeout(RUN_LIMIT, spider.start([format!("http://{addr}/")]))
        .await
        .expect("crawl should terminate");

    assert!(done);
    assert_eq!(recorder.count(), 0);
    assert_eq!(stats.connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn error_statuses_are_delivered_normally() {
    let stats = Arc::new(ServerStats::default());
    let body = "not here";
    let response = format!(
        "HTTP/1.1 404 Not Found\r\nContent-Length: {}\r\n\r\n{body}",
        body.len(),
    )
    .into_bytes();
    let addr = serve(stats.clone(), response, Duration::ZERO).await;

    let recorder = Arc::new(Recorder::default());
    let spider = Spider::new()
        .handler(Record(recorder.clone()))
        .log_sink(Quiet);

    let done = timeout(RUN_LIMIT, spider.start([format!("http://{addr}/gone")]))
        .await
        .expect("crawl should terminate");

    assert!(done);
    assert_eq!(recorder.codes(), vec![Some(404)]);
    assert_eq!(recorder.bodies()[0], body.as_bytes());
}

/// A handler that always fails.
struct Grumpy(Arc<AtomicUsize>);

#[async_trait]
impl DocumentHandler for Grumpy {
    async fn handle_document(&self, _crawl: &Crawl, _response: Response) -> anyhow::Result<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("this handler never likes anything")
    }
}

#[tokio::test]
async fn handler_errors_are_swallowed() {
    let stats = Arc::new(ServerStats::default());
    let addr = serve(stats.clone(), ok_response("x"), Duration::ZERO).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let spider = Spider::new().handler(Grumpy(calls.clone())).log_sink(Quiet);

    let done = timeout(
        RUN_LIMIT,
        spider.start([format!("http://{addr}/1"), format!("http://{addr}/2")]),
    )
    .await
    .expect("crawl should terminate");

    assert!(done);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn fetch_timeout_counts_as_failure() {
    // Delay far beyond the configured deadline; the engine must give up
    // on the fetch and still terminate cleanly.
    let stats = Arc::new(ServerStats::default());
    let addr = serve(stats.clone(), ok_response("late"), Duration::from_secs(60)).await;

    let recorder = Arc::new(Recorder::default());
    let spider = Spider::new()
        .fetch_timeout(Duration::from_millis(200))
        .handler(Record(recorder.clone()))
        .log_sink(Quiet);

    let done = timeout(RUN_LIMIT, spider.start([format!("http://{addr}/slow")]))
        .await
        .expect("crawl should terminate");

    assert!(done);
    assert_eq!(recorder.count(), 0);
}
