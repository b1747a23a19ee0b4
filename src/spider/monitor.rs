//! Per-host scheduling loop. One of these runs for every host the crawl
//! has seen; it turns that host's FIFO queue into gate-bounded fetch
//! tasks and idles when the queue is drained.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Semaphore;
use tokio::sync::mpsc::UnboundedReceiver;

use super::Crawl;
use super::fetch::{self, GatePermits};

pub(super) async fn run(
    crawl: Crawl,
    mut queue: UnboundedReceiver<String>,
    gate: Arc<Semaphore>,
    pending: Arc<AtomicUsize>,
) {
    while let Some(url) = queue.recv().await {
        pending.fetch_sub(1, Ordering::AcqRel);

        // Per-host first, then global: a monitor never holds a global
        // slot it cannot immediately pair with a host slot.
        let Ok(host) = gate.clone().acquire_owned().await else {
            return;
        };
        let Ok(global) = crawl.global_gate().acquire_owned().await else {
            return;
        };

        crawl.latch_start();
        tokio::spawn(fetch::run(crawl.clone(), url, GatePermits { host, global }));
    }
}
