//! Periodic status line: completed count, queued count, average
//! completions per minute since the run began. Observational only.

use std::time::Duration;

use super::Crawl;

const INTERVAL: Duration = Duration::from_secs(60);

pub(super) async fn run(crawl: Crawl) {
    loop {
        tokio::time::sleep(INTERVAL).await;

        crawl.logger().log(format_args!(
            "completed: {}, queued: {}, average: {:.2}/min",
            crawl.completed(),
            crawl.queued(),
            crawl.rate_per_minute(),
        ));
    }
}
