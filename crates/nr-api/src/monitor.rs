use std::time::Duration;

use nr_engine::Job;
use nr_engine::queue::JobQueue;

/// Spawn the periodic metrics sweep. Each tick only queues a job; the
/// workers do the SSH work.
pub fn spawn_metrics_sync(queue: JobQueue, interval_secs: u64) {
    if interval_secs == 0 {
        tracing::warn!("METRICS_INTERVAL_SECS is 0, periodic metrics sync disabled");
        return;
    }
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        // First tick fires immediately; give the workers a full period first.
        interval.tick().await;
        loop {
            interval.tick().await;
            let execution_id = queue.dispatch(Job::SyncMetrics { server_id: None });
            tracing::debug!(%execution_id, "metrics sync queued");
        }
    });
}
