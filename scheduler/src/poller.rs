use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::backplane::Backplane;

/// Periodic lease-renewal heartbeat for a claimed prequeue entry. Paused
/// the moment the owning pipeline reaches a terminal outcome; a heartbeat
/// left running by a crashed queuer simply stops, and the lease lapses so
/// another queuer can claim the entry.
pub struct Poller {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Poller {
    pub fn start(
        backplane: Arc<dyn Backplane>,
        operation_name: String,
        period: Duration,
        deadline: Duration,
    ) -> Self {
        let (stop, mut stopped) = watch::channel(false);
        let task = tokio::spawn(async move {
            let expiry = tokio::time::Instant::now() + deadline;
            loop {
                tokio::select! {
                    _ = stopped.changed() => break,
                    _ = tokio::time::sleep(period) => {}
                }
                if tokio::time::Instant::now() >= expiry {
                    warn!(operation.name = %operation_name, "queueing heartbeat hit its deadline");
                    break;
                }
                if let Err(error) = backplane.queueing(&operation_name).await {
                    warn!(operation.name = %operation_name, %error, "queueing lease renewal failed");
                }
            }
        });
        Self { stop, task }
    }

    /// Suspends the heartbeat. Idempotent.
    pub fn pause(&self) {
        let _ = self.stop.send(true);
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.pause();
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backplane::MemoryBackplane;

    #[tokio::test(start_paused = true)]
    async fn heartbeat_renews_until_paused() {
        let backplane = Arc::new(MemoryBackplane::new());
        let poller = Poller::start(
            backplane.clone(),
            "op-1".to_string(),
            Duration::from_secs(5),
            Duration::from_secs(300),
        );

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(backplane.queueing_leases().await.contains("op-1"));

        poller.pause();
        tokio::time::sleep(Duration::from_secs(60)).await;
        // Paused heartbeats renew nothing further; pausing twice is fine.
        poller.pause();
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_stops_at_the_deadline() {
        let backplane = Arc::new(MemoryBackplane::new());
        let _poller = Poller::start(
            backplane.clone(),
            "op-2".to_string(),
            Duration::from_secs(5),
            Duration::from_secs(12),
        );

        tokio::time::sleep(Duration::from_secs(30)).await;
        // No panic, no runaway loop; the task ended on its own.
    }
}
