//! The long-lived loop draining the prequeue into the transform pipeline.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backplane::Backplane;
use crate::config::SchedulerConfig;
use crate::pipeline::Pipeline;
use crate::poller::Poller;

pub struct Queuer {
    backplane: Arc<dyn Backplane>,
    pipeline: Arc<Pipeline>,
    config: SchedulerConfig,
}

/// Running queuer. Dropping the handle aborts the loop; [QueuerHandle::stop]
/// shuts it down cooperatively.
pub struct QueuerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl QueuerHandle {
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

impl Queuer {
    pub(crate) fn new(
        backplane: Arc<dyn Backplane>,
        pipeline: Arc<Pipeline>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            backplane,
            pipeline,
            config,
        }
    }

    pub fn start(self) -> QueuerHandle {
        let (shutdown, receiver) = watch::channel(false);
        let task = tokio::spawn(self.run(receiver));
        QueuerHandle { shutdown, task }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        // One token per concurrent transform; a token is held until that
        // pipeline's terminal future resolves, so dequeue pace is bound to
        // completion pace no matter how the runtime schedules tasks.
        let tokens = Arc::new(Semaphore::new(self.config.transform_tokens));
        info!(tokens = self.config.transform_tokens, "queuer started");
        'run: loop {
            let permit = match tokens.clone().acquire_owned().await {
                Ok(permit) => permit,
                // The semaphore is never closed while the loop runs.
                Err(_) => break,
            };
            // Claims are made only while the queue gate is open; a claim
            // against a full queue would just park in the pipeline with
            // its token held.
            loop {
                match self.backplane.can_queue().await {
                    Ok(true) => break,
                    Ok(false) => {}
                    Err(error) => warn!(%error, "queue gate check failed"),
                }
                tokio::select! {
                    _ = shutdown.changed() => break 'run,
                    _ = tokio::time::sleep(self.config.can_queue_poll()) => {}
                }
            }
            let claimed = tokio::select! {
                _ = shutdown.changed() => break,
                claimed = self.backplane.deprequeue_operation() => claimed,
            };
            match claimed {
                Ok(Some(entry)) => {
                    let poller = Poller::start(
                        self.backplane.clone(),
                        entry.operation_name.clone(),
                        self.config.queueing_poll(),
                        self.config.queueing_deadline(),
                    );
                    let pipeline = self.pipeline.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(error) = pipeline.queue(entry, poller).await {
                            debug!(%error, "operation did not queue");
                        }
                    });
                }
                Ok(None) => {
                    debug!("null dequeue");
                    drop(permit);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(error) => {
                    warn!(%error, "deprequeue failed");
                    drop(permit);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        info!("queuer stopped");
    }
}
