//! The transform pipeline: execute entry in, committed queue entry out.
//!
//! Stages: optional cache check, blob transform (action + command + tree),
//! validation, queued-operation upload, queue commit behind the can-queue
//! gate. Failure at any stage routes to the error-completion path instead
//! of leaving the operation stuck mid-pipeline.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use lru::LruCache;
use prost::Message;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use quern_reapi::{pack_any, proto, ActionKey};

use crate::actioncache::ActionCache;
use crate::backplane::Backplane;
use crate::config::SchedulerConfig;
use crate::errors::Error;
use crate::poller::Poller;
use crate::resolver::Resolver;
use crate::validator::{Validator, Violations};

/// Request metadata of executions recently served straight from the
/// result cache. A retried client request matching an entry here skips
/// the cache lookup, so one cache hit is not served twice.
pub type RecentExecutions = Arc<Mutex<LruCache<proto::RequestMetadata, ()>>>;

pub fn recent_executions(capacity: NonZeroUsize) -> RecentExecutions {
    Arc::new(Mutex::new(LruCache::new(capacity)))
}

pub struct Pipeline {
    backplane: Arc<dyn Backplane>,
    resolver: Arc<Resolver>,
    validator: Validator,
    action_cache: Arc<ActionCache>,
    recent: RecentExecutions,
    config: SchedulerConfig,
}

pub(crate) fn execute_operation_metadata(
    entry: &proto::ExecuteEntry,
    stage: proto::execution_stage::Value,
) -> proto::ExecuteOperationMetadata {
    proto::ExecuteOperationMetadata {
        stage: stage as i32,
        action_digest: entry.action_digest.clone(),
        stdout_stream_name: entry.stdout_stream_name.clone(),
        stderr_stream_name: entry.stderr_stream_name.clone(),
    }
}

impl Pipeline {
    pub fn new(
        backplane: Arc<dyn Backplane>,
        resolver: Arc<Resolver>,
        validator: Validator,
        action_cache: Arc<ActionCache>,
        recent: RecentExecutions,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            backplane,
            resolver,
            validator,
            action_cache,
            recent,
            config,
        }
    }

    /// Runs the whole pipeline for one claimed entry. On failure the
    /// operation is driven to an errored completion before the error is
    /// returned, so no outcome is ever silent.
    #[instrument(skip_all, fields(operation.name = %entry.operation_name))]
    pub async fn queue(&self, entry: proto::ExecuteEntry, poller: Poller) -> Result<(), Error> {
        let mut action: Option<Arc<proto::Action>> = None;
        match self.queue_inner(&entry, &poller, &mut action).await {
            Ok(()) => Ok(()),
            Err(error) => {
                poller.pause();
                self.error_operation(&entry, action.as_deref(), error.clone())
                    .await;
                Err(error)
            }
        }
    }

    async fn queue_inner(
        &self,
        entry: &proto::ExecuteEntry,
        poller: &Poller,
        action_out: &mut Option<Arc<proto::Action>>,
    ) -> Result<(), Error> {
        let action_digest = entry
            .action_digest
            .clone()
            .ok_or_else(|| Error::InvalidRequest("execute entry without action digest".into()))?;
        let action_key = ActionKey::from(action_digest.clone());

        let mut check_cache = Duration::ZERO;
        if !entry.skip_cache_lookup {
            let started = Instant::now();
            self.put_stage(entry, proto::execution_stage::Value::CacheCheck)
                .await?;
            if let Some(result) = self.action_cache.get(&action_key).await? {
                self.complete_with_cached_result(entry, (*result).clone())
                    .await?;
                if let Some(metadata) = &entry.request_metadata {
                    self.recent.lock().await.put(metadata.clone(), ());
                }
                poller.pause();
                info!(
                    check_cache_ms = started.elapsed().as_millis() as u64,
                    "operation served from the action cache"
                );
                return Ok(());
            }
            check_cache = started.elapsed();
        }

        let started = Instant::now();
        let (queued_operation, action) = self.build_queued_operation(entry).await?;
        *action_out = Some(action.clone());
        let transform = started.elapsed();

        if action.do_not_cache {
            // Re-execution of a cache-disabled action must not serve the
            // stale local entry, and watchers learn of the raw action.
            self.action_cache.invalidate(&action_key).await;
            self.backplane
                .put_operation(
                    proto::Operation {
                        name: entry.operation_name.clone(),
                        metadata: Some(pack_any(&*action)),
                        ..Default::default()
                    },
                    proto::execution_stage::Value::CacheCheck,
                )
                .await?;
        }

        let started = Instant::now();
        let metadata = entry.request_metadata.clone().unwrap_or_default();
        self.validator.validate(&queued_operation, &metadata).await?;
        let validate = started.elapsed();

        let started = Instant::now();
        let queued_digest = self.upload(&queued_operation, &metadata).await?;
        let upload = started.elapsed();

        let started = Instant::now();
        self.ensure_can_queue().await?;
        self.commit(entry, queued_digest, platform_of(&queued_operation), poller)
            .await?;
        let queue = started.elapsed();

        info!(
            check_cache_ms = check_cache.as_millis() as u64,
            transform_ms = transform.as_millis() as u64,
            validate_ms = validate.as_millis() as u64,
            upload_ms = upload.as_millis() as u64,
            queue_ms = queue.as_millis() as u64,
            "operation queued"
        );
        Ok(())
    }

    /// Assembles the self-contained queued operation: the action, its
    /// command, and the fully materialized input tree.
    pub(crate) async fn build_queued_operation(
        &self,
        entry: &proto::ExecuteEntry,
    ) -> Result<(proto::QueuedOperation, Arc<proto::Action>), Error> {
        let metadata = entry.request_metadata.clone().unwrap_or_default();
        let action_digest = entry
            .action_digest
            .clone()
            .ok_or_else(|| Error::InvalidRequest("execute entry without action digest".into()))?;

        let action = match self.resolver.expect_action(&action_digest, &metadata).await? {
            Some(action) => action,
            None => {
                let mut violations = Violations::default();
                violations.missing(&action_digest);
                return Err(violations.into_result().unwrap_err());
            }
        };

        let command_digest = action.command_digest.clone().unwrap_or_default();
        let input_root_digest = action.input_root_digest.clone().unwrap_or_default();
        let (command, tree) = tokio::try_join!(
            self.resolver.expect_command(&command_digest, &metadata),
            self.resolver.get_tree(&input_root_digest, &metadata),
        )?;
        let Some(command) = command else {
            let mut violations = Violations::default();
            violations.missing(&command_digest);
            return Err(violations.into_result().unwrap_err());
        };

        Ok((
            proto::QueuedOperation {
                action: Some((*action).clone()),
                command: Some((*command).clone()),
                tree: Some(tree),
            },
            action,
        ))
    }

    pub(crate) async fn validate(
        &self,
        queued_operation: &proto::QueuedOperation,
        metadata: &proto::RequestMetadata,
    ) -> Result<(), Error> {
        self.validator.validate(queued_operation, metadata).await
    }

    pub(crate) async fn upload(
        &self,
        queued_operation: &proto::QueuedOperation,
        metadata: &proto::RequestMetadata,
    ) -> Result<proto::Digest, Error> {
        self.resolver
            .upload_blob(Bytes::from(queued_operation.encode_to_vec()), metadata)
            .await
    }

    /// Polls the can-queue gate until it opens, bounded by the queueing
    /// deadline. The principal backpressure point of the system.
    pub(crate) async fn ensure_can_queue(&self) -> Result<(), Error> {
        tokio::time::timeout(self.config.queueing_deadline(), async {
            while !self.backplane.can_queue().await? {
                tokio::time::sleep(self.config.can_queue_poll()).await;
            }
            Ok(())
        })
        .await
        .map_err(|_| Error::DeadlineExceeded("canQueue".into()))?
    }

    /// Commits the queue entry, pausing the heartbeat first so a commit
    /// and a lease renewal cannot interleave.
    pub(crate) async fn commit(
        &self,
        entry: &proto::ExecuteEntry,
        queued_digest: proto::Digest,
        platform: Option<proto::Platform>,
        poller: &Poller,
    ) -> Result<(), Error> {
        let queue_entry = proto::QueueEntry {
            execute_entry: Some(entry.clone()),
            queued_operation_digest: Some(queued_digest.clone()),
            platform,
        };
        let metadata = proto::QueuedOperationMetadata {
            execute_operation_metadata: Some(execute_operation_metadata(
                entry,
                proto::execution_stage::Value::Queued,
            )),
            queued_operation_digest: Some(queued_digest),
            request_metadata: entry.request_metadata.clone(),
        };
        let operation = proto::Operation {
            name: entry.operation_name.clone(),
            metadata: Some(pack_any(&metadata)),
            ..Default::default()
        };
        poller.pause();
        self.backplane.queue(queue_entry, operation).await
    }

    async fn put_stage(
        &self,
        entry: &proto::ExecuteEntry,
        stage: proto::execution_stage::Value,
    ) -> Result<(), Error> {
        let operation = proto::Operation {
            name: entry.operation_name.clone(),
            metadata: Some(pack_any(&execute_operation_metadata(entry, stage))),
            ..Default::default()
        };
        self.backplane.put_operation(operation, stage).await?;
        Ok(())
    }

    pub(crate) async fn complete_with_cached_result(
        &self,
        entry: &proto::ExecuteEntry,
        result: proto::ActionResult,
    ) -> Result<(), Error> {
        let response = proto::ExecuteResponse {
            result: Some(result),
            cached_result: true,
            status: Some(proto::rpc::Status::default()),
        };
        let operation = proto::Operation {
            name: entry.operation_name.clone(),
            metadata: Some(pack_any(&execute_operation_metadata(
                entry,
                proto::execution_stage::Value::Completed,
            ))),
            done: true,
            result: Some(proto::operation::Result::Response(pack_any(&response))),
        };
        self.backplane
            .put_operation(operation, proto::execution_stage::Value::Completed)
            .await?;
        self.backplane
            .complete_operation(&entry.operation_name)
            .await
    }

    /// Drives an operation to an errored completion. Retried indefinitely:
    /// an operation stuck neither failed nor progressing is worse than a
    /// slow retry loop. Log noise is capped to every 100th attempt.
    pub(crate) async fn error_operation(
        &self,
        entry: &proto::ExecuteEntry,
        action: Option<&proto::Action>,
        error: Error,
    ) {
        let error = error.downgrade_deadline();
        let response = proto::ExecuteResponse {
            result: None,
            cached_result: false,
            status: Some(error.as_rpc_status()),
        };
        let metadata = match action {
            Some(action) => pack_any(action),
            None => pack_any(&execute_operation_metadata(
                entry,
                proto::execution_stage::Value::Completed,
            )),
        };
        let operation = proto::Operation {
            name: entry.operation_name.clone(),
            metadata: Some(metadata),
            done: true,
            result: Some(proto::operation::Result::Response(pack_any(&response))),
        };

        let mut attempt: u64 = 0;
        loop {
            match self
                .backplane
                .put_operation(operation.clone(), proto::execution_stage::Value::Completed)
                .await
            {
                Ok(_) => break,
                Err(put_error) => {
                    attempt += 1;
                    if attempt % 100 == 1 {
                        warn!(
                            operation.name = %entry.operation_name,
                            error = %put_error,
                            attempt,
                            "failed to report errored completion, retrying"
                        );
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
        if let Err(complete_error) = self
            .backplane
            .complete_operation(&entry.operation_name)
            .await
        {
            warn!(
                operation.name = %entry.operation_name,
                error = %complete_error,
                "failed to retire errored operation"
            );
        }
    }
}

pub(crate) fn platform_of(queued_operation: &proto::QueuedOperation) -> Option<proto::Platform> {
    queued_operation
        .command
        .as_ref()
        .and_then(|c| c.platform.clone())
}
