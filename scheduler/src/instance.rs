//! The public surface of one scheduler shard: execute, requeue, watch,
//! and the blob and operation passthroughs a service adapter exposes.

use std::sync::Arc;

use async_stream::stream;
use bytes::Bytes;
use futures::StreamExt;
use prost::Message;
use tracing::{info, instrument};
use uuid::Uuid;

use quern_reapi::{any_is, blob_name, pack_any, proto, unpack_any, ActionKey, RPC_CODE_OK};

use crate::actioncache::ActionCache;
use crate::backplane::{Backplane, BackplaneStatus, OperationStream};
use crate::config::SchedulerConfig;
use crate::errors::Error;
use crate::pipeline::{
    execute_operation_metadata, platform_of, recent_executions, Pipeline, RecentExecutions,
};
use crate::poller::Poller;
use crate::queuer::{Queuer, QueuerHandle};
use crate::resolver::Resolver;
use crate::validator::{Validator, VIOLATION_TYPE_INVALID};
use crate::workers::{WorkerFactory, WorkerPool};

const FORBIDDEN_DESCRIPTION: &str = "This request is forbidden.";

pub struct Scheduler {
    config: SchedulerConfig,
    backplane: Arc<dyn Backplane>,
    resolver: Arc<Resolver>,
    action_cache: Arc<ActionCache>,
    pipeline: Arc<Pipeline>,
    recent: RecentExecutions,
}

impl Scheduler {
    pub fn new(
        backplane: Arc<dyn Backplane>,
        factory: WorkerFactory,
        config: SchedulerConfig,
    ) -> Self {
        let pool = Arc::new(WorkerPool::new(backplane.clone(), factory));
        Self::with_pool(backplane, pool, config)
    }

    pub(crate) fn with_pool(
        backplane: Arc<dyn Backplane>,
        pool: Arc<WorkerPool>,
        config: SchedulerConfig,
    ) -> Self {
        let resolver = Arc::new(Resolver::new(backplane.clone(), pool, &config));
        let validator = Validator::new(backplane.clone(), resolver.clone(), &config);
        let action_cache = Arc::new(ActionCache::new(
            backplane.clone(),
            config.action_result_cache_capacity,
        ));
        let recent = recent_executions(config.recent_executions_capacity);
        let pipeline = Arc::new(Pipeline::new(
            backplane.clone(),
            resolver.clone(),
            validator,
            action_cache.clone(),
            recent.clone(),
            config.clone(),
        ));
        Self {
            config,
            backplane,
            resolver,
            action_cache,
            pipeline,
            recent,
        }
    }

    /// Starts this shard's queuer loop against the shared backplane.
    pub fn start_queuer(&self) -> QueuerHandle {
        Queuer::new(
            self.backplane.clone(),
            self.pipeline.clone(),
            self.config.clone(),
        )
        .start()
    }

    /// Admits one execution request: mints the operation, records the
    /// prequeue entry, and returns the stream of operation states the
    /// client watches. Admission is refused outright when the prequeue
    /// is full, before any state is created.
    #[instrument(skip_all, fields(action.digest = %action_digest))]
    pub async fn execute(
        &self,
        action_digest: proto::Digest,
        skip_cache_lookup: bool,
        execution_policy: Option<proto::ExecutionPolicy>,
        results_cache_policy: Option<proto::ResultsCachePolicy>,
        request_metadata: proto::RequestMetadata,
    ) -> Result<OperationStream, Error> {
        if !self.backplane.can_prequeue().await? {
            return Err(Error::ResourceExhausted("prequeue is full".into()));
        }

        let name = format!(
            "{}/operations/{}",
            self.config.instance_name,
            Uuid::new_v4()
        );
        let key = ActionKey::from(action_digest.clone());
        // A fresh execute must observe the durable result tier, not a
        // stale local entry.
        self.action_cache.invalidate(&key).await;

        // A client retrying a request it was already served from the
        // cache wants a real execution this time.
        let skip_cache_lookup =
            skip_cache_lookup || self.recent.lock().await.contains(&request_metadata);

        let entry = proto::ExecuteEntry {
            operation_name: name.clone(),
            action_digest: Some(action_digest.clone()),
            skip_cache_lookup,
            request_metadata: Some(request_metadata.clone()),
            execution_policy,
            results_cache_policy,
            queued_timestamp: Some(now_timestamp()),
            stdout_stream_name: format!("{}/streams/stdout", name),
            stderr_stream_name: format!("{}/streams/stderr", name),
        };
        let operation = proto::Operation {
            name: name.clone(),
            metadata: Some(pack_any(&execute_operation_metadata(
                &entry,
                proto::execution_stage::Value::Unknown,
            ))),
            ..Default::default()
        };

        if self.backplane.is_blacklisted(&request_metadata).await? {
            info!(
                invocation.id = %request_metadata.tool_invocation_id,
                "refusing blacklisted invocation"
            );
            let forbidden = forbidden_operation(&entry);
            return Ok(Box::pin(futures::stream::iter([
                Ok(operation),
                Ok(forbidden),
            ])));
        }

        self.backplane.prequeue(entry, operation).await?;
        let watch = self.backplane.watch_operation(&name).await?;
        Ok(result_caching_watch(
            self.action_cache.clone(),
            key,
            action_digest,
            watch,
        ))
    }

    /// Puts a claimed queue entry back through validation and into the
    /// queue, reusing its queued-operation blob when that blob is still
    /// fetchable and rebuilding it otherwise. Terminal and unknown
    /// operations are retired instead of requeued.
    #[instrument(skip_all, fields(operation.name = %queue_entry.execute_entry.as_ref().map(|e| e.operation_name.as_str()).unwrap_or("")))]
    pub async fn requeue(&self, queue_entry: proto::QueueEntry) -> Result<(), Error> {
        let entry = queue_entry
            .execute_entry
            .clone()
            .ok_or_else(|| Error::InvalidRequest("queue entry without execute entry".into()))?;
        let name = entry.operation_name.clone();
        let metadata = entry.request_metadata.clone().unwrap_or_default();

        if self.backplane.is_blacklisted(&metadata).await? {
            self.backplane
                .put_operation(
                    forbidden_operation(&entry),
                    proto::execution_stage::Value::Completed,
                )
                .await?;
            self.backplane.complete_operation(&name).await?;
            return Ok(());
        }

        let Some(operation) = self.backplane.get_operation(&name).await? else {
            // No record to requeue; tell watchers and drop the entry.
            self.backplane.delete_operation(&name).await?;
            return Ok(());
        };
        if operation.done {
            self.backplane.complete_operation(&name).await?;
            return Ok(());
        }

        if !entry.skip_cache_lookup {
            let action_digest = entry.action_digest.clone().unwrap_or_default();
            let key = ActionKey::from(action_digest);
            if let Some(result) = self.action_cache.get(&key).await? {
                self.pipeline
                    .complete_with_cached_result(&entry, (*result).clone())
                    .await?;
                return Ok(());
            }
        }

        let poller = Poller::start(
            self.backplane.clone(),
            name,
            self.config.queueing_poll(),
            self.config.queueing_deadline(),
        );
        match self.requeue_inner(&queue_entry, &entry, &poller).await {
            Ok(()) => Ok(()),
            Err(error) => {
                poller.pause();
                self.pipeline
                    .error_operation(&entry, None, error.clone())
                    .await;
                Err(error)
            }
        }
    }

    async fn requeue_inner(
        &self,
        queue_entry: &proto::QueueEntry,
        entry: &proto::ExecuteEntry,
        poller: &Poller,
    ) -> Result<(), Error> {
        let metadata = entry.request_metadata.clone().unwrap_or_default();
        let queued_digest = queue_entry.queued_operation_digest.clone().unwrap_or_default();

        let fetched = match self.resolver.get_blob(&queued_digest, &metadata).await {
            Ok(blob) => proto::QueuedOperation::decode(blob).ok(),
            Err(_) => None,
        };
        // A blob that did not survive gets reassembled from its sources.
        let (queued_operation, existing_digest) = match fetched {
            Some(queued_operation) => (queued_operation, Some(queued_digest)),
            None => {
                let (queued_operation, _action) =
                    self.pipeline.build_queued_operation(entry).await?;
                (queued_operation, None)
            }
        };
        self.pipeline.validate(&queued_operation, &metadata).await?;
        let queued_digest = match existing_digest {
            Some(digest) => digest,
            None => self.pipeline.upload(&queued_operation, &metadata).await?,
        };
        self.pipeline.ensure_can_queue().await?;
        self.pipeline
            .commit(entry, queued_digest, platform_of(&queued_operation), poller)
            .await
    }

    /// Narrows `digests` to those no live worker holds. Blacklisted
    /// invocations are told nothing is missing so they upload nothing.
    pub async fn find_missing_blobs(
        &self,
        digests: Vec<proto::Digest>,
        metadata: &proto::RequestMetadata,
    ) -> Result<Vec<proto::Digest>, Error> {
        if self.backplane.is_blacklisted(metadata).await? {
            return Ok(vec![]);
        }
        self.resolver.find_missing_blobs(digests, metadata).await
    }

    pub async fn get_blob(
        &self,
        digest: &proto::Digest,
        metadata: &proto::RequestMetadata,
    ) -> Result<Bytes, Error> {
        self.resolver.get_blob(digest, metadata).await
    }

    /// Stores a blob on a random live worker and returns its digest.
    pub async fn put_blob(
        &self,
        data: Bytes,
        metadata: &proto::RequestMetadata,
    ) -> Result<proto::Digest, Error> {
        if self.backplane.is_blacklisted(metadata).await? {
            return Err(Error::Unavailable(
                "writes for this invocation are forbidden".into(),
            ));
        }
        if self.config.max_blob_size > 0 && data.len() as i64 > self.config.max_blob_size {
            return Err(Error::InvalidRequest(format!(
                "blob size {} exceeds the {} byte maximum",
                data.len(),
                self.config.max_blob_size
            )));
        }
        self.resolver.upload_blob(data, metadata).await
    }

    pub async fn get_operation(&self, name: &str) -> Result<Option<proto::Operation>, Error> {
        Ok(self
            .backplane
            .get_operation(name)
            .await?
            .map(proto::Operation::strip_queued_metadata))
    }

    pub async fn delete_operation(&self, name: &str) -> Result<(), Error> {
        self.backplane.delete_operation(name).await
    }

    /// Watches an operation by name, in the client-visible form: queued
    /// metadata stripped, scheduler-internal marker states withheld.
    pub async fn watch_operation(&self, name: &str) -> Result<OperationStream, Error> {
        let mut inner = self.backplane.watch_operation(name).await?;
        Ok(Box::pin(stream! {
            while let Some(item) = inner.next().await {
                match item {
                    Ok(operation) => {
                        if !operation.done
                            && operation.metadata.as_ref().is_some_and(any_is::<proto::Action>)
                        {
                            continue;
                        }
                        yield Ok(operation.strip_queued_metadata());
                    }
                    Err(error) => yield Err(error),
                }
            }
        }))
    }

    /// Records an externally reported completion. Only errored completions
    /// are accepted here; successful results arrive through the action
    /// cache and the queue, never through this door.
    pub async fn put_operation(&self, operation: proto::Operation) -> Result<bool, Error> {
        if !is_errored_completion(&operation) {
            return Err(Error::InvalidRequest(format!(
                "operation {} is not an errored completion",
                operation.name
            )));
        }
        let accepted = self
            .backplane
            .put_operation(operation.clone(), proto::execution_stage::Value::Completed)
            .await?;
        if accepted {
            self.backplane.complete_operation(&operation.name).await?;
        }
        Ok(accepted)
    }

    pub async fn get_action_result(
        &self,
        key: &ActionKey,
    ) -> Result<Option<Arc<proto::ActionResult>>, Error> {
        self.action_cache.get(key).await
    }

    pub async fn put_action_result(
        &self,
        key: &ActionKey,
        result: proto::ActionResult,
    ) -> Result<(), Error> {
        self.action_cache.put(key, result).await
    }

    pub async fn find_operations(&self, invocation_id: &str) -> Result<Vec<String>, Error> {
        self.backplane.find_operations(invocation_id).await
    }

    pub async fn operations_status(&self) -> Result<BackplaneStatus, Error> {
        self.backplane.operations_status().await
    }

    /// Scrubs a departed worker's entries from the blob location index.
    pub async fn reindex_cas(&self, worker_name: &str) -> Result<usize, Error> {
        self.backplane.reindex_cas(worker_name).await
    }

    pub async fn get_client_start_time(
        &self,
        client_key: &str,
    ) -> Result<Option<prost_types::Timestamp>, Error> {
        self.backplane.get_client_start_time(client_key).await
    }
}

fn now_timestamp() -> prost_types::Timestamp {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    prost_types::Timestamp {
        seconds: now.as_secs() as i64,
        nanos: now.subsec_nanos() as i32,
    }
}

fn forbidden_operation(entry: &proto::ExecuteEntry) -> proto::Operation {
    let failure = proto::rpc::PreconditionFailure {
        violations: vec![proto::rpc::precondition_failure::Violation {
            r#type: VIOLATION_TYPE_INVALID.to_string(),
            subject: entry
                .action_digest
                .as_ref()
                .map(blob_name)
                .unwrap_or_default(),
            description: FORBIDDEN_DESCRIPTION.to_string(),
        }],
    };
    let response = proto::ExecuteResponse {
        result: None,
        cached_result: false,
        status: Some(Error::ViolatesPrecondition(failure).as_rpc_status()),
    };
    proto::Operation {
        name: entry.operation_name.clone(),
        metadata: Some(pack_any(&execute_operation_metadata(
            entry,
            proto::execution_stage::Value::Completed,
        ))),
        done: true,
        result: Some(proto::operation::Result::Response(pack_any(&response))),
    }
}

fn is_errored_completion(operation: &proto::Operation) -> bool {
    if !operation.done {
        return false;
    }
    match &operation.result {
        Some(proto::operation::Result::Error(status)) => status.code != RPC_CODE_OK,
        Some(proto::operation::Result::Response(_)) => operation
            .execute_response()
            .and_then(|response| response.status)
            .map(|status| status.code != RPC_CODE_OK)
            .unwrap_or(false),
        None => false,
    }
}

/// Wraps a watch stream so successful completions feed the local result
/// tier and the raw-action marker state stays inside the scheduler. The
/// marker doubles as the cache-disable signal: once seen with
/// `do_not_cache`, nothing from this operation enters the cache.
fn result_caching_watch(
    cache: Arc<ActionCache>,
    key: ActionKey,
    action_digest: proto::Digest,
    mut inner: OperationStream,
) -> OperationStream {
    Box::pin(stream! {
        let mut cacheable = true;
        while let Some(item) = inner.next().await {
            let mut operation = match item {
                Ok(operation) => operation,
                Err(error) => {
                    yield Err(error);
                    continue;
                }
            };
            let raw_action = operation
                .metadata
                .as_ref()
                .and_then(unpack_any::<proto::Action>);
            if let Some(action) = raw_action {
                if action.do_not_cache {
                    cacheable = false;
                    cache.invalidate(&key).await;
                }
                if !operation.done {
                    continue;
                }
                // A completion carrying the raw action still needs
                // client-shaped metadata.
                operation.metadata = Some(pack_any(&proto::ExecuteOperationMetadata {
                    stage: proto::execution_stage::Value::Completed as i32,
                    action_digest: Some(action_digest.clone()),
                    ..Default::default()
                }));
            }
            if cacheable && operation.done {
                if let Some(response) = operation.execute_response() {
                    let ok = response
                        .status
                        .as_ref()
                        .map(|status| status.code == RPC_CODE_OK)
                        .unwrap_or(true);
                    if ok && !response.cached_result {
                        if let Some(result) = response.result {
                            cache.put_local(&key, result).await;
                        }
                    }
                }
            }
            yield Ok(operation.strip_queued_metadata());
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backplane::MemoryBackplane;
    use crate::errors::Code;
    use crate::fixtures::{
        worker_pool, FakeWorker, ACTION, ACTION_DIGEST, ACTION_RESULT, COMMAND, INPUT_ROOT,
        INPUT_ROOT_DIGEST, REQUEST_METADATA,
    };
    use pretty_assertions::assert_eq;

    struct Harness {
        backplane: Arc<MemoryBackplane>,
        worker: Arc<FakeWorker>,
        scheduler: Scheduler,
    }

    async fn harness(worker: Arc<FakeWorker>, config: SchedulerConfig) -> Harness {
        let backplane = Arc::new(MemoryBackplane::new());
        let pool = worker_pool(backplane.clone(), vec![("w1", worker.clone())]).await;
        let scheduler = Scheduler::with_pool(backplane.clone(), pool, config);
        Harness {
            backplane,
            worker,
            scheduler,
        }
    }

    fn stocked_worker() -> Arc<FakeWorker> {
        Arc::new(
            FakeWorker::new()
                .with_message(&*ACTION)
                .with_message(&*COMMAND)
                .with_message(&*INPUT_ROOT)
                .with_blob(b"aaa")
                .with_blob(b"bbb"),
        )
    }

    fn canonical_queued_operation() -> proto::QueuedOperation {
        let mut tree = proto::Tree {
            root_digest: Some(INPUT_ROOT_DIGEST.clone()),
            directories: Default::default(),
        };
        tree.directories
            .insert(INPUT_ROOT_DIGEST.hash.clone(), INPUT_ROOT.clone());
        proto::QueuedOperation {
            action: Some(ACTION.clone()),
            command: Some(COMMAND.clone()),
            tree: Some(tree),
        }
    }

    fn pending_entry(name: &str, skip_cache_lookup: bool) -> proto::ExecuteEntry {
        proto::ExecuteEntry {
            operation_name: name.to_string(),
            action_digest: Some(ACTION_DIGEST.clone()),
            skip_cache_lookup,
            request_metadata: Some(REQUEST_METADATA.clone()),
            ..Default::default()
        }
    }

    async fn put_pending_operation(backplane: &MemoryBackplane, name: &str) {
        backplane
            .put_operation(
                proto::Operation {
                    name: name.to_string(),
                    ..Default::default()
                },
                proto::execution_stage::Value::Queued,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn execute_prequeues_and_streams_the_initial_operation() {
        let h = harness(stocked_worker(), SchedulerConfig::default()).await;
        let mut watch = h
            .scheduler
            .execute(
                ACTION_DIGEST.clone(),
                false,
                None,
                None,
                REQUEST_METADATA.clone(),
            )
            .await
            .unwrap();

        let operation = watch.next().await.unwrap().unwrap();
        assert!(operation.name.starts_with("main/operations/"));
        assert!(!operation.done);
        assert_eq!(operation.stage(), proto::execution_stage::Value::Unknown);

        let status = h.backplane.operations_status().await.unwrap();
        assert_eq!(status.prequeue_size, 1);
    }

    #[tokio::test]
    async fn execute_refuses_a_full_prequeue() {
        let h = harness(stocked_worker(), SchedulerConfig::default()).await;
        h.backplane.set_prequeue_capacity(0).await;
        let result = h
            .scheduler
            .execute(
                ACTION_DIGEST.clone(),
                false,
                None,
                None,
                REQUEST_METADATA.clone(),
            )
            .await;
        assert!(matches!(result, Err(Error::ResourceExhausted(_))));
    }

    #[tokio::test]
    async fn blacklisted_execute_completes_without_prequeuing() {
        let h = harness(stocked_worker(), SchedulerConfig::default()).await;
        h.backplane.blacklist_invocation("invocation-1").await;

        let watch = h
            .scheduler
            .execute(
                ACTION_DIGEST.clone(),
                false,
                None,
                None,
                REQUEST_METADATA.clone(),
            )
            .await
            .unwrap();
        let operations: Vec<_> = watch.map(|item| item.unwrap()).collect().await;
        assert_eq!(operations.len(), 2);
        assert!(!operations[0].done);
        assert!(operations[1].done);

        let status = operations[1].execute_response().unwrap().status.unwrap();
        assert_eq!(status.code, Code::FailedPrecondition as i32);
        let failure =
            unpack_any::<proto::rpc::PreconditionFailure>(&status.details[0]).unwrap();
        assert_eq!(failure.violations[0].r#type, VIOLATION_TYPE_INVALID);
        assert_eq!(failure.violations[0].description, FORBIDDEN_DESCRIPTION);

        let status = h.backplane.operations_status().await.unwrap();
        assert_eq!(status.prequeue_size, 0);
    }

    #[tokio::test]
    async fn repeated_metadata_skips_the_cache_lookup() {
        let h = harness(stocked_worker(), SchedulerConfig::default()).await;
        h.scheduler
            .recent
            .lock()
            .await
            .put(REQUEST_METADATA.clone(), ());

        let _watch = h
            .scheduler
            .execute(
                ACTION_DIGEST.clone(),
                false,
                None,
                None,
                REQUEST_METADATA.clone(),
            )
            .await
            .unwrap();
        let entry = h
            .backplane
            .deprequeue_operation()
            .await
            .unwrap()
            .unwrap();
        assert!(entry.skip_cache_lookup);
    }

    #[tokio::test]
    async fn observed_completion_feeds_the_local_result_tier() {
        let h = harness(stocked_worker(), SchedulerConfig::default()).await;
        let watch = h
            .scheduler
            .execute(
                ACTION_DIGEST.clone(),
                true,
                None,
                None,
                REQUEST_METADATA.clone(),
            )
            .await
            .unwrap();

        let name = h
            .backplane
            .deprequeue_operation()
            .await
            .unwrap()
            .unwrap()
            .operation_name;
        let response = proto::ExecuteResponse {
            result: Some(ACTION_RESULT.clone()),
            cached_result: false,
            status: Some(proto::rpc::Status::default()),
        };
        h.backplane
            .put_operation(
                proto::Operation {
                    name,
                    done: true,
                    result: Some(proto::operation::Result::Response(pack_any(&response))),
                    ..Default::default()
                },
                proto::execution_stage::Value::Completed,
            )
            .await
            .unwrap();

        let operations: Vec<_> = watch.map(|item| item.unwrap()).collect().await;
        assert!(operations.last().unwrap().done);

        // The durable tier never saw this result, so a hit proves the
        // watch populated tier 1.
        let key = ActionKey::from(ACTION_DIGEST.clone());
        let served = h.scheduler.get_action_result(&key).await.unwrap();
        assert_eq!(served.as_deref(), Some(&*ACTION_RESULT));
    }

    #[tokio::test]
    async fn cache_disabled_completions_stay_out_of_the_cache() {
        let h = harness(stocked_worker(), SchedulerConfig::default()).await;
        let watch = h
            .scheduler
            .execute(
                ACTION_DIGEST.clone(),
                true,
                None,
                None,
                REQUEST_METADATA.clone(),
            )
            .await
            .unwrap();
        let name = h
            .backplane
            .deprequeue_operation()
            .await
            .unwrap()
            .unwrap()
            .operation_name;

        // The pipeline's marker state for a cache-disabled action.
        let uncached_action = proto::Action {
            do_not_cache: true,
            ..ACTION.clone()
        };
        h.backplane
            .put_operation(
                proto::Operation {
                    name: name.clone(),
                    metadata: Some(pack_any(&uncached_action)),
                    ..Default::default()
                },
                proto::execution_stage::Value::CacheCheck,
            )
            .await
            .unwrap();
        let response = proto::ExecuteResponse {
            result: Some(ACTION_RESULT.clone()),
            cached_result: false,
            status: Some(proto::rpc::Status::default()),
        };
        h.backplane
            .put_operation(
                proto::Operation {
                    name,
                    done: true,
                    result: Some(proto::operation::Result::Response(pack_any(&response))),
                    ..Default::default()
                },
                proto::execution_stage::Value::Completed,
            )
            .await
            .unwrap();

        let operations: Vec<_> = watch.map(|item| item.unwrap()).collect().await;
        // The marker state was withheld from the client.
        assert_eq!(operations.len(), 2);
        assert!(operations[1].done);

        let key = ActionKey::from(ACTION_DIGEST.clone());
        assert_eq!(h.scheduler.get_action_result(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn requeue_is_idempotent_for_completed_operations() {
        let h = harness(stocked_worker(), SchedulerConfig::default()).await;
        h.backplane
            .put_operation(
                proto::Operation {
                    name: "op-done".into(),
                    done: true,
                    ..Default::default()
                },
                proto::execution_stage::Value::Completed,
            )
            .await
            .unwrap();

        let queue_entry = proto::QueueEntry {
            execute_entry: Some(pending_entry("op-done", true)),
            ..Default::default()
        };
        h.scheduler.requeue(queue_entry).await.unwrap();
        assert!(h.backplane.queue_entries().await.is_empty());
    }

    #[tokio::test]
    async fn requeue_without_a_record_deletes_the_operation() {
        let h = harness(stocked_worker(), SchedulerConfig::default()).await;
        let queue_entry = proto::QueueEntry {
            execute_entry: Some(pending_entry("op-ghost", true)),
            ..Default::default()
        };
        h.scheduler.requeue(queue_entry).await.unwrap();
        assert_eq!(h.backplane.get_operation("op-ghost").await.unwrap(), None);
        assert!(h.backplane.queue_entries().await.is_empty());
    }

    #[tokio::test]
    async fn requeue_serves_the_cache_when_allowed() {
        let h = harness(stocked_worker(), SchedulerConfig::default()).await;
        let key = ActionKey::from(ACTION_DIGEST.clone());
        h.backplane
            .put_action_result(&key, ACTION_RESULT.clone())
            .await
            .unwrap();
        put_pending_operation(&h.backplane, "op-cached").await;

        let queue_entry = proto::QueueEntry {
            execute_entry: Some(pending_entry("op-cached", false)),
            ..Default::default()
        };
        h.scheduler.requeue(queue_entry).await.unwrap();

        let operation = h
            .backplane
            .get_operation("op-cached")
            .await
            .unwrap()
            .unwrap();
        assert!(operation.done);
        assert!(operation.execute_response().unwrap().cached_result);
        assert!(h.backplane.queue_entries().await.is_empty());
    }

    #[tokio::test]
    async fn requeue_reuses_a_live_queued_operation_blob() {
        let queued_operation = canonical_queued_operation();
        let worker = Arc::new(
            FakeWorker::new()
                .with_message(&*ACTION)
                .with_message(&*COMMAND)
                .with_message(&*INPUT_ROOT)
                .with_message(&queued_operation)
                .with_blob(b"aaa")
                .with_blob(b"bbb"),
        );
        let h = harness(worker, SchedulerConfig::default()).await;
        put_pending_operation(&h.backplane, "op-reuse").await;

        let queued_digest = proto::Digest::of_message(&queued_operation);
        let queue_entry = proto::QueueEntry {
            execute_entry: Some(pending_entry("op-reuse", true)),
            queued_operation_digest: Some(queued_digest.clone()),
            ..Default::default()
        };
        h.scheduler.requeue(queue_entry).await.unwrap();

        let entries = h.backplane.queue_entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0].queued_operation_digest,
            Some(queued_digest)
        );
        // The surviving blob was reused, never re-uploaded.
        assert!(h.worker.uploads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn requeue_rebuilds_a_lost_queued_operation_blob() {
        let h = harness(stocked_worker(), SchedulerConfig::default()).await;
        put_pending_operation(&h.backplane, "op-rebuild").await;

        let expected_digest = proto::Digest::of_message(&canonical_queued_operation());
        let queue_entry = proto::QueueEntry {
            execute_entry: Some(pending_entry("op-rebuild", true)),
            queued_operation_digest: Some(expected_digest.clone()),
            ..Default::default()
        };
        h.scheduler.requeue(queue_entry).await.unwrap();

        let entries = h.backplane.queue_entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0].queued_operation_digest,
            Some(expected_digest.clone())
        );
        assert!(h.worker.uploads.lock().unwrap().contains(&expected_digest));
    }

    #[tokio::test]
    async fn blacklisted_requeue_reports_a_forbidden_completion() {
        let h = harness(stocked_worker(), SchedulerConfig::default()).await;
        h.backplane.blacklist_invocation("invocation-1").await;
        put_pending_operation(&h.backplane, "op-denied").await;

        let queue_entry = proto::QueueEntry {
            execute_entry: Some(pending_entry("op-denied", true)),
            ..Default::default()
        };
        h.scheduler.requeue(queue_entry).await.unwrap();

        let operation = h
            .backplane
            .get_operation("op-denied")
            .await
            .unwrap()
            .unwrap();
        assert!(operation.done);
        let status = operation.execute_response().unwrap().status.unwrap();
        assert_eq!(status.code, Code::FailedPrecondition as i32);
        assert!(h.backplane.queue_entries().await.is_empty());
    }

    #[tokio::test]
    async fn oversized_blob_writes_are_rejected() {
        let config = SchedulerConfig {
            max_blob_size: 8,
            ..Default::default()
        };
        let h = harness(stocked_worker(), config).await;

        let error = h
            .scheduler
            .put_blob(Bytes::from_static(b"nine bytes"), &REQUEST_METADATA)
            .await
            .unwrap_err();
        assert!(matches!(error, Error::InvalidRequest(_)));

        let digest = h
            .scheduler
            .put_blob(Bytes::from_static(b"tiny"), &REQUEST_METADATA)
            .await
            .unwrap();
        assert!(h.worker.holds(&digest));
    }

    #[tokio::test]
    async fn blacklisted_invocations_cannot_write_blobs() {
        let h = harness(stocked_worker(), SchedulerConfig::default()).await;
        h.backplane.blacklist_invocation("invocation-1").await;

        let error = h
            .scheduler
            .put_blob(Bytes::from_static(b"data"), &REQUEST_METADATA)
            .await
            .unwrap_err();
        assert!(matches!(error, Error::Unavailable(_)));
        assert_eq!(
            h.scheduler
                .find_missing_blobs(vec![proto::Digest::of_blob(b"data")], &REQUEST_METADATA)
                .await
                .unwrap(),
            vec![]
        );
    }

    #[tokio::test]
    async fn only_errored_completions_may_be_stored() {
        let h = harness(stocked_worker(), SchedulerConfig::default()).await;

        let pending = proto::Operation {
            name: "op-p".into(),
            ..Default::default()
        };
        assert!(h.scheduler.put_operation(pending).await.is_err());

        let ok_response = proto::ExecuteResponse {
            result: Some(ACTION_RESULT.clone()),
            cached_result: false,
            status: Some(proto::rpc::Status::default()),
        };
        let successful = proto::Operation {
            name: "op-s".into(),
            done: true,
            result: Some(proto::operation::Result::Response(pack_any(&ok_response))),
            ..Default::default()
        };
        assert!(h.scheduler.put_operation(successful).await.is_err());

        let errored = proto::Operation {
            name: "op-e".into(),
            done: true,
            result: Some(proto::operation::Result::Error(
                Error::Unavailable("worker lost".into()).as_rpc_status(),
            )),
            ..Default::default()
        };
        assert!(h.scheduler.put_operation(errored).await.unwrap());
    }
}
