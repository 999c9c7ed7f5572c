//! The distributed coordination contract the scheduler depends on.
//!
//! The backplane exclusively owns durable state: operation records, the
//! prequeue→queue pipeline, worker membership, blob locations, the
//! persisted action-result tier and the request blacklist. The scheduler
//! mutates that state only through these calls and never locks over it
//! locally.

use std::collections::HashSet;

use futures::stream::BoxStream;
use tonic::async_trait;

use quern_reapi::{proto, ActionKey};

use crate::errors::Error;

mod memory;
pub use memory::MemoryBackplane;

/// Watch subscription. Yields the current operation record first, then
/// every update, and ends once the operation is done.
pub type OperationStream = BoxStream<'static, Result<proto::Operation, Error>>;

/// Aggregate queue depths, as reported to operators.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BackplaneStatus {
    pub prequeue_size: usize,
    pub queue_size: usize,
    pub dispatched_size: usize,
    pub active_workers: usize,
}

#[async_trait]
pub trait Backplane: Send + Sync {
    /// Backpressure gate for [Backplane::prequeue].
    async fn can_prequeue(&self) -> Result<bool, Error>;

    /// Backpressure gate for [Backplane::queue].
    async fn can_queue(&self) -> Result<bool, Error>;

    /// Admits a raw execute request, recording its initial operation.
    async fn prequeue(
        &self,
        entry: proto::ExecuteEntry,
        operation: proto::Operation,
    ) -> Result<(), Error>;

    /// Commits a fully transformed entry to the dispatch queue, updating
    /// the operation record in the same step.
    async fn queue(
        &self,
        entry: proto::QueueEntry,
        operation: proto::Operation,
    ) -> Result<(), Error>;

    /// Claims the next prequeued entry, waiting until one is available.
    /// `None` signals a closed or interrupted dequeue, not an empty queue.
    async fn deprequeue_operation(&self) -> Result<Option<proto::ExecuteEntry>, Error>;

    /// Renews the queueing lease on a claimed entry. An entry whose lease
    /// lapses becomes eligible for another queuer.
    async fn queueing(&self, operation_name: &str) -> Result<(), Error>;

    async fn get_operation(&self, name: &str) -> Result<Option<proto::Operation>, Error>;

    /// Stores an operation record at the given stage; `false` when the
    /// record was refused (e.g. the operation is already terminal).
    async fn put_operation(
        &self,
        operation: proto::Operation,
        stage: proto::execution_stage::Value,
    ) -> Result<bool, Error>;

    /// Drops an operation record outright. Watchers observe a terminal
    /// not-found completion.
    async fn delete_operation(&self, name: &str) -> Result<(), Error>;

    /// Retires an operation from the dispatch bookkeeping after it is done.
    async fn complete_operation(&self, name: &str) -> Result<(), Error>;

    async fn watch_operation(&self, name: &str) -> Result<OperationStream, Error>;

    async fn get_action_result(&self, key: &ActionKey)
        -> Result<Option<proto::ActionResult>, Error>;

    async fn put_action_result(
        &self,
        key: &ActionKey,
        result: proto::ActionResult,
    ) -> Result<(), Error>;

    async fn get_workers(&self) -> Result<HashSet<String>, Error>;

    /// Unregisters a worker. Idempotent; `true` when this call removed it.
    async fn remove_worker(&self, name: &str, reason: &str) -> Result<bool, Error>;

    async fn get_blob_location_set(&self, digest: &proto::Digest)
        -> Result<HashSet<String>, Error>;

    /// Reindexes one blob's location set after a repair scan.
    async fn adjust_blob_locations(
        &self,
        digest: &proto::Digest,
        add: HashSet<String>,
        remove: HashSet<String>,
    ) -> Result<(), Error>;

    async fn is_blacklisted(&self, metadata: &proto::RequestMetadata) -> Result<bool, Error>;

    /// Whether a platform property set can be matched by any queue.
    async fn properties_eligible_for_queue(
        &self,
        properties: &[proto::platform::Property],
    ) -> Result<bool, Error>;

    /// Drops every blob location referencing a departed worker; returns
    /// the number of entries touched.
    async fn reindex_cas(&self, worker_name: &str) -> Result<usize, Error>;

    /// Operation names whose request metadata matches the filter.
    async fn find_operations(&self, invocation_id: &str) -> Result<Vec<String>, Error>;

    async fn operations_status(&self) -> Result<BackplaneStatus, Error>;

    async fn get_client_start_time(
        &self,
        client_key: &str,
    ) -> Result<Option<prost_types::Timestamp>, Error>;
}
