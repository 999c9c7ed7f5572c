use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use async_stream::stream;
use tokio::sync::{broadcast, Mutex, Notify};
use tonic::async_trait;
use tracing::instrument;

use quern_reapi::{proto, ActionKey};

use super::{Backplane, BackplaneStatus, OperationStream};
use crate::errors::Error;

const WATCH_CHANNEL_CAPACITY: usize = 16;

#[derive(Default)]
struct State {
    operations: HashMap<String, proto::Operation>,
    entries: HashMap<String, proto::ExecuteEntry>,
    prequeue: VecDeque<proto::ExecuteEntry>,
    queue: Vec<proto::QueueEntry>,
    queueing: HashSet<String>,
    action_results: HashMap<ActionKey, proto::ActionResult>,
    workers: HashSet<String>,
    blob_locations: HashMap<proto::Digest, HashSet<String>>,
    blacklisted_invocations: HashSet<String>,
    eligible_properties: Option<HashSet<String>>,
    client_start_times: HashMap<String, prost_types::Timestamp>,
    watchers: HashMap<String, broadcast::Sender<proto::Operation>>,
    prequeue_capacity: usize,
    queue_capacity: usize,
    closed: bool,
}

/// Process-local [Backplane]. The durable-state contract is the same one a
/// networked implementation provides, which is what makes it usable as the
/// test double for the whole scheduling core.
pub struct MemoryBackplane {
    state: Mutex<State>,
    prequeued: Notify,
    fail_action_result_puts: AtomicBool,
}

impl Default for MemoryBackplane {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackplane {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                prequeue_capacity: usize::MAX,
                queue_capacity: usize::MAX,
                ..Default::default()
            }),
            prequeued: Notify::new(),
            fail_action_result_puts: AtomicBool::new(false),
        }
    }

    pub async fn add_worker(&self, name: impl Into<String>) {
        self.state.lock().await.workers.insert(name.into());
    }

    pub async fn add_blob_location(&self, digest: proto::Digest, worker: impl Into<String>) {
        self.state
            .lock()
            .await
            .blob_locations
            .entry(digest)
            .or_default()
            .insert(worker.into());
    }

    pub async fn blacklist_invocation(&self, tool_invocation_id: impl Into<String>) {
        self.state
            .lock()
            .await
            .blacklisted_invocations
            .insert(tool_invocation_id.into());
    }

    /// Restricts queue-eligible platform property names to `names`.
    pub async fn set_eligible_properties(&self, names: HashSet<String>) {
        self.state.lock().await.eligible_properties = Some(names);
    }

    pub async fn set_prequeue_capacity(&self, capacity: usize) {
        self.state.lock().await.prequeue_capacity = capacity;
    }

    pub async fn set_queue_capacity(&self, capacity: usize) {
        self.state.lock().await.queue_capacity = capacity;
    }

    pub async fn set_client_start_time(&self, key: impl Into<String>, at: prost_types::Timestamp) {
        self.state.lock().await.client_start_times.insert(key.into(), at);
    }

    pub async fn remove_action_result(&self, key: &ActionKey) {
        self.state.lock().await.action_results.remove(key);
    }

    /// Makes every subsequent put_action_result fail, for exercising the
    /// durable-tier-first write ordering.
    pub fn fail_action_result_puts(&self, fail: bool) {
        self.fail_action_result_puts.store(fail, Ordering::Relaxed);
    }

    /// Unblocks pending dequeues with a `None` result.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.prequeued.notify_waiters();
    }

    pub async fn queue_entries(&self) -> Vec<proto::QueueEntry> {
        self.state.lock().await.queue.clone()
    }

    pub async fn queueing_leases(&self) -> HashSet<String> {
        self.state.lock().await.queueing.clone()
    }

    fn publish(state: &mut State, operation: &proto::Operation) {
        if let Some(sender) = state.watchers.get(&operation.name) {
            // Receivers may be gone; publication is best-effort.
            let _ = sender.send(operation.clone());
        }
    }
}

#[async_trait]
impl Backplane for MemoryBackplane {
    async fn can_prequeue(&self) -> Result<bool, Error> {
        let state = self.state.lock().await;
        Ok(state.prequeue.len() < state.prequeue_capacity)
    }

    async fn can_queue(&self) -> Result<bool, Error> {
        let state = self.state.lock().await;
        Ok(state.queue.len() < state.queue_capacity)
    }

    #[instrument(skip_all, fields(operation.name = %operation.name))]
    async fn prequeue(
        &self,
        entry: proto::ExecuteEntry,
        operation: proto::Operation,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        state.entries.insert(entry.operation_name.clone(), entry.clone());
        state.prequeue.push_back(entry);
        Self::publish(&mut state, &operation);
        state.operations.insert(operation.name.clone(), operation);
        drop(state);
        self.prequeued.notify_one();
        Ok(())
    }

    #[instrument(skip_all, fields(operation.name = %operation.name))]
    async fn queue(
        &self,
        entry: proto::QueueEntry,
        operation: proto::Operation,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        state.queueing.remove(&operation.name);
        // Terminal records never regress; an in-flight result landing
        // after cancellation is discarded, not queued.
        if let Some(existing) = state.operations.get(&operation.name) {
            if existing.done {
                return Ok(());
            }
        }
        if state.queue.len() >= state.queue_capacity {
            return Err(Error::ResourceExhausted("queue is full".into()));
        }
        state.queue.push(entry);
        Self::publish(&mut state, &operation);
        state.operations.insert(operation.name.clone(), operation);
        Ok(())
    }

    async fn deprequeue_operation(&self) -> Result<Option<proto::ExecuteEntry>, Error> {
        loop {
            let notified = self.prequeued.notified();
            {
                let mut state = self.state.lock().await;
                if let Some(entry) = state.prequeue.pop_front() {
                    state.queueing.insert(entry.operation_name.clone());
                    return Ok(Some(entry));
                }
                if state.closed {
                    return Ok(None);
                }
            }
            notified.await;
        }
    }

    async fn queueing(&self, operation_name: &str) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        state.queueing.insert(operation_name.to_string());
        Ok(())
    }

    async fn get_operation(&self, name: &str) -> Result<Option<proto::Operation>, Error> {
        Ok(self.state.lock().await.operations.get(name).cloned())
    }

    async fn put_operation(
        &self,
        operation: proto::Operation,
        _stage: proto::execution_stage::Value,
    ) -> Result<bool, Error> {
        let mut state = self.state.lock().await;
        // Terminal records never regress; a completed (notably cancelled)
        // operation refuses further mutation.
        if let Some(existing) = state.operations.get(&operation.name) {
            if existing.done {
                return Ok(false);
            }
        }
        Self::publish(&mut state, &operation);
        state.operations.insert(operation.name.clone(), operation);
        Ok(true)
    }

    async fn delete_operation(&self, name: &str) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        state.operations.remove(name);
        state.entries.remove(name);
        state.queueing.remove(name);
        let tombstone = proto::Operation {
            name: name.to_string(),
            done: true,
            result: Some(proto::operation::Result::Error(
                Error::OperationNotFound(name.to_string()).as_rpc_status(),
            )),
            ..Default::default()
        };
        Self::publish(&mut state, &tombstone);
        state.watchers.remove(name);
        Ok(())
    }

    async fn complete_operation(&self, name: &str) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        state.queueing.remove(name);
        state
            .queue
            .retain(|e| e.execute_entry.as_ref().map(|x| x.operation_name.as_str()) != Some(name));
        Ok(())
    }

    async fn watch_operation(&self, name: &str) -> Result<OperationStream, Error> {
        let (current, mut receiver) = {
            let mut state = self.state.lock().await;
            let current = state.operations.get(name).cloned();
            let sender = state
                .watchers
                .entry(name.to_string())
                .or_insert_with(|| broadcast::channel(WATCH_CHANNEL_CAPACITY).0);
            (current, sender.subscribe())
        };
        Ok(Box::pin(stream! {
            if let Some(operation) = current {
                let done = operation.done;
                yield Ok(operation);
                if done {
                    return;
                }
            }
            loop {
                match receiver.recv().await {
                    Ok(operation) => {
                        let done = operation.done;
                        yield Ok(operation);
                        if done {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }))
    }

    async fn get_action_result(
        &self,
        key: &ActionKey,
    ) -> Result<Option<proto::ActionResult>, Error> {
        Ok(self.state.lock().await.action_results.get(key).cloned())
    }

    async fn put_action_result(
        &self,
        key: &ActionKey,
        result: proto::ActionResult,
    ) -> Result<(), Error> {
        if self.fail_action_result_puts.load(Ordering::Relaxed) {
            return Err(Error::Backplane("action result store unavailable".into()));
        }
        self.state.lock().await.action_results.insert(key.clone(), result);
        Ok(())
    }

    async fn get_workers(&self) -> Result<HashSet<String>, Error> {
        Ok(self.state.lock().await.workers.clone())
    }

    async fn remove_worker(&self, name: &str, reason: &str) -> Result<bool, Error> {
        let mut state = self.state.lock().await;
        let removed = state.workers.remove(name);
        if removed {
            tracing::debug!(worker.name = %name, %reason, "removed worker");
        }
        Ok(removed)
    }

    async fn get_blob_location_set(
        &self,
        digest: &proto::Digest,
    ) -> Result<HashSet<String>, Error> {
        let state = self.state.lock().await;
        // Locations of departed workers are not valid candidates.
        Ok(state
            .blob_locations
            .get(digest)
            .map(|locations| locations.intersection(&state.workers).cloned().collect())
            .unwrap_or_default())
    }

    async fn adjust_blob_locations(
        &self,
        digest: &proto::Digest,
        add: HashSet<String>,
        remove: HashSet<String>,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        let locations = state.blob_locations.entry(digest.clone()).or_default();
        locations.extend(add);
        locations.retain(|w| !remove.contains(w));
        Ok(())
    }

    async fn is_blacklisted(&self, metadata: &proto::RequestMetadata) -> Result<bool, Error> {
        Ok(self
            .state
            .lock()
            .await
            .blacklisted_invocations
            .contains(&metadata.tool_invocation_id))
    }

    async fn properties_eligible_for_queue(
        &self,
        properties: &[proto::platform::Property],
    ) -> Result<bool, Error> {
        let state = self.state.lock().await;
        match &state.eligible_properties {
            None => Ok(true),
            Some(eligible) => Ok(properties.iter().all(|p| eligible.contains(&p.name))),
        }
    }

    async fn reindex_cas(&self, worker_name: &str) -> Result<usize, Error> {
        let mut state = self.state.lock().await;
        let mut touched = 0;
        for locations in state.blob_locations.values_mut() {
            if locations.remove(worker_name) {
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn find_operations(&self, invocation_id: &str) -> Result<Vec<String>, Error> {
        let state = self.state.lock().await;
        Ok(state
            .entries
            .values()
            .filter(|entry| {
                entry
                    .request_metadata
                    .as_ref()
                    .is_some_and(|m| m.tool_invocation_id == invocation_id)
            })
            .map(|entry| entry.operation_name.clone())
            .collect())
    }

    async fn operations_status(&self) -> Result<BackplaneStatus, Error> {
        let state = self.state.lock().await;
        Ok(BackplaneStatus {
            prequeue_size: state.prequeue.len(),
            queue_size: state.queue.len(),
            dispatched_size: state.queueing.len(),
            active_workers: state.workers.len(),
        })
    }

    async fn get_client_start_time(
        &self,
        client_key: &str,
    ) -> Result<Option<prost_types::Timestamp>, Error> {
        Ok(self.state.lock().await.client_start_times.get(client_key).cloned())
    }
}
