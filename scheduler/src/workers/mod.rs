//! Worker stubs and the health bookkeeping around them.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use rand::seq::SliceRandom;
use tokio::sync::Mutex;
use tonic::async_trait;
use tracing::{instrument, warn};

use quern_reapi::proto;

use crate::backplane::Backplane;
use crate::errors::Error;

mod grpc;
pub use grpc::GrpcWorker;

/// The RPC surface consumed on each worker.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Returns the subset of `digests` the worker does not hold.
    async fn find_missing_blobs(
        &self,
        digests: Vec<proto::Digest>,
        metadata: &proto::RequestMetadata,
    ) -> Result<Vec<proto::Digest>, Error>;

    async fn get_blob(
        &self,
        digest: &proto::Digest,
        metadata: &proto::RequestMetadata,
    ) -> Result<Bytes, Error>;

    async fn put_blob(
        &self,
        digest: &proto::Digest,
        data: Bytes,
        metadata: &proto::RequestMetadata,
    ) -> Result<(), Error>;
}

/// Builds a stub for a worker name. Injected so tests can substitute
/// scripted workers for real connections.
pub type WorkerFactory = Box<dyn Fn(&str) -> Result<Arc<dyn Worker>, Error> + Send + Sync>;

/// Live worker membership plus a cache of connected stubs. Membership is
/// owned by the backplane and fetched per operation; only the connection
/// handles live here.
pub struct WorkerPool {
    backplane: Arc<dyn Backplane>,
    factory: WorkerFactory,
    stubs: Mutex<HashMap<String, Arc<dyn Worker>>>,
}

impl WorkerPool {
    pub fn new(backplane: Arc<dyn Backplane>, factory: WorkerFactory) -> Self {
        Self {
            backplane,
            factory,
            stubs: Mutex::new(HashMap::new()),
        }
    }

    pub async fn stub(&self, name: &str) -> Result<Arc<dyn Worker>, Error> {
        let mut stubs = self.stubs.lock().await;
        if let Some(stub) = stubs.get(name) {
            return Ok(stub.clone());
        }
        let stub = (self.factory)(name)?;
        stubs.insert(name.to_string(), stub.clone());
        Ok(stub)
    }

    /// Unregisters a worker that answered UNAVAILABLE or UNIMPLEMENTED and
    /// drops its stub. Best-effort and idempotent.
    #[instrument(skip(self))]
    pub async fn remove_malfunctioning(&self, name: &str, reason: &str) {
        if let Err(error) = self.backplane.remove_worker(name, reason).await {
            warn!(worker.name = %name, %error, "failed to unregister worker");
        }
        self.stubs.lock().await.remove(name);
    }

    /// Candidate deque for a blob operation: the preferred location set if
    /// non-empty, the full live set otherwise, shuffled to spread load.
    pub async fn shuffled_candidates(
        &self,
        preferred: HashSet<String>,
    ) -> Result<VecDeque<String>, Error> {
        let names = if preferred.is_empty() {
            self.backplane.get_workers().await?
        } else {
            preferred
        };
        let mut candidates: Vec<String> = names.into_iter().collect();
        candidates.shuffle(&mut rand::thread_rng());
        Ok(candidates.into())
    }

    /// One random live worker, for the write path.
    pub async fn random_worker(&self) -> Result<Option<String>, Error> {
        let workers: Vec<String> = self.backplane.get_workers().await?.into_iter().collect();
        Ok(workers.choose(&mut rand::thread_rng()).cloned())
    }
}
