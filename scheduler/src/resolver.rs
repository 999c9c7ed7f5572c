//! Digest-addressed content resolution over the worker fleet.
//!
//! Parsed Directory/Command/Action blobs are held in bounded per-kind
//! caches with single-flight loads, so concurrent resolutions of one
//! digest issue one fetch. Distributed fetches fan out over a shuffled
//! candidate list one worker at a time, with the failover policy
//! implemented in [failover].

use std::collections::{HashSet, VecDeque};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared};
use lru::LruCache;
use prost::Message;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use quern_reapi::proto;

use crate::backplane::Backplane;
use crate::config::SchedulerConfig;
use crate::errors::{Code, Error};
use crate::workers::WorkerPool;

type LoadResult<M> = Result<Option<Arc<M>>, Error>;
type SharedLoad<M> = Shared<BoxFuture<'static, LoadResult<M>>>;

/// Bounded digest-keyed cache with load-once semantics. A resolved
/// not-found is a cached sentinel; a failed load is evicted so a later
/// call may retry.
struct LoadingCache<M> {
    entries: Mutex<LruCache<proto::Digest, SharedLoad<M>>>,
}

impl<M: Send + Sync + 'static> LoadingCache<M> {
    fn with_capacity(capacity: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    async fn get_or_load(
        &self,
        digest: &proto::Digest,
        load: impl FnOnce() -> BoxFuture<'static, LoadResult<M>>,
    ) -> LoadResult<M> {
        let shared = {
            let mut entries = self.entries.lock().await;
            match entries.get(digest) {
                Some(shared) => shared.clone(),
                None => {
                    let shared = load().shared();
                    entries.put(digest.clone(), shared.clone());
                    shared
                }
            }
        };
        let result = shared.await;
        if result.is_err() {
            self.entries.lock().await.pop(digest);
        }
        result
    }
}

/// What to do with the current candidate worker after a failed call.
enum Failover {
    /// Unregister the worker and try the next candidate.
    RemoveAndContinue,
    /// Requeue the worker at the back of the candidate list.
    Rotate,
    /// Surface the error; no further candidates are tried.
    Abort,
}

fn failover(error: &Error) -> Failover {
    match error.code() {
        Code::Unavailable | Code::Unimplemented => Failover::RemoveAndContinue,
        Code::DeadlineExceeded | Code::Cancelled => Failover::Abort,
        code if code.is_retriable() => Failover::Rotate,
        _ => Failover::Abort,
    }
}

pub struct Resolver {
    backplane: Arc<dyn Backplane>,
    pool: Arc<WorkerPool>,
    fetch_timeout: Duration,
    directories: LoadingCache<proto::Directory>,
    commands: LoadingCache<proto::Command>,
    actions: LoadingCache<proto::Action>,
}

impl Resolver {
    pub fn new(
        backplane: Arc<dyn Backplane>,
        pool: Arc<WorkerPool>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            backplane,
            pool,
            fetch_timeout: config.blob_fetch_timeout(),
            directories: LoadingCache::with_capacity(config.resolver_cache_capacity),
            commands: LoadingCache::with_capacity(config.resolver_cache_capacity),
            actions: LoadingCache::with_capacity(config.resolver_cache_capacity),
        }
    }

    /// Narrows `digests` down to the subset no queried worker holds.
    /// Zero-length digests are trivially present and never queried.
    #[instrument(skip_all, fields(digests.len = digests.len()))]
    pub async fn find_missing_blobs(
        &self,
        digests: Vec<proto::Digest>,
        metadata: &proto::RequestMetadata,
    ) -> Result<Vec<proto::Digest>, Error> {
        let digests: Vec<proto::Digest> =
            digests.into_iter().filter(|d| !d.is_empty()).collect();
        if digests.is_empty() {
            return Ok(vec![]);
        }
        tokio::time::timeout(
            self.fetch_timeout,
            self.find_missing_on_workers(digests, metadata),
        )
        .await
        .map_err(|_| Error::DeadlineExceeded("findMissingBlobs".into()))?
    }

    async fn find_missing_on_workers(
        &self,
        mut missing: Vec<proto::Digest>,
        metadata: &proto::RequestMetadata,
    ) -> Result<Vec<proto::Digest>, Error> {
        let mut candidates = self.pool.shuffled_candidates(HashSet::new()).await?;
        while let Some(worker) = candidates.pop_front() {
            let outcome = match self.pool.stub(&worker).await {
                Ok(stub) => stub.find_missing_blobs(missing.clone(), metadata).await,
                Err(error) => Err(error),
            };
            match outcome {
                Ok(still_missing) => {
                    missing = still_missing;
                    if missing.is_empty() {
                        break;
                    }
                }
                Err(error) => match failover(&error) {
                    Failover::RemoveAndContinue => {
                        self.pool
                            .remove_malfunctioning(&worker, &error.to_string())
                            .await;
                    }
                    Failover::Rotate => candidates.push_back(worker),
                    Failover::Abort => return Err(error),
                },
            }
        }
        Ok(missing)
    }

    /// Fetches a blob from a worker known to hold it, failing over across
    /// the recorded location set.
    #[instrument(skip_all, fields(blob.digest = %digest))]
    pub async fn get_blob(
        &self,
        digest: &proto::Digest,
        metadata: &proto::RequestMetadata,
    ) -> Result<Bytes, Error> {
        if digest.is_empty() {
            return Ok(Bytes::new());
        }
        tokio::time::timeout(self.fetch_timeout, self.fetch_blob(digest, metadata))
            .await
            .map_err(|_| Error::DeadlineExceeded(format!("getBlob {}", digest)))?
    }

    async fn fetch_blob(
        &self,
        digest: &proto::Digest,
        metadata: &proto::RequestMetadata,
    ) -> Result<Bytes, Error> {
        let mut locations = self.backplane.get_blob_location_set(digest).await?;
        let mut corrected = false;
        if locations.is_empty() {
            locations = self.correct_missing_blob(digest, metadata).await?;
            corrected = true;
            if locations.is_empty() {
                return Err(Error::BlobNotFound(digest.clone()));
            }
        }
        let mut candidates = self.pool.shuffled_candidates(locations).await?;
        while let Some(worker) = candidates.pop_front() {
            let outcome = match self.pool.stub(&worker).await {
                Ok(stub) => stub.get_blob(digest, metadata).await,
                Err(error) => Err(error),
            };
            match outcome {
                Ok(content) => return Ok(content),
                Err(error) if error.code() == Code::NotFound => {
                    // The location index lied. Repair it once, picking up
                    // any holders the index had not recorded.
                    if !corrected {
                        corrected = true;
                        for holder in self.correct_missing_blob(digest, metadata).await? {
                            if holder != worker && !candidates.contains(&holder) {
                                candidates.push_back(holder);
                            }
                        }
                    }
                }
                Err(error) => match failover(&error) {
                    Failover::RemoveAndContinue => {
                        self.pool
                            .remove_malfunctioning(&worker, &error.to_string())
                            .await;
                    }
                    Failover::Rotate => candidates.push_back(worker),
                    Failover::Abort => return Err(error),
                },
            }
        }
        Err(Error::BlobNotFound(digest.clone()))
    }

    /// Rescans the live worker set for one blob and reindexes its location
    /// set accordingly. Returns the holders found.
    #[instrument(skip_all, fields(blob.digest = %digest))]
    async fn correct_missing_blob(
        &self,
        digest: &proto::Digest,
        metadata: &proto::RequestMetadata,
    ) -> Result<HashSet<String>, Error> {
        let workers = self.backplane.get_workers().await?;
        let mut holders = HashSet::new();
        let mut absent = HashSet::new();
        for worker in workers {
            let outcome = match self.pool.stub(&worker).await {
                Ok(stub) => stub.find_missing_blobs(vec![digest.clone()], metadata).await,
                Err(error) => Err(error),
            };
            match outcome {
                Ok(missing) if missing.is_empty() => {
                    holders.insert(worker);
                }
                Ok(_) => {
                    absent.insert(worker);
                }
                // A worker that cannot answer stays in the index as-is.
                Err(error) => debug!(worker.name = %worker, %error, "location scan failed"),
            }
        }
        if !holders.is_empty() || !absent.is_empty() {
            self.backplane
                .adjust_blob_locations(digest, holders.clone(), absent)
                .await?;
        }
        Ok(holders)
    }

    pub async fn expect_action(
        self: &Arc<Self>,
        digest: &proto::Digest,
        metadata: &proto::RequestMetadata,
    ) -> Result<Option<Arc<proto::Action>>, Error> {
        self.expect_message(&self.actions, digest, metadata).await
    }

    pub async fn expect_command(
        self: &Arc<Self>,
        digest: &proto::Digest,
        metadata: &proto::RequestMetadata,
    ) -> Result<Option<Arc<proto::Command>>, Error> {
        self.expect_message(&self.commands, digest, metadata).await
    }

    pub async fn expect_directory(
        self: &Arc<Self>,
        digest: &proto::Digest,
        metadata: &proto::RequestMetadata,
    ) -> Result<Option<Arc<proto::Directory>>, Error> {
        self.expect_message(&self.directories, digest, metadata).await
    }

    async fn expect_message<M>(
        self: &Arc<Self>,
        cache: &LoadingCache<M>,
        digest: &proto::Digest,
        metadata: &proto::RequestMetadata,
    ) -> Result<Option<Arc<M>>, Error>
    where
        M: Message + Default + Send + Sync + 'static,
    {
        // Empty-length digests resolve to the canonical empty message
        // without touching a worker or the cache.
        if digest.is_empty() {
            return Ok(Some(Arc::new(M::default())));
        }
        digest.verify()?;
        let this = self.clone();
        let digest_owned = digest.clone();
        let metadata_owned = metadata.clone();
        cache
            .get_or_load(digest, move || {
                async move {
                    match this.get_blob(&digest_owned, &metadata_owned).await {
                        Ok(content) => Ok(Some(Arc::new(M::decode(content)?))),
                        Err(error) if error.code() == Code::NotFound => Ok(None),
                        Err(error) => Err(error),
                    }
                }
                .boxed()
            })
            .await
    }

    /// Materializes the full input tree below `root_digest`, breadth-first
    /// with digest-level deduplication. Directories that cannot be found
    /// are left out of the map; the validator reports them as missing.
    #[instrument(skip_all, fields(tree.root = %root_digest))]
    pub async fn get_tree(
        self: &Arc<Self>,
        root_digest: &proto::Digest,
        metadata: &proto::RequestMetadata,
    ) -> Result<proto::Tree, Error> {
        let mut tree = proto::Tree {
            root_digest: Some(root_digest.clone()),
            directories: Default::default(),
        };
        let mut visited: HashSet<proto::Digest> = HashSet::new();
        let mut frontier = VecDeque::from([root_digest.clone()]);
        while let Some(digest) = frontier.pop_front() {
            if !visited.insert(digest.clone()) {
                continue;
            }
            match self.expect_directory(&digest, metadata).await? {
                Some(directory) => {
                    for child in &directory.directories {
                        if let Some(child_digest) = &child.digest {
                            frontier.push_back(child_digest.clone());
                        }
                    }
                    tree.directories
                        .insert(digest.hash.clone(), (*directory).clone());
                }
                None => warn!(directory.digest = %digest, "input directory not found"),
            }
        }
        Ok(tree)
    }

    /// Uploads a blob to one random live worker and returns its digest.
    #[instrument(skip_all, fields(blob.size = data.len()))]
    pub async fn upload_blob(
        &self,
        data: Bytes,
        metadata: &proto::RequestMetadata,
    ) -> Result<proto::Digest, Error> {
        let digest = proto::Digest::of_blob(&data);
        let worker = self
            .pool
            .random_worker()
            .await?
            .ok_or_else(|| Error::Unavailable("no workers available".into()))?;
        let stub = self.pool.stub(&worker).await?;
        tokio::time::timeout(self.fetch_timeout, stub.put_blob(&digest, data, metadata))
            .await
            .map_err(|_| Error::DeadlineExceeded(format!("upload {}", digest)))??;
        Ok(digest)
    }
}
