//! Two-tier read-through cache of completed action results.
//!
//! Tier 1 is a bounded in-process cache with single-flight loads; tier 2
//! is the backplane-persisted store. Writes go to tier 2 first, so a
//! crash between the two tiers can cost a miss but never serves a result
//! that was not durably recorded.

use std::num::NonZeroUsize;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use lru::LruCache;
use tokio::sync::Mutex;
use tracing::instrument;

use quern_reapi::{proto, ActionKey};

use crate::backplane::Backplane;
use crate::errors::Error;

type LookupResult = Result<Option<Arc<proto::ActionResult>>, Error>;
type SharedLookup = Shared<BoxFuture<'static, LookupResult>>;

pub struct ActionCache {
    backplane: Arc<dyn Backplane>,
    local: Mutex<LruCache<ActionKey, SharedLookup>>,
}

impl ActionCache {
    pub fn new(backplane: Arc<dyn Backplane>, capacity: NonZeroUsize) -> Self {
        Self {
            backplane,
            local: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Read-through lookup. `None` is a genuine absence, not an error,
    /// and is not retained locally so a later write becomes visible.
    #[instrument(skip_all, fields(action.key = %key))]
    pub async fn get(&self, key: &ActionKey) -> LookupResult {
        let lookup = {
            let mut local = self.local.lock().await;
            match local.get(key) {
                Some(lookup) => lookup.clone(),
                None => {
                    let backplane = self.backplane.clone();
                    let key_owned = key.clone();
                    let lookup = async move {
                        Ok(backplane
                            .get_action_result(&key_owned)
                            .await?
                            .map(Arc::new))
                    }
                    .boxed()
                    .shared();
                    local.put(key.clone(), lookup.clone());
                    lookup
                }
            }
        };
        let result = lookup.await;
        if !matches!(result, Ok(Some(_))) {
            self.local.lock().await.pop(key);
        }
        result
    }

    /// Write-through publish: durable tier first, then tier 1.
    #[instrument(skip_all, fields(action.key = %key))]
    pub async fn put(&self, key: &ActionKey, result: proto::ActionResult) -> Result<(), Error> {
        self.backplane.put_action_result(key, result.clone()).await?;
        self.put_local(key, result).await;
        Ok(())
    }

    /// Publishes an observed result into tier 1 only. Used by the
    /// operation-watch side channel, whose results are already durable.
    pub async fn put_local(&self, key: &ActionKey, result: proto::ActionResult) {
        let resolved: SharedLookup = futures::future::ready(Ok(Some(Arc::new(result))))
            .boxed()
            .shared();
        self.local.lock().await.put(key.clone(), resolved);
    }

    /// Drops the tier-1 entry. The durable tier is never deleted here;
    /// cache-disabled actions simply never populate it.
    pub async fn invalidate(&self, key: &ActionKey) {
        self.local.lock().await.pop(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backplane::MemoryBackplane;
    use crate::fixtures::{ACTION, ACTION_RESULT};

    fn key() -> ActionKey {
        ActionKey::from(&*ACTION)
    }

    fn cache(backplane: Arc<MemoryBackplane>) -> ActionCache {
        ActionCache::new(backplane, NonZeroUsize::new(4).unwrap())
    }

    #[tokio::test]
    async fn tier_one_serves_after_durable_tier_loss() {
        let backplane = Arc::new(MemoryBackplane::new());
        let cache = cache(backplane.clone());
        cache.put(&key(), ACTION_RESULT.clone()).await.unwrap();

        backplane.remove_action_result(&key()).await;
        let served = cache.get(&key()).await.unwrap();
        assert_eq!(served.as_deref(), Some(&*ACTION_RESULT));
    }

    #[tokio::test]
    async fn a_miss_is_not_sticky() {
        let backplane = Arc::new(MemoryBackplane::new());
        let cache = cache(backplane.clone());
        assert_eq!(cache.get(&key()).await.unwrap(), None);

        backplane
            .put_action_result(&key(), ACTION_RESULT.clone())
            .await
            .unwrap();
        let served = cache.get(&key()).await.unwrap();
        assert_eq!(served.as_deref(), Some(&*ACTION_RESULT));
    }

    #[tokio::test]
    async fn failed_durable_write_never_populates_tier_one() {
        let backplane = Arc::new(MemoryBackplane::new());
        let cache = cache(backplane.clone());

        backplane.fail_action_result_puts(true);
        assert!(cache.put(&key(), ACTION_RESULT.clone()).await.is_err());

        backplane.fail_action_result_puts(false);
        assert_eq!(cache.get(&key()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn invalidate_drops_tier_one_only() {
        let backplane = Arc::new(MemoryBackplane::new());
        let cache = cache(backplane.clone());
        cache.put(&key(), ACTION_RESULT.clone()).await.unwrap();

        cache.invalidate(&key()).await;
        // The durable tier still holds the result and refills tier 1.
        let served = cache.get(&key()).await.unwrap();
        assert_eq!(served.as_deref(), Some(&*ACTION_RESULT));
    }
}
