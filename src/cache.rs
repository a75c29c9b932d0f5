//! Feed cache and staleness control.
//!
//! Feeds live in the `FeedStore` with a moka hot layer in front. Each feed key
//! moves between two states:
//! - FRESH (`now < next_update`): served as stored.
//! - STALE: the first caller takes the recompute lease and runs the
//!   recompute on a detached task; everyone else keeps reading the stale
//!   entries. Forced refreshes, and readers with nothing cached yet, join
//!   the in-flight recompute instead of starting another.
//!
//! Reads never wait on a write lock. Writes to one key (recompute results,
//! incremental upserts, failure marks, invalidations) are serialized by a
//! per-key mutex.

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use moka::future::Cache;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use crate::{
    clock::Clock,
    config::FeedConfig,
    error::FeedError,
    stores::FeedStore,
    types::{Feed, FeedKey, FeedPreferences, FeedStats},
};

type Recompute = Shared<BoxFuture<'static, Option<Arc<Feed>>>>;

enum Lease {
    Acquired(Recompute),
    Held(Recompute),
}

/// Removes the in-flight marker when the recompute task ends, even by panic.
struct LeaseGuard {
    cache: Arc<FeedCache>,
    key: FeedKey,
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        let mut inflight = self.cache.inflight.lock().unwrap_or_else(|e| e.into_inner());
        inflight.remove(&self.key);
    }
}

pub struct FeedCache {
    store: Arc<dyn FeedStore>,
    hot: Cache<FeedKey, Arc<Feed>>,
    write_locks: Cache<FeedKey, Arc<tokio::sync::Mutex<()>>>,
    inflight: Mutex<HashMap<FeedKey, Recompute>>,
    config: FeedConfig,
    clock: Arc<dyn Clock>,
}

impl FeedCache {
    pub fn new(store: Arc<dyn FeedStore>, config: &FeedConfig, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            store,
            hot: Cache::builder()
                .max_capacity(config.hot_cache_capacity)
                .time_to_idle(Duration::from_secs(30 * 60))
                .build(),
            write_locks: Cache::builder()
                .time_to_idle(Duration::from_secs(10 * 60))
                .build(),
            inflight: Mutex::new(HashMap::new()),
            config: config.clone(),
            clock,
        })
    }

    /// Current feed for `key`, if one was ever computed. A stored feed that
    /// cannot be decoded or fails validation comes back with its entries
    /// discarded and marked for recompute.
    pub async fn get(&self, key: &FeedKey) -> Result<Option<Arc<Feed>>> {
        if let Some(feed) = self.hot.get(key).await {
            return Ok(Some(feed));
        }

        let loaded = match self.store.load_feed(key).await {
            Ok(loaded) => loaded,
            Err(e) => match e.downcast_ref::<FeedError>() {
                Some(FeedError::CorruptedState { .. }) => {
                    warn!("{}; replacing row and forcing full recompute", e);
                    Some(self.discarded(key).await?)
                }
                _ => return Err(e),
            },
        };

        let Some(mut feed) = loaded else {
            return Ok(None);
        };

        if let Err(e) = feed.validate(self.config.max_entries) {
            warn!("{}; discarding entries", e);
            feed.entries.clear();
            feed.stats = FeedStats::default();
            feed.health.invalidated = true;
        }

        let feed = Arc::new(feed);
        self.hot.insert(key.clone(), Arc::clone(&feed)).await;
        Ok(Some(feed))
    }

    /// Overwrites an undecodable row with an empty feed awaiting recompute,
    /// so a failed recompute still has something to mark.
    async fn discarded(&self, key: &FeedKey) -> Result<Feed> {
        let preferences = self
            .store
            .load_preferences(&key.owner_id, key.feed_type.kind())
            .await?
            .unwrap_or_else(|| self.config.default_preferences());
        let mut feed = Feed::new(
            key,
            preferences,
            self.clock.now(),
            self.config.refresh_interval,
        );
        feed.health.invalidated = true;
        self.store.save_feed(&feed).await?;
        Ok(feed)
    }

    /// Read-modify-write of one feed under its key's write lock. `apply`
    /// receives the current feed (if any) and returns what to persist;
    /// returning `None` leaves the store untouched.
    pub async fn update<F>(&self, key: &FeedKey, apply: F) -> Result<Option<Arc<Feed>>>
    where
        F: FnOnce(Option<Feed>) -> Option<Feed>,
    {
        let lock = self
            .write_locks
            .get_with(key.clone(), async { Arc::new(tokio::sync::Mutex::new(())) })
            .await;
        let _held = lock.lock().await;

        let current = self.get(key).await?.map(|feed| (*feed).clone());
        let Some(updated) = apply(current) else {
            return Ok(None);
        };

        self.store.save_feed(&updated).await?;
        let updated = Arc::new(updated);
        self.hot.insert(key.clone(), Arc::clone(&updated)).await;
        Ok(Some(updated))
    }

    /// Records a failed recompute: last-good entries stay, the feed turns
    /// degraded and backs off. Feeds never computed are left absent.
    pub async fn mark_failed(
        &self,
        key: &FeedKey,
        now: DateTime<Utc>,
    ) -> Result<Option<Arc<Feed>>> {
        let (base, max) = (self.config.retry_base, self.config.retry_max);
        self.update(key, |current| {
            let mut feed = current?;
            feed.mark_failed(now, base, max);
            Some(feed)
        })
        .await
    }

    /// Applies new preferences and forces a recompute on the next read.
    pub async fn invalidate(&self, key: &FeedKey, preferences: &FeedPreferences) -> Result<()> {
        self.update(key, |current| {
            let mut feed = current?;
            feed.preferences = preferences.clone();
            feed.health.invalidated = true;
            Some(feed)
        })
        .await?;
        Ok(())
    }

    pub fn hot_len(&self) -> u64 {
        self.hot.entry_count()
    }

    #[cfg(test)]
    pub fn is_recomputing(&self, key: &FeedKey) -> bool {
        self.inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(key)
    }

    fn lease<F, Fut>(self: &Arc<Self>, key: &FeedKey, now: DateTime<Utc>, recompute: F) -> Lease
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Option<Arc<Feed>>> + Send + 'static,
    {
        let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(running) = inflight.get(key) {
            return Lease::Held(running.clone());
        }

        let guard = LeaseGuard {
            cache: Arc::clone(self),
            key: key.clone(),
        };
        let work = tokio::spawn(recompute());
        let cache = Arc::clone(self);
        let failed_key = key.clone();
        // Detached so that a caller going away never cancels the recompute.
        let handle = tokio::spawn(async move {
            let _guard = guard;
            match work.await {
                Ok(feed) => feed,
                Err(e) => {
                    warn!(feed = %failed_key, "Recompute task failed: {}", e);
                    cache
                        .mark_failed(&failed_key, now)
                        .await
                        .unwrap_or_else(|e| {
                            warn!(feed = %failed_key, "Failed to record failure: {:#}", e);
                            None
                        })
                }
            }
        });
        let shared = async move { handle.await.ok().flatten() }.boxed().shared();
        inflight.insert(key.clone(), shared.clone());
        Lease::Acquired(shared)
    }

    /// Serves `key` according to its staleness, running `recompute` when this
    /// caller wins the lease.
    pub async fn get_or_refresh<F, Fut>(
        self: &Arc<Self>,
        key: &FeedKey,
        now: DateTime<Utc>,
        force: bool,
        recompute: F,
    ) -> Result<Option<Arc<Feed>>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Option<Arc<Feed>>> + Send + 'static,
    {
        let current = self.get(key).await?;
        let due = match &current {
            None => true,
            Some(feed) => force || (feed.is_stale(now) && feed.retry_due(now)),
        };
        if !due {
            debug!(feed = %key, "Serving fresh feed");
            return Ok(current);
        }

        match self.lease(key, now, recompute) {
            Lease::Acquired(running) => Ok(running.await.or(current)),
            Lease::Held(running) if force || current.is_none() => {
                debug!(feed = %key, "Joining in-flight recompute");
                Ok(running.await.or(current))
            }
            Lease::Held(_) => {
                debug!(feed = %key, "Recompute in flight, serving stale feed");
                Ok(current)
            }
        }
    }
}
