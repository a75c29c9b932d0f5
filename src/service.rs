use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::{
    assembler,
    cache::FeedCache,
    clock::Clock,
    config::FeedConfig,
    error::FeedError,
    paginator,
    profile::ProfileCache,
    providers::{FetchContext, ProviderRegistry},
    scoring::{OwnerContext, ScoringConfig},
    stores::{Stores, TaxonomyKind},
    types::{
        Feed, FeedEntry, FeedKey, FeedKind, FeedPreferences, FeedResponse, FeedType, PostSnapshot,
    },
    updater::{FanoutReport, IncrementalUpdater},
};

/// Entry point of the ranking core: reads, refreshes, preferences, and new
/// post notifications.
pub struct FeedService {
    stores: Stores,
    registry: ProviderRegistry,
    cache: Arc<FeedCache>,
    profiles: ProfileCache,
    updater: IncrementalUpdater,
    scoring: ScoringConfig,
    config: FeedConfig,
    clock: Arc<dyn Clock>,
}

impl FeedService {
    pub fn new(
        stores: Stores,
        config: FeedConfig,
        scoring: ScoringConfig,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let registry = ProviderRegistry::new(stores.posts.clone());
        Self::with_registry(stores, registry, config, scoring, clock)
    }

    pub fn with_registry(
        stores: Stores,
        registry: ProviderRegistry,
        config: FeedConfig,
        scoring: ScoringConfig,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let cache = FeedCache::new(stores.feeds.clone(), &config, clock.clone());
        let profiles = ProfileCache::new(
            stores.posts.clone(),
            config.profile.clone(),
            config
                .refresh_interval
                .to_std()
                .unwrap_or(std::time::Duration::from_secs(3600)),
            config.hot_cache_capacity,
        );
        let updater = IncrementalUpdater::new(
            cache.clone(),
            &stores,
            profiles.clone(),
            scoring.clone(),
            config.clone(),
            clock.clone(),
        );

        Arc::new(Self {
            stores,
            registry,
            cache,
            profiles,
            updater,
            scoring,
            config,
            clock,
        })
    }

    pub async fn get_feed(
        self: &Arc<Self>,
        owner_id: &str,
        feed_type: FeedType,
        page: usize,
        page_size: usize,
        force_refresh: bool,
    ) -> Result<FeedResponse> {
        if let Err(e) = self.check_filter(&feed_type).await? {
            debug!(owner_id, "{}; serving empty feed", e);
            return Ok(Self::respond(None, page, page_size));
        }

        let key = FeedKey::new(owner_id, feed_type);
        let now = self.clock.now();
        let service = Arc::clone(self);
        let recompute_key = key.clone();
        let feed = self
            .cache
            .get_or_refresh(&key, now, force_refresh, move || async move {
                service.recompute(recompute_key).await
            })
            .await?;

        Ok(Self::respond(feed.as_deref(), page, page_size))
    }

    pub async fn refresh_feed(
        self: &Arc<Self>,
        owner_id: &str,
        feed_type: FeedType,
    ) -> Result<FeedResponse> {
        self.get_feed(owner_id, feed_type, 0, paginator::DEFAULT_PAGE_SIZE, true)
            .await
    }

    /// Fire-and-forget fan-out of a new post.
    pub fn notify_new_post(self: &Arc<Self>, post: PostSnapshot) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = service.fan_out(&post).await {
                warn!(post_id = %post.id, "Fan-out aborted: {:#}", e);
            }
        });
    }

    pub async fn fan_out(&self, post: &PostSnapshot) -> Result<FanoutReport> {
        self.updater.fan_out(post).await
    }

    pub async fn get_preferences(&self, owner_id: &str, kind: FeedKind) -> Result<FeedPreferences> {
        Ok(self
            .stores
            .feeds
            .load_preferences(owner_id, kind)
            .await?
            .unwrap_or_else(|| self.config.default_preferences()))
    }

    /// Persists preferences and marks the owner's feeds of this kind for
    /// recompute.
    pub async fn update_preferences(
        &self,
        owner_id: &str,
        kind: FeedKind,
        preferences: FeedPreferences,
    ) -> Result<FeedPreferences> {
        preferences.validate()?;
        self.stores
            .feeds
            .save_preferences(owner_id, kind, &preferences)
            .await?;
        let invalidated = self.stores.feeds.feed_keys(owner_id, kind).await?;
        for key in &invalidated {
            self.cache.invalidate(key, &preferences).await?;
        }
        info!(
            owner_id,
            feed_type = %kind,
            invalidated = invalidated.len(),
            enabled = preferences.enabled,
            "Updated feed preferences"
        );
        Ok(preferences)
    }

    /// `Err` inside `Ok` means the filter id is unknown, which callers treat
    /// as an empty feed.
    async fn check_filter(&self, feed_type: &FeedType) -> Result<Result<(), FeedError>> {
        let (kind, id) = match feed_type {
            FeedType::Category(id) => (TaxonomyKind::Category, id),
            FeedType::Topic(id) => (TaxonomyKind::Topic, id),
            FeedType::Hashtag(id) => (TaxonomyKind::Hashtag, id),
            _ => return Ok(Ok(())),
        };
        if self.stores.taxonomy.exists(kind, id).await? {
            Ok(Ok(()))
        } else {
            Ok(Err(FeedError::InvalidFilter {
                kind: kind.as_str(),
                id: id.clone(),
            }))
        }
    }

    fn respond(feed: Option<&Feed>, page: usize, page_size: usize) -> FeedResponse {
        let entries: &[FeedEntry] = feed.map(|feed| feed.entries.as_slice()).unwrap_or_default();
        let (entries, pagination) = paginator::page(entries, page, page_size);
        FeedResponse {
            entries,
            last_updated: feed.map(|feed| feed.last_updated),
            next_update: feed.map(|feed| feed.next_update),
            degraded: feed.is_some_and(|feed| feed.health.degraded),
            pagination,
        }
    }

    async fn recompute(&self, key: FeedKey) -> Option<Arc<Feed>> {
        let started = self.clock.now();
        info!(feed = %key, "Recomputing feed");

        let written = match self.assemble_entries(&key, started).await {
            Ok((entries, preferences)) => {
                let count = entries.len();
                let written = self
                    .cache
                    .update(&key, |current| {
                        Some(self.apply_recompute(&key, current, entries, preferences, started))
                    })
                    .await;
                if written.is_ok() {
                    info!(feed = %key, entries = count, "Recomputed feed");
                }
                written
            }
            Err(source) => {
                let failure = FeedError::RecomputeFailure {
                    key: key.to_string(),
                    source,
                };
                warn!("{:#}; keeping last good entries", failure);
                self.cache.mark_failed(&key, started).await
            }
        };

        match written {
            Ok(feed) => feed,
            Err(e) => {
                warn!(feed = %key, "Failed to persist feed: {:#}", e);
                None
            }
        }
    }

    /// Installs a recompute result. Entries pushed incrementally after the
    /// recompute started are carried over.
    fn apply_recompute(
        &self,
        key: &FeedKey,
        current: Option<Feed>,
        entries: Vec<FeedEntry>,
        preferences: FeedPreferences,
        started: DateTime<Utc>,
    ) -> Feed {
        let mut feed = current.unwrap_or_else(|| {
            Feed::new(key, preferences.clone(), started, self.config.refresh_interval)
        });
        let pushed: Vec<FeedEntry> = feed
            .entries
            .iter()
            .filter(|entry| entry.added_at > started)
            .filter(|entry| !entries.iter().any(|e| e.post_id == entry.post_id))
            .cloned()
            .collect();

        feed.preferences = preferences;
        feed.replace_entries(entries, started, self.config.refresh_interval);
        for entry in pushed {
            feed.upsert(entry, self.config.max_entries);
        }
        feed
    }

    async fn assemble_entries(
        &self,
        key: &FeedKey,
        now: DateTime<Utc>,
    ) -> Result<(Vec<FeedEntry>, FeedPreferences)> {
        let owner_id = key.owner_id.as_str();
        let preferences = self.get_preferences(owner_id, key.feed_type.kind()).await?;
        let followees = self.stores.follows.get_active_followees(owner_id).await?;
        let profile = self.profiles.get(owner_id, now).await?;

        let owner = OwnerContext {
            owner_id: owner_id.to_string(),
            active_followees: followees.into_iter().collect(),
            profile: (*profile).clone(),
            now,
        };
        let fetch = FetchContext {
            owner: &owner,
            feed_type: &key.feed_type,
            since: preferences.oldest_admitted(now),
            limit: self.config.provider_fetch_limit,
        };
        let lists = self
            .registry
            .fetch_all(&fetch, self.config.provider_deadline)
            .await;

        let entries = assembler::assemble(
            &lists,
            &preferences,
            &owner,
            &self.scoring,
            self.config.max_entries,
        );
        Ok((entries, preferences))
    }

    pub fn stats(&self) -> String {
        format!(
            "hot_feeds={} profiles_resident={}",
            self.cache.hot_len(),
            self.profiles.resident()
        )
    }
}
