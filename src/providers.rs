use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::{
    error::FeedError,
    scoring::OwnerContext,
    stores::{AffinityFilter, PostOrder, PostQuery, PostStore},
    types::{FeedKind, FeedType, PostSnapshot, Reason},
};

/// How entries from a provider are labelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasonTag {
    Fixed(Reason),
    /// Labelled with the strongest intrinsic scoring factor.
    DominantFactor,
}

pub struct FetchContext<'a> {
    pub owner: &'a OwnerContext,
    pub feed_type: &'a FeedType,
    /// Oldest creation time a candidate may have.
    pub since: DateTime<Utc>,
    pub limit: usize,
}

#[async_trait]
pub trait SourceProvider: Send + Sync {
    fn name(&self) -> &'static str;
    fn tag(&self) -> ReasonTag;
    async fn fetch(&self, ctx: &FetchContext<'_>) -> Result<Vec<PostSnapshot>>;
}

/// One provider's output for a recompute.
#[derive(Debug, Clone)]
pub struct CandidateList {
    pub provider: &'static str,
    pub tag: ReasonTag,
    pub posts: Vec<PostSnapshot>,
}

pub struct FollowingProvider {
    posts: Arc<dyn PostStore>,
}

#[async_trait]
impl SourceProvider for FollowingProvider {
    fn name(&self) -> &'static str {
        "following"
    }

    fn tag(&self) -> ReasonTag {
        ReasonTag::Fixed(Reason::Following)
    }

    async fn fetch(&self, ctx: &FetchContext<'_>) -> Result<Vec<PostSnapshot>> {
        let mut followees: Vec<String> = ctx.owner.active_followees.iter().cloned().collect();
        followees.sort();

        let mut query = PostQuery::since(ctx.since, PostOrder::Recent, ctx.limit);
        query.authors = Some(followees);
        self.posts.query_posts(&query).await
    }
}

pub struct TrendingProvider {
    posts: Arc<dyn PostStore>,
}

#[async_trait]
impl SourceProvider for TrendingProvider {
    fn name(&self) -> &'static str {
        "trending"
    }

    fn tag(&self) -> ReasonTag {
        ReasonTag::Fixed(Reason::Trending)
    }

    async fn fetch(&self, ctx: &FetchContext<'_>) -> Result<Vec<PostSnapshot>> {
        let query = PostQuery::since(ctx.since, PostOrder::Engagement, ctx.limit);
        self.posts.query_posts(&query).await
    }
}

/// Category, topic, and hashtag feeds: everything carrying the filter id.
pub struct ScopedProvider {
    posts: Arc<dyn PostStore>,
    kind: FeedKind,
}

#[async_trait]
impl SourceProvider for ScopedProvider {
    fn name(&self) -> &'static str {
        self.kind.as_str()
    }

    fn tag(&self) -> ReasonTag {
        match self.kind {
            FeedKind::Topic => ReasonTag::Fixed(Reason::Topic),
            FeedKind::Hashtag => ReasonTag::Fixed(Reason::Hashtag),
            _ => ReasonTag::Fixed(Reason::Category),
        }
    }

    async fn fetch(&self, ctx: &FetchContext<'_>) -> Result<Vec<PostSnapshot>> {
        let mut query = PostQuery::since(ctx.since, PostOrder::Recent, ctx.limit);
        match ctx.feed_type {
            FeedType::Category(id) => query.category_id = Some(id.clone()),
            FeedType::Topic(id) => query.topic_id = Some(id.clone()),
            FeedType::Hashtag(id) => query.hashtag = Some(id.clone()),
            _ => return Ok(Vec::new()),
        }
        self.posts.query_posts(&query).await
    }
}

/// Posts from others touching the owner's affinities.
pub struct AffinityProvider {
    posts: Arc<dyn PostStore>,
}

#[async_trait]
impl SourceProvider for AffinityProvider {
    fn name(&self) -> &'static str {
        "affinity"
    }

    fn tag(&self) -> ReasonTag {
        ReasonTag::Fixed(Reason::Personalized)
    }

    async fn fetch(&self, ctx: &FetchContext<'_>) -> Result<Vec<PostSnapshot>> {
        let profile = &ctx.owner.profile;
        if profile.is_empty() {
            return Ok(Vec::new());
        }

        let mut query = PostQuery::since(ctx.since, PostOrder::Engagement, ctx.limit);
        query.exclude_authors = vec![ctx.owner.owner_id.clone()];
        query.any_affinity = Some(AffinityFilter {
            categories: profile.categories.iter().cloned().collect(),
            topics: profile.topics.iter().cloned().collect(),
            hashtags: profile.hashtags.iter().cloned().collect(),
        });
        self.posts.query_posts(&query).await
    }
}

/// Content outside the owner's graph and affinities.
pub struct DiscoverProvider {
    posts: Arc<dyn PostStore>,
}

#[async_trait]
impl SourceProvider for DiscoverProvider {
    fn name(&self) -> &'static str {
        "discover"
    }

    fn tag(&self) -> ReasonTag {
        ReasonTag::DominantFactor
    }

    async fn fetch(&self, ctx: &FetchContext<'_>) -> Result<Vec<PostSnapshot>> {
        let mut excluded: Vec<String> = ctx.owner.active_followees.iter().cloned().collect();
        excluded.push(ctx.owner.owner_id.clone());
        excluded.sort();

        let mut query = PostQuery::since(ctx.since, PostOrder::Engagement, ctx.limit);
        query.exclude_authors = excluded;

        let posts = self.posts.query_posts(&query).await?;
        Ok(posts
            .into_iter()
            .filter(|post| ctx.owner.profile.matching_reason(post).is_none())
            .collect())
    }
}

/// Maps each feed kind to the providers that feed it, in priority order.
pub struct ProviderRegistry {
    providers: HashMap<FeedKind, Vec<Arc<dyn SourceProvider>>>,
}

impl ProviderRegistry {
    pub fn new(posts: Arc<dyn PostStore>) -> Self {
        let following: Arc<dyn SourceProvider> = Arc::new(FollowingProvider {
            posts: posts.clone(),
        });
        let trending: Arc<dyn SourceProvider> = Arc::new(TrendingProvider {
            posts: posts.clone(),
        });
        let scoped = |kind| -> Arc<dyn SourceProvider> {
            Arc::new(ScopedProvider {
                posts: posts.clone(),
                kind,
            })
        };
        let affinity: Arc<dyn SourceProvider> = Arc::new(AffinityProvider {
            posts: posts.clone(),
        });
        let discover: Arc<dyn SourceProvider> = Arc::new(DiscoverProvider {
            posts: posts.clone(),
        });

        let providers = HashMap::from([
            (FeedKind::Following, vec![following.clone()]),
            (FeedKind::Trending, vec![trending.clone()]),
            (FeedKind::Category, vec![scoped(FeedKind::Category)]),
            (FeedKind::Topic, vec![scoped(FeedKind::Topic)]),
            (FeedKind::Hashtag, vec![scoped(FeedKind::Hashtag)]),
            (FeedKind::Personalized, vec![following, trending, affinity]),
            (FeedKind::Discover, vec![discover]),
        ]);

        Self { providers }
    }

    /// Replaces the providers used for one feed kind.
    #[cfg(test)]
    pub fn register(&mut self, kind: FeedKind, providers: Vec<Arc<dyn SourceProvider>>) {
        self.providers.insert(kind, providers);
    }

    /// Runs every provider for the feed concurrently. A provider that errors or
    /// misses the deadline contributes an empty list.
    pub async fn fetch_all(
        &self,
        ctx: &FetchContext<'_>,
        deadline: Duration,
    ) -> Vec<CandidateList> {
        let Some(providers) = self.providers.get(&ctx.feed_type.kind()) else {
            return Vec::new();
        };

        let fetches = providers.iter().map(|provider| async move {
            let outcome = match tokio::time::timeout(deadline, provider.fetch(ctx)).await {
                Ok(Ok(posts)) => Ok(posts),
                Ok(Err(e)) => Err(FeedError::ProviderUnavailable {
                    provider: provider.name(),
                    reason: e.to_string(),
                }),
                Err(_) => Err(FeedError::ProviderUnavailable {
                    provider: provider.name(),
                    reason: format!("deadline of {:?} exceeded", deadline),
                }),
            };

            let posts = match outcome {
                Ok(posts) => {
                    debug!(
                        provider = provider.name(),
                        owner_id = %ctx.owner.owner_id,
                        candidates = posts.len(),
                        "Provider fetched candidates"
                    );
                    posts
                }
                Err(e) => {
                    warn!(owner_id = %ctx.owner.owner_id, "{}", e);
                    Vec::new()
                }
            };

            CandidateList {
                provider: provider.name(),
                tag: provider.tag(),
                posts,
            }
        });

        join_all(fetches).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::types::{InterestProfile, KarmaLevel};
    use chrono::TimeZone;
    use std::collections::HashSet;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn post(id: &str, author: &str, category: &str, reactions: u64) -> PostSnapshot {
        PostSnapshot {
            id: id.to_string(),
            author_id: author.to_string(),
            created_at: now() - chrono::Duration::hours(1),
            reactions_count: reactions,
            comment_count: 0,
            share_count: 0,
            category_id: Some(category.to_string()),
            topic_id: None,
            hashtags: vec![],
            author_karma_level: KarmaLevel::Newbie,
            reply_to: None,
            repost_of: None,
        }
    }

    fn owner(followees: &[&str], categories: &[&str]) -> OwnerContext {
        OwnerContext {
            owner_id: "alice".to_string(),
            active_followees: followees.iter().map(|f| f.to_string()).collect::<HashSet<_>>(),
            profile: InterestProfile {
                categories: categories.iter().map(|c| c.to_string()).collect(),
                ..InterestProfile::default()
            },
            now: now(),
        }
    }

    async fn seeded() -> Result<Arc<Database>> {
        let db = Database::new(":memory:").await?;
        db.migrate().await?;
        db.upsert_post(&post("p-bob", "bob", "rust", 3)).await?;
        db.upsert_post(&post("p-carol", "carol", "go", 50)).await?;
        db.upsert_post(&post("p-dave", "dave", "rust", 10)).await?;
        db.upsert_post(&post("p-alice", "alice", "rust", 1)).await?;
        Ok(Arc::new(db))
    }

    fn ids(list: &CandidateList) -> Vec<&str> {
        list.posts.iter().map(|p| p.id.as_str()).collect()
    }

    struct FailingProvider;

    #[async_trait]
    impl SourceProvider for FailingProvider {
        fn name(&self) -> &'static str {
            "failing"
        }
        fn tag(&self) -> ReasonTag {
            ReasonTag::Fixed(Reason::Trending)
        }
        async fn fetch(&self, _ctx: &FetchContext<'_>) -> Result<Vec<PostSnapshot>> {
            anyhow::bail!("store offline")
        }
    }

    struct SlowProvider;

    #[async_trait]
    impl SourceProvider for SlowProvider {
        fn name(&self) -> &'static str {
            "slow"
        }
        fn tag(&self) -> ReasonTag {
            ReasonTag::Fixed(Reason::Trending)
        }
        async fn fetch(&self, _ctx: &FetchContext<'_>) -> Result<Vec<PostSnapshot>> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(vec![post("late", "zed", "rust", 0)])
        }
    }

    #[tokio::test]
    async fn test_following_with_no_followees_is_empty() -> Result<()> {
        let registry = ProviderRegistry::new(seeded().await?);
        let ctx = owner(&[], &[]);
        let fetch = FetchContext {
            owner: &ctx,
            feed_type: &FeedType::Following,
            since: now() - chrono::Duration::days(7),
            limit: 100,
        };
        let lists = registry.fetch_all(&fetch, Duration::from_secs(1)).await;
        assert_eq!(lists.len(), 1);
        assert!(lists[0].posts.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_personalized_unions_sources_in_order() -> Result<()> {
        let registry = ProviderRegistry::new(seeded().await?);
        let ctx = owner(&["bob"], &["rust"]);
        let fetch = FetchContext {
            owner: &ctx,
            feed_type: &FeedType::Personalized,
            since: now() - chrono::Duration::days(7),
            limit: 100,
        };
        let lists = registry.fetch_all(&fetch, Duration::from_secs(1)).await;
        let providers: Vec<_> = lists.iter().map(|l| l.provider).collect();
        assert_eq!(providers, vec!["following", "trending", "affinity"]);
        assert_eq!(ids(&lists[0]), vec!["p-bob"]);
        assert_eq!(ids(&lists[1]), vec!["p-carol", "p-dave", "p-bob", "p-alice"]);
        assert_eq!(ids(&lists[2]), vec!["p-dave", "p-bob"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_discover_excludes_graph_and_affinities() -> Result<()> {
        let registry = ProviderRegistry::new(seeded().await?);
        let ctx = owner(&["bob"], &["rust"]);
        let fetch = FetchContext {
            owner: &ctx,
            feed_type: &FeedType::Discover,
            since: now() - chrono::Duration::days(7),
            limit: 100,
        };
        let lists = registry.fetch_all(&fetch, Duration::from_secs(1)).await;
        assert_eq!(ids(&lists[0]), vec!["p-carol"]);
        assert_eq!(lists[0].tag, ReasonTag::DominantFactor);
        Ok(())
    }

    #[tokio::test]
    async fn test_scoped_provider_filters_by_id() -> Result<()> {
        let registry = ProviderRegistry::new(seeded().await?);
        let ctx = owner(&[], &[]);
        let feed_type = FeedType::Category("go".to_string());
        let fetch = FetchContext {
            owner: &ctx,
            feed_type: &feed_type,
            since: now() - chrono::Duration::days(7),
            limit: 100,
        };
        let lists = registry.fetch_all(&fetch, Duration::from_secs(1)).await;
        assert_eq!(ids(&lists[0]), vec!["p-carol"]);
        assert_eq!(lists[0].tag, ReasonTag::Fixed(Reason::Category));
        Ok(())
    }

    #[tokio::test]
    async fn test_following_drops_posts_older_than_window() -> Result<()> {
        let db = seeded().await?;
        let mut old = post("p-bob-old", "bob", "rust", 99);
        old.created_at = now() - chrono::Duration::days(10);
        db.upsert_post(&old).await?;

        let registry = ProviderRegistry::new(db);
        let ctx = owner(&["bob"], &[]);
        let fetch = FetchContext {
            owner: &ctx,
            feed_type: &FeedType::Following,
            since: now() - chrono::Duration::days(7),
            limit: 100,
        };
        let lists = registry.fetch_all(&fetch, Duration::from_secs(1)).await;
        assert_eq!(ids(&lists[0]), vec!["p-bob"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_topic_and_hashtag_providers() -> Result<()> {
        let db = seeded().await?;
        let mut topical = post("p-topic", "dave", "rust", 0);
        topical.topic_id = Some("async".to_string());
        topical.hashtags = vec!["tokio".to_string()];
        db.upsert_post(&topical).await?;
        let mut tagged = post("p-tag", "carol", "go", 0);
        tagged.created_at = now() - chrono::Duration::hours(2);
        tagged.hashtags = vec!["tokio".to_string()];
        db.upsert_post(&tagged).await?;
        let mut expired = post("p-tag-old", "carol", "go", 0);
        expired.created_at = now() - chrono::Duration::days(30);
        expired.hashtags = vec!["tokio".to_string()];
        db.upsert_post(&expired).await?;

        let registry = ProviderRegistry::new(db);
        let ctx = owner(&[], &[]);
        let since = now() - chrono::Duration::days(7);

        let topic = FeedType::Topic("async".to_string());
        let fetch = FetchContext {
            owner: &ctx,
            feed_type: &topic,
            since,
            limit: 100,
        };
        let lists = registry.fetch_all(&fetch, Duration::from_secs(1)).await;
        assert_eq!(lists[0].provider, "topic");
        assert_eq!(lists[0].tag, ReasonTag::Fixed(Reason::Topic));
        assert_eq!(ids(&lists[0]), vec!["p-topic"]);

        let hashtag = FeedType::Hashtag("tokio".to_string());
        let fetch = FetchContext {
            owner: &ctx,
            feed_type: &hashtag,
            since,
            limit: 100,
        };
        let lists = registry.fetch_all(&fetch, Duration::from_secs(1)).await;
        assert_eq!(lists[0].tag, ReasonTag::Fixed(Reason::Hashtag));
        assert_eq!(ids(&lists[0]), vec!["p-topic", "p-tag"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_and_slow_providers_degrade_to_empty() -> Result<()> {
        let db = seeded().await?;
        let mut registry = ProviderRegistry::new(db.clone());
        registry.register(
            FeedKind::Trending,
            vec![
                Arc::new(FailingProvider),
                Arc::new(SlowProvider),
                Arc::new(TrendingProvider { posts: db }),
            ],
        );

        let ctx = owner(&[], &[]);
        let fetch = FetchContext {
            owner: &ctx,
            feed_type: &FeedType::Trending,
            since: now() - chrono::Duration::days(7),
            limit: 100,
        };
        let lists = registry
            .fetch_all(&fetch, Duration::from_millis(500))
            .await;
        assert_eq!(lists.len(), 3);
        assert!(lists[0].posts.is_empty());
        assert!(lists[1].posts.is_empty());
        assert_eq!(lists[2].posts.len(), 4);
        Ok(())
    }
}
