//! Interest profile derivation.
//!
//! An owner's affinities come from their own authored posts inside a lookback
//! window. Each post contributes `0.5^(age_days / half_life_days)` to its
//! category, topic, and every hashtag; keys whose summed weight reaches the
//! minimum are kept, strongest first, up to a per-set cap.

use anyhow::Result;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

use crate::{
    config::ProfileConfig,
    stores::PostStore,
    types::{InterestProfile, PostSnapshot, UserId},
};

fn decay_weight(post: &PostSnapshot, now: DateTime<Utc>, half_life_days: f64) -> f64 {
    let age_days = (now - post.created_at).num_seconds().max(0) as f64 / 86_400.0;
    0.5f64.powf(age_days / half_life_days)
}

fn strongest(weights: HashMap<&str, f64>, min_weight: f64, cap: usize) -> BTreeSet<String> {
    let mut ranked: Vec<(&str, f64)> = weights
        .into_iter()
        .filter(|(_, weight)| *weight >= min_weight)
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    ranked
        .into_iter()
        .take(cap)
        .map(|(key, _)| key.to_string())
        .collect()
}

/// Pure derivation from an authored-post history.
pub fn derive_profile(
    history: &[PostSnapshot],
    now: DateTime<Utc>,
    config: &ProfileConfig,
) -> InterestProfile {
    let cutoff = now - config.lookback;
    let mut categories: HashMap<&str, f64> = HashMap::new();
    let mut topics: HashMap<&str, f64> = HashMap::new();
    let mut hashtags: HashMap<&str, f64> = HashMap::new();

    for post in history.iter().filter(|p| p.created_at >= cutoff) {
        let weight = decay_weight(post, now, config.half_life_days);
        if let Some(category) = &post.category_id {
            *categories.entry(category).or_default() += weight;
        }
        if let Some(topic) = &post.topic_id {
            *topics.entry(topic).or_default() += weight;
        }
        for hashtag in &post.hashtags {
            *hashtags.entry(hashtag).or_default() += weight;
        }
    }

    InterestProfile {
        categories: strongest(categories, config.min_weight, config.max_categories),
        topics: strongest(topics, config.min_weight, config.max_topics),
        hashtags: strongest(hashtags, config.min_weight, config.max_hashtags),
    }
}

pub struct InterestProfileBuilder<'a> {
    posts: &'a dyn PostStore,
    config: &'a ProfileConfig,
}

impl<'a> InterestProfileBuilder<'a> {
    pub fn new(posts: &'a dyn PostStore, config: &'a ProfileConfig) -> Self {
        Self { posts, config }
    }

    pub async fn build(&self, owner_id: &str, now: DateTime<Utc>) -> Result<InterestProfile> {
        let history = self
            .posts
            .posts_by_author(owner_id, now - self.config.lookback, self.config.history_limit)
            .await?;
        let profile = derive_profile(&history, now, self.config);
        debug!(
            owner_id,
            history = history.len(),
            categories = profile.categories.len(),
            topics = profile.topics.len(),
            hashtags = profile.hashtags.len(),
            "Built interest profile"
        );
        Ok(profile)
    }
}

/// Built profiles, kept for one refresh interval.
#[derive(Clone)]
pub struct ProfileCache {
    profiles: Cache<UserId, Arc<InterestProfile>>,
    posts: Arc<dyn PostStore>,
    config: ProfileConfig,
}

impl ProfileCache {
    pub fn new(
        posts: Arc<dyn PostStore>,
        config: ProfileConfig,
        ttl: std::time::Duration,
        capacity: u64,
    ) -> Self {
        Self {
            profiles: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
            posts,
            config,
        }
    }

    pub async fn get(&self, owner_id: &str, now: DateTime<Utc>) -> Result<Arc<InterestProfile>> {
        if let Some(profile) = self.profiles.get(owner_id).await {
            return Ok(profile);
        }
        let profile = InterestProfileBuilder::new(self.posts.as_ref(), &self.config)
            .build(owner_id, now)
            .await?;
        let profile = Arc::new(profile);
        self.profiles
            .insert(owner_id.to_string(), Arc::clone(&profile))
            .await;
        Ok(profile)
    }

    pub fn resident(&self) -> u64 {
        self.profiles.entry_count()
    }

    #[cfg(test)]
    pub async fn insert(&self, owner_id: &str, profile: InterestProfile) {
        self.profiles
            .insert(owner_id.to_string(), Arc::new(profile))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::types::KarmaLevel;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    fn authored(id: &str, age_days: i64, category: &str, hashtags: &[&str]) -> PostSnapshot {
        PostSnapshot {
            id: id.to_string(),
            author_id: "alice".to_string(),
            created_at: now() - Duration::days(age_days),
            reactions_count: 0,
            comment_count: 0,
            share_count: 0,
            category_id: Some(category.to_string()),
            topic_id: None,
            hashtags: hashtags.iter().map(|h| h.to_string()).collect(),
            author_karma_level: KarmaLevel::Newbie,
            reply_to: None,
            repost_of: None,
        }
    }

    #[test]
    fn test_recent_interests_survive_old_ones_decay() {
        let config = ProfileConfig::default();
        let history = vec![
            authored("p1", 1, "rust", &["tokio"]),
            // 80 days old: 0.5^(80/30) ~ 0.157, below the 0.25 minimum.
            authored("p2", 80, "cobol", &["mainframe"]),
            // Outside the 90-day lookback entirely.
            authored("p3", 200, "perl", &[]),
        ];

        let profile = derive_profile(&history, now(), &config);
        assert_eq!(profile.categories, BTreeSet::from(["rust".to_string()]));
        assert_eq!(profile.hashtags, BTreeSet::from(["tokio".to_string()]));
        assert!(profile.topics.is_empty());
    }

    #[test]
    fn test_repeated_old_interest_accumulates() {
        let config = ProfileConfig::default();
        let history = vec![
            authored("p1", 80, "cobol", &[]),
            authored("p2", 80, "cobol", &[]),
        ];
        let profile = derive_profile(&history, now(), &config);
        assert!(profile.categories.contains("cobol"));
    }

    #[test]
    fn test_caps_keep_strongest() {
        let config = ProfileConfig {
            max_categories: 2,
            ..ProfileConfig::default()
        };
        let history = vec![
            authored("p1", 0, "a", &[]),
            authored("p2", 0, "a", &[]),
            authored("p3", 0, "b", &[]),
            authored("p4", 0, "b", &[]),
            authored("p5", 0, "c", &[]),
        ];
        let profile = derive_profile(&history, now(), &config);
        assert_eq!(
            profile.categories,
            BTreeSet::from(["a".to_string(), "b".to_string()])
        );
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let config = ProfileConfig::default();
        let history = vec![
            authored("p1", 2, "rust", &["tokio", "axum"]),
            authored("p2", 5, "go", &["axum"]),
        ];
        assert_eq!(
            derive_profile(&history, now(), &config),
            derive_profile(&history, now(), &config)
        );
    }

    #[tokio::test]
    async fn test_build_reads_owner_history() -> Result<()> {
        let db = Database::new(":memory:").await?;
        db.migrate().await?;
        db.upsert_post(&authored("p1", 3, "rust", &["tokio"])).await?;
        let mut other = authored("p2", 3, "go", &[]);
        other.author_id = "bob".to_string();
        db.upsert_post(&other).await?;

        let config = ProfileConfig::default();
        let profile = InterestProfileBuilder::new(&db, &config)
            .build("alice", now())
            .await?;
        assert_eq!(profile.categories, BTreeSet::from(["rust".to_string()]));
        Ok(())
    }

    #[tokio::test]
    async fn test_profile_cache_builds_once_per_ttl() -> Result<()> {
        let db = Arc::new(Database::new(":memory:").await?);
        db.migrate().await?;
        db.upsert_post(&authored("p1", 3, "rust", &["tokio"])).await?;

        let profiles = ProfileCache::new(
            db.clone(),
            ProfileConfig::default(),
            std::time::Duration::from_secs(3600),
            100,
        );
        let built = profiles.get("alice", now()).await?;
        assert!(built.categories.contains("rust"));

        // New history is not seen until the cached profile expires.
        db.upsert_post(&authored("p2", 1, "go", &[])).await?;
        db.upsert_post(&authored("p3", 1, "go", &[])).await?;
        let cached = profiles.get("alice", now()).await?;
        assert!(Arc::ptr_eq(&built, &cached));
        assert!(!cached.categories.contains("go"));
        Ok(())
    }
}
