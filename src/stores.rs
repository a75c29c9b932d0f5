use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::{
    database::Database,
    types::{Feed, FeedKey, FeedKind, FeedPreferences, KarmaLevel, PostSnapshot, UserId},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostOrder {
    Recent,
    Engagement,
}

/// Filter for `PostStore::query_posts`. Unset fields do not constrain.
#[derive(Debug, Clone)]
pub struct PostQuery {
    pub since: DateTime<Utc>,
    pub authors: Option<Vec<UserId>>,
    pub exclude_authors: Vec<UserId>,
    pub category_id: Option<String>,
    pub topic_id: Option<String>,
    pub hashtag: Option<String>,
    /// Posts touching any of these categories, topics, or hashtags.
    pub any_affinity: Option<AffinityFilter>,
    pub order: PostOrder,
    pub limit: usize,
}

impl PostQuery {
    pub fn since(since: DateTime<Utc>, order: PostOrder, limit: usize) -> Self {
        Self {
            since,
            authors: None,
            exclude_authors: Vec::new(),
            category_id: None,
            topic_id: None,
            hashtag: None,
            any_affinity: None,
            order,
            limit,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AffinityFilter {
    pub categories: Vec<String>,
    pub topics: Vec<String>,
    pub hashtags: Vec<String>,
}

impl AffinityFilter {
    pub fn is_empty(&self) -> bool {
        self.categories.is_empty() && self.topics.is_empty() && self.hashtags.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaxonomyKind {
    Category,
    Topic,
    Hashtag,
}

impl TaxonomyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaxonomyKind::Category => "category",
            TaxonomyKind::Topic => "topic",
            TaxonomyKind::Hashtag => "hashtag",
        }
    }
}

#[async_trait]
pub trait PostStore: Send + Sync {
    async fn get_post_snapshot(&self, id: &str) -> Result<Option<PostSnapshot>>;
    async fn query_posts(&self, query: &PostQuery) -> Result<Vec<PostSnapshot>>;
    /// Posts written by `author_id` since `since`, newest first.
    async fn posts_by_author(
        &self,
        author_id: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PostSnapshot>>;
}

#[async_trait]
pub trait FollowStore: Send + Sync {
    async fn get_active_followees(&self, owner_id: &str) -> Result<Vec<UserId>>;
    async fn get_active_followers(&self, author_id: &str) -> Result<Vec<UserId>>;
}

#[async_trait]
pub trait KarmaStore: Send + Sync {
    async fn get_karma_level(&self, user_id: &str) -> Result<KarmaLevel>;
}

#[async_trait]
pub trait TaxonomyStore: Send + Sync {
    async fn exists(&self, kind: TaxonomyKind, id: &str) -> Result<bool>;
}

/// Persistence for computed feeds and per-kind preferences.
#[async_trait]
pub trait FeedStore: Send + Sync {
    /// Fails with `FeedError::CorruptedState` when the stored row cannot be decoded.
    async fn load_feed(&self, key: &FeedKey) -> Result<Option<Feed>>;
    async fn save_feed(&self, feed: &Feed) -> Result<()>;
    async fn load_preferences(
        &self,
        owner_id: &str,
        kind: FeedKind,
    ) -> Result<Option<FeedPreferences>>;
    async fn save_preferences(
        &self,
        owner_id: &str,
        kind: FeedKind,
        preferences: &FeedPreferences,
    ) -> Result<()>;
    /// Keys of every stored feed of this owner and kind, one per filter id.
    async fn feed_keys(&self, owner_id: &str, kind: FeedKind) -> Result<Vec<FeedKey>>;
    /// Owners with a stored feed of this kind, sorted.
    async fn owners_with_feed(&self, kind: FeedKind) -> Result<Vec<UserId>>;
}

/// The external collaborators the ranking core reads from.
#[derive(Clone)]
pub struct Stores {
    pub posts: Arc<dyn PostStore>,
    pub follows: Arc<dyn FollowStore>,
    pub karma: Arc<dyn KarmaStore>,
    pub taxonomy: Arc<dyn TaxonomyStore>,
    pub feeds: Arc<dyn FeedStore>,
}

impl Stores {
    pub fn from_database(db: Arc<Database>) -> Self {
        Self {
            posts: db.clone(),
            follows: db.clone(),
            karma: db.clone(),
            taxonomy: db.clone(),
            feeds: db,
        }
    }
}
