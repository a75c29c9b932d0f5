use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    QueryBuilder, Row, Sqlite, SqlitePool,
};
use std::str::FromStr;

use crate::{
    error::FeedError,
    stores::{
        FeedStore, FollowStore, KarmaStore, PostOrder, PostQuery, PostStore, TaxonomyKind,
        TaxonomyStore,
    },
    types::{
        Feed, FeedEntry, FeedHealth, FeedKey, FeedKind, FeedPreferences, FeedStats, FeedType,
        FollowEdge, KarmaLevel, PostSnapshot, UserId,
    },
};

const POST_SELECT: &str = r#"
    SELECT p.id, p.author_id, p.created_at, p.reactions_count, p.comment_count, p.share_count,
           p.category_id, p.topic_id, p.reply_to, p.repost_of,
           COALESCE(u.total_karma, 0) AS total_karma,
           (SELECT json_group_array(h.hashtag) FROM post_hashtags h WHERE h.post_id = p.id) AS hashtags
    FROM posts p
    LEFT JOIN users u ON u.id = p.author_id
"#;

/// Fixed-width UTC timestamps so text comparison in SQL matches time order.
fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

fn post_from_row(row: &SqliteRow) -> Result<PostSnapshot> {
    let created_at: String = row.try_get("created_at")?;
    let hashtags_json: Option<String> = row.try_get("hashtags")?;
    let mut hashtags: Vec<String> = match hashtags_json {
        Some(json) => serde_json::from_str(&json)?,
        None => Vec::new(),
    };
    hashtags.sort();

    let count = |column: &str| -> Result<u64> {
        let value: i64 = row.try_get(column)?;
        Ok(value.max(0) as u64)
    };

    Ok(PostSnapshot {
        id: row.try_get("id")?,
        author_id: row.try_get("author_id")?,
        created_at: parse_ts(&created_at)?,
        reactions_count: count("reactions_count")?,
        comment_count: count("comment_count")?,
        share_count: count("share_count")?,
        category_id: row.try_get("category_id")?,
        topic_id: row.try_get("topic_id")?,
        hashtags,
        author_karma_level: KarmaLevel::from_total_karma(row.try_get("total_karma")?),
        reply_to: row.try_get("reply_to")?,
        repost_of: row.try_get("repost_of")?,
    })
}

fn push_list(builder: &mut QueryBuilder<'_, Sqlite>, values: &[String]) {
    let mut separated = builder.separated(", ");
    for value in values {
        separated.push_bind(value.clone());
    }
}

pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(std::time::Duration::from_secs(5));

        if database_url.contains(":memory:") {
            // Every connection would otherwise see its own empty database.
            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?;
            return Ok(Self { pool });
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        // Enable WAL mode for better concurrency
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    // Ingestion: keeps the local post/follow/karma projections current.

    pub async fn upsert_post(&self, post: &PostSnapshot) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO posts (id, author_id, created_at, reactions_count, comment_count,
                               share_count, category_id, topic_id, reply_to, repost_of)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                reactions_count = excluded.reactions_count,
                comment_count = excluded.comment_count,
                share_count = excluded.share_count,
                category_id = excluded.category_id,
                topic_id = excluded.topic_id
            "#,
        )
        .bind(&post.id)
        .bind(&post.author_id)
        .bind(ts(&post.created_at))
        .bind(post.reactions_count as i64)
        .bind(post.comment_count as i64)
        .bind(post.share_count as i64)
        .bind(&post.category_id)
        .bind(&post.topic_id)
        .bind(&post.reply_to)
        .bind(&post.repost_of)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM post_hashtags WHERE post_id = ?")
            .bind(&post.id)
            .execute(&mut *tx)
            .await?;

        for hashtag in &post.hashtags {
            sqlx::query("INSERT OR IGNORE INTO post_hashtags (post_id, hashtag) VALUES (?, ?)")
                .bind(&post.id)
                .bind(hashtag)
                .execute(&mut *tx)
                .await?;
            sqlx::query("INSERT OR IGNORE INTO hashtags (id, name) VALUES (?, ?)")
                .bind(hashtag)
                .bind(hashtag)
                .execute(&mut *tx)
                .await?;
        }

        if let Some(category) = &post.category_id {
            sqlx::query("INSERT OR IGNORE INTO categories (id, name) VALUES (?, ?)")
                .bind(category)
                .bind(category)
                .execute(&mut *tx)
                .await?;
        }
        if let Some(topic) = &post.topic_id {
            sqlx::query("INSERT OR IGNORE INTO topics (id, name) VALUES (?, ?)")
                .bind(topic)
                .bind(topic)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn upsert_follow(&self, edge: &FollowEdge) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO follows (follower_id, followee_id, status, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(follower_id, followee_id) DO UPDATE SET status = excluded.status
            "#,
        )
        .bind(&edge.follower_id)
        .bind(&edge.followee_id)
        .bind(edge.status.as_str())
        .bind(ts(&Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_total_karma(&self, user_id: &str, total_karma: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, total_karma) VALUES (?, ?)
            ON CONFLICT(id) DO UPDATE SET total_karma = excluded.total_karma
            "#,
        )
        .bind(user_id)
        .bind(total_karma)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn stats(&self) -> Result<String> {
        let count = |table: &'static str| {
            let pool = self.pool.clone();
            async move {
                let row = sqlx::query(&format!("SELECT COUNT(*) as count FROM {}", table))
                    .fetch_one(&pool)
                    .await?;
                Ok::<i64, anyhow::Error>(row.try_get("count")?)
            }
        };

        let posts = count("posts").await?;
        let follows = count("follows").await?;
        let feeds = count("feeds").await?;

        let degraded: i64 = sqlx::query(
            "SELECT COUNT(*) as count FROM feeds WHERE json_extract(health, '$.degraded') = 1",
        )
        .fetch_one(&self.pool)
        .await?
        .try_get("count")?;

        Ok(format!(
            "Database Statistics:\n  Posts: {}\n  Follows: {}\n  Feeds: {}\n  Degraded feeds: {}\n",
            posts, follows, feeds, degraded
        ))
    }
}

#[async_trait]
impl PostStore for Database {
    async fn get_post_snapshot(&self, id: &str) -> Result<Option<PostSnapshot>> {
        let row = sqlx::query(&format!("{} WHERE p.id = ?", POST_SELECT))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(post_from_row).transpose()
    }

    async fn query_posts(&self, query: &PostQuery) -> Result<Vec<PostSnapshot>> {
        if query.limit == 0
            || query.authors.as_ref().is_some_and(|a| a.is_empty())
            || query.any_affinity.as_ref().is_some_and(|a| a.is_empty())
        {
            return Ok(Vec::new());
        }

        let mut builder = QueryBuilder::<Sqlite>::new(POST_SELECT);
        builder.push(" WHERE p.created_at >= ").push_bind(ts(&query.since));

        if let Some(authors) = &query.authors {
            builder.push(" AND p.author_id IN (");
            push_list(&mut builder, authors);
            builder.push(")");
        }
        if !query.exclude_authors.is_empty() {
            builder.push(" AND p.author_id NOT IN (");
            push_list(&mut builder, &query.exclude_authors);
            builder.push(")");
        }
        if let Some(category) = &query.category_id {
            builder.push(" AND p.category_id = ").push_bind(category.clone());
        }
        if let Some(topic) = &query.topic_id {
            builder.push(" AND p.topic_id = ").push_bind(topic.clone());
        }
        if let Some(hashtag) = &query.hashtag {
            builder
                .push(" AND EXISTS (SELECT 1 FROM post_hashtags h WHERE h.post_id = p.id AND h.hashtag = ")
                .push_bind(hashtag.clone())
                .push(")");
        }
        if let Some(affinity) = &query.any_affinity {
            builder.push(" AND (0");
            if !affinity.categories.is_empty() {
                builder.push(" OR p.category_id IN (");
                push_list(&mut builder, &affinity.categories);
                builder.push(")");
            }
            if !affinity.topics.is_empty() {
                builder.push(" OR p.topic_id IN (");
                push_list(&mut builder, &affinity.topics);
                builder.push(")");
            }
            if !affinity.hashtags.is_empty() {
                builder.push(
                    " OR EXISTS (SELECT 1 FROM post_hashtags h WHERE h.post_id = p.id AND h.hashtag IN (",
                );
                push_list(&mut builder, &affinity.hashtags);
                builder.push("))");
            }
            builder.push(")");
        }

        match query.order {
            PostOrder::Recent => builder.push(" ORDER BY p.created_at DESC, p.id ASC"),
            PostOrder::Engagement => builder.push(
                " ORDER BY (p.reactions_count + 3 * p.comment_count + 5 * p.share_count) DESC, \
                 p.created_at DESC, p.id ASC",
            ),
        };
        builder.push(" LIMIT ").push_bind(query.limit as i64);

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(post_from_row).collect()
    }

    async fn posts_by_author(
        &self,
        author_id: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PostSnapshot>> {
        let rows = sqlx::query(&format!(
            "{} WHERE p.author_id = ? AND p.created_at >= ? \
             ORDER BY p.created_at DESC, p.id ASC LIMIT ?",
            POST_SELECT
        ))
        .bind(author_id)
        .bind(ts(&since))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(post_from_row).collect()
    }
}

#[async_trait]
impl FollowStore for Database {
    async fn get_active_followees(&self, owner_id: &str) -> Result<Vec<UserId>> {
        let rows = sqlx::query(
            r#"
            SELECT followee_id FROM follows
            WHERE follower_id = ? AND status = 'active'
            ORDER BY followee_id
            "#,
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.try_get("followee_id").ok())
            .collect())
    }

    async fn get_active_followers(&self, author_id: &str) -> Result<Vec<UserId>> {
        let rows = sqlx::query(
            r#"
            SELECT follower_id FROM follows
            WHERE followee_id = ? AND status = 'active'
            ORDER BY follower_id
            "#,
        )
        .bind(author_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.try_get("follower_id").ok())
            .collect())
    }
}

#[async_trait]
impl KarmaStore for Database {
    async fn get_karma_level(&self, user_id: &str) -> Result<KarmaLevel> {
        let total: Option<i64> = sqlx::query("SELECT total_karma FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| row.try_get("total_karma"))
            .transpose()?;
        Ok(KarmaLevel::from_total_karma(total.unwrap_or(0)))
    }
}

#[async_trait]
impl TaxonomyStore for Database {
    async fn exists(&self, kind: TaxonomyKind, id: &str) -> Result<bool> {
        let table = match kind {
            TaxonomyKind::Category => "categories",
            TaxonomyKind::Topic => "topics",
            TaxonomyKind::Hashtag => "hashtags",
        };
        let row = sqlx::query(&format!("SELECT COUNT(*) as count FROM {} WHERE id = ?", table))
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get("count")?;
        Ok(count > 0)
    }
}

#[async_trait]
impl FeedStore for Database {
    async fn load_feed(&self, key: &FeedKey) -> Result<Option<Feed>> {
        let row = sqlx::query(
            r#"
            SELECT entries, stats, health, preferences, last_updated, next_update
            FROM feeds
            WHERE owner_id = ? AND feed_type = ? AND filter_key = ?
            "#,
        )
        .bind(&key.owner_id)
        .bind(key.feed_type.kind().as_str())
        .bind(key.feed_type.filter_key().unwrap_or(""))
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let corrupted = |reason: String| {
            anyhow::Error::new(FeedError::CorruptedState {
                key: key.to_string(),
                reason,
            })
        };

        let entries_json: String = row.try_get("entries")?;
        let entries: Vec<FeedEntry> = serde_json::from_str(&entries_json)
            .map_err(|e| corrupted(format!("undecodable entries: {}", e)))?;

        let last_updated: String = row.try_get("last_updated")?;
        let next_update: String = row.try_get("next_update")?;
        let last_updated =
            parse_ts(&last_updated).map_err(|e| corrupted(format!("last_updated: {}", e)))?;
        let next_update =
            parse_ts(&next_update).map_err(|e| corrupted(format!("next_update: {}", e)))?;

        // Derived columns fall back to recomputation rather than failing the load.
        let stats: String = row.try_get("stats")?;
        let stats =
            serde_json::from_str(&stats).unwrap_or_else(|_| FeedStats::from_entries(&entries));
        let health: String = row.try_get("health")?;
        let health: FeedHealth = serde_json::from_str(&health).unwrap_or_default();
        let preferences: String = row.try_get("preferences")?;
        let preferences: FeedPreferences = serde_json::from_str(&preferences).unwrap_or_default();

        Ok(Some(Feed {
            owner_id: key.owner_id.clone(),
            feed_type: key.feed_type.clone(),
            entries,
            last_updated,
            next_update,
            preferences,
            stats,
            health,
        }))
    }

    async fn save_feed(&self, feed: &Feed) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO feeds (owner_id, feed_type, filter_key, entries, stats, health,
                               preferences, last_updated, next_update)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(owner_id, feed_type, filter_key) DO UPDATE SET
                entries = excluded.entries,
                stats = excluded.stats,
                health = excluded.health,
                preferences = excluded.preferences,
                last_updated = excluded.last_updated,
                next_update = excluded.next_update
            "#,
        )
        .bind(&feed.owner_id)
        .bind(feed.feed_type.kind().as_str())
        .bind(feed.feed_type.filter_key().unwrap_or(""))
        .bind(serde_json::to_string(&feed.entries)?)
        .bind(serde_json::to_string(&feed.stats)?)
        .bind(serde_json::to_string(&feed.health)?)
        .bind(serde_json::to_string(&feed.preferences)?)
        .bind(ts(&feed.last_updated))
        .bind(ts(&feed.next_update))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_preferences(
        &self,
        owner_id: &str,
        kind: FeedKind,
    ) -> Result<Option<FeedPreferences>> {
        let row = sqlx::query(
            "SELECT preferences FROM feed_preferences WHERE owner_id = ? AND feed_type = ?",
        )
        .bind(owner_id)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let json: String = row.try_get("preferences")?;
                Ok(Some(serde_json::from_str(&json)?))
            }
            None => Ok(None),
        }
    }

    async fn save_preferences(
        &self,
        owner_id: &str,
        kind: FeedKind,
        preferences: &FeedPreferences,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO feed_preferences (owner_id, feed_type, preferences, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(owner_id, feed_type) DO UPDATE SET
                preferences = excluded.preferences,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(owner_id)
        .bind(kind.as_str())
        .bind(serde_json::to_string(preferences)?)
        .bind(ts(&Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn feed_keys(&self, owner_id: &str, kind: FeedKind) -> Result<Vec<FeedKey>> {
        let rows = sqlx::query(
            r#"
            SELECT filter_key FROM feeds
            WHERE owner_id = ? AND feed_type = ?
            ORDER BY filter_key
            "#,
        )
        .bind(owner_id)
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut keys = Vec::with_capacity(rows.len());
        for row in rows {
            let filter: String = row.try_get("filter_key")?;
            keys.push(FeedKey::new(owner_id, FeedType::from_parts(kind, Some(&filter))?));
        }
        Ok(keys)
    }

    async fn owners_with_feed(&self, kind: FeedKind) -> Result<Vec<UserId>> {
        let owners = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT owner_id FROM feeds WHERE feed_type = ? ORDER BY owner_id",
        )
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(owners)
    }
}
