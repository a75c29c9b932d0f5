use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::{
    cache::FeedCache,
    clock::Clock,
    config::FeedConfig,
    profile::ProfileCache,
    scoring::{self, OwnerContext, ScoringConfig},
    stores::{FeedStore, FollowStore, KarmaStore, Stores},
    types::{FeedEntry, FeedKey, FeedKind, FeedType, PostSnapshot, Reason, UserId},
};

/// Outcome of pushing one post into cached feeds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FanoutReport {
    pub post_id: String,
    pub targets: usize,
    pub updated: usize,
    /// Feeds never computed, dormant, or whose preferences reject the post.
    pub skipped: usize,
    /// Feeds whose update errored; pushing again is safe.
    pub failed: Vec<FeedKey>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Push {
    Updated,
    Skipped,
}

struct Target {
    key: FeedKey,
    reason: Reason,
    follows_author: bool,
}

/// Pushes new posts into the cached feeds of followers and of owners whose
/// affinities the post touches.
pub struct IncrementalUpdater {
    cache: Arc<FeedCache>,
    follows: Arc<dyn FollowStore>,
    karma: Arc<dyn KarmaStore>,
    feeds: Arc<dyn FeedStore>,
    profiles: ProfileCache,
    scoring: ScoringConfig,
    config: FeedConfig,
    clock: Arc<dyn Clock>,
}

impl IncrementalUpdater {
    pub fn new(
        cache: Arc<FeedCache>,
        stores: &Stores,
        profiles: ProfileCache,
        scoring: ScoringConfig,
        config: FeedConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            cache,
            follows: stores.follows.clone(),
            karma: stores.karma.clone(),
            feeds: stores.feeds.clone(),
            profiles,
            scoring,
            config,
            clock,
        }
    }

    pub async fn fan_out(&self, post: &PostSnapshot) -> Result<FanoutReport> {
        let mut snapshot = post.clone();
        match self.karma.get_karma_level(&snapshot.author_id).await {
            Ok(level) => snapshot.author_karma_level = level,
            Err(e) => warn!(author_id = %snapshot.author_id, "Using supplied karma level: {}", e),
        }
        let post = &snapshot;
        let now = self.clock.now();

        let followers = self.follows.get_active_followers(&post.author_id).await?;
        let affinity = self.affinity_owners(post, now).await?;
        let targets = self.targets(post, &followers, affinity);

        let mut report = FanoutReport {
            post_id: post.id.clone(),
            targets: targets.len(),
            ..FanoutReport::default()
        };

        for batch in targets.chunks(self.config.fanout_batch_size) {
            let pushes: Vec<_> = batch
                .iter()
                .map(|target| async move {
                    (target.key.clone(), self.push(target, post, now).await)
                })
                .collect();
            let outcomes: Vec<(FeedKey, Result<Push>)> = stream::iter(pushes)
                .buffer_unordered(self.config.fanout_concurrency)
                .collect()
                .await;

            for (key, outcome) in outcomes {
                match outcome {
                    Ok(Push::Updated) => report.updated += 1,
                    Ok(Push::Skipped) => report.skipped += 1,
                    Err(e) => {
                        warn!(feed = %key, post_id = %post.id, "Fan-out failed: {:#}", e);
                        report.failed.push(key);
                    }
                }
            }
        }

        report.failed.sort_by_key(|key| key.to_string());
        info!(
            post_id = %report.post_id,
            targets = report.targets,
            updated = report.updated,
            skipped = report.skipped,
            failed = report.failed.len(),
            "Fanned out new post"
        );
        Ok(report)
    }

    /// Owners with a stored Personalized feed whose current profile the post
    /// touches. Profiles are rebuilt on demand when not cached.
    async fn affinity_owners(
        &self,
        post: &PostSnapshot,
        now: DateTime<Utc>,
    ) -> Result<Vec<UserId>> {
        let candidates = self.feeds.owners_with_feed(FeedKind::Personalized).await?;
        let checks: Vec<_> = candidates
            .iter()
            .filter(|owner| **owner != post.author_id)
            .map(|owner| async move {
                match self.profiles.get(owner, now).await {
                    Ok(profile) => profile.matching_reason(post).map(|_| owner.clone()),
                    Err(e) => {
                        warn!(owner_id = %owner, "Skipping affinity check: {:#}", e);
                        None
                    }
                }
            })
            .collect();
        let matched: Vec<Option<UserId>> = stream::iter(checks)
            .buffer_unordered(self.config.fanout_concurrency)
            .collect()
            .await;

        let mut owners: Vec<UserId> = matched.into_iter().flatten().collect();
        owners.sort();
        Ok(owners)
    }

    fn targets(
        &self,
        post: &PostSnapshot,
        followers: &[UserId],
        affinity: Vec<UserId>,
    ) -> Vec<Target> {
        // Owner -> (reason, follows author); followers take precedence.
        let mut owners: BTreeMap<UserId, (Reason, bool)> = BTreeMap::new();
        let follower_set: HashSet<&str> = followers.iter().map(String::as_str).collect();

        if followers.len() > self.config.fanout_follower_cap {
            info!(
                author_id = %post.author_id,
                followers = followers.len(),
                cap = self.config.fanout_follower_cap,
                "Author over follower cap, followers pick the post up on recompute"
            );
        } else {
            for follower in followers {
                owners.insert(follower.clone(), (Reason::Following, true));
            }
        }

        for owner in affinity {
            let follows_author = follower_set.contains(owner.as_str());
            owners
                .entry(owner)
                .or_insert((Reason::Personalized, follows_author));
        }

        let mut targets = Vec::new();
        for (owner, (reason, follows_author)) in owners {
            if reason == Reason::Following {
                targets.push(Target {
                    key: FeedKey::new(owner.clone(), FeedType::Following),
                    reason,
                    follows_author,
                });
            }
            targets.push(Target {
                key: FeedKey::new(owner, FeedType::Personalized),
                reason,
                follows_author,
            });
        }
        targets
    }

    async fn push(&self, target: &Target, post: &PostSnapshot, now: DateTime<Utc>) -> Result<Push> {
        let Some(existing) = self.cache.get(&target.key).await? else {
            debug!(feed = %target.key, "Feed never computed, skipping");
            return Ok(Push::Skipped);
        };
        if !existing.preferences.enabled || !existing.preferences.admits(post, now) {
            debug!(feed = %target.key, post_id = %post.id, "Preferences reject post");
            return Ok(Push::Skipped);
        }

        let profile = self.profiles.get(&target.key.owner_id, now).await?;
        let mut active_followees = HashSet::new();
        if target.follows_author {
            active_followees.insert(post.author_id.clone());
        }
        let ctx = OwnerContext {
            owner_id: target.key.owner_id.clone(),
            active_followees,
            profile: (*profile).clone(),
            now,
        };

        let entry = FeedEntry {
            post_id: post.id.clone(),
            author_id: post.author_id.clone(),
            score: scoring::score(post, &ctx, &self.scoring),
            reason: target.reason,
            created_at: post.created_at,
            added_at: now,
        };

        let max_entries = self.config.max_entries;
        let written = self
            .cache
            .update(&target.key, |current| {
                let mut feed = current?;
                feed.upsert(entry, max_entries);
                Some(feed)
            })
            .await?;

        Ok(if written.is_some() {
            Push::Updated
        } else {
            Push::Skipped
        })
    }
}
