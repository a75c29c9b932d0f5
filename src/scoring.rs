//! Post scoring.
//!
//! A score is a weighted sum of independently normalized factors, each in
//! [0, 1], with weights that sum to 1:
//! - Recency: `exp(-age / half_life)`
//! - Engagement: `min(1, (reactions + 3 * comments + 5 * shares) / normalization)`
//! - Author karma: fixed step value per karma level
//! - Relationship: 1 when the owner wrote the post or actively follows the author
//! - Category / topic / hashtag: 1 when the post hits the owner's affinities
//!
//! Scoring is pure: the same post and context always produce the same score.

use chrono::{DateTime, Utc};
use std::collections::HashSet;

use crate::{
    error::FeedError,
    types::{InterestProfile, KarmaLevel, PostSnapshot, Reason, UserId},
};

const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoringWeights {
    pub recency: f64,
    pub engagement: f64,
    pub author_karma: f64,
    pub relationship: f64,
    pub category: f64,
    pub topic: f64,
    pub hashtag: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            recency: 0.30,
            engagement: 0.25,
            author_karma: 0.20,
            relationship: 0.15,
            category: 0.05,
            topic: 0.03,
            hashtag: 0.02,
        }
    }
}

impl ScoringWeights {
    fn as_array(&self) -> [f64; 7] {
        [
            self.recency,
            self.engagement,
            self.author_karma,
            self.relationship,
            self.category,
            self.topic,
            self.hashtag,
        ]
    }
}

/// Immutable scoring parameters, passed explicitly on every call.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoringConfig {
    pub weights: ScoringWeights,
    pub recency_half_life_hours: f64,
    pub engagement_normalization: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            weights: ScoringWeights::default(),
            recency_half_life_hours: 24.0,
            engagement_normalization: 100.0,
        }
    }
}

impl ScoringConfig {
    pub fn new(
        weights: ScoringWeights,
        recency_half_life_hours: f64,
        engagement_normalization: f64,
    ) -> Result<Self, FeedError> {
        let values = weights.as_array();
        if values.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(FeedError::InvalidConfig(
                "scoring weights must be finite and non-negative".to_string(),
            ));
        }
        let sum: f64 = values.iter().sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(FeedError::InvalidConfig(format!(
                "scoring weights must sum to 1, got {}",
                sum
            )));
        }
        if !(recency_half_life_hours.is_finite() && recency_half_life_hours > 0.0) {
            return Err(FeedError::InvalidConfig(
                "recency half-life must be positive".to_string(),
            ));
        }
        if !(engagement_normalization.is_finite() && engagement_normalization > 0.0) {
            return Err(FeedError::InvalidConfig(
                "engagement normalization must be positive".to_string(),
            ));
        }

        Ok(Self {
            weights,
            recency_half_life_hours,
            engagement_normalization,
        })
    }
}

/// Everything about the feed owner that scoring depends on.
#[derive(Debug, Clone)]
pub struct OwnerContext {
    pub owner_id: UserId,
    pub active_followees: HashSet<UserId>,
    pub profile: InterestProfile,
    pub now: DateTime<Utc>,
}

impl OwnerContext {
    pub fn follows_or_is(&self, author_id: &str) -> bool {
        author_id == self.owner_id || self.active_followees.contains(author_id)
    }
}

/// Per-factor weighted contributions of one score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreBreakdown {
    pub recency: f64,
    pub engagement: f64,
    pub author_karma: f64,
    pub relationship: f64,
    pub category: f64,
    pub topic: f64,
    pub hashtag: f64,
}

impl ScoreBreakdown {
    pub fn total(&self) -> f64 {
        let sum = self.recency
            + self.engagement
            + self.author_karma
            + self.relationship
            + self.category
            + self.topic
            + self.hashtag;
        if sum.is_nan() {
            0.0
        } else {
            sum.clamp(0.0, 1.0)
        }
    }

    /// Largest content-intrinsic factor, used to label exploratory entries.
    pub fn dominant_reason(&self) -> Reason {
        let mut best = (Reason::Recency, self.recency);
        for candidate in [
            (Reason::Engagement, self.engagement),
            (Reason::Karma, self.author_karma),
        ] {
            if candidate.1 > best.1 {
                best = candidate;
            }
        }
        best.0
    }
}

pub fn karma_factor(level: KarmaLevel) -> f64 {
    match level {
        KarmaLevel::Newbie => 0.0,
        KarmaLevel::Apprentice => 0.1,
        KarmaLevel::Contributor => 0.25,
        KarmaLevel::Regular => 0.4,
        KarmaLevel::Expert => 0.6,
        KarmaLevel::Master => 0.8,
        KarmaLevel::Titan => 1.0,
    }
}

pub fn recency_factor(post: &PostSnapshot, now: DateTime<Utc>, half_life_hours: f64) -> f64 {
    // Posts stamped in the future count as brand new.
    let age_hours = (now - post.created_at).num_seconds().max(0) as f64 / 3600.0;
    (-age_hours / half_life_hours).exp()
}

pub fn engagement_factor(post: &PostSnapshot, normalization: f64) -> f64 {
    let raw = post.reactions_count as f64
        + post.comment_count as f64 * 3.0
        + post.share_count as f64 * 5.0;
    (raw / normalization).min(1.0)
}

pub fn breakdown(
    post: &PostSnapshot,
    ctx: &OwnerContext,
    config: &ScoringConfig,
) -> ScoreBreakdown {
    let w = &config.weights;
    let indicator = |hit: bool| if hit { 1.0 } else { 0.0 };
    let profile = &ctx.profile;

    ScoreBreakdown {
        recency: w.recency * recency_factor(post, ctx.now, config.recency_half_life_hours),
        engagement: w.engagement * engagement_factor(post, config.engagement_normalization),
        author_karma: w.author_karma * karma_factor(post.author_karma_level),
        relationship: w.relationship * indicator(ctx.follows_or_is(&post.author_id)),
        category: w.category
            * indicator(
                post.category_id
                    .as_ref()
                    .is_some_and(|c| profile.categories.contains(c)),
            ),
        topic: w.topic
            * indicator(
                post.topic_id
                    .as_ref()
                    .is_some_and(|t| profile.topics.contains(t)),
            ),
        hashtag: w.hashtag
            * indicator(post.hashtags.iter().any(|h| profile.hashtags.contains(h))),
    }
}

/// Score of `post` for the owner described by `ctx`, in [0, 1].
pub fn score(post: &PostSnapshot, ctx: &OwnerContext, config: &ScoringConfig) -> f64 {
    breakdown(post, ctx, config).total()
}
