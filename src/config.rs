use chrono::Duration;
use clap::Args;

use crate::{
    error::FeedError,
    scoring::{ScoringConfig, ScoringWeights},
    types::FeedPreferences,
};

/// Ranking knobs, each overridable from the environment.
#[derive(Debug, Clone, Args)]
pub struct RankingArgs {
    #[arg(long, env = "REFRESH_INTERVAL_SECS", default_value = "3600")]
    pub refresh_interval_secs: i64,

    #[arg(long, env = "MAX_ENTRIES", default_value = "100")]
    pub max_entries: usize,

    #[arg(long, env = "PROVIDER_DEADLINE_MS", default_value = "800")]
    pub provider_deadline_ms: u64,

    #[arg(long, env = "PROVIDER_FETCH_LIMIT", default_value = "500")]
    pub provider_fetch_limit: usize,

    #[arg(long, env = "DEFAULT_MAX_AGE_DAYS", default_value = "7")]
    pub default_max_age_days: u32,

    #[arg(long, env = "FANOUT_BATCH_SIZE", default_value = "256")]
    pub fanout_batch_size: usize,

    #[arg(long, env = "FANOUT_CONCURRENCY", default_value = "16")]
    pub fanout_concurrency: usize,

    #[arg(long, env = "FANOUT_FOLLOWER_CAP", default_value = "10000")]
    pub fanout_follower_cap: usize,

    #[arg(long, env = "RETRY_BASE_SECS", default_value = "30")]
    pub retry_base_secs: i64,

    #[arg(long, env = "RETRY_MAX_SECS", default_value = "3600")]
    pub retry_max_secs: i64,

    #[arg(long, env = "HOT_CACHE_CAPACITY", default_value = "10000")]
    pub hot_cache_capacity: u64,

    #[arg(long, env = "WEIGHT_RECENCY", default_value = "0.30")]
    pub weight_recency: f64,

    #[arg(long, env = "WEIGHT_ENGAGEMENT", default_value = "0.25")]
    pub weight_engagement: f64,

    #[arg(long, env = "WEIGHT_AUTHOR_KARMA", default_value = "0.20")]
    pub weight_author_karma: f64,

    #[arg(long, env = "WEIGHT_RELATIONSHIP", default_value = "0.15")]
    pub weight_relationship: f64,

    #[arg(long, env = "WEIGHT_CATEGORY", default_value = "0.05")]
    pub weight_category: f64,

    #[arg(long, env = "WEIGHT_TOPIC", default_value = "0.03")]
    pub weight_topic: f64,

    #[arg(long, env = "WEIGHT_HASHTAG", default_value = "0.02")]
    pub weight_hashtag: f64,

    #[arg(long, env = "RECENCY_HALF_LIFE_HOURS", default_value = "24")]
    pub recency_half_life_hours: f64,

    #[arg(long, env = "ENGAGEMENT_NORMALIZATION", default_value = "100")]
    pub engagement_normalization: f64,
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub refresh_interval: Duration,
    pub max_entries: usize,
    pub provider_deadline: std::time::Duration,
    pub provider_fetch_limit: usize,
    pub default_max_age_days: u32,
    pub fanout_batch_size: usize,
    pub fanout_concurrency: usize,
    /// Authors above this many active followers are not pushed to followers.
    pub fanout_follower_cap: usize,
    pub retry_base: Duration,
    pub retry_max: Duration,
    pub hot_cache_capacity: u64,
    pub profile: ProfileConfig,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::hours(1),
            max_entries: 100,
            provider_deadline: std::time::Duration::from_millis(800),
            provider_fetch_limit: 500,
            default_max_age_days: 7,
            fanout_batch_size: 256,
            fanout_concurrency: 16,
            fanout_follower_cap: 10_000,
            retry_base: Duration::seconds(30),
            retry_max: Duration::hours(1),
            hot_cache_capacity: 10_000,
            profile: ProfileConfig::default(),
        }
    }
}

impl FeedConfig {
    pub fn default_preferences(&self) -> FeedPreferences {
        FeedPreferences {
            max_age_days: self.default_max_age_days,
            ..FeedPreferences::default()
        }
    }

    fn validate(&self) -> Result<(), FeedError> {
        if self.refresh_interval <= Duration::zero() {
            return Err(FeedError::InvalidConfig(
                "refresh interval must be positive".to_string(),
            ));
        }
        if self.max_entries == 0 {
            return Err(FeedError::InvalidConfig(
                "max entries must be at least 1".to_string(),
            ));
        }
        if self.fanout_batch_size == 0 || self.fanout_concurrency == 0 {
            return Err(FeedError::InvalidConfig(
                "fan-out batch size and concurrency must be at least 1".to_string(),
            ));
        }
        self.default_preferences()
            .validate()
            .map_err(|e| FeedError::InvalidConfig(format!("default preferences: {}", e)))?;
        if self.retry_base <= Duration::zero() || self.retry_max < self.retry_base {
            return Err(FeedError::InvalidConfig(
                "retry backoff must be positive and max >= base".to_string(),
            ));
        }
        Ok(())
    }
}

/// Interest profile derivation parameters.
#[derive(Debug, Clone)]
pub struct ProfileConfig {
    pub lookback: Duration,
    pub half_life_days: f64,
    pub min_weight: f64,
    pub max_categories: usize,
    pub max_topics: usize,
    pub max_hashtags: usize,
    pub history_limit: usize,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            lookback: Duration::days(90),
            half_life_days: 30.0,
            min_weight: 0.25,
            max_categories: 5,
            max_topics: 10,
            max_hashtags: 20,
            history_limit: 500,
        }
    }
}

impl RankingArgs {
    pub fn into_configs(self) -> Result<(FeedConfig, ScoringConfig), FeedError> {
        let feed = FeedConfig {
            refresh_interval: Duration::seconds(self.refresh_interval_secs),
            max_entries: self.max_entries,
            provider_deadline: std::time::Duration::from_millis(self.provider_deadline_ms),
            provider_fetch_limit: self.provider_fetch_limit,
            default_max_age_days: self.default_max_age_days,
            fanout_batch_size: self.fanout_batch_size,
            fanout_concurrency: self.fanout_concurrency,
            fanout_follower_cap: self.fanout_follower_cap,
            retry_base: Duration::seconds(self.retry_base_secs),
            retry_max: Duration::seconds(self.retry_max_secs),
            hot_cache_capacity: self.hot_cache_capacity,
            profile: ProfileConfig::default(),
        };
        feed.validate()?;

        let scoring = ScoringConfig::new(
            ScoringWeights {
                recency: self.weight_recency,
                engagement: self.weight_engagement,
                author_karma: self.weight_author_karma,
                relationship: self.weight_relationship,
                category: self.weight_category,
                topic: self.weight_topic,
                hashtag: self.weight_hashtag,
            },
            self.recency_half_life_hours,
            self.engagement_normalization,
        )?;

        Ok((feed, scoring))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestArgs {
        #[command(flatten)]
        ranking: RankingArgs,
    }

    #[test]
    fn test_defaults_parse_and_validate() {
        let args = TestArgs::parse_from(["feed-ranker"]);
        let (feed, scoring) = args.ranking.into_configs().unwrap();
        assert_eq!(feed.refresh_interval, Duration::hours(1));
        assert_eq!(feed.max_entries, 100);
        assert_eq!(scoring.weights, ScoringWeights::default());
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        let args = TestArgs::parse_from(["feed-ranker", "--weight-recency", "0.9"]);
        assert!(matches!(
            args.ranking.into_configs(),
            Err(FeedError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_zero_max_entries_rejected() {
        let args = TestArgs::parse_from(["feed-ranker", "--max-entries", "0"]);
        assert!(args.ranking.into_configs().is_err());
    }

    #[test]
    fn test_default_max_age_days_is_bounded() {
        let args = TestArgs::parse_from(["feed-ranker", "--default-max-age-days", "100000"]);
        assert!(matches!(
            args.ranking.into_configs(),
            Err(FeedError::InvalidConfig(_))
        ));
    }
}
