use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("Provider {provider} unavailable: {reason}")]
    ProviderUnavailable {
        provider: &'static str,
        reason: String,
    },

    #[error("Recompute failed for {key}: {source}")]
    RecomputeFailure {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Unknown {kind} filter: {id}")]
    InvalidFilter { kind: &'static str, id: String },

    #[error("Corrupted persisted feed {key}: {reason}")]
    CorruptedState { key: String, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unknown feed type: {0}")]
    UnknownFeedType(String),

    #[error("Feed type {0} requires a filter id")]
    MissingFilter(&'static str),

    #[error("Invalid preferences: {0}")]
    InvalidPreferences(String),
}

impl FeedError {
    pub fn code(&self) -> &'static str {
        match self {
            FeedError::ProviderUnavailable { .. } => "ProviderUnavailable",
            FeedError::RecomputeFailure { .. } => "RecomputeFailure",
            FeedError::InvalidFilter { .. } => "InvalidFilter",
            FeedError::CorruptedState { .. } => "CorruptedState",
            FeedError::InvalidConfig(_) => "InvalidConfig",
            FeedError::UnknownFeedType(_) => "UnknownFeedType",
            FeedError::MissingFilter(_) => "MissingFilter",
            FeedError::InvalidPreferences(_) => "InvalidPreferences",
        }
    }

    /// Errors caused by the caller's request rather than by the service.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            FeedError::UnknownFeedType(_)
                | FeedError::MissingFilter(_)
                | FeedError::InvalidPreferences(_)
        )
    }
}
