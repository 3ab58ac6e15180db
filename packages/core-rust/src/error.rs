//! Error types for the core data model.

/// Errors from parsing an [`Address`](crate::Address).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("address must not be empty")]
    Empty,
    #[error("address must not contain whitespace: {0:?}")]
    Whitespace(String),
}

/// Errors from constructing a [`ChannelEnvelope`](crate::ChannelEnvelope).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("no recipients specified")]
    NoRecipients,
}

/// Errors from validating or loading channel group configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("channel group name must not be empty")]
    MissingGroupName,
    #[error("channel group {group}: the minimum number of workers is 1")]
    MinWorkers { group: String },
    #[error("channel group {group}: max_workers ({max}) must not be less than min_workers ({min})")]
    MaxWorkers { group: String, min: usize, max: usize },
    #[error("channel group {group}: receive_timeout_ms must be positive")]
    ReceiveTimeout { group: String },
    #[error("duplicate channel group name: {0}")]
    DuplicateGroup(String),
    #[error("invalid configuration document: {0}")]
    Parse(#[from] serde_json::Error),
}
