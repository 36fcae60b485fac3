//! Error types for configuration and the worker loop.

use switchboard_core::ChannelLayerError;

/// Fatal startup-time configuration problems.
///
/// These always surface to the operator; nothing is silently skipped.
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error(
        "cannot register consumer {new_consumer} - channel {channel:?} already consumed by \
         {existing_consumer}"
    )]
    DuplicateChannel {
        channel: String,
        new_consumer: String,
        existing_consumer: String,
    },
    #[error("cannot resolve consumer {reference:?}")]
    UnresolvedConsumer { reference: String },
    #[error("cannot resolve consumer middleware {reference:?}")]
    UnresolvedMiddleware { reference: String },
    #[error("invalid channel name {name:?} for consumer {consumer}")]
    InvalidChannelName {
        name: String,
        consumer: String,
        #[source]
        source: ChannelLayerError,
    },
    #[error("invalid channel filter {pattern:?}: {source}")]
    InvalidChannelFilter {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Errors that stop a worker loop.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// A message arrived on a channel with no consumer. Workers only poll
    /// registered channels, so this is an invariant violation.
    #[error("no consumer registered for channel {channel:?}")]
    Unroutable { channel: String },
    #[error("channel layer error: {0}")]
    Layer(#[from] ChannelLayerError),
    #[error("worker task failed: {0}")]
    Join(String),
}
