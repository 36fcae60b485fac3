use async_trait::async_trait;

use crate::types::Content;

/// A message taken off a channel by [`ChannelLayer::receive_many`].
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Name of the channel the message was received on.
    pub channel: String,
    /// Raw message content, exactly as it was sent.
    pub content: Content,
}

/// Errors raised by channel layer operations.
#[derive(Debug, thiserror::Error)]
pub enum ChannelLayerError {
    #[error(
        "channel name must be a valid string of ASCII alphanumerics, hyphens, underscores \
         or periods, not {name:?}"
    )]
    InvalidChannelName { name: String },
    #[error(
        "group name must be a valid string of ASCII alphanumerics, hyphens, underscores \
         or periods, not {name:?}"
    )]
    InvalidGroupName { name: String },
    #[error("channel {channel:?} is at capacity")]
    ChannelFull { channel: String },
    #[error("invalid channel pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },
    #[error("channel layer backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

/// Transport between protocol servers, workers and consumers.
///
/// Implementations must be safe for concurrent use from many workers: a
/// message sent once is delivered by `receive_many` to exactly one caller.
/// Ordering is FIFO within a single channel and unspecified across channels.
#[async_trait]
pub trait ChannelLayer: Send + Sync {
    /// Enqueue `content` on `channel`, creating the channel if needed.
    async fn send(&self, channel: &str, content: Content) -> Result<(), ChannelLayerError>;

    /// Take the first available message from any of `channels`.
    ///
    /// Returns `Ok(None)` when nothing is available: immediately when `block`
    /// is false, or after a backend-defined wait when it is true. `None` is
    /// not an error; callers retry.
    async fn receive_many(
        &self,
        channels: &[String],
        block: bool,
    ) -> Result<Option<Delivery>, ChannelLayerError>;

    /// Create a new, unique channel name starting with `prefix`.
    async fn new_channel(&self, prefix: &str) -> Result<String, ChannelLayerError>;

    /// Add `channel` to `group`.
    async fn group_add(&self, group: &str, channel: &str) -> Result<(), ChannelLayerError>;

    /// Remove `channel` from `group`. Removing a non-member is a no-op.
    async fn group_discard(&self, group: &str, channel: &str) -> Result<(), ChannelLayerError>;

    /// Send `content` to every channel in `group`. Full member channels are
    /// skipped rather than failing the whole broadcast.
    async fn send_group(&self, group: &str, content: Content) -> Result<(), ChannelLayerError>;
}
