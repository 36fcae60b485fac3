//! Channel and group handles bound to a channel layer.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::layer::{ChannelLayer, ChannelLayerError};
use crate::names::{validate_channel_name, validate_group_name};
use crate::types::{content_keys, Content};

// ---------------------------------------------------------------------------
// SentLog
// ---------------------------------------------------------------------------

/// One message sent through a [`Channel`] handle during a dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentRecord {
    /// Destination channel.
    pub channel: String,
    /// Top-level keys of the sent content.
    pub keys: Vec<String>,
}

/// Bookkeeping of messages sent while one message is being dispatched.
///
/// A log belongs to exactly one dispatch: the worker creates it with the
/// `Message` and every channel handle derived from that message shares it.
/// It is diagnostic only; group sends are not recorded.
#[derive(Debug, Clone, Default)]
pub struct SentLog {
    entries: Arc<Mutex<Vec<SentRecord>>>,
}

impl SentLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a record.
    pub fn record(&self, channel: &str, keys: Vec<String>) {
        self.entries.lock().push(SentRecord {
            channel: channel.to_string(),
            keys,
        });
    }

    /// Discards all records.
    pub fn reset(&self) {
        self.entries.lock().clear();
    }

    /// Copy of the current records.
    #[must_use]
    pub fn entries(&self) -> Vec<SentRecord> {
        self.entries.lock().clone()
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no messages have been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// A named channel on a specific layer.
///
/// Handles derived from a `Message` (its own channel and its reply channel)
/// record every send in the message's [`SentLog`].
#[derive(Clone)]
pub struct Channel {
    name: String,
    layer: Arc<dyn ChannelLayer>,
    sent: Option<SentLog>,
}

impl Channel {
    /// Creates a handle for `name` on `layer`.
    #[must_use]
    pub fn new(name: impl Into<String>, layer: Arc<dyn ChannelLayer>) -> Self {
        Self {
            name: name.into(),
            layer,
            sent: None,
        }
    }

    /// Attaches a sent-message log to this handle.
    #[must_use]
    pub fn with_sent_log(mut self, sent: SentLog) -> Self {
        self.sent = Some(sent);
        self
    }

    /// The channel name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The layer this channel lives on.
    #[must_use]
    pub fn layer(&self) -> &Arc<dyn ChannelLayer> {
        &self.layer
    }

    /// Sends `content` on this channel.
    ///
    /// # Errors
    ///
    /// Propagates layer errors (invalid name, channel full, backend failure).
    pub async fn send(&self, content: Content) -> Result<(), ChannelLayerError> {
        validate_channel_name(&self.name, false)?;
        let keys = self.sent.as_ref().map(|_| content_keys(&content));
        self.layer.send(&self.name, content).await?;
        if let (Some(sent), Some(keys)) = (&self.sent, keys) {
            sent.record(&self.name, keys);
        }
        Ok(())
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel").field("name", &self.name).finish_non_exhaustive()
    }
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

// ---------------------------------------------------------------------------
// Group
// ---------------------------------------------------------------------------

/// A named set of channels for broadcast sends.
#[derive(Clone)]
pub struct Group {
    name: String,
    layer: Arc<dyn ChannelLayer>,
}

impl Group {
    /// Creates a handle for group `name` on `layer`.
    #[must_use]
    pub fn new(name: impl Into<String>, layer: Arc<dyn ChannelLayer>) -> Self {
        Self {
            name: name.into(),
            layer,
        }
    }

    /// The group name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds `channel` to the group.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid group or channel names, or on backend failure.
    pub async fn add(&self, channel: &str) -> Result<(), ChannelLayerError> {
        validate_group_name(&self.name)?;
        self.layer.group_add(&self.name, channel).await
    }

    /// Removes `channel` from the group.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid group or channel names, or on backend failure.
    pub async fn discard(&self, channel: &str) -> Result<(), ChannelLayerError> {
        validate_group_name(&self.name)?;
        self.layer.group_discard(&self.name, channel).await
    }

    /// Sends `content` to every member channel.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid group name or on backend failure.
    pub async fn send(&self, content: Content) -> Result<(), ChannelLayerError> {
        validate_group_name(&self.name)?;
        self.layer.send_group(&self.name, content).await
    }
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group").field("name", &self.name).finish_non_exhaustive()
    }
}
