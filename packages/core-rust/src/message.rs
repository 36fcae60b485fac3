//! The message envelope handed to consumers.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::channel::{Channel, SentLog, SentRecord};
use crate::layer::ChannelLayer;
use crate::types::{Content, REPLY_CHANNEL_KEY};

/// A message received from a channel, as seen by consumers.
///
/// Content is fixed once the envelope is built. The envelope carries the
/// channel it arrived on, its reply channel (from the `"reply_channel"` key)
/// and a [`SentLog`] scoped to this one dispatch: every send through
/// [`Message::channel`] or [`Message::reply_channel`] is recorded there.
///
/// Cloning is cheap apart from the content and shares the same sent log.
#[derive(Clone)]
pub struct Message {
    content: Arc<Content>,
    channel: Channel,
    reply_channel: Option<Channel>,
    layer: Arc<dyn ChannelLayer>,
    sent: SentLog,
}

impl Message {
    /// Wraps `content` received on `channel_name`.
    #[must_use]
    pub fn new(content: Content, channel_name: &str, layer: Arc<dyn ChannelLayer>) -> Self {
        let sent = SentLog::new();
        let channel = Channel::new(channel_name, Arc::clone(&layer)).with_sent_log(sent.clone());
        let reply_channel = content
            .get(REPLY_CHANNEL_KEY)
            .and_then(Value::as_str)
            .map(|name| Channel::new(name, Arc::clone(&layer)).with_sent_log(sent.clone()));
        Self {
            content: Arc::new(content),
            channel,
            reply_channel,
            layer,
            sent,
        }
    }

    /// The raw content.
    #[must_use]
    pub fn content(&self) -> &Content {
        &self.content
    }

    /// Looks up a top-level content key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.content.get(key)
    }

    /// Whether the content has a top-level `key`.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.content.contains_key(key)
    }

    /// The channel this message was received on.
    #[must_use]
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Name of the channel this message was received on.
    #[must_use]
    pub fn channel_name(&self) -> &str {
        self.channel.name()
    }

    /// The channel responses should be sent to, if the message names one.
    #[must_use]
    pub fn reply_channel(&self) -> Option<&Channel> {
        self.reply_channel.as_ref()
    }

    /// The channel layer the message came from.
    #[must_use]
    pub fn layer(&self) -> &Arc<dyn ChannelLayer> {
        &self.layer
    }

    /// The per-dispatch sent-message log.
    #[must_use]
    pub fn sent_log(&self) -> &SentLog {
        &self.sent
    }

    /// Messages sent through this envelope's channel handles so far.
    #[must_use]
    pub fn sent_messages(&self) -> Vec<SentRecord> {
        self.sent.entries()
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("channel", &self.channel.name())
            .field("reply_channel", &self.reply_channel.as_ref().map(Channel::name))
            .field("content", &self.content)
            .finish_non_exhaustive()
    }
}
