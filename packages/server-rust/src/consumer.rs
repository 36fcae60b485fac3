//! The consumer contract: handlers bound to channels.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use switchboard_core::{ChannelLayerError, Message};

/// Routing keyword arguments bound to a consumer at registration.
pub type Kwargs = BTreeMap<String, String>;

/// How a consumer finished with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// The message was handled.
    Processed,
    /// The message cannot be handled yet; put it back on its channel
    /// unchanged (e.g. an earlier message of the same connection is pending).
    Defer,
    /// The connection should be rejected.
    Deny,
}

/// Unexpected consumer failures. The worker logs them and drops the message.
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("channel layer error: {0}")]
    Layer(#[from] ChannelLayerError),
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result of one consumer invocation.
pub type ConsumeResult = Result<Outcome, ConsumerError>;

/// Shared handle to a registered consumer.
pub type ConsumerHandle = Arc<dyn Consumer>;

/// A handler for messages arriving on one or more channels.
#[async_trait]
pub trait Consumer: Send + Sync + 'static {
    /// Human-readable identity used in logs and configuration errors.
    fn name(&self) -> Cow<'static, str> {
        Cow::Borrowed(std::any::type_name::<Self>())
    }

    /// Handle one message.
    async fn consume(&self, message: &Message, kwargs: &Kwargs) -> ConsumeResult;
}

// ---------------------------------------------------------------------------
// FnConsumer
// ---------------------------------------------------------------------------

/// A consumer built from an async closure.
///
/// The closure receives a clone of the envelope (which shares the dispatch's
/// sent log) and the routing kwargs.
pub struct FnConsumer<F> {
    name: Cow<'static, str>,
    f: F,
}

/// Wraps an async closure as a named consumer.
pub fn consumer_fn<F, Fut>(name: impl Into<Cow<'static, str>>, f: F) -> Arc<FnConsumer<F>>
where
    F: Fn(Message, Kwargs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ConsumeResult> + Send + 'static,
{
    Arc::new(FnConsumer {
        name: name.into(),
        f,
    })
}

#[async_trait]
impl<F, Fut> Consumer for FnConsumer<F>
where
    F: Fn(Message, Kwargs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ConsumeResult> + Send + 'static,
{
    fn name(&self) -> Cow<'static, str> {
        self.name.clone()
    }

    async fn consume(&self, message: &Message, kwargs: &Kwargs) -> ConsumeResult {
        (self.f)(message.clone(), kwargs.clone()).await
    }
}
