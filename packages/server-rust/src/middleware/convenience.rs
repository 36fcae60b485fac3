//! Built-in outermost middleware stage.
//!
//! Resets the dispatch's sent log on entry and exit, and turns a `Deny`
//! outcome on a connect message into an `{"accept": false}` reply.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use switchboard_core::{content_from, Message};
use tower::Layer;
use tracing::{debug, warn};

use super::chain::{Handler, HandlerRef};
use crate::consumer::{ConsumeResult, Outcome};

/// Channel carrying new WebSocket connection requests.
pub const WEBSOCKET_CONNECT: &str = "websocket.connect";

// ---------------------------------------------------------------------------
// ConvenienceLayer
// ---------------------------------------------------------------------------

/// Tower layer installing [`ConvenienceHandler`] around the next stage.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConvenienceLayer;

impl Layer<HandlerRef> for ConvenienceLayer {
    type Service = HandlerRef;

    fn layer(&self, inner: HandlerRef) -> HandlerRef {
        Arc::new(ConvenienceHandler { inner })
    }
}

// ---------------------------------------------------------------------------
// ConvenienceHandler
// ---------------------------------------------------------------------------

/// Wraps the inner chain with sent-log bookkeeping and connect rejection.
pub struct ConvenienceHandler {
    inner: HandlerRef,
}

#[async_trait]
impl Handler for ConvenienceHandler {
    async fn call(&self, message: &Message) -> ConsumeResult {
        let sent = message.sent_log();
        sent.reset();

        let result = self.inner.call(message).await;

        debug!(
            channel = message.channel_name(),
            sent = sent.len(),
            "dispatch sent messages"
        );

        let result = match result {
            Ok(Outcome::Deny) if message.channel_name() == WEBSOCKET_CONNECT => {
                reject_connection(message).await
            }
            other => other,
        };

        sent.reset();
        result
    }
}

/// Sends `{"accept": false}` on the reply channel of a denied connect.
async fn reject_connection(message: &Message) -> ConsumeResult {
    match message.reply_channel() {
        Some(reply) => {
            reply.send(content_from(json!({"accept": false}))).await?;
        }
        None => warn!(
            channel = message.channel_name(),
            "denied connection has no reply channel"
        ),
    }
    Ok(Outcome::Processed)
}

#[cfg(test)]
mod tests {
    use serde_json::Value;
    use switchboard_core::{ChannelLayer, InMemoryChannelLayer};

    use super::*;
    use crate::consumer::{consumer_fn, Kwargs};
    use crate::middleware::MiddlewareChain;

    fn layer() -> Arc<InMemoryChannelLayer> {
        Arc::new(InMemoryChannelLayer::default())
    }

    #[tokio::test]
    async fn denied_connect_replies_with_accept_false() {
        let layer = layer();
        let message = Message::new(
            content_from(json!({"reply_channel": "websocket.send!abc", "path": "/"})),
            WEBSOCKET_CONNECT,
            layer.clone(),
        );
        let deny = consumer_fn("deny", |_message, _kwargs| async { Ok(Outcome::Deny) });

        let handler = MiddlewareChain::new().make_chain(deny, Kwargs::new());
        assert_eq!(handler.call(&message).await.unwrap(), Outcome::Processed);

        let delivery = layer
            .receive_many(&["websocket.send!".to_string()], false)
            .await
            .unwrap()
            .expect("reply was sent");
        assert_eq!(delivery.channel, "websocket.send!abc");
        assert_eq!(Value::Object(delivery.content), json!({"accept": false}));
    }

    #[tokio::test]
    async fn deny_elsewhere_is_passed_through() {
        let message = Message::new(content_from(json!({})), "chat", layer());
        let deny = consumer_fn("deny", |_message, _kwargs| async { Ok(Outcome::Deny) });

        let handler = MiddlewareChain::new().make_chain(deny, Kwargs::new());
        assert_eq!(handler.call(&message).await.unwrap(), Outcome::Deny);
    }

    #[tokio::test]
    async fn denied_connect_without_reply_channel_is_processed() {
        let message = Message::new(content_from(json!({})), WEBSOCKET_CONNECT, layer());
        let deny = consumer_fn("deny", |_message, _kwargs| async { Ok(Outcome::Deny) });

        let handler = MiddlewareChain::new().make_chain(deny, Kwargs::new());
        assert_eq!(handler.call(&message).await.unwrap(), Outcome::Processed);
    }

    #[tokio::test]
    async fn sent_log_is_reset_around_each_dispatch() {
        let layer = layer();
        let message = Message::new(
            content_from(json!({"reply_channel": "websocket.send!abc"})),
            "chat",
            layer.clone(),
        );
        message.sent_log().record("stale", vec!["text".to_string()]);

        let seen = Arc::new(parking_lot::Mutex::new(None));
        let observed = Arc::clone(&seen);
        let consumer = consumer_fn("echo", move |message: Message, _kwargs| {
            let observed = Arc::clone(&observed);
            async move {
                let before = message.sent_messages().len();
                if let Some(reply) = message.reply_channel() {
                    reply.send(content_from(json!({"text": "hi"}))).await?;
                }
                *observed.lock() = Some((before, message.sent_messages().len()));
                Ok(Outcome::Processed)
            }
        });

        let handler = MiddlewareChain::new().make_chain(consumer, Kwargs::new());
        handler.call(&message).await.unwrap();

        assert_eq!(*seen.lock(), Some((0, 1)));
        assert!(message.sent_log().is_empty());
    }
}
