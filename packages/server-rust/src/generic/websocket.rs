//! WebSocket consumers built from connect / receive / disconnect callbacks.
//!
//! [`WebsocketConsumer`] routes the three WebSocket channels to a
//! [`WebsocketHandler`], keeps the connection's reply channel in the
//! handler's groups for the connection's lifetime, and decodes frames.
//! Binary frames travel base64-encoded under the `"bytes"` key.

use std::borrow::Cow;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};
use switchboard_core::{content_from, Content, Group, Message};
use tracing::debug;

use crate::consumer::{ConsumeResult, Consumer, ConsumerError, ConsumerHandle, Kwargs, Outcome};
use crate::error::ConfigurationError;
use crate::middleware::WEBSOCKET_CONNECT;
use crate::ordering::{enforce_ordering, OrderingMode, WEBSOCKET_DISCONNECT};
use crate::registry::ConsumerRegistry;

/// Channel carrying frames received from a client.
pub const WEBSOCKET_RECEIVE: &str = "websocket.receive";

const TEXT_KEY: &str = "text";
const BYTES_KEY: &str = "bytes";
const PATH_KEY: &str = "path";

/// One decoded WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Bytes(Vec<u8>),
}

impl Frame {
    fn decode(message: &Message) -> Result<Self, ConsumerError> {
        if let Some(text) = message.get(TEXT_KEY) {
            return text
                .as_str()
                .map(|text| Self::Text(text.to_string()))
                .ok_or_else(|| ConsumerError::InvalidMessage("\"text\" is not a string".into()));
        }
        let encoded = message
            .get(BYTES_KEY)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ConsumerError::InvalidMessage("frame has neither \"text\" nor \"bytes\"".into())
            })?;
        BASE64
            .decode(encoded)
            .map(Self::Bytes)
            .map_err(|e| ConsumerError::InvalidMessage(format!("invalid base64 frame: {e}")))
    }

    fn into_content(self) -> Content {
        match self {
            Self::Text(text) => content_from(json!({ TEXT_KEY: text })),
            Self::Bytes(bytes) => content_from(json!({ BYTES_KEY: BASE64.encode(bytes) })),
        }
    }
}

// ---------------------------------------------------------------------------
// WebsocketContext
// ---------------------------------------------------------------------------

/// What a handler sees of the current message, plus reply helpers.
pub struct WebsocketContext<'a> {
    message: &'a Message,
    kwargs: &'a Kwargs,
}

impl<'a> WebsocketContext<'a> {
    #[must_use]
    pub fn new(message: &'a Message, kwargs: &'a Kwargs) -> Self {
        Self { message, kwargs }
    }

    #[must_use]
    pub fn message(&self) -> &'a Message {
        self.message
    }

    #[must_use]
    pub fn kwargs(&self) -> &'a Kwargs {
        self.kwargs
    }

    /// The request path, when the protocol server supplied one.
    #[must_use]
    pub fn path(&self) -> Option<&'a str> {
        self.message.get(PATH_KEY).and_then(Value::as_str)
    }

    /// Sends a text frame back down the connection.
    ///
    /// # Errors
    ///
    /// `InvalidMessage` if the message has no reply channel, or a layer error.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), ConsumerError> {
        self.send_frame(Frame::Text(text.into())).await
    }

    /// Sends a binary frame back down the connection.
    ///
    /// # Errors
    ///
    /// Same as [`send_text`](Self::send_text).
    pub async fn send_bytes(&self, bytes: impl Into<Vec<u8>>) -> Result<(), ConsumerError> {
        self.send_frame(Frame::Bytes(bytes.into())).await
    }

    /// Sends `value` as a JSON text frame.
    ///
    /// # Errors
    ///
    /// Same as [`send_text`](Self::send_text).
    pub async fn send_json(&self, value: &Value) -> Result<(), ConsumerError> {
        self.send_text(value.to_string()).await
    }

    /// Sends a text frame to every member of group `name`.
    ///
    /// # Errors
    ///
    /// Invalid group name or layer failure.
    pub async fn group_send_text(
        &self,
        name: &str,
        text: impl Into<String>,
    ) -> Result<(), ConsumerError> {
        self.group(name)
            .send(Frame::Text(text.into()).into_content())
            .await
            .map_err(ConsumerError::from)
    }

    /// Sends a binary frame to every member of group `name`.
    ///
    /// # Errors
    ///
    /// Invalid group name or layer failure.
    pub async fn group_send_bytes(
        &self,
        name: &str,
        bytes: impl Into<Vec<u8>>,
    ) -> Result<(), ConsumerError> {
        self.group(name)
            .send(Frame::Bytes(bytes.into()).into_content())
            .await
            .map_err(ConsumerError::from)
    }

    /// Sends `value` as a JSON text frame to every member of group `name`.
    ///
    /// # Errors
    ///
    /// Invalid group name or layer failure.
    pub async fn group_send_json(&self, name: &str, value: &Value) -> Result<(), ConsumerError> {
        self.group_send_text(name, value.to_string()).await
    }

    fn group(&self, name: &str) -> Group {
        Group::new(name, Arc::clone(self.message.layer()))
    }

    fn reply_channel_name(&self) -> Result<&'a str, ConsumerError> {
        self.message
            .reply_channel()
            .map(|channel| channel.name())
            .ok_or_else(|| {
                ConsumerError::InvalidMessage(format!(
                    "message on {} has no reply channel",
                    self.message.channel_name()
                ))
            })
    }

    async fn send_frame(&self, frame: Frame) -> Result<(), ConsumerError> {
        let reply = self.message.reply_channel().ok_or_else(|| {
            ConsumerError::InvalidMessage(format!(
                "cannot reply to message on {}: no reply channel",
                self.message.channel_name()
            ))
        })?;
        reply.send(frame.into_content()).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// WebsocketHandler
// ---------------------------------------------------------------------------

/// Application callbacks for a WebSocket endpoint.
#[async_trait]
pub trait WebsocketHandler: Send + Sync + 'static {
    /// Groups the connection joins on connect and leaves on disconnect.
    fn connection_groups(&self, _kwargs: &Kwargs) -> Vec<String> {
        Vec::new()
    }

    /// Called when a connection opens. Return `Outcome::Deny` to reject it.
    async fn connect(&self, _ctx: &WebsocketContext<'_>) -> ConsumeResult {
        Ok(Outcome::Processed)
    }

    /// Called with each decoded frame.
    async fn receive(&self, ctx: &WebsocketContext<'_>, frame: Frame) -> ConsumeResult;

    /// Called when a connection closes.
    async fn disconnect(&self, _ctx: &WebsocketContext<'_>) -> ConsumeResult {
        Ok(Outcome::Processed)
    }
}

// ---------------------------------------------------------------------------
// WebsocketConsumer
// ---------------------------------------------------------------------------

/// Adapts a [`WebsocketHandler`] to the three WebSocket channels.
pub struct WebsocketConsumer<H> {
    handler: H,
    ordering: Option<OrderingMode>,
}

impl<H: WebsocketHandler> WebsocketConsumer<H> {
    #[must_use]
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            ordering: None,
        }
    }

    /// Process each connection's messages strictly in `"order"` token order.
    #[must_use]
    pub fn strict_ordering(mut self) -> Self {
        self.ordering = Some(OrderingMode::Strict);
        self
    }

    /// Only require a connection's connect message to be processed first.
    #[must_use]
    pub fn slight_ordering(mut self) -> Self {
        self.ordering = Some(OrderingMode::Slight);
        self
    }

    #[must_use]
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Channels this consumer handles.
    #[must_use]
    pub fn channel_names() -> [&'static str; 3] {
        [WEBSOCKET_CONNECT, WEBSOCKET_RECEIVE, WEBSOCKET_DISCONNECT]
    }

    /// The registrable consumer, wrapped in ordering enforcement if requested.
    #[must_use]
    pub fn into_consumer(self) -> ConsumerHandle {
        match self.ordering {
            Some(mode) => Arc::new(enforce_ordering(Arc::new(self), mode)),
            None => Arc::new(self),
        }
    }

    /// Registers this consumer on [`channel_names`](Self::channel_names).
    ///
    /// # Errors
    ///
    /// `DuplicateChannel` if any WebSocket channel already has a consumer.
    pub fn register(self, registry: &ConsumerRegistry) -> Result<(), ConfigurationError> {
        registry.add_consumer(self.into_consumer(), Self::channel_names())
    }

    async fn join_groups(&self, ctx: &WebsocketContext<'_>) -> Result<(), ConsumerError> {
        let groups = self.handler.connection_groups(ctx.kwargs());
        if groups.is_empty() {
            return Ok(());
        }
        let reply = ctx.reply_channel_name()?;
        for name in groups {
            ctx.group(&name).add(reply).await?;
        }
        Ok(())
    }

    async fn leave_groups(&self, ctx: &WebsocketContext<'_>) -> Result<(), ConsumerError> {
        let groups = self.handler.connection_groups(ctx.kwargs());
        if groups.is_empty() {
            return Ok(());
        }
        let reply = ctx.reply_channel_name()?;
        for name in groups {
            ctx.group(&name).discard(reply).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<H: WebsocketHandler> Consumer for WebsocketConsumer<H> {
    fn name(&self) -> Cow<'static, str> {
        Cow::Borrowed(std::any::type_name::<H>())
    }

    async fn consume(&self, message: &Message, kwargs: &Kwargs) -> ConsumeResult {
        let ctx = WebsocketContext::new(message, kwargs);
        match message.channel_name() {
            WEBSOCKET_CONNECT => {
                self.join_groups(&ctx).await?;
                self.handler.connect(&ctx).await
            }
            WEBSOCKET_RECEIVE => {
                let frame = Frame::decode(message)?;
                self.handler.receive(&ctx, frame).await
            }
            WEBSOCKET_DISCONNECT => {
                self.leave_groups(&ctx).await?;
                self.handler.disconnect(&ctx).await
            }
            other => {
                debug!(channel = other, "websocket consumer routed a non-websocket channel");
                Err(ConsumerError::InvalidMessage(format!(
                    "websocket consumer cannot handle channel {other}"
                )))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// JSON
// ---------------------------------------------------------------------------

/// A [`WebsocketHandler`] whose text frames carry JSON documents.
#[async_trait]
pub trait JsonWebsocketHandler: Send + Sync + 'static {
    fn connection_groups(&self, _kwargs: &Kwargs) -> Vec<String> {
        Vec::new()
    }

    async fn connect(&self, _ctx: &WebsocketContext<'_>) -> ConsumeResult {
        Ok(Outcome::Processed)
    }

    /// Called with each decoded JSON document.
    async fn receive_json(&self, ctx: &WebsocketContext<'_>, content: Value) -> ConsumeResult;

    async fn disconnect(&self, _ctx: &WebsocketContext<'_>) -> ConsumeResult {
        Ok(Outcome::Processed)
    }
}

/// Adapts a [`JsonWebsocketHandler`] to [`WebsocketHandler`].
///
/// Binary frames are rejected with `ConsumerError::InvalidMessage`.
#[derive(Debug, Clone, Default)]
pub struct Json<H>(pub H);

#[async_trait]
impl<H: JsonWebsocketHandler> WebsocketHandler for Json<H> {
    fn connection_groups(&self, kwargs: &Kwargs) -> Vec<String> {
        self.0.connection_groups(kwargs)
    }

    async fn connect(&self, ctx: &WebsocketContext<'_>) -> ConsumeResult {
        self.0.connect(ctx).await
    }

    async fn receive(&self, ctx: &WebsocketContext<'_>, frame: Frame) -> ConsumeResult {
        let Frame::Text(text) = frame else {
            return Err(ConsumerError::InvalidMessage(
                "no text section for incoming websocket frame".into(),
            ));
        };
        let content = serde_json::from_str(&text)
            .map_err(|e| ConsumerError::InvalidMessage(format!("invalid JSON frame: {e}")))?;
        self.0.receive_json(ctx, content).await
    }

    async fn disconnect(&self, ctx: &WebsocketContext<'_>) -> ConsumeResult {
        self.0.disconnect(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use switchboard_core::{ChannelLayer, InMemoryChannelLayer};

    use super::*;

    const REPLY: &str = "websocket.send!client1";

    struct Echo;

    #[async_trait]
    impl WebsocketHandler for Echo {
        fn connection_groups(&self, kwargs: &Kwargs) -> Vec<String> {
            vec![kwargs.get("room").cloned().unwrap_or_else(|| "lobby".to_string())]
        }

        async fn receive(&self, ctx: &WebsocketContext<'_>, frame: Frame) -> ConsumeResult {
            match frame {
                Frame::Text(text) => ctx.send_text(text).await?,
                Frame::Bytes(bytes) => ctx.send_bytes(bytes).await?,
            }
            Ok(Outcome::Processed)
        }
    }

    struct Recorder {
        seen: Arc<Mutex<Vec<Value>>>,
    }

    #[async_trait]
    impl JsonWebsocketHandler for Recorder {
        async fn receive_json(&self, ctx: &WebsocketContext<'_>, content: Value) -> ConsumeResult {
            self.seen.lock().push(content.clone());
            ctx.send_json(&json!({"ack": content})).await?;
            Ok(Outcome::Processed)
        }
    }

    fn layer() -> Arc<InMemoryChannelLayer> {
        Arc::new(InMemoryChannelLayer::default())
    }

    fn message(layer: &Arc<InMemoryChannelLayer>, channel: &str, extra: Value) -> Message {
        let mut content = content_from(json!({"reply_channel": REPLY, "path": "/chat/"}));
        content.extend(content_from(extra));
        Message::new(content, channel, layer.clone())
    }

    async fn next_reply(layer: &InMemoryChannelLayer) -> Value {
        let delivery = layer
            .receive_many(&["websocket.send!".to_string()], false)
            .await
            .unwrap()
            .expect("a reply was sent");
        assert_eq!(delivery.channel, REPLY);
        Value::Object(delivery.content)
    }

    #[tokio::test]
    async fn connect_and_disconnect_manage_group_membership() {
        let layer = layer();
        let consumer = WebsocketConsumer::new(Echo);
        let mut kwargs = Kwargs::new();
        kwargs.insert("room".to_string(), "general".to_string());

        let connect = message(&layer, WEBSOCKET_CONNECT, json!({}));
        assert_eq!(consumer.consume(&connect, &kwargs).await.unwrap(), Outcome::Processed);
        assert_eq!(layer.group_members("general"), vec![REPLY.to_string()]);

        let disconnect = message(&layer, WEBSOCKET_DISCONNECT, json!({}));
        consumer.consume(&disconnect, &kwargs).await.unwrap();
        assert!(layer.group_members("general").is_empty());
    }

    #[tokio::test]
    async fn text_and_binary_frames_are_echoed() {
        let layer = layer();
        let consumer = WebsocketConsumer::new(Echo);

        let text = message(&layer, WEBSOCKET_RECEIVE, json!({"text": "hello"}));
        consumer.consume(&text, &Kwargs::new()).await.unwrap();
        assert_eq!(next_reply(&layer).await, json!({"text": "hello"}));

        let encoded = BASE64.encode([0u8, 159, 146, 150]);
        let binary = message(&layer, WEBSOCKET_RECEIVE, json!({"bytes": encoded}));
        consumer.consume(&binary, &Kwargs::new()).await.unwrap();
        assert_eq!(next_reply(&layer).await, json!({"bytes": encoded}));
    }

    #[tokio::test]
    async fn frame_without_payload_is_invalid() {
        let layer = layer();
        let consumer = WebsocketConsumer::new(Echo);
        let empty = message(&layer, WEBSOCKET_RECEIVE, json!({}));
        assert!(matches!(
            consumer.consume(&empty, &Kwargs::new()).await,
            Err(ConsumerError::InvalidMessage(_))
        ));
    }

    #[tokio::test]
    async fn group_send_reaches_members() {
        let layer = layer();
        let connect = message(&layer, WEBSOCKET_CONNECT, json!({}));
        WebsocketConsumer::new(Echo)
            .consume(&connect, &Kwargs::new())
            .await
            .unwrap();

        let kwargs = Kwargs::new();
        let ctx = WebsocketContext::new(&connect, &kwargs);
        assert_eq!(ctx.path(), Some("/chat/"));
        ctx.group_send_text("lobby", "broadcast").await.unwrap();
        assert_eq!(next_reply(&layer).await, json!({"text": "broadcast"}));
    }

    #[tokio::test]
    async fn json_handler_decodes_and_encodes() {
        let layer = layer();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let consumer = WebsocketConsumer::new(Json(Recorder {
            seen: Arc::clone(&seen),
        }));

        let frame = message(&layer, WEBSOCKET_RECEIVE, json!({"text": "{\"n\": 1}"}));
        consumer.consume(&frame, &Kwargs::new()).await.unwrap();
        assert_eq!(*seen.lock(), vec![json!({"n": 1})]);

        let reply = next_reply(&layer).await;
        let text = reply["text"].as_str().unwrap();
        assert_eq!(serde_json::from_str::<Value>(text).unwrap(), json!({"ack": {"n": 1}}));

        let binary = message(&layer, WEBSOCKET_RECEIVE, json!({"bytes": "AAE="}));
        assert!(consumer.consume(&binary, &Kwargs::new()).await.is_err());
    }

    #[test]
    fn register_claims_all_websocket_channels() {
        let registry = ConsumerRegistry::new();
        WebsocketConsumer::new(Echo).strict_ordering().register(&registry).unwrap();
        assert_eq!(
            registry.all_channel_names(),
            vec![WEBSOCKET_CONNECT, WEBSOCKET_DISCONNECT, WEBSOCKET_RECEIVE]
        );
        let consumer = registry.consumer_for_channel(WEBSOCKET_RECEIVE).unwrap();
        assert!(consumer.name().starts_with("ordered("));

        let err = WebsocketConsumer::new(Echo).register(&registry).unwrap_err();
        assert!(matches!(err, ConfigurationError::DuplicateChannel { .. }));
    }

    #[tokio::test]
    async fn strict_ordering_defers_early_frames() {
        let layer = layer();
        let consumer = WebsocketConsumer::new(Echo).strict_ordering().into_consumer();

        let early = message(&layer, WEBSOCKET_RECEIVE, json!({"text": "2nd", "order": 1}));
        assert_eq!(consumer.consume(&early, &Kwargs::new()).await.unwrap(), Outcome::Defer);

        let connect = message(&layer, WEBSOCKET_CONNECT, json!({"order": 0}));
        assert_eq!(consumer.consume(&connect, &Kwargs::new()).await.unwrap(), Outcome::Processed);
        assert_eq!(consumer.consume(&early, &Kwargs::new()).await.unwrap(), Outcome::Processed);
    }
}
