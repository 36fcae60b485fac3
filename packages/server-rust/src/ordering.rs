//! Per-connection ordering enforcement.
//!
//! Every message of an ordered connection carries an integer `"order"`
//! token and a reply channel; the reply channel name identifies the
//! connection. [`EnforceOrdering`] wraps a consumer and defers messages that
//! arrive ahead of their turn, so the worker puts them back on their channel
//! and they are retried later.

use std::borrow::Cow;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use switchboard_core::Message;
use tracing::{debug, warn};

use crate::consumer::{ConsumeResult, Consumer, ConsumerError, ConsumerHandle, Kwargs, Outcome};

/// Content key holding a message's position in its connection's stream.
pub const ORDER_KEY: &str = "order";

/// Channel whose messages end a WebSocket connection.
pub const WEBSOCKET_DISCONNECT: &str = "websocket.disconnect";

/// How strictly a connection's messages are serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderingMode {
    /// Every message runs in token order.
    Strict,
    /// Only the connect message must run first; the rest run as they arrive.
    Slight,
}

// ---------------------------------------------------------------------------
// OrderStore
// ---------------------------------------------------------------------------

/// Per-connection ordering state, keyed by reply channel name.
pub trait OrderStore: Send + Sync {
    /// Next token expected from `connection`, if it has any state.
    fn next_token(&self, connection: &str) -> Option<u64>;

    /// Records the next token expected from `connection`.
    fn set_next_token(&self, connection: &str, token: u64);

    /// Forgets `connection`.
    fn clear(&self, connection: &str);

    /// Number of connections with state.
    fn len(&self) -> usize;

    /// Whether no connection has state.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Process-local [`OrderStore`].
#[derive(Debug, Default)]
pub struct InMemoryOrderStore {
    next: DashMap<String, u64>,
}

impl InMemoryOrderStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl OrderStore for InMemoryOrderStore {
    fn next_token(&self, connection: &str) -> Option<u64> {
        self.next.get(connection).map(|entry| *entry)
    }

    fn set_next_token(&self, connection: &str, token: u64) {
        self.next.insert(connection.to_string(), token);
    }

    fn clear(&self, connection: &str) {
        self.next.remove(connection);
    }

    fn len(&self) -> usize {
        self.next.len()
    }
}

// ---------------------------------------------------------------------------
// EnforceOrdering
// ---------------------------------------------------------------------------

/// Consumer decorator that serializes each connection's messages.
pub struct EnforceOrdering {
    inner: ConsumerHandle,
    mode: OrderingMode,
    first_token: u64,
    store: Arc<dyn OrderStore>,
    teardown_channels: Vec<String>,
}

/// Wraps `inner` so each connection's messages run in `mode` order.
///
/// Tokens start at 0 and state is dropped after a `websocket.disconnect`
/// message unless configured otherwise.
pub fn enforce_ordering(inner: ConsumerHandle, mode: OrderingMode) -> EnforceOrdering {
    EnforceOrdering {
        inner,
        mode,
        first_token: 0,
        store: Arc::new(InMemoryOrderStore::new()),
        teardown_channels: vec![WEBSOCKET_DISCONNECT.to_string()],
    }
}

impl EnforceOrdering {
    /// Sets the token of a connection's first message.
    #[must_use]
    pub fn starting_at(mut self, first_token: u64) -> Self {
        self.first_token = first_token;
        self
    }

    /// Shares ordering state through `store`.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn OrderStore>) -> Self {
        self.store = store;
        self
    }

    /// Replaces the channels whose messages end a connection.
    #[must_use]
    pub fn with_teardown_channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.teardown_channels = channels.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn mode(&self) -> OrderingMode {
        self.mode
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn OrderStore> {
        &self.store
    }

    /// Decides whether the message with `token` may run now.
    fn admit(&self, connection: &str, token: u64) -> Admission {
        let next = self.store.next_token(connection);
        match self.mode {
            OrderingMode::Strict => {
                let expected = next.unwrap_or(self.first_token);
                match token.cmp(&expected) {
                    std::cmp::Ordering::Equal => Admission::Run,
                    std::cmp::Ordering::Greater => Admission::Defer { expected },
                    std::cmp::Ordering::Less => Admission::Duplicate { expected },
                }
            }
            OrderingMode::Slight => {
                if next.is_some() || token == self.first_token {
                    Admission::Run
                } else {
                    Admission::Defer {
                        expected: self.first_token,
                    }
                }
            }
        }
    }

    /// Records that the message with `token` has been handled.
    fn advance(&self, connection: &str, token: u64) {
        match self.mode {
            OrderingMode::Strict => self.store.set_next_token(connection, token.saturating_add(1)),
            OrderingMode::Slight => {
                if self.store.next_token(connection).is_none() {
                    self.store.set_next_token(connection, self.first_token.saturating_add(1));
                }
            }
        }
    }
}

enum Admission {
    Run,
    Defer { expected: u64 },
    Duplicate { expected: u64 },
}

/// Reads the connection identity and order token off `message`.
fn ordering_key(message: &Message) -> Result<(String, u64), ConsumerError> {
    let connection = message
        .reply_channel()
        .map(|channel| channel.name().to_string())
        .ok_or_else(|| {
            ConsumerError::InvalidMessage(format!(
                "ordered message on {} has no reply channel",
                message.channel_name()
            ))
        })?;
    let token = message
        .get(ORDER_KEY)
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| {
            ConsumerError::InvalidMessage(format!(
                "ordered message on {} has no integer {ORDER_KEY:?} key",
                message.channel_name()
            ))
        })?;
    Ok((connection, token))
}

#[async_trait]
impl Consumer for EnforceOrdering {
    fn name(&self) -> Cow<'static, str> {
        Cow::Owned(format!("ordered({})", self.inner.name()))
    }

    async fn consume(&self, message: &Message, kwargs: &Kwargs) -> ConsumeResult {
        let (connection, token) = ordering_key(message)?;

        match self.admit(&connection, token) {
            Admission::Run => {}
            Admission::Defer { expected } => {
                debug!(
                    channel = message.channel_name(),
                    connection = %connection,
                    token,
                    expected,
                    "message ahead of its turn, deferring"
                );
                return Ok(Outcome::Defer);
            }
            Admission::Duplicate { expected } => {
                warn!(
                    channel = message.channel_name(),
                    connection = %connection,
                    token,
                    expected,
                    "dropping already processed message"
                );
                return Ok(Outcome::Processed);
            }
        }

        let result = self.inner.consume(message, kwargs).await;
        if matches!(result, Ok(Outcome::Defer)) {
            return result;
        }

        if self
            .teardown_channels
            .iter()
            .any(|channel| channel == message.channel_name())
        {
            self.store.clear(&connection);
        } else {
            self.advance(&connection, token);
        }
        result
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
