//! Middleware chain composition around a terminal consumer.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use switchboard_core::Message;
use tower::Layer;

use super::convenience::ConvenienceLayer;
use crate::consumer::{ConsumeResult, ConsumerHandle, Kwargs};
use crate::error::ConfigurationError;

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// One layer of a dispatch chain: takes a message, produces an outcome.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, message: &Message) -> ConsumeResult;
}

/// Shared handle to a chain layer.
pub type HandlerRef = Arc<dyn Handler>;

/// A middleware stage: wraps the next layer and returns a new one.
pub type BoxMiddleware = Arc<dyn Layer<HandlerRef, Service = HandlerRef> + Send + Sync>;

/// Innermost layer: the consumer bound to its routing kwargs.
struct Terminal {
    consumer: ConsumerHandle,
    kwargs: Kwargs,
}

#[async_trait]
impl Handler for Terminal {
    async fn call(&self, message: &Message) -> ConsumeResult {
        self.consumer.consume(message, &self.kwargs).await
    }
}

// ---------------------------------------------------------------------------
// MiddlewareCatalog
// ---------------------------------------------------------------------------

/// Middleware stages available by name, fixed at startup.
#[derive(Clone, Default)]
pub struct MiddlewareCatalog {
    layers: HashMap<String, BoxMiddleware>,
}

impl MiddlewareCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `layer` under `name`, replacing any previous entry.
    pub fn register<L>(&mut self, name: impl Into<String>, layer: L)
    where
        L: Layer<HandlerRef, Service = HandlerRef> + Send + Sync + 'static,
    {
        self.layers.insert(name.into(), Arc::new(layer));
    }

    /// Builder-style [`register`](Self::register).
    #[must_use]
    pub fn with<L>(mut self, name: impl Into<String>, layer: L) -> Self
    where
        L: Layer<HandlerRef, Service = HandlerRef> + Send + Sync + 'static,
    {
        self.register(name, layer);
        self
    }

    /// The layer registered under `name`.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<BoxMiddleware> {
        self.layers.get(name).cloned()
    }
}

impl fmt::Debug for MiddlewareCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.layers.keys().collect();
        names.sort();
        f.debug_struct("MiddlewareCatalog").field("names", &names).finish()
    }
}

// ---------------------------------------------------------------------------
// MiddlewareChain
// ---------------------------------------------------------------------------

/// Ordered middleware stages wrapped around every consumer call.
///
/// The first stage is outermost: inbound control flows
/// `stage[0] -> stage[1] -> ... -> consumer`, and unwinds in reverse.
#[derive(Clone)]
pub struct MiddlewareChain {
    layers: Vec<BoxMiddleware>,
}

impl MiddlewareChain {
    /// A chain holding only the built-in [`ConvenienceLayer`].
    #[must_use]
    pub fn new() -> Self {
        Self::empty().with(ConvenienceLayer)
    }

    /// A chain with no stages at all.
    #[must_use]
    pub fn empty() -> Self {
        Self { layers: Vec::new() }
    }

    /// Builds the default chain followed by the stages named in `names`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::UnresolvedMiddleware` for the first name
    /// missing from `catalog`.
    pub fn from_names<I, S>(
        catalog: &MiddlewareCatalog,
        names: I,
    ) -> Result<Self, ConfigurationError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut chain = Self::new();
        for name in names {
            let name = name.as_ref();
            let layer = catalog
                .resolve(name)
                .ok_or_else(|| ConfigurationError::UnresolvedMiddleware {
                    reference: name.to_string(),
                })?;
            chain.layers.push(layer);
        }
        Ok(chain)
    }

    /// Appends a stage; it runs inside every stage added before it.
    pub fn push<L>(&mut self, layer: L)
    where
        L: Layer<HandlerRef, Service = HandlerRef> + Send + Sync + 'static,
    {
        self.layers.push(Arc::new(layer));
    }

    /// Builder-style [`push`](Self::push).
    #[must_use]
    pub fn with<L>(mut self, layer: L) -> Self
    where
        L: Layer<HandlerRef, Service = HandlerRef> + Send + Sync + 'static,
    {
        self.push(layer);
        self
    }

    /// Number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether the chain has no stages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Wraps `consumer` (bound to `kwargs`) in every stage.
    #[must_use]
    pub fn make_chain(&self, consumer: ConsumerHandle, kwargs: Kwargs) -> HandlerRef {
        let terminal: HandlerRef = Arc::new(Terminal { consumer, kwargs });
        self.layers
            .iter()
            .rev()
            .fold(terminal, |next, layer| layer.layer(next))
    }
}

impl Default for MiddlewareChain {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewareChain")
            .field("stages", &self.layers.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
