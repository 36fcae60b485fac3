//! Channel name to consumer routing, with consumers given directly or by name.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use switchboard_core::validate_channel_name;

use crate::consumer::{ConsumerHandle, Kwargs};
use crate::error::ConfigurationError;

/// Channel carrying synchronous HTTP requests.
pub const HTTP_REQUEST_CHANNEL: &str = "http.request";

// ---------------------------------------------------------------------------
// ConsumerRef / ConsumerCatalog
// ---------------------------------------------------------------------------

/// A consumer given either directly or by catalog name.
#[derive(Clone)]
pub enum ConsumerRef {
    Direct(ConsumerHandle),
    Named(String),
}

impl fmt::Debug for ConsumerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct(consumer) => f.debug_tuple("Direct").field(&consumer.name()).finish(),
            Self::Named(name) => f.debug_tuple("Named").field(name).finish(),
        }
    }
}

impl<C: crate::consumer::Consumer> From<Arc<C>> for ConsumerRef {
    fn from(consumer: Arc<C>) -> Self {
        Self::Direct(consumer)
    }
}

impl From<ConsumerHandle> for ConsumerRef {
    fn from(consumer: ConsumerHandle) -> Self {
        Self::Direct(consumer)
    }
}

impl From<&str> for ConsumerRef {
    fn from(name: &str) -> Self {
        Self::Named(name.to_string())
    }
}

impl From<String> for ConsumerRef {
    fn from(name: String) -> Self {
        Self::Named(name)
    }
}

type ConsumerFactory = Arc<dyn Fn() -> ConsumerHandle + Send + Sync>;

/// Named consumer factories, fixed at startup.
///
/// Lets routing tables refer to consumers by name without any runtime
/// reflection: every name a deployment may use is registered up front.
#[derive(Clone, Default)]
pub struct ConsumerCatalog {
    factories: HashMap<String, ConsumerFactory>,
}

impl ConsumerCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory under `name`, replacing any previous one.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> ConsumerHandle + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Builder-style [`register`](Self::register).
    #[must_use]
    pub fn with<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> ConsumerHandle + Send + Sync + 'static,
    {
        self.register(name, factory);
        self
    }

    /// Instantiates the consumer registered under `name`.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<ConsumerHandle> {
        self.factories.get(name).map(|factory| factory())
    }
}

impl fmt::Debug for ConsumerCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("ConsumerCatalog").field("names", &names).finish()
    }
}

// ---------------------------------------------------------------------------
// ConsumerRegistry
// ---------------------------------------------------------------------------

/// A consumer together with the kwargs it is called with.
#[derive(Clone)]
pub struct Route {
    pub consumer: ConsumerHandle,
    pub kwargs: Kwargs,
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("consumer", &self.consumer.name())
            .field("kwargs", &self.kwargs)
            .finish()
    }
}

/// Maps channel names to the one consumer that handles each.
///
/// Built at startup and read-only once workers run. Registration of a call
/// is all-or-nothing: a duplicate anywhere in the call leaves the registry
/// unchanged.
#[derive(Default)]
pub struct ConsumerRegistry {
    routes: RwLock<HashMap<String, Route>>,
    catalog: ConsumerCatalog,
}

impl ConsumerRegistry {
    /// Creates an empty registry with an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty registry resolving named consumers via `catalog`.
    #[must_use]
    pub fn with_catalog(catalog: ConsumerCatalog) -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            catalog,
        }
    }

    /// Builds a registry from `(channel, consumer)` routing pairs.
    ///
    /// # Errors
    ///
    /// Fails on the first duplicate channel, invalid channel name or
    /// unresolvable consumer name.
    pub fn from_routing<I, C>(
        catalog: ConsumerCatalog,
        routing: I,
    ) -> Result<Self, ConfigurationError>
    where
        I: IntoIterator<Item = (String, C)>,
        C: Into<ConsumerRef>,
    {
        let registry = Self::with_catalog(catalog);
        for (channel, consumer) in routing {
            registry.add_consumer(consumer, [channel])?;
        }
        Ok(registry)
    }

    /// Registers `consumer` on every channel in `channels`.
    ///
    /// # Errors
    ///
    /// - `DuplicateChannel` if a channel is already registered, or listed twice.
    /// - `UnresolvedConsumer` if a named consumer is not in the catalog.
    /// - `InvalidChannelName` for malformed channel names.
    pub fn add_consumer<C, I, S>(&self, consumer: C, channels: I) -> Result<(), ConfigurationError>
    where
        C: Into<ConsumerRef>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.add_route(consumer, channels, Kwargs::new())
    }

    /// Registers `consumer` on `channels`, calling it with `kwargs`.
    ///
    /// # Errors
    ///
    /// Same as [`add_consumer`](Self::add_consumer).
    pub fn add_route<C, I, S>(
        &self,
        consumer: C,
        channels: I,
        kwargs: Kwargs,
    ) -> Result<(), ConfigurationError>
    where
        C: Into<ConsumerRef>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let consumer = self.resolve(consumer.into())?;
        let channels: Vec<String> = channels.into_iter().map(Into::into).collect();

        let mut routes = self.routes.write();
        for (idx, channel) in channels.iter().enumerate() {
            validate_channel_name(channel, true).map_err(|source| {
                ConfigurationError::InvalidChannelName {
                    name: channel.clone(),
                    consumer: consumer.name().into_owned(),
                    source,
                }
            })?;
            let existing = routes
                .get(channel)
                .map(|route| route.consumer.name())
                .or_else(|| channels[..idx].contains(channel).then(|| consumer.name()));
            if let Some(existing) = existing {
                return Err(ConfigurationError::DuplicateChannel {
                    channel: channel.clone(),
                    new_consumer: consumer.name().into_owned(),
                    existing_consumer: existing.into_owned(),
                });
            }
        }

        for channel in channels {
            routes.insert(
                channel,
                Route {
                    consumer: Arc::clone(&consumer),
                    kwargs: kwargs.clone(),
                },
            );
        }
        Ok(())
    }

    /// The consumer registered on `channel`, or `None`.
    #[must_use]
    pub fn consumer_for_channel(&self, channel: &str) -> Option<ConsumerHandle> {
        self.routes
            .read()
            .get(channel)
            .map(|route| Arc::clone(&route.consumer))
    }

    /// The consumer and kwargs registered on `channel`, or `None`.
    #[must_use]
    pub fn route_for_channel(&self, channel: &str) -> Option<Route> {
        self.routes.read().get(channel).cloned()
    }

    /// All registered channel names, sorted.
    #[must_use]
    pub fn all_channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.routes.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered channels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    /// Whether no channel is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }

    /// Registers `fallback` on `http.request` unless a consumer is already there.
    ///
    /// # Errors
    ///
    /// Only fails if `fallback` is a named reference missing from the catalog.
    pub fn check_default(
        &self,
        fallback: impl Into<ConsumerRef>,
    ) -> Result<(), ConfigurationError> {
        if self.consumer_for_channel(HTTP_REQUEST_CHANNEL).is_some() {
            return Ok(());
        }
        match self.add_consumer(fallback, [HTTP_REQUEST_CHANNEL]) {
            // Lost a race with a concurrent registration: the channel has a consumer.
            Err(ConfigurationError::DuplicateChannel { .. }) => Ok(()),
            other => other,
        }
    }

    fn resolve(&self, consumer: ConsumerRef) -> Result<ConsumerHandle, ConfigurationError> {
        match consumer {
            ConsumerRef::Direct(handle) => Ok(handle),
            ConsumerRef::Named(name) => self
                .catalog
                .resolve(&name)
                .ok_or(ConfigurationError::UnresolvedConsumer { reference: name }),
        }
    }
}

impl fmt::Debug for ConsumerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerRegistry")
            .field("channels", &self.all_channel_names())
            .field("catalog", &self.catalog)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
