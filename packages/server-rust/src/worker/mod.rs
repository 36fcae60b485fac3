//! The worker loop: pull messages off the channel layer and dispatch them.
//!
//! A [`Worker`] snapshots the registry's channel names once when it starts,
//! then repeatedly receives from the layer, wraps each delivery in a
//! [`Message`], and runs the routed consumer through the middleware chain.
//! Consumer failures and panics are logged and the message is dropped; a
//! deferred message is put back on its channel unchanged.

pub mod config;
pub mod group;
pub mod shutdown;

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use futures_util::FutureExt;
use switchboard_core::{non_local_name, ChannelLayer, ChannelPattern, Delivery, Message};
use tracing::{debug, error, info, info_span, warn, Instrument};

pub use config::WorkerConfig;
pub use group::WorkerGroup;
pub use shutdown::{InFlightGuard, LifecycleState, ShutdownController};

use crate::consumer::Outcome;
use crate::error::{ConfigurationError, WorkerError};
use crate::middleware::MiddlewareChain;
use crate::registry::ConsumerRegistry;

/// Observer run right before each consumer with the channel name and message.
pub type WorkerCallback = Arc<dyn Fn(&str, &Message) -> anyhow::Result<()> + Send + Sync>;

/// Where a worker is in its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Polling,
    Dispatching,
    Requeue,
    Stopped,
}

/// What one loop iteration did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Nothing was available.
    Empty,
    /// The consumer handled the message.
    Processed,
    /// The consumer deferred; the message was put back on its channel.
    Requeued,
    /// A `Deny` escaped the middleware chain; the message was dropped.
    Denied,
    /// The consumer failed or panicked; the message was dropped.
    Failed,
}

impl Dispatch {
    fn as_label(self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Processed => "processed",
            Self::Requeued => "requeued",
            Self::Denied => "denied",
            Self::Failed => "failed",
        }
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// A single dispatch loop over a shared channel layer and registry.
pub struct Worker {
    id: usize,
    layer: Arc<dyn ChannelLayer>,
    registry: Arc<ConsumerRegistry>,
    middleware: MiddlewareChain,
    config: WorkerConfig,
    only: Vec<ChannelPattern>,
    exclude: Vec<ChannelPattern>,
    callback: ArcSwapOption<WorkerCallback>,
    state: ArcSwap<WorkerState>,
}

fn compile_patterns(globs: &[String]) -> Result<Vec<ChannelPattern>, ConfigurationError> {
    globs
        .iter()
        .map(|glob| {
            ChannelPattern::new(glob).map_err(|source| ConfigurationError::InvalidChannelFilter {
                pattern: glob.clone(),
                source,
            })
        })
        .collect()
}

impl Worker {
    /// Creates a worker.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::InvalidChannelFilter` if an `only_channels`
    /// or `exclude_channels` glob does not compile.
    pub fn new(
        layer: Arc<dyn ChannelLayer>,
        registry: Arc<ConsumerRegistry>,
        middleware: MiddlewareChain,
        config: WorkerConfig,
    ) -> Result<Self, ConfigurationError> {
        let only = compile_patterns(&config.only_channels)?;
        let exclude = compile_patterns(&config.exclude_channels)?;
        Ok(Self {
            id: 0,
            layer,
            registry,
            middleware,
            config,
            only,
            exclude,
            callback: ArcSwapOption::empty(),
            state: ArcSwap::from_pointee(WorkerState::Idle),
        })
    }

    /// Sets the identifier used in log fields.
    #[must_use]
    pub fn with_id(mut self, id: usize) -> Self {
        self.id = id;
        self
    }

    /// Installs an observer called before every consumer. Its errors are
    /// logged and never affect dispatch.
    #[must_use]
    pub fn with_callback<F>(self, callback: F) -> Self
    where
        F: Fn(&str, &Message) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.set_callback(Some(Arc::new(callback)));
        self
    }

    /// Replaces the observer callback, also on a worker that is already
    /// shared or running. Takes effect from the next dispatch.
    pub fn set_callback(&self, callback: Option<WorkerCallback>) {
        self.callback.store(callback.map(Arc::new));
    }

    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }

    #[must_use]
    pub fn state(&self) -> WorkerState {
        **self.state.load()
    }

    fn set_state(&self, state: WorkerState) {
        self.state.store(Arc::new(state));
    }

    /// Registered channel names this worker polls, after filtering.
    #[must_use]
    pub fn channels(&self) -> Vec<String> {
        self.apply_channel_filters(self.registry.all_channel_names())
    }

    /// Keeps the names matching some `only_channels` pattern (all names when
    /// there are none) and no `exclude_channels` pattern.
    #[must_use]
    pub fn apply_channel_filters(&self, channels: Vec<String>) -> Vec<String> {
        channels
            .into_iter()
            .filter(|name| self.only.is_empty() || self.only.iter().any(|p| p.matches(name)))
            .filter(|name| !self.exclude.iter().any(|p| p.matches(name)))
            .collect()
    }

    /// Runs until `shutdown` is triggered.
    ///
    /// The channel set is fixed when this is called; consumers registered
    /// afterwards are not polled by this run. With no channels to poll, logs a
    /// warning and returns immediately.
    ///
    /// # Errors
    ///
    /// Returns `WorkerError::Unroutable` if a message arrives on a channel
    /// with no consumer. Receive errors are logged and retried.
    pub async fn run(&self, shutdown: &ShutdownController) -> Result<(), WorkerError> {
        let channels = self.channels();
        if channels.is_empty() {
            warn!(worker = self.id, "no channels to listen on, stopping");
            self.set_state(WorkerState::Stopped);
            return Ok(());
        }
        info!(worker = self.id, channels = ?channels, "listening on channels");

        let result = self.poll_until_stopped(&channels, shutdown).await;
        self.set_state(WorkerState::Stopped);
        debug!(worker = self.id, "worker stopped");
        result
    }

    async fn poll_until_stopped(
        &self,
        channels: &[String],
        shutdown: &ShutdownController,
    ) -> Result<(), WorkerError> {
        loop {
            // Count the iteration before checking the flag, so a drain that
            // starts in between waits for it.
            let guard = shutdown.in_flight_guard();
            if shutdown.is_shutting_down() {
                break;
            }
            let outcome = self.run_once(channels).await;
            drop(guard);

            match outcome {
                Ok(Dispatch::Empty) => self.pause(shutdown).await,
                Ok(_) => {}
                Err(WorkerError::Layer(e)) => {
                    warn!(worker = self.id, error = %e, "receive failed, backing off");
                    self.pause(shutdown).await;
                }
                Err(e) => {
                    error!(worker = self.id, error = %e, "worker loop aborted");
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Sleeps one poll interval, waking early on shutdown.
    async fn pause(&self, shutdown: &ShutdownController) {
        tokio::select! {
            () = tokio::time::sleep(self.config.poll_interval) => {}
            () = shutdown.wait_for_shutdown() => {}
        }
    }

    /// Performs one iteration: a blocking receive on `channels` and, if a
    /// message arrived, its dispatch.
    ///
    /// # Errors
    ///
    /// `WorkerError::Layer` if the receive fails, `WorkerError::Unroutable`
    /// if the message's channel has no consumer.
    pub async fn run_once(&self, channels: &[String]) -> Result<Dispatch, WorkerError> {
        self.set_state(WorkerState::Polling);
        let delivery = self.layer.receive_many(channels, true).await;
        let Some(delivery) = delivery? else {
            self.set_state(WorkerState::Idle);
            return Ok(Dispatch::Empty);
        };

        let result = self.dispatch(delivery).await;
        self.set_state(WorkerState::Idle);
        result
    }

    async fn dispatch(&self, delivery: Delivery) -> Result<Dispatch, WorkerError> {
        let Delivery { channel, content } = delivery;
        let route_name = non_local_name(&channel).to_string();
        let route = self
            .registry
            .route_for_channel(&route_name)
            .ok_or_else(|| WorkerError::Unroutable {
                channel: channel.clone(),
            })?;
        let consumer_name = route.consumer.name();

        self.set_state(WorkerState::Dispatching);
        let message = Message::new(content, &channel, Arc::clone(&self.layer));

        let span = info_span!(
            "dispatch",
            worker = self.id,
            channel = %channel,
            consumer = %consumer_name,
        );

        let dispatch = async {
            self.observe(&channel, &message);

            let handler = self.middleware.make_chain(route.consumer, route.kwargs);
            let result = AssertUnwindSafe(handler.call(&message)).catch_unwind().await;

            match result {
                Ok(Ok(Outcome::Processed)) => Dispatch::Processed,
                Ok(Ok(Outcome::Defer)) => self.requeue(&message).await,
                Ok(Ok(Outcome::Deny)) => {
                    warn!("consumer denied a message outside a connection request, dropping it");
                    Dispatch::Denied
                }
                Ok(Err(e)) => {
                    error!(error = %e, "error processing message");
                    Dispatch::Failed
                }
                Err(panic) => {
                    error!(panic = panic_message(&*panic), "consumer panicked");
                    Dispatch::Failed
                }
            }
        }
        .instrument(span)
        .await;

        metrics::counter!(
            "switchboard_messages_total",
            "channel" => route_name,
            "outcome" => dispatch.as_label()
        )
        .increment(1);

        Ok(dispatch)
    }

    /// Runs the observer callback. Its errors and panics are logged only.
    fn observe(&self, channel: &str, message: &Message) {
        let callback = self.callback.load_full();
        let Some(callback) = callback.as_deref() else {
            return;
        };
        match std::panic::catch_unwind(AssertUnwindSafe(|| callback(channel, message))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "worker callback failed"),
            Err(panic) => warn!(panic = panic_message(&*panic), "worker callback panicked"),
        }
    }

    /// Puts the exact original content back on the message's channel.
    async fn requeue(&self, message: &Message) -> Dispatch {
        self.set_state(WorkerState::Requeue);
        match message.channel().send(message.content().clone()).await {
            Ok(()) => {
                debug!("message deferred, requeued");
                Dispatch::Requeued
            }
            Err(e) => {
                error!(error = %e, "could not requeue deferred message, dropping it");
                Dispatch::Failed
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("config", &self.config)
            .field("middleware", &self.middleware)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use switchboard_core::{content_from, Content, InMemoryChannelLayer};

    use super::*;
    use crate::consumer::{consumer_fn, ConsumerError, ConsumerHandle};

    fn setup() -> (Arc<InMemoryChannelLayer>, Arc<ConsumerRegistry>) {
        (
            Arc::new(InMemoryChannelLayer::default()),
            Arc::new(ConsumerRegistry::new()),
        )
    }

    fn worker(layer: &Arc<InMemoryChannelLayer>, registry: &Arc<ConsumerRegistry>) -> Worker {
        worker_with(layer, registry, WorkerConfig::default())
    }

    fn worker_with(
        layer: &Arc<InMemoryChannelLayer>,
        registry: &Arc<ConsumerRegistry>,
        config: WorkerConfig,
    ) -> Worker {
        Worker::new(layer.clone(), Arc::clone(registry), MiddlewareChain::new(), config).unwrap()
    }

    fn counting(calls: &Arc<AtomicUsize>, outcome: Outcome) -> ConsumerHandle {
        let calls = Arc::clone(calls);
        consumer_fn("counting", move |_message, _kwargs| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(outcome) }
        })
    }

    async fn send(layer: &InMemoryChannelLayer, channel: &str, value: Value) {
        layer.send(channel, content_from(value)).await.unwrap();
    }

    #[tokio::test]
    async fn empty_receive_is_not_an_error() {
        let (layer, registry) = setup();
        registry
            .add_consumer(counting(&Arc::default(), Outcome::Processed), ["chat"])
            .unwrap();
        let worker = worker(&layer, &registry);

        let channels = worker.channels();
        assert_eq!(worker.run_once(&channels).await.unwrap(), Dispatch::Empty);
        assert_eq!(worker.state(), WorkerState::Idle);
    }

    #[tokio::test]
    async fn processes_routed_message() {
        let (layer, registry) = setup();
        let calls = Arc::new(AtomicUsize::new(0));
        registry
            .add_consumer(counting(&calls, Outcome::Processed), ["chat"])
            .unwrap();
        let worker = worker(&layer, &registry);

        send(&layer, "chat", json!({"text": "hi"})).await;
        let channels = worker.channels();
        assert_eq!(worker.run_once(&channels).await.unwrap(), Dispatch::Processed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn deferred_message_is_requeued_verbatim() {
        let (layer, registry) = setup();
        let calls = Arc::new(AtomicUsize::new(0));
        registry
            .add_consumer(counting(&calls, Outcome::Defer), ["chat"])
            .unwrap();
        let worker = worker(&layer, &registry);

        let original = json!({"text": "later", "nested": {"n": 1}});
        send(&layer, "chat", original.clone()).await;
        let channels = worker.channels();
        assert_eq!(worker.run_once(&channels).await.unwrap(), Dispatch::Requeued);

        let requeued = layer
            .receive_many(&channels, false)
            .await
            .unwrap()
            .expect("message is back on its channel");
        assert_eq!(requeued.channel, "chat");
        assert_eq!(Value::Object(requeued.content), original);
    }

    #[tokio::test]
    async fn consumer_errors_are_swallowed() {
        let (layer, registry) = setup();
        let seen: Arc<Mutex<Vec<Content>>> = Arc::default();
        let log = Arc::clone(&seen);
        let flaky = consumer_fn("flaky", move |message: Message, _kwargs| {
            let log = Arc::clone(&log);
            async move {
                if message.contains_key("fail") {
                    return Err(ConsumerError::InvalidMessage("asked to fail".to_string()));
                }
                log.lock().push(message.content().clone());
                Ok(Outcome::Processed)
            }
        });
        registry.add_consumer(flaky, ["chat"]).unwrap();
        let worker = worker(&layer, &registry);

        send(&layer, "chat", json!({"fail": true})).await;
        send(&layer, "chat", json!({"text": "ok"})).await;
        let channels = worker.channels();
        assert_eq!(worker.run_once(&channels).await.unwrap(), Dispatch::Failed);
        assert_eq!(worker.run_once(&channels).await.unwrap(), Dispatch::Processed);
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(layer.pending("chat"), 0);
    }

    #[tokio::test]
    async fn consumer_panics_are_contained() {
        let (layer, registry) = setup();
        let panicking = consumer_fn("panicking", |_message, _kwargs| async {
            panic!("consumer blew up");
        });
        registry.add_consumer(panicking, ["chat"]).unwrap();
        let worker = worker(&layer, &registry);

        send(&layer, "chat", json!({})).await;
        let channels = worker.channels();
        assert_eq!(worker.run_once(&channels).await.unwrap(), Dispatch::Failed);
    }

    #[tokio::test]
    async fn deny_outside_connect_is_dropped() {
        let (layer, registry) = setup();
        let calls = Arc::new(AtomicUsize::new(0));
        registry
            .add_consumer(counting(&calls, Outcome::Deny), ["chat"])
            .unwrap();
        let worker = worker(&layer, &registry);

        send(&layer, "chat", json!({})).await;
        let channels = worker.channels();
        assert_eq!(worker.run_once(&channels).await.unwrap(), Dispatch::Denied);
        assert_eq!(layer.pending("chat"), 0);
    }

    #[tokio::test]
    async fn unroutable_channel_is_fatal() {
        let (layer, registry) = setup();
        let worker = worker(&layer, &registry);

        send(&layer, "orphan", json!({})).await;
        let err = worker.run_once(&["orphan".to_string()]).await.unwrap_err();
        assert!(matches!(err, WorkerError::Unroutable { channel } if channel == "orphan"));
    }

    #[tokio::test]
    async fn process_local_channels_route_by_prefix() {
        let (layer, registry) = setup();
        let calls = Arc::new(AtomicUsize::new(0));
        registry
            .add_consumer(counting(&calls, Outcome::Processed), ["websocket.send!"])
            .unwrap();
        let worker = worker(&layer, &registry);

        send(&layer, "websocket.send!abc", json!({"text": "hi"})).await;
        let channels = worker.channels();
        assert_eq!(worker.run_once(&channels).await.unwrap(), Dispatch::Processed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn callback_runs_before_consumer_and_errors_are_isolated() {
        let (layer, registry) = setup();
        let calls = Arc::new(AtomicUsize::new(0));
        registry
            .add_consumer(counting(&calls, Outcome::Processed), ["chat"])
            .unwrap();
        let observed: Arc<Mutex<Vec<String>>> = Arc::default();
        let log = Arc::clone(&observed);
        let worker = worker(&layer, &registry).with_callback(move |channel, _message| {
            log.lock().push(channel.to_string());
            anyhow::bail!("observer failure")
        });

        send(&layer, "chat", json!({})).await;
        let channels = worker.channels();
        assert_eq!(worker.run_once(&channels).await.unwrap(), Dispatch::Processed);
        assert_eq!(*observed.lock(), vec!["chat".to_string()]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn callback_panic_does_not_affect_dispatch() {
        let (layer, registry) = setup();
        let calls = Arc::new(AtomicUsize::new(0));
        registry
            .add_consumer(counting(&calls, Outcome::Processed), ["chat"])
            .unwrap();
        let worker = Arc::new(
            worker(&layer, &registry).with_callback(|_channel, _message| panic!("observer bug")),
        );

        send(&layer, "chat", json!({})).await;
        let task = {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move {
                let channels = worker.channels();
                worker.run_once(&channels).await
            })
        };
        assert_eq!(task.await.unwrap().unwrap(), Dispatch::Processed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn callback_can_be_set_on_a_shared_worker() {
        let (layer, registry) = setup();
        registry
            .add_consumer(counting(&Arc::default(), Outcome::Processed), ["chat"])
            .unwrap();
        let worker = Arc::new(worker(&layer, &registry));
        let observed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&observed);
        worker.set_callback(Some(Arc::new(
            move |_channel: &str, _message: &Message| -> anyhow::Result<()> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        )));

        send(&layer, "chat", json!({})).await;
        let channels = worker.channels();
        worker.run_once(&channels).await.unwrap();
        assert_eq!(observed.load(Ordering::SeqCst), 1);

        worker.set_callback(None);
        send(&layer, "chat", json!({})).await;
        worker.run_once(&channels).await.unwrap();
        assert_eq!(observed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn channel_filters() {
        let (layer, registry) = setup();
        let noop = counting(&Arc::default(), Outcome::Processed);
        registry
            .add_consumer(noop, ["yes.1", "yes.2", "no.1", "no.2"])
            .unwrap();

        let only = WorkerConfig {
            only_channels: vec!["yes.*".to_string()],
            ..WorkerConfig::default()
        };
        assert_eq!(worker_with(&layer, &registry, only).channels(), vec!["yes.1", "yes.2"]);

        let exclude = WorkerConfig {
            exclude_channels: vec!["no.*".to_string()],
            ..WorkerConfig::default()
        };
        assert_eq!(worker_with(&layer, &registry, exclude).channels(), vec!["yes.1", "yes.2"]);

        let both = WorkerConfig {
            only_channels: vec!["yes.*".to_string(), "no.1".to_string()],
            exclude_channels: vec!["yes.2".to_string()],
            ..WorkerConfig::default()
        };
        assert_eq!(worker_with(&layer, &registry, both).channels(), vec!["no.1", "yes.1"]);
    }

    #[test]
    fn invalid_filter_is_a_configuration_error() {
        let (layer, registry) = setup();
        let config = WorkerConfig {
            only_channels: vec!["shard[9-0]".to_string()],
            ..WorkerConfig::default()
        };
        let err = Worker::new(layer, registry, MiddlewareChain::new(), config).unwrap_err();
        assert!(matches!(
            err,
            ConfigurationError::InvalidChannelFilter { pattern, .. } if pattern == "shard[9-0]"
        ));
    }

    #[tokio::test]
    async fn run_returns_immediately_without_channels() {
        let (layer, registry) = setup();
        let worker = worker(&layer, &registry);
        worker.run(&ShutdownController::new()).await.unwrap();
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn run_after_stop_dispatches_nothing() {
        let (layer, registry) = setup();
        let calls = Arc::new(AtomicUsize::new(0));
        registry
            .add_consumer(counting(&calls, Outcome::Processed), ["chat"])
            .unwrap();
        let worker = worker(&layer, &registry);
        send(&layer, "chat", json!({})).await;

        let shutdown = ShutdownController::new();
        shutdown.trigger_shutdown();
        worker.run(&shutdown).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(layer.pending("chat"), 1);
        assert_eq!(shutdown.in_flight_count(), 0);
        assert!(shutdown.wait_for_drain(std::time::Duration::ZERO).await);
    }

    #[tokio::test]
    async fn run_polls_until_shutdown() {
        let (layer, registry) = setup();
        let calls = Arc::new(AtomicUsize::new(0));
        registry
            .add_consumer(counting(&calls, Outcome::Processed), ["chat"])
            .unwrap();
        let worker = Arc::new(worker(&layer, &registry));
        let shutdown = Arc::new(ShutdownController::new());

        let task = {
            let worker = Arc::clone(&worker);
            let shutdown = Arc::clone(&shutdown);
            tokio::spawn(async move { worker.run(&shutdown).await })
        };

        send(&layer, "chat", json!({"n": 1})).await;
        send(&layer, "chat", json!({"n": 2})).await;
        for _ in 0..200 {
            if calls.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        shutdown.trigger_shutdown();
        task.await.unwrap().unwrap();
        assert_eq!(worker.state(), WorkerState::Stopped);
    }
}
