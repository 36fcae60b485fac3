//! A set of workers sharing one channel layer, registry and stop signal.

use std::sync::Arc;

use switchboard_core::{ChannelLayer, Message};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use super::{ShutdownController, Worker, WorkerCallback, WorkerConfig};
use crate::error::{ConfigurationError, WorkerError};
use crate::middleware::MiddlewareChain;
use crate::registry::ConsumerRegistry;

/// Runs `config.threads` workers as tokio tasks until stopped.
#[derive(Debug)]
pub struct WorkerGroup {
    workers: Vec<Arc<Worker>>,
    config: WorkerConfig,
    shutdown: Arc<ShutdownController>,
}

impl WorkerGroup {
    /// Builds the group's workers. At least one worker is always created.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::InvalidChannelFilter` if a channel filter
    /// glob does not compile.
    pub fn new(
        layer: Arc<dyn ChannelLayer>,
        registry: Arc<ConsumerRegistry>,
        middleware: MiddlewareChain,
        config: WorkerConfig,
    ) -> Result<Self, ConfigurationError> {
        let workers = (0..config.threads.max(1))
            .map(|id| {
                Worker::new(
                    Arc::clone(&layer),
                    Arc::clone(&registry),
                    middleware.clone(),
                    config.clone(),
                )
                .map(|worker| Arc::new(worker.with_id(id)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            workers,
            config,
            shutdown: Arc::new(ShutdownController::new()),
        })
    }

    /// Installs the same observer callback on every worker.
    #[must_use]
    pub fn with_callback<F>(self, callback: F) -> Self
    where
        F: Fn(&str, &Message) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.set_callback(Some(Arc::new(callback)));
        self
    }

    /// Replaces the observer callback of every worker, including workers
    /// already handed out by [`workers`](Self::workers) or running.
    pub fn set_callback(&self, callback: Option<WorkerCallback>) {
        for worker in &self.workers {
            worker.set_callback(callback.clone());
        }
    }

    #[must_use]
    pub fn workers(&self) -> &[Arc<Worker>] {
        &self.workers
    }

    /// The stop signal shared by this group's workers.
    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Runs every worker until [`stop`](Self::stop) is called.
    ///
    /// # Errors
    ///
    /// Returns the first worker error (e.g. `Unroutable`), or
    /// `WorkerError::Join` if a worker task panicked outside a dispatch.
    pub async fn run(&self) -> Result<(), WorkerError> {
        let mut tasks = JoinSet::new();
        for worker in &self.workers {
            let worker = Arc::clone(worker);
            let shutdown = Arc::clone(&self.shutdown);
            tasks.spawn(async move { worker.run(&shutdown).await });
        }
        self.shutdown.set_running();
        info!(workers = self.workers.len(), "worker group running");

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined
                .map_err(|e| WorkerError::Join(e.to_string()))
                .and_then(|result| result);
            if let Err(e) = result {
                error!(error = %e, "worker exited with an error");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Signals every worker to stop after its current iteration.
    ///
    /// With `stop_gracefully`, waits up to `drain_timeout` for in-flight
    /// dispatches and returns whether they all finished.
    pub async fn stop(&self) -> bool {
        self.shutdown.trigger_shutdown();
        if !self.config.stop_gracefully {
            return true;
        }
        let drained = self.shutdown.wait_for_drain(self.config.drain_timeout).await;
        if !drained {
            warn!(
                in_flight = self.shutdown.in_flight_count(),
                "drain timeout expired with dispatches still in flight"
            );
        }
        drained
    }

    /// Runs the group until it exits on its own or the process receives Ctrl-C.
    ///
    /// # Errors
    ///
    /// Same as [`run`](Self::run).
    pub async fn run_until_signal(&self) -> Result<(), WorkerError> {
        let run = self.run();
        tokio::pin!(run);

        tokio::select! {
            result = &mut run => return result,
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "could not listen for Ctrl-C, stopping");
                }
            }
        }

        info!("stop requested");
        if self.config.stop_gracefully {
            self.stop().await;
            run.await
        } else {
            // Dropping the run future drops its JoinSet, aborting the workers.
            self.shutdown.trigger_shutdown();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::json;
    use switchboard_core::{content_from, InMemoryChannelLayer};

    use super::*;
    use crate::consumer::{consumer_fn, Outcome};
    use crate::worker::{LifecycleState, WorkerState};

    fn group(
        threads: usize,
        registry: &Arc<ConsumerRegistry>,
        layer: &Arc<InMemoryChannelLayer>,
    ) -> WorkerGroup {
        let config = WorkerConfig {
            threads,
            ..WorkerConfig::default()
        };
        WorkerGroup::new(layer.clone(), Arc::clone(registry), MiddlewareChain::new(), config)
            .unwrap()
    }

    #[test]
    fn creates_one_worker_per_thread() {
        let layer = Arc::new(InMemoryChannelLayer::default());
        let registry = Arc::new(ConsumerRegistry::new());
        let group = group(3, &registry, &layer);
        let ids: Vec<usize> = group.workers().iter().map(|w| w.id()).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(self::group(0, &registry, &layer).workers().len(), 1);
    }

    #[tokio::test]
    async fn graceful_stop_waits_for_in_flight_dispatch() {
        let layer = Arc::new(InMemoryChannelLayer::default());
        let registry = Arc::new(ConsumerRegistry::new());
        let started = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let (s, f) = (Arc::clone(&started), Arc::clone(&finished));
        let slow = consumer_fn("slow", move |_message, _kwargs| {
            let (s, f) = (Arc::clone(&s), Arc::clone(&f));
            async move {
                s.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                f.fetch_add(1, Ordering::SeqCst);
                Ok(Outcome::Processed)
            }
        });
        registry.add_consumer(slow, ["slow"]).unwrap();

        let group = Arc::new(group(2, &registry, &layer));
        let runner = {
            let group = Arc::clone(&group);
            tokio::spawn(async move { group.run().await })
        };

        layer.send("slow", content_from(json!({}))).await.unwrap();
        while started.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(group.stop().await);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(group.shutdown_controller().state(), LifecycleState::Stopped);

        runner.await.unwrap().unwrap();
        assert!(group.workers().iter().all(|w| w.state() == WorkerState::Stopped));
    }

    #[tokio::test]
    async fn callback_reaches_every_worker() {
        let layer = Arc::new(InMemoryChannelLayer::default());
        let registry = Arc::new(ConsumerRegistry::new());
        registry
            .add_consumer(
                consumer_fn("noop", |_message, _kwargs| async { Ok(Outcome::Processed) }),
                ["chat"],
            )
            .unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let group = group(2, &registry, &layer).with_callback(move |_channel, _message| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        for worker in group.workers() {
            layer.send("chat", content_from(json!({}))).await.unwrap();
            let channels = worker.channels();
            worker.run_once(&channels).await.unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn callback_reaches_workers_already_shared() {
        let layer = Arc::new(InMemoryChannelLayer::default());
        let registry = Arc::new(ConsumerRegistry::new());
        registry
            .add_consumer(
                consumer_fn("noop", |_message, _kwargs| async { Ok(Outcome::Processed) }),
                ["chat"],
            )
            .unwrap();
        let group = group(1, &registry, &layer);
        let held = Arc::clone(&group.workers()[0]);

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let group = group.with_callback(move |_channel, _message| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert!(Arc::ptr_eq(&held, &group.workers()[0]));
        drop(held);

        layer.send("chat", content_from(json!({}))).await.unwrap();
        let worker = &group.workers()[0];
        let channels = worker.channels();
        worker.run_once(&channels).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
