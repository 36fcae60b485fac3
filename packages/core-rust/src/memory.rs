//! Process-local channel layer.
//!
//! Queues live in a single `parking_lot::Mutex`-guarded map, so a message is
//! handed to exactly one receiver. Blocking receives park on a
//! `tokio::sync::Notify` until a send arrives or `blocking_timeout` elapses.
//! Messages older than `expiry` and group memberships older than
//! `group_expiry` are dropped lazily.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::layer::{ChannelLayer, ChannelLayerError, Delivery};
use crate::names::{non_local_name, validate_channel_name, validate_group_name, ChannelPattern};
use crate::types::Content;

/// Configuration for [`InMemoryChannelLayer`].
#[derive(Debug, Clone)]
pub struct InMemoryConfig {
    /// How long an undelivered message stays queued.
    pub expiry: Duration,
    /// How long a group membership lasts without being refreshed.
    pub group_expiry: Duration,
    /// Default per-channel queue capacity.
    pub capacity: usize,
    /// Per-channel capacity overrides as `(glob, capacity)`; first match wins.
    pub channel_capacity: Vec<(String, usize)>,
    /// Longest a blocking receive waits before reporting no message.
    pub blocking_timeout: Duration,
}

impl Default for InMemoryConfig {
    fn default() -> Self {
        Self {
            expiry: Duration::from_secs(60),
            group_expiry: Duration::from_secs(86_400),
            capacity: 100,
            channel_capacity: Vec::new(),
            blocking_timeout: Duration::from_millis(100),
        }
    }
}

#[derive(Debug)]
struct Queued {
    content: Content,
    expires_at: Instant,
}

/// In-memory [`ChannelLayer`] for tests, demos and single-process deployments.
#[derive(Debug)]
pub struct InMemoryChannelLayer {
    config: InMemoryConfig,
    capacities: Vec<(ChannelPattern, usize)>,
    channels: Mutex<HashMap<String, VecDeque<Queued>>>,
    groups: Mutex<HashMap<String, HashMap<String, Instant>>>,
    notify: Notify,
    /// Rotating start offset so one busy channel cannot starve the others.
    cursor: AtomicUsize,
}

impl InMemoryChannelLayer {
    /// Creates a layer with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `ChannelLayerError::InvalidPattern` if a capacity glob does not compile.
    pub fn new(config: InMemoryConfig) -> Result<Self, ChannelLayerError> {
        let capacities = config
            .channel_capacity
            .iter()
            .map(|(glob, capacity)| {
                ChannelPattern::new(glob)
                    .map(|pattern| (pattern, *capacity))
                    .map_err(|e| ChannelLayerError::InvalidPattern {
                        pattern: glob.clone(),
                        reason: e.to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            config,
            capacities,
            channels: Mutex::new(HashMap::new()),
            groups: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            cursor: AtomicUsize::new(0),
        })
    }

    /// Capacity that applies to `channel`.
    #[must_use]
    pub fn capacity_for(&self, channel: &str) -> usize {
        self.capacities
            .iter()
            .find(|(pattern, _)| pattern.matches(channel))
            .map_or(self.config.capacity, |(_, capacity)| *capacity)
    }

    /// Number of unexpired messages waiting on `channel`.
    #[must_use]
    pub fn pending(&self, channel: &str) -> usize {
        let now = Instant::now();
        self.channels
            .lock()
            .get(channel)
            .map_or(0, |queue| queue.iter().filter(|q| q.expires_at > now).count())
    }

    /// Members of `group`, sorted.
    #[must_use]
    pub fn group_members(&self, group: &str) -> Vec<String> {
        let now = Instant::now();
        let mut members: Vec<String> = self
            .groups
            .lock()
            .get(group)
            .map(|members| {
                members
                    .iter()
                    .filter(|(_, added)| now.duration_since(**added) < self.config.group_expiry)
                    .map(|(channel, _)| channel.clone())
                    .collect()
            })
            .unwrap_or_default();
        members.sort();
        members
    }

    /// Drops every queued message and group.
    pub fn flush(&self) {
        self.channels.lock().clear();
        self.groups.lock().clear();
    }

    fn enqueue(&self, channel: &str, content: Content) -> Result<(), ChannelLayerError> {
        let now = Instant::now();
        let capacity = self.capacity_for(channel);
        {
            let mut channels = self.channels.lock();
            let queue = channels.entry(channel.to_string()).or_default();
            queue.retain(|q| q.expires_at > now);
            if queue.len() >= capacity {
                return Err(ChannelLayerError::ChannelFull {
                    channel: channel.to_string(),
                });
            }
            queue.push_back(Queued {
                content,
                expires_at: now + self.config.expiry,
            });
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// Pops the first live message from any requested channel.
    ///
    /// A requested name ending in `!` matches every process-local channel
    /// sharing that prefix.
    fn take(&self, requested: &[String]) -> Option<Delivery> {
        if requested.is_empty() {
            return None;
        }
        let now = Instant::now();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % requested.len();
        let mut channels = self.channels.lock();

        for offset in 0..requested.len() {
            let wanted = &requested[(start + offset) % requested.len()];
            let candidates: Vec<String> = if wanted.ends_with('!') {
                let mut names: Vec<String> = channels
                    .keys()
                    .filter(|name| non_local_name(name) == wanted.as_str())
                    .cloned()
                    .collect();
                names.sort();
                names
            } else {
                vec![wanted.clone()]
            };

            for name in candidates {
                let Some(queue) = channels.get_mut(&name) else {
                    continue;
                };
                while let Some(queued) = queue.pop_front() {
                    if queued.expires_at > now {
                        if queue.is_empty() {
                            channels.remove(&name);
                        }
                        return Some(Delivery {
                            channel: name,
                            content: queued.content,
                        });
                    }
                    trace!(channel = %name, "dropping expired message");
                }
                channels.remove(&name);
            }
        }
        None
    }
}

impl Default for InMemoryChannelLayer {
    fn default() -> Self {
        Self {
            config: InMemoryConfig::default(),
            capacities: Vec::new(),
            channels: Mutex::new(HashMap::new()),
            groups: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            cursor: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ChannelLayer for InMemoryChannelLayer {
    async fn send(&self, channel: &str, content: Content) -> Result<(), ChannelLayerError> {
        validate_channel_name(channel, false)?;
        self.enqueue(channel, content)
    }

    async fn receive_many(
        &self,
        channels: &[String],
        block: bool,
    ) -> Result<Option<Delivery>, ChannelLayerError> {
        for channel in channels {
            validate_channel_name(channel, true)?;
        }

        let deadline = tokio::time::Instant::now() + self.config.blocking_timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register interest before checking so a send between the check
            // and the await is not missed.
            notified.as_mut().enable();

            if let Some(delivery) = self.take(channels) {
                return Ok(Some(delivery));
            }
            if !block {
                return Ok(None);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn new_channel(&self, prefix: &str) -> Result<String, ChannelLayerError> {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let name = if prefix.ends_with('!') {
            format!("{prefix}{}", &suffix[..12])
        } else {
            format!("{prefix}!{}", &suffix[..12])
        };
        validate_channel_name(&name, false)?;
        debug!(channel = %name, "created process-local channel");
        Ok(name)
    }

    async fn group_add(&self, group: &str, channel: &str) -> Result<(), ChannelLayerError> {
        validate_group_name(group)?;
        validate_channel_name(channel, false)?;
        self.groups
            .lock()
            .entry(group.to_string())
            .or_default()
            .insert(channel.to_string(), Instant::now());
        Ok(())
    }

    async fn group_discard(&self, group: &str, channel: &str) -> Result<(), ChannelLayerError> {
        validate_group_name(group)?;
        validate_channel_name(channel, false)?;
        let mut groups = self.groups.lock();
        if let Some(members) = groups.get_mut(group) {
            members.remove(channel);
            if members.is_empty() {
                groups.remove(group);
            }
        }
        Ok(())
    }

    async fn send_group(&self, group: &str, content: Content) -> Result<(), ChannelLayerError> {
        validate_group_name(group)?;
        for channel in self.group_members(group) {
            match self.enqueue(&channel, content.clone()) {
                Ok(()) => {}
                Err(ChannelLayerError::ChannelFull { channel }) => {
                    debug!(%group, %channel, "skipping full channel in group send");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
