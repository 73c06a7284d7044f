//! Fan-out multiplexer
//!
//! The [`Plexer`] receives one [`MessageSet`] per poll cycle and hands it to
//! two independent classes of sinks:
//!
//! - **batchers** ([`Publisher`]) get the whole set once
//! - **observers** ([`Observer`]) get every message on its own, with the
//!   message tags extended by the set tags and the message id
//!
//! Every sink invocation runs on its own task. Errors are logged, never
//! surfaced to the caller of [`Plexer::publish`].
//!
//! ```text
//! MessageSet ──► Plexer ──┬──► batcher  (whole set)
//!                         ├──► batcher  (whole set)
//!                         └──► observer (per message) × N
//! ```

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

/// One leaf metric value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Metric key, `name` or `name-sub`
    pub id: String,

    /// Tags registered for the collector, `key:value` by convention
    pub tags: Vec<String>,

    /// String-encoded number, or `-1` when the source value was unparsable
    pub data: String,
}

/// One publish cycle's worth of messages sharing a tag context
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageSet {
    pub tags: Vec<String>,
    pub messages: Vec<Message>,
}

impl MessageSet {
    /// Tags an observer receives for `message`: its own tags, then the
    /// shared ones, then its id.
    pub fn tags_for(&self, message: &Message) -> Vec<String> {
        let mut tags = Vec::with_capacity(message.tags.len() + self.tags.len() + 1);
        tags.extend(message.tags.iter().cloned());
        tags.extend(self.tags.iter().cloned());
        tags.push(message.id.clone());
        tags
    }
}

/// Batch sink, receives whole message sets
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, set: MessageSet) -> Result<()>;
}

/// Single sink, receives one sample at a time
#[async_trait]
pub trait Observer: Send + Sync {
    async fn observe(&self, tags: Vec<String>, data: String) -> Result<()>;
}

#[async_trait]
impl<F> Publisher for F
where
    F: Fn(MessageSet) -> Result<()> + Send + Sync,
{
    async fn publish(&self, set: MessageSet) -> Result<()> {
        self(set)
    }
}

#[async_trait]
impl<F> Observer for F
where
    F: Fn(Vec<String>, String) -> Result<()> + Send + Sync,
{
    async fn observe(&self, tags: Vec<String>, data: String) -> Result<()> {
        self(tags, data)
    }
}

/// Name-keyed fan-out to batch and single sinks
#[derive(Default)]
pub struct Plexer {
    batchers: RwLock<HashMap<String, Arc<dyn Publisher>>>,
    observers: RwLock<HashMap<String, Arc<dyn Observer>>>,
}

impl Plexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a batch sink, replacing any sink with the same name.
    pub fn add_batcher(&self, name: impl Into<String>, batcher: Arc<dyn Publisher>) {
        let mut batchers = self.batchers.write().unwrap_or_else(|e| e.into_inner());
        batchers.insert(name.into(), batcher);
    }

    pub fn remove_batcher(&self, name: &str) {
        let mut batchers = self.batchers.write().unwrap_or_else(|e| e.into_inner());
        batchers.remove(name);
    }

    /// Register a single sink, replacing any sink with the same name.
    pub fn add_observer(&self, name: impl Into<String>, observer: Arc<dyn Observer>) {
        let mut observers = self.observers.write().unwrap_or_else(|e| e.into_inner());
        observers.insert(name.into(), observer);
    }

    pub fn remove_observer(&self, name: &str) {
        let mut observers = self.observers.write().unwrap_or_else(|e| e.into_inner());
        observers.remove(name);
    }

    /// Fan `set` out to every registered sink.
    ///
    /// Must be called from within a tokio runtime; sinks run on spawned
    /// tasks and this returns before they complete.
    pub fn publish_set(&self, set: MessageSet) {
        let batchers: Vec<_> = {
            let batchers = self.batchers.read().unwrap_or_else(|e| e.into_inner());
            batchers
                .iter()
                .map(|(name, sink)| (name.clone(), sink.clone()))
                .collect()
        };
        let observers: Vec<_> = {
            let observers = self.observers.read().unwrap_or_else(|e| e.into_inner());
            observers
                .iter()
                .map(|(name, sink)| (name.clone(), sink.clone()))
                .collect()
        };

        trace!(
            "publishing {} messages to {} batchers and {} observers",
            set.messages.len(),
            batchers.len(),
            observers.len()
        );

        for (name, observer) in observers {
            for message in &set.messages {
                let tags = set.tags_for(message);
                let data = message.data.clone();
                let observer = observer.clone();
                let name = name.clone();
                tokio::spawn(async move {
                    if let Err(e) = observer.observe(tags, data).await {
                        warn!("observer '{name}' failed: {e:#}");
                    }
                });
            }
        }

        for (name, batcher) in batchers {
            let set = set.clone();
            tokio::spawn(async move {
                if let Err(e) = batcher.publish(set).await {
                    warn!("batcher '{name}' failed: {e:#}");
                }
            });
        }
    }

    /// Publish a single sample as a one-message set.
    pub fn publish_single(&self, id: impl Into<String>, tags: Vec<String>, data: impl Into<String>) {
        self.publish_set(MessageSet {
            tags: vec![],
            messages: vec![Message {
                id: id.into(),
                tags,
                data: data.into(),
            }],
        });
    }
}

#[async_trait]
impl Publisher for Plexer {
    async fn publish(&self, set: MessageSet) -> Result<()> {
        self.publish_set(set);
        Ok(())
    }
}
