//! Bounded in-memory time series
//!
//! Each [`Message`](crate::Message) becomes one [`Point`] in the series named
//! by its id. A series keeps the newest `capacity` points and drops the
//! oldest beyond that.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::trace;

use crate::plexer::{MessageSet, Publisher};
use crate::protocol::UNPARSABLE;

use super::tag_map;

/// Points kept per series unless configured otherwise
pub const DEFAULT_CAPACITY: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Point {
    pub timestamp: DateTime<Utc>,
    pub tags: BTreeMap<String, String>,
    pub value: f64,
}

pub struct MemoryStore {
    capacity: usize,
    series: RwLock<HashMap<String, VecDeque<Point>>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl MemoryStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            series: RwLock::new(HashMap::new()),
        }
    }

    /// Record every message of `set` at the current time.
    pub fn insert(&self, set: &MessageSet) {
        let timestamp = Utc::now();
        let mut series = self.series.write().unwrap_or_else(|e| e.into_inner());

        for message in &set.messages {
            let value = message
                .data
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .unwrap_or_else(|| {
                    trace!("storing {UNPARSABLE} for unparsable '{}'", message.data);
                    -1.0
                });
            let point = Point {
                timestamp,
                tags: tag_map(set.tags.iter().chain(&message.tags)),
                value,
            };

            let points = series.entry(message.id.clone()).or_default();
            if points.len() == self.capacity {
                points.pop_front();
            }
            points.push_back(point);
        }
    }

    /// Newest point of a series.
    pub fn latest(&self, id: &str) -> Option<Point> {
        let series = self.series.read().unwrap_or_else(|e| e.into_inner());
        series.get(id).and_then(|points| points.back().cloned())
    }

    /// All points of a series, oldest first.
    pub fn points(&self, id: &str) -> Vec<Point> {
        let series = self.series.read().unwrap_or_else(|e| e.into_inner());
        series
            .get(id)
            .map(|points| points.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Names of every series, sorted.
    pub fn measurements(&self) -> Vec<String> {
        let series = self.series.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<_> = series.keys().cloned().collect();
        names.sort();
        names
    }

    /// Every tag key seen on any stored point, sorted.
    pub fn tag_keys(&self) -> Vec<String> {
        let series = self.series.read().unwrap_or_else(|e| e.into_inner());
        series
            .values()
            .flatten()
            .flat_map(|point| point.tags.keys().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

#[async_trait]
impl Publisher for MemoryStore {
    async fn publish(&self, set: MessageSet) -> Result<()> {
        self.insert(&set);
        Ok(())
    }
}
