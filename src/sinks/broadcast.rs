//! Live fan-out of single samples over a tokio broadcast channel

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::plexer::Observer;

/// One sample as seen by live subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    pub tags: Vec<String>,
    pub data: String,
    pub received_at: DateTime<Utc>,
}

/// Single sink republishing every sample it observes
///
/// Subscribers that lag behind lose the oldest samples; publishing with no
/// subscriber is not an error.
pub struct BroadcastObserver {
    sender: broadcast::Sender<Sample>,
}

impl BroadcastObserver {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Sample> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl Observer for BroadcastObserver {
    async fn observe(&self, tags: Vec<String>, data: String) -> Result<()> {
        let sample = Sample {
            tags,
            data,
            received_at: Utc::now(),
        };
        if self.sender.send(sample).is_err() {
            trace!("no live subscribers");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Plexer;
    use crate::plexer::{Message, MessageSet};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_subscribers_receive_tagged_samples() {
        let observer = Arc::new(BroadcastObserver::new(16));
        let mut rx = observer.subscribe();

        let plexer = Plexer::new();
        plexer.add_observer("live", observer.clone());
        plexer.publish_set(MessageSet {
            tags: vec!["metrics".to_string()],
            messages: vec![Message {
                id: "cpu".to_string(),
                tags: vec!["role:web".to_string()],
                data: "42.0000".to_string(),
            }],
        });

        let sample = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sample.tags, vec!["role:web", "metrics", "cpu"]);
        assert_eq!(sample.data, "42.0000");
    }

    #[tokio::test]
    async fn test_observe_without_subscribers_is_ok() {
        let observer = BroadcastObserver::new(4);
        assert!(observer.observe(vec![], "1".to_string()).await.is_ok());
    }
}
