//! In-process sinks for the [`Plexer`](crate::Plexer)
//!
//! - [`MemoryStore`]: batch sink keeping a bounded history per metric
//! - [`BroadcastObserver`]: single sink republishing samples to live subscribers
//! - [`WebhookObserver`]: single sink posting samples as JSON (feature `webhook`)

pub mod broadcast;
pub mod memory;
#[cfg(feature = "webhook")]
pub mod webhook;

use std::collections::BTreeMap;

pub use broadcast::{BroadcastObserver, Sample};
pub use memory::{MemoryStore, Point};
#[cfg(feature = "webhook")]
pub use webhook::WebhookObserver;

/// Turn `key:value` tags into a map, dropping entries without a `:`.
///
/// Later tags win over earlier ones with the same key.
pub fn tag_map<'a>(tags: impl IntoIterator<Item = &'a String>) -> BTreeMap<String, String> {
    tags.into_iter()
        .filter_map(|tag| tag.split_once(':'))
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}
