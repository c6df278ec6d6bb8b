//! Catalog-write signals and the task that reacts to them.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::result_cache::ResultCache;

/// Sent after any catalog mutation. Only the reason travels with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationSignal {
    pub reason: String,
}

impl InvalidationSignal {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Anything holding state derived from the catalog.
pub trait Invalidate: Send + Sync {
    fn invalidate(&self, reason: &str);
}

impl<V: Clone + Send + Sync> Invalidate for ResultCache<V> {
    fn invalidate(&self, _reason: &str) {
        ResultCache::invalidate(self);
    }
}

/// In-process fan-out of invalidation signals.
#[derive(Debug, Clone)]
pub struct InvalidationBus {
    sender: broadcast::Sender<InvalidationSignal>,
}

impl InvalidationBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Returns how many listeners received the signal.
    pub fn publish(&self, reason: impl Into<String>) -> usize {
        self.sender.send(InvalidationSignal::new(reason)).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InvalidationSignal> {
        self.sender.subscribe()
    }
}

impl Default for InvalidationBus {
    fn default() -> Self {
        Self::new(64)
    }
}

/// Drops every target's state on each signal until the bus closes.
///
/// A lagged receiver has missed signals it cannot name, so it invalidates everything.
pub fn spawn_invalidation_listener(
    mut receiver: broadcast::Receiver<InvalidationSignal>,
    targets: Vec<Arc<dyn Invalidate>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(signal) => {
                    info!(reason = %signal.reason, targets = targets.len(), "catalog invalidated");
                    for target in &targets {
                        target.invalidate(&signal.reason);
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "invalidation listener lagged; dropping all caches");
                    for target in &targets {
                        target.invalidate("lagged");
                    }
                }
                Err(RecvError::Closed) => {
                    info!("invalidation bus closed");
                    break;
                }
            }
        }
    })
}
