//! Per-document serialization of commits and their events.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

/// Keyed async locks, one per document.
///
/// A service holds the document's lock from the repository write through
/// event publication, so events of one document leave in commit order.
/// Work on different documents never contends.
#[derive(Clone, Default)]
pub struct DocumentLocks {
    inner: Arc<Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>>,
}

impl DocumentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `document_id`.
    pub async fn lock(&self, document_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            // Drop entries nobody holds or waits on.
            map.retain(|_, l| Arc::strong_count(l) > 1);
            map.entry(document_id).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Number of documents with a held or awaited lock.
    pub fn active(&self) -> usize {
        let map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        map.values().filter(|l| Arc::strong_count(l) > 1).count()
    }
}
