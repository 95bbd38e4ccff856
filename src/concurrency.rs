use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// Entries kept before idle locks are swept.
const PRUNE_THRESHOLD: usize = 4096;

/// Lock key for payment confirmation and status changes of one order.
pub fn order_lock_key(order_id: Uuid) -> String {
    format!("order:{}", order_id)
}

/// In-process mutual exclusion keyed by string.
///
/// Serializes read-modify-write sequences on one cart or order inside this
/// process. Cross-process safety comes from the database constraints and
/// guarded updates the services issue inside their transactions.
#[derive(Clone, Default)]
pub struct KeyedLocks(Arc<DashMap<String, Arc<Mutex<()>>>>);

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `key`. Released when the guard drops.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        if self.0.len() > PRUNE_THRESHOLD {
            self.prune();
        }

        let mutex = self
            .0
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    /// Drops entries nobody is holding or waiting on.
    pub fn prune(&self) {
        self.0.retain(|_, mutex| Arc::strong_count(mutex) > 1);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
