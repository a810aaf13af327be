//! Per-entity mutual exclusion.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::models::EntityKey;

/// Serializes conflict detection, resolution and replica writes per entity.
///
/// Operations on different entities never wait on each other.
#[derive(Debug, Default)]
pub struct EntityLocks {
    locks: Mutex<HashMap<EntityKey, Arc<AsyncMutex<()>>>>,
}

impl EntityLocks {
    /// Wait for exclusive access to one entity.
    pub async fn lock(&self, key: &EntityKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            // Entries only referenced by the map have no holder or waiter
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread")]
    async fn same_entity_waits() {
        let locks = Arc::new(EntityLocks::default());
        let key = EntityKey::new("task", "t1");

        let guard = locks.lock(&key).await;
        let contender = {
            let locks = Arc::clone(&locks);
            let key = key.clone();
            tokio::spawn(async move {
                let _guard = locks.lock(&key).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());
        drop(guard);
        tokio::time::timeout(Duration::from_secs(5), contender)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn different_entities_do_not_block() {
        let locks = EntityLocks::default();
        let _first = locks.lock(&EntityKey::new("task", "t1")).await;
        let second = tokio::time::timeout(
            Duration::from_secs(1),
            locks.lock(&EntityKey::new("task", "t2")),
        )
        .await;
        assert!(second.is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn idle_entries_are_pruned() {
        let locks = EntityLocks::default();
        for index in 0..10 {
            let _guard = locks.lock(&EntityKey::new("task", &format!("t{index}"))).await;
        }
        assert!(locks.tracked() <= 1);
    }
}
