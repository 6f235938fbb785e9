//! Per-transaction mutual exclusion
//!
//! One async mutex per transaction id, created on demand and dropped once no
//! task holds or waits on it. The registry mutex is only held for the map
//! lookup, so work on distinct transactions never serializes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::timeout;
use tracing::warn;

use crate::error::PaymentError;

/// Prune dead entries once the registry grows past this many keys
const PRUNE_THRESHOLD: usize = 1024;

/// Guard held for the duration of a read-modify-write on one transaction
pub type TransactionGuard = OwnedMutexGuard<()>;

pub struct TransactionLocks {
    registry: Mutex<HashMap<String, Weak<AsyncMutex<()>>>>,
    acquire_timeout: Duration,
}

impl TransactionLocks {
    pub fn new(acquire_timeout: Duration) -> Self {
        Self {
            registry: Mutex::new(HashMap::new()),
            acquire_timeout,
        }
    }

    fn handle(&self, transaction_id: &str) -> Arc<AsyncMutex<()>> {
        let mut registry = self
            .registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(existing) = registry.get(transaction_id).and_then(Weak::upgrade) {
            return existing;
        }

        if registry.len() >= PRUNE_THRESHOLD {
            registry.retain(|_, weak| weak.strong_count() > 0);
        }

        let lock = Arc::new(AsyncMutex::new(()));
        registry.insert(transaction_id.to_string(), Arc::downgrade(&lock));
        lock
    }

    /// Wait for exclusive access to `transaction_id`, bounded by the
    /// configured timeout.
    pub async fn acquire(&self, transaction_id: &str) -> Result<TransactionGuard, PaymentError> {
        let lock = self.handle(transaction_id);
        match timeout(self.acquire_timeout, lock.lock_owned()).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                warn!(
                    tx_id = %transaction_id,
                    timeout_ms = self.acquire_timeout.as_millis() as u64,
                    "Timed out waiting for transaction lock"
                );
                Err(PaymentError::LockTimeout {
                    transaction_id: transaction_id.to_string(),
                })
            }
        }
    }

    /// Take the lock only if nobody holds it right now
    pub fn try_acquire(&self, transaction_id: &str) -> Option<TransactionGuard> {
        self.handle(transaction_id).try_lock_owned().ok()
    }

    /// Number of live lock entries
    pub fn active_keys(&self) -> usize {
        let registry = self
            .registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        registry.values().filter(|w| w.strong_count() > 0).count()
    }
}
