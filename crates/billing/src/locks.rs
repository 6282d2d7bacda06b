//! Per-user serialization points
//!
//! Two layers: a transaction-scoped Postgres advisory lock for multi-statement
//! writes (close-then-insert subscriptions, balance-checked credit debits), and
//! an in-process async mutex per user that spans a whole metered generation.

use std::sync::Arc;

use dashmap::DashMap;
use sqlx::PgConnection;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::error::BillingResult;

/// Take the user's advisory lock for the rest of the current transaction.
pub(crate) async fn lock_user_in_tx(conn: &mut PgConnection, user_id: Uuid) -> BillingResult<()> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1::text, 0))")
        .bind(user_id.to_string())
        .execute(conn)
        .await?;
    Ok(())
}

/// In-process per-user mutexes
#[derive(Clone, Default)]
pub struct UserLocks {
    locks: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `user_id`'s quota state.
    pub async fn acquire(&self, user_id: Uuid) -> UserGuard {
        let mutex = self
            .locks
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;
        UserGuard {
            user_id,
            locks: self.clone(),
            guard: Some(guard),
        }
    }

    /// Number of users with a live lock entry
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    fn release(&self, user_id: Uuid) {
        // Drop the entry once nobody else holds or waits on it
        self.locks
            .remove_if(&user_id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

/// Held while a user's generation is being metered
pub struct UserGuard {
    user_id: Uuid,
    locks: UserLocks,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for UserGuard {
    fn drop(&mut self) {
        // Release the mutex before pruning so the strong count reflects waiters only
        self.guard.take();
        self.locks.release(self.user_id);
    }
}
