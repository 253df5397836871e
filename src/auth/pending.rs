//! Registry of suspended 2FA login sessions.
//!
//! Each entry owns a parked browser session waiting for an externally
//! supplied verification code. Entries are taken out of the map for the
//! duration of a resume attempt (so two submissions for the same session
//! cannot race a single browser) and put back if the code was rejected.
//!
//! A background reaper evicts entries whose last activity is older than the
//! configured TTL — an unreaped entry leaks a pool slot permanently. Any
//! resume attempt counts as activity and restarts the clock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::core::types::Provider;
use crate::session::automator::LoginAutomator;

pub struct PendingEntry<S> {
    pub provider: Provider,
    /// Last interaction with the session (insert or re-park).
    pub touched_at: DateTime<Utc>,
    pub session: S,
}

/// Map of suspended sessions, keyed by the id handed to API callers.
pub struct PendingSessions<S> {
    inner: Mutex<HashMap<Uuid, PendingEntry<S>>>,
}

impl<S: Send + 'static> PendingSessions<S> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Park a session and return its id.
    pub async fn insert(&self, provider: Provider, session: S) -> Uuid {
        let id = Uuid::new_v4();
        self.inner.lock().await.insert(
            id,
            PendingEntry {
                provider,
                touched_at: Utc::now(),
                session,
            },
        );
        info!("pending_2fa: registered session {} for {}", id, provider);
        id
    }

    /// Remove and return an entry for a resume attempt.
    pub async fn take(&self, id: Uuid) -> Option<PendingEntry<S>> {
        self.inner.lock().await.remove(&id)
    }

    /// Re-park an entry whose code was rejected, under the same id. The
    /// attempt counts as activity, so the TTL clock restarts.
    pub async fn put_back(&self, id: Uuid, mut entry: PendingEntry<S>) {
        entry.touched_at = Utc::now();
        self.inner.lock().await.insert(id, entry);
    }

    /// Ids of outstanding sessions for one provider.
    pub async fn ids_for(&self, provider: Provider) -> Vec<Uuid> {
        self.inner
            .lock()
            .await
            .iter()
            .filter(|(_, e)| e.provider == provider)
            .map(|(id, _)| *id)
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Remove and return every entry inactive for longer than `ttl`.
    pub async fn drain_expired(&self, ttl: Duration) -> Vec<(Uuid, PendingEntry<S>)> {
        let cutoff = Utc::now() - chrono::Duration::from_std(ttl).unwrap_or_default();
        let mut map = self.inner.lock().await;
        let expired: Vec<Uuid> = map
            .iter()
            .filter(|(_, e)| e.touched_at < cutoff)
            .map(|(id, _)| *id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| map.remove(&id).map(|e| (id, e)))
            .collect()
    }
}

impl<S: Send + 'static> Default for PendingSessions<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// Background loop that evicts expired sessions and hands their browser
/// workers back to the pool via the automator.
pub fn spawn_reaper<A: LoginAutomator>(
    pending: Arc<PendingSessions<A::Session>>,
    automator: Arc<A>,
    ttl: Duration,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            let expired = pending.drain_expired(ttl).await;
            for (id, entry) in expired {
                warn!(
                    "pending_2fa: reaping session {} for {} (last activity {})",
                    id, entry.provider, entry.touched_at
                );
                automator.discard(entry.session).await;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_take_put_back_roundtrip() {
        let pending: PendingSessions<u32> = PendingSessions::new();
        let id = pending.insert(Provider::Mmi, 7).await;
        assert_eq!(pending.count().await, 1);
        assert_eq!(pending.ids_for(Provider::Mmi).await, vec![id]);
        assert!(pending.ids_for(Provider::Rpr).await.is_empty());

        let entry = pending.take(id).await.unwrap();
        assert_eq!(entry.session, 7);
        assert_eq!(pending.count().await, 0);
        // A second take (double submit) finds nothing.
        assert!(pending.take(id).await.is_none());

        pending.put_back(id, entry).await;
        assert_eq!(pending.count().await, 1);
        assert_eq!(pending.take(id).await.unwrap().session, 7);
    }

    #[tokio::test]
    async fn drain_expired_only_evicts_old_entries() {
        let pending: PendingSessions<u32> = PendingSessions::new();
        let old_id = pending.insert(Provider::Mmi, 1).await;
        // Backdate the first entry past the TTL.
        {
            let mut map = pending.inner.lock().await;
            map.get_mut(&old_id).unwrap().touched_at = Utc::now() - chrono::Duration::minutes(20);
        }
        let fresh_id = pending.insert(Provider::Rpr, 2).await;

        let expired = pending.drain_expired(Duration::from_secs(600)).await;
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, old_id);
        assert_eq!(pending.count().await, 1);
        assert!(pending.take(fresh_id).await.is_some());
    }

    #[tokio::test]
    async fn put_back_restarts_the_inactivity_clock() {
        let pending: PendingSessions<u32> = PendingSessions::new();
        let id = pending.insert(Provider::Mmi, 9).await;
        {
            let mut map = pending.inner.lock().await;
            map.get_mut(&id).unwrap().touched_at = Utc::now() - chrono::Duration::minutes(20);
        }

        // A rejected-code round trip re-parks the session as fresh activity,
        // so the reaper must leave it alone.
        let entry = pending.take(id).await.unwrap();
        pending.put_back(id, entry).await;

        assert!(pending.drain_expired(Duration::from_secs(600)).await.is_empty());
        assert_eq!(pending.count().await, 1);
    }
}
