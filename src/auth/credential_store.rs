//! In-memory credential cache — one slot per provider, guarded by a mutex.
//!
//! `get` only returns cached state; it never touches the network. The
//! decision to refresh is made by the orchestrator by comparing `expires_at`
//! against `now + buffer`. Tokens are short-lived, so nothing here survives
//! a restart on purpose.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::core::types::Provider;

/// Cached credential state for one provider.
#[derive(Debug, Clone)]
pub struct Credential {
    pub provider: Provider,
    pub token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub last_refresh: Option<DateTime<Utc>>,
    pub retry_count: u32,
}

impl Credential {
    fn empty(provider: Provider) -> Self {
        Self {
            provider,
            token: None,
            expires_at: DateTime::<Utc>::MIN_UTC,
            last_error: None,
            last_refresh: None,
            retry_count: 0,
        }
    }

    /// True while the token can be served from cache: present and not within
    /// the refresh buffer of its expiry.
    pub fn is_fresh(&self, buffer: Duration) -> bool {
        match &self.token {
            None => false,
            Some(_) => {
                let buffer = chrono::Duration::from_std(buffer).unwrap_or_default();
                Utc::now() + buffer < self.expires_at
            }
        }
    }

    /// Minutes until expiry, clamped at zero. Used by the health endpoint.
    pub fn expires_in_minutes(&self) -> f64 {
        let remaining = self.expires_at - Utc::now();
        (remaining.num_milliseconds() as f64 / 60_000.0).max(0.0)
    }
}

/// Provider → `Credential` map. All mutation happens under one lock; the
/// critical sections are pure in-memory updates so a blocking mutex is fine
/// even on the async paths.
pub struct CredentialStore {
    inner: Mutex<HashMap<Provider, Credential>>,
}

impl CredentialStore {
    pub fn new() -> Self {
        let mut map = HashMap::new();
        for &p in Provider::ALL {
            map.insert(p, Credential::empty(p));
        }
        Self { inner: Mutex::new(map) }
    }

    /// Snapshot of the current credential state.
    pub fn get(&self, provider: Provider) -> Credential {
        self.inner
            .lock()
            .expect("credential store lock poisoned")
            .get(&provider)
            .cloned()
            .unwrap_or_else(|| Credential::empty(provider))
    }

    /// Record a successful refresh. Clears error/retry bookkeeping.
    pub fn put(&self, provider: Provider, token: String, expires_at: DateTime<Utc>) {
        let mut map = self.inner.lock().expect("credential store lock poisoned");
        map.insert(
            provider,
            Credential {
                provider,
                token: Some(token),
                expires_at,
                last_error: None,
                last_refresh: Some(Utc::now()),
                retry_count: 0,
            },
        );
    }

    /// Annotate the slot (e.g. "Waiting for 2FA") without counting it as a
    /// failed attempt.
    pub fn note(&self, provider: Provider, message: impl Into<String>) {
        let mut map = self.inner.lock().expect("credential store lock poisoned");
        let entry = map.entry(provider).or_insert_with(|| Credential::empty(provider));
        entry.last_error = Some(message.into());
    }

    /// Record a failed refresh attempt without touching any cached token.
    pub fn mark_error(&self, provider: Provider, message: impl Into<String>) {
        let mut map = self.inner.lock().expect("credential store lock poisoned");
        let entry = map.entry(provider).or_insert_with(|| Credential::empty(provider));
        entry.last_error = Some(message.into());
        entry.retry_count += 1;
    }

}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUFFER: Duration = Duration::from_secs(600);

    #[test]
    fn starts_empty_and_stale() {
        let store = CredentialStore::new();
        let cred = store.get(Provider::Mmi);
        assert!(cred.token.is_none());
        assert!(!cred.is_fresh(BUFFER));
    }

    #[test]
    fn put_makes_token_fresh_until_buffer() {
        let store = CredentialStore::new();
        store.put(
            Provider::Mmi,
            "tok_abcdefghijklmnopqrstuvwxyz".into(),
            Utc::now() + chrono::Duration::hours(1),
        );
        let cred = store.get(Provider::Mmi);
        assert!(cred.is_fresh(BUFFER));
        assert!(cred.last_refresh.is_some());
        assert_eq!(cred.retry_count, 0);

        // Expiring inside the buffer window means "not fresh" even though the
        // raw expiry is still in the future.
        store.put(
            Provider::Mmi,
            "tok_abcdefghijklmnopqrstuvwxyz".into(),
            Utc::now() + chrono::Duration::minutes(5),
        );
        assert!(!store.get(Provider::Mmi).is_fresh(BUFFER));
    }

    #[test]
    fn mark_error_accumulates_retries_and_keeps_token() {
        let store = CredentialStore::new();
        store.put(
            Provider::Rpr,
            "tok_abcdefghijklmnopqrstuvwxyz".into(),
            Utc::now() + chrono::Duration::hours(1),
        );
        store.mark_error(Provider::Rpr, "login timeout");
        store.mark_error(Provider::Rpr, "login timeout");

        let cred = store.get(Provider::Rpr);
        assert_eq!(cred.retry_count, 2);
        assert_eq!(cred.last_error.as_deref(), Some("login timeout"));
        assert!(cred.token.is_some());
    }
}
