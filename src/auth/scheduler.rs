//! Proactive token refresh loop.
//!
//! Wakes on a fixed interval, checks each provider's remaining time-to-expiry
//! against the buffer, and refreshes synchronously within the loop iteration.
//! A slow refresh delays the next check; it never runs two proactive
//! refreshes for the same provider concurrently.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::auth::orchestrator::{RefreshResult, TokenRefreshOrchestrator};
use crate::core::types::Provider;
use crate::session::automator::LoginAutomator;

/// Spawn the refresh loop. The first (immediate) interval tick is skipped so
/// startup traffic settles before any proactive work runs.
pub fn spawn_proactive_refresh<A: LoginAutomator>(
    orchestrator: Arc<TokenRefreshOrchestrator<A>>,
    interval: Duration,
    buffer: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            "scheduler: proactive refresh loop started (interval {:?}, buffer {:?})",
            interval, buffer
        );
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Skip the immediate first tick so startup traffic settles first.
        tick.tick().await;

        loop {
            tick.tick().await;
            for &provider in Provider::ALL {
                let cred = orchestrator.store().get(provider);
                // Only maintain tokens that were issued at least once; the
                // first issuance happens on demand through the API.
                if cred.token.is_none() {
                    continue;
                }
                if cred.is_fresh(buffer) {
                    continue;
                }
                info!(
                    "scheduler: {} token stale ({}m left), refreshing",
                    provider,
                    cred.expires_in_minutes() as i64
                );
                match orchestrator.refresh(provider, false).await {
                    RefreshResult::Token { .. } => {}
                    RefreshResult::Requires2fa { session_id } => warn!(
                        "scheduler: {} refresh needs 2FA (session {})",
                        provider, session_id
                    ),
                    RefreshResult::Failed { code, message } => warn!(
                        "scheduler: {} refresh failed ({:?}): {}",
                        provider, code, message
                    ),
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertSink;
    use crate::auth::credential_store::CredentialStore;
    use crate::auth::pending::PendingSessions;
    use crate::session::automator::{AutomationError, LoginOutcome, ResumeOutcome};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingAutomator {
        logins: AtomicUsize,
    }

    #[async_trait]
    impl LoginAutomator for FailingAutomator {
        type Session = ();

        async fn login(&self, _provider: Provider) -> Result<LoginOutcome<()>, AutomationError> {
            self.logins.fetch_add(1, Ordering::SeqCst);
            Err(AutomationError::Timeout("login".into()))
        }

        async fn resume(
            &self,
            _session: (),
            _code: &str,
        ) -> Result<ResumeOutcome<()>, AutomationError> {
            Err(AutomationError::Lookup("no session".into()))
        }

        async fn discard(&self, _session: ()) {}
    }

    struct CountingAlerts {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AlertSink for CountingAlerts {
        async fn send(&self, _subject: &str, _body: &str) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn orchestrator(
        automator: Arc<FailingAutomator>,
        store: Arc<CredentialStore>,
        alerts: Arc<CountingAlerts>,
    ) -> Arc<TokenRefreshOrchestrator<FailingAutomator>> {
        Arc::new(TokenRefreshOrchestrator::new(
            automator,
            store,
            Arc::new(PendingSessions::new()),
            alerts,
            Duration::from_secs(600),
            vec![Duration::from_millis(1)],
        ))
    }

    #[tokio::test]
    async fn never_issued_providers_are_left_alone() {
        let automator = Arc::new(FailingAutomator {
            logins: AtomicUsize::new(0),
        });
        let alerts = Arc::new(CountingAlerts {
            calls: AtomicUsize::new(0),
        });
        let orch = orchestrator(
            Arc::clone(&automator),
            Arc::new(CredentialStore::new()),
            Arc::clone(&alerts),
        );

        let handle = spawn_proactive_refresh(orch, Duration::from_millis(20), Duration::from_secs(600));
        tokio::time::sleep(Duration::from_millis(150)).await;
        handle.abort();

        // No token has ever been issued, so ticks must not open logins or
        // send failure alerts, however many elapse.
        assert_eq!(automator.logins.load(Ordering::SeqCst), 0);
        assert_eq!(alerts.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stale_issued_token_is_refreshed() {
        let automator = Arc::new(FailingAutomator {
            logins: AtomicUsize::new(0),
        });
        let alerts = Arc::new(CountingAlerts {
            calls: AtomicUsize::new(0),
        });
        let store = Arc::new(CredentialStore::new());
        // An issued token already inside the refresh buffer.
        store.put(
            Provider::Mmi,
            "tok_stale_abcdefghijklmnopqrs".into(),
            Utc::now() + chrono::Duration::minutes(1),
        );
        let orch = orchestrator(Arc::clone(&automator), store, Arc::clone(&alerts));

        let handle = spawn_proactive_refresh(orch, Duration::from_millis(20), Duration::from_secs(600));
        tokio::time::sleep(Duration::from_millis(150)).await;
        handle.abort();

        assert!(automator.logins.load(Ordering::SeqCst) >= 1);
    }
}
