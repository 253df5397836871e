//! Token refresh orchestration: retry policy, single-flight, alerting.
//!
//! Sits between the API surface and the browser-driving automator. Decides
//! *when* to refresh (cache check against the buffer), serializes refreshes
//! per provider (duplicate concurrent logins trip the portals' bot defenses
//! and burn CAPTCHA budget), retries only plausibly-transient failures, and
//! fires exactly one alert per exhausted run.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::alerts::AlertSink;
use crate::auth::credential_store::CredentialStore;
use crate::auth::pending::{PendingEntry, PendingSessions};
use crate::core::types::{ErrorCode, Provider};
use crate::session::automator::{LoginAutomator, LoginOutcome, ResumeOutcome};

/// Inter-attempt backoff. Three attempts; the trailing delay is never slept.
pub const RETRY_DELAYS: [Duration; 3] = [
    Duration::from_secs(5),
    Duration::from_secs(15),
    Duration::from_secs(45),
];

/// Outcome of a refresh or token lookup.
#[derive(Debug, Clone)]
pub enum RefreshResult {
    Token {
        token: String,
        expires_at: DateTime<Utc>,
        cached: bool,
    },
    /// Login suspended on a verification challenge; resumable via the id.
    Requires2fa {
        session_id: Uuid,
    },
    Failed {
        code: ErrorCode,
        message: String,
    },
}

pub struct TokenRefreshOrchestrator<A: LoginAutomator> {
    automator: Arc<A>,
    store: Arc<CredentialStore>,
    pending: Arc<PendingSessions<A::Session>>,
    alerts: Arc<dyn AlertSink>,
    refresh_buffer: Duration,
    retry_delays: Vec<Duration>,
    /// Per-provider flight locks. Held across the whole retry loop so
    /// concurrent callers wait for the in-flight result instead of opening
    /// duplicate browser sessions.
    flights: HashMap<Provider, Mutex<()>>,
}

impl<A: LoginAutomator> TokenRefreshOrchestrator<A> {
    pub fn new(
        automator: Arc<A>,
        store: Arc<CredentialStore>,
        pending: Arc<PendingSessions<A::Session>>,
        alerts: Arc<dyn AlertSink>,
        refresh_buffer: Duration,
        retry_delays: Vec<Duration>,
    ) -> Self {
        let flights = Provider::ALL
            .iter()
            .map(|&p| (p, Mutex::new(())))
            .collect();
        Self {
            automator,
            store,
            pending,
            alerts,
            refresh_buffer,
            retry_delays,
            flights,
        }
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub fn pending(&self) -> &Arc<PendingSessions<A::Session>> {
        &self.pending
    }

    fn cached(&self, provider: Provider) -> Option<RefreshResult> {
        let cred = self.store.get(provider);
        if cred.is_fresh(self.refresh_buffer) {
            let token = cred.token?;
            return Some(RefreshResult::Token {
                token,
                expires_at: cred.expires_at,
                cached: true,
            });
        }
        None
    }

    /// Serve from cache while fresh; otherwise refresh.
    pub async fn get_token(&self, provider: Provider) -> RefreshResult {
        if let Some(hit) = self.cached(provider) {
            return hit;
        }
        self.refresh(provider, false).await
    }

    /// Run the refresh flow for one provider. With `force`, a fresh cached
    /// token is ignored instead of short-circuiting.
    ///
    /// Single-flight: late arrivals block on the provider's flight lock and
    /// then re-check the store — if the winner already refreshed, they get
    /// its result without opening a browser.
    pub async fn refresh(&self, provider: Provider, force: bool) -> RefreshResult {
        let flight = self
            .flights
            .get(&provider)
            .expect("all providers have flight locks");
        let _guard = flight.lock().await;

        if !force {
            if let Some(hit) = self.cached(provider) {
                return hit;
            }
        }

        let attempts = self.retry_delays.len();
        let mut last_error: Option<(ErrorCode, String)> = None;

        for attempt in 0..attempts {
            info!(
                "{}: refresh attempt {}/{}",
                provider,
                attempt + 1,
                attempts
            );
            match self.automator.login(provider).await {
                Ok(LoginOutcome::Token { token, expires_at }) => {
                    self.store.put(provider, token.clone(), expires_at);
                    info!("{}: token refreshed", provider);
                    return RefreshResult::Token {
                        token,
                        expires_at,
                        cached: false,
                    };
                }
                Ok(LoginOutcome::Requires2fa { session }) => {
                    // Retrying immediately is pointless; surface as-is.
                    self.store.note(provider, "Waiting for 2FA");
                    let session_id = self.pending.insert(provider, session).await;
                    return RefreshResult::Requires2fa { session_id };
                }
                Err(e) => {
                    let retryable = e.is_retryable();
                    warn!("{}: refresh attempt {} failed: {}", provider, attempt + 1, e);
                    self.store.mark_error(provider, e.to_string());
                    last_error = Some((e.code(), e.to_string()));
                    if !retryable {
                        break;
                    }
                    if attempt + 1 < attempts {
                        let delay = self.retry_delays[attempt];
                        info!("{}: retrying in {:?}", provider, delay);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        let (code, message) =
            last_error.unwrap_or((ErrorCode::LookupError, "unknown error".to_string()));
        error!("{}: all refresh attempts failed: {}", provider, message);
        self.alerts
            .send(
                &format!("[portal-sentry] {} token refresh FAILED", provider),
                &format!(
                    "All attempts to refresh the {} token have failed.\n\n\
                     Last error: {}\nTime: {}\n\n\
                     Manual intervention may be required.",
                    provider,
                    message,
                    Utc::now().to_rfc3339()
                ),
            )
            .await;
        RefreshResult::Failed { code, message }
    }

    /// Force-refresh every provider sequentially. Used by `POST /tokens/refresh`.
    pub async fn refresh_all(&self) -> Vec<(Provider, RefreshResult)> {
        let mut results = Vec::with_capacity(Provider::ALL.len());
        for &provider in Provider::ALL {
            let result = self.refresh(provider, true).await;
            results.push((provider, result));
        }
        results
    }

    /// Resume a suspended 2FA session with an externally supplied code.
    ///
    /// The session must belong to `provider` — a mismatched path reads as
    /// not-found, without revealing which provider owns the id. A rejected
    /// code re-parks the session under the same id; only terminal faults
    /// destroy it.
    pub async fn resume_2fa(
        &self,
        provider: Provider,
        session_id: Uuid,
        code: &str,
    ) -> RefreshResult {
        let not_found = || RefreshResult::Failed {
            code: ErrorCode::NotFound,
            message: "2FA session not found or expired".to_string(),
        };
        let Some(entry) = self.pending.take(session_id).await else {
            return not_found();
        };
        if entry.provider != provider {
            warn!(
                "{}: refused 2FA resume for session {} owned by {}",
                provider, session_id, entry.provider
            );
            self.pending.put_back(session_id, entry).await;
            return not_found();
        }

        match self.automator.resume(entry.session, code).await {
            Ok(ResumeOutcome::Token { token, expires_at }) => {
                self.store.put(provider, token.clone(), expires_at);
                info!("{}: token refreshed via 2FA resume", provider);
                RefreshResult::Token {
                    token,
                    expires_at,
                    cached: false,
                }
            }
            Ok(ResumeOutcome::Rejected(session)) => {
                self.pending
                    .put_back(
                        session_id,
                        PendingEntry {
                            provider,
                            touched_at: entry.touched_at,
                            session,
                        },
                    )
                    .await;
                RefreshResult::Failed {
                    code: ErrorCode::LookupError,
                    message: "2FA code was not accepted".to_string(),
                }
            }
            Err(e) => {
                self.store.mark_error(provider, e.to_string());
                RefreshResult::Failed {
                    code: e.code(),
                    message: e.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::automator::AutomationError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingAlerts {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AlertSink for CountingAlerts {
        async fn send(&self, _subject: &str, _body: &str) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Scripted automator: pops the next outcome off a list per login call.
    struct ScriptedAutomator {
        logins: AtomicUsize,
        script: Vec<Script>,
    }

    #[derive(Clone)]
    enum Script {
        Timeout,
        Captcha,
        NoCreds,
        Token(&'static str),
        TwoFa,
    }

    #[async_trait]
    impl LoginAutomator for ScriptedAutomator {
        type Session = &'static str;

        async fn login(
            &self,
            provider: Provider,
        ) -> Result<LoginOutcome<&'static str>, AutomationError> {
            let i = self.logins.fetch_add(1, Ordering::SeqCst);
            let step = self.script.get(i).cloned().unwrap_or(Script::Timeout);
            match step {
                Script::Timeout => Err(AutomationError::Timeout("login".into())),
                Script::Captcha => Err(AutomationError::CaptchaFailed),
                Script::NoCreds => Err(AutomationError::MissingCredentials(provider)),
                Script::Token(t) => Ok(LoginOutcome::Token {
                    token: t.to_string(),
                    expires_at: Utc::now() + chrono::Duration::hours(1),
                }),
                Script::TwoFa => Ok(LoginOutcome::Requires2fa {
                    session: "parked-browser",
                }),
            }
        }

        async fn resume(
            &self,
            session: &'static str,
            code: &str,
        ) -> Result<ResumeOutcome<&'static str>, AutomationError> {
            if code == "482913" {
                Ok(ResumeOutcome::Token {
                    token: "tok_resumed_abcdefghijklmnop".to_string(),
                    expires_at: Utc::now() + chrono::Duration::hours(1),
                })
            } else {
                Ok(ResumeOutcome::Rejected(session))
            }
        }

        async fn discard(&self, _session: &'static str) {}
    }

    fn orchestrator(
        script: Vec<Script>,
    ) -> (
        TokenRefreshOrchestrator<ScriptedAutomator>,
        Arc<CountingAlerts>,
    ) {
        let alerts = Arc::new(CountingAlerts {
            calls: AtomicUsize::new(0),
        });
        let orch = TokenRefreshOrchestrator::new(
            Arc::new(ScriptedAutomator {
                logins: AtomicUsize::new(0),
                script,
            }),
            Arc::new(CredentialStore::new()),
            Arc::new(PendingSessions::new()),
            alerts.clone(),
            Duration::from_secs(600),
            vec![
                Duration::from_millis(1),
                Duration::from_millis(1),
                Duration::from_millis(1),
            ],
        );
        (orch, alerts)
    }

    #[tokio::test]
    async fn persistent_timeout_retries_three_times_then_alerts_once() {
        let (orch, alerts) = orchestrator(vec![Script::Timeout, Script::Timeout, Script::Timeout]);

        let result = orch.refresh(Provider::Mmi, true).await;
        assert!(matches!(
            result,
            RefreshResult::Failed {
                code: ErrorCode::Timeout,
                ..
            }
        ));
        assert_eq!(orch.automator.logins.load(Ordering::SeqCst), 3);
        assert_eq!(alerts.calls.load(Ordering::SeqCst), 1);
        assert_eq!(orch.store.get(Provider::Mmi).retry_count, 3);
    }

    #[tokio::test]
    async fn transient_failure_recovers_on_retry() {
        let (orch, alerts) = orchestrator(vec![
            Script::Timeout,
            Script::Token("tok_recovered_abcdefghijklmnop"),
        ]);

        let result = orch.refresh(Provider::Mmi, true).await;
        match result {
            RefreshResult::Token { token, cached, .. } => {
                assert_eq!(token, "tok_recovered_abcdefghijklmnop");
                assert!(!cached);
            }
            other => panic!("expected token, got {:?}", other),
        }
        assert_eq!(alerts.calls.load(Ordering::SeqCst), 0);
        // Success clears the retry bookkeeping.
        assert_eq!(orch.store.get(Provider::Mmi).retry_count, 0);
    }

    #[tokio::test]
    async fn captcha_failure_is_not_retried() {
        let (orch, alerts) = orchestrator(vec![Script::Captcha, Script::Token("tok_never_seen_x")]);

        let result = orch.refresh(Provider::Mmi, true).await;
        assert!(matches!(
            result,
            RefreshResult::Failed {
                code: ErrorCode::CaptchaFailed,
                ..
            }
        ));
        assert_eq!(orch.automator.logins.load(Ordering::SeqCst), 1);
        assert_eq!(alerts.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_credentials_fail_fast_without_retry() {
        let (orch, alerts) = orchestrator(vec![Script::NoCreds, Script::Token("tok_never_seen_x")]);

        let result = orch.refresh(Provider::Mmi, true).await;
        assert!(matches!(
            result,
            RefreshResult::Failed {
                code: ErrorCode::LookupError,
                ..
            }
        ));
        // Unconfigured credentials are deterministic; one attempt, one alert.
        assert_eq!(orch.automator.logins.load(Ordering::SeqCst), 1);
        assert_eq!(alerts.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn requires_2fa_short_circuits_and_registers_session() {
        let (orch, _alerts) = orchestrator(vec![Script::TwoFa]);

        let result = orch.refresh(Provider::Mmi, true).await;
        let RefreshResult::Requires2fa { session_id } = result else {
            panic!("expected requires_2fa");
        };
        assert_eq!(orch.automator.logins.load(Ordering::SeqCst), 1);
        assert_eq!(orch.pending.count().await, 1);
        assert_eq!(
            orch.store.get(Provider::Mmi).last_error.as_deref(),
            Some("Waiting for 2FA")
        );

        // Wrong code: rejected, session survives under the same id.
        let rejected = orch.resume_2fa(Provider::Mmi, session_id, "000000").await;
        assert!(matches!(
            rejected,
            RefreshResult::Failed {
                code: ErrorCode::LookupError,
                ..
            }
        ));
        assert_eq!(orch.pending.count().await, 1);

        // Correct code: token lands in the store, session is gone.
        let accepted = orch.resume_2fa(Provider::Mmi, session_id, "482913").await;
        assert!(matches!(accepted, RefreshResult::Token { cached: false, .. }));
        assert_eq!(orch.pending.count().await, 0);
        assert!(orch.store.get(Provider::Mmi).token.is_some());

        // Resuming a consumed session reports not-found.
        let gone = orch.resume_2fa(Provider::Mmi, session_id, "482913").await;
        assert!(matches!(
            gone,
            RefreshResult::Failed {
                code: ErrorCode::NotFound,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn resume_via_wrong_provider_path_is_refused() {
        let (orch, _alerts) = orchestrator(vec![Script::TwoFa]);

        let RefreshResult::Requires2fa { session_id } = orch.refresh(Provider::Mmi, true).await
        else {
            panic!("expected requires_2fa");
        };

        // A valid code through the wrong provider path must not consume the
        // session, and must read as not-found.
        let refused = orch.resume_2fa(Provider::Rpr, session_id, "482913").await;
        assert!(matches!(
            refused,
            RefreshResult::Failed {
                code: ErrorCode::NotFound,
                ..
            }
        ));
        assert_eq!(orch.pending.count().await, 1);

        // The rightful provider path still works.
        let accepted = orch.resume_2fa(Provider::Mmi, session_id, "482913").await;
        assert!(matches!(accepted, RefreshResult::Token { .. }));
    }

    #[tokio::test]
    async fn cached_token_short_circuits_refresh() {
        let (orch, _alerts) = orchestrator(vec![Script::Token("tok_only_once_abcdefghijk")]);

        let first = orch.get_token(Provider::Mmi).await;
        assert!(matches!(first, RefreshResult::Token { cached: false, .. }));
        let second = orch.get_token(Provider::Mmi).await;
        assert!(matches!(second, RefreshResult::Token { cached: true, .. }));
        assert_eq!(orch.automator.logins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_flight() {
        let (orch, _alerts) = orchestrator(vec![
            Script::Token("tok_flight_abcdefghijklmnop"),
            Script::Token("tok_should_not_happen_zzz"),
        ]);
        let orch = Arc::new(orch);

        let a = tokio::spawn({
            let orch = Arc::clone(&orch);
            async move { orch.get_token(Provider::Mmi).await }
        });
        let b = tokio::spawn({
            let orch = Arc::clone(&orch);
            async move { orch.get_token(Provider::Mmi).await }
        });
        let (ra, rb) = (a.await.unwrap(), b.await.unwrap());

        for r in [ra, rb] {
            match r {
                RefreshResult::Token { token, .. } => {
                    assert_eq!(token, "tok_flight_abcdefghijklmnop")
                }
                other => panic!("expected token, got {:?}", other),
            }
        }
        // Exactly one browser login despite two concurrent callers.
        assert_eq!(orch.automator.logins.load(Ordering::SeqCst), 1);
    }
}
