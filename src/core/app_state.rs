//! Shared application state.
//!
//! Everything a handler needs is owned here and injected explicitly — no
//! ambient singletons. All members are `Arc`'d so the state clones cheaply
//! into the router.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::alerts::AlertMailer;
use crate::auth::credential_store::CredentialStore;
use crate::auth::orchestrator::{TokenRefreshOrchestrator, RETRY_DELAYS};
use crate::auth::pending::PendingSessions;
use crate::browser::pool::{BrowserPool, ChromeWorkerFactory};
use crate::core::config::ServiceConfig;
use crate::scrape::checker::PaymentChecker;
use crate::session::automator::{SessionAutomator, SuspendedLogin};
use crate::session::captcha::CaptchaSolver;
use crate::session::code_channel::CodeChannel;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServiceConfig>,
    pub store: Arc<CredentialStore>,
    pub pool: Arc<BrowserPool<ChromeWorkerFactory>>,
    pub automator: Arc<SessionAutomator>,
    pub orchestrator: Arc<TokenRefreshOrchestrator<SessionAutomator>>,
    pub pending: Arc<PendingSessions<SuspendedLogin>>,
    pub checker: Arc<PaymentChecker>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        config: Arc<ServiceConfig>,
        http_client: reqwest::Client,
        pool: Arc<BrowserPool<ChromeWorkerFactory>>,
    ) -> Self {
        let store = Arc::new(CredentialStore::new());
        let pending = Arc::new(PendingSessions::new());

        let solver = || CaptchaSolver::new(http_client.clone(), config.two_captcha_api_key.clone());
        let codes = CodeChannel::new(http_client.clone(), config.twilio.clone());
        let alerts = Arc::new(AlertMailer::new(http_client.clone(), config.outlook.clone()));

        let automator = Arc::new(SessionAutomator::new(
            Arc::clone(&config),
            Arc::clone(&pool),
            solver(),
            codes,
        ));
        let orchestrator = Arc::new(TokenRefreshOrchestrator::new(
            Arc::clone(&automator),
            Arc::clone(&store),
            Arc::clone(&pending),
            alerts,
            config.refresh_buffer,
            RETRY_DELAYS.to_vec(),
        ));
        let checker = Arc::new(PaymentChecker::new(
            Arc::clone(&config),
            Arc::clone(&pool),
            solver(),
        ));

        Self {
            config,
            store,
            pool,
            automator,
            orchestrator,
            pending,
            checker,
            started_at: Utc::now(),
        }
    }
}
