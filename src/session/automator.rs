//! Login session automation.
//!
//! Drives a pooled Chromium worker through one provider's login flow:
//!
//! ```text
//! START → NAVIGATE → AUTHENTICATE → CHALLENGE_CHECK
//!       → {RESOLVE_CAPTCHA | RESOLVE_CODE | PROCEED} → VERIFY → DONE/FAILED
//! ```
//!
//! All page interaction goes through `page.evaluate` JS snippets; selector
//! fallbacks are plain data slices tried in priority order by one interpreter
//! (`fill_first`/`click_first`), so adjusting to a portal's markup change is
//! a data edit.
//!
//! A login stalled on a verification code that SMS auto-read cannot satisfy
//! is *suspended*, not failed: the browser lease stays checked out inside a
//! [`SuspendedLogin`] until a code arrives via the resume API or the pending
//! reaper times it out.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::network::EventRequestWillBeSent;
use chromiumoxide::Page;
use chrono::{DateTime, TimeZone, Utc};
use futures::StreamExt;
use percent_encoding::percent_decode_str;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::browser::pool::{BrowserPool, ChromeWorker, ChromeWorkerFactory, Lease, PoolError};
use crate::browser::{manager, storage_state};
use crate::core::config::ServiceConfig;
use crate::core::types::{ErrorCode, Provider};
use crate::session::captcha::{self, CaptchaSolver, SolveError};
use crate::session::challenge::{self, ChallengeKind, PageSnapshot};
use crate::session::code_channel::CodeChannel;

const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(30);
const SETTLE_QUIET_MS: u64 = 1_500;
const SETTLE_TIMEOUT_MS: u64 = 15_000;
const MAX_CAPTCHA_ROUNDS: u32 = 3;
const MIN_TOKEN_LEN: usize = 20;
const CODE_WINDOW: Duration = Duration::from_secs(60);
// Conservative token lifetime when no cookie carries a usable expiry:
// one hour minus a five-minute safety margin.
const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(55 * 60);

// ─────────────────────────────────────────────────────────────────────────────
// Provider profiles — per-site URLs and selector fallback chains, as data
// ─────────────────────────────────────────────────────────────────────────────

pub struct ProviderProfile {
    /// Authenticated landing page; navigating here with a live session must
    /// not bounce to a login form.
    pub landing_url: &'static str,
    pub login_url: &'static str,
    /// Pages whose load fires authorized API calls, visited to coax a token
    /// out of a session that logged in without making any.
    pub token_trigger_urls: &'static [&'static str],
    /// URL substrings that mean "still unauthenticated" after navigation.
    pub unauthenticated_markers: &'static [&'static str],
    /// Request-URL substrings a sniffed Authorization header must match.
    pub token_url_markers: &'static [&'static str],
    /// Cookie names that may carry the bearer token.
    pub token_cookie_names: &'static [&'static str],

    pub email_selectors: &'static [&'static str],
    pub password_selectors: &'static [&'static str],
    pub submit_selectors: &'static [&'static str],
    pub send_code_selectors: &'static [&'static str],
}

static MMI_PROFILE: ProviderProfile = ProviderProfile {
    landing_url: "https://new.mmi.run/dashboard",
    login_url: "https://new.mmi.run/login",
    token_trigger_urls: &[
        "https://new.mmi.run/dashboard",
        "https://new.mmi.run/property-search",
    ],
    unauthenticated_markers: &["/login"],
    token_url_markers: &["mmi.run"],
    token_cookie_names: &["api_key"],
    email_selectors: &["input[type=\"email\"]", "input[name=\"email\"]"],
    password_selectors: &["input[type=\"password\"]", "input[name=\"password\"]"],
    submit_selectors: &[
        "button[type=\"submit\"]",
        "text=Sign In",
        "text=Log In",
        "text=Login",
        "input[type=\"submit\"]",
    ],
    send_code_selectors: &[
        "text=Send Verification Code",
        "text=Send Code",
        "text=Send OTP",
        "text=Get Code",
    ],
};

static RPR_PROFILE: ProviderProfile = ProviderProfile {
    landing_url: "https://www.narrpr.com/home",
    login_url: "https://www.narrpr.com/home",
    token_trigger_urls: &["https://www.narrpr.com/search"],
    unauthenticated_markers: &["login", "signin", "sso"],
    token_url_markers: &["narrpr.com", "rpr"],
    token_cookie_names: &["token", "jwt", "access_token", "id_token"],
    email_selectors: &[
        "input[type=\"email\"]",
        "input[name=\"email\"]",
        "input[id*=\"email\"]",
        "input[placeholder*=\"email\" i]",
    ],
    password_selectors: &["input[type=\"password\"]"],
    submit_selectors: &[
        "text=Next",
        "text=Continue",
        "text=Sign In",
        "text=Log In",
        "button[type=\"submit\"]",
        "input[type=\"submit\"]",
    ],
    send_code_selectors: &["text=Send Verification Code", "text=Send Code"],
};

pub fn profile(provider: Provider) -> &'static ProviderProfile {
    match provider {
        Provider::Mmi => &MMI_PROFILE,
        Provider::Rpr => &RPR_PROFILE,
    }
}

// Code-entry selectors are shared across providers.
const CODE_INPUT_SELECTORS: &[&str] = &[
    "input[name=\"code\"]",
    "input[name=\"otp\"]",
    "input[name=\"totp\"]",
    "input[name=\"mfaCode\"]",
    "input[name=\"mfa_code\"]",
    "input[name=\"verificationCode\"]",
    "input[name=\"verification_code\"]",
    "input[name=\"twoFactorCode\"]",
    "input[placeholder*=\"code\" i]",
    "input[placeholder*=\"verification\" i]",
    "input[placeholder*=\"digit\" i]",
    "input[aria-label*=\"code\" i]",
    "input[autocomplete=\"one-time-code\"]",
    "input[type=\"tel\"][maxlength=\"6\"]",
    "input[inputmode=\"numeric\"][maxlength=\"6\"]",
    "input.otp-input",
    "input.code-input",
];

const CODE_SUBMIT_SELECTORS: &[&str] = &[
    "button[type=\"submit\"]",
    "text=Verify",
    "text=Submit",
    "text=Continue",
    "text=Confirm",
    "input[type=\"submit\"]",
];

// ─────────────────────────────────────────────────────────────────────────────
// Errors and outcomes
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum AutomationError {
    #[error("credentials not configured for {0}")]
    MissingCredentials(Provider),
    #[error("no browser worker available: {0}")]
    NoBrowser(#[from] PoolError),
    #[error("captcha solve attempts exhausted")]
    CaptchaFailed,
    #[error("operation timed out: {0}")]
    Timeout(String),
    #[error("login automation failed: {0}")]
    Lookup(String),
}

impl AutomationError {
    pub fn code(&self) -> ErrorCode {
        match self {
            AutomationError::MissingCredentials(_) => ErrorCode::LookupError,
            AutomationError::NoBrowser(_) => ErrorCode::NoBrowser,
            AutomationError::CaptchaFailed => ErrorCode::CaptchaFailed,
            AutomationError::Timeout(_) => ErrorCode::Timeout,
            AutomationError::Lookup(_) => ErrorCode::LookupError,
        }
    }

    /// Transient kinds worth retrying from the orchestrator.
    pub fn is_retryable(&self) -> bool {
        match self {
            // Retrying cannot conjure credentials into the environment.
            AutomationError::MissingCredentials(_) => false,
            _ => self.code().is_retryable(),
        }
    }
}

/// Result of a login attempt. `Requires2fa` is non-terminal: the session is
/// suspended and resumable, not failed.
pub enum LoginOutcome<S> {
    Token {
        token: String,
        expires_at: DateTime<Utc>,
    },
    Requires2fa {
        session: S,
    },
}

/// Result of resuming a suspended session with an externally supplied code.
/// `Rejected` hands the still-pending session back to the caller.
pub enum ResumeOutcome<S> {
    Token {
        token: String,
        expires_at: DateTime<Utc>,
    },
    Rejected(S),
}

/// Seam between the orchestrator and the browser-driving machinery.
#[async_trait]
pub trait LoginAutomator: Send + Sync + 'static {
    type Session: Send + 'static;

    async fn login(
        &self,
        provider: Provider,
    ) -> Result<LoginOutcome<Self::Session>, AutomationError>;

    async fn resume(
        &self,
        session: Self::Session,
        code: &str,
    ) -> Result<ResumeOutcome<Self::Session>, AutomationError>;

    /// Tear down a suspended session, returning its worker to the pool.
    async fn discard(&self, session: Self::Session);
}

// ─────────────────────────────────────────────────────────────────────────────
// Token sniffer — captures Authorization headers from outbound requests
// ─────────────────────────────────────────────────────────────────────────────

/// Background listener on `Network.requestWillBeSent` that records the first
/// plausible bearer token sent to the provider's own API.
pub struct TokenSniffer {
    captured: Arc<StdMutex<Option<String>>>,
    handle: JoinHandle<()>,
}

impl TokenSniffer {
    pub async fn attach(
        page: &Page,
        url_markers: &'static [&'static str],
    ) -> anyhow::Result<Self> {
        let mut events = page.event_listener::<EventRequestWillBeSent>().await?;
        let captured: Arc<StdMutex<Option<String>>> = Arc::new(StdMutex::new(None));
        let sink = Arc::clone(&captured);

        let handle = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let url = event.request.url.to_lowercase();
                if !url_markers.iter().any(|m| url.contains(m)) {
                    continue;
                }
                let headers = match serde_json::to_value(&event.request.headers) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                let auth = headers
                    .get("Authorization")
                    .or_else(|| headers.get("authorization"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                if let Some(token) = auth.strip_prefix("Bearer ") {
                    if token.len() > MIN_TOKEN_LEN {
                        let mut slot = sink.lock().expect("sniffer lock poisoned");
                        if slot.is_none() {
                            debug!("sniffer: captured bearer token from {}", event.request.url);
                            *slot = Some(token.to_string());
                        }
                    }
                }
            }
        });

        Ok(Self { captured, handle })
    }

    pub fn peek(&self) -> Option<String> {
        self.captured.lock().expect("sniffer lock poisoned").clone()
    }
}

impl Drop for TokenSniffer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Page-driving JS helpers
// ─────────────────────────────────────────────────────────────────────────────

async fn eval_bool(page: &Page, script: String) -> bool {
    page.evaluate(script)
        .await
        .ok()
        .and_then(|v| v.into_value::<serde_json::Value>().ok())
        .and_then(|j| j.as_bool())
        .unwrap_or(false)
}

async fn eval_string(page: &Page, script: &str) -> Option<String> {
    page.evaluate(script)
        .await
        .ok()
        .and_then(|v| v.into_value::<serde_json::Value>().ok())
        .and_then(|j| j.as_str().map(str::to_string))
        .filter(|s| !s.is_empty())
}

/// Fill the first visible element matching any selector, in priority order.
/// Uses the native value setter plus input/change events so framework-bound
/// inputs (React/Angular) observe the write.
async fn fill_first(page: &Page, selectors: &[&str], value: &str) -> bool {
    let sels = serde_json::to_string(selectors).unwrap_or_else(|_| "[]".into());
    let val = serde_json::to_string(value).unwrap_or_else(|_| "\"\"".into());
    let script = format!(
        r#"(() => {{
  const sels = {sels};
  const val = {val};
  for (const s of sels) {{
    let el;
    try {{ el = document.querySelector(s); }} catch (e) {{ continue; }}
    if (!el || el.offsetParent === null) continue;
    el.focus();
    const proto = el.tagName === 'TEXTAREA'
      ? HTMLTextAreaElement.prototype : HTMLInputElement.prototype;
    const setter = Object.getOwnPropertyDescriptor(proto, 'value').set;
    setter.call(el, val);
    el.dispatchEvent(new Event('input', {{ bubbles: true }}));
    el.dispatchEvent(new Event('change', {{ bubbles: true }}));
    return true;
  }}
  return false;
}})()"#
    );
    eval_bool(page, script).await
}

/// Click the first visible element matching any selector. Entries prefixed
/// `text=` match buttons/links by trimmed text content instead of CSS.
/// Disabled buttons are skipped so a later fallback can win.
async fn click_first(page: &Page, selectors: &[&str]) -> bool {
    let sels = serde_json::to_string(selectors).unwrap_or_else(|_| "[]".into());
    let script = format!(
        r#"(() => {{
  const sels = {sels};
  const visible = el => el && el.offsetParent !== null && !el.disabled;
  for (const s of sels) {{
    let el = null;
    if (s.startsWith('text=')) {{
      const wanted = s.slice(5).toLowerCase();
      for (const cand of document.querySelectorAll('button, a, input[type="submit"]')) {{
        const label = (cand.innerText || cand.value || '').trim().toLowerCase();
        if (label === wanted || label.includes(wanted)) {{ el = cand; break; }}
      }}
    }} else {{
      try {{ el = document.querySelector(s); }} catch (e) {{ continue; }}
    }}
    if (!visible(el)) continue;
    el.click();
    return true;
  }}
  return false;
}})()"#
    );
    eval_bool(page, script).await
}

/// Distribute a code across a row of single-character boxes.
async fn fill_digit_boxes(page: &Page, code: &str) -> bool {
    let val = serde_json::to_string(code).unwrap_or_else(|_| "\"\"".into());
    let script = format!(
        r#"(() => {{
  const code = {val};
  const boxes = [...document.querySelectorAll('input[maxlength="1"]')]
    .filter(el => el.offsetParent !== null && el.type !== 'email' && el.type !== 'password');
  if (boxes.length < 4 || code.length < boxes.length) return false;
  const setter = Object.getOwnPropertyDescriptor(HTMLInputElement.prototype, 'value').set;
  boxes.forEach((el, i) => {{
    el.focus();
    setter.call(el, code[i]);
    el.dispatchEvent(new Event('input', {{ bubbles: true }}));
  }});
  return true;
}})()"#
    );
    eval_bool(page, script).await
}

async fn submit_active_form(page: &Page) -> bool {
    eval_bool(
        page,
        r#"(() => {
  const el = document.activeElement;
  const form = el && el.closest ? el.closest('form') : document.querySelector('form');
  if (!form) return false;
  if (typeof form.requestSubmit === 'function') form.requestSubmit();
  else form.submit();
  return true;
})()"#
            .to_string(),
    )
    .await
}

async fn navigate(page: &Page, url: &str) -> Result<(), AutomationError> {
    tokio::time::timeout(NAVIGATION_TIMEOUT, page.goto(url))
        .await
        .map_err(|_| AutomationError::Timeout(format!("navigation to {}", url)))?
        .map_err(|e| AutomationError::Lookup(format!("navigation to {} failed: {}", url, e)))?;
    Ok(())
}

async fn settle(page: &Page) {
    let _ = manager::wait_until_stable(page, SETTLE_QUIET_MS, SETTLE_TIMEOUT_MS).await;
}

async fn current_url(page: &Page) -> String {
    page.url()
        .await
        .ok()
        .flatten()
        .unwrap_or_default()
        .to_lowercase()
}

/// Pull the first visible error/alert message off a stalled login page.
async fn visible_form_error(page: &Page) -> Option<String> {
    eval_string(
        page,
        r#"(() => {
  const sels = '[role="alert"], .error, .alert, .error-message, .validation-summary-errors';
  for (const el of document.querySelectorAll(sels)) {
    if (el.offsetParent === null) continue;
    const text = el.innerText.trim();
    if (text) return text.slice(0, 200);
  }
  return '';
})()"#,
    )
    .await
}

async fn snapshot(page: &Page) -> PageSnapshot {
    let body_text = eval_string(page, "document.body ? document.body.innerText : ''")
        .await
        .unwrap_or_default();
    let html = page.content().await.unwrap_or_default();
    PageSnapshot::new(body_text, html)
}

// localStorage/sessionStorage token scan: well-known keys first, then any
// JWT-shaped value.
const STORAGE_SCAN_JS: &str = r#"(() => {
  const keys = ['token', 'accessToken', 'access_token', 'jwt', 'bearerToken', 'authToken', 'api_key'];
  for (const key of keys) {
    const t = localStorage.getItem(key) || sessionStorage.getItem(key);
    if (t && t.length > 20) return t;
  }
  for (let i = 0; i < localStorage.length; i++) {
    const val = localStorage.getItem(localStorage.key(i));
    if (val && val.startsWith('eyJ') && val.length > 50) return val;
  }
  return '';
})()"#;

async fn token_from_cookies(page: &Page, cookie_names: &[&str]) -> Option<String> {
    let cookies = page.get_cookies().await.ok()?;
    for cookie in cookies {
        let name = cookie.name.to_lowercase();
        if cookie_names.iter().any(|n| name.contains(n)) && cookie.value.len() > MIN_TOKEN_LEN {
            return Some(percent_decode_str(&cookie.value).decode_utf8_lossy().to_string());
        }
    }
    None
}

// ─────────────────────────────────────────────────────────────────────────────
// Suspended sessions
// ─────────────────────────────────────────────────────────────────────────────

/// A login parked on a verification-code prompt. Owns the browser lease until
/// resumed or reaped.
pub struct SuspendedLogin {
    pub provider: Provider,
    lease: Lease<ChromeWorker>,
    sniffer: TokenSniffer,
}

// ─────────────────────────────────────────────────────────────────────────────
// SessionAutomator
// ─────────────────────────────────────────────────────────────────────────────

pub struct SessionAutomator {
    config: Arc<ServiceConfig>,
    pool: Arc<BrowserPool<ChromeWorkerFactory>>,
    solver: CaptchaSolver,
    codes: CodeChannel,
}

impl SessionAutomator {
    pub fn new(
        config: Arc<ServiceConfig>,
        pool: Arc<BrowserPool<ChromeWorkerFactory>>,
        solver: CaptchaSolver,
        codes: CodeChannel,
    ) -> Self {
        Self {
            config,
            pool,
            solver,
            codes,
        }
    }

    /// Full login state machine for one provider.
    async fn run_login(
        &self,
        provider: Provider,
    ) -> Result<LoginOutcome<SuspendedLogin>, AutomationError> {
        let creds = self
            .config
            .credentials_for(provider)
            .ok_or(AutomationError::MissingCredentials(provider))?
            .clone();
        let prof = profile(provider);

        let lease = self.pool.acquire().await?;
        match self.drive_login(provider, prof, &creds.email, &creds.password, &lease).await {
            Ok(LoginDriveResult::Token { token, expires_at }) => {
                self.pool.release(lease, true).await;
                Ok(LoginOutcome::Token { token, expires_at })
            }
            Ok(LoginDriveResult::NeedsCode { sniffer }) => {
                info!("{}: suspending login for external 2FA code", provider);
                Ok(LoginOutcome::Requires2fa {
                    session: SuspendedLogin {
                        provider,
                        lease,
                        sniffer,
                    },
                })
            }
            Err(e) => {
                // Page state is unknown after a failure; discard the worker.
                self.pool.release(lease, false).await;
                Err(e)
            }
        }
    }

    async fn drive_login(
        &self,
        provider: Provider,
        prof: &'static ProviderProfile,
        email: &str,
        password: &str,
        lease: &Lease<ChromeWorker>,
    ) -> Result<LoginDriveResult, AutomationError> {
        let page = &lease.worker().page;
        let sniffer = TokenSniffer::attach(page, prof.token_url_markers)
            .await
            .map_err(|e| AutomationError::Lookup(format!("sniffer attach failed: {}", e)))?;

        // START → NAVIGATE: try the persisted session first.
        let mut restored = false;
        if let Some(raw) = storage_state::load_raw(&self.config.state_dir, provider) {
            storage_state::inject_into_page(page, &raw).await;
            restored = true;
        }
        navigate(page, prof.landing_url).await?;
        settle(page).await;

        let url = current_url(page).await;
        let authenticated = !prof.unauthenticated_markers.iter().any(|m| url.contains(m));
        if authenticated {
            info!("{}: session restored from storage state ({})", provider, url);
            let token = self.verify(provider, prof, page, &sniffer).await?;
            return Ok(LoginDriveResult::Token {
                token: token.0,
                expires_at: token.1,
            });
        }

        // NAVIGATE → AUTHENTICATE
        if restored {
            // The server session behind the snapshot is dead; drop the file so
            // the next attempt skips straight to a full login.
            storage_state::invalidate(&self.config.state_dir, provider);
        }
        info!("{}: performing full login", provider);
        if url != prof.login_url {
            navigate(page, prof.login_url).await?;
            settle(page).await;
        }
        if !fill_first(page, prof.email_selectors, email).await {
            return Err(AutomationError::Lookup("email field not found".into()));
        }
        // Some SSO flows ask for the email first and reveal the password
        // field after a "Next" click.
        if !fill_first(page, prof.password_selectors, password).await {
            click_first(page, prof.submit_selectors).await;
            settle(page).await;
            if !fill_first(page, prof.password_selectors, password).await {
                return Err(AutomationError::Lookup("password field not found".into()));
            }
        }
        if !click_first(page, prof.submit_selectors).await && !submit_active_form(page).await {
            return Err(AutomationError::Lookup("login submit control not found".into()));
        }
        settle(page).await;
        tokio::time::sleep(Duration::from_secs(2)).await;

        // CHALLENGE_CHECK loop
        let mut captcha_rounds = 0u32;
        loop {
            let snap = snapshot(page).await;
            match challenge::detect(&snap) {
                None => break,
                Some(ChallengeKind::Captcha { site_key }) => {
                    captcha_rounds += 1;
                    if captcha_rounds > MAX_CAPTCHA_ROUNDS {
                        return Err(AutomationError::CaptchaFailed);
                    }
                    self.resolve_captcha(page, site_key).await?;
                    settle(page).await;
                }
                Some(ChallengeKind::VerificationCode) => {
                    // A token captured during the challenge (trusted-device
                    // flows) makes the code moot.
                    if let Some(token) = sniffer.peek() {
                        info!("{}: token captured during 2FA prompt", provider);
                        let expires_at = self.persist_and_expiry(provider, page).await;
                        return Ok(LoginDriveResult::Token { token, expires_at });
                    }

                    click_first(page, prof.send_code_selectors).await;
                    settle(page).await;

                    match self.codes.poll_for_code(CODE_WINDOW).await {
                        Some(code) => {
                            info!("{}: auto-filling 2FA code from SMS", provider);
                            if !submit_code(page, &code).await {
                                return Ok(LoginDriveResult::NeedsCode { sniffer });
                            }
                            settle(page).await;
                            tokio::time::sleep(Duration::from_secs(3)).await;
                            let after = snapshot(page).await;
                            if matches!(
                                challenge::detect(&after),
                                Some(ChallengeKind::VerificationCode)
                            ) {
                                // SMS code rejected; park for manual entry.
                                return Ok(LoginDriveResult::NeedsCode { sniffer });
                            }
                        }
                        None => return Ok(LoginDriveResult::NeedsCode { sniffer }),
                    }
                }
            }
        }

        // VERIFY
        let url = current_url(page).await;
        if prof.unauthenticated_markers.iter().any(|m| url.contains(m)) {
            if let Some(msg) = visible_form_error(page).await {
                warn!("{}: login page shows error: {}", provider, msg);
            }
            return Err(AutomationError::Lookup(format!(
                "still unauthenticated after login (url: {})",
                url
            )));
        }
        let (token, expires_at) = self.verify(provider, prof, page, &sniffer).await?;
        Ok(LoginDriveResult::Token { token, expires_at })
    }

    async fn resolve_captcha(
        &self,
        page: &Page,
        site_key: Option<String>,
    ) -> Result<(), AutomationError> {
        let Some(site_key) = site_key else {
            return Err(AutomationError::Lookup(
                "captcha widget present but no site key found".into(),
            ));
        };
        if !self.solver.is_configured() {
            return Err(AutomationError::CaptchaFailed);
        }
        let url = page
            .url()
            .await
            .ok()
            .flatten()
            .unwrap_or_default();
        let solution = self
            .solver
            .solve(&site_key, &url, self.config.captcha_timeout)
            .await
            .map_err(|e| match e {
                SolveError::Timeout(_) => AutomationError::Timeout("captcha solve".into()),
                other => {
                    warn!("captcha solve failed: {}", other);
                    AutomationError::CaptchaFailed
                }
            })?;
        if !captcha::inject_solution(page, &solution).await {
            return Err(AutomationError::CaptchaFailed);
        }
        Ok(())
    }

    /// Token capture in priority order: sniffed Authorization header →
    /// local/session storage → cookies. Navigates trigger pages when the
    /// login itself fired no authorized calls.
    async fn verify(
        &self,
        provider: Provider,
        prof: &'static ProviderProfile,
        page: &Page,
        sniffer: &TokenSniffer,
    ) -> Result<(String, DateTime<Utc>), AutomationError> {
        let mut token = self.capture_token(prof, page, sniffer).await;

        if token.is_none() {
            for trigger in prof.token_trigger_urls {
                debug!("{}: visiting {} to trigger API calls", provider, trigger);
                if navigate(page, trigger).await.is_ok() {
                    settle(page).await;
                    tokio::time::sleep(Duration::from_secs(3)).await;
                }
                token = self.capture_token(prof, page, sniffer).await;
                if token.is_some() {
                    break;
                }
            }
        }

        let Some(token) = token else {
            let url = current_url(page).await;
            return Err(AutomationError::Lookup(format!(
                "could not capture token (url: {})",
                url
            )));
        };

        let expires_at = self.persist_and_expiry(provider, page).await;
        info!("{}: token captured, expires {}", provider, expires_at);
        Ok((token, expires_at))
    }

    async fn capture_token(
        &self,
        prof: &'static ProviderProfile,
        page: &Page,
        sniffer: &TokenSniffer,
    ) -> Option<String> {
        if let Some(t) = sniffer.peek() {
            return Some(t);
        }
        if let Some(t) = eval_string(page, STORAGE_SCAN_JS).await {
            if t.len() > MIN_TOKEN_LEN {
                return Some(t);
            }
        }
        token_from_cookies(page, prof.token_cookie_names).await
    }

    /// Persist the storage state and compute token expiry: the earliest
    /// persistent cookie expiry when one exists and is sooner than the
    /// conservative default, else the default.
    async fn persist_and_expiry(&self, provider: Provider, page: &Page) -> DateTime<Utc> {
        if let Err(e) = storage_state::save(&self.config.state_dir, provider, page).await {
            warn!("{}: failed to persist storage state: {}", provider, e);
        }
        let default = Utc::now() + chrono::Duration::from_std(DEFAULT_TOKEN_TTL).unwrap_or_default();

        let cookie_expiry = storage_state::load_raw(&self.config.state_dir, provider)
            .as_deref()
            .and_then(storage_state::min_cookie_expiry)
            .and_then(|ts| Utc.timestamp_opt(ts as i64, 0).single())
            .filter(|ts| *ts > Utc::now());

        match cookie_expiry {
            Some(ts) if ts < default => ts,
            _ => default,
        }
    }
}

enum LoginDriveResult {
    Token {
        token: String,
        expires_at: DateTime<Utc>,
    },
    NeedsCode {
        sniffer: TokenSniffer,
    },
}

/// Fill and submit a verification code. Returns false when no code input
/// could be located.
async fn submit_code(page: &Page, code: &str) -> bool {
    let mut filled = fill_first(page, CODE_INPUT_SELECTORS, code).await;
    if !filled {
        filled = fill_digit_boxes(page, code).await;
    }
    if !filled {
        return false;
    }
    if !click_first(page, CODE_SUBMIT_SELECTORS).await {
        submit_active_form(page).await;
    }
    true
}

#[async_trait]
impl LoginAutomator for SessionAutomator {
    type Session = SuspendedLogin;

    async fn login(
        &self,
        provider: Provider,
    ) -> Result<LoginOutcome<SuspendedLogin>, AutomationError> {
        self.run_login(provider).await
    }

    async fn resume(
        &self,
        session: SuspendedLogin,
        code: &str,
    ) -> Result<ResumeOutcome<SuspendedLogin>, AutomationError> {
        let provider = session.provider;
        let prof = profile(provider);
        let page = &session.lease.worker().page;

        if !submit_code(page, code).await {
            // No input to fill is a terminal fault, not a bad code.
            self.discard(session).await;
            return Err(AutomationError::Lookup("2FA code input not found".into()));
        }
        settle(page).await;
        tokio::time::sleep(Duration::from_secs(3)).await;

        let snap = snapshot(page).await;
        if challenge::detect(&snap).is_some() {
            info!("{}: 2FA code was not accepted, session stays pending", provider);
            return Ok(ResumeOutcome::Rejected(session));
        }

        match self.verify(provider, prof, page, &session.sniffer).await {
            Ok((token, expires_at)) => {
                self.pool.release(session.lease, true).await;
                Ok(ResumeOutcome::Token { token, expires_at })
            }
            Err(e) => {
                self.pool.release(session.lease, false).await;
                Err(e)
            }
        }
    }

    async fn discard(&self, session: SuspendedLogin) {
        // Suspended pages are mid-login; never reuse the worker as-is.
        self.pool.release(session.lease, false).await;
    }
}
