//! MyCoverageInfo payment-status check workflow.
//!
//! One check = one pooled browser: navigate to the agent lookup form, fill
//! loan/ZIP/last-name, clear any CAPTCHA, submit, wait for the policy-info
//! results page (or the portal's own "not found" message), dismiss the
//! interstitial modal, and run the field grammar over the visible text.
//! A PNG of the results page is written to disk as the audit artifact.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use tracing::{info, warn};

use crate::browser::manager;
use crate::browser::pool::{BrowserPool, ChromeWorkerFactory, PoolError};
use crate::core::config::ServiceConfig;
use crate::core::types::{ErrorCode, PaymentCheckRequest, PaymentCheckResponse};
use crate::scrape::extractor;
use crate::session::captcha::{self, CaptchaSolver, SolveError};
use crate::session::challenge;

const MCI_URL: &str = "https://www.mycoverageinfo.com/agent";
const RESULTS_URL_MARKER: &str = "/policy-manager/policy-info";
const RESULTS_WAIT: Duration = Duration::from_secs(15);
const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(30);

pub struct PaymentChecker {
    config: Arc<ServiceConfig>,
    pool: Arc<BrowserPool<ChromeWorkerFactory>>,
    solver: CaptchaSolver,
}

impl PaymentChecker {
    pub fn new(
        config: Arc<ServiceConfig>,
        pool: Arc<BrowserPool<ChromeWorkerFactory>>,
        solver: CaptchaSolver,
    ) -> Self {
        Self {
            config,
            pool,
            solver,
        }
    }

    pub async fn check(&self, request: &PaymentCheckRequest) -> PaymentCheckResponse {
        let started = Instant::now();

        let lease = match self.pool.acquire().await {
            Ok(lease) => lease,
            Err(e @ PoolError::Exhausted(_)) | Err(e @ PoolError::Closed) => {
                let mut resp = PaymentCheckResponse::failure(
                    ErrorCode::NoBrowser,
                    "No browser instance available",
                );
                warn!("payment check refused: {}", e);
                resp.duration_ms = started.elapsed().as_millis() as u64;
                return resp;
            }
            Err(e) => {
                let mut resp =
                    PaymentCheckResponse::failure(ErrorCode::NoBrowser, e.to_string());
                resp.duration_ms = started.elapsed().as_millis() as u64;
                return resp;
            }
        };

        let page = &lease.worker().page;
        let (mut response, healthy) = match self.drive_check(page, request).await {
            Ok(resp) => (resp, true),
            Err(resp) => (resp, false),
        };
        response.duration_ms = started.elapsed().as_millis() as u64;
        self.pool.release(lease, healthy).await;
        response
    }

    /// The whole lookup flow. `Err` carries the failure response and signals
    /// that the worker should be discarded.
    async fn drive_check(
        &self,
        page: &Page,
        request: &PaymentCheckRequest,
    ) -> Result<PaymentCheckResponse, PaymentCheckResponse> {
        info!(
            "payment check: loan {}**** zip {}",
            &request.loan_number.chars().take(4).collect::<String>(),
            request.zip_code
        );

        self.navigate(page, MCI_URL).await?;
        let _ = manager::wait_until_stable(page, 1_500, 10_000).await;

        self.fill_form(page, request).await?;

        // CAPTCHA gate
        let html = page.content().await.unwrap_or_default();
        let snap = challenge::PageSnapshot::new(String::new(), html);
        if let Some(challenge::ChallengeKind::Captcha { site_key }) = challenge::detect(&snap) {
            info!("payment check: captcha detected, solving");
            self.solve_captcha(page, site_key).await?;
        }

        self.submit(page).await;

        // Wait for the results URL, or recognize the portal's own miss page.
        if !self.wait_for_results(page).await {
            let body = body_text(page).await.to_lowercase();
            if body.contains("not found") || body.contains("no results") {
                return Err(PaymentCheckResponse::failure(
                    ErrorCode::NotFound,
                    "Policy not found on MyCoverageInfo",
                ));
            }
            return Err(PaymentCheckResponse::failure(
                ErrorCode::Timeout,
                "Timeout waiting for results page",
            ));
        }

        self.dismiss_modal(page).await;

        let text = body_text(page).await;
        if text.is_empty() {
            return Err(PaymentCheckResponse::failure(
                ErrorCode::ExtractionError,
                "Results page rendered no text",
            ));
        }
        let record = extractor::extract(&text);

        let screenshot_path = self.capture_screenshot(page, &request.loan_number).await;

        Ok(PaymentCheckResponse {
            success: true,
            payment_status: Some(record.payment_status),
            policy_number: record.policy_number,
            policy_status: record.policy_status,
            carrier: record.carrier,
            homeowner: record.homeowner,
            property_address: record.property_address,
            loan_number: record.loan_number,
            effective_date: record.effective_date,
            expiration_date: record.expiration_date,
            cancellation_date: record.cancellation_date,
            last_payment_date: record.last_payment_date,
            premium: record.premium,
            coverage_amount: record.coverage_amount,
            deductible: record.deductible,
            last_payment_amount: record.last_payment_amount,
            mortgagee_clause: record.mortgagee_clause,
            screenshot_path,
            error_code: None,
            error_message: None,
            duration_ms: 0,
        })
    }

    async fn navigate(&self, page: &Page, url: &str) -> Result<(), PaymentCheckResponse> {
        match tokio::time::timeout(NAVIGATION_TIMEOUT, page.goto(url)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(PaymentCheckResponse::failure(
                ErrorCode::LookupError,
                format!("Navigation failed: {}", e),
            )),
            Err(_) => Err(PaymentCheckResponse::failure(
                ErrorCode::Timeout,
                "Page load timeout",
            )),
        }
    }

    async fn fill_form(
        &self,
        page: &Page,
        request: &PaymentCheckRequest,
    ) -> Result<(), PaymentCheckResponse> {
        let loan = serde_json::to_string(&request.loan_number).unwrap_or_default();
        let zip = serde_json::to_string(&request.zip_code).unwrap_or_default();
        let last_name =
            serde_json::to_string(request.last_name.as_deref().unwrap_or("")).unwrap_or_default();

        let script = format!(
            r#"(() => {{
  const fill = (id, val) => {{
    const el = document.getElementById(id);
    if (!el) return false;
    const setter = Object.getOwnPropertyDescriptor(HTMLInputElement.prototype, 'value').set;
    el.focus();
    setter.call(el, val);
    el.dispatchEvent(new Event('input', {{ bubbles: true }}));
    el.dispatchEvent(new Event('change', {{ bubbles: true }}));
    return true;
  }};
  const ok = fill('loanInput', {loan}) && fill('zipInput', {zip});
  const ln = {last_name};
  if (ln) fill('lastNameInput', ln);
  return ok;
}})()"#
        );

        let filled = page
            .evaluate(script)
            .await
            .ok()
            .and_then(|v| v.into_value::<serde_json::Value>().ok())
            .and_then(|j| j.as_bool())
            .unwrap_or(false);

        if filled {
            Ok(())
        } else {
            Err(PaymentCheckResponse::failure(
                ErrorCode::LookupError,
                "Search form inputs not found",
            ))
        }
    }

    async fn solve_captcha(
        &self,
        page: &Page,
        site_key: Option<String>,
    ) -> Result<(), PaymentCheckResponse> {
        let Some(site_key) = site_key else {
            return Err(PaymentCheckResponse::failure(
                ErrorCode::CaptchaFailed,
                "Could not find reCAPTCHA site key",
            ));
        };
        if !self.solver.is_configured() {
            return Err(PaymentCheckResponse::failure(
                ErrorCode::CaptchaFailed,
                "CAPTCHA present but no solver configured",
            ));
        }
        let url = page.url().await.ok().flatten().unwrap_or_default();
        let solution = self
            .solver
            .solve(&site_key, &url, self.config.captcha_timeout)
            .await
            .map_err(|e| match e {
                SolveError::Timeout(_) => PaymentCheckResponse::failure(
                    ErrorCode::Timeout,
                    "CAPTCHA solve timed out",
                ),
                other => PaymentCheckResponse::failure(ErrorCode::CaptchaFailed, other.to_string()),
            })?;
        if !captcha::inject_solution(page, &solution).await {
            return Err(PaymentCheckResponse::failure(
                ErrorCode::CaptchaFailed,
                "Failed to inject CAPTCHA solution",
            ));
        }
        Ok(())
    }

    async fn submit(&self, page: &Page) {
        let script = r#"(() => {
  const byText = [...document.querySelectorAll('button')]
    .find(b => b.innerText.trim().toLowerCase() === 'search');
  const btn = byText || document.querySelector('button[type="submit"]');
  if (btn) { btn.click(); return true; }
  const form = document.querySelector('form');
  if (form) { form.submit(); return true; }
  return false;
})()"#;
        let _ = page.evaluate(script).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    async fn wait_for_results(&self, page: &Page) -> bool {
        let deadline = Instant::now() + RESULTS_WAIT;
        while Instant::now() < deadline {
            if let Ok(Some(url)) = page.url().await {
                if url.contains(RESULTS_URL_MARKER) {
                    let _ = manager::wait_until_stable(page, 1_000, 8_000).await;
                    return true;
                }
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        false
    }

    /// Dismiss the "Important Message" interstitial when it appears.
    async fn dismiss_modal(&self, page: &Page) {
        let script = r#"(() => {
  const btn = [...document.querySelectorAll('button')]
    .find(b => b.innerText.trim() === 'Continue' && b.offsetParent !== null);
  if (!btn) return false;
  btn.click();
  return true;
})()"#;
        let dismissed = page
            .evaluate(script)
            .await
            .ok()
            .and_then(|v| v.into_value::<serde_json::Value>().ok())
            .and_then(|j| j.as_bool())
            .unwrap_or(false);
        if dismissed {
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }

    async fn capture_screenshot(&self, page: &Page, loan_number: &str) -> Option<String> {
        let bytes = match page
            .screenshot(
                ScreenshotParams::builder()
                    .format(CaptureScreenshotFormat::Png)
                    .build(),
            )
            .await
        {
            Ok(b) => b,
            Err(e) => {
                warn!("payment check: screenshot capture failed: {}", e);
                return None;
            }
        };

        let dir = self.config.screenshots_dir();
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!("payment check: cannot create screenshot dir: {}", e);
            return None;
        }
        let slug: String = loan_number
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .take(12)
            .collect();
        let path = dir.join(format!(
            "mci_{}_{}.png",
            slug,
            chrono::Utc::now().timestamp_millis()
        ));
        match std::fs::write(&path, &bytes) {
            Ok(()) => Some(path.to_string_lossy().to_string()),
            Err(e) => {
                warn!("payment check: failed to write screenshot: {}", e);
                None
            }
        }
    }
}

async fn body_text(page: &Page) -> String {
    page.evaluate("document.body ? document.body.innerText : ''")
        .await
        .ok()
        .and_then(|v| v.into_value::<String>().ok())
        .unwrap_or_default()
}
