//! CAPTCHA solving via the 2Captcha HTTP API, plus solution injection.
//!
//! Solving is slow (commonly 10–90 s), so the whole round trip runs over
//! plain awaited reqwest calls — the browser-driving task just awaits it.
//! Injection tries multiple hook patterns in order because different frontend
//! frameworks wire the widget differently; the caller treats the whole
//! operation as one atomic attempt with a boolean outcome.

use std::time::Duration;

use chromiumoxide::Page;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

const SUBMIT_URL: &str = "http://2captcha.com/in.php";
const RESULT_URL: &str = "http://2captcha.com/res.php";
const POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SolveError {
    #[error("captcha solve timed out after {0:?}")]
    Timeout(Duration),
    #[error("captcha service rejected the task: {0}")]
    Rejected(String),
    #[error("captcha service transport error: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Deserialize)]
struct TwoCaptchaResponse {
    status: i32,
    request: String,
}

/// Thin client over the 2Captcha submit/poll protocol.
pub struct CaptchaSolver {
    client: reqwest::Client,
    api_key: String,
}

impl CaptchaSolver {
    pub fn new(client: reqwest::Client, api_key: String) -> Self {
        Self { client, api_key }
    }

    pub fn is_configured(&self) -> bool {
        !self.api_key.is_empty()
    }

    /// Solve a reCAPTCHA v2 challenge. Submits the task, then polls every 5 s
    /// until a solution arrives or `timeout` elapses.
    pub async fn solve(
        &self,
        site_key: &str,
        page_url: &str,
        timeout: Duration,
    ) -> Result<String, SolveError> {
        let task_id = self.submit(site_key, page_url).await?;
        info!("captcha: task {} submitted, polling for solution", task_id);

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            tokio::time::sleep(POLL_INTERVAL).await;
            if tokio::time::Instant::now() >= deadline {
                return Err(SolveError::Timeout(timeout));
            }
            match self.poll(&task_id).await? {
                Some(solution) => {
                    info!("captcha: task {} solved", task_id);
                    return Ok(solution);
                }
                None => debug!("captcha: task {} not ready yet", task_id),
            }
        }
    }

    async fn submit(&self, site_key: &str, page_url: &str) -> Result<String, SolveError> {
        let form = [
            ("key", self.api_key.as_str()),
            ("method", "userrecaptcha"),
            ("googlekey", site_key),
            ("pageurl", page_url),
            ("json", "1"),
        ];
        let resp: TwoCaptchaResponse = self
            .client
            .post(SUBMIT_URL)
            .form(&form)
            .send()
            .await?
            .json()
            .await?;

        if resp.status != 1 {
            return Err(SolveError::Rejected(resp.request));
        }
        Ok(resp.request)
    }

    /// One poll of `res.php`. `Ok(None)` means "not ready yet".
    async fn poll(&self, task_id: &str) -> Result<Option<String>, SolveError> {
        let resp: TwoCaptchaResponse = self
            .client
            .get(RESULT_URL)
            .query(&[
                ("key", self.api_key.as_str()),
                ("action", "get"),
                ("id", task_id),
                ("json", "1"),
            ])
            .send()
            .await?
            .json()
            .await?;

        if resp.status == 1 {
            return Ok(Some(resp.request));
        }
        if resp.request == "CAPCHA_NOT_READY" {
            return Ok(None);
        }
        Err(SolveError::Rejected(resp.request))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Injection
// ─────────────────────────────────────────────────────────────────────────────

/// Build the ordered injection scripts for a solution token.
///
/// 1. Write the token into every `g-recaptcha-response` textarea and make it
///    visible to the page's own validation.
/// 2. Fire the widget's registered callback via `___grecaptcha_cfg` so SPA
///    frameworks notice the solve.
/// 3. Re-submit the enclosing form for classic server-rendered pages.
fn injection_scripts(solution: &str) -> [String; 3] {
    // JSON-encode so the token is always a safe JS string literal.
    let tok = serde_json::to_string(solution).unwrap_or_else(|_| "\"\"".to_string());
    [
        format!(
            r#"(() => {{
  const areas = document.querySelectorAll('textarea[name="g-recaptcha-response"], #g-recaptcha-response');
  if (!areas.length) return false;
  for (const a of areas) {{
    a.style.display = 'block';
    a.value = {tok};
    a.dispatchEvent(new Event('input', {{ bubbles: true }}));
    a.dispatchEvent(new Event('change', {{ bubbles: true }}));
  }}
  return true;
}})()"#
        ),
        format!(
            r#"(() => {{
  const cfg = window.___grecaptcha_cfg;
  if (!cfg || !cfg.clients) return false;
  let fired = false;
  const walk = (obj, depth) => {{
    if (!obj || depth > 4) return;
    for (const k of Object.keys(obj)) {{
      const v = obj[k];
      if (typeof v === 'function' && k === 'callback') {{
        try {{ v({tok}); fired = true; }} catch (e) {{}}
      }} else if (v && typeof v === 'object') {{
        walk(v, depth + 1);
      }}
    }}
  }};
  for (const id of Object.keys(cfg.clients)) walk(cfg.clients[id], 0);
  return fired;
}})()"#
        ),
        r#"(() => {
  const area = document.querySelector('textarea[name="g-recaptcha-response"]');
  const form = area ? area.closest('form') : document.querySelector('form');
  if (!form) return false;
  if (typeof form.requestSubmit === 'function') form.requestSubmit();
  else form.submit();
  return true;
})()"#
            .to_string(),
    ]
}

/// Inject a solved token into the page, trying each hook pattern in order.
/// Returns `true` as soon as any strategy reports success.
pub async fn inject_solution(page: &Page, solution: &str) -> bool {
    for (i, script) in injection_scripts(solution).iter().enumerate() {
        let ok = page
            .evaluate(script.as_str())
            .await
            .ok()
            .and_then(|v| v.into_value::<serde_json::Value>().ok())
            .and_then(|j| j.as_bool())
            .unwrap_or(false);
        if ok {
            info!("captcha: injection strategy {} succeeded", i + 1);
            return true;
        }
        debug!("captcha: injection strategy {} did not apply", i + 1);
    }
    warn!("captcha: all injection strategies failed");
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injection_scripts_embed_token_as_string_literal() {
        let scripts = injection_scripts(r#"03AGdBq"quoted\token"#);
        // The token must appear JSON-escaped, never raw.
        assert!(scripts[0].contains(r#""03AGdBq\"quoted\\token""#));
        assert!(scripts[1].contains(r#""03AGdBq\"quoted\\token""#));
    }

    #[test]
    fn strategies_are_ordered_dom_then_callback_then_submit() {
        let scripts = injection_scripts("tok");
        assert!(scripts[0].contains("g-recaptcha-response"));
        assert!(scripts[1].contains("___grecaptcha_cfg"));
        assert!(scripts[2].contains("requestSubmit"));
    }
}
