//! Per-provider session persistence.
//!
//! After a successful login the worker's cookie jar is snapshotted to
//! `{state_dir}/{provider}_storage_state.json`. On the next refresh the
//! snapshot is injected into a fresh page *before* navigation, so a still-live
//! server session skips the whole credential/CAPTCHA/2FA dance.
//!
//! Snapshots are advisory: a missing, stale, or malformed file just means the
//! automator falls through to a full login.

use std::path::{Path, PathBuf};

use chromiumoxide::cdp::browser_protocol::network::{CookieParam, SetCookiesParams};
use chromiumoxide::Page;
use tracing::{info, warn};

use crate::core::types::Provider;

/// Path of the snapshot file for one provider.
pub fn state_path(state_dir: &Path, provider: Provider) -> PathBuf {
    state_dir.join(format!("{}_storage_state.json", provider.as_str()))
}

/// True when a snapshot file exists for the provider. Used by `/health`.
pub fn exists(state_dir: &Path, provider: Provider) -> bool {
    state_path(state_dir, provider).exists()
}

/// Minimum finite cookie expiry from a raw cookie array.
///
/// CDP cookies carry `expires` as either `-1.0` (session cookie) or a positive
/// Unix timestamp in seconds. Returns `None` when every cookie is
/// session-scoped, so the caller falls back to the conservative default TTL.
pub fn min_cookie_expiry(raw_cookies: &[serde_json::Value]) -> Option<f64> {
    raw_cookies
        .iter()
        .filter_map(|v| v.get("expires").and_then(|e| e.as_f64()))
        .filter(|&exp| exp > 0.0) // -1 = session cookie, skip
        .reduce(f64::min)
}

/// Snapshot the page's current cookie jar to disk.
pub async fn save(state_dir: &Path, provider: Provider, page: &Page) -> anyhow::Result<()> {
    let cookies = page.get_cookies().await?;
    let raw: Vec<serde_json::Value> = cookies
        .iter()
        .filter_map(|c| serde_json::to_value(c).ok())
        .collect();

    std::fs::create_dir_all(state_dir)?;
    let path = state_path(state_dir, provider);
    std::fs::write(&path, serde_json::to_string_pretty(&raw)?)?;
    info!(
        "storage_state: saved {} cookies for {} ({})",
        raw.len(),
        provider,
        path.display()
    );
    Ok(())
}

/// Load the stored snapshot as raw JSON cookie values.
///
/// Returns `None` when no snapshot exists or the file is empty/unreadable.
pub fn load_raw(state_dir: &Path, provider: Provider) -> Option<Vec<serde_json::Value>> {
    let path = state_path(state_dir, provider);
    if !path.exists() {
        return None;
    }
    let content = std::fs::read_to_string(&path).ok()?;
    let cookies: Vec<serde_json::Value> = serde_json::from_str(&content).ok()?;
    if cookies.is_empty() {
        return None;
    }
    info!(
        "storage_state: loaded {} cookies for {} ({})",
        cookies.len(),
        provider,
        path.display()
    );
    Some(cookies)
}

/// Inject stored cookies into a live CDP page **before** navigation.
///
/// Individual cookies that fail to deserialize are skipped so a
/// partially-malformed snapshot never blocks a login attempt.
pub async fn inject_into_page(page: &Page, raw_cookies: &[serde_json::Value]) {
    let cookie_params: Vec<CookieParam> = raw_cookies
        .iter()
        .filter_map(|v| serde_json::from_value::<CookieParam>(v.clone()).ok())
        .collect();

    if cookie_params.is_empty() {
        warn!("storage_state: snapshot contained no valid CookieParams — skipping injection");
        return;
    }

    let count = cookie_params.len();
    match page.execute(SetCookiesParams::new(cookie_params)).await {
        Ok(_) => info!("storage_state: injected {} cookies into CDP page", count),
        Err(e) => warn!("storage_state: failed to inject cookies: {}", e),
    }
}

/// Remove the snapshot so the next refresh performs a full login.
pub fn invalidate(state_dir: &Path, provider: Provider) {
    let path = state_path(state_dir, provider);
    if path.exists() {
        match std::fs::remove_file(&path) {
            Ok(()) => info!(
                "storage_state: removed stale snapshot for {} ({})",
                provider,
                path.display()
            ),
            Err(e) => warn!(
                "storage_state: failed to remove snapshot {}: {}",
                path.display(),
                e
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn min_expiry_skips_session_cookies() {
        let cookies = vec![
            json!({"name": "sid", "value": "a", "expires": -1.0}),
            json!({"name": "auth", "value": "b", "expires": 1_900_000_000.0}),
            json!({"name": "remember", "value": "c", "expires": 1_850_000_000.0}),
        ];
        assert_eq!(min_cookie_expiry(&cookies), Some(1_850_000_000.0));
    }

    #[test]
    fn min_expiry_all_session_scoped_is_none() {
        let cookies = vec![
            json!({"name": "sid", "value": "a", "expires": -1.0}),
            json!({"name": "csrf", "value": "b", "expires": -1.0}),
        ];
        assert!(min_cookie_expiry(&cookies).is_none());
        assert!(min_cookie_expiry(&[]).is_none());
    }

    #[test]
    fn save_load_invalidate_roundtrip_on_disk() {
        let dir = std::env::temp_dir().join(format!("portal-sentry-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();

        assert!(!exists(&dir, Provider::Mmi));
        assert!(load_raw(&dir, Provider::Mmi).is_none());

        let raw = vec![json!({"name": "auth", "value": "tok", "expires": 1_900_000_000.0})];
        std::fs::write(
            state_path(&dir, Provider::Mmi),
            serde_json::to_string(&raw).unwrap(),
        )
        .unwrap();

        assert!(exists(&dir, Provider::Mmi));
        let loaded = load_raw(&dir, Provider::Mmi).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0]["name"], "auth");

        // An empty array reads back as "no snapshot".
        std::fs::write(state_path(&dir, Provider::Rpr), "[]").unwrap();
        assert!(load_raw(&dir, Provider::Rpr).is_none());

        invalidate(&dir, Provider::Mmi);
        assert!(!exists(&dir, Provider::Mmi));

        std::fs::remove_dir_all(&dir).ok();
    }
}
