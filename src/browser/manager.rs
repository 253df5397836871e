//! Chromium process management using `chromiumoxide`.
//!
//! Single source of truth for:
//! * Finding a usable browser executable (Chrome → Chromium → Brave, cross-platform).
//! * Building a hardened headless `BrowserConfig` for pool workers.
//! * Launching a worker browser with its CDP event loop.
//! * `wait_until_stable` — a networkidle heuristic for SPA login pages.
//!
//! Stealth model: process-level defaults only (user-agent rotation, launch
//! flags). Target portals fingerprint automation aggressively, so the
//! `AutomationControlled` blink feature is always suppressed.

use anyhow::{anyhow, Result};
use chromiumoxide::browser::BrowserConfig;
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::{Browser, Page};
use futures::StreamExt;
use rand::seq::IndexedRandom;
use std::path::Path;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const DESKTOP_USER_AGENTS: &[&str] = &[
    // Chrome 132 – Windows
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36",
    // Chrome 132 – macOS
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36",
    // Chrome 131 – Linux
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    // Edge 132 – Windows
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36 Edg/132.0.0.0",
];

/// Returns a randomly-chosen realistic desktop User-Agent string.
pub fn random_user_agent() -> &'static str {
    let mut rng = rand::rng();
    DESKTOP_USER_AGENTS
        .choose(&mut rng)
        .copied()
        .unwrap_or(DESKTOP_USER_AGENTS[0])
}

/// Find a usable Chromium-family browser executable.
///
/// Resolution order:
/// 1. Explicit override passed in (from `CHROME_EXECUTABLE`)
/// 2. PATH scan – finds package-manager installs on all platforms.
/// 3. OS-specific well-known install paths.
pub fn find_chrome_executable(override_path: Option<&str>) -> Option<String> {
    if let Some(p) = override_path {
        if Path::new(p).exists() {
            return Some(p.to_string());
        }
    }

    if let Ok(path_var) = std::env::var("PATH") {
        let candidates = [
            "google-chrome",
            "chromium",
            "chromium-browser",
            "chrome",
            "brave-browser",
        ];
        for dir in std::env::split_paths(&path_var) {
            for exe in candidates {
                let full = dir.join(exe);
                if full.exists() {
                    return Some(full.to_string_lossy().to_string());
                }
            }
        }
    }

    #[cfg(target_os = "macos")]
    {
        let candidates = [
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
            "/Applications/Brave Browser.app/Contents/MacOS/Brave Browser",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    #[cfg(target_os = "linux")]
    {
        let candidates = [
            "/usr/bin/google-chrome",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/usr/local/bin/chromium",
            "/usr/bin/brave-browser",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    #[cfg(target_os = "windows")]
    {
        let candidates = [
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Microsoft\Edge\Application\msedge.exe",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    None
}

/// Build a `BrowserConfig` for one pool worker.
///
/// Flags chosen for:
/// * Compatibility with CI / container environments (`--no-sandbox`,
///   `--disable-dev-shm-usage`).
/// * Stealth — `--disable-blink-features=AutomationControlled` hides the
///   `navigator.webdriver` flag; UA drawn from `DESKTOP_USER_AGENTS`.
pub fn build_worker_config(exe: &str, headless: bool) -> Result<BrowserConfig> {
    let ua = random_user_agent();

    let mut builder = BrowserConfig::builder()
        .chrome_executable(exe)
        .viewport(Viewport {
            width: 1920,
            height: 1080,
            device_scale_factor: Some(1.0),
            emulating_mobile: false,
            is_landscape: true,
            has_touch: false,
        })
        .window_size(1920, 1080)
        .arg("--disable-gpu")
        .arg("--no-sandbox")
        .arg("--disable-setuid-sandbox")
        .arg("--disable-dev-shm-usage")
        .arg("--disable-extensions")
        .arg("--disable-background-networking")
        .arg("--disable-sync")
        .arg("--disable-translate")
        .arg("--disable-infobars")
        .arg("--disable-notifications")
        .arg("--no-first-run")
        .arg("--no-default-browser-check")
        .arg("--hide-scrollbars")
        .arg("--mute-audio")
        // Stealth: suppress CDP automation fingerprint
        .arg("--disable-blink-features=AutomationControlled")
        .arg(format!("--user-agent={}", ua));

    if !headless {
        builder = builder.with_head();
    }

    builder
        .build()
        .map_err(|e| anyhow!("Failed to build browser config: {}", e))
}

/// Launch a worker browser and spawn its CDP event loop.
///
/// The returned handle must be aborted (or the browser closed) when the
/// worker is discarded, or the handler task leaks.
pub async fn launch_worker(exe: &str, headless: bool) -> Result<(Browser, JoinHandle<()>)> {
    let config = build_worker_config(exe, headless)?;
    let (browser, mut handler) = Browser::launch(config)
        .await
        .map_err(|e| anyhow!("Failed to launch browser ({}): {}", exe, e))?;

    let handle = tokio::spawn(async move {
        while let Some(event) = handler.next().await {
            if let Err(e) = event {
                warn!("CDP handler error: {}", e);
            }
        }
    });

    Ok((browser, handle))
}

/// Wait until the page network goes idle (no new resource entries for
/// `quiet_ms` consecutive ms) or until `timeout_ms` has elapsed.
///
/// Polls `performance.getEntriesByType("resource").length` every 250 ms —
/// a Playwright-style networkidle heuristic that works without CDP Network
/// events. Sites with long-polling requests never reach true idle, which is
/// why this caps at `timeout_ms` instead of failing.
pub async fn wait_until_stable(page: &Page, quiet_ms: u64, timeout_ms: u64) -> Result<()> {
    let poll_ms = 250u64;
    let start = std::time::Instant::now();
    let mut last_count: u64 = 0;
    let mut stable_since = std::time::Instant::now();

    loop {
        if start.elapsed().as_millis() as u64 >= timeout_ms {
            info!("wait_until_stable: timeout after {}ms", timeout_ms);
            break;
        }

        let count: u64 = page
            .evaluate("performance.getEntriesByType('resource').length")
            .await
            .ok()
            .and_then(|v| v.into_value::<serde_json::Value>().ok())
            .and_then(|j| j.as_u64())
            .unwrap_or(0);

        let ready_complete: bool = page
            .evaluate("document.readyState")
            .await
            .ok()
            .and_then(|v| v.into_value::<serde_json::Value>().ok())
            .and_then(|j| j.as_str().map(|s| s == "complete"))
            .unwrap_or(false);

        if !ready_complete {
            stable_since = std::time::Instant::now();
            last_count = count;
        } else if count != last_count {
            last_count = count;
            stable_since = std::time::Instant::now();
        } else if stable_since.elapsed().as_millis() as u64 >= quiet_ms {
            break;
        }

        tokio::time::sleep(Duration::from_millis(poll_ms)).await;
    }
    Ok(())
}
