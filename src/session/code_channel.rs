//! SMS verification-code retrieval via the Twilio Messages API.
//!
//! When a login stalls on a one-time-code prompt the automator polls the
//! account's inbound message log for a fresh 4–8 digit code sent to the known
//! 2FA number. Bounded polling: if no code lands within the window, control
//! falls back to the manual-entry path instead of failing the login outright.

use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::core::config::TwilioConfig;

const POLL_ATTEMPTS: u32 = 6;
const POLL_DELAY: Duration = Duration::from_secs(5);

static CODE_RE: OnceLock<Regex> = OnceLock::new();

fn code_re() -> &'static Regex {
    CODE_RE.get_or_init(|| Regex::new(r"\b(\d{4,8})\b").expect("valid code regex"))
}

#[derive(Debug, Deserialize)]
struct MessagePage {
    #[serde(default)]
    messages: Vec<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    #[serde(default)]
    body: String,
    date_sent: Option<String>,
}

/// Pull a 4–8 digit code out of one message body.
fn extract_code(body: &str) -> Option<String> {
    code_re().captures(body).map(|c| c[1].to_string())
}

fn parse_twilio_date(raw: &str) -> Option<DateTime<Utc>> {
    // Twilio uses RFC 2822 ("Mon, 16 Aug 2021 20:30:10 +0000").
    DateTime::parse_from_rfc2822(raw)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// Polls Twilio for recently received verification codes.
pub struct CodeChannel {
    client: reqwest::Client,
    config: TwilioConfig,
}

impl CodeChannel {
    pub fn new(client: reqwest::Client, config: TwilioConfig) -> Self {
        Self { client, config }
    }

    pub fn is_configured(&self) -> bool {
        self.config.is_configured()
    }

    /// One fetch of the message log: newest message within `window` that
    /// carries a plausible code wins.
    pub async fn fetch_latest_code(&self, window: Duration) -> Option<String> {
        if !self.is_configured() {
            return None;
        }

        let url = format!(
            "https://api.twilio.com/2010-04-01/Accounts/{}/Messages.json",
            self.config.account_sid
        );
        let cutoff = Utc::now() - chrono::Duration::from_std(window).unwrap_or_default();

        let resp = self
            .client
            .get(&url)
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .query(&[("To", self.config.to_number.as_str()), ("PageSize", "20")])
            .send()
            .await;

        let page: MessagePage = match resp {
            Ok(r) if r.status().is_success() => match r.json().await {
                Ok(p) => p,
                Err(e) => {
                    warn!("code_channel: failed to parse Twilio response: {}", e);
                    return None;
                }
            },
            Ok(r) => {
                warn!("code_channel: Twilio returned {}", r.status());
                return None;
            }
            Err(e) => {
                warn!("code_channel: Twilio request failed: {}", e);
                return None;
            }
        };

        // The API returns newest-first; take the first in-window match.
        for msg in &page.messages {
            let sent = msg.date_sent.as_deref().and_then(parse_twilio_date);
            match sent {
                Some(ts) if ts < cutoff => continue,
                _ => {}
            }
            if let Some(code) = extract_code(&msg.body) {
                info!("code_channel: found verification code in SMS");
                return Some(code);
            }
        }
        None
    }

    /// Bounded polling loop: up to 6 attempts, 5 s apart. The window widens
    /// with each wait so a code that arrives mid-poll is still in range.
    pub async fn poll_for_code(&self, window: Duration) -> Option<String> {
        if !self.is_configured() {
            debug!("code_channel: not configured, skipping SMS polling");
            return None;
        }
        for attempt in 1..=POLL_ATTEMPTS {
            if let Some(code) = self.fetch_latest_code(window).await {
                return Some(code);
            }
            debug!(
                "code_channel: no code yet (attempt {}/{})",
                attempt, POLL_ATTEMPTS
            );
            tokio::time::sleep(POLL_DELAY).await;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_four_to_eight_digit_codes() {
        assert_eq!(
            extract_code("Your verification code is 482913"),
            Some("482913".to_string())
        );
        assert_eq!(extract_code("Use code 1234 to sign in"), Some("1234".to_string()));
        assert_eq!(extract_code("Call us at 555"), None);
        // 9+ digits is a phone number, not a code.
        assert_eq!(extract_code("ref 123456789"), None);
    }

    #[test]
    fn parses_twilio_rfc2822_dates() {
        let ts = parse_twilio_date("Mon, 16 Aug 2021 20:30:10 +0000").unwrap();
        assert_eq!(ts.timestamp(), 1_629_145_810);
        assert!(parse_twilio_date("2021-08-16").is_none());
    }

    #[tokio::test]
    async fn unconfigured_channel_returns_none_without_network() {
        let channel = CodeChannel::new(reqwest::Client::new(), TwilioConfig::default());
        assert_eq!(channel.fetch_latest_code(Duration::from_secs(300)).await, None);
        assert_eq!(channel.poll_for_code(Duration::from_secs(300)).await, None);
    }
}
