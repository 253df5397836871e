use std::path::PathBuf;
use std::time::Duration;

use crate::core::types::Provider;

// ---------------------------------------------------------------------------
// ServiceConfig — env-var driven configuration, resolved once at startup
// ---------------------------------------------------------------------------

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => !matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "0" | "false" | "no" | "off"
        ),
        Err(_) => default,
    }
}

/// Login credentials for one provider.
#[derive(Clone)]
pub struct PortalCredentials {
    pub email: String,
    pub password: String,
}

impl std::fmt::Debug for PortalCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never log the password.
        f.debug_struct("PortalCredentials")
            .field("email", &self.email)
            .finish_non_exhaustive()
    }
}

/// Twilio Messages API config for the SMS code channel.
#[derive(Debug, Clone, Default)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: String,
    pub to_number: String,
}

impl TwilioConfig {
    pub fn is_configured(&self) -> bool {
        !self.account_sid.is_empty() && !self.auth_token.is_empty() && !self.to_number.is_empty()
    }
}

/// Microsoft Graph (Outlook) config for failure alert emails.
#[derive(Debug, Clone, Default)]
pub struct OutlookConfig {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    pub sender_email: String,
}

impl OutlookConfig {
    pub fn is_configured(&self) -> bool {
        !self.tenant_id.is_empty()
            && !self.client_id.is_empty()
            && !self.client_secret.is_empty()
            && !self.sender_email.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub port: u16,
    /// Shared secret expected in the `Authorization: Bearer …` header.
    pub service_secret: String,

    pub pool_size: usize,
    pub headless: bool,
    pub chrome_executable: Option<String>,

    /// Directory holding per-provider storage-state snapshots and screenshots.
    pub state_dir: PathBuf,

    pub refresh_buffer: Duration,
    pub proactive_interval: Duration,
    pub pool_acquire_timeout: Duration,
    pub captcha_timeout: Duration,
    pub pending_session_ttl: Duration,

    pub two_captcha_api_key: String,
    pub twilio: TwilioConfig,
    pub outlook: OutlookConfig,

    mmi: Option<PortalCredentials>,
    rpr: Option<PortalCredentials>,
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        let state_dir = env_string("BROWSER_STATE_DIR")
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|h| h.join(".portal-sentry").join("browser_state")))
            .unwrap_or_else(|| PathBuf::from("browser_state"));

        let creds = |email_key: &str, password_key: &str| -> Option<PortalCredentials> {
            Some(PortalCredentials {
                email: env_string(email_key)?,
                password: env_string(password_key)?,
            })
        };

        Self {
            port: env_u64("TOKEN_SERVICE_PORT", 8899) as u16,
            service_secret: env_string("TOKEN_SERVICE_SECRET")
                .unwrap_or_else(|| "change-me-in-production".to_string()),
            pool_size: env_u64("BROWSER_POOL_SIZE", 3) as usize,
            headless: env_bool("BROWSER_HEADLESS", true),
            chrome_executable: env_string("CHROME_EXECUTABLE"),
            state_dir,
            refresh_buffer: Duration::from_secs(env_u64("REFRESH_BUFFER_SECONDS", 600)),
            proactive_interval: Duration::from_secs(env_u64("PROACTIVE_CHECK_INTERVAL", 300)),
            pool_acquire_timeout: Duration::from_secs(env_u64("POOL_ACQUIRE_TIMEOUT_SECONDS", 30)),
            captcha_timeout: Duration::from_secs(env_u64("CAPTCHA_TIMEOUT_SECONDS", 120)),
            pending_session_ttl: Duration::from_secs(env_u64("PENDING_SESSION_TTL_SECONDS", 600)),
            two_captcha_api_key: env_string("TWO_CAPTCHA_API_KEY").unwrap_or_default(),
            twilio: TwilioConfig {
                account_sid: env_string("TWILIO_ACCOUNT_SID").unwrap_or_default(),
                auth_token: env_string("TWILIO_AUTH_TOKEN").unwrap_or_default(),
                to_number: env_string("TWILIO_2FA_PHONE_NUMBER").unwrap_or_default(),
            },
            outlook: OutlookConfig {
                tenant_id: env_string("OUTLOOK_TENANT_ID").unwrap_or_default(),
                client_id: env_string("OUTLOOK_CLIENT_ID").unwrap_or_default(),
                client_secret: env_string("OUTLOOK_CLIENT_SECRET").unwrap_or_default(),
                sender_email: env_string("OUTLOOK_SENDER_EMAIL").unwrap_or_default(),
            },
            mmi: creds("MMI_EMAIL", "MMI_PASSWORD"),
            rpr: creds("RPR_EMAIL", "RPR_PASSWORD"),
        }
    }

    pub fn credentials_for(&self, provider: Provider) -> Option<&PortalCredentials> {
        match provider {
            Provider::Mmi => self.mmi.as_ref(),
            Provider::Rpr => self.rpr.as_ref(),
        }
    }

    pub fn screenshots_dir(&self) -> PathBuf {
        self.state_dir.join("screenshots")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_debug_hides_password() {
        let c = PortalCredentials {
            email: "ops@example.com".into(),
            password: "hunter2".into(),
        };
        let rendered = format!("{:?}", c);
        assert!(rendered.contains("ops@example.com"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn twilio_configured_requires_all_fields() {
        let mut t = TwilioConfig::default();
        assert!(!t.is_configured());
        t.account_sid = "AC123".into();
        t.auth_token = "tok".into();
        assert!(!t.is_configured());
        t.to_number = "+15550001111".into();
        assert!(t.is_configured());
    }
}
