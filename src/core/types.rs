use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Providers
// ─────────────────────────────────────────────────────────────────────────────

/// A login-walled portal this service maintains a bearer token for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Mmi,
    Rpr,
}

impl Provider {
    pub const ALL: &'static [Provider] = &[Provider::Mmi, Provider::Rpr];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Mmi => "mmi",
            Provider::Rpr => "rpr",
        }
    }

    pub fn parse(s: &str) -> Option<Provider> {
        match s.to_ascii_lowercase().as_str() {
            "mmi" => Some(Provider::Mmi),
            "rpr" => Some(Provider::Rpr),
            _ => None,
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Error taxonomy (machine-readable codes surfaced in API bodies)
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Target record absent per the site's own "not found" message.
    NotFound,
    /// CAPTCHA solve/inject attempts exhausted.
    CaptchaFailed,
    /// A wait exceeded its bound.
    Timeout,
    /// Unexpected failure while driving the login flow.
    LookupError,
    /// Unexpected failure while parsing a rendered results page.
    ExtractionError,
    /// Browser pool saturated — no worker available within the timeout.
    NoBrowser,
    /// Caller failed shared-secret authentication.
    Unauthorized,
}

impl ErrorCode {
    /// Failure kinds worth retrying from the orchestrator. `NOT_FOUND` is
    /// deterministic; only plausibly-transient kinds qualify.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCode::Timeout | ErrorCode::LookupError)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Payment-check surface
// ─────────────────────────────────────────────────────────────────────────────

/// Classified payment standing, derived from the results-page keyword ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Current,
    Late,
    GracePeriod,
    Lapsed,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentCheckRequest {
    pub loan_number: String,
    pub zip_code: String,
    #[serde(default)]
    pub last_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct PaymentCheckResponse {
    pub success: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_status: Option<PaymentStatus>,

    // Policy fields as rendered on the portal
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub carrier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub homeowner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub property_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loan_number: Option<String>,

    // Dates (MM/DD/YYYY on the page; anything else parses to null)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effective_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancellation_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_payment_date: Option<NaiveDate>,

    // Financials
    #[serde(skip_serializing_if = "Option::is_none")]
    pub premium: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coverage_amount: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deductible: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_payment_amount: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub mortgagee_clause: Option<String>,

    /// Audit trail: path of the PNG captured from the results page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot_path: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    pub duration_ms: u64,
}

impl PaymentCheckResponse {
    pub fn failure(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_code: Some(code),
            error_message: Some(message.into()),
            ..Default::default()
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Token surface
// ─────────────────────────────────────────────────────────────────────────────

/// Body returned by `GET /tokens/{provider}` and the 2FA resume endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum TokenBody {
    Token {
        success: bool,
        token: String,
        #[serde(rename = "expiresAt")]
        expires_at: DateTime<Utc>,
        cached: bool,
    },
    Requires2fa {
        requires_2fa: bool,
        session_id: uuid::Uuid,
        message: String,
    },
    Error {
        error: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct TwoFaSubmitRequest {
    pub session_id: uuid::Uuid,
    pub code: String,
}

/// Per-provider block inside `GET /health`.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    #[serde(rename = "hasToken")]
    pub has_token: bool,
    #[serde(rename = "expiresInMinutes")]
    pub expires_in_minutes: f64,
    #[serde(rename = "lastRefresh")]
    pub last_refresh: Option<DateTime<Utc>>,
    #[serde(rename = "lastError")]
    pub last_error: Option<String>,
    #[serde(rename = "retryCount")]
    pub retry_count: u32,
    #[serde(rename = "hasStorageState")]
    pub has_storage_state: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_parse_roundtrip() {
        assert_eq!(Provider::parse("mmi"), Some(Provider::Mmi));
        assert_eq!(Provider::parse("RPR"), Some(Provider::Rpr));
        assert_eq!(Provider::parse("zillow"), None);
    }

    #[test]
    fn error_code_serializes_screaming_snake() {
        let v = serde_json::to_value(ErrorCode::CaptchaFailed).unwrap();
        assert_eq!(v, "CAPTCHA_FAILED");
        assert_eq!(serde_json::to_value(ErrorCode::NoBrowser).unwrap(), "NO_BROWSER");
    }

    #[test]
    fn retryable_kinds() {
        assert!(ErrorCode::Timeout.is_retryable());
        assert!(ErrorCode::LookupError.is_retryable());
        assert!(!ErrorCode::NotFound.is_retryable());
        assert!(!ErrorCode::CaptchaFailed.is_retryable());
    }

    #[test]
    fn payment_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(PaymentStatus::GracePeriod).unwrap(),
            "grace_period"
        );
    }
}
