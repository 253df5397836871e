//! Login-challenge detection over a rendered page snapshot.
//!
//! Pure functions over captured page text/HTML — no CDP calls — so every
//! heuristic here is testable against fixture strings. The automator captures
//! a [`PageSnapshot`] after each navigation settles and asks this module what,
//! if anything, is blocking the login.

use aho_corasick::AhoCorasick;
use regex::Regex;
use std::sync::OnceLock;

/// What the page captured after a navigation settled.
#[derive(Debug, Clone, Default)]
pub struct PageSnapshot {
    /// `document.body.innerText`, lowercased by the caller or here.
    pub body_text: String,
    /// Full `document.documentElement.outerHTML`.
    pub html: String,
}

impl PageSnapshot {
    pub fn new(body_text: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            body_text: body_text.into(),
            html: html.into(),
        }
    }
}

/// A challenge standing between the automator and an authenticated session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeKind {
    /// reCAPTCHA/hCaptcha widget. `site_key` is present when it could be
    /// scraped from the markup; solving requires it.
    Captcha { site_key: Option<String> },
    /// A one-time verification code prompt (SMS/email 2FA).
    VerificationCode,
}

// Markup fragments that indicate an interactive captcha widget.
const CAPTCHA_MARKER_PATTERNS: &[&str] = &[
    "g-recaptcha",
    "data-sitekey",
    "h-captcha",
    "recaptcha/api",
    "hcaptcha.com",
    "cf-turnstile",
];

// Phrases that indicate a verification-code prompt. Matched against visible
// body text, lowercased.
const CODE_PHRASE_PATTERNS: &[&str] = &[
    "verification code",
    "security code",
    "one-time code",
    "one time code",
    "enter the code",
    "enter code",
    "code sent to",
    "we sent a code",
    "we've sent a code",
    "check your phone",
    "check your email",
    "two-factor",
    "two factor",
    "2-step verification",
    "authentication code",
];

static CAPTCHA_MARKERS: OnceLock<AhoCorasick> = OnceLock::new();
static CODE_PHRASES: OnceLock<AhoCorasick> = OnceLock::new();

fn captcha_markers() -> &'static AhoCorasick {
    CAPTCHA_MARKERS.get_or_init(|| {
        AhoCorasick::builder()
            .ascii_case_insensitive(true)
            .build(CAPTCHA_MARKER_PATTERNS)
            .expect("valid captcha marker patterns")
    })
}

fn code_phrases() -> &'static AhoCorasick {
    CODE_PHRASES
        .get_or_init(|| AhoCorasick::new(CODE_PHRASE_PATTERNS).expect("valid code phrase patterns"))
}

static SITE_KEY_RE: OnceLock<Regex> = OnceLock::new();
static INPUT_TAG_RE: OnceLock<Regex> = OnceLock::new();
static SINGLE_CHAR_BOX_RE: OnceLock<Regex> = OnceLock::new();

fn site_key_re() -> &'static Regex {
    SITE_KEY_RE.get_or_init(|| {
        Regex::new(r#"data-sitekey\s*=\s*["']([^"']+)["']"#).expect("valid site-key regex")
    })
}

fn input_tag_re() -> &'static Regex {
    INPUT_TAG_RE.get_or_init(|| Regex::new(r"(?is)<input\b[^>]*>").expect("valid input tag regex"))
}

fn single_char_box_re() -> &'static Regex {
    SINGLE_CHAR_BOX_RE
        .get_or_init(|| Regex::new(r#"(?i)maxlength\s*=\s*["']?1["']?"#).expect("valid maxlength regex"))
}

/// Scrape the captcha site key from the page markup, if present.
pub fn extract_site_key(html: &str) -> Option<String> {
    site_key_re()
        .captures(html)
        .map(|c| c[1].to_string())
        .filter(|k| !k.is_empty())
}

/// True when the markup contains a code-entry input: either an input whose
/// name/id/placeholder/autocomplete mentions a code (but not email/password
/// fields), or a row of ≥4 single-character boxes.
fn has_code_input(html: &str) -> bool {
    let mut single_char_boxes = 0usize;
    for m in input_tag_re().find_iter(html) {
        let tag = m.as_str().to_ascii_lowercase();
        // Email/password fields are never code entry, whether the marker is
        // in the type or in the name/id/placeholder.
        if tag.contains("email") || tag.contains("password") {
            continue;
        }
        if single_char_box_re().is_match(&tag) {
            single_char_boxes += 1;
            continue;
        }
        if tag.contains("otp")
            || tag.contains("one-time-code")
            || tag.contains("verification")
            || tag.contains("security-code")
            || tag.contains("securitycode")
            || tag.contains("mfa")
            || tag.contains("twofactor")
            || tag.contains("two-factor")
        {
            return true;
        }
    }
    single_char_boxes >= 4
}

/// Inspect a settled page and report the blocking challenge, if any.
///
/// CAPTCHA wins over a code prompt when both appear: the widget gates the
/// form submit, so it has to be cleared first.
pub fn detect(snapshot: &PageSnapshot) -> Option<ChallengeKind> {
    if captcha_markers().is_match(&snapshot.html) {
        return Some(ChallengeKind::Captcha {
            site_key: extract_site_key(&snapshot.html),
        });
    }

    let text = snapshot.body_text.to_lowercase();
    if code_phrases().is_match(&text) || has_code_input(&snapshot.html) {
        return Some(ChallengeKind::VerificationCode);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_login_page_has_no_challenge() {
        let snap = PageSnapshot::new(
            "Sign in to your account\nEmail\nPassword\nForgot password?",
            r#"<form><input type="email" name="email"><input type="password" name="password"><button>Sign in</button></form>"#,
        );
        assert_eq!(detect(&snap), None);
    }

    #[test]
    fn recaptcha_widget_detected_with_site_key() {
        let snap = PageSnapshot::new(
            "Sign in",
            r#"<div class="g-recaptcha" data-sitekey="6LfKeyKeyKeyKey"></div>"#,
        );
        assert_eq!(
            detect(&snap),
            Some(ChallengeKind::Captcha {
                site_key: Some("6LfKeyKeyKeyKey".to_string())
            })
        );
    }

    #[test]
    fn hcaptcha_iframe_detected_without_site_key() {
        let snap = PageSnapshot::new(
            "Verify you are human",
            r#"<iframe src="https://newassets.hcaptcha.com/captcha/v1/frame"></iframe>"#,
        );
        assert_eq!(detect(&snap), Some(ChallengeKind::Captcha { site_key: None }));
    }

    #[test]
    fn verification_phrase_detected_in_body_text() {
        let snap = PageSnapshot::new(
            "We sent a code to your phone ending in 1234. Enter the code below.",
            "<form><input name=\"digits\"></form>",
        );
        assert_eq!(detect(&snap), Some(ChallengeKind::VerificationCode));
    }

    #[test]
    fn otp_input_detected_without_phrases() {
        let snap = PageSnapshot::new(
            "Almost there",
            r#"<input type="text" autocomplete="one-time-code" name="token">"#,
        );
        assert_eq!(detect(&snap), Some(ChallengeKind::VerificationCode));
    }

    #[test]
    fn four_single_char_boxes_detected_as_code_entry() {
        let boxes = r#"<input maxlength="1"><input maxlength="1"><input maxlength="1"><input maxlength="1">"#;
        let snap = PageSnapshot::new("Almost there", boxes);
        assert_eq!(detect(&snap), Some(ChallengeKind::VerificationCode));

        // Three boxes is not enough signal.
        let few = r#"<input maxlength="1"><input maxlength="1"><input maxlength="1">"#;
        assert_eq!(detect(&PageSnapshot::new("Almost there", few)), None);
    }

    #[test]
    fn email_and_password_inputs_do_not_trip_code_scan() {
        let snap = PageSnapshot::new(
            "Sign in",
            r#"<input type="email" name="verification_email"><input type="password" id="otp_password">"#,
        );
        assert_eq!(detect(&snap), None);

        // Exclusion also applies when only the name marks the field.
        let named = PageSnapshot::new(
            "Sign in",
            r#"<input type="text" name="email_verification">"#,
        );
        assert_eq!(detect(&named), None);
    }

    #[test]
    fn captcha_wins_over_code_prompt() {
        let snap = PageSnapshot::new(
            "Enter the verification code we sent you",
            r#"<div class="g-recaptcha" data-sitekey="abc"></div><input autocomplete="one-time-code">"#,
        );
        assert!(matches!(detect(&snap), Some(ChallengeKind::Captcha { .. })));
    }

    #[test]
    fn site_key_extraction_handles_quote_styles() {
        assert_eq!(
            extract_site_key(r#"<div data-sitekey='single-quoted'>"#),
            Some("single-quoted".to_string())
        );
        assert_eq!(extract_site_key("<div>no key here</div>"), None);
    }
}
