/// Offline integration tests: exercise the library surface the way the HTTP
/// handlers do, with captured page fixtures instead of a live browser.
use portal_sentry::extractor;
use portal_sentry::session::challenge::{self, ChallengeKind, PageSnapshot};
use portal_sentry::types::{ErrorCode, PaymentCheckResponse, PaymentStatus, Provider, TokenBody};

/// Visible text of a results page for the reference lookup
/// (loan 0683026066 / zip 35215 / Morse).
const MORSE_RESULTS_PAGE: &str = "\
MyCoverageInfo - Policy Manager

Homeowner: John Morse
Property Address: 123 Main St, Birmingham AL 35215
Loan Number : 0683026066
Policy Number: HO-99812-4
Insurance Company: Shelter Mutual
HOMEOWNERS Policy Active
Effective Date 01/15/2024
Expiration Date 01/15/2025
Premium $1,245.00
Coverage Amount $250,000.00
Deductible $1,000.00
Payment Status: Current
Last payment received: $1,245.00 on 01/10/2024
Mortgagee Clause:
First National Bank ISAOA
PO Box 100
Birmingham, AL
Submit";

#[test]
fn reference_lookup_extracts_and_serializes() {
    let record = extractor::extract(MORSE_RESULTS_PAGE);

    let response = PaymentCheckResponse {
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
        screenshot_path: None,
        error_code: None,
        error_message: None,
        duration_ms: 4200,
    };

    let json = serde_json::to_value(&response).expect("response should serialize");
    assert_eq!(json["success"], true);
    assert_eq!(json["payment_status"], "current");
    assert_eq!(json["loan_number"], "0683026066");
    assert_eq!(json["homeowner"], "John Morse");
    assert_eq!(json["policy_status"], "Policy Active");
    assert_eq!(json["premium"], 1245.00);
    assert_eq!(json["effective_date"], "2024-01-15");
    // Absent fields are omitted from the wire body, not nulled.
    assert!(json.get("cancellation_date").is_none());
    assert!(json.get("error_code").is_none());
}

#[test]
fn lookup_failure_body_carries_machine_code() {
    let response = PaymentCheckResponse::failure(
        ErrorCode::NotFound,
        "No policy found for the supplied loan number",
    );
    let json = serde_json::to_value(&response).expect("response should serialize");
    assert_eq!(json["success"], false);
    assert_eq!(json["error_code"], "NOT_FOUND");
    assert!(json.get("payment_status").is_none());
}

#[test]
fn cancelled_policy_classifies_lapsed_despite_current_wording() {
    let page = "\
Homeowner: Jane Doe
Policy Number: HO-11111-1
Payment Status: Current
Cancellation Date 02/01/2024
HOMEOWNERS Policy Cancelled";

    let record = extractor::extract(page);
    assert_eq!(record.payment_status, PaymentStatus::Lapsed);
    assert!(record.cancellation_date.is_some());
}

#[test]
fn recaptcha_page_detected_with_site_key() {
    let snapshot = PageSnapshot::new(
        "Please verify you are human",
        r#"<form><div class="g-recaptcha" data-sitekey="6LdXa_Reference_Key_123"></div></form>"#,
    );
    match challenge::detect(&snapshot) {
        Some(ChallengeKind::Captcha { site_key }) => {
            assert_eq!(site_key.as_deref(), Some("6LdXa_Reference_Key_123"));
        }
        other => panic!("expected captcha challenge, got {:?}", other),
    }
}

#[test]
fn verification_code_page_detected() {
    let snapshot = PageSnapshot::new(
        "We sent a verification code to your phone ending in 4821. Enter the code below.",
        r#"<form><input type="text" name="otp_code" maxlength="6"></form>"#,
    );
    assert!(matches!(
        challenge::detect(&snapshot),
        Some(ChallengeKind::VerificationCode)
    ));
}

#[test]
fn plain_login_page_is_not_a_challenge() {
    let snapshot = PageSnapshot::new(
        "Sign in to your account",
        r#"<form><input type="email" name="email"><input type="password" name="password"></form>"#,
    );
    assert!(challenge::detect(&snapshot).is_none());
}

#[test]
fn token_bodies_serialize_to_wire_shapes() {
    let token = TokenBody::Token {
        success: true,
        token: "eyJhbGciOiJIUzI1NiJ9.sample.sig".to_string(),
        expires_at: chrono::Utc::now() + chrono::Duration::minutes(55),
        cached: false,
    };
    let json = serde_json::to_value(&token).expect("token body should serialize");
    assert_eq!(json["success"], true);
    assert!(json.get("expiresAt").is_some(), "expiry uses camelCase key");

    let twofa = TokenBody::Requires2fa {
        requires_2fa: true,
        session_id: uuid::Uuid::new_v4(),
        message: "2FA verification required".to_string(),
    };
    let json = serde_json::to_value(&twofa).expect("2fa body should serialize");
    assert_eq!(json["requires_2fa"], true);
    assert!(json.get("session_id").is_some());
    // Untagged: a 2FA body must never leak token fields.
    assert!(json.get("token").is_none());
}

#[test]
fn provider_paths_parse_case_insensitively() {
    assert_eq!(Provider::parse("mmi"), Some(Provider::Mmi));
    assert_eq!(Provider::parse("MMI"), Some(Provider::Mmi));
    assert_eq!(Provider::parse("rpr"), Some(Provider::Rpr));
    assert_eq!(Provider::parse("equifax"), None);
}
