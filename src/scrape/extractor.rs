//! Results-page field extraction.
//!
//! Works over the page's full visible text, not the DOM tree: the portal is
//! dynamically rendered and its markup shifts release-to-release, while
//! label-adjacent text ("Effective Date 01/15/2024") stays comparatively
//! stable. Every field has its own anchored pattern; a miss yields a null
//! field, never an error.

use std::sync::OnceLock;

use chrono::NaiveDate;
use regex::Regex;

use crate::core::types::PaymentStatus;

/// Structured record pulled from one rendered results page. Immutable once
/// produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PolicyRecord {
    pub homeowner: Option<String>,
    pub property_address: Option<String>,
    pub loan_number: Option<String>,
    pub policy_number: Option<String>,
    pub policy_status: Option<String>,
    pub carrier: Option<String>,

    pub effective_date: Option<NaiveDate>,
    pub expiration_date: Option<NaiveDate>,
    pub cancellation_date: Option<NaiveDate>,
    pub last_payment_date: Option<NaiveDate>,

    pub premium: Option<f64>,
    pub coverage_amount: Option<f64>,
    pub deductible: Option<f64>,
    pub last_payment_amount: Option<f64>,

    pub mortgagee_clause: Option<String>,

    pub payment_status: PaymentStatus,
}

// ─────────────────────────────────────────────────────────────────────────────
// Field grammar
// ─────────────────────────────────────────────────────────────────────────────

struct FieldGrammar {
    homeowner: Regex,
    property_address: Regex,
    loan_number: Regex,
    policy_number: Regex,
    policy_status: Regex,
    carrier: Regex,
    effective_date: Regex,
    expiration_date: Regex,
    cancellation_date: Regex,
    premium: Regex,
    coverage_amount: Regex,
    deductible: Regex,
    last_payment: Regex,
    mortgagee_clause: Regex,
}

static GRAMMAR: OnceLock<FieldGrammar> = OnceLock::new();

fn grammar() -> &'static FieldGrammar {
    GRAMMAR.get_or_init(|| {
        let re = |p: &str| Regex::new(p).expect("valid field pattern");
        FieldGrammar {
            // `(?:^|\n)` anchoring keeps "Additional Homeowner:" from
            // shadowing the primary homeowner line.
            homeowner: re(r"(?i)(?:^|\n)\s*Homeowner:[ \t]*([^\n]+)"),
            property_address: re(r"(?i)Property Address:[ \t]*([^\n]+)"),
            loan_number: re(r"(?i)Loan Number\s*:[ \t]*([^\n]+)"),
            policy_number: re(r"(?i)Policy Number:[ \t]*([^\n]+)"),
            policy_status: re(r"(?i)(Policy Active|Policy Inactive|Policy Cancelled)"),
            carrier: re(r"(?i)Insurance Company:[ \t]*([^\n]+)"),
            effective_date: re(r"(?i)Effective Date[^\d\n]*(\d{2}/\d{2}/\d{4})"),
            expiration_date: re(r"(?i)Expiration Date[^\d\n]*(\d{2}/\d{2}/\d{4})"),
            cancellation_date: re(r"(?i)Cancellation Date[^\d\n]*(\d{2}/\d{2}/\d{4})"),
            premium: re(r"(?i)Premium[^\d\n]*([\d,]+\.\d{2})"),
            coverage_amount: re(r"(?i)Coverage Amount[^\d\n]*([\d,]+\.\d{2})"),
            deductible: re(r"(?i)Deductible[^\d\n]*([\d,]+\.\d{2})"),
            last_payment: re(r"(?i)\$([\d,]+\.\d{2})\s+on\s+(\d{2}/\d{2}/\d{4})"),
            // Lazy match up to a terminator; the terminator is consumed, not
            // captured, since look-around is unavailable here.
            mortgagee_clause: re(r"(?is)Mortgagee Clause:(.+?)(?:Submit|Add/Update|\z)"),
        }
    })
}

fn capture_text(re: &Regex, text: &str) -> Option<String> {
    re.captures(text).map(|c| {
        let raw = c[1].trim();
        // Collapse runs of whitespace the renderer leaves behind.
        raw.split_whitespace().collect::<Vec<_>>().join(" ")
    })
}

/// Normalize a currency string and parse it as a float.
///
/// Strips everything except digits and the decimal point, so `"$2,623.79"`
/// and `"2,623.79 USD"` both parse. Returns `None` rather than `0.0` when
/// nothing numeric remains.
pub fn parse_currency(value: &str) -> Option<f64> {
    let cleaned: String = value
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse().ok()
}

static DATE_SHAPE_RE: OnceLock<Regex> = OnceLock::new();

fn date_shape_re() -> &'static Regex {
    DATE_SHAPE_RE
        .get_or_init(|| Regex::new(r"^\d{2}/\d{2}/\d{4}$").expect("valid date shape pattern"))
}

/// Parse a portal date. Only strict `MM/DD/YYYY` is accepted; anything else
/// ("N/A", "-", `3/15/24`, empty) yields `None`. chrono alone would accept
/// unpadded variants, so the shape is checked first.
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    let trimmed = value.trim();
    if !date_shape_re().is_match(trimmed) {
        return None;
    }
    NaiveDate::parse_from_str(trimmed, "%m/%d/%Y").ok()
}

// ─────────────────────────────────────────────────────────────────────────────
// Payment-status ladder
// ─────────────────────────────────────────────────────────────────────────────

/// Priority-ordered classification. First matching rule wins — order matters
/// because the keywords co-occur on real pages (a cancelled policy's page
/// still mentions "current").
///
/// 1. explicit cancellation date → `lapsed`
/// 2. "current" + "status"       → `current`
/// 3. "past due" / "late" / "unpaid" → `late`
/// 4. "grace period" / "pending" → `grace_period`
/// 5. cancellation keywords      → `lapsed`
/// 6. otherwise                  → `unknown`
pub fn classify_payment_status(
    text: &str,
    cancellation_date: Option<NaiveDate>,
) -> PaymentStatus {
    if cancellation_date.is_some() {
        return PaymentStatus::Lapsed;
    }
    let t = text.to_lowercase();
    if t.contains("current") && t.contains("status") {
        PaymentStatus::Current
    } else if t.contains("past due") || t.contains("late") || t.contains("unpaid") {
        PaymentStatus::Late
    } else if t.contains("grace period") || t.contains("pending") {
        PaymentStatus::GracePeriod
    } else if ["cancelled", "canceled", "lapsed", "policy inactive", "terminated"]
        .iter()
        .any(|k| t.contains(k))
    {
        PaymentStatus::Lapsed
    } else {
        PaymentStatus::Unknown
    }
}

/// Run the full field grammar over the rendered text.
pub fn extract(rendered_text: &str) -> PolicyRecord {
    let g = grammar();

    let cancellation_date = g
        .cancellation_date
        .captures(rendered_text)
        .and_then(|c| parse_date(&c[1]));

    let (last_payment_amount, last_payment_date) = g
        .last_payment
        .captures(rendered_text)
        .map(|c| (parse_currency(&c[1]), parse_date(&c[2])))
        .unwrap_or((None, None));

    let mortgagee_clause = g.mortgagee_clause.captures(rendered_text).map(|c| {
        c[1].trim()
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    });

    PolicyRecord {
        homeowner: capture_text(&g.homeowner, rendered_text),
        property_address: capture_text(&g.property_address, rendered_text),
        loan_number: capture_text(&g.loan_number, rendered_text),
        policy_number: capture_text(&g.policy_number, rendered_text),
        policy_status: capture_text(&g.policy_status, rendered_text),
        carrier: capture_text(&g.carrier, rendered_text),
        effective_date: g
            .effective_date
            .captures(rendered_text)
            .and_then(|c| parse_date(&c[1])),
        expiration_date: g
            .expiration_date
            .captures(rendered_text)
            .and_then(|c| parse_date(&c[1])),
        cancellation_date,
        last_payment_date,
        premium: g
            .premium
            .captures(rendered_text)
            .and_then(|c| parse_currency(&c[1])),
        coverage_amount: g
            .coverage_amount
            .captures(rendered_text)
            .and_then(|c| parse_currency(&c[1])),
        deductible: g
            .deductible
            .captures(rendered_text)
            .and_then(|c| parse_currency(&c[1])),
        last_payment_amount,
        mortgagee_clause,
        payment_status: classify_payment_status(rendered_text, cancellation_date),
    }
}
