//! Business-rule validation — collects every violation in one pass.
//!
//! Validation never fails fast: the complete list of problems is
//! reported so a single retry round-trip can fix all of them.

use chrono::NaiveDate;
use regex::Regex;
use rust_decimal::Decimal;

use crate::message::ParsedFields;

/// A single business-rule violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// The tag/field the violation is anchored to.
    pub field: String,
    pub reason: String,
}

impl Violation {
    fn new(field: &str, reason: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

/// Split a `:32B:`-style composite into currency code and amount.
///
/// The first three characters are the currency, the remainder the
/// amount with either a comma or a dot decimal mark.
pub fn split_currency_amount(raw: &str) -> Result<(String, Decimal), String> {
    if raw.len() <= 3 {
        return Err("expected currency followed by amount".to_string());
    }
    let (currency, amount_part) = raw.split_at(3);
    if !currency.chars().all(|c| c.is_ascii_uppercase()) {
        return Err(format!("currency {currency:?} is not three uppercase letters"));
    }
    let normalized = amount_part.replace(',', ".");
    let amount: Decimal = normalized
        .parse()
        .map_err(|_| format!("amount {amount_part:?} is not a number"))?;
    if amount <= Decimal::ZERO {
        return Err("amount must be positive".to_string());
    }
    if amount.scale() > 2 {
        return Err(format!(
            "amount {amount_part:?} has more than two decimal places"
        ));
    }
    Ok((currency.to_string(), amount))
}

/// Parse a SWIFT `YYMMDD` date.
pub fn parse_swift_date(raw: &str) -> Result<NaiveDate, String> {
    if raw.len() != 6 || !raw.chars().all(|c| c.is_ascii_digit()) {
        return Err(format!("date {raw:?} is not in YYMMDD form"));
    }
    NaiveDate::parse_from_str(raw, "%y%m%d").map_err(|_| format!("date {raw:?} is not a calendar date"))
}

/// Validator applying the business rules for each kind.
pub struct FieldValidator {
    currency_re: Regex,
    /// Expiry more than this many years past issue is considered absurd.
    max_expiry_years: i32,
}

impl FieldValidator {
    pub fn new() -> Self {
        Self {
            currency_re: Regex::new(r"^[A-Z]{3}$").unwrap(),
            max_expiry_years: 30,
        }
    }

    /// Validate parsed fields. Empty result means pass.
    pub fn validate(&self, fields: &ParsedFields) -> Vec<Violation> {
        let mut violations = Vec::new();
        match fields {
            ParsedFields::ReceivedGuarantee(f) => {
                self.check_currency_amount(&mut violations, "32B", &f.currency_amount);
                let issue = self.check_date(&mut violations, "30", &f.issue_date);
                let expiry = self.check_date(&mut violations, "31E", &f.expiry_date);
                if let (Some(issue), Some(expiry)) = (issue, expiry) {
                    self.check_date_ordering(&mut violations, issue, expiry);
                }
                check_present(&mut violations, "50", &f.applicant, "applicant");
                check_present(&mut violations, "59", &f.beneficiary, "beneficiary");
            }
            ParsedFields::Amendment(f) => {
                check_present(&mut violations, "77C", &f.narrative, "amendment narrative");
                if let Some(composite) = &f.new_currency_amount {
                    self.check_currency_amount(&mut violations, "32B", composite);
                }
                if let Some(date) = &f.new_expiry_date {
                    self.check_date(&mut violations, "31E", date);
                }
                if let Some(date) = &f.amendment_date {
                    self.check_date(&mut violations, "30", date);
                }
            }
            ParsedFields::DiscrepancyAdvice(f) => {
                check_present(&mut violations, "77A", &f.discrepancies, "discrepancy narrative");
            }
            ParsedFields::FreeFormat(f) => {
                check_present(&mut violations, "79", &f.narrative, "narrative");
            }
            // Pure acknowledgements carry no business payload to check.
            ParsedFields::Acknowledgement(_) | ParsedFields::AmendmentConfirmation(_) => {}
        }
        violations
    }

    fn check_currency_amount(&self, violations: &mut Vec<Violation>, field: &str, raw: &str) {
        match split_currency_amount(raw) {
            Ok((currency, _)) => {
                if !self.currency_re.is_match(&currency) {
                    violations.push(Violation::new(field, format!("bad currency code {currency:?}")));
                }
            }
            Err(reason) => violations.push(Violation::new(field, reason)),
        }
    }

    fn check_date(
        &self,
        violations: &mut Vec<Violation>,
        field: &str,
        raw: &str,
    ) -> Option<NaiveDate> {
        match parse_swift_date(raw) {
            Ok(date) => Some(date),
            Err(reason) => {
                violations.push(Violation::new(field, reason));
                None
            }
        }
    }

    fn check_date_ordering(
        &self,
        violations: &mut Vec<Violation>,
        issue: NaiveDate,
        expiry: NaiveDate,
    ) {
        if expiry <= issue {
            violations.push(Violation::new(
                "31E",
                format!("expiry {expiry} must be strictly after issue {issue}"),
            ));
            return;
        }
        let horizon = issue
            .checked_add_months(chrono::Months::new(12 * self.max_expiry_years as u32))
            .unwrap_or(NaiveDate::MAX);
        if expiry > horizon {
            violations.push(Violation::new(
                "31E",
                format!(
                    "expiry {expiry} is more than {} years past issue {issue}",
                    self.max_expiry_years
                ),
            ));
        }
    }
}

impl Default for FieldValidator {
    fn default() -> Self {
        Self::new()
    }
}

fn check_present(violations: &mut Vec<Violation>, field: &str, value: &str, label: &str) {
    if value.trim().is_empty() {
        violations.push(Violation::new(field, format!("{label} is required")));
    }
}
