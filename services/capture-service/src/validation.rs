//! Input validation for capture requests.
//!
//! Everything here is pure: raw JSON in, a typed [`CaptureRequest`] or a [`ValidationError`] out.
//! No network activity happens before these checks pass.

use common_money::{major_to_minor, parse_decimal, AmountUnit};
use serde_json::Value;
use std::str::FromStr;
use thiserror::Error;

pub const TRANSACTION_ID_FIELD: &str = "transactionId";
pub const AMOUNT_FIELD: &str = "amount";
/// Minor-unit field names, in lookup order.
pub const MINOR_AMOUNT_FIELDS: [&str; 3] = ["amountCents", "amount_cents", "amount"];

/// Exclusive ceiling for major-unit amounts (largest accepted: 999,999.99).
pub const MAX_MAJOR_AMOUNT: f64 = 1_000_000.0;
/// Exclusive ceiling for minor-unit amounts (largest accepted: 99,999,999).
pub const MAX_MINOR_AMOUNT: f64 = 100_000_000.0;
/// Raw ids longer than `max_len` times this are rejected before sanitization.
const RAW_ID_LENGTH_FACTOR: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strictness {
    /// 1..=100 characters, any content that survives sanitization.
    Basic,
    /// 5..=50 characters from `[A-Za-z0-9_-]`.
    Strict,
}

#[derive(Debug, Error)]
#[error("unknown validation strictness: {0}")]
pub struct UnknownStrictness(String);

impl FromStr for Strictness {
    type Err = UnknownStrictness;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "basic" | "loose" => Ok(Strictness::Basic),
            "strict" => Ok(Strictness::Strict),
            other => Err(UnknownStrictness(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    pub transaction_id: String,
    pub amount_minor: i64,
}

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("request body must be a JSON object")]
    BodyNotObject,
    #[error("{0} is required")]
    MissingField(&'static str),
    #[error("transactionId must be a string")]
    TransactionIdType,
    #[error("transactionId is empty after sanitization")]
    TransactionIdEmpty,
    #[error("transactionId must be between {min} and {max} characters")]
    TransactionIdLength { min: usize, max: usize },
    #[error("transactionId may only contain letters, digits, '-' and '_'")]
    TransactionIdCharset,
    #[error("amount must be a number")]
    AmountType,
    #[error("amount must be a finite number")]
    AmountNotFinite,
    #[error("amount must be greater than zero")]
    AmountNotPositive,
    #[error("amount must be less than {ceiling}")]
    AmountTooLarge { ceiling: f64 },
    #[error("amount must be an integer number of minor units")]
    AmountNotInteger,
    #[error("amount is smaller than one minor unit")]
    AmountBelowMinorUnit,
}

impl ValidationError {
    /// Value for the `X-Error-Code` header.
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::BodyNotObject | ValidationError::MissingField(_) => "invalid_body",
            ValidationError::TransactionIdType
            | ValidationError::TransactionIdEmpty
            | ValidationError::TransactionIdLength { .. }
            | ValidationError::TransactionIdCharset => "invalid_transaction_id",
            ValidationError::AmountType
            | ValidationError::AmountNotFinite
            | ValidationError::AmountNotPositive
            | ValidationError::AmountTooLarge { .. }
            | ValidationError::AmountNotInteger
            | ValidationError::AmountBelowMinorUnit => "invalid_amount",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationPolicy {
    pub strictness: Strictness,
    pub amount_unit: AmountUnit,
    pub min_len: usize,
    pub max_len: usize,
    /// Exclusive, expressed in `amount_unit`.
    pub max_amount: f64,
}

impl ValidationPolicy {
    pub fn new(strictness: Strictness, amount_unit: AmountUnit) -> Self {
        let (min_len, max_len) = match strictness {
            Strictness::Basic => (1, 100),
            Strictness::Strict => (5, 50),
        };
        let max_amount = match amount_unit {
            AmountUnit::MajorDecimal => MAX_MAJOR_AMOUNT,
            AmountUnit::MinorInteger => MAX_MINOR_AMOUNT,
        };
        Self { strictness, amount_unit, min_len, max_len, max_amount }
    }

    pub fn validate_body(&self, body: &Value) -> Result<CaptureRequest, ValidationError> {
        let object = body.as_object().ok_or(ValidationError::BodyNotObject)?;
        let raw_id = object
            .get(TRANSACTION_ID_FIELD)
            .ok_or(ValidationError::MissingField(TRANSACTION_ID_FIELD))?;
        let raw_amount = match self.amount_unit {
            AmountUnit::MajorDecimal => object.get(AMOUNT_FIELD),
            AmountUnit::MinorInteger => MINOR_AMOUNT_FIELDS.iter().find_map(|field| object.get(*field)),
        }
        .ok_or(ValidationError::MissingField(AMOUNT_FIELD))?;

        let transaction_id = self.validate_transaction_id(raw_id)?;
        let amount_minor = self.validate_amount(raw_amount)?;
        Ok(CaptureRequest { transaction_id, amount_minor })
    }

    pub fn validate_transaction_id(&self, raw: &Value) -> Result<String, ValidationError> {
        let raw = raw.as_str().ok_or(ValidationError::TransactionIdType)?;
        if raw.len() > self.max_len * RAW_ID_LENGTH_FACTOR {
            return Err(ValidationError::TransactionIdLength { min: self.min_len, max: self.max_len });
        }
        let cleaned = strip_unsafe(raw);
        if cleaned.is_empty() {
            return Err(ValidationError::TransactionIdEmpty);
        }
        let len = cleaned.chars().count();
        if len < self.min_len || len > self.max_len {
            return Err(ValidationError::TransactionIdLength { min: self.min_len, max: self.max_len });
        }
        if self.strictness == Strictness::Strict && !cleaned.chars().all(is_id_char) {
            return Err(ValidationError::TransactionIdCharset);
        }
        Ok(cleaned)
    }

    /// Returns the amount in minor units, converting if the deployment takes major units.
    pub fn validate_amount(&self, raw: &Value) -> Result<i64, ValidationError> {
        let Value::Number(number) = raw else {
            return Err(ValidationError::AmountType);
        };
        let value = number.as_f64().ok_or(ValidationError::AmountType)?;
        self.check_magnitude(value)?;

        match self.amount_unit {
            AmountUnit::MinorInteger => {
                if let Some(minor) = number.as_i64() {
                    return Ok(minor);
                }
                if value.fract() != 0.0 {
                    return Err(ValidationError::AmountNotInteger);
                }
                // bounded by check_magnitude, so the cast is exact
                Ok(value as i64)
            }
            AmountUnit::MajorDecimal => {
                let major = parse_decimal(&number.to_string()).map_err(|_| ValidationError::AmountType)?;
                let minor = major_to_minor(&major).map_err(|_| ValidationError::AmountTooLarge { ceiling: self.max_amount })?;
                if minor < 1 {
                    return Err(ValidationError::AmountBelowMinorUnit);
                }
                // rounding can carry a value just under the major ceiling onto it
                if minor as f64 >= MAX_MINOR_AMOUNT {
                    return Err(ValidationError::AmountTooLarge { ceiling: self.max_amount });
                }
                Ok(minor)
            }
        }
    }

    /// Finite, strictly positive, strictly below the ceiling.
    pub fn check_magnitude(&self, value: f64) -> Result<(), ValidationError> {
        if !value.is_finite() {
            return Err(ValidationError::AmountNotFinite);
        }
        if value <= 0.0 {
            return Err(ValidationError::AmountNotPositive);
        }
        if value >= self.max_amount {
            return Err(ValidationError::AmountTooLarge { ceiling: self.max_amount });
        }
        Ok(())
    }
}

fn is_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

fn is_stripped_char(c: char) -> bool {
    matches!(c, '<' | '>' | '"' | '\'' | '`') || c.is_control()
}

const JS_SCHEME: &str = "javascript:";

/// Remove markup-significant characters, `javascript:` schemes and `onxxx=` handler
/// fragments, repeated until nothing changes. Idempotent.
pub fn strip_unsafe(raw: &str) -> String {
    let mut current: String = raw.chars().filter(|c| !is_stripped_char(*c)).collect();
    loop {
        let next = remove_event_handlers(&remove_js_scheme(&current));
        if next == current {
            break;
        }
        current = next;
    }
    current.trim().to_string()
}

fn remove_js_scheme(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(c) = rest.chars().next() {
        let is_scheme = rest
            .get(..JS_SCHEME.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(JS_SCHEME));
        if is_scheme {
            rest = &rest[JS_SCHEME.len()..];
        } else {
            out.push(c);
            rest = &rest[c.len_utf8()..];
        }
    }
    out
}

fn remove_event_handlers(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = String::with_capacity(input.len());
    let mut copied_from = 0;
    let mut i = 0;
    while i < bytes.len() {
        match event_handler_end(bytes, i) {
            Some(end) => {
                out.push_str(&input[copied_from..i]);
                i = end;
                copied_from = end;
            }
            None => i += 1,
        }
    }
    out.push_str(&input[copied_from..]);
    out
}

/// Matches `on<letters>\s*=` at a word boundary; returns the index after `=`.
fn event_handler_end(bytes: &[u8], start: usize) -> Option<usize> {
    if start > 0 && bytes[start - 1].is_ascii_alphanumeric() {
        return None;
    }
    if bytes.len() < start + 2
        || !bytes[start].eq_ignore_ascii_case(&b'o')
        || !bytes[start + 1].eq_ignore_ascii_case(&b'n')
    {
        return None;
    }
    let mut j = start + 2;
    while j < bytes.len() && bytes[j].is_ascii_alphabetic() {
        j += 1;
    }
    if j == start + 2 {
        return None;
    }
    while j < bytes.len() && bytes[j].is_ascii_whitespace() {
        j += 1;
    }
    (j < bytes.len() && bytes[j] == b'=').then_some(j + 1)
}
