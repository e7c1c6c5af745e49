use bigdecimal::BigDecimal;
use bigdecimal::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// Minor units per major unit for the single settlement currency.
pub const MINOR_PER_MAJOR: i64 = 100;

/// How callers express amounts. One convention per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmountUnit {
    /// Decimal major units (e.g. `12.34`), converted with half-up rounding.
    MajorDecimal,
    /// Integer minor units (e.g. `1234`), never converted.
    MinorInteger,
}

impl AmountUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            AmountUnit::MajorDecimal => "major",
            AmountUnit::MinorInteger => "minor",
        }
    }
}

impl FromStr for AmountUnit {
    type Err = MoneyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "major" | "major_decimal" | "decimal" => Ok(AmountUnit::MajorDecimal),
            "minor" | "minor_integer" | "cents" => Ok(AmountUnit::MinorInteger),
            other => Err(MoneyError::UnknownUnit(other.to_string())),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MoneyError {
    #[error("not a decimal number: {0}")]
    Parse(String),
    #[error("amount does not fit in minor units")]
    Overflow,
    #[error("unknown amount unit: {0}")]
    UnknownUnit(String),
}

/// Parse the textual form of a JSON number into an exact decimal.
pub fn parse_decimal(raw: &str) -> Result<BigDecimal, MoneyError> {
    BigDecimal::from_str(raw.trim()).map_err(|_| MoneyError::Parse(raw.to_string()))
}

/// Round to the nearest integer, ties away from zero.
fn round_half_up(value: &BigDecimal) -> BigDecimal {
    let half = BigDecimal::new(5.into(), 1);
    // with_scale(0) truncates toward zero
    if value < &BigDecimal::from(0) {
        (value - half).with_scale(0)
    } else {
        (value + half).with_scale(0)
    }
}

/// Convert a major-unit decimal to minor units: `round(major * 100)`.
pub fn major_to_minor(major: &BigDecimal) -> Result<i64, MoneyError> {
    let scaled = major * BigDecimal::from(MINOR_PER_MAJOR);
    round_half_up(&scaled).to_i64().ok_or(MoneyError::Overflow)
}

/// Render minor units as a fixed two-place major string, for logs.
pub fn format_minor(minor: i64) -> String {
    BigDecimal::new(minor.into(), 2).to_string()
}
