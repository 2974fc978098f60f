//! Monetary Scalars
//!
//! All money in the system is denominated in micro-USD (1 USD = 10^6
//! units) and carried as an arbitrary-precision signed integer. The
//! wire form is a canonical decimal string: optional leading `-`, no
//! leading zeros except for `"0"`, no `+`, no whitespace, no exponent.
//! `-0` normalizes to `0`.
//!
//! Two parsers exist:
//!
//! - [`MicroUsd::parse_canonical`] rejects anything non-canonical.
//! - [`MicroUsd::parse_lenient`] accepts sloppy ingress (leading `+`,
//!   leading zeros, surrounding whitespace, `-0`) and reports whether
//!   normalization happened, so callers can flag the producer.

use num_bigint::BigInt;
use num_bigint::Sign;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};
use std::str::FromStr;

/// One USD expressed in micro-USD units.
pub const MICRO_PER_USD: i64 = 1_000_000;

/// Signed micro-USD amount with unbounded precision.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MicroUsd(BigInt);

/// Outcome of a lenient parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LenientParse {
    pub value: MicroUsd,
    /// True when the input was accepted but was not in canonical form.
    pub normalized: bool,
}

/// Wire-form violations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoneyParseError {
    Empty,
    InvalidDigit { position: usize },
    LeadingZero,
    LeadingPlus,
    Whitespace,
    NegativeZero,
}

impl fmt::Display for MoneyParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MoneyParseError::Empty => write!(f, "empty amount"),
            MoneyParseError::InvalidDigit { position } => {
                write!(f, "invalid character at position {}", position)
            }
            MoneyParseError::LeadingZero => write!(f, "leading zeros are not canonical"),
            MoneyParseError::LeadingPlus => write!(f, "explicit '+' sign is not canonical"),
            MoneyParseError::Whitespace => write!(f, "whitespace is not allowed"),
            MoneyParseError::NegativeZero => write!(f, "-0 is not canonical"),
        }
    }
}

impl std::error::Error for MoneyParseError {}

impl MicroUsd {
    pub fn zero() -> Self {
        MicroUsd(BigInt::from(0))
    }

    pub fn from_i64(v: i64) -> Self {
        MicroUsd(BigInt::from(v))
    }

    pub fn from_u64(v: u64) -> Self {
        MicroUsd(BigInt::from(v))
    }

    pub fn is_zero(&self) -> bool {
        self.0.sign() == Sign::NoSign
    }

    pub fn is_negative(&self) -> bool {
        self.0.sign() == Sign::Minus
    }

    pub fn is_positive(&self) -> bool {
        self.0.sign() == Sign::Plus
    }

    pub fn abs(&self) -> Self {
        if self.is_negative() {
            MicroUsd(-self.0.clone())
        } else {
            self.clone()
        }
    }

    /// Strict parser: accepts canonical wire form only.
    pub fn parse_canonical(s: &str) -> Result<Self, MoneyParseError> {
        Self::validate_shape(s)?;
        // Shape is validated; BigInt parse cannot fail now.
        Ok(MicroUsd(BigInt::from_str(s).map_err(|_| MoneyParseError::Empty)?))
    }

    /// Lenient parser for less strict producers.
    ///
    /// Accepts surrounding ASCII whitespace, a leading `+`, leading
    /// zeros, and `-0`. Never accepts exponents, decimal points, or
    /// interior junk. Reports whether the input needed normalization.
    pub fn parse_lenient(s: &str) -> Result<LenientParse, MoneyParseError> {
        let trimmed = s.trim_matches(|c: char| c == ' ' || c == '\t' || c == '\n' || c == '\r');
        let mut normalized = trimmed.len() != s.len();

        let (negative, digits) = match trimmed.as_bytes().first() {
            None => return Err(MoneyParseError::Empty),
            Some(b'+') => {
                normalized = true;
                (false, &trimmed[1..])
            }
            Some(b'-') => (true, &trimmed[1..]),
            Some(_) => (false, trimmed),
        };

        if digits.is_empty() {
            return Err(MoneyParseError::Empty);
        }
        for (i, b) in digits.bytes().enumerate() {
            if !b.is_ascii_digit() {
                return Err(MoneyParseError::InvalidDigit {
                    position: trimmed.len() - digits.len() + i,
                });
            }
        }
        if digits.len() > 1 && digits.starts_with('0') {
            normalized = true;
        }

        let stripped = digits.trim_start_matches('0');
        let magnitude = if stripped.is_empty() { "0" } else { stripped };
        let mut value = BigInt::from_str(magnitude).map_err(|_| MoneyParseError::Empty)?;
        if negative {
            if value.sign() == Sign::NoSign {
                // -0 normalizes to 0
                normalized = true;
            } else {
                value = -value;
            }
        }

        Ok(LenientParse {
            value: MicroUsd(value),
            normalized,
        })
    }

    fn validate_shape(s: &str) -> Result<(), MoneyParseError> {
        let bytes = s.as_bytes();
        if bytes.is_empty() {
            return Err(MoneyParseError::Empty);
        }
        if bytes.iter().any(|b| b.is_ascii_whitespace()) {
            return Err(MoneyParseError::Whitespace);
        }

        let (negative, digits) = match bytes[0] {
            b'+' => return Err(MoneyParseError::LeadingPlus),
            b'-' => (true, &s[1..]),
            _ => (false, s),
        };

        if digits.is_empty() {
            return Err(MoneyParseError::Empty);
        }
        for (i, b) in digits.bytes().enumerate() {
            if !b.is_ascii_digit() {
                return Err(MoneyParseError::InvalidDigit {
                    position: s.len() - digits.len() + i,
                });
            }
        }
        if digits.len() > 1 && digits.starts_with('0') {
            return Err(MoneyParseError::LeadingZero);
        }
        if negative && digits == "0" {
            return Err(MoneyParseError::NegativeZero);
        }
        Ok(())
    }

    /// Canonical wire form.
    pub fn to_wire(&self) -> String {
        self.0.to_string()
    }

    /// `self * numerator / denominator`, floored (toward negative
    /// infinity). The cost formula in pricing uses this with
    /// non-negative operands, where flooring equals truncation.
    pub fn mul_div_floor(&self, numerator: i64, denominator: i64) -> MicroUsd {
        debug_assert!(denominator > 0);
        let num = &self.0 * BigInt::from(numerator);
        let den = BigInt::from(denominator);
        let q = &num / &den;
        let r = &num % &den;
        if r.sign() == Sign::Minus {
            MicroUsd(q - 1)
        } else {
            MicroUsd(q)
        }
    }

    pub fn checked_add(&self, other: &MicroUsd) -> MicroUsd {
        MicroUsd(&self.0 + &other.0)
    }

    pub fn checked_sub(&self, other: &MicroUsd) -> MicroUsd {
        MicroUsd(&self.0 - &other.0)
    }

    /// Lossy conversion for logging and metrics only. Saturates.
    pub fn as_i64_saturating(&self) -> i64 {
        use num_bigint::ToBigInt;
        let min = i64::MIN.to_bigint().unwrap_or_default();
        let max = i64::MAX.to_bigint().unwrap_or_default();
        if self.0 < min {
            i64::MIN
        } else if self.0 > max {
            i64::MAX
        } else {
            // Fits; decimal round-trip through the canonical form.
            self.0.to_string().parse::<i64>().unwrap_or(0)
        }
    }
}

impl fmt::Display for MicroUsd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_wire())
    }
}

impl Add for MicroUsd {
    type Output = MicroUsd;
    fn add(self, rhs: MicroUsd) -> MicroUsd {
        MicroUsd(self.0 + rhs.0)
    }
}

impl AddAssign for MicroUsd {
    fn add_assign(&mut self, rhs: MicroUsd) {
        self.0 += rhs.0;
    }
}

impl Sub for MicroUsd {
    type Output = MicroUsd;
    fn sub(self, rhs: MicroUsd) -> MicroUsd {
        MicroUsd(self.0 - rhs.0)
    }
}

impl SubAssign for MicroUsd {
    fn sub_assign(&mut self, rhs: MicroUsd) {
        self.0 -= rhs.0;
    }
}

impl Neg for MicroUsd {
    type Output = MicroUsd;
    fn neg(self) -> MicroUsd {
        MicroUsd(-self.0)
    }
}

impl Serialize for MicroUsd {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_wire())
    }
}

impl<'de> Deserialize<'de> for MicroUsd {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        MicroUsd::parse_canonical(&s).map_err(de::Error::custom)
    }
}

// =============================================================================
// BASIS POINTS
// =============================================================================

/// Basis points, constrained to [0, 10000].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct BasisPoints(u16);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasisPointsOutOfRange(pub i64);

impl fmt::Display for BasisPointsOutOfRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "basis points {} outside [0, 10000]", self.0)
    }
}

impl std::error::Error for BasisPointsOutOfRange {}

impl BasisPoints {
    pub const MAX: u16 = 10_000;

    pub fn new(value: i64) -> Result<Self, BasisPointsOutOfRange> {
        if (0..=Self::MAX as i64).contains(&value) {
            Ok(BasisPoints(value as u16))
        } else {
            Err(BasisPointsOutOfRange(value))
        }
    }

    pub fn value(&self) -> u16 {
        self.0
    }

    /// Apply to an amount, flooring.
    pub fn apply(&self, amount: &MicroUsd) -> MicroUsd {
        amount.mul_div_floor(self.0 as i64, Self::MAX as i64)
    }
}

impl<'de> Deserialize<'de> for BasisPoints {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let v = i64::deserialize(deserializer)?;
        BasisPoints::new(v).map_err(de::Error::custom)
    }
}

// =============================================================================
// DENOMINATION
// =============================================================================

/// Posting denomination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Denomination {
    #[serde(rename = "micro_usd")]
    MicroUsd,
    #[serde(rename = "credit_unit")]
    CreditUnit,
    #[serde(rename = "micro_usdc")]
    MicroUsdc,
}

impl Denomination {
    pub fn as_str(&self) -> &'static str {
        match self {
            Denomination::MicroUsd => "micro_usd",
            Denomination::CreditUnit => "credit_unit",
            Denomination::MicroUsdc => "micro_usdc",
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_round_trip() {
        for wire in ["0", "1", "-1", "100000", "-42", "999999999999999999999999"] {
            let parsed = MicroUsd::parse_canonical(wire).unwrap();
            assert_eq!(parsed.to_wire(), wire);
        }
    }

    #[test]
    fn test_canonical_rejects_noncanonical() {
        assert!(matches!(
            MicroUsd::parse_canonical("007"),
            Err(MoneyParseError::LeadingZero)
        ));
        assert!(matches!(
            MicroUsd::parse_canonical("+5"),
            Err(MoneyParseError::LeadingPlus)
        ));
        assert!(matches!(
            MicroUsd::parse_canonical("-0"),
            Err(MoneyParseError::NegativeZero)
        ));
        assert!(matches!(
            MicroUsd::parse_canonical(" 5"),
            Err(MoneyParseError::Whitespace)
        ));
        assert!(matches!(
            MicroUsd::parse_canonical("1e6"),
            Err(MoneyParseError::InvalidDigit { .. })
        ));
        assert!(matches!(
            MicroUsd::parse_canonical("1.5"),
            Err(MoneyParseError::InvalidDigit { .. })
        ));
        assert!(matches!(
            MicroUsd::parse_canonical(""),
            Err(MoneyParseError::Empty)
        ));
        assert!(matches!(
            MicroUsd::parse_canonical("-"),
            Err(MoneyParseError::Empty)
        ));
    }

    #[test]
    fn test_lenient_normalizes() {
        let cases = [
            ("007", "7", true),
            ("+5", "5", true),
            ("-0", "0", true),
            ("  42 ", "42", true),
            ("0000", "0", true),
            ("42", "42", false),
            ("-42", "-42", false),
            ("0", "0", false),
        ];
        for (input, want, normalized) in cases {
            let parsed = MicroUsd::parse_lenient(input).unwrap();
            assert_eq!(parsed.value.to_wire(), want, "input {:?}", input);
            assert_eq!(parsed.normalized, normalized, "input {:?}", input);
        }
    }

    #[test]
    fn test_lenient_still_rejects_junk() {
        assert!(MicroUsd::parse_lenient("1e6").is_err());
        assert!(MicroUsd::parse_lenient("1.5").is_err());
        assert!(MicroUsd::parse_lenient("--1").is_err());
        assert!(MicroUsd::parse_lenient("").is_err());
        assert!(MicroUsd::parse_lenient("   ").is_err());
    }

    #[test]
    fn test_equivalent_wire_forms_parse_equal() {
        let a = MicroUsd::parse_lenient("007").unwrap().value;
        let b = MicroUsd::parse_canonical("7").unwrap();
        assert_eq!(a, b);

        let c = MicroUsd::parse_lenient("-0").unwrap().value;
        assert_eq!(c, MicroUsd::zero());
    }

    #[test]
    fn test_mul_div_floor() {
        // 3 tokens at $10/M output = 30 micro-USD per token... the
        // formula is tokens * price / 1e6; 3 * 10_000_000 / 1e6 = 30.
        let price = MicroUsd::from_i64(10_000_000);
        assert_eq!(price.mul_div_floor(3, 1_000_000).to_wire(), "30");

        // Flooring, not rounding.
        let p = MicroUsd::from_i64(1);
        assert_eq!(p.mul_div_floor(1, 3).to_wire(), "0");

        // Floor toward negative infinity for negative amounts.
        let n = MicroUsd::from_i64(-1);
        assert_eq!(n.mul_div_floor(1, 3).to_wire(), "-1");
    }

    #[test]
    fn test_basis_points_bounds() {
        assert!(BasisPoints::new(0).is_ok());
        assert!(BasisPoints::new(10_000).is_ok());
        assert!(BasisPoints::new(10_001).is_err());
        assert!(BasisPoints::new(-1).is_err());
    }

    #[test]
    fn test_basis_points_apply() {
        let amount = MicroUsd::from_i64(1_000_000);
        let bps = BasisPoints::new(250).unwrap(); // 2.5%
        assert_eq!(bps.apply(&amount).to_wire(), "25000");
    }

    #[test]
    fn test_serde_uses_wire_form() {
        let v = MicroUsd::from_i64(-300);
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, r#""-300""#);
        let back: MicroUsd = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);

        // Non-canonical JSON is rejected on the strict path.
        let bad: Result<MicroUsd, _> = serde_json::from_str(r#""007""#);
        assert!(bad.is_err());
    }

    #[test]
    fn test_saturating_i64() {
        assert_eq!(MicroUsd::from_i64(42).as_i64_saturating(), 42);
        let huge = MicroUsd::parse_canonical("99999999999999999999999999").unwrap();
        assert_eq!(huge.as_i64_saturating(), i64::MAX);
        assert_eq!((-huge).as_i64_saturating(), i64::MIN);
    }
}
