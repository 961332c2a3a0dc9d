// SPDX-License-Identifier: MIT OR Apache-2.0

//! The restricted value universe accepted by the canonical encoder.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use unicode_normalization::UnicodeNormalization;

use crate::CanonError;

/// A value in the canonical universe.
///
/// Deliberately narrower than JSON: binary floating-point has no variant.
/// Non-integer numerics must arrive as exact decimals, and anything that
/// cannot be expressed exactly is rejected at conversion time rather than
/// silently coerced.
#[derive(Debug, Clone, PartialEq)]
pub enum CanonValue {
    /// JSON `null`.
    Null,
    /// JSON boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Unsigned integer beyond `i64::MAX`.
    Uint(u64),
    /// Exact fixed-point decimal.
    Decimal(Decimal),
    /// Unicode string (NFC-normalized on encode).
    String(String),
    /// UTC instant, encoded as `YYYY-MM-DDTHH:MM:SS.ssssssZ`.
    Timestamp(DateTime<Utc>),
    /// Ordered sequence; author order is preserved.
    Array(Vec<CanonValue>),
    /// String-keyed mapping; keys are NFC-normalized and stored sorted.
    Map(BTreeMap<String, CanonValue>),
}

impl CanonValue {
    /// Borrow as a map, if this is one.
    #[must_use]
    pub fn as_map(&self) -> Option<&BTreeMap<String, CanonValue>> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Borrow as a mutable map, if this is one.
    pub fn as_map_mut(&mut self) -> Option<&mut BTreeMap<String, CanonValue>> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Borrow as a string, if this is one.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Look up a key on a map value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&CanonValue> {
        self.as_map().and_then(|m| m.get(key))
    }
}

/// NFC-normalize a string, returning it unchanged when already normalized.
pub(crate) fn nfc(s: &str) -> String {
    s.nfc().collect()
}

/// Convert an arbitrary JSON value into the canonical universe.
///
/// Numbers are interpreted from their literal text: integer literals map
/// to [`CanonValue::Int`]/[`CanonValue::Uint`]; fraction literals must be
/// exact decimals. Exponent notation and magnitudes outside the decimal
/// range are refused; callers carrying non-integer numerics must use a
/// fixed-point decimal representation.
///
/// # Errors
///
/// [`CanonError::InvalidNumber`] for unrepresentable numbers and
/// [`CanonError::DuplicateKey`] for keys that collide after NFC
/// normalization.
pub fn to_canon(value: &serde_json::Value) -> Result<CanonValue, CanonError> {
    match value {
        serde_json::Value::Null => Ok(CanonValue::Null),
        serde_json::Value::Bool(b) => Ok(CanonValue::Bool(*b)),
        serde_json::Value::Number(n) => number_to_canon(n.as_str()),
        serde_json::Value::String(s) => Ok(CanonValue::String(s.clone())),
        serde_json::Value::Array(items) => {
            let converted = items.iter().map(to_canon).collect::<Result<Vec<_>, _>>()?;
            Ok(CanonValue::Array(converted))
        }
        serde_json::Value::Object(map) => {
            let mut out = BTreeMap::new();
            for (key, nested) in map {
                let normalized = nfc(key);
                if out.insert(normalized.clone(), to_canon(nested)?).is_some() {
                    return Err(CanonError::DuplicateKey { key: normalized });
                }
            }
            Ok(CanonValue::Map(out))
        }
    }
}

fn number_to_canon(literal: &str) -> Result<CanonValue, CanonError> {
    if literal.contains(['e', 'E']) {
        return Err(CanonError::InvalidNumber {
            literal: literal.to_string(),
            reason: "exponent notation is not canonical",
        });
    }
    if literal.starts_with('+') {
        return Err(CanonError::InvalidNumber {
            literal: literal.to_string(),
            reason: "leading '+' is not canonical",
        });
    }
    if literal.contains('.') {
        return Decimal::from_str(literal)
            .map(CanonValue::Decimal)
            .map_err(|_| CanonError::InvalidNumber {
                literal: literal.to_string(),
                reason: "not exactly representable as a fixed-point decimal",
            });
    }
    if let Ok(i) = i64::from_str(literal) {
        return Ok(CanonValue::Int(i));
    }
    if let Ok(u) = u64::from_str(literal) {
        return Ok(CanonValue::Uint(u));
    }
    Err(CanonError::InvalidNumber {
        literal: literal.to_string(),
        reason: "integer magnitude out of range",
    })
}
