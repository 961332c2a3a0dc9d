// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::BTreeMap;

use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use rust_decimal::Decimal;
use std::str::FromStr;

use crate::{CanonValue, encode, hash, hash_json, parse, to_canon, CanonError};

fn canon_str(value: &CanonValue) -> String {
    String::from_utf8(encode(value).unwrap()).unwrap()
}

// -- Golden vectors ------------------------------------------------------
//
// These byte sequences are the compatibility contract for the ledger
// format. Do not change them without a ledger_version bump.

#[test]
fn golden_scalars() {
    assert_eq!(canon_str(&CanonValue::Null), "null");
    assert_eq!(canon_str(&CanonValue::Bool(true)), "true");
    assert_eq!(canon_str(&CanonValue::Bool(false)), "false");
    assert_eq!(canon_str(&CanonValue::Int(0)), "0");
    assert_eq!(canon_str(&CanonValue::Int(-42)), "-42");
    assert_eq!(canon_str(&CanonValue::Uint(18_446_744_073_709_551_615)), "18446744073709551615");
}

#[test]
fn golden_decimals() {
    let cases = [
        ("10.50", "10.5"),
        ("5.0", "5"),
        ("0.000", "0"),
        ("-3.1400", "-3.14"),
        ("1500", "1500"),
        ("0.1", "0.1"),
    ];
    for (input, expected) in cases {
        let d = Decimal::from_str(input).unwrap();
        assert_eq!(canon_str(&CanonValue::Decimal(d)), expected, "input {input}");
    }
}

#[test]
fn golden_strings() {
    assert_eq!(canon_str(&CanonValue::String("a/b".into())), r#""a/b""#);
    assert_eq!(
        canon_str(&CanonValue::String("line\nbreak\ttab \"q\" \\".into())),
        r#""line\nbreak\ttab \"q\" \\""#
    );
    assert_eq!(
        canon_str(&CanonValue::String("\u{0001}".into())),
        r#""\u0001""#
    );
    // Non-ASCII is emitted raw, not escaped.
    assert_eq!(canon_str(&CanonValue::String("héllo".into())), "\"héllo\"");
}

#[test]
fn golden_timestamp() {
    let ts = Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap();
    assert_eq!(
        canon_str(&CanonValue::Timestamp(ts)),
        "\"2026-08-01T12:00:00.000000Z\""
    );
}

#[test]
fn golden_containers() {
    let mut inner = BTreeMap::new();
    inner.insert("b".to_string(), CanonValue::Int(2));
    inner.insert("a".to_string(), CanonValue::Int(1));
    let value = CanonValue::Array(vec![
        CanonValue::Map(inner),
        CanonValue::Null,
        CanonValue::String("x".into()),
    ]);
    assert_eq!(canon_str(&value), r#"[{"a":1,"b":2},null,"x"]"#);
}

#[test]
fn golden_hash() {
    // SHA-256 of the ASCII bytes `null`.
    assert_eq!(
        hash(&CanonValue::Null).unwrap(),
        "74234e98afe7498fb5daf1f36ac2d78acc339464f950703b8c019892f982b90b"
    );
}

// -- Key normalization and ordering --------------------------------------

#[test]
fn keys_sorted_after_nfc_normalization() {
    // "e" + COMBINING ACUTE normalizes to U+00E9, which sorts after "f".
    let mut map = BTreeMap::new();
    map.insert("e\u{0301}".to_string(), CanonValue::Int(1));
    map.insert("f".to_string(), CanonValue::Int(2));
    assert_eq!(canon_str(&CanonValue::Map(map)), "{\"f\":2,\"\u{00e9}\":1}");
}

#[test]
fn duplicate_keys_after_normalization_rejected() {
    let mut map = BTreeMap::new();
    map.insert("e\u{0301}".to_string(), CanonValue::Int(1));
    map.insert("\u{00e9}".to_string(), CanonValue::Int(2));
    let err = encode(&CanonValue::Map(map)).unwrap_err();
    assert!(matches!(err, CanonError::DuplicateKey { .. }));
}

#[test]
fn string_values_are_nfc_normalized() {
    let decomposed = CanonValue::String("e\u{0301}".into());
    let composed = CanonValue::String("\u{00e9}".into());
    assert_eq!(canon_str(&decomposed), canon_str(&composed));
}

// -- JSON conversion ------------------------------------------------------

#[test]
fn json_numbers_convert_exactly() {
    let value: serde_json::Value = serde_json::from_str(r#"{"a":10.50,"b":7,"c":-2}"#).unwrap();
    let canon = to_canon(&value).unwrap();
    assert_eq!(canon_str(&canon), r#"{"a":10.5,"b":7,"c":-2}"#);
}

#[test]
fn exponent_notation_rejected() {
    let value: serde_json::Value = serde_json::from_str("1e3").unwrap();
    let err = to_canon(&value).unwrap_err();
    assert!(matches!(err, CanonError::InvalidNumber { .. }));
}

#[test]
fn huge_magnitude_rejected() {
    let text = format!("{}9", "9".repeat(40));
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert!(to_canon(&value).is_err());
}

#[test]
fn hash_json_is_order_insensitive() {
    let a: serde_json::Value = serde_json::from_str(r#"{"x":1,"y":[1,2]}"#).unwrap();
    let b: serde_json::Value = serde_json::from_str(r#"{"y":[1,2],"x":1}"#).unwrap();
    assert_eq!(hash_json(&a).unwrap(), hash_json(&b).unwrap());
}

#[test]
fn array_order_is_significant() {
    let a: serde_json::Value = serde_json::from_str("[1,2]").unwrap();
    let b: serde_json::Value = serde_json::from_str("[2,1]").unwrap();
    assert_ne!(hash_json(&a).unwrap(), hash_json(&b).unwrap());
}

// -- Roundtrip ------------------------------------------------------------

#[test]
fn parse_roundtrip_is_stable() {
    let source = r#"{"amount":10.5,"tags":["a","b"],"user":"u1","zero":0}"#;
    let once = parse(source).unwrap();
    let encoded = encode(&once).unwrap();
    let twice = parse(std::str::from_utf8(&encoded).unwrap()).unwrap();
    assert_eq!(encode(&twice).unwrap(), encoded);
}

// -- Properties -----------------------------------------------------------

fn arb_canon() -> impl Strategy<Value = CanonValue> {
    let leaf = prop_oneof![
        Just(CanonValue::Null),
        any::<bool>().prop_map(CanonValue::Bool),
        any::<i64>().prop_map(CanonValue::Int),
        "[a-z0-9 /\\-]{0,12}".prop_map(CanonValue::String),
        (-10_000_000i64..10_000_000, 0u32..6).prop_map(|(m, s)| {
            CanonValue::Decimal(Decimal::new(m, s))
        }),
    ];
    leaf.prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(CanonValue::Array),
            prop::collection::btree_map("[a-z]{1,6}", inner, 0..4).prop_map(CanonValue::Map),
        ]
    })
}

proptest! {
    #[test]
    fn encoding_is_deterministic(value in arb_canon()) {
        prop_assert_eq!(encode(&value).unwrap(), encode(&value).unwrap());
    }

    #[test]
    fn encode_parse_encode_is_identity(value in arb_canon()) {
        let first = encode(&value).unwrap();
        let parsed = parse(std::str::from_utf8(&first).unwrap()).unwrap();
        prop_assert_eq!(encode(&parsed).unwrap(), first);
    }
}
