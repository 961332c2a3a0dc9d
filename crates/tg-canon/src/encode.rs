// SPDX-License-Identifier: MIT OR Apache-2.0

//! Byte-exact canonical encoding and strict parsing.

use std::collections::BTreeMap;

use crate::value::{CanonValue, nfc, to_canon};
use crate::CanonError;

/// Encode a value into its canonical UTF-8 byte sequence.
///
/// Object keys are NFC-normalized and emitted in lexicographic byte order;
/// a key collision after normalization is an error. Arrays keep author
/// order. No whitespace is emitted, numbers carry no exponent and no
/// superfluous zeros, and strings use only the JSON-mandatory escapes
/// (`/` is never escaped).
///
/// # Errors
///
/// [`CanonError::DuplicateKey`] when two keys normalize to the same string.
pub fn encode(value: &CanonValue) -> Result<Vec<u8>, CanonError> {
    let mut out = Vec::with_capacity(128);
    write_value(value, &mut out)?;
    Ok(out)
}

/// Parse canonical text back into a [`CanonValue`].
///
/// Parsing is tolerant of JSON whitespace; byte-exact canonicality of a
/// stored line is asserted by re-encoding and comparing, which the ledger
/// verifier does.
///
/// # Errors
///
/// [`CanonError::Json`] on malformed JSON, plus the [`to_canon`] failure
/// modes for non-canonical numbers or colliding keys.
pub fn parse(text: &str) -> Result<CanonValue, CanonError> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    to_canon(&value)
}

fn write_value(value: &CanonValue, out: &mut Vec<u8>) -> Result<(), CanonError> {
    match value {
        CanonValue::Null => out.extend_from_slice(b"null"),
        CanonValue::Bool(true) => out.extend_from_slice(b"true"),
        CanonValue::Bool(false) => out.extend_from_slice(b"false"),
        CanonValue::Int(i) => out.extend_from_slice(i.to_string().as_bytes()),
        CanonValue::Uint(u) => out.extend_from_slice(u.to_string().as_bytes()),
        CanonValue::Decimal(d) => write_decimal(d, out),
        CanonValue::String(s) => write_string(&nfc(s), out),
        CanonValue::Timestamp(ts) => write_string(&crate::timestamp::format(*ts), out),
        CanonValue::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_value(item, out)?;
            }
            out.push(b']');
        }
        CanonValue::Map(map) => {
            // Re-normalize and re-sort: directly-constructed maps may hold
            // keys whose NFC form sorts differently from the raw form.
            let mut normalized: BTreeMap<String, &CanonValue> = BTreeMap::new();
            for (key, nested) in map {
                let key = nfc(key);
                if normalized.insert(key.clone(), nested).is_some() {
                    return Err(CanonError::DuplicateKey { key });
                }
            }
            out.push(b'{');
            for (i, (key, nested)) in normalized.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_string(key, out);
                out.push(b':');
                write_value(nested, out)?;
            }
            out.push(b'}');
        }
    }
    Ok(())
}

fn write_decimal(d: &rust_decimal::Decimal, out: &mut Vec<u8>) {
    if d.is_zero() {
        out.push(b'0');
        return;
    }
    // normalize() trims trailing fractional zeros; Decimal's Display never
    // emits exponents or a dangling decimal point.
    out.extend_from_slice(d.normalize().to_string().as_bytes());
}

fn write_string(s: &str, out: &mut Vec<u8>) {
    out.push(b'"');
    for ch in s.chars() {
        match ch {
            '"' => out.extend_from_slice(b"\\\""),
            '\\' => out.extend_from_slice(b"\\\\"),
            '\u{0008}' => out.extend_from_slice(b"\\b"),
            '\t' => out.extend_from_slice(b"\\t"),
            '\n' => out.extend_from_slice(b"\\n"),
            '\u{000C}' => out.extend_from_slice(b"\\f"),
            '\r' => out.extend_from_slice(b"\\r"),
            c if (c as u32) < 0x20 => {
                out.extend_from_slice(format!("\\u{:04x}", c as u32).as_bytes());
            }
            c => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
    out.push(b'"');
}
