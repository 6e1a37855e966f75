//! Best-effort coercion of loosely typed input to format types.
//!
//! Used on two paths:
//! - [`cast`] turns human-supplied text (UI fields, scripts) into values
//! - [`coerce`] normalizes any [`Value`] to the canonical variant for a unit
//!   before packing, so `"0x10"`, `16` and `16.0` all pack the same way

use super::format::{parse, FormatChar, FormatUnit};
use super::value::Value;
use crate::error::{PcomError, Result};

/// Tokens accepted as boolean true (case-insensitive).
const TRUE_TOKENS: &[&str] = &["true", "1", "yes", "on"];

/// Tokens accepted as boolean false (case-insensitive).
const FALSE_TOKENS: &[&str] = &["false", "0", "no", "off"];

/// Cast textual values according to a format string.
///
/// One token per expanded unit. Integers accept decimal or `0x` hex,
/// booleans accept `true/1/yes` and `false/0/no`, and a flex unit takes a
/// comma-separated list.
///
/// # Example
///
/// ```
/// use pcom_link::codec::{cast, Value};
///
/// let values = cast("H*B", &["0x10", "1, 2, 3"]).unwrap();
/// assert_eq!(values[0], Value::UInt(16));
/// assert_eq!(values[1], Value::from(vec![1u8, 2, 3]));
/// ```
pub fn cast<S: AsRef<str>>(format: &str, tokens: &[S]) -> Result<Vec<Value>> {
    let units = parse(format).map_err(|reason| PcomError::Cast {
        token: format.to_string(),
        reason,
    })?;

    if units.len() != tokens.len() {
        return Err(PcomError::Cast {
            token: tokens
                .iter()
                .map(|t| t.as_ref())
                .collect::<Vec<_>>()
                .join(" "),
            reason: format!(
                "format {format:?} takes {} values, got {}",
                units.len(),
                tokens.len()
            ),
        });
    }

    units
        .iter()
        .zip(tokens)
        .map(|(unit, token)| {
            let token = token.as_ref();
            coerce(*unit, &Value::Str(token.to_string())).map_err(|reason| PcomError::Cast {
                token: token.to_string(),
                reason,
            })
        })
        .collect()
}

/// Coerce a value to the canonical variant for a format unit.
///
/// The error is a bare reason; callers wrap it as a cast, encoding or type
/// mismatch error depending on where the value came from.
pub fn coerce(unit: FormatUnit, value: &Value) -> std::result::Result<Value, String> {
    match unit {
        FormatUnit::Scalar(kind) => coerce_scalar(kind, value),
        FormatUnit::Flex(kind) => {
            let items: Vec<Value> = match value {
                Value::Array(items) => items.clone(),
                Value::Str(text) if kind != FormatChar::Str || text.contains(',') => {
                    split_list(text)
                }
                other => vec![other.clone()],
            };
            if items.len() > usize::from(u16::MAX) {
                return Err(format!("flex array of {} elements is too long", items.len()));
            }
            items
                .iter()
                .map(|item| coerce_scalar(kind, item))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map(Value::Array)
        }
    }
}

fn split_list(text: &str) -> Vec<Value> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    text.split(',')
        .map(|part| Value::Str(part.trim().to_string()))
        .collect()
}

fn coerce_scalar(kind: FormatChar, value: &Value) -> std::result::Result<Value, String> {
    if let Value::Array(_) = value {
        return Err(format!("array given for scalar '{}'", kind.as_char()));
    }

    match kind {
        FormatChar::U8 => unsigned(value, u64::from(u8::MAX)),
        FormatChar::U16 => unsigned(value, u64::from(u16::MAX)),
        FormatChar::U32 => unsigned(value, u64::from(u32::MAX)),
        FormatChar::U64 => unsigned(value, u64::MAX),
        FormatChar::I8 => signed(value, i64::from(i8::MIN), i64::from(i8::MAX)),
        FormatChar::I16 => signed(value, i64::from(i16::MIN), i64::from(i16::MAX)),
        FormatChar::I32 => signed(value, i64::from(i32::MIN), i64::from(i32::MAX)),
        FormatChar::I64 => signed(value, i64::MIN, i64::MAX),
        FormatChar::Pad => Ok(Value::UInt(0)),
        FormatChar::F32 => float(value).and_then(single_precision).map(Value::Float),
        FormatChar::F64 => float(value).map(Value::Float),
        FormatChar::Bool => boolean(value).map(Value::Bool),
        FormatChar::Char => character(value),
        FormatChar::Str => string(value),
    }
}

/// Round to the nearest `f32`, rejecting finite values it cannot hold.
fn single_precision(v: f64) -> std::result::Result<f64, String> {
    let narrowed = v as f32;
    if v.is_finite() && narrowed.is_infinite() {
        return Err(format!("{v} is out of range for 'f'"));
    }
    Ok(f64::from(narrowed))
}

fn unsigned(value: &Value, max: u64) -> std::result::Result<Value, String> {
    let v = match value {
        Value::Str(text) => parse_int(text)
            .and_then(|v| u64::try_from(v).ok())
            .ok_or_else(|| "not an unsigned integer".to_string())?,
        other => other
            .as_u64()
            .ok_or_else(|| format!("{other} is not an unsigned integer"))?,
    };
    if v > max {
        return Err(format!("{v} exceeds maximum {max}"));
    }
    Ok(Value::UInt(v))
}

fn signed(value: &Value, min: i64, max: i64) -> std::result::Result<Value, String> {
    let v = match value {
        Value::Str(text) => parse_int(text)
            .and_then(|v| i64::try_from(v).ok())
            .ok_or_else(|| "not an integer".to_string())?,
        other => other
            .as_i64()
            .ok_or_else(|| format!("{other} is not an integer"))?,
    };
    if v < min || v > max {
        return Err(format!("{v} outside {min}..={max}"));
    }
    Ok(Value::Int(v))
}

/// Parse decimal or `0x`-prefixed hexadecimal text, with optional sign.
fn parse_int(text: &str) -> Option<i128> {
    let text = text.trim();
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let magnitude = match digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        Some(hex) => i128::from_str_radix(hex, 16).ok()?,
        None => digits.parse::<i128>().ok()?,
    };
    Some(if negative { -magnitude } else { magnitude })
}

fn float(value: &Value) -> std::result::Result<f64, String> {
    match value {
        Value::Str(text) => {
            let text = text.trim();
            text.parse::<f64>()
                .ok()
                .or_else(|| parse_int(text).map(|v| v as f64))
                .ok_or_else(|| "not a number".to_string())
        }
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        other => other
            .as_f64()
            .ok_or_else(|| format!("{other} is not a number")),
    }
}

fn boolean(value: &Value) -> std::result::Result<bool, String> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Str(text) => {
            let token = text.trim().to_ascii_lowercase();
            if TRUE_TOKENS.contains(&token.as_str()) {
                Ok(true)
            } else if FALSE_TOKENS.contains(&token.as_str()) {
                Ok(false)
            } else {
                Err("not a boolean".to_string())
            }
        }
        other => other
            .as_i64()
            .map(|v| v != 0)
            .ok_or_else(|| format!("{other} is not a boolean")),
    }
}

fn character(value: &Value) -> std::result::Result<Value, String> {
    let c = match value {
        Value::Str(text) => {
            let text = text.trim();
            let mut chars = text.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => c,
                _ => return Err("expected exactly one character".to_string()),
            }
        }
        other => {
            let code = other
                .as_u64()
                .ok_or_else(|| format!("{other} is not a character"))?;
            u8::try_from(code)
                .map(char::from)
                .map_err(|_| format!("{code} does not fit in one byte"))?
        }
    };
    if u32::from(c) > 0xFF {
        return Err(format!("{c:?} does not fit in one byte"));
    }
    Ok(Value::Str(c.to_string()))
}

fn string(value: &Value) -> std::result::Result<Value, String> {
    let text = match value {
        Value::Str(text) => text.clone(),
        other => other.to_string(),
    };
    if text.contains('\0') {
        return Err("string contains a NUL byte".to_string());
    }
    Ok(Value::Str(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uints(values: &[u64]) -> Vec<Value> {
        values.iter().map(|v| Value::UInt(*v)).collect()
    }

    #[test]
    fn test_cast_repeated_integers() {
        assert_eq!(cast("3H", &["12", "13", "14"]).unwrap(), uints(&[12, 13, 14]));
        let mixed = cast("3H4b", &["1", "0", "1", "2", "2", "2", "2"]).unwrap();
        assert_eq!(mixed[2], Value::UInt(1));
        assert_eq!(mixed[3], Value::Int(2));
    }

    #[test]
    fn test_cast_strings_and_chars() {
        assert_eq!(cast("s", &["hello"]).unwrap(), vec![Value::from("hello")]);
        assert_eq!(
            cast("cI", &["c", "32"]).unwrap(),
            vec![Value::from("c"), Value::UInt(32)]
        );
        assert_eq!(
            cast("2Hs2H", &["0", "0", "hello", "0", "0"]).unwrap()[2],
            Value::from("hello")
        );
    }

    #[test]
    fn test_cast_hex_and_decimal() {
        assert_eq!(cast("B", &["0x10"]).unwrap(), uints(&[16]));
        assert_eq!(cast("h", &["-0x10"]).unwrap(), vec![Value::Int(-16)]);
        assert_eq!(cast("I", &["0000"]).unwrap(), uints(&[0]));
    }

    #[test]
    fn test_cast_flex_lists() {
        assert_eq!(cast("*b", &["32, 45, 55"]).unwrap(), vec![Value::from(vec![32i64, 45, 55])]);
        assert_eq!(cast("*B", &["11"]).unwrap(), vec![Value::from(vec![11u64])]);
        assert_eq!(
            cast("*B", &["0x45,0x78,0x10"]).unwrap(),
            vec![Value::from(vec![0x45u64, 0x78, 0x10])]
        );
        assert_eq!(
            cast("*c", &["a, b"]).unwrap(),
            vec![Value::from(vec!["a", "b"])]
        );
        assert_eq!(
            cast("*s", &["hello,goodbye"]).unwrap(),
            vec![Value::from(vec!["hello", "goodbye"])]
        );
        assert_eq!(
            cast("*f", &["5.5, 7.75"]).unwrap(),
            vec![Value::from(vec![5.5f64, 7.75])]
        );
    }

    #[test]
    fn test_cast_booleans() {
        assert_eq!(
            cast("*?", &["True, False, True"]).unwrap(),
            vec![Value::from(vec![true, false, true])]
        );
        assert_eq!(
            cast("*?", &["1, true, YES"]).unwrap(),
            vec![Value::from(vec![true, true, true])]
        );
        assert_eq!(
            cast("*?", &["no, False, 0"]).unwrap(),
            vec![Value::from(vec![false, false, false])]
        );
        assert_eq!(cast("?", &["1"]).unwrap(), vec![Value::Bool(true)]);
    }

    #[test]
    fn test_cast_error_names_token() {
        match cast("H", &["twelve"]) {
            Err(PcomError::Cast { token, .. }) => assert_eq!(token, "twelve"),
            other => panic!("unexpected {other:?}"),
        }
        match cast("?", &["maybe"]) {
            Err(PcomError::Cast { token, .. }) => assert_eq!(token, "maybe"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_cast_range_and_count_errors() {
        assert!(cast("B", &["256"]).is_err());
        assert!(cast("b", &["-129"]).is_err());
        assert!(cast("H", &["-1"]).is_err());
        assert!(cast("2H", &["1"]).is_err());
        assert!(cast("c", &["ab"]).is_err());
    }

    #[test]
    fn test_coerce_single_precision() {
        let unit = FormatUnit::Scalar(FormatChar::F32);
        assert_eq!(
            coerce(unit, &Value::Float(0.1)).unwrap(),
            Value::Float(f64::from(0.1f32))
        );
        assert_eq!(
            coerce(unit, &Value::Float(f64::from(f32::MAX))).unwrap(),
            Value::Float(f64::from(f32::MAX))
        );
        assert!(coerce(unit, &Value::Float(1e40)).is_err());
        assert!(coerce(unit, &Value::Float(-1e40)).is_err());
        assert!(cast("f", &["1e40"]).is_err());

        let double = FormatUnit::Scalar(FormatChar::F64);
        assert_eq!(coerce(double, &Value::Float(0.1)).unwrap(), Value::Float(0.1));
        assert_eq!(coerce(double, &Value::Float(1e40)).unwrap(), Value::Float(1e40));
    }

    #[test]
    fn test_coerce_numeric_values() {
        let unit = FormatUnit::Scalar(FormatChar::U16);
        assert_eq!(coerce(unit, &Value::Int(7)).unwrap(), Value::UInt(7));
        assert_eq!(coerce(unit, &Value::Float(7.0)).unwrap(), Value::UInt(7));
        assert!(coerce(unit, &Value::Float(7.5)).is_err());
        assert!(coerce(unit, &Value::from(vec![1u8])).is_err());

        let flex = FormatUnit::Flex(FormatChar::U8);
        assert_eq!(
            coerce(flex, &Value::from(vec![1i64, 2])).unwrap(),
            Value::from(vec![1u64, 2])
        );
        assert_eq!(coerce(flex, &Value::from("")).unwrap(), Value::Array(vec![]));
    }
}
