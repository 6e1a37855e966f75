//! Binary packing of values according to a format string.
//!
//! All multi-byte quantities are little-endian. Strings are written as their
//! bytes followed by a single NUL. A flex unit is a `u16` element count
//! followed by that many elements.
//!
//! ```text
//! format "H*Bs", values [0x1234, [7, 8], "ok"]
//!
//! ┌───────┬───────┬─────┬─────┬─────┬─────┬─────┐
//! │ 34 12 │ 02 00 │ 07  │ 08  │ 'o' │ 'k' │ 00  │
//! └───────┴───────┴─────┴─────┴─────┴─────┴─────┘
//!    H      count   *B elements    s (NUL-terminated)
//! ```

use bytes::{Buf, BufMut, BytesMut};

use super::cast::coerce;
use super::format::{parse, FormatChar, FormatUnit};
use super::value::Value;
use crate::error::{PcomError, Result};

/// Pack values into bytes according to `format`.
///
/// Values are coerced first, so `Value::Str("0x10")` packs like
/// `Value::UInt(16)` for an integer unit.
///
/// # Example
///
/// ```
/// use pcom_link::codec::{encode, Value};
///
/// let bytes = encode("Hs", &[Value::from(0x0102u16), Value::from("hi")]).unwrap();
/// assert_eq!(bytes, [0x02, 0x01, b'h', b'i', 0x00]);
/// ```
pub fn encode(format: &str, values: &[Value]) -> Result<Vec<u8>> {
    let canonical = conform_with(format, values, PcomError::Encoding)?;
    let units = parse(format).map_err(PcomError::Encoding)?;

    let mut buf = BytesMut::new();
    for (unit, value) in units.iter().zip(&canonical) {
        match (unit, value) {
            (FormatUnit::Flex(kind), Value::Array(items)) => {
                // Length was bounded to u16 during coercion.
                buf.put_u16_le(items.len() as u16);
                for item in items {
                    put_scalar(&mut buf, *kind, item)?;
                }
            }
            (FormatUnit::Scalar(kind), value) => put_scalar(&mut buf, *kind, value)?,
            (FormatUnit::Flex(_), other) => {
                return Err(PcomError::Encoding(format!("flex unit needs an array, got {other}")));
            }
        }
    }
    Ok(buf.to_vec())
}

/// Unpack bytes into values according to `format`.
///
/// The whole input must be consumed; leftover bytes are an error.
pub fn decode(format: &str, data: &[u8]) -> Result<Vec<Value>> {
    let units = parse(format).map_err(PcomError::Decoding)?;
    let mut cursor = data;
    let mut values = Vec::with_capacity(units.len());

    for unit in units {
        let value = match unit {
            FormatUnit::Scalar(kind) => get_scalar(&mut cursor, kind)?,
            FormatUnit::Flex(kind) => {
                need(&cursor, 2, "flex count")?;
                let count = cursor.get_u16_le();
                let mut items = Vec::with_capacity(usize::from(count).min(cursor.len()));
                for _ in 0..count {
                    items.push(get_scalar(&mut cursor, kind)?);
                }
                Value::Array(items)
            }
        };
        values.push(value);
    }

    if !cursor.is_empty() {
        return Err(PcomError::Decoding(format!(
            "{} trailing bytes after format {format:?}",
            cursor.len()
        )));
    }
    Ok(values)
}

/// Coerce values to the canonical variants `decode` would produce for
/// `format`, without packing them.
pub fn conform(format: &str, values: &[Value]) -> Result<Vec<Value>> {
    conform_with(format, values, PcomError::TypeMismatch)
}

fn conform_with(
    format: &str,
    values: &[Value],
    wrap: fn(String) -> PcomError,
) -> Result<Vec<Value>> {
    let units = parse(format).map_err(PcomError::InvalidFormat)?;
    if units.len() != values.len() {
        return Err(wrap(format!(
            "format {format:?} takes {} values, got {}",
            units.len(),
            values.len()
        )));
    }
    units
        .iter()
        .zip(values)
        .enumerate()
        .map(|(i, (unit, value))| {
            coerce(*unit, value).map_err(|reason| wrap(format!("value {i} ({value}): {reason}")))
        })
        .collect()
}

fn put_scalar(buf: &mut BytesMut, kind: FormatChar, value: &Value) -> Result<()> {
    let mismatch = || PcomError::Encoding(format!("cannot pack {value} as '{}'", kind.as_char()));

    match kind {
        FormatChar::Pad => buf.put_u8(0),
        FormatChar::U8 => buf.put_u8(value.as_u64().ok_or_else(mismatch)? as u8),
        FormatChar::U16 => buf.put_u16_le(value.as_u64().ok_or_else(mismatch)? as u16),
        FormatChar::U32 => buf.put_u32_le(value.as_u64().ok_or_else(mismatch)? as u32),
        FormatChar::U64 => buf.put_u64_le(value.as_u64().ok_or_else(mismatch)?),
        FormatChar::I8 => buf.put_i8(value.as_i64().ok_or_else(mismatch)? as i8),
        FormatChar::I16 => buf.put_i16_le(value.as_i64().ok_or_else(mismatch)? as i16),
        FormatChar::I32 => buf.put_i32_le(value.as_i64().ok_or_else(mismatch)? as i32),
        FormatChar::I64 => buf.put_i64_le(value.as_i64().ok_or_else(mismatch)?),
        FormatChar::F32 => buf.put_f32_le(value.as_f64().ok_or_else(mismatch)? as f32),
        FormatChar::F64 => buf.put_f64_le(value.as_f64().ok_or_else(mismatch)?),
        FormatChar::Bool => match value {
            Value::Bool(b) => buf.put_u8(u8::from(*b)),
            _ => return Err(mismatch()),
        },
        FormatChar::Char => {
            let c = value
                .as_str()
                .and_then(|s| s.chars().next())
                .ok_or_else(mismatch)?;
            buf.put_u8(u8::try_from(u32::from(c)).map_err(|_| mismatch())?);
        }
        FormatChar::Str => {
            let text = value.as_str().ok_or_else(mismatch)?;
            buf.put_slice(text.as_bytes());
            buf.put_u8(0);
        }
    }
    Ok(())
}

fn need(cursor: &&[u8], n: usize, what: &str) -> Result<()> {
    if cursor.remaining() < n {
        return Err(PcomError::Decoding(format!(
            "truncated {what}: need {n} bytes, have {}",
            cursor.remaining()
        )));
    }
    Ok(())
}

fn get_scalar(cursor: &mut &[u8], kind: FormatChar) -> Result<Value> {
    if let Some(width) = kind.width() {
        need(cursor, width, &format!("'{}'", kind.as_char()))?;
    }

    let value = match kind {
        FormatChar::Pad => {
            cursor.advance(1);
            Value::UInt(0)
        }
        FormatChar::U8 => Value::UInt(u64::from(cursor.get_u8())),
        FormatChar::U16 => Value::UInt(u64::from(cursor.get_u16_le())),
        FormatChar::U32 => Value::UInt(u64::from(cursor.get_u32_le())),
        FormatChar::U64 => Value::UInt(cursor.get_u64_le()),
        FormatChar::I8 => Value::Int(i64::from(cursor.get_i8())),
        FormatChar::I16 => Value::Int(i64::from(cursor.get_i16_le())),
        FormatChar::I32 => Value::Int(i64::from(cursor.get_i32_le())),
        FormatChar::I64 => Value::Int(cursor.get_i64_le()),
        FormatChar::F32 => Value::Float(f64::from(cursor.get_f32_le())),
        FormatChar::F64 => Value::Float(cursor.get_f64_le()),
        FormatChar::Bool => Value::Bool(cursor.get_u8() != 0),
        FormatChar::Char => Value::Str(char::from(cursor.get_u8()).to_string()),
        FormatChar::Str => {
            let end = cursor
                .iter()
                .position(|&b| b == 0)
                .ok_or_else(|| PcomError::Decoding("unterminated string".to_string()))?;
            let text = std::str::from_utf8(&cursor[..end])
                .map_err(|e| PcomError::Decoding(format!("string is not UTF-8: {e}")))?
                .to_string();
            cursor.advance(end + 1);
            Value::Str(text)
        }
    };
    Ok(value)
}
