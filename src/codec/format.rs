//! Format specifier parsing.
//!
//! A format string describes a payload as a sequence of typed units:
//!
//! ```text
//! ┌──────┬─────────────────┬───────┐    ┌──────┬──────────────┬───────┐
//! │ char │ type            │ bytes │    │ char │ type         │ bytes │
//! ├──────┼─────────────────┼───────┤    ├──────┼──────────────┼───────┤
//! │  B   │ unsigned byte   │   1   │    │  I   │ unsigned int │   4   │
//! │  b   │ signed byte     │   1   │    │  i   │ signed int   │   4   │
//! │  x   │ padding         │   1   │    │  Q   │ unsigned long│   8   │
//! │  c   │ character       │   1   │    │  q   │ signed long  │   8   │
//! │  H   │ unsigned short  │   2   │    │  f   │ float        │   4   │
//! │  h   │ signed short    │   2   │    │  d   │ double       │   8   │
//! │  ?   │ bool            │   1   │    │  s   │ NUL string   │   n+1 │
//! └──────┴─────────────────┴───────┘    └──────┴──────────────┴───────┘
//! ```
//!
//! A decimal prefix repeats the next character (`3H` is `HHH`). A `*`
//! prefix turns the next character into a flex unit whose element count
//! travels in the payload.

use crate::error::{PcomError, Result};

/// Marker for a flex unit.
pub const FLEX_MARKER: char = '*';

/// Primitive type named by one format character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormatChar {
    U8,
    I8,
    Pad,
    Char,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
    Str,
    Bool,
}

impl FormatChar {
    /// Look up the type for a format character.
    pub fn from_char(c: char) -> Option<Self> {
        let kind = match c {
            'B' => Self::U8,
            'b' => Self::I8,
            'x' => Self::Pad,
            'c' => Self::Char,
            'H' => Self::U16,
            'h' => Self::I16,
            'I' => Self::U32,
            'i' => Self::I32,
            'Q' => Self::U64,
            'q' => Self::I64,
            'f' => Self::F32,
            'd' => Self::F64,
            's' => Self::Str,
            '?' => Self::Bool,
            _ => return None,
        };
        Some(kind)
    }

    /// The character this type is written as.
    pub fn as_char(self) -> char {
        match self {
            Self::U8 => 'B',
            Self::I8 => 'b',
            Self::Pad => 'x',
            Self::Char => 'c',
            Self::U16 => 'H',
            Self::I16 => 'h',
            Self::U32 => 'I',
            Self::I32 => 'i',
            Self::U64 => 'Q',
            Self::I64 => 'q',
            Self::F32 => 'f',
            Self::F64 => 'd',
            Self::Str => 's',
            Self::Bool => '?',
        }
    }

    /// Packed width in bytes, `None` for NUL-terminated strings.
    pub fn width(self) -> Option<usize> {
        match self {
            Self::U8 | Self::I8 | Self::Pad | Self::Char | Self::Bool => Some(1),
            Self::U16 | Self::I16 => Some(2),
            Self::U32 | Self::I32 | Self::F32 => Some(4),
            Self::U64 | Self::I64 | Self::F64 => Some(8),
            Self::Str => None,
        }
    }
}

/// One expanded unit of a format string, consuming exactly one value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatUnit {
    /// A single value of the given type.
    Scalar(FormatChar),
    /// A counted array of the given element type.
    Flex(FormatChar),
}

impl FormatUnit {
    /// Element type of the unit.
    pub fn element(self) -> FormatChar {
        match self {
            Self::Scalar(c) | Self::Flex(c) => c,
        }
    }

    /// Whether the unit is a flex array.
    pub fn is_flex(self) -> bool {
        matches!(self, Self::Flex(_))
    }
}

/// Expand repeat counts: `"3H"` becomes `"HHH"`.
///
/// Flex segments are kept as `*<char>`; their length is only known once
/// values or bytes are at hand.
///
/// # Example
///
/// ```
/// use pcom_link::codec::expand;
///
/// assert_eq!(expand("3H").unwrap(), "HHH");
/// assert_eq!(expand("2B*H").unwrap(), "BB*H");
/// ```
pub fn expand(format: &str) -> Result<String> {
    let units = parse(format).map_err(PcomError::InvalidFormat)?;
    let mut out = String::with_capacity(units.len());
    for unit in units {
        if unit.is_flex() {
            out.push(FLEX_MARKER);
        }
        out.push(unit.element().as_char());
    }
    Ok(out)
}

/// Parse a format string into expanded units.
///
/// The error is a bare message so callers can wrap it in the error kind
/// that fits their operation.
pub(crate) fn parse(format: &str) -> std::result::Result<Vec<FormatUnit>, String> {
    let mut units = Vec::new();
    let mut count: Option<usize> = None;
    let mut flex = false;

    for c in format.chars() {
        if let Some(digit) = c.to_digit(10) {
            if flex {
                return Err(format!("repeat count after '{FLEX_MARKER}' in {format:?}"));
            }
            let current = count.unwrap_or(0);
            count = Some(
                current
                    .checked_mul(10)
                    .and_then(|n| n.checked_add(digit as usize))
                    .ok_or_else(|| format!("repeat count overflow in {format:?}"))?,
            );
            continue;
        }

        if c == FLEX_MARKER {
            if flex || count.is_some() {
                return Err(format!("misplaced '{FLEX_MARKER}' in {format:?}"));
            }
            flex = true;
            continue;
        }

        let kind = FormatChar::from_char(c)
            .ok_or_else(|| format!("unrecognized format character {c:?}"))?;

        if flex {
            units.push(FormatUnit::Flex(kind));
            flex = false;
        } else {
            let repeat = count.take().unwrap_or(1);
            units.extend(std::iter::repeat(FormatUnit::Scalar(kind)).take(repeat));
        }
        count = None;
    }

    if flex || count.is_some() {
        return Err(format!("format {format:?} ends without a type character"));
    }

    Ok(units)
}
