//! Codec module - typed payload packing driven by format strings.
//!
//! - [`expand`] - Normalize repeat counts (`"3H"` → `"HHH"`)
//! - [`encode`] / [`decode`] - Pack and unpack [`Value`]s, little-endian
//! - [`cast`] - Coerce textual input (`"0x10"`, `"yes"`, `"1,2,3"`)
//! - [`conform`] - Coerce values to the variants `decode` would yield
//!
//! # Example
//!
//! ```
//! use pcom_link::codec::{cast, decode, encode};
//!
//! let values = cast("Hs", &["0x0102", "hi"]).unwrap();
//! let bytes = encode("Hs", &values).unwrap();
//! assert_eq!(decode("Hs", &bytes).unwrap(), values);
//! ```

mod cast;
mod format;
mod pack;
mod value;

pub use cast::{cast, coerce};
pub use format::{expand, FormatChar, FormatUnit, FLEX_MARKER};
pub use pack::{conform, decode, encode};
pub use value::Value;

pub(crate) use format::parse;
