//! Name to wire-id translation.
//!
//! Services may be addressed by a numeric wire id or by a name. Names get an
//! id from the dynamic range the first time they are seen and keep it for
//! the life of the table.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{PcomError, Result};

/// First id handed out to a name.
pub const DYNAMIC_ID_MIN: u16 = 0xFC00;

/// Last id handed out to a name.
pub const DYNAMIC_ID_MAX: u16 = 0xFFFE;

/// Never a valid service id.
pub const INVALID_ID: u16 = 0xFFFF;

/// A service, command, property or stream given by id or by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServiceRef {
    Id(u16),
    Name(String),
}

impl ServiceRef {
    pub fn as_id(&self) -> Option<u16> {
        match self {
            ServiceRef::Id(id) => Some(*id),
            ServiceRef::Name(_) => None,
        }
    }

    pub fn as_name(&self) -> Option<&str> {
        match self {
            ServiceRef::Id(_) => None,
            ServiceRef::Name(name) => Some(name),
        }
    }
}

impl fmt::Display for ServiceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceRef::Id(id) => write!(f, "{id:#06x}"),
            ServiceRef::Name(name) => f.write_str(name),
        }
    }
}

impl From<u16> for ServiceRef {
    fn from(id: u16) -> Self {
        ServiceRef::Id(id)
    }
}

impl From<&str> for ServiceRef {
    fn from(name: &str) -> Self {
        ServiceRef::Name(name.to_string())
    }
}

impl From<String> for ServiceRef {
    fn from(name: String) -> Self {
        ServiceRef::Name(name)
    }
}

/// Bidirectional name ↔ id table.
///
/// Entries are never removed, so an id once issued stays valid.
#[derive(Debug)]
pub struct IdTable {
    by_name: HashMap<String, u16>,
    by_id: HashMap<u16, String>,
    /// Next id to hand out; `u32` so exhaustion past `DYNAMIC_ID_MAX` is
    /// representable.
    next_id: u32,
}

impl IdTable {
    pub fn new() -> Self {
        Self {
            by_name: HashMap::new(),
            by_id: HashMap::new(),
            next_id: u32::from(DYNAMIC_ID_MIN),
        }
    }

    /// Resolve to a wire id, allocating one for a new name.
    ///
    /// # Example
    ///
    /// ```
    /// use pcom_link::ids::{IdTable, ServiceRef, DYNAMIC_ID_MIN};
    ///
    /// let mut table = IdTable::new();
    /// assert_eq!(table.to_id(&ServiceRef::Id(7)).unwrap(), 7);
    /// assert_eq!(table.to_id(&"ui".into()).unwrap(), DYNAMIC_ID_MIN);
    /// assert_eq!(table.to_id(&"ui".into()).unwrap(), DYNAMIC_ID_MIN);
    /// ```
    ///
    /// # Errors
    ///
    /// [`PcomError::IdSpaceExhausted`] when every dynamic id is taken.
    pub fn to_id(&mut self, service: &ServiceRef) -> Result<u16> {
        let name = match service {
            ServiceRef::Id(id) => return Ok(*id),
            ServiceRef::Name(name) => name,
        };
        if let Some(&id) = self.by_name.get(name) {
            return Ok(id);
        }

        let id = u16::try_from(self.next_id)
            .ok()
            .filter(|id| *id <= DYNAMIC_ID_MAX)
            .ok_or_else(|| PcomError::IdSpaceExhausted(name.clone()))?;
        self.next_id += 1;

        self.by_name.insert(name.clone(), id);
        self.by_id.insert(id, name.clone());
        Ok(id)
    }

    /// The name registered for `id`, or the id itself if it was never named.
    pub fn to_name(&self, id: u16) -> ServiceRef {
        match self.by_id.get(&id) {
            Some(name) => ServiceRef::Name(name.clone()),
            None => ServiceRef::Id(id),
        }
    }

    /// Existing id for a name, without allocating.
    pub fn lookup(&self, name: &str) -> Option<u16> {
        self.by_name.get(name).copied()
    }

    /// Number of named entries.
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

impl Default for IdTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_ids_pass_through() {
        let mut table = IdTable::new();
        assert_eq!(table.to_id(&ServiceRef::Id(0x0010)).unwrap(), 0x0010);
        assert_eq!(table.to_name(0x0010), ServiceRef::Id(0x0010));
        assert!(table.is_empty());
    }

    #[test]
    fn test_names_allocated_sequentially_and_stable() {
        let mut table = IdTable::new();
        let a = table.to_id(&"alpha".into()).unwrap();
        let b = table.to_id(&"beta".into()).unwrap();
        assert_eq!(a, DYNAMIC_ID_MIN);
        assert_eq!(b, DYNAMIC_ID_MIN + 1);
        assert_eq!(table.to_id(&"alpha".into()).unwrap(), a);
        assert_eq!(table.to_name(a), ServiceRef::from("alpha"));
        assert_eq!(table.to_name(b), ServiceRef::from("beta"));
        assert_eq!(table.lookup("beta"), Some(b));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_exhaustion_never_wraps() {
        let mut table = IdTable::new();
        let capacity = usize::from(DYNAMIC_ID_MAX - DYNAMIC_ID_MIN) + 1;
        for i in 0..capacity {
            table.to_id(&ServiceRef::Name(format!("svc{i}"))).unwrap();
        }
        assert_eq!(table.lookup(&format!("svc{}", capacity - 1)), Some(DYNAMIC_ID_MAX));

        let err = table.to_id(&"one-too-many".into()).unwrap_err();
        assert!(matches!(err, PcomError::IdSpaceExhausted(name) if name == "one-too-many"));
        assert_eq!(table.to_id(&"svc0".into()).unwrap(), DYNAMIC_ID_MIN);
        assert_ne!(table.to_name(INVALID_ID), ServiceRef::from("one-too-many"));
    }

    #[test]
    fn test_service_ref_json() {
        let refs: Vec<ServiceRef> = serde_json::from_str(r#"[16, "UI"]"#).unwrap();
        assert_eq!(refs, vec![ServiceRef::Id(16), ServiceRef::from("UI")]);
        assert_eq!(ServiceRef::Id(16).to_string(), "0x0010");
    }
}
