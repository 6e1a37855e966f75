//! Service registry: what each device item understands.
//!
//! The registry holds the discovered command, property and stream tables
//! per item id, plus error-code descriptions. It is filled by whoever runs
//! discovery (or loaded from a saved cache) and read by the
//! [`Translator`](crate::translate::Translator) to find formats.
//!
//! # Example
//!
//! ```
//! use pcom_link::registry::{CommandInfo, ServiceRegistry};
//!
//! let mut registry = ServiceRegistry::new();
//! registry.register_item(0x0100, "motor");
//! registry.register_command(0x0100, CommandInfo {
//!     id: 3,
//!     name: "move".into(),
//!     format: "i".into(),
//!     input_params: vec!["steps".into()],
//!     output_params: vec!["position".into()],
//!     output_format: "i".into(),
//! });
//!
//! let cmd = registry.command(0x0100, &"move".into()).unwrap();
//! assert_eq!(cmd.id, 3);
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ids::ServiceRef;

/// A command an item accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandInfo {
    pub id: u16,
    pub name: String,
    /// Format of the input parameters, in `input_params` order.
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub input_params: Vec<String>,
    #[serde(default)]
    pub output_params: Vec<String>,
    /// Format of the response data.
    #[serde(default)]
    pub output_format: String,
}

/// A readable/writable property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyInfo {
    pub id: u16,
    pub name: String,
    pub format: String,
}

/// A data stream an item can publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub id: u16,
    pub name: String,
    pub format: String,
}

/// Everything known about one item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemEntry {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub commands: BTreeMap<u16, CommandInfo>,
    #[serde(default)]
    pub properties: BTreeMap<u16, PropertyInfo>,
    #[serde(default)]
    pub streams: BTreeMap<u16, StreamInfo>,
}

/// Per-item command/property/stream tables and error descriptions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRegistry {
    #[serde(default)]
    items: BTreeMap<u16, ItemEntry>,
    #[serde(default)]
    error_codes: BTreeMap<u16, String>,
}

/// Find an entry by id or, for names, by a linear scan of the table.
fn find<'a, T>(
    table: &'a BTreeMap<u16, T>,
    target: &ServiceRef,
    name_of: impl Fn(&T) -> &str,
) -> Option<&'a T> {
    match target {
        ServiceRef::Id(id) => table.get(id),
        ServiceRef::Name(name) => table.values().find(|entry| name_of(entry) == name.as_str()),
    }
}

impl ServiceRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an item and its display name.
    pub fn register_item(&mut self, item: u16, name: &str) {
        self.items.entry(item).or_default().name = name.to_string();
    }

    /// Add or replace a command of `item`.
    pub fn register_command(&mut self, item: u16, info: CommandInfo) {
        self.items.entry(item).or_default().commands.insert(info.id, info);
    }

    /// Add or replace a property of `item`.
    pub fn register_property(&mut self, item: u16, info: PropertyInfo) {
        self.items.entry(item).or_default().properties.insert(info.id, info);
    }

    /// Add or replace a stream of `item`.
    pub fn register_stream(&mut self, item: u16, info: StreamInfo) {
        self.items.entry(item).or_default().streams.insert(info.id, info);
    }

    /// Add or replace the description of an error status.
    pub fn register_error_code(&mut self, code: u16, description: &str) {
        self.error_codes.insert(code, description.to_string());
    }

    pub fn item(&self, item: u16) -> Option<&ItemEntry> {
        self.items.get(&item)
    }

    pub fn item_name(&self, item: u16) -> Option<&str> {
        self.items
            .get(&item)
            .map(|entry| entry.name.as_str())
            .filter(|name| !name.is_empty())
    }

    pub fn command(&self, item: u16, command: &ServiceRef) -> Option<&CommandInfo> {
        find(&self.items.get(&item)?.commands, command, |c| c.name.as_str())
    }

    pub fn property(&self, item: u16, property: &ServiceRef) -> Option<&PropertyInfo> {
        find(&self.items.get(&item)?.properties, property, |p| p.name.as_str())
    }

    pub fn stream(&self, item: u16, stream: &ServiceRef) -> Option<&StreamInfo> {
        find(&self.items.get(&item)?.streams, stream, |s| s.name.as_str())
    }

    pub fn error_description(&self, code: u16) -> Option<&str> {
        self.error_codes.get(&code).map(String::as_str)
    }

    /// Number of known items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Load a registry saved with [`to_json`](Self::to_json).
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize the registry as pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn motor_registry() -> ServiceRegistry {
        let mut registry = ServiceRegistry::new();
        registry.register_item(0x0100, "motor");
        registry.register_command(
            0x0100,
            CommandInfo {
                id: 1,
                name: "home".into(),
                format: String::new(),
                input_params: vec![],
                output_params: vec![],
                output_format: String::new(),
            },
        );
        registry.register_command(
            0x0100,
            CommandInfo {
                id: 2,
                name: "move".into(),
                format: "iH".into(),
                input_params: vec!["steps".into(), "speed".into()],
                output_params: vec!["position".into()],
                output_format: "i".into(),
            },
        );
        registry.register_property(
            0x0100,
            PropertyInfo { id: 5, name: "current".into(), format: "f".into() },
        );
        registry.register_stream(
            0x0100,
            StreamInfo { id: 9, name: "position".into(), format: "i".into() },
        );
        registry.register_error_code(0x0101, "motor stalled");
        registry
    }

    #[test]
    fn test_lookup_by_id_and_name() {
        let registry = motor_registry();
        assert_eq!(registry.command(0x0100, &ServiceRef::Id(2)).unwrap().name, "move");
        assert_eq!(registry.command(0x0100, &"home".into()).unwrap().id, 1);
        assert_eq!(registry.property(0x0100, &"current".into()).unwrap().format, "f");
        assert_eq!(registry.stream(0x0100, &ServiceRef::Id(9)).unwrap().name, "position");
    }

    #[test]
    fn test_unknown_lookups() {
        let registry = motor_registry();
        assert!(registry.command(0x0100, &"jump".into()).is_none());
        assert!(registry.command(0x0200, &ServiceRef::Id(1)).is_none());
        assert!(registry.property(0x0100, &ServiceRef::Id(6)).is_none());
        assert_eq!(registry.item_name(0x0200), None);
    }

    #[test]
    fn test_item_name_and_errors() {
        let registry = motor_registry();
        assert_eq!(registry.item_name(0x0100), Some("motor"));
        assert_eq!(registry.error_description(0x0101), Some("motor stalled"));
        assert_eq!(registry.error_description(0x0102), None);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_replaces_same_id() {
        let mut registry = motor_registry();
        registry.register_property(
            0x0100,
            PropertyInfo { id: 5, name: "current".into(), format: "d".into() },
        );
        assert_eq!(registry.property(0x0100, &ServiceRef::Id(5)).unwrap().format, "d");
    }

    #[test]
    fn test_json_cache_roundtrip() {
        let registry = motor_registry();
        let json = registry.to_json().unwrap();
        assert_eq!(ServiceRegistry::from_json(&json).unwrap(), registry);
    }

    #[test]
    fn test_from_json_defaults_missing_fields() {
        let json = r#"{
            "items": {
                "16": {
                    "name": "pump",
                    "commands": { "4": { "id": 4, "name": "prime" } }
                }
            }
        }"#;
        let registry = ServiceRegistry::from_json(json).unwrap();
        let prime = registry.command(16, &"prime".into()).unwrap();
        assert_eq!(prime.format, "");
        assert!(prime.input_params.is_empty());
        assert!(registry.error_description(1).is_none());
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(matches!(
            ServiceRegistry::from_json("{ not json"),
            Err(crate::error::PcomError::Json(_))
        ));
    }
}
