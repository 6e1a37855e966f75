//! Translation between logical messages and wire records.
//!
//! A [`LogicalMessage`] is what the dispatcher sees: named services, a
//! message kind, and named contents. A [`WireMessage`] is what travels on the
//! link: numeric ids, a type byte, a format string and packed values.
//!
//! Content keys used per kind:
//!
//! | kind              | to wire reads            | from wire fills           |
//! |-------------------|--------------------------|---------------------------|
//! | command           | one key per input param  | input params (or `DATA`)  |
//! | property set      | `VALUE`                  | `VALUE`                   |
//! | stream on         | `RATE` (optional, `f`)   | `RATE`                    |
//! | command response  | `RESULT` or output names | `RESULT` or output names  |
//! | property response | `VALUE` (get only)       | `VALUE` (get only)        |
//! | stream data       | `VALUE`                  | `VALUE`                   |
//! | event / broadcast | `INFO`                   | `INFO`                    |

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::codec::{self, Value};
use crate::error::{PcomError, Result};
use crate::ids::{IdTable, ServiceRef};
use crate::protocol::{Attributes, MessageType, WireMessage};
use crate::registry::{CommandInfo, ServiceRegistry};

/// Content keys.
pub mod keys {
    pub const RESULT: &str = "RESULT";
    pub const VALUE: &str = "VALUE";
    pub const RATE: &str = "RATE";
    pub const INFO: &str = "INFO";
    /// Raw data of an order or response with no registry entry.
    pub const DATA: &str = "DATA";
}

/// What a logical message asks for or reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Command,
    PropertyGet,
    PropertySet,
    StreamOn,
    StreamOff,
    CommandResponse,
    PropertyResponse,
    StreamData,
    Event,
    Broadcast,
}

impl MessageKind {
    /// Orders expect a response from the device.
    pub fn is_order(self) -> bool {
        matches!(
            self,
            Self::Command | Self::PropertyGet | Self::PropertySet | Self::StreamOn | Self::StreamOff
        )
    }
}

/// Outcome carried by responses and notifications.
///
/// Derived from the 16-bit message status: `0` is success,
/// `0x0001..=0x00FF` a recoverable warning, `0x0100` and above an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Status {
    Ok,
    InProgress,
    Warning { code: u16 },
    Error { code: u16, description: String },
}

impl Status {
    /// Lowest status code reported as an error.
    pub const ERROR_MIN: u16 = 0x0100;

    /// Classify a wire status code.
    pub fn from_code(code: u16, in_progress: bool, registry: &ServiceRegistry) -> Self {
        match code {
            0 if in_progress => Status::InProgress,
            0 => Status::Ok,
            c if c < Self::ERROR_MIN => Status::Warning { code: c },
            c => Status::Error {
                code: c,
                description: registry
                    .error_description(c)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("error {c:#06x}")),
            },
        }
    }

    /// Wire status code.
    pub fn code(&self) -> u16 {
        match self {
            Status::Ok | Status::InProgress => 0,
            Status::Warning { code } | Status::Error { code, .. } => *code,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Status::Error { .. })
    }
}

/// A message as the dispatcher sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicalMessage {
    pub msg_id: u16,
    pub destination: ServiceRef,
    pub source: ServiceRef,
    pub kind: MessageKind,
    /// Command, property or stream; the event code for notifications.
    pub name: Option<ServiceRef>,
    pub status: Status,
    pub response_required: bool,
    pub high_priority: bool,
    pub contents: BTreeMap<String, Value>,
    /// Explicit format, overriding the registry.
    pub format: Option<String>,
}

impl LogicalMessage {
    pub fn new(
        kind: MessageKind,
        destination: impl Into<ServiceRef>,
        source: impl Into<ServiceRef>,
        name: Option<ServiceRef>,
    ) -> Self {
        Self {
            msg_id: 0,
            destination: destination.into(),
            source: source.into(),
            kind,
            name,
            status: Status::Ok,
            response_required: kind.is_order(),
            high_priority: false,
            contents: BTreeMap::new(),
            format: None,
        }
    }

    /// A command order; add parameters with [`with_param`](Self::with_param).
    pub fn command(
        destination: impl Into<ServiceRef>,
        source: impl Into<ServiceRef>,
        command: impl Into<ServiceRef>,
    ) -> Self {
        Self::new(MessageKind::Command, destination, source, Some(command.into()))
    }

    pub fn property_get(
        destination: impl Into<ServiceRef>,
        source: impl Into<ServiceRef>,
        property: impl Into<ServiceRef>,
    ) -> Self {
        Self::new(MessageKind::PropertyGet, destination, source, Some(property.into()))
    }

    pub fn property_set(
        destination: impl Into<ServiceRef>,
        source: impl Into<ServiceRef>,
        property: impl Into<ServiceRef>,
        value: impl Into<Value>,
    ) -> Self {
        Self::new(MessageKind::PropertySet, destination, source, Some(property.into()))
            .with_param(keys::VALUE, value)
    }

    pub fn stream_on(
        destination: impl Into<ServiceRef>,
        source: impl Into<ServiceRef>,
        stream: impl Into<ServiceRef>,
        rate: Option<f64>,
    ) -> Self {
        let msg = Self::new(MessageKind::StreamOn, destination, source, Some(stream.into()));
        match rate {
            Some(rate) => msg.with_param(keys::RATE, rate),
            None => msg,
        }
    }

    pub fn stream_off(
        destination: impl Into<ServiceRef>,
        source: impl Into<ServiceRef>,
        stream: impl Into<ServiceRef>,
    ) -> Self {
        Self::new(MessageKind::StreamOff, destination, source, Some(stream.into()))
    }

    pub fn with_param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.contents.insert(key.to_string(), value.into());
        self
    }

    pub fn with_msg_id(mut self, msg_id: u16) -> Self {
        self.msg_id = msg_id;
        self
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    pub fn with_priority(mut self, high_priority: bool) -> Self {
        self.high_priority = high_priority;
        self
    }

    pub fn with_response_required(mut self, response_required: bool) -> Self {
        self.response_required = response_required;
        self
    }

    pub fn with_format(mut self, format: &str) -> Self {
        self.format = Some(format.to_string());
        self
    }

    /// Content value by key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.contents.get(key)
    }
}

/// Converts between [`LogicalMessage`] and [`WireMessage`].
///
/// Owns the [`IdTable`]; all name allocation goes through one translator,
/// so a name never receives two ids.
#[derive(Debug, Default)]
pub struct Translator {
    ids: IdTable,
}

impl Translator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing id table.
    pub fn with_ids(ids: IdTable) -> Self {
        Self { ids }
    }

    pub fn ids(&self) -> &IdTable {
        &self.ids
    }

    /// Build the wire record for a logical message.
    ///
    /// # Errors
    ///
    /// - [`PcomError::UnknownTarget`] if the destination has no entry for
    ///   the named command, property or stream
    /// - [`PcomError::TypeMismatch`] if a parameter is missing or does not
    ///   fit the registered format
    /// - [`PcomError::IdSpaceExhausted`] if a new name cannot get an id
    pub fn to_wire(
        &mut self,
        msg: &LogicalMessage,
        registry: &ServiceRegistry,
    ) -> Result<WireMessage> {
        let to = self.ids.to_id(&msg.destination)?;
        let from = self.ids.to_id(&msg.source)?;

        let unknown = || PcomError::UnknownTarget {
            destination: msg.destination.to_string(),
            name: msg
                .name
                .as_ref()
                .map_or_else(|| "<unnamed>".to_string(), ToString::to_string),
        };
        let missing =
            |key: &str| PcomError::TypeMismatch(format!("{:?} message has no {key}", msg.kind));
        let name = msg.name.as_ref();
        let explicit = msg.format.as_deref();

        let (message_type, response_code, format, data) = match msg.kind {
            MessageKind::Command => {
                let name = name.ok_or_else(unknown)?;
                match registry.command(to, name) {
                    Some(cmd) => {
                        let data = cmd
                            .input_params
                            .iter()
                            .map(|param| {
                                msg.get(param).cloned().ok_or_else(|| {
                                    PcomError::TypeMismatch(format!(
                                        "command {} is missing parameter {param:?}",
                                        cmd.name
                                    ))
                                })
                            })
                            .collect::<Result<Vec<_>>>()?;
                        let format = explicit.unwrap_or(&cmd.format).to_string();
                        (MessageType::Command, cmd.id, format, data)
                    }
                    None => {
                        // Unregistered numeric commands (discovery) pass through.
                        let id = name.as_id().ok_or_else(unknown)?;
                        let only_data = msg.contents.keys().all(|k| k == keys::DATA);
                        if !only_data {
                            return Err(unknown());
                        }
                        let format = explicit.unwrap_or("").to_string();
                        let data = match msg.get(keys::DATA) {
                            Some(value) => spread(&format, value),
                            None => Vec::new(),
                        };
                        (MessageType::Command, id, format, data)
                    }
                }
            }
            MessageKind::PropertyGet => {
                let name = name.ok_or_else(unknown)?;
                let id = registry
                    .property(to, name)
                    .map(|p| p.id)
                    .or_else(|| name.as_id())
                    .ok_or_else(unknown)?;
                (MessageType::PropertyGet, id, String::new(), Vec::new())
            }
            MessageKind::PropertySet => {
                let name = name.ok_or_else(unknown)?;
                let prop = registry.property(to, name).ok_or_else(unknown)?;
                let value = msg.get(keys::VALUE).ok_or_else(|| missing(keys::VALUE))?;
                let format = explicit.unwrap_or(&prop.format).to_string();
                let data = spread(&format, value);
                (MessageType::PropertySet, prop.id, format, data)
            }
            MessageKind::StreamOn | MessageKind::StreamOff => {
                let name = name.ok_or_else(unknown)?;
                let id = registry
                    .stream(to, name)
                    .map(|s| s.id)
                    .or_else(|| name.as_id())
                    .ok_or_else(unknown)?;
                match (msg.kind, msg.get(keys::RATE)) {
                    (MessageKind::StreamOn, Some(rate)) => {
                        (MessageType::StreamOn, id, "f".to_string(), vec![rate.clone()])
                    }
                    (MessageKind::StreamOn, None) => {
                        (MessageType::StreamOn, id, String::new(), Vec::new())
                    }
                    _ => (MessageType::StreamOff, id, String::new(), Vec::new()),
                }
            }
            MessageKind::CommandResponse => {
                let name = name.ok_or_else(unknown)?;
                let cmd = registry.command(from, name);
                let id = cmd.map(|c| c.id).or_else(|| name.as_id()).ok_or_else(unknown)?;
                let format = explicit
                    .or(cmd.map(|c| c.output_format.as_str()))
                    .unwrap_or("")
                    .to_string();
                let data = response_data(msg, cmd, &format);
                let message_type = if msg.status == Status::InProgress {
                    MessageType::CommandInProgress
                } else {
                    MessageType::CommandComplete
                };
                (message_type, id, format, data)
            }
            MessageKind::PropertyResponse => {
                let name = name.ok_or_else(unknown)?;
                let prop = registry.property(from, name);
                let id = prop.map(|p| p.id).or_else(|| name.as_id()).ok_or_else(unknown)?;
                match msg.get(keys::VALUE) {
                    Some(value) => {
                        let format = explicit
                            .or(prop.map(|p| p.format.as_str()))
                            .ok_or_else(unknown)?
                            .to_string();
                        let data = spread(&format, value);
                        (MessageType::PropertyGetResponse, id, format, data)
                    }
                    None => (MessageType::PropertySetResponse, id, String::new(), Vec::new()),
                }
            }
            MessageKind::StreamData => {
                let name = name.ok_or_else(unknown)?;
                let stream = registry.stream(from, name);
                let id = stream.map(|s| s.id).or_else(|| name.as_id()).ok_or_else(unknown)?;
                let format = explicit
                    .or(stream.map(|s| s.format.as_str()))
                    .ok_or_else(unknown)?
                    .to_string();
                let value = msg.get(keys::VALUE).ok_or_else(|| missing(keys::VALUE))?;
                let data = spread(&format, value);
                (MessageType::StreamValue, id, format, data)
            }
            MessageKind::Event | MessageKind::Broadcast => {
                let code = match name {
                    Some(name) => name.as_id().ok_or_else(unknown)?,
                    None => 0,
                };
                let format = explicit.unwrap_or("").to_string();
                let data = match msg.get(keys::INFO) {
                    Some(Value::Array(items)) => items.clone(),
                    Some(other) => vec![other.clone()],
                    None => Vec::new(),
                };
                let message_type = if msg.kind == MessageKind::Event {
                    MessageType::Event
                } else {
                    MessageType::BroadcastExternal
                };
                (message_type, code, format, data)
            }
        };

        let data = codec::conform(&format, &data)?;

        Ok(WireMessage {
            msg_id: msg.msg_id,
            from,
            to,
            response_code,
            msg_status: msg.status.code(),
            message_type,
            attributes: Attributes {
                high_priority: msg.high_priority,
                response_required: msg.response_required,
            },
            format,
            data,
        })
    }

    /// Rebuild the logical message for a received wire record.
    ///
    /// Never fails: ids without a name or registry entry stay numeric.
    pub fn from_wire(&self, wire: &WireMessage, registry: &ServiceRegistry) -> LogicalMessage {
        let code = wire.response_code;
        let id = ServiceRef::Id(code);
        let named = |name: Option<&str>| Some(name.map_or(ServiceRef::Id(code), ServiceRef::from));

        let mut contents = BTreeMap::new();
        let mut status = Status::Ok;

        let (kind, name) = match wire.message_type {
            MessageType::Command | MessageType::CommandSpecial => {
                let cmd = registry.command(wire.to, &id);
                match cmd {
                    Some(cmd) if cmd.input_params.len() == wire.data.len() => {
                        let params = cmd.input_params.iter().cloned();
                        contents.extend(params.zip(wire.data.iter().cloned()));
                    }
                    _ if !wire.data.is_empty() => {
                        contents.insert(keys::DATA.to_string(), Value::Array(wire.data.clone()));
                    }
                    _ => {}
                }
                (MessageKind::Command, named(cmd.map(|c| c.name.as_str())))
            }
            MessageType::PropertyGet | MessageType::PropertySet => {
                let prop = registry.property(wire.to, &id);
                let kind = if wire.message_type == MessageType::PropertySet {
                    insert_value(&mut contents, keys::VALUE, &wire.data);
                    MessageKind::PropertySet
                } else {
                    MessageKind::PropertyGet
                };
                (kind, named(prop.map(|p| p.name.as_str())))
            }
            MessageType::StreamOn | MessageType::StreamOff => {
                let stream = registry.stream(wire.to, &id);
                let kind = if wire.message_type == MessageType::StreamOn {
                    if let [rate] = wire.data.as_slice() {
                        contents.insert(keys::RATE.to_string(), rate.clone());
                    }
                    MessageKind::StreamOn
                } else {
                    MessageKind::StreamOff
                };
                (kind, named(stream.map(|s| s.name.as_str())))
            }
            MessageType::CommandComplete | MessageType::CommandInProgress => {
                let cmd = registry.command(wire.from, &id);
                status = Status::from_code(
                    wire.msg_status,
                    wire.message_type == MessageType::CommandInProgress,
                    registry,
                );
                if status.is_error() {
                    insert_info(&mut contents, &wire.data);
                } else {
                    result_contents(&mut contents, cmd, &wire.data);
                }
                (MessageKind::CommandResponse, named(cmd.map(|c| c.name.as_str())))
            }
            MessageType::PropertyGetResponse | MessageType::PropertySetResponse => {
                let prop = registry.property(wire.from, &id);
                status = Status::from_code(wire.msg_status, false, registry);
                if status.is_error() {
                    insert_info(&mut contents, &wire.data);
                } else if wire.message_type == MessageType::PropertyGetResponse {
                    insert_value(&mut contents, keys::VALUE, &wire.data);
                }
                (MessageKind::PropertyResponse, named(prop.map(|p| p.name.as_str())))
            }
            MessageType::StreamValue => {
                let stream = registry.stream(wire.from, &id);
                insert_value(&mut contents, keys::VALUE, &wire.data);
                (MessageKind::StreamData, named(stream.map(|s| s.name.as_str())))
            }
            MessageType::Event
            | MessageType::BroadcastInternal
            | MessageType::BroadcastExternal => {
                status = Status::from_code(wire.msg_status, false, registry);
                insert_info(&mut contents, &wire.data);
                let kind = if wire.message_type == MessageType::Event {
                    MessageKind::Event
                } else {
                    MessageKind::Broadcast
                };
                (kind, Some(id.clone()))
            }
        };

        LogicalMessage {
            msg_id: wire.msg_id,
            destination: self.ids.to_name(wire.to),
            source: self.ids.to_name(wire.from),
            kind,
            name,
            status,
            response_required: wire.attributes.response_required,
            high_priority: wire.attributes.high_priority,
            contents,
            format: Some(wire.format.clone()),
        }
    }
}

/// Values for `format` from one content value: a single-unit format takes
/// the value as is, a multi-unit format takes an array element-wise.
fn spread(format: &str, value: &Value) -> Vec<Value> {
    let single = codec::parse(format).map_or(true, |units| units.len() == 1);
    match value {
        Value::Array(items) if !single => items.clone(),
        other => vec![other.clone()],
    }
}

/// Data for an outbound command response.
fn response_data(msg: &LogicalMessage, cmd: Option<&CommandInfo>, format: &str) -> Vec<Value> {
    if let Some(result) = msg.get(keys::RESULT) {
        return spread(format, result);
    }
    if let Some(cmd) = cmd {
        let outputs: Option<Vec<Value>> =
            cmd.output_params.iter().map(|p| msg.get(p).cloned()).collect();
        if let Some(outputs) = outputs.filter(|o| !o.is_empty()) {
            return outputs;
        }
    }
    match msg.get(keys::INFO).or_else(|| msg.get(keys::DATA)) {
        Some(Value::Array(items)) => items.clone(),
        Some(other) => vec![other.clone()],
        None => Vec::new(),
    }
}

fn single_or_array(data: &[Value]) -> Value {
    match data {
        [single] => single.clone(),
        many => Value::Array(many.to_vec()),
    }
}

fn insert_value(contents: &mut BTreeMap<String, Value>, key: &str, data: &[Value]) {
    if !data.is_empty() {
        contents.insert(key.to_string(), single_or_array(data));
    }
}

fn insert_info(contents: &mut BTreeMap<String, Value>, data: &[Value]) {
    if !data.is_empty() {
        contents.insert(keys::INFO.to_string(), Value::Array(data.to_vec()));
    }
}

/// Map response data onto the command's declared outputs.
///
/// A single output, or a first output that is a flex array, yields
/// `RESULT`; matching counts zip names with values; anything else falls
/// back to `RESULT` holding all data.
fn result_contents(
    contents: &mut BTreeMap<String, Value>,
    cmd: Option<&CommandInfo>,
    data: &[Value],
) {
    if data.is_empty() {
        return;
    }
    let outputs = cmd.map(|c| c.output_params.as_slice()).unwrap_or(&[]);
    let first_is_flex = cmd
        .and_then(|c| codec::parse(&c.output_format).ok())
        .and_then(|units| units.first().copied())
        .map_or(false, |unit| unit.is_flex());

    if outputs.len() == 1 || first_is_flex {
        contents.insert(keys::RESULT.to_string(), single_or_array(data));
    } else if !outputs.is_empty() && outputs.len() == data.len() {
        contents.extend(outputs.iter().cloned().zip(data.iter().cloned()));
    } else {
        if !outputs.is_empty() {
            warn!(
                outputs = outputs.len(),
                values = data.len(),
                "Response data does not match declared outputs"
            );
        }
        contents.insert(keys::RESULT.to_string(), single_or_array(data));
    }
}
