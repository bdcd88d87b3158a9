//! Events and event descriptors.

use rstchart_value::{DataObject, DataValue};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Raised when a state's final child is entered: `done.state.<id>`.
pub const DONE_STATE_PREFIX: &str = "done.state.";
/// Sent to the parent when an invoked child completes: `done.invoke.<id>`.
pub const DONE_INVOKE_PREFIX: &str = "done.invoke.";
pub const ERROR_EXECUTION: &str = "error.execution";
pub const ERROR_COMMUNICATION: &str = "error.communication";
pub const ERROR_PLATFORM: &str = "error.platform";

/// A dot separated event name such as `done.state.main`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub struct EventName {
    name: String,
}

impl EventName {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }

    pub fn parts(&self) -> impl Iterator<Item = &str> {
        self.name.split('.')
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl From<String> for EventName {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for EventName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<EventName> for String {
    fn from(e: EventName) -> Self {
        e.name
    }
}

/// One token of a transition's `event` attribute.
///
/// `*` matches every event. Otherwise the descriptor matches an event whose
/// name parts start with the descriptor's parts, so `error` matches
/// `error.execution`. A trailing `.*` is ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDescriptor {
    parts: Vec<String>,
    any: bool,
}

impl EventDescriptor {
    pub fn parse(token: &str) -> Self {
        let token = token.trim();
        if token == "*" {
            return Self {
                parts: Vec::new(),
                any: true,
            };
        }
        let token = token.strip_suffix(".*").unwrap_or(token);
        let token = token.strip_suffix('.').unwrap_or(token);
        Self {
            parts: token.split('.').map(str::to_string).collect(),
            any: false,
        }
    }

    pub fn matches(&self, name: &EventName) -> bool {
        if self.any {
            return true;
        }
        let mut event_parts = name.parts();
        self.parts
            .iter()
            .all(|part| event_parts.next() == Some(part.as_str()))
    }
}

impl fmt::Display for EventDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.any {
            f.write_str("*")
        } else {
            f.write_str(&self.parts.join("."))
        }
    }
}

/// Where an event came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    /// Raised by the platform (done events, errors).
    Platform,
    /// Raised by executable content of the same session.
    Internal,
    /// Delivered through the external queue.
    #[default]
    External,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Platform => "platform",
            EventType::Internal => "internal",
            EventType::External => "external",
        }
    }
}

/// An event with its correlation ids and payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: EventName,
    #[serde(rename = "type")]
    pub kind: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoke_id: Option<String>,
    #[serde(default)]
    pub data: DataValue,
}

impl Event {
    /// Creates an external event with no payload.
    pub fn new(name: impl Into<EventName>) -> Self {
        Self {
            name: name.into(),
            kind: EventType::External,
            send_id: None,
            origin: None,
            origin_type: None,
            invoke_id: None,
            data: DataValue::Undefined,
        }
    }

    pub fn internal(name: impl Into<EventName>) -> Self {
        Self {
            kind: EventType::Internal,
            ..Self::new(name)
        }
    }

    pub fn platform(name: impl Into<EventName>) -> Self {
        Self {
            kind: EventType::Platform,
            ..Self::new(name)
        }
    }

    /// An `error.*` platform event carrying a message.
    pub fn error(name: &str, message: impl Into<String>, send_id: Option<String>) -> Self {
        let data = DataObject::new();
        // Fresh object, cannot be frozen.
        let _ = data.set("message", DataValue::String(message.into()));
        Self {
            send_id,
            data: DataValue::Object(data),
            ..Self::platform(name)
        }
    }

    pub fn with_data(mut self, data: DataValue) -> Self {
        self.data = data;
        self
    }

    pub fn with_send_id(mut self, send_id: impl Into<String>) -> Self {
        self.send_id = Some(send_id.into());
        self
    }

    pub fn with_invoke_id(mut self, invoke_id: impl Into<String>) -> Self {
        self.invoke_id = Some(invoke_id.into());
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>, origin_type: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self.origin_type = Some(origin_type.into());
        self
    }

    /// Copies the event for delivery into another session: the payload is
    /// deep-cloned and frozen so neither side can observe the other's writes.
    pub fn detached(&self) -> Self {
        Self {
            data: self.data.deep_clone(true),
            ..self.clone()
        }
    }

    /// The `_event` system variable view of this event.
    pub fn to_value(&self) -> DataValue {
        let obj = DataObject::new();
        let opt = |v: &Option<String>| {
            v.as_ref()
                .map(|s| DataValue::String(s.clone()))
                .unwrap_or(DataValue::Undefined)
        };
        let fields = [
            ("name", DataValue::from(self.name.as_str())),
            ("type", DataValue::from(self.kind.as_str())),
            ("sendid", opt(&self.send_id)),
            ("origin", opt(&self.origin)),
            ("origintype", opt(&self.origin_type)),
            ("invokeid", opt(&self.invoke_id)),
            ("data", self.data.clone()),
        ];
        for (key, value) in fields {
            let _ = obj.set(key, value);
        }
        DataValue::Object(obj)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_descriptor_prefix_matching() {
        let error = EventDescriptor::parse("error");
        assert!(error.matches(&EventName::new("error")));
        assert!(error.matches(&EventName::new("error.execution")));
        assert!(!error.matches(&EventName::new("errors")));
        assert!(!error.matches(&EventName::new("done.error")));

        let wildcard = EventDescriptor::parse("done.*");
        assert!(wildcard.matches(&EventName::new("done.state.a")));
        assert!(!wildcard.matches(&EventName::new("done2")));

        let any = EventDescriptor::parse("*");
        assert!(any.matches(&EventName::new("anything.at.all")));
    }

    #[test]
    fn test_descriptor_longer_than_event() {
        let d = EventDescriptor::parse("a.b.c");
        assert!(!d.matches(&EventName::new("a.b")));
    }

    #[test]
    fn test_detached_payload_is_frozen_copy() {
        let payload = DataValue::from_json(&json!({"n": 1}));
        let event = Event::new("go").with_data(payload.clone());
        let copy = event.detached();

        assert!(copy.data.is_frozen());
        assert!(!payload.is_frozen());
        assert!(!copy
            .data
            .as_object()
            .unwrap()
            .ptr_eq(payload.as_object().unwrap()));
    }

    #[test]
    fn test_event_value_view() {
        let event = Event::new("go")
            .with_send_id("s-1")
            .with_data(DataValue::from(5));
        let view = event.to_value();

        assert_eq!(view.path("name"), DataValue::from("go"));
        assert_eq!(view.path("type"), DataValue::from("external"));
        assert_eq!(view.path("sendid"), DataValue::from("s-1"));
        assert_eq!(view.path("invokeid"), DataValue::Undefined);
        assert_eq!(view.path("data"), DataValue::from(5));
    }
}
