//! Document tree types.
//!
//! Documents are plain serde data. The JSON form mirrors the statechart
//! element structure:
//!
//! ```json
//! {
//!   "name": "order",
//!   "datamodel": "simple",
//!   "data": [{"id": "total", "expr": "0"}],
//!   "states": [
//!     {"id": "open", "transitions": [
//!       {"event": "pay", "cond": "ctx.total > 0", "target": "paid"}
//!     ]},
//!     {"id": "paid", "kind": "final"}
//!   ]
//! }
//! ```
//!
//! Event, target and initial lists accept either a space separated string
//! or an array of strings.

use serde::{Deserialize, Serialize};

/// Root of a statechart document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Document {
    pub name: Option<String>,
    /// Data model type, resolved against the binding registry.
    pub datamodel: Option<String>,
    pub binding: BindingMode,
    #[serde(deserialize_with = "string_or_list")]
    pub initial: Vec<String>,
    pub data: Vec<DataDecl>,
    pub script: Vec<ScriptDecl>,
    pub states: Vec<StateDecl>,
}

impl Document {
    /// Parses a document from JSON text.
    pub fn from_json_str(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Parses a document from a JSON value.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, serde_json::Error> {
        Self::deserialize(value)
    }
}

/// When `<data>` declarations outside the root are initialized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindingMode {
    /// All data is created when the session starts.
    #[default]
    Early,
    /// State-local data is assigned on the first entry of its state.
    Late,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateKindDecl {
    #[default]
    State,
    Parallel,
    Final,
    History,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryKind {
    #[default]
    Shallow,
    Deep,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionKind {
    #[default]
    External,
    Internal,
}

/// A state, parallel, final or history element.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StateDecl {
    pub id: Option<String>,
    pub kind: StateKindDecl,
    /// Only meaningful for history states.
    pub history: HistoryKind,
    /// Initial attribute: ids of the initial child configuration.
    #[serde(deserialize_with = "string_or_list")]
    pub initial: Vec<String>,
    /// Explicit `<initial>` element with its own executable content.
    pub initial_transition: Option<TransitionDecl>,
    pub on_entry: Vec<ActionDecl>,
    pub on_exit: Vec<ActionDecl>,
    /// For history states, the single default transition.
    pub transitions: Vec<TransitionDecl>,
    pub states: Vec<StateDecl>,
    pub data: Vec<DataDecl>,
    pub invokes: Vec<InvokeDecl>,
    pub done_data: Option<DoneDataDecl>,
}

impl StateDecl {
    /// Convenience constructor used by tests and embedders.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn with_kind(mut self, kind: StateKindDecl) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_transition(mut self, transition: TransitionDecl) -> Self {
        self.transitions.push(transition);
        self
    }

    pub fn with_child(mut self, child: StateDecl) -> Self {
        self.states.push(child);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransitionDecl {
    #[serde(deserialize_with = "string_or_list")]
    pub event: Vec<String>,
    pub cond: Option<String>,
    #[serde(deserialize_with = "string_or_list")]
    pub target: Vec<String>,
    #[serde(rename = "type")]
    pub kind: TransitionKind,
    pub actions: Vec<ActionDecl>,
}

impl TransitionDecl {
    pub fn on(event: &str, target: &str) -> Self {
        Self {
            event: split_list(event),
            target: split_list(target),
            ..Default::default()
        }
    }
}

/// Executable content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum ActionDecl {
    Raise {
        event: String,
    },
    Send(SendDecl),
    Cancel {
        #[serde(default)]
        sendid: Option<String>,
        #[serde(default)]
        sendidexpr: Option<String>,
    },
    Log {
        #[serde(default)]
        label: Option<String>,
        #[serde(default)]
        expr: Option<String>,
    },
    Assign {
        location: String,
        #[serde(default)]
        expr: Option<String>,
        #[serde(default)]
        value: Option<serde_json::Value>,
    },
    If(IfDecl),
    Foreach {
        array: String,
        item: String,
        #[serde(default)]
        index: Option<String>,
        #[serde(default)]
        actions: Vec<ActionDecl>,
    },
    Script(ScriptDecl),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IfDecl {
    pub cond: String,
    pub actions: Vec<ActionDecl>,
    pub else_if: Vec<ElseIfDecl>,
    #[serde(rename = "else")]
    pub otherwise: Vec<ActionDecl>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ElseIfDecl {
    pub cond: String,
    pub actions: Vec<ActionDecl>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SendDecl {
    pub event: Option<String>,
    pub eventexpr: Option<String>,
    pub target: Option<String>,
    pub targetexpr: Option<String>,
    #[serde(rename = "type")]
    pub type_: Option<String>,
    pub typeexpr: Option<String>,
    pub id: Option<String>,
    pub idlocation: Option<String>,
    pub delay: Option<String>,
    pub delayexpr: Option<String>,
    #[serde(deserialize_with = "string_or_list")]
    pub namelist: Vec<String>,
    pub params: Vec<ParamDecl>,
    pub content: Option<ContentDecl>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ParamDecl {
    pub name: String,
    pub expr: Option<String>,
    pub location: Option<String>,
}

/// Inline content: either an expression or a literal JSON value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContentDecl {
    pub expr: Option<String>,
    pub value: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScriptDecl {
    /// External script body, fetched through the resource loader.
    pub src: Option<String>,
    pub body: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DataDecl {
    pub id: String,
    pub expr: Option<String>,
    /// External JSON document, fetched through the resource loader.
    pub src: Option<String>,
    pub value: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InvokeDecl {
    #[serde(rename = "type")]
    pub type_: Option<String>,
    pub typeexpr: Option<String>,
    pub src: Option<String>,
    pub srcexpr: Option<String>,
    pub id: Option<String>,
    pub idlocation: Option<String>,
    pub autoforward: bool,
    #[serde(deserialize_with = "string_or_list")]
    pub namelist: Vec<String>,
    pub params: Vec<ParamDecl>,
    pub content: Option<ContentDecl>,
    pub finalize: Vec<ActionDecl>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DoneDataDecl {
    pub content: Option<ContentDecl>,
    pub params: Vec<ParamDecl>,
}

fn split_list(s: &str) -> Vec<String> {
    s.split_whitespace().map(str::to_string).collect()
}

fn string_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::{self, Visitor};
    use std::fmt;

    struct StringOrListVisitor;

    impl<'de> Visitor<'de> for StringOrListVisitor {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or array of strings")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(split_list(v))
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Vec::new())
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            let mut items = Vec::new();
            while let Some(s) = seq.next_element::<String>()? {
                items.extend(split_list(&s));
            }
            Ok(items)
        }
    }

    deserializer.deserialize_any(StringOrListVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_document() {
        let doc = Document::from_json(&json!({
            "name": "order",
            "initial": "open",
            "states": [
                {"id": "open", "transitions": [
                    {"event": "pay refund.*", "target": ["paid"], "cond": "ctx.ok"}
                ]},
                {"id": "paid", "kind": "final"}
            ]
        }))
        .unwrap();

        assert_eq!(doc.name.as_deref(), Some("order"));
        assert_eq!(doc.initial, vec!["open"]);
        assert_eq!(doc.states.len(), 2);
        let t = &doc.states[0].transitions[0];
        assert_eq!(t.event, vec!["pay", "refund.*"]);
        assert_eq!(t.target, vec!["paid"]);
        assert_eq!(t.kind, TransitionKind::External);
        assert_eq!(doc.states[1].kind, StateKindDecl::Final);
    }

    #[test]
    fn test_parse_actions() {
        let doc = Document::from_json(&json!({
            "states": [{"id": "a", "on_entry": [
                {"raise": {"event": "go"}},
                {"assign": {"location": "ctx.n", "expr": "1"}},
                {"if": {"cond": "ctx.n > 0", "actions": [{"log": {"label": "pos"}}],
                        "else": [{"log": {"label": "neg"}}]}},
                {"send": {"event": "tick", "delay": "1s", "namelist": "ctx.n"}},
                {"script": {"src": "init.js"}}
            ]}]
        }))
        .unwrap();

        let entry = &doc.states[0].on_entry;
        assert_eq!(entry.len(), 5);
        assert!(matches!(&entry[0], ActionDecl::Raise { event } if event == "go"));
        match &entry[2] {
            ActionDecl::If(decl) => {
                assert_eq!(decl.actions.len(), 1);
                assert_eq!(decl.otherwise.len(), 1);
            }
            other => panic!("unexpected action {:?}", other),
        }
        match &entry[3] {
            ActionDecl::Send(send) => {
                assert_eq!(send.delay.as_deref(), Some("1s"));
                assert_eq!(send.namelist, vec!["ctx.n"]);
            }
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let result = Document::from_json(&json!({"states": [{"id": "a", "bogus": 1}]}));
        assert!(result.is_err());
    }
}
