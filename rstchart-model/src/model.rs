//! The resolved, immutable interpreter model.
//!
//! States and transitions live in one arena indexed by [`DocumentId`]. Every
//! cross reference (parent, children, targets, initial transition) is an id,
//! so the graph has no ownership cycles and can be shared by any number of
//! sessions through an `Arc`.

use crate::document::{BindingMode, HistoryKind, TransitionKind};
use crate::error::ModelError;
use crate::event::{EventDescriptor, EventName};
use crate::expr::{CondExpr, LocationExpr, ScriptExpr, ValueExpr};
use rstchart_value::DataValue;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Stable, zero-based position of a state or transition in document order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct DocumentId(pub u32);

impl DocumentId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    Atomic,
    Compound,
    Parallel,
    Final,
    History(HistoryKind),
}

#[derive(Debug, Clone)]
pub struct StateNode {
    pub id: DocumentId,
    /// Declared id, or a generated `_state<n>` name.
    pub name: String,
    pub kind: StateKind,
    pub parent: Option<DocumentId>,
    /// Child states in document order, history states included.
    pub children: Vec<DocumentId>,
    /// Initial transition of a compound or parallel state.
    pub initial: Option<DocumentId>,
    /// Outgoing transitions in document order. For a history state, its
    /// single default transition.
    pub transitions: Vec<DocumentId>,
    pub on_entry: Vec<Action>,
    pub on_exit: Vec<Action>,
    pub invokes: Vec<InvokeNode>,
    pub done_data: Option<DoneData>,
    pub data: Vec<DataBinding>,
    pub depth: usize,
}

impl StateNode {
    pub fn is_atomic(&self) -> bool {
        matches!(self.kind, StateKind::Atomic | StateKind::Final)
    }

    pub fn is_compound(&self) -> bool {
        self.kind == StateKind::Compound
    }

    pub fn is_parallel(&self) -> bool {
        self.kind == StateKind::Parallel
    }

    pub fn is_final(&self) -> bool {
        self.kind == StateKind::Final
    }

    pub fn is_history(&self) -> bool {
        matches!(self.kind, StateKind::History(_))
    }
}

#[derive(Debug, Clone)]
pub struct TransitionNode {
    pub id: DocumentId,
    pub source: DocumentId,
    pub events: Vec<EventDescriptor>,
    pub cond: Option<CondExpr>,
    pub targets: Vec<DocumentId>,
    pub kind: TransitionKind,
    pub actions: Vec<Action>,
    /// Default initial transitions added by the builder.
    pub synthesized: bool,
}

impl TransitionNode {
    pub fn is_eventless(&self) -> bool {
        self.events.is_empty()
    }

    pub fn matches(&self, name: &EventName) -> bool {
        self.events.iter().any(|d| d.matches(name))
    }

    pub fn is_targetless(&self) -> bool {
        self.targets.is_empty()
    }
}

/// An arena slot.
#[derive(Debug, Clone)]
pub enum Entity {
    State(StateNode),
    Transition(TransitionNode),
}

impl Entity {
    pub fn id(&self) -> DocumentId {
        match self {
            Entity::State(s) => s.id,
            Entity::Transition(t) => t.id,
        }
    }
}

/// Compiled executable content.
#[derive(Debug, Clone)]
pub enum Action {
    Raise {
        event: EventName,
    },
    Send(Box<SendAction>),
    Cancel {
        sendid: StrSource,
    },
    Log {
        label: Option<String>,
        expr: Option<ValueExpr>,
    },
    Assign {
        location: LocationExpr,
        value: ValueSource,
    },
    If {
        branches: Vec<IfBranch>,
    },
    Foreach {
        array: ValueExpr,
        item: LocationExpr,
        index: Option<LocationExpr>,
        actions: Vec<Action>,
    },
    Script(ScriptRef),
}

/// One `if`/`elseif`/`else` arm. The `else` arm has no condition.
#[derive(Debug, Clone)]
pub struct IfBranch {
    pub cond: Option<CondExpr>,
    pub actions: Vec<Action>,
}

/// A value given either as an expression or as a frozen literal.
#[derive(Debug, Clone)]
pub enum ValueSource {
    Expr(ValueExpr),
    Literal(DataValue),
}

/// A string attribute with an `...expr` alternative.
#[derive(Debug, Clone)]
pub enum StrSource {
    Literal(String),
    Expr(ValueExpr),
}

#[derive(Debug, Clone)]
pub enum ParamSource {
    Expr(ValueExpr),
    Location(LocationExpr),
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub source: ParamSource,
}

/// A `namelist` entry: the location and the key it is sent under.
#[derive(Debug, Clone)]
pub struct NameRef {
    pub name: String,
    pub location: LocationExpr,
}

#[derive(Debug, Clone)]
pub struct SendAction {
    pub event: Option<StrSource>,
    pub target: Option<StrSource>,
    pub type_: Option<StrSource>,
    pub id: Option<String>,
    pub idlocation: Option<LocationExpr>,
    pub delay: Option<StrSource>,
    pub namelist: Vec<NameRef>,
    pub params: Vec<Param>,
    pub content: Option<ValueSource>,
}

#[derive(Debug, Clone)]
pub struct InvokeNode {
    /// Owning state.
    pub state: DocumentId,
    pub type_: Option<StrSource>,
    pub src: Option<StrSource>,
    pub id: Option<String>,
    pub idlocation: Option<LocationExpr>,
    pub autoforward: bool,
    pub namelist: Vec<NameRef>,
    pub params: Vec<Param>,
    pub content: Option<ValueSource>,
    pub finalize: Vec<Action>,
}

#[derive(Debug, Clone)]
pub struct DoneData {
    pub content: Option<ValueSource>,
    pub params: Vec<Param>,
}

#[derive(Debug, Clone)]
pub enum DataInit {
    Expr(ValueExpr),
    Literal(DataValue),
    Undefined,
}

/// A `<data>` declaration bound to its location in the data store.
#[derive(Debug, Clone)]
pub struct DataBinding {
    pub id: String,
    pub location: LocationExpr,
    pub init: DataInit,
}

/// Index into [`InterpreterModel::scripts`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptRef(pub usize);

/// The output of a successful build.
#[derive(Debug)]
pub struct InterpreterModel {
    pub(crate) name: Option<String>,
    pub(crate) datamodel: String,
    pub(crate) binding: BindingMode,
    pub(crate) root: DocumentId,
    pub(crate) entities: Vec<Entity>,
    pub(crate) names: HashMap<String, DocumentId>,
    pub(crate) scripts: Vec<ScriptExpr>,
    pub(crate) global_scripts: Vec<ScriptRef>,
}

impl InterpreterModel {
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn datamodel(&self) -> &str {
        &self.datamodel
    }

    pub fn binding(&self) -> BindingMode {
        self.binding
    }

    /// The synthetic root state standing for the document itself.
    pub fn root(&self) -> DocumentId {
        self.root
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn entity(&self, id: DocumentId) -> Result<&Entity, ModelError> {
        self.entities
            .get(id.index())
            .ok_or(ModelError::UnknownId(id))
    }

    pub fn state(&self, id: DocumentId) -> Result<&StateNode, ModelError> {
        match self.entity(id)? {
            Entity::State(s) => Ok(s),
            Entity::Transition(_) => Err(ModelError::NotAState(id)),
        }
    }

    pub fn transition(&self, id: DocumentId) -> Result<&TransitionNode, ModelError> {
        match self.entity(id)? {
            Entity::Transition(t) => Ok(t),
            Entity::State(_) => Err(ModelError::NotATransition(id)),
        }
    }

    /// All states in document order.
    pub fn states(&self) -> impl Iterator<Item = &StateNode> {
        self.entities.iter().filter_map(|e| match e {
            Entity::State(s) => Some(s),
            Entity::Transition(_) => None,
        })
    }

    /// Looks up a state by its declared id.
    pub fn lookup(&self, name: &str) -> Option<DocumentId> {
        self.names.get(name).copied()
    }

    pub fn script(&self, script: ScriptRef) -> Result<&ScriptExpr, ModelError> {
        self.scripts
            .get(script.0)
            .ok_or(ModelError::UnknownScript(script.0))
    }

    /// Document level scripts, run once after data initialization.
    pub fn global_scripts(&self) -> &[ScriptRef] {
        &self.global_scripts
    }

    /// True if `id` is a proper descendant of `ancestor`.
    pub fn is_descendant(&self, id: DocumentId, ancestor: DocumentId) -> bool {
        let mut current = self.parent_of(id);
        while let Some(p) = current {
            if p == ancestor {
                return true;
            }
            current = self.parent_of(p);
        }
        false
    }

    /// Proper ancestors of `id`, nearest first, stopping before `upto`.
    pub fn ancestors(&self, id: DocumentId, upto: Option<DocumentId>) -> Vec<DocumentId> {
        let mut out = Vec::new();
        let mut current = self.parent_of(id);
        while let Some(p) = current {
            if Some(p) == upto {
                break;
            }
            out.push(p);
            current = self.parent_of(p);
        }
        out
    }

    fn parent_of(&self, id: DocumentId) -> Option<DocumentId> {
        match self.entities.get(id.index()) {
            Some(Entity::State(s)) => s.parent,
            Some(Entity::Transition(t)) => Some(t.source),
            None => None,
        }
    }
}
