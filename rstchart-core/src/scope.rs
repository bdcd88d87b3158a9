//! The view of a session handed to expression evaluators.

use rstchart_model::{DocumentId, Event, ExecutionContext, InterpreterModel};
use rstchart_value::DataObject;
use std::collections::BTreeSet;

pub(crate) struct Scope<'a> {
    pub(crate) session_id: &'a str,
    pub(crate) data: &'a DataObject,
    pub(crate) event: Option<&'a Event>,
    pub(crate) model: &'a InterpreterModel,
    pub(crate) configuration: &'a BTreeSet<DocumentId>,
}

impl ExecutionContext for Scope<'_> {
    fn data(&self) -> &DataObject {
        self.data
    }

    fn event(&self) -> Option<&Event> {
        self.event
    }

    fn session_id(&self) -> &str {
        self.session_id
    }

    fn name(&self) -> Option<&str> {
        self.model.name()
    }

    fn in_state(&self, id: &str) -> bool {
        self.model
            .lookup(id)
            .is_some_and(|state| self.configuration.contains(&state))
    }
}
