//! Invoked services.

use crate::context::SessionContext;
use crate::error::{RouteError, SessionError};
use async_trait::async_trait;
use rstchart_model::event::DONE_INVOKE_PREFIX;
use rstchart_model::Event;
use rstchart_value::{DataObject, DataValue};
use std::sync::{Arc, Weak};

/// Type locator of child statechart sessions.
pub const SCXML_INVOKE_TYPE: &str = "scxml";
/// Long form of [`SCXML_INVOKE_TYPE`].
pub const SCXML_INVOKE_TYPE_URI: &str = "http://www.w3.org/TR/scxml/";

/// Everything a factory needs to start one invoked service.
#[derive(Debug, Clone)]
pub struct InvokeConfig {
    pub invoke_id: String,
    pub parent_id: String,
    /// Name of the invoking state.
    pub state: String,
    pub type_: String,
    pub src: Option<String>,
    /// Inline content, typically a document.
    pub content: Option<DataValue>,
    pub params: DataObject,
    pub autoforward: bool,
}

impl InvokeConfig {
    pub fn is_scxml(&self) -> bool {
        let t = self.type_.trim_end_matches('/');
        t == SCXML_INVOKE_TYPE || t == SCXML_INVOKE_TYPE_URI.trim_end_matches('/')
    }
}

/// A running invoked service.
#[async_trait]
pub trait InvokedService: Send + Sync {
    /// Delivers an event from the invoking session.
    fn deliver(&self, event: Event) -> Result<(), RouteError>;

    /// Stops the service. Called at most once per invoke.
    async fn cancel(&self);
}

/// Starts services of one type.
#[async_trait]
pub trait InvokeFactory: Send + Sync {
    async fn start(
        &self,
        config: InvokeConfig,
        parent: ParentChannel,
    ) -> Result<Arc<dyn InvokedService>, SessionError>;
}

/// Lets a service send events back to its invoking session through the
/// host's registry.
#[derive(Clone)]
pub struct ParentChannel {
    parent_id: String,
    invoke_id: String,
    ctx: Weak<dyn SessionContext>,
}

impl ParentChannel {
    pub fn new(
        parent_id: impl Into<String>,
        invoke_id: impl Into<String>,
        ctx: Weak<dyn SessionContext>,
    ) -> Self {
        Self {
            parent_id: parent_id.into(),
            invoke_id: invoke_id.into(),
            ctx,
        }
    }

    pub fn parent_id(&self) -> &str {
        &self.parent_id
    }

    pub fn invoke_id(&self) -> &str {
        &self.invoke_id
    }

    /// Sends an event to the parent, tagged with this invoke id.
    pub fn send(&self, event: Event) -> Result<(), RouteError> {
        let ctx = self
            .ctx
            .upgrade()
            .ok_or_else(|| RouteError::Closed(self.parent_id.clone()))?;
        let event = event.detached().with_invoke_id(self.invoke_id.clone());
        ctx.route(
            &format!("#_{}", self.invoke_id),
            &format!("#_scxml_{}", self.parent_id),
            event,
        )
    }

    /// Reports completion with `done.invoke.<id>`.
    pub fn done(&self, data: DataValue) -> Result<(), RouteError> {
        self.send(
            Event::new(format!("{}{}", DONE_INVOKE_PREFIX, self.invoke_id)).with_data(data),
        )
    }
}

impl std::fmt::Debug for ParentChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParentChannel")
            .field("parent_id", &self.parent_id)
            .field("invoke_id", &self.invoke_id)
            .finish()
    }
}
