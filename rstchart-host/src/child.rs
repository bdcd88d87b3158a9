//! `scxml` invokes: child documents run as sessions of the same host.
//!
//! The child's document comes from the invoke's content (a document object
//! or JSON text) or its `src`. Invoke params are written over the child's
//! root data. When the child reaches a top-level final state the host
//! reports `done.invoke.<id>` to the parent with the child's done data.

use crate::host::HostInner;
use crate::provider::DocumentSource;
use async_trait::async_trait;
use rstchart_core::{
    InvokeConfig, InvokeFactory, InvokedService, ParentChannel, RouteError, SessionError,
    SessionHandle, SessionStatus,
};
use rstchart_model::Event;
use rstchart_value::{DataObject, DataValue};
use std::sync::{Arc, Weak};

/// Starts child sessions for `scxml` invokes.
pub struct ChildSessionFactory {
    host: Weak<HostInner>,
}

impl ChildSessionFactory {
    pub(crate) fn new(host: Weak<HostInner>) -> Self {
        Self { host }
    }
}

#[async_trait]
impl InvokeFactory for ChildSessionFactory {
    async fn start(
        &self,
        config: InvokeConfig,
        parent: ParentChannel,
    ) -> Result<Arc<dyn InvokedService>, SessionError> {
        let host = self
            .host
            .upgrade()
            .ok_or_else(|| SessionError::Invoke("host is shutting down".to_string()))?;
        let source = child_source(&config)?;

        // Params arrive frozen; the child owns its copy.
        let params = match DataValue::Object(config.params.clone()).deep_clone(false) {
            DataValue::Object(params) => params,
            _ => DataObject::new(),
        };

        let child_id = uuid::Uuid::new_v4().to_string();
        let handle = host
            .launch(child_id, source, params, Some(parent))
            .await
            .map_err(|e| SessionError::Invoke(e.to_string()))?;

        tracing::info!(
            "[{}] Invoke '{}' running as child session {}",
            config.parent_id,
            config.invoke_id,
            handle.id()
        );
        Ok(Arc::new(ChildSession {
            handle,
            host: self.host.clone(),
        }))
    }
}

impl std::fmt::Debug for ChildSessionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildSessionFactory").finish_non_exhaustive()
    }
}

fn child_source(config: &InvokeConfig) -> Result<DocumentSource, SessionError> {
    match (&config.content, &config.src) {
        (Some(DataValue::String(text)), _) => Ok(DocumentSource::Inline(text.clone())),
        (Some(content), _) => Ok(DocumentSource::Json(content.to_json())),
        (None, Some(src)) => Ok(DocumentSource::Uri(src.clone())),
        (None, None) => Err(SessionError::Invoke(format!(
            "invoke '{}' has neither content nor src",
            config.invoke_id
        ))),
    }
}

/// A child session seen from its parent.
struct ChildSession {
    handle: SessionHandle,
    host: Weak<HostInner>,
}

#[async_trait]
impl InvokedService for ChildSession {
    fn deliver(&self, event: Event) -> Result<(), RouteError> {
        let host = self
            .host
            .upgrade()
            .ok_or_else(|| RouteError::Closed(self.handle.id().to_string()))?;
        host.deliver(self.handle.id(), event)
    }

    async fn cancel(&self) {
        tracing::debug!("Cancelling child session {}", self.handle.id());
        self.handle.destroy();
        if self.handle.status() == SessionStatus::Suspended {
            if let Some(host) = self.host.upgrade() {
                if let Err(e) = host.resume_parked(self.handle.id()) {
                    tracing::warn!("Could not wake child session {}: {}", self.handle.id(), e);
                    return;
                }
            }
        }
        self.handle.finished().await;
    }
}
