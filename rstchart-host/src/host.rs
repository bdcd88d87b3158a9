//! The host context: session registry and event router.
//!
//! A [`Host`] owns four registries, all keyed concurrent maps so that
//! sessions starting, finishing and invoking never contend on one lock:
//!
//! - session id -> session handle and model
//! - `(session id, invoke id)` -> invoked service
//! - target locator (`#_scxml_<id>`) -> session id
//! - child session id -> channel to its invoking parent
//!
//! Every session runs under a supervisor task that deregisters it once it
//! finishes and turns a panic into a failed status.

use crate::child::ChildSessionFactory;
use crate::config::{Config, HostConfig};
use crate::error::HostError;
use crate::provider::{DocumentProvider, DocumentSource};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rstchart_core::invoke::SCXML_INVOKE_TYPE;
use rstchart_core::{
    Checkpoint, InvokeConfig, InvokeFactory, InvokedService, ParentChannel, RouteError, Session,
    SessionContext, SessionError, SessionHandle, SessionSignals, SessionStatus, TARGET_PARENT,
    TARGET_SESSION_PREFIX,
};
use rstchart_model::event::{DONE_INVOKE_PREFIX, ERROR_EXECUTION, ERROR_PLATFORM};
use rstchart_model::{Event, InterpreterModel, ModelBuilder};
use rstchart_value::{DataObject, DataValue};
use std::sync::{Arc, Weak};
use tokio::sync::Semaphore;

type InvokeKey = (String, String);

enum InvokeSlot {
    /// The factory has not returned yet. Events forwarded meanwhile wait here.
    Starting(Vec<Event>),
    Running(Arc<dyn InvokedService>),
}

#[derive(Clone)]
struct SessionEntry {
    handle: SessionHandle,
    model: Arc<InterpreterModel>,
}

pub(crate) struct HostInner {
    this: Weak<HostInner>,
    config: HostConfig,
    provider: DocumentProvider,
    builder: ModelBuilder,
    signals: SessionSignals,
    io: Arc<Semaphore>,
    sessions: DashMap<String, SessionEntry>,
    invokes: DashMap<InvokeKey, InvokeSlot>,
    targets: DashMap<String, String>,
    parents: DashMap<String, ParentChannel>,
    factories: DashMap<String, Arc<dyn InvokeFactory>>,
}

/// Registry and router for a set of sessions.
///
/// Cloning a host yields another handle to the same registries.
#[derive(Clone)]
pub struct Host {
    inner: Arc<HostInner>,
}

impl Host {
    /// Creates a host with the built-in `scxml` invoke factory registered.
    pub fn new(config: HostConfig) -> Self {
        let builder = ModelBuilder::new(config.bindings.clone())
            .with_loader(config.loader.clone())
            .with_fetch_concurrency(config.io_concurrency);
        let provider = DocumentProvider::new(config.loader.clone());

        let inner = Arc::new_cyclic(|this: &Weak<HostInner>| {
            let factories: DashMap<String, Arc<dyn InvokeFactory>> = DashMap::new();
            factories.insert(
                SCXML_INVOKE_TYPE.to_string(),
                Arc::new(ChildSessionFactory::new(this.clone())),
            );
            HostInner {
                this: this.clone(),
                io: Arc::new(Semaphore::new(config.io_concurrency.max(1))),
                config,
                provider,
                builder,
                signals: SessionSignals::default(),
                sessions: DashMap::new(),
                invokes: DashMap::new(),
                targets: DashMap::new(),
                parents: DashMap::new(),
                factories,
            }
        });

        tracing::info!("Host created ({:?})", inner.config);
        Self { inner }
    }

    /// Creates a host from file-level configuration.
    pub fn from_config(config: &Config) -> Result<Self, HostError> {
        Ok(Self::new(config.host_config()?))
    }

    pub fn config(&self) -> &HostConfig {
        &self.inner.config
    }

    /// Registers a factory for invokes of the given type.
    pub fn register_factory(&self, type_: impl Into<String>, factory: Arc<dyn InvokeFactory>) {
        let type_ = type_.into();
        tracing::debug!("Registered invoke factory '{}'", type_);
        self.inner.factories.insert(type_, factory);
    }

    /// Loads and builds a document, then starts a session with a fresh id.
    ///
    /// Returns once the session has settled into its first wait, or
    /// finished.
    pub async fn start(
        &self,
        source: DocumentSource,
        params: DataObject,
    ) -> Result<SessionHandle, HostError> {
        let id = uuid::Uuid::new_v4().to_string();
        self.inner.launch(id, source, params, None).await
    }

    /// Like [`Host::start`] with a caller-chosen session id.
    pub async fn start_with_id(
        &self,
        id: impl Into<String>,
        source: DocumentSource,
        params: DataObject,
    ) -> Result<SessionHandle, HostError> {
        let id = id.into();
        if self.inner.sessions.contains_key(&id) {
            return Err(HostError::Internal(format!("session {} already exists", id)));
        }
        self.inner.launch(id, source, params, None).await
    }

    /// Rebuilds a session from its stored checkpoint, e.g. after a restart.
    pub async fn restore(
        &self,
        id: &str,
        source: DocumentSource,
    ) -> Result<SessionHandle, HostError> {
        let inner = &self.inner;
        let checkpoint = inner.load_checkpoint(id)?;
        if checkpoint.session_id != id {
            return Err(SessionError::Checkpoint(format!(
                "checkpoint stored under {} belongs to {}",
                id, checkpoint.session_id
            ))
            .into());
        }

        let model = inner.build(source).await?;
        let (session, handle) = Session::new(
            id,
            model.clone(),
            inner.context()?,
            inner.config.session_config(),
            inner.signals.clone(),
        );
        let session = session.restore_from(checkpoint)?;
        inner.register(
            id,
            SessionEntry {
                handle: handle.clone(),
                model,
            },
            None,
        )?;
        tracing::info!("[{}] Restored session from checkpoint", id);
        inner.supervise(session);
        handle.accepted().await;
        Ok(handle)
    }

    /// Ids of stored checkpoints.
    pub fn checkpoints(&self) -> Result<Vec<String>, HostError> {
        match &self.inner.config.store {
            Some(store) => Ok(store.keys()?),
            None => Err(HostError::PersistenceDisabled),
        }
    }

    /// Enqueues an external event, waiting for room in a bounded queue.
    pub async fn send(&self, session_id: &str, event: Event) -> Result<(), HostError> {
        let handle = self.handle_of(session_id)?;
        handle.send(event).await?;
        self.inner.wake(session_id);
        Ok(())
    }

    /// Enqueues an external event without waiting.
    pub fn dispatch(&self, session_id: &str, event: Event) -> Result<(), HostError> {
        Ok(self.inner.deliver(session_id, event)?)
    }

    /// Cancels a pending delayed send. Returns false if it already fired.
    pub fn cancel(&self, session_id: &str, send_id: &str) -> Result<bool, HostError> {
        Ok(self.handle_of(session_id)?.cancel_send(send_id))
    }

    pub fn destroy(&self, session_id: &str) -> Result<(), HostError> {
        let handle = self.handle_of(session_id)?;
        handle.destroy();
        // A parked session has to run once to observe the signal.
        if handle.status() == SessionStatus::Suspended {
            self.inner.resume_parked(session_id)?;
        }
        Ok(())
    }

    /// Waits for the session to finish and returns its done data.
    pub async fn result(&self, session_id: &str) -> Result<DataValue, HostError> {
        let handle = self.handle_of(session_id)?;
        Ok(handle.result().await?)
    }

    pub fn status(&self, session_id: &str) -> Result<SessionStatus, HostError> {
        Ok(self.handle_of(session_id)?.status())
    }

    pub fn handle(&self, session_id: &str) -> Option<SessionHandle> {
        self.inner.sessions.get(session_id).map(|e| e.handle.clone())
    }

    fn handle_of(&self, session_id: &str) -> Result<SessionHandle, HostError> {
        self.handle(session_id)
            .ok_or_else(|| HostError::UnknownSession(session_id.to_string()))
    }

    /// Ids of registered sessions, sorted.
    pub fn sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.sessions.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }

    /// Number of registered invoked services, including ones still starting.
    pub fn invoke_count(&self) -> usize {
        self.inner.invokes.len()
    }

    /// Waits until every registered session has finished or is suspended.
    ///
    /// Sessions that finish and deregister during the wait are fine; the
    /// registry is re-read until nothing is outstanding.
    pub async fn wait_all(&self) {
        loop {
            let pending: Vec<SessionHandle> = self
                .inner
                .sessions
                .iter()
                .map(|e| e.handle.clone())
                .filter(|h| !settled(&h.status()))
                .collect();
            if pending.is_empty() {
                return;
            }
            for handle in pending {
                let mut status = handle.subscribe();
                let _ = status.wait_for(settled).await;
            }
        }
    }

    /// Suspends every session at its next wait point. Requires persistence.
    pub fn suspend(&self) -> Result<(), HostError> {
        if !self.inner.config.persistence_enabled() {
            return Err(HostError::PersistenceDisabled);
        }
        tracing::info!("Suspending {} sessions", self.len());
        self.inner.signals.suspend.trigger();
        Ok(())
    }

    /// Clears the suspend signal and resumes every suspended session from
    /// its checkpoint. Returns how many sessions were resumed.
    pub fn resume(&self) -> Result<usize, HostError> {
        if !self.inner.config.persistence_enabled() {
            return Err(HostError::PersistenceDisabled);
        }
        self.inner.signals.suspend.reset();

        let suspended: Vec<String> = self
            .inner
            .sessions
            .iter()
            .filter(|e| e.handle.status() == SessionStatus::Suspended)
            .map(|e| e.key().clone())
            .collect();

        let mut resumed = 0;
        for id in suspended {
            match self.inner.resume_parked(&id) {
                Ok(true) => resumed += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!("[{}] Failed to resume session: {}", id, e),
            }
        }
        tracing::info!("Resumed {} sessions", resumed);
        Ok(resumed)
    }

    /// Stops every running session. Terminal; suspended sessions keep their
    /// checkpoints.
    pub fn stop(&self) {
        tracing::info!("Stopping host ({} sessions)", self.len());
        self.inner.signals.stop.trigger();
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("config", &self.inner.config)
            .field("sessions", &self.inner.sessions.len())
            .field("invokes", &self.inner.invokes.len())
            .finish()
    }
}

fn settled(status: &SessionStatus) -> bool {
    status.is_terminal() || *status == SessionStatus::Suspended
}

fn locator(session_id: &str) -> String {
    format!("{}{}", TARGET_SESSION_PREFIX, session_id)
}

impl HostInner {
    fn context(&self) -> Result<Arc<HostInner>, HostError> {
        self.this.upgrade().ok_or(HostError::ShuttingDown)
    }

    async fn build(&self, source: DocumentSource) -> Result<Arc<InterpreterModel>, HostError> {
        let what = source.describe();
        let document = self.provider.load(source).await?;
        match self.builder.build(&document).await {
            Ok(model) => Ok(Arc::new(model)),
            Err(failure) => {
                for error in failure.errors() {
                    tracing::warn!("Build error in {}: {}", what, error);
                }
                Err(failure.into())
            }
        }
    }

    /// Builds, registers and spawns a session.
    pub(crate) async fn launch(
        &self,
        id: String,
        source: DocumentSource,
        params: DataObject,
        parent: Option<ParentChannel>,
    ) -> Result<SessionHandle, HostError> {
        let model = self.build(source).await?;
        let (session, handle) = Session::new(
            id.clone(),
            model.clone(),
            self.context()?,
            self.config.session_config(),
            self.signals.clone(),
        );
        let session = session.with_params(params);
        self.register(
            &id,
            SessionEntry {
                handle: handle.clone(),
                model,
            },
            parent,
        )?;
        self.supervise(session);
        handle.accepted().await;
        Ok(handle)
    }

    fn register(
        &self,
        id: &str,
        entry: SessionEntry,
        parent: Option<ParentChannel>,
    ) -> Result<(), HostError> {
        match self.sessions.entry(id.to_string()) {
            Entry::Occupied(_) => {
                tracing::error!("[{}] Session id collision, refusing to register", id);
                return Err(HostError::Internal(format!(
                    "session id collision: {}",
                    id
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(entry);
            }
        }
        self.targets.insert(locator(id), id.to_string());
        if let Some(parent) = parent {
            self.parents.insert(id.to_string(), parent);
        }
        tracing::debug!("[{}] Session registered", id);
        Ok(())
    }

    fn supervise(&self, session: Session) {
        let id = session.id().to_string();
        let handle = session.handle();
        let host = self.this.clone();
        let task = session.spawn();

        tokio::spawn(async move {
            let status = match task.await {
                Ok(status) => status,
                Err(e) => {
                    let reason = if e.is_panic() {
                        "session task panicked".to_string()
                    } else {
                        format!("session task aborted: {}", e)
                    };
                    tracing::error!("[{}] {}", id, reason);
                    handle.mark_failed(reason);
                    handle.status()
                }
            };
            let Some(host) = host.upgrade() else {
                return;
            };
            if status.is_terminal() {
                host.deregister(&id, &status);
            } else if status == SessionStatus::Suspended {
                host.wake_pending(&id);
            }
        });
    }

    fn deregister(&self, id: &str, status: &SessionStatus) {
        self.sessions.remove(id);
        self.targets.remove(&locator(id));

        // Only left behind when the session task died.
        let orphaned: Vec<InvokeKey> = self
            .invokes
            .iter()
            .filter(|e| e.key().0 == id)
            .map(|e| e.key().clone())
            .collect();
        for (session, invoke) in orphaned {
            self.cancel_invoke(&session, &invoke);
        }

        if let Some((_, parent)) = self.parents.remove(id) {
            let reported = match status {
                SessionStatus::Completed(data) => parent.done(data.clone()),
                SessionStatus::Failed(reason) => parent.send(Event::error(
                    ERROR_PLATFORM,
                    format!("child session failed: {}", reason),
                    None,
                )),
                _ => Ok(()),
            };
            if let Err(e) = reported {
                tracing::debug!(
                    "[{}] Could not notify parent {}: {}",
                    id,
                    parent.parent_id(),
                    e
                );
            }
        }
        tracing::debug!("[{}] Session deregistered ({})", id, status);
    }

    fn load_checkpoint(&self, id: &str) -> Result<Checkpoint, HostError> {
        let store = self
            .config
            .store
            .as_ref()
            .ok_or(HostError::PersistenceDisabled)?;
        let bytes = store
            .load(id)?
            .ok_or_else(|| HostError::NoCheckpoint(id.to_string()))?;
        Ok(Checkpoint::decode(&bytes)?)
    }

    /// Re-attaches a parked session and runs it from its checkpoint.
    /// Returns false if another caller resumed it first.
    pub(crate) fn resume_parked(&self, id: &str) -> Result<bool, HostError> {
        let entry = self
            .sessions
            .get(id)
            .map(|e| e.clone())
            .ok_or_else(|| HostError::UnknownSession(id.to_string()))?;
        let checkpoint = self.load_checkpoint(id)?;

        let session = match Session::attach(
            &entry.handle,
            entry.model.clone(),
            self.context()?,
            self.config.session_config(),
            self.signals.clone(),
        ) {
            Ok(session) => session,
            Err(SessionError::Closed(_)) => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        match session.restore_from(checkpoint) {
            Ok(session) => {
                tracing::info!("[{}] Resuming session", id);
                self.supervise(session);
                Ok(true)
            }
            Err(e) => {
                tracing::error!("[{}] Checkpoint rejected on resume: {}", id, e);
                entry.handle.mark_failed(e.to_string());
                self.deregister(id, &entry.handle.status());
                Err(e.into())
            }
        }
    }

    /// Resumes a session suspended on its own idle timer. Sessions parked
    /// by a host-wide suspend stay parked until [`Host::resume`].
    fn wake(&self, id: &str) {
        if self.signals.suspend.is_triggered() {
            return;
        }
        let suspended = self
            .sessions
            .get(id)
            .is_some_and(|e| e.handle.status() == SessionStatus::Suspended);
        if !suspended {
            return;
        }
        if let Err(e) = self.resume_parked(id) {
            tracing::warn!("[{}] Failed to wake session: {}", id, e);
        }
    }

    /// Wakes a session that parked with events still queued. A send racing
    /// the idle suspend sees a non-suspended status and skips its own wake.
    fn wake_pending(&self, id: &str) {
        let pending = self
            .sessions
            .get(id)
            .is_some_and(|e| e.handle.has_parked_events());
        if pending {
            tracing::debug!("[{}] Events queued during suspend, waking", id);
            self.wake(id);
        }
    }

    pub(crate) fn deliver(&self, id: &str, event: Event) -> Result<(), RouteError> {
        let handle = self
            .sessions
            .get(id)
            .map(|e| e.handle.clone())
            .ok_or_else(|| RouteError::UnknownSession(id.to_string()))?;
        handle.try_send(event).map_err(|e| match e {
            SessionError::QueueFull(id) => RouteError::QueueFull(id),
            _ => RouteError::Closed(id.to_string()),
        })?;
        self.wake(id);
        Ok(())
    }

    /// Moves a started service into the registry and flushes events that
    /// arrived while it was starting. A service whose invoke was cancelled
    /// meanwhile is cancelled here.
    async fn activate(&self, key: InvokeKey, service: Arc<dyn InvokedService>) {
        let registered = loop {
            let batch = {
                let Some(mut slot) = self.invokes.get_mut(&key) else {
                    break false;
                };
                let pending = match &mut *slot {
                    InvokeSlot::Starting(pending) => std::mem::take(pending),
                    InvokeSlot::Running(_) => break true,
                };
                if pending.is_empty() {
                    *slot = InvokeSlot::Running(service.clone());
                    break true;
                }
                pending
            };
            for event in batch {
                if let Err(e) = service.deliver(event) {
                    tracing::warn!("[{}] Invoke '{}' rejected event: {}", key.0, key.1, e);
                }
            }
        };

        if registered {
            tracing::debug!("[{}] Invoke '{}' running", key.0, key.1);
        } else {
            tracing::debug!("[{}] Invoke '{}' cancelled while starting", key.0, key.1);
            service.cancel().await;
        }
    }

    fn start_failed(&self, key: InvokeKey, error: SessionError) {
        let removed = self
            .invokes
            .remove_if(&key, |_, slot| matches!(slot, InvokeSlot::Starting(_)));
        if removed.is_none() {
            return;
        }
        let (session_id, invoke_id) = key;
        tracing::warn!(
            "[{}] Invoke '{}' failed to start: {}",
            session_id,
            invoke_id,
            error
        );
        let event = Event::error(
            ERROR_EXECUTION,
            format!("invoke '{}' failed to start: {}", invoke_id, error),
            None,
        )
        .with_invoke_id(invoke_id);
        if let Err(e) = self.deliver(&session_id, event) {
            tracing::debug!("[{}] Could not report invoke failure: {}", session_id, e);
        }
    }
}

impl SessionContext for HostInner {
    fn route(&self, from: &str, target: &str, event: Event) -> Result<(), RouteError> {
        if target == TARGET_PARENT {
            let parent = self
                .parents
                .get(from)
                .map(|p| p.clone())
                .ok_or_else(|| RouteError::UnknownTarget(target.to_string()))?;
            return parent.send(event);
        }

        if let Some(session) = target.strip_prefix(TARGET_SESSION_PREFIX) {
            let id = self
                .targets
                .get(target)
                .map(|t| t.clone())
                .ok_or_else(|| RouteError::UnknownSession(session.to_string()))?;
            // A completed invoke leaves the registry without being cancelled.
            if let Some(invoke_id) = from.strip_prefix("#_") {
                if event.name.as_str().strip_prefix(DONE_INVOKE_PREFIX) == Some(invoke_id) {
                    self.invokes.remove(&(id.clone(), invoke_id.to_string()));
                }
            }
            return self.deliver(&id, event);
        }

        if let Some(invoke_id) = target.strip_prefix("#_") {
            return self.forward(from, invoke_id, event);
        }

        Err(RouteError::UnknownTarget(target.to_string()))
    }

    fn start_invoke(&self, session_id: &str, config: InvokeConfig) -> Result<(), SessionError> {
        let type_ = if config.is_scxml() {
            SCXML_INVOKE_TYPE
        } else {
            config.type_.as_str()
        };
        let factory = self
            .factories
            .get(type_)
            .map(|f| f.clone())
            .ok_or_else(|| {
                SessionError::Invoke(format!("no factory for invoke type '{}'", config.type_))
            })?;

        let key: InvokeKey = (session_id.to_string(), config.invoke_id.clone());
        match self.invokes.entry(key.clone()) {
            Entry::Occupied(_) => {
                return Err(SessionError::Invoke(format!(
                    "invoke '{}' is already running",
                    config.invoke_id
                )))
            }
            Entry::Vacant(slot) => {
                slot.insert(InvokeSlot::Starting(Vec::new()));
            }
        }

        let ctx: Weak<dyn SessionContext> = self.this.clone();
        let parent = ParentChannel::new(session_id, config.invoke_id.clone(), ctx);
        let host = self.this.clone();
        let io = self.io.clone();

        tokio::spawn(async move {
            let Ok(_permit) = io.acquire_owned().await else {
                return;
            };
            let result = factory.start(config, parent).await;
            match (host.upgrade(), result) {
                (Some(host), Ok(service)) => host.activate(key, service).await,
                (Some(host), Err(e)) => host.start_failed(key, e),
                (None, Ok(service)) => service.cancel().await,
                (None, Err(_)) => {}
            }
        });
        Ok(())
    }

    fn cancel_invoke(&self, session_id: &str, invoke_id: &str) -> bool {
        let key: InvokeKey = (session_id.to_string(), invoke_id.to_string());
        match self.invokes.remove(&key) {
            Some((_, InvokeSlot::Running(service))) => {
                tokio::spawn(async move { service.cancel().await });
                true
            }
            // The start task sees the missing slot and cancels the service.
            Some((_, InvokeSlot::Starting(_))) => true,
            None => false,
        }
    }

    fn forward(&self, session_id: &str, invoke_id: &str, event: Event) -> Result<(), RouteError> {
        let key: InvokeKey = (session_id.to_string(), invoke_id.to_string());
        let service = match self.invokes.get_mut(&key) {
            None => return Err(RouteError::UnknownTarget(format!("#_{}", invoke_id))),
            Some(mut slot) => match &mut *slot {
                InvokeSlot::Starting(pending) => {
                    pending.push(event);
                    return Ok(());
                }
                InvokeSlot::Running(service) => service.clone(),
            },
        };
        service.deliver(event)
    }

    fn invoke_active(&self, session_id: &str, invoke_id: &str) -> bool {
        self.invokes
            .contains_key(&(session_id.to_string(), invoke_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rstchart_storage::{FileCheckpointStore, MemoryCheckpointStore};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    fn host() -> Host {
        Host::new(HostConfig::default())
    }

    fn persistent_host() -> Host {
        Host::new(HostConfig::default().with_store(Arc::new(MemoryCheckpointStore::new())))
    }

    fn doc(value: serde_json::Value) -> DocumentSource {
        DocumentSource::Json(value)
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    fn counter_doc() -> serde_json::Value {
        json!({
            "data": [{"id": "count", "value": 0}],
            "states": [
                {"id": "counting", "transitions": [
                    {"event": "inc", "actions": [
                        {"assign": {"location": "ctx.count", "expr": "ctx.count + 1"}}
                    ]},
                    {"event": "finish", "target": "done"}
                ]},
                {"id": "done", "kind": "final", "done_data": {"content": {"expr": "ctx.count"}}}
            ]
        })
    }

    #[derive(Default)]
    struct Counters {
        started: AtomicUsize,
        cancelled: AtomicUsize,
        delivered: AtomicUsize,
    }

    struct CountingService {
        counters: Arc<Counters>,
    }

    #[async_trait]
    impl InvokedService for CountingService {
        fn deliver(&self, _event: Event) -> Result<(), RouteError> {
            self.counters.delivered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn cancel(&self) {
            self.counters.cancelled.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct CountingFactory {
        counters: Arc<Counters>,
    }

    #[async_trait]
    impl InvokeFactory for CountingFactory {
        async fn start(
            &self,
            _config: InvokeConfig,
            _parent: ParentChannel,
        ) -> Result<Arc<dyn InvokedService>, SessionError> {
            self.counters.started.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(CountingService {
                counters: self.counters.clone(),
            }))
        }
    }

    #[tokio::test]
    async fn test_start_send_and_complete() {
        let host = host();
        let handle = host
            .start(
                doc(json!({
                    "states": [
                        {"id": "a", "transitions": [{"event": "go", "target": "b"}]},
                        {"id": "b", "kind": "final"}
                    ]
                })),
                DataObject::new(),
            )
            .await
            .unwrap();
        assert_eq!(handle.configuration(), vec!["a"]);

        host.send(handle.id(), Event::new("go")).await.unwrap();
        assert_eq!(handle.result().await.unwrap(), DataValue::Undefined);
        assert_eq!(handle.configuration(), vec!["b"]);

        host.wait_all().await;
        eventually(|| host.is_empty()).await;
    }

    #[tokio::test]
    async fn test_params_override_root_data() {
        let host = host();
        let params = DataObject::new();
        params.set("count", DataValue::from(40)).unwrap();
        let handle = host.start(doc(counter_doc()), params).await.unwrap();

        host.dispatch(handle.id(), Event::new("inc")).unwrap();
        host.dispatch(handle.id(), Event::new("inc")).unwrap();
        host.dispatch(handle.id(), Event::new("finish")).unwrap();
        assert_eq!(handle.result().await.unwrap(), DataValue::from(42));
    }

    #[tokio::test]
    async fn test_routing_errors_reach_caller_only() {
        let host = host();
        assert!(matches!(
            host.dispatch("nobody", Event::new("x")),
            Err(HostError::UnknownSession(_))
        ));
        assert!(matches!(
            host.result("nobody").await,
            Err(HostError::UnknownSession(_))
        ));

        let handle = host.start(doc(counter_doc()), DataObject::new()).await.unwrap();
        assert_eq!(handle.status(), SessionStatus::Waiting);
    }

    #[tokio::test]
    async fn test_build_failure_reported() {
        let host = host();
        let err = host
            .start(
                doc(json!({
                    "states": [{"id": "a", "transitions": [{"event": "go", "target": "nowhere"}]}]
                })),
                DataObject::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "BUILD_FAILED");
        assert!(host.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_session_id_rejected() {
        let host = host();
        host.start_with_id("fixed", doc(counter_doc()), DataObject::new())
            .await
            .unwrap();
        let err = host
            .start_with_id("fixed", doc(counter_doc()), DataObject::new())
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "INTERNAL_ERROR");
    }

    #[tokio::test]
    async fn test_sessions_route_to_each_other() {
        let host = host();
        let receiver = host
            .start_with_id(
                "receiver",
                doc(json!({
                    "states": [
                        {"id": "waiting", "transitions": [{"event": "hello", "target": "done"}]},
                        {"id": "done", "kind": "final",
                         "done_data": {"content": {"expr": "_event.data.from"}}}
                    ]
                })),
                DataObject::new(),
            )
            .await
            .unwrap();

        host.start(
            doc(json!({
                "states": [
                    {"id": "sending", "on_entry": [
                        {"send": {"event": "hello", "target": "#_scxml_receiver",
                                  "params": [{"name": "from", "expr": "'sender'"}]}}
                    ]}
                ]
            })),
            DataObject::new(),
        )
        .await
        .unwrap();

        assert_eq!(receiver.result().await.unwrap(), DataValue::from("sender"));
    }

    #[tokio::test]
    async fn test_send_to_unknown_session_raises_communication_error() {
        let host = host();
        let handle = host
            .start(
                doc(json!({
                    "states": [
                        {"id": "sending",
                         "on_entry": [{"send": {"event": "x", "target": "#_scxml_ghost"}}],
                         "transitions": [{"event": "error.communication", "target": "failed"}]},
                        {"id": "failed", "kind": "final"}
                    ]
                })),
                DataObject::new(),
            )
            .await
            .unwrap();
        assert!(matches!(
            handle.finished().await,
            SessionStatus::Completed(_)
        ));
        assert_eq!(handle.configuration(), vec!["failed"]);
    }

    #[tokio::test]
    async fn test_concurrent_sessions_do_not_cross_talk() {
        let host = host();
        let mut handles = Vec::new();
        for _ in 0..16 {
            handles.push(host.start(doc(counter_doc()), DataObject::new()).await.unwrap());
        }

        let mut tasks = Vec::new();
        for (i, handle) in handles.iter().enumerate() {
            let host = host.clone();
            let id = handle.id().to_string();
            tasks.push(tokio::spawn(async move {
                for _ in 0..i {
                    host.send(&id, Event::new("inc")).await.unwrap();
                }
                host.send(&id, Event::new("finish")).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        for (i, handle) in handles.iter().enumerate() {
            assert_eq!(handle.result().await.unwrap(), DataValue::from(i as i64));
        }
        host.wait_all().await;
    }

    #[tokio::test]
    async fn test_invoke_cancelled_once_and_deregistered() {
        let host = host();
        let counters = Arc::new(Counters::default());
        host.register_factory(
            "counting",
            Arc::new(CountingFactory {
                counters: counters.clone(),
            }),
        );

        let handle = host
            .start(
                doc(json!({
                    "states": [
                        {"id": "busy", "invokes": [{"id": "worker", "type": "counting"}],
                         "transitions": [{"event": "leave", "target": "idle"}]},
                        {"id": "idle"}
                    ]
                })),
                DataObject::new(),
            )
            .await
            .unwrap();
        eventually(|| counters.started.load(Ordering::SeqCst) == 1).await;
        eventually(|| host.invoke_count() == 1).await;

        host.send(handle.id(), Event::new("leave")).await.unwrap();
        eventually(|| counters.cancelled.load(Ordering::SeqCst) == 1).await;
        assert_eq!(host.invoke_count(), 0);

        handle.destroy();
        handle.finished().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counters.cancelled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_autoforward_reaches_service() {
        let host = host();
        let counters = Arc::new(Counters::default());
        host.register_factory(
            "counting",
            Arc::new(CountingFactory {
                counters: counters.clone(),
            }),
        );

        let handle = host
            .start(
                doc(json!({
                    "states": [
                        {"id": "busy", "invokes": [
                            {"id": "worker", "type": "counting", "autoforward": true}
                        ]}
                    ]
                })),
                DataObject::new(),
            )
            .await
            .unwrap();

        host.send(handle.id(), Event::new("tick")).await.unwrap();
        host.send(handle.id(), Event::new("tock")).await.unwrap();
        eventually(|| counters.delivered.load(Ordering::SeqCst) == 2).await;
    }

    #[tokio::test]
    async fn test_unknown_invoke_type_raises_execution_error() {
        let host = host();
        let handle = host
            .start(
                doc(json!({
                    "states": [
                        {"id": "busy", "invokes": [{"id": "worker", "type": "carrier-pigeon"}],
                         "transitions": [{"event": "error.execution", "target": "failed"}]},
                        {"id": "failed", "kind": "final"}
                    ]
                })),
                DataObject::new(),
            )
            .await
            .unwrap();
        assert!(matches!(
            handle.finished().await,
            SessionStatus::Completed(_)
        ));
        assert_eq!(host.invoke_count(), 0);
    }

    #[tokio::test]
    async fn test_suspend_without_store_is_rejected() {
        let host = host();
        assert!(matches!(host.suspend(), Err(HostError::PersistenceDisabled)));
    }

    #[tokio::test]
    async fn test_suspend_resume_round_trip() {
        let host = persistent_host();
        let handle = host.start(doc(counter_doc()), DataObject::new()).await.unwrap();
        host.send(handle.id(), Event::new("inc")).await.unwrap();

        host.suspend().unwrap();
        host.wait_all().await;
        assert_eq!(handle.status(), SessionStatus::Suspended);
        let before = handle.configuration();

        // Queued while parked.
        host.send(handle.id(), Event::new("inc")).await.unwrap();
        assert_eq!(handle.status(), SessionStatus::Suspended);

        assert_eq!(host.resume().unwrap(), 1);
        handle.accepted().await;
        assert_eq!(handle.configuration(), before);

        host.send(handle.id(), Event::new("finish")).await.unwrap();
        assert_eq!(handle.result().await.unwrap(), DataValue::from(2));
        eventually(|| host.checkpoints().unwrap().is_empty()).await;
    }

    #[tokio::test]
    async fn test_idle_session_wakes_on_send() {
        let host = Host::new(
            HostConfig::default()
                .with_store(Arc::new(MemoryCheckpointStore::new()))
                .with_idle_timeout(Duration::from_millis(30)),
        );
        let handle = host.start(doc(counter_doc()), DataObject::new()).await.unwrap();

        let mut status = handle.subscribe();
        status
            .wait_for(|s| *s == SessionStatus::Suspended)
            .await
            .unwrap();

        host.send(handle.id(), Event::new("inc")).await.unwrap();
        host.send(handle.id(), Event::new("finish")).await.unwrap();
        assert_eq!(handle.result().await.unwrap(), DataValue::from(1));
    }

    #[tokio::test]
    async fn test_event_queued_during_idle_suspend_is_processed() {
        let host = Host::new(
            HostConfig::default()
                .with_store(Arc::new(MemoryCheckpointStore::new()))
                .with_idle_timeout(Duration::from_millis(30)),
        );
        let handle = host.start(doc(counter_doc()), DataObject::new()).await.unwrap();
        let mut status = handle.subscribe();
        status
            .wait_for(|s| *s == SessionStatus::Suspended)
            .await
            .unwrap();

        // Enqueued behind the host's back, as a send racing the suspend is.
        handle.try_send(Event::new("inc")).unwrap();
        assert!(handle.has_parked_events());
        host.inner.wake_pending(handle.id());

        eventually(|| handle.status() == SessionStatus::Suspended && !handle.has_parked_events())
            .await;
        host.send(handle.id(), Event::new("finish")).await.unwrap();
        assert_eq!(handle.result().await.unwrap(), DataValue::from(1));
    }

    #[tokio::test]
    async fn test_sends_around_idle_timeout_are_not_lost() {
        let host = Host::new(
            HostConfig::default()
                .with_store(Arc::new(MemoryCheckpointStore::new()))
                .with_idle_timeout(Duration::from_millis(2)),
        );
        let handle = host.start(doc(counter_doc()), DataObject::new()).await.unwrap();

        for i in 0..40u64 {
            host.send(handle.id(), Event::new("inc")).await.unwrap();
            tokio::time::sleep(Duration::from_millis(i % 4)).await;
        }
        host.send(handle.id(), Event::new("finish")).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), handle.result())
            .await
            .unwrap();
        assert_eq!(result.unwrap(), DataValue::from(40));
    }

    #[tokio::test]
    async fn test_restore_after_restart() {
        let dir = TempDir::new().unwrap();
        let id = {
            let store = Arc::new(FileCheckpointStore::open(dir.path()).unwrap());
            let host = Host::new(HostConfig::default().with_store(store));
            let handle = host.start(doc(counter_doc()), DataObject::new()).await.unwrap();
            host.send(handle.id(), Event::new("inc")).await.unwrap();
            host.send(handle.id(), Event::new("inc")).await.unwrap();
            host.suspend().unwrap();
            host.wait_all().await;
            handle.id().to_string()
        };

        let store = Arc::new(FileCheckpointStore::open(dir.path()).unwrap());
        let host = Host::new(HostConfig::default().with_store(store));
        assert_eq!(host.checkpoints().unwrap(), vec![id.clone()]);

        let handle = host.restore(&id, doc(counter_doc())).await.unwrap();
        assert_eq!(handle.configuration(), vec!["counting"]);
        host.send(&id, Event::new("finish")).await.unwrap();
        assert_eq!(handle.result().await.unwrap(), DataValue::from(2));
    }

    #[tokio::test]
    async fn test_restore_missing_checkpoint() {
        let host = persistent_host();
        assert!(matches!(
            host.restore("gone", doc(counter_doc())).await,
            Err(HostError::NoCheckpoint(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_ends_every_session() {
        let host = host();
        let a = host.start(doc(counter_doc()), DataObject::new()).await.unwrap();
        let b = host.start(doc(counter_doc()), DataObject::new()).await.unwrap();

        host.stop();
        host.wait_all().await;
        assert_eq!(a.status(), SessionStatus::Stopped);
        assert_eq!(b.status(), SessionStatus::Stopped);
        eventually(|| host.is_empty()).await;
    }

    #[tokio::test]
    async fn test_destroy_one_session() {
        let host = host();
        let a = host.start(doc(counter_doc()), DataObject::new()).await.unwrap();
        let b = host.start(doc(counter_doc()), DataObject::new()).await.unwrap();

        host.destroy(a.id()).unwrap();
        assert_eq!(a.finished().await, SessionStatus::Destroyed);
        assert_eq!(b.status(), SessionStatus::Waiting);
        assert!(matches!(
            host.send(a.id(), Event::new("inc")).await,
            Err(HostError::Session(SessionError::Closed(_))) | Err(HostError::UnknownSession(_))
        ));
    }
}
