//! Session run loop.
//!
//! Each session runs as one tokio task. The task owns the configuration,
//! internal queue and data store; the outside world only sees a
//! [`SessionHandle`] with the external queue sender, a status channel and
//! the destroy signal.
//!
//! The only await point is the wait for the next external event. Stop,
//! destroy, suspend and the idle timer are all checked there.

use crate::checkpoint::{Checkpoint, CheckpointStore, DelayedRecord, HistoryRecord, InvokeRecord};
use crate::context::SessionContext;
use crate::error::SessionError;
use crate::queue::{event_queue, QueueError, QueueReceiver, QueueSender};
use crate::scope::Scope;
use crate::signal::CancelSignal;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rstchart_model::document::BindingMode;
use rstchart_model::event::ERROR_EXECUTION;
use rstchart_model::{DataInit, DocumentId, Event, InterpreterModel};
use rstchart_value::{DataObject, DataValue};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};

/// Upper bound on microsteps in one macrostep; guards against eventless
/// transition cycles.
const MAX_MICROSTEPS: usize = 10_000;

/// Lifecycle of a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionStatus {
    NotStarted,
    Running,
    /// Blocked on the external queue.
    Waiting,
    /// Parked at a checkpoint; can be resumed.
    Suspended,
    /// Reached a top-level final state. Carries the done data.
    Completed(DataValue),
    Failed(String),
    Destroyed,
    Stopped,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed(_)
                | SessionStatus::Failed(_)
                | SessionStatus::Destroyed
                | SessionStatus::Stopped
        )
    }

    /// Waiting, suspended or terminal: the session is safe to talk to.
    pub fn is_accepted(&self) -> bool {
        matches!(self, SessionStatus::Waiting | SessionStatus::Suspended) || self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::NotStarted => "not_started",
            SessionStatus::Running => "running",
            SessionStatus::Waiting => "waiting",
            SessionStatus::Suspended => "suspended",
            SessionStatus::Completed(_) => "completed",
            SessionStatus::Failed(_) => "failed",
            SessionStatus::Destroyed => "destroyed",
            SessionStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-session runtime settings.
#[derive(Clone, Default)]
pub struct SessionConfig {
    /// Capacity of the external queue. Ignored when a store is configured.
    pub queue_capacity: Option<usize>,
    /// Auto-suspend after this long without events. Requires a store.
    pub idle_timeout: Option<Duration>,
    pub store: Option<Arc<dyn CheckpointStore>>,
}

impl SessionConfig {
    fn effective_capacity(&self) -> Option<usize> {
        match self.store {
            Some(_) => None,
            None => self.queue_capacity,
        }
    }

    fn effective_idle_timeout(&self) -> Option<Duration> {
        self.store.as_ref().and(self.idle_timeout)
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("queue_capacity", &self.queue_capacity)
            .field("idle_timeout", &self.idle_timeout)
            .field("persistent", &self.store.is_some())
            .finish()
    }
}

/// Host-wide cancellation signals shared by every session.
#[derive(Debug, Clone, Default)]
pub struct SessionSignals {
    pub stop: CancelSignal,
    pub suspend: CancelSignal,
}

/// State shared between a session task and its handles.
pub(crate) struct Shared {
    pub(crate) id: String,
    pub(crate) sender: QueueSender,
    pub(crate) status: watch::Sender<SessionStatus>,
    pub(crate) destroy: CancelSignal,
    pub(crate) delayed: DashMap<String, DelayedSend>,
    /// The queue receiver while the session is suspended.
    pub(crate) parked: Mutex<Option<QueueReceiver>>,
    /// Names of the active states at the last macrostep boundary.
    pub(crate) snapshot: RwLock<Vec<String>>,
}

impl Shared {
    pub(crate) fn cancel_delayed(&self, send_id: &str) -> bool {
        match self.delayed.remove(send_id) {
            Some((_, send)) => {
                send.abort.abort();
                true
            }
            None => false,
        }
    }
}

/// A delayed send whose timer has not fired yet.
pub(crate) struct DelayedSend {
    pub(crate) abort: AbortHandle,
    pub(crate) target: Option<String>,
    pub(crate) event: Event,
    pub(crate) due: DateTime<Utc>,
}

/// Cheap, cloneable access to a session from outside its task.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<Shared>,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.shared.status.subscribe()
    }

    /// Active state names at the last macrostep boundary, in document order.
    pub fn configuration(&self) -> Vec<String> {
        self.shared.snapshot.read().clone()
    }

    pub fn is_in(&self, state: &str) -> bool {
        self.shared.snapshot.read().iter().any(|s| s == state)
    }

    /// Enqueues an external event, waiting for room in a bounded queue.
    pub async fn send(&self, event: Event) -> Result<(), SessionError> {
        if self.status().is_terminal() {
            return Err(SessionError::Closed(self.shared.id.clone()));
        }
        self.shared
            .sender
            .send(event)
            .await
            .map_err(|e| self.queue_error(e))
    }

    /// Enqueues an external event without waiting.
    pub fn try_send(&self, event: Event) -> Result<(), SessionError> {
        if self.status().is_terminal() {
            return Err(SessionError::Closed(self.shared.id.clone()));
        }
        self.shared
            .sender
            .try_send(event)
            .map_err(|e| self.queue_error(e))
    }

    fn queue_error(&self, e: QueueError) -> SessionError {
        match e {
            QueueError::Full => SessionError::QueueFull(self.shared.id.clone()),
            QueueError::Closed => SessionError::Closed(self.shared.id.clone()),
        }
    }

    /// Whether a suspended session has events waiting in its parked queue.
    pub fn has_parked_events(&self) -> bool {
        self.shared
            .parked
            .lock()
            .as_ref()
            .is_some_and(|receiver| !receiver.is_empty())
    }

    /// Cancels a pending delayed send. Returns false if it already fired.
    pub fn cancel_send(&self, send_id: &str) -> bool {
        self.shared.cancel_delayed(send_id)
    }

    pub fn pending_sends(&self) -> usize {
        self.shared.delayed.len()
    }

    pub fn destroy(&self) {
        self.shared.destroy.trigger();
    }

    /// Waits until the session is waiting for events, suspended or finished.
    pub async fn accepted(&self) -> SessionStatus {
        self.wait_until(SessionStatus::is_accepted).await
    }

    /// Waits for a terminal status.
    pub async fn finished(&self) -> SessionStatus {
        self.wait_until(SessionStatus::is_terminal).await
    }

    /// Waits for the session to finish and returns its done data.
    pub async fn result(&self) -> Result<DataValue, SessionError> {
        match self.finished().await {
            SessionStatus::Completed(value) => Ok(value),
            SessionStatus::Failed(reason) => Err(SessionError::Failed(reason)),
            SessionStatus::Destroyed => Err(SessionError::Destroyed),
            _ => Err(SessionError::Stopped),
        }
    }

    async fn wait_until(&self, done: impl Fn(&SessionStatus) -> bool) -> SessionStatus {
        let mut rx = self.subscribe();
        let status = match rx.wait_for(|s| done(s)).await {
            Ok(status) => (*status).clone(),
            Err(_) => self.status(),
        };
        status
    }

    /// Marks a session failed from outside its task, e.g. after a panic.
    /// Has no effect on a session that already finished.
    pub fn mark_failed(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.shared.status.send_if_modified(|status| {
            if status.is_terminal() {
                false
            } else {
                *status = SessionStatus::Failed(reason);
                true
            }
        });
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.shared.id)
            .field("status", &self.status())
            .finish()
    }
}

/// An invoke started by this session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ActiveInvoke {
    pub(crate) state: DocumentId,
    pub(crate) index: usize,
    pub(crate) autoforward: bool,
}

enum Wake {
    Event(Event),
    Stop,
    Destroy,
    Suspend,
    Idle,
}

/// One running instance of an interpreter model.
pub struct Session {
    pub(crate) id: String,
    pub(crate) shared: Arc<Shared>,
    pub(crate) model: Arc<InterpreterModel>,
    pub(crate) ctx: Arc<dyn SessionContext>,
    pub(crate) config: SessionConfig,
    pub(crate) signals: SessionSignals,
    pub(crate) receiver: Option<QueueReceiver>,
    pub(crate) internal: VecDeque<Event>,
    pub(crate) configuration: BTreeSet<DocumentId>,
    pub(crate) history: HashMap<DocumentId, Vec<DocumentId>>,
    pub(crate) data: DataObject,
    pub(crate) initialized: HashSet<DocumentId>,
    pub(crate) invokes: BTreeMap<String, ActiveInvoke>,
    pub(crate) states_to_invoke: BTreeSet<DocumentId>,
    pub(crate) current_event: Option<Event>,
    pub(crate) running: bool,
    pub(crate) done_data: Option<DataValue>,
    /// Delayed sends read from a checkpoint, started once the loop runs.
    pub(crate) restored_sends: Vec<DelayedRecord>,
    params: DataObject,
    restored: bool,
    resumed: bool,
}

impl Session {
    /// Creates a session and its handle. Nothing runs until [`Session::run`].
    pub fn new(
        id: impl Into<String>,
        model: Arc<InterpreterModel>,
        ctx: Arc<dyn SessionContext>,
        config: SessionConfig,
        signals: SessionSignals,
    ) -> (Self, SessionHandle) {
        let id = id.into();
        let (sender, receiver) = event_queue(config.effective_capacity());
        let (status, _) = watch::channel(SessionStatus::NotStarted);
        let shared = Arc::new(Shared {
            id: id.clone(),
            sender,
            status,
            destroy: CancelSignal::new(),
            delayed: DashMap::new(),
            parked: Mutex::new(None),
            snapshot: RwLock::new(Vec::new()),
        });
        let handle = SessionHandle {
            shared: shared.clone(),
        };
        let session = Self::with_shared(shared, model, ctx, config, signals, Some(receiver));
        (session, handle)
    }

    /// Re-creates the task side of a suspended session. Events queued while
    /// it was suspended are kept.
    pub fn attach(
        handle: &SessionHandle,
        model: Arc<InterpreterModel>,
        ctx: Arc<dyn SessionContext>,
        config: SessionConfig,
        signals: SessionSignals,
    ) -> Result<Self, SessionError> {
        let shared = handle.shared.clone();
        let receiver = shared
            .parked
            .lock()
            .take()
            .ok_or_else(|| SessionError::Closed(shared.id.clone()))?;
        shared.status.send_replace(SessionStatus::NotStarted);
        let mut session = Self::with_shared(shared, model, ctx, config, signals, Some(receiver));
        session.resumed = true;
        Ok(session)
    }

    fn with_shared(
        shared: Arc<Shared>,
        model: Arc<InterpreterModel>,
        ctx: Arc<dyn SessionContext>,
        config: SessionConfig,
        signals: SessionSignals,
        receiver: Option<QueueReceiver>,
    ) -> Self {
        Self {
            id: shared.id.clone(),
            shared,
            model,
            ctx,
            config,
            signals,
            receiver,
            internal: VecDeque::new(),
            configuration: BTreeSet::new(),
            history: HashMap::new(),
            data: DataObject::new(),
            initialized: HashSet::new(),
            invokes: BTreeMap::new(),
            states_to_invoke: BTreeSet::new(),
            current_event: None,
            running: true,
            done_data: None,
            restored_sends: Vec::new(),
            params: DataObject::new(),
            restored: false,
            resumed: false,
        }
    }

    /// Values written over the root data after initialization.
    pub fn with_params(mut self, params: DataObject) -> Self {
        self.params = params;
        self
    }

    /// Loads state from a checkpoint instead of entering the initial
    /// configuration.
    pub fn restore_from(mut self, checkpoint: Checkpoint) -> Result<Self, SessionError> {
        checkpoint.validate(&self.model)?;
        self.data = match checkpoint.data {
            DataValue::Object(data) => data,
            _ => {
                return Err(SessionError::Checkpoint(
                    "data store is not an object".to_string(),
                ))
            }
        };
        self.configuration = checkpoint.configuration.into_iter().collect();
        self.history = checkpoint
            .history
            .into_iter()
            .map(|r| (r.state, r.states))
            .collect();
        self.initialized = checkpoint.initialized.into_iter().collect();
        self.invokes = checkpoint
            .invokes
            .into_iter()
            .map(|r| {
                (
                    r.invoke_id,
                    ActiveInvoke {
                        state: r.state,
                        index: r.index,
                        autoforward: r.autoforward,
                    },
                )
            })
            .collect();
        self.restored_sends = checkpoint.delayed;
        self.restored = true;
        Ok(self)
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Runs the session on a new tokio task.
    pub fn spawn(self) -> JoinHandle<SessionStatus> {
        tokio::spawn(self.run())
    }

    /// Runs the session until it finishes or is suspended.
    pub async fn run(mut self) -> SessionStatus {
        self.set_status(SessionStatus::Running);
        tracing::debug!("[{}] Session started", self.id);

        let status = match self.run_loop().await {
            Ok(status) => status,
            Err(e) => {
                tracing::error!("[{}] Session failed: {}", self.id, e);
                self.cancel_all_invokes();
                SessionStatus::Failed(e.to_string())
            }
        };
        self.finish(status.clone());
        status
    }

    async fn run_loop(&mut self) -> Result<SessionStatus, SessionError> {
        if !self.restored {
            self.initialize()?;
        } else if !self.resumed {
            self.restart_invokes()?;
            self.reschedule_sends();
        }

        loop {
            self.macrostep()?;
            if !self.running {
                self.publish_configuration();
                self.exit_interpreter()?;
                let done = self.done_data.take().unwrap_or_default();
                return Ok(SessionStatus::Completed(done));
            }

            self.start_invokes()?;
            if !self.internal.is_empty() {
                continue;
            }

            self.publish_configuration();
            self.save_checkpoint();
            self.set_status(SessionStatus::Waiting);

            match self.wait().await {
                Wake::Event(event) => {
                    self.set_status(SessionStatus::Running);
                    self.process_external(event)?;
                }
                Wake::Stop => {
                    tracing::info!("[{}] Stop requested", self.id);
                    self.exit_interpreter()?;
                    return Ok(SessionStatus::Stopped);
                }
                Wake::Destroy => {
                    tracing::info!("[{}] Session destroyed", self.id);
                    self.exit_interpreter()?;
                    return Ok(SessionStatus::Destroyed);
                }
                Wake::Suspend => {
                    tracing::info!("[{}] Session suspended", self.id);
                    return Ok(SessionStatus::Suspended);
                }
                Wake::Idle => {
                    // An event may have landed while the timer fired.
                    if let Some(event) = self.receiver.as_mut().and_then(|r| r.try_recv()) {
                        self.set_status(SessionStatus::Running);
                        self.process_external(event)?;
                        continue;
                    }
                    tracing::info!("[{}] Session idle, suspending", self.id);
                    return Ok(SessionStatus::Suspended);
                }
            }
        }
    }

    async fn wait(&mut self) -> Wake {
        let stop = self.signals.stop.clone();
        let suspend = self.signals.suspend.clone();
        let destroy = self.shared.destroy.clone();
        // Pending delayed sends keep the session awake.
        let idle = if self.shared.delayed.is_empty() {
            self.config.effective_idle_timeout()
        } else {
            None
        };
        let Some(receiver) = self.receiver.as_mut() else {
            return Wake::Destroy;
        };

        tokio::select! {
            biased;
            _ = stop.triggered() => Wake::Stop,
            _ = destroy.triggered() => Wake::Destroy,
            _ = suspend.triggered() => Wake::Suspend,
            event = receiver.recv() => match event {
                Some(event) => Wake::Event(event),
                None => Wake::Destroy,
            },
            _ = idle_timer(idle) => Wake::Idle,
        }
    }

    fn initialize(&mut self) -> Result<(), SessionError> {
        let model = self.model.clone();
        let root = model.root();

        match model.binding() {
            BindingMode::Early => {
                for state in model.states() {
                    self.init_data(state.id)?;
                }
            }
            BindingMode::Late => self.init_data(root)?,
        }

        for (key, value) in self.params.entries() {
            if let Err(e) = self.data.set(key.clone(), value.deep_clone(false)) {
                self.raise_error(ERROR_EXECUTION, format!("param '{}': {}", key, e), None);
            }
        }

        for script in model.global_scripts() {
            self.execute_block(std::slice::from_ref(&rstchart_model::Action::Script(*script)));
        }

        if let Some(initial) = model.state(root)?.initial {
            self.enter_states(&[initial])?;
        }
        Ok(())
    }

    /// Runs `<data>` declarations of one state.
    pub(crate) fn init_data(&mut self, state: DocumentId) -> Result<(), SessionError> {
        if !self.initialized.insert(state) {
            return Ok(());
        }
        let model = self.model.clone();
        for binding in &model.state(state)?.data {
            let value = match &binding.init {
                DataInit::Expr(expr) => match expr.eval.evaluate(&self.scope()) {
                    Ok(value) => value,
                    Err(e) => {
                        self.raise_error(
                            ERROR_EXECUTION,
                            format!("data '{}': {}", binding.id, e),
                            None,
                        );
                        DataValue::Undefined
                    }
                },
                DataInit::Literal(value) => value.deep_clone(false),
                DataInit::Undefined => DataValue::Undefined,
            };
            if let Err(e) = binding.location.eval.assign(&self.scope(), value) {
                self.raise_error(ERROR_EXECUTION, format!("data '{}': {}", binding.id, e), None);
            }
        }
        Ok(())
    }

    fn macrostep(&mut self) -> Result<(), SessionError> {
        let mut steps = 0;
        while self.running {
            let mut enabled = self.select_transitions(None)?;
            if enabled.is_empty() {
                match self.internal.pop_front() {
                    None => break,
                    Some(event) => {
                        tracing::debug!("[{}] Internal event '{}'", self.id, event.name);
                        self.current_event = Some(event.clone());
                        enabled = self.select_transitions(Some(&event))?;
                    }
                }
            }
            if !enabled.is_empty() {
                steps += 1;
                if steps > MAX_MICROSTEPS {
                    return Err(SessionError::Failed(format!(
                        "macrostep exceeded {} microsteps",
                        MAX_MICROSTEPS
                    )));
                }
                self.microstep(&enabled)?;
            }
        }
        Ok(())
    }

    fn process_external(&mut self, event: Event) -> Result<(), SessionError> {
        tracing::debug!("[{}] External event '{}'", self.id, event.name);
        self.current_event = Some(event.clone());

        if let Some(invoke_id) = &event.invoke_id {
            if let Some(active) = self.invokes.get(invoke_id).cloned() {
                let model = self.model.clone();
                let state = model.state(active.state)?;
                if let Some(invoke) = state.invokes.get(active.index) {
                    self.execute_block(&invoke.finalize);
                }
                if event
                    .name
                    .as_str()
                    .strip_prefix(rstchart_model::event::DONE_INVOKE_PREFIX)
                    == Some(invoke_id.as_str())
                {
                    self.invokes.remove(invoke_id);
                }
            }
        }

        let forward: Vec<String> = self
            .invokes
            .iter()
            .filter(|(id, active)| active.autoforward && event.invoke_id.as_deref() != Some(id.as_str()))
            .map(|(id, _)| id.clone())
            .collect();
        for invoke_id in forward {
            if let Err(e) = self.ctx.forward(&self.id, &invoke_id, event.detached()) {
                tracing::warn!("[{}] Autoforward to '{}' failed: {}", self.id, invoke_id, e);
            }
        }

        let enabled = self.select_transitions(Some(&event))?;
        if !enabled.is_empty() {
            self.microstep(&enabled)?;
        }
        Ok(())
    }

    /// Exits every active state in reverse document order.
    fn exit_interpreter(&mut self) -> Result<(), SessionError> {
        let model = self.model.clone();
        let active: Vec<DocumentId> = self.configuration.iter().rev().copied().collect();
        for id in active {
            let state = model.state(id)?;
            self.execute_block(&state.on_exit);
            self.cancel_invokes_of(id);
            self.configuration.remove(&id);
        }
        self.states_to_invoke.clear();
        Ok(())
    }

    pub(crate) fn raise_error(&mut self, name: &str, message: String, send_id: Option<String>) {
        tracing::warn!("[{}] {}: {}", self.id, name, message);
        self.internal
            .push_back(Event::error(name, message, send_id));
    }

    pub(crate) fn scope(&self) -> Scope<'_> {
        Scope {
            session_id: &self.id,
            data: &self.data,
            event: self.current_event.as_ref(),
            model: &self.model,
            configuration: &self.configuration,
        }
    }

    fn set_status(&self, status: SessionStatus) {
        self.shared.status.send_replace(status);
    }

    fn publish_configuration(&self) {
        let names: Vec<String> = self
            .configuration
            .iter()
            .filter_map(|id| self.model.state(*id).ok())
            .map(|s| s.name.clone())
            .collect();
        *self.shared.snapshot.write() = names;
    }

    /// Current state as a checkpoint.
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            session_id: self.id.clone(),
            document: self.model.name().map(str::to_string),
            configuration: self.configuration.iter().copied().collect(),
            history: self
                .history
                .iter()
                .map(|(state, states)| HistoryRecord {
                    state: *state,
                    states: states.clone(),
                })
                .collect(),
            data: DataValue::Object(self.data.clone()),
            initialized: self.initialized.iter().copied().collect(),
            invokes: self
                .invokes
                .iter()
                .map(|(id, active)| InvokeRecord {
                    invoke_id: id.clone(),
                    state: active.state,
                    index: active.index,
                    autoforward: active.autoforward,
                })
                .collect(),
            delayed: self
                .shared
                .delayed
                .iter()
                .map(|entry| DelayedRecord {
                    send_id: entry.key().clone(),
                    target: entry.value().target.clone(),
                    event: entry.value().event.clone(),
                    due: entry.value().due,
                })
                .collect(),
            created_at: Utc::now(),
        }
    }

    fn save_checkpoint(&self) {
        let Some(store) = &self.config.store else {
            return;
        };
        match self
            .checkpoint()
            .encode()
            .and_then(|bytes| store.save(&self.id, &bytes))
        {
            Ok(()) => tracing::trace!("[{}] Checkpoint written", self.id),
            Err(e) => tracing::error!("[{}] Failed to write checkpoint: {}", self.id, e),
        }
    }

    fn finish(&mut self, status: SessionStatus) {
        if status == SessionStatus::Suspended {
            self.save_checkpoint();
            *self.shared.parked.lock() = self.receiver.take();
        } else {
            for entry in self.shared.delayed.iter() {
                entry.value().abort.abort();
            }
            self.shared.delayed.clear();
            if let Some(receiver) = self.receiver.as_mut() {
                receiver.close();
            }
            if status != SessionStatus::Stopped {
                if let Some(store) = &self.config.store {
                    if let Err(e) = store.remove(&self.id) {
                        tracing::warn!("[{}] Failed to remove checkpoint: {}", self.id, e);
                    }
                }
            }
        }

        match &status {
            SessionStatus::Completed(_) => tracing::info!("[{}] Session completed", self.id),
            SessionStatus::Failed(reason) => {
                tracing::warn!("[{}] Session failed: {}", self.id, reason)
            }
            other => tracing::debug!("[{}] Session finished: {}", self.id, other),
        }
        self.set_status(status);
    }
}

async fn idle_timer(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::DetachedContext;
    use crate::error::{RouteError, StoreError};
    use crate::invoke::InvokeConfig;
    use rstchart_model::{BindingRegistry, Document, ModelBuilder};
    use serde_json::json;

    #[derive(Default)]
    struct TestStore {
        entries: Mutex<HashMap<String, Vec<u8>>>,
    }

    impl CheckpointStore for TestStore {
        fn save(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
            self.entries.lock().insert(key.to_string(), bytes.to_vec());
            Ok(())
        }

        fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            Ok(self.entries.lock().get(key).cloned())
        }

        fn remove(&self, key: &str) -> Result<(), StoreError> {
            self.entries.lock().remove(key);
            Ok(())
        }

        fn keys(&self) -> Result<Vec<String>, StoreError> {
            Ok(self.entries.lock().keys().cloned().collect())
        }
    }

    #[derive(Default)]
    struct MockContext {
        started: Mutex<Vec<String>>,
        cancelled: Mutex<Vec<String>>,
        active: Mutex<HashSet<String>>,
    }

    impl SessionContext for MockContext {
        fn route(&self, _from: &str, target: &str, _event: Event) -> Result<(), RouteError> {
            Err(RouteError::UnknownTarget(target.to_string()))
        }

        fn start_invoke(&self, _session_id: &str, config: InvokeConfig) -> Result<(), SessionError> {
            self.started.lock().push(config.invoke_id.clone());
            self.active.lock().insert(config.invoke_id);
            Ok(())
        }

        fn cancel_invoke(&self, _session_id: &str, invoke_id: &str) -> bool {
            let removed = self.active.lock().remove(invoke_id);
            if removed {
                self.cancelled.lock().push(invoke_id.to_string());
            }
            removed
        }

        fn forward(&self, _: &str, _: &str, _: Event) -> Result<(), RouteError> {
            Ok(())
        }

        fn invoke_active(&self, _session_id: &str, invoke_id: &str) -> bool {
            self.active.lock().contains(invoke_id)
        }
    }

    async fn model(doc: serde_json::Value) -> Arc<InterpreterModel> {
        let document = Document::from_json(&doc).unwrap();
        let builder = ModelBuilder::new(Arc::new(BindingRegistry::default())).without_loader();
        Arc::new(builder.build(&document).await.unwrap())
    }

    async fn start(doc: serde_json::Value) -> SessionHandle {
        let (session, handle) = Session::new(
            "s1",
            model(doc).await,
            Arc::new(DetachedContext),
            SessionConfig::default(),
            SessionSignals::default(),
        );
        session.spawn();
        handle.accepted().await;
        handle
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..400 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
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

    #[tokio::test]
    async fn test_event_reaches_final_state() {
        let handle = start(json!({
            "initial": "a",
            "states": [
                {"id": "a", "transitions": [{"event": "go", "target": "b"}]},
                {"id": "b", "kind": "final"}
            ]
        }))
        .await;

        assert_eq!(handle.status(), SessionStatus::Waiting);
        assert_eq!(handle.configuration(), vec!["a"]);

        handle.send(Event::new("go")).await.unwrap();
        assert_eq!(handle.result().await.unwrap(), DataValue::Undefined);
        assert_eq!(handle.configuration(), vec!["b"]);
        assert!(handle.send(Event::new("go")).await.is_err());
    }

    #[tokio::test]
    async fn test_parallel_configuration_is_complete() {
        let handle = start(json!({
            "states": [
                {"id": "p", "kind": "parallel", "states": [
                    {"id": "r1", "states": [{"id": "r1a"}, {"id": "r1b"}]},
                    {"id": "r2", "initial": "r2b", "states": [{"id": "r2a"}, {"id": "r2b"}]}
                ]}
            ]
        }))
        .await;

        assert_eq!(handle.configuration(), vec!["p", "r1", "r1a", "r2", "r2b"]);
    }

    #[tokio::test]
    async fn test_external_events_are_fifo() {
        let handle = start(json!({
            "data": [{"id": "log", "value": ""}],
            "states": [
                {"id": "s", "transitions": [
                    {"event": "ev", "actions": [
                        {"assign": {"location": "ctx.log", "expr": "ctx.log + _event.name + ','"}}
                    ]},
                    {"event": "finish", "target": "f"}
                ]},
                {"id": "f", "kind": "final", "done_data": {"content": {"expr": "ctx.log"}}}
            ]
        }))
        .await;

        for name in ["ev.1", "ev.2", "ev.3", "ev.4", "finish"] {
            handle.send(Event::new(name)).await.unwrap();
        }
        assert_eq!(
            handle.result().await.unwrap(),
            DataValue::from("ev.1,ev.2,ev.3,ev.4,")
        );
    }

    #[tokio::test]
    async fn test_internal_queue_drains_before_external() {
        let handle = start(json!({
            "data": [{"id": "log", "value": ""}],
            "states": [
                {"id": "s", "transitions": [
                    {"event": "go", "actions": [
                        {"raise": {"event": "inner"}},
                        {"assign": {"location": "ctx.log", "expr": "ctx.log + 'go,'"}}
                    ]},
                    {"event": "inner", "actions": [
                        {"assign": {"location": "ctx.log", "expr": "ctx.log + 'inner,'"}}
                    ]},
                    {"event": "next", "actions": [
                        {"assign": {"location": "ctx.log", "expr": "ctx.log + 'next,'"}}
                    ]},
                    {"event": "finish", "target": "f"}
                ]},
                {"id": "f", "kind": "final", "done_data": {"content": {"expr": "ctx.log"}}}
            ]
        }))
        .await;

        for name in ["go", "next", "finish"] {
            handle.send(Event::new(name)).await.unwrap();
        }
        assert_eq!(
            handle.result().await.unwrap(),
            DataValue::from("go,inner,next,")
        );
    }

    #[tokio::test]
    async fn test_failed_action_raises_error_and_skips_block() {
        let handle = start(json!({
            "states": [
                {"id": "a", "on_entry": [
                    {"assign": {"location": "ctx.missing.field", "value": 1}},
                    {"assign": {"location": "ctx.after", "value": true}}
                ], "transitions": [{"event": "error", "target": "f"}]},
                {"id": "f", "kind": "final", "done_data": {"params": [
                    {"name": "event", "expr": "_event.name"},
                    {"name": "after", "expr": "ctx.after"}
                ]}}
            ]
        }))
        .await;

        let result = handle.result().await.unwrap();
        assert_eq!(result.path("event"), DataValue::from("error.execution"));
        assert_eq!(result.path("after"), DataValue::Undefined);
    }

    #[tokio::test]
    async fn test_delayed_send_fires_and_cancel_prevents_delivery() {
        let handle = start(json!({
            "data": [{"id": "ticked", "value": false}],
            "states": [
                {"id": "a", "on_entry": [
                    {"send": {"event": "timeout", "delay": "150ms", "id": "t1"}},
                    {"send": {"event": "tick", "delay": "10ms"}}
                ], "transitions": [
                    {"event": "tick", "actions": [
                        {"cancel": {"sendid": "t1"}},
                        {"assign": {"location": "ctx.ticked", "value": true}}
                    ]},
                    {"event": "timeout", "target": "late"},
                    {"event": "check", "target": "f"}
                ]},
                {"id": "late", "kind": "final"},
                {"id": "f", "kind": "final", "done_data": {"content": {"expr": "ctx.ticked"}}}
            ]
        }))
        .await;

        eventually(|| handle.pending_sends() == 0).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        handle.send(Event::new("check")).await.unwrap();
        assert_eq!(handle.result().await.unwrap(), DataValue::from(true));
    }

    #[tokio::test]
    async fn test_cancel_from_handle() {
        let handle = start(json!({
            "states": [
                {"id": "a", "on_entry": [
                    {"send": {"event": "timeout", "delay": "100ms", "id": "t1"}}
                ], "transitions": [
                    {"event": "timeout", "target": "late"},
                    {"event": "check", "target": "f"}
                ]},
                {"id": "late", "kind": "final", "done_data": {"content": {"value": "late"}}},
                {"id": "f", "kind": "final", "done_data": {"content": {"value": "on time"}}}
            ]
        }))
        .await;

        assert_eq!(handle.pending_sends(), 1);
        assert!(handle.cancel_send("t1"));
        assert!(!handle.cancel_send("t1"));
        tokio::time::sleep(Duration::from_millis(150)).await;

        handle.send(Event::new("check")).await.unwrap();
        assert_eq!(handle.result().await.unwrap(), DataValue::from("on time"));
    }

    #[tokio::test]
    async fn test_shallow_history_restores_child() {
        let handle = start(json!({
            "states": [
                {"id": "main", "states": [
                    {"id": "hist", "kind": "history"},
                    {"id": "s1", "transitions": [{"event": "next", "target": "s2"}]},
                    {"id": "s2"}
                ], "transitions": [{"event": "pause", "target": "paused"}]},
                {"id": "paused", "transitions": [{"event": "resume", "target": "hist"}]}
            ]
        }))
        .await;

        assert_eq!(handle.configuration(), vec!["main", "s1"]);
        handle.send(Event::new("next")).await.unwrap();
        handle.send(Event::new("pause")).await.unwrap();
        eventually(|| handle.configuration() == vec!["paused"]).await;

        handle.send(Event::new("resume")).await.unwrap();
        eventually(|| handle.configuration() == vec!["main", "s2"]).await;
    }

    #[tokio::test]
    async fn test_deep_history_restores_atomic_descendants() {
        let handle = start(json!({
            "states": [
                {"id": "main", "states": [
                    {"id": "hist", "kind": "history", "history": "deep"},
                    {"id": "outer", "states": [
                        {"id": "inner1", "transitions": [{"event": "next", "target": "inner2"}]},
                        {"id": "inner2"}
                    ]}
                ], "transitions": [{"event": "pause", "target": "paused"}]},
                {"id": "paused", "transitions": [{"event": "resume", "target": "hist"}]}
            ]
        }))
        .await;

        handle.send(Event::new("next")).await.unwrap();
        handle.send(Event::new("pause")).await.unwrap();
        handle.send(Event::new("resume")).await.unwrap();
        eventually(|| handle.configuration() == vec!["main", "outer", "inner2"]).await;
    }

    #[tokio::test]
    async fn test_done_state_event_for_compound() {
        let handle = start(json!({
            "states": [
                {"id": "work", "states": [
                    {"id": "busy", "transitions": [{"event": "finish", "target": "finished"}]},
                    {"id": "finished", "kind": "final", "done_data": {"content": {"value": 42}}}
                ], "transitions": [{"event": "done.state.work", "target": "end"}]},
                {"id": "end", "kind": "final", "done_data": {"content": {"expr": "_event.data"}}}
            ]
        }))
        .await;

        handle.send(Event::new("finish")).await.unwrap();
        assert_eq!(handle.result().await.unwrap(), DataValue::from(42));
    }

    #[tokio::test]
    async fn test_parallel_completes_when_every_region_is_final() {
        let handle = start(json!({
            "states": [
                {"id": "p", "kind": "parallel", "states": [
                    {"id": "r1", "states": [
                        {"id": "r1a", "transitions": [{"event": "a", "target": "r1f"}]},
                        {"id": "r1f", "kind": "final"}
                    ]},
                    {"id": "r2", "states": [
                        {"id": "r2a", "transitions": [{"event": "b", "target": "r2f"}]},
                        {"id": "r2f", "kind": "final"}
                    ]}
                ], "transitions": [{"event": "done.state.p", "target": "end"}]},
                {"id": "end", "kind": "final", "done_data": {"content": {"value": "both"}}}
            ]
        }))
        .await;

        handle.send(Event::new("a")).await.unwrap();
        eventually(|| handle.is_in("r1f")).await;
        assert_eq!(handle.accepted().await, SessionStatus::Waiting);

        handle.send(Event::new("b")).await.unwrap();
        assert_eq!(handle.result().await.unwrap(), DataValue::from("both"));
    }

    #[tokio::test]
    async fn test_descendant_transition_preempts_ancestor() {
        let handle = start(json!({
            "data": [{"id": "winner", "value": ""}],
            "states": [
                {"id": "outer", "states": [
                    {"id": "inner", "transitions": [{"event": "go", "target": "f", "actions": [
                        {"assign": {"location": "ctx.winner", "value": "inner"}}
                    ]}]}
                ], "transitions": [{"event": "go", "target": "f", "actions": [
                    {"assign": {"location": "ctx.winner", "value": "outer"}}
                ]}]},
                {"id": "f", "kind": "final", "done_data": {"content": {"expr": "ctx.winner"}}}
            ]
        }))
        .await;

        handle.send(Event::new("go")).await.unwrap();
        assert_eq!(handle.result().await.unwrap(), DataValue::from("inner"));
    }

    #[tokio::test]
    async fn test_send_payload_is_a_snapshot() {
        let handle = start(json!({
            "data": [{"id": "n", "value": 1}],
            "states": [
                {"id": "a", "on_entry": [
                    {"send": {"event": "echo", "namelist": "ctx.n", "params": [
                        {"name": "m", "expr": "ctx.n + 1"}
                    ]}},
                    {"assign": {"location": "ctx.n", "value": 5}}
                ], "transitions": [{"event": "echo", "target": "f"}]},
                {"id": "f", "kind": "final", "done_data": {"content": {"expr": "_event.data"}}}
            ]
        }))
        .await;

        let result = handle.result().await.unwrap();
        assert_eq!(result, DataValue::from_json(&json!({"n": 1, "m": 2})));
    }

    #[tokio::test]
    async fn test_foreach_and_if() {
        let handle = start(json!({
            "data": [
                {"id": "items", "value": [1, 2, 3]},
                {"id": "sum", "value": 0},
                {"id": "last", "value": -1}
            ],
            "states": [
                {"id": "a", "on_entry": [
                    {"foreach": {"array": "ctx.items", "item": "ctx.item", "index": "ctx.last", "actions": [
                        {"assign": {"location": "ctx.sum", "expr": "ctx.sum + ctx.item"}}
                    ]}},
                    {"if": {"cond": "ctx.sum > 10", "actions": [
                        {"assign": {"location": "ctx.size", "value": "big"}}
                    ], "else_if": [{"cond": "ctx.sum > 5", "actions": [
                        {"assign": {"location": "ctx.size", "value": "medium"}}
                    ]}], "else": [
                        {"assign": {"location": "ctx.size", "value": "small"}}
                    ]}}
                ], "transitions": [{"target": "f"}]},
                {"id": "f", "kind": "final", "done_data": {"params": [
                    {"name": "sum", "location": "ctx.sum"},
                    {"name": "size", "location": "ctx.size"},
                    {"name": "last", "location": "ctx.last"}
                ]}}
            ]
        }))
        .await;

        let result = handle.result().await.unwrap();
        assert_eq!(
            result,
            DataValue::from_json(&json!({"sum": 6, "size": "medium", "last": 2}))
        );
    }

    #[tokio::test]
    async fn test_late_binding_initializes_on_entry() {
        let handle = start(json!({
            "binding": "late",
            "data": [{"id": "seed", "value": 1}],
            "states": [
                {"id": "a", "transitions": [{"event": "go", "target": "b", "actions": [
                    {"assign": {"location": "ctx.seed", "value": 10}}
                ]}]},
                {"id": "b", "data": [{"id": "local", "expr": "ctx.seed + 1"}],
                 "transitions": [{"target": "f"}]},
                {"id": "f", "kind": "final", "done_data": {"content": {"expr": "ctx.local"}}}
            ]
        }))
        .await;

        handle.send(Event::new("go")).await.unwrap();
        assert_eq!(handle.result().await.unwrap(), DataValue::from(11));
    }

    #[tokio::test]
    async fn test_eventless_cycle_fails_session() {
        let handle = start(json!({
            "states": [
                {"id": "a", "transitions": [{"target": "b"}]},
                {"id": "b", "transitions": [{"target": "a"}]}
            ]
        }))
        .await;

        assert!(matches!(handle.status(), SessionStatus::Failed(_)));
        assert!(matches!(handle.result().await, Err(SessionError::Failed(_))));
    }

    #[tokio::test]
    async fn test_stop_and_destroy() {
        let model = model(counter_doc()).await;
        let signals = SessionSignals::default();

        let (first, stopped) = Session::new(
            "s1",
            model.clone(),
            Arc::new(DetachedContext),
            SessionConfig::default(),
            signals.clone(),
        );
        let (second, destroyed) = Session::new(
            "s2",
            model,
            Arc::new(DetachedContext),
            SessionConfig::default(),
            SessionSignals::default(),
        );
        first.spawn();
        second.spawn();
        stopped.accepted().await;
        destroyed.accepted().await;

        destroyed.destroy();
        assert_eq!(destroyed.finished().await, SessionStatus::Destroyed);
        assert!(matches!(destroyed.result().await, Err(SessionError::Destroyed)));
        assert!(matches!(
            destroyed.send(Event::new("inc")).await,
            Err(SessionError::Closed(_))
        ));
        assert_eq!(stopped.status(), SessionStatus::Waiting);

        signals.stop.trigger();
        assert_eq!(stopped.finished().await, SessionStatus::Stopped);
    }

    #[tokio::test]
    async fn test_concurrent_sessions_do_not_share_state() {
        let model = model(counter_doc()).await;

        let mut handles = Vec::new();
        for i in 0..16 {
            let (session, handle) = Session::new(
                format!("s{}", i),
                model.clone(),
                Arc::new(DetachedContext),
                SessionConfig::default(),
                SessionSignals::default(),
            );
            session.spawn();
            handles.push((i, handle));
        }

        let mut tasks = Vec::new();
        for (i, handle) in handles {
            tasks.push(tokio::spawn(async move {
                handle.accepted().await;
                for _ in 0..i {
                    handle.send(Event::new("inc")).await.unwrap();
                }
                handle.send(Event::new("finish")).await.unwrap();
                (i, handle.result().await.unwrap())
            }));
        }
        for task in tasks {
            let (i, result) = task.await.unwrap();
            assert_eq!(result, DataValue::from(i));
        }
    }

    #[tokio::test]
    async fn test_bounded_queue_rejects_try_send_when_full() {
        let config = SessionConfig {
            queue_capacity: Some(1),
            ..Default::default()
        };
        let (session, handle) = Session::new(
            "s1",
            model(counter_doc()).await,
            Arc::new(DetachedContext),
            config,
            SessionSignals::default(),
        );

        handle.try_send(Event::new("inc")).unwrap();
        assert!(matches!(
            handle.try_send(Event::new("inc")),
            Err(SessionError::QueueFull(_))
        ));

        session.spawn();
        handle.send(Event::new("finish")).await.unwrap();
        assert_eq!(handle.result().await.unwrap(), DataValue::from(1));
    }

    #[tokio::test]
    async fn test_invoke_cancelled_once_when_state_exits() {
        let ctx = Arc::new(MockContext::default());
        let (session, handle) = Session::new(
            "s1",
            model(json!({
                "states": [
                    {"id": "busy", "invokes": [{"id": "worker", "type": "scxml"}],
                     "transitions": [{"event": "leave", "target": "idle"}]},
                    {"id": "idle", "transitions": [{"event": "finish", "target": "end"}]},
                    {"id": "end", "kind": "final"}
                ]
            }))
            .await,
            ctx.clone(),
            SessionConfig::default(),
            SessionSignals::default(),
        );
        session.spawn();
        handle.accepted().await;
        assert_eq!(*ctx.started.lock(), vec!["worker"]);

        handle.send(Event::new("leave")).await.unwrap();
        handle.send(Event::new("finish")).await.unwrap();
        handle.result().await.unwrap();

        assert_eq!(*ctx.cancelled.lock(), vec!["worker"]);
        assert!(ctx.active.lock().is_empty());
    }

    #[tokio::test]
    async fn test_invoke_not_started_when_state_left_in_same_macrostep() {
        let ctx = Arc::new(MockContext::default());
        let (session, handle) = Session::new(
            "s1",
            model(json!({
                "states": [
                    {"id": "passing", "invokes": [{"id": "worker"}],
                     "transitions": [{"target": "resting"}]},
                    {"id": "resting"}
                ]
            }))
            .await,
            ctx.clone(),
            SessionConfig::default(),
            SessionSignals::default(),
        );
        session.spawn();
        handle.accepted().await;

        assert_eq!(handle.configuration(), vec!["resting"]);
        assert!(ctx.started.lock().is_empty());
    }

    #[tokio::test]
    async fn test_idle_suspend_and_resume_from_checkpoint() {
        let store = Arc::new(TestStore::default());
        let ctx = Arc::new(MockContext::default());
        let model = model(json!({
            "data": [{"id": "count", "value": 0}],
            "states": [
                {"id": "main", "invokes": [{"id": "worker"}], "states": [
                    {"id": "counting", "transitions": [
                        {"event": "inc", "actions": [
                            {"assign": {"location": "ctx.count", "expr": "ctx.count + 1"}}
                        ]},
                        {"event": "finish", "target": "done"}
                    ]}
                ]},
                {"id": "done", "kind": "final", "done_data": {"content": {"expr": "ctx.count"}}}
            ]
        }))
        .await;
        let config = SessionConfig {
            queue_capacity: None,
            idle_timeout: Some(Duration::from_millis(50)),
            store: Some(store.clone()),
        };

        let (session, handle) = Session::new(
            "s1",
            model.clone(),
            ctx.clone(),
            config.clone(),
            SessionSignals::default(),
        );
        session.spawn();
        handle.accepted().await;
        handle.send(Event::new("inc")).await.unwrap();

        let mut status = handle.subscribe();
        status
            .wait_for(|s| *s == SessionStatus::Suspended)
            .await
            .unwrap();
        let before = handle.configuration();

        let bytes = store.load("s1").unwrap().unwrap();
        let checkpoint = Checkpoint::decode(&bytes).unwrap();
        assert_eq!(checkpoint.invokes.len(), 1);
        assert_eq!(checkpoint.data.path("count"), DataValue::from(1));

        // Queued while suspended.
        handle.send(Event::new("inc")).await.unwrap();

        let resumed = Session::attach(
            &handle,
            model,
            ctx.clone(),
            config,
            SessionSignals::default(),
        )
        .unwrap()
        .restore_from(checkpoint)
        .unwrap();
        resumed.spawn();
        handle.accepted().await;

        assert_eq!(handle.configuration(), before);
        assert_eq!(*ctx.started.lock(), vec!["worker"]);

        handle.send(Event::new("finish")).await.unwrap();
        assert_eq!(handle.result().await.unwrap(), DataValue::from(2));
        assert!(store.load("s1").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_restore_in_new_host_restarts_invokes() {
        let store = Arc::new(TestStore::default());
        let model = model(json!({
            "states": [
                {"id": "busy", "invokes": [{"id": "worker"}],
                 "transitions": [{"event": "finish", "target": "end"}]},
                {"id": "end", "kind": "final"}
            ]
        }))
        .await;
        let config = SessionConfig {
            store: Some(store.clone()),
            ..Default::default()
        };
        let signals = SessionSignals::default();

        let (session, handle) = Session::new(
            "s1",
            model.clone(),
            Arc::new(MockContext::default()),
            config.clone(),
            signals.clone(),
        );
        session.spawn();
        handle.accepted().await;
        signals.suspend.trigger();
        handle
            .subscribe()
            .wait_for(|s| *s == SessionStatus::Suspended)
            .await
            .unwrap();

        let checkpoint = Checkpoint::decode(&store.load("s1").unwrap().unwrap()).unwrap();
        let fresh = Arc::new(MockContext::default());
        let (restored, handle) = Session::new(
            "s1",
            model,
            fresh.clone(),
            config,
            SessionSignals::default(),
        );
        restored.restore_from(checkpoint).unwrap().spawn();
        handle.accepted().await;

        assert_eq!(handle.configuration(), vec!["busy"]);
        assert_eq!(*fresh.started.lock(), vec!["worker"]);
    }

    #[tokio::test]
    async fn test_restore_in_new_host_reschedules_delayed_send() {
        let store = Arc::new(TestStore::default());
        let model = model(json!({
            "states": [
                {"id": "waiting", "on_entry": [
                    {"send": {"event": "timeout", "delay": "150ms", "id": "t1"}}
                ], "transitions": [{"event": "timeout", "target": "late"}]},
                {"id": "late", "kind": "final", "done_data": {"content": {"value": "late"}}}
            ]
        }))
        .await;
        let config = SessionConfig {
            store: Some(store.clone()),
            ..Default::default()
        };
        let signals = SessionSignals::default();

        let (session, handle) = Session::new(
            "s1",
            model.clone(),
            Arc::new(DetachedContext),
            config.clone(),
            signals.clone(),
        );
        session.spawn();
        handle.accepted().await;
        signals.suspend.trigger();
        handle
            .subscribe()
            .wait_for(|s| *s == SessionStatus::Suspended)
            .await
            .unwrap();

        let checkpoint = Checkpoint::decode(&store.load("s1").unwrap().unwrap()).unwrap();
        assert_eq!(checkpoint.delayed.len(), 1);
        assert_eq!(checkpoint.delayed[0].send_id, "t1");
        assert_eq!(checkpoint.delayed[0].event.name.as_str(), "timeout");

        let (restored, handle) = Session::new(
            "s1",
            model,
            Arc::new(DetachedContext),
            config,
            SessionSignals::default(),
        );
        restored.restore_from(checkpoint).unwrap().spawn();
        handle.accepted().await;
        assert_eq!(handle.pending_sends(), 1);

        let result = tokio::time::timeout(Duration::from_secs(2), handle.result())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, DataValue::from("late"));
    }

    #[tokio::test]
    async fn test_overdue_delayed_send_fires_on_restore() {
        let store = Arc::new(TestStore::default());
        let model = model(json!({
            "states": [
                {"id": "waiting", "transitions": [{"event": "timeout", "target": "late"}]},
                {"id": "late", "kind": "final"}
            ]
        }))
        .await;
        let config = SessionConfig {
            store: Some(store.clone()),
            ..Default::default()
        };
        let signals = SessionSignals::default();

        let (session, handle) = Session::new(
            "s1",
            model.clone(),
            Arc::new(DetachedContext),
            config.clone(),
            signals.clone(),
        );
        session.spawn();
        handle.accepted().await;
        signals.suspend.trigger();
        handle
            .subscribe()
            .wait_for(|s| *s == SessionStatus::Suspended)
            .await
            .unwrap();

        let mut checkpoint = Checkpoint::decode(&store.load("s1").unwrap().unwrap()).unwrap();
        assert!(checkpoint.delayed.is_empty());
        checkpoint.delayed.push(DelayedRecord {
            send_id: "t1".to_string(),
            target: None,
            event: Event::new("timeout"),
            due: Utc::now() - chrono::Duration::seconds(60),
        });

        let (restored, handle) = Session::new(
            "s1",
            model,
            Arc::new(DetachedContext),
            config,
            SessionSignals::default(),
        );
        restored.restore_from(checkpoint).unwrap().spawn();

        let status = tokio::time::timeout(Duration::from_secs(2), handle.finished())
            .await
            .unwrap();
        assert!(matches!(status, SessionStatus::Completed(_)));
    }

    #[tokio::test]
    async fn test_restore_rejects_foreign_checkpoint() {
        let model = model(counter_doc()).await;
        let (session, _handle) = Session::new(
            "s1",
            model,
            Arc::new(DetachedContext),
            SessionConfig::default(),
            SessionSignals::default(),
        );
        let mut checkpoint = session.checkpoint();
        checkpoint.configuration = vec![DocumentId(999)];

        assert!(session.restore_from(checkpoint).is_err());
    }
}
