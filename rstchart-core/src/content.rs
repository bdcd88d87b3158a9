//! Executable content, sends and invokes.

use crate::error::SessionError;
use crate::invoke::{InvokeConfig, SCXML_INVOKE_TYPE, SCXML_INVOKE_TYPE_URI};
use crate::session::{ActiveInvoke, DelayedSend, Session};
use chrono::Utc;
use rstchart_model::event::{ERROR_COMMUNICATION, ERROR_EXECUTION};
use rstchart_model::expr::ValueExpr;
use rstchart_model::model::{NameRef, Param, ParamSource, SendAction, StrSource, ValueSource};
use rstchart_model::{Action, DocumentId, Event, EventType, InvokeNode};
use rstchart_value::{DataObject, DataValue};
use std::time::Duration;
use tokio::sync::oneshot;

/// Target that puts the event on the sender's internal queue.
pub const TARGET_INTERNAL: &str = "#_internal";
/// Target of the invoking session.
pub const TARGET_PARENT: &str = "#_parent";
/// Prefix of session targets, `#_scxml_<sessionid>`.
pub const TARGET_SESSION_PREFIX: &str = "#_scxml_";

/// An error event produced by a failing action. The rest of the block is
/// skipped.
#[derive(Debug)]
struct Raised {
    name: &'static str,
    message: String,
    send_id: Option<String>,
}

impl Raised {
    fn execution(message: impl Into<String>) -> Self {
        Self {
            name: ERROR_EXECUTION,
            message: message.into(),
            send_id: None,
        }
    }

    fn communication(message: impl Into<String>, send_id: &str) -> Self {
        Self {
            name: ERROR_COMMUNICATION,
            message: message.into(),
            send_id: Some(send_id.to_string()),
        }
    }
}

impl From<rstchart_model::EvalError> for Raised {
    fn from(e: rstchart_model::EvalError) -> Self {
        Raised::execution(e.to_string())
    }
}

impl From<rstchart_model::ModelError> for Raised {
    fn from(e: rstchart_model::ModelError) -> Self {
        Raised::execution(e.to_string())
    }
}

impl From<rstchart_value::ValueError> for Raised {
    fn from(e: rstchart_value::ValueError) -> Self {
        Raised::execution(e.to_string())
    }
}

/// Parses a delay such as `500ms`, `2s`, `1.5min` or `1h`. A bare number is
/// milliseconds and an empty string means no delay.
pub fn parse_delay(text: &str) -> Option<Duration> {
    let text = text.trim();
    if text.is_empty() {
        return Some(Duration::ZERO);
    }
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let value: f64 = number.parse().ok()?;
    let millis = match unit.trim() {
        "" | "ms" => value,
        "s" => value * 1_000.0,
        "m" | "min" => value * 60_000.0,
        "h" => value * 3_600_000.0,
        _ => return None,
    };
    if !millis.is_finite() || millis < 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(millis / 1_000.0).ok()
}

fn is_scxml_type(type_: &str) -> bool {
    let t = type_.trim_end_matches('/');
    t == SCXML_INVOKE_TYPE || t == SCXML_INVOKE_TYPE_URI.trim_end_matches('/')
}

impl Session {
    /// Runs a block of executable content. The first failing action raises
    /// its error event and ends the block.
    pub(crate) fn execute_block(&mut self, actions: &[Action]) {
        if let Err(raised) = self.execute_actions(actions) {
            self.raise_error(raised.name, raised.message, raised.send_id);
        }
    }

    fn execute_actions(&mut self, actions: &[Action]) -> Result<(), Raised> {
        for action in actions {
            self.execute(action)?;
        }
        Ok(())
    }

    fn execute(&mut self, action: &Action) -> Result<(), Raised> {
        match action {
            Action::Raise { event } => {
                self.internal.push_back(Event::internal(event.clone()));
            }
            Action::Send(send) => self.execute_send(send)?,
            Action::Cancel { sendid } => {
                let send_id = self.eval_str(sendid)?;
                if self.shared.cancel_delayed(&send_id) {
                    tracing::debug!("[{}] Cancelled send '{}'", self.id, send_id);
                }
            }
            Action::Log { label, expr } => {
                let value = match expr {
                    Some(expr) => self.eval_value(expr)?,
                    None => DataValue::Undefined,
                };
                match label {
                    Some(label) => tracing::info!("[{}] {}: {}", self.id, label, value),
                    None => tracing::info!("[{}] {}", self.id, value),
                }
            }
            Action::Assign { location, value } => {
                let value = self.eval_source(value)?;
                location.eval.assign(&self.scope(), value)?;
            }
            Action::If { branches } => {
                for branch in branches {
                    let taken = match &branch.cond {
                        Some(cond) => cond.eval.evaluate(&self.scope())?,
                        None => true,
                    };
                    if taken {
                        self.execute_actions(&branch.actions)?;
                        break;
                    }
                }
            }
            Action::Foreach {
                array,
                item,
                index,
                actions,
            } => {
                let value = self.eval_value(array)?;
                let items = match value.as_array() {
                    Some(items) => items.to_vec(),
                    None => {
                        return Err(Raised::execution(format!(
                            "foreach over {} '{}'",
                            value.type_name(),
                            array.source
                        )))
                    }
                };
                for (i, entry) in items.into_iter().enumerate() {
                    item.eval.assign(&self.scope(), entry)?;
                    if let Some(index) = index {
                        index.eval.assign(&self.scope(), DataValue::from(i as f64))?;
                    }
                    self.execute_actions(actions)?;
                }
            }
            Action::Script(script) => {
                let model = self.model.clone();
                model.script(*script)?.eval.execute(&self.scope())?;
            }
        }
        Ok(())
    }

    fn eval_value(&self, expr: &ValueExpr) -> Result<DataValue, Raised> {
        Ok(expr.eval.evaluate(&self.scope())?)
    }

    fn eval_source(&self, source: &ValueSource) -> Result<DataValue, Raised> {
        match source {
            ValueSource::Expr(expr) => self.eval_value(expr),
            ValueSource::Literal(value) => Ok(value.deep_clone(false)),
        }
    }

    fn eval_str(&self, source: &StrSource) -> Result<String, Raised> {
        match source {
            StrSource::Literal(s) => Ok(s.clone()),
            StrSource::Expr(expr) => {
                let value = self.eval_value(expr)?;
                Ok(match value.as_str() {
                    Some(s) => s.to_string(),
                    None => value.to_string(),
                })
            }
        }
    }

    fn eval_opt_str(&self, source: &Option<StrSource>) -> Result<Option<String>, Raised> {
        source.as_ref().map(|s| self.eval_str(s)).transpose()
    }

    /// Builds an event payload. Content wins over namelist and params.
    fn payload(
        &self,
        namelist: &[NameRef],
        params: &[Param],
        content: Option<&ValueSource>,
    ) -> Result<DataValue, Raised> {
        if let Some(content) = content {
            return self.eval_source(content);
        }
        if namelist.is_empty() && params.is_empty() {
            return Ok(DataValue::Undefined);
        }
        Ok(DataValue::Object(self.param_object(namelist, params)?))
    }

    fn param_object(&self, namelist: &[NameRef], params: &[Param]) -> Result<DataObject, Raised> {
        let object = DataObject::new();
        for name in namelist {
            let value = name.location.eval.read(&self.scope())?;
            object.set(name.name.clone(), value)?;
        }
        for param in params {
            let value = match &param.source {
                ParamSource::Expr(expr) => self.eval_value(expr)?,
                ParamSource::Location(location) => location.eval.read(&self.scope())?,
            };
            object.set(param.name.clone(), value)?;
        }
        Ok(object)
    }

    pub(crate) fn evaluate_done_data(&mut self, state: DocumentId) -> Result<DataValue, SessionError> {
        let model = self.model.clone();
        let Some(done) = &model.state(state)?.done_data else {
            return Ok(DataValue::Undefined);
        };
        match self.payload(&[], &done.params, done.content.as_ref()) {
            Ok(value) => Ok(value.deep_clone(true)),
            Err(raised) => {
                self.raise_error(raised.name, raised.message, raised.send_id);
                Ok(DataValue::Undefined)
            }
        }
    }

    fn execute_send(&mut self, send: &SendAction) -> Result<(), Raised> {
        // Content-only sends carry an empty event name.
        let name = self.eval_opt_str(&send.event)?.unwrap_or_default();
        let target = self.eval_opt_str(&send.target)?;
        let type_ = self.eval_opt_str(&send.type_)?;

        let send_id = match &send.id {
            Some(id) => id.clone(),
            None => format!("send.{}", uuid::Uuid::new_v4().simple()),
        };
        if let Some(location) = &send.idlocation {
            location
                .eval
                .assign(&self.scope(), DataValue::from(send_id.as_str()))?;
        }

        let delay = match self.eval_opt_str(&send.delay)? {
            Some(text) => parse_delay(&text)
                .ok_or_else(|| Raised::execution(format!("invalid delay '{}'", text)))?,
            None => Duration::ZERO,
        };

        if let Some(type_) = &type_ {
            if !is_scxml_type(type_) {
                return Err(Raised::execution(format!("unsupported send type '{}'", type_)));
            }
        }

        let data = self
            .payload(&send.namelist, &send.params, send.content.as_ref())?
            .deep_clone(true);
        let event = Event::new(name)
            .with_data(data)
            .with_send_id(send_id.clone())
            .with_origin(
                format!("{}{}", TARGET_SESSION_PREFIX, self.id),
                SCXML_INVOKE_TYPE_URI,
            );

        if target.as_deref() == Some(TARGET_INTERNAL) {
            if !delay.is_zero() {
                return Err(Raised::execution("delayed send to #_internal"));
            }
            tracing::debug!("[{}] Send '{}' to #_internal", self.id, event.name);
            self.internal.push_back(Event {
                kind: EventType::Internal,
                ..event
            });
            return Ok(());
        }

        if delay.is_zero() {
            tracing::debug!(
                "[{}] Send '{}' to {}",
                self.id,
                event.name,
                target.as_deref().unwrap_or("self")
            );
            return self
                .deliver(target.as_deref(), event)
                .map_err(|message| Raised::communication(message, &send_id));
        }

        self.schedule(send_id, target, event, delay);
        Ok(())
    }

    /// Delivers a sent event right away.
    fn deliver(&self, target: Option<&str>, event: Event) -> Result<(), String> {
        let own = format!("{}{}", TARGET_SESSION_PREFIX, self.id);
        match target {
            None | Some("") => self.shared.sender.try_send(event).map_err(|e| e.to_string()),
            Some(t) if t == own => self.shared.sender.try_send(event).map_err(|e| e.to_string()),
            Some(t) => self.ctx.route(&self.id, t, event).map_err(|e| e.to_string()),
        }
    }

    /// Starts the timer task of a delayed send. The task only starts its
    /// clock once it is registered, so it can always be cancelled.
    fn schedule(&mut self, send_id: String, target: Option<String>, event: Event, delay: Duration) {
        tracing::debug!(
            "[{}] Send '{}' scheduled in {:?} as '{}'",
            self.id,
            event.name,
            delay,
            send_id
        );

        let shared = self.shared.clone();
        let ctx = self.ctx.clone();
        let id = send_id.clone();
        let (armed_tx, armed_rx) = oneshot::channel::<()>();
        // Delays past chrono's range are recorded a millennium out.
        let now = Utc::now();
        let due = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or_else(|| now + chrono::Duration::days(365_000));
        let record_target = target.clone();
        let record_event = event.clone();

        let task = tokio::spawn(async move {
            if armed_rx.await.is_err() {
                return;
            }
            tokio::time::sleep(delay).await;
            if shared.delayed.remove(&id).is_none() {
                return;
            }

            let own = format!("{}{}", TARGET_SESSION_PREFIX, shared.id);
            let result = match target.as_deref() {
                None | Some("") => shared.sender.try_send(event).map_err(|e| e.to_string()),
                Some(t) if t == own => shared.sender.try_send(event).map_err(|e| e.to_string()),
                Some(t) => ctx.route(&shared.id, t, event).map_err(|e| e.to_string()),
            };
            if let Err(message) = result {
                tracing::warn!("[{}] Delayed send '{}' failed: {}", shared.id, id, message);
                let _ = shared
                    .sender
                    .try_send(Event::error(ERROR_COMMUNICATION, message, Some(id)));
            }
        });

        let pending = DelayedSend {
            abort: task.abort_handle(),
            target: record_target,
            event: record_event,
            due,
        };
        if let Some(previous) = self.shared.delayed.insert(send_id, pending) {
            previous.abort.abort();
        }
        let _ = armed_tx.send(());
    }

    /// Starts the timers of delayed sends read from a checkpoint. Sends that
    /// came due while the session was down fire right away.
    pub(crate) fn reschedule_sends(&mut self) {
        let now = Utc::now();
        for record in std::mem::take(&mut self.restored_sends) {
            if self.shared.delayed.contains_key(&record.send_id) {
                continue;
            }
            let remaining = (record.due - now).to_std().unwrap_or(Duration::ZERO);
            tracing::info!(
                "[{}] Rescheduling send '{}' in {:?}",
                self.id,
                record.send_id,
                remaining
            );
            self.schedule(record.send_id, record.target, record.event, remaining);
        }
    }

    /// Starts the invokes of every state entered during the macrostep that
    /// is still active.
    pub(crate) fn start_invokes(&mut self) -> Result<(), SessionError> {
        let pending = std::mem::take(&mut self.states_to_invoke);
        let model = self.model.clone();
        for state in pending {
            if !self.configuration.contains(&state) {
                continue;
            }
            for index in 0..model.state(state)?.invokes.len() {
                self.start_invoke(state, index, None)?;
            }
        }
        Ok(())
    }

    /// Starts again every recorded invoke the host no longer knows about.
    /// Used when a session is restored in a fresh host.
    pub(crate) fn restart_invokes(&mut self) -> Result<(), SessionError> {
        let recorded: Vec<(String, ActiveInvoke)> = self
            .invokes
            .iter()
            .map(|(id, active)| (id.clone(), active.clone()))
            .collect();
        for (invoke_id, active) in recorded {
            if self.ctx.invoke_active(&self.id, &invoke_id) {
                continue;
            }
            self.invokes.remove(&invoke_id);
            tracing::info!("[{}] Restarting invoke '{}'", self.id, invoke_id);
            self.start_invoke(active.state, active.index, Some(invoke_id))?;
        }
        Ok(())
    }

    fn start_invoke(
        &mut self,
        state: DocumentId,
        index: usize,
        invoke_id: Option<String>,
    ) -> Result<(), SessionError> {
        let model = self.model.clone();
        let node = model.state(state)?;
        let Some(invoke) = node.invokes.get(index) else {
            return Err(SessionError::Invoke(format!(
                "state '{}' has no invoke #{}",
                node.name, index
            )));
        };

        let config = match self.invoke_config(&node.name, invoke, invoke_id) {
            Ok(config) => config,
            Err(raised) => {
                self.raise_error(raised.name, raised.message, raised.send_id);
                return Ok(());
            }
        };
        let invoke_id = config.invoke_id.clone();
        self.invokes.insert(
            invoke_id.clone(),
            ActiveInvoke {
                state,
                index,
                autoforward: invoke.autoforward,
            },
        );

        tracing::info!(
            "[{}] Invoke '{}' of type '{}' in '{}'",
            self.id,
            invoke_id,
            config.type_,
            node.name
        );
        if let Err(e) = self.ctx.start_invoke(&self.id, config) {
            self.invokes.remove(&invoke_id);
            self.raise_error(ERROR_EXECUTION, format!("invoke '{}': {}", invoke_id, e), None);
        }
        Ok(())
    }

    fn invoke_config(
        &self,
        state: &str,
        invoke: &InvokeNode,
        invoke_id: Option<String>,
    ) -> Result<InvokeConfig, Raised> {
        let invoke_id = match invoke_id.or_else(|| invoke.id.clone()) {
            Some(id) => id,
            None => {
                let id = format!("{}.{}", state, uuid::Uuid::new_v4().simple());
                if let Some(location) = &invoke.idlocation {
                    location
                        .eval
                        .assign(&self.scope(), DataValue::from(id.as_str()))?;
                }
                id
            }
        };
        let type_ = self
            .eval_opt_str(&invoke.type_)?
            .unwrap_or_else(|| SCXML_INVOKE_TYPE.to_string());
        let src = self.eval_opt_str(&invoke.src)?;
        let content = match &invoke.content {
            Some(content) => Some(self.eval_source(content)?.deep_clone(true)),
            None => None,
        };
        let params = self.param_object(&invoke.namelist, &invoke.params)?;

        Ok(InvokeConfig {
            invoke_id,
            parent_id: self.id.clone(),
            state: state.to_string(),
            type_,
            src,
            content,
            params: match DataValue::Object(params).deep_clone(true) {
                DataValue::Object(params) => params,
                _ => DataObject::new(),
            },
            autoforward: invoke.autoforward,
        })
    }

    /// Cancels every invoke owned by `state`.
    pub(crate) fn cancel_invokes_of(&mut self, state: DocumentId) {
        let owned: Vec<String> = self
            .invokes
            .iter()
            .filter(|(_, active)| active.state == state)
            .map(|(id, _)| id.clone())
            .collect();
        for invoke_id in owned {
            self.cancel_invoke(&invoke_id);
        }
    }

    pub(crate) fn cancel_all_invokes(&mut self) {
        let all: Vec<String> = self.invokes.keys().cloned().collect();
        for invoke_id in all {
            self.cancel_invoke(&invoke_id);
        }
    }

    fn cancel_invoke(&mut self, invoke_id: &str) {
        self.invokes.remove(invoke_id);
        if self.ctx.cancel_invoke(&self.id, invoke_id) {
            tracing::info!("[{}] Cancelled invoke '{}'", self.id, invoke_id);
        }
    }
}
