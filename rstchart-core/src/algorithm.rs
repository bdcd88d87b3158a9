//! Transition selection, exit and entry.
//!
//! Follows the W3C SCXML interpretation algorithm. Document ids double as
//! document order, so `BTreeSet<DocumentId>` iterates states in entry order
//! and its reverse in exit order.

use crate::error::SessionError;
use crate::session::Session;
use rstchart_model::document::{BindingMode, HistoryKind, TransitionKind};
use rstchart_model::event::{DONE_STATE_PREFIX, ERROR_EXECUTION};
use rstchart_model::{DocumentId, Event, StateKind};
use std::collections::{BTreeSet, HashMap};

/// States collected for one entry pass.
#[derive(Debug, Default)]
struct EntrySet {
    states: BTreeSet<DocumentId>,
    /// Compound states entered through their default initial transition.
    default_entry: BTreeSet<DocumentId>,
    /// Parent of a history state without a stored value → the history's
    /// default transition whose content runs after the parent's entry.
    history_content: HashMap<DocumentId, DocumentId>,
}

impl Session {
    /// Returns the optimal enabled transition set for `event`, or the
    /// eventless set when `event` is `None`.
    pub(crate) fn select_transitions(
        &mut self,
        event: Option<&Event>,
    ) -> Result<Vec<DocumentId>, SessionError> {
        let model = self.model.clone();
        let atomic: Vec<DocumentId> = self
            .configuration
            .iter()
            .copied()
            .filter(|id| model.state(*id).map(|s| s.is_atomic()).unwrap_or(false))
            .collect();

        let mut enabled = Vec::new();
        for state in atomic {
            let chain = std::iter::once(state).chain(model.ancestors(state, None));
            'chain: for source in chain {
                for &tid in &model.state(source)?.transitions {
                    let transition = model.transition(tid)?;
                    let matched = match event {
                        None => transition.is_eventless(),
                        Some(e) => !transition.is_eventless() && transition.matches(&e.name),
                    };
                    if matched && self.condition_holds(tid)? {
                        if !enabled.contains(&tid) {
                            enabled.push(tid);
                        }
                        break 'chain;
                    }
                }
            }
        }

        self.remove_conflicting(enabled)
    }

    fn condition_holds(&mut self, transition: DocumentId) -> Result<bool, SessionError> {
        let model = self.model.clone();
        let Some(cond) = &model.transition(transition)?.cond else {
            return Ok(true);
        };
        let result = cond.eval.evaluate(&self.scope());
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                self.raise_error(
                    ERROR_EXECUTION,
                    format!("condition '{}': {}", cond.source, e),
                    None,
                );
                Ok(false)
            }
        }
    }

    /// Drops transitions whose exit sets intersect an earlier selection.
    /// A transition from a descendant preempts one from its ancestor.
    fn remove_conflicting(
        &self,
        enabled: Vec<DocumentId>,
    ) -> Result<Vec<DocumentId>, SessionError> {
        let mut filtered: Vec<(DocumentId, BTreeSet<DocumentId>)> = Vec::new();
        for t1 in enabled {
            let exit1 = self.exit_set(&[t1])?;
            let source1 = self.model.transition(t1)?.source;
            let mut preempted = false;
            let mut displaced = Vec::new();

            for (t2, exit2) in &filtered {
                if exit1.is_disjoint(exit2) {
                    continue;
                }
                let source2 = self.model.transition(*t2)?.source;
                if self.model.is_descendant(source1, source2) {
                    displaced.push(*t2);
                } else {
                    preempted = true;
                    break;
                }
            }

            if !preempted {
                filtered.retain(|(t, _)| !displaced.contains(t));
                filtered.push((t1, exit1));
            }
        }
        Ok(filtered.into_iter().map(|(t, _)| t).collect())
    }

    /// Active states left by the given transitions.
    fn exit_set(&self, transitions: &[DocumentId]) -> Result<BTreeSet<DocumentId>, SessionError> {
        let mut out = BTreeSet::new();
        for &tid in transitions {
            if self.model.transition(tid)?.is_targetless() {
                continue;
            }
            if let Some(domain) = self.transition_domain(tid)? {
                out.extend(
                    self.configuration
                        .iter()
                        .filter(|s| self.model.is_descendant(**s, domain)),
                );
            }
        }
        Ok(out)
    }

    fn transition_domain(&self, tid: DocumentId) -> Result<Option<DocumentId>, SessionError> {
        let transition = self.model.transition(tid)?;
        let targets = self.effective_targets(tid)?;
        if targets.is_empty() {
            return Ok(None);
        }
        let source = transition.source;
        if source == self.model.root() {
            return Ok(Some(source));
        }
        if transition.kind == TransitionKind::Internal
            && self.model.state(source)?.is_compound()
            && targets.iter().all(|t| self.model.is_descendant(*t, source))
        {
            return Ok(Some(source));
        }
        let mut members = vec![source];
        members.extend(targets);
        Ok(Some(self.lcca(&members)?))
    }

    /// Least common compound ancestor. The root counts as compound.
    fn lcca(&self, states: &[DocumentId]) -> Result<DocumentId, SessionError> {
        let root = self.model.root();
        let Some((head, tail)) = states.split_first() else {
            return Ok(root);
        };
        for ancestor in self.model.ancestors(*head, None) {
            if ancestor != root && !self.model.state(ancestor)?.is_compound() {
                continue;
            }
            if tail.iter().all(|s| self.model.is_descendant(*s, ancestor)) {
                return Ok(ancestor);
            }
        }
        Ok(root)
    }

    /// Targets with history states replaced by what they stand for.
    fn effective_targets(&self, tid: DocumentId) -> Result<BTreeSet<DocumentId>, SessionError> {
        let mut out = BTreeSet::new();
        for &target in &self.model.transition(tid)?.targets {
            let state = self.model.state(target)?;
            if !state.is_history() {
                out.insert(target);
            } else if let Some(stored) = self.history.get(&target) {
                out.extend(stored.iter().copied());
            } else if let Some(&default) = state.transitions.first() {
                out.extend(self.effective_targets(default)?);
            }
        }
        Ok(out)
    }

    pub(crate) fn microstep(&mut self, enabled: &[DocumentId]) -> Result<(), SessionError> {
        self.exit_states(enabled)?;
        let model = self.model.clone();
        for &tid in enabled {
            let transition = model.transition(tid)?;
            tracing::debug!(
                "[{}] Transition {} from '{}'",
                self.id,
                tid,
                model.state(transition.source)?.name
            );
            self.execute_block(&transition.actions);
        }
        self.enter_states(enabled)
    }

    fn exit_states(&mut self, enabled: &[DocumentId]) -> Result<(), SessionError> {
        let model = self.model.clone();
        let exit = self.exit_set(enabled)?;
        for id in &exit {
            self.states_to_invoke.remove(id);
        }

        for &id in exit.iter().rev() {
            for &child in &model.state(id)?.children {
                let StateKind::History(kind) = model.state(child)?.kind else {
                    continue;
                };
                let recorded: Vec<DocumentId> = self
                    .configuration
                    .iter()
                    .copied()
                    .filter(|s| match kind {
                        HistoryKind::Deep => {
                            model.is_descendant(*s, id)
                                && model.state(*s).map(|n| n.is_atomic()).unwrap_or(false)
                        }
                        HistoryKind::Shallow => {
                            model.state(*s).map(|n| n.parent == Some(id)).unwrap_or(false)
                        }
                    })
                    .collect();
                self.history.insert(child, recorded);
            }
        }

        for &id in exit.iter().rev() {
            let state = model.state(id)?;
            tracing::debug!("[{}] Exit '{}'", self.id, state.name);
            self.execute_block(&state.on_exit);
            self.cancel_invokes_of(id);
            self.configuration.remove(&id);
        }
        Ok(())
    }

    pub(crate) fn enter_states(&mut self, enabled: &[DocumentId]) -> Result<(), SessionError> {
        let model = self.model.clone();
        let mut entry = EntrySet::default();
        self.compute_entry_set(enabled, &mut entry)?;

        for &id in &entry.states {
            let state = model.state(id)?;
            self.configuration.insert(id);
            self.states_to_invoke.insert(id);
            if model.binding() == BindingMode::Late {
                self.init_data(id)?;
            }

            tracing::debug!("[{}] Enter '{}'", self.id, state.name);
            self.execute_block(&state.on_entry);

            if entry.default_entry.contains(&id) {
                if let Some(initial) = state.initial {
                    self.execute_block(&model.transition(initial)?.actions);
                }
            }
            if let Some(&default) = entry.history_content.get(&id) {
                self.execute_block(&model.transition(default)?.actions);
            }

            if state.is_final() {
                self.final_entered(id)?;
            }
        }
        Ok(())
    }

    fn final_entered(&mut self, id: DocumentId) -> Result<(), SessionError> {
        let model = self.model.clone();
        let state = model.state(id)?;
        let Some(parent) = state.parent else {
            return Ok(());
        };

        if parent == model.root() {
            self.running = false;
            self.done_data = Some(self.evaluate_done_data(id)?);
            return Ok(());
        }

        let done = self.evaluate_done_data(id)?;
        let parent_node = model.state(parent)?;
        self.internal.push_back(
            Event::platform(format!("{}{}", DONE_STATE_PREFIX, parent_node.name)).with_data(done),
        );

        if let Some(grandparent) = parent_node.parent {
            let node = model.state(grandparent)?;
            if node.is_parallel() {
                let mut complete = true;
                for &child in &node.children {
                    if model.state(child)?.is_history() {
                        continue;
                    }
                    if !self.in_final_state(child)? {
                        complete = false;
                        break;
                    }
                }
                if complete {
                    self.internal.push_back(Event::platform(format!(
                        "{}{}",
                        DONE_STATE_PREFIX, node.name
                    )));
                }
            }
        }
        Ok(())
    }

    pub(crate) fn in_final_state(&self, id: DocumentId) -> Result<bool, SessionError> {
        let state = self.model.state(id)?;
        if state.is_compound() {
            for &child in &state.children {
                if self.model.state(child)?.is_final() && self.configuration.contains(&child) {
                    return Ok(true);
                }
            }
            return Ok(false);
        }
        if state.is_parallel() {
            for &child in &state.children {
                if self.model.state(child)?.is_history() {
                    continue;
                }
                if !self.in_final_state(child)? {
                    return Ok(false);
                }
            }
            return Ok(true);
        }
        Ok(false)
    }

    fn compute_entry_set(
        &self,
        transitions: &[DocumentId],
        entry: &mut EntrySet,
    ) -> Result<(), SessionError> {
        for &tid in transitions {
            let transition = self.model.transition(tid)?;
            for &target in &transition.targets {
                self.add_descendants(target, entry)?;
            }
            let domain = self.transition_domain(tid)?;
            for target in self.effective_targets(tid)? {
                self.add_ancestors(target, domain, entry)?;
            }
        }
        Ok(())
    }

    fn add_descendants(&self, id: DocumentId, entry: &mut EntrySet) -> Result<(), SessionError> {
        let state = self.model.state(id)?;

        if state.is_history() {
            let parent = state.parent.unwrap_or(self.model.root());
            let targets = match self.history.get(&id) {
                Some(stored) => stored.clone(),
                None => {
                    let Some(&default) = state.transitions.first() else {
                        return Ok(());
                    };
                    entry.history_content.insert(parent, default);
                    self.model.transition(default)?.targets.clone()
                }
            };
            for &target in &targets {
                self.add_descendants(target, entry)?;
            }
            for &target in &targets {
                self.add_ancestors(target, Some(parent), entry)?;
            }
            return Ok(());
        }

        entry.states.insert(id);
        if state.is_compound() {
            entry.default_entry.insert(id);
            if let Some(initial) = state.initial {
                let targets = self.model.transition(initial)?.targets.clone();
                for &target in &targets {
                    self.add_descendants(target, entry)?;
                }
                for &target in &targets {
                    self.add_ancestors(target, Some(id), entry)?;
                }
            }
        } else if state.is_parallel() {
            self.add_parallel_children(id, entry)?;
        }
        Ok(())
    }

    fn add_ancestors(
        &self,
        id: DocumentId,
        upto: Option<DocumentId>,
        entry: &mut EntrySet,
    ) -> Result<(), SessionError> {
        let root = self.model.root();
        for ancestor in self.model.ancestors(id, upto) {
            if ancestor == root {
                continue;
            }
            entry.states.insert(ancestor);
            if self.model.state(ancestor)?.is_parallel() {
                self.add_parallel_children(ancestor, entry)?;
            }
        }
        Ok(())
    }

    /// Enters every region of a parallel state not already covered.
    fn add_parallel_children(
        &self,
        id: DocumentId,
        entry: &mut EntrySet,
    ) -> Result<(), SessionError> {
        for &child in &self.model.state(id)?.children {
            if self.model.state(child)?.is_history() {
                continue;
            }
            let covered = entry
                .states
                .iter()
                .any(|s| *s == child || self.model.is_descendant(*s, child));
            if !covered {
                self.add_descendants(child, entry)?;
            }
        }
        Ok(())
    }
}
