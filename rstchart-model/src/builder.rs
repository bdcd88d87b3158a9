//! Model builder.
//!
//! Turns a [`Document`] into an [`InterpreterModel`]:
//!
//! 1. The tree is walked breadth first. Every state and transition gets a
//!    placeholder cell carrying its document path. Within a state at path
//!    `P` the initial transition sits at `P+[0]`, transitions at `P+[1+i]`
//!    and child states after them, so sorting cells by path yields document
//!    order no matter how the walk visits them.
//! 2. Missing default initial transitions are synthesized.
//! 3. Cells are sorted and numbered, symbolic targets are resolved through a
//!    worklist and the structure is validated. Errors accumulate.
//! 4. Only a structurally valid model fetches its external scripts and data,
//!    on a bounded pool. Any fetch failure fails the build.

use crate::document::{
    ActionDecl, ContentDecl, DataDecl, Document, DoneDataDecl, HistoryKind, InvokeDecl,
    ParamDecl, ScriptDecl, SendDecl, StateDecl, StateKindDecl, TransitionDecl, TransitionKind,
};
use crate::error::{BuildError, BuildFailure, EvalError, LoadError};
use crate::event::{EventDescriptor, EventName};
use crate::expr::{
    BindingRegistry, CondExpr, ExpressionBinding, LocationExpr, ScriptExpr, ValueExpr,
    DEFAULT_DATAMODEL,
};
use crate::loader::{FileResourceLoader, ResourceLoader};
use crate::model::{
    Action, DataBinding, DataInit, DocumentId, DoneData, Entity, IfBranch, InterpreterModel,
    InvokeNode, NameRef, Param, ParamSource, ScriptRef, SendAction, StateKind, StateNode,
    StrSource, TransitionNode, ValueSource,
};
use rstchart_value::DataValue;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Name of the synthetic root state.
pub const ROOT_NAME: &str = "__root";

const DEFAULT_FETCH_CONCURRENCY: usize = 8;

/// Builds interpreter models from documents.
#[derive(Clone)]
pub struct ModelBuilder {
    registry: Arc<BindingRegistry>,
    loader: Option<Arc<dyn ResourceLoader>>,
    fetch_concurrency: usize,
}

impl Default for ModelBuilder {
    fn default() -> Self {
        Self::new(Arc::new(BindingRegistry::default()))
    }
}

impl ModelBuilder {
    pub fn new(registry: Arc<BindingRegistry>) -> Self {
        Self {
            registry,
            loader: Some(Arc::new(FileResourceLoader::default())),
            fetch_concurrency: DEFAULT_FETCH_CONCURRENCY,
        }
    }

    pub fn with_loader(mut self, loader: Arc<dyn ResourceLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Disables external resources; any `src` reference fails the build.
    pub fn without_loader(mut self) -> Self {
        self.loader = None;
        self
    }

    /// Maximum number of concurrent resource fetches.
    pub fn with_fetch_concurrency(mut self, limit: usize) -> Self {
        self.fetch_concurrency = limit.max(1);
        self
    }

    pub fn registry(&self) -> &Arc<BindingRegistry> {
        &self.registry
    }

    pub async fn build(&self, document: &Document) -> Result<InterpreterModel, BuildFailure> {
        if document.states.is_empty() {
            return Err(BuildFailure {
                errors: vec![BuildError::EmptyDocument],
            });
        }

        let datamodel = document
            .datamodel
            .clone()
            .unwrap_or_else(|| DEFAULT_DATAMODEL.to_string());
        let binding = self.registry.get(&datamodel);

        let mut walk = Walk::new(binding.clone());
        if binding.is_none() {
            walk.errors.push(BuildError::UnknownDataModel(datamodel.clone()));
        }

        let root_decl = StateDecl {
            initial: document.initial.clone(),
            states: document.states.clone(),
            data: document.data.clone(),
            ..Default::default()
        };
        walk.visit_tree(&root_decl);
        walk.current = None;
        let global_scripts: Vec<ScriptRef> = document
            .script
            .iter()
            .filter_map(|decl| walk.script(decl))
            .collect();

        walk.synthesize_defaults();
        let order = walk.finalize_ids();
        let resolved = walk.resolve_targets();
        walk.validate(&resolved);

        if !walk.errors.is_empty() {
            return Err(walk.fail(document));
        }

        let fetches = std::mem::take(&mut walk.fetches);
        if !fetches.is_empty() {
            let results = self.fetch_all(&fetches).await;
            for (fetch, result) in fetches.into_iter().zip(results) {
                match result {
                    Ok(text) => walk.apply_fetch(fetch, text),
                    Err(err) => walk.errors.push(BuildError::ResourceLoad {
                        uri: fetch.uri,
                        reason: err.to_string(),
                    }),
                }
            }
            if !walk.errors.is_empty() {
                return Err(walk.fail(document));
            }
        }

        let model = walk.into_model(document, datamodel, order, resolved, global_scripts)?;
        tracing::debug!(
            "Built model '{}' with {} entities",
            model.name().unwrap_or(""),
            model.len()
        );
        Ok(model)
    }

    async fn fetch_all(&self, fetches: &[Fetch]) -> Vec<Result<String, LoadError>> {
        let Some(loader) = self.loader.clone() else {
            return fetches
                .iter()
                .map(|f| Err(LoadError::NoLoader(f.uri.clone())))
                .collect();
        };

        let semaphore = Arc::new(Semaphore::new(self.fetch_concurrency));
        let mut tasks = JoinSet::new();
        for (index, fetch) in fetches.iter().enumerate() {
            let loader = loader.clone();
            let semaphore = semaphore.clone();
            let uri = fetch.uri.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                (index, loader.fetch(&uri).await)
            });
        }

        let mut results: Vec<Option<Result<String, LoadError>>> =
            fetches.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(e) => tracing::warn!("Resource fetch task failed: {}", e),
            }
        }

        results
            .into_iter()
            .zip(fetches)
            .map(|(r, f)| {
                r.unwrap_or_else(|| {
                    Err(LoadError::Io {
                        uri: f.uri.clone(),
                        source: std::io::Error::new(
                            std::io::ErrorKind::Other,
                            "fetch task did not complete",
                        ),
                    })
                })
            })
            .collect()
    }
}

type DocPath = Vec<u32>;

#[derive(Debug, Clone)]
enum TargetRef {
    Name(String),
    Cell(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Normal,
    Initial,
    HistoryDefault,
}

struct StateCell {
    path: DocPath,
    name: Option<String>,
    decl_kind: StateKindDecl,
    history: HistoryKind,
    parent: Option<usize>,
    children: Vec<usize>,
    initial: Option<usize>,
    transitions: Vec<usize>,
    on_entry: Vec<Action>,
    on_exit: Vec<Action>,
    invokes: Vec<InvokeNode>,
    done_data: Option<DoneData>,
    data: Vec<DataBinding>,
}

struct TransitionCell {
    path: DocPath,
    source: usize,
    events: Vec<EventDescriptor>,
    cond: Option<CondExpr>,
    targets: Vec<TargetRef>,
    kind: TransitionKind,
    actions: Vec<Action>,
    role: Role,
    synthesized: bool,
    /// Declared with an event or condition, which initial and history
    /// transitions must not have.
    guarded: bool,
}

enum Cell {
    State(StateCell),
    Transition(TransitionCell),
}

impl Cell {
    fn path(&self) -> &DocPath {
        match self {
            Cell::State(s) => &s.path,
            Cell::Transition(t) => &t.path,
        }
    }
}

/// A deferred external resource.
struct Fetch {
    uri: String,
    slot: FetchSlot,
}

enum FetchSlot {
    Script(usize),
    Data { cell: usize, index: usize },
}

struct Walk {
    binding: Option<Arc<dyn ExpressionBinding>>,
    cells: Vec<Cell>,
    names: HashMap<String, usize>,
    ids: Vec<DocumentId>,
    errors: Vec<BuildError>,
    scripts: Vec<Option<ScriptExpr>>,
    fetches: Vec<Fetch>,
    /// Owning state of the content being compiled, for error messages.
    current: Option<usize>,
}

impl Walk {
    fn new(binding: Option<Arc<dyn ExpressionBinding>>) -> Self {
        Self {
            binding,
            cells: Vec::new(),
            names: HashMap::new(),
            ids: Vec::new(),
            errors: Vec::new(),
            scripts: Vec::new(),
            fetches: Vec::new(),
            current: None,
        }
    }

    fn fail(&mut self, document: &Document) -> BuildFailure {
        let errors = std::mem::take(&mut self.errors);
        tracing::warn!(
            "Model build for '{}' failed with {} error(s)",
            document.name.as_deref().unwrap_or(""),
            errors.len()
        );
        BuildFailure { errors }
    }

    fn state(&self, cell: usize) -> Option<&StateCell> {
        match self.cells.get(cell) {
            Some(Cell::State(s)) => Some(s),
            _ => None,
        }
    }

    fn state_mut(&mut self, cell: usize) -> Option<&mut StateCell> {
        match self.cells.get_mut(cell) {
            Some(Cell::State(s)) => Some(s),
            _ => None,
        }
    }

    fn display_name(&self, cell: usize) -> String {
        match self.state(cell) {
            Some(StateCell { parent: None, .. }) => ROOT_NAME.to_string(),
            Some(StateCell {
                name: Some(name), ..
            }) => name.clone(),
            Some(s) => format!(
                "<anonymous at /{}>",
                s.path
                    .iter()
                    .map(u32::to_string)
                    .collect::<Vec<_>>()
                    .join("/")
            ),
            None => format!("<cell {}>", cell),
        }
    }

    fn invalid_state(&mut self, reason: impl Into<String>) {
        let state = self
            .current
            .map(|c| self.display_name(c))
            .unwrap_or_else(|| ROOT_NAME.to_string());
        self.errors.push(BuildError::InvalidState {
            state,
            reason: reason.into(),
        });
    }

    // ---------------------------------------------------------------------
    // Walk
    // ---------------------------------------------------------------------

    fn visit_tree(&mut self, root: &StateDecl) {
        let mut queue: VecDeque<(&StateDecl, Option<usize>, DocPath)> = VecDeque::new();
        queue.push_back((root, None, Vec::new()));

        while let Some((decl, parent, path)) = queue.pop_front() {
            let cell = self.visit_state(decl, parent, path.clone());
            let offset = 1 + decl.transitions.len() as u32;
            for (j, child) in decl.states.iter().enumerate() {
                let mut child_path = path.clone();
                child_path.push(offset + j as u32);
                queue.push_back((child, Some(cell), child_path));
            }
        }
    }

    fn visit_state(&mut self, decl: &StateDecl, parent: Option<usize>, path: DocPath) -> usize {
        let cell = self.cells.len();
        self.cells.push(Cell::State(StateCell {
            path: path.clone(),
            name: decl.id.clone(),
            decl_kind: decl.kind,
            history: decl.history,
            parent,
            children: Vec::new(),
            initial: None,
            transitions: Vec::new(),
            on_entry: Vec::new(),
            on_exit: Vec::new(),
            invokes: Vec::new(),
            done_data: None,
            data: Vec::new(),
        }));
        self.current = Some(cell);

        if let Some(p) = parent.and_then(|p| self.state_mut(p)) {
            p.children.push(cell);
        }

        if let Some(id) = &decl.id {
            if self.names.contains_key(id) {
                self.errors.push(BuildError::DuplicateId { id: id.clone() });
            } else {
                self.names.insert(id.clone(), cell);
            }
        }

        let mut initial_path = path.clone();
        initial_path.push(0);
        let initial = match (decl.initial.is_empty(), &decl.initial_transition) {
            (false, Some(_)) => {
                self.errors.push(BuildError::InvalidInitial {
                    state: self.display_name(cell),
                    reason: "both an initial attribute and an initial transition".to_string(),
                });
                None
            }
            (false, None) => Some(self.push_transition(TransitionCell {
                path: initial_path,
                source: cell,
                events: Vec::new(),
                cond: None,
                targets: decl.initial.iter().cloned().map(TargetRef::Name).collect(),
                kind: TransitionKind::External,
                actions: Vec::new(),
                role: Role::Initial,
                synthesized: false,
                guarded: false,
            })),
            (true, Some(t)) => Some(self.transition(t, cell, initial_path, Role::Initial)),
            (true, None) => None,
        };

        let role = if decl.kind == StateKindDecl::History {
            Role::HistoryDefault
        } else {
            Role::Normal
        };
        let transitions: Vec<usize> = decl
            .transitions
            .iter()
            .enumerate()
            .map(|(i, t)| {
                let mut p = path.clone();
                p.push(1 + i as u32);
                self.transition(t, cell, p, role)
            })
            .collect();

        let on_entry = self.actions(&decl.on_entry);
        let on_exit = self.actions(&decl.on_exit);
        let data = self.data(cell, &decl.data);
        let invokes = decl.invokes.iter().filter_map(|i| self.invoke(i)).collect();
        let done_data = match (&decl.done_data, decl.kind) {
            (Some(d), StateKindDecl::Final) => self.done_data(d),
            (Some(_), _) => {
                self.invalid_state("done data is only allowed on final states");
                None
            }
            (None, _) => None,
        };

        if let Some(state) = self.state_mut(cell) {
            state.initial = initial;
            state.transitions = transitions;
            state.on_entry = on_entry;
            state.on_exit = on_exit;
            state.data = data;
            state.invokes = invokes;
            state.done_data = done_data;
        }
        cell
    }

    fn push_transition(&mut self, t: TransitionCell) -> usize {
        let cell = self.cells.len();
        self.cells.push(Cell::Transition(t));
        cell
    }

    fn transition(&mut self, decl: &TransitionDecl, source: usize, path: DocPath, role: Role) -> usize {
        let cond = decl.cond.as_deref().and_then(|c| self.cond(c));
        let actions = self.actions(&decl.actions);
        self.push_transition(TransitionCell {
            path,
            source,
            events: decl.event.iter().map(|e| EventDescriptor::parse(e)).collect(),
            cond,
            targets: decl.target.iter().cloned().map(TargetRef::Name).collect(),
            kind: decl.kind,
            actions,
            role,
            synthesized: false,
            guarded: !decl.event.is_empty() || decl.cond.is_some(),
        })
    }

    // ---------------------------------------------------------------------
    // Synthesis, numbering, resolution
    // ---------------------------------------------------------------------

    /// Adds default initial transitions to compound and parallel states and
    /// default transitions to history states that declare none.
    fn synthesize_defaults(&mut self) {
        for cell in 0..self.cells.len() {
            let Some(state) = self.state(cell) else {
                continue;
            };
            let (path, kind) = (state.path.clone(), state.decl_kind);

            match kind {
                StateKindDecl::State | StateKindDecl::Parallel if state.initial.is_none() => {
                    let Some(first) = self.first_regular_child(cell) else {
                        continue;
                    };
                    let mut p = path;
                    p.push(0);
                    let t = self.push_synthesized(cell, p, first, Role::Initial);
                    if let Some(s) = self.state_mut(cell) {
                        s.initial = Some(t);
                    }
                }
                StateKindDecl::History if state.transitions.is_empty() => {
                    let Some(first) = state.parent.and_then(|p| self.first_regular_child(p))
                    else {
                        continue;
                    };
                    let mut p = path;
                    p.push(1);
                    let t = self.push_synthesized(cell, p, first, Role::HistoryDefault);
                    if let Some(s) = self.state_mut(cell) {
                        s.transitions.push(t);
                    }
                }
                _ => {}
            }
        }
    }

    fn push_synthesized(&mut self, source: usize, path: DocPath, target: usize, role: Role) -> usize {
        self.push_transition(TransitionCell {
            path,
            source,
            events: Vec::new(),
            cond: None,
            targets: vec![TargetRef::Cell(target)],
            kind: TransitionKind::External,
            actions: Vec::new(),
            role,
            synthesized: true,
            guarded: false,
        })
    }

    fn first_regular_child(&self, cell: usize) -> Option<usize> {
        self.state(cell)?.children.iter().copied().find(|c| {
            self.state(*c)
                .map(|s| s.decl_kind != StateKindDecl::History)
                .unwrap_or(false)
        })
    }

    /// Sorts cells by document path and assigns consecutive ids. Returns the
    /// cells in id order.
    fn finalize_ids(&mut self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.cells.len()).collect();
        order.sort_by(|a, b| self.cells[*a].path().cmp(self.cells[*b].path()));

        self.ids = vec![DocumentId(0); self.cells.len()];
        for (rank, cell) in order.iter().enumerate() {
            self.ids[*cell] = DocumentId(rank as u32);
        }
        order
    }

    /// Resolves every target list to state cells. Unresolved names are
    /// reported and dropped.
    fn resolve_targets(&mut self) -> HashMap<usize, Vec<usize>> {
        let worklist: Vec<usize> = self
            .cells
            .iter()
            .enumerate()
            .filter_map(|(i, c)| match c {
                Cell::Transition(t) if !t.targets.is_empty() => Some(i),
                _ => None,
            })
            .collect();

        let mut resolved = HashMap::with_capacity(worklist.len());
        for cell in worklist {
            let Cell::Transition(t) = &self.cells[cell] else {
                continue;
            };
            let mut targets = Vec::with_capacity(t.targets.len());
            let mut unresolved = Vec::new();
            for target in &t.targets {
                match target {
                    TargetRef::Cell(c) => targets.push(*c),
                    TargetRef::Name(name) => match self.names.get(name) {
                        Some(c) => targets.push(*c),
                        None => unresolved.push(name.clone()),
                    },
                }
            }
            let source = self.display_name(t.source);
            for target in unresolved {
                self.errors.push(BuildError::UnresolvedTarget {
                    state: source.clone(),
                    target,
                });
            }
            resolved.insert(cell, targets);
        }
        resolved
    }

    fn is_descendant_cell(&self, cell: usize, ancestor: usize) -> bool {
        let mut current = self.state(cell).and_then(|s| s.parent);
        while let Some(p) = current {
            if p == ancestor {
                return true;
            }
            current = self.state(p).and_then(|s| s.parent);
        }
        false
    }

    fn regular_children(&self, cell: usize) -> usize {
        self.state(cell)
            .map(|s| {
                s.children
                    .iter()
                    .filter(|c| {
                        self.state(**c)
                            .map(|c| c.decl_kind != StateKindDecl::History)
                            .unwrap_or(false)
                    })
                    .count()
            })
            .unwrap_or(0)
    }

    fn validate(&mut self, resolved: &HashMap<usize, Vec<usize>>) {
        let mut errors = Vec::new();

        for (cell, entry) in self.cells.iter().enumerate() {
            match entry {
                Cell::State(state) => {
                    let name = self.display_name(cell);
                    let regular = self.regular_children(cell);
                    match state.decl_kind {
                        StateKindDecl::State if regular == 0 && !state.children.is_empty() => {
                            errors.push(BuildError::InvalidState {
                                state: name,
                                reason: "history states need sibling states".to_string(),
                            });
                        }
                        StateKindDecl::State if regular == 0 && state.initial.is_some() => {
                            errors.push(BuildError::InvalidInitial {
                                state: name,
                                reason: "atomic states cannot declare an initial".to_string(),
                            });
                        }
                        StateKindDecl::Final
                            if !state.children.is_empty() || !state.transitions.is_empty() =>
                        {
                            errors.push(BuildError::InvalidState {
                                state: name,
                                reason: "final states cannot have children or transitions"
                                    .to_string(),
                            });
                        }
                        StateKindDecl::History => {
                            let parent_ok = state
                                .parent
                                .and_then(|p| self.state(p))
                                .map(|p| p.parent.is_some())
                                .unwrap_or(false);
                            let reason = if !parent_ok {
                                Some("history states must be nested in a state")
                            } else if !state.children.is_empty() {
                                Some("history states cannot have children")
                            } else if state.transitions.len() > 1 {
                                Some("history states have at most one default transition")
                            } else {
                                None
                            };
                            if let Some(reason) = reason {
                                errors.push(BuildError::InvalidHistory {
                                    state: name,
                                    reason: reason.to_string(),
                                });
                            }
                        }
                        _ => {}
                    }
                }
                Cell::Transition(t) => {
                    let targets = resolved.get(&cell).map(Vec::as_slice).unwrap_or(&[]);
                    let source = self.display_name(t.source);
                    match t.role {
                        Role::Normal => {}
                        Role::Initial => {
                            let parallel = self
                                .state(t.source)
                                .map(|s| s.decl_kind == StateKindDecl::Parallel)
                                .unwrap_or(false);
                            let reason = if parallel && !t.synthesized {
                                Some("parallel states cannot declare an initial")
                            } else if t.guarded {
                                Some("initial transitions cannot have an event or condition")
                            } else if t.targets.is_empty() {
                                Some("initial transitions need a target")
                            } else if targets
                                .iter()
                                .any(|c| !self.is_descendant_cell(*c, t.source))
                            {
                                Some("initial targets must be descendants")
                            } else {
                                None
                            };
                            if let Some(reason) = reason {
                                errors.push(BuildError::InvalidInitial {
                                    state: source,
                                    reason: reason.to_string(),
                                });
                            }
                        }
                        Role::HistoryDefault => {
                            let parent = self.state(t.source).and_then(|s| s.parent);
                            let reason = if t.guarded {
                                Some("default transition cannot have an event or condition")
                            } else if t.targets.is_empty() {
                                Some("default transition needs a target")
                            } else if targets.iter().any(|c| match parent {
                                Some(p) => !self.is_descendant_cell(*c, p),
                                None => true,
                            }) {
                                Some("default targets must be descendants of the parent")
                            } else {
                                None
                            };
                            if let Some(reason) = reason {
                                errors.push(BuildError::InvalidHistory {
                                    state: source,
                                    reason: reason.to_string(),
                                });
                            }
                        }
                    }
                }
            }
        }

        self.errors.extend(errors);
    }

    // ---------------------------------------------------------------------
    // Resources
    // ---------------------------------------------------------------------

    fn apply_fetch(&mut self, fetch: Fetch, text: String) {
        match fetch.slot {
            FetchSlot::Script(slot) => {
                if let Some(binding) = self.binding.clone() {
                    match binding.compile_script(&text) {
                        Ok(eval) => {
                            self.scripts[slot] = Some(ScriptExpr {
                                source: fetch.uri,
                                eval,
                            })
                        }
                        Err(e) => self.errors.push(BuildError::expression(&fetch.uri, e)),
                    }
                }
            }
            FetchSlot::Data { cell, index } => match serde_json::from_str(&text) {
                Ok(json) => {
                    let value = DataValue::from_json(&json);
                    value.freeze();
                    if let Some(binding) = self.state_mut(cell).and_then(|s| s.data.get_mut(index))
                    {
                        binding.init = DataInit::Literal(value);
                    }
                }
                Err(e) => self.errors.push(BuildError::InvalidData {
                    uri: fetch.uri,
                    reason: e.to_string(),
                }),
            },
        }
    }

    fn into_model(
        self,
        document: &Document,
        datamodel: String,
        order: Vec<usize>,
        mut resolved: HashMap<usize, Vec<usize>>,
        global_scripts: Vec<ScriptRef>,
    ) -> Result<InterpreterModel, BuildFailure> {
        let ids = self.ids;
        let id = |cell: usize| ids[cell];

        let mut scripts = Vec::with_capacity(self.scripts.len());
        for (slot, script) in self.scripts.into_iter().enumerate() {
            match script {
                Some(s) => scripts.push(s),
                None => {
                    return Err(BuildFailure {
                        errors: vec![BuildError::ResourceLoad {
                            uri: format!("script slot {}", slot),
                            reason: "script was never loaded".to_string(),
                        }],
                    })
                }
            }
        }

        // Depth needs parents, which are known before the cells are consumed.
        let depths: Vec<usize> = (0..self.cells.len())
            .map(|cell| {
                let mut depth = 0;
                let mut current = match &self.cells[cell] {
                    Cell::State(s) => s.parent,
                    Cell::Transition(_) => None,
                };
                while let Some(p) = current {
                    depth += 1;
                    current = match &self.cells[p] {
                        Cell::State(s) => s.parent,
                        Cell::Transition(_) => None,
                    };
                }
                depth
            })
            .collect();

        let mut slots: Vec<Option<Cell>> = self.cells.into_iter().map(Some).collect();
        let mut entities = Vec::with_capacity(slots.len());
        let mut names = HashMap::new();
        let mut root = DocumentId(0);

        for cell in order {
            let Some(entry) = slots[cell].take() else {
                continue;
            };
            let entity = match entry {
                Cell::State(s) => {
                    let kind = match s.decl_kind {
                        StateKindDecl::State if s.children.is_empty() => StateKind::Atomic,
                        StateKindDecl::State => StateKind::Compound,
                        StateKindDecl::Parallel => StateKind::Parallel,
                        StateKindDecl::Final => StateKind::Final,
                        StateKindDecl::History => StateKind::History(s.history),
                    };
                    let name = match (&s.parent, &s.name) {
                        (None, _) => {
                            root = id(cell);
                            ROOT_NAME.to_string()
                        }
                        (Some(_), Some(name)) => {
                            names.insert(name.clone(), id(cell));
                            name.clone()
                        }
                        (Some(_), None) => format!("_state{}", id(cell).0),
                    };
                    let state_id = id(cell);
                    Entity::State(StateNode {
                        id: state_id,
                        name,
                        kind,
                        parent: s.parent.map(id),
                        children: s.children.iter().copied().map(id).collect(),
                        initial: s.initial.map(id),
                        transitions: s.transitions.iter().copied().map(id).collect(),
                        on_entry: s.on_entry,
                        on_exit: s.on_exit,
                        invokes: s
                            .invokes
                            .into_iter()
                            .map(|mut i| {
                                i.state = state_id;
                                i
                            })
                            .collect(),
                        done_data: s.done_data,
                        data: s.data,
                        depth: depths[cell],
                    })
                }
                Cell::Transition(t) => Entity::Transition(TransitionNode {
                    id: id(cell),
                    source: id(t.source),
                    events: t.events,
                    cond: t.cond,
                    targets: resolved
                        .remove(&cell)
                        .unwrap_or_default()
                        .into_iter()
                        .map(id)
                        .collect(),
                    kind: t.kind,
                    actions: t.actions,
                    synthesized: t.synthesized,
                }),
            };
            entities.push(entity);
        }

        Ok(InterpreterModel {
            name: document.name.clone(),
            datamodel,
            binding: document.binding,
            root,
            entities,
            names,
            scripts,
            global_scripts,
        })
    }

    // ---------------------------------------------------------------------
    // Executable content
    // ---------------------------------------------------------------------

    fn compile<T>(
        &mut self,
        source: &str,
        f: impl FnOnce(&dyn ExpressionBinding, &str) -> Result<T, EvalError>,
    ) -> Option<T> {
        let binding = self.binding.clone()?;
        match f(binding.as_ref(), source) {
            Ok(v) => Some(v),
            Err(e) => {
                self.errors.push(BuildError::expression(source, e));
                None
            }
        }
    }

    fn value(&mut self, source: &str) -> Option<ValueExpr> {
        let eval = self.compile(source, |b, s| b.compile_value(s))?;
        Some(ValueExpr {
            source: source.to_string(),
            eval,
        })
    }

    fn cond(&mut self, source: &str) -> Option<CondExpr> {
        let eval = self.compile(source, |b, s| b.compile_condition(s))?;
        Some(CondExpr {
            source: source.to_string(),
            eval,
        })
    }

    fn location(&mut self, source: &str) -> Option<LocationExpr> {
        let eval = self.compile(source, |b, s| b.compile_location(s))?;
        Some(LocationExpr {
            source: source.to_string(),
            eval,
        })
    }

    fn str_source(
        &mut self,
        attr: &str,
        literal: &Option<String>,
        expr: &Option<String>,
    ) -> Option<StrSource> {
        match (literal, expr) {
            (Some(_), Some(_)) => {
                self.invalid_state(format!("'{attr}' and '{attr}expr' are mutually exclusive"));
                None
            }
            (Some(l), None) => Some(StrSource::Literal(l.clone())),
            (None, Some(e)) => self.value(e).map(StrSource::Expr),
            (None, None) => None,
        }
    }

    fn value_source(
        &mut self,
        expr: &Option<String>,
        value: &Option<serde_json::Value>,
    ) -> Option<ValueSource> {
        match (expr, value) {
            (Some(_), Some(_)) => {
                self.invalid_state("'expr' and a literal value are mutually exclusive");
                None
            }
            (Some(e), None) => self.value(e).map(ValueSource::Expr),
            (None, Some(v)) => {
                let value = DataValue::from_json(v);
                value.freeze();
                Some(ValueSource::Literal(value))
            }
            (None, None) => None,
        }
    }

    fn content(&mut self, content: &Option<ContentDecl>) -> Option<ValueSource> {
        let content = content.as_ref()?;
        let source = self.value_source(&content.expr, &content.value);
        if source.is_none() && content.expr.is_none() && content.value.is_none() {
            self.invalid_state("content needs an expression or a value");
        }
        source
    }

    fn params(&mut self, params: &[ParamDecl]) -> Vec<Param> {
        let mut out = Vec::with_capacity(params.len());
        for p in params {
            let source = match (&p.expr, &p.location) {
                (Some(e), None) => self.value(e).map(ParamSource::Expr),
                (None, Some(l)) => self.location(l).map(ParamSource::Location),
                _ => {
                    self.invalid_state(format!(
                        "param '{}' needs exactly one of expr or location",
                        p.name
                    ));
                    None
                }
            };
            if let Some(source) = source {
                out.push(Param {
                    name: p.name.clone(),
                    source,
                });
            }
        }
        out
    }

    fn namelist(&mut self, names: &[String]) -> Vec<NameRef> {
        names
            .iter()
            .filter_map(|n| {
                let location = self.location(n)?;
                let name = self.binding.as_ref()?.location_name(n);
                Some(NameRef { name, location })
            })
            .collect()
    }

    fn actions(&mut self, decls: &[ActionDecl]) -> Vec<Action> {
        decls.iter().filter_map(|d| self.action(d)).collect()
    }

    fn action(&mut self, decl: &ActionDecl) -> Option<Action> {
        match decl {
            ActionDecl::Raise { event } => {
                if event.trim().is_empty() {
                    self.invalid_state("raise needs an event name");
                    return None;
                }
                Some(Action::Raise {
                    event: EventName::new(event.trim()),
                })
            }
            ActionDecl::Send(send) => self.send(send).map(|s| Action::Send(Box::new(s))),
            ActionDecl::Cancel { sendid, sendidexpr } => {
                match self.str_source("sendid", sendid, sendidexpr) {
                    Some(sendid) => Some(Action::Cancel { sendid }),
                    None => {
                        if sendid.is_none() && sendidexpr.is_none() {
                            self.invalid_state("cancel needs a sendid or sendidexpr");
                        }
                        None
                    }
                }
            }
            ActionDecl::Log { label, expr } => {
                let expr = match expr {
                    Some(e) => Some(self.value(e)?),
                    None => None,
                };
                Some(Action::Log {
                    label: label.clone(),
                    expr,
                })
            }
            ActionDecl::Assign {
                location,
                expr,
                value,
            } => {
                let target = self.location(location);
                let value = self.value_source(expr, value);
                if expr.is_none() && value.is_none() {
                    self.invalid_state(format!("assign to '{}' needs expr or value", location));
                }
                Some(Action::Assign {
                    location: target?,
                    value: value?,
                })
            }
            ActionDecl::If(decl) => {
                let mut branches = Vec::with_capacity(decl.else_if.len() + 2);
                let cond = self.cond(&decl.cond);
                branches.push(IfBranch {
                    cond,
                    actions: self.actions(&decl.actions),
                });
                for arm in &decl.else_if {
                    let cond = self.cond(&arm.cond);
                    branches.push(IfBranch {
                        cond,
                        actions: self.actions(&arm.actions),
                    });
                }
                if !decl.otherwise.is_empty() {
                    branches.push(IfBranch {
                        cond: None,
                        actions: self.actions(&decl.otherwise),
                    });
                }
                Some(Action::If { branches })
            }
            ActionDecl::Foreach {
                array,
                item,
                index,
                actions,
            } => {
                let array = self.value(array);
                let item = self.location(item);
                let index = match index {
                    Some(i) => Some(self.location(i)?),
                    None => None,
                };
                let actions = self.actions(actions);
                Some(Action::Foreach {
                    array: array?,
                    item: item?,
                    index,
                    actions,
                })
            }
            ActionDecl::Script(script) => self.script(script).map(Action::Script),
        }
    }

    fn send(&mut self, decl: &SendDecl) -> Option<SendAction> {
        if decl.id.is_some() && decl.idlocation.is_some() {
            self.invalid_state("send 'id' and 'idlocation' are mutually exclusive");
        }
        if decl.content.is_some() && (!decl.namelist.is_empty() || !decl.params.is_empty()) {
            self.invalid_state("send content excludes namelist and params");
        }
        if decl.event.is_none() && decl.eventexpr.is_none() && decl.content.is_none() {
            self.invalid_state("send needs an event or content");
        }
        Some(SendAction {
            event: self.str_source("event", &decl.event, &decl.eventexpr),
            target: self.str_source("target", &decl.target, &decl.targetexpr),
            type_: self.str_source("type", &decl.type_, &decl.typeexpr),
            id: decl.id.clone(),
            idlocation: match &decl.idlocation {
                Some(l) => Some(self.location(l)?),
                None => None,
            },
            delay: self.str_source("delay", &decl.delay, &decl.delayexpr),
            namelist: self.namelist(&decl.namelist),
            params: self.params(&decl.params),
            content: self.content(&decl.content),
        })
    }

    fn invoke(&mut self, decl: &InvokeDecl) -> Option<InvokeNode> {
        if decl.id.is_some() && decl.idlocation.is_some() {
            self.invalid_state("invoke 'id' and 'idlocation' are mutually exclusive");
        }
        if decl.content.is_some() && (decl.src.is_some() || decl.srcexpr.is_some()) {
            self.invalid_state("invoke content excludes src");
        }
        Some(InvokeNode {
            state: DocumentId(0),
            type_: self.str_source("type", &decl.type_, &decl.typeexpr),
            src: self.str_source("src", &decl.src, &decl.srcexpr),
            id: decl.id.clone(),
            idlocation: match &decl.idlocation {
                Some(l) => Some(self.location(l)?),
                None => None,
            },
            autoforward: decl.autoforward,
            namelist: self.namelist(&decl.namelist),
            params: self.params(&decl.params),
            content: self.content(&decl.content),
            finalize: self.actions(&decl.finalize),
        })
    }

    fn done_data(&mut self, decl: &DoneDataDecl) -> Option<DoneData> {
        if decl.content.is_some() && !decl.params.is_empty() {
            self.invalid_state("done data content excludes params");
        }
        Some(DoneData {
            content: self.content(&decl.content),
            params: self.params(&decl.params),
        })
    }

    fn data(&mut self, cell: usize, decls: &[DataDecl]) -> Vec<DataBinding> {
        let mut out = Vec::with_capacity(decls.len());
        for decl in decls {
            let Some(location) = self.compile(&decl.id, |b, id| b.data_location(id)) else {
                continue;
            };
            let declared = [decl.expr.is_some(), decl.src.is_some(), decl.value.is_some()]
                .iter()
                .filter(|d| **d)
                .count();
            if declared > 1 {
                self.invalid_state(format!(
                    "data '{}' declares more than one of expr, src and value",
                    decl.id
                ));
                continue;
            }

            let init = if let Some(expr) = &decl.expr {
                match self.value(expr) {
                    Some(v) => DataInit::Expr(v),
                    None => continue,
                }
            } else if let Some(value) = &decl.value {
                let value = DataValue::from_json(value);
                value.freeze();
                DataInit::Literal(value)
            } else {
                if let Some(src) = &decl.src {
                    self.fetches.push(Fetch {
                        uri: src.clone(),
                        slot: FetchSlot::Data {
                            cell,
                            index: out.len(),
                        },
                    });
                }
                DataInit::Undefined
            };

            out.push(DataBinding {
                id: decl.id.clone(),
                location: LocationExpr {
                    source: decl.id.clone(),
                    eval: location,
                },
                init,
            });
        }
        out
    }

    fn script(&mut self, decl: &ScriptDecl) -> Option<ScriptRef> {
        match (&decl.src, &decl.body) {
            (Some(src), None) => {
                let slot = self.scripts.len();
                self.scripts.push(None);
                self.fetches.push(Fetch {
                    uri: src.clone(),
                    slot: FetchSlot::Script(slot),
                });
                Some(ScriptRef(slot))
            }
            (None, Some(body)) => {
                let eval = self.compile(body, |b, s| b.compile_script(s))?;
                let slot = self.scripts.len();
                self.scripts.push(Some(ScriptExpr {
                    source: body.clone(),
                    eval,
                }));
                Some(ScriptRef(slot))
            }
            _ => {
                self.invalid_state("script needs exactly one of src or body");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn doc(value: serde_json::Value) -> Document {
        Document::from_json(&value).unwrap()
    }

    async fn build(value: serde_json::Value) -> Result<InterpreterModel, BuildFailure> {
        ModelBuilder::default().without_loader().build(&doc(value)).await
    }

    fn id_of(model: &InterpreterModel, name: &str) -> DocumentId {
        model.lookup(name).unwrap()
    }

    #[tokio::test]
    async fn test_ids_follow_document_order() {
        let model = build(json!({
            "states": [
                {"id": "a",
                 "transitions": [{"event": "go", "target": "b"}],
                 "states": [{"id": "a1"}, {"id": "a2"}]},
                {"id": "b", "kind": "final"}
            ]
        }))
        .await
        .unwrap();

        let a = model.state(id_of(&model, "a")).unwrap();
        let initial = a.initial.unwrap();
        let go = a.transitions[0];

        assert_eq!(model.root(), DocumentId(0));
        assert!(a.id < initial);
        assert!(initial < go);
        assert!(go < id_of(&model, "a1"));
        assert!(id_of(&model, "a1") < id_of(&model, "a2"));
        assert!(id_of(&model, "a2") < id_of(&model, "b"));

        for (i, entity) in model.entities().iter().enumerate() {
            assert_eq!(entity.id(), DocumentId(i as u32));
        }
    }

    #[tokio::test]
    async fn test_building_twice_is_identical() {
        let value = json!({
            "states": [
                {"id": "p", "kind": "parallel", "states": [
                    {"id": "r1", "states": [{"id": "x"}, {"id": "y"}]},
                    {"id": "r2", "states": [{"id": "z", "states": [{"id": "z1"}]}]}
                ]},
                {"id": "done", "kind": "final"}
            ]
        });
        let first = build(value.clone()).await.unwrap();
        let second = build(value).await.unwrap();

        let names = |m: &InterpreterModel| {
            m.states()
                .map(|s| (s.id, s.name.clone()))
                .collect::<Vec<_>>()
        };
        assert_eq!(names(&first), names(&second));
        assert_eq!(first.len(), second.len());
    }

    #[tokio::test]
    async fn test_unresolved_targets_are_all_reported() {
        let failure = build(json!({
            "states": [
                {"id": "a", "transitions": [
                    {"event": "x", "target": "nowhere"},
                    {"event": "y", "target": "a elsewhere"}
                ]}
            ]
        }))
        .await
        .unwrap_err();

        let unresolved: Vec<_> = failure
            .errors()
            .iter()
            .filter_map(|e| match e {
                BuildError::UnresolvedTarget { target, .. } => Some(target.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(unresolved, vec!["nowhere", "elsewhere"]);
    }

    #[tokio::test]
    async fn test_synthesized_initial_skips_history() {
        let model = build(json!({
            "states": [{"id": "c", "states": [
                {"id": "h", "kind": "history"},
                {"id": "c1"},
                {"id": "c2"}
            ]}]
        }))
        .await
        .unwrap();

        let c = model.state(id_of(&model, "c")).unwrap();
        assert_eq!(c.kind, StateKind::Compound);
        let initial = model.transition(c.initial.unwrap()).unwrap();
        assert!(initial.synthesized);
        assert_eq!(initial.targets, vec![id_of(&model, "c1")]);

        let h = model.state(id_of(&model, "h")).unwrap();
        let default = model.transition(h.transitions[0]).unwrap();
        assert_eq!(default.targets, vec![id_of(&model, "c1")]);

        let root = model.state(model.root()).unwrap();
        let root_initial = model.transition(root.initial.unwrap()).unwrap();
        assert_eq!(root_initial.targets, vec![id_of(&model, "c")]);
    }

    #[tokio::test]
    async fn test_atomic_state_gets_no_initial() {
        let model = build(json!({"states": [{"id": "only"}]})).await.unwrap();
        let only = model.state(id_of(&model, "only")).unwrap();
        assert_eq!(only.kind, StateKind::Atomic);
        assert!(only.initial.is_none());
    }

    #[tokio::test]
    async fn test_structural_errors() {
        let failure = build(json!({
            "states": [
                {"id": "a", "initial": "b", "states": [{"id": "a1"}]},
                {"id": "b"},
                {"id": "b"},
                {"id": "f", "kind": "final", "transitions": [{"target": "a"}]}
            ]
        }))
        .await
        .unwrap_err();

        let errors = failure.errors();
        assert!(errors
            .iter()
            .any(|e| matches!(e, BuildError::DuplicateId { id } if id == "b")));
        assert!(errors
            .iter()
            .any(|e| matches!(e, BuildError::InvalidInitial { state, .. } if state == "a")));
        assert!(errors
            .iter()
            .any(|e| matches!(e, BuildError::InvalidState { state, .. } if state == "f")));
    }

    #[tokio::test]
    async fn test_empty_and_unknown_datamodel() {
        let failure = build(json!({"states": []})).await.unwrap_err();
        assert_eq!(failure.errors(), &[BuildError::EmptyDocument]);

        let failure = build(json!({"datamodel": "ecmascript", "states": [{"id": "a"}]}))
            .await
            .unwrap_err();
        assert!(failure
            .errors()
            .iter()
            .any(|e| matches!(e, BuildError::UnknownDataModel(m) if m == "ecmascript")));
    }

    #[tokio::test]
    async fn test_expression_errors_accumulate() {
        let failure = build(json!({
            "states": [{"id": "a", "transitions": [
                {"event": "x", "cond": "ctx.a >", "target": "a"},
                {"event": "y", "cond": "bogus.path", "target": "a"}
            ]}]
        }))
        .await
        .unwrap_err();
        assert_eq!(failure.errors().len(), 2);
    }

    #[tokio::test]
    async fn test_external_script_and_data_are_fetched() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("init.txt"), "ctx.n = 1").unwrap();
        std::fs::write(dir.path().join("seed.json"), r#"{"items": [1, 2]}"#).unwrap();

        let model = ModelBuilder::default()
            .with_loader(Arc::new(FileResourceLoader::new(dir.path())))
            .with_fetch_concurrency(1)
            .build(&doc(json!({
                "script": [{"src": "init.txt"}],
                "data": [{"id": "seed", "src": "seed.json"}],
                "states": [{"id": "a"}]
            })))
            .await
            .unwrap();

        assert_eq!(model.global_scripts().len(), 1);
        let script = model.script(model.global_scripts()[0]).unwrap();
        assert_eq!(script.source, "init.txt");

        let root = model.state(model.root()).unwrap();
        match &root.data[0].init {
            DataInit::Literal(v) => {
                assert!(v.is_frozen());
                assert_eq!(v.path("items.1"), DataValue::from(2));
            }
            other => panic!("unexpected init {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_script_fetch_failure_fails_build() {
        let dir = TempDir::new().unwrap();
        let failure = ModelBuilder::default()
            .with_loader(Arc::new(FileResourceLoader::new(dir.path())))
            .build(&doc(json!({
                "states": [{"id": "a", "on_entry": [{"script": {"src": "missing.txt"}}]}]
            })))
            .await
            .unwrap_err();

        assert!(matches!(
            &failure.errors()[0],
            BuildError::ResourceLoad { uri, .. } if uri == "missing.txt"
        ));
    }

    #[tokio::test]
    async fn test_history_must_target_inside_parent() {
        let failure = build(json!({
            "states": [
                {"id": "c", "states": [
                    {"id": "h", "kind": "history", "transitions": [{"target": "out"}]},
                    {"id": "c1"}
                ]},
                {"id": "out"}
            ]
        }))
        .await
        .unwrap_err();
        assert!(matches!(
            &failure.errors()[0],
            BuildError::InvalidHistory { state, .. } if state == "h"
        ));
    }

    #[derive(Debug, Clone)]
    struct Tree(Vec<Tree>);

    fn tree() -> impl Strategy<Value = Tree> {
        let leaf = Just(Tree(Vec::new()));
        leaf.prop_recursive(4, 40, 4, |inner| {
            prop::collection::vec(inner, 1..4).prop_map(Tree)
        })
    }

    fn to_decl(tree: &Tree, counter: &mut usize) -> StateDecl {
        *counter += 1;
        let mut decl = StateDecl::new(format!("s{}", counter));
        for child in &tree.0 {
            decl.states.push(to_decl(child, counter));
        }
        decl
    }

    proptest! {
        #[test]
        fn prop_ids_are_preorder(trees in prop::collection::vec(tree(), 1..4)) {
            let mut counter = 0;
            let document = Document {
                states: trees.iter().map(|t| to_decl(t, &mut counter)).collect(),
                ..Default::default()
            };
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let model = rt
                .block_on(ModelBuilder::default().without_loader().build(&document))
                .unwrap();

            for (i, entity) in model.entities().iter().enumerate() {
                prop_assert_eq!(entity.id(), DocumentId(i as u32));
            }
            for state in model.states() {
                if let Some(parent) = state.parent {
                    prop_assert!(parent < state.id);
                }
                prop_assert!(state.children.windows(2).all(|w| w[0] < w[1]));
                if let Some(initial) = state.initial {
                    prop_assert!(state.children.iter().all(|c| initial < *c));
                }
            }
            // Names are declared in pre-order, so ids must sort the same way.
            let mut named: Vec<_> = model
                .states()
                .filter(|s| s.parent.is_some())
                .map(|s| (s.id, s.name[1..].parse::<usize>().unwrap()))
                .collect();
            named.sort();
            prop_assert!(named.windows(2).all(|w| w[0].1 < w[1].1));
        }
    }
}
