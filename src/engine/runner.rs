//! The execution engine: hydration, the step loop, the circuit breaker, and
//! fractal sub-flow resumption.
//!
//! The loop is a pure state machine over persisted state: fetch the cursor,
//! write the intent record, dispatch, fold the result back, persist, advance.
//! The only suspension points are atom returns, WAITING results, and signal
//! delivery.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;
use std::time::Duration;

use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use crate::core::dispatch::{self, Route};
use crate::core::ops::TaskUpdate;
use crate::engine::atom::{
    Atom, AtomContext, AtomResult, AtomStatus, ImplRef, ToolScope, parse_impl_id, resolve_builtin,
};
use crate::engine::flow::{self, FlowDefinition, StepDef, StepType};
use crate::engine::interrupt;
use crate::error::Result;
use crate::io::config::{FlowConfig, load_config};
use crate::io::event_log::{EventDraft, EventLog};
use crate::io::intent;
use crate::io::paths::{FlowPaths, discover_root};
use crate::io::registry::{EntryStatus, Registry};
use crate::io::state_store::{RunStatus, StateStore, StepStatus, export_digest};
use crate::io::status_store::{ActiveCursor, StatusStore};
use crate::tree::TaskStatus;

const WRITER_LOCK_DEADLINE: Duration = Duration::from_secs(5);

/// Why a run stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Every task in the tree is closed.
    Complete,
    /// A human gate yielded control.
    Waiting { task_id: String, message: String },
    /// No route matched; a needs-human event was recorded.
    NeedsHuman { task_id: String },
    /// A step reached a terminal error; the task was not advanced.
    StepError { task_id: String, message: String },
    /// The circuit breaker tripped.
    Fatal { task_id: String, attempts: u32 },
    /// SIGINT/SIGTERM; state was flushed first.
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub tasks_completed: u32,
    pub stop: StopReason,
}

/// Cursor summary for `status` (read-only).
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub active: Option<ActiveSummary>,
}

#[derive(Debug, Clone)]
pub struct ActiveSummary {
    pub task_name: String,
    pub state_id: String,
    pub doc: Option<String>,
    pub current_step_index: Option<usize>,
}

enum StepResult {
    TaskDone,
    Stop(StopReason),
}

/// Outcome of running one (possibly nested) flow for a task.
enum FlowOutcome {
    Completed,
    Waiting { step_id: String, message: String },
    StepError { step_id: String, message: String },
    Fatal { step_id: String, attempts: u32 },
    Interrupted,
}

#[derive(Debug)]
pub struct Engine {
    paths: FlowPaths,
    config: FlowConfig,
    registry: Registry,
    store: StatusStore,
    states: StateStore,
    events: EventLog,
    tools: ToolScope,
}

impl Engine {
    /// Hydrate from a working directory: discover the root, load config and
    /// registry, and run the registry consistency check.
    pub fn hydrate(cwd: &Path) -> Result<Self> {
        let markers = FlowConfig::default().root_markers;
        let paths = discover_root(cwd, &markers)?;
        let config = load_config(&paths.config_path)?;

        let mut registry = Registry::load(&paths.registry_path)?;
        let flows_dir = paths.flows_dir.clone();
        registry.consistency_check(|impl_id| match parse_impl_id(impl_id)? {
            ImplRef::Builtin(name) => resolve_builtin(name).map(|_| ()),
            ImplRef::Flow(rel) => flow::load_flow(&flows_dir, rel)
                .map(|_| ())
                .map_err(|err| err.to_string()),
        });

        let store = StatusStore::new(&paths, config.parser_depth_cap, config.backups_keep);
        let states = StateStore::new(&paths.state_dir);
        let events = EventLog::new(
            &paths.logs_dir,
            &paths.artifacts_dir,
            config.event_rotate_bytes,
            config.event_inline_cap,
        );
        let tools = ToolScope::new(paths.root.clone(), config.loom.clone(), &config.scope);
        info!(root = %paths.root.display(), "engine hydrated");

        Ok(Self {
            paths,
            config,
            registry,
            store,
            states,
            events,
            tools,
        })
    }

    pub fn paths(&self) -> &FlowPaths {
        &self.paths
    }

    /// Run until the tree completes, a gate yields, or a step halts the run.
    pub fn run(&mut self) -> Result<RunReport> {
        interrupt::install();
        let _writer = self.store.acquire_writer_lock(WRITER_LOCK_DEADLINE)?;
        self.run_locked()
    }

    /// Begin a run, optionally forcing a specific task active first.
    pub fn start(&mut self, task_id: Option<&str>) -> Result<RunReport> {
        interrupt::install();
        let _writer = self.store.acquire_writer_lock(WRITER_LOCK_DEADLINE)?;
        if let Some(task_id) = task_id {
            let mut tree = self.store.load()?;
            tree.update_task(task_id, TaskUpdate::status(TaskStatus::Active))?;
            self.store.save(&tree)?;
        }
        self.run_locked()
    }

    /// The loop proper; the caller holds the writer lock.
    fn run_locked(&mut self) -> Result<RunReport> {
        let mut tasks_completed = 0;
        loop {
            if interrupt::interrupted() {
                return Ok(RunReport {
                    tasks_completed,
                    stop: StopReason::Interrupted,
                });
            }
            match self.step_once()? {
                StepResult::TaskDone => tasks_completed += 1,
                StepResult::Stop(stop) => {
                    return Ok(RunReport {
                        tasks_completed,
                        stop,
                    });
                }
            }
        }
    }

    /// Pure integrity check: config, registry, and the full recursive tree.
    pub fn validate(&self) -> Result<()> {
        self.store.load()?;
        Ok(())
    }

    /// Read-only context report.
    pub fn status_report(&self) -> Result<StatusReport> {
        let Some(cursor) = self.store.find_active()? else {
            return Ok(StatusReport { active: None });
        };
        let state_id = cursor.state_id();
        let current_step_index = self
            .states
            .load(&state_id)?
            .map(|state| state.current_step_index);
        Ok(StatusReport {
            active: Some(ActiveSummary {
                task_name: cursor.task.name,
                state_id,
                doc: cursor.doc,
                current_step_index,
            }),
        })
    }

    /// Revert a task (and descendants) to PENDING; drop its run state.
    pub fn reset(&mut self, task_id: &str) -> Result<()> {
        let _writer = self.store.acquire_writer_lock(WRITER_LOCK_DEADLINE)?;
        let mut tree = self.store.load()?;
        tree.reset_task(task_id)?;
        self.store.save(&tree)?;
        self.events.gc_blobs(task_id)?;
        self.states.gc(task_id)?;
        intent::release(&self.paths.state_dir, task_id)?;
        Ok(())
    }

    /// Move a DONE task back to ACTIVE.
    pub fn reopen(&mut self, task_id: &str) -> Result<()> {
        let _writer = self.store.acquire_writer_lock(WRITER_LOCK_DEADLINE)?;
        let mut tree = self.store.load()?;
        tree.reopen_task(task_id)?;
        self.store.save(&tree)?;
        Ok(())
    }

    fn step_once(&mut self) -> Result<StepResult> {
        let Some(cursor) = self.advance_cursor()? else {
            return Ok(StepResult::Stop(StopReason::Complete));
        };
        let state_id = cursor.state_id();
        debug!(task = %cursor.task.name, %state_id, "dispatching task");

        // An active proxy whose sub-flow is exhausted just closes out.
        if cursor.task.ref_path.is_some() {
            return self.close_exhausted_proxy(&cursor);
        }

        let route = dispatch::route(&cursor.task.name, |key| self.registry.contains(key));
        let (definition, is_manual) = match self.route_to_definition(&cursor, &route)? {
            Ok(pair) => pair,
            Err(stop) => return Ok(StepResult::Stop(stop)),
        };

        let outcome = self.run_flow(&state_id, &definition, 0, None, &cursor)?;
        match outcome {
            FlowOutcome::Completed => {
                self.complete_cursor_task(&cursor)?;
                self.events.emit(
                    &state_id,
                    "-",
                    EventDraft::new("task.completed", json!({"task": cursor.task.name})),
                )?;
                self.events.gc_blobs(&state_id)?;
                self.states.gc(&state_id)?;
                Ok(StepResult::TaskDone)
            }
            FlowOutcome::Waiting { message, .. } => {
                if is_manual {
                    Ok(StepResult::Stop(StopReason::NeedsHuman { task_id: state_id }))
                } else {
                    Ok(StepResult::Stop(StopReason::Waiting {
                        task_id: state_id,
                        message,
                    }))
                }
            }
            FlowOutcome::StepError { step_id, message } => {
                warn!(task_id = %state_id, %step_id, %message, "step error; halting");
                Ok(StepResult::Stop(StopReason::StepError {
                    task_id: state_id,
                    message,
                }))
            }
            FlowOutcome::Fatal { attempts, .. } => {
                self.mark_fatal(&cursor)?;
                Ok(StepResult::Stop(StopReason::Fatal {
                    task_id: state_id,
                    attempts,
                }))
            }
            FlowOutcome::Interrupted => Ok(StepResult::Stop(StopReason::Interrupted)),
        }
    }

    /// Resolve the runnable definition for a routed task.
    ///
    /// Inner `Err(stop)` carries early stops (broken atoms) that are not
    /// engine failures.
    fn route_to_definition(
        &self,
        cursor: &ActiveCursor,
        route: &Route,
    ) -> Result<std::result::Result<(FlowDefinition, bool), StopReason>> {
        let single = |name: &str, target: &str| FlowDefinition {
            name: name.to_string(),
            version: "1.0".to_string(),
            steps: vec![StepDef {
                id: name.to_string(),
                step_type: StepType::Atom,
                target: target.to_string(),
                args: Map::new(),
                export: Default::default(),
            }],
        };

        match route {
            Route::SubFlow => Ok(Ok((single("sub_flow", "builtin:sub_flow"), false))),
            Route::Manual => Ok(Ok((
                single("manual_intervention", "builtin:manual_intervention"),
                true,
            ))),
            Route::Atom(key) => {
                let entry = self.registry.get(key).expect("routed keys are registered");
                if let EntryStatus::Broken(reason) = &entry.status {
                    let state_id = cursor.state_id();
                    self.events.emit(
                        &state_id,
                        "-",
                        EventDraft::new(
                            "dispatch.broken_atom",
                            json!({"atom": key, "reason": reason}),
                        ),
                    )?;
                    return Ok(Err(StopReason::StepError {
                        task_id: state_id,
                        message: format!("atom '{key}' is BROKEN: {reason}"),
                    }));
                }
                match parse_impl_id(&entry.impl_id) {
                    Ok(ImplRef::Builtin(_)) => {
                        Ok(Ok((single(key, &entry.impl_id), false)))
                    }
                    Ok(ImplRef::Flow(rel)) => {
                        let def = flow::load_flow(&self.paths.flows_dir, rel)?;
                        Ok(Ok((def, false)))
                    }
                    Err(reason) => Ok(Err(StopReason::StepError {
                        task_id: cursor.state_id(),
                        message: reason,
                    })),
                }
            }
        }
    }

    /// Walk the cursor to a runnable task: activate pending cursors and
    /// descend into pending children, one document mutation per iteration.
    fn advance_cursor(&mut self) -> Result<Option<ActiveCursor>> {
        loop {
            let Some(cursor) = self.store.find_active()? else {
                return Ok(None);
            };
            let local_id = cursor.chain.last().expect("cursor chain is never empty");

            if cursor.task.status == TaskStatus::Pending {
                let mut tree = self.store.load_doc_or_root(cursor.doc.as_deref())?;
                tree.update_task(local_id, TaskUpdate::status(TaskStatus::Active))?;
                self.store.save_doc_or_root(cursor.doc.as_deref(), &tree)?;
                continue;
            }

            if cursor.task.ref_path.is_none() {
                if let Some(child) = cursor
                    .task
                    .children
                    .iter()
                    .find(|c| c.status == TaskStatus::Pending)
                {
                    let mut tree = self.store.load_doc_or_root(cursor.doc.as_deref())?;
                    tree.update_task(&child.id, TaskUpdate::status(TaskStatus::Active))?;
                    self.store.save_doc_or_root(cursor.doc.as_deref(), &tree)?;
                    continue;
                }
                if !cursor.task.children.is_empty() {
                    // Container with every child closed: fold it shut and
                    // keep walking.
                    self.complete_cursor_task(&cursor)?;
                    continue;
                }
            }

            return Ok(Some(cursor));
        }
    }

    /// A proxy task whose sub-document has no remaining work completes; an
    /// unreadable sub-document halts.
    fn close_exhausted_proxy(&mut self, cursor: &ActiveCursor) -> Result<StepResult> {
        let ref_path = cursor.task.ref_path.as_deref().expect("caller checked ref");
        let state_id = cursor.state_id();
        match self.store.load_doc(ref_path) {
            Ok(sub_tree) => {
                let open = crate::core::selector::cursor(&sub_tree).is_some();
                if open {
                    // find_active should have descended; treat as a state
                    // inconsistency rather than looping forever.
                    return Ok(StepResult::Stop(StopReason::StepError {
                        task_id: state_id,
                        message: format!("sub-flow {ref_path} still has open tasks"),
                    }));
                }
                self.complete_cursor_task(cursor)?;
                self.events.emit(
                    &state_id,
                    "-",
                    EventDraft::new("task.completed", json!({"task": cursor.task.name})),
                )?;
                Ok(StepResult::TaskDone)
            }
            Err(err) => Ok(StepResult::Stop(StopReason::StepError {
                task_id: state_id,
                message: format!("sub-status {ref_path} unreadable: {err}"),
            })),
        }
    }

    fn complete_cursor_task(&mut self, cursor: &ActiveCursor) -> Result<()> {
        let local_id = cursor.chain.last().expect("cursor chain is never empty");
        let mut tree = self.store.load_doc_or_root(cursor.doc.as_deref())?;
        tree.update_task(local_id, TaskUpdate::status(TaskStatus::Done))?;
        self.store.save_doc_or_root(cursor.doc.as_deref(), &tree)?;
        Ok(())
    }

    /// Record FATAL where humans will see it: the root document header.
    /// The four-marker wire grammar has no fatal marker, so the task itself
    /// keeps its focus and the engine refuses to advance.
    fn mark_fatal(&mut self, cursor: &ActiveCursor) -> Result<()> {
        let mut tree = self.store.load_root()?;
        tree.set_header("Fatal-Task", cursor.task.name.clone());
        self.store.save(&tree)?;
        Ok(())
    }

    fn run_flow(
        &mut self,
        state_id: &str,
        def: &FlowDefinition,
        depth: usize,
        parent_ref: Option<String>,
        cursor: &ActiveCursor,
    ) -> Result<FlowOutcome> {
        if depth >= self.config.recursion_cap {
            return Ok(FlowOutcome::StepError {
                step_id: "-".to_string(),
                message: format!(
                    "workflow composition depth exceeds the cap of {}",
                    self.config.recursion_cap
                ),
            });
        }

        let mut state = self
            .states
            .load(state_id)?
            .unwrap_or_else(|| crate::io::state_store::WorkflowState::new(state_id));
        state.status = RunStatus::InProgress;
        state.parent_ref = parent_ref;
        self.seed_context(&mut state, cursor);

        while state.current_step_index < def.steps.len() {
            let step = def.steps[state.current_step_index].clone();

            if interrupt::interrupted() {
                let record = state.step_mut(&step.id);
                record.status = StepStatus::Interrupted;
                state.status = RunStatus::InProgress;
                self.states.save(&state)?;
                intent::release(&self.paths.state_dir, state_id)?;
                return Ok(FlowOutcome::Interrupted);
            }

            if state
                .steps_history
                .get(&step.id)
                .is_some_and(|r| r.status == StepStatus::Completed)
            {
                state.current_step_index += 1;
                continue;
            }

            let intent_record = intent::acquire(&self.paths.state_dir, state_id, &step.id)?;
            if intent_record.attempt_n > self.config.retry_bound {
                let record = state.step_mut(&step.id);
                record.status = StepStatus::Fatal;
                record.attempts = intent_record.attempt_n;
                record.error = Some(format!(
                    "retry bound of {} exceeded",
                    self.config.retry_bound
                ));
                state.status = RunStatus::Failed;
                self.states.save(&state)?;
                intent::release(&self.paths.state_dir, state_id)?;
                self.events.emit(
                    state_id,
                    &step.id,
                    EventDraft::new("step.fatal", json!({"attempts": intent_record.attempt_n})),
                )?;
                return Ok(FlowOutcome::Fatal {
                    step_id: step.id.clone(),
                    attempts: intent_record.attempt_n,
                });
            }

            {
                let record = state.step_mut(&step.id);
                record.status = StepStatus::InProgress;
                record.attempts = intent_record.attempt_n;
                record.started_at = Some(chrono::Utc::now().to_rfc3339());
            }
            self.states.save(&state)?;
            self.events.emit(
                state_id,
                &step.id,
                EventDraft::new("step.started", json!({"attempt": intent_record.attempt_n})),
            )?;

            let step_outcome = match step.step_type {
                StepType::Workflow => {
                    self.run_sub_workflow(state_id, &step, depth, cursor, &mut state)?
                }
                StepType::Atom => self.run_atom_step(state_id, &step, cursor, &mut state)?,
            };

            match step_outcome {
                None => {
                    // Step completed; advance and keep looping.
                    state.current_step_index += 1;
                    self.states.save(&state)?;
                    intent::release(&self.paths.state_dir, state_id)?;
                }
                Some(outcome) => return Ok(outcome),
            }
        }

        state.status = RunStatus::Completed;
        self.states.save(&state)?;
        Ok(FlowOutcome::Completed)
    }

    /// Run one atom step. `None` means the step completed and the flow
    /// should advance; `Some` is a terminal outcome for this flow call.
    fn run_atom_step(
        &mut self,
        state_id: &str,
        step: &StepDef,
        cursor: &ActiveCursor,
        state: &mut crate::io::state_store::WorkflowState,
    ) -> Result<Option<FlowOutcome>> {
        let atom = match self.resolve_step_atom(&step.target) {
            Ok(atom) => atom,
            Err(reason) => {
                let record = state.step_mut(&step.id);
                record.status = StepStatus::Error;
                record.error = Some(reason.clone());
                state.status = RunStatus::Failed;
                self.states.save(state)?;
                self.events.emit(
                    state_id,
                    &step.id,
                    EventDraft::new("step.error", json!({"reason": reason})),
                )?;
                return Ok(Some(FlowOutcome::StepError {
                    step_id: step.id.clone(),
                    message: reason,
                }));
            }
        };

        let args = flow::resolve_args(&step.args, &state.context_cache);
        let snapshot = state.context_cache.clone();
        let ctx = AtomContext {
            task_id: state_id,
            task_name: &cursor.task.name,
            step_id: &step.id,
            args: &args,
            context: &snapshot,
            tools: &self.tools,
        };

        let result = match catch_unwind(AssertUnwindSafe(|| atom.run(&ctx))) {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => AtomResult::error(err.to_string()),
            Err(panic) => {
                AtomResult::error(format!("atom panicked: {}", panic_message(panic.as_ref())))
            }
        };

        if interrupt::interrupted() {
            atom.cleanup();
        }

        for draft in result.events {
            self.events.emit(state_id, &step.id, draft)?;
        }

        match result.status {
            AtomStatus::Success => {
                let exports = filter_exports(result.exports);
                let digest = export_digest(&exports);
                for (internal, context_key) in &step.export {
                    if let Some(value) = exports.get(internal) {
                        state
                            .context_cache
                            .insert(context_key.clone(), value.clone());
                    }
                }
                for (key, value) in exports {
                    state.context_cache.insert(key, value);
                }
                let record = state.step_mut(&step.id);
                record.status = StepStatus::Completed;
                record.completed_at = Some(chrono::Utc::now().to_rfc3339());
                record.error = None;
                record.export_digest = Some(digest);
                self.events.emit(
                    state_id,
                    &step.id,
                    EventDraft::new("step.completed", json!({"message": result.message})),
                )?;
                Ok(None)
            }
            AtomStatus::Waiting => {
                let record = state.step_mut(&step.id);
                record.status = StepStatus::Waiting;
                state.status = RunStatus::InProgress;
                self.states.save(state)?;
                intent::release(&self.paths.state_dir, state_id)?;
                self.events.emit(
                    state_id,
                    &step.id,
                    EventDraft::new("step.waiting", json!({"message": result.message})),
                )?;
                Ok(Some(FlowOutcome::Waiting {
                    step_id: step.id.clone(),
                    message: result.message,
                }))
            }
            AtomStatus::Failure | AtomStatus::Error => {
                let record = state.step_mut(&step.id);
                record.status = StepStatus::Error;
                record.error = Some(result.message.clone());
                state.status = RunStatus::Failed;
                self.states.save(state)?;
                // The intent lock stays: the next boot increments the
                // attempt counter toward the circuit breaker.
                self.events.emit(
                    state_id,
                    &step.id,
                    EventDraft::new("step.error", json!({"message": result.message})),
                )?;
                Ok(Some(FlowOutcome::StepError {
                    step_id: step.id.clone(),
                    message: result.message,
                }))
            }
        }
    }

    fn run_sub_workflow(
        &mut self,
        state_id: &str,
        step: &StepDef,
        depth: usize,
        cursor: &ActiveCursor,
        state: &mut crate::io::state_store::WorkflowState,
    ) -> Result<Option<FlowOutcome>> {
        let sub_def = match flow::load_flow(&self.paths.flows_dir, &step.target) {
            Ok(def) => def,
            Err(err) => {
                let message = err.to_string();
                let record = state.step_mut(&step.id);
                record.status = StepStatus::Error;
                record.error = Some(message.clone());
                state.status = RunStatus::Failed;
                self.states.save(state)?;
                intent::release(&self.paths.state_dir, state_id)?;
                return Ok(Some(FlowOutcome::StepError {
                    step_id: step.id.clone(),
                    message,
                }));
            }
        };

        let sub_id = format!("{state_id}#{}", step.id);
        let outcome = self.run_flow(&sub_id, &sub_def, depth + 1, Some(state_id.to_string()), cursor)?;
        match outcome {
            FlowOutcome::Completed => {
                let record = state.step_mut(&step.id);
                record.status = StepStatus::Completed;
                record.completed_at = Some(chrono::Utc::now().to_rfc3339());
                Ok(None)
            }
            FlowOutcome::Waiting { step_id, message } => {
                let record = state.step_mut(&step.id);
                record.status = StepStatus::Waiting;
                self.states.save(state)?;
                intent::release(&self.paths.state_dir, state_id)?;
                Ok(Some(FlowOutcome::Waiting { step_id, message }))
            }
            other => {
                let record = state.step_mut(&step.id);
                record.status = match other {
                    FlowOutcome::Fatal { .. } => StepStatus::Fatal,
                    FlowOutcome::Interrupted => StepStatus::Interrupted,
                    _ => StepStatus::Error,
                };
                state.status = RunStatus::Failed;
                self.states.save(state)?;
                intent::release(&self.paths.state_dir, state_id)?;
                Ok(Some(other))
            }
        }
    }

    fn resolve_step_atom(&self, target: &str) -> std::result::Result<Box<dyn Atom>, String> {
        if let Some(name) = target.strip_prefix("builtin:") {
            return resolve_builtin(name);
        }
        let Some(entry) = self.registry.get(target) else {
            return Err(format!("Unknown Atom Reference: {target}"));
        };
        match &entry.status {
            EntryStatus::Broken(reason) => Err(format!("atom '{target}' is BROKEN: {reason}")),
            EntryStatus::Ok => match parse_impl_id(&entry.impl_id)? {
                ImplRef::Builtin(name) => resolve_builtin(name),
                ImplRef::Flow(_) => Err(format!(
                    "step ref '{target}' resolves to a flow; use type \"workflow\""
                )),
            },
        }
    }

    /// Engine-owned context keys, re-seeded on every run.
    fn seed_context(
        &self,
        state: &mut crate::io::state_store::WorkflowState,
        cursor: &ActiveCursor,
    ) {
        state.context_cache.insert(
            "system.task_id".to_string(),
            Value::String(cursor.state_id()),
        );
        state.context_cache.insert(
            "system.task_name".to_string(),
            Value::String(cursor.task.name.clone()),
        );
        state.context_cache.insert(
            "system.root".to_string(),
            Value::String(self.paths.root.display().to_string()),
        );
    }
}

/// Atoms cannot overwrite engine-owned state: reserved prefixes are dropped.
fn filter_exports(exports: Map<String, Value>) -> Map<String, Value> {
    let mut filtered = Map::new();
    for (key, value) in exports {
        if key.starts_with("config.") || key.starts_with("system.") {
            warn!(%key, "discarding reserved export key");
            continue;
        }
        filtered.insert(key, value);
    }
    filtered
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
