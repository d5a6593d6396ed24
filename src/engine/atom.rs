//! Atoms: the only units of work the engine dispatches to.
//!
//! Atoms are compiled into a fixed catalog and exposed through the registry
//! whitelist; there is no filesystem-scan loading. Each run receives a
//! read-only context snapshot and a scoped tool wrapper, and returns a tagged
//! `AtomResult` instead of using errors for control flow.

use std::path::PathBuf;
use std::process::Command;

use serde_json::{Map, Value, json};

use crate::error::{FlowError, Result};
use crate::io::config::{LoomConfig, ScopeConfig};
use crate::io::event_log::EventDraft;
use crate::io::loom::{Loom, Position};

/// Tagged outcome of one atom invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomStatus {
    Success,
    Failure,
    Error,
    /// Human gate: the engine persists state and yields control.
    Waiting,
}

#[derive(Debug)]
pub struct AtomResult {
    pub status: AtomStatus,
    pub message: String,
    pub exports: Map<String, Value>,
    pub events: Vec<EventDraft>,
}

impl AtomResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self::with_status(AtomStatus::Success, message)
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self::with_status(AtomStatus::Failure, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::with_status(AtomStatus::Error, message)
    }

    pub fn waiting(message: impl Into<String>) -> Self {
        Self::with_status(AtomStatus::Waiting, message)
    }

    fn with_status(status: AtomStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            exports: Map::new(),
            events: Vec::new(),
        }
    }

    pub fn export(mut self, key: impl Into<String>, value: Value) -> Self {
        self.exports.insert(key.into(), value);
        self
    }

    pub fn event(mut self, draft: EventDraft) -> Self {
        self.events.push(draft);
        self
    }
}

/// Role-scoped capabilities visible to an atom. File edits are gated by the
/// whitelist inside the Loom; there is no other write path.
#[derive(Debug)]
pub struct ToolScope {
    pub role: String,
    root: PathBuf,
    loom: Loom,
}

impl ToolScope {
    pub fn new(root: impl Into<PathBuf>, loom_config: LoomConfig, scope: &ScopeConfig) -> Self {
        let root = root.into();
        Self {
            loom: Loom::new(&root, loom_config, scope.allow.clone()),
            role: scope.role.clone(),
            root,
        }
    }

    pub fn loom(&self) -> &Loom {
        &self.loom
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }
}

/// Everything an atom may see. The context snapshot is shared immutably;
/// engine-owned keys cannot be overwritten because exports are filtered on
/// the way back.
pub struct AtomContext<'a> {
    pub task_id: &'a str,
    pub task_name: &'a str,
    pub step_id: &'a str,
    pub args: &'a Map<String, Value>,
    pub context: &'a Map<String, Value>,
    pub tools: &'a ToolScope,
}

pub trait Atom {
    fn run(&self, ctx: &AtomContext<'_>) -> Result<AtomResult>;

    /// Called on interrupt, under a short time budget.
    fn cleanup(&self) {}
}

/// Implementation identifiers accepted in `flow.registry.json`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImplRef<'a> {
    /// A catalog atom, e.g. `builtin:run_command`.
    Builtin(&'a str),
    /// A multi-step flow definition file under `flows/`.
    Flow(&'a str),
}

pub fn parse_impl_id(impl_id: &str) -> std::result::Result<ImplRef<'_>, String> {
    if let Some(name) = impl_id.strip_prefix("builtin:") {
        return Ok(ImplRef::Builtin(name));
    }
    if let Some(rel) = impl_id.strip_prefix("flow:") {
        return Ok(ImplRef::Flow(rel));
    }
    Err(format!(
        "implementation id '{impl_id}' is neither 'builtin:<atom>' nor 'flow:<file>'"
    ))
}

/// Instantiate a catalog atom by name.
pub fn resolve_builtin(name: &str) -> std::result::Result<Box<dyn Atom>, String> {
    match name {
        "manual_intervention" => Ok(Box::new(ManualInterventionAtom)),
        "sub_flow" => Ok(Box::new(SubFlowAtom)),
        "run_command" => Ok(Box::new(RunCommandAtom)),
        "wait_approval" => Ok(Box::new(WaitApprovalAtom)),
        "loom_edit" => Ok(Box::new(LoomEditAtom)),
        "context_set" => Ok(Box::new(ContextSetAtom)),
        other => Err(format!("unknown builtin atom '{other}'")),
    }
}

/// Fallback when no route matches: record that a human is needed and yield.
pub struct ManualInterventionAtom;

impl Atom for ManualInterventionAtom {
    fn run(&self, ctx: &AtomContext<'_>) -> Result<AtomResult> {
        Ok(AtomResult::waiting(format!(
            "Manual intervention required for task: {}",
            ctx.task_name
        ))
        .event(EventDraft::new(
            "needs_human",
            json!({"task": ctx.task_name}),
        )))
    }
}

/// Pseudo-atom for tasks marked as sub-flows at the line level.
pub struct SubFlowAtom;

impl Atom for SubFlowAtom {
    fn run(&self, _ctx: &AtomContext<'_>) -> Result<AtomResult> {
        Ok(AtomResult::success("Flow dispatched"))
    }
}

/// Shell delegation: run a whitelisted command (e.g. a per-service test
/// script) in the project root and report its outcome.
pub struct RunCommandAtom;

impl Atom for RunCommandAtom {
    fn run(&self, ctx: &AtomContext<'_>) -> Result<AtomResult> {
        let command: Vec<String> = match ctx.args.get("command") {
            Some(Value::Array(parts)) => parts
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        };
        let Some((program, args)) = command.split_first() else {
            return Ok(AtomResult::error("run_command: 'command' must be a non-empty array"));
        };

        let output = Command::new(program)
            .args(args)
            .current_dir(ctx.tools.root())
            .output();
        let output = match output {
            Ok(output) => output,
            Err(err) => {
                return Ok(AtomResult::failure(format!("failed to spawn {program}: {err}")));
            }
        };

        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let tail: String = stdout
            .lines()
            .rev()
            .take(20)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect::<Vec<_>>()
            .join("\n");

        let result = if output.status.success() {
            AtomResult::success(format!("{program} succeeded"))
        } else {
            AtomResult::failure(format!("{program} exited with {exit_code}"))
        };
        Ok(result
            .export("exit_code", json!(exit_code))
            .export("stdout_tail", json!(tail)))
    }
}

/// Human gate: succeeds only once the context carries `approved = true`.
pub struct WaitApprovalAtom;

impl Atom for WaitApprovalAtom {
    fn run(&self, ctx: &AtomContext<'_>) -> Result<AtomResult> {
        let approved = ctx
            .args
            .get("approved")
            .or_else(|| ctx.context.get("approved"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if approved {
            Ok(AtomResult::success("Approved"))
        } else {
            Ok(AtomResult::waiting("Awaiting manual approval"))
        }
    }
}

/// Surgical edit through the scoped Loom.
pub struct LoomEditAtom;

impl Atom for LoomEditAtom {
    fn run(&self, ctx: &AtomContext<'_>) -> Result<AtomResult> {
        let path = require_str(ctx.args, "path")?;
        let anchor = require_str(ctx.args, "anchor")?;
        let content = require_str(ctx.args, "content")?;
        let position = match ctx.args.get("position").and_then(Value::as_str) {
            Some("before") => Position::Before,
            _ => Position::After,
        };

        match ctx.tools.loom().insert(path, anchor, content, position) {
            Ok(()) => Ok(AtomResult::success(format!("edited {path}"))
                .event(EventDraft::new("loom.edited", json!({"path": path})))),
            Err(err @ (FlowError::ResourceBusy(_) | FlowError::ContentChanged(_))) => {
                Ok(AtomResult::failure(err.to_string()))
            }
            Err(err) => Err(err),
        }
    }
}

/// Write literal values into the shared context.
pub struct ContextSetAtom;

impl Atom for ContextSetAtom {
    fn run(&self, ctx: &AtomContext<'_>) -> Result<AtomResult> {
        let mut result = AtomResult::success("context updated");
        for (key, value) in ctx.args {
            result.exports.insert(key.clone(), value.clone());
        }
        Ok(result)
    }
}

fn require_str<'a>(args: &'a Map<String, Value>, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| FlowError::Contract(format!("missing required string arg '{key}'")))
}
