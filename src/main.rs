//! Checklist-driven workflow engine CLI.
//!
//! `status.md` under `.flow/` is the program counter; these commands start,
//! resume, inspect, and repair runs against it.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};

use flowrun::engine::runner::{Engine, RunReport, StopReason};
use flowrun::error::FlowError;
use flowrun::io::paths::init_flow;
use flowrun::{exit_codes, logging};

#[derive(Parser)]
#[command(
    name = "flowrun",
    version,
    about = "Checklist-driven workflow orchestration engine"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.flow/` scaffolding in the current directory.
    Init,
    /// Begin a run, optionally forcing a specific task active first.
    Start {
        /// Virtual dotted id (e.g. `1.2`) of the task to activate.
        task_id: Option<String>,
    },
    /// Continue the currently active task.
    Resume,
    /// Print the current cursor and step without mutating anything.
    Status,
    /// Pure integrity check of config, registry, and the status tree.
    Validate,
    /// Revert a task and its descendants to pending.
    Reset { task_id: Option<String> },
    /// Move a completed task back to active.
    Reopen { task_id: Option<String> },
}

fn main() -> ExitCode {
    logging::init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => ExitCode::from(code as u8),
        Err(err) => {
            eprintln!("flowrun: {err:#}");
            let code = err
                .downcast_ref::<FlowError>()
                .map(FlowError::exit_code)
                .unwrap_or(exit_codes::ERROR);
            ExitCode::from(code as u8)
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let cwd = working_dir()?;

    if let Command::Init = cli.command {
        let paths = init_flow(&cwd)?;
        println!("Initialized {}", paths.flow_dir.display());
        return Ok(exit_codes::OK);
    }

    let mut engine = Engine::hydrate(&cwd)?;
    match cli.command {
        Command::Init => unreachable!("handled above"),
        Command::Start { task_id } => {
            let report = engine.start(task_id.as_deref())?;
            Ok(report_outcome(&report))
        }
        Command::Resume => {
            let report = engine.run()?;
            Ok(report_outcome(&report))
        }
        Command::Status => {
            match engine.status_report()?.active {
                Some(active) => {
                    println!("Active task: {}", active.task_name);
                    println!("State id:    {}", active.state_id);
                    if let Some(doc) = &active.doc {
                        println!("Document:    {doc}");
                    }
                    if let Some(index) = active.current_step_index {
                        println!("Step index:  {index}");
                    }
                }
                None => println!("No active or pending task."),
            }
            Ok(exit_codes::OK)
        }
        Command::Validate => {
            engine.validate()?;
            println!("Status tree valid.");
            Ok(exit_codes::OK)
        }
        Command::Reset { task_id } => {
            let task_id = match task_id {
                Some(task_id) => task_id,
                None => active_root_task(&engine)?,
            };
            engine.reset(&task_id)?;
            println!("Task {task_id} reset to pending.");
            Ok(exit_codes::OK)
        }
        Command::Reopen { task_id } => {
            let task_id =
                task_id.ok_or_else(|| anyhow!("reopen needs a task id (completed tasks have no cursor)"))?;
            engine.reopen(&task_id)?;
            println!("Task {task_id} reopened.");
            Ok(exit_codes::OK)
        }
    }
}

fn report_outcome(report: &RunReport) -> i32 {
    match &report.stop {
        StopReason::Complete => {
            println!("All tasks complete ({} finished this run).", report.tasks_completed);
            exit_codes::OK
        }
        StopReason::Waiting { task_id, message } => {
            println!("Waiting at {task_id}: {message}");
            exit_codes::OK
        }
        StopReason::NeedsHuman { task_id } => {
            println!("Manual intervention required for task {task_id}.");
            exit_codes::OK
        }
        StopReason::StepError { task_id, message } => {
            eprintln!("Step failed in task {task_id}: {message}");
            exit_codes::ERROR
        }
        StopReason::Fatal { task_id, attempts } => {
            eprintln!("Task {task_id} is FATAL after {attempts} attempts.");
            exit_codes::ERROR
        }
        StopReason::Interrupted => {
            eprintln!("Interrupted; state flushed.");
            exit_codes::INTERRUPTED
        }
    }
}

/// The task id `reset` operates on when none was given: the root-document
/// ancestor of the current cursor.
fn active_root_task(engine: &Engine) -> Result<String> {
    let report = engine.status_report()?;
    let active = report
        .active
        .ok_or_else(|| anyhow!("no active task to reset; provide a task id"))?;
    let root_id = active
        .state_id
        .split('#')
        .next()
        .expect("state id is non-empty")
        .to_string();
    Ok(root_id)
}

/// `FLOW_ROOT` is honored only so tests can pin the discovery start point.
fn working_dir() -> Result<PathBuf> {
    if let Some(root) = std::env::var_os("FLOW_ROOT") {
        return Ok(PathBuf::from(root));
    }
    std::env::current_dir().context("read current directory")
}
