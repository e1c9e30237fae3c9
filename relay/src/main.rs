//! Handoff-protocol coordination engine CLI.
//!
//! Drives builder and verifier collaborators through sprint cycles over a
//! fixed roadmap (`relay run`), records every cycle in an append-only
//! ledger under `.relay/`, and surfaces escalations for operator
//! resolution.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use relay::core::decision::TaskStatus;
use relay::drive::{Collaborators, LoopStop, run_task};
use relay::exit_codes;
use relay::io::checks::CommandCheckHarness;
use relay::io::collaborator::CommandCollaborator;
use relay::io::config::load_config;
use relay::io::ledger::LedgerWriteError;
use relay::io::paths::require_engine_dir;
use relay::io::recall::JsonlRecallStore;
use relay::logging;
use relay::resolve::submit_resolution;
use relay::start::start_task;
use relay::status::{escalated_tasks, task_status};

#[derive(Parser)]
#[command(
    name = "relay",
    version,
    about = "Deterministic builder/verifier handoff engine"
)]
struct Cli {
    /// Repository the engine operates on.
    #[arg(long, global = true, default_value = ".")]
    workdir: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Register a task and scaffold `.relay/` on first use.
    Start {
        task_id: String,
        /// Roadmap item; repeat once per item, in order.
        #[arg(long = "item")]
        items: Vec<String>,
        /// JSON file holding the roadmap as an array of strings.
        #[arg(long, conflicts_with = "items")]
        roadmap: Option<PathBuf>,
    },
    /// Run sprint cycles until the task completes, escalates, or hits the
    /// configured sprint cap.
    Run { task_id: String },
    /// Run exactly one sprint cycle.
    Sprint { task_id: String },
    /// Print the folded state of a task.
    Status { task_id: String },
    /// List escalated tasks with their context trails.
    Escalations,
    /// Record an operator resolution for an escalated task.
    Resolve {
        task_id: String,
        /// Guidance handed to the re-entry sprint.
        #[arg(long)]
        synopsis: String,
        /// Corrected defect capsule (JSON file), replacing the open defect.
        #[arg(long)]
        defect_file: Option<PathBuf>,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            // A ledger write failure means a sprint happened that the
            // ledger does not know about; callers must not retry blindly.
            let code = if err.downcast_ref::<LedgerWriteError>().is_some() {
                exit_codes::FAULT
            } else {
                exit_codes::INVALID
            };
            std::process::exit(code);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = cli.workdir;
    match cli.command {
        Command::Start {
            task_id,
            items,
            roadmap,
        } => cmd_start(&root, &task_id, items, roadmap.as_deref()),
        Command::Run { task_id } => cmd_run(&root, &task_id, None),
        Command::Sprint { task_id } => cmd_run(&root, &task_id, Some(1)),
        Command::Status { task_id } => cmd_status(&root, &task_id),
        Command::Escalations => cmd_escalations(&root),
        Command::Resolve {
            task_id,
            synopsis,
            defect_file,
        } => cmd_resolve(&root, &task_id, &synopsis, defect_file.as_deref()),
    }
}

fn cmd_start(
    root: &Path,
    task_id: &str,
    items: Vec<String>,
    roadmap_file: Option<&Path>,
) -> Result<i32> {
    let roadmap = match roadmap_file {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("read roadmap {}", path.display()))?;
            serde_json::from_str::<Vec<String>>(&raw).with_context(|| {
                format!(
                    "parse roadmap {} (expected a JSON array of strings)",
                    path.display()
                )
            })?
        }
        None => items,
    };
    let outcome = start_task(root, task_id, &roadmap)?;
    if outcome.created {
        println!(
            "task {} registered ({} roadmap items)",
            outcome.task_id, outcome.roadmap_len
        );
    } else {
        println!(
            "task {} already registered ({} roadmap items)",
            outcome.task_id, outcome.roadmap_len
        );
    }
    Ok(exit_codes::OK)
}

fn cmd_run(root: &Path, task_id: &str, sprint_cap: Option<u64>) -> Result<i32> {
    let paths = require_engine_dir(root)?;
    let mut config = load_config(&paths.config_path)?;
    if let Some(cap) = sprint_cap {
        config.max_sprints = cap;
    }

    let builder = CommandCollaborator::new(config.builder.command.clone());
    let verifier = CommandCollaborator::new(config.verifier.command.clone());
    let checks = CommandCheckHarness::new(config.checks.command.clone());
    let recall = JsonlRecallStore::new(paths.recall_path.clone());
    let collab = Collaborators {
        builder: &builder,
        verifier: &verifier,
        checks: &checks,
        recall: &recall,
    };

    let outcome = run_task(root, task_id, &config, &collab, |entry, decision| {
        println!(
            "sprint {}: {} -> {}",
            entry.sprint_id,
            entry.verdict.as_str(),
            decision
        );
    })?;

    match outcome.stop {
        LoopStop::Complete => {
            println!(
                "task {} complete after {} sprint(s) this invocation",
                outcome.task_id, outcome.sprints_executed
            );
            Ok(exit_codes::COMPLETE)
        }
        LoopStop::Escalated { sprint_id, reason } => {
            println!(
                "task {} escalated at sprint {sprint_id} ({reason}); \
                 resolve with `relay resolve {} --synopsis ...`",
                outcome.task_id, outcome.task_id
            );
            Ok(exit_codes::ESCALATED)
        }
        LoopStop::MaxSprints { executed, .. } => {
            println!(
                "sprint cap reached after {executed} sprint(s); task {} still running",
                outcome.task_id
            );
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_status(root: &Path, task_id: &str) -> Result<i32> {
    let paths = require_engine_dir(root)?;
    let config = load_config(&paths.config_path)?;
    let view = task_status(root, task_id, &config)?;

    println!(
        "task {}: {} ({}/{} items, sprint {}, {} tokens spent)",
        view.state.task_id,
        view.state.status.as_str(),
        view.state.roadmap_position,
        view.roadmap_len,
        view.state.current_sprint_id,
        view.state.tokens_spent
    );
    if let Some(chunk) = &view.current_chunk {
        println!("current item: {chunk}");
    }
    if let Some(reason) = view.state.escalation_reason {
        println!("escalation: {reason}");
    }

    Ok(match view.state.status {
        TaskStatus::Running => exit_codes::OK,
        TaskStatus::Escalated => exit_codes::ESCALATED,
        TaskStatus::Complete => exit_codes::COMPLETE,
    })
}

fn cmd_escalations(root: &Path) -> Result<i32> {
    let paths = require_engine_dir(root)?;
    let config = load_config(&paths.config_path)?;
    let views = escalated_tasks(root, &config)?;

    if views.is_empty() {
        println!("no escalated tasks");
        return Ok(exit_codes::OK);
    }
    for view in &views {
        println!(
            "task {} escalated at sprint {} ({}) on '{}'",
            view.task_id, view.sprint_id, view.reason, view.roadmap_chunk
        );
        for entry in &view.trail {
            let defect = entry
                .defect_capsule
                .as_ref()
                .map(|capsule| {
                    format!("{}: {}", capsule.defect_type, capsule.root_cause_synopsis)
                })
                .unwrap_or_else(|| "no defect".to_string());
            println!(
                "  sprint {} [{}] {}",
                entry.sprint_id,
                entry.verdict.as_str(),
                defect
            );
        }
    }
    Ok(exit_codes::ESCALATED)
}

fn cmd_resolve(
    root: &Path,
    task_id: &str,
    synopsis: &str,
    defect_file: Option<&Path>,
) -> Result<i32> {
    let paths = require_engine_dir(root)?;
    let config = load_config(&paths.config_path)?;
    submit_resolution(root, task_id, &config, synopsis, defect_file)?;
    println!("resolution recorded; `relay run {task_id}` re-enters the loop");
    Ok(exit_codes::OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_start_with_items() {
        let cli = Cli::parse_from([
            "relay", "start", "demo", "--item", "parse", "--item", "render",
        ]);
        match cli.command {
            Command::Start {
                task_id,
                items,
                roadmap,
            } => {
                assert_eq!(task_id, "demo");
                assert_eq!(items, vec!["parse".to_string(), "render".to_string()]);
                assert!(roadmap.is_none());
            }
            _ => panic!("expected start"),
        }
    }

    #[test]
    fn parse_run_with_workdir() {
        let cli = Cli::parse_from(["relay", "run", "demo", "--workdir", "/tmp/repo"]);
        assert_eq!(cli.workdir, PathBuf::from("/tmp/repo"));
        assert!(matches!(cli.command, Command::Run { task_id } if task_id == "demo"));
    }

    #[test]
    fn parse_resolve_with_defect_file() {
        let cli = Cli::parse_from([
            "relay",
            "resolve",
            "demo",
            "--synopsis",
            "redo with the inverted guard",
            "--defect-file",
            "capsule.json",
        ]);
        match cli.command {
            Command::Resolve {
                task_id,
                synopsis,
                defect_file,
            } => {
                assert_eq!(task_id, "demo");
                assert_eq!(synopsis, "redo with the inverted guard");
                assert_eq!(defect_file, Some(PathBuf::from("capsule.json")));
            }
            _ => panic!("expected resolve"),
        }
    }

    #[test]
    fn roadmap_file_conflicts_with_items() {
        let result = Cli::try_parse_from([
            "relay", "start", "demo", "--item", "parse", "--roadmap", "plan.json",
        ]);
        assert!(result.is_err());
    }
}
