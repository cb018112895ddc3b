//! Guardrail harness CLI.
//!
//! Evaluates agent operations against the project policy, inspects and
//! updates the task ledger (`Plans.md`), and gates git deliveries. Output is
//! JSON on stdout; verdicts are also reflected in the exit code.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::{Map, Value, json};

use harness::coordinator::{delivery_request, evaluate_tool};
use harness::core::classifier::{classify_operation, classify_path, is_known_tool};
use harness::core::policy::PolicyEngine;
use harness::core::types::{ActorRole, OperationKind, PolicyBehavior, WorkflowMode};
use harness::exit_codes;
use harness::io::config::{HarnessConfig, load_config};
use harness::io::git::Git;
use harness::io::init::{HarnessPaths, InitOptions, init_harness};
use harness::logging;
use harness::tasks::{TaskUpdateError, TaskUpdateRequest, load_board, update_task};

#[derive(Parser)]
#[command(
    name = "harness",
    version,
    about = "Policy guardrails and task ledger for coding agents"
)]
struct Cli {
    /// Project root (defaults to the current directory).
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.harness/config.toml` and a starter `Plans.md` if none exists.
    Init {
        /// Overwrite an existing config with defaults.
        #[arg(short, long)]
        force: bool,
    },
    /// Print the path category and operation kind for a tool call.
    Classify {
        /// Tool name as the agent reports it.
        tool: String,
        /// Target path of the tool call.
        path: Option<String>,
    },
    /// Evaluate one tool call against the policy without running it.
    Evaluate {
        /// Tool name as the agent reports it (e.g. `Write`, `git_push`).
        tool: String,
        /// Target path of the tool call.
        #[arg(long)]
        path: Option<String>,
        /// Branch for git operations.
        #[arg(long)]
        branch: Option<String>,
        /// Treat the target branch as a primary branch.
        #[arg(long)]
        main: bool,
        /// Force push.
        #[arg(long)]
        force: bool,
    },
    /// Print the locked, preset and custom rules in effect.
    Rules,
    /// Print the ledger grouped into columns.
    Plans {
        /// Workflow mode (`solo` or `2agent`); defaults to the config.
        #[arg(long)]
        mode: Option<String>,
    },
    /// Change the marker on one ledger line.
    Mark {
        /// 1-based line number.
        #[arg(long)]
        line: usize,
        /// The line exactly as last read.
        #[arg(long)]
        expected: String,
        /// Current marker, e.g. `cc:WIP`.
        #[arg(long)]
        from: String,
        /// New marker, e.g. `cc:完了`.
        #[arg(long)]
        to: String,
        /// Workflow mode (`solo` or `2agent`); defaults to the config.
        #[arg(long)]
        mode: Option<String>,
        /// Acting role in two-agent mode.
        #[arg(long, value_enum)]
        actor: Option<Actor>,
    },
    /// Check a git delivery against the policy using the live worktree.
    Deliver {
        #[arg(value_enum)]
        operation: Delivery,
        /// Force push.
        #[arg(long)]
        force: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Actor {
    Pm,
    Impl,
}

impl From<Actor> for ActorRole {
    fn from(actor: Actor) -> Self {
        match actor {
            Actor::Pm => ActorRole::Pm,
            Actor::Impl => ActorRole::Impl,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Delivery {
    Commit,
    Push,
    Pr,
    Release,
}

impl From<Delivery> for OperationKind {
    fn from(delivery: Delivery) -> Self {
        match delivery {
            Delivery::Commit => OperationKind::GitCommit,
            Delivery::Push => OperationKind::GitPush,
            Delivery::Pr => OperationKind::GitPr,
            Delivery::Release => OperationKind::GitRelease,
        }
    }
}

fn main() {
    logging::init("warn");
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = cli.root.as_path();
    match cli.command {
        Command::Init { force } => cmd_init(root, force),
        Command::Classify { tool, path } => cmd_classify(&tool, path.as_deref()),
        Command::Evaluate {
            tool,
            path,
            branch,
            main,
            force,
        } => cmd_evaluate(root, &tool, path, branch, main, force),
        Command::Rules => cmd_rules(root),
        Command::Plans { mode } => cmd_plans(root, mode.as_deref()),
        Command::Mark {
            line,
            expected,
            from,
            to,
            mode,
            actor,
        } => {
            let request = TaskUpdateRequest {
                line_number: Some(line),
                expected_line: Some(expected),
                old_marker: Some(from),
                new_marker: Some(to),
                workflow_mode: mode.as_deref().map(|m| WorkflowMode::from_param(Some(m))),
                actor_role: actor.map(ActorRole::from),
            };
            cmd_mark(root, &request)
        }
        Command::Deliver { operation, force } => cmd_deliver(root, operation.into(), force),
    }
}

fn load(root: &Path) -> Result<HarnessConfig> {
    load_config(&HarnessPaths::new(root).config_path)
}

fn engine(config: &HarnessConfig) -> Result<PolicyEngine> {
    PolicyEngine::new(config.policy.clone()).context("build policy engine")
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let report = init_harness(root, &InitOptions { force })?;
    print_json(&json!({
        "config_path": report.paths.config_path,
        "ledger_created": report.ledger_created,
    }))?;
    Ok(exit_codes::OK)
}

fn cmd_classify(tool: &str, path: Option<&str>) -> Result<i32> {
    print_json(&json!({
        "tool": tool,
        "path": path,
        "category": classify_path(path),
        "operation": classify_operation(tool),
        "known_tool": is_known_tool(tool),
    }))?;
    Ok(exit_codes::OK)
}

fn cmd_evaluate(
    root: &Path,
    tool: &str,
    path: Option<String>,
    branch: Option<String>,
    main: bool,
    force: bool,
) -> Result<i32> {
    let engine = engine(&load(root)?)?;
    let mut input = Map::new();
    if let Some(path) = path {
        input.insert("file_path".to_string(), Value::String(path));
    }
    if let Some(branch) = branch {
        input.insert("branch".to_string(), Value::String(branch));
    }
    input.insert("is_main_branch".to_string(), Value::Bool(main));
    input.insert("force".to_string(), Value::Bool(force));

    let evaluation = evaluate_tool(&engine, tool, &Value::Object(input));
    print_json(&evaluation)?;
    Ok(behavior_code(evaluation.decision.behavior))
}

fn cmd_rules(root: &Path) -> Result<i32> {
    let engine = engine(&load(root)?)?;
    print_json(&engine.rules())?;
    Ok(exit_codes::OK)
}

fn cmd_plans(root: &Path, mode: Option<&str>) -> Result<i32> {
    let config = load(root)?;
    let mode = mode.map_or(config.ledger.workflow_mode, |m| WorkflowMode::from_param(Some(m)));
    let board = load_board(root, mode)?;
    print_json(&board)?;
    Ok(exit_codes::OK)
}

fn cmd_mark(root: &Path, request: &TaskUpdateRequest) -> Result<i32> {
    let config = load(root)?;
    match update_task(root, request, config.ledger.workflow_mode) {
        Ok(success) => {
            print_json(&success)?;
            Ok(exit_codes::OK)
        }
        Err(err) => {
            print_json(&err.to_body())?;
            Ok(match err {
                TaskUpdateError::Conflict { .. } => exit_codes::CONFLICT,
                TaskUpdateError::InvalidTransition { .. }
                | TaskUpdateError::ActorNotPermitted { .. } => exit_codes::REJECTED,
                TaskUpdateError::Io(err) => return Err(err),
                _ => exit_codes::INVALID,
            })
        }
    }
}

fn cmd_deliver(root: &Path, operation: OperationKind, force: bool) -> Result<i32> {
    let engine = engine(&load(root)?)?;
    let preflight = Git::new(root)
        .preflight()
        .map_err(|err| anyhow!("delivery preflight failed: {err:#}"))?;
    let decision = engine.evaluate_git(&delivery_request(operation, &preflight, force));
    print_json(&json!({
        "operation": operation,
        "preflight": preflight,
        "decision": decision,
    }))?;
    Ok(behavior_code(decision.behavior))
}

fn behavior_code(behavior: PolicyBehavior) -> i32 {
    match behavior {
        PolicyBehavior::Allow => exit_codes::OK,
        PolicyBehavior::Ask => exit_codes::ASK,
        PolicyBehavior::Deny => exit_codes::DENY,
    }
}

/// Print `value` as pretty JSON with a trailing newline.
fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}
