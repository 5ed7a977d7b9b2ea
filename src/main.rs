//! Stack Runner CLI
//!
//! Entry points for the processor daemon, the submission surface, stack
//! inspection, catalog seeding, cascade rule management, and the
//! single-task queue worker.

use anyhow::Result;
use clap::{Parser, Subcommand};
use stack_runner::config::Config;
use stack_runner::daemon::{save_stack_output, ProcessorDaemon};
use stack_runner::db::control::{KILL_SWITCH, PAUSE_NEW_TASKS};
use stack_runner::db::Database;
use stack_runner::engine::{StackEngine, StepOutcome};
use stack_runner::error::RunnerError;
use stack_runner::exec::SubprocessRunner;
use stack_runner::graph::GraphStore;
use stack_runner::submit::SubmissionSurface;
use stack_runner::types::{RequestStatus, StackStatus, TaskKind};
use stack_runner::worker;
use std::fs::OpenOptions;
use std::sync::atomic::Ordering;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Stack Runner - LIFO execution with monadic context accumulation
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Path to the task database (overrides config)
    #[arg(short, long)]
    database: Option<String>,

    /// Path to the request graph database (overrides config)
    #[arg(short, long)]
    graph_database: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Logging output: 0/off, 1/stdout, 2/stderr (default), or filename
    #[arg(short, long, default_value = "2")]
    log: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the request processor daemon
    Daemon {
        /// Process one request and exit
        #[arg(long)]
        single: bool,
        /// Show queue statistics and exit
        #[arg(long)]
        stats: bool,
    },
    /// Submit a task request
    Submit {
        task_id: String,
        /// JSON parameters
        #[arg(long, default_value = "{}")]
        params: String,
        /// Priority (1-1000, higher = sooner)
        #[arg(long)]
        priority: Option<i32>,
        /// Idempotency key
        #[arg(long)]
        request_id: Option<String>,
        /// Request ids this request depends on
        #[arg(long, value_delimiter = ',')]
        depends_on: Vec<String>,
    },
    /// Check the status of a request
    Status { request_id: String },
    /// Retrieve the result of a completed request
    Result {
        request_id: String,
        /// Include the full execution trace
        #[arg(long)]
        trace: bool,
    },
    /// List available tasks
    Tasks {
        /// Filter by task id substring
        #[arg(long)]
        filter: Option<String>,
        /// Include disabled tasks
        #[arg(long)]
        all: bool,
    },
    /// Cancel a pending or blocked request
    Cancel { request_id: String },
    /// List requests in the queue
    Pending {
        #[arg(long, default_value_t = 20)]
        limit: i64,
        /// Status filter (default: pending)
        #[arg(long)]
        status: Option<String>,
    },
    /// Operate directly on execution stacks
    Stack {
        #[command(subcommand)]
        command: StackCommand,
    },
    /// Execute one task from the single-task queue
    RunOnce,
    /// Seed and manage the task catalog
    Task {
        #[command(subcommand)]
        command: TaskCommand,
    },
    /// Manage cascade rules
    Rules {
        #[command(subcommand)]
        command: RuleCommand,
    },
    /// Commit a source artifact (fires cascade rules)
    CommitSource {
        source_id: String,
        kind: String,
        /// JSON attribute map
        #[arg(long, default_value = "{}")]
        attrs: String,
    },
    /// Toggle global control flags
    Control {
        #[command(subcommand)]
        command: ControlCommand,
    },
}

#[derive(Subcommand, Debug)]
enum StackCommand {
    /// Start a new execution stack and run it to completion
    Start {
        task_id: String,
        #[arg(long, default_value = "{}")]
        params: String,
        /// Idempotency key
        #[arg(long)]
        request_id: Option<String>,
    },
    /// Resume an existing stack
    Resume { stack_id: String },
    /// Run one step of a stack
    Step { stack_id: String },
    /// Show stack status and trace
    Show { stack_id: String },
}

#[derive(Subcommand, Debug)]
enum TaskCommand {
    /// Insert or update a task definition
    Add {
        task_id: String,
        /// cli, python, python_file, or typescript
        #[arg(long, default_value = "cli")]
        kind: String,
        /// Command template, inline source, or file path
        #[arg(long)]
        code: String,
        /// JSON default parameters
        #[arg(long, default_value = "{}")]
        params: String,
        #[arg(long)]
        working_dir: Option<String>,
        /// Environment entries as KEY=VALUE
        #[arg(long)]
        env: Vec<String>,
        #[arg(long, default_value_t = 300)]
        timeout: i64,
    },
    /// Enable a task
    Enable { task_id: String },
    /// Disable a task (new submissions only; in-flight stacks continue)
    Disable { task_id: String },
}

#[derive(Subcommand, Debug)]
enum RuleCommand {
    /// List cascade rules
    List {
        #[arg(long)]
        enabled_only: bool,
    },
    /// Show one rule
    Get { rule_id: String },
    /// Create or update a rule
    Create {
        #[arg(long)]
        rule_id: String,
        /// Task to create requests for
        #[arg(long)]
        task: String,
        #[arg(long)]
        description: Option<String>,
        /// Match sources with this kind (default: all kinds)
        #[arg(long)]
        source_kind: Option<String>,
        /// JSON parameter template with $source.* placeholders
        #[arg(long)]
        parameters: Option<String>,
        #[arg(long, default_value_t = 50)]
        priority: i32,
        #[arg(long)]
        disabled: bool,
    },
    /// Enable a rule
    Enable { rule_id: String },
    /// Disable a rule
    Disable { rule_id: String },
    /// Delete a rule
    Delete { rule_id: String },
    /// Show requests triggered by a rule
    Triggered {
        rule_id: String,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[derive(Subcommand, Debug)]
enum ControlCommand {
    /// Set the kill switch (stops claiming and stack creation)
    Kill,
    /// Clear the kill switch
    ClearKill,
    /// Pause single-task processing
    Pause,
    /// Resume single-task processing
    Resume,
}

fn init_logging(args: &Args) -> Result<()> {
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    match args.log.as_str() {
        "0" | "off" => {}
        "1" | "stdout" => {
            let subscriber = FmtSubscriber::builder()
                .with_max_level(level)
                .with_writer(std::io::stdout)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        "2" | "stderr" => {
            let subscriber = FmtSubscriber::builder()
                .with_max_level(level)
                .with_writer(std::io::stderr)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        filename => {
            let file = OpenOptions::new().create(true).append(true).open(filename)?;
            let subscriber = FmtSubscriber::builder()
                .with_max_level(level)
                .with_writer(file)
                .with_ansi(false)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(e) => eprintln!("Failed to serialize output: {}", e),
    }
}

fn parse_json_arg(name: &str, text: &str) -> Result<serde_json::Value, RunnerError> {
    serde_json::from_str(text)
        .map_err(|e| RunnerError::invalid_value(name, &format!("not valid JSON: {}", e)))
}

fn requester() -> String {
    format!(
        "cli:{}",
        std::env::var("USER").unwrap_or_else(|_| "unknown".to_string())
    )
}

fn main() {
    let args = Args::parse();
    if let Err(e) = init_logging(&args) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    let mut config = if let Some(path) = &args.config {
        match Config::load(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("{}", e);
                std::process::exit(2);
            }
        }
    } else {
        Config::load_or_default()
    };
    if let Some(db) = &args.database {
        config.db_path = db.into();
    }
    if let Some(db) = &args.graph_database {
        config.graph_db_path = db.into();
    }

    let code = match run(args.command, config) {
        Ok(code) => code,
        Err(e) => {
            let runner_err = RunnerError::from(e);
            print_json(&runner_err);
            runner_err.exit_code()
        }
    };
    std::process::exit(code);
}

fn run(command: Command, config: Config) -> Result<i32> {
    config.ensure_dirs()?;
    let db = Database::open(&config.db_path)?;
    let graph = GraphStore::open(&config.graph_db_path)?;

    match command {
        Command::Daemon { single, stats } => {
            let mut daemon = ProcessorDaemon::new(db, graph, config);

            if stats {
                print_json(&daemon.stats()?);
                return Ok(0);
            }
            if single {
                let processed = daemon.process_one()?;
                if !processed {
                    println!("No requests to process");
                }
                return Ok(0);
            }

            let shutdown = daemon.shutdown_flag();
            ctrlc::set_handler(move || {
                info!("Shutdown requested");
                shutdown.store(true, Ordering::Relaxed);
            })?;
            daemon.run_loop();
            Ok(0)
        }

        Command::Submit {
            task_id,
            params,
            priority,
            request_id,
            depends_on,
        } => {
            let parameters = parse_json_arg("params", &params)?;
            let surface = SubmissionSurface::new(db, graph);
            let response = surface.submit(
                &task_id,
                Some(parameters),
                priority,
                request_id,
                depends_on,
                &requester(),
            )?;
            print_json(&response);
            Ok(0)
        }

        Command::Status { request_id } => {
            let surface = SubmissionSurface::new(db, graph);
            print_json(&surface.status(&request_id)?);
            Ok(0)
        }

        Command::Result { request_id, trace } => {
            let surface = SubmissionSurface::new(db, graph);
            print_json(&surface.result(&request_id, trace)?);
            Ok(0)
        }

        Command::Tasks { filter, all } => {
            let surface = SubmissionSurface::new(db, graph);
            print_json(&surface.list_tasks(filter.as_deref(), !all)?);
            Ok(0)
        }

        Command::Cancel { request_id } => {
            let surface = SubmissionSurface::new(db, graph);
            print_json(&surface.cancel(&request_id)?);
            Ok(0)
        }

        Command::Pending { limit, status } => {
            let status = match status.as_deref() {
                Some(s) => Some(RequestStatus::from_str(s).ok_or_else(|| {
                    RunnerError::invalid_value("status", &format!("unknown status: {}", s))
                })?),
                None => None,
            };
            let surface = SubmissionSurface::new(db, graph);
            print_json(&surface.list_pending(Some(limit), status)?);
            Ok(0)
        }

        Command::Stack { command } => run_stack_command(command, db, config),

        Command::RunOnce => {
            let outcome = worker::run_once(&db, &config)?;
            Ok(outcome.exit_code())
        }

        Command::Task { command } => run_task_command(command, db),

        Command::Rules { command } => run_rule_command(command, graph),

        Command::CommitSource {
            source_id,
            kind,
            attrs,
        } => {
            let attrs_value = parse_json_arg("attrs", &attrs)?;
            let attrs_map = attrs_value
                .as_object()
                .cloned()
                .ok_or_else(|| RunnerError::invalid_value("attrs", "must be a JSON object"))?;
            let created = graph.commit_source(&source_id, &kind, attrs_map)?;
            print_json(&created);
            Ok(0)
        }

        Command::Control { command } => {
            match command {
                ControlCommand::Kill => db.set_control_flag(KILL_SWITCH, "1")?,
                ControlCommand::ClearKill => db.clear_control_flag(KILL_SWITCH)?,
                ControlCommand::Pause => db.set_control_flag(PAUSE_NEW_TASKS, "1")?,
                ControlCommand::Resume => db.clear_control_flag(PAUSE_NEW_TASKS)?,
            }
            Ok(0)
        }
    }
}

fn run_stack_command(command: StackCommand, db: Database, config: Config) -> Result<i32> {
    let worker_id = Config::worker_id();
    let runner = SubprocessRunner::new(config.db_path.clone());
    let engine = StackEngine::new(db.clone(), runner, worker_id, config.lease_seconds);

    match command {
        StackCommand::Start {
            task_id,
            params,
            request_id,
        } => {
            let parameters = parse_json_arg("params", &params)?;
            let request_id =
                request_id.unwrap_or_else(|| uuid::Uuid::now_v7().to_string());
            let stack_id = engine.create(&request_id, &task_id, &parameters)?;
            let info = engine.run_to_completion(&stack_id)?;
            let output_path = save_stack_output(&config.runs_dir, &info)?;

            println!("Stack {}: {}", info.status.as_str(), stack_id);
            println!("Output saved to: {}", output_path.display());
            Ok(if info.status == StackStatus::Done { 0 } else { 2 })
        }
        StackCommand::Resume { stack_id } => {
            let info = engine.run_to_completion(&stack_id)?;
            let output_path = save_stack_output(&config.runs_dir, &info)?;
            println!("Stack {}: {}", info.status.as_str(), stack_id);
            println!("Output saved to: {}", output_path.display());
            Ok(if info.status == StackStatus::Done { 0 } else { 2 })
        }
        StackCommand::Step { stack_id } => match engine.run_one_step(&stack_id)? {
            StepOutcome::More => {
                println!("Step complete; stack has more work");
                Ok(0)
            }
            StepOutcome::Terminal(status) => {
                println!("Stack {}", status.as_str());
                Ok(1)
            }
        },
        StackCommand::Show { stack_id } => {
            let info = db
                .stack_info(&stack_id)?
                .ok_or_else(|| RunnerError::stack_not_found(&stack_id))?;
            print_json(&info);
            Ok(0)
        }
    }
}

fn run_task_command(command: TaskCommand, db: Database) -> Result<i32> {
    match command {
        TaskCommand::Add {
            task_id,
            kind,
            code,
            params,
            working_dir,
            env,
            timeout,
        } => {
            let kind = TaskKind::from_str(&kind).ok_or_else(|| {
                RunnerError::invalid_value("kind", &format!("unknown task kind: {}", kind))
            })?;
            let params_value = parse_json_arg("params", &params)?;
            let default_params = params_value
                .as_object()
                .cloned()
                .ok_or_else(|| RunnerError::invalid_value("params", "must be a JSON object"))?;

            let mut env_map = std::collections::HashMap::new();
            for entry in env {
                let (key, value) = entry.split_once('=').ok_or_else(|| {
                    RunnerError::invalid_value("env", "entries must be KEY=VALUE")
                })?;
                env_map.insert(key.to_string(), value.to_string());
            }

            let def = db.upsert_task(
                &task_id,
                kind,
                &code,
                default_params,
                working_dir,
                env_map,
                timeout,
            )?;
            print_json(&def);
            Ok(0)
        }
        TaskCommand::Enable { task_id } => {
            if db.set_task_enabled(&task_id, true)? {
                println!("Task '{}' enabled", task_id);
                Ok(0)
            } else {
                Err(RunnerError::task_not_found(&task_id).into())
            }
        }
        TaskCommand::Disable { task_id } => {
            if db.set_task_enabled(&task_id, false)? {
                println!("Task '{}' disabled", task_id);
                Ok(0)
            } else {
                Err(RunnerError::task_not_found(&task_id).into())
            }
        }
    }
}

fn run_rule_command(command: RuleCommand, graph: GraphStore) -> Result<i32> {
    match command {
        RuleCommand::List { enabled_only } => {
            print_json(&graph.list_rules(enabled_only)?);
            Ok(0)
        }
        RuleCommand::Get { rule_id } => {
            let rule = graph
                .rule(&rule_id)?
                .ok_or_else(|| RunnerError::rule_not_found(&rule_id))?;
            print_json(&rule);
            Ok(0)
        }
        RuleCommand::Create {
            rule_id,
            task,
            description,
            source_kind,
            parameters,
            priority,
            disabled,
        } => {
            let rule = graph.upsert_rule(
                &rule_id,
                &task,
                description.as_deref(),
                source_kind.as_deref(),
                parameters.as_deref(),
                priority,
                !disabled,
            )?;
            print_json(&rule);
            Ok(0)
        }
        RuleCommand::Enable { rule_id } => {
            if graph.set_rule_enabled(&rule_id, true)? {
                println!("Rule '{}' enabled", rule_id);
                Ok(0)
            } else {
                Err(RunnerError::rule_not_found(&rule_id).into())
            }
        }
        RuleCommand::Disable { rule_id } => {
            if graph.set_rule_enabled(&rule_id, false)? {
                println!("Rule '{}' disabled", rule_id);
                Ok(0)
            } else {
                Err(RunnerError::rule_not_found(&rule_id).into())
            }
        }
        RuleCommand::Delete { rule_id } => {
            if graph.delete_rule(&rule_id)? {
                println!("Rule '{}' deleted", rule_id);
                Ok(0)
            } else {
                Err(RunnerError::rule_not_found(&rule_id).into())
            }
        }
        RuleCommand::Triggered { rule_id, limit } => {
            print_json(&graph.triggered_requests(&rule_id, limit)?);
            Ok(0)
        }
    }
}
