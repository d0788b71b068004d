use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Deserialize;

use conductor::config::Config;
use conductor::orchestration::{tasks_from_drafts, ExecutionOptions, Orchestrator, StrategyKind};
use conductor::worker::{CommandWorker, SharedWorker};
use conductor::{
    clog, CapabilityRegistry, Error, PlanContext, Result, TaskDraft, TaskStore, Worker, WorkerId,
};

/// Conductor - dependency-aware task orchestration over capability-matched workers
#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    CONDUCTOR_DEBUG=1     Enable debug logging (alternative to --debug)"
)]
pub struct Cli {
    /// Enable debug logging (writes to ~/.conductor/conductor.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Execute a plan file with the configured workers
    Run {
        /// Plan file (TOML)
        plan: PathBuf,

        /// Execution strategy: sequential, parallel or priority_split
        #[arg(long)]
        strategy: Option<StrategyKind>,

        /// Concurrency bound for parallel execution
        #[arg(long)]
        parallel: Option<usize>,

        /// Overall timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Retry passes after failures
        #[arg(long)]
        max_retries: Option<u32>,

        /// Config file (defaults to ~/.conductor/conductor.toml)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Check a plan file for dependency errors without executing it
    Validate {
        /// Plan file (TOML)
        plan: PathBuf,
    },

    /// List configured workers and whether their commands are on PATH
    Workers {
        /// Config file (defaults to ~/.conductor/conductor.toml)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

/// Plan file layout: a goal plus hand-written task drafts.
#[derive(Debug, Deserialize)]
struct PlanFile {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    context: PlanContext,
    #[serde(default)]
    tasks: Vec<TaskDraft>,
}

impl PlanFile {
    fn load(path: &Path) -> Result<Self> {
        let plan: Self = toml::from_str(&std::fs::read_to_string(path)?)?;
        if plan.name.trim().is_empty() {
            return Err(Error::Validation("plan file needs a name".to_string()));
        }
        plan.context.validate()?;
        Ok(plan)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    conductor::log::init_with_debug(cli.debug);

    match cli.command {
        Command::Run {
            plan,
            strategy,
            parallel,
            timeout,
            max_retries,
            config,
        } => {
            let config = load_config(config.as_deref())?;
            let mut options = ExecutionOptions::from_config(&config.execution);
            if let Some(kind) = strategy {
                options = options.with_strategy(kind);
            }
            if let Some(limit) = parallel {
                options = options.with_parallel_limit(limit);
            }
            if let Some(secs) = timeout {
                options = options.with_timeout(Duration::from_secs(secs));
            }
            if let Some(retries) = max_retries {
                options = options.with_max_retries(retries);
            }
            run_plan(&plan, &config, options)
        }
        Command::Validate { plan } => validate_plan(&plan),
        Command::Workers { config } => list_workers(&load_config(config.as_deref())?),
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

fn command_workers(config: &Config) -> Vec<CommandWorker> {
    config
        .workers
        .iter()
        .map(|w| {
            CommandWorker::new(WorkerId::new(w.id.clone()), &w.command, w.capabilities.clone())
                .with_priority(w.priority)
        })
        .collect()
}

/// Execute a plan file and print the summary as JSON.
fn run_plan(path: &Path, config: &Config, options: ExecutionOptions) -> Result<()> {
    let file = PlanFile::load(path)?;
    clog!(
        "Run command: plan={}, tasks={}, workers={}",
        path.display(),
        file.tasks.len(),
        config.workers.len()
    );
    if config.workers.is_empty() {
        eprintln!("warning: no workers configured; every task will stay pending");
    }

    let store = Arc::new(TaskStore::default());
    let orchestrator = Orchestrator::new(Arc::clone(&store), Arc::new(CapabilityRegistry::new()))
        .with_workers(
            command_workers(config)
                .into_iter()
                .map(|w| Arc::new(w) as SharedWorker),
        );
    let plan = store.create_plan(&file.name, &file.description, file.context)?;
    let options = options.with_tasks(file.tasks);

    let rt = tokio::runtime::Runtime::new()?;
    let summary = rt.block_on(async {
        let run = orchestrator.execute_plan(plan.id, options);
        tokio::pin!(run);
        tokio::select! {
            summary = &mut run => summary,
            _ = tokio::signal::ctrl_c() => {
                orchestrator.cancel(&plan.id);
                run.await
            }
        }
    })?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    if summary.is_success() {
        Ok(())
    } else {
        std::process::exit(1);
    }
}

fn collect_names<'a>(drafts: &'a [TaskDraft], names: &mut Vec<&'a str>) {
    for draft in drafts {
        names.push(draft.name.trim());
        collect_names(&draft.subtasks, names);
    }
}

fn check_references(drafts: &[TaskDraft], known: &HashSet<&str>, problems: &mut Vec<String>) {
    for draft in drafts {
        for dep in &draft.dependencies {
            let dep = dep.trim();
            if dep == draft.name.trim() {
                problems.push(format!("{} depends on itself", draft.name));
            } else if !known.contains(dep) {
                problems.push(format!("{} depends on unknown task {:?}", draft.name, dep));
            }
        }
        check_references(&draft.subtasks, known, problems);
    }
}

/// Build the plan in a scratch store and report problems.
fn validate_plan(path: &Path) -> Result<()> {
    let file = PlanFile::load(path)?;

    let mut names = Vec::new();
    collect_names(&file.tasks, &mut names);
    let mut problems = Vec::new();
    let mut seen = HashSet::new();
    for name in &names {
        if name.is_empty() {
            problems.push("a task has no name".to_string());
        } else if !seen.insert(*name) {
            problems.push(format!("duplicate task name {:?}", name));
        }
    }
    check_references(&file.tasks, &seen, &mut problems);

    let store = TaskStore::default();
    let plan = store.create_plan(&file.name, &file.description, file.context)?;
    let tasks = tasks_from_drafts(
        &file.tasks,
        store.root_task(&plan.id)?,
        usize::MAX,
        depth(&file.tasks).max(1),
    );
    let count = tasks.len();
    if let Err(e) = store.add_tasks(&plan.id, tasks) {
        problems.push(e.to_string());
    }

    if problems.is_empty() {
        println!("{}: ok ({} task(s))", path.display(), count);
        Ok(())
    } else {
        for problem in &problems {
            println!("{}: {}", path.display(), problem);
        }
        Err(Error::Validation(format!(
            "{} problem(s) in {}",
            problems.len(),
            path.display()
        )))
    }
}

fn depth(drafts: &[TaskDraft]) -> usize {
    drafts
        .iter()
        .map(|d| 1 + depth(&d.subtasks))
        .max()
        .unwrap_or(0)
}

fn list_workers(config: &Config) -> Result<()> {
    let workers = command_workers(config);
    if workers.is_empty() {
        println!("No workers configured.");
        return Ok(());
    }
    for worker in &workers {
        println!(
            "{:<16} priority={:<3} {:<12} [{}] {}",
            worker.id(),
            worker.priority(),
            if worker.is_available() { "available" } else { "missing" },
            worker.capabilities().join(", "),
            worker.command()
        );
    }
    Ok(())
}
