//! `patchloop`: queue natural-language change requests against local
//! repositories and run them to a pull request.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};

use patchloop::core::types::{Event, Project, Task, TaskState};
use patchloop::exit_codes;
use patchloop::io::init::{DEFAULT_DATA_DIR, DataPaths, init_data_dir};
use patchloop::logging;
use patchloop::service::{CreateProject, Service, SubmitTask};
use patchloop::worker::WorkerPool;

#[derive(Parser)]
#[command(
    name = "patchloop",
    version,
    about = "Autonomous code-modification executor"
)]
struct Cli {
    /// Data directory holding config, database, artifacts and workspaces.
    #[arg(long, global = true, env = "PATCHLOOP_DATA_DIR", default_value = DEFAULT_DATA_DIR)]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the data directory with a default `config.toml`.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Register and inspect projects.
    #[command(subcommand)]
    Project(ProjectCommand),
    /// Submit, inspect and cancel tasks.
    #[command(subcommand)]
    Task(TaskCommand),
    /// Resume interrupted tasks and drain the queue.
    Work {
        /// Worker threads (defaults to `workers` from config).
        #[arg(long)]
        workers: Option<usize>,
        /// Keep polling for new tasks instead of exiting when idle.
        #[arg(long)]
        watch: bool,
    },
}

#[derive(Subcommand)]
enum ProjectCommand {
    /// Register a project: an existing checkout, a clone, or a fresh repository.
    Add {
        name: String,
        /// Remote to clone from (or to publish to, with --path).
        #[arg(long)]
        remote: Option<String>,
        /// Existing working copy to register instead of allocating one.
        #[arg(long)]
        path: Option<PathBuf>,
    },
    List,
    Show {
        /// Project id or name.
        project: String,
    },
}

#[derive(Subcommand)]
enum TaskCommand {
    Submit(SubmitArgs),
    Show {
        id: String,
    },
    List {
        #[arg(long, value_parser = parse_state)]
        state: Option<TaskState>,
        /// Project id or name.
        #[arg(long)]
        project: Option<String>,
    },
    Events {
        id: String,
        /// Only events with a sequence number above this.
        #[arg(long, default_value_t = 0)]
        after: i64,
        /// Keep streaming until the task reaches a terminal state.
        #[arg(short, long)]
        follow: bool,
    },
    Cancel {
        id: String,
    },
    /// Run one task in the foreground (resumes it if it was interrupted).
    Run {
        id: String,
    },
}

#[derive(Args)]
struct SubmitArgs {
    /// Project id or name.
    #[arg(long, short)]
    project: String,
    #[arg(long)]
    source: Option<String>,
    #[arg(long)]
    target: Option<String>,
    /// Read the prompt from a file instead of the arguments.
    #[arg(long, conflicts_with = "prompt")]
    prompt_file: Option<PathBuf>,
    /// Change request, in natural language.
    #[arg(required_unless_present = "prompt_file")]
    prompt: Vec<String>,
}

fn parse_state(raw: &str) -> Result<TaskState, String> {
    TaskState::parse(raw)
        .ok_or_else(|| format!("unknown state `{raw}` (queued, running, completed, failed)"))
}

fn main() {
    logging::init("warn");
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let paths = DataPaths::new(&cli.data_dir);
    match cli.command {
        Command::Init { force } => {
            let paths = init_data_dir(&cli.data_dir, force)?;
            println!("init: data_dir={}", paths.root.display());
            println!("init: config={}", paths.config_path.display());
            Ok(exit_codes::OK)
        }
        Command::Project(command) => cmd_project(&Service::open(&paths)?, command),
        Command::Task(command) => cmd_task(&Service::open(&paths)?, &paths, command),
        Command::Work { workers, watch } => cmd_work(&Service::open(&paths)?, &paths, workers, watch),
    }
}

fn cmd_project(service: &Service, command: ProjectCommand) -> Result<i32> {
    match command {
        ProjectCommand::Add { name, remote, path } => {
            let project = service.create_project(CreateProject {
                name,
                remote_url: remote,
                path,
            })?;
            print_project(&project);
        }
        ProjectCommand::List => {
            for project in service.list_projects()? {
                println!(
                    "{}  {}  {}",
                    project.id,
                    project.name,
                    project.path.display()
                );
            }
        }
        ProjectCommand::Show { project } => print_project(&service.get_project(&project)?),
    }
    Ok(exit_codes::OK)
}

fn cmd_task(service: &Service, paths: &DataPaths, command: TaskCommand) -> Result<i32> {
    match command {
        TaskCommand::Submit(args) => {
            let prompt = match args.prompt_file {
                Some(path) => fs::read_to_string(&path)
                    .with_context(|| format!("read prompt {}", path.display()))?,
                None => args.prompt.join(" "),
            };
            let task = service.submit_task(SubmitTask {
                project: args.project,
                prompt,
                source_branch: args.source,
                target_branch: args.target,
            })?;
            println!("{}", task.id);
        }
        TaskCommand::Show { id } => {
            let task = service.get_task(&id)?;
            print_task(&task);
            return Ok(task_exit_code(&task));
        }
        TaskCommand::List { state, project } => {
            for task in service.list_tasks(state, project.as_deref())? {
                println!(
                    "{}  {:<9}  {}  {}",
                    task.id,
                    task.state,
                    task.target_branch,
                    first_line(&task.prompt)
                );
            }
        }
        TaskCommand::Events { id, after, follow } => {
            if follow {
                for event in service.subscribe(&id, after)? {
                    print_event(&event?);
                }
                return Ok(task_exit_code(&service.get_task(&id)?));
            }
            for event in service.events(&id, after)? {
                print_event(&event);
            }
        }
        TaskCommand::Cancel { id } => {
            let task = service.cancel_task(&id)?;
            if task.state.is_terminal() {
                println!("cancel: task={} state={}", task.id, task.state);
            } else {
                println!("cancel: task={} requested", task.id);
            }
        }
        TaskCommand::Run { id } => {
            let orchestrator = service.orchestrator(paths.artifacts_dir.clone())?;
            let task = service.get_task(&id)?;
            let task = match task.state {
                TaskState::Queued => match orchestrator.run_queued(&id)? {
                    Some(task) => task,
                    None => bail!("task {id} was claimed or cancelled before it could start"),
                },
                TaskState::Running => orchestrator.resume(&id)?,
                TaskState::Completed | TaskState::Failed => task,
            };
            print_task(&task);
            return Ok(task_exit_code(&task));
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_work(
    service: &Service,
    paths: &DataPaths,
    workers: Option<usize>,
    watch: bool,
) -> Result<i32> {
    let orchestrator = service.orchestrator(paths.artifacts_dir.clone())?;
    let mut pool = WorkerPool::new(&orchestrator);
    if let Some(workers) = workers {
        pool = pool.with_workers(workers);
    }
    let summary = if watch {
        // Runs until the process is terminated.
        pool.run_forever(&AtomicBool::new(false))?
    } else {
        pool.run_until_idle()?
    };
    println!(
        "work: resumed={} completed={} failed={} errors={}",
        summary.resumed.len(),
        summary.completed.len(),
        summary.failed.len(),
        summary.errors.len()
    );
    for error in &summary.errors {
        eprintln!("warning: {error}");
    }
    Ok(exit_codes::OK)
}

fn task_exit_code(task: &Task) -> i32 {
    if task.state == TaskState::Failed {
        exit_codes::TASK_FAILED
    } else {
        exit_codes::OK
    }
}

fn print_project(project: &Project) {
    println!("project: id={} name={}", project.id, project.name);
    println!("project: path={}", project.path.display());
    println!(
        "project: remote={}",
        project.remote_url.as_deref().unwrap_or("-")
    );
}

fn print_task(task: &Task) {
    println!(
        "task: id={} state={} iteration={}",
        task.id, task.state, task.iteration
    );
    println!(
        "task: source={} target={}",
        task.source_branch, task.target_branch
    );
    if let Some(reason) = &task.reason {
        println!("task: reason={reason}");
    }
    if let Some(url) = &task.pr_url {
        println!("task: pull_request={url}");
    }
    if task.cancel_requested && !task.state.is_terminal() {
        println!("task: cancel_requested=true");
    }
}

fn print_event(event: &Event) {
    println!(
        "{:>6} {} {:<7} [{}] {}",
        event.seq, event.timestamp, event.severity, event.phase, event.message
    );
}

fn first_line(text: &str) -> &str {
    text.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("")
}
