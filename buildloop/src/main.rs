//! `buildloop`: drive a coding agent through a plan, one verified task at a time.
//!
//! State lives in `<project>/.buildloop/`; see `buildloop init`.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use buildloop::build_loop::{LoopDeps, LoopRequest, run_session};
use buildloop::core::types::Mode;
use buildloop::exit_codes;
use buildloop::inspect::{deliver_request, find_session, format_list, format_status, write_logs};
use buildloop::io::config::load_config;
use buildloop::io::control::{ControlRequest, LoopControl, install_signal_handler, pid_alive};
use buildloop::io::init::{InitOptions, ProjectPaths, init_project};
use buildloop::io::process::ProcessRunner;
use buildloop::io::session_store::{FileBackend, SessionStore};
use buildloop::logging;
use buildloop::start::{prepare_session, project_id};

#[derive(Parser)]
#[command(
    name = "buildloop",
    version,
    about = "Supervised build loop for coding agents"
)]
struct Cli {
    /// Project root (defaults to the current directory).
    #[arg(long, global = true, value_name = "DIR")]
    project: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.buildloop/` with a default config and plan.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Run a session in the foreground until it completes or stops.
    Start {
        #[arg(long, value_enum, default_value_t = Mode::Build)]
        mode: Mode,
    },
    /// Show the latest (or given) session.
    Status {
        #[arg(long)]
        session: Option<String>,
    },
    /// List the project's sessions, newest first.
    List,
    /// Print a session log.
    Logs {
        #[arg(long)]
        session: Option<String>,
        /// Keep printing until the session stops.
        #[arg(short, long)]
        follow: bool,
    },
    /// Pause the active session after its current iteration.
    Pause,
    /// Resume a paused session.
    Resume,
    /// Stop the active session, interrupting any running agent or gate.
    Stop,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::ERROR);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = match cli.project {
        Some(root) => root,
        None => std::env::current_dir().context("resolve current directory")?,
    };
    let paths = ProjectPaths::new(root);

    match cli.command {
        Command::Init { force } => cmd_init(&paths, force),
        Command::Start { mode } => cmd_start(&paths, mode),
        Command::Status { session } => cmd_status(&paths, session.as_deref()),
        Command::List => cmd_list(&paths),
        Command::Logs { session, follow } => cmd_logs(&paths, session.as_deref(), follow),
        Command::Pause => cmd_control(&paths, ControlRequest::Pause),
        Command::Resume => cmd_control(&paths, ControlRequest::Resume),
        Command::Stop => cmd_control(&paths, ControlRequest::Stop),
    }
}

fn cmd_init(paths: &ProjectPaths, force: bool) -> Result<i32> {
    let paths = init_project(&paths.root, &InitOptions { force })?;
    println!("initialised {}", paths.state_dir.display());
    Ok(exit_codes::OK)
}

fn cmd_start(paths: &ProjectPaths, mode: Mode) -> Result<i32> {
    let store = SessionStore::new(FileBackend::new(&paths.sessions_dir));
    let prepared = prepare_session(paths, &store, mode, std::process::id(), pid_alive)?;
    let session = prepared.session;

    let inbox = paths.control_path(&session.id);
    match fs::remove_file(&inbox) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err).with_context(|| format!("clear control inbox {}", inbox.display()));
        }
    }
    let control = LoopControl::with_inbox(inbox);
    install_signal_handler(&control)?;

    if prepared.adopted {
        eprintln!(
            "resuming session {} after iteration {}",
            session.id, session.iteration
        );
    } else {
        eprintln!("started session {} ({} mode)", session.id, mode.as_str());
    }
    eprintln!("log: {}", session.log_path.display());

    let outcome = run_session(
        &LoopRequest {
            paths,
            config: &prepared.config,
            agent: &prepared.agent,
        },
        &LoopDeps {
            runner: &ProcessRunner,
            store: &store,
            control: &control,
        },
        session,
        |report| {
            eprintln!(
                "iteration {} [{}]: {} -> {}",
                report.iteration,
                report.task_id.as_deref().unwrap_or("-"),
                report.result,
                report.status
            );
        },
    )?;

    println!("session {} {}", outcome.session.id, outcome.stop);
    Ok(outcome.stop.exit_code())
}

fn open_store(paths: &ProjectPaths) -> Result<(String, SessionStore<FileBackend>)> {
    let config = load_config(&paths.config_path)?;
    Ok((
        project_id(paths, &config),
        SessionStore::new(FileBackend::new(&paths.sessions_dir)),
    ))
}

fn cmd_status(paths: &ProjectPaths, id: Option<&str>) -> Result<i32> {
    let (project, store) = open_store(paths)?;
    let session = find_session(&store, &project, id)?;
    print!("{}", format_status(&session));
    Ok(exit_codes::OK)
}

fn cmd_list(paths: &ProjectPaths) -> Result<i32> {
    let (project, store) = open_store(paths)?;
    let sessions = store.list(&project)?;
    if sessions.is_empty() {
        println!("no sessions");
    } else {
        print!("{}", format_list(&sessions));
    }
    Ok(exit_codes::OK)
}

fn cmd_logs(paths: &ProjectPaths, id: Option<&str>, follow: bool) -> Result<i32> {
    let (project, store) = open_store(paths)?;
    let session = find_session(&store, &project, id)?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    write_logs(&store, &session, follow, &mut out)?;
    out.flush().context("flush stdout")?;
    Ok(exit_codes::OK)
}

fn cmd_control(paths: &ProjectPaths, request: ControlRequest) -> Result<i32> {
    let (project, store) = open_store(paths)?;
    let session = deliver_request(paths, &store, &project, request)?;
    println!("{} requested for session {}", request.as_str(), session.id);
    Ok(exit_codes::OK)
}
