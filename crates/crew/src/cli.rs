//! The `crew` command line.
//!
//! # Usage
//!
//! ```bash
//! # Start an agent in the current directory and stream its output
//! crew run "add a --verbose flag"
//!
//! # Start in another project and return immediately
//! crew run -C ~/src/api -d "fix the flaky test"
//!
//! # Follow-up prompts
//! crew continue <session-id> "now update the docs"
//! crew queue <session-id> "then run the linter"
//!
//! # Look around
//! crew ls --all
//! crew logs <session-id>
//! crew attach <session-id>
//!
//! # Stored conversations
//! crew projects
//! crew sessions <project-id>
//! crew resume <session-id> -C ~/src/api "pick up where we left off"
//! ```
//!
//! Ctrl-C while streaming detaches; the session keeps running in `crewd`.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crew_core::{
    EventKind, LaunchOptions, LaunchToken, Outcome, SessionId, SessionKey, StreamEvent,
};

use crate::client::{ClientConfig, DaemonClient};
use crate::follow::{follow, Target};
use crate::render;

/// crew - run coding agents through the crew daemon
#[derive(Parser, Debug)]
#[command(name = "crew", version, about)]
struct Args {
    /// Daemon socket (defaults to $CREW_SOCKET or /tmp/crew.sock)
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    /// Print events and listings as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start an agent in a project and stream its output
    Run {
        /// Project directory (defaults to the current directory)
        #[arg(short = 'C', long)]
        project: Option<PathBuf>,

        #[arg(short, long)]
        model: Option<String>,

        /// Keep the session idle after the turn instead of completing it
        #[arg(long)]
        keep_open: bool,

        /// Print the launch token and return
        #[arg(short, long)]
        detach: bool,

        #[arg(required = true, num_args = 1..)]
        prompt: Vec<String>,
    },
    /// Send a follow-up prompt to a finished turn
    Continue {
        session_id: String,

        #[arg(short, long)]
        detach: bool,

        #[arg(required = true, num_args = 1..)]
        prompt: Vec<String>,
    },
    /// Resume a stored conversation
    Resume {
        session_id: String,

        /// Project directory, required when the daemon does not track the session
        #[arg(short = 'C', long)]
        project: Option<PathBuf>,

        #[arg(short, long)]
        model: Option<String>,

        #[arg(short, long)]
        detach: bool,

        #[arg(required = true, num_args = 1..)]
        prompt: Vec<String>,
    },
    /// Cancel the running turn and drop queued prompts
    Cancel { session_id: String },
    /// List sessions
    Ls {
        /// Include completed and failed sessions
        #[arg(short, long)]
        all: bool,
    },
    /// Print cached output of a session
    Logs {
        /// Session id or launch token
        session: String,

        /// Only events after this sequence number
        #[arg(long)]
        after: Option<u64>,
    },
    /// Replay a session and follow it live
    Attach { session_id: String },
    /// Queue a prompt behind the running turn
    Queue {
        session_id: String,

        #[arg(required = true, num_args = 1..)]
        prompt: Vec<String>,
    },
    /// List projects in the agent's conversation store
    Projects,
    /// List stored conversations of a project
    Sessions {
        project_id: String,

        /// Print the raw records of one conversation instead
        #[arg(long, value_name = "SESSION_ID")]
        transcript: Option<String>,
    },
}

/// Entry point of the `crew` binary.
pub fn run() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let code = execute(args)?;
    if code != 0 {
        process::exit(code);
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn execute(args: Args) -> Result<i32> {
    let mut config = ClientConfig::from_env();
    if let Some(socket) = args.socket {
        config = config.with_socket_path(socket);
    }
    let out = Printer { json: args.json };
    let mut client = DaemonClient::connect(&config).await?;

    let code = match args.command {
        Command::Run {
            project,
            model,
            keep_open,
            detach,
            prompt,
        } => {
            let project = project_path(project)?;
            let mut options = LaunchOptions::default().keep_open(keep_open);
            options.model = model;
            let token = client
                .start_session(&project, &prompt.join(" "), options)
                .await?;
            launched(&mut client, &out, token, detach).await?
        }
        Command::Continue {
            session_id,
            detach,
            prompt,
        } => {
            let session_id = parse_session_id(&session_id)?;
            let token = client
                .continue_session(&session_id, &prompt.join(" "))
                .await?;
            launched(&mut client, &out, token, detach).await?
        }
        Command::Resume {
            session_id,
            project,
            model,
            detach,
            prompt,
        } => {
            let session_id = parse_session_id(&session_id)?;
            let project = project.map(|p| project_path(Some(p))).transpose()?;
            let options = model.map(|m| LaunchOptions::default().with_model(m));
            let token = client
                .resume_session(&session_id, &prompt.join(" "), project, options)
                .await?;
            launched(&mut client, &out, token, detach).await?
        }
        Command::Cancel { session_id } => {
            let session_id = parse_session_id(&session_id)?;
            client.cancel_session(&session_id).await?;
            println!("Cancellation requested for {session_id}");
            0
        }
        Command::Ls { all } => {
            let sessions = client.list_sessions(all).await?;
            if out.json {
                for session in &sessions {
                    out.json_line(session)?;
                }
            } else if sessions.is_empty() {
                println!("No sessions.");
            } else {
                let now = Utc::now();
                println!("{}", render::sessions_header());
                for session in &sessions {
                    println!("{}", render::session_row(session, now));
                }
            }
            0
        }
        Command::Logs { session, after } => {
            let session_id = resolve_session_id(&mut client, &session).await?;
            for event in client.get_output(&session_id, after).await? {
                out.event(&event)?;
            }
            0
        }
        Command::Attach { session_id } => {
            let session_id = parse_session_id(&session_id)?;
            stream(&mut client, &out, Target::Session(session_id)).await?
        }
        Command::Queue { session_id, prompt } => {
            let session_id = parse_session_id(&session_id)?;
            let outcome = client
                .enqueue_prompt(&session_id, &prompt.join(" "))
                .await?;
            if out.json {
                out.json_line(&outcome)?;
            } else {
                println!("{}", render::render_enqueue(&outcome));
            }
            0
        }
        Command::Projects => {
            let projects = client.list_projects().await?;
            let now = Utc::now();
            for project in &projects {
                if out.json {
                    out.json_line(project)?;
                } else {
                    println!("{}", render::project_row(project, now));
                }
            }
            0
        }
        Command::Sessions {
            project_id,
            transcript: Some(session_id),
        } => {
            for record in client.read_transcript(&project_id, &session_id).await? {
                out.json_line(&record)?;
            }
            0
        }
        Command::Sessions {
            project_id,
            transcript: None,
        } => {
            let sessions = client.list_project_sessions(&project_id).await?;
            let now = Utc::now();
            for session in &sessions {
                if out.json {
                    out.json_line(session)?;
                } else {
                    println!("{}", render::stored_session_row(session, now));
                }
            }
            0
        }
    };

    let _ = client.disconnect().await;
    Ok(code)
}

/// Prints the token, or streams the launch until it completes.
async fn launched(
    client: &mut DaemonClient,
    out: &Printer,
    token: LaunchToken,
    detach: bool,
) -> Result<i32> {
    if detach {
        println!("{token}");
        return Ok(0);
    }
    stream(client, out, Target::Launch(token)).await
}

/// Follows `target` until it finishes or Ctrl-C detaches.
async fn stream(client: &mut DaemonClient, out: &Printer, target: Target) -> Result<i32> {
    let mut session_id = match &target {
        Target::Session(id) => Some(id.clone()),
        Target::Launch(_) => None,
    };
    let mut write_error = None;

    let finished = tokio::select! {
        result = follow(client, target.clone(), |event| {
            if let EventKind::Announced { session_id: id, .. } = &event.kind {
                session_id = Some(id.clone());
            }
            if let Err(e) = out.event(event) {
                write_error.get_or_insert(e);
            }
        }) => Some(result?),
        _ = tokio::signal::ctrl_c() => None,
    };
    if let Some(e) = write_error {
        return Err(e);
    }

    let Some(last) = finished else {
        match session_id {
            Some(id) => eprintln!("Detached; reattach with 'crew attach {id}'"),
            None => eprintln!("Detached before the session announced itself; see 'crew ls'"),
        }
        return Ok(0);
    };

    Ok(match last.map(|e| e.kind) {
        Some(EventKind::Completed {
            outcome: Outcome::Success,
            ..
        })
        | None => 0,
        Some(EventKind::Completed {
            outcome: Outcome::Cancelled,
            ..
        }) => 130,
        Some(_) => 1,
    })
}

/// Accepts a session id or a launch token.
async fn resolve_session_id(client: &mut DaemonClient, value: &str) -> Result<SessionId> {
    if !value.starts_with(crew_core::session::LAUNCH_TOKEN_PREFIX) {
        return parse_session_id(value);
    }
    let summary = client
        .get_session(SessionKey::Token(LaunchToken::new(value)))
        .await?;
    match summary.session_id {
        Some(id) => Ok(id),
        None => bail!("{value} has not announced a session id yet; try 'crew attach' later"),
    }
}

fn parse_session_id(value: &str) -> Result<SessionId> {
    SessionId::parse(value).with_context(|| format!("invalid session id {value:?}"))
}

/// Absolute project directory, defaulting to the current one.
fn project_path(project: Option<PathBuf>) -> Result<String> {
    let cwd = std::env::current_dir().context("Failed to read the current directory")?;
    let path = match project {
        Some(path) => absolute(&cwd, &path),
        None => cwd,
    };
    path.to_str()
        .map(str::to_string)
        .with_context(|| format!("project path is not valid UTF-8: {}", path.display()))
}

fn absolute(cwd: &Path, path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    };
    std::fs::canonicalize(&joined).unwrap_or(joined)
}

struct Printer {
    json: bool,
}

impl Printer {
    fn event(&self, event: &StreamEvent) -> Result<()> {
        if self.json {
            return self.json_line(event);
        }
        if let Some(text) = render::render_event(event) {
            let mut stdout = std::io::stdout().lock();
            writeln!(stdout, "{text}")?;
            stdout.flush()?;
        }
        Ok(())
    }

    fn json_line<T: serde::Serialize>(&self, value: &T) -> Result<()> {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{}", serde_json::to_string(value)?)?;
        Ok(())
    }
}
