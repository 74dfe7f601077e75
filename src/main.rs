use ccweb::cli::{CliEnv, CliInvocation, CliRunError};
use ccweb::infra::{
    LoadSettingsError, ResolveProjectsDirError, ResolveStateDirError, init_logging,
    load_settings, resolve_claude_projects_dir, resolve_state_dir,
};
use std::io::{self, Write};
use thiserror::Error;

#[derive(Debug, Error)]
enum MainError {
    #[error(transparent)]
    ProjectsDir(#[from] ResolveProjectsDirError),

    #[error(transparent)]
    StateDir(#[from] ResolveStateDirError),

    #[error(transparent)]
    Settings(#[from] LoadSettingsError),

    #[error(transparent)]
    Cli(#[from] CliRunError),
}

fn main() {
    if let Err(error) = run_main() {
        let mut err = io::stderr().lock();
        let _ = writeln!(err, "{error}");
        std::process::exit(1);
    }
}

fn run_main() -> Result<(), MainError> {
    let args = std::env::args().collect::<Vec<_>>();
    let invocation = match ccweb::cli::parse_invocation(&args) {
        Ok(invocation) => invocation,
        Err(error) => {
            let mut err = io::stderr().lock();
            let _ = writeln!(err, "{error}");
            let _ = writeln!(err);
            drop(err);
            print_help();
            std::process::exit(2);
        }
    };

    match invocation {
        CliInvocation::PrintHelp => {
            print_help();
            Ok(())
        }
        CliInvocation::PrintVersion => {
            let mut out = io::stdout().lock();
            let _ = writeln!(out, "{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        CliInvocation::Command(command) => {
            let state_dir = resolve_state_dir()?;
            let settings = load_settings(&state_dir)?;
            init_logging(&settings.log_level);

            let env = CliEnv {
                projects_dir: resolve_claude_projects_dir()?,
                state_dir,
                settings,
            };
            tracing::debug!(
                event = "cli.start",
                projects_dir = %env.projects_dir.display(),
                state_dir = %env.state_dir.display(),
            );
            ccweb::cli::run(command, &env)?;
            Ok(())
        }
    }
}

fn print_help() {
    let text = format!(
        "{name} - web chat companion for Claude Code session logs\n\nUSAGE:\n  {name} [serve] [--bind ADDR] [--port N]      Serve the HTTP API (default command)\n  {name} projects                            List projects\n  {name} sessions <project> [flags]          List sessions of a project\n  {name} history <project> <session-id>      Print messages of a session log\n  {name} history --remote <session-id>       Print messages from the backend history\n  {name} delete-message <project> <session-id> <index>  Delete one message from a session log\n  {name} delete-session <project> <session-id>  Delete a whole session log\n  {name} stats <project>                      Project totals, averages and estimated cost\n  {name} status [--watch]                    Backend health and metrics\n  {name} store [--sync] [--repair remove|reset]  Check the local session store\n  {name} --help | --version\n\nSESSIONS FLAGS:\n  --limit N      Max sessions to print (default: 10)\n  --offset N     Skip first N sessions (default: 0)\n  --size         Append file size column\n\nHISTORY FLAGS:\n  --limit N      Max messages to print (default: 10)\n  --offset N     Skip first N messages (default: 0)\n  --full         Print full message text\n\nOUTPUT:\n  projects: name<TAB>sessions<TAB>messages<TAB>tokens<TAB>last_activity\n  sessions: last_activity<TAB>session_id<TAB>title<TAB>messages<TAB>tokens  (with --size adds size)\n  history:  index<TAB>role<TAB>timestamp<TAB>tokens<TAB>text\n\nMessage indices count user and assistant records only; history and delete-message agree on them.\n\nENV:\n  CLAUDE_PROJECTS_DIR      Override Claude projects dir (default: ~/.claude/projects)\n  CCWEB_STATE_DIR          Override state dir (default: ~/.ccweb)\n  CCWEB_API_ENDPOINT       Backend base URL (default: http://localhost:8992)\n  CCWEB_FRONTEND_ENDPOINT  Allowed CORS origin (default: http://localhost:3082)\n  CCWEB_BIND, CCWEB_PORT   Listen address (default: 127.0.0.1:8991)\n  CCWEB_LOG                Log filter (RUST_LOG wins)\n",
        name = env!("CARGO_PKG_NAME")
    );
    let mut out = io::stdout().lock();
    let _ = write!(out, "{text}");
}
