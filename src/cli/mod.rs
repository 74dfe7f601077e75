use crate::domain::{LogMessage, RepairStrategy};
use crate::infra::{
    BackendClient, BackendError, BackendStatus, DeleteMessageError, DeleteSessionLogError,
    ListSessionsError, LoadSessionError, Settings, StatusPoller, StatusSignal, delete_session_log,
    delete_session_message, fetch_backend_status, list_project_sessions, list_projects,
    load_session_messages, load_session_store, project_stats, save_session_store,
};
use crate::server::{AppState, ServeError, run_http_server_on};
use humansize::{DECIMAL, format_size};
use std::io::{self, Write};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_LIMIT: usize = 10;
const TITLE_WIDTH: usize = 60;
const CONTENT_WIDTH: usize = 120;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CliInvocation {
    PrintHelp,
    PrintVersion,
    Command(CliCommand),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CliCommand {
    Serve {
        bind: Option<String>,
        port: Option<u16>,
    },
    Projects,
    Sessions {
        project: String,
        offset: usize,
        limit: usize,
        size: bool,
    },
    History {
        project: Option<String>,
        session_id: String,
        offset: usize,
        limit: usize,
        full: bool,
    },
    DeleteMessage {
        project: String,
        session_id: String,
        index: i64,
    },
    DeleteSession {
        project: String,
        session_id: String,
    },
    Stats {
        project: String,
    },
    Status {
        watch: bool,
    },
    Store {
        sync: bool,
        repair: Option<RepairStrategy>,
    },
}

#[derive(Debug, Error)]
pub enum CliParseError {
    #[error("unknown subcommand: {0}")]
    UnknownSubcommand(String),

    #[error("unknown flag: {0}")]
    UnknownFlag(String),

    #[error("missing value for flag: {0}")]
    MissingFlagValue(String),

    #[error("invalid value for {flag}: {value}")]
    InvalidFlagValue { flag: String, value: String },

    #[error("missing argument: {0}")]
    MissingArgument(&'static str),

    #[error("unexpected argument: {0}")]
    UnexpectedArgument(String),
}

pub fn parse_invocation(args: &[String]) -> Result<CliInvocation, CliParseError> {
    if args.iter().any(|arg| arg == "--help" || arg == "-h") {
        return Ok(CliInvocation::PrintHelp);
    }
    if args.iter().any(|arg| arg == "--version" || arg == "-V") {
        return Ok(CliInvocation::PrintVersion);
    }

    let mut iter = args.iter().skip(1);
    let Some(subcommand) = iter.next() else {
        return Ok(CliInvocation::Command(CliCommand::Serve {
            bind: None,
            port: None,
        }));
    };

    let mut args = iter.map(String::as_str);
    let command = match subcommand.as_str() {
        "serve" => {
            let mut bind: Option<String> = None;
            let mut port: Option<u16> = None;
            while let Some(arg) = args.next() {
                match arg {
                    "--bind" | "-b" => {
                        bind = Some(flag_value(&mut args, "--bind")?.to_string());
                    }
                    "--port" | "-p" => {
                        let value = flag_value(&mut args, "--port")?;
                        port = Some(parse_number_flag("--port", value)?);
                    }
                    _ => return Err(reject_argument(arg)),
                }
            }
            CliCommand::Serve { bind, port }
        }
        "projects" => {
            if let Some(arg) = args.next() {
                return Err(reject_argument(arg));
            }
            CliCommand::Projects
        }
        "sessions" => {
            let mut project: Option<String> = None;
            let mut offset = 0usize;
            let mut limit = DEFAULT_LIMIT;
            let mut size = false;
            while let Some(arg) = args.next() {
                match arg {
                    "--limit" | "-l" => {
                        limit = parse_number_flag("--limit", flag_value(&mut args, "--limit")?)?;
                    }
                    "--offset" | "-o" => {
                        offset =
                            parse_number_flag("--offset", flag_value(&mut args, "--offset")?)?;
                    }
                    "--size" => size = true,
                    _ if arg.starts_with('-') => {
                        return Err(CliParseError::UnknownFlag(arg.to_string()));
                    }
                    _ if project.is_none() => project = Some(arg.to_string()),
                    _ => return Err(CliParseError::UnexpectedArgument(arg.to_string())),
                }
            }
            CliCommand::Sessions {
                project: project.ok_or(CliParseError::MissingArgument("<project>"))?,
                offset,
                limit,
                size,
            }
        }
        "history" => {
            let mut positionals: Vec<String> = Vec::new();
            let mut offset = 0usize;
            let mut limit = DEFAULT_LIMIT;
            let mut full = false;
            let mut remote = false;
            while let Some(arg) = args.next() {
                match arg {
                    "--limit" | "-l" => {
                        limit = parse_number_flag("--limit", flag_value(&mut args, "--limit")?)?;
                    }
                    "--offset" | "-o" => {
                        offset =
                            parse_number_flag("--offset", flag_value(&mut args, "--offset")?)?;
                    }
                    "--full" => full = true,
                    "--remote" => remote = true,
                    _ if arg.starts_with('-') => {
                        return Err(CliParseError::UnknownFlag(arg.to_string()));
                    }
                    _ => positionals.push(arg.to_string()),
                }
            }

            let expected = if remote { 1 } else { 2 };
            if let Some(extra) = positionals.get(expected) {
                return Err(CliParseError::UnexpectedArgument(extra.clone()));
            }
            let mut positionals = positionals.into_iter();
            let project = if remote {
                None
            } else {
                Some(
                    positionals
                        .next()
                        .ok_or(CliParseError::MissingArgument("<project>"))?,
                )
            };
            let session_id = positionals
                .next()
                .ok_or(CliParseError::MissingArgument("<session-id>"))?;
            CliCommand::History {
                project,
                session_id,
                offset,
                limit,
                full,
            }
        }
        "delete-message" => {
            let mut positionals: Vec<&str> = Vec::new();
            for arg in args {
                // Negative indices are accepted here and rejected by the rewriter.
                if arg.starts_with('-') && arg.parse::<i64>().is_err() {
                    return Err(CliParseError::UnknownFlag(arg.to_string()));
                }
                positionals.push(arg);
            }
            if let Some(extra) = positionals.get(3) {
                return Err(CliParseError::UnexpectedArgument(extra.to_string()));
            }
            let project = positionals
                .first()
                .ok_or(CliParseError::MissingArgument("<project>"))?;
            let session_id = positionals
                .get(1)
                .ok_or(CliParseError::MissingArgument("<session-id>"))?;
            let index = positionals
                .get(2)
                .ok_or(CliParseError::MissingArgument("<index>"))?;
            CliCommand::DeleteMessage {
                project: project.to_string(),
                session_id: session_id.to_string(),
                index: parse_number_flag("<index>", index)?,
            }
        }
        "delete-session" => {
            let mut positionals = Vec::new();
            for arg in args {
                if arg.starts_with('-') {
                    return Err(CliParseError::UnknownFlag(arg.to_string()));
                }
                positionals.push(arg.to_string());
            }
            if let Some(extra) = positionals.get(2) {
                return Err(CliParseError::UnexpectedArgument(extra.clone()));
            }
            let mut positionals = positionals.into_iter();
            CliCommand::DeleteSession {
                project: positionals
                    .next()
                    .ok_or(CliParseError::MissingArgument("<project>"))?,
                session_id: positionals
                    .next()
                    .ok_or(CliParseError::MissingArgument("<session-id>"))?,
            }
        }
        "stats" => {
            let project = match args.next() {
                Some(arg) if !arg.starts_with('-') => arg.to_string(),
                Some(arg) => return Err(CliParseError::UnknownFlag(arg.to_string())),
                None => return Err(CliParseError::MissingArgument("<project>")),
            };
            if let Some(arg) = args.next() {
                return Err(reject_argument(arg));
            }
            CliCommand::Stats { project }
        }
        "status" => {
            let mut watch = false;
            for arg in args {
                match arg {
                    "--watch" | "-w" => watch = true,
                    _ => return Err(reject_argument(arg)),
                }
            }
            CliCommand::Status { watch }
        }
        "store" => {
            let mut sync = false;
            let mut repair: Option<RepairStrategy> = None;
            while let Some(arg) = args.next() {
                match arg {
                    "--sync" => sync = true,
                    "--repair" => {
                        let value = flag_value(&mut args, "--repair")?;
                        repair = Some(parse_repair_flag(value)?);
                    }
                    _ => return Err(reject_argument(arg)),
                }
            }
            CliCommand::Store { sync, repair }
        }
        other => return Err(CliParseError::UnknownSubcommand(other.to_string())),
    };

    Ok(CliInvocation::Command(command))
}

fn flag_value<'a>(
    args: &mut impl Iterator<Item = &'a str>,
    flag: &str,
) -> Result<&'a str, CliParseError> {
    args.next()
        .ok_or_else(|| CliParseError::MissingFlagValue(flag.to_string()))
}

fn reject_argument(arg: &str) -> CliParseError {
    if arg.starts_with('-') {
        CliParseError::UnknownFlag(arg.to_string())
    } else {
        CliParseError::UnexpectedArgument(arg.to_string())
    }
}

fn parse_number_flag<T: std::str::FromStr>(flag: &str, value: &str) -> Result<T, CliParseError> {
    value
        .parse::<T>()
        .map_err(|_| CliParseError::InvalidFlagValue {
            flag: flag.to_string(),
            value: value.to_string(),
        })
}

fn parse_repair_flag(value: &str) -> Result<RepairStrategy, CliParseError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "remove" => Ok(RepairStrategy::Remove),
        "reset" => Ok(RepairStrategy::Reset),
        _ => Err(CliParseError::InvalidFlagValue {
            flag: "--repair".to_string(),
            value: value.to_string(),
        }),
    }
}

#[derive(Debug, Error)]
pub enum CliRunError {
    #[error(transparent)]
    ListSessions(#[from] ListSessionsError),

    #[error(transparent)]
    LoadSession(#[from] LoadSessionError),

    #[error(transparent)]
    DeleteMessage(#[from] DeleteMessageError),

    #[error(transparent)]
    DeleteSession(#[from] DeleteSessionLogError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Serve(#[from] ServeError),

    #[error("invalid bind address: {0}\nHint: use an IP address such as 127.0.0.1 or 0.0.0.0.")]
    InvalidBindAddress(String),

    #[error("failed to start async runtime: {0}")]
    Runtime(#[source] io::Error),

    #[error("failed to access session store: {0}")]
    Store(#[source] io::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Resolved locations and settings a command runs against.
#[derive(Clone, Debug)]
pub struct CliEnv {
    pub projects_dir: PathBuf,
    pub state_dir: PathBuf,
    pub settings: Settings,
}

impl CliEnv {
    fn backend(&self) -> BackendClient {
        BackendClient::new(
            &self.settings.api_endpoint,
            Duration::from_secs(self.settings.request_timeout_secs),
        )
    }
}

pub fn run(command: CliCommand, env: &CliEnv) -> Result<(), CliRunError> {
    // Unlocked handles: server and poller threads log to stderr concurrently.
    let mut out = io::BufWriter::new(io::stdout());
    let mut err = io::BufWriter::new(io::stderr());

    match command {
        CliCommand::Serve { bind, port } => {
            let bind = bind.unwrap_or_else(|| env.settings.bind.clone());
            let port = port.unwrap_or(env.settings.port);
            let ip = bind
                .parse::<IpAddr>()
                .map_err(|_| CliRunError::InvalidBindAddress(bind.clone()))?;
            let state = AppState::new(
                env.projects_dir.clone(),
                Some(env.settings.frontend_endpoint.clone()),
            );

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(CliRunError::Runtime)?;
            runtime.block_on(run_http_server_on(SocketAddr::new(ip, port), state))?;
            Ok(())
        }
        CliCommand::Projects => {
            let listing = list_projects(&env.projects_dir);
            for project in listing.projects {
                let line = format!(
                    "{}\t{}\t{}\t{}\t{}",
                    project.name,
                    project.sessions_count,
                    project.total_messages,
                    project.total_tokens,
                    project.last_activity.as_deref().unwrap_or("-"),
                );
                if !write_line(&mut out, &line)? {
                    return Ok(());
                }
            }
            if let Some(notice) = listing.notice {
                write_line(&mut err, &notice)?;
            }
            if listing.warnings > 0 {
                write_line(&mut err, &format!("warnings: {}", listing.warnings))?;
            }
            Ok(())
        }
        CliCommand::Sessions {
            project,
            offset,
            limit,
            size,
        } => {
            let listing = list_project_sessions(&env.projects_dir, &project)?;
            for session in listing.sessions.iter().skip(offset).take(limit) {
                let when = session
                    .last_timestamp
                    .as_deref()
                    .or(session.modified.as_deref())
                    .unwrap_or("-");
                let mut line = format!(
                    "{when}\t{}\t{}\t{}\t{}",
                    session.session_id,
                    truncate_end(&session.title, TITLE_WIDTH),
                    session.message_count,
                    session.total_tokens,
                );
                if size {
                    line.push('\t');
                    line.push_str(&format_size(session.file_size_bytes, DECIMAL));
                }
                if !write_line(&mut out, &line)? {
                    return Ok(());
                }
            }
            if listing.warnings > 0 {
                write_line(&mut err, &format!("warnings: {}", listing.warnings))?;
            }
            Ok(())
        }
        CliCommand::History {
            project: Some(project),
            session_id,
            offset,
            limit,
            full,
        } => {
            let page = load_session_messages(
                &env.projects_dir,
                &project,
                &session_id,
                offset,
                Some(limit),
            )?;
            let shown = page.messages.len();
            for message in &page.messages {
                if !write_line(&mut out, &format_log_message(message, full))? {
                    return Ok(());
                }
            }
            write_line(&mut err, &page_footer(offset, shown, Some(page.total)))?;
            Ok(())
        }
        CliCommand::History {
            project: None,
            session_id,
            offset,
            limit,
            full,
        } => {
            let history = env.backend().session_history(&session_id, offset, limit)?;
            let shown = history.len();
            for (position, entry) in history.into_iter().enumerate() {
                let message = entry.into_chat_message(&session_id, offset + position);
                let content = message.content.unwrap_or_default();
                let line = format!(
                    "{}\t{}\t{}\t{}",
                    offset + position,
                    message.role.as_deref().unwrap_or("-"),
                    message.timestamp.as_deref().unwrap_or("-"),
                    format_content(&content, full),
                );
                if !write_line(&mut out, &line)? {
                    return Ok(());
                }
            }
            write_line(&mut err, &page_footer(offset, shown, None))?;
            Ok(())
        }
        CliCommand::DeleteMessage {
            project,
            session_id,
            index,
        } => {
            let outcome = delete_session_message(&env.projects_dir, &session_id, index, &project)?;
            tracing::info!(
                event = "message.delete.ok",
                session_id = %session_id,
                project = %project,
                deleted_index = outcome.deleted_index,
                remaining = outcome.remaining_messages,
            );
            write_line(
                &mut out,
                &format!(
                    "deleted\t{}\tremaining\t{}",
                    outcome.deleted_index, outcome.remaining_messages
                ),
            )?;
            Ok(())
        }
        CliCommand::DeleteSession {
            project,
            session_id,
        } => {
            let path = delete_session_log(&env.projects_dir, &project, &session_id)?;
            tracing::info!(
                event = "session.delete.ok",
                session_id = %session_id,
                project = %project,
                path = %path.display(),
            );
            write_line(&mut out, &format!("deleted	{session_id}"))?;
            Ok(())
        }
        CliCommand::Stats { project } => {
            let stats = project_stats(&env.projects_dir, &project)?;
            let summary = &stats.summary;
            let lines = [
                format!("project	{}", summary.name),
                format!("sessions	{}", summary.sessions_count),
                format!("messages	{}", summary.total_messages),
                format!("tokens	{}", summary.total_tokens),
                format!("avg_messages_per_session	{:.2}", stats.avg_messages_per_session),
                format!("avg_tokens_per_session	{:.2}", stats.avg_tokens_per_session),
                format!("estimated_cost_usd	{:.4}", stats.estimated_cost_usd),
                format!(
                    "first_activity	{}",
                    summary.first_activity.as_deref().unwrap_or("-")
                ),
                format!(
                    "last_activity	{}",
                    summary.last_activity.as_deref().unwrap_or("-")
                ),
            ];
            for line in &lines {
                if !write_line(&mut out, line)? {
                    return Ok(());
                }
            }
            Ok(())
        }
        CliCommand::Status { watch: false } => {
            let client = env.backend();
            let status = fetch_backend_status(&client)?;
            write_status(&mut out, client.base_url(), &status)?;
            Ok(())
        }
        CliCommand::Status { watch: true } => {
            let client = env.backend();
            let base_url = client.base_url().to_string();
            let interval = Duration::from_secs(env.settings.poll_interval_secs.max(1));
            let poller = StatusPoller::spawn(client, interval);
            watch_status(&mut out, &base_url, || poller.recv_timeout(interval))?;
            Ok(())
        }
        CliCommand::Store { sync, repair } => {
            let mut store = load_session_store(&env.state_dir).map_err(CliRunError::Store)?;
            let mut changed = false;

            if sync {
                let remote = env.backend().web_sessions()?;
                let outcome = store.reconcile(&remote);
                tracing::info!(
                    event = "store.sync.ok",
                    updated = outcome.updated,
                    added = outcome.added,
                    stale = outcome.stale,
                );
                write_line(
                    &mut out,
                    &format!(
                        "sync\tupdated\t{}\tadded\t{}\tstale\t{}",
                        outcome.updated, outcome.added, outcome.stale
                    ),
                )?;
                changed = true;
            }

            if let Some(strategy) = repair {
                let repaired = store.repair_all(strategy);
                for id in &repaired {
                    write_line(&mut out, &format!("repaired\t{id}"))?;
                }
                changed |= !repaired.is_empty();
            }

            let report = store.health_report();
            for entry in &report {
                let issues = entry
                    .issues
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; ");
                write_line(&mut out, &format!("corrupted\t{}\t{issues}", entry.session_id))?;
            }
            write_line(
                &mut out,
                &format!(
                    "sessions\t{}\tcorrupted\t{}",
                    store.sessions().len(),
                    report.len()
                ),
            )?;

            if changed {
                save_session_store(&env.state_dir, &store).map_err(CliRunError::Store)?;
            }
            Ok(())
        }
    }
}

/// Prints signals until the reader goes away or the poller stops.
fn watch_status(
    out: &mut impl Write,
    base_url: &str,
    mut next_signal: impl FnMut() -> Result<StatusSignal, RecvTimeoutError>,
) -> io::Result<()> {
    loop {
        let signal = match next_signal() {
            Ok(signal) => signal,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return Ok(()),
        };
        let alive = match signal {
            StatusSignal::Status(status) => write_status(out, base_url, &status)?,
            StatusSignal::Error(error) => {
                write_line(out, &format!("backend\t{base_url}\tunreachable\t{error}"))?
            }
        };
        if !alive || !flush_output(out)? {
            return Ok(());
        }
    }
}

fn flush_output(out: &mut impl Write) -> io::Result<bool> {
    match out.flush() {
        Ok(()) => Ok(true),
        Err(error) if error.kind() == io::ErrorKind::BrokenPipe => Ok(false),
        Err(error) => Err(error),
    }
}

fn write_status(out: &mut impl Write, base_url: &str, status: &BackendStatus) -> io::Result<bool> {
    let version = status.health.version.as_deref().unwrap_or("-");
    if !write_line(
        out,
        &format!("backend\t{base_url}\t{}\t{version}", status.health.status),
    )? {
        return Ok(false);
    }
    let Some(metrics) = status.metrics.as_ref() else {
        return Ok(true);
    };
    for (name, value) in &metrics.counters {
        if !write_line(out, &format!("counter\t{name}\t{value}"))? {
            return Ok(false);
        }
    }
    for (name, stats) in &metrics.operations {
        let line = format!(
            "operation\t{name}\t{}\t{:.1}\t{:.1}",
            stats.count, stats.mean, stats.max
        );
        if !write_line(out, &line)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn format_log_message(message: &LogMessage, full: bool) -> String {
    let tokens = message
        .usage
        .as_ref()
        .map(|usage| usage.total().to_string())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{}\t{}\t{}\t{tokens}\t{}",
        message.index,
        message.role,
        message.timestamp.as_deref().unwrap_or("-"),
        format_content(&message.content, full),
    )
}

fn format_content(content: &str, full: bool) -> String {
    if full {
        return content.to_string();
    }
    let single_line = content.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_end(&single_line, CONTENT_WIDTH)
}

fn page_footer(offset: usize, shown: usize, total: Option<usize>) -> String {
    let end = offset + shown;
    match total {
        Some(total) if shown == 0 => format!("showing 0 of {total}"),
        Some(total) => format!("showing {}-{end} of {total}", offset + 1),
        None if shown == 0 => "showing 0".to_string(),
        None => format!("showing {}-{end}", offset + 1),
    }
}

fn truncate_end(text: &str, width: usize) -> String {
    if unicode_width::UnicodeWidthStr::width(text) <= width {
        return text.to_string();
    }
    if width == 0 {
        return String::new();
    }
    let mut out = String::new();
    let mut used = 0usize;
    for ch in text.chars() {
        let ch_width = unicode_width::UnicodeWidthChar::width(ch).unwrap_or(0);
        if used + ch_width > width.saturating_sub(1) {
            break;
        }
        used += ch_width;
        out.push(ch);
    }
    out.push('…');
    out
}

fn write_line(out: &mut impl Write, line: &str) -> io::Result<bool> {
    match writeln!(out, "{line}") {
        Ok(()) => Ok(true),
        Err(error) if error.kind() == io::ErrorKind::BrokenPipe => Ok(false),
        Err(error) => Err(error),
    }
}
