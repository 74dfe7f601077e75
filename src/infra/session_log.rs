use crate::domain::{
    ClassifiedLog, LogMessage, RemoveMessageError, compute_session_log_stats,
    parse_log_messages, parse_rfc3339_to_unix_ms,
};
use crate::util::is_single_path_component;
use dirs::home_dir;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

#[derive(Debug, Error)]
pub enum ResolveProjectsDirError {
    #[error("home directory not found")]
    HomeDirNotFound,
}

pub fn resolve_claude_projects_dir() -> Result<PathBuf, ResolveProjectsDirError> {
    if let Some(override_dir) = std::env::var_os("CLAUDE_PROJECTS_DIR") {
        return Ok(PathBuf::from(override_dir));
    }

    let Some(home) = home_dir() else {
        return Err(ResolveProjectsDirError::HomeDirNotFound);
    };

    Ok(home.join(".claude").join("projects"))
}

#[derive(Debug, Error, Eq, PartialEq)]
pub enum SessionPathError {
    #[error("invalid project path: {0:?}")]
    InvalidProject(String),

    #[error("invalid session id: {0:?}")]
    InvalidSessionId(String),
}

pub fn project_dir_path(projects_dir: &Path, project: &str) -> Result<PathBuf, SessionPathError> {
    if !is_single_path_component(project) {
        return Err(SessionPathError::InvalidProject(project.to_string()));
    }
    Ok(projects_dir.join(project))
}

pub fn session_log_path(
    projects_dir: &Path,
    project: &str,
    session_id: &str,
) -> Result<PathBuf, SessionPathError> {
    let project_dir = project_dir_path(projects_dir, project)?;
    if !is_single_path_component(session_id) {
        return Err(SessionPathError::InvalidSessionId(session_id.to_string()));
    }
    Ok(project_dir.join(format!("{session_id}.jsonl")))
}

#[derive(Debug, Error)]
pub enum DeleteMessageError {
    #[error(transparent)]
    InvalidPath(#[from] SessionPathError),

    #[error("session log not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    InvalidIndex(#[from] RemoveMessageError),

    #[error("failed to read session log {path}: {source}")]
    Read { path: String, source: io::Error },

    #[error("failed to write session log {path}: {source}")]
    Write { path: String, source: io::Error },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeleteMessageOutcome {
    pub deleted_index: usize,
    pub remaining_messages: usize,
}

/// Removes one message (by messages-only index) from a session log and rewrites it.
pub fn delete_session_message(
    projects_dir: &Path,
    session_id: &str,
    message_index: i64,
    project: &str,
) -> Result<DeleteMessageOutcome, DeleteMessageError> {
    let path = session_log_path(projects_dir, project, session_id)?;
    let bytes = read_session_log(&path).map_err(|error| match error {
        ReadLogError::NotFound => DeleteMessageError::NotFound(path.display().to_string()),
        ReadLogError::Io(source) => DeleteMessageError::Read {
            path: path.display().to_string(),
            source,
        },
    })?;

    let mut log = ClassifiedLog::from_bytes(&bytes);
    log.remove_message(message_index)?;

    replace_file_contents(&path, &log.render()).map_err(|source| DeleteMessageError::Write {
        path: path.display().to_string(),
        source,
    })?;

    Ok(DeleteMessageOutcome {
        deleted_index: message_index as usize,
        remaining_messages: log.message_count(),
    })
}

enum ReadLogError {
    NotFound,
    Io(io::Error),
}

fn read_session_log(path: &Path) -> Result<Vec<u8>, ReadLogError> {
    match fs::read(path) {
        Ok(bytes) => Ok(bytes),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Err(ReadLogError::NotFound),
        Err(error) => Err(ReadLogError::Io(error)),
    }
}

fn replace_file_contents(path: &Path, contents: &[u8]) -> io::Result<()> {
    let tmp_path = path.with_extension("jsonl.tmp");
    fs::write(&tmp_path, contents)?;
    if let Err(error) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(error);
    }
    Ok(())
}

#[derive(Debug, Error)]
pub enum DeleteSessionLogError {
    #[error(transparent)]
    InvalidPath(#[from] SessionPathError),

    #[error("session log not found: {0}")]
    NotFound(String),

    #[error("failed to remove session log {path}: {source}")]
    Remove { path: String, source: io::Error },
}

/// Removes a whole session log file.
pub fn delete_session_log(
    projects_dir: &Path,
    project: &str,
    session_id: &str,
) -> Result<PathBuf, DeleteSessionLogError> {
    let path = session_log_path(projects_dir, project, session_id)?;
    match fs::remove_file(&path) {
        Ok(()) => Ok(path),
        Err(error) if error.kind() == io::ErrorKind::NotFound => {
            Err(DeleteSessionLogError::NotFound(path.display().to_string()))
        }
        Err(source) => Err(DeleteSessionLogError::Remove {
            path: path.display().to_string(),
            source,
        }),
    }
}

#[derive(Debug, Error)]
pub enum LoadSessionError {
    #[error(transparent)]
    InvalidPath(#[from] SessionPathError),

    #[error("session log not found: {0}")]
    NotFound(String),

    #[error("failed to read session log {path}: {source}")]
    Read { path: String, source: io::Error },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionMessagesPage {
    pub total: usize,
    pub messages: Vec<LogMessage>,
}

pub fn load_session_messages(
    projects_dir: &Path,
    project: &str,
    session_id: &str,
    offset: usize,
    limit: Option<usize>,
) -> Result<SessionMessagesPage, LoadSessionError> {
    let path = session_log_path(projects_dir, project, session_id)?;
    let bytes = read_session_log(&path).map_err(|error| match error {
        ReadLogError::NotFound => LoadSessionError::NotFound(path.display().to_string()),
        ReadLogError::Io(source) => LoadSessionError::Read {
            path: path.display().to_string(),
            source,
        },
    })?;

    let messages = parse_log_messages(&bytes);
    let total = messages.len();
    let messages = messages
        .into_iter()
        .skip(offset)
        .take(limit.unwrap_or(usize::MAX))
        .collect();
    Ok(SessionMessagesPage { total, messages })
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub title: String,
    pub message_count: usize,
    pub total_tokens: u64,
    pub first_timestamp: Option<String>,
    pub last_timestamp: Option<String>,
    pub file_size_bytes: u64,
    pub modified: Option<String>,
    #[serde(skip)]
    pub log_path: PathBuf,
}

impl SessionSummary {
    fn activity_ms(&self) -> i64 {
        self.last_timestamp
            .as_deref()
            .or(self.modified.as_deref())
            .and_then(parse_rfc3339_to_unix_ms)
            .unwrap_or(0)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSummary {
    pub name: String,
    pub path: PathBuf,
    pub sessions_count: usize,
    pub total_messages: usize,
    pub total_tokens: u64,
    pub first_activity: Option<String>,
    pub last_activity: Option<String>,
}

#[derive(Clone, Debug)]
pub struct ProjectListing {
    pub projects: Vec<ProjectSummary>,
    pub warnings: usize,
    pub notice: Option<String>,
}

#[derive(Clone, Debug)]
pub struct SessionListing {
    pub sessions: Vec<SessionSummary>,
    pub warnings: usize,
}

#[derive(Debug, Error)]
pub enum ListSessionsError {
    #[error(transparent)]
    InvalidPath(#[from] SessionPathError),

    #[error("project not found: {0}")]
    ProjectNotFound(String),

    #[error("failed to read project dir {path}: {source}")]
    Read { path: String, source: io::Error },
}

pub fn list_projects(projects_dir: &Path) -> ProjectListing {
    if !projects_dir.exists() {
        return ProjectListing {
            projects: Vec::new(),
            warnings: 0,
            notice: Some(format!(
                "Claude projects dir not found: {}",
                projects_dir.display()
            )),
        };
    }

    let Ok(entries) = fs::read_dir(projects_dir) else {
        return ProjectListing {
            projects: Vec::new(),
            warnings: 0,
            notice: Some(format!(
                "Claude projects dir is not readable: {}",
                projects_dir.display()
            )),
        };
    };

    let mut warnings = 0usize;
    let mut projects: Vec<(i64, ProjectSummary)> = Vec::new();

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(_) => {
                warnings += 1;
                continue;
            }
        };
        let Ok(file_type) = entry.file_type() else {
            warnings += 1;
            continue;
        };
        if !file_type.is_dir() {
            continue;
        }

        let project_dir = entry.path();
        let listing = match scan_project_dir(&project_dir) {
            Ok(listing) => listing,
            Err(_) => {
                warnings += 1;
                continue;
            }
        };
        warnings += listing.warnings;

        let name = entry.file_name().to_string_lossy().to_string();
        let summary = summarize_project(name, project_dir, &listing.sessions);
        projects.push((latest_activity_ms(&listing.sessions), summary));
    }

    projects.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.name.cmp(&b.1.name)));
    ProjectListing {
        projects: projects.into_iter().map(|(_, project)| project).collect(),
        warnings,
        notice: None,
    }
}

fn latest_activity_ms(sessions: &[SessionSummary]) -> i64 {
    sessions
        .iter()
        .map(SessionSummary::activity_ms)
        .max()
        .unwrap_or(0)
}

fn summarize_project(name: String, path: PathBuf, sessions: &[SessionSummary]) -> ProjectSummary {
    let first_activity = sessions
        .iter()
        .filter_map(|s| s.first_timestamp.as_deref())
        .min_by_key(|ts| parse_rfc3339_to_unix_ms(ts).unwrap_or(i64::MAX))
        .map(|ts| ts.to_string());
    let last_activity = sessions
        .iter()
        .max_by_key(|s| s.activity_ms())
        .and_then(|s| s.last_timestamp.clone().or(s.modified.clone()));

    ProjectSummary {
        name,
        path,
        sessions_count: sessions.len(),
        total_messages: sessions.iter().map(|s| s.message_count).sum(),
        total_tokens: sessions.iter().map(|s| s.total_tokens).sum(),
        first_activity,
        last_activity,
    }
}

// Opus list prices per million tokens, with a 70/30 input/output split.
const INPUT_USD_PER_MTOK: f64 = 15.0;
const OUTPUT_USD_PER_MTOK: f64 = 75.0;
const INPUT_SHARE: f64 = 0.7;

pub fn estimate_cost_usd(total_tokens: u64) -> f64 {
    let tokens = total_tokens as f64;
    let input = tokens * INPUT_SHARE;
    let output = tokens * (1.0 - INPUT_SHARE);
    (input * INPUT_USD_PER_MTOK + output * OUTPUT_USD_PER_MTOK) / 1_000_000.0
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectStats {
    #[serde(flatten)]
    pub summary: ProjectSummary,
    pub avg_messages_per_session: f64,
    pub avg_tokens_per_session: f64,
    pub estimated_cost_usd: f64,
    pub sessions: Vec<SessionSummary>,
}

pub fn project_stats(projects_dir: &Path, project: &str) -> Result<ProjectStats, ListSessionsError> {
    let listing = list_project_sessions(projects_dir, project)?;
    let summary = summarize_project(
        project.to_string(),
        project_dir_path(projects_dir, project)?,
        &listing.sessions,
    );

    let per_session = |total: f64| {
        if summary.sessions_count == 0 {
            0.0
        } else {
            round_to(total / summary.sessions_count as f64, 2)
        }
    };
    Ok(ProjectStats {
        avg_messages_per_session: per_session(summary.total_messages as f64),
        avg_tokens_per_session: per_session(summary.total_tokens as f64),
        estimated_cost_usd: round_to(estimate_cost_usd(summary.total_tokens), 4),
        summary,
        sessions: listing.sessions,
    })
}

pub fn list_project_sessions(
    projects_dir: &Path,
    project: &str,
) -> Result<SessionListing, ListSessionsError> {
    let project_dir = project_dir_path(projects_dir, project)?;
    if !project_dir.is_dir() {
        return Err(ListSessionsError::ProjectNotFound(project.to_string()));
    }
    scan_project_dir(&project_dir).map_err(|source| ListSessionsError::Read {
        path: project_dir.display().to_string(),
        source,
    })
}

fn scan_project_dir(project_dir: &Path) -> io::Result<SessionListing> {
    let mut warnings = 0usize;
    let mut sessions: Vec<SessionSummary> = Vec::new();

    for entry in fs::read_dir(project_dir)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(_) => {
                warnings += 1;
                continue;
            }
        };
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("jsonl") {
            continue;
        }
        match summarize_session_file(&path) {
            Ok(summary) => sessions.push(summary),
            Err(_) => warnings += 1,
        }
    }

    sessions.sort_by(|a, b| {
        b.activity_ms()
            .cmp(&a.activity_ms())
            .then_with(|| a.session_id.cmp(&b.session_id))
    });
    Ok(SessionListing { sessions, warnings })
}

fn summarize_session_file(path: &Path) -> io::Result<SessionSummary> {
    let metadata = fs::metadata(path)?;
    let bytes = fs::read(path)?;
    let stats = compute_session_log_stats(&bytes);

    Ok(SessionSummary {
        session_id: path
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_else(|| "(unknown)".to_string()),
        title: stats.title.unwrap_or_else(|| "(untitled)".to_string()),
        message_count: stats.message_count,
        total_tokens: stats.total_tokens,
        first_timestamp: stats.first_timestamp,
        last_timestamp: stats.last_timestamp,
        file_size_bytes: metadata.len(),
        modified: metadata.modified().ok().and_then(system_time_to_rfc3339),
        log_path: path.to_path_buf(),
    })
}

fn system_time_to_rfc3339(value: SystemTime) -> Option<String> {
    let timestamp = OffsetDateTime::from(value);
    timestamp.format(&Rfc3339).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const PROJECT: &str = "-tmp-demo";
    const SESSION: &str = "f47ac10b-58cc-4372-a567-0e02b2c3d479";
    const META: &str = r#"{"type":"summary","summary":"demo","leafUuid":"x"}"#;
    const M0: &str = r#"{"type":"user","uuid":"m0","timestamp":"2026-02-19T00:00:00Z","message":{"role":"user","content":"zero"}}"#;
    const M1: &str = r#"{"type":"assistant","uuid":"m1","timestamp":"2026-02-19T00:00:01Z","message":{"role":"assistant","content":"one","usage":{"input_tokens":2,"output_tokens":3}}}"#;
    const M2: &str = r#"{"type":"user","uuid":"m2","timestamp":"2026-02-19T00:00:02Z","message":{"role":"user","content":"two"}}"#;

    fn write_session(projects_dir: &Path, project: &str, session: &str, text: &str) -> PathBuf {
        let dir = projects_dir.join(project);
        fs::create_dir_all(&dir).expect("create project dir");
        let path = dir.join(format!("{session}.jsonl"));
        fs::write(&path, text).expect("write log");
        path
    }

    #[test]
    fn builds_log_path_from_project_and_session() {
        let path = session_log_path(Path::new("/h/.claude/projects"), PROJECT, SESSION)
            .expect("path");
        assert_eq!(
            path,
            PathBuf::from(format!("/h/.claude/projects/{PROJECT}/{SESSION}.jsonl"))
        );
        assert_eq!(
            session_log_path(Path::new("/p"), "..", SESSION),
            Err(SessionPathError::InvalidProject("..".to_string()))
        );
        assert_eq!(
            session_log_path(Path::new("/p"), PROJECT, "../x"),
            Err(SessionPathError::InvalidSessionId("../x".to_string()))
        );
    }

    #[test]
    fn deletes_middle_message_and_keeps_metadata() {
        let dir = tempdir().expect("tempdir");
        let path = write_session(
            dir.path(),
            PROJECT,
            SESSION,
            &format!("{M0}\n{META}\n{M1}\n{M2}\n"),
        );

        let outcome = delete_session_message(dir.path(), SESSION, 1, PROJECT).expect("delete");
        assert_eq!(
            outcome,
            DeleteMessageOutcome {
                deleted_index: 1,
                remaining_messages: 2
            }
        );

        let text = fs::read_to_string(&path).expect("read");
        assert_eq!(text, format!("{META}\n{M0}\n{M2}\n"));
        assert!(!path.with_extension("jsonl.tmp").exists());
    }

    #[test]
    fn delete_keeps_invalid_utf8_and_crlf_lines_byte_for_byte() {
        let dir = tempdir().expect("tempdir");
        let garbled: &[u8] = b"{\"type\":\"summary\",\"summary\":\"caf\xe9\"}\r";
        let mut original = Vec::new();
        original.extend_from_slice(format!("{M0}\r\n").as_bytes());
        original.extend_from_slice(garbled);
        original.extend_from_slice(format!("\n{M1}\r\n").as_bytes());
        let path = dir.path().join(PROJECT).join(format!("{SESSION}.jsonl"));
        fs::create_dir_all(path.parent().expect("parent")).expect("create project dir");
        fs::write(&path, &original).expect("write log");

        let outcome = delete_session_message(dir.path(), SESSION, 0, PROJECT).expect("delete");
        assert_eq!(outcome.remaining_messages, 1);

        let mut expected = garbled.to_vec();
        expected.extend_from_slice(format!("\n{M1}\r\n").as_bytes());
        assert_eq!(fs::read(&path).expect("read"), expected);
    }

    #[test]
    fn out_of_range_index_leaves_file_untouched() {
        let dir = tempdir().expect("tempdir");
        let original = format!("{M0}\n{META}\n{M1}\n");
        let path = write_session(dir.path(), PROJECT, SESSION, &original);

        for index in [-1, 2, 99] {
            let error = delete_session_message(dir.path(), SESSION, index, PROJECT)
                .expect_err("out of range");
            assert!(matches!(
                error,
                DeleteMessageError::InvalidIndex(RemoveMessageError::IndexOutOfRange {
                    count: 2,
                    ..
                })
            ));
        }
        assert_eq!(fs::read_to_string(&path).expect("read"), original);
    }

    #[test]
    fn missing_log_is_not_found_and_nothing_is_written() {
        let dir = tempdir().expect("tempdir");
        let error =
            delete_session_message(dir.path(), SESSION, 0, PROJECT).expect_err("not found");
        assert!(matches!(error, DeleteMessageError::NotFound(_)));
        assert!(!dir.path().join(PROJECT).exists());
    }

    #[test]
    fn history_indices_match_delete_indices() {
        let dir = tempdir().expect("tempdir");
        write_session(
            dir.path(),
            PROJECT,
            SESSION,
            &format!("{META}\n{M0}\n{M1}\n{M2}\n"),
        );

        let page =
            load_session_messages(dir.path(), PROJECT, SESSION, 1, Some(1)).expect("load");
        assert_eq!(page.total, 3);
        assert_eq!(page.messages.len(), 1);
        assert_eq!(page.messages[0].index, 1);
        assert_eq!(page.messages[0].uuid.as_deref(), Some("m1"));

        delete_session_message(dir.path(), SESSION, page.messages[0].index as i64, PROJECT)
            .expect("delete");
        let page = load_session_messages(dir.path(), PROJECT, SESSION, 0, None).expect("load");
        let uuids = page
            .messages
            .iter()
            .filter_map(|m| m.uuid.as_deref())
            .collect::<Vec<_>>();
        assert_eq!(uuids, vec!["m0", "m2"]);
    }

    #[test]
    fn lists_projects_and_sessions_newest_first() {
        let dir = tempdir().expect("tempdir");
        write_session(dir.path(), "-old", "s-old", &format!("{M0}\n"));
        write_session(dir.path(), PROJECT, "s-a", &format!("{META}\n{M0}\n"));
        write_session(dir.path(), PROJECT, "s-b", &format!("{M0}\n{M1}\n{M2}\n"));
        fs::write(dir.path().join(PROJECT).join("notes.txt"), "skip").expect("write");

        let listing = list_projects(dir.path());
        assert!(listing.notice.is_none());
        assert_eq!(listing.warnings, 0);
        let names = listing
            .projects
            .iter()
            .map(|p| p.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, vec![PROJECT, "-old"]);
        assert_eq!(listing.projects[0].sessions_count, 2);
        assert_eq!(listing.projects[0].total_messages, 4);
        assert_eq!(listing.projects[0].total_tokens, 5);

        let sessions = list_project_sessions(dir.path(), PROJECT).expect("sessions");
        assert_eq!(sessions.sessions[0].session_id, "s-b");
        assert_eq!(sessions.sessions[0].title, "zero");
        assert_eq!(sessions.sessions[1].session_id, "s-a");
    }

    #[test]
    fn deletes_whole_session_log() {
        let dir = tempdir().expect("tempdir");
        let path = write_session(dir.path(), PROJECT, SESSION, &format!("{M0}\n"));

        let removed = delete_session_log(dir.path(), PROJECT, SESSION).expect("delete");
        assert_eq!(removed, path);
        assert!(!path.exists());

        assert!(matches!(
            delete_session_log(dir.path(), PROJECT, SESSION),
            Err(DeleteSessionLogError::NotFound(_))
        ));
        assert!(matches!(
            delete_session_log(dir.path(), PROJECT, "../escape"),
            Err(DeleteSessionLogError::InvalidPath(_))
        ));
    }

    #[test]
    fn project_stats_average_per_session_and_estimate_cost() {
        let dir = tempdir().expect("tempdir");
        write_session(dir.path(), PROJECT, "s-a", &format!("{META}\n{M0}\n"));
        write_session(dir.path(), PROJECT, "s-b", &format!("{M0}\n{M1}\n{M2}\n"));

        let stats = project_stats(dir.path(), PROJECT).expect("stats");
        assert_eq!(stats.summary.name, PROJECT);
        assert_eq!(stats.summary.sessions_count, 2);
        assert_eq!(stats.summary.total_messages, 4);
        assert_eq!(stats.summary.total_tokens, 5);
        assert_eq!(stats.avg_messages_per_session, 2.0);
        assert_eq!(stats.avg_tokens_per_session, 2.5);
        // 5 tokens: 3.5 in at $15/M plus 1.5 out at $75/M.
        assert_eq!(stats.estimated_cost_usd, 0.0002);
        assert_eq!(stats.sessions.len(), 2);

        fs::create_dir_all(dir.path().join("-empty")).expect("create");
        let empty = project_stats(dir.path(), "-empty").expect("stats");
        assert_eq!(empty.avg_messages_per_session, 0.0);
        assert_eq!(empty.estimated_cost_usd, 0.0);

        assert!(matches!(
            project_stats(dir.path(), "nope"),
            Err(ListSessionsError::ProjectNotFound(_))
        ));
    }

    #[test]
    fn estimates_cost_from_token_total() {
        assert_eq!(estimate_cost_usd(0), 0.0);
        assert!((estimate_cost_usd(1_000_000) - 33.0).abs() < 1e-9);
    }

    #[test]
    fn missing_projects_dir_returns_notice() {
        let dir = tempdir().expect("tempdir");
        let listing = list_projects(&dir.path().join("missing"));
        assert!(listing.projects.is_empty());
        assert!(listing.notice.is_some());

        assert!(matches!(
            list_project_sessions(dir.path(), "nope"),
            Err(ListSessionsError::ProjectNotFound(_))
        ));
    }
}
