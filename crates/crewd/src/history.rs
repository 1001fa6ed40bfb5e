//! Read-only access to the agent's own conversation store.
//!
//! The agent CLI writes `<root>/<project-id>/<session-id>.jsonl`, with
//! `<root>` defaulting to `~/.claude/projects`. Nothing here writes to
//! that tree.
//!
//! All functions perform blocking I/O and should be called via
//! `spawn_blocking`.

use std::cmp::Ordering;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, trace};

use crew_core::{is_safe_id, StoredProject, StoredSession};

/// Lines scanned per transcript when looking for the project's `cwd`.
const CWD_SCAN_LINES: usize = 10;

const CAVEAT_MARKER: &str =
    "Caveat: The messages below were generated by the user while running local commands";
const BOILERPLATE_PREFIXES: [&str; 3] = [
    "<command-name>",
    "<local-command-stdout>",
    "<local-command-stderr>",
];

/// Errors raised while reading the conversation store.
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("invalid {what}: {value:?}")]
    UnsafeId { what: &'static str, value: String },

    #[error("not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl HistoryError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound(path.to_path_buf())
        } else {
            Self::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }
}

/// Default store location, `~/.claude/projects`.
pub fn default_projects_root() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".claude").join("projects"))
}

fn check_id(what: &'static str, value: &str) -> Result<(), HistoryError> {
    if is_safe_id(value) {
        Ok(())
    } else {
        Err(HistoryError::UnsafeId {
            what,
            value: value.to_string(),
        })
    }
}

fn to_utc(time: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(time)
}

fn created_at(meta: &fs::Metadata) -> DateTime<Utc> {
    to_utc(
        meta.created()
            .or_else(|_| meta.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH),
    )
}

fn modified_at(meta: &fs::Metadata) -> DateTime<Utc> {
    to_utc(meta.modified().unwrap_or(SystemTime::UNIX_EPOCH))
}

/// `*.jsonl` files directly inside `dir`.
fn transcripts(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && path.extension().and_then(|e| e.to_str()) == Some("jsonl"))
        .collect()
}

fn session_id_of(path: &Path) -> Option<String> {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .map(str::to_string)
}

/// Working directory recorded in the first lines of any transcript.
fn project_path_from_transcripts(dir: &Path) -> Option<String> {
    for path in transcripts(dir) {
        let Ok(file) = fs::File::open(&path) else {
            continue;
        };
        for line in BufReader::new(file).lines().take(CWD_SCAN_LINES).map_while(Result::ok) {
            let Ok(json) = serde_json::from_str::<Value>(&line) else {
                continue;
            };
            if let Some(cwd) = json.get("cwd").and_then(Value::as_str).filter(|c| !c.is_empty()) {
                return Some(cwd.to_string());
            }
        }
    }
    None
}

/// Lossy guess used when no transcript records a `cwd`.
fn decode_project_dir_name(name: &str) -> String {
    name.replace('-', "/")
}

fn project_path(dir: &Path, name: &str) -> String {
    project_path_from_transcripts(dir).unwrap_or_else(|| decode_project_dir_name(name))
}

// ============================================================================
// Listing
// ============================================================================

/// Projects in the store, most recently used first.
///
/// A missing root yields an empty list.
pub fn list_projects(root: &Path) -> Result<Vec<StoredProject>, HistoryError> {
    if !root.exists() {
        debug!(root = %root.display(), "Agent projects directory does not exist");
        return Ok(Vec::new());
    }
    let entries = fs::read_dir(root).map_err(|e| HistoryError::io(root, e))?;

    let mut projects = Vec::new();
    for entry in entries.flatten() {
        let dir = entry.path();
        if !dir.is_dir() {
            continue;
        }
        let Some(name) = dir.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            continue;
        };
        let meta = fs::metadata(&dir).map_err(|e| HistoryError::io(&dir, e))?;

        let mut sessions = Vec::new();
        let mut most_recent_session: Option<DateTime<Utc>> = None;
        for transcript in transcripts(&dir) {
            let Some(id) = session_id_of(&transcript) else {
                continue;
            };
            sessions.push(id);
            if let Ok(meta) = fs::metadata(&transcript) {
                let modified = modified_at(&meta);
                most_recent_session =
                    Some(most_recent_session.map_or(modified, |m| m.max(modified)));
            }
        }

        trace!(project = %name, sessions = sessions.len(), "Found stored project");
        projects.push(StoredProject {
            path: project_path(&dir, &name),
            id: name,
            sessions,
            created_at: created_at(&meta),
            most_recent_session,
        });
    }

    projects.sort_by(|a, b| match (a.most_recent_session, b.most_recent_session) {
        (Some(a_time), Some(b_time)) => b_time.cmp(&a_time),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => b.created_at.cmp(&a.created_at),
    });
    Ok(projects)
}

/// Stored conversations of a project, most recently modified first.
pub fn list_project_sessions(
    root: &Path,
    project_id: &str,
) -> Result<Vec<StoredSession>, HistoryError> {
    check_id("project id", project_id)?;
    let dir = root.join(project_id);
    if !dir.is_dir() {
        return Err(HistoryError::NotFound(dir));
    }
    let path = project_path(&dir, project_id);

    let mut sessions = Vec::new();
    for transcript in transcripts(&dir) {
        let Some(id) = session_id_of(&transcript) else {
            continue;
        };
        let meta = fs::metadata(&transcript).map_err(|e| HistoryError::io(&transcript, e))?;
        let (first_message, message_timestamp) = extract_first_user_message(&transcript);

        sessions.push(StoredSession {
            id,
            project_id: project_id.to_string(),
            project_path: path.clone(),
            created_at: created_at(&meta),
            modified_at: modified_at(&meta),
            first_message,
            message_timestamp,
        });
    }

    sessions.sort_by(|a, b| {
        b.modified_at
            .cmp(&a.modified_at)
            .then_with(|| b.created_at.cmp(&a.created_at))
    });
    Ok(sessions)
}

/// Every parseable JSON line of a stored conversation, in file order.
pub fn read_session_transcript(
    root: &Path,
    project_id: &str,
    session_id: &str,
) -> Result<Vec<Value>, HistoryError> {
    check_id("project id", project_id)?;
    check_id("session id", session_id)?;

    let path = root.join(project_id).join(format!("{session_id}.jsonl"));
    let file = fs::File::open(&path).map_err(|e| HistoryError::io(&path, e))?;

    Ok(BufReader::new(file)
        .lines()
        .map_while(Result::ok)
        .filter_map(|line| serde_json::from_str::<Value>(&line).ok())
        .collect())
}

// ============================================================================
// First message
// ============================================================================

#[derive(Deserialize)]
struct TranscriptEntry {
    message: Option<TranscriptMessage>,
    timestamp: Option<String>,
}

#[derive(Deserialize)]
struct TranscriptMessage {
    role: Option<String>,
    content: Option<Value>,
}

/// Plain text of a message body: a string, or the text blocks of an array.
fn message_text(content: &Value) -> Option<String> {
    match content {
        Value::String(text) => Some(text.clone()),
        Value::Array(blocks) => {
            let text: Vec<&str> = blocks
                .iter()
                .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|block| block.get("text").and_then(Value::as_str))
                .collect();
            (!text.is_empty()).then(|| text.join("\n"))
        }
        _ => None,
    }
}

fn is_boilerplate(text: &str) -> bool {
    text.contains(CAVEAT_MARKER) || BOILERPLATE_PREFIXES.iter().any(|p| text.starts_with(p))
}

/// First user prompt of a transcript and its timestamp, skipping the
/// caveat and local-command records the CLI injects.
pub fn extract_first_user_message(path: &Path) -> (Option<String>, Option<String>) {
    let Ok(file) = fs::File::open(path) else {
        return (None, None);
    };
    for line in BufReader::new(file).lines().map_while(Result::ok) {
        let Ok(entry) = serde_json::from_str::<TranscriptEntry>(&line) else {
            continue;
        };
        let Some(message) = entry.message else {
            continue;
        };
        if message.role.as_deref() != Some("user") {
            continue;
        }
        let Some(text) = message.content.as_ref().and_then(message_text) else {
            continue;
        };
        if is_boilerplate(&text) {
            continue;
        }
        return (Some(text), entry.timestamp);
    }
    (None, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_lines(path: &Path, lines: &[&str]) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, lines.join("\n")).unwrap();
    }

    #[test]
    fn test_first_message_skips_boilerplate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.jsonl");
        write_lines(
            &path,
            &[
                r#"{"message":{"role":"user","content":"Caveat: The messages below were generated by the user while running local commands. DO NOT respond."},"timestamp":"t1"}"#,
                r#"{"message":{"role":"user","content":"<command-name>ls</command-name>"},"timestamp":"t2"}"#,
                r#"{"message":{"role":"assistant","content":"hi"},"timestamp":"t2b"}"#,
                r#"{"message":{"role":"user","content":"hello"},"timestamp":"t3"}"#,
            ],
        );

        let (message, timestamp) = extract_first_user_message(&path);
        assert_eq!(message.as_deref(), Some("hello"));
        assert_eq!(timestamp.as_deref(), Some("t3"));
    }

    #[test]
    fn test_first_message_from_text_blocks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.jsonl");
        write_lines(
            &path,
            &[r#"{"message":{"role":"user","content":[{"type":"text","text":"fix it"}]}}"#],
        );
        assert_eq!(extract_first_user_message(&path).0.as_deref(), Some("fix it"));
    }

    #[test]
    fn test_unsafe_ids_are_rejected() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            list_project_sessions(dir.path(), "../etc"),
            Err(HistoryError::UnsafeId { .. })
        ));
        assert!(matches!(
            read_session_transcript(dir.path(), "proj", "a/b"),
            Err(HistoryError::UnsafeId { .. })
        ));
        assert!(matches!(
            read_session_transcript(dir.path(), "", "abc"),
            Err(HistoryError::UnsafeId { .. })
        ));
    }

    #[test]
    fn test_missing_root_is_empty() {
        let dir = tempdir().unwrap();
        assert!(list_projects(&dir.path().join("none")).unwrap().is_empty());
    }

    #[test]
    fn test_lists_projects_and_sessions() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        write_lines(
            &root.join("-home-me-repo").join("abc.jsonl"),
            &[
                r#"{"type":"summary"}"#,
                r#"{"cwd":"/home/me/repo","message":{"role":"user","content":"first"},"timestamp":"t"}"#,
            ],
        );
        write_lines(&root.join("-tmp-x").join("def.jsonl"), &["not json"]);
        fs::create_dir_all(root.join("-empty")).unwrap();

        let projects = list_projects(root).unwrap();
        assert_eq!(projects.len(), 3);
        let repo = projects.iter().find(|p| p.id == "-home-me-repo").unwrap();
        assert_eq!(repo.path, "/home/me/repo");
        assert_eq!(repo.sessions, vec!["abc".to_string()]);
        assert!(repo.most_recent_session.is_some());

        let fallback = projects.iter().find(|p| p.id == "-tmp-x").unwrap();
        assert_eq!(fallback.path, "/tmp/x");

        // Projects without transcripts sort last.
        assert_eq!(projects.last().map(|p| p.id.as_str()), Some("-empty"));

        let sessions = list_project_sessions(root, "-home-me-repo").unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].first_message.as_deref(), Some("first"));
        assert_eq!(sessions[0].project_path, "/home/me/repo");
    }

    #[test]
    fn test_transcript_keeps_parseable_lines() {
        let dir = tempdir().unwrap();
        write_lines(
            &dir.path().join("p").join("s.jsonl"),
            &[r#"{"a":1}"#, "garbage", r#"{"b":2}"#],
        );
        let records = read_session_transcript(dir.path(), "p", "s").unwrap();
        assert_eq!(records.len(), 2);

        assert!(matches!(
            read_session_transcript(dir.path(), "p", "missing"),
            Err(HistoryError::NotFound(_))
        ));
    }

    #[test]
    fn test_missing_project_is_not_found() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            list_project_sessions(dir.path(), "nope"),
            Err(HistoryError::NotFound(_))
        ));
    }
}
