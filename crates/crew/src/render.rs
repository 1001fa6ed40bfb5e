//! Text rendering for session streams and listings.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crew_core::{
    EnqueueOutcome, EventKind, Outcome, SessionSummary, StoredProject, StoredSession, StreamEvent,
};

/// Longest prompt or message shown in one listing cell.
const CELL_WIDTH: usize = 60;

/// One line (or block) of text for an event, `None` for records with
/// nothing worth showing.
pub fn render_event(event: &StreamEvent) -> Option<String> {
    match &event.kind {
        EventKind::Announced { session_id, record } => {
            let model = record.get("model").and_then(Value::as_str);
            Some(match model {
                Some(model) => format!("[session {session_id} - {model}]"),
                None => format!("[session {session_id}]"),
            })
        }
        EventKind::Record { record } => record_text(record),
        EventKind::TurnResult { record } => Some(result_text(record)),
        EventKind::Stderr { line } => Some(format!("stderr: {line}")),
        EventKind::StreamError { message } => Some(format!("[stream error: {message}]")),
        EventKind::PromptQueued { order, prompt } => {
            Some(format!("[queued #{order}] {}", truncate(prompt, CELL_WIDTH)))
        }
        EventKind::PromptStarted { prompt, .. } => Some(format!("> {prompt}")),
        EventKind::Cancelling => Some("[cancelling]".to_string()),
        EventKind::Completed {
            outcome,
            exit_code,
            dropped_prompts,
        } => {
            let mut line = format!("[{}", outcome_label(*outcome));
            if let Some(code) = exit_code {
                line.push_str(&format!(", exit {code}"));
            }
            if *dropped_prompts > 0 {
                line.push_str(&format!(", {dropped_prompts} queued prompt(s) dropped"));
            }
            line.push(']');
            Some(line)
        }
    }
}

fn outcome_label(outcome: Outcome) -> &'static str {
    match outcome {
        Outcome::Success => "done",
        Outcome::Failed => "failed",
        Outcome::Cancelled => "cancelled",
    }
}

/// Assistant text and tool calls of a stream-json record.
fn record_text(record: &Value) -> Option<String> {
    if record.get("type").and_then(Value::as_str) != Some("assistant") {
        return None;
    }
    let content = record.get("message")?.get("content")?;
    if let Some(text) = content.as_str() {
        return Some(text.to_string());
    }

    let parts: Vec<String> = content
        .as_array()?
        .iter()
        .filter_map(|block| match block.get("type").and_then(Value::as_str) {
            Some("text") => block.get("text").and_then(Value::as_str).map(str::to_string),
            Some("tool_use") => {
                let name = block.get("name").and_then(Value::as_str).unwrap_or("tool");
                Some(format!("[tool: {name}]"))
            }
            _ => None,
        })
        .collect();

    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n"))
    }
}

fn result_text(record: &Value) -> String {
    let mut line = String::from("[turn complete");
    if let Some(turns) = record.get("num_turns").and_then(Value::as_u64) {
        line.push_str(&format!(", {turns} turns"));
    }
    if let Some(cost) = record.get("total_cost_usd").and_then(Value::as_f64) {
        line.push_str(&format!(", ${cost:.4}"));
    }
    line.push(']');
    line
}

pub fn render_enqueue(outcome: &EnqueueOutcome) -> String {
    match outcome {
        EnqueueOutcome::Queued { order, position } => {
            format!("Queued prompt #{order} (position {position})")
        }
        EnqueueOutcome::Started {
            order,
            launch_token,
        } => format!("Started prompt #{order} ({launch_token})"),
    }
}

// ============================================================================
// Listings
// ============================================================================

pub fn sessions_header() -> String {
    format!(
        "{:<36}  {:<10}  {:>3}  {:>7}  {:>6}  {:<20}  {}",
        "SESSION", "STATUS", "GEN", "PID", "QUEUE", "PROJECT", "ACTIVE"
    )
}

pub fn session_row(session: &SessionSummary, now: DateTime<Utc>) -> String {
    format!(
        "{:<36}  {:<10}  {:>3}  {:>7}  {:>6}  {:<20}  {}",
        session.display_id(),
        session.status.label(),
        session.generation,
        session.pid.map_or_else(|| "-".to_string(), |p| p.to_string()),
        session.pending_prompts,
        truncate(&session.project.name, 20),
        age(session.last_activity_at, now),
    )
}

pub fn project_row(project: &StoredProject, now: DateTime<Utc>) -> String {
    let recent = project
        .most_recent_session
        .map_or_else(|| "-".to_string(), |t| age(t, now));
    format!(
        "{:<40}  {:>4}  {:>6}  {}",
        truncate(&project.id, 40),
        project.sessions.len(),
        recent,
        project.path
    )
}

pub fn stored_session_row(session: &StoredSession, now: DateTime<Utc>) -> String {
    let first = session
        .first_message
        .as_deref()
        .map(|m| truncate(&m.replace('\n', " "), CELL_WIDTH))
        .unwrap_or_default();
    format!("{:<36}  {:>6}  {}", session.id, age(session.modified_at, now), first)
}

/// Compact age such as `42s`, `5m`, `3h` or `2d`.
pub fn age(then: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - then).num_seconds().max(0);
    match secs {
        0..=59 => format!("{secs}s"),
        60..=3599 => format!("{}m", secs / 60),
        3600..=86_399 => format!("{}h", secs / 3600),
        _ => format!("{}d", secs / 86_400),
    }
}

/// Cuts `text` to `max` characters, marking the cut with `...`.
pub fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let kept: String = text.chars().take(max.saturating_sub(3)).collect();
    format!("{kept}...")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use crew_core::{LaunchToken, SessionId};
    use serde_json::json;

    fn event(kind: EventKind) -> StreamEvent {
        StreamEvent {
            seq: 1,
            launch_token: LaunchToken::new("launch-x"),
            session_id: None,
            timestamp: Utc::now(),
            kind,
        }
    }

    #[test]
    fn test_assistant_text_and_tools() {
        let record = json!({
            "type": "assistant",
            "message": {"content": [
                {"type": "text", "text": "Looking at the tests."},
                {"type": "tool_use", "name": "Bash", "input": {"command": "ls"}},
            ]}
        });
        let text = render_event(&event(EventKind::Record { record })).unwrap();
        assert_eq!(text, "Looking at the tests.\n[tool: Bash]");
    }

    #[test]
    fn test_other_records_are_hidden() {
        let record = json!({"type": "user", "message": {"content": "tool output"}});
        assert_eq!(render_event(&event(EventKind::Record { record })), None);
    }

    #[test]
    fn test_announcement_and_completion() {
        let announced = EventKind::Announced {
            session_id: SessionId::new("abc"),
            record: json!({"model": "claude-sonnet"}),
        };
        assert_eq!(
            render_event(&event(announced)).unwrap(),
            "[session abc - claude-sonnet]"
        );

        let done = EventKind::Completed {
            outcome: Outcome::Cancelled,
            exit_code: None,
            dropped_prompts: 2,
        };
        assert_eq!(
            render_event(&event(done)).unwrap(),
            "[cancelled, 2 queued prompt(s) dropped]"
        );

        let failed = EventKind::Completed {
            outcome: Outcome::Failed,
            exit_code: Some(3),
            dropped_prompts: 0,
        };
        assert_eq!(render_event(&event(failed)).unwrap(), "[failed, exit 3]");
    }

    #[test]
    fn test_result_summary() {
        let record = json!({"type": "result", "num_turns": 4, "total_cost_usd": 0.0123});
        assert_eq!(
            render_event(&event(EventKind::TurnResult { record })).unwrap(),
            "[turn complete, 4 turns, $0.0123]"
        );
    }

    #[test]
    fn test_age() {
        let now = Utc::now();
        assert_eq!(age(now - Duration::seconds(5), now), "5s");
        assert_eq!(age(now - Duration::minutes(7), now), "7m");
        assert_eq!(age(now - Duration::hours(3), now), "3h");
        assert_eq!(age(now - Duration::days(2), now), "2d");
        assert_eq!(age(now + Duration::seconds(5), now), "0s");
    }

    #[test]
    fn test_truncate_is_char_safe() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("ééééééééééé", 6), "ééé...");
    }
}
