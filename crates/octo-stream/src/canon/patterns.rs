//! Lexical patterns for the prose the runtime emits about subagents.
//!
//! The `spawn_agent` tool and the subagent extension report in human-readable
//! text. Every grammar this crate understands lives here. A text that matches
//! nothing yields empty fields; callers must never treat a miss as an error.
//!
//! Spawn results:
//!
//! ```text
//! Agent spawned: task-123 — Mock task (tier: fast)
//! Status: running
//! ```
//!
//! with `Task ID: <id>` / `task_id=<id>` accepted as a fallback for the id.
//!
//! Notifications:
//!
//! ```text
//! ✅ Agent completed: task-999
//! <output lines>
//! ❌ Agent failed: task-999
//! Agent task-999 completed
//! ```

use once_cell::sync::Lazy;
use regex::Regex;

use crate::chat::SubagentStatus;

static SPAWNED_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bAgent[ \t]+spawned:[ \t]*([\w][\w.-]*)")
        .expect("Invalid regex pattern for spawned agent id")
});

static TASK_ID_FALLBACK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\btask[_ ]?id["']?[ \t]*[:=][ \t]*["']?([\w][\w.-]*)"#)
        .expect("Invalid regex pattern for task id")
});

static STATUS_WORD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bStatus:[ \t]*([A-Za-z_]+)").expect("Invalid regex pattern for status")
});

static COMPLETED_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:✅[ \t]*)?\bAgent[ \t]+completed:[ \t]*([\w][\w.-]*)")
        .expect("Invalid regex pattern for completed notification")
});

static FAILED_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:❌[ \t]*)?\bAgent[ \t]+failed:[ \t]*([\w][\w.-]*)")
        .expect("Invalid regex pattern for failed notification")
});

static VERDICT_SUFFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bAgent[ \t]+([\w][\w.-]*)[ \t]+(completed|failed)\b")
        .expect("Invalid regex pattern for agent verdict")
});

/// What could be recovered from a `spawn_agent` result text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpawnInfo {
    pub task_id: Option<String>,
    /// Normalised to `running|completed|failed` when recognised, otherwise
    /// the lowercased word as written.
    pub status: Option<String>,
}

/// A completed/failed verdict parsed from a notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub task_id: String,
    pub success: bool,
    /// Text following the verdict line, if any.
    pub output: Option<String>,
}

impl Verdict {
    pub fn status(&self) -> SubagentStatus {
        if self.success {
            SubagentStatus::Completed
        } else {
            SubagentStatus::Failed
        }
    }
}

fn first_capture(re: &Regex, text: &str) -> Option<String> {
    re.captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim_end_matches('.').to_string())
}

/// Normalise a free-form status word.
pub fn normalize_status(word: &str) -> String {
    match SubagentStatus::from_word(word) {
        Some(status) => status.to_string(),
        None => word.trim().to_lowercase(),
    }
}

/// Extract task id and status from a spawn result.
pub fn parse_spawn_result(text: &str) -> SpawnInfo {
    let task_id = first_capture(&SPAWNED_ID, text).or_else(|| first_capture(&TASK_ID_FALLBACK, text));
    let status = first_capture(&STATUS_WORD, text).map(|w| normalize_status(&w));
    SpawnInfo { task_id, status }
}

/// Extract a completion verdict from notification text.
pub fn parse_notification(text: &str) -> Option<Verdict> {
    let (task_id, success) = if let Some(id) = first_capture(&COMPLETED_PREFIX, text) {
        (id, true)
    } else if let Some(id) = first_capture(&FAILED_PREFIX, text) {
        (id, false)
    } else {
        let caps = VERDICT_SUFFIX.captures(text)?;
        let id = caps.get(1)?.as_str().to_string();
        let success = caps.get(2)?.as_str().eq_ignore_ascii_case("completed");
        (id, success)
    };

    let output = text
        .split_once('\n')
        .map(|(_, rest)| rest.trim())
        .filter(|rest| !rest.is_empty())
        .map(str::to_string);

    Some(Verdict {
        task_id,
        success,
        output,
    })
}
