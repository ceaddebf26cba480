//! [`StateTracker`] – per-task loop state and halt conditions.
//!
//! One tracker is created per session and owned exclusively by the
//! orchestrator. It accumulates the flat history event log, the executed
//! actions, the observation ring (images off-loaded to temp files to bound
//! memory), the agent-writable notebook, stuck reasons, and the counters
//! that drive the halt condition:
//!
//! `halt = steps ≥ max_steps ∨ failures ≥ max_failures ∨ elapsed ≥ max_wall_clock`
//!
//! Dedup rejections (`"hotkey deduped"`) are deliberately not failures: they
//! are the loop telling itself "no", not the desktop failing.

use std::io::Write as _;
use std::time::Instant;

use serde::Serialize;
use serde_json::json;
use tracing::debug;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use cua_types::{Action, ActionResult, NoteEntry, Observation, Plan};

use cua_memory::EpisodeOutcome;

/// Cap on browser payload text folded into history.
const BROWSER_RESULT_MAX_LEN: usize = 1200;
/// Cap on shell stdout/stderr folded into history.
const SHELL_OUTPUT_MAX_LEN: usize = 500;

/// Final report of one session, returned to the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub steps: u32,
    pub failures: u32,
    pub observations: usize,
    pub runtime_seconds: f64,
    pub stuck_reasons: Vec<String>,
    pub history: Vec<String>,
    pub plan: Option<Plan>,
    pub outcome: Option<EpisodeOutcome>,
}

/// Tracks loop state, history, and termination criteria for one task.
pub struct StateTracker {
    max_steps: u32,
    max_failures: u32,
    max_wall_clock_seconds: Option<u64>,

    pub history: Vec<String>,
    pub actions: Vec<Action>,
    pub observations: Vec<Observation>,
    pub notebook: Vec<NoteEntry>,
    pub stuck_reasons: Vec<String>,
    pub failure_count: u32,
    pub steps: u32,
    started_at: Instant,
    started_at_unix: f64,
}

impl StateTracker {
    pub fn new(max_steps: u32, max_failures: u32, max_wall_clock_seconds: Option<u64>) -> Self {
        Self {
            max_steps,
            max_failures,
            max_wall_clock_seconds,
            history: Vec::new(),
            actions: Vec::new(),
            observations: Vec::new(),
            notebook: Vec::new(),
            stuck_reasons: Vec::new(),
            failure_count: 0,
            steps: 0,
            started_at: Instant::now(),
            started_at_unix: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
        }
    }

    /// UNIX-seconds timestamp of session start, for the episode record.
    pub fn started_at_unix(&self) -> f64 {
        self.started_at_unix
    }

    pub fn runtime_seconds(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    // ── Observations ─────────────────────────────────────────────────────────

    /// Record a capture. The image is decoded and off-loaded to a temp file;
    /// only the path stays in memory. A failed disk write degrades to a
    /// path-less observation rather than an error.
    pub fn record_observation(
        &mut self,
        image_b64: &str,
        changed: bool,
        note: &str,
        phash: Option<String>,
        hash_distance: Option<u32>,
    ) {
        let image_path = BASE64
            .decode(image_b64)
            .ok()
            .and_then(|bytes| {
                let mut file = tempfile::Builder::new()
                    .prefix(&format!("obs_{}_", self.steps))
                    .suffix(".png")
                    .tempfile()
                    .ok()?;
                file.write_all(&bytes).ok()?;
                // Keep the file past the handle; cleanup() removes it at task end.
                file.keep().ok().map(|(_, path)| path)
            });

        self.observations.push(Observation {
            image_path,
            timestamp: chrono::Utc::now(),
            changed_since_last: changed,
            phash,
            hash_distance,
            note: note.to_string(),
        });
    }

    /// Delete every observation image not referenced elsewhere. Called at
    /// task end.
    pub fn cleanup(&mut self) {
        for obs in &mut self.observations {
            if let Some(path) = obs.image_path.take()
                && let Err(err) = std::fs::remove_file(&path)
            {
                debug!(path = %path.display(), error = %err, "observation image already gone");
            }
        }
    }

    // ── Notebook ─────────────────────────────────────────────────────────────

    pub fn add_note(&mut self, content: &str, source: &str) {
        self.notebook.push(NoteEntry {
            content: content.to_string(),
            source: if source.is_empty() { "agent".into() } else { source.to_string() },
            timestamp: chrono::Utc::now(),
        });
        self.history
            .push(format!("notebook: added note from {source}"));
    }

    pub fn clear_notebook(&mut self) {
        self.notebook.clear();
        self.history.push("notebook: cleared".to_string());
    }

    /// Formatted notebook contents for the executor prompt.
    pub fn notebook_summary(&self) -> String {
        if self.notebook.is_empty() {
            return "Notebook is empty.".to_string();
        }
        let mut lines = vec!["Current Notebook Content:".to_string()];
        for (idx, note) in self.notebook.iter().enumerate() {
            lines.push(format!("{}. [{}] {}", idx + 1, note.source, note.content));
        }
        lines.join("\n")
    }

    // ── Actions ──────────────────────────────────────────────────────────────

    /// Record an executed action: a compact summary goes into history, the
    /// step counter advances, and real failures count toward the halt bound.
    pub fn record_action(&mut self, action: &Action, result: &ActionResult) {
        self.actions.push(action.clone());

        let summary = action_summary(action, result);
        self.history.push(format!("action:{summary}"));

        if let Some(line) = summarize_browser_result(action, result) {
            self.history.push(line);
        }
        for line in summarize_shell_output(action, result) {
            self.history.push(line);
        }

        self.steps += 1;
        if !result.success && result.reason != "hotkey deduped" {
            self.failure_count += 1;
        }
    }

    pub fn record_stuck(&mut self, reason: &str) {
        self.stuck_reasons.push(reason.to_string());
        self.history.push(format!("stuck:{reason}"));
    }

    // ── Halting ──────────────────────────────────────────────────────────────

    /// Whether any halt bound has been reached.
    pub fn should_halt(&self) -> bool {
        if self.max_steps > 0 && self.steps >= self.max_steps {
            return true;
        }
        if self.max_failures > 0 && self.failure_count >= self.max_failures {
            return true;
        }
        if let Some(limit) = self.max_wall_clock_seconds
            && self.started_at.elapsed().as_secs() >= limit
        {
            return true;
        }
        false
    }

    /// Snapshot for the end-of-session report. Plan and outcome are filled
    /// by the orchestrator.
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            steps: self.steps,
            failures: self.failure_count,
            observations: self.observations.len(),
            runtime_seconds: self.runtime_seconds(),
            stuck_reasons: self.stuck_reasons.clone(),
            history: self.history.clone(),
            plan: None,
            outcome: None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// History formatting helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Compact single-line action record for the history log.
fn action_summary(action: &Action, result: &ActionResult) -> String {
    let mut summary = json!({
        "type": action.kind(),
        "success": result.success,
        "reason": result.reason,
    });
    let extra = match action {
        Action::Key { keys, .. } => json!({"keys": keys}),
        Action::Type { text, .. } => json!({"text": text}),
        Action::SandboxShell { cmd, .. } => json!({"cmd": cmd}),
        Action::OpenApp { app_name, .. } => json!({"app_name": app_name}),
        Action::BrowserOp { command, .. } => json!({"command": command.as_str()}),
        _ => json!({}),
    };
    if let (Some(target), Some(source)) = (summary.as_object_mut(), extra.as_object()) {
        for (key, value) in source {
            target.insert(key.clone(), value.clone());
        }
        if let Some((x, y)) = action.source_point() {
            target.insert("x".into(), json!(x));
            target.insert("y".into(), json!(y));
        }
    }
    summary.to_string()
}

/// Fold browser tool output into history so the executor can read it on the
/// next turn; large payloads are truncated to protect the prompt budget.
fn summarize_browser_result(action: &Action, result: &ActionResult) -> Option<String> {
    let Action::BrowserOp { command, .. } = action else {
        return None;
    };

    let mut payload = result
        .metadata
        .get("data")
        .or_else(|| result.metadata.get("raw"))
        .or_else(|| result.metadata.get("output"))?
        .clone();
    // Unwrap the common {"result": ...} envelope from browser drivers.
    if let Some(inner) = payload.get("result") {
        payload = inner.clone();
    }

    let text = match payload {
        serde_json::Value::String(text) => text,
        other => other.to_string(),
    };
    let truncated = if text.chars().count() > BROWSER_RESULT_MAX_LEN {
        let head: String = text.chars().take(BROWSER_RESULT_MAX_LEN).collect();
        format!("{head}... [truncated]")
    } else {
        text
    };

    Some(format!("browser_result:{}:{truncated}", command.as_str()))
}

/// Surface sandboxed-shell stdout/stderr in history.
fn summarize_shell_output(action: &Action, result: &ActionResult) -> Vec<String> {
    let Action::SandboxShell { .. } = action else {
        return Vec::new();
    };
    let mut lines = Vec::new();
    for (key, label) in [("stdout", "shell_stdout"), ("stderr", "shell_stderr")] {
        if let Some(text) = result.metadata.get(key).and_then(|v| v.as_str()) {
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                let capped: String = trimmed.chars().take(SHELL_OUTPUT_MAX_LEN).collect();
                lines.push(format!("{label}:{capped}"));
            }
        }
    }
    lines
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use cua_types::BrowserCommand;

    fn tracker() -> StateTracker {
        StateTracker::new(50, 5, None)
    }

    fn click() -> Action {
        Action::LeftClick {
            x: Some(10.0),
            y: Some(20.0),
            element_id: None,
            phantom_mode: None,
            verify_after: None,
        }
    }

    #[test]
    fn record_action_advances_steps_and_history() {
        let mut state = tracker();
        state.record_action(&click(), &ActionResult::ok("clicked"));
        assert_eq!(state.steps, 1);
        assert_eq!(state.failure_count, 0);
        assert!(state.history[0].starts_with("action:"));
        assert!(state.history[0].contains("left_click"));
    }

    #[test]
    fn failures_count_except_hotkey_dedup() {
        let mut state = tracker();
        state.record_action(&click(), &ActionResult::fail("driver threw"));
        assert_eq!(state.failure_count, 1);
        state.record_action(&click(), &ActionResult::fail("hotkey deduped"));
        assert_eq!(state.failure_count, 1);
        assert_eq!(state.steps, 2);
    }

    #[test]
    fn halt_on_max_steps() {
        let mut state = StateTracker::new(2, 5, None);
        assert!(!state.should_halt());
        state.record_action(&click(), &ActionResult::ok("ok"));
        state.record_action(&click(), &ActionResult::ok("ok"));
        assert!(state.should_halt());
    }

    #[test]
    fn halt_on_max_failures() {
        let mut state = StateTracker::new(50, 2, None);
        state.record_action(&click(), &ActionResult::fail("x"));
        state.record_action(&click(), &ActionResult::fail("y"));
        assert!(state.should_halt());
    }

    #[test]
    fn halt_on_wall_clock() {
        let state = StateTracker::new(50, 5, Some(0));
        assert!(state.should_halt());
    }

    #[test]
    fn unbounded_wall_clock_does_not_halt() {
        let state = StateTracker::new(50, 5, None);
        assert!(!state.should_halt());
    }

    #[test]
    fn observation_offloads_image_to_disk_and_cleanup_removes_it() {
        let mut state = tracker();
        let image_b64 = BASE64.encode(b"fake image bytes");
        state.record_observation(&image_b64, true, "initial", Some("abcd".into()), None);
        assert_eq!(state.observations.len(), 1);

        let path = state.observations[0].image_path.clone().unwrap();
        assert!(path.exists());
        assert_eq!(std::fs::read(&path).unwrap(), b"fake image bytes");

        state.cleanup();
        assert!(!path.exists());
        assert!(state.observations[0].image_path.is_none());
    }

    #[test]
    fn undecodable_observation_has_no_path() {
        let mut state = tracker();
        state.record_observation("not base64!!", false, "", None, None);
        assert!(state.observations[0].image_path.is_none());
    }

    #[test]
    fn notebook_roundtrip_and_summary() {
        let mut state = tracker();
        assert_eq!(state.notebook_summary(), "Notebook is empty.");
        state.add_note("rust 1.85 released", "browser");
        state.add_note("check the docs", "agent");
        let summary = state.notebook_summary();
        assert!(summary.contains("1. [browser] rust 1.85 released"));
        assert!(summary.contains("2. [agent] check the docs"));
        state.clear_notebook();
        assert_eq!(state.notebook_summary(), "Notebook is empty.");
        assert!(state.history.iter().any(|l| l == "notebook: cleared"));
    }

    #[test]
    fn browser_results_fold_into_history_truncated() {
        let mut state = tracker();
        let action = Action::BrowserOp {
            command: BrowserCommand::GetPageContent,
            app_name: None,
            url: None,
            selector: None,
            value: None,
            script: None,
            verify_after: None,
        };
        let long_payload = "x".repeat(2000);
        let result = ActionResult::ok("read page")
            .with_metadata("data", json!({"result": long_payload}));
        state.record_action(&action, &result);

        let line = state
            .history
            .iter()
            .find(|l| l.starts_with("browser_result:get_page_content:"))
            .unwrap();
        assert!(line.ends_with("... [truncated]"));
        assert!(line.len() < 1300);
    }

    #[test]
    fn shell_output_folds_into_history() {
        let mut state = tracker();
        let action = Action::SandboxShell {
            cmd: "ls".into(),
            cwd: None,
            verify_after: None,
        };
        let result = ActionResult::ok("exit 0")
            .with_metadata("stdout", json!("Cargo.toml\nsrc"))
            .with_metadata("stderr", json!(""));
        state.record_action(&action, &result);
        assert!(state
            .history
            .iter()
            .any(|l| l.starts_with("shell_stdout:Cargo.toml")));
        assert!(!state.history.iter().any(|l| l.starts_with("shell_stderr:")));
    }

    #[test]
    fn record_stuck_appends_reason() {
        let mut state = tracker();
        state.record_stuck("oscillatory_loop");
        assert_eq!(state.stuck_reasons, vec!["oscillatory_loop"]);
        assert!(state.history.iter().any(|l| l == "stuck:oscillatory_loop"));
    }

    #[test]
    fn summary_snapshots_counters() {
        let mut state = tracker();
        state.record_action(&click(), &ActionResult::fail("nope"));
        state.record_stuck("repeat_same_action:3");
        let summary = state.summary();
        assert_eq!(summary.steps, 1);
        assert_eq!(summary.failures, 1);
        assert_eq!(summary.stuck_reasons.len(), 1);
        assert!(summary.plan.is_none());
    }
}
