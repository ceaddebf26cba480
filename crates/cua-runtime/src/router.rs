//! [`ActionRouter`] – policy-gated dispatch from typed actions to drivers.
//!
//! The router is the only path from a proposed [`Action`] to a side effect.
//! For every action it:
//!
//! 1. **Enriches** the policy context with the foreground app, window title,
//!    and (for browser JS) the current page URL.
//! 2. **Consults** the [`PolicyEngine`]; denials and HITL outcomes become
//!    failed results and are never dispatched. In automated mode HITL is
//!    reported as `"human confirmation required"`, never silently executed.
//! 3. **Dispatches** by execution channel: loop-control actions resolve
//!    locally, `wait` sleeps, UI/clipboard/shell/browser actions go to the
//!    computer adapter, macros iterate with first-failure abort, and
//!    `run_skill` replays a stored macro.
//!
//! Two graceful-degradation paths live here: **phantom fallback** (a failed
//! accessibility-API attempt is retried once as physical input) and **Cyborg
//! mode** (browser navigation ops are re-synthesised as HID macros when the
//! DevTools channel is down).

use std::time::Duration;

use serde_json::json;
use tracing::{info, warn};

use cua_computer::Computer;
use cua_kernel::{ActionContext, PolicyEngine, redact_secrets};
use cua_memory::MemoryStore;
use cua_types::{Action, ActionResult, BrowserCommand, ClipboardCommand, Settings};

/// Reason substrings that indicate the DevTools channel is unavailable and
/// Cyborg fallback should engage.
const DEVTOOLS_DOWN_NEEDLES: &[&str] = &[
    "connection refused",
    "connectex",
    "actively refused",
    "timed out",
    "timeout waiting for",
    "websocket upgrade failed",
    "no response",
    "socket closed",
    "no page target found",
    "devtools websocket not connected",
    "cdp websocket not connected",
    "failed to establish a new connection",
];

/// Routes actions through policy evaluation and on to the platform drivers.
pub struct ActionRouter {
    policy: PolicyEngine,
    settings: Settings,
}

impl ActionRouter {
    pub fn new(policy: PolicyEngine, settings: Settings) -> Self {
        Self { policy, settings }
    }

    /// Execute one action. Never panics; every failure is an unsuccessful
    /// [`ActionResult`].
    pub async fn route(
        &self,
        computer: &mut dyn Computer,
        memory: &MemoryStore,
        action: &Action,
    ) -> ActionResult {
        match action {
            Action::MacroActions { actions, .. } => {
                self.route_macro(computer, actions).await
            }
            Action::RunSkill {
                skill_id,
                skill_name,
            } => {
                let reference = skill_id
                    .as_deref()
                    .or(skill_name.as_deref())
                    .unwrap_or_default();
                let Some(skill) = memory.get_skill(reference) else {
                    return ActionResult::fail("skill not found");
                };
                memory.record_skill_usage(&skill.id);
                info!(skill = %skill.name, actions = skill.actions.len(), "replaying skill as macro");
                self.route_macro(computer, &skill.actions).await
            }
            _ => self.route_single(computer, action).await,
        }
    }

    /// Run a macro: sub-actions execute in order, the first failure aborts
    /// the rest, and the overall result reports the failing index. Nested
    /// macros are rejected outright.
    async fn route_macro(
        &self,
        computer: &mut dyn Computer,
        actions: &[Action],
    ) -> ActionResult {
        let mut subresults: Vec<serde_json::Value> = Vec::new();
        for (idx, sub) in actions.iter().enumerate() {
            if matches!(sub, Action::MacroActions { .. } | Action::RunSkill { .. }) {
                subresults.push(json!({
                    "index": idx,
                    "success": false,
                    "reason": "nested macro not allowed",
                }));
                return ActionResult::fail("nested macro not allowed")
                    .with_metadata("failed_index", json!(idx))
                    .with_metadata("subresults", json!(subresults));
            }
            let result = self.route_single(computer, sub).await;
            subresults.push(json!({
                "index": idx,
                "success": result.success,
                "reason": result.reason,
            }));
            if !result.success {
                return ActionResult::fail(format!("macro step {idx} failed: {}", result.reason))
                    .with_metadata("failed_index", json!(idx))
                    .with_metadata("subresults", json!(subresults));
            }
        }
        ActionResult::ok(format!("macro of {} actions completed", actions.len()))
            .with_metadata("subresults", json!(subresults))
    }

    /// Dispatch one non-macro action.
    async fn route_single(&self, computer: &mut dyn Computer, action: &Action) -> ActionResult {
        let ctx = self.enrich_context(computer, action);

        let decision = self.policy.evaluate(action, &ctx);
        if !decision.allowed {
            warn!(kind = action.kind(), reason = %decision.reason, "action blocked by policy");
            return ActionResult::fail(decision.reason);
        }
        if decision.hitl_required {
            warn!(kind = action.kind(), reason = %decision.reason, "action requires human confirmation");
            return ActionResult::fail("human confirmation required");
        }

        match action {
            Action::Noop { reason } | Action::CaptureOnly { reason } => {
                ActionResult::ok(if reason.is_empty() { "noop" } else { reason.as_str() })
            }
            Action::Wait { seconds } => {
                let seconds = seconds.max(0.0);
                tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
                ActionResult::ok(format!("waited {seconds} seconds"))
            }
            Action::InspectUi {} => computer.get_active_window_tree(5),
            Action::ProbeUi { x, y, .. } => {
                if x.is_none() || y.is_none() {
                    return ActionResult::fail("probe_ui requires x,y coordinates");
                }
                computer.execute(action)
            }
            Action::ClipboardOp { op, .. } => {
                let result = computer.execute(action);
                if *op == ClipboardCommand::Read {
                    redact_clipboard_result(result)
                } else {
                    result
                }
            }
            Action::BrowserOp { command, .. } => {
                let result = computer.execute(action);
                if result.success || !self.settings.cyborg_mode {
                    return result;
                }
                if !looks_like_devtools_unavailable(&result.reason) {
                    return result;
                }
                self.cyborg_fallback(computer, action, *command, result).await
            }
            Action::NotebookOp { .. } => {
                // Notebook mutations are the orchestrator's side channel.
                ActionResult::fail("notebook ops are handled by the loop, not a driver")
            }
            _ => self.execute_with_phantom_fallback(computer, action),
        }
    }

    /// Physical-input retry for a failed accessibility-API attempt.
    fn execute_with_phantom_fallback(
        &self,
        computer: &mut dyn Computer,
        action: &Action,
    ) -> ActionResult {
        let result = computer.execute(action);
        if result.success || !action.phantom_mode() {
            return result;
        }

        info!(kind = action.kind(), "phantom attempt failed; falling back to physical input");
        let mut physical = action.clone();
        physical.clear_phantom_mode();
        let retry = computer.execute(&physical);
        if retry.success {
            ActionResult {
                success: true,
                reason: format!("phantom fallback to HID: {}", retry.reason),
                metadata: retry.metadata,
            }
        } else {
            retry
        }
    }

    /// Re-synthesise navigation-class browser ops as HID macros when the
    /// DevTools channel is down. Non-actionable ops (DOM reads, JS) cannot be
    /// synthesised; they are skipped with a marker so the executor retries
    /// via `inspect_ui` and direct input.
    async fn cyborg_fallback(
        &self,
        computer: &mut dyn Computer,
        action: &Action,
        command: BrowserCommand,
        original: ActionResult,
    ) -> ActionResult {
        let macro_actions: Vec<Action> = match command {
            BrowserCommand::Navigate => {
                let Action::BrowserOp { url: Some(url), .. } = action else {
                    return ActionResult::fail("navigate requires url");
                };
                vec![
                    Action::Key {
                        keys: vec!["ctrl".into(), "l".into()],
                        verify_after: None,
                    },
                    Action::Wait { seconds: 0.15 },
                    Action::Type {
                        text: url.clone(),
                        x: None,
                        y: None,
                        element_id: None,
                        phantom_mode: None,
                        verify_after: None,
                    },
                    Action::Key {
                        keys: vec!["enter".into()],
                        verify_after: None,
                    },
                ]
            }
            BrowserCommand::GoBack => vec![Action::Key {
                keys: vec!["alt".into(), "left".into()],
                verify_after: None,
            }],
            BrowserCommand::GoForward => vec![Action::Key {
                keys: vec!["alt".into(), "right".into()],
                verify_after: None,
            }],
            BrowserCommand::Reload => vec![Action::Key {
                keys: vec!["ctrl".into(), "r".into()],
                verify_after: None,
            }],
            other => {
                return ActionResult::ok(format!(
                    "DevTools unavailable; skipped browser.{} (use inspect_ui + direct input)",
                    other.as_str()
                ))
                .with_metadata("devtools_unavailable", json!(true))
                .with_metadata("original_reason", json!(original.reason));
            }
        };

        info!(command = command.as_str(), "DevTools unavailable; running Cyborg macro");
        // The synthesized inputs are internal and carry no coordinates, so
        // they run straight against the adapter rather than re-entering the
        // policy-gated dispatch.
        for (idx, sub) in macro_actions.iter().enumerate() {
            let result = match sub {
                Action::Wait { seconds } => {
                    tokio::time::sleep(Duration::from_secs_f64(seconds.max(0.0))).await;
                    ActionResult::ok("waited")
                }
                other => computer.execute(other),
            };
            if !result.success {
                return ActionResult::fail(format!(
                    "DevTools unavailable; Cyborg {} macro failed at step {idx}: {}",
                    command.as_str(),
                    result.reason
                ));
            }
        }
        ActionResult::ok(format!(
            "DevTools unavailable; {} via Cyborg macro",
            command.as_str()
        ))
        .with_metadata("devtools_unavailable", json!(true))
    }

    /// Ambient context for policy evaluation.
    fn enrich_context(&self, computer: &dyn Computer, action: &Action) -> ActionContext {
        let page_url = match action {
            Action::BrowserOp {
                command: BrowserCommand::RunJavascript,
                ..
            } => computer.current_browser_url(),
            _ => None,
        };
        ActionContext {
            bundle_id: computer.foreground_app(),
            active_window_title: computer.foreground_window_title(),
            page_url,
        }
    }
}

/// Classify a browser-driver failure as "DevTools channel down".
fn looks_like_devtools_unavailable(reason: &str) -> bool {
    let lowered = reason.to_lowercase();
    if lowered.is_empty() {
        return true;
    }
    DEVTOOLS_DOWN_NEEDLES
        .iter()
        .any(|needle| lowered.contains(needle))
}

/// Run the secret redactor over a clipboard-read result.
fn redact_clipboard_result(mut result: ActionResult) -> ActionResult {
    if !result.success {
        return result;
    }
    let Some(content) = result.metadata.get("content").and_then(|v| v.as_str()) else {
        return result;
    };
    let (redacted, cleaned) = redact_secrets(content);
    result.metadata.insert("content".into(), json!(cleaned));
    result.metadata.insert("redacted".into(), json!(redacted));
    if redacted {
        result.reason = "read clipboard (redacted)".to_string();
    }
    result
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
