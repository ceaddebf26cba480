//! Executor adapter – one model turn, one [`Action`].
//!
//! Each iteration the orchestrator hands the adapter a fully assembled
//! [`ExecutorTurn`]: the tagged screenshot, the compact plan view, the loop
//! state, the pruned accessibility summary, and the overlay tag manifest.
//! The model is given four tools (`computer`, `shell`, `notebook`,
//! `browser`) and must call exactly one. The first tool call is mapped to a
//! normalised [`Action`]; a text-only reply means the model is done and maps
//! to `noop`; malformed tool arguments also collapse to `noop` carrying the
//! raw payload snippet so the trace explains itself.

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{info, warn};

use cua_types::{Action, DisplayInfo, OverlayTag, Plan, Settings, Step};

use crate::llm::{ChatMessage, ChatOptions, LlmClient, ResponseMessage};

// ─────────────────────────────────────────────────────────────────────────────
// Turn inputs
// ─────────────────────────────────────────────────────────────────────────────

/// Loop-state digest surfaced to the model each turn.
#[derive(Debug, Clone, Default)]
pub struct LoopState {
    pub current_step_id: Option<i64>,
    pub current_step_status: Option<String>,
    pub failure_count: u32,
    pub steps_taken: u32,
    pub repeat_same_action: u32,
    pub repeat_without_change: u32,
    pub notebook_summary: String,
}

/// Repeat warning and optional unblock hint carried between iterations.
#[derive(Debug, Clone, Default)]
pub struct RepeatInfo {
    pub count: u32,
    pub action: String,
    pub hint: Option<String>,
}

/// Everything the executor needs for one proposal.
#[derive(Debug, Clone, Default)]
pub struct ExecutorTurn {
    /// Screenshot with Set-of-Mark tags drawn, base64-encoded.
    pub frame_b64: String,
    pub user_prompt: String,
    /// Most recent history lines (newest last).
    pub history_tail: Vec<String>,
    pub plan: Option<Plan>,
    pub current_step: Option<Step>,
    pub loop_state: LoopState,
    /// Pruned accessibility-tree outline, when semantic grounding is on.
    pub ax_summary: Option<String>,
    /// Numbered overlay tags matching the drawn marks.
    pub tags: Vec<OverlayTag>,
    pub repeat_info: Option<RepeatInfo>,
}

/// The executor seam: the production adapter calls the model; tests script
/// the returned actions directly.
#[async_trait]
pub trait Executor: Send {
    async fn propose_action(&mut self, turn: ExecutorTurn) -> Action;
}

// ─────────────────────────────────────────────────────────────────────────────
// Tool schemas
// ─────────────────────────────────────────────────────────────────────────────

fn computer_tool() -> Value {
    json!({
        "type": "function",
        "function": {
            "name": "computer",
            "description": "Control the desktop: move and click the mouse, drag, type, press hotkeys, scroll, wait, open apps, use the clipboard, run a saved skill, request a screenshot, or inspect/probe the UI tree. Supply either x/y in logical points or element_id from the numbered marks. Pass an `actions` array to run a short macro in one turn.",
            "parameters": {
                "type": "object",
                "properties": {
                    "action": {
                        "type": "string",
                        "enum": [
                            "move_mouse", "left_click", "right_click", "double_click",
                            "drag_and_drop", "select_area", "hover", "scroll", "type",
                            "hotkey", "wait", "screenshot", "open_app", "inspect_ui",
                            "probe_ui", "clipboard", "run_skill", "macro_actions"
                        ]
                    },
                    "x": {"type": "number", "description": "X coordinate in logical points."},
                    "y": {"type": "number", "description": "Y coordinate in logical points."},
                    "target_x": {"type": "number", "description": "Drag/selection target X."},
                    "target_y": {"type": "number", "description": "Drag/selection target Y."},
                    "element_id": {"type": "integer", "description": "Numbered overlay mark to act on instead of coordinates."},
                    "scroll_y": {"type": "number", "description": "Vertical scroll amount (positive up, negative down)."},
                    "axis": {"type": "string", "enum": ["vertical", "horizontal"]},
                    "text": {"type": "string", "description": "Text to type."},
                    "keys": {"type": "array", "items": {"type": "string"}, "description": "Hotkey combo, e.g. ['cmd','space']."},
                    "seconds": {"type": "number", "description": "Seconds to wait for the 'wait' action."},
                    "app_name": {"type": "string", "description": "Application to open (for 'open_app')."},
                    "radius": {"type": "number", "description": "Probe radius for 'probe_ui'."},
                    "op": {"type": "string", "enum": ["read", "write", "clear"], "description": "Clipboard operation."},
                    "content": {"type": "string", "description": "Clipboard content for 'write'."},
                    "skill_id": {"type": "string"},
                    "skill_name": {"type": "string"},
                    "phantom_mode": {"type": "boolean", "description": "Prefer the accessibility API over physical input."},
                    "verify_after": {"type": "boolean", "description": "Set false for deliberately invisible actions."},
                    "actions": {"type": "array", "items": {"type": "object"}, "description": "Sub-actions for a macro; must not nest."}
                },
                "required": ["action"],
                "additionalProperties": false
            }
        }
    })
}

fn shell_tool() -> Value {
    json!({
        "type": "function",
        "function": {
            "name": "shell",
            "description": "Run safe, sandboxed shell commands in a constrained workspace. Use this for local file operations or running short scripts.",
            "parameters": {
                "type": "object",
                "properties": {
                    "command": {"type": "string", "description": "Full command line, e.g. 'ls -la'."},
                    "cwd": {"type": "string", "description": "Optional relative working directory under the agent workspace."}
                },
                "required": ["command"],
                "additionalProperties": false
            }
        }
    })
}

fn notebook_tool() -> Value {
    json!({
        "type": "function",
        "function": {
            "name": "notebook",
            "description": "Manage a persistent notebook for storing research notes, facts, and data across steps.",
            "parameters": {
                "type": "object",
                "properties": {
                    "action": {"type": "string", "enum": ["add_note", "clear_notes"]},
                    "content": {"type": "string", "description": "The note content to save."},
                    "source": {"type": "string", "description": "Source of the info (e.g. a URL or 'user')."}
                },
                "required": ["action"]
            }
        }
    })
}

fn browser_tool() -> Value {
    json!({
        "type": "function",
        "function": {
            "name": "browser",
            "description": "Interact with the browser semantically: read content and links, inspect the DOM, fill forms, click elements, navigate, without OCR.",
            "parameters": {
                "type": "object",
                "properties": {
                    "command": {
                        "type": "string",
                        "enum": [
                            "navigate", "get_page_content", "get_links", "get_dom_tree",
                            "fill_form", "click_element", "run_javascript",
                            "go_back", "go_forward", "reload"
                        ]
                    },
                    "app_name": {"type": "string", "description": "Browser to target."},
                    "url": {"type": "string", "description": "URL for 'navigate'."},
                    "selector": {"type": "string", "description": "CSS selector for element commands."},
                    "value": {"type": "string", "description": "Value for 'fill_form'."},
                    "script": {"type": "string", "description": "JavaScript for 'run_javascript'."}
                },
                "required": ["command"]
            }
        }
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// ExecutorAdapter
// ─────────────────────────────────────────────────────────────────────────────

/// Production executor backed by an OpenAI-compatible vision model.
///
/// Without a configured client the adapter runs deterministically:
/// `capture_only` on the first turn (to look at the screen), `noop`
/// afterwards, so the stack stays drivable offline.
pub struct ExecutorAdapter {
    client: Option<LlmClient>,
    settings: Settings,
    system_info: String,
    display: DisplayInfo,
}

impl ExecutorAdapter {
    pub fn new(settings: &Settings, system_info: String, display: DisplayInfo) -> Self {
        let client = settings.openrouter_api_key.as_ref().map(|key| {
            LlmClient::new(
                settings.openrouter_base_url.clone(),
                key.clone(),
                settings.openrouter_model.clone(),
            )
        });
        if client.is_none() {
            info!("executor running without a model client; deterministic stub mode");
        }
        Self {
            client,
            settings: settings.clone(),
            system_info,
            display,
        }
    }

    fn build_system_prompt(&self, turn: &ExecutorTurn) -> String {
        let plan_text = match (&turn.plan, &turn.current_step) {
            (Some(plan), Some(step)) => {
                let mut text = format!(
                    "Current goal:\n- Step {}: {}\n- Success criteria: {}\n",
                    step.id, step.description, step.success_criteria
                );
                if !step.expected_state.is_empty() {
                    text.push_str(&format!("- Expected state: {}\n", step.expected_state));
                }
                let upcoming: Vec<String> = plan
                    .steps
                    .iter()
                    .filter(|s| s.id != step.id)
                    .take(4)
                    .map(|s| format!("- Step {}: {} (status={})", s.id, s.description, s.status.as_str()))
                    .collect();
                if !upcoming.is_empty() {
                    text.push_str("Upcoming steps (context only):\n");
                    text.push_str(&upcoming.join("\n"));
                }
                text
            }
            (Some(plan), None) => format!("Plan:\n{}", plan.summary_line()),
            _ => "No structured plan; infer progress from the user's request.".to_string(),
        };

        let mut loop_state_text = String::new();
        if !turn.loop_state.notebook_summary.is_empty() {
            loop_state_text.push_str(&format!("\n{}\n", turn.loop_state.notebook_summary));
        }
        loop_state_text.push_str(&format!(
            "Loop state: step_id={}, step_status={}, failures={}, steps_taken={}, repeat_same_action={}, repeat_without_change={}",
            turn.loop_state
                .current_step_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".into()),
            turn.loop_state.current_step_status.as_deref().unwrap_or("-"),
            turn.loop_state.failure_count,
            turn.loop_state.steps_taken,
            turn.loop_state.repeat_same_action,
            turn.loop_state.repeat_without_change,
        ));

        let ax_text = match &turn.ax_summary {
            Some(summary) if !summary.is_empty() => {
                format!("\nFocused window (accessibility outline):\n{summary}\n")
            }
            _ => String::new(),
        };

        let marks_text = if turn.tags.is_empty() {
            String::new()
        } else {
            let lines: Vec<String> = turn
                .tags
                .iter()
                .map(|tag| {
                    format!(
                        "#{} {} '{}' at [{:.0},{:.0} {:.0}x{:.0}]",
                        tag.id, tag.role, tag.label, tag.frame.x, tag.frame.y, tag.frame.w,
                        tag.frame.h
                    )
                })
                .collect();
            format!(
                "\nNumbered marks on the screenshot (use element_id to target them):\n{}\n",
                lines.join("\n")
            )
        };

        let mut prompt = format!(
            "You are a cautious, focused desktop operator. Your toolbox:\n\
             - `computer`: low-level mouse/keyboard interaction, UI inspection (`inspect_ui`), clipboard, macros, saved skills.\n\
             - `browser`: high-speed reading and navigation of web pages (use this for research).\n\
             - `notebook`: save facts and notes to persistent memory (use this to avoid forgetting things).\n\
             - `shell`: local workspace file operations.\n\n\
             At each step you see a single screenshot of the current display plus a short textual history of previous actions and observations.\n\
             {plan_text}\n{loop_state_text}\n{ax_text}{marks_text}\n\
             Planning & Thinking\n\
             - Always reason from what is currently visible: windows, icons, menus.\n\
             - Use `inspect_ui` if visual elements are ambiguous or you need hidden controls.\n\
             - Prefer element_id over raw coordinates when a numbered mark covers the target.\n\
             - For research: read with `browser`, then SAVE key findings with `notebook` (add_note).\n\n\
             Environment\n\
             - System: {system_info}\n\
             - Logical display: {width}x{height} points, (0, 0) at top-left.\n\n\
             Safety\n\
             - No destructive actions.\n\
             - No network access via shell (use the browser tool).\n\
             - `shell` is sandboxed.\n\n\
             Action Selection\n\
             - ONE tool call per step.\n\
             - Prefer `browser` over pixel-reading for text-heavy web tasks.\n\
             - Prefer `inspect_ui` over guessing coordinates.\n\n\
             Recent events:\n{history}",
            plan_text = plan_text,
            loop_state_text = loop_state_text,
            ax_text = ax_text,
            marks_text = marks_text,
            system_info = self.system_info,
            width = self.display.logical_width,
            height = self.display.logical_height,
            history = turn.history_tail.join("\n"),
        );

        if let Some(repeat) = &turn.repeat_info {
            if repeat.count >= 2 {
                prompt.push_str(&format!(
                    " Warning: last action repeated {} times ({}); choose a different next action.",
                    repeat.count, repeat.action
                ));
            }
            if let Some(hint) = &repeat.hint {
                prompt.push_str(&format!(" Hint from verifier: {hint}."));
            }
        }

        prompt
    }

    fn reasoning_options(&self) -> Option<Value> {
        if let Some(effort) = &self.settings.reasoning_effort {
            return Some(json!({"effort": effort}));
        }
        self.settings
            .reasoning_max_tokens
            .map(|max_tokens| json!({"max_tokens": max_tokens}))
    }
}

#[async_trait]
impl Executor for ExecutorAdapter {
    async fn propose_action(&mut self, turn: ExecutorTurn) -> Action {
        let Some(client) = &self.client else {
            // Deterministic stub: look once, then stop.
            return if turn.history_tail.is_empty() {
                Action::CaptureOnly {
                    reason: "executor running without a model client".into(),
                }
            } else {
                Action::Noop {
                    reason: "executor running without a model client".into(),
                }
            };
        };

        let system_prompt = self.build_system_prompt(&turn);
        let task_hint = if turn.user_prompt.is_empty() {
            "No explicit user task provided.".to_string()
        } else {
            format!("User request: {}", turn.user_prompt)
        };
        let messages = vec![
            ChatMessage::system(system_prompt),
            ChatMessage::user_with_image(
                format!("{task_hint}\n\nPlan your next action, then call one tool once."),
                self.settings.frame_mime(),
                &turn.frame_b64,
            ),
        ];
        let options = ChatOptions {
            tools: vec![computer_tool(), shell_tool(), notebook_tool(), browser_tool()],
            tool_choice: Some("auto".into()),
            reasoning: self.reasoning_options(),
            ..ChatOptions::default()
        };

        match client.chat(&messages, &options).await {
            Ok(message) => parse_tool_call(&message),
            Err(err) => {
                warn!(error = %err, "executor call failed; falling back to noop");
                Action::Noop {
                    reason: format!("executor request failed: {err}"),
                }
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tool-call parsing
// ─────────────────────────────────────────────────────────────────────────────

/// Map the first tool call of `message` to a normalised [`Action`].
pub fn parse_tool_call(message: &ResponseMessage) -> Action {
    let Some(call) = message.tool_calls.first() else {
        // A text-only reply is the model's way of saying it is done.
        return Action::Noop {
            reason: "model returned text".into(),
        };
    };

    let args: Value = match serde_json::from_str(&call.function.arguments) {
        Ok(args) => args,
        Err(_) => {
            return Action::Noop {
                reason: format!("bad tool args: {}", snippet(&call.function.arguments)),
            };
        }
    };

    match call.function.name.as_str() {
        "computer" => map_computer_args(&args),
        "shell" => map_shell_args(&args),
        "notebook" => map_notebook_args(&args),
        "browser" => map_browser_args(&args),
        other => Action::Noop {
            reason: format!("unknown tool {other}"),
        },
    }
}

fn snippet(raw: &str) -> String {
    let mut out: String = raw.chars().take(120).collect();
    if out.len() < raw.len() {
        out.push('…');
    }
    out
}

/// Translate the `computer` tool dialect into the wire [`Action`] format:
/// the `action` selector becomes the `type` tag, with a few friendly
/// aliases (`move_mouse`, `hotkey`, `screenshot`, `clipboard`, `scroll_y`).
fn map_computer_args(args: &Value) -> Action {
    let Some(kind) = args.get("action").and_then(|a| a.as_str()) else {
        return Action::Noop {
            reason: format!("computer call missing action: {}", snippet(&args.to_string())),
        };
    };

    // Macro turn: map each sub-action through the same translation.
    if kind == "macro_actions" {
        let Some(raw_subs) = args.get("actions").and_then(|a| a.as_array()) else {
            return Action::Noop {
                reason: "macro_actions missing actions array".into(),
            };
        };
        let actions: Vec<Action> = raw_subs.iter().map(map_computer_args).collect();
        return Action::MacroActions {
            actions,
            skill_id: None,
            skill_name: None,
        };
    }

    let mut normalized = args.clone();
    if let Some(map) = normalized.as_object_mut() {
        map.remove("action");
        let tag = match kind {
            "move_mouse" => "mouse_move",
            "hotkey" => "key",
            "screenshot" => "capture_only",
            "clipboard" => "clipboard_op",
            other => other,
        };
        map.insert("type".into(), json!(tag));
        // `scroll_y` travels as signed wheel clicks.
        if let Some(scroll_y) = map.remove("scroll_y") {
            map.insert(
                "clicks".into(),
                json!(scroll_y.as_f64().unwrap_or(0.0) as i64),
            );
        }
    }

    match serde_json::from_value::<Action>(normalized) {
        Ok(action) => action,
        Err(_) => Action::Noop {
            reason: format!("unknown action {kind}: {}", snippet(&args.to_string())),
        },
    }
}

fn map_shell_args(args: &Value) -> Action {
    let command = args
        .get("command")
        .and_then(|c| c.as_str())
        .unwrap_or_default();
    if command.is_empty() {
        return Action::Noop {
            reason: "shell command missing".into(),
        };
    }
    Action::SandboxShell {
        cmd: command.to_string(),
        cwd: args
            .get("cwd")
            .and_then(|c| c.as_str())
            .map(str::to_string),
        verify_after: None,
    }
}

fn map_notebook_args(args: &Value) -> Action {
    let op = match args.get("action").and_then(|a| a.as_str()) {
        Some("add_note") => cua_types::NotebookCommand::AddNote,
        Some("clear_notes") => cua_types::NotebookCommand::ClearNotes,
        other => {
            return Action::Noop {
                reason: format!("unknown notebook op {other:?}"),
            };
        }
    };
    Action::NotebookOp {
        op,
        content: args
            .get("content")
            .and_then(|c| c.as_str())
            .unwrap_or_default()
            .to_string(),
        source: args
            .get("source")
            .and_then(|s| s.as_str())
            .unwrap_or("agent")
            .to_string(),
    }
}

fn map_browser_args(args: &Value) -> Action {
    let command = match args
        .get("command")
        .and_then(|c| c.as_str())
        .map(|c| serde_json::from_value::<cua_types::BrowserCommand>(json!(c)))
    {
        Some(Ok(command)) => command,
        _ => {
            return Action::Noop {
                reason: format!("unknown browser command: {}", snippet(&args.to_string())),
            };
        }
    };
    let get = |key: &str| {
        args.get(key)
            .and_then(|v| v.as_str())
            .map(str::to_string)
    };
    Action::BrowserOp {
        command,
        app_name: get("app_name"),
        url: get("url"),
        selector: get("selector"),
        value: get("value"),
        script: get("script"),
        verify_after: None,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ToolCall, ToolFunction};
    use cua_types::{BrowserCommand, NotebookCommand, ScrollAxis};

    fn tool_message(name: &str, arguments: &str) -> ResponseMessage {
        ResponseMessage {
            content: None,
            tool_calls: vec![ToolCall {
                id: "call_1".into(),
                function: ToolFunction {
                    name: name.into(),
                    arguments: arguments.into(),
                },
            }],
        }
    }

    #[test]
    fn text_reply_maps_to_noop() {
        let message = ResponseMessage {
            content: Some(serde_json::json!("all done")),
            tool_calls: vec![],
        };
        let action = parse_tool_call(&message);
        assert!(matches!(action, Action::Noop { reason } if reason == "model returned text"));
    }

    #[test]
    fn bad_json_args_map_to_noop_with_snippet() {
        let message = tool_message("computer", "{not json");
        let action = parse_tool_call(&message);
        assert!(matches!(action, Action::Noop { reason } if reason.contains("{not json")));
    }

    #[test]
    fn left_click_maps_with_coordinates() {
        let message = tool_message("computer", r#"{"action":"left_click","x":100,"y":200}"#);
        let action = parse_tool_call(&message);
        assert_eq!(
            action,
            Action::LeftClick {
                x: Some(100.0),
                y: Some(200.0),
                element_id: None,
                phantom_mode: None,
                verify_after: None,
            }
        );
    }

    #[test]
    fn element_id_reference_survives_mapping() {
        let message = tool_message("computer", r#"{"action":"left_click","element_id":4}"#);
        let action = parse_tool_call(&message);
        assert!(matches!(
            action,
            Action::LeftClick {
                element_id: Some(4),
                ..
            }
        ));
    }

    #[test]
    fn hotkey_alias_maps_to_key() {
        let message = tool_message("computer", r#"{"action":"hotkey","keys":["cmd","space"]}"#);
        let action = parse_tool_call(&message);
        assert_eq!(
            action,
            Action::Key {
                keys: vec!["cmd".into(), "space".into()],
                verify_after: None,
            }
        );
    }

    #[test]
    fn screenshot_alias_maps_to_capture_only() {
        let message = tool_message("computer", r#"{"action":"screenshot"}"#);
        assert!(matches!(
            parse_tool_call(&message),
            Action::CaptureOnly { .. }
        ));
    }

    #[test]
    fn scroll_y_maps_to_clicks() {
        let message = tool_message("computer", r#"{"action":"scroll","scroll_y":-3}"#);
        let action = parse_tool_call(&message);
        assert_eq!(
            action,
            Action::Scroll {
                clicks: -3,
                axis: ScrollAxis::Vertical,
                verify_after: None,
            }
        );
    }

    #[test]
    fn unknown_computer_action_maps_to_noop() {
        let message = tool_message("computer", r#"{"action":"teleport"}"#);
        assert!(matches!(
            parse_tool_call(&message),
            Action::Noop { reason } if reason.contains("teleport")
        ));
    }

    #[test]
    fn macro_turn_maps_each_sub_action() {
        let message = tool_message(
            "computer",
            r#"{"action":"macro_actions","actions":[
                {"action":"left_click","x":1,"y":2},
                {"action":"type","text":"hello"},
                {"action":"hotkey","keys":["enter"]}
            ]}"#,
        );
        let action = parse_tool_call(&message);
        let Action::MacroActions { actions, .. } = action else {
            panic!("expected macro");
        };
        assert_eq!(actions.len(), 3);
        assert_eq!(actions[0].kind(), "left_click");
        assert_eq!(actions[1].kind(), "type");
        assert_eq!(actions[2].kind(), "key");
    }

    #[test]
    fn shell_tool_maps_to_sandbox_shell() {
        let message = tool_message("shell", r#"{"command":"ls -la","cwd":"docs"}"#);
        let action = parse_tool_call(&message);
        assert_eq!(
            action,
            Action::SandboxShell {
                cmd: "ls -la".into(),
                cwd: Some("docs".into()),
                verify_after: None,
            }
        );
    }

    #[test]
    fn empty_shell_command_maps_to_noop() {
        let message = tool_message("shell", r#"{"command":""}"#);
        assert!(matches!(parse_tool_call(&message), Action::Noop { .. }));
    }

    #[test]
    fn notebook_tool_maps_with_default_source() {
        let message = tool_message("notebook", r#"{"action":"add_note","content":"x = 4"}"#);
        let action = parse_tool_call(&message);
        assert_eq!(
            action,
            Action::NotebookOp {
                op: NotebookCommand::AddNote,
                content: "x = 4".into(),
                source: "agent".into(),
            }
        );
    }

    #[test]
    fn browser_tool_maps_command_enum() {
        let message = tool_message(
            "browser",
            r#"{"command":"navigate","url":"https://example.com"}"#,
        );
        let action = parse_tool_call(&message);
        assert!(matches!(
            action,
            Action::BrowserOp {
                command: BrowserCommand::Navigate,
                url: Some(url),
                ..
            } if url == "https://example.com"
        ));
    }

    #[test]
    fn unknown_tool_maps_to_noop() {
        let message = tool_message("teleporter", "{}");
        assert!(matches!(
            parse_tool_call(&message),
            Action::Noop { reason } if reason.contains("teleporter")
        ));
    }

    #[tokio::test]
    async fn stub_mode_looks_first_then_stops() {
        let mut adapter = ExecutorAdapter::new(
            &Settings::default(),
            "test".into(),
            DisplayInfo::default(),
        );
        let first = adapter.propose_action(ExecutorTurn::default()).await;
        assert!(matches!(first, Action::CaptureOnly { .. }));

        let second = adapter
            .propose_action(ExecutorTurn {
                history_tail: vec!["observation".into()],
                ..ExecutorTurn::default()
            })
            .await;
        assert!(matches!(second, Action::Noop { .. }));
    }

    #[test]
    fn system_prompt_includes_plan_marks_and_hint() {
        let adapter = ExecutorAdapter::new(
            &Settings::default(),
            "test-system".into(),
            DisplayInfo::default(),
        );
        let plan = Plan::new(
            "p1",
            "open calculator",
            vec![Step::new(0, "Open calculator", "Calculator visible")],
        );
        let step = plan.current_step().cloned();
        let turn = ExecutorTurn {
            plan: Some(plan),
            current_step: step,
            tags: vec![cua_types::OverlayTag {
                id: 1,
                role: "AXButton".into(),
                label: "OK".into(),
                frame: cua_types::Frame::new(5.0, 5.0, 40.0, 20.0),
            }],
            repeat_info: Some(RepeatInfo {
                count: 3,
                action: "left_click".into(),
                hint: Some("try the dock icon".into()),
            }),
            ..ExecutorTurn::default()
        };
        let prompt = adapter.build_system_prompt(&turn);
        assert!(prompt.contains("Step 0: Open calculator"));
        assert!(prompt.contains("#1 AXButton 'OK'"));
        assert!(prompt.contains("repeated 3 times"));
        assert!(prompt.contains("try the dock icon"));
        assert!(prompt.contains("test-system"));
    }

    #[test]
    fn tool_schemas_are_well_formed() {
        for tool in [computer_tool(), shell_tool(), notebook_tool(), browser_tool()] {
            assert_eq!(tool["type"], "function");
            assert!(tool["function"]["name"].is_string());
            assert!(tool["function"]["parameters"]["properties"].is_object());
        }
    }
}
