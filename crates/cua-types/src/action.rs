//! [`Action`] – the tagged sum type covering every input the agent can issue.
//!
//! The executor LLM produces exactly one action per turn (possibly a
//! [`Action::MacroActions`] batch); the router dispatches each variant to the
//! channel that can execute it. Coordinates are logical points with the
//! origin at the top-left of the primary display. A pointer variant supplies
//! either `(x, y)` or an `element_id` referring to a numbered overlay tag
//! from the most recent capture; unresolved references are a routing error,
//! not a panic.
//!
//! Unknown action payloads collapse to [`Action::Noop`] at parse time (the
//! executor adapter performs the fallback), so a confused model can never
//! crash the loop.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Sub-command enums
// ─────────────────────────────────────────────────────────────────────────────

/// Scroll direction for [`Action::Scroll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScrollAxis {
    #[default]
    Vertical,
    Horizontal,
}

/// Clipboard operation selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ClipboardCommand {
    Read,
    Write,
    Clear,
}

/// Browser channel commands (DevTools-backed, with HID fallback in Cyborg
/// mode for the navigation subset).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BrowserCommand {
    Navigate,
    GetPageContent,
    GetLinks,
    GetDomTree,
    FillForm,
    ClickElement,
    RunJavascript,
    GoBack,
    GoForward,
    Reload,
}

impl BrowserCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrowserCommand::Navigate => "navigate",
            BrowserCommand::GetPageContent => "get_page_content",
            BrowserCommand::GetLinks => "get_links",
            BrowserCommand::GetDomTree => "get_dom_tree",
            BrowserCommand::FillForm => "fill_form",
            BrowserCommand::ClickElement => "click_element",
            BrowserCommand::RunJavascript => "run_javascript",
            BrowserCommand::GoBack => "go_back",
            BrowserCommand::GoForward => "go_forward",
            BrowserCommand::Reload => "reload",
        }
    }
}

/// Notebook (working memory) operation selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum NotebookCommand {
    AddNote,
    ClearNotes,
}

// ─────────────────────────────────────────────────────────────────────────────
// Action
// ─────────────────────────────────────────────────────────────────────────────

/// A single agent-issued action.
///
/// Serialises with an external `"type"` tag in snake_case, matching the tool
/// payloads exchanged with the executor model and the on-disk skill format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    MouseMove {
        #[serde(default)]
        x: Option<f64>,
        #[serde(default)]
        y: Option<f64>,
        #[serde(default)]
        element_id: Option<u32>,
    },
    LeftClick {
        #[serde(default)]
        x: Option<f64>,
        #[serde(default)]
        y: Option<f64>,
        #[serde(default)]
        element_id: Option<u32>,
        #[serde(default)]
        phantom_mode: Option<bool>,
        #[serde(default)]
        verify_after: Option<bool>,
    },
    RightClick {
        #[serde(default)]
        x: Option<f64>,
        #[serde(default)]
        y: Option<f64>,
        #[serde(default)]
        element_id: Option<u32>,
        #[serde(default)]
        phantom_mode: Option<bool>,
        #[serde(default)]
        verify_after: Option<bool>,
    },
    DoubleClick {
        #[serde(default)]
        x: Option<f64>,
        #[serde(default)]
        y: Option<f64>,
        #[serde(default)]
        element_id: Option<u32>,
        #[serde(default)]
        phantom_mode: Option<bool>,
        #[serde(default)]
        verify_after: Option<bool>,
    },
    DragAndDrop {
        #[serde(default)]
        x: Option<f64>,
        #[serde(default)]
        y: Option<f64>,
        #[serde(default)]
        element_id: Option<u32>,
        #[serde(default)]
        target_x: Option<f64>,
        #[serde(default)]
        target_y: Option<f64>,
        /// Drag duration in seconds.
        #[serde(default)]
        duration: Option<f64>,
        /// Pause after the initial press before moving, in seconds.
        #[serde(default)]
        hold_delay: Option<f64>,
        #[serde(default)]
        verify_after: Option<bool>,
    },
    SelectArea {
        #[serde(default)]
        x: Option<f64>,
        #[serde(default)]
        y: Option<f64>,
        #[serde(default)]
        element_id: Option<u32>,
        #[serde(default)]
        target_x: Option<f64>,
        #[serde(default)]
        target_y: Option<f64>,
        #[serde(default)]
        duration: Option<f64>,
        #[serde(default)]
        hold_delay: Option<f64>,
        #[serde(default)]
        verify_after: Option<bool>,
    },
    Hover {
        #[serde(default)]
        x: Option<f64>,
        #[serde(default)]
        y: Option<f64>,
        #[serde(default)]
        element_id: Option<u32>,
        #[serde(default)]
        duration: Option<f64>,
    },
    Scroll {
        /// Scroll amount in wheel clicks; positive scrolls up/left.
        #[serde(default)]
        clicks: i32,
        #[serde(default)]
        axis: ScrollAxis,
        #[serde(default)]
        verify_after: Option<bool>,
    },
    Type {
        text: String,
        #[serde(default)]
        x: Option<f64>,
        #[serde(default)]
        y: Option<f64>,
        #[serde(default)]
        element_id: Option<u32>,
        #[serde(default)]
        phantom_mode: Option<bool>,
        #[serde(default)]
        verify_after: Option<bool>,
    },
    Key {
        /// Ordered key sequence, e.g. `["cmd", "space"]`.
        keys: Vec<String>,
        #[serde(default)]
        verify_after: Option<bool>,
    },
    OpenApp {
        app_name: String,
        #[serde(default)]
        verify_after: Option<bool>,
    },
    InspectUi {},
    ProbeUi {
        #[serde(default)]
        x: Option<f64>,
        #[serde(default)]
        y: Option<f64>,
        #[serde(default)]
        element_id: Option<u32>,
        /// When > 0, a cross of four neighbours at this distance is sampled.
        #[serde(default)]
        radius: Option<f64>,
    },
    ClipboardOp {
        op: ClipboardCommand,
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        verify_after: Option<bool>,
    },
    SandboxShell {
        cmd: String,
        /// Relative working directory under the shell workspace root.
        #[serde(default)]
        cwd: Option<String>,
        #[serde(default)]
        verify_after: Option<bool>,
    },
    BrowserOp {
        command: BrowserCommand,
        #[serde(default)]
        app_name: Option<String>,
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        selector: Option<String>,
        #[serde(default)]
        value: Option<String>,
        #[serde(default)]
        script: Option<String>,
        #[serde(default)]
        verify_after: Option<bool>,
    },
    NotebookOp {
        op: NotebookCommand,
        #[serde(default)]
        content: String,
        #[serde(default)]
        source: String,
    },
    RunSkill {
        #[serde(default)]
        skill_id: Option<String>,
        #[serde(default)]
        skill_name: Option<String>,
    },
    Wait {
        seconds: f64,
    },
    CaptureOnly {
        #[serde(default)]
        reason: String,
    },
    Noop {
        #[serde(default)]
        reason: String,
    },
    MacroActions {
        actions: Vec<Action>,
        #[serde(default)]
        skill_id: Option<String>,
        #[serde(default)]
        skill_name: Option<String>,
    },
}

impl Action {
    /// The snake_case tag of this variant, as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Action::MouseMove { .. } => "mouse_move",
            Action::LeftClick { .. } => "left_click",
            Action::RightClick { .. } => "right_click",
            Action::DoubleClick { .. } => "double_click",
            Action::DragAndDrop { .. } => "drag_and_drop",
            Action::SelectArea { .. } => "select_area",
            Action::Hover { .. } => "hover",
            Action::Scroll { .. } => "scroll",
            Action::Type { .. } => "type",
            Action::Key { .. } => "key",
            Action::OpenApp { .. } => "open_app",
            Action::InspectUi {} => "inspect_ui",
            Action::ProbeUi { .. } => "probe_ui",
            Action::ClipboardOp { .. } => "clipboard_op",
            Action::SandboxShell { .. } => "sandbox_shell",
            Action::BrowserOp { .. } => "browser_op",
            Action::NotebookOp { .. } => "notebook_op",
            Action::RunSkill { .. } => "run_skill",
            Action::Wait { .. } => "wait",
            Action::CaptureOnly { .. } => "capture_only",
            Action::Noop { .. } => "noop",
            Action::MacroActions { .. } => "macro_actions",
        }
    }

    /// Canonical JSON of the action, used as the signature for repeat and
    /// cycle detection.
    pub fn signature(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.kind().to_string())
    }

    /// Whether the action interacts with the UI. Pure loop-control actions
    /// (`wait`, `capture_only`, `noop`) are not interactive.
    pub fn is_interactive(&self) -> bool {
        !matches!(
            self,
            Action::Wait { .. } | Action::CaptureOnly { .. } | Action::Noop { .. }
        )
    }

    /// Whether the loop should re-perceive and run the change detector after
    /// executing this action. Defaults to `true`; the model can opt out for
    /// deliberately invisible actions (e.g. clipboard writes).
    pub fn verify_after(&self) -> bool {
        match self {
            Action::LeftClick { verify_after, .. }
            | Action::RightClick { verify_after, .. }
            | Action::DoubleClick { verify_after, .. }
            | Action::DragAndDrop { verify_after, .. }
            | Action::SelectArea { verify_after, .. }
            | Action::Scroll { verify_after, .. }
            | Action::Type { verify_after, .. }
            | Action::Key { verify_after, .. }
            | Action::OpenApp { verify_after, .. }
            | Action::ClipboardOp { verify_after, .. }
            | Action::SandboxShell { verify_after, .. }
            | Action::BrowserOp { verify_after, .. } => verify_after.unwrap_or(true),
            _ => true,
        }
    }

    /// Whether this action requests the semantic (accessibility-API) path
    /// before physical HID. An explicit `phantom_mode` wins; an element
    /// reference implies it.
    pub fn phantom_mode(&self) -> bool {
        match self {
            Action::LeftClick {
                phantom_mode,
                element_id,
                ..
            }
            | Action::RightClick {
                phantom_mode,
                element_id,
                ..
            }
            | Action::DoubleClick {
                phantom_mode,
                element_id,
                ..
            }
            | Action::Type {
                phantom_mode,
                element_id,
                ..
            } => phantom_mode.unwrap_or(element_id.is_some()),
            _ => false,
        }
    }

    /// Clear the phantom-mode request, used by the router when falling back
    /// to physical HID after a failed semantic attempt.
    pub fn clear_phantom_mode(&mut self) {
        match self {
            Action::LeftClick {
                phantom_mode,
                element_id,
                ..
            }
            | Action::RightClick {
                phantom_mode,
                element_id,
                ..
            }
            | Action::DoubleClick {
                phantom_mode,
                element_id,
                ..
            }
            | Action::Type {
                phantom_mode,
                element_id,
                ..
            } => {
                *phantom_mode = Some(false);
                *element_id = None;
            }
            _ => {}
        }
    }

    /// The source point, for spatial policy checks.
    pub fn source_point(&self) -> Option<(f64, f64)> {
        let (x, y) = match self {
            Action::MouseMove { x, y, .. }
            | Action::LeftClick { x, y, .. }
            | Action::RightClick { x, y, .. }
            | Action::DoubleClick { x, y, .. }
            | Action::DragAndDrop { x, y, .. }
            | Action::SelectArea { x, y, .. }
            | Action::Hover { x, y, .. }
            | Action::Type { x, y, .. }
            | Action::ProbeUi { x, y, .. } => (x, y),
            _ => return None,
        };
        match (x, y) {
            (Some(px), Some(py)) => Some((*px, *py)),
            _ => None,
        }
    }

    /// The drag/selection target point, for spatial policy checks.
    pub fn target_point(&self) -> Option<(f64, f64)> {
        match self {
            Action::DragAndDrop {
                target_x: Some(tx),
                target_y: Some(ty),
                ..
            }
            | Action::SelectArea {
                target_x: Some(tx),
                target_y: Some(ty),
                ..
            } => Some((*tx, *ty)),
            _ => None,
        }
    }

    /// Normalised hotkey combo (`sorted, lowercase, '+'-joined`) for
    /// [`Action::Key`]; `None` for every other variant.
    pub fn hotkey_combo(&self) -> Option<String> {
        if let Action::Key { keys, .. } = self {
            let mut combo: Vec<String> = keys.iter().map(|k| k.to_lowercase()).collect();
            combo.sort();
            Some(combo.join("+"))
        } else {
            None
        }
    }

    /// Fill in missing coordinates for every element reference using the
    /// overlay tag lookup. Macro sub-actions are resolved in place. Returns
    /// `false` when any referenced tag cannot be resolved.
    pub fn resolve_elements<F>(&mut self, lookup: &F) -> bool
    where
        F: Fn(u32) -> Option<(f64, f64)>,
    {
        if let Action::MacroActions { actions, .. } = self {
            return actions.iter_mut().all(|sub| sub.resolve_single(lookup));
        }
        self.resolve_single(lookup)
    }

    fn resolve_single<F>(&mut self, lookup: &F) -> bool
    where
        F: Fn(u32) -> Option<(f64, f64)>,
    {
        let Some((x, y, element_id)) = self.coordinate_slots() else {
            return true;
        };
        if x.is_some() && y.is_some() {
            return true;
        }
        let Some(id) = element_id else {
            return true;
        };
        match lookup(id) {
            Some((cx, cy)) => {
                *x = Some(cx);
                *y = Some(cy);
                true
            }
            None => false,
        }
    }

    fn coordinate_slots(&mut self) -> Option<(&mut Option<f64>, &mut Option<f64>, Option<u32>)> {
        match self {
            Action::MouseMove { x, y, element_id }
            | Action::LeftClick {
                x, y, element_id, ..
            }
            | Action::RightClick {
                x, y, element_id, ..
            }
            | Action::DoubleClick {
                x, y, element_id, ..
            }
            | Action::DragAndDrop {
                x, y, element_id, ..
            }
            | Action::SelectArea {
                x, y, element_id, ..
            }
            | Action::Hover {
                x, y, element_id, ..
            }
            | Action::Type {
                x, y, element_id, ..
            }
            | Action::ProbeUi {
                x, y, element_id, ..
            } => Some((x, y, *element_id)),
            _ => None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn left_click_roundtrip() {
        let action = Action::LeftClick {
            x: Some(100.0),
            y: Some(200.0),
            element_id: None,
            phantom_mode: None,
            verify_after: None,
        };
        let json = serde_json::to_string(&action).unwrap();
        assert!(json.contains("\"type\":\"left_click\""));
        let back: Action = serde_json::from_str(&json).unwrap();
        assert_eq!(back, action);
    }

    #[test]
    fn key_action_parses_from_tool_payload() {
        let action: Action =
            serde_json::from_str(r#"{"type":"key","keys":["cmd","space"]}"#).unwrap();
        assert_eq!(action.kind(), "key");
        assert_eq!(action.hotkey_combo().as_deref(), Some("cmd+space"));
    }

    #[test]
    fn hotkey_combo_is_order_insensitive() {
        let a = Action::Key {
            keys: vec!["Cmd".into(), "Space".into()],
            verify_after: None,
        };
        let b = Action::Key {
            keys: vec!["space".into(), "cmd".into()],
            verify_after: None,
        };
        assert_eq!(a.hotkey_combo(), b.hotkey_combo());
    }

    #[test]
    fn unknown_variant_fails_to_parse() {
        // The executor adapter collapses this failure to a Noop.
        let parsed: Result<Action, _> =
            serde_json::from_str(r#"{"type":"teleport","x":1,"y":2}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn verify_after_defaults_to_true() {
        let action = Action::LeftClick {
            x: Some(1.0),
            y: Some(1.0),
            element_id: None,
            phantom_mode: None,
            verify_after: None,
        };
        assert!(action.verify_after());
    }

    #[test]
    fn verify_after_can_be_disabled() {
        let action = Action::ClipboardOp {
            op: ClipboardCommand::Write,
            content: Some("payload".into()),
            verify_after: Some(false),
        };
        assert!(!action.verify_after());
    }

    #[test]
    fn wait_and_noop_are_not_interactive() {
        assert!(!Action::Wait { seconds: 1.0 }.is_interactive());
        assert!(!Action::Noop { reason: String::new() }.is_interactive());
        assert!(Action::InspectUi {}.is_interactive());
    }

    #[test]
    fn element_reference_implies_phantom_mode() {
        let action = Action::LeftClick {
            x: None,
            y: None,
            element_id: Some(4),
            phantom_mode: None,
            verify_after: None,
        };
        assert!(action.phantom_mode());
    }

    #[test]
    fn explicit_phantom_mode_overrides_element_inference() {
        let action = Action::LeftClick {
            x: Some(1.0),
            y: Some(1.0),
            element_id: Some(4),
            phantom_mode: Some(false),
            verify_after: None,
        };
        assert!(!action.phantom_mode());
    }

    #[test]
    fn resolve_elements_fills_center_from_lookup() {
        let mut action = Action::LeftClick {
            x: None,
            y: None,
            element_id: Some(2),
            phantom_mode: None,
            verify_after: None,
        };
        let resolved = action.resolve_elements(&|id| (id == 2).then_some((50.0, 60.0)));
        assert!(resolved);
        assert_eq!(action.source_point(), Some((50.0, 60.0)));
    }

    #[test]
    fn resolve_elements_reports_unknown_tag() {
        let mut action = Action::LeftClick {
            x: None,
            y: None,
            element_id: Some(9),
            phantom_mode: None,
            verify_after: None,
        };
        assert!(!action.resolve_elements(&|_| None));
    }

    #[test]
    fn resolve_elements_walks_macro_sub_actions() {
        let mut action = Action::MacroActions {
            actions: vec![
                Action::LeftClick {
                    x: None,
                    y: None,
                    element_id: Some(1),
                    phantom_mode: None,
                    verify_after: None,
                },
                Action::Type {
                    text: "hello".into(),
                    x: None,
                    y: None,
                    element_id: None,
                    phantom_mode: None,
                    verify_after: None,
                },
            ],
            skill_id: None,
            skill_name: None,
        };
        assert!(action.resolve_elements(&|_| Some((10.0, 10.0))));
        if let Action::MacroActions { actions, .. } = &action {
            assert_eq!(actions[0].source_point(), Some((10.0, 10.0)));
        } else {
            panic!("expected macro");
        }
    }

    #[test]
    fn explicit_coordinates_win_over_element_reference() {
        let mut action = Action::LeftClick {
            x: Some(7.0),
            y: Some(8.0),
            element_id: Some(3),
            phantom_mode: None,
            verify_after: None,
        };
        assert!(action.resolve_elements(&|_| Some((99.0, 99.0))));
        assert_eq!(action.source_point(), Some((7.0, 8.0)));
    }

    #[test]
    fn signature_is_stable_and_distinguishes_values() {
        let a = Action::Key {
            keys: vec!["cmd".into(), "space".into()],
            verify_after: None,
        };
        let b = Action::Key {
            keys: vec!["cmd".into(), "tab".into()],
            verify_after: None,
        };
        assert_eq!(a.signature(), a.signature());
        assert_ne!(a.signature(), b.signature());
    }

    #[test]
    fn scroll_axis_defaults_to_vertical() {
        let action: Action = serde_json::from_str(r#"{"type":"scroll","clicks":-3}"#).unwrap();
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
    fn browser_command_snake_case_roundtrip() {
        let action: Action = serde_json::from_str(
            r#"{"type":"browser_op","command":"get_page_content"}"#,
        )
        .unwrap();
        if let Action::BrowserOp { command, .. } = action {
            assert_eq!(command, BrowserCommand::GetPageContent);
            assert_eq!(command.as_str(), "get_page_content");
        } else {
            panic!("expected browser_op");
        }
    }

    #[test]
    fn macro_schema_is_derivable() {
        use schemars::schema_for;
        let schema = serde_json::to_string(&schema_for!(Action)).unwrap();
        assert!(schema.contains("macro_actions"));
        assert!(schema.contains("sandbox_shell"));
        assert!(schema.contains("browser_op"));
    }
}
