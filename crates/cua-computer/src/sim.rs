//! [`SimComputer`] – in-process simulated desktop for CI and headless tests.
//!
//! Pre-script frames, accessibility trees, and action results; the adapter
//! replays them deterministically and records every executed action. This
//! lets the full agent stack (policy, routing, change detection, the
//! orchestrator loop) run end-to-end without a display server, input
//! permissions, or a live model.
//!
//! # Example
//!
//! ```rust
//! use cua_computer::{Computer, SimComputer};
//! use cua_types::Action;
//!
//! let mut sim = SimComputer::new();
//! sim.push_frame("desktop with calculator");
//! let (frame, hash) = sim.capture_with_hash().unwrap();
//! assert!(!frame.is_empty());
//! assert!(!hash.is_empty());
//!
//! let result = sim.execute(&Action::Key { keys: vec!["cmd".into(), "space".into()], verify_after: None });
//! assert!(result.success);
//! assert_eq!(sim.executed().len(), 1);
//! ```

use std::collections::VecDeque;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::debug;

use cua_types::{Action, ActionResult, AxNode, CuaError, DisplayInfo, Settings, UiElement};

use crate::adapter::Computer;

/// Deterministic, scriptable [`Computer`] backend.
///
/// Frames are plain strings (base64-encoded on capture); their perceptual
/// hash is derived from the content, so identical scripted frames compare as
/// unchanged and any textual difference flips every change signal.
pub struct SimComputer {
    frames: VecDeque<(String, String)>,
    last_frame: (String, String),
    tree: Option<AxNode>,
    results: VecDeque<ActionResult>,
    executed: Vec<Action>,
    ssim: Option<f64>,
    health_failure: Option<String>,
    foreground_app: Option<String>,
    foreground_window_title: Option<String>,
    browser_url: Option<String>,
    display: DisplayInfo,
}

impl SimComputer {
    pub fn new() -> Self {
        let initial = Self::encode_frame("sim: initial desktop");
        Self {
            frames: VecDeque::new(),
            last_frame: initial,
            tree: None,
            results: VecDeque::new(),
            executed: Vec::new(),
            ssim: None,
            health_failure: None,
            foreground_app: None,
            foreground_window_title: None,
            browser_url: None,
            display: DisplayInfo::default(),
        }
    }

    fn encode_frame(content: &str) -> (String, String) {
        let b64 = BASE64.encode(content.as_bytes());
        let hash = Self::content_hash(content);
        (b64, hash)
    }

    /// FNV-1a over the frame content, rendered as 16 hex chars. Stands in
    /// for a perceptual hash: equal content → equal hash, any difference →
    /// a large Hamming distance.
    fn content_hash(content: &str) -> String {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in content.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        format!("{hash:016x}")
    }

    /// Queue a frame to be returned by the next `capture_with_hash` call.
    /// When the queue runs dry the last frame repeats (a static screen).
    pub fn push_frame(&mut self, content: &str) {
        self.frames.push_back(Self::encode_frame(content));
    }

    /// Queue several frames at once.
    pub fn push_frames<'a>(&mut self, contents: impl IntoIterator<Item = &'a str>) {
        for content in contents {
            self.push_frame(content);
        }
    }

    /// Set the accessibility tree returned by `get_active_window_tree`.
    pub fn set_tree(&mut self, tree: Option<AxNode>) {
        self.tree = tree;
    }

    /// Queue an explicit result for the next executed action. When the queue
    /// is empty every action succeeds with a `simulated <kind>` reason.
    pub fn push_result(&mut self, result: ActionResult) {
        self.results.push_back(result);
    }

    /// Fix the structural-similarity score reported for every frame pair.
    pub fn set_ssim(&mut self, ssim: Option<f64>) {
        self.ssim = ssim;
    }

    /// Make `run_health_checks` fail with the given missing permission.
    pub fn fail_health(&mut self, permission: &str) {
        self.health_failure = Some(permission.to_string());
    }

    pub fn set_foreground_app(&mut self, app: Option<String>) {
        self.foreground_app = app;
    }

    pub fn set_foreground_window_title(&mut self, title: Option<String>) {
        self.foreground_window_title = title;
    }

    pub fn set_browser_url(&mut self, url: Option<String>) {
        self.browser_url = url;
    }

    /// Every action dispatched through `execute`, in order.
    pub fn executed(&self) -> &[Action] {
        &self.executed
    }
}

impl Default for SimComputer {
    fn default() -> Self {
        Self::new()
    }
}

impl Computer for SimComputer {
    fn platform_name(&self) -> &str {
        "sim"
    }

    fn system_info(&self) -> String {
        "simulated desktop (headless)".to_string()
    }

    fn run_health_checks(&self, _settings: &Settings) -> Result<(), CuaError> {
        match &self.health_failure {
            Some(permission) => Err(CuaError::PermissionMissing(permission.clone())),
            None => Ok(()),
        }
    }

    fn capture_with_hash(&mut self) -> Result<(String, String), CuaError> {
        if let Some(frame) = self.frames.pop_front() {
            self.last_frame = frame;
        }
        Ok(self.last_frame.clone())
    }

    fn has_changed(&self, previous_b64: &str, current_b64: &str, _threshold: f64) -> bool {
        previous_b64 != current_b64
    }

    fn structural_similarity(&self, previous_b64: &str, current_b64: &str) -> Option<f64> {
        if self.ssim.is_some() {
            return self.ssim;
        }
        (previous_b64 == current_b64).then_some(1.0)
    }

    fn detect_ui_elements(&self, _image_b64: &str) -> Vec<UiElement> {
        Vec::new()
    }

    fn get_active_window_tree(&mut self, _max_depth: u32) -> ActionResult {
        match &self.tree {
            Some(tree) => match serde_json::to_value(tree) {
                Ok(value) => ActionResult::ok("window tree").with_metadata("tree", value),
                Err(err) => ActionResult::fail(format!("tree serialization failed: {err}")),
            },
            None => ActionResult::fail("no focused window"),
        }
    }

    fn execute(&mut self, action: &Action) -> ActionResult {
        debug!(kind = action.kind(), "sim execute");
        self.executed.push(action.clone());
        self.results
            .pop_front()
            .unwrap_or_else(|| ActionResult::ok(format!("simulated {}", action.kind())))
    }

    fn display(&self) -> DisplayInfo {
        self.display
    }

    fn foreground_app(&self) -> Option<String> {
        self.foreground_app.clone()
    }

    fn foreground_window_title(&self) -> Option<String> {
        self.foreground_window_title.clone()
    }

    fn current_browser_url(&self) -> Option<String> {
        self.browser_url.clone()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_frames_share_a_hash() {
        let mut sim = SimComputer::new();
        sim.push_frame("same screen");
        sim.push_frame("same screen");
        let (f1, h1) = sim.capture_with_hash().unwrap();
        let (f2, h2) = sim.capture_with_hash().unwrap();
        assert_eq!(f1, f2);
        assert_eq!(h1, h2);
    }

    #[test]
    fn different_frames_differ_in_hash() {
        let mut sim = SimComputer::new();
        sim.push_frame("screen a");
        sim.push_frame("screen b");
        let (_, h1) = sim.capture_with_hash().unwrap();
        let (_, h2) = sim.capture_with_hash().unwrap();
        assert_ne!(h1, h2);
    }

    #[test]
    fn exhausted_frame_queue_repeats_last_frame() {
        let mut sim = SimComputer::new();
        sim.push_frame("only frame");
        let (f1, _) = sim.capture_with_hash().unwrap();
        let (f2, _) = sim.capture_with_hash().unwrap();
        assert_eq!(f1, f2);
    }

    #[test]
    fn scripted_results_are_consumed_in_order() {
        let mut sim = SimComputer::new();
        sim.push_result(ActionResult::fail("first fails"));
        let noop = Action::Noop {
            reason: String::new(),
        };
        let first = sim.execute(&noop);
        let second = sim.execute(&noop);
        assert!(!first.success);
        assert!(second.success);
        assert_eq!(sim.executed().len(), 2);
    }

    #[test]
    fn window_tree_travels_in_metadata() {
        let mut sim = SimComputer::new();
        sim.set_tree(Some(AxNode {
            role: Some("AXWindow".into()),
            title: Some("Calculator".into()),
            ..AxNode::default()
        }));
        let result = sim.get_active_window_tree(4);
        assert!(result.success);
        let tree = result.metadata.get("tree").unwrap();
        assert_eq!(tree["title"], "Calculator");
    }

    #[test]
    fn missing_tree_is_a_driver_failure_not_a_panic() {
        let mut sim = SimComputer::new();
        let result = sim.get_active_window_tree(4);
        assert!(!result.success);
    }

    #[test]
    fn failed_health_check_reports_permission() {
        let mut sim = SimComputer::new();
        sim.fail_health("Screen Recording");
        let err = sim.run_health_checks(&Settings::default()).unwrap_err();
        assert!(matches!(err, CuaError::PermissionMissing(p) if p == "Screen Recording"));
    }

    #[test]
    fn has_changed_compares_payloads() {
        let sim = SimComputer::new();
        assert!(!sim.has_changed("abc", "abc", 0.01));
        assert!(sim.has_changed("abc", "abd", 0.01));
    }

    #[test]
    fn ssim_defaults_to_one_for_identical_frames() {
        let sim = SimComputer::new();
        assert_eq!(sim.structural_similarity("x", "x"), Some(1.0));
        assert_eq!(sim.structural_similarity("x", "y"), None);
    }
}
