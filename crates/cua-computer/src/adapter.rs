//! The [`Computer`] contract – the capability set the core depends on.
//!
//! Platform backends implement exactly these operations; everything else
//! (policy, routing, change detection, planning) lives above this seam in
//! platform-independent code. All driver-level failures are reported through
//! [`ActionResult`]; `Result` errors are reserved for faults that abort a
//! task (missing permissions, broken capture pipeline).

use cua_types::{Action, ActionResult, CuaError, DisplayInfo, Settings, UiElement};

/// OS-specific implementation of the agent's "computer" capabilities.
///
/// One adapter is constructed per process and stays alive for its lifetime.
/// The orchestrator serialises every call through the single-threaded loop,
/// so implementations do not need internal locking.
pub trait Computer: Send {
    /// Short identifier for logs, e.g. `"sim"`, `"macos"`, `"windows"`.
    fn platform_name(&self) -> &str;

    /// One-line environment description injected into executor prompts.
    fn system_info(&self) -> String {
        self.platform_name().to_string()
    }

    /// Fail fast when a required OS permission (screen recording,
    /// accessibility) is missing. Runs once before the loop starts.
    fn run_health_checks(&self, settings: &Settings) -> Result<(), CuaError>;

    /// Capture the primary display and return
    /// `(base64 image, perceptual hash hex)`.
    fn capture_with_hash(&mut self) -> Result<(String, String), CuaError>;

    /// Pixel-level change test between two captures; `threshold` is the
    /// minimum changed-pixel ratio (0.01 = 1 %). This is the change
    /// detector's last-resort signal.
    fn has_changed(&self, previous_b64: &str, current_b64: &str, threshold: f64) -> bool;

    /// Structural similarity score in `[0, 1]`, or `None` when the backend
    /// cannot compute one.
    fn structural_similarity(&self, previous_b64: &str, current_b64: &str) -> Option<f64>;

    /// Vision-based UI element candidates for a frame. May be empty on
    /// platforms that rely purely on the accessibility tree.
    fn detect_ui_elements(&self, image_b64: &str) -> Vec<UiElement>;

    /// The accessibility tree of the focused window, depth-limited. The tree
    /// travels in the result metadata under the `"tree"` key.
    fn get_active_window_tree(&mut self, max_depth: u32) -> ActionResult;

    /// Execute one input action through the platform drivers.
    fn execute(&mut self, action: &Action) -> ActionResult;

    /// Primary display geometry.
    fn display(&self) -> DisplayInfo;

    /// Identifier of the foreground application, when the platform can
    /// resolve it (bundle id on macOS, process image name on Windows).
    fn foreground_app(&self) -> Option<String> {
        None
    }

    /// Title of the foreground window, when available.
    fn foreground_window_title(&self) -> Option<String> {
        None
    }

    /// Current URL of the frontmost browser tab, when a browser driver is
    /// attached. Used to give the policy engine context for `run_javascript`.
    fn current_browser_url(&self) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimComputer;

    #[test]
    fn default_context_probes_return_none() {
        // A minimal adapter does not have to implement the context probes.
        struct Bare;
        impl Computer for Bare {
            fn platform_name(&self) -> &str {
                "bare"
            }
            fn run_health_checks(&self, _settings: &Settings) -> Result<(), CuaError> {
                Ok(())
            }
            fn capture_with_hash(&mut self) -> Result<(String, String), CuaError> {
                Ok((String::new(), String::new()))
            }
            fn has_changed(&self, _prev: &str, _cur: &str, _threshold: f64) -> bool {
                false
            }
            fn structural_similarity(&self, _prev: &str, _cur: &str) -> Option<f64> {
                None
            }
            fn detect_ui_elements(&self, _image_b64: &str) -> Vec<UiElement> {
                Vec::new()
            }
            fn get_active_window_tree(&mut self, _max_depth: u32) -> ActionResult {
                ActionResult::fail("no accessibility driver")
            }
            fn execute(&mut self, _action: &Action) -> ActionResult {
                ActionResult::ok("noop")
            }
            fn display(&self) -> DisplayInfo {
                DisplayInfo::default()
            }
        }

        let bare = Bare;
        assert!(bare.foreground_app().is_none());
        assert!(bare.foreground_window_title().is_none());
        assert!(bare.current_browser_url().is_none());
        assert_eq!(bare.system_info(), "bare");
    }

    #[test]
    fn sim_adapter_satisfies_the_contract() {
        let mut sim = SimComputer::new();
        assert!(sim.run_health_checks(&Settings::default()).is_ok());
        let (frame, hash) = sim.capture_with_hash().unwrap();
        assert!(!frame.is_empty());
        assert!(!hash.is_empty());
    }
}
