//! `cua-types` – Shared data model for the CUA desktop agent.
//!
//! Every other crate in the workspace depends on the types defined here:
//!
//! - [`Action`] – the tagged sum type covering every input the agent can
//!   produce, from raw pointer events to browser and notebook operations.
//! - [`ActionResult`] – the uniform result shape returned by every driver
//!   call; drivers never signal runtime branches via panics.
//! - [`Plan`] / [`Step`] – the planner's structured task decomposition with a
//!   monotone step state machine.
//! - [`Observation`], [`NoteEntry`], [`OverlayTag`], [`AxNode`] – the
//!   perception-side records the loop accumulates.
//! - [`Settings`] – the process-wide configuration object built once from the
//!   environment at startup.
//! - [`CuaError`] – the error type for unrecoverable conditions (missing OS
//!   permissions, unknown adapters, broken wiring).

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

pub mod action;
pub mod plan;
pub mod settings;

pub use action::{
    Action, BrowserCommand, ClipboardCommand, NotebookCommand, ScrollAxis,
};
pub use plan::{Plan, Step, StepStatus};
pub use settings::Settings;

// ─────────────────────────────────────────────────────────────────────────────
// ActionResult
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of a single driver call.
///
/// All driver operations (HID, accessibility, browser, clipboard, shell)
/// report through this shape; `success = false` feeds the loop's failure
/// accounting instead of raising.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ActionResult {
    pub success: bool,
    pub reason: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl ActionResult {
    /// A successful result with the given reason.
    pub fn ok(reason: impl Into<String>) -> Self {
        Self {
            success: true,
            reason: reason.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// A failed result with the given reason.
    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            reason: reason.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// Attach a metadata entry, consuming and returning the result.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Geometry and display
// ─────────────────────────────────────────────────────────────────────────────

/// Axis-aligned rectangle in logical points, origin at the top-left.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema, Default)]
pub struct Frame {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

impl Frame {
    pub fn new(x: f64, y: f64, w: f64, h: f64) -> Self {
        Self { x, y, w, h }
    }

    /// Centre point of the rectangle.
    pub fn center(&self) -> (f64, f64) {
        (self.x + self.w / 2.0, self.y + self.h / 2.0)
    }

    /// Whether the point lies inside the rectangle (edges inclusive).
    pub fn contains(&self, px: f64, py: f64) -> bool {
        px >= self.x && px <= self.x + self.w && py >= self.y && py <= self.y + self.h
    }
}

/// Primary display geometry as reported by the computer adapter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DisplayInfo {
    pub logical_width: u32,
    pub logical_height: u32,
    pub physical_width: u32,
    pub physical_height: u32,
    pub scale_factor: f64,
}

impl Default for DisplayInfo {
    fn default() -> Self {
        Self {
            logical_width: 1440,
            logical_height: 900,
            physical_width: 2880,
            physical_height: 1800,
            scale_factor: 2.0,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Accessibility tree
// ─────────────────────────────────────────────────────────────────────────────

/// One node of the OS accessibility tree for the focused window.
///
/// Adapters emit the raw tree; `cua-perception` prunes it to the interactive
/// and labelled subset before it reaches a prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AxNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame: Option<Frame>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<AxNode>,
}

/// A UI element candidate produced by vision-based detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiElement {
    pub role: String,
    pub title: String,
    pub frame: Frame,
    /// Which detector produced the element (e.g. `"ax"`, `"vision"`).
    pub source: String,
}

/// One numbered Set-of-Mark tag drawn onto the screenshot.
///
/// IDs start at 1 and follow accessibility-tree traversal order for the
/// capture the overlay was produced from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlayTag {
    pub id: u32,
    pub role: String,
    pub label: String,
    /// Bounding box in logical points.
    pub frame: Frame,
}

// ─────────────────────────────────────────────────────────────────────────────
// Loop records
// ─────────────────────────────────────────────────────────────────────────────

/// A recorded frame capture. The image itself is off-loaded to a temp file so
/// a long session does not hold every screenshot in memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    /// Path of the off-loaded image file; `None` when the disk write failed.
    pub image_path: Option<PathBuf>,
    pub timestamp: DateTime<Utc>,
    pub changed_since_last: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_distance: Option<u32>,
    #[serde(default)]
    pub note: String,
}

/// One entry of the agent-writable notebook (working memory).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoteEntry {
    pub content: String,
    pub source: String,
    pub timestamp: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Unrecoverable conditions. Per-action failures are [`ActionResult`]s, not
/// errors; this type is reserved for faults that abort a task before or
/// outside the loop.
#[derive(Error, Debug)]
pub enum CuaError {
    /// A required OS permission (screen recording, accessibility) is missing.
    #[error("Missing required permission: {0}")]
    PermissionMissing(String),

    /// The requested computer adapter is not registered.
    #[error("Unknown computer adapter '{0}'; set CUA_ADAPTER to a registered adapter name")]
    UnknownAdapter(String),

    /// A component of the computer adapter failed outside of action dispatch.
    #[error("Adapter fault in {component}: {details}")]
    Adapter { component: String, details: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_result_ok_carries_reason() {
        let res = ActionResult::ok("clicked");
        assert!(res.success);
        assert_eq!(res.reason, "clicked");
        assert!(res.metadata.is_empty());
    }

    #[test]
    fn action_result_with_metadata_roundtrip() {
        let res = ActionResult::fail("blocked")
            .with_metadata("zone", serde_json::json!("dock"));
        let json = serde_json::to_string(&res).unwrap();
        let back: ActionResult = serde_json::from_str(&json).unwrap();
        assert!(!back.success);
        assert_eq!(back.metadata["zone"], "dock");
    }

    #[test]
    fn frame_center_and_contains() {
        let frame = Frame::new(10.0, 20.0, 100.0, 40.0);
        assert_eq!(frame.center(), (60.0, 40.0));
        assert!(frame.contains(10.0, 20.0));
        assert!(frame.contains(110.0, 60.0));
        assert!(!frame.contains(111.0, 60.0));
    }

    #[test]
    fn ax_node_roundtrip_with_children() {
        let node = AxNode {
            role: Some("AXWindow".into()),
            title: Some("Calculator".into()),
            value: None,
            frame: Some(Frame::new(0.0, 0.0, 400.0, 300.0)),
            children: vec![AxNode {
                role: Some("AXButton".into()),
                title: Some("=".into()),
                ..AxNode::default()
            }],
        };
        let json = serde_json::to_string(&node).unwrap();
        let back: AxNode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, node);
    }

    #[test]
    fn overlay_tag_roundtrip() {
        let tag = OverlayTag {
            id: 3,
            role: "AXButton".into(),
            label: "OK".into(),
            frame: Frame::new(5.0, 5.0, 40.0, 20.0),
        };
        let json = serde_json::to_string(&tag).unwrap();
        let back: OverlayTag = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tag);
    }

    #[test]
    fn cua_error_display_mentions_adapter_name() {
        let err = CuaError::UnknownAdapter("quantum".into());
        assert!(err.to_string().contains("quantum"));
    }
}
