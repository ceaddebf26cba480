//! Accessibility-tree shaping for prompts and grounding.
//!
//! Raw window trees are far too large for a model prompt. Three views are
//! derived here:
//!
//! - [`prune_for_prompt`] keeps only interactive or labelled nodes (plus
//!   their ancestors) under depth and node budgets.
//! - [`flatten_with_frames`] linearises the tree into frame-bearing overlay
//!   candidates, assigning ids 1..N in traversal order. The ids are the ones
//!   the executor refers to as `element_id`.
//! - [`summarize_for_prompt`] renders an indented plain-text outline for the
//!   executor's context block.

use cua_types::{AxNode, OverlayTag};

/// Roles the agent can act on directly.
const INTERACTIVE_ROLES: &[&str] = &[
    "AXButton",
    "AXTextField",
    "AXTextArea",
    "AXLink",
    "AXCheckBox",
    "AXComboBox",
    "AXMenuItem",
];

/// Default budgets for the pruned prompt tree.
pub const PRUNE_MAX_NODES: usize = 120;
pub const PRUNE_MAX_DEPTH: u32 = 4;

/// Default cap on overlay candidates.
pub const FLATTEN_MAX_NODES: usize = 40;

/// Default budgets for the textual summary.
pub const SUMMARY_MAX_DEPTH: u32 = 4;
pub const SUMMARY_NODE_BUDGET: usize = 80;

fn is_interactive(node: &AxNode) -> bool {
    node.role
        .as_deref()
        .is_some_and(|role| INTERACTIVE_ROLES.contains(&role))
}

fn has_label(node: &AxNode) -> bool {
    node.title.as_deref().is_some_and(|t| !t.is_empty())
        || node.value.as_deref().is_some_and(|v| !v.is_empty())
}

fn has_visible_frame(node: &AxNode) -> bool {
    node.frame.is_some_and(|f| f.w > 0.0 && f.h > 0.0)
}

fn label_for(node: &AxNode) -> String {
    let title = node.title.as_deref().unwrap_or("").trim();
    if !title.is_empty() {
        return title.to_string();
    }
    let value = node.value.as_deref().unwrap_or("").trim();
    if !value.is_empty() {
        return value.to_string();
    }
    let role = node.role.as_deref().unwrap_or("").trim();
    if role.is_empty() {
        "element".to_string()
    } else {
        role.to_string()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Pruning
// ─────────────────────────────────────────────────────────────────────────────

/// Return a pruned copy of `tree` that keeps only interactive or labelled
/// nodes (and the ancestors needed to reach them), dropping deep and empty
/// branches. `None` when nothing useful survives.
pub fn prune_for_prompt(tree: &AxNode, max_nodes: usize, max_depth: u32) -> Option<AxNode> {
    let mut kept = 0usize;
    prune_walk(tree, 0, max_nodes, max_depth, &mut kept)
}

fn prune_walk(
    node: &AxNode,
    depth: u32,
    max_nodes: usize,
    max_depth: u32,
    kept: &mut usize,
) -> Option<AxNode> {
    if *kept >= max_nodes || depth > max_depth {
        return None;
    }
    let mut children = Vec::new();
    for child in &node.children {
        if *kept >= max_nodes {
            break;
        }
        if let Some(pruned) = prune_walk(child, depth + 1, max_nodes, max_depth, kept) {
            children.push(pruned);
        }
    }

    let useful = is_interactive(node) || has_label(node) || has_visible_frame(node);
    if !useful && children.is_empty() {
        return None;
    }

    *kept += 1;
    Some(AxNode {
        role: node.role.clone(),
        title: node.title.clone(),
        value: node.value.clone(),
        frame: node.frame,
        children,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Flattening
// ─────────────────────────────────────────────────────────────────────────────

/// Flatten the tree into at most `max_nodes` frame-bearing overlay tags with
/// ids assigned 1..N in depth-first traversal order.
pub fn flatten_with_frames(tree: &AxNode, max_nodes: usize) -> Vec<OverlayTag> {
    let mut tags = Vec::new();
    flatten_walk(tree, max_nodes, &mut tags);
    for (idx, tag) in tags.iter_mut().enumerate() {
        tag.id = idx as u32 + 1;
    }
    tags
}

fn flatten_walk(node: &AxNode, max_nodes: usize, tags: &mut Vec<OverlayTag>) {
    if tags.len() >= max_nodes {
        return;
    }
    if let Some(frame) = node.frame
        && frame.w > 0.0
        && frame.h > 0.0
    {
        tags.push(OverlayTag {
            id: 0, // assigned after traversal
            role: node.role.clone().unwrap_or_default(),
            label: label_for(node),
            frame,
        });
    }
    for child in &node.children {
        if tags.len() >= max_nodes {
            return;
        }
        flatten_walk(child, max_nodes, tags);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Summarising
// ─────────────────────────────────────────────────────────────────────────────

/// Render an indented text outline of the labelled/interactive subset, for
/// the executor's context block. Depth and node budgets bound the output.
pub fn summarize_for_prompt(tree: &AxNode, max_depth: u32, node_budget: usize) -> String {
    let mut lines = Vec::new();
    summarize_walk(tree, 0, max_depth, node_budget, &mut lines);
    lines.join("\n")
}

fn summarize_walk(
    node: &AxNode,
    depth: u32,
    max_depth: u32,
    node_budget: usize,
    lines: &mut Vec<String>,
) {
    if depth > max_depth || lines.len() >= node_budget {
        return;
    }
    if is_interactive(node) || has_label(node) || has_visible_frame(node) {
        let indent = "  ".repeat(depth as usize);
        let role = node.role.as_deref().unwrap_or("?");
        let label = label_for(node);
        let line = match node.frame {
            Some(f) => format!(
                "{indent}{role} '{label}' [{:.0},{:.0} {:.0}x{:.0}]",
                f.x, f.y, f.w, f.h
            ),
            None => format!("{indent}{role} '{label}'"),
        };
        lines.push(line);
    }
    for child in &node.children {
        if lines.len() >= node_budget {
            return;
        }
        summarize_walk(child, depth + 1, max_depth, node_budget, lines);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
