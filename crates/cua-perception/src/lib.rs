//! `cua-perception` – screen-state understanding for the agent loop.
//!
//! Everything here is pure computation over captures and accessibility
//! trees; no OS calls. The orchestrator feeds in frames and trees from the
//! computer adapter and gets back change verdicts, prompt-sized tree
//! summaries, and Set-of-Mark overlays.
//!
//! # Modules
//!
//! - [`change`] – [`ChangeDetector`][change::ChangeDetector]: blends the
//!   accessibility-tree diff, SSIM, perceptual-hash distance, and a
//!   pixel-histogram fallback into a single "did the UI advance?" bit.
//! - [`ax`] – accessibility-tree pruning (interactive/labelled subset, depth
//!   and node budgets), flattening to frame-bearing overlay candidates, and
//!   a plain-text summary for prompts.
//! - [`overlay`] – [`draw_som_overlay`][overlay::draw_som_overlay]: renders
//!   numbered bounding boxes onto a screenshot so the model can refer to
//!   elements by integer id instead of raw coordinates.

pub mod ax;
pub mod change;
pub mod overlay;

pub use ax::{flatten_with_frames, prune_for_prompt, summarize_for_prompt};
pub use change::{ChangeDetector, ax_trees_differ, hamming_distance_hex};
pub use overlay::draw_som_overlay;
