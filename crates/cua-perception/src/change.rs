//! [`ChangeDetector`] – did the UI visibly advance after an action?
//!
//! Four signals are blended with a fixed precedence so the cheapest and most
//! specific signal dominates:
//!
//! 1. Accessibility trees present on both sides and their canonical JSON
//!    differs → changed.
//! 2. SSIM available and below the structural threshold → changed.
//! 3. Perceptual-hash Hamming distance above the static threshold → changed.
//! 4. Pixel-histogram fallback (delegated to the adapter) → its verdict.
//!
//! When an action opts out of verification the detector is skipped entirely
//! and the loop assumes `changed = true`, so deliberately invisible actions
//! (clipboard writes, notebook updates) cannot stall the session.

use cua_types::AxNode;

/// Default minimum changed-pixel ratio for the adapter-side fallback.
pub const PIXEL_CHANGE_RATIO: f64 = 0.01;

/// Multi-signal UI change detector.
#[derive(Debug, Clone, Copy)]
pub struct ChangeDetector {
    /// SSIM scores below this mean a structural change (default 0.985).
    pub ssim_threshold: f64,
    /// Hamming distances above this mean a visual change (default 1).
    pub phash_threshold: u32,
}

impl Default for ChangeDetector {
    fn default() -> Self {
        Self {
            ssim_threshold: 0.985,
            phash_threshold: 1,
        }
    }
}

impl ChangeDetector {
    pub fn new(ssim_threshold: f64, phash_threshold: u32) -> Self {
        Self {
            ssim_threshold,
            phash_threshold,
        }
    }

    /// Apply the ordered decision rule. `pixel_fallback` is only invoked when
    /// every cheaper signal reports "no change".
    pub fn evaluate<F>(
        &self,
        ax_changed: bool,
        ssim: Option<f64>,
        hash_distance: u32,
        pixel_fallback: F,
    ) -> bool
    where
        F: FnOnce() -> bool,
    {
        if ax_changed {
            return true;
        }
        if let Some(score) = ssim
            && score < self.ssim_threshold
        {
            return true;
        }
        if hash_distance > self.phash_threshold {
            return true;
        }
        pixel_fallback()
    }
}

/// Whether two accessibility trees differ, compared by canonical JSON.
///
/// Returns `false` when either side is missing: an absent tree is not
/// evidence of change, it only disables this signal.
pub fn ax_trees_differ(before: Option<&AxNode>, after: Option<&AxNode>) -> bool {
    let (Some(before), Some(after)) = (before, after) else {
        return false;
    };
    match (serde_json::to_string(before), serde_json::to_string(after)) {
        (Ok(a), Ok(b)) => a != b,
        _ => false,
    }
}

/// Hamming distance between two hex-encoded perceptual hashes.
///
/// Unparsable input or mismatched lengths count every affected nibble as
/// fully different, so a broken hash reads as "changed" rather than "same".
pub fn hamming_distance_hex(a: &str, b: &str) -> u32 {
    let mut distance = 0u32;
    let mut a_nibbles = a.chars();
    let mut b_nibbles = b.chars();
    loop {
        match (a_nibbles.next(), b_nibbles.next()) {
            (None, None) => break,
            (Some(ca), Some(cb)) => match (ca.to_digit(16), cb.to_digit(16)) {
                (Some(na), Some(nb)) => distance += (na ^ nb).count_ones(),
                _ => distance += 4,
            },
            // Length mismatch: the remaining nibbles all differ.
            _ => distance += 4,
        }
    }
    distance
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
