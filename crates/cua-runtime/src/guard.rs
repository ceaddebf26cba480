//! Repetition guards – the loop's defence against spinning in place.
//!
//! Two cooperating detectors:
//!
//! - [`HotkeyLedger`] deduplicates exact re-executions: a hotkey combo that
//!   already ran its allowed number of times without an intervening UI
//!   change is skipped with a non-fatal `"hotkey deduped"` result. Any
//!   visible change clears the ledger, making every combo fresh again.
//! - [`CycleDetector`] finds oscillatory loops: it records the canonical
//!   signature of every action and flags when the last `k` signatures
//!   exactly repeat the preceding `k`, for any `k` in the configured window.
//!   This catches A-B-A-B ping-pong that simple same-action counters miss.
//!
//! # Example
//!
//! ```rust
//! use cua_runtime::guard::{CycleDetector, HotkeyLedger};
//!
//! let mut ledger = HotkeyLedger::new();
//! assert!(!ledger.should_skip("cmd+space", 2));
//! ledger.record("cmd+space");
//! ledger.record("cmd+space");
//! assert!(ledger.should_skip("cmd+space", 2)); // third press is deduped
//! ledger.clear();
//! assert!(!ledger.should_skip("cmd+space", 2));
//!
//! let mut cycles = CycleDetector::new(5);
//! for sig in ["a", "b", "a", "b"] {
//!     cycles.record(sig);
//! }
//! assert_eq!(cycles.detect_cycle(), Some(2)); // a,b repeats
//! ```

use std::collections::HashMap;

// ─────────────────────────────────────────────────────────────────────────────
// HotkeyLedger
// ─────────────────────────────────────────────────────────────────────────────

/// Per-key execution counts since the last visible UI change.
///
/// Keys are normalised combo strings (`"cmd+space"`) or app-open markers
/// (`"open_app:calculator"`); the ledger itself is agnostic.
#[derive(Default)]
pub struct HotkeyLedger {
    counts: HashMap<String, u32>,
}

impl HotkeyLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `key` has already executed `limit` times since the last
    /// clear and should be skipped.
    pub fn should_skip(&self, key: &str, limit: u32) -> bool {
        self.counts.get(key).copied().unwrap_or(0) >= limit
    }

    /// Record one execution of `key`.
    pub fn record(&mut self, key: &str) {
        *self.counts.entry(key.to_string()).or_insert(0) += 1;
    }

    pub fn count(&self, key: &str) -> u32 {
        self.counts.get(key).copied().unwrap_or(0)
    }

    /// Forget everything; called whenever the UI visibly changed.
    pub fn clear(&mut self) {
        self.counts.clear();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// CycleDetector
// ─────────────────────────────────────────────────────────────────────────────

/// N-gram cycle detection over action signatures.
pub struct CycleDetector {
    signatures: Vec<String>,
    /// Largest cycle length checked; cycles of length 2..=max are detected.
    max_cycle_len: usize,
}

impl CycleDetector {
    pub fn new(max_cycle_len: usize) -> Self {
        Self {
            signatures: Vec::new(),
            max_cycle_len,
        }
    }

    /// Record the signature of the action that just executed.
    pub fn record(&mut self, signature: &str) {
        self.signatures.push(signature.to_string());
        // Only the last 2 × max window matters; bound the memory.
        let keep = self.max_cycle_len * 2;
        if self.signatures.len() > keep * 4 {
            self.signatures.drain(..self.signatures.len() - keep);
        }
    }

    /// Return the cycle length when the last `k` signatures equal the
    /// preceding `k` for some `k` in `2..=max_cycle_len`.
    pub fn detect_cycle(&self) -> Option<usize> {
        let n = self.signatures.len();
        for k in 2..=self.max_cycle_len {
            if n >= 2 * k && self.signatures[n - k..] == self.signatures[n - 2 * k..n - k] {
                return Some(k);
            }
        }
        None
    }

    /// Clear all recorded signatures.
    pub fn reset(&mut self) {
        self.signatures.clear();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
