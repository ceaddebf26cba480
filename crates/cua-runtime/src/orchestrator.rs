//! [`Orchestrator`] – the perceive-plan-act-verify iteration engine.
//!
//! One orchestrator drives one task at a time: it captures the screen,
//! grounds it against the accessibility tree, overlays numbered marks, asks
//! the executor for one action, routes it through the policy-gated router,
//! waits for the UI to settle, re-perceives, blends the change signals,
//! reflects on step completion, and advances or repairs the plan, until the
//! plan completes, the executor yields, a halt bound trips, or recovery
//! budgets run dry.
//!
//! Stall defence is layered: hotkey/app-open dedup ledgers (cleared by any
//! visible change), same-action and no-change repeat counters, an n-gram
//! cycle detector for A-B-A-B oscillation, and a low-visual-change streak.
//! Any of them can declare the loop stuck; recovery first asks the reflector
//! for a hint, then the planner for a revision, and halts only when both
//! budgets are exhausted without producing something new.
//!
//! Every driver error is an [`ActionResult`] routed through state; only
//! adapter health-check failures abort a task. The loop never panics on a
//! single bad action.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{info, warn};

use cua_computer::{Computer, load_computer};
use cua_kernel::PolicyEngine;
use cua_memory::{Embedder, Episode, EpisodeOutcome, MemoryStore};
use cua_perception::{
    ChangeDetector, ax, ax_trees_differ, draw_som_overlay, flatten_with_frames,
    hamming_distance_hex, prune_for_prompt, summarize_for_prompt,
};
use cua_perception::change::PIXEL_CHANGE_RATIO;
use cua_types::{Action, ActionResult, AxNode, CuaError, Plan, Settings, Step, StepStatus};

use crate::embedder::EmbeddingClient;
use crate::executor::{Executor, ExecutorAdapter, ExecutorTurn, LoopState, RepeatInfo};
use crate::guard::{CycleDetector, HotkeyLedger};
use crate::planner::{Planner, PlannerAdapter};
use crate::reflector::{Reflector, ReflectorAdapter, ReflectionStatus};
use crate::router::ActionRouter;
use crate::state::{SessionSummary, StateTracker};

// ─────────────────────────────────────────────────────────────────────────────
// Tunables
// ─────────────────────────────────────────────────────────────────────────────

/// Hamming distance at or below which two hashes count as the same screen.
const PHASH_STATIC_THRESHOLD: u32 = 1;
/// Consecutive minimal-change interactive frames before `visual_stagnation`.
const STAGNATION_LIMIT: u32 = 5;
/// Reflector hints available per task.
const MAX_HINTS: u32 = 3;
/// Plan revisions available per task.
const MAX_PLAN_REVISIONS: u32 = 3;
/// Identical consecutive actions before `repeat_same_action`.
const REPEAT_SAME_ACTION_LIMIT: u32 = 3;
/// Identical unchanged actions before `repeat_without_change`.
const REPEAT_WITHOUT_CHANGE_LIMIT: u32 = 2;
/// Failures that trigger the replan guard.
const REPLAN_FAILURE_THRESHOLD: u32 = 3;
/// Executions of one hotkey combo allowed without an intervening change.
const HOTKEY_DEDUP_LIMIT: u32 = 2;
/// Executions of one app-open allowed without an intervening change.
const OPEN_APP_DEDUP_LIMIT: u32 = 1;
/// Largest oscillation period the cycle detector checks.
const CYCLE_WINDOW: usize = 5;
/// History length that triggers context compression.
const HISTORY_COMPRESS_THRESHOLD: usize = 60;
/// Extra settle time after launcher-style combos (Spotlight et al.).
const SPOTLIGHT_EXTRA_DELAY_MS: u64 = 800;
/// History lines shown to the executor each turn.
const EXECUTOR_HISTORY_TAIL: usize = 10;

/// Combos that act on the whole desktop rather than the focused window; when
/// one produces no visible change the executor is nudged toward clicking
/// visible UI instead.
const GLOBAL_HOTKEYS: &[&str] = &[
    "cmd+space",
    "command+space",
    "cmd+tab",
    "command+tab",
    "alt+tab",
    "win",
];

// ─────────────────────────────────────────────────────────────────────────────
// Loop-local counters
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct LoopCounters {
    repeat_same: u32,
    repeat_without_change: u32,
    last_sig: Option<String>,
    low_change_streak: u32,
    hint_count: u32,
    plan_revision_count: u32,
    repeat_info: Option<RepeatInfo>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Orchestrator
// ─────────────────────────────────────────────────────────────────────────────

/// The iteration engine. Owns the plan, the state tracker, and every wired
/// component for the duration of a task.
pub struct Orchestrator {
    settings: Settings,
    computer: Box<dyn Computer>,
    router: ActionRouter,
    executor: Box<dyn Executor>,
    planner: Box<dyn Planner>,
    reflector: Box<dyn Reflector>,
    memory: MemoryStore,
    detector: ChangeDetector,
    cancel: Arc<AtomicBool>,
}

impl Orchestrator {
    /// Wire the production stack: policy rules from disk, LLM-backed
    /// adapters, file-backed memory, the requested computer adapter.
    pub fn from_settings(settings: Settings, adapter: Option<&str>) -> Result<Self, CuaError> {
        let computer = load_computer(&settings, adapter)?;
        Self::from_settings_with_computer(settings, computer)
    }

    /// Same wiring, but with an already-constructed computer adapter.
    pub fn from_settings_with_computer(
        settings: Settings,
        computer: Box<dyn Computer>,
    ) -> Result<Self, CuaError> {
        if !settings.enable_hid {
            warn!("ENABLE_HID is false; actions will run in dry-run mode (no real input)");
        }
        let policy = PolicyEngine::load(&settings.safety_rules_path, &settings);
        let router = ActionRouter::new(policy, settings.clone());
        let executor = Box::new(ExecutorAdapter::new(
            &settings,
            computer.system_info(),
            computer.display(),
        ));
        let planner = Box::new(PlannerAdapter::new(&settings));
        let reflector = Box::new(ReflectorAdapter::new(&settings));
        let embedder =
            EmbeddingClient::from_settings(&settings).map(|c| Arc::new(c) as Arc<dyn Embedder>);
        let memory_root = settings
            .memory_root
            .clone()
            .unwrap_or_else(|| ".agent_memory".to_string());
        let memory = MemoryStore::open(memory_root, embedder).map_err(|err| CuaError::Adapter {
            component: "memory".into(),
            details: err.to_string(),
        })?;
        Ok(Self::new(
            settings, computer, router, executor, planner, reflector, memory,
        ))
    }

    /// Explicit wiring: each component constructed once and passed down, no
    /// back-edges. Tests use this with scripted components.
    pub fn new(
        settings: Settings,
        computer: Box<dyn Computer>,
        router: ActionRouter,
        executor: Box<dyn Executor>,
        planner: Box<dyn Planner>,
        reflector: Box<dyn Reflector>,
        memory: MemoryStore,
    ) -> Self {
        let detector = ChangeDetector::new(settings.ssim_change_threshold, PHASH_STATIC_THRESHOLD);
        Self {
            settings,
            computer,
            router,
            executor,
            planner,
            reflector,
            memory,
            detector,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cancellation flag for Ctrl-C handlers. Setting it lets the in-flight
    /// action finish and transitions cleanly to episode persistence.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Task entry
    // ─────────────────────────────────────────────────────────────────────────

    /// Run one task to completion and persist its episode.
    ///
    /// # Errors
    ///
    /// Only unrecoverable faults abort: adapter health-check failures and a
    /// broken capture pipeline. Everything else is absorbed into the session.
    pub async fn run_task(&mut self, user_prompt: &str) -> Result<SessionSummary, CuaError> {
        self.computer.run_health_checks(&self.settings)?;

        // Capture context first for grounded planning.
        let (initial_frame, initial_hash) = self.computer.capture_with_hash()?;
        let prior_episodes = self.memory.list_episodes();
        let prior_semantic = self.memory.search_semantic(user_prompt, 5).await;
        let plan = self
            .planner
            .make_plan(
                user_prompt,
                &prior_episodes,
                &prior_semantic,
                Some(&initial_frame),
            )
            .await;
        info!(plan_id = %plan.id, steps = plan.steps.len(), "plan created");

        self.run_session(user_prompt, plan, initial_frame, initial_hash)
            .await
    }

    async fn run_session(
        &mut self,
        user_prompt: &str,
        mut plan: Plan,
        initial_frame: String,
        initial_hash: String,
    ) -> Result<SessionSummary, CuaError> {
        let mut state = StateTracker::new(
            self.settings.max_steps,
            self.settings.max_failures,
            self.settings.max_wall_clock_seconds,
        );
        state.history.push(format!("plan_init:{}", plan.summary_line()));
        state.history.push(format!("user_prompt:{user_prompt}"));

        let mut current_frame = initial_frame;
        let mut current_hash = initial_hash;
        state.record_observation(
            &current_frame,
            true,
            &format!("initial capture for: {user_prompt}"),
            Some(current_hash.clone()),
            None,
        );

        let mut counters = LoopCounters::default();
        let mut hotkeys = HotkeyLedger::new();
        let mut cycles = CycleDetector::new(CYCLE_WINDOW);

        while !state.should_halt() {
            if self.cancel.load(Ordering::SeqCst) {
                info!("session cancelled by user");
                state.history.push("session_cancelled".to_string());
                break;
            }

            // ── 1. Replan guard ──────────────────────────────────────────────
            if counters.plan_revision_count < MAX_PLAN_REVISIONS
                && should_replan(&plan, &state, &counters)
            {
                let revised = self
                    .planner
                    .revise_plan(&plan, &state.history, &current_frame)
                    .await;
                if revised != plan {
                    counters.plan_revision_count += 1;
                    info!(
                        step_index = revised.current_step_index,
                        "plan revised (auto)"
                    );
                    state.history.push(format!(
                        "plan_revised:auto:step_index={}",
                        revised.current_step_index
                    ));
                }
                plan = revised;
                counters.repeat_same = 0;
                counters.repeat_without_change = 0;
                counters.last_sig = None;
                counters.repeat_info = None;
            }

            // ── 2. Context compression ───────────────────────────────────────
            self.compress_history(&mut state).await;

            // ── 3. Semantic grounding + Set-of-Mark overlay ──────────────────
            let ax_tree = self.fetch_pruned_tree();
            let (overlay_frame, tags) = match &ax_tree {
                Some(tree) => {
                    let nodes = flatten_with_frames(tree, ax::FLATTEN_MAX_NODES);
                    draw_som_overlay(&current_frame, &nodes, &self.computer.display())
                }
                None => (current_frame.clone(), Vec::new()),
            };
            let ax_summary = ax_tree
                .as_ref()
                .map(|tree| summarize_for_prompt(tree, ax::SUMMARY_MAX_DEPTH, ax::SUMMARY_NODE_BUDGET));

            // ── 4. Propose ───────────────────────────────────────────────────
            let current_step = plan.current_step().cloned();
            let turn = ExecutorTurn {
                frame_b64: overlay_frame,
                user_prompt: user_prompt.to_string(),
                history_tail: history_tail(&state.history, EXECUTOR_HISTORY_TAIL),
                plan: Some(plan.clone()),
                current_step: current_step.clone(),
                loop_state: LoopState {
                    current_step_id: current_step.as_ref().map(|s| s.id),
                    current_step_status: current_step
                        .as_ref()
                        .map(|s| s.status.as_str().to_string()),
                    failure_count: state.failure_count,
                    steps_taken: state.steps,
                    repeat_same_action: counters.repeat_same,
                    repeat_without_change: counters.repeat_without_change,
                    notebook_summary: state.notebook_summary(),
                },
                ax_summary,
                tags: tags.clone(),
                repeat_info: counters.repeat_info.clone(),
            };
            let mut action = self.executor.propose_action(turn).await;

            if let Action::Noop { reason } = &action {
                info!(reason = %reason, "noop action requested; stopping loop");
                break;
            }

            // ── 5. Resolve marks ─────────────────────────────────────────────
            let resolved = action.resolve_elements(&|id| {
                tags.iter().find(|tag| tag.id == id).map(|tag| tag.frame.center())
            });
            if !resolved {
                let result = ActionResult::fail("element_id not found");
                state.record_action(&action, &result);
                counters.repeat_info = Some(RepeatInfo {
                    count: counters.repeat_same,
                    action: action.signature(),
                    hint: Some("element_id not found; request a fresh inspect_ui".into()),
                });
                continue;
            }

            // ── 6. Side-channel: notebook ops mutate state, no input ─────────
            if let Action::NotebookOp { op, content, source } = &action {
                let result = match op {
                    cua_types::NotebookCommand::AddNote => {
                        state.add_note(content, source);
                        ActionResult::ok("note added")
                    }
                    cua_types::NotebookCommand::ClearNotes => {
                        state.clear_notebook();
                        ActionResult::ok("notes cleared")
                    }
                };
                state.record_action(&action, &result);
                continue;
            }

            // ── 7. Dedup guards ──────────────────────────────────────────────
            if let Some(dedup_reason) = self.dedup_check(&mut hotkeys, &action) {
                let result = ActionResult::fail(dedup_reason);
                info!(kind = action.kind(), reason = %result.reason, "skipping deduplicated action");
                state.record_action(&action, &result);

                let sig = action.signature();
                if counters.last_sig.as_deref() == Some(sig.as_str()) {
                    counters.repeat_same += 1;
                }
                counters.repeat_info = Some(RepeatInfo {
                    count: counters.repeat_same,
                    action: sig,
                    hint: None,
                });
                if counters.repeat_same >= REPEAT_SAME_ACTION_LIMIT {
                    let reason = format!("repeat_same_action:{}", counters.repeat_same);
                    if !self
                        .recover_from_stuck(&mut plan, &mut state, &mut counters, &current_frame, &reason)
                        .await
                    {
                        break;
                    }
                }
                continue;
            }

            // ── 8. Execute ───────────────────────────────────────────────────
            let result = self
                .router
                .route(&mut *self.computer, &self.memory, &action)
                .await;
            state.record_action(&action, &result);

            // ── 9. Settle ────────────────────────────────────────────────────
            let verify_after = action.verify_after();
            self.settle(&action, verify_after).await;

            // ── 10. Re-perceive + change detection ───────────────────────────
            let (next_frame, next_hash) = self.computer.capture_with_hash()?;
            let hash_distance = hamming_distance_hex(&current_hash, &next_hash);
            let mut ax_changed = false;
            let (changed, obs_note) = if verify_after {
                let ssim = self
                    .computer
                    .structural_similarity(&current_frame, &next_frame);
                let ax_after = self.fetch_pruned_tree();
                ax_changed = ax_trees_differ(ax_tree.as_ref(), ax_after.as_ref());
                let changed = self.detector.evaluate(ax_changed, ssim, hash_distance, || {
                    self.computer
                        .has_changed(&current_frame, &next_frame, PIXEL_CHANGE_RATIO)
                });
                (changed, "")
            } else {
                // Optimistic mode: assume change, skip the heavy checks.
                (true, "verify_skipped")
            };
            state.record_observation(
                &next_frame,
                changed,
                obs_note,
                Some(next_hash.clone()),
                Some(hash_distance),
            );

            // ── 17 (early). Skill mining for successful visible macros ───────
            self.maybe_save_skill(&action, &result, plan.current_step(), user_prompt, changed)
                .await;

            if changed {
                // The screen moved; every hotkey is fresh again.
                hotkeys.clear();
            } else {
                info!(kind = action.kind(), "no UI change detected after action");
            }

            // ── 11. Stagnation accounting ────────────────────────────────────
            if verify_after
                && hash_distance <= PHASH_STATIC_THRESHOLD
                && action.is_interactive()
                && !ax_changed
            {
                counters.low_change_streak += 1;
            } else {
                counters.low_change_streak = 0;
            }

            // ── 12. Cycle detection ──────────────────────────────────────────
            let action_sig = action.signature();
            cycles.record(&action_sig);
            let cycle_len = cycles.detect_cycle();

            // ── 13. Reflect ──────────────────────────────────────────────────
            if let Some(step) = plan.current_step().cloned() {
                let mut step_completed = false;
                let mut reflection = None;
                if self.reflector.available() {
                    let verdict = self
                        .reflector
                        .evaluate_step(&step, &state.history, &next_frame, changed)
                        .await;
                    step_completed = verdict.is_complete;
                    reflection = Some(verdict);
                } else if !self.settings.strict_step_completion {
                    step_completed = heuristic_step_complete(&step, &action, &result, changed);
                }

                if let Some(verdict) = &reflection
                    && verdict.status == ReflectionStatus::Failed
                {
                    warn!(
                        step_id = step.id,
                        failure_type = verdict.failure_type.as_str(),
                        reason = %verdict.reason,
                        "step failed verification"
                    );
                    state.history.push(format!(
                        "reflector_fail:{}:{}",
                        verdict.failure_type.as_str(),
                        verdict.reason
                    ));
                    plan.fail_current(format!(
                        "Reflector blocked: {} - {}",
                        verdict.failure_type.as_str(),
                        verdict.reason
                    ));
                    if !step.recovery_steps.is_empty() {
                        let suggestion = step.recovery_steps.join(", ");
                        state
                            .history
                            .push(format!("recovery_suggestion: Step failed. Try: {suggestion}"));
                        counters.repeat_info = Some(RepeatInfo {
                            count: counters.repeat_same,
                            action: action_sig.clone(),
                            hint: Some(format!("Verification failed. Try: {suggestion}")),
                        });
                    }
                }

                if step_completed {
                    let finished_id = step.id;
                    if self.reflector.available() {
                        let description = self.reflector.describe_image(&next_frame).await;
                        if !description.is_empty() {
                            let mut metadata = std::collections::BTreeMap::new();
                            metadata.insert("step_id".to_string(), serde_json::json!(finished_id));
                            metadata.insert("plan_id".to_string(), serde_json::json!(plan.id));
                            if let Err(err) = self
                                .memory
                                .add_semantic_item(
                                    format!("Visual state after step {finished_id}: {description}"),
                                    metadata,
                                )
                                .await
                            {
                                warn!(error = %err, "failed to save visual memory");
                            } else {
                                info!(step_id = finished_id, "saved visual memory for step");
                            }
                        }
                    }

                    plan.advance();
                    hotkeys.clear();
                    state
                        .history
                        .push(format!("plan_step_completed:{finished_id}"));
                    info!(step_index = plan.current_step_index, "advanced plan");
                    if plan.is_complete() {
                        info!("plan completed; stopping loop");
                        break;
                    }
                }
            }

            // ── 14. Repeat accounting ────────────────────────────────────────
            let is_wait = matches!(action, Action::Wait { .. });
            let mut pending_break = false;
            let mut break_reason = String::new();

            if let Some(k) = cycle_len {
                pending_break = true;
                break_reason = "oscillatory_loop".to_string();
                warn!(cycle_len = k, "oscillatory loop detected");
            }

            if !is_wait && !pending_break {
                if counters.last_sig.as_deref() == Some(action_sig.as_str()) {
                    counters.repeat_same += 1;
                    if counters.repeat_same >= REPEAT_SAME_ACTION_LIMIT {
                        pending_break = true;
                        break_reason = format!("repeat_same_action:{}", counters.repeat_same);
                    }
                } else {
                    counters.repeat_same = 0;
                }
                if !changed && counters.last_sig.as_deref() == Some(action_sig.as_str()) {
                    counters.repeat_without_change += 1;
                    if counters.repeat_without_change >= REPEAT_WITHOUT_CHANGE_LIMIT {
                        pending_break = true;
                        if break_reason.is_empty() {
                            break_reason = "repeat_without_change".to_string();
                        }
                    }
                } else {
                    counters.repeat_without_change = 0;
                }
            } else if is_wait {
                counters.repeat_same = 0;
                counters.repeat_without_change = 0;
            }

            if !pending_break && counters.low_change_streak >= STAGNATION_LIMIT {
                pending_break = true;
                break_reason = "visual_stagnation".to_string();
                state
                    .history
                    .push(format!("visual_stagnation:hash_dist={hash_distance}"));
            }

            // ── 15. Global hotkey hint ───────────────────────────────────────
            if let Some(combo) = action.hotkey_combo()
                && GLOBAL_HOTKEYS.contains(&combo.as_str())
                && !changed
            {
                state
                    .history
                    .push(format!("global_hotkey_no_effect:{combo}"));
                counters.repeat_info = Some(RepeatInfo {
                    count: counters.repeat_same,
                    action: action_sig.clone(),
                    hint: Some(
                        "Global hotkey had no visible effect; prefer clicking the visible app or window."
                            .into(),
                    ),
                });
            }

            // ── 16. Stuck recovery ───────────────────────────────────────────
            if pending_break {
                if !self
                    .recover_from_stuck(&mut plan, &mut state, &mut counters, &next_frame, &break_reason)
                    .await
                {
                    break;
                }
                if counters.repeat_info.is_none() {
                    counters.repeat_info = Some(RepeatInfo {
                        count: 0,
                        action: action_sig,
                        hint: None,
                    });
                }
                current_frame = next_frame;
                current_hash = next_hash;
                continue;
            }

            counters.last_sig = Some(action_sig.clone());
            if counters
                .repeat_info
                .as_ref()
                .is_none_or(|info| info.hint.is_none())
            {
                counters.repeat_info = Some(RepeatInfo {
                    count: counters.repeat_same,
                    action: action_sig,
                    hint: None,
                });
            }

            current_frame = next_frame;
            current_hash = next_hash;
        }

        // ── Persistence ──────────────────────────────────────────────────────
        let outcome = self.persist_episode(user_prompt, &state, &plan).await;
        state.cleanup();

        let mut summary = state.summary();
        summary.plan = Some(plan);
        summary.outcome = Some(outcome);
        info!(
            steps = summary.steps,
            failures = summary.failures,
            outcome = ?outcome,
            "session finished"
        );
        Ok(summary)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Iteration helpers
    // ─────────────────────────────────────────────────────────────────────────

    /// Fetch and prune the focused-window accessibility tree, when semantic
    /// grounding is enabled and the adapter can provide one.
    fn fetch_pruned_tree(&mut self) -> Option<AxNode> {
        if !self.settings.enable_semantic {
            return None;
        }
        let result = self
            .computer
            .get_active_window_tree(ax::PRUNE_MAX_DEPTH);
        if !result.success {
            return None;
        }
        let raw = result.metadata.get("tree")?;
        let tree: AxNode = serde_json::from_value(raw.clone()).ok()?;
        prune_for_prompt(&tree, ax::PRUNE_MAX_NODES, ax::PRUNE_MAX_DEPTH)
    }

    /// Dedup verdict for hotkeys and app opens; `Some(reason)` means skip.
    fn dedup_check(&self, hotkeys: &mut HotkeyLedger, action: &Action) -> Option<String> {
        if let Some(combo) = action.hotkey_combo() {
            if hotkeys.should_skip(&combo, HOTKEY_DEDUP_LIMIT) {
                return Some("hotkey deduped".to_string());
            }
            hotkeys.record(&combo);
            return None;
        }
        if let Action::OpenApp { app_name, .. } = action {
            let key = format!("open_app:{}", app_name.to_lowercase());
            if hotkeys.should_skip(&key, OPEN_APP_DEDUP_LIMIT) {
                return Some("app open deduped".to_string());
            }
            hotkeys.record(&key);
        }
        None
    }

    /// Settle policy: `max(verify_delay, settle_delay-if-interactive)` plus a
    /// fixed extra for launcher combos whose UI fades in slowly.
    async fn settle(&self, action: &Action, verify_after: bool) {
        if !verify_after {
            return;
        }
        let base = self.settings.verify_delay_ms;
        let settle = if action.is_interactive() {
            self.settings.settle_delay_ms
        } else {
            0
        };
        let extra = match action {
            Action::Key { keys, .. } => {
                let lowered: Vec<String> = keys.iter().map(|k| k.to_lowercase()).collect();
                let spotlight = lowered.iter().any(|k| k == "space")
                    && lowered.iter().any(|k| k == "cmd" || k == "command");
                if spotlight { SPOTLIGHT_EXTRA_DELAY_MS } else { 0 }
            }
            _ => 0,
        };
        let total_ms = base.max(settle) + extra;
        if total_ms > 0 {
            tokio::time::sleep(Duration::from_millis(total_ms)).await;
        }
    }

    /// Hint-then-replan recovery. Returns `true` when either produced
    /// something new (loop continues) and `false` when both budgets are
    /// exhausted (loop halts).
    async fn recover_from_stuck(
        &mut self,
        plan: &mut Plan,
        state: &mut StateTracker,
        counters: &mut LoopCounters,
        frame_b64: &str,
        break_reason: &str,
    ) -> bool {
        if let Some(step) = plan.current_step() {
            let step_id = step.id;
            plan.fail_current(break_reason);
            state
                .history
                .push(format!("plan_step_failed:{step_id}:{break_reason}"));
        }
        state.record_stuck(break_reason);

        let mut recovered = false;
        if self.reflector.available() && counters.hint_count < MAX_HINTS {
            let hint = self
                .reflector
                .suggest_hint(plan.current_step(), &state.history, frame_b64)
                .await;
            if !hint.is_empty() {
                counters.hint_count += 1;
                state.history.push(format!("reflector_hint:{hint}"));
                counters.repeat_info = Some(RepeatInfo {
                    count: counters.repeat_same,
                    action: counters.last_sig.clone().unwrap_or_default(),
                    hint: Some(hint.clone()),
                });
                info!(hint = %hint, "injected reflector hint to unblock");
                recovered = true;
            }
        }

        if counters.plan_revision_count < MAX_PLAN_REVISIONS {
            let revised = self
                .planner
                .revise_plan(plan, &state.history, frame_b64)
                .await;
            if revised != *plan {
                counters.plan_revision_count += 1;
                state.history.push(format!(
                    "plan_revised:stuck:step_index={}",
                    revised.current_step_index
                ));
                info!(
                    step_index = revised.current_step_index,
                    "plan revised after stuck"
                );
                recovered = true;
            }
            *plan = revised;
        }

        counters.repeat_same = 0;
        counters.repeat_without_change = 0;
        counters.last_sig = None;
        counters.low_change_streak = 0;

        if !recovered {
            info!(break_reason = %break_reason, "breaking loop");
        }
        recovered
    }

    /// Summarise history lines [1..=20] into one line once the log outgrows
    /// the prompt budget, keeping index 0 (plan init) verbatim.
    async fn compress_history(&mut self, state: &mut StateTracker) {
        if state.history.len() <= HISTORY_COMPRESS_THRESHOLD {
            return;
        }
        let chunk: Vec<String> = state.history[1..21].to_vec();
        let summary = self.planner.summarize_history_chunk(&chunk).await;
        if summary.is_empty() {
            return;
        }
        info!(compressed = chunk.len(), "compressing history");
        let mut new_history = vec![
            state.history[0].clone(),
            format!("history_summary:{summary}"),
        ];
        new_history.extend_from_slice(&state.history[21..]);
        state.history = new_history;
    }

    /// Persist a successful, visibly-effective macro as a reusable skill,
    /// keyed to the current plan step.
    async fn maybe_save_skill(
        &mut self,
        action: &Action,
        result: &ActionResult,
        step: Option<&Step>,
        user_prompt: &str,
        changed: bool,
    ) {
        let Action::MacroActions { actions, .. } = action else {
            return;
        };
        if !result.success || !changed {
            return;
        }

        let name_seed = step
            .map(|s| s.description.clone())
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| user_prompt.to_string());
        let mut name = slugify(&name_seed);
        name.truncate(50);
        if name.is_empty() {
            name = format!("macro-{}", chrono::Utc::now().timestamp());
        }
        let description = step
            .map(|s| {
                if s.success_criteria.is_empty() {
                    s.description.clone()
                } else {
                    s.success_criteria.clone()
                }
            })
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| user_prompt.to_string());
        let mut tags = vec!["macro".to_string()];
        if let Some(s) = step {
            tags.push(format!("step:{}", s.id));
        }

        match self
            .memory
            .save_skill(
                &name,
                &description,
                actions.clone(),
                tags,
                Some(user_prompt.to_string()),
                step.map(|s| s.id),
            )
            .await
        {
            Ok(skill) => info!(skill = %skill.name, fingerprint = %skill.fingerprint, "procedural skill saved"),
            Err(err) => warn!(error = %err, "failed to save procedural skill"),
        }
    }

    /// Write the episode log and record, returning the computed outcome.
    async fn persist_episode(
        &mut self,
        user_prompt: &str,
        state: &StateTracker,
        plan: &Plan,
    ) -> EpisodeOutcome {
        let mut outcome = EpisodeOutcome::Success;
        if state.failure_count > 0 {
            outcome = EpisodeOutcome::Mixed;
        }
        if plan.current_step().is_some() {
            outcome = EpisodeOutcome::Incomplete;
        }

        let summary = self
            .planner
            .summarize_episode(user_prompt, &state.history, Some(plan))
            .await;

        let raw_log_path = match self.memory.write_episode_log(&plan.id, &state.history) {
            Ok(path) => Some(path.to_string_lossy().into_owned()),
            Err(err) => {
                warn!(error = %err, "failed to write episode log");
                None
            }
        };

        let episode = Episode {
            id: plan.id.clone(),
            created_at: state.started_at_unix(),
            user_prompt: user_prompt.to_string(),
            plan: serde_json::to_value(plan).unwrap_or(serde_json::Value::Null),
            outcome,
            summary,
            tags: vec!["desktop".to_string(), "cua".to_string()],
            raw_log_path,
        };
        if let Err(err) = self.memory.save_episode(&episode) {
            warn!(error = %err, "failed to persist episode");
        }
        outcome
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Free helpers
// ─────────────────────────────────────────────────────────────────────────────

fn should_replan(plan: &Plan, state: &StateTracker, counters: &LoopCounters) -> bool {
    let Some(step) = plan.current_step() else {
        return false;
    };
    counters.repeat_same >= REPEAT_SAME_ACTION_LIMIT
        || counters.repeat_without_change >= REPEAT_WITHOUT_CHANGE_LIMIT
        || state.failure_count >= REPLAN_FAILURE_THRESHOLD
        || step.status == StepStatus::Failed
}

/// Conservative completion fallback when reflection is unavailable: the step
/// counts as done only after a successful, visibly-changing, direct UI
/// interaction.
fn heuristic_step_complete(
    step: &Step,
    action: &Action,
    result: &ActionResult,
    changed: bool,
) -> bool {
    if !result.success || !changed {
        return false;
    }
    if step.status == StepStatus::Failed {
        return false;
    }
    matches!(
        action,
        Action::LeftClick { .. }
            | Action::DoubleClick { .. }
            | Action::RightClick { .. }
            | Action::Type { .. }
            | Action::Scroll { .. }
            | Action::Key { .. }
            | Action::MouseMove { .. }
            | Action::OpenApp { .. }
    )
}

fn history_tail(history: &[String], n: usize) -> Vec<String> {
    let start = history.len().saturating_sub(n);
    history[start..].to_vec()
}

fn slugify(text: &str) -> String {
    let mut slug = String::new();
    let mut last_dash = true;
    for ch in text.trim().to_lowercase().chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch);
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cua_computer::SimComputer;
    use cua_kernel::SafetyRules;
    use cua_memory::SemanticMemoryItem;
    use cua_types::{ActionResult as AR, DisplayInfo, Settings, UiElement};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicU32;

    use crate::reflector::{FailureKind, StepReflection};

    // ── Scripted components ──────────────────────────────────────────────────

    struct ScriptedExecutor {
        actions: VecDeque<Action>,
    }

    impl ScriptedExecutor {
        fn new(actions: Vec<Action>) -> Self {
            Self {
                actions: actions.into(),
            }
        }
    }

    #[async_trait]
    impl Executor for ScriptedExecutor {
        async fn propose_action(&mut self, _turn: ExecutorTurn) -> Action {
            self.actions.pop_front().unwrap_or(Action::Noop {
                reason: "script exhausted".into(),
            })
        }
    }

    struct ScriptedPlanner {
        plan: Plan,
        revisions: VecDeque<Plan>,
        revise_calls: Arc<AtomicU32>,
    }

    impl ScriptedPlanner {
        fn new(plan: Plan) -> Self {
            Self {
                plan,
                revisions: VecDeque::new(),
                revise_calls: Arc::new(AtomicU32::new(0)),
            }
        }

        fn with_revision(mut self, plan: Plan) -> Self {
            self.revisions.push_back(plan);
            self
        }
    }

    #[async_trait]
    impl Planner for ScriptedPlanner {
        async fn make_plan(
            &mut self,
            _user_prompt: &str,
            _episodes: &[Episode],
            _semantic: &[SemanticMemoryItem],
            _screenshot_b64: Option<&str>,
        ) -> Plan {
            self.plan.clone()
        }

        async fn revise_plan(
            &mut self,
            plan: &Plan,
            _history: &[String],
            _screenshot_b64: &str,
        ) -> Plan {
            self.revise_calls.fetch_add(1, Ordering::SeqCst);
            self.revisions.pop_front().unwrap_or_else(|| plan.clone())
        }

        async fn summarize_episode(
            &mut self,
            _user_prompt: &str,
            _history: &[String],
            _plan: Option<&Plan>,
        ) -> String {
            "scripted summary".into()
        }

        async fn summarize_history_chunk(&mut self, _chunk: &[String]) -> String {
            String::new()
        }
    }

    struct NullReflector;

    #[async_trait]
    impl Reflector for NullReflector {
        fn available(&self) -> bool {
            false
        }
        async fn evaluate_step(
            &mut self,
            _step: &Step,
            _history: &[String],
            _frame_b64: &str,
            _changed: bool,
        ) -> StepReflection {
            StepReflection::incomplete("null reflector")
        }
        async fn suggest_hint(
            &mut self,
            _step: Option<&Step>,
            _history: &[String],
            _frame_b64: &str,
        ) -> String {
            String::new()
        }
        async fn describe_image(&mut self, _frame_b64: &str) -> String {
            String::new()
        }
    }

    struct ScriptedReflector {
        verdicts: VecDeque<StepReflection>,
    }

    #[async_trait]
    impl Reflector for ScriptedReflector {
        fn available(&self) -> bool {
            true
        }
        async fn evaluate_step(
            &mut self,
            _step: &Step,
            _history: &[String],
            _frame_b64: &str,
            _changed: bool,
        ) -> StepReflection {
            self.verdicts
                .pop_front()
                .unwrap_or_else(|| StepReflection::incomplete("script exhausted"))
        }
        async fn suggest_hint(
            &mut self,
            _step: Option<&Step>,
            _history: &[String],
            _frame_b64: &str,
        ) -> String {
            String::new()
        }
        async fn describe_image(&mut self, _frame_b64: &str) -> String {
            "Calculator in the foreground".into()
        }
    }

    /// Sim adapter wrapper that stays inspectable after the orchestrator
    /// takes ownership.
    #[derive(Clone)]
    struct SharedSim(Arc<Mutex<SimComputer>>);

    impl SharedSim {
        fn new(sim: SimComputer) -> Self {
            Self(Arc::new(Mutex::new(sim)))
        }

        fn executed_kinds(&self) -> Vec<String> {
            self.0
                .lock()
                .unwrap()
                .executed()
                .iter()
                .map(|a| a.kind().to_string())
                .collect()
        }
    }

    impl Computer for SharedSim {
        fn platform_name(&self) -> &str {
            "sim"
        }
        fn run_health_checks(&self, settings: &Settings) -> Result<(), CuaError> {
            self.0.lock().unwrap().run_health_checks(settings)
        }
        fn capture_with_hash(&mut self) -> Result<(String, String), CuaError> {
            self.0.lock().unwrap().capture_with_hash()
        }
        fn has_changed(&self, prev: &str, cur: &str, threshold: f64) -> bool {
            self.0.lock().unwrap().has_changed(prev, cur, threshold)
        }
        fn structural_similarity(&self, prev: &str, cur: &str) -> Option<f64> {
            self.0.lock().unwrap().structural_similarity(prev, cur)
        }
        fn detect_ui_elements(&self, image_b64: &str) -> Vec<UiElement> {
            self.0.lock().unwrap().detect_ui_elements(image_b64)
        }
        fn get_active_window_tree(&mut self, max_depth: u32) -> AR {
            self.0.lock().unwrap().get_active_window_tree(max_depth)
        }
        fn execute(&mut self, action: &Action) -> AR {
            self.0.lock().unwrap().execute(action)
        }
        fn display(&self) -> DisplayInfo {
            self.0.lock().unwrap().display()
        }
    }

    // ── Harness ──────────────────────────────────────────────────────────────

    fn fast_settings() -> Settings {
        let mut settings = Settings::default();
        settings.verify_delay_ms = 0;
        settings.settle_delay_ms = 0;
        settings.enable_semantic = false;
        settings
    }

    struct Harness {
        orchestrator: Orchestrator,
        sim: SharedSim,
        memory_root: std::path::PathBuf,
        _dir: tempfile::TempDir,
        revise_calls: Arc<AtomicU32>,
    }

    fn harness(
        settings: Settings,
        sim: SimComputer,
        executor: Vec<Action>,
        planner: ScriptedPlanner,
        reflector: Box<dyn Reflector>,
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let memory_root = dir.path().join("memory");
        let memory = MemoryStore::open(&memory_root, None).unwrap();
        let router = ActionRouter::new(
            PolicyEngine::from_rules(SafetyRules::default(), &settings),
            settings.clone(),
        );
        let shared = SharedSim::new(sim);
        let revise_calls = Arc::clone(&planner.revise_calls);
        let orchestrator = Orchestrator::new(
            settings,
            Box::new(shared.clone()),
            router,
            Box::new(ScriptedExecutor::new(executor)),
            Box::new(planner),
            reflector,
            memory,
        );
        Harness {
            orchestrator,
            sim: shared,
            memory_root,
            _dir: dir,
            revise_calls,
        }
    }

    fn click(x: f64, y: f64) -> Action {
        Action::LeftClick {
            x: Some(x),
            y: Some(y),
            element_id: None,
            phantom_mode: None,
            verify_after: None,
        }
    }

    fn hotkey(keys: &[&str]) -> Action {
        Action::Key {
            keys: keys.iter().map(|k| k.to_string()).collect(),
            verify_after: None,
        }
    }

    // ── S1: immediate noop ───────────────────────────────────────────────────

    #[tokio::test]
    async fn s1_immediate_noop_ends_cleanly() {
        let planner = ScriptedPlanner::new(Plan::new("plan-s1", "idle", vec![]));
        let mut h = harness(
            fast_settings(),
            SimComputer::new(),
            vec![Action::Noop {
                reason: "nothing to do".into(),
            }],
            planner,
            Box::new(NullReflector),
        );

        let summary = h.orchestrator.run_task("idle").await.unwrap();
        assert_eq!(summary.steps, 0);
        assert_eq!(summary.outcome, Some(EpisodeOutcome::Success));

        // The episode log holds exactly the plan init and the user prompt.
        let log = std::fs::read_to_string(h.memory_root.join("logs/plan-s1.log")).unwrap();
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("plan_init:"));
        assert_eq!(lines[1], "user_prompt:idle");

        // An episode record was persisted.
        let reopened = MemoryStore::open(&h.memory_root, None).unwrap();
        let episodes = reopened.list_episodes();
        assert_eq!(episodes.len(), 1);
        assert_eq!(episodes[0].id, "plan-s1");
    }

    // ── S2: single click completes the plan ──────────────────────────────────

    #[tokio::test]
    async fn s2_single_click_completes_plan() {
        let mut sim = SimComputer::new();
        sim.push_frame("desktop");
        sim.push_frame("calculator window open");

        let plan = Plan::new(
            "plan-s2",
            "open calculator",
            vec![Step::new(0, "Open calculator", "Calculator window visible")],
        );
        let reflector = ScriptedReflector {
            verdicts: VecDeque::from([StepReflection {
                is_complete: true,
                status: ReflectionStatus::Success,
                failure_type: FailureKind::None,
                reason: "calculator visible".into(),
            }]),
        };
        let mut h = harness(
            fast_settings(),
            sim,
            vec![click(100.0, 200.0)],
            ScriptedPlanner::new(plan),
            Box::new(reflector),
        );

        let summary = h.orchestrator.run_task("open calculator").await.unwrap();
        assert_eq!(summary.outcome, Some(EpisodeOutcome::Success));
        let plan = summary.plan.unwrap();
        assert!(plan.is_complete());
        assert_eq!(plan.steps[0].status, StepStatus::Done);

        // A single atomic action is not a macro; no skill is mined.
        let reopened = MemoryStore::open(&h.memory_root, None).unwrap();
        assert!(reopened.list_skills().is_empty());

        // The click reached the HID layer exactly once.
        assert_eq!(h.sim.executed_kinds(), vec!["left_click"]);
    }

    // ── S3: hotkey dedup then stuck halt ─────────────────────────────────────

    #[tokio::test]
    async fn s3_hotkey_dedup_then_stuck_halt() {
        // Frames never change: the first capture repeats forever.
        let plan = Plan::new(
            "plan-s3",
            "open spotlight",
            vec![Step::new(0, "Open spotlight", "Spotlight bar visible")],
        );
        let keys: Vec<Action> = (0..8).map(|_| hotkey(&["cmd", "space"])).collect();
        let mut h = harness(
            fast_settings(),
            SimComputer::new(),
            keys,
            ScriptedPlanner::new(plan),
            Box::new(NullReflector),
        );

        let summary = h.orchestrator.run_task("open spotlight").await.unwrap();

        // Only the first two presses reached the HID layer.
        assert_eq!(h.sim.executed_kinds(), vec!["key", "key"]);
        // Later presses were deduped, visible in history.
        assert!(summary
            .history
            .iter()
            .any(|line| line.contains("hotkey deduped")));
        // The repeat counter drove the stuck reason.
        assert!(summary
            .stuck_reasons
            .iter()
            .any(|r| r.starts_with("repeat_same_action:3")));
        // Dedup rejections are not failures.
        assert_eq!(summary.failures, 0);
        assert_eq!(summary.outcome, Some(EpisodeOutcome::Incomplete));
    }

    // ── S4: policy denial ────────────────────────────────────────────────────

    #[tokio::test]
    async fn s4_policy_denial_counts_failure_without_dispatch() {
        let plan = Plan::new(
            "plan-s4",
            "clean up",
            vec![Step::new(0, "Clean up", "workspace tidy")],
        );
        let mut h = harness(
            fast_settings(),
            SimComputer::new(),
            vec![
                Action::SandboxShell {
                    cmd: "rm -rf /".into(),
                    cwd: None,
                    verify_after: None,
                },
                Action::Noop {
                    reason: "stop".into(),
                },
            ],
            ScriptedPlanner::new(plan),
            Box::new(NullReflector),
        );

        let summary = h.orchestrator.run_task("clean up").await.unwrap();
        assert_eq!(summary.failures, 1);
        assert!(h.sim.executed_kinds().is_empty());
        assert!(summary.history.iter().any(|line| {
            line.contains("not allowlisted") || line.contains("not found")
        }));
        assert_eq!(summary.outcome, Some(EpisodeOutcome::Incomplete));
    }

    // ── S5: macro skill mining with fingerprint dedup ────────────────────────

    #[tokio::test]
    async fn s5_macro_skill_mined_and_deduped() {
        let mut sim = SimComputer::new();
        // Every capture differs so each macro counts as a visible change.
        sim.push_frames(["f0", "f1", "f2", "f3"]);

        let plan = Plan::new(
            "plan-s5",
            "greet",
            vec![Step::new(0, "Send greeting", "greeting visible in the field")],
        );
        let macro_action = Action::MacroActions {
            actions: vec![
                click(10.0, 10.0),
                Action::Type {
                    text: "hello".into(),
                    x: None,
                    y: None,
                    element_id: None,
                    phantom_mode: None,
                    verify_after: None,
                },
                hotkey(&["enter"]),
            ],
            skill_id: None,
            skill_name: None,
        };
        let mut h = harness(
            fast_settings(),
            sim,
            vec![
                macro_action.clone(),
                macro_action,
                Action::Noop {
                    reason: "done".into(),
                },
            ],
            ScriptedPlanner::new(plan),
            Box::new(NullReflector),
        );

        let summary = h.orchestrator.run_task("greet").await.unwrap();
        assert_eq!(summary.failures, 0);

        let reopened = MemoryStore::open(&h.memory_root, None).unwrap();
        let skills = reopened.list_skills();
        assert_eq!(skills.len(), 1, "identical macros collapse by fingerprint");
        assert!(!skills[0].fingerprint.is_empty());
        assert_eq!(skills[0].usage_count, 1, "second save bumps usage");
        assert!(skills[0].tags.contains(&"macro".to_string()));
        assert!(skills[0].tags.contains(&"step:0".to_string()));
    }

    // ── S6: replan after stuck ───────────────────────────────────────────────

    #[tokio::test]
    async fn s6_replan_after_stuck_continues_loop() {
        // Frames never change, so two identical clicks trip
        // repeat_without_change.
        let plan = Plan::new(
            "plan-s6",
            "open settings",
            vec![
                Step::new(0, "Open menu", "menu visible"),
                Step::new(1, "Open settings", "settings visible"),
                Step::new(2, "Change option", "option changed"),
            ],
        );
        let mut revised = plan.clone();
        revised.steps[0].status = StepStatus::Done;
        revised.steps[1].status = StepStatus::Done;
        revised.normalize();
        assert_eq!(revised.current_step_index, 2);

        let planner = ScriptedPlanner::new(plan).with_revision(revised);
        let mut h = harness(
            fast_settings(),
            SimComputer::new(),
            vec![
                click(5.0, 5.0),
                click(5.0, 5.0),
                click(5.0, 5.0),
                Action::Noop {
                    reason: "stop".into(),
                },
            ],
            planner,
            Box::new(NullReflector),
        );

        let summary = h.orchestrator.run_task("open settings").await.unwrap();

        // One revision consumed from the budget.
        assert_eq!(h.revise_calls.load(Ordering::SeqCst), 1);
        assert!(summary
            .history
            .iter()
            .any(|line| line.starts_with("plan_revised:stuck:step_index=2")));
        // The loop continued after the revision rather than halting.
        assert_eq!(summary.plan.as_ref().unwrap().current_step_index, 2);
        assert_eq!(h.sim.executed_kinds().len(), 3);
    }

    // ── Halt bounds ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn loop_halts_at_max_steps() {
        let mut settings = fast_settings();
        settings.max_steps = 3;

        let mut sim = SimComputer::new();
        // Frames keep changing so no stall detector fires first.
        sim.push_frames(["a", "b", "c", "d", "e", "f", "g"]);

        let plan = Plan::new(
            "plan-halt",
            "busy work",
            vec![Step::new(0, "Do things", "things done")],
        );
        let clicks: Vec<Action> = (0..10).map(|i| click(i as f64, 0.0)).collect();
        let mut h = harness(
            settings,
            sim,
            clicks,
            ScriptedPlanner::new(plan),
            Box::new(NullReflector),
        );

        let summary = h.orchestrator.run_task("busy work").await.unwrap();
        assert_eq!(summary.steps, 3);
    }

    #[tokio::test]
    async fn health_check_failure_aborts_before_loop() {
        let mut sim = SimComputer::new();
        sim.fail_health("Screen Recording");
        let plan = Plan::new("plan-health", "x", vec![]);
        let mut h = harness(
            fast_settings(),
            sim,
            vec![],
            ScriptedPlanner::new(plan),
            Box::new(NullReflector),
        );
        let err = h.orchestrator.run_task("x").await.unwrap_err();
        assert!(matches!(err, CuaError::PermissionMissing(_)));
    }

    // ── Cancellation ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn cancellation_flag_transitions_to_persistence() {
        let plan = Plan::new(
            "plan-cancel",
            "long task",
            vec![Step::new(0, "Work", "work done")],
        );
        let clicks: Vec<Action> = (0..10).map(|i| click(i as f64, 0.0)).collect();
        let mut h = harness(
            fast_settings(),
            SimComputer::new(),
            clicks,
            ScriptedPlanner::new(plan),
            Box::new(NullReflector),
        );
        h.orchestrator.cancel_flag().store(true, Ordering::SeqCst);

        let summary = h.orchestrator.run_task("long task").await.unwrap();
        assert_eq!(summary.steps, 0);
        assert!(summary.history.iter().any(|l| l == "session_cancelled"));
        // The episode was still persisted.
        let reopened = MemoryStore::open(&h.memory_root, None).unwrap();
        assert_eq!(reopened.list_episodes().len(), 1);
    }

    // ── Unit helpers ─────────────────────────────────────────────────────────

    #[test]
    fn slugify_compacts_to_kebab() {
        assert_eq!(slugify("Open the Calculator!"), "open-the-calculator");
        assert_eq!(slugify("  --  "), "");
        assert_eq!(slugify("a  b"), "a-b");
    }

    #[test]
    fn heuristic_requires_direct_interaction() {
        let step = Step::new(0, "x", "y");
        let ok = AR::ok("done");
        assert!(heuristic_step_complete(&step, &click(1.0, 1.0), &ok, true));
        assert!(!heuristic_step_complete(&step, &click(1.0, 1.0), &ok, false));
        assert!(!heuristic_step_complete(
            &step,
            &Action::Wait { seconds: 1.0 },
            &ok,
            true
        ));
        assert!(!heuristic_step_complete(
            &step,
            &click(1.0, 1.0),
            &AR::fail("no"),
            true
        ));
    }

    #[test]
    fn history_tail_keeps_newest() {
        let history: Vec<String> = (0..5).map(|i| format!("h{i}")).collect();
        assert_eq!(history_tail(&history, 2), vec!["h3", "h4"]);
        assert_eq!(history_tail(&history, 10).len(), 5);
    }
}
