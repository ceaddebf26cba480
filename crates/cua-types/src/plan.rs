//! [`Plan`] and [`Step`] – the planner's structured task decomposition.
//!
//! A plan is an ordered list of steps with a monotone per-step state machine:
//! `pending → in_progress → (done | failed)`. At most one step is in progress
//! at any time, and `current_step_index` always equals the index of that step
//! (or `steps.len()` once the plan is complete). Planner output is normalised
//! on deserialisation so a sloppy model can never hand the loop a plan with
//! zero or two in-progress steps.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// StepStatus
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle state of a single plan step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    InProgress,
    Done,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::InProgress => "in_progress",
            StepStatus::Done => "done",
            StepStatus::Failed => "failed",
        }
    }

    /// Whether the step has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Done | StepStatus::Failed)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Step
// ─────────────────────────────────────────────────────────────────────────────

/// One verifiable unit of work within a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Step {
    pub id: i64,
    /// Action-oriented description of what to do.
    pub description: String,
    /// Visual, measurable completion criteria the reflector checks against.
    pub success_criteria: String,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub expected_state: String,
    /// Alternatives to suggest when the step fails verification.
    #[serde(default)]
    pub recovery_steps: Vec<String>,
    /// Atomic click/field-level breakdown of the step.
    #[serde(default)]
    pub sub_steps: Vec<String>,
}

impl Step {
    pub fn new(id: i64, description: impl Into<String>, success_criteria: impl Into<String>) -> Self {
        Self {
            id,
            description: description.into(),
            success_criteria: success_criteria.into(),
            status: StepStatus::Pending,
            notes: String::new(),
            expected_state: String::new(),
            recovery_steps: Vec::new(),
            sub_steps: Vec::new(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Plan
// ─────────────────────────────────────────────────────────────────────────────

/// An ordered, stateful task plan owned by the orchestrator for the duration
/// of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Plan {
    pub id: String,
    pub user_prompt: String,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub current_step_index: usize,
}

impl Plan {
    pub fn new(id: impl Into<String>, user_prompt: impl Into<String>, steps: Vec<Step>) -> Self {
        let mut plan = Self {
            id: id.into(),
            user_prompt: user_prompt.into(),
            steps,
            current_step_index: 0,
        };
        plan.normalize();
        plan
    }

    /// The unique in-progress step, or `None` once the plan is complete.
    pub fn current_step(&self) -> Option<&Step> {
        self.steps.get(self.current_step_index)
    }

    /// Whether every step has been driven to a terminal state.
    pub fn is_complete(&self) -> bool {
        self.current_step_index >= self.steps.len()
    }

    /// Mark the current step done and promote the next pending step, or mark
    /// the plan complete when no steps remain.
    pub fn advance(&mut self) {
        if self.steps.is_empty() {
            return;
        }
        if let Some(step) = self.steps.get_mut(self.current_step_index) {
            step.status = StepStatus::Done;
        }
        if self.current_step_index < self.steps.len() - 1 {
            self.current_step_index += 1;
            self.steps[self.current_step_index].status = StepStatus::InProgress;
        } else {
            self.current_step_index = self.steps.len();
        }
    }

    /// Mark the current step failed and record the reason in its notes.
    pub fn fail_current(&mut self, note: impl Into<String>) {
        if let Some(step) = self.steps.get_mut(self.current_step_index) {
            step.status = StepStatus::Failed;
            step.notes = note.into();
        }
    }

    /// Enforce the plan invariant: exactly one in-progress step (or none when
    /// complete) and a matching `current_step_index`.
    ///
    /// The first in-progress step wins; later ones are demoted to pending.
    /// When no step is in progress, the first non-terminal step is promoted.
    /// When every step is terminal the index points past the end.
    pub fn normalize(&mut self) {
        let mut first_in_progress: Option<usize> = None;
        for (idx, step) in self.steps.iter_mut().enumerate() {
            if step.status == StepStatus::InProgress {
                if first_in_progress.is_some() {
                    step.status = StepStatus::Pending;
                } else {
                    first_in_progress = Some(idx);
                }
            }
        }
        if first_in_progress.is_none() {
            first_in_progress = self
                .steps
                .iter()
                .position(|s| !s.status.is_terminal());
            if let Some(idx) = first_in_progress {
                self.steps[idx].status = StepStatus::InProgress;
            }
        }
        self.current_step_index = first_in_progress.unwrap_or(self.steps.len());
    }

    /// One-line `id:description(status)` rendering used in history lines.
    pub fn summary_line(&self) -> String {
        self.steps
            .iter()
            .map(|s| format!("{}:{}({})", s.id, s.description, s.status.as_str()))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
