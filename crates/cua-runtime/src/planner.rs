//! Planner adapter – structured plans from goal, memory, and the screen.
//!
//! The planner model is asked to think first (`REASONING:`) and then emit a
//! strict JSON plan (`PLAN_JSON:`); the JSON Schema derived from [`Plan`] is
//! also pushed through `response_format` so schema-capable providers enforce
//! the shape server-side. Parsing prefers the labelled block and falls back
//! to the outermost brace span, because models are only mostly obedient.
//!
//! Every failure path is non-fatal: a missing client, a transport error, or
//! an unparsable reply produces the conservative two-step fallback plan (or
//! keeps the existing plan on revision), so planning can never crash a
//! session.

use async_trait::async_trait;
use schemars::schema_for;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use cua_memory::{Episode, SemanticMemoryItem};
use cua_types::{Plan, Settings, Step, StepStatus};

use crate::llm::{ChatMessage, ChatOptions, LlmClient};

/// History lines shown to the revision prompt.
const REVISION_HISTORY_TAIL: usize = 40;
/// History lines shown to the episode-summary prompt.
const SUMMARY_HISTORY_TAIL: usize = 80;

// ─────────────────────────────────────────────────────────────────────────────
// Seam
// ─────────────────────────────────────────────────────────────────────────────

/// The planning seam: the production adapter calls the model; tests script
/// plans directly.
#[async_trait]
pub trait Planner: Send {
    /// Build a fresh plan for `user_prompt`, grounded in prior episodes,
    /// semantic memory, and (when available) an initial screenshot.
    async fn make_plan(
        &mut self,
        user_prompt: &str,
        episodes: &[Episode],
        semantic: &[SemanticMemoryItem],
        screenshot_b64: Option<&str>,
    ) -> Plan;

    /// Refine an in-flight plan from recent history and the current screen.
    /// Returns the existing plan unchanged when revision is unavailable.
    async fn revise_plan(&mut self, plan: &Plan, history: &[String], screenshot_b64: &str) -> Plan;

    /// 2–4 sentence session summary for the episode record.
    async fn summarize_episode(
        &mut self,
        user_prompt: &str,
        history: &[String],
        plan: Option<&Plan>,
    ) -> String;

    /// Compress a window of old history into one line; empty when
    /// unavailable.
    async fn summarize_history_chunk(&mut self, chunk: &[String]) -> String;
}

// ─────────────────────────────────────────────────────────────────────────────
// PlannerAdapter
// ─────────────────────────────────────────────────────────────────────────────

/// Production planner backed by an OpenAI-compatible vision model.
pub struct PlannerAdapter {
    client: Option<LlmClient>,
    settings: Settings,
}

impl PlannerAdapter {
    pub fn new(settings: &Settings) -> Self {
        let client = settings.planner_api_key.as_ref().map(|key| {
            LlmClient::new(
                settings.planner_base_url.clone(),
                key.clone(),
                settings.planner_model.clone(),
            )
        });
        if client.is_none() {
            info!("planner running without a model client; fallback plans only");
        }
        Self {
            client,
            settings: settings.clone(),
        }
    }

    fn response_format() -> serde_json::Value {
        let schema = serde_json::to_value(schema_for!(Plan)).unwrap_or(serde_json::Value::Null);
        json!({
            "type": "json_schema",
            "json_schema": {"name": "desktop_plan", "strict": true, "schema": schema}
        })
    }

    fn format_memory_context(episodes: &[Episode], semantic: &[SemanticMemoryItem]) -> String {
        let mut chunks: Vec<String> = Vec::new();
        for ep in episodes.iter().rev().take(3).rev() {
            let prompt: String = ep.user_prompt.chars().take(60).collect();
            chunks.push(format!(
                "- Episode {}: prompt='{}', outcome={}, summary={}",
                ep.id,
                prompt,
                serde_json::to_value(ep.outcome)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default(),
                ep.summary
            ));
        }
        for item in semantic.iter().take(5) {
            let text: String = item.text.chars().take(120).collect();
            chunks.push(format!("- Semantic note {}: {}", item.id, text));
        }
        if chunks.is_empty() {
            "No prior memory available.".to_string()
        } else {
            chunks.join("\n")
        }
    }

    fn fallback_summary(history: &[String]) -> String {
        if history.is_empty() {
            return "No actions recorded.".to_string();
        }
        let tail = if history.len() > 3 {
            &history[history.len() - 3..]
        } else {
            &[]
        };
        let snippet: Vec<String> = history.iter().take(3).chain(tail).cloned().collect();
        format!(
            "Session summary unavailable; raw history snippet: {}",
            snippet.join(" | ")
        )
    }
}

/// Conservative two-step plan used whenever the model cannot help.
pub fn fallback_plan(plan_id: &str, user_prompt: &str) -> Plan {
    Plan::new(
        plan_id,
        user_prompt,
        vec![
            Step::new(
                0,
                "Inspect the desktop and orient to the request",
                "Relevant app or window is visible and ready",
            ),
            Step::new(
                1,
                format!("Execute the task: {user_prompt}"),
                "On-screen confirmation of the completed request (visible result, file, or page)",
            ),
        ],
    )
}

/// Extract the plan JSON from a reply: structured block first, then the
/// outermost brace span.
fn extract_plan_json(raw: &str) -> Option<&str> {
    if let Some((_, after)) = raw.split_once("PLAN_JSON:") {
        return Some(after.trim());
    }
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}

/// Turn a raw model reply into a normalised plan. Falls back to the two-step
/// plan when no usable steps survive.
fn parse_plan_response(raw: &str, plan_id: &str, user_prompt: &str) -> Plan {
    let data: serde_json::Value = extract_plan_json(raw)
        .and_then(|json_str| serde_json::from_str(json_str).ok())
        .unwrap_or_else(|| {
            let snippet: String = raw.chars().take(200).collect();
            warn!(snippet = %snippet, "failed to parse plan JSON from planner reply");
            json!({})
        });

    let mut steps: Vec<Step> = Vec::new();
    if let Some(raw_steps) = data.get("steps").and_then(|s| s.as_array()) {
        for (idx, raw_step) in raw_steps.iter().enumerate() {
            match serde_json::from_value::<Step>(raw_step.clone()) {
                Ok(mut step) => {
                    if step.description.trim().is_empty() {
                        step.description = format!("Step {}", idx + 1);
                    }
                    if step.success_criteria.trim().is_empty() {
                        step.success_criteria = "Criteria not provided".into();
                    }
                    steps.push(step);
                }
                Err(_) => continue,
            }
        }
    }

    if steps.is_empty() {
        return fallback_plan(plan_id, user_prompt);
    }
    if steps[0].status == StepStatus::Pending {
        steps[0].status = StepStatus::InProgress;
    }

    let id = data
        .get("id")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .unwrap_or(plan_id);
    let prompt = data
        .get("user_prompt")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .unwrap_or(user_prompt);
    // Plan::new normalises: exactly one in-progress step, index to match.
    Plan::new(id, prompt, steps)
}

#[async_trait]
impl Planner for PlannerAdapter {
    async fn make_plan(
        &mut self,
        user_prompt: &str,
        episodes: &[Episode],
        semantic: &[SemanticMemoryItem],
        screenshot_b64: Option<&str>,
    ) -> Plan {
        let plan_id = Uuid::new_v4().to_string();
        let Some(client) = &self.client else {
            return fallback_plan(&plan_id, user_prompt);
        };

        let context = Self::format_memory_context(episodes, semantic);
        let system_prompt = "You are a task planner for a desktop agent. \
            First, THINK step-by-step about the user request, the current screen state, and potential obstacles. \
            Then, output a JSON object with an ordered `steps` array.\n\
            Each step must have: id (int), description (string), success_criteria (string), status (pending|in_progress|done|failed), notes (string), expected_state (string), recovery_steps (array of strings), sub_steps (array of strings).\n\
            - Split the task into 3-7 small, verifiable steps. Keep main steps HIGH-LEVEL and list concrete clicks/fields in sub_steps.\n\
            - 'sub_steps': break complex steps into atomic actions (e.g. 'Click File', 'Select Print').\n\
            - 'description': specific and action-oriented.\n\
            - 'success_criteria': measurable and VISUAL.\n\
            - 'recovery_steps': what to try when the step fails.\n\
            - Mark the first step status as 'in_progress'.\n\
            Output format:\n\
            REASONING: <your thought process>\n\
            PLAN_JSON: <the valid JSON object>";

        let user_text = format!("User request: {user_prompt}\n\nPrior context:\n{context}");
        let user_message = match screenshot_b64 {
            Some(frame) => {
                ChatMessage::user_with_image(user_text, self.settings.frame_mime(), frame)
            }
            None => ChatMessage::user_text(user_text),
        };
        let messages = vec![ChatMessage::system(system_prompt), user_message];
        let options = ChatOptions {
            response_format: Some(Self::response_format()),
            ..ChatOptions::default()
        };

        match client.chat(&messages, &options).await {
            Ok(message) => parse_plan_response(&message.text(), &plan_id, user_prompt),
            Err(err) => {
                warn!(error = %err, "planner call failed; using fallback plan");
                fallback_plan(&plan_id, user_prompt)
            }
        }
    }

    async fn revise_plan(&mut self, plan: &Plan, history: &[String], screenshot_b64: &str) -> Plan {
        let Some(client) = &self.client else {
            info!("plan revision skipped: planner client unavailable");
            return plan.clone();
        };

        let system_prompt = "You are revising an in-flight desktop plan. \
            First, REASON about the failure or current state. \
            Then, output an UPDATED plan JSON.\n\
            Schema: id, user_prompt, steps (id, description, success_criteria, status, notes, expected_state, recovery_steps, sub_steps), current_step_index.\n\
            - Keep 3-7 concise steps.\n\
            - 'success_criteria' must be VISUAL.\n\
            - Mark steps as done if satisfied.\n\
            - Mark blocked steps as failed.\n\
            - Ensure exactly one step is 'in_progress'.\n\
            Output format:\n\
            REASONING: <text>\n\
            PLAN_JSON: <json>";

        let plan_json = serde_json::to_string(plan).unwrap_or_default();
        let tail_start = history.len().saturating_sub(REVISION_HISTORY_TAIL);
        let user_text = format!(
            "Existing plan:\n{plan_json}\n\nRecent events (most recent last):\n{}",
            history[tail_start..].join("\n")
        );
        let messages = vec![
            ChatMessage::system(system_prompt),
            ChatMessage::user_with_image(user_text, self.settings.frame_mime(), screenshot_b64),
        ];
        let options = ChatOptions {
            response_format: Some(Self::response_format()),
            ..ChatOptions::default()
        };

        match client.chat(&messages, &options).await {
            Ok(message) => parse_plan_response(&message.text(), &plan.id, &plan.user_prompt),
            Err(err) => {
                warn!(error = %err, "plan revision failed; keeping existing plan");
                plan.clone()
            }
        }
    }

    async fn summarize_episode(
        &mut self,
        user_prompt: &str,
        history: &[String],
        plan: Option<&Plan>,
    ) -> String {
        let Some(client) = &self.client else {
            return Self::fallback_summary(history);
        };

        let plan_line = plan
            .map(|p| {
                let bits: Vec<String> = p
                    .steps
                    .iter()
                    .map(|s| format!("{}:{}", s.id, s.status.as_str()))
                    .collect();
                format!(" Plan steps: {}", bits.join("; "))
            })
            .unwrap_or_default();
        let tail_start = history.len().saturating_sub(SUMMARY_HISTORY_TAIL);
        let messages = vec![
            ChatMessage::system(
                "Summarize the desktop control session in 2-4 sentences. \
                 Highlight what was attempted, what worked, and outstanding blockers. \
                 Do not include tool call JSON; keep it high level.",
            ),
            ChatMessage::user_text(format!(
                "User prompt: {user_prompt}.{plan_line}\n\nRecent events:\n{}",
                history[tail_start..].join("\n")
            )),
        ];

        match client.chat(&messages, &ChatOptions::default()).await {
            Ok(message) => {
                let text = message.text().trim().to_string();
                if text.is_empty() {
                    Self::fallback_summary(history)
                } else {
                    text
                }
            }
            Err(err) => {
                warn!(error = %err, "episode summary failed");
                Self::fallback_summary(history)
            }
        }
    }

    async fn summarize_history_chunk(&mut self, chunk: &[String]) -> String {
        let Some(client) = &self.client else {
            return String::new();
        };
        if chunk.is_empty() {
            return String::new();
        }

        let text_block: String = chunk.join("\n").chars().take(4000).collect();
        let messages = vec![
            ChatMessage::system(
                "Compress the following list of agent events into a single concise summary sentence. \
                 Focus on actions taken and their outcomes. Ignore noise.",
            ),
            ChatMessage::user_text(text_block),
        ];
        let options = ChatOptions {
            max_tokens: Some(200),
            ..ChatOptions::default()
        };

        match client.chat(&messages, &options).await {
            Ok(message) => message.text().trim().to_string(),
            Err(_) => String::new(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
