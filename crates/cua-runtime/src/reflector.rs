//! Reflector adapter – step verification, failure triage, unblock hints.
//!
//! A secondary model double-checks the executor's work: given the current
//! step, recent history, and the latest frame, it answers whether the step's
//! success criteria are visibly met, and classifies failures so the
//! orchestrator can react (`visual_mismatch`, `blocked_by_popup`,
//! `no_change`, `error_message`).
//!
//! The adapter is deliberately conservative: any transport error, parse
//! failure, or uncertainty yields `incomplete`, never `success`. A wrong
//! "incomplete" costs one more iteration; a wrong "success" advances the
//! plan on a lie.

use async_trait::async_trait;
use schemars::{JsonSchema, schema_for};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use cua_types::{Settings, Step};

use crate::llm::{ChatMessage, ChatOptions, LlmClient};

/// History lines shown to the verification prompt.
const EVALUATE_HISTORY_TAIL: usize = 20;
/// History lines shown to the hint prompt.
const HINT_HISTORY_TAIL: usize = 30;

// ─────────────────────────────────────────────────────────────────────────────
// Verdict types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReflectionStatus {
    Success,
    #[default]
    Incomplete,
    Failed,
}

/// Failure taxonomy the orchestrator keys recovery behaviour on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    VisualMismatch,
    BlockedByPopup,
    NoChange,
    ErrorMessage,
    #[serde(rename = "")]
    #[default]
    None,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::VisualMismatch => "visual_mismatch",
            FailureKind::BlockedByPopup => "blocked_by_popup",
            FailureKind::NoChange => "no_change",
            FailureKind::ErrorMessage => "error_message",
            FailureKind::None => "",
        }
    }
}

/// Structured verdict for one step evaluation.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
pub struct StepReflection {
    #[serde(default)]
    pub is_complete: bool,
    #[serde(default)]
    pub status: ReflectionStatus,
    #[serde(default)]
    pub failure_type: FailureKind,
    #[serde(default)]
    pub reason: String,
}

impl StepReflection {
    /// The conservative verdict used on every failure path.
    pub fn incomplete(reason: impl Into<String>) -> Self {
        Self {
            is_complete: false,
            status: ReflectionStatus::Incomplete,
            failure_type: FailureKind::None,
            reason: reason.into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Seam
// ─────────────────────────────────────────────────────────────────────────────

/// The reflection seam: the production adapter calls the model; tests script
/// verdicts directly.
#[async_trait]
pub trait Reflector: Send {
    /// Whether a verifier model is wired in. When false the orchestrator
    /// falls back to its completion heuristic.
    fn available(&self) -> bool;

    /// Verify the current step against its success criteria.
    async fn evaluate_step(
        &mut self,
        step: &Step,
        history: &[String],
        frame_b64: &str,
        changed: bool,
    ) -> StepReflection;

    /// One concise unblock hint (≤ 20 words); empty when unavailable.
    async fn suggest_hint(
        &mut self,
        step: Option<&Step>,
        history: &[String],
        frame_b64: &str,
    ) -> String;

    /// 1–2 sentence description of the visible state, used to seed semantic
    /// memory on step completion; empty when unavailable.
    async fn describe_image(&mut self, frame_b64: &str) -> String;
}

// ─────────────────────────────────────────────────────────────────────────────
// ReflectorAdapter
// ─────────────────────────────────────────────────────────────────────────────

/// Production reflector backed by an OpenAI-compatible vision model.
pub struct ReflectorAdapter {
    client: Option<LlmClient>,
    settings: Settings,
}

impl ReflectorAdapter {
    pub fn new(settings: &Settings) -> Self {
        let client = if settings.enable_reflection {
            settings.reflector_api_key.as_ref().map(|key| {
                LlmClient::new(
                    settings.reflector_base_url.clone(),
                    key.clone(),
                    settings.reflector_model.clone(),
                )
            })
        } else {
            None
        };
        if client.is_none() {
            info!("reflection disabled; step completion falls back to heuristics");
        }
        Self {
            client,
            settings: settings.clone(),
        }
    }

    fn response_format() -> serde_json::Value {
        let schema =
            serde_json::to_value(schema_for!(StepReflection)).unwrap_or(serde_json::Value::Null);
        json!({
            "type": "json_schema",
            "json_schema": {"name": "step_reflection", "strict": true, "schema": schema}
        })
    }
}

/// Pull the verdict JSON out of a reply, tolerating prose around it.
fn parse_reflection(raw: &str) -> Option<StepReflection> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&raw[start..=end]).ok()
}

#[async_trait]
impl Reflector for ReflectorAdapter {
    fn available(&self) -> bool {
        self.client.is_some()
    }

    async fn evaluate_step(
        &mut self,
        step: &Step,
        history: &[String],
        frame_b64: &str,
        changed: bool,
    ) -> StepReflection {
        let Some(client) = &self.client else {
            return StepReflection::incomplete("reflector unavailable");
        };

        let system_prompt = "You are a strict verifier for a desktop agent. \
            Given the current step, recent events, and a screenshot, decide whether the step's \
            success criteria are VISIBLY met. Reply with a single JSON object: \
            {\"is_complete\": bool, \"status\": \"success\"|\"incomplete\"|\"failed\", \
            \"failure_type\": \"visual_mismatch\"|\"blocked_by_popup\"|\"no_change\"|\"error_message\"|\"\", \
            \"reason\": string}. \
            Be conservative: when uncertain, answer incomplete. \
            Use status=failed only when the step is actively blocked (popup, error, wrong screen).";
        let tail_start = history.len().saturating_sub(EVALUATE_HISTORY_TAIL);
        let user_text = format!(
            "Step: {}. Success criteria: {}.\nUI changed after last action: {}.\n\nRecent events:\n{}",
            step.description,
            step.success_criteria,
            changed,
            history[tail_start..].join("\n")
        );
        let messages = vec![
            ChatMessage::system(system_prompt),
            ChatMessage::user_with_image(user_text, self.settings.frame_mime(), frame_b64),
        ];
        let options = ChatOptions {
            response_format: Some(Self::response_format()),
            ..ChatOptions::default()
        };

        match client.chat(&messages, &options).await {
            Ok(message) => match parse_reflection(&message.text()) {
                Some(reflection) => reflection,
                None => {
                    warn!(step_id = step.id, "unparsable reflection; treating as incomplete");
                    StepReflection::incomplete("unparsable reflection reply")
                }
            },
            Err(err) => {
                warn!(step_id = step.id, error = %err, "reflection request failed");
                StepReflection::incomplete(format!("reflection request failed: {err}"))
            }
        }
    }

    async fn suggest_hint(
        &mut self,
        step: Option<&Step>,
        history: &[String],
        frame_b64: &str,
    ) -> String {
        let Some(client) = &self.client else {
            return String::new();
        };

        let step_text = step
            .map(|s| {
                format!(
                    "Current step: {}. Success criteria: {}.",
                    s.description, s.success_criteria
                )
            })
            .unwrap_or_default();
        let tail_start = history.len().saturating_sub(HINT_HISTORY_TAIL);
        let user_text = format!(
            "The desktop agent appears stuck. Based on the screenshot and recent events, \
             give one short hint (<=20 words) to unblock progress. Do not address the user; \
             just give the agent a next idea.\n{step_text}\nRecent events:\n{}",
            history[tail_start..].join("\n")
        );
        let messages = vec![
            ChatMessage::system("Provide one concise hint, no preamble."),
            ChatMessage::user_with_image(user_text, self.settings.frame_mime(), frame_b64),
        ];
        let options = ChatOptions {
            max_tokens: Some(40),
            ..ChatOptions::default()
        };

        match client.chat(&messages, &options).await {
            Ok(message) => message.text().trim().to_string(),
            Err(err) => {
                warn!(error = %err, "hint request failed");
                String::new()
            }
        }
    }

    async fn describe_image(&mut self, frame_b64: &str) -> String {
        let Some(client) = &self.client else {
            return String::new();
        };

        let messages = vec![
            ChatMessage::system(
                "Describe the visible UI state in 1-2 sentences: which app is focused and \
                 what the key on-screen result is. No speculation.",
            ),
            ChatMessage::user_with_image("Describe this screen.", self.settings.frame_mime(), frame_b64),
        ];
        let options = ChatOptions {
            max_tokens: Some(120),
            ..ChatOptions::default()
        };

        match client.chat(&messages, &options).await {
            Ok(message) => message.text().trim().to_string(),
            Err(err) => {
                warn!(error = %err, "image description failed");
                String::new()
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_kind_serializes_snake_case_with_empty_none() {
        assert_eq!(
            serde_json::to_string(&FailureKind::BlockedByPopup).unwrap(),
            "\"blocked_by_popup\""
        );
        assert_eq!(serde_json::to_string(&FailureKind::None).unwrap(), "\"\"");
        let back: FailureKind = serde_json::from_str("\"\"").unwrap();
        assert_eq!(back, FailureKind::None);
    }

    #[test]
    fn reflection_parses_from_prose_wrapped_json() {
        let raw = r#"Looking at the screen... {"is_complete": true, "status": "success", "failure_type": "", "reason": "calculator visible"} hope that helps"#;
        let reflection = parse_reflection(raw).unwrap();
        assert!(reflection.is_complete);
        assert_eq!(reflection.status, ReflectionStatus::Success);
        assert_eq!(reflection.failure_type, FailureKind::None);
    }

    #[test]
    fn reflection_parses_failure_verdict() {
        let raw = r#"{"is_complete": false, "status": "failed", "failure_type": "blocked_by_popup", "reason": "update dialog covers the window"}"#;
        let reflection = parse_reflection(raw).unwrap();
        assert!(!reflection.is_complete);
        assert_eq!(reflection.status, ReflectionStatus::Failed);
        assert_eq!(reflection.failure_type, FailureKind::BlockedByPopup);
    }

    #[test]
    fn missing_fields_default_conservatively() {
        let reflection = parse_reflection(r#"{"reason": "hmm"}"#).unwrap();
        assert!(!reflection.is_complete);
        assert_eq!(reflection.status, ReflectionStatus::Incomplete);
    }

    #[test]
    fn garbage_reply_does_not_parse() {
        assert!(parse_reflection("no json at all").is_none());
        assert!(parse_reflection("}{").is_none());
    }

    #[tokio::test]
    async fn adapter_without_client_is_unavailable_and_conservative() {
        let mut settings = Settings::default();
        settings.enable_reflection = false;
        let mut adapter = ReflectorAdapter::new(&settings);
        assert!(!adapter.available());

        let step = Step::new(0, "Open calculator", "Calculator visible");
        let verdict = adapter.evaluate_step(&step, &[], "frame", true).await;
        assert!(!verdict.is_complete);
        assert_eq!(verdict.status, ReflectionStatus::Incomplete);

        assert_eq!(adapter.suggest_hint(Some(&step), &[], "frame").await, "");
        assert_eq!(adapter.describe_image("frame").await, "");
    }

    #[test]
    fn reflection_disabled_by_flag_even_with_key() {
        let mut settings = Settings::default();
        settings.enable_reflection = false;
        settings.reflector_api_key = Some("sk-test".into());
        let adapter = ReflectorAdapter::new(&settings);
        assert!(!adapter.available());
    }
}
