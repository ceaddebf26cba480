//! `cua-runtime` – the agent's iteration engine.
//!
//! Where the thinking happens: the perceive-plan-act-verify loop that drives
//! a desktop toward a natural-language goal.
//!
//! # Modules
//!
//! - [`orchestrator`] – [`Orchestrator`][orchestrator::Orchestrator]: the
//!   core loop. Captures, grounds against the accessibility tree, proposes
//!   one action per turn, routes it through the policy gate, verifies with
//!   the multi-signal change detector, reflects on step completion, and
//!   repairs the plan when the loop stalls.
//! - [`router`] – [`ActionRouter`][router::ActionRouter]: policy-gated
//!   dispatch from typed actions to the computer adapter, with phantom-mode
//!   and Cyborg fallbacks, macro iteration, skill replay, and clipboard
//!   redaction.
//! - [`llm`] – [`LlmClient`][llm::LlmClient]: the OpenAI-compatible chat
//!   client shared by all three model roles, with a per-minute rate limiter
//!   and a token-budget circuit breaker.
//! - [`executor`] / [`planner`] / [`reflector`] – the three model adapters
//!   behind trait seams ([`Executor`][executor::Executor],
//!   [`Planner`][planner::Planner], [`Reflector`][reflector::Reflector]) so
//!   tests can script turns deterministically.
//! - [`embedder`] – [`EmbeddingClient`][embedder::EmbeddingClient]: the
//!   HTTP embeddings provider behind `cua-memory`'s seam.
//! - [`state`] – [`StateTracker`][state::StateTracker]: history, notebook,
//!   observation ring, counters, halt conditions.
//! - [`guard`] – [`HotkeyLedger`][guard::HotkeyLedger] and
//!   [`CycleDetector`][guard::CycleDetector]: the dedup and oscillation
//!   defences.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: tracing
//!   subscriber with optional OTLP export.

pub mod embedder;
pub mod executor;
pub mod guard;
pub mod llm;
pub mod orchestrator;
pub mod planner;
pub mod reflector;
pub mod router;
pub mod state;
pub mod telemetry;

pub use embedder::EmbeddingClient;
pub use executor::{Executor, ExecutorAdapter, ExecutorTurn, LoopState, RepeatInfo};
pub use guard::{CycleDetector, HotkeyLedger};
pub use llm::{ChatMessage, ChatOptions, LlmClient, LlmError, Role};
pub use orchestrator::Orchestrator;
pub use planner::{Planner, PlannerAdapter};
pub use reflector::{FailureKind, ReflectionStatus, Reflector, ReflectorAdapter, StepReflection};
pub use router::ActionRouter;
pub use state::{SessionSummary, StateTracker};
pub use telemetry::{TracerProviderGuard, init_tracing};
