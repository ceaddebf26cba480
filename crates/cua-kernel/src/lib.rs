//! `cua-kernel` – Safety layer.
//!
//! The kernel does not think; it enforces rules. Every action the executor
//! proposes passes through here before it can reach a driver.
//!
//! # Modules
//!
//! - [`policy`] – [`PolicyEngine`][policy::PolicyEngine]: evaluates each
//!   proposed [`Action`][cua_types::Action] against YAML-configured safety
//!   rules merged over built-in defaults, returning `allow`, `allow+hitl`,
//!   or `deny`. Rules are evaluated in a fixed order and short-circuit on
//!   the first match, so a later rule can never override an earlier denial.
//! - [`redactor`] – [`redact_secrets`][redactor::redact_secrets]: scrubs
//!   clipboard payloads of private keys, cloud credentials, JWT-shaped
//!   strings, credential assignments, and high-entropy blobs before they can
//!   reach the loop history or a model prompt.

pub mod policy;
pub mod redactor;

pub use policy::{ActionContext, ExclusionZone, PolicyDecision, PolicyEngine, SafetyRules};
pub use redactor::redact_secrets;
