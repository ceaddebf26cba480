//! `cua-memory` – The durable knowledge base.
//!
//! Everything the agent remembers across sessions lives under one memory
//! root as append-mostly, write-once JSON files with unique ids, so
//! concurrent tasks never contend for the same file:
//!
//! ```text
//! memory/
//!   episodes/<episode-id>.json    one record per completed session
//!   semantic/<item-id>.json       distilled facts and visual-state notes
//!   skills/<skill-id>.json        fingerprint-deduplicated macros
//!   logs/<episode-id>.log         newline-delimited raw session history
//! ```
//!
//! # Modules
//!
//! - [`skills`] – [`SkillStore`][skills::SkillStore]: content-addressed
//!   persistence of successful macros. One skill per action-list
//!   fingerprint (SHA-1 of canonical JSON); re-saving a known fingerprint
//!   bumps usage and merges tags instead of duplicating.
//! - [`store`] – [`MemoryStore`][store::MemoryStore]: episodic log plus
//!   semantic notes with an optional vector index (cosine-similarity
//!   recall through the [`Embedder`][store::Embedder] seam, keyword
//!   fallback without one).

pub mod skills;
pub mod store;

pub use skills::{ProceduralSkill, SemanticHints, SkillDraft, SkillStore};
pub use store::{Embedder, Episode, EpisodeOutcome, MemoryError, MemoryStore, SemanticMemoryItem};
