//! [`SkillStore`] – content-addressed persistence of successful macros.
//!
//! A skill is a macro that worked: an ordered action list the router can
//! replay as one model turn. Skills are deduplicated by **fingerprint**:
//! the SHA-1 of the canonical JSON of the action list (sorted keys, minimal
//! whitespace). The same macro mined twice becomes one record with a
//! bumped usage count rather than a duplicate file.
//!
//! # Storage layout
//!
//! One JSON file per skill under the store root, named `<skill-id>.json`.
//! Timestamps are UNIX seconds, matching the episode store.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tracing::warn;
use uuid::Uuid;

use cua_types::Action;

use crate::store::MemoryError;

// ─────────────────────────────────────────────────────────────────────────────
// Fingerprint
// ─────────────────────────────────────────────────────────────────────────────

/// Stable hash of a macro action list for deduplication.
///
/// The list is serialised through `serde_json::Value`, whose object keys are
/// ordered, so two semantically identical lists produce identical digests
/// regardless of the field order they arrived with.
pub fn fingerprint_actions(actions: &[Action]) -> String {
    let canonical = serde_json::to_value(actions)
        .and_then(|value| serde_json::to_string(&value))
        .unwrap_or_default();
    let digest = Sha1::digest(canonical.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn now_unix_seconds() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

// ─────────────────────────────────────────────────────────────────────────────
// ProceduralSkill
// ─────────────────────────────────────────────────────────────────────────────

/// Lightweight semantic descriptors captured at mining time so skills can be
/// matched later by what they touch, not just by raw coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SemanticHints {
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub types: Vec<String>,
    #[serde(default)]
    pub paths: Vec<String>,
}

impl SemanticHints {
    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
            && self.labels.is_empty()
            && self.types.is_empty()
            && self.paths.is_empty()
    }

    /// All hint terms joined for keyword scoring.
    pub fn joined(&self) -> String {
        self.roles
            .iter()
            .chain(&self.labels)
            .chain(&self.types)
            .chain(&self.paths)
            .cloned()
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// A persisted, reusable macro.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProceduralSkill {
    pub id: String,
    pub name: String,
    pub description: String,
    pub actions: Vec<Action>,
    pub created_at: f64,
    pub updated_at: f64,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default)]
    pub last_used: Option<f64>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub fingerprint: String,
    #[serde(default)]
    pub source_prompt: Option<String>,
    #[serde(default)]
    pub plan_step_id: Option<i64>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub semantic_hints: SemanticHints,
}

/// Inputs for [`SkillStore::save_skill`].
#[derive(Debug, Clone, Default)]
pub struct SkillDraft {
    pub name: String,
    pub description: String,
    pub actions: Vec<Action>,
    pub tags: Vec<String>,
    pub source_prompt: Option<String>,
    pub plan_step_id: Option<i64>,
    pub embedding: Option<Vec<f32>>,
    pub semantic_hints: SemanticHints,
}

// ─────────────────────────────────────────────────────────────────────────────
// SkillStore
// ─────────────────────────────────────────────────────────────────────────────

/// File-backed store of procedural skills.
pub struct SkillStore {
    root: PathBuf,
}

impl SkillStore {
    /// Open (or create) the store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, MemoryError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Persist a skill, deduplicating by action fingerprint.
    ///
    /// When the fingerprint is already known, the existing skill's
    /// `updated_at` and `usage_count` advance, tags merge (sorted union),
    /// an empty description is filled, and any provided embedding or hints
    /// replace the stored ones.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::EmptySkill`] for an empty action list.
    pub fn save_skill(&self, draft: SkillDraft) -> Result<ProceduralSkill, MemoryError> {
        if draft.actions.is_empty() {
            return Err(MemoryError::EmptySkill);
        }

        let fingerprint = fingerprint_actions(&draft.actions);
        let now = now_unix_seconds();

        if let Some(mut existing) = self.find_by_fingerprint(&fingerprint) {
            existing.updated_at = now;
            existing.usage_count += 1;
            if !draft.tags.is_empty() {
                let mut merged: Vec<String> = existing
                    .tags
                    .iter()
                    .chain(&draft.tags)
                    .cloned()
                    .collect();
                merged.sort();
                merged.dedup();
                existing.tags = merged;
            }
            if existing.description.is_empty() && !draft.description.is_empty() {
                existing.description = draft.description;
            }
            if draft.embedding.is_some() {
                existing.embedding = draft.embedding;
            }
            if !draft.semantic_hints.is_empty() {
                existing.semantic_hints = draft.semantic_hints;
            }
            self.write(&existing)?;
            return Ok(existing);
        }

        let id = Uuid::new_v4().to_string();
        let skill = ProceduralSkill {
            name: if draft.name.is_empty() {
                format!("skill-{}", &id[..8])
            } else {
                draft.name
            },
            description: draft.description,
            actions: draft.actions,
            created_at: now,
            updated_at: now,
            usage_count: 0,
            last_used: None,
            tags: draft.tags,
            fingerprint,
            source_prompt: draft.source_prompt,
            plan_step_id: draft.plan_step_id,
            embedding: draft.embedding,
            semantic_hints: draft.semantic_hints,
            id,
        };
        self.write(&skill)?;
        Ok(skill)
    }

    /// All stored skills, oldest first. Unreadable files are logged and
    /// skipped so one corrupt record cannot poison recall.
    pub fn list_skills(&self) -> Vec<ProceduralSkill> {
        let mut skills = Vec::new();
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return skills;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(skill) = self.read(&path) {
                skills.push(skill);
            }
        }
        skills.sort_by(|a, b| a.created_at.total_cmp(&b.created_at));
        skills
    }

    /// Look up a skill by id (filename), falling back to a name scan.
    pub fn get_skill(&self, id_or_name: &str) -> Option<ProceduralSkill> {
        if id_or_name.is_empty() {
            return None;
        }
        let by_id = self.root.join(format!("{id_or_name}.json"));
        if let Some(skill) = self.read(&by_id) {
            return Some(skill);
        }
        self.list_skills()
            .into_iter()
            .find(|skill| skill.name == id_or_name)
    }

    /// Bump usage counters for a skill that was just replayed.
    pub fn record_usage(&self, skill_id: &str) -> Option<ProceduralSkill> {
        let mut skill = self.get_skill(skill_id)?;
        let now = now_unix_seconds();
        skill.usage_count += 1;
        skill.last_used = Some(now);
        skill.updated_at = now;
        if let Err(err) = self.write(&skill) {
            warn!(skill_id, error = %err, "failed to record skill usage");
        }
        Some(skill)
    }

    fn find_by_fingerprint(&self, fingerprint: &str) -> Option<ProceduralSkill> {
        self.list_skills()
            .into_iter()
            .find(|skill| skill.fingerprint == fingerprint)
    }

    fn write(&self, skill: &ProceduralSkill) -> Result<(), MemoryError> {
        let path = self.root.join(format!("{}.json", skill.id));
        let raw = serde_json::to_string_pretty(skill)?;
        std::fs::write(path, raw)?;
        Ok(())
    }

    fn read(&self, path: &Path) -> Option<ProceduralSkill> {
        let raw = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(skill) => Some(skill),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "skipping unreadable skill file");
                None
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
