//! [`MemoryStore`] – episodic log and semantic notes with optional vector
//! recall.
//!
//! Episodes record what a whole session attempted and how it ended; semantic
//! items are distilled facts ("Visual state after step 2: …") that future
//! planning retrieves as context. When an [`Embedder`] is wired in, recall is
//! cosine-similarity over stored embeddings (top-k via a bounded min-heap);
//! without one it degrades to keyword matching, so memory keeps working fully
//! offline.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use cua_types::Action;

use crate::skills::{ProceduralSkill, SemanticHints, SkillDraft, SkillStore};

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can arise from durable-store operations.
#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("skill actions cannot be empty")]
    EmptySkill,
}

// ─────────────────────────────────────────────────────────────────────────────
// Embedder seam
// ─────────────────────────────────────────────────────────────────────────────

/// Text-embedding provider. The runtime supplies an HTTP-backed client;
/// tests supply deterministic stubs. A `None` return disables vector recall
/// for that text without failing the write.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Option<Vec<f32>>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Records
// ─────────────────────────────────────────────────────────────────────────────

/// Final outcome of one agent session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EpisodeOutcome {
    Success,
    Mixed,
    Incomplete,
}

/// One completed session: the prompt, the plan snapshot, and how it ended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub id: String,
    pub created_at: f64,
    pub user_prompt: String,
    pub plan: serde_json::Value,
    pub outcome: EpisodeOutcome,
    pub summary: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub raw_log_path: Option<String>,
}

/// One distilled fact with optional embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticMemoryItem {
    pub id: String,
    pub created_at: f64,
    pub text: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Similarity helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Cosine similarity of two equal-length vectors; `0.0` when either has zero
/// norm or the lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let (dot, norm_a_sq, norm_b_sq) = a.iter().zip(b).fold(
        (0.0f32, 0.0f32, 0.0f32),
        |(dot, na, nb), (&x, &y)| (dot + x * y, na + x * x, nb + y * y),
    );
    let norm_a = norm_a_sq.sqrt();
    let norm_b = norm_b_sq.sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Min-heap entry so the Top-K scan evicts the worst candidate in O(log k).
struct HeapEntry<T>(T, f32);

impl<T> PartialEq for HeapEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.1.total_cmp(&other.1) == CmpOrdering::Equal
    }
}

impl<T> Eq for HeapEntry<T> {}

impl<T> PartialOrd for HeapEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for HeapEntry<T> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reverse: lower similarity floats to the top and is evicted first.
        other.1.total_cmp(&self.1)
    }
}

fn top_k_by_score<T>(candidates: Vec<(T, f32)>, top_k: usize) -> Vec<T> {
    let mut heap: BinaryHeap<HeapEntry<T>> = BinaryHeap::with_capacity(top_k + 1);
    for (item, score) in candidates {
        if heap.len() < top_k {
            heap.push(HeapEntry(item, score));
        } else if let Some(worst) = heap.peek()
            && score > worst.1
        {
            heap.pop();
            heap.push(HeapEntry(item, score));
        }
    }
    let mut scored: Vec<(T, f32)> = heap.into_iter().map(|e| (e.0, e.1)).collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    scored.into_iter().map(|(item, _)| item).collect()
}

/// Lowercase alphanumeric token set for keyword scoring.
pub fn tokenize_lower(text: &str) -> BTreeSet<String> {
    let mut tokens = BTreeSet::new();
    let mut current = String::new();
    for ch in text.chars() {
        if ch.is_ascii_alphanumeric() {
            current.push(ch.to_ascii_lowercase());
        } else if !current.is_empty() {
            tokens.insert(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.insert(current);
    }
    tokens
}

fn now_unix_seconds() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

// ─────────────────────────────────────────────────────────────────────────────
// MemoryStore
// ─────────────────────────────────────────────────────────────────────────────

/// File-backed episodic and semantic memory, plus the skill store.
pub struct MemoryStore {
    episodes_dir: PathBuf,
    semantic_dir: PathBuf,
    logs_dir: PathBuf,
    skills: SkillStore,
    embedder: Option<Arc<dyn Embedder>>,
}

impl MemoryStore {
    /// Open (or create) the store rooted at `root`, conventionally the
    /// `MEMORY_ROOT` setting or `.agent_memory`.
    pub fn open(
        root: impl Into<PathBuf>,
        embedder: Option<Arc<dyn Embedder>>,
    ) -> Result<Self, MemoryError> {
        let root: PathBuf = root.into();
        let episodes_dir = root.join("episodes");
        let semantic_dir = root.join("semantic");
        let logs_dir = root.join("logs");
        for dir in [&episodes_dir, &semantic_dir, &logs_dir] {
            std::fs::create_dir_all(dir)?;
        }
        let skills = SkillStore::open(root.join("skills"))?;
        Ok(Self {
            episodes_dir,
            semantic_dir,
            logs_dir,
            skills,
            embedder,
        })
    }

    pub fn logs_dir(&self) -> &Path {
        &self.logs_dir
    }

    // ── Episodes ─────────────────────────────────────────────────────────────

    pub fn save_episode(&self, episode: &Episode) -> Result<PathBuf, MemoryError> {
        let path = self.episodes_dir.join(format!("{}.json", episode.id));
        std::fs::write(&path, serde_json::to_string_pretty(episode)?)?;
        Ok(path)
    }

    /// All episodes, oldest first. Unreadable files are logged and skipped.
    pub fn list_episodes(&self) -> Vec<Episode> {
        let mut episodes: Vec<Episode> = read_json_dir(&self.episodes_dir);
        episodes.sort_by(|a, b| a.created_at.total_cmp(&b.created_at));
        episodes
    }

    /// Write the raw newline-delimited session history and return its path.
    pub fn write_episode_log(
        &self,
        episode_id: &str,
        lines: &[String],
    ) -> Result<PathBuf, MemoryError> {
        let path = self.logs_dir.join(format!("{episode_id}.log"));
        let mut body = lines.join("\n");
        body.push('\n');
        std::fs::write(&path, body)?;
        Ok(path)
    }

    // ── Semantic items ───────────────────────────────────────────────────────

    /// Persist a semantic note, embedding it when an embedder is available.
    pub async fn add_semantic_item(
        &self,
        text: impl Into<String>,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> Result<SemanticMemoryItem, MemoryError> {
        let text = text.into();
        let embedding = match &self.embedder {
            Some(embedder) => embedder.embed(&text).await,
            None => None,
        };
        let item = SemanticMemoryItem {
            id: Uuid::new_v4().to_string(),
            created_at: now_unix_seconds(),
            text,
            metadata,
            embedding,
        };
        let path = self.semantic_dir.join(format!("{}.json", item.id));
        std::fs::write(&path, serde_json::to_string_pretty(&item)?)?;
        Ok(item)
    }

    /// Retrieve the `top_k` semantic items most relevant to `query`:
    /// vector similarity when embeddings are available on both sides,
    /// lowercase substring matching otherwise.
    pub async fn search_semantic(&self, query: &str, top_k: usize) -> Vec<SemanticMemoryItem> {
        let items: Vec<SemanticMemoryItem> = read_json_dir(&self.semantic_dir);
        if items.is_empty() || top_k == 0 {
            return Vec::new();
        }

        let query_embedding = match &self.embedder {
            Some(embedder) => embedder.embed(query).await,
            None => None,
        };
        if let Some(query_embedding) = query_embedding {
            let scored: Vec<(SemanticMemoryItem, f32)> = items
                .into_iter()
                .filter(|item| item.embedding.is_some())
                .map(|item| {
                    let score = cosine_similarity(
                        item.embedding.as_deref().unwrap_or(&[]),
                        &query_embedding,
                    );
                    (item, score)
                })
                .collect();
            return top_k_by_score(scored, top_k);
        }

        let lowered = query.to_lowercase();
        items
            .into_iter()
            .filter(|item| item.text.to_lowercase().contains(&lowered))
            .take(top_k)
            .collect()
    }

    // ── Skills ───────────────────────────────────────────────────────────────

    /// Persist a mined macro, extracting semantic hints and (when possible)
    /// an embedding for later recall. Dedup semantics are the skill store's.
    pub async fn save_skill(
        &self,
        name: &str,
        description: &str,
        actions: Vec<Action>,
        tags: Vec<String>,
        source_prompt: Option<String>,
        plan_step_id: Option<i64>,
    ) -> Result<ProceduralSkill, MemoryError> {
        let semantic_hints = extract_semantic_hints(&actions);
        let embedding = match &self.embedder {
            Some(embedder) => {
                let text = format!("{name}\n{description}\n{}", semantic_hints.joined());
                embedder.embed(&text).await
            }
            None => None,
        };
        self.skills.save_skill(SkillDraft {
            name: name.to_string(),
            description: description.to_string(),
            actions,
            tags,
            source_prompt,
            plan_step_id,
            embedding,
            semantic_hints,
        })
    }

    pub fn get_skill(&self, id_or_name: &str) -> Option<ProceduralSkill> {
        self.skills.get_skill(id_or_name)
    }

    pub fn record_skill_usage(&self, skill_id: &str) -> Option<ProceduralSkill> {
        self.skills.record_usage(skill_id)
    }

    pub fn list_skills(&self) -> Vec<ProceduralSkill> {
        self.skills.list_skills()
    }

    /// Rank skills against a query: embeddings when available, otherwise
    /// token overlap over name/description/tags/hints with an
    /// exact-substring bonus.
    pub async fn search_skills(&self, query: &str, top_k: usize) -> Vec<ProceduralSkill> {
        let skills = self.list_skills();
        if skills.is_empty() || top_k == 0 {
            return Vec::new();
        }

        let query_embedding = match &self.embedder {
            Some(embedder) => embedder.embed(query).await,
            None => None,
        };
        if let Some(query_embedding) = query_embedding {
            let scored: Vec<(ProceduralSkill, f32)> = skills
                .into_iter()
                .filter(|skill| skill.embedding.is_some())
                .map(|skill| {
                    let score = cosine_similarity(
                        skill.embedding.as_deref().unwrap_or(&[]),
                        &query_embedding,
                    );
                    (skill, score)
                })
                .collect();
            return top_k_by_score(scored, top_k);
        }

        let query_tokens = tokenize_lower(query);
        let lowered_query = query.to_lowercase();
        let scored: Vec<(ProceduralSkill, f32)> = skills
            .into_iter()
            .filter_map(|skill| {
                let haystack = format!(
                    "{} {} {} {}",
                    skill.name,
                    skill.description,
                    skill.tags.join(" "),
                    skill.semantic_hints.joined()
                )
                .to_lowercase();
                let overlap = tokenize_lower(&haystack)
                    .intersection(&query_tokens)
                    .count() as f32;
                let exact = if haystack.contains(&lowered_query) { 5.0 } else { 0.0 };
                let score = exact + overlap;
                (score > 0.0).then_some((skill, score))
            })
            .collect();
        top_k_by_score(scored, top_k)
    }
}

/// Capture lightweight descriptors from a macro so skills can be matched by
/// what they touch: action kinds, application/skill names, and URLs.
pub fn extract_semantic_hints(actions: &[Action]) -> SemanticHints {
    let mut hints = SemanticHints::default();
    for action in actions {
        hints.types.push(action.kind().to_string());
        match action {
            Action::OpenApp { app_name, .. } => hints.labels.push(app_name.clone()),
            Action::RunSkill {
                skill_name: Some(name),
                ..
            } => hints.labels.push(name.clone()),
            Action::BrowserOp { url: Some(url), .. } => hints.paths.push(url.clone()),
            _ => {}
        }
    }
    for list in [
        &mut hints.roles,
        &mut hints.labels,
        &mut hints.types,
        &mut hints.paths,
    ] {
        list.sort();
        list.dedup();
    }
    hints
}

fn read_json_dir<T: serde::de::DeserializeOwned>(dir: &Path) -> Vec<T> {
    let mut out = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return out;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match std::fs::read_to_string(&path)
            .map_err(MemoryError::from)
            .and_then(|raw| serde_json::from_str(&raw).map_err(MemoryError::from))
        {
            Ok(item) => out.push(item),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "skipping unreadable memory file");
            }
        }
    }
    out
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic embedder: a fixed vector per known text.
    struct StubEmbedder;

    #[async_trait]
    impl Embedder for StubEmbedder {
        async fn embed(&self, text: &str) -> Option<Vec<f32>> {
            match text {
                t if t.contains("calculator") => Some(vec![1.0, 0.0, 0.0]),
                t if t.contains("browser") => Some(vec![0.0, 1.0, 0.0]),
                _ => Some(vec![0.0, 0.0, 1.0]),
            }
        }
    }

    fn open_store(embedder: Option<Arc<dyn Embedder>>) -> (tempfile::TempDir, MemoryStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::open(dir.path().join("memory"), embedder).unwrap();
        (dir, store)
    }

    fn episode(id: &str, created_at: f64) -> Episode {
        Episode {
            id: id.into(),
            created_at,
            user_prompt: "open calculator".into(),
            plan: serde_json::json!({}),
            outcome: EpisodeOutcome::Success,
            summary: "done".into(),
            tags: vec!["desktop".into()],
            raw_log_path: None,
        }
    }

    // ── cosine / top-k ───────────────────────────────────────────────────────

    #[test]
    fn cosine_identical_vectors_is_one() {
        let v = [1.0f32, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_orthogonal_vectors_is_zero() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }

    #[test]
    fn cosine_mismatched_lengths_is_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0]), 0.0);
    }

    #[test]
    fn cosine_zero_vector_is_zero() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn top_k_returns_best_first() {
        let items = vec![("a", 0.1), ("b", 0.9), ("c", 0.5)];
        assert_eq!(top_k_by_score(items, 2), vec!["b", "c"]);
    }

    #[test]
    fn tokenize_lower_splits_on_non_alphanumerics() {
        let tokens = tokenize_lower("Open the Calculator-App!");
        assert!(tokens.contains("open"));
        assert!(tokens.contains("calculator"));
        assert!(tokens.contains("app"));
        assert!(!tokens.contains("the calculator"));
    }

    // ── Episodes ─────────────────────────────────────────────────────────────

    #[test]
    fn episodes_roundtrip_sorted_by_creation() {
        let (_dir, store) = open_store(None);
        store.save_episode(&episode("later", 200.0)).unwrap();
        store.save_episode(&episode("earlier", 100.0)).unwrap();
        let episodes = store.list_episodes();
        assert_eq!(episodes.len(), 2);
        assert_eq!(episodes[0].id, "earlier");
        assert_eq!(episodes[1].id, "later");
    }

    #[test]
    fn episode_log_is_newline_delimited() {
        let (_dir, store) = open_store(None);
        let path = store
            .write_episode_log("ep-1", &["user_prompt:idle".into(), "plan_init:0".into()])
            .unwrap();
        let body = std::fs::read_to_string(path).unwrap();
        assert_eq!(body, "user_prompt:idle\nplan_init:0\n");
    }

    #[test]
    fn episode_outcome_serializes_lowercase() {
        let json = serde_json::to_string(&EpisodeOutcome::Incomplete).unwrap();
        assert_eq!(json, "\"incomplete\"");
    }

    // ── Semantic items ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn semantic_search_falls_back_to_keywords_without_embedder() {
        let (_dir, store) = open_store(None);
        store
            .add_semantic_item("Calculator shows 4 after pressing equals", BTreeMap::new())
            .await
            .unwrap();
        store
            .add_semantic_item("Browser open on the news page", BTreeMap::new())
            .await
            .unwrap();
        let found = store.search_semantic("calculator", 5).await;
        assert_eq!(found.len(), 1);
        assert!(found[0].text.contains("Calculator"));
    }

    #[tokio::test]
    async fn semantic_search_ranks_by_cosine_with_embedder() {
        let (_dir, store) = open_store(Some(Arc::new(StubEmbedder)));
        store
            .add_semantic_item("state of the calculator app", BTreeMap::new())
            .await
            .unwrap();
        store
            .add_semantic_item("state of the browser window", BTreeMap::new())
            .await
            .unwrap();
        let found = store.search_semantic("calculator result", 1).await;
        assert_eq!(found.len(), 1);
        assert!(found[0].text.contains("calculator"));
    }

    #[tokio::test]
    async fn semantic_items_persist_metadata() {
        let (_dir, store) = open_store(None);
        let mut metadata = BTreeMap::new();
        metadata.insert("step_id".to_string(), serde_json::json!(2));
        let item = store
            .add_semantic_item("visual state", metadata)
            .await
            .unwrap();
        let found = store.search_semantic("visual", 5).await;
        assert_eq!(found[0].id, item.id);
        assert_eq!(found[0].metadata.get("step_id").unwrap(), 2);
    }

    // ── Skills ───────────────────────────────────────────────────────────────

    fn macro_actions() -> Vec<Action> {
        vec![
            Action::OpenApp {
                app_name: "Calculator".into(),
                verify_after: None,
            },
            Action::Key {
                keys: vec!["enter".into()],
                verify_after: None,
            },
        ]
    }

    #[tokio::test]
    async fn save_skill_extracts_hints() {
        let (_dir, store) = open_store(None);
        let skill = store
            .save_skill(
                "open-calculator",
                "opens the calculator",
                macro_actions(),
                vec!["macro".into()],
                Some("open calculator".into()),
                Some(0),
            )
            .await
            .unwrap();
        assert!(skill.semantic_hints.types.contains(&"open_app".to_string()));
        assert!(skill.semantic_hints.labels.contains(&"Calculator".to_string()));
    }

    #[tokio::test]
    async fn search_skills_by_keyword_overlap() {
        let (_dir, store) = open_store(None);
        store
            .save_skill(
                "open-calculator",
                "opens the calculator",
                macro_actions(),
                vec!["macro".into()],
                None,
                None,
            )
            .await
            .unwrap();
        let found = store.search_skills("calculator", 5).await;
        assert_eq!(found.len(), 1);
        let none = store.search_skills("spreadsheet", 5).await;
        assert!(none.is_empty());
    }

    #[test]
    fn extract_hints_collects_urls() {
        let actions = vec![Action::BrowserOp {
            command: cua_types::BrowserCommand::Navigate,
            app_name: None,
            url: Some("https://example.com".into()),
            selector: None,
            value: None,
            script: None,
            verify_after: None,
        }];
        let hints = extract_semantic_hints(&actions);
        assert_eq!(hints.paths, vec!["https://example.com"]);
        assert_eq!(hints.types, vec!["browser_op"]);
    }
}
