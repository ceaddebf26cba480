//! [`Settings`] – process-wide configuration built once from the environment.
//!
//! All thresholds, model identifiers, and feature flags propagate from here
//! as values; no component reads the environment after startup. Variable
//! names are kept stable across platforms so existing `.env`
//! files keep working.
//!
//! | Variable | Field | Default |
//! |---|---|---|
//! | `OPENROUTER_API_KEY` / `_BASE_URL` / `_MODEL` | executor endpoint | `https://openrouter.ai/api/v1`, `anthropic/claude-opus-4.5` |
//! | `PLANNER_API_KEY` / `_BASE_URL` / `_MODEL` | planner endpoint (falls back to executor) | `anthropic/claude-3.5-sonnet` |
//! | `REFLECTOR_API_KEY` / `_BASE_URL` / `_MODEL` | reflector endpoint (falls back to executor) | `openai/gpt-5.1` |
//! | `EMBEDDING_API_KEY` / `_BASE_URL` / `_MODEL` | embeddings endpoint | `text-embedding-3-small` |
//! | `ENABLE_HID`, `ENABLE_SEMANTIC`, `ENABLE_SHELL`, `ENABLE_EMBEDDINGS`, `ENABLE_REFLECTION`, `STRICT_STEP_COMPLETION`, `CYBORG_MODE` | feature flags | see [`Settings::default`] |
//! | `ENCODE_FORMAT` | screenshot encoding (`PNG`/`JPEG`) | `JPEG` |
//! | `VERIFY_DELAY_MS`, `SETTLE_DELAY_MS`, `SSIM_CHANGE_THRESHOLD` | loop timing / change detection | 200, 500, 0.985 |
//! | `MAX_STEPS`, `MAX_FAILURES`, `MAX_WALL_CLOCK_SECONDS` | halt bounds | 50, 5, unbounded |
//! | `SHELL_WORKSPACE_ROOT`, `SHELL_MAX_RUNTIME_S`, `SHELL_MAX_OUTPUT_BYTES`, `SHELL_ALLOWED_COMMANDS` | sandboxed shell | `.agent_shell`, 10, 65536, empty |
//! | `BROWSER_SCRIPT_TIMEOUT_S`, `BROWSER_NAVIGATION_TIMEOUT_S` | browser driver deadlines | 8, 12 |
//! | `REASONING_EFFORT`, `REASONING_MAX_TOKENS` | executor reasoning budget | unset |
//! | `MEMORY_ROOT` | durable store root | `.agent_memory` |
//! | `CUA_SAFETY_RULES` | policy rules YAML path | `safety_rules.yaml` |

use std::path::PathBuf;

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(raw) => matches!(raw.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Runtime configuration. Construct with [`Settings::from_env`] at startup
/// and pass down by value or shared reference.
#[derive(Clone)]
pub struct Settings {
    pub openrouter_api_key: Option<String>,
    pub openrouter_base_url: String,
    pub openrouter_model: String,
    pub planner_api_key: Option<String>,
    pub planner_base_url: String,
    pub planner_model: String,
    pub reflector_api_key: Option<String>,
    pub reflector_base_url: String,
    pub reflector_model: String,
    pub embedding_api_key: Option<String>,
    pub embedding_base_url: String,
    pub embedding_model: String,

    pub enable_hid: bool,
    pub enable_semantic: bool,
    pub enable_shell: bool,
    pub enable_embeddings: bool,
    pub enable_reflection: bool,
    pub strict_step_completion: bool,
    /// Fall back from DevTools to synthesized HID input when the high-fidelity
    /// browser channel is unavailable.
    pub cyborg_mode: bool,

    /// Screenshot encoding: `"PNG"` or `"JPEG"`.
    pub encode_format: String,
    pub verify_delay_ms: u64,
    pub settle_delay_ms: u64,
    pub ssim_change_threshold: f64,
    pub max_steps: u32,
    pub max_failures: u32,
    pub max_wall_clock_seconds: Option<u64>,

    pub shell_workspace_root: String,
    pub shell_max_runtime_s: u64,
    pub shell_max_output_bytes: usize,
    /// Comma-separated legacy basename allowlist override.
    pub shell_allowed_commands: String,

    pub browser_script_timeout_s: f64,
    pub browser_navigation_timeout_s: f64,

    /// Reasoning effort hint for the executor model (`low`/`medium`/`high`).
    pub reasoning_effort: Option<String>,
    /// Reasoning token cap; ignored when `reasoning_effort` is set.
    pub reasoning_max_tokens: Option<u32>,

    pub memory_root: Option<String>,
    pub safety_rules_path: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            openrouter_api_key: None,
            openrouter_base_url: "https://openrouter.ai/api/v1".to_string(),
            openrouter_model: "anthropic/claude-opus-4.5".to_string(),
            planner_api_key: None,
            planner_base_url: "https://openrouter.ai/api/v1".to_string(),
            planner_model: "anthropic/claude-3.5-sonnet".to_string(),
            reflector_api_key: None,
            reflector_base_url: "https://openrouter.ai/api/v1".to_string(),
            reflector_model: "openai/gpt-5.1".to_string(),
            embedding_api_key: None,
            embedding_base_url: "https://api.openai.com/v1".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            enable_hid: false,
            enable_semantic: true,
            enable_shell: false,
            enable_embeddings: false,
            enable_reflection: true,
            strict_step_completion: true,
            cyborg_mode: true,
            encode_format: "JPEG".to_string(),
            verify_delay_ms: 200,
            settle_delay_ms: 500,
            ssim_change_threshold: 0.985,
            max_steps: 50,
            max_failures: 5,
            max_wall_clock_seconds: None,
            shell_workspace_root: ".agent_shell".to_string(),
            shell_max_runtime_s: 10,
            shell_max_output_bytes: 65536,
            shell_allowed_commands: String::new(),
            browser_script_timeout_s: 8.0,
            browser_navigation_timeout_s: 12.0,
            reasoning_effort: None,
            reasoning_max_tokens: None,
            memory_root: None,
            safety_rules_path: PathBuf::from("safety_rules.yaml"),
        }
    }
}

impl Settings {
    /// Build the configuration from the process environment, applying the
    /// documented fallback chain for the four endpoint credentials.
    pub fn from_env() -> Self {
        let mut s = Self::default();

        s.openrouter_api_key = env_string("OPENROUTER_API_KEY");
        if let Some(url) = env_string("OPENROUTER_BASE_URL") {
            s.openrouter_base_url = url;
        }
        if let Some(model) = env_string("OPENROUTER_MODEL") {
            s.openrouter_model = model;
        }

        // Planner and reflector default to the executor's endpoint.
        s.planner_api_key = env_string("PLANNER_API_KEY").or_else(|| s.openrouter_api_key.clone());
        s.planner_base_url =
            env_string("PLANNER_BASE_URL").unwrap_or_else(|| s.openrouter_base_url.clone());
        if let Some(model) = env_string("PLANNER_MODEL") {
            s.planner_model = model;
        }
        s.reflector_api_key =
            env_string("REFLECTOR_API_KEY").or_else(|| s.openrouter_api_key.clone());
        s.reflector_base_url =
            env_string("REFLECTOR_BASE_URL").unwrap_or_else(|| s.openrouter_base_url.clone());
        if let Some(model) = env_string("REFLECTOR_MODEL") {
            s.reflector_model = model;
        }

        // Embeddings: dedicated key, then OpenAI, then the executor's key
        // against the executor's base URL.
        s.embedding_api_key = env_string("EMBEDDING_API_KEY")
            .or_else(|| env_string("OPENAI_API_KEY"))
            .or_else(|| s.openrouter_api_key.clone());
        s.embedding_base_url = match env_string("EMBEDDING_BASE_URL") {
            Some(url) => url,
            None if s.openrouter_api_key.is_some() => s.openrouter_base_url.clone(),
            None => s.embedding_base_url,
        };
        if let Some(model) = env_string("EMBEDDING_MODEL") {
            s.embedding_model = model;
        }

        s.enable_hid = env_bool("ENABLE_HID", s.enable_hid);
        s.enable_semantic = env_bool("ENABLE_SEMANTIC", s.enable_semantic);
        s.enable_shell = env_bool("ENABLE_SHELL", s.enable_shell);
        s.enable_embeddings = env_bool("ENABLE_EMBEDDINGS", s.enable_embeddings);
        s.enable_reflection = env_bool("ENABLE_REFLECTION", s.enable_reflection);
        s.strict_step_completion = env_bool("STRICT_STEP_COMPLETION", s.strict_step_completion);
        s.cyborg_mode = env_bool("CYBORG_MODE", s.cyborg_mode);

        if let Some(fmt) = env_string("ENCODE_FORMAT") {
            s.encode_format = fmt;
        }
        s.verify_delay_ms = env_parse("VERIFY_DELAY_MS", s.verify_delay_ms);
        s.settle_delay_ms = env_parse("SETTLE_DELAY_MS", s.settle_delay_ms);
        s.ssim_change_threshold = env_parse("SSIM_CHANGE_THRESHOLD", s.ssim_change_threshold);
        s.max_steps = env_parse("MAX_STEPS", s.max_steps);
        s.max_failures = env_parse("MAX_FAILURES", s.max_failures);
        s.max_wall_clock_seconds = match env_parse("MAX_WALL_CLOCK_SECONDS", 0u64) {
            0 => None,
            secs => Some(secs),
        };

        if let Some(root) = env_string("SHELL_WORKSPACE_ROOT") {
            s.shell_workspace_root = root;
        }
        s.shell_max_runtime_s = env_parse("SHELL_MAX_RUNTIME_S", s.shell_max_runtime_s);
        s.shell_max_output_bytes = env_parse("SHELL_MAX_OUTPUT_BYTES", s.shell_max_output_bytes);
        if let Some(allow) = env_string("SHELL_ALLOWED_COMMANDS") {
            s.shell_allowed_commands = allow;
        }

        s.browser_script_timeout_s =
            env_parse("BROWSER_SCRIPT_TIMEOUT_S", s.browser_script_timeout_s);
        s.browser_navigation_timeout_s =
            env_parse("BROWSER_NAVIGATION_TIMEOUT_S", s.browser_navigation_timeout_s);

        s.reasoning_effort = env_string("REASONING_EFFORT");
        s.reasoning_max_tokens = match env_parse("REASONING_MAX_TOKENS", 0u32) {
            0 => None,
            tokens => Some(tokens),
        };

        s.memory_root = env_string("MEMORY_ROOT");
        if let Some(path) = env_string("CUA_SAFETY_RULES") {
            s.safety_rules_path = PathBuf::from(path);
        }

        s
    }

    /// MIME type matching the configured screenshot encoding.
    pub fn frame_mime(&self) -> &'static str {
        if self.encode_format.eq_ignore_ascii_case("png") {
            "image/png"
        } else {
            "image/jpeg"
        }
    }
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn key_state(key: &Option<String>) -> &'static str {
            if key.is_some() { "<redacted>" } else { "<not set>" }
        }
        f.debug_struct("Settings")
            .field("openrouter_api_key", &key_state(&self.openrouter_api_key))
            .field("openrouter_base_url", &self.openrouter_base_url)
            .field("openrouter_model", &self.openrouter_model)
            .field("planner_api_key", &key_state(&self.planner_api_key))
            .field("planner_model", &self.planner_model)
            .field("reflector_api_key", &key_state(&self.reflector_api_key))
            .field("reflector_model", &self.reflector_model)
            .field("embedding_api_key", &key_state(&self.embedding_api_key))
            .field("embedding_model", &self.embedding_model)
            .field("enable_hid", &self.enable_hid)
            .field("enable_semantic", &self.enable_semantic)
            .field("enable_shell", &self.enable_shell)
            .field("enable_embeddings", &self.enable_embeddings)
            .field("enable_reflection", &self.enable_reflection)
            .field("max_steps", &self.max_steps)
            .field("max_failures", &self.max_failures)
            .field("max_wall_clock_seconds", &self.max_wall_clock_seconds)
            .field("memory_root", &self.memory_root)
            .finish_non_exhaustive()
    }
}
