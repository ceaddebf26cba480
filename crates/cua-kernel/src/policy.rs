//! [`PolicyEngine`] – single interception point between the runtime and the
//! drivers.
//!
//! Before any [`Action`] reaches a driver it must pass through
//! [`PolicyEngine::evaluate`], which applies the configured [`SafetyRules`]
//! in a fixed order and short-circuits on the first match:
//!
//! 1. Blocked action types / browser commands → deny.
//! 2. `run_javascript` on a sensitive domain → deny; risky script payloads →
//!    allow with human confirmation (HITL).
//! 3. Spatial exclusion zones (source or drag-target point) → deny.
//! 4. `sandbox_shell`: the executable must resolve (via PATH) to an absolute
//!    path present in the fixed allowlist, with the subcommand permitted →
//!    otherwise deny.
//! 5. Blocked bundle / app identifiers → deny.
//! 6. Configured HITL action types / browser commands → allow+hitl.
//! 7. Destructive shell patterns and script-file execution → allow+hitl.
//! 8. Otherwise → allow.
//!
//! HITL outcomes are never silently executed: in automated mode the router
//! reports them as failures with reason `"human confirmation required"`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use cua_types::{Action, Settings};

// ─────────────────────────────────────────────────────────────────────────────
// Rules
// ─────────────────────────────────────────────────────────────────────────────

/// A rectangular screen region the agent must not interact with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExclusionZone {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub w: f64,
    #[serde(default)]
    pub h: f64,
    #[serde(default = "default_zone_label")]
    pub label: String,
}

fn default_zone_label() -> String {
    "restricted area".to_string()
}

impl ExclusionZone {
    fn contains(&self, px: f64, py: f64) -> bool {
        px >= self.x && px <= self.x + self.w && py >= self.y && py <= self.y + self.h
    }
}

/// Safety rules loaded from YAML and merged over the built-in defaults.
/// Every key is optional in the file; absent keys keep their default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyRules {
    #[serde(default = "default_blocked_actions")]
    pub blocked_actions: Vec<String>,
    #[serde(default = "default_blocked_bundle_ids")]
    pub blocked_bundle_ids: Vec<String>,
    #[serde(default = "default_hitl_actions")]
    pub hitl_actions: Vec<String>,
    #[serde(default)]
    pub sensitive_domains: Vec<String>,
    /// Legacy basename allowlist; parsed for compatibility but the absolute
    /// path allowlist is authoritative.
    #[serde(default)]
    pub allowed_shell_basenames: Vec<String>,
    #[serde(default)]
    pub blocked_shell_basenames: Vec<String>,
    #[serde(default)]
    pub exclusion_zones: Vec<ExclusionZone>,
}

fn default_blocked_actions() -> Vec<String> {
    vec!["shell_command".to_string()]
}

fn default_blocked_bundle_ids() -> Vec<String> {
    vec!["com.apple.keychainaccess".to_string()]
}

fn default_hitl_actions() -> Vec<String> {
    vec![
        "erase_disk".to_string(),
        "format_disk".to_string(),
        "run_javascript".to_string(),
    ]
}

impl Default for SafetyRules {
    fn default() -> Self {
        Self {
            blocked_actions: default_blocked_actions(),
            blocked_bundle_ids: default_blocked_bundle_ids(),
            hitl_actions: default_hitl_actions(),
            sensitive_domains: Vec::new(),
            allowed_shell_basenames: Vec::new(),
            blocked_shell_basenames: Vec::new(),
            exclusion_zones: Vec::new(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Decision
// ─────────────────────────────────────────────────────────────────────────────

/// Verdict for a single proposed action.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub reason: String,
    pub hitl_required: bool,
}

impl PolicyDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: String::new(),
            hitl_required: false,
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            hitl_required: false,
        }
    }

    fn hitl(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
            hitl_required: true,
        }
    }
}

/// Ambient context the router attaches before evaluation: the foreground
/// application identifier, window title, and (for browser JS) the page URL.
#[derive(Debug, Clone, Default)]
pub struct ActionContext {
    pub bundle_id: Option<String>,
    pub active_window_title: Option<String>,
    pub page_url: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// PolicyEngine
// ─────────────────────────────────────────────────────────────────────────────

/// Evaluates proposed actions against the configured safety rules.
pub struct PolicyEngine {
    rules: SafetyRules,
    /// Absolute executable path → allowed `argv[1]` subcommands, or `["*"]`
    /// for unrestricted arguments.
    allowed_commands: BTreeMap<PathBuf, Vec<&'static str>>,
}

const RISKY_JS_KEYWORDS: &[&str] = &[
    "fetch(",
    "xmlhttprequest",
    "ws://",
    "wss://",
    "document.cookie",
    "localstorage",
    "sessionstorage",
    "indexeddb",
    "eval(",
];

const DESTRUCTIVE_SHELL_PATTERNS: &[&str] = &[
    "rm -rf",
    "rd /s",
    "rmdir /s",
    "del /s",
    "remove-item",
    "format ",
];

const SCRIPT_FILE_EXTENSIONS: &[&str] = &[".ps1", ".bat", ".vbs", ".sh"];

impl PolicyEngine {
    /// Load rules from `path`, merged over the defaults. A missing file means
    /// defaults; a malformed file is logged and treated as missing.
    pub fn load(path: &Path, settings: &Settings) -> Self {
        let rules = match std::fs::read_to_string(path) {
            Ok(raw) => match serde_yaml::from_str::<SafetyRules>(&raw) {
                Ok(rules) => rules,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "malformed safety rules; using defaults");
                    SafetyRules::default()
                }
            },
            Err(_) => {
                info!(path = %path.display(), "safety rules file missing; using defaults");
                SafetyRules::default()
            }
        };
        Self::from_rules(rules, settings)
    }

    /// Build an engine from already-parsed rules, applying the
    /// `SHELL_ALLOWED_COMMANDS` legacy override from settings.
    pub fn from_rules(mut rules: SafetyRules, settings: &Settings) -> Self {
        if !settings.shell_allowed_commands.is_empty() {
            let allowlist: Vec<String> = settings
                .shell_allowed_commands
                .split(',')
                .map(|cmd| cmd.trim().to_string())
                .filter(|cmd| !cmd.is_empty())
                .collect();
            if !allowlist.is_empty() {
                info!(?allowlist, "applied legacy shell allowlist from environment");
                rules.allowed_shell_basenames = allowlist;
            }
        }
        Self {
            rules,
            allowed_commands: Self::default_allowed_commands(),
        }
    }

    /// The fixed allowlist of shell executables: absolute path → permitted
    /// subcommands (`["*"]` meaning any arguments). Both `/bin` and
    /// `/usr/bin` locations are listed because merged-usr systems resolve the
    /// same binaries through either prefix.
    fn default_allowed_commands() -> BTreeMap<PathBuf, Vec<&'static str>> {
        let mut map = BTreeMap::new();
        for dir in ["/bin", "/usr/bin"] {
            for tool in ["ls", "echo", "grep", "wc"] {
                map.insert(PathBuf::from(format!("{dir}/{tool}")), vec!["*"]);
            }
            map.insert(
                PathBuf::from(format!("{dir}/git")),
                vec!["status", "log", "diff", "show", "checkout", "branch"],
            );
        }
        map
    }

    pub fn rules(&self) -> &SafetyRules {
        &self.rules
    }

    /// Evaluate `action` with its ambient `ctx`. See the module docs for the
    /// rule order.
    pub fn evaluate(&self, action: &Action, ctx: &ActionContext) -> PolicyDecision {
        let action_type = action.kind();
        let browser_command = match action {
            Action::BrowserOp { command, .. } => Some(command.as_str()),
            _ => None,
        };

        // 1. Blocked action types / commands.
        if self.rules.blocked_actions.iter().any(|b| b == action_type) {
            return PolicyDecision::deny(format!("action blocked: {action_type}"));
        }
        if let Some(cmd) = browser_command
            && self.rules.blocked_actions.iter().any(|b| b == cmd)
        {
            return PolicyDecision::deny(format!("command blocked: {cmd}"));
        }

        // 2. Browser JS safety: sensitive domains deny, risky payloads HITL.
        if let Action::BrowserOp {
            command: cua_types::BrowserCommand::RunJavascript,
            script,
            ..
        } = action
        {
            let host = extract_hostname(ctx.page_url.as_deref().unwrap_or(""));
            for domain in &self.rules.sensitive_domains {
                if !domain.is_empty()
                    && (host == *domain || host.ends_with(&format!(".{domain}")))
                {
                    return PolicyDecision::deny(format!(
                        "run_javascript blocked on sensitive domain: {}",
                        if host.is_empty() { "unknown" } else { &host }
                    ));
                }
            }
            if let Some(keyword) = contains_risky_js(script.as_deref().unwrap_or("")) {
                return PolicyDecision::hitl(format!(
                    "run_javascript requires confirmation (risky pattern: {keyword})"
                ));
            }
        }

        // 3. Spatial exclusion: source and drag-target points.
        for zone in &self.rules.exclusion_zones {
            if let Some((x, y)) = action.source_point()
                && zone.contains(x, y)
            {
                return PolicyDecision::deny(format!(
                    "interaction in exclusion zone: {}",
                    zone.label
                ));
            }
            if let Some((tx, ty)) = action.target_point()
                && zone.contains(tx, ty)
            {
                return PolicyDecision::deny(format!(
                    "interaction target in exclusion zone: {}",
                    zone.label
                ));
            }
        }

        // 4. Sandboxed shell: resolve the executable and check the allowlist.
        if let Action::SandboxShell { cmd, .. } = action {
            if let Some(decision) = self.check_shell_allowlist(cmd) {
                return decision;
            }
        }

        // 5. Blocked bundle / app identifiers.
        if let Some(bundle) = ctx.bundle_id.as_deref()
            && self.rules.blocked_bundle_ids.iter().any(|b| b == bundle)
        {
            return PolicyDecision::deny(format!("bundle blocked: {bundle}"));
        }

        // 6. HITL action types / commands.
        if self.rules.hitl_actions.iter().any(|h| h == action_type) {
            return PolicyDecision::hitl("human confirmation required");
        }
        if let Some(cmd) = browser_command
            && self.rules.hitl_actions.iter().any(|h| h == cmd)
        {
            return PolicyDecision::hitl("human confirmation required");
        }

        // 7. Destructive shell patterns.
        if let Action::SandboxShell { cmd, .. } = action {
            let lowered = cmd.to_lowercase();
            if DESTRUCTIVE_SHELL_PATTERNS
                .iter()
                .any(|pat| lowered.contains(pat))
                || SCRIPT_FILE_EXTENSIONS
                    .iter()
                    .any(|ext| lowered.contains(ext))
            {
                return PolicyDecision::hitl("human confirmation required");
            }
        }

        PolicyDecision::allow()
    }

    fn check_shell_allowlist(&self, cmd: &str) -> Option<PolicyDecision> {
        let argv = match split_command(cmd) {
            Some(argv) => argv,
            None => return Some(PolicyDecision::deny("malformed command string")),
        };
        let Some(cmd_name) = argv.first() else {
            return Some(PolicyDecision::deny("empty command"));
        };

        let Some(resolved) = resolve_executable(cmd_name) else {
            return Some(PolicyDecision::deny(format!(
                "command not found: {cmd_name}"
            )));
        };

        let Some(allowed_args) = self.allowed_commands.get(&resolved) else {
            return Some(PolicyDecision::deny(format!(
                "command path not allowlisted: {}",
                resolved.display()
            )));
        };

        if !allowed_args.contains(&"*")
            && let Some(subcommand) = argv.get(1)
            && !subcommand.starts_with('-')
            && !allowed_args.iter().any(|a| *a == subcommand.as_str())
        {
            return Some(PolicyDecision::deny(format!(
                "subcommand not allowed: {subcommand}"
            )));
        }

        None
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Shell-style tokenizer: whitespace-separated words with single/double quote
/// grouping. Returns `None` for an unterminated quote.
pub(crate) fn split_command(cmd: &str) -> Option<Vec<String>> {
    let mut argv = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut has_token = false;

    for ch in cmd.chars() {
        match quote {
            Some(q) if ch == q => quote = None,
            Some(_) => current.push(ch),
            None => match ch {
                '\'' | '"' => {
                    quote = Some(ch);
                    has_token = true;
                }
                c if c.is_whitespace() => {
                    if has_token {
                        argv.push(std::mem::take(&mut current));
                        has_token = false;
                    }
                }
                c => {
                    current.push(c);
                    has_token = true;
                }
            },
        }
    }
    if quote.is_some() {
        return None;
    }
    if has_token {
        argv.push(current);
    }
    Some(argv)
}

/// Resolve `name` to an absolute executable path. Absolute and relative paths
/// are checked directly; bare names are searched through `PATH`.
pub(crate) fn resolve_executable(name: &str) -> Option<PathBuf> {
    let candidate = Path::new(name);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let full = dir.join(name);
        if full.is_file() {
            return Some(full);
        }
    }
    None
}

fn extract_hostname(url: &str) -> String {
    if url.is_empty() {
        return String::new();
    }
    let without_scheme = url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(url);
    let authority = without_scheme
        .split(['/', '?', '#'])
        .next()
        .unwrap_or("");
    let host_port = authority.rsplit('@').next().unwrap_or(authority);
    let host = host_port.split(':').next().unwrap_or(host_port);
    host.to_lowercase()
}

/// Scan a JS payload for risky usage. Returns the matched keyword (without
/// trailing parenthesis) when found.
fn contains_risky_js(code: &str) -> Option<&'static str> {
    if code.is_empty() {
        return None;
    }
    let lowered = code.to_lowercase();
    RISKY_JS_KEYWORDS
        .iter()
        .find(|kw| lowered.contains(*kw))
        .map(|kw| kw.trim_end_matches('('))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
