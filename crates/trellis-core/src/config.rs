use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrellisError};
use crate::types::{node_types, ContextMode};

/// Top-level Trellis configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database path (`~` is expanded).
    #[serde(default = "default_store_path")]
    pub path: String,
    /// How long a connection waits on a locked database.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Lease length granted on claim and on each heartbeat.
    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: u64,
    /// Maximum nodes claimed per tick.
    #[serde(default = "default_claim_limit")]
    pub claim_limit: usize,
    /// Interval of the expired-lease sweep.
    #[serde(default = "default_reclaim_interval_secs")]
    pub reclaim_interval_secs: u64,
    /// Worker identity recorded on claims. Default: random per process.
    #[serde(default)]
    pub worker_id: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lease_seconds: default_lease_seconds(),
            claim_limit: default_claim_limit(),
            reclaim_interval_secs: default_reclaim_interval_secs(),
            worker_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Turns kept by windowed assembly.
    #[serde(default = "default_window_turns")]
    pub window_turns: usize,
    /// Node types always included regardless of the window.
    #[serde(default = "default_pinned_node_types")]
    pub pinned_node_types: Vec<String>,
    /// Most recent summaries always included.
    #[serde(default = "default_recent_summaries")]
    pub recent_summaries: usize,
    #[serde(default)]
    pub mode: ContextMode,
    /// Characters kept per string in output previews.
    #[serde(default = "default_preview_chars")]
    pub preview_chars: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            window_turns: default_window_turns(),
            pinned_node_types: default_pinned_node_types(),
            recent_summaries: default_recent_summaries(),
            mode: ContextMode::default(),
            preview_chars: default_preview_chars(),
        }
    }
}

/// Context budget configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Model context window. Unset disables budget fitting.
    #[serde(default)]
    pub context_window_tokens: Option<usize>,
    #[serde(default = "default_reserved_output_tokens")]
    pub reserved_output_tokens: usize,
    /// Node types whose outputs are tool outputs eligible for pruning.
    #[serde(default = "default_tool_node_types")]
    pub tool_node_types: Vec<String>,
    /// Tool outputs longer than this are truncated by the soft pass.
    #[serde(default = "default_soft_prune_max_chars")]
    pub soft_prune_max_chars: usize,
    #[serde(default = "default_soft_prune_head_chars")]
    pub soft_prune_head_chars: usize,
    #[serde(default = "default_soft_prune_tail_chars")]
    pub soft_prune_tail_chars: usize,
    /// Hard clearing only engages when tool outputs total at least this many chars.
    #[serde(default = "default_hard_clear_min_total_chars")]
    pub hard_clear_min_total_chars: usize,
    #[serde(default = "default_hard_clear_placeholder")]
    pub hard_clear_placeholder: String,
    /// Summarize and compress dropped turns the first time the window shrinks.
    #[serde(default)]
    pub auto_compact: bool,
}

impl BudgetConfig {
    /// Tokens available for the prompt, if a window is configured.
    pub fn limit(&self) -> Option<usize> {
        self.context_window_tokens
            .map(|w| w.saturating_sub(self.reserved_output_tokens))
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            context_window_tokens: None,
            reserved_output_tokens: default_reserved_output_tokens(),
            tool_node_types: default_tool_node_types(),
            soft_prune_max_chars: default_soft_prune_max_chars(),
            soft_prune_head_chars: default_soft_prune_head_chars(),
            soft_prune_tail_chars: default_soft_prune_tail_chars(),
            hard_clear_min_total_chars: default_hard_clear_min_total_chars(),
            hard_clear_placeholder: default_hard_clear_placeholder(),
            auto_compact: false,
        }
    }
}

/// JSONL event logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable event logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: next to the database, in `logs/`.
    #[serde(default)]
    pub log_dir: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
        }
    }
}

fn default_store_path() -> String { "~/.trellis/trellis.db".to_string() }
fn default_busy_timeout_ms() -> u64 { 5_000 }
fn default_lease_seconds() -> u64 { 300 }
fn default_claim_limit() -> usize { 10 }
fn default_reclaim_interval_secs() -> u64 { 30 }
fn default_window_turns() -> usize { 20 }
fn default_pinned_node_types() -> Vec<String> {
    vec![
        node_types::SYSTEM_MESSAGE.to_string(),
        node_types::DEVELOPER_MESSAGE.to_string(),
    ]
}
fn default_recent_summaries() -> usize { 2 }
fn default_preview_chars() -> usize { 2_000 }
fn default_reserved_output_tokens() -> usize { 4_096 }
fn default_tool_node_types() -> Vec<String> { vec![node_types::TASK.to_string()] }
fn default_soft_prune_max_chars() -> usize { 4_000 }
fn default_soft_prune_head_chars() -> usize { 1_500 }
fn default_soft_prune_tail_chars() -> usize { 1_500 }
fn default_hard_clear_min_total_chars() -> usize { 20_000 }
fn default_hard_clear_placeholder() -> String { "[tool output cleared to fit context]".to_string() }
fn default_log_enabled() -> bool { true }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| TrellisError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| TrellisError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.scheduler.lease_seconds == 0 {
            return Err(TrellisError::Config(
                "scheduler.lease_seconds must be positive".into(),
            ));
        }
        if self.context.window_turns == 0 {
            return Err(TrellisError::Config(
                "context.window_turns must be at least 1".into(),
            ));
        }
        if let Some(window) = self.budget.context_window_tokens {
            if window <= self.budget.reserved_output_tokens {
                return Err(TrellisError::Config(format!(
                    "budget.context_window_tokens ({}) must exceed reserved_output_tokens ({})",
                    window, self.budget.reserved_output_tokens
                )));
            }
        }
        Ok(())
    }

    /// Resolve the database path (expand ~).
    pub fn store_path(&self) -> PathBuf {
        expand_home(&self.store.path)
    }

    /// Resolve the event log directory.
    pub fn log_dir(&self) -> Option<PathBuf> {
        let log = self.log.as_ref().filter(|l| l.enabled)?;
        Some(match &log.log_dir {
            Some(dir) => expand_home(dir),
            None => self
                .store_path()
                .parent()
                .map(|p| p.join("logs"))
                .unwrap_or_else(|| PathBuf::from("logs")),
        })
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
