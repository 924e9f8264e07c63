//! Engine configuration, loaded from a TOML file.
//!
//! Every knob has a default so an empty file is a valid config.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root for per-agent home directories and persisted state.
    #[serde(default = "d_home_base")]
    pub home_base_path: PathBuf,

    /// Replaceable-entity address of this project. Events addressed to
    /// the project (lessons, status) carry it in an `a` tag.
    #[serde(default = "d_project_address")]
    pub project_address: String,

    #[serde(default)]
    pub llm_defaults: LlmDefaults,

    /// Optional project-wide system prompt fragment appended to every
    /// agent's system block.
    #[serde(default)]
    pub global_system_prompt: Option<String>,

    /// Tool names denied per agent category (advisory metadata on the
    /// agent picks the category).
    #[serde(default)]
    pub tool_denies_by_category: HashMap<String, Vec<String>>,

    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub shell: ShellConfig,

    #[serde(default)]
    pub publish: PublishConfig,
}

/// Role → LLM config-name defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmDefaults {
    #[serde(default = "d_default_config")]
    pub agents: String,
    #[serde(default = "d_default_config")]
    pub analyze: String,
    #[serde(default = "d_default_config")]
    pub orchestrator: String,
    #[serde(default = "d_default_config")]
    pub summarization: String,
}

impl Default for LlmDefaults {
    fn default() -> Self {
        Self {
            agents: d_default_config(),
            analyze: d_default_config(),
            orchestrator: d_default_config(),
            summarization: d_default_config(),
        }
    }
}

/// Streaming-content flush behaviour. Tunables, not contracts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Buffered content is flushed at least this often (milliseconds).
    #[serde(default = "d_500")]
    pub flush_interval_ms: u64,
    /// Also flush whenever the buffer contains a newline.
    #[serde(default = "d_true")]
    pub flush_on_newline: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: d_500(),
            flush_on_newline: d_true(),
        }
    }
}

/// Budgets and deadlines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Default tool-call budget per loop; agents may override.
    #[serde(default = "d_10")]
    pub max_agent_steps: usize,
    /// LLM stream deadline (seconds).
    #[serde(default = "d_600")]
    pub llm_deadline_secs: u64,
    /// Single tool-call deadline (seconds).
    #[serde(default = "d_300")]
    pub tool_deadline_secs: u64,
    /// Delegation deadline (seconds). 0 = unbounded.
    #[serde(default)]
    pub delegation_deadline_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_agent_steps: d_10(),
            llm_deadline_secs: d_600(),
            tool_deadline_secs: d_300(),
            delegation_deadline_secs: 0,
        }
    }
}

/// Shell tool guard rails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellConfig {
    /// Regex patterns; commands matching any of them are refused.
    #[serde(default = "d_denied_commands")]
    pub denied_commands: Vec<String>,
    #[serde(default = "d_120")]
    pub timeout_secs: u64,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            denied_commands: d_denied_commands(),
            timeout_secs: d_120(),
        }
    }
}

impl ShellConfig {
    /// Compile the denied-command patterns. Invalid patterns are a config
    /// error at startup, not at call time.
    pub fn compile_denied(&self) -> Result<regex::RegexSet> {
        regex::RegexSet::new(&self.denied_commands)
            .map_err(|e| Error::Config(format!("invalid denied-command pattern: {e}")))
    }
}

/// Publish retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishConfig {
    #[serde(default = "d_4")]
    pub max_retries: u32,
    /// Initial backoff; doubles per attempt, capped at 8x.
    #[serde(default = "d_250")]
    pub backoff_ms: u64,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            max_retries: d_4(),
            backoff_ms: d_250(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            home_base_path: d_home_base(),
            project_address: d_project_address(),
            llm_defaults: LlmDefaults::default(),
            global_system_prompt: None,
            tool_denies_by_category: HashMap::new(),
            stream: StreamConfig::default(),
            limits: LimitsConfig::default(),
            shell: ShellConfig::default(),
            publish: PublishConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load from a TOML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(Error::Io)?;
        toml::from_str(&raw).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    /// Denies for an agent category, empty when unconfigured.
    pub fn category_denies(&self, category: &str) -> &[String] {
        self.tool_denies_by_category
            .get(category)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

fn d_home_base() -> PathBuf {
    PathBuf::from(".conclave")
}
fn d_project_address() -> String {
    "project:conclave".into()
}
fn d_default_config() -> String {
    "default".into()
}
fn d_true() -> bool {
    true
}
fn d_4() -> u32 {
    4
}
fn d_10() -> usize {
    10
}
fn d_120() -> u64 {
    120
}
fn d_250() -> u64 {
    250
}
fn d_300() -> u64 {
    300
}
fn d_500() -> u64 {
    500
}
fn d_600() -> u64 {
    600
}
fn d_denied_commands() -> Vec<String> {
    vec![
        r"(^|\s)rm\s+-rf\s+/($|\s)".into(),
        r"(^|\s)mkfs(\.|\s)".into(),
        r"(^|\s)dd\s+if=".into(),
        r":\(\)\s*\{.*\};\s*:".into(),
        r"(^|\s)shutdown(\s|$)".into(),
        r"(^|\s)reboot(\s|$)".into(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_is_all_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.limits.max_agent_steps, 10);
        assert_eq!(config.stream.flush_interval_ms, 500);
        assert!(config.stream.flush_on_newline);
        assert_eq!(config.limits.delegation_deadline_secs, 0);
    }

    #[test]
    fn overrides_apply() {
        let config: EngineConfig = toml::from_str(
            r#"
            [limits]
            max_agent_steps = 3

            [stream]
            flush_interval_ms = 100

            [tool_denies_by_category]
            auditor = ["shell", "fs_write"]
            "#,
        )
        .unwrap();
        assert_eq!(config.limits.max_agent_steps, 3);
        assert_eq!(config.stream.flush_interval_ms, 100);
        assert_eq!(config.category_denies("auditor"), ["shell", "fs_write"]);
        assert!(config.category_denies("worker").is_empty());
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = EngineConfig::load(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.publish.max_retries, 4);
    }

    #[test]
    fn default_denied_commands_compile() {
        let set = ShellConfig::default().compile_denied().unwrap();
        assert!(set.is_match("rm -rf /"));
        assert!(!set.is_match("cargo build"));
    }
}
