use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WreckitError};
use crate::item::parse_phase;
use crate::skill::Skill;

pub const EXPECTED_SCHEMA_VERSION: u32 = 1;

/// Process-wide resolved configuration. Loaded once at startup from
/// `.wreckit/config.json` (plus the optional `skills.json`), validated,
/// and immutable for the duration of a run.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Config {
    pub schema_version: u32,
    pub base_branch: String,
    pub branch_prefix: String,
    pub agent: AgentBackend,
    pub max_iterations: u32,
    pub timeout_seconds: u64,
    pub completion_signal: String,
    pub lock_timeout_seconds: u64,
    pub story_retry_limit: u32,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub phase_skills: BTreeMap<String, Vec<String>>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub skills: BTreeMap<String, Skill>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            schema_version: EXPECTED_SCHEMA_VERSION,
            base_branch: "main".to_string(),
            branch_prefix: "wreckit/".to_string(),
            agent: AgentBackend::default(),
            max_iterations: 100,
            timeout_seconds: 1800,
            completion_signal: "WRECKIT_COMPLETE".to_string(),
            lock_timeout_seconds: 30,
            story_retry_limit: 2,
            phase_skills: BTreeMap::new(),
            skills: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn phase_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_seconds)
    }

    /// Branch name for an item: `<prefix><id>`.
    pub fn branch_for(&self, item_id: &str) -> String {
        format!("{}{}", self.branch_prefix, item_id)
    }
}

/// Agent backend selection, discriminated on `kind`. All built-in backends
/// run through the subprocess supervisor; `process` runs an arbitrary
/// operator-supplied command.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentBackend {
    ClaudeSdk {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
    AmpSdk {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
    CodexSdk {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
    OpencodeSdk {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
    Process {
        command: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<String>,
    },
    Rlm {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
    Sprite {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        workspace: Option<String>,
    },
}

impl Default for AgentBackend {
    fn default() -> Self {
        AgentBackend::ClaudeSdk { model: None }
    }
}

impl AgentBackend {
    pub fn kind(&self) -> &'static str {
        match self {
            AgentBackend::ClaudeSdk { .. } => "claude_sdk",
            AgentBackend::AmpSdk { .. } => "amp_sdk",
            AgentBackend::CodexSdk { .. } => "codex_sdk",
            AgentBackend::OpencodeSdk { .. } => "opencode_sdk",
            AgentBackend::Process { .. } => "process",
            AgentBackend::Rlm { .. } => "rlm",
            AgentBackend::Sprite { .. } => "sprite",
        }
    }

    pub fn model(&self) -> Option<&str> {
        match self {
            AgentBackend::ClaudeSdk { model }
            | AgentBackend::AmpSdk { model }
            | AgentBackend::CodexSdk { model }
            | AgentBackend::OpencodeSdk { model }
            | AgentBackend::Rlm { model } => model.as_deref(),
            AgentBackend::Process { .. } | AgentBackend::Sprite { .. } => None,
        }
    }
}

fn is_safe_model_name(model: &str) -> bool {
    !model.is_empty()
        && !model.starts_with('-')
        && model
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-'))
}

pub fn validate(config: &Config) -> std::result::Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if config.schema_version != EXPECTED_SCHEMA_VERSION {
        errors.push(format!(
            "schema_version {} is unsupported (expected {})",
            config.schema_version, EXPECTED_SCHEMA_VERSION
        ));
    }

    if config.base_branch.trim().is_empty() {
        errors.push("base_branch must not be empty".to_string());
    }

    if config.branch_prefix.trim().is_empty() {
        errors.push("branch_prefix must not be empty".to_string());
    }

    if config.max_iterations < 1 {
        errors.push("max_iterations must be >= 1".to_string());
    }

    if config.timeout_seconds < 1 {
        errors.push("timeout_seconds must be >= 1".to_string());
    }

    if config.completion_signal.trim().is_empty() {
        errors.push("completion_signal must not be empty".to_string());
    }

    if let Some(model) = config.agent.model() {
        if !is_safe_model_name(model) {
            errors.push(
                "agent.model contains invalid characters (allowed: alphanumeric, '.', '_', '/', '-'; must not start with '-')"
                    .to_string(),
            );
        }
    }

    if let AgentBackend::Process { command, .. } = &config.agent {
        if command.trim().is_empty() {
            errors.push("agent.command must not be empty for kind 'process'".to_string());
        }
    }

    for phase_name in config.phase_skills.keys() {
        if parse_phase(phase_name).is_err() {
            errors.push(format!(
                "phase_skills references unknown phase '{}'",
                phase_name
            ));
        }
    }

    for (key, skill) in &config.skills {
        if skill.id != *key {
            errors.push(format!(
                "skill '{}' has mismatched id field '{}'",
                key, skill.id
            ));
        }
        if skill.tools.is_empty() {
            errors.push(format!("skill '{}' declares no tools", key));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Load the configuration from a store directory.
///
/// Reads `config.json`, merges the optional `skills.json` (inline config
/// definitions win on id collision), validates, and returns the immutable
/// config. Any problem at this stage is a `ConfigError`; configuration
/// never degrades silently.
pub fn load(store_dir: &Path) -> Result<Config> {
    let config_path = store_dir.join("config.json");
    let contents = std::fs::read_to_string(&config_path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            WreckitError::RepoNotFound(store_dir.to_path_buf())
        } else {
            WreckitError::io(&config_path, e)
        }
    })?;

    let mut config: Config = serde_json::from_str(&contents).map_err(|e| {
        WreckitError::ConfigError(format!("Failed to parse {}: {}", config_path.display(), e))
    })?;

    let skills_path = store_dir.join("skills.json");
    if skills_path.exists() {
        let skills_contents =
            std::fs::read_to_string(&skills_path).map_err(|e| WreckitError::io(&skills_path, e))?;
        let file_skills: BTreeMap<String, Skill> = serde_json::from_str(&skills_contents)
            .map_err(|e| {
                WreckitError::ConfigError(format!(
                    "Failed to parse {}: {}",
                    skills_path.display(),
                    e
                ))
            })?;
        for (id, skill) in file_skills {
            config.skills.entry(id).or_insert(skill);
        }
    }

    validate(&config).map_err(|errors| {
        WreckitError::ConfigError(format!(
            "Config validation failed:\n{}",
            errors
                .iter()
                .map(|e| format!("  - {}", e))
                .collect::<Vec<_>>()
                .join("\n")
        ))
    })?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(validate(&Config::default()).is_ok());
    }

    #[test]
    fn wrong_schema_version_rejected() {
        let config = Config {
            schema_version: 2,
            ..Default::default()
        };
        let errors = validate(&config).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("schema_version")));
    }

    #[test]
    fn flag_like_model_rejected() {
        let config = Config {
            agent: AgentBackend::ClaudeSdk {
                model: Some("--dangerous".into()),
            },
            ..Default::default()
        };
        assert!(validate(&config).is_err());
    }

    #[test]
    fn unknown_phase_in_phase_skills_rejected() {
        let mut config = Config::default();
        config
            .phase_skills
            .insert("deploy".into(), vec!["x".into()]);
        let errors = validate(&config).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("deploy")));
    }

    #[test]
    fn agent_backend_discriminates_on_kind() {
        let process: AgentBackend =
            serde_json::from_str(r#"{"kind":"process","command":"my-agent","args":["--fast"]}"#)
                .unwrap();
        assert_eq!(process.kind(), "process");

        let claude: AgentBackend =
            serde_json::from_str(r#"{"kind":"claude_sdk","model":"opus"}"#).unwrap();
        assert_eq!(claude.model(), Some("opus"));

        assert!(serde_json::from_str::<AgentBackend>(r#"{"kind":"carrier_pigeon"}"#).is_err());
    }

    #[test]
    fn branch_for_prefixes_item_id() {
        let config = Config::default();
        assert_eq!(
            config.branch_for("features/001-dark-mode"),
            "wreckit/features/001-dark-mode"
        );
    }
}
