use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{Result, WreckitError};
use crate::git::Git;
use crate::item::{Item, Phase};
use crate::log_warn;
use crate::store::Store;

// --- Definitions ---

/// A named capability bundle: the tools a phase agent may use, the MCP
/// endpoints it may reach, and the context loaded just-in-time into its
/// prompt.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Skill {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tools: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub mcp_servers: BTreeMap<String, McpEndpoint>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_context: Vec<ContextRequirement>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct McpEndpoint {
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContextRequirement {
    /// A literal file read relative to the project root.
    File { path: String },
    /// Porcelain-style snapshot of the working tree.
    GitStatus,
    /// The item record serialized as JSON.
    ItemMetadata,
    /// A named artifact from the current item's directory.
    PhaseArtifact { name: String },
}

impl ContextRequirement {
    fn label(&self) -> String {
        match self {
            ContextRequirement::File { path } => format!("file: {}", path),
            ContextRequirement::GitStatus => "git status".to_string(),
            ContextRequirement::ItemMetadata => "item metadata".to_string(),
            ContextRequirement::PhaseArtifact { name } => format!("artifact: {}", name),
        }
    }
}

// --- Resolution ---

/// Outcome of resolving the configured skills for a phase.
#[derive(Debug, Clone, PartialEq)]
pub struct SkillResolution {
    /// Effective tool allowlist: intersection of the phase's static
    /// allowlist with the union of the resolved skills' tool sets.
    pub tools: BTreeSet<String>,
    pub mcp_servers: BTreeMap<String, McpEndpoint>,
    pub loaded_ids: Vec<String>,
    /// Non-fatal resolution problems (unknown skill ids, unknown tools).
    pub errors: Vec<String>,
}

/// The static per-phase tool allowlist. Skills can only narrow this set.
pub fn static_allowlist(phase: Phase) -> BTreeSet<String> {
    let tools: &[&str] = match phase {
        Phase::Research => &["Read", "Grep", "Glob", "WebSearch", "WebFetch"],
        Phase::Plan => &["Read", "Grep", "Glob", "Write", "Edit"],
        Phase::Implement => &["Read", "Grep", "Glob", "Write", "Edit", "Bash"],
        Phase::Pr => &["Read", "Grep", "Glob", "Bash"],
    };
    tools.iter().map(|t| t.to_string()).collect()
}

/// Resolve the skills configured for a phase.
///
/// Unknown skill ids are skipped with a warning and recorded in `errors`,
/// never fatal. A skill tool absent from the phase allowlist is dropped by
/// the intersection and recorded. Duplicate MCP endpoint names with
/// differing definitions are a `ConfigError`; silently picking one would
/// hide a real configuration conflict.
pub fn resolve_for_phase(phase: Phase, config: &Config) -> Result<SkillResolution> {
    let allowlist = static_allowlist(phase);

    let skill_ids = config
        .phase_skills
        .get(phase.as_str())
        .cloned()
        .unwrap_or_default();

    if skill_ids.is_empty() {
        return Ok(SkillResolution {
            tools: allowlist,
            mcp_servers: BTreeMap::new(),
            loaded_ids: Vec::new(),
            errors: Vec::new(),
        });
    }

    let mut requested: BTreeSet<String> = BTreeSet::new();
    let mut mcp_servers: BTreeMap<String, McpEndpoint> = BTreeMap::new();
    let mut loaded_ids = Vec::new();
    let mut errors = Vec::new();

    for id in &skill_ids {
        let skill = match config.skills.get(id) {
            Some(s) => s,
            None => {
                log_warn!("[skill] Unknown skill id '{}' for phase {}, skipping", id, phase);
                errors.push(format!("unknown skill id '{}'", id));
                continue;
            }
        };

        requested.extend(skill.tools.iter().cloned());

        for (name, endpoint) in &skill.mcp_servers {
            match mcp_servers.get(name) {
                Some(existing) if existing != endpoint => {
                    return Err(WreckitError::ConfigError(format!(
                        "MCP endpoint '{}' defined differently by multiple skills",
                        name
                    )));
                }
                Some(_) => {}
                None => {
                    mcp_servers.insert(name.clone(), endpoint.clone());
                }
            }
        }

        loaded_ids.push(skill.id.clone());
    }

    let tools: BTreeSet<String> = requested.intersection(&allowlist).cloned().collect();

    for dropped in requested.difference(&allowlist) {
        log_warn!(
            "[skill] Tool '{}' is outside the {} phase allowlist, dropped",
            dropped,
            phase
        );
        errors.push(format!("tool '{}' outside phase allowlist", dropped));
    }

    Ok(SkillResolution {
        tools,
        mcp_servers,
        loaded_ids,
        errors,
    })
}

// --- JIT context ---

/// Context assembled for the resolved skills, partitioned into labelled
/// sections so the agent can locate each piece.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SkillContext {
    pub text: String,
    /// Requirements that failed to load (missing file, missing artifact).
    /// Recorded, never fatal; the assembled text flags them explicitly.
    pub errors: Vec<String>,
}

/// Load the required context for a set of resolved skills.
///
/// Each requirement becomes one labelled section. A requirement that fails
/// to load contributes an "unavailable" section instead of aborting; the
/// agent is told what is missing rather than silently given less context.
pub fn build_context(
    config: &Config,
    loaded_ids: &[String],
    store: &Store,
    git: &Git,
    item: &Item,
) -> SkillContext {
    let mut sections: Vec<String> = Vec::new();
    let mut errors = Vec::new();

    for id in loaded_ids {
        let skill = match config.skills.get(id) {
            Some(s) => s,
            None => continue,
        };

        for req in &skill.required_context {
            let label = req.label();
            match load_requirement(req, store, git, item) {
                Ok(body) => {
                    sections.push(format!("### Context ({})\n\n{}", label, body.trim_end()));
                }
                Err(detail) => {
                    sections.push(format!(
                        "### Context ({})\n\n[unavailable: {}]",
                        label, detail
                    ));
                    errors.push(format!("{}: {}", label, detail));
                }
            }
        }
    }

    SkillContext {
        text: sections.join("\n\n"),
        errors,
    }
}

fn load_requirement(
    req: &ContextRequirement,
    store: &Store,
    git: &Git,
    item: &Item,
) -> std::result::Result<String, String> {
    match req {
        ContextRequirement::File { path } => {
            let full = store.root().join(path);
            std::fs::read_to_string(&full).map_err(|e| format!("{}", e))
        }
        ContextRequirement::GitStatus => {
            let entries = git.status().map_err(|e| e.to_string())?;
            if entries.is_empty() {
                return Ok("(clean)".to_string());
            }
            Ok(entries
                .iter()
                .map(|e| format!("{} {}", e.status_code, e.path))
                .collect::<Vec<_>>()
                .join("\n"))
        }
        ContextRequirement::ItemMetadata => {
            serde_json::to_string_pretty(item).map_err(|e| e.to_string())
        }
        ContextRequirement::PhaseArtifact { name } => {
            store.read_artifact(&item.id, name).map_err(|e| e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn skill(id: &str, tools: &[&str]) -> Skill {
        Skill {
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            tools: tools.iter().map(|t| t.to_string()).collect(),
            mcp_servers: BTreeMap::new(),
            required_context: Vec::new(),
        }
    }

    fn config_with(phase: Phase, skill_ids: &[&str], skills: Vec<Skill>) -> Config {
        let mut config = Config::default();
        config.phase_skills.insert(
            phase.as_str().to_string(),
            skill_ids.iter().map(|s| s.to_string()).collect(),
        );
        for s in skills {
            config.skills.insert(s.id.clone(), s);
        }
        config
    }

    #[test]
    fn no_skills_returns_static_allowlist() {
        let config = Config::default();
        let res = resolve_for_phase(Phase::Research, &config).unwrap();
        assert_eq!(res.tools, static_allowlist(Phase::Research));
        assert!(res.loaded_ids.is_empty());
        assert!(res.errors.is_empty());
    }

    #[test]
    fn intersection_narrows_never_widens() {
        // Phase allowlist lacks Delete; the skill cannot introduce it.
        let config = config_with(
            Phase::Implement,
            &["coder"],
            vec![skill("coder", &["Read", "Delete"])],
        );
        let res = resolve_for_phase(Phase::Implement, &config).unwrap();
        assert_eq!(
            res.tools,
            ["Read"].iter().map(|t| t.to_string()).collect::<BTreeSet<_>>()
        );
        assert!(res.errors.iter().any(|e| e.contains("Delete")));
    }

    #[test]
    fn unknown_skill_id_is_skipped_not_fatal() {
        let config = config_with(Phase::Plan, &["ghost", "real"], vec![skill("real", &["Read"])]);
        let res = resolve_for_phase(Phase::Plan, &config).unwrap();
        assert_eq!(res.loaded_ids, vec!["real".to_string()]);
        assert!(res.errors.iter().any(|e| e.contains("ghost")));
    }

    #[test]
    fn mcp_collision_with_different_definition_is_config_error() {
        let mut a = skill("a", &["Read"]);
        a.mcp_servers.insert(
            "search".into(),
            McpEndpoint {
                command: "mcp-search".into(),
                args: vec![],
            },
        );
        let mut b = skill("b", &["Read"]);
        b.mcp_servers.insert(
            "search".into(),
            McpEndpoint {
                command: "other-search".into(),
                args: vec![],
            },
        );
        let config = config_with(Phase::Plan, &["a", "b"], vec![a, b]);
        let err = resolve_for_phase(Phase::Plan, &config).unwrap_err();
        assert!(matches!(err, WreckitError::ConfigError(_)));
    }

    #[test]
    fn identical_mcp_definitions_merge_cleanly() {
        let endpoint = McpEndpoint {
            command: "mcp-search".into(),
            args: vec!["--fast".into()],
        };
        let mut a = skill("a", &["Read"]);
        a.mcp_servers.insert("search".into(), endpoint.clone());
        let mut b = skill("b", &["Grep"]);
        b.mcp_servers.insert("search".into(), endpoint.clone());
        let config = config_with(Phase::Plan, &["a", "b"], vec![a, b]);
        let res = resolve_for_phase(Phase::Plan, &config).unwrap();
        assert_eq!(res.mcp_servers.len(), 1);
        assert_eq!(res.mcp_servers["search"], endpoint);
    }
}
