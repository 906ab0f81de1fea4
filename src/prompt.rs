use std::collections::BTreeMap;

use crate::config::Config;
use crate::error::{Result, WreckitError};
use crate::item::{Item, Phase};
use crate::store::{self, Store};

/// Render a prompt template, substituting `{{name}}` variable tokens.
///
/// Unknown variable names substitute to the empty string: templates are
/// operator-edited files and a typo should degrade, not crash a run.
/// Malformed syntax (an unterminated `{{`) is a `ConfigError` and fails
/// fast.
pub fn render(template: &str, vars: &BTreeMap<&str, String>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or_else(|| {
            WreckitError::ConfigError(format!(
                "Unterminated '{{{{' in prompt template near: {}",
                &rest[start..rest.len().min(start + 40)]
            ))
        })?;
        let name = after[..end].trim();
        if let Some(value) = vars.get(name) {
            out.push_str(value);
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);

    Ok(out)
}

/// Load a phase's prompt template from `.wreckit/prompts/<phase>.md`,
/// falling back to the compiled-in default when the file is absent.
pub fn load_template(store: &Store, phase: Phase) -> Result<String> {
    let path = store.prompts_dir().join(format!("{}.md", phase.as_str()));
    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(contents),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Ok(default_template(phase).to_string())
        }
        Err(e) => Err(WreckitError::io(&path, e)),
    }
}

/// Build the full variable map for a phase prompt.
///
/// Artifact-backed variables (`research`, `plan`, `prd`, `progress`) are
/// empty strings when the artifact does not exist yet; templates reference
/// whatever is relevant for their phase.
pub fn build_vars<'a>(
    item: &Item,
    store: &Store,
    config: &Config,
    skill_context: &str,
) -> BTreeMap<&'a str, String> {
    let artifact = |name: &str| store.read_artifact(&item.id, name).unwrap_or_default();

    let mut vars: BTreeMap<&str, String> = BTreeMap::new();
    vars.insert("id", item.id.clone());
    vars.insert("title", item.title.clone());
    vars.insert("section", item.section.clone());
    vars.insert("overview", item.overview.clone());
    vars.insert(
        "item_path",
        store.item_dir(&item.id).to_string_lossy().to_string(),
    );
    vars.insert(
        "branch_name",
        item.branch_name
            .clone()
            .unwrap_or_else(|| config.branch_for(&item.id)),
    );
    vars.insert("base_branch", config.base_branch.clone());
    vars.insert("completion_signal", config.completion_signal.clone());
    vars.insert("research", artifact(store::RESEARCH_MD));
    vars.insert("plan", artifact(store::PLAN_MD));
    vars.insert("prd", artifact(store::PRD_JSON));
    vars.insert("progress", artifact(store::PROGRESS_LOG));
    vars.insert("skill_context", skill_context.to_string());
    vars
}

/// Assemble the final prompt: skill context first (when present), then the
/// rendered template.
pub fn assemble(
    store: &Store,
    config: &Config,
    item: &Item,
    phase: Phase,
    skill_context: &str,
) -> Result<String> {
    let template = load_template(store, phase)?;
    let vars = build_vars(item, store, config, skill_context);
    render(&template, &vars)
}

/// Compiled-in default templates, written into `prompts/` at init time so
/// operators can edit them in place.
pub fn default_template(phase: Phase) -> &'static str {
    match phase {
        Phase::Research => RESEARCH_TEMPLATE,
        Phase::Plan => PLAN_TEMPLATE,
        Phase::Implement => IMPLEMENT_TEMPLATE,
        Phase::Pr => PR_TEMPLATE,
    }
}

const RESEARCH_TEMPLATE: &str = r#"# Research Agent

You are running autonomously inside the wreckit workflow.
No human is available for questions — use your judgment and record open
points in the "Open Questions" section of your artifact.

{{skill_context}}

## Item

- **ID:** {{id}}
- **Title:** {{title}}
- **Section:** {{section}}

## Overview

{{overview}}

## Task

Research this idea against the current codebase. Write your findings to
`{{item_path}}/research.md` with exactly these sections:

- `## Summary`
- `## Current State Analysis`
- `## Key Files` (cite concrete file paths)
- `## Technical Considerations`
- `## Risks and Mitigations`
- `## Recommended Approach`
- `## Open Questions`

When the artifact is written and complete, print `{{completion_signal}}`.
"#;

const PLAN_TEMPLATE: &str = r#"# Planning Agent

You are running autonomously inside the wreckit workflow.
No human is available for questions — make decisions and document them.

{{skill_context}}

## Item

- **ID:** {{id}}
- **Title:** {{title}}

## Research

{{research}}

## Task

Produce two artifacts in `{{item_path}}`:

1. `plan.md` with sections `## Overview`, `## Current State`,
   `## Desired End State`, `## What We're NOT Doing`,
   `## Implementation Approach`, and one or more `## Phase N` sections,
   each with a `### Success Criteria` list.
2. `prd.json` with the shape
   `{"stories": [{"id": "US-001", "title": "...",
   "acceptance_criteria": ["..."], "status": "pending"}]}`.
   Story ids must be unique; every story needs at least one testable
   acceptance criterion. Order stories by priority, most important first.

When both artifacts are written, print `{{completion_signal}}`.
"#;

const IMPLEMENT_TEMPLATE: &str = r#"# Implementation Agent

You are running autonomously inside the wreckit workflow on branch
`{{branch_name}}` (based on `{{base_branch}}`).

{{skill_context}}

## Item

- **ID:** {{id}}
- **Title:** {{title}}

## Plan

{{plan}}

## Stories

{{prd}}

## Progress so far

{{progress}}

## Task

Implement ONLY the story currently marked `in_progress` in prd.json.
Satisfy every acceptance criterion. When the story's work is complete,
update its status to `done` in `{{item_path}}/prd.json`, leave the working
tree ready to commit, and print `{{completion_signal}}`.
"#;

const PR_TEMPLATE: &str = r#"# Review Agent

You are running autonomously inside the wreckit workflow on branch
`{{branch_name}}`.

{{skill_context}}

## Item

- **ID:** {{id}}
- **Title:** {{title}}

## Plan

{{plan}}

## Task

Adversarially review the implementation on this branch against the plan.
Write your findings to `{{item_path}}/critique.md` (free-form markdown).
Fix anything that would block a merge. When the branch is ready for a pull
request, print `{{completion_signal}}`.
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&'static str, &str)]) -> BTreeMap<&'static str, String> {
        pairs.iter().map(|(k, v)| (*k, v.to_string())).collect()
    }

    #[test]
    fn render_substitutes_known_vars() {
        let out = render("Hello {{name}}!", &vars(&[("name", "world")])).unwrap();
        assert_eq!(out, "Hello world!");
    }

    #[test]
    fn render_unknown_var_becomes_empty() {
        let out = render("a{{missing}}b", &vars(&[])).unwrap();
        assert_eq!(out, "ab");
    }

    #[test]
    fn render_unterminated_brace_is_config_error() {
        let err = render("bad {{oops", &vars(&[])).unwrap_err();
        assert!(matches!(err, WreckitError::ConfigError(_)));
    }

    #[test]
    fn render_handles_whitespace_in_token() {
        let out = render("x{{ name }}y", &vars(&[("name", "-")])).unwrap();
        assert_eq!(out, "x-y");
    }

    #[test]
    fn default_templates_render_with_full_var_set() {
        let var_names = [
            "id",
            "title",
            "section",
            "overview",
            "item_path",
            "branch_name",
            "base_branch",
            "completion_signal",
            "research",
            "plan",
            "prd",
            "progress",
            "skill_context",
        ];
        let vars: BTreeMap<&str, String> = var_names
            .iter()
            .map(|n| (*n, format!("<{}>", n)))
            .collect();
        for phase in Phase::ALL {
            let rendered = render(default_template(phase), &vars).unwrap();
            assert!(rendered.contains("<completion_signal>"));
            assert!(!rendered.contains("{{"), "unrendered token in {}", phase);
        }
    }
}
