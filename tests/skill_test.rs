mod common;

use std::collections::BTreeSet;
use std::fs;
use std::sync::Mutex;

use wreckit::agent::{AgentOptions, AgentResult, AgentRunner};
use wreckit::error::Result;
use wreckit::item::{ItemState, Phase};
use wreckit::runner::run_phase;
use wreckit::skill::{self, ContextRequirement, Skill};
use wreckit::store::RESEARCH_MD;

use common::*;

fn skill_with_context(id: &str, tools: &[&str], context: Vec<ContextRequirement>) -> Skill {
    Skill {
        id: id.to_string(),
        name: id.to_string(),
        description: String::new(),
        tools: tools.iter().map(|t| t.to_string()).collect(),
        mcp_servers: Default::default(),
        required_context: context,
    }
}

#[test]
fn context_loads_all_four_requirement_kinds() {
    let mut repo = setup_repo();
    let item = make_item(&repo, "features", "Contextual", ItemState::Idea);
    repo.store
        .write_artifact(&item.id, RESEARCH_MD, "## Summary\n\nPrior findings.\n")
        .unwrap();
    fs::write(repo.dir.path().join("NOTES.md"), "project notes\n").unwrap();

    let skill = skill_with_context(
        "ctx",
        &["Read"],
        vec![
            ContextRequirement::File {
                path: "NOTES.md".into(),
            },
            ContextRequirement::GitStatus,
            ContextRequirement::ItemMetadata,
            ContextRequirement::PhaseArtifact {
                name: RESEARCH_MD.into(),
            },
        ],
    );
    repo.config.skills.insert("ctx".into(), skill);

    let context = skill::build_context(
        &repo.config,
        &["ctx".to_string()],
        &repo.store,
        &repo.git,
        &item,
    );

    assert!(context.errors.is_empty(), "errors: {:?}", context.errors);
    assert!(context.text.contains("project notes"));
    assert!(context.text.contains("Prior findings"));
    assert!(context.text.contains(&item.id)); // item metadata JSON
    assert!(context.text.contains("### Context (git status)"));
}

#[test]
fn missing_context_is_flagged_but_not_fatal() {
    let mut repo = setup_repo();
    let item = make_item(&repo, "features", "Gaps", ItemState::Idea);

    let skill = skill_with_context(
        "gaps",
        &["Read"],
        vec![
            ContextRequirement::File {
                path: "does-not-exist.md".into(),
            },
            ContextRequirement::PhaseArtifact {
                name: "plan.md".into(),
            },
        ],
    );
    repo.config.skills.insert("gaps".into(), skill);

    let context = skill::build_context(
        &repo.config,
        &["gaps".to_string()],
        &repo.store,
        &repo.git,
        &item,
    );

    assert_eq!(context.errors.len(), 2);
    // The assembled text tells the agent what is missing
    assert_eq!(context.text.matches("[unavailable:").count(), 2);
}

/// Runner that records the tool allowlist it was handed.
struct CapturingRunner {
    seen_tools: Mutex<Option<BTreeSet<String>>>,
}

impl AgentRunner for CapturingRunner {
    async fn run(&self, opts: AgentOptions<'_>) -> Result<AgentResult> {
        *self.seen_tools.lock().unwrap() = Some(opts.allowed_tools.clone());
        fs::write(opts.cwd.join(RESEARCH_MD), valid_research()).unwrap();
        Ok(AgentResult {
            success: true,
            output: opts.completion_signal.to_string(),
            timed_out: false,
            exit_code: Some(0),
            completion_detected: true,
        })
    }
}

#[tokio::test]
async fn skill_intersection_reaches_the_agent_narrowed() {
    let mut repo = setup_repo();
    let item = make_item(&repo, "features", "Narrowed", ItemState::Idea);

    // The skill asks for Read plus a tool outside the research allowlist;
    // the agent must only ever see the intersection.
    repo.config
        .skills
        .insert("narrow".into(), skill_with_context("narrow", &["Read", "Delete"], vec![]));
    repo.config
        .phase_skills
        .insert("research".into(), vec!["narrow".into()]);

    let runner = CapturingRunner {
        seen_tools: Mutex::new(None),
    };
    let ctx = repo.ctx(false);

    let outcome = run_phase(&ctx, &runner, &item.id, Phase::Research).await;
    assert!(outcome.error.is_none(), "failed: {:?}", outcome.error);

    let seen = runner.seen_tools.lock().unwrap().clone().unwrap();
    let expected: BTreeSet<String> = ["Read".to_string()].into_iter().collect();
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn phase_without_skills_gets_full_static_allowlist() {
    let repo = setup_repo();
    let item = make_item(&repo, "features", "Unrestricted", ItemState::Idea);

    let runner = CapturingRunner {
        seen_tools: Mutex::new(None),
    };
    let ctx = repo.ctx(false);

    let outcome = run_phase(&ctx, &runner, &item.id, Phase::Research).await;
    assert!(outcome.error.is_none());

    let seen = runner.seen_tools.lock().unwrap().clone().unwrap();
    assert_eq!(seen, skill::static_allowlist(Phase::Research));
}
