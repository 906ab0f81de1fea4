mod common;

use std::process::Command;

use wreckit::agent::{MockRunner, MockStep};
use wreckit::item::ItemState;
use wreckit::orchestrator::{self, HaltReason};
use wreckit::store::{PLAN_MD, PRD_JSON, RESEARCH_MD};

use common::*;

fn full_pipeline_steps() -> Vec<MockStep> {
    let stories = ["US-001"];
    vec![
        MockStep {
            files: vec![(RESEARCH_MD.into(), valid_research())],
            lines: vec![],
            complete: true,
        },
        MockStep {
            files: vec![
                (PLAN_MD.into(), valid_plan()),
                (PRD_JSON.into(), prd_json(&stories)),
            ],
            lines: vec![],
            complete: true,
        },
        MockStep {
            files: vec![(PRD_JSON.into(), prd_json_with_done(&stories, &stories))],
            lines: vec![],
            complete: true,
        },
        // pr phase: the agent succeeds but the push fails (no remote)
        MockStep {
            files: vec![],
            lines: vec![],
            complete: true,
        },
    ]
}

#[tokio::test]
async fn run_advances_item_until_blocked_at_pr() {
    let repo = setup_repo();
    let item = make_item(&repo, "features", "Driven", ItemState::Idea);

    let runner = MockRunner::new(full_pipeline_steps(), &repo.config.completion_signal);
    let ctx = repo.ctx(false);

    let summary = orchestrator::run(&ctx, &runner, &[item.id.clone()])
        .await
        .unwrap();

    // research, plan, implement succeed; pr fails at push
    assert_eq!(summary.phases_executed, 4);
    assert_eq!(summary.items_advanced, vec![item.id.clone()]);
    assert_eq!(summary.items_blocked, vec![item.id.clone()]);
    assert_eq!(summary.halt_reason, HaltReason::AllDoneOrBlocked);

    assert_eq!(
        repo.store.load_item(&item.id).unwrap().state,
        ItemState::Critique
    );
}

#[tokio::test]
async fn run_with_empty_repository_reports_no_matches() {
    let repo = setup_repo();
    let runner = MockRunner::new(vec![], &repo.config.completion_signal);
    let ctx = repo.ctx(false);

    let summary = orchestrator::run(&ctx, &runner, &[]).await.unwrap();
    assert_eq!(summary.phases_executed, 0);
    assert_eq!(summary.halt_reason, HaltReason::NoMatchingItems);
}

#[tokio::test]
async fn run_next_advances_exactly_one_phase() {
    let repo = setup_repo();
    let item = make_item(&repo, "features", "Step by step", ItemState::Idea);

    let runner = MockRunner::new(
        vec![MockStep {
            files: vec![(RESEARCH_MD.into(), valid_research())],
            lines: vec![],
            complete: true,
        }],
        &repo.config.completion_signal,
    );
    let ctx = repo.ctx(false);

    let outcome = orchestrator::run_next(&ctx, &runner).await.unwrap().unwrap();
    assert!(outcome.error.is_none());
    assert_eq!(outcome.item.state, ItemState::Researched);

    // One phase only: the item did not keep going into planning
    assert_eq!(
        repo.store.load_item(&item.id).unwrap().state,
        ItemState::Researched
    );
}

#[tokio::test]
async fn merged_item_gets_post_merge_cleanup() {
    let repo = setup_repo();
    let item = make_item(&repo, "features", "Shipped", ItemState::Idea);
    let branch = repo.config.branch_for(&item.id);

    Command::new("git")
        .args(["branch", &branch])
        .current_dir(repo.dir.path())
        .output()
        .unwrap();

    let mut merged = repo.store.load_item(&item.id).unwrap();
    merged.state = ItemState::Merged;
    merged.branch_name = Some(branch.clone());
    merged.pr_number = Some(7);
    repo.store.save_item(&merged).unwrap();

    let runner = MockRunner::new(vec![], &repo.config.completion_signal);
    let ctx = repo.ctx(false);

    let summary = orchestrator::run(&ctx, &runner, &[item.id.clone()])
        .await
        .unwrap();
    assert_eq!(summary.items_advanced, vec![item.id.clone()]);

    let done = repo.store.load_item(&item.id).unwrap();
    assert_eq!(done.state, ItemState::Done);
    assert!(!repo.git.branch_exists(&branch));
}

#[tokio::test]
async fn dry_run_executes_once_per_item_without_advancing() {
    let repo = setup_repo();
    let item = make_item(&repo, "features", "Pretend", ItemState::Idea);

    let runner = MockRunner::new(vec![], &repo.config.completion_signal);
    let ctx = repo.ctx(true);

    let summary = orchestrator::run(&ctx, &runner, &[]).await.unwrap();
    assert_eq!(summary.phases_executed, 1);
    assert_eq!(
        repo.store.load_item(&item.id).unwrap().state,
        ItemState::Idea
    );

    // Deterministic: a second dry run behaves identically
    let summary2 = orchestrator::run(&ctx, &runner, &[]).await.unwrap();
    assert_eq!(summary2.phases_executed, 1);
}

#[tokio::test]
async fn in_pr_item_waits_for_external_merge() {
    let repo = setup_repo();
    let item = make_item(&repo, "features", "Waiting", ItemState::Idea);

    let mut in_pr = repo.store.load_item(&item.id).unwrap();
    in_pr.state = ItemState::InPr;
    in_pr.pr_number = Some(3);
    in_pr.branch_name = Some(repo.config.branch_for(&item.id));
    repo.store.save_item(&in_pr).unwrap();

    let runner = MockRunner::new(vec![], &repo.config.completion_signal);
    let ctx = repo.ctx(false);

    let summary = orchestrator::run(&ctx, &runner, &[]).await.unwrap();
    assert_eq!(summary.phases_executed, 0);
    assert_eq!(
        repo.store.load_item(&item.id).unwrap().state,
        ItemState::InPr
    );
}
