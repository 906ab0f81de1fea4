#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::process::Command;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use wreckit::config::Config;
use wreckit::git::Git;
use wreckit::item::{Item, ItemState};
use wreckit::runner::RunnerContext;
use wreckit::store::Store;

/// A temporary project: git repository + initialized wreckit store.
///
/// Holds everything a `RunnerContext` borrows so tests can build one with
/// `repo.ctx(dry_run)`.
pub struct TestRepo {
    pub dir: TempDir,
    pub store: Store,
    pub config: Config,
    pub git: Git,
    pub cancel: CancellationToken,
}

impl TestRepo {
    pub fn ctx(&self, dry_run: bool) -> RunnerContext<'_> {
        RunnerContext {
            store: &self.store,
            config: &self.config,
            git: &self.git,
            cancel: &self.cancel,
            dry_run,
            event_sink: None,
        }
    }
}

fn run_git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("run git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Create a git repository with an initial commit and an initialized
/// wreckit store inside it.
pub fn setup_repo() -> TestRepo {
    let dir = TempDir::new().expect("create tempdir");
    run_git(dir.path(), &["init", "-b", "main"]);
    run_git(dir.path(), &["config", "user.email", "test@example.com"]);
    run_git(dir.path(), &["config", "user.name", "Test"]);
    fs::write(dir.path().join("README.md"), "test project\n").unwrap();
    run_git(dir.path(), &["add", "."]);
    run_git(dir.path(), &["commit", "-m", "initial commit"]);

    let config = Config::default();
    let store = Store::init(dir.path(), &config).expect("init store");

    // The store itself is part of the working tree; keep it committed so
    // phase commits only pick up item changes.
    run_git(dir.path(), &["add", "."]);
    run_git(dir.path(), &["commit", "-m", "init wreckit"]);

    let git = Git::new(dir.path());
    TestRepo {
        dir,
        store,
        config,
        git,
        cancel: CancellationToken::new(),
    }
}

/// Allocate and persist an item in the given state.
pub fn make_item(repo: &TestRepo, section: &str, title: &str, state: ItemState) -> Item {
    let id = repo.store.allocate_id(section, title).unwrap();
    let mut item = Item::new(&id, title, "overview", section);
    item.state = state;
    repo.store.save_item(&item).unwrap();
    item
}

/// A research.md that satisfies the research validator.
pub fn valid_research() -> String {
    let sections = [
        ("Summary", "The idea is feasible."),
        ("Current State Analysis", "The codebase has no such feature."),
        ("Key Files", "- `src/main.rs` is the entry point"),
        ("Technical Considerations", "Needs a config flag."),
        ("Risks and Mitigations", "Low risk; covered by tests."),
        ("Recommended Approach", "Add a module and wire it up."),
        ("Open Questions", "None."),
    ];
    sections
        .iter()
        .map(|(title, body)| format!("## {}\n\n{}\n", title, body))
        .collect::<Vec<_>>()
        .join("\n")
}

/// A plan.md that satisfies the plan validator.
pub fn valid_plan() -> String {
    let mut doc = String::new();
    for section in [
        "Overview",
        "Current State",
        "Desired End State",
        "What We're NOT Doing",
        "Implementation Approach",
    ] {
        doc.push_str(&format!("## {}\n\nContent.\n\n", section));
    }
    doc.push_str("## Phase 1: Build\n\n### Success Criteria\n\n- [ ] it works\n");
    doc
}

/// A prd.json body with the given story ids, all pending.
pub fn prd_json(story_ids: &[&str]) -> String {
    let stories: Vec<String> = story_ids
        .iter()
        .map(|id| {
            format!(
                r#"{{"id": "{}", "title": "Story {}", "acceptance_criteria": ["criterion"], "status": "pending"}}"#,
                id, id
            )
        })
        .collect();
    format!(r#"{{"stories": [{}]}}"#, stories.join(", "))
}

/// prd.json with the listed stories done and the rest pending.
pub fn prd_json_with_done(story_ids: &[&str], done: &[&str]) -> String {
    let stories: Vec<String> = story_ids
        .iter()
        .map(|id| {
            let status = if done.contains(id) { "done" } else { "pending" };
            format!(
                r#"{{"id": "{}", "title": "Story {}", "acceptance_criteria": ["criterion"], "status": "{}"}}"#,
                id, id, status
            )
        })
        .collect();
    format!(r#"{{"stories": [{}]}}"#, stories.join(", "))
}

/// Stage and commit everything in the working tree.
pub fn commit_all(repo: &TestRepo, message: &str) {
    run_git(repo.dir.path(), &["add", "."]);
    let output = Command::new("git")
        .args(["commit", "-m", message])
        .current_dir(repo.dir.path())
        .output()
        .expect("run git commit");
    // An empty tree is fine; "nothing to commit" is not a failure here
    let _ = output;
}

/// Count commits on a branch that are not on main.
pub fn commits_ahead_of_main(repo: &TestRepo, branch: &str) -> usize {
    let output = Command::new("git")
        .args(["rev-list", "--count", &format!("main..{}", branch)])
        .current_dir(repo.dir.path())
        .output()
        .expect("run git rev-list");
    String::from_utf8_lossy(&output.stdout)
        .trim()
        .parse()
        .unwrap_or(0)
}
