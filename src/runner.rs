use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentEvent, AgentOptions, AgentResult, AgentRunner, EventSink};
use crate::config::Config;
use crate::error::{Result, WreckitError};
use crate::git::Git;
use crate::item::{Item, ItemState, Phase, Prd, StoryStatus};
use crate::prompt;
use crate::skill;
use crate::store::{self, Store};
use crate::validate;
use crate::{log_debug, log_info, log_warn};

/// Outcome of running one phase for one item. The phase runner is the only
/// place a typed error becomes a result value instead of propagating.
#[derive(Debug)]
pub struct PhaseOutcome {
    pub success: bool,
    pub item: Item,
    pub error: Option<WreckitError>,
}

impl PhaseOutcome {
    fn ok(item: Item) -> Self {
        PhaseOutcome {
            success: true,
            item,
            error: None,
        }
    }

    fn failed(item: Item, error: WreckitError) -> Self {
        PhaseOutcome {
            success: false,
            item,
            error: Some(error),
        }
    }
}

/// Shared dependencies threaded through the phase runner. No global state:
/// the config handle is immutable and injected.
pub struct RunnerContext<'a> {
    pub store: &'a Store,
    pub config: &'a Config,
    pub git: &'a Git,
    pub cancel: &'a CancellationToken,
    pub dry_run: bool,
    pub event_sink: Option<EventSink>,
}

/// Execute exactly one phase for one item, from prompt assembly through
/// state update.
///
/// Lock protocol: the item lock is held for the pre-phase read/transition
/// and the post-phase update, and released across the agent invocation so a
/// slow agent cannot starve readers. Re-acquisition re-validates that the
/// item did not change underneath us.
pub async fn run_phase(
    ctx: &RunnerContext<'_>,
    runner: &impl AgentRunner,
    item_id: &str,
    phase: Phase,
) -> PhaseOutcome {
    // Pre-phase: validate and enter the in-flight state under the lock.
    let entered = match enter_phase(ctx, item_id, phase) {
        Ok(entered) => entered,
        Err(e) => {
            let item = ctx.store.load_item(item_id).ok();
            return PhaseOutcome {
                success: false,
                item: item.unwrap_or_else(|| Item::new(item_id, "", "", "unknown")),
                error: Some(e),
            };
        }
    };

    if ctx.dry_run {
        return dry_run_outcome(ctx, entered.item, phase);
    }

    let result = match phase {
        Phase::Implement => run_implement(ctx, runner, &entered).await,
        _ => run_simple_phase(ctx, runner, &entered, phase).await,
    };

    match result {
        Ok(item) => PhaseOutcome::ok(item),
        Err(error) => {
            let item = fail_phase(ctx, item_id, phase, &error);
            PhaseOutcome::failed(item, error)
        }
    }
}

/// Snapshot taken while entering a phase, used to detect concurrent
/// modification when the lock is re-acquired after the agent run.
struct EnteredPhase {
    item: Item,
    persisted_at: DateTime<Utc>,
}

fn enter_phase(ctx: &RunnerContext<'_>, item_id: &str, phase: Phase) -> Result<EnteredPhase> {
    let _lock = ctx.store.acquire_item_lock(item_id)?;
    let mut item = ctx.store.load_item(item_id)?;

    if !phase.accepts_state(item.state) {
        return Err(WreckitError::InvalidTransition {
            from: item.state,
            to: phase.active_state(),
        });
    }

    if phase == Phase::Implement && !ctx.store.artifact_exists(item_id, store::PRD_JSON) {
        return Err(WreckitError::PhaseValidation(format!(
            "Cannot implement {}: prd.json is missing",
            item_id
        )));
    }

    if ctx.dry_run {
        return Ok(EnteredPhase {
            persisted_at: item.updated_at,
            item,
        });
    }

    if item.state != phase.active_state() {
        item.transition(phase.active_state())?;
        ctx.store.save_item(&item)?;
    }

    Ok(EnteredPhase {
        persisted_at: item.updated_at,
        item,
    })
}

/// Re-acquire the item lock after the agent ran and verify nothing else
/// advanced the item in the meantime.
fn reload_checked(ctx: &RunnerContext<'_>, entered: &EnteredPhase, phase: Phase) -> Result<Item> {
    let item = ctx.store.load_item(&entered.item.id)?;
    if item.state != phase.active_state() || item.updated_at != entered.persisted_at {
        return Err(WreckitError::ConcurrentModification {
            item: entered.item.id.clone(),
            detail: format!(
                "expected state {} from this run, found {}",
                phase.active_state(),
                item.state
            ),
        });
    }
    Ok(item)
}

/// Handle a failed phase so the item record is never advanced.
///
/// An ordinary failure (quality defect, timeout, missing artifact) leaves
/// the item in the phase's in-flight state, ready for a retry of the same
/// phase. Cancellation rolls all the way back to the pre-phase state:
/// research returns to idea, plan to researched; implement and pr have no
/// earlier state to return to once entered.
fn fail_phase(
    ctx: &RunnerContext<'_>,
    item_id: &str,
    phase: Phase,
    error: &WreckitError,
) -> Item {
    log_warn!("[{}][{}] Phase failed: {}", item_id, phase, error);

    let cancelled = matches!(error, WreckitError::Interrupted);

    let settle = || -> Result<Item> {
        let _lock = ctx.store.acquire_item_lock(item_id)?;
        let mut item = ctx.store.load_item(item_id)?;
        let target = phase.failure_state();
        if cancelled && item.state == phase.active_state() && item.state != target {
            item.transition(target)?;
            ctx.store.save_item(&item)?;
        }
        Ok(item)
    };

    match settle() {
        Ok(item) => item,
        Err(e) => {
            log_warn!("[{}] Failed to settle item after phase failure: {}", item_id, e);
            ctx.store
                .load_item(item_id)
                .unwrap_or_else(|_| Item::new(item_id, "", "", "unknown"))
        }
    }
}

// --- Research / plan / pr phases ---

async fn run_simple_phase(
    ctx: &RunnerContext<'_>,
    runner: &impl AgentRunner,
    entered: &EnteredPhase,
    phase: Phase,
) -> Result<Item> {
    let item = &entered.item;

    invoke_agent(ctx, runner, item, phase).await?;

    // Post-phase: validate artifacts, then advance under the lock.
    let _lock = ctx.store.acquire_item_lock(&item.id)?;
    let mut item = reload_checked(ctx, entered, phase)?;

    validate_phase_artifacts(ctx, &item, phase)?;

    if phase == Phase::Pr {
        finish_pr(ctx, &mut item)?;
    }

    item.transition(phase.success_state())?;
    ctx.store.save_item(&item)?;
    log_info!("[{}][{}] Phase complete -> {}", item.id, phase, item.state);
    Ok(item)
}

/// Branch push and PR creation for the pr phase. The critique artifact is
/// opaque markdown and optional; the branch and PR number are not.
fn finish_pr(ctx: &RunnerContext<'_>, item: &mut Item) -> Result<()> {
    let branch = item
        .branch_name
        .clone()
        .unwrap_or_else(|| ctx.config.branch_for(&item.id));

    if !ctx.git.branch_exists(&branch) {
        return Err(WreckitError::BranchError(format!(
            "Branch {} does not exist; run the implement phase first",
            branch
        )));
    }
    ctx.git.checkout(&branch)?;

    // Commit any fixes the review agent left in the tree
    commit_dirty_tree(ctx, &item.id, "review fixes")?;

    ctx.git.push(&branch)?;
    let pr_number = ctx.git.create_pull_request(
        &branch,
        &ctx.config.base_branch,
        &item.title,
        &item.overview,
    )?;

    item.branch_name = Some(branch);
    item.pr_number = Some(pr_number);
    Ok(())
}

// --- Implement phase ---

/// Story-by-story implementation loop.
///
/// Selects the first pending story in PRD order, marks it in_progress,
/// invokes the agent, accepts or rejects the result, commits, and moves on.
/// The iteration cap bounds total agent invocations; a story that keeps
/// failing is left in_progress for the next run (or the doctor).
async fn run_implement(
    ctx: &RunnerContext<'_>,
    runner: &impl AgentRunner,
    entered: &EnteredPhase,
) -> Result<Item> {
    let item_id = entered.item.id.clone();
    let branch = ctx.config.branch_for(&item_id);

    ensure_branch(ctx, &branch)?;

    {
        let _lock = ctx.store.acquire_item_lock(&item_id)?;
        let mut item = ctx.store.load_item(&item_id)?;
        if item.branch_name.as_deref() != Some(branch.as_str()) {
            item.branch_name = Some(branch.clone());
            ctx.store.save_item(&item)?;
        }
    }

    let mut iterations: u32 = 0;
    let mut story_attempts: u32 = 0;

    loop {
        if ctx.cancel.is_cancelled() {
            return Err(WreckitError::Interrupted);
        }

        // Select the next story and mark it in_progress under the lock.
        let story_id = {
            let _lock = ctx.store.acquire_item_lock(&item_id)?;
            let mut prd = ctx.store.load_prd(&item_id)?;

            // A story left in_progress by a crash or failure is resumed
            // before any new story starts.
            let resumed = prd
                .stories
                .iter()
                .find(|s| s.status == StoryStatus::InProgress)
                .map(|s| s.id.clone());

            let story_id = match resumed.or_else(|| prd.next_pending().map(|s| s.id.clone())) {
                Some(id) => id,
                None => break, // all stories done
            };

            if iterations >= ctx.config.max_iterations {
                return Err(WreckitError::PhaseValidation(format!(
                    "Iteration cap ({}) reached with story {} still open",
                    ctx.config.max_iterations, story_id
                )));
            }

            prd.set_status(&story_id, StoryStatus::InProgress)?;
            ctx.store.save_prd(&item_id, &prd)?;

            let mut item = ctx.store.load_item(&item_id)?;
            if item.current_story_id.as_deref() != Some(story_id.as_str()) {
                story_attempts = 0;
                item.current_story_id = Some(story_id.clone());
                ctx.store.save_item(&item)?;
            }
            story_id
        };

        iterations += 1;
        story_attempts += 1;

        log_info!(
            "[{}][implement] Story {} (iteration {}/{})",
            item_id,
            story_id,
            iterations,
            ctx.config.max_iterations
        );

        let item = ctx.store.load_item(&item_id)?;
        invoke_agent(ctx, runner, &item, Phase::Implement).await?;

        // Accept or reject the story the agent just reported on.
        let accepted = {
            let _lock = ctx.store.acquire_item_lock(&item_id)?;
            let prd = ctx.store.load_prd(&item_id)?;
            let story = prd.find(&story_id).ok_or_else(|| {
                WreckitError::StoryQuality {
                    defects: vec![format!("story '{}' disappeared from prd.json", story_id)],
                }
            })?;
            let validation = validate::validate_completed_story(story);
            if validation.valid() {
                commit_story(ctx, &item_id, &story_id)?;
                let mut item = ctx.store.load_item(&item_id)?;
                item.current_story_id = None;
                ctx.store.save_item(&item)?;
                true
            } else {
                log_warn!(
                    "[{}][implement] Story {} rejected: {}",
                    item_id,
                    story_id,
                    validation.defects.join("; ")
                );
                // Put the story back to in_progress in case the agent
                // flipped it without earning it
                let mut prd = prd;
                prd.set_status(&story_id, StoryStatus::InProgress)?;
                ctx.store.save_prd(&item_id, &prd)?;
                false
            }
        };

        if !accepted {
            let attempts_allowed = ctx.config.story_retry_limit + 1;
            if story_attempts >= attempts_allowed {
                let prd = ctx.store.load_prd(&item_id)?;
                let story = prd.find(&story_id);
                return Err(WreckitError::StoryQuality {
                    defects: story
                        .map(|s| validate::validate_completed_story(s).defects)
                        .unwrap_or_default(),
                });
            }
            log_info!(
                "[{}][implement] Retrying story {} (attempt {}/{})",
                item_id,
                story_id,
                story_attempts + 1,
                attempts_allowed
            );
        }
    }

    // All stories done: leave a clean tree, then advance to critique.
    let _lock = ctx.store.acquire_item_lock(&item_id)?;
    let mut item = ctx.store.load_item(&item_id)?;

    commit_dirty_tree(ctx, &item_id, "story cleanup")?;

    let prd = ctx.store.load_prd(&item_id)?;
    if !prd.all_done() {
        return Err(WreckitError::PhaseValidation(format!(
            "Implement finished but PRD for {} still has open stories",
            item_id
        )));
    }

    item.current_story_id = None;
    item.transition(ItemState::Critique)?;
    ctx.store.save_item(&item)?;
    log_info!("[{}][implement] All stories done -> critique", item_id);
    Ok(item)
}

fn ensure_branch(ctx: &RunnerContext<'_>, branch: &str) -> Result<()> {
    if ctx.git.branch_exists(branch) {
        ctx.git.checkout(branch)?;
    } else {
        ctx.git.create_branch(branch, &ctx.config.base_branch)?;
    }
    Ok(())
}

/// Commit everything a story run touched, prefixed for traceability.
fn commit_story(ctx: &RunnerContext<'_>, item_id: &str, story_id: &str) -> Result<()> {
    let status = ctx.git.status()?;
    if status.is_empty() {
        log_warn!(
            "[{}][implement] Story {} produced no changes to commit",
            item_id,
            story_id
        );
        return Ok(());
    }
    let paths: Vec<&str> = status.iter().map(|e| e.path.as_str()).collect();
    ctx.git.stage_paths(&paths)?;
    ctx.git
        .commit(&format!("[{}][{}] Story complete", item_id, story_id))?;
    Ok(())
}

/// Leftover working-tree changes between stories are committed before the
/// next story begins.
fn commit_dirty_tree(ctx: &RunnerContext<'_>, item_id: &str, label: &str) -> Result<()> {
    let status = ctx.git.status()?;
    if status.is_empty() {
        return Ok(());
    }
    let paths: Vec<&str> = status.iter().map(|e| e.path.as_str()).collect();
    ctx.git.stage_paths(&paths)?;
    ctx.git.commit(&format!("[{}] {}", item_id, label))?;
    Ok(())
}

// --- Agent invocation ---

/// The middle of the phase pipeline: skill resolution, permission
/// computation, JIT context, prompt assembly, dispatch, and completion
/// detection. The item lock is NOT held here.
async fn invoke_agent(
    ctx: &RunnerContext<'_>,
    runner: &impl AgentRunner,
    item: &Item,
    phase: Phase,
) -> Result<AgentResult> {
    let resolution = skill::resolve_for_phase(phase, ctx.config)?;
    for problem in &resolution.errors {
        log_warn!("[{}][{}] Skill resolution: {}", item.id, phase, problem);
    }

    let context = skill::build_context(ctx.config, &resolution.loaded_ids, ctx.store, ctx.git, item);
    for problem in &context.errors {
        log_warn!("[{}][{}] Context: {}", item.id, phase, problem);
    }

    let prompt = prompt::assemble(ctx.store, ctx.config, item, phase, &context.text)?;

    let (sink, consumer) = spawn_event_consumer(
        ctx.store.artifact_path(&item.id, store::PROGRESS_LOG),
        ctx.event_sink.clone(),
    );

    log_debug!(
        "[{}][{}] Dispatching to {} backend ({} tools allowed)",
        item.id,
        phase,
        ctx.config.agent.kind(),
        resolution.tools.len()
    );

    let item_dir = ctx.store.item_dir(&item.id);
    let result = runner
        .run(AgentOptions {
            cwd: &item_dir,
            prompt: &prompt,
            allowed_tools: &resolution.tools,
            mcp_endpoints: &resolution.mcp_servers,
            timeout: ctx.config.phase_timeout(),
            event_sink: Some(&sink),
            cancel: ctx.cancel,
            completion_signal: &ctx.config.completion_signal,
        })
        .await;

    drop(sink);
    let _ = consumer.await;

    let result = result?;

    if result.timed_out {
        return Err(WreckitError::Timeout(ctx.config.phase_timeout()));
    }
    if !result.completion_detected && !result.success {
        return Err(WreckitError::InvalidState(format!(
            "Agent exited (code {:?}) without the completion signal",
            result.exit_code
        )));
    }

    Ok(result)
}

/// Drain agent events into progress.log (sanitized lines) and forward them
/// to the UI sink when one is subscribed.
fn spawn_event_consumer(
    progress_path: PathBuf,
    forward: Option<EventSink>,
) -> (EventSink, tokio::task::JoinHandle<()>) {
    let (sink, mut rx) = EventSink::channel();
    let handle = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let line = match &event {
                AgentEvent::AssistantText(text) => text.clone(),
                AgentEvent::ToolStarted { id, name, input } => {
                    format!("[tool:{}] {} {}", id, name, input)
                }
                AgentEvent::ToolResult { id, result } => format!("[tool:{}] -> {}", id, result),
                AgentEvent::ToolError { id, error } => format!("[tool:{}] !! {}", id, error),
                AgentEvent::RunResult { exit_code } => format!("[run] exit={:?}", exit_code),
                AgentEvent::Error(msg) => format!("[error] {}", msg),
            };
            append_progress_line(&progress_path, &line);
            if let Some(forward) = &forward {
                forward.emit(event).await;
            }
        }
    });
    (sink, handle)
}

fn append_progress_line(path: &PathBuf, line: &str) {
    let sanitized = line.replace(['\r', '\n'], " ");
    let result = OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .and_then(|mut f| writeln!(f, "{}", sanitized));
    if let Err(e) = result {
        log_warn!("Warning: Failed to append progress to {}: {}", path.display(), e);
    }
}

// --- Validation per phase ---

fn validate_phase_artifacts(ctx: &RunnerContext<'_>, item: &Item, phase: Phase) -> Result<()> {
    match phase {
        Phase::Research => {
            let content = require_artifact(ctx, item, store::RESEARCH_MD)?;
            let validation = validate::validate_research(&content);
            if !validation.valid() {
                return Err(WreckitError::ResearchQuality {
                    defects: validation.defects,
                });
            }
        }
        Phase::Plan => {
            let plan = require_artifact(ctx, item, store::PLAN_MD)?;
            require_artifact(ctx, item, store::PRD_JSON)?;

            let validation = validate::validate_plan(&plan);
            if !validation.valid() {
                return Err(WreckitError::PlanQuality {
                    defects: validation.defects,
                });
            }

            let prd: Prd = ctx.store.load_prd(&item.id)?;
            let validation = validate::validate_prd(&prd);
            if !validation.valid() {
                return Err(WreckitError::StoryQuality {
                    defects: validation.defects,
                });
            }
        }
        Phase::Implement => {
            // Story acceptance happens inside the loop
        }
        Phase::Pr => {
            // critique.md is opaque and optional
        }
    }
    Ok(())
}

fn require_artifact(ctx: &RunnerContext<'_>, item: &Item, name: &str) -> Result<String> {
    if !ctx.store.artifact_exists(&item.id, name) {
        return Err(WreckitError::ArtifactNotCreated {
            item: item.id.clone(),
            artifact: name.to_string(),
        });
    }
    ctx.store.read_artifact(&item.id, name)
}

// --- Dry run ---

/// Replace every side effect with a deterministic log line. The agent is
/// not invoked; the item is not advanced. Two dry runs of the same phase
/// produce identical output.
fn dry_run_outcome(ctx: &RunnerContext<'_>, item: Item, phase: Phase) -> PhaseOutcome {
    log_info!("[dry-run][{}][{}] would resolve skills and compute tool allowlist", item.id, phase);
    log_info!(
        "[dry-run][{}][{}] would dispatch {} agent in {}",
        item.id,
        phase,
        ctx.config.agent.kind(),
        ctx.store.item_dir(&item.id).display()
    );
    match phase {
        Phase::Research => {
            log_info!("[dry-run][{}][{}] would validate research.md", item.id, phase)
        }
        Phase::Plan => {
            log_info!("[dry-run][{}][{}] would validate plan.md and prd.json", item.id, phase)
        }
        Phase::Implement => log_info!(
            "[dry-run][{}][{}] would iterate stories on branch {}",
            item.id,
            phase,
            ctx.config.branch_for(&item.id)
        ),
        Phase::Pr => log_info!(
            "[dry-run][{}][{}] would push {} and open a pull request",
            item.id,
            phase,
            ctx.config.branch_for(&item.id)
        ),
    }
    log_info!(
        "[dry-run][{}][{}] would transition {} -> {}",
        item.id,
        phase,
        item.state,
        phase.success_state()
    );
    PhaseOutcome::ok(item)
}
