use crate::agent::AgentRunner;
use crate::error::{Result, WreckitError};
use crate::item::{next_phase_for, Item, ItemState};
use crate::runner::{run_phase, RunnerContext};
use crate::{log_info, log_warn};

/// Result of an orchestrator run, returned to the caller for summary display.
#[derive(Debug)]
pub struct RunSummary {
    pub phases_executed: u32,
    pub items_advanced: Vec<String>,
    pub items_blocked: Vec<String>,
    pub halt_reason: HaltReason,
}

#[derive(Debug, PartialEq, Eq)]
pub enum HaltReason {
    AllDoneOrBlocked,
    NoMatchingItems,
}

/// Select and order the items an orchestrator run will drive.
///
/// This is a pure function: no I/O, trivially testable.
///
/// Rules:
/// - Terminal-state items are dropped
/// - An explicit selector restricts to those ids, preserving selector order
/// - Otherwise: explicit priority first (higher wins), then (section, ordinal)
pub fn select_items(items: &[Item], selector: &[String]) -> Vec<Item> {
    if !selector.is_empty() {
        return selector
            .iter()
            .filter_map(|id| items.iter().find(|i| i.id == *id))
            .filter(|i| !i.state.is_terminal())
            .cloned()
            .collect();
    }

    let mut eligible: Vec<Item> = items
        .iter()
        .filter(|i| !i.state.is_terminal())
        .cloned()
        .collect();

    eligible.sort_by(|a, b| {
        priority_sort_value(b)
            .cmp(&priority_sort_value(a))
            .then_with(|| a.section.cmp(&b.section))
            .then_with(|| a.ordinal().cmp(&b.ordinal()))
    });

    eligible
}

fn priority_sort_value(item: &Item) -> i64 {
    item.priority.unwrap_or(i64::MIN)
}

/// Drive each selected item through phases until it reaches a terminal or
/// blocked state. Items are fully advanced one at a time, in selection
/// order; only one phase of one item executes at any moment.
pub async fn run(
    ctx: &RunnerContext<'_>,
    runner: &impl AgentRunner,
    selector: &[String],
) -> Result<RunSummary> {
    let items = ctx.store.list_items()?;
    let selected = select_items(&items, selector);

    if selected.is_empty() {
        log_info!("[run] No eligible items");
        return Ok(RunSummary {
            phases_executed: 0,
            items_advanced: Vec::new(),
            items_blocked: Vec::new(),
            halt_reason: HaltReason::NoMatchingItems,
        });
    }

    let mut summary = RunSummary {
        phases_executed: 0,
        items_advanced: Vec::new(),
        items_blocked: Vec::new(),
        halt_reason: HaltReason::AllDoneOrBlocked,
    };

    for item in selected {
        if ctx.cancel.is_cancelled() {
            return Err(WreckitError::Interrupted);
        }
        let advanced = advance_item(ctx, runner, &item.id, &mut summary).await?;
        if advanced {
            summary.items_advanced.push(item.id.clone());
        }
    }

    Ok(summary)
}

/// Advance a single item until it reaches a terminal or blocked state.
/// Returns true when at least one phase succeeded.
async fn advance_item(
    ctx: &RunnerContext<'_>,
    runner: &impl AgentRunner,
    item_id: &str,
    summary: &mut RunSummary,
) -> Result<bool> {
    let mut advanced = false;

    loop {
        if ctx.cancel.is_cancelled() {
            return Err(WreckitError::Interrupted);
        }

        let item = ctx.store.load_item(item_id)?;

        if item.state == ItemState::Merged {
            cleanup_merged(ctx, item_id)?;
            advanced = true;
            continue;
        }

        let phase = match next_phase_for(item.state) {
            Some(phase) => phase,
            None => {
                if item.state == ItemState::InPr {
                    log_info!("[{}] Waiting on external merge (PR #{:?})", item.id, item.pr_number);
                }
                break;
            }
        };

        log_info!("[{}] Running {} phase (state: {})", item.id, phase, item.state);
        let outcome = run_phase(ctx, runner, item_id, phase).await;
        summary.phases_executed += 1;

        if ctx.dry_run {
            // Dry-run reports success without advancing state; one pass
            // per item is enough.
            break;
        }

        match outcome.error {
            None => {
                advanced = true;
            }
            Some(WreckitError::Interrupted) => return Err(WreckitError::Interrupted),
            Some(error) => {
                log_warn!("[{}] {} ({})", item_id, error, error.hint());
                summary.items_blocked.push(item_id.to_string());
                break;
            }
        }
    }

    Ok(advanced)
}

/// Advance only the single highest-priority eligible item by one phase.
pub async fn run_next(
    ctx: &RunnerContext<'_>,
    runner: &impl AgentRunner,
) -> Result<Option<crate::runner::PhaseOutcome>> {
    let items = ctx.store.list_items()?;
    let selected = select_items(&items, &[]);

    for item in selected {
        if item.state == ItemState::Merged {
            let cleaned = cleanup_merged(ctx, &item.id)?;
            return Ok(Some(crate::runner::PhaseOutcome {
                success: true,
                item: cleaned,
                error: None,
            }));
        }
        if let Some(phase) = next_phase_for(item.state) {
            log_info!("[{}] Running {} phase (state: {})", item.id, phase, item.state);
            return Ok(Some(run_phase(ctx, runner, &item.id, phase).await));
        }
    }

    Ok(None)
}

/// Post-merge cleanup: return to the base branch, drop the local work
/// branch, and mark the item done.
fn cleanup_merged(ctx: &RunnerContext<'_>, item_id: &str) -> Result<Item> {
    let _lock = ctx.store.acquire_item_lock(item_id)?;
    let mut item = ctx.store.load_item(item_id)?;

    if ctx.dry_run {
        log_info!("[dry-run][{}] would clean up merged branch and mark done", item_id);
        return Ok(item);
    }

    if let Some(branch) = &item.branch_name {
        if ctx.git.branch_exists(branch) {
            if let Err(e) = ctx.git.checkout(&ctx.config.base_branch) {
                log_warn!("[{}] Could not return to base branch: {}", item_id, e);
            }
            if let Err(e) = ctx.git.delete_branch(branch) {
                log_warn!("[{}] Could not delete merged branch {}: {}", item_id, branch, e);
            }
        }
    }

    item.transition(ItemState::Done)?;
    ctx.store.save_item(&item)?;
    log_info!("[{}] Post-merge cleanup complete -> done", item_id);
    Ok(item)
}
