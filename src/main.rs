use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use wreckit::agent::{
    install_signal_handlers, is_shutdown_requested, kill_all_children, SubprocessRunner,
};
use wreckit::config::{self, Config};
use wreckit::doctor::{self, FixOptions, Severity};
use wreckit::error::{Result, WreckitError};
use wreckit::git::Git;
use wreckit::item::{parse_phase, Item, ItemState};
use wreckit::log::level_from_flags;
use wreckit::orchestrator;
use wreckit::runner::{run_phase, RunnerContext};
use wreckit::store::{Store, STORE_DIR};
use wreckit::{log_error, log_info, log_warn};

#[derive(Parser)]
#[command(name = "wreckit", about = "Autonomous engineering orchestrator")]
struct Cli {
    /// Project root directory (defaults to current directory)
    #[arg(long, default_value = ".", global = true)]
    cwd: PathBuf,

    /// Describe every side effect instead of performing it
    #[arg(long, global = true)]
    dry_run: bool,

    /// Debug-level output
    #[arg(long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Errors only
    #[arg(long, global = true)]
    quiet: bool,

    /// Plain log output (the only rendering mode in this build)
    #[arg(long, global = true)]
    no_tui: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the .wreckit repository
    Init,
    /// Show all items and their states
    Status,
    /// List idea-state items, or capture a new one
    Ideas {
        #[command(subcommand)]
        action: Option<IdeasAction>,
    },
    /// Drive items through phases until terminal or blocked
    Run {
        /// Restrict to one item id
        id: Option<String>,
    },
    /// Advance the single highest-priority eligible item by one phase
    Next,
    /// Run one named phase for one item
    Phase {
        /// Phase name: research, plan, implement, or pr
        name: String,
        /// Item id (e.g. features/001-dark-mode)
        id: String,
    },
    /// Diagnose repository invariants, optionally repairing them
    Doctor {
        /// Apply idempotent fixes for what diagnosis finds
        #[arg(long)]
        fix: bool,
        /// Allow deletion of orphan branches (destructive)
        #[arg(long)]
        delete_orphan_branches: bool,
    },
}

#[derive(Subcommand)]
enum IdeasAction {
    /// Capture a new idea
    Add {
        /// Idea title
        title: String,
        /// Classification bucket (features, bugs, infra, ...)
        #[arg(long, default_value = "features")]
        section: String,
        /// Free-form overview text
        #[arg(long, default_value = "")]
        overview: String,
    },
    /// List idea-state items
    List,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    wreckit::log::set_log_level(level_from_flags(cli.verbose, cli.quiet));

    let result = dispatch(&cli).await;

    if let Err(e) = result {
        log_error!("Error: {}", e);
        log_error!("  hint: {}", e.hint());
        kill_all_children();
        std::process::exit(e.exit_code());
    }
}

async fn dispatch(cli: &Cli) -> Result<()> {
    let root = cli.cwd.as_path();

    match &cli.command {
        Commands::Init => handle_init(root),
        Commands::Status => handle_status(root),
        Commands::Ideas { action } => handle_ideas(root, action),
        Commands::Run { id } => handle_run(cli, root, id.as_deref()).await,
        Commands::Next => handle_next(cli, root).await,
        Commands::Phase { name, id } => handle_phase(cli, root, name, id).await,
        Commands::Doctor {
            fix,
            delete_orphan_branches,
        } => handle_doctor(root, *fix, *delete_orphan_branches),
    }
}

/// Open the store and config together; every command except init starts here.
fn open_repo(root: &Path) -> Result<(Store, Config)> {
    let config = config::load(&root.join(STORE_DIR))?;
    let store = Store::open(root, config.lock_timeout())?;
    Ok((store, config))
}

fn handle_init(root: &Path) -> Result<()> {
    let git = Git::new(root);
    if !git.is_repo() {
        log_warn!("Warning: {} is not a git repository; implement and pr phases will fail", root.display());
    }

    let config = Config::default();
    Store::init(root, &config)?;

    println!("Initialized wreckit in {}", root.join(STORE_DIR).display());
    println!("  Created: config.json, index.json, prompts/");
    println!("  Edit .wreckit/config.json to pick an agent backend.");
    Ok(())
}

fn handle_status(root: &Path) -> Result<()> {
    let (store, _config) = open_repo(root)?;
    let index = store.load_index()?;

    if index.items.is_empty() {
        println!("No items yet. Try `wreckit ideas add \"my idea\"`.");
        return Ok(());
    }

    let width = index.items.keys().map(|id| id.len()).max().unwrap_or(0);
    for (id, entry) in &index.items {
        println!("{:width$}  {:12}  {}", id, entry.state.to_string(), entry.title);
    }
    Ok(())
}

fn handle_ideas(root: &Path, action: &Option<IdeasAction>) -> Result<()> {
    let (store, _config) = open_repo(root)?;

    match action {
        Some(IdeasAction::Add {
            title,
            section,
            overview,
        }) => {
            let id = store.allocate_id(section, title)?;
            let item = Item::new(&id, title, overview, section);
            let _lock = store.acquire_item_lock(&id)?;
            store.save_item(&item)?;
            println!("Created {}", id);
            Ok(())
        }
        Some(IdeasAction::List) | None => {
            let ideas: Vec<Item> = store
                .list_items()?
                .into_iter()
                .filter(|i| i.state == ItemState::Idea)
                .collect();
            if ideas.is_empty() {
                println!("No ideas waiting.");
            }
            for item in ideas {
                println!("{}  {}", item.id, item.title);
            }
            Ok(())
        }
    }
}

/// Wire the signal-handler shutdown flag into a cancellation token the
/// runner can observe mid-phase.
fn spawn_cancellation_watcher() -> CancellationToken {
    let token = CancellationToken::new();
    let watcher = token.clone();
    tokio::spawn(async move {
        loop {
            if is_shutdown_requested() {
                watcher.cancel();
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    });
    token
}

async fn handle_run(cli: &Cli, root: &Path, id: Option<&str>) -> Result<()> {
    install_signal_handlers()?;
    let (store, config) = open_repo(root)?;
    let git = Git::new(root);
    let cancel = spawn_cancellation_watcher();

    let runner = SubprocessRunner::new(config.agent.clone());
    if !cli.dry_run {
        runner.verify_available()?;
    }

    let ctx = RunnerContext {
        store: &store,
        config: &config,
        git: &git,
        cancel: &cancel,
        dry_run: cli.dry_run,
        event_sink: None,
    };

    let selector: Vec<String> = id.map(|s| vec![s.to_string()]).unwrap_or_default();
    let summary = orchestrator::run(&ctx, &runner, &selector).await?;

    log_info!("");
    log_info!("--- Run summary ---");
    log_info!("Phases executed: {}", summary.phases_executed);
    log_info!("Items advanced:  {}", summary.items_advanced.join(", "));
    if !summary.items_blocked.is_empty() {
        log_info!("Items blocked:   {}", summary.items_blocked.join(", "));
    }
    Ok(())
}

async fn handle_next(cli: &Cli, root: &Path) -> Result<()> {
    install_signal_handlers()?;
    let (store, config) = open_repo(root)?;
    let git = Git::new(root);
    let cancel = spawn_cancellation_watcher();

    let runner = SubprocessRunner::new(config.agent.clone());
    if !cli.dry_run {
        runner.verify_available()?;
    }

    let ctx = RunnerContext {
        store: &store,
        config: &config,
        git: &git,
        cancel: &cancel,
        dry_run: cli.dry_run,
        event_sink: None,
    };

    match orchestrator::run_next(&ctx, &runner).await? {
        None => {
            println!("Nothing to do.");
            Ok(())
        }
        Some(outcome) => match outcome.error {
            None => {
                println!("{} -> {}", outcome.item.id, outcome.item.state);
                Ok(())
            }
            Some(e) => Err(e),
        },
    }
}

async fn handle_phase(cli: &Cli, root: &Path, name: &str, id: &str) -> Result<()> {
    install_signal_handlers()?;
    let phase = parse_phase(name).map_err(WreckitError::InvalidState)?;

    let (store, config) = open_repo(root)?;
    let git = Git::new(root);
    let cancel = spawn_cancellation_watcher();

    let runner = SubprocessRunner::new(config.agent.clone());
    if !cli.dry_run {
        runner.verify_available()?;
    }

    let ctx = RunnerContext {
        store: &store,
        config: &config,
        git: &git,
        cancel: &cancel,
        dry_run: cli.dry_run,
        event_sink: None,
    };

    let outcome = run_phase(&ctx, &runner, id, phase).await;
    match outcome.error {
        None => {
            println!("{} -> {}", outcome.item.id, outcome.item.state);
            Ok(())
        }
        Some(e) => Err(e),
    }
}

fn handle_doctor(root: &Path, fix: bool, delete_orphan_branches: bool) -> Result<()> {
    let (store, config) = open_repo(root)?;
    let git = Git::new(root);

    let diagnostics = doctor::diagnose(&store, &git, &config)?;

    if diagnostics.is_empty() {
        println!("No problems found.");
        return Ok(());
    }

    for d in &diagnostics {
        println!("[{:?}] {:?} @ {}: {}", d.severity, d.kind, d.location, d.description);
    }

    if fix {
        let results = doctor::apply_fixes(
            &store,
            &git,
            &config,
            &diagnostics,
            FixOptions {
                delete_orphan_branches,
            },
        )?;
        println!();
        for r in &results {
            println!("{} @ {}: {}", r.action, r.diagnostic.location, r.outcome);
        }

        // Re-diagnose so the exit status reflects what is still broken
        let remaining = doctor::diagnose(&store, &git, &config)?;
        let errors = remaining
            .iter()
            .filter(|d| d.severity == Severity::Error)
            .count();
        if errors > 0 {
            return Err(WreckitError::InvalidState(format!(
                "{} error-severity diagnostic(s) remain after fixes",
                errors
            )));
        }
    } else if diagnostics.iter().any(|d| d.severity == Severity::Error) {
        return Err(WreckitError::InvalidState(
            "error-severity diagnostics found; run `wreckit doctor --fix`".to_string(),
        ));
    }

    Ok(())
}
