use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::AgentBackend;
use crate::error::{Result, WreckitError};
use crate::skill::McpEndpoint;
use crate::{log_debug, log_warn};

/// Maximum time to wait for graceful shutdown after SIGTERM before SIGKILL.
const SIGTERM_GRACE_PERIOD_SECONDS: u64 = 5;

/// Polling interval when waiting for a process group to exit after SIGTERM.
const KILL_POLL_INTERVAL_MS: u64 = 100;

/// Bounded capacity of the event channel between backend and consumers.
const EVENT_CHANNEL_CAPACITY: usize = 256;

// --- Signal handling ---

/// Global shutdown flag shared with signal handlers.
fn shutdown_flag() -> &'static Arc<AtomicBool> {
    static FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();
    FLAG.get_or_init(|| Arc::new(AtomicBool::new(false)))
}

/// Check if a shutdown has been requested via signal.
pub fn is_shutdown_requested() -> bool {
    shutdown_flag().load(Ordering::Relaxed)
}

/// Install signal handlers for SIGTERM and SIGINT that set the shutdown flag.
///
/// Call once at program startup. Subsequent calls are safe (re-registers).
pub fn install_signal_handlers() -> Result<()> {
    let flag = Arc::clone(shutdown_flag());
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&flag)).map_err(|e| {
        WreckitError::ConfigError(format!("Failed to register SIGTERM handler: {}", e))
    })?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, flag).map_err(|e| {
        WreckitError::ConfigError(format!("Failed to register SIGINT handler: {}", e))
    })?;
    Ok(())
}

// --- Process registry ---

/// Global registry of active child process group ids.
///
/// Uses `std::sync::Mutex` (not tokio's) because operations are fast
/// (insert/remove/iterate) with no I/O under the lock.
fn process_registry() -> &'static Arc<std::sync::Mutex<HashSet<Pid>>> {
    static REGISTRY: OnceLock<Arc<std::sync::Mutex<HashSet<Pid>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Arc::new(std::sync::Mutex::new(HashSet::new())))
}

fn register_child(pgid: Pid) {
    if let Ok(mut registry) = process_registry().lock() {
        registry.insert(pgid);
    }
}

fn unregister_child(pgid: Pid) {
    if let Ok(mut registry) = process_registry().lock() {
        registry.remove(&pgid);
    }
}

/// Kill all registered child process groups.
///
/// Sends SIGTERM to all registered pgids, waits for the grace period,
/// then SIGKILLs any survivors. Clears the registry when done.
pub fn kill_all_children() {
    use nix::sys::signal::{killpg, Signal};

    let pgids: Vec<Pid> = {
        let Ok(registry) = process_registry().lock() else {
            return;
        };
        registry.iter().copied().collect()
    };

    if pgids.is_empty() {
        return;
    }

    for &pgid in &pgids {
        let _ = killpg(pgid, Signal::SIGTERM);
    }

    let deadline = std::time::Instant::now() + Duration::from_secs(SIGTERM_GRACE_PERIOD_SECONDS);
    let poll_interval = Duration::from_millis(KILL_POLL_INTERVAL_MS);

    while std::time::Instant::now() < deadline {
        let all_gone = pgids
            .iter()
            .all(|&pgid| matches!(killpg(pgid, None), Err(nix::errno::Errno::ESRCH)));
        if all_gone {
            break;
        }
        std::thread::sleep(poll_interval);
    }

    for &pgid in &pgids {
        let _ = killpg(pgid, Signal::SIGKILL);
    }

    if let Ok(mut registry) = process_registry().lock() {
        registry.clear();
    }
}

/// Kill a process group by pid. SIGTERM, poll for exit, SIGKILL if needed.
///
/// The blocking poll-and-sleep loop runs on the tokio blocking thread pool
/// via `spawn_blocking` to avoid stalling async worker threads.
async fn kill_process_group(pgid: i32) {
    tokio::task::spawn_blocking(move || {
        use nix::sys::signal::{killpg, Signal};

        let pgid = Pid::from_raw(pgid);

        if let Err(nix::errno::Errno::ESRCH) = killpg(pgid, Signal::SIGTERM) {
            return; // already gone
        }

        let deadline =
            std::time::Instant::now() + Duration::from_secs(SIGTERM_GRACE_PERIOD_SECONDS);
        let poll_interval = Duration::from_millis(KILL_POLL_INTERVAL_MS);

        while std::time::Instant::now() < deadline {
            // Signal 0 checks if the process group exists without sending one
            match killpg(pgid, None) {
                Err(nix::errno::Errno::ESRCH) => return,
                _ => std::thread::sleep(poll_interval),
            }
        }

        let _ = killpg(pgid, Signal::SIGKILL);
    })
    .await
    .unwrap_or_else(|e| log_warn!("kill_process_group task panicked: {}", e));
}

// --- Event stream ---

/// One event from a running agent. The engine consumes these lazily to
/// populate UI activity, append to progress.log, and detect completion.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    AssistantText(String),
    ToolStarted {
        id: String,
        name: String,
        input: String,
    },
    ToolResult {
        id: String,
        result: String,
    },
    ToolError {
        id: String,
        error: String,
    },
    RunResult {
        exit_code: Option<i32>,
    },
    Error(String),
}

impl AgentEvent {
    /// Terminal events must always be delivered; the rest may be sampled.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentEvent::RunResult { .. } | AgentEvent::Error(_))
    }
}

/// Sending half of the bounded backend→core event channel.
///
/// Backpressure is explicit: when the consumer is slow, low-priority
/// `AssistantText` events are dropped rather than stalling the backend;
/// terminal events always wait for capacity.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<AgentEvent>,
}

impl EventSink {
    pub fn channel() -> (EventSink, mpsc::Receiver<AgentEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        (EventSink { tx }, rx)
    }

    pub async fn emit(&self, event: AgentEvent) {
        if event.is_terminal() {
            let _ = self.tx.send(event).await;
        } else {
            // try_send drops the event when the consumer lags
            let _ = self.tx.try_send(event);
        }
    }
}

// --- Runner contract ---

/// Per-call options for an agent invocation.
pub struct AgentOptions<'a> {
    pub cwd: &'a Path,
    pub prompt: &'a str,
    pub allowed_tools: &'a BTreeSet<String>,
    pub mcp_endpoints: &'a BTreeMap<String, McpEndpoint>,
    pub timeout: Duration,
    pub event_sink: Option<&'a EventSink>,
    pub cancel: &'a CancellationToken,
    pub completion_signal: &'a str,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentResult {
    pub success: bool,
    pub output: String,
    pub timed_out: bool,
    pub exit_code: Option<i32>,
    pub completion_detected: bool,
}

/// Trait for running agents. Enables mocking in pipeline tests.
pub trait AgentRunner: Send + Sync {
    fn run(
        &self,
        opts: AgentOptions<'_>,
    ) -> impl std::future::Future<Output = Result<AgentResult>> + Send;
}

// --- Subprocess runner ---

/// Runs every configured backend as a supervised subprocess: the prompt is
/// piped to stdin, stdout is scanned for the completion signal, the process
/// group is isolated so timeout and cancellation can kill the whole tree.
pub struct SubprocessRunner {
    backend: AgentBackend,
}

impl SubprocessRunner {
    pub fn new(backend: AgentBackend) -> Self {
        Self { backend }
    }

    /// Verify that the backend's binary is available on PATH.
    pub fn verify_available(&self) -> Result<()> {
        let binary = self.binary_name();
        let output = std::process::Command::new(binary)
            .arg("--version")
            .output()
            .map_err(|e| {
                WreckitError::ConfigError(format!("{} not found on PATH ({})", binary, e))
            })?;
        if !output.status.success() {
            return Err(WreckitError::ConfigError(format!(
                "{} found but `{} --version` failed",
                binary, binary
            )));
        }
        Ok(())
    }

    fn binary_name(&self) -> &str {
        match &self.backend {
            AgentBackend::ClaudeSdk { .. } => "claude",
            AgentBackend::AmpSdk { .. } => "amp",
            AgentBackend::CodexSdk { .. } => "codex",
            AgentBackend::OpencodeSdk { .. } => "opencode",
            AgentBackend::Process { command, .. } => command,
            AgentBackend::Rlm { .. } => "rlm",
            AgentBackend::Sprite { .. } => "sprite",
        }
    }

    fn build_command(&self, opts: &AgentOptions<'_>) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(self.binary_name());

        match &self.backend {
            AgentBackend::ClaudeSdk { model } => {
                cmd.arg("--dangerously-skip-permissions");
                if let Some(m) = model {
                    cmd.args(["--model", m]);
                }
                if !opts.allowed_tools.is_empty() {
                    let tools: Vec<&str> =
                        opts.allowed_tools.iter().map(|t| t.as_str()).collect();
                    cmd.args(["--allowed-tools", &tools.join(",")]);
                }
                if !opts.mcp_endpoints.is_empty() {
                    cmd.args(["--mcp-config", &mcp_config_json(opts.mcp_endpoints)]);
                }
                cmd.arg("-p");
            }
            AgentBackend::AmpSdk { model } => {
                cmd.arg("-x");
                if let Some(m) = model {
                    cmd.args(["--model", m]);
                }
            }
            AgentBackend::CodexSdk { model } => {
                cmd.args(["exec", "--full-auto"]);
                if let Some(m) = model {
                    cmd.args(["-m", m]);
                }
            }
            AgentBackend::OpencodeSdk { model } => {
                cmd.args(["run", "--quiet"]);
                if let Some(m) = model {
                    cmd.args(["--model", m]);
                }
            }
            AgentBackend::Process { args, .. } => {
                cmd.args(args);
            }
            AgentBackend::Rlm { model } => {
                cmd.arg("run");
                if let Some(m) = model {
                    cmd.args(["--model", m]);
                }
            }
            AgentBackend::Sprite { workspace } => {
                // Sprite syncs the project into a sandboxed VM before
                // executing; the subprocess contract is otherwise identical.
                cmd.arg("exec");
                if let Some(w) = workspace {
                    cmd.args(["--workspace", w]);
                }
            }
        }

        cmd.current_dir(opts.cwd);
        cmd
    }
}

fn mcp_config_json(endpoints: &BTreeMap<String, McpEndpoint>) -> String {
    let servers: serde_json::Map<String, serde_json::Value> = endpoints
        .iter()
        .map(|(name, ep)| {
            (
                name.clone(),
                serde_json::json!({ "command": ep.command, "args": ep.args }),
            )
        })
        .collect();
    serde_json::json!({ "mcpServers": servers }).to_string()
}

impl AgentRunner for SubprocessRunner {
    async fn run(&self, opts: AgentOptions<'_>) -> Result<AgentResult> {
        let cmd = self.build_command(&opts);
        run_subprocess_agent(cmd, opts).await
    }
}

/// Spawn a subprocess agent: process-group isolation, prompt over stdin,
/// stdout scanned for the completion signal, timeout and cancellation
/// enforced with SIGTERM → SIGKILL escalation.
///
/// The caller configures the `Command` (program, args, env); this function
/// owns supervision. Shared by all subprocess-backed runners.
pub async fn run_subprocess_agent(
    mut cmd: tokio::process::Command,
    opts: AgentOptions<'_>,
) -> Result<AgentResult> {
    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    // SAFETY: pre_exec runs between fork() and exec() where only
    // async-signal-safe functions are permitted. setpgid is async-signal-safe
    // per POSIX.
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setpgid(nix::unistd::Pid::from_raw(0), nix::unistd::Pid::from_raw(0))
                .map_err(std::io::Error::other)?;
            Ok(())
        });
    }

    log_debug!("[agent] Spawning subprocess...");
    let mut child = cmd.spawn().map_err(|e| {
        WreckitError::InvalidState(format!("Failed to spawn agent subprocess: {}", e))
    })?;

    let child_pid = child
        .id()
        .ok_or_else(|| WreckitError::InvalidState("Failed to get child pid".to_string()))?
        as i32;
    let pgid = Pid::from_raw(child_pid);
    log_debug!("[agent] Subprocess spawned (pid={})", child_pid);
    register_child(pgid);

    // Feed the prompt and close stdin so the agent sees EOF
    if let Some(mut stdin) = child.stdin.take() {
        if let Err(e) = stdin.write_all(opts.prompt.as_bytes()).await {
            log_warn!("Warning: Failed to write prompt to agent stdin: {}", e);
        }
        drop(stdin);
    }

    // Forward stderr chunks to the sink from a side task
    let stderr_task = child.stderr.take().map(|stderr| {
        let sink = opts.event_sink.cloned();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(sink) = &sink {
                    sink.emit(AgentEvent::AssistantText(line)).await;
                }
            }
        })
    });

    let stdout = child.stdout.take();
    let deadline = tokio::time::Instant::now() + opts.timeout;

    let mut output = String::new();
    let mut completion_detected = false;
    let mut timed_out = false;
    let mut cancelled = false;

    if let Some(stdout) = stdout {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            if line.contains(opts.completion_signal) {
                                completion_detected = true;
                            }
                            if let Some(sink) = opts.event_sink {
                                sink.emit(AgentEvent::AssistantText(line.clone())).await;
                            }
                            output.push_str(&line);
                            output.push('\n');
                        }
                        Ok(None) => break, // EOF
                        Err(e) => {
                            log_warn!("Warning: Error reading agent stdout: {}", e);
                            break;
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    timed_out = true;
                    break;
                }
                _ = opts.cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
            }
        }
    }

    let exit_code = if timed_out || cancelled {
        log_debug!(
            "[agent] {}, killing process group",
            if timed_out { "TIMEOUT" } else { "CANCELLED" }
        );
        kill_process_group(child_pid).await;
        let _ = child.wait().await;
        None
    } else {
        match tokio::time::timeout_at(deadline, child.wait()).await {
            Ok(Ok(status)) => status.code(),
            Ok(Err(e)) => {
                unregister_child(pgid);
                return Err(WreckitError::InvalidState(format!(
                    "Error waiting for agent subprocess: {}",
                    e
                )));
            }
            Err(_) => {
                timed_out = true;
                kill_process_group(child_pid).await;
                let _ = child.wait().await;
                None
            }
        }
    };

    unregister_child(pgid);

    if let Some(task) = stderr_task {
        let _ = task.await;
    }

    if cancelled || is_shutdown_requested() {
        if !cancelled {
            // Signal arrived after the subprocess exited on its own
            kill_process_group(child_pid).await;
        }
        return Err(WreckitError::Interrupted);
    }

    let success = !timed_out && exit_code == Some(0);
    log_debug!(
        "[agent] Subprocess done (exit={:?}, timed_out={}, completion={})",
        exit_code,
        timed_out,
        completion_detected
    );

    if let Some(sink) = opts.event_sink {
        sink.emit(AgentEvent::RunResult { exit_code }).await;
    }

    Ok(AgentResult {
        success,
        output,
        timed_out,
        exit_code,
        completion_detected,
    })
}

// --- Mock runner ---

/// One scripted step of the mock agent: files written into the cwd, output
/// lines to emit, and whether the step ends with the completion signal.
#[derive(Debug, Clone, Default)]
pub struct MockStep {
    pub files: Vec<(String, String)>,
    pub lines: Vec<String>,
    pub complete: bool,
}

/// Deterministic agent simulator for end-to-end tests without API cost.
///
/// Each call to `run` consumes the next step in the sequence, writes its
/// files into the working directory, and emits its canned output.
pub struct MockRunner {
    steps: tokio::sync::Mutex<Vec<MockStep>>,
    completion_signal: String,
}

impl MockRunner {
    pub fn new(steps: Vec<MockStep>, completion_signal: &str) -> Self {
        let mut reversed = steps;
        reversed.reverse();
        Self {
            steps: tokio::sync::Mutex::new(reversed),
            completion_signal: completion_signal.to_string(),
        }
    }
}

impl AgentRunner for MockRunner {
    async fn run(&self, opts: AgentOptions<'_>) -> Result<AgentResult> {
        let step = {
            let mut steps = self.steps.lock().await;
            steps.pop()
        };
        let step = step.ok_or_else(|| {
            WreckitError::InvalidState("Mock agent: no more scripted steps".to_string())
        })?;

        for (name, contents) in &step.files {
            let path = opts.cwd.join(name);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| WreckitError::io(parent, e))?;
            }
            std::fs::write(&path, contents).map_err(|e| WreckitError::io(&path, e))?;
        }

        let mut output = String::new();
        for line in &step.lines {
            if let Some(sink) = opts.event_sink {
                sink.emit(AgentEvent::AssistantText(line.clone())).await;
            }
            output.push_str(line);
            output.push('\n');
        }
        if step.complete {
            output.push_str(&self.completion_signal);
            output.push('\n');
        }

        if let Some(sink) = opts.event_sink {
            sink.emit(AgentEvent::RunResult { exit_code: Some(0) }).await;
        }

        Ok(AgentResult {
            success: true,
            output,
            timed_out: false,
            exit_code: Some(0),
            completion_detected: step.complete,
        })
    }
}
