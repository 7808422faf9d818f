//! Companion process - spawning, output capture, exit tracking, termination.
//!
//! The waiter task owns the `Child`. Everyone else sees the process through
//! a `watch` channel that flips from `None` to `Some(ExitInfo)` exactly once,
//! after both output readers have drained, so the captured stderr is complete
//! by the time an exit is observed.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch, Mutex};

use crate::server::error::ServerError;
use crate::server::listen::{probe_port, ListenConfig};
use crate::server::privilege::{build_command, PrivilegeMode};

const DEFAULT_OUTPUT_LINES: usize = 500;
/// Shared bound on draining both output readers once the child has exited.
const READER_DRAIN: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ProcessSettings {
    pub binary: PathBuf,
    pub working_dir: PathBuf,
    pub privilege: PrivilegeMode,
    pub startup_grace: Duration,
    pub kill_grace: Duration,
    pub kill_confirm: Duration,
    pub output_lines: usize,
}

impl ProcessSettings {
    pub fn new(binary: PathBuf, working_dir: PathBuf) -> Self {
        Self {
            binary,
            working_dir,
            privilege: PrivilegeMode::default(),
            startup_grace: Duration::from_millis(500),
            kill_grace: Duration::from_secs(3),
            kill_confirm: Duration::from_secs(2),
            output_lines: DEFAULT_OUTPUT_LINES,
        }
    }
}

/// Read-only view of a live companion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessInfo {
    pub pid: u32,
    /// Increases by one per successful spawn; lets stale exit events be ignored.
    pub generation: u64,
    pub started_at: DateTime<Utc>,
    pub listen: ListenConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub description: String,
}

impl ExitInfo {
    fn from_status(status: &ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
            description: status.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputSource {
    Stdout,
    Stderr,
    System,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutputLine {
    pub timestamp: DateTime<Utc>,
    pub source: OutputSource,
    pub content: String,
}

#[derive(Debug)]
struct OutputBuffer {
    lines: VecDeque<OutputLine>,
    max_size: usize,
}

impl OutputBuffer {
    fn with_capacity(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            lines: VecDeque::with_capacity(max_size.min(DEFAULT_OUTPUT_LINES)),
            max_size,
        }
    }

    fn push(&mut self, source: OutputSource, content: String) {
        if self.lines.len() >= self.max_size {
            self.lines.pop_front();
        }
        self.lines.push_back(OutputLine {
            timestamp: Utc::now(),
            source,
            content,
        });
    }

    fn recent(&self, count: usize) -> Vec<OutputLine> {
        self.lines.iter().rev().take(count).rev().cloned().collect()
    }

    fn stderr_text(&self) -> String {
        self.lines
            .iter()
            .filter(|l| l.source == OutputSource::Stderr)
            .map(|l| l.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug)]
pub struct CompanionProcess {
    info: ProcessInfo,
    output: Arc<Mutex<OutputBuffer>>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    /// Flips to `true` once the output readers finished or gave up.
    drained_rx: watch::Receiver<bool>,
    kill_tx: mpsc::Sender<()>,
}

impl CompanionProcess {
    pub fn info(&self) -> &ProcessInfo {
        &self.info
    }

    pub fn pid(&self) -> u32 {
        self.info.pid
    }

    pub fn is_running(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.exit_rx.borrow().clone()
    }

    pub fn exit_watch(&self) -> watch::Receiver<Option<ExitInfo>> {
        self.exit_rx.clone()
    }

    /// `None` if the process is still alive after `limit`.
    pub async fn wait_exit(&self, limit: Duration) -> Option<ExitInfo> {
        let mut rx = self.exit_rx.clone();
        match tokio::time::timeout(limit, wait_for_exit(&mut rx)).await {
            Ok(exit) => Some(exit),
            Err(_) => None,
        }
    }

    pub async fn recent_output(&self, count: usize) -> Vec<OutputLine> {
        self.output.lock().await.recent(count)
    }

    /// Waits until the output readers are done, at most `READER_DRAIN`.
    async fn wait_drained(&self) {
        let mut rx = self.drained_rx.clone();
        let _ = tokio::time::timeout(READER_DRAIN, rx.wait_for(|done| *done)).await;
    }

    /// Asks the waiter to `start_kill` the direct child.
    fn force_kill(&self) {
        let _ = self.kill_tx.try_send(());
    }
}

/// Resolves once the watch carries an exit. A dropped sender counts as exit.
pub async fn wait_for_exit(rx: &mut watch::Receiver<Option<ExitInfo>>) -> ExitInfo {
    loop {
        if let Some(exit) = rx.borrow_and_update().clone() {
            return exit;
        }
        if rx.changed().await.is_err() {
            return rx.borrow().clone().unwrap_or_else(|| ExitInfo {
                code: None,
                signal: None,
                description: "waiter stopped".to_string(),
            });
        }
    }
}

fn bind_failure() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)address already in use|unable to (listen|bind)|EADDRINUSE").expect("valid bind regex")
    })
}

fn permission_failure() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)permission denied|not permitted|must be run as root|EACCES|EPERM")
            .expect("valid permission regex")
    })
}

fn classify_startup_exit(exit: &ExitInfo, stderr: &str, listen: &ListenConfig) -> ServerError {
    let tail = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("").trim();
    if listen.enabled && bind_failure().is_match(stderr) {
        ServerError::Bind { port: listen.port }
    } else if permission_failure().is_match(stderr) {
        ServerError::Permission(tail.to_string())
    } else if tail.is_empty() {
        ServerError::Process(format!("exited during startup ({})", exit.description))
    } else {
        ServerError::Process(format!("exited during startup ({}): {}", exit.description, tail))
    }
}

pub struct ProcessController {
    settings: ProcessSettings,
    generation: AtomicU64,
}

impl ProcessController {
    pub fn new(settings: ProcessSettings) -> Self {
        Self {
            settings,
            generation: AtomicU64::new(0),
        }
    }

    pub fn settings(&self) -> &ProcessSettings {
        &self.settings
    }

    /// Spawns the companion and waits out the startup grace period.
    pub async fn start(&self, listen: ListenConfig) -> Result<CompanionProcess, ServerError> {
        let binary = &self.settings.binary;
        if !binary.is_file() {
            return Err(ServerError::NotInstalled);
        }
        probe_port(&listen)?;

        let args = listen.args();
        let mut cmd = build_command(self.settings.privilege, binary, &args)?;
        cmd.current_dir(&self.settings.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own group so signals reach a `su` wrapper and its child together
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied => {
                ServerError::Permission(format!("cannot execute {}: {}", binary.display(), e))
            }
            _ => ServerError::Process(format!("failed to spawn {}: {}", binary.display(), e)),
        })?;
        let pid = child
            .id()
            .ok_or_else(|| ServerError::Process("spawned process has no pid".to_string()))?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let output = Arc::new(Mutex::new(OutputBuffer::with_capacity(self.settings.output_lines)));
        let (exit_tx, exit_rx) = watch::channel(None);
        let (drained_tx, drained_rx) = watch::channel(false);
        let (kill_tx, mut kill_rx) = mpsc::channel::<()>(4);

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            let buf = output.clone();
            readers.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!("[frida-server] {}", line);
                    buf.lock().await.push(OutputSource::Stdout, line);
                }
            }));
        }
        if let Some(stderr) = child.stderr.take() {
            let buf = output.clone();
            readers.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!("[frida-server:stderr] {}", line);
                    buf.lock().await.push(OutputSource::Stderr, line);
                }
            }));
        }

        {
            let buf = output.clone();
            tokio::spawn(async move {
                let status = loop {
                    tokio::select! {
                        status = child.wait() => break status,
                        cmd = kill_rx.recv() => match cmd {
                            Some(()) => {
                                if let Err(e) = child.start_kill() {
                                    tracing::debug!("[Process] start_kill failed: {}", e);
                                }
                            }
                            None => break child.wait().await,
                        },
                    }
                };
                let exit = match status {
                    Ok(status) => ExitInfo::from_status(&status),
                    Err(e) => ExitInfo {
                        code: None,
                        signal: None,
                        description: format!("wait failed: {}", e),
                    },
                };
                tracing::info!("[Process] frida-server (pid {}) exited: {}", pid, exit.description);
                let description = exit.description.clone();
                let _ = exit_tx.send(Some(exit));

                // Grandchildren may still hold the pipes open
                let drain = async {
                    for reader in readers {
                        let _ = reader.await;
                    }
                };
                if tokio::time::timeout(READER_DRAIN, drain).await.is_err() {
                    tracing::debug!("[Process] output of pid {} still open after exit", pid);
                }
                buf.lock()
                    .await
                    .push(OutputSource::System, format!("Process exited with {}", description));
                let _ = drained_tx.send(true);
            });
        }

        output
            .lock()
            .await
            .push(OutputSource::System, format!("Process started with PID {}", pid));

        let process = CompanionProcess {
            info: ProcessInfo {
                pid,
                generation,
                started_at: Utc::now(),
                listen,
            },
            output,
            exit_rx,
            drained_rx,
            kill_tx,
        };

        if let Some(exit) = process.wait_exit(self.settings.startup_grace).await {
            process.wait_drained().await;
            let stderr = process.output.lock().await.stderr_text();
            let err = classify_startup_exit(&exit, &stderr, &listen);
            tracing::warn!("[Process] frida-server failed to start: {}", err);
            return Err(err);
        }

        tracing::info!(
            "[Process] frida-server started (pid {}, generation {}, listen {:?})",
            pid,
            generation,
            listen
        );
        Ok(process)
    }

    /// SIGTERM, grace period, SIGKILL, bounded confirmation.
    pub async fn kill(&self, process: &CompanionProcess) -> Result<(), ServerError> {
        if !process.is_running() {
            return Ok(());
        }
        let pid = process.pid();
        tracing::info!("[Process] Stopping frida-server (pid {})", pid);

        self.terminate(pid).await;
        if process.wait_exit(self.settings.kill_grace).await.is_some() {
            return Ok(());
        }

        tracing::warn!(
            "[Process] pid {} ignored SIGTERM for {:?}, forcing",
            pid,
            self.settings.kill_grace
        );
        self.force(pid).await;
        process.force_kill();
        if process.wait_exit(self.settings.kill_confirm).await.is_some() {
            return Ok(());
        }
        Err(ServerError::Process(format!(
            "frida-server (pid {}) did not exit after SIGKILL",
            pid
        )))
    }

    #[cfg(unix)]
    async fn terminate(&self, pid: u32) {
        self.signal_group(pid, nix::sys::signal::Signal::SIGTERM).await;
    }

    #[cfg(unix)]
    async fn force(&self, pid: u32) {
        self.signal_group(pid, nix::sys::signal::Signal::SIGKILL).await;
    }

    #[cfg(not(unix))]
    async fn terminate(&self, _pid: u32) {}

    #[cfg(not(unix))]
    async fn force(&self, _pid: u32) {}

    #[cfg(unix)]
    async fn signal_group(&self, pid: u32, signal: nix::sys::signal::Signal) {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, killpg};
        use nix::unistd::Pid;

        let target = Pid::from_raw(pid as i32);
        match killpg(target, signal) {
            Ok(()) => {}
            Err(Errno::ESRCH) => {
                tracing::debug!("[Process] group {} already gone", pid);
            }
            Err(Errno::EPERM) => {
                // Root-owned group started through su
                self.escalated_signal(pid, signal as i32).await;
            }
            Err(e) => {
                tracing::warn!("[Process] killpg({}, {}) failed: {}, signalling pid only", pid, signal, e);
                if let Err(e) = kill(target, signal) {
                    tracing::warn!("[Process] kill({}, {}) failed: {}", pid, signal, e);
                }
            }
        }
    }

    #[cfg(unix)]
    async fn escalated_signal(&self, pid: u32, signo: i32) {
        let Some(su) = crate::server::privilege::find_su() else {
            tracing::warn!("[Process] no permission to signal {} and no su helper", pid);
            return;
        };
        let mut cmd = tokio::process::Command::new(su);
        cmd.arg("-c")
            .arg(format!("kill -{} -{}", signo, pid))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        match tokio::time::timeout(self.settings.kill_grace, cmd.status()).await {
            Ok(Ok(status)) if status.success() => {}
            Ok(Ok(status)) => tracing::warn!("[Process] su kill -{} {} exited with {}", signo, pid, status),
            Ok(Err(e)) => tracing::warn!("[Process] su kill failed: {}", e),
            Err(_) => tracing::warn!("[Process] su kill timed out"),
        }
    }
}
