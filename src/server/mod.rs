//! frida-server 라이프사이클 관리
//!
//! `FridaServer`는 설치/업데이트/시작/종료/리슨 포트 변경을 하나의 상태
//! 머신으로 직렬화한다. 변경 명령은 한 번에 하나만 실행되고, 나머지는
//! `CommandOutcome::Rejected`로 즉시 돌아온다.
//!
//! ## 상태 흐름
//! ```text
//! NotInstalled ─install→ Updating ─→ Stopped ─start→ Starting ─→ Running
//!                                      ↑                            │
//!                                      └──── Stopped ←─ Stopping ←──┘ kill
//! ```

pub mod error;
pub mod listen;
pub mod notify;
pub mod privilege;
pub mod process;
pub mod state_machine;

use std::path::PathBuf;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::updater::{Arch, DownloadSnapshot, GitHubClient, InstallLayout, Provisioner, SemVer, VersionResolver};

pub use error::{ErrorKind, ServerError};
pub use listen::ListenConfig;
pub use notify::{Notification, Notifier, Subscription};
pub use privilege::PrivilegeMode;
pub use process::{CompanionProcess, ExitInfo, OutputLine, ProcessController, ProcessInfo, ProcessSettings};
pub use state_machine::{ServerState, StateMachine};

/// Where releases come from and which assets fit this device.
#[derive(Debug, Clone)]
pub struct ReleaseSettings {
    pub owner: String,
    pub repo: String,
    /// `None` = api.github.com
    pub api_base_url: Option<String>,
    pub platform: String,
    /// `None` = detect from the running CPU
    pub arch: Option<Arch>,
    pub http_timeout: Duration,
}

impl Default for ReleaseSettings {
    fn default() -> Self {
        Self {
            owner: "frida".to_string(),
            repo: "frida".to_string(),
            api_base_url: None,
            platform: "android".to_string(),
            arch: None,
            http_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Holds the binary, the version marker and the staging area.
    pub root: PathBuf,
    pub release: ReleaseSettings,
    pub process: ProcessSettings,
    pub download_timeout: Duration,
    pub listen: ListenConfig,
}

impl ServerOptions {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let layout = InstallLayout::new(root.clone());
        Self {
            process: ProcessSettings::new(layout.binary_path(), root.clone()),
            root,
            release: ReleaseSettings::default(),
            download_timeout: Duration::from_secs(300),
            listen: ListenConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommandOutcome {
    Completed,
    /// `update()` found nothing newer than the installed version.
    UpToDate,
    /// Another command was in flight or the current state does not accept it.
    Rejected { state: ServerState },
}

/// Everything a front end renders, replaced as one value.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub state: ServerState,
    pub installed_version: Option<SemVer>,
    pub listen: ListenConfig,
    pub process: Option<ProcessInfo>,
    pub last_error: Option<ErrorKind>,
}

struct Shared {
    machine: StateMachine,
    installed_version: Option<SemVer>,
    listen: ListenConfig,
    process: Option<ProcessInfo>,
    last_error: Option<ErrorKind>,
}

impl Shared {
    fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            state: self.machine.state(),
            installed_version: self.installed_version.clone(),
            listen: self.listen,
            process: self.process.clone(),
            last_error: self.last_error,
        }
    }
}

struct Running {
    process: CompanionProcess,
    monitor: CancellationToken,
}

struct Inner {
    provisioner: Provisioner,
    controller: ProcessController,
    notifier: Notifier,
    shared: RwLock<Shared>,
    /// Single-flight token for mutating commands.
    op_lock: Mutex<()>,
    running: Mutex<Option<Running>>,
}

#[derive(Clone)]
pub struct FridaServer {
    inner: Arc<Inner>,
}

impl FridaServer {
    pub fn new(options: ServerOptions) -> Result<Self, ServerError> {
        let layout = InstallLayout::new(options.root.clone());
        let client = GitHubClient::with_base_url(
            &options.release.owner,
            &options.release.repo,
            options.release.api_base_url.as_deref(),
            options.release.http_timeout,
        )?;
        let resolver = VersionResolver::new(layout, client, &options.release.platform, options.release.arch);
        let installed_version = resolver.installed_version();
        let initial = if installed_version.is_some() {
            ServerState::Stopped
        } else {
            ServerState::NotInstalled
        };
        tracing::info!(
            "[Server] root={} installed={:?} initial={}",
            options.root.display(),
            installed_version.as_ref().map(|v| v.to_string()),
            initial
        );

        let provisioner = Provisioner::new(resolver, options.download_timeout);
        Ok(Self {
            inner: Arc::new(Inner {
                provisioner,
                controller: ProcessController::new(options.process),
                notifier: Notifier::new(),
                shared: RwLock::new(Shared {
                    machine: StateMachine::new(initial),
                    installed_version,
                    listen: options.listen,
                    process: None,
                    last_error: None,
                }),
                op_lock: Mutex::new(()),
                running: Mutex::new(None),
            }),
        })
    }

    // ─── Read side ───────────────────────────────────────────

    pub fn state(&self) -> ServerState {
        self.inner.read().machine.state()
    }

    pub fn status(&self) -> StatusSnapshot {
        self.inner.read().snapshot()
    }

    pub fn version(&self) -> Option<SemVer> {
        self.inner.read().installed_version.clone()
    }

    pub fn listen_config(&self) -> ListenConfig {
        self.inner.read().listen
    }

    pub fn process_info(&self) -> Option<ProcessInfo> {
        self.inner.read().process.clone()
    }

    pub fn download_state(&self) -> DownloadSnapshot {
        self.inner.provisioner.download_state().snapshot()
    }

    /// Latest release for this device. Read-only, allowed in any state.
    pub async fn latest_version(&self) -> Result<SemVer, ServerError> {
        Ok(self.inner.provisioner.resolver().latest_version().await?)
    }

    pub async fn check_for_update(&self) -> Result<Option<SemVer>, ServerError> {
        Ok(self.inner.provisioner.resolver().check_for_update().await?)
    }

    /// Last `count` lines the companion printed, oldest first.
    pub async fn recent_output(&self, count: usize) -> Vec<OutputLine> {
        match self.inner.running.lock().await.as_ref() {
            Some(running) => running.process.recent_output(count).await,
            None => Vec::new(),
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.inner.notifier.subscribe(callback)
    }

    pub fn events(&self) -> tokio::sync::broadcast::Receiver<Notification> {
        self.inner.notifier.events()
    }

    // ─── Commands ────────────────────────────────────────────

    /// Installs the latest release. Only from `NotInstalled`.
    pub async fn install(&self) -> Result<CommandOutcome, ServerError> {
        self.install_version(None).await
    }

    pub async fn install_version(&self, version: Option<SemVer>) -> Result<CommandOutcome, ServerError> {
        let Ok(_op) = self.inner.op_lock.try_lock() else {
            return Ok(self.rejected());
        };
        if let Err(state) = self.inner.begin(&[ServerState::NotInstalled], ServerState::Updating) {
            return Ok(CommandOutcome::Rejected { state });
        }
        self.inner.provision(version.as_ref(), ServerState::NotInstalled).await?;
        Ok(CommandOutcome::Completed)
    }

    /// Installs a newer release if there is one. A running companion is
    /// stopped first and left stopped.
    pub async fn update(&self) -> Result<CommandOutcome, ServerError> {
        let Ok(_op) = self.inner.op_lock.try_lock() else {
            return Ok(self.rejected());
        };
        match self.state() {
            ServerState::Running => self.inner.stop().await?,
            ServerState::Stopped => {}
            state => return Ok(CommandOutcome::Rejected { state }),
        }
        if let Err(state) = self.inner.begin(&[ServerState::Stopped], ServerState::Updating) {
            return Ok(CommandOutcome::Rejected { state });
        }

        let target = match self.inner.provisioner.resolver().check_for_update().await {
            Ok(Some(version)) => version,
            Ok(None) => {
                self.inner.finish(ServerState::Stopped, None);
                return Ok(CommandOutcome::UpToDate);
            }
            Err(e) => {
                let err = ServerError::from(e);
                self.inner.finish(ServerState::Stopped, Some(err.kind()));
                return Err(err);
            }
        };
        self.inner.provision(Some(&target), ServerState::Stopped).await?;
        Ok(CommandOutcome::Completed)
    }

    /// Only from `Stopped`.
    pub async fn start(&self) -> Result<CommandOutcome, ServerError> {
        let Ok(_op) = self.inner.op_lock.try_lock() else {
            return Ok(self.rejected());
        };
        if let Err(state) = self.inner.begin(&[ServerState::Stopped], ServerState::Starting) {
            return Ok(CommandOutcome::Rejected { state });
        }
        Inner::launch(&self.inner).await?;
        Ok(CommandOutcome::Completed)
    }

    /// Only from `Running`.
    pub async fn kill(&self) -> Result<CommandOutcome, ServerError> {
        let Ok(_op) = self.inner.op_lock.try_lock() else {
            return Ok(self.rejected());
        };
        if self.state() != ServerState::Running {
            return Ok(CommandOutcome::Rejected { state: self.state() });
        }
        self.inner.stop().await?;
        Ok(CommandOutcome::Completed)
    }

    /// Stores the new listen setting; a running companion whose setting
    /// changed is restarted with it.
    pub async fn toggle_listen_port(&self, enabled: bool, port: u32) -> Result<CommandOutcome, ServerError> {
        let config = ListenConfig::new(enabled, port)?;
        let Ok(_op) = self.inner.op_lock.try_lock() else {
            return Ok(self.rejected());
        };

        let state = self.state();
        if state.is_transient() {
            return Ok(CommandOutcome::Rejected { state });
        }
        // A running companion is judged by what it was actually started with
        let previous = self.listen_config();
        let effective = match state {
            ServerState::Running => self.process_info().map(|p| p.listen).unwrap_or(previous),
            _ => previous,
        };
        if effective == config {
            if previous != config {
                self.inner.write().listen = config;
                self.inner.notifier.emit(Notification::ListenChanged(config));
            }
            return Ok(CommandOutcome::Completed);
        }

        self.inner.write().listen = config;
        tracing::info!("[Server] listen config -> {:?}", config);
        self.inner.notifier.emit(Notification::ListenChanged(config));

        if state == ServerState::Running {
            if let Err(err) = self.inner.stop().await {
                // Still running with the old setting
                self.inner.write().listen = previous;
                self.inner.notifier.emit(Notification::ListenChanged(previous));
                return Err(err);
            }
            if let Err(state) = self.inner.begin(&[ServerState::Stopped], ServerState::Starting) {
                return Ok(CommandOutcome::Rejected { state });
            }
            Inner::launch(&self.inner).await?;
        }
        Ok(CommandOutcome::Completed)
    }

    fn rejected(&self) -> CommandOutcome {
        let state = self.state();
        tracing::debug!("[Server] command rejected, another operation is in flight ({})", state);
        CommandOutcome::Rejected { state }
    }
}

impl Inner {
    fn read(&self) -> RwLockReadGuard<'_, Shared> {
        self.shared.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Shared> {
        self.shared.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enters `to` if the current state is one of `from`; returns the
    /// current state otherwise.
    fn begin(&self, from: &[ServerState], to: ServerState) -> Result<(), ServerState> {
        {
            let mut shared = self.write();
            let current = shared.machine.state();
            if !from.contains(&current) || shared.machine.transition(to).is_err() {
                return Err(current);
            }
            shared.last_error = None;
        }
        self.notifier.emit(Notification::StateChanged { state: to, error: None });
        Ok(())
    }

    /// Moves to a stable state and records the outcome.
    fn finish(&self, to: ServerState, error: Option<ErrorKind>) {
        {
            let mut shared = self.write();
            if let Err(e) = shared.machine.transition(to) {
                tracing::error!("[Server] {}", e);
                return;
            }
            shared.last_error = error;
            if to != ServerState::Running {
                shared.process = None;
            }
        }
        self.notifier.emit(Notification::StateChanged { state: to, error });
    }

    /// Runs the provisioner from `Updating`; lands in `Stopped` or `on_failure`.
    async fn provision(&self, version: Option<&SemVer>, on_failure: ServerState) -> Result<(), ServerError> {
        let notifier = &self.notifier;
        let result = self
            .provisioner
            .provision(version, |snapshot| notifier.emit(Notification::Progress(snapshot)))
            .await;

        match result {
            Ok(installed) => {
                tracing::info!("[Server] frida-server {} installed", installed);
                self.write().installed_version = Some(installed);
                self.finish(ServerState::Stopped, None);
                Ok(())
            }
            Err(e) => {
                let err = ServerError::from(e);
                tracing::warn!("[Server] provisioning failed: {}", err);
                // Whatever is on disk now is what counts
                let on_failure = match self.provisioner.resolver().installed_version() {
                    Some(v) => {
                        self.write().installed_version = Some(v);
                        ServerState::Stopped
                    }
                    None if on_failure == ServerState::NotInstalled => ServerState::NotInstalled,
                    None => {
                        self.write().installed_version = None;
                        ServerState::NotInstalled
                    }
                };
                self.finish(on_failure, Some(err.kind()));
                Err(err)
            }
        }
    }

    /// From `Starting`: spawns the companion and arms the exit monitor.
    async fn launch(inner: &Arc<Inner>) -> Result<(), ServerError> {
        let listen = inner.read().listen;
        match inner.controller.start(listen).await {
            Ok(process) => {
                let info = process.info().clone();
                let exit_rx = process.exit_watch();
                let monitor = CancellationToken::new();
                *inner.running.lock().await = Some(Running {
                    process,
                    monitor: monitor.clone(),
                });
                {
                    let mut shared = inner.write();
                    if let Err(e) = shared.machine.transition(ServerState::Running) {
                        return Err(e.into());
                    }
                    shared.process = Some(info.clone());
                    shared.last_error = None;
                }
                inner.notifier.emit(Notification::StateChanged {
                    state: ServerState::Running,
                    error: None,
                });
                // Armed after Running is visible so an early exit is not dropped.
                spawn_monitor(Arc::downgrade(inner), exit_rx, info.generation, monitor);
                Ok(())
            }
            Err(err) => {
                inner.finish(ServerState::Stopped, Some(err.kind()));
                Err(err)
            }
        }
    }

    /// From `Running`: `Stopping → Stopped`, or back to `Running` if the
    /// process could not be confirmed dead.
    async fn stop(self: &Arc<Self>) -> Result<(), ServerError> {
        if let Err(state) = self.begin(&[ServerState::Running], ServerState::Stopping) {
            return Err(ServerError::Process(format!("cannot stop while {}", state)));
        }

        let running = self.running.lock().await.take();
        let Some(running) = running else {
            self.finish(ServerState::Stopped, None);
            return Ok(());
        };
        running.monitor.cancel();

        match self.controller.kill(&running.process).await {
            Ok(()) => {
                self.finish(ServerState::Stopped, None);
                Ok(())
            }
            Err(err) => {
                tracing::error!("[Server] {}", err);
                let exit_rx = running.process.exit_watch();
                let generation = running.process.info().generation;
                let monitor = CancellationToken::new();
                *self.running.lock().await = Some(Running {
                    process: running.process,
                    monitor: monitor.clone(),
                });
                self.finish(ServerState::Running, Some(err.kind()));
                spawn_monitor(Arc::downgrade(self), exit_rx, generation, monitor);
                Err(err)
            }
        }
    }

    /// The companion died without being asked to.
    async fn on_unexpected_exit(&self, generation: u64, description: &str) {
        {
            let mut shared = self.write();
            let current = shared.process.as_ref().map(|p| p.generation);
            if shared.machine.state() != ServerState::Running || current != Some(generation) {
                return;
            }
            if let Err(e) = shared.machine.transition(ServerState::Stopped) {
                tracing::error!("[Server] {}", e);
                return;
            }
            shared.process = None;
            shared.last_error = Some(ErrorKind::Process);
        }
        tracing::warn!("[Server] frida-server exited unexpectedly ({})", description);
        self.notifier.emit(Notification::StateChanged {
            state: ServerState::Stopped,
            error: Some(ErrorKind::Process),
        });

        let mut slot = self.running.lock().await;
        if slot.as_ref().map(|r| r.process.info().generation) == Some(generation) {
            slot.take();
        }
    }
}

fn spawn_monitor(
    inner: Weak<Inner>,
    mut exit_rx: watch::Receiver<Option<ExitInfo>>,
    generation: u64,
    token: CancellationToken,
) {
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {
                tracing::debug!("[Monitor] generation {} cancelled", generation);
            }
            exit = process::wait_for_exit(&mut exit_rx) => {
                if let Some(inner) = inner.upgrade() {
                    inner.on_unexpected_exit(generation, &exit.description).await;
                }
            }
        }
    });
}
