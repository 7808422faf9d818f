//! 명령 실행 풀 — 라이프사이클 명령을 소수의 tokio 워커에서 처리
//!
//! ## 아키텍처
//! - `CommandPool`: 제한된 mpsc 큐 + 2~4개 워커 태스크
//! - 호출자는 `submit`으로 명령을 넣고 즉시 돌아간다 (결과는 알림으로 수신)
//! - 동시에 두 명령이 실행돼도 `FridaServer`의 단일 실행 토큰이 하나를 거절한다

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::server::{CommandOutcome, FridaServer};
use crate::updater::SemVer;

pub const MIN_WORKERS: usize = 2;
pub const MAX_WORKERS: usize = 4;
pub const DEFAULT_QUEUE_DEPTH: usize = 16;

/// 워커가 실행할 명령
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerCommand {
    Install { version: Option<SemVer> },
    Update,
    Start,
    Kill,
    ToggleListenPort { enabled: bool, port: u32 },
}

impl ServerCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Install { .. } => "install",
            Self::Update => "update",
            Self::Start => "start",
            Self::Kill => "kill",
            Self::ToggleListenPort { .. } => "toggle_listen_port",
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("command queue is full")]
    Full,
    #[error("command pool is shut down")]
    Closed,
}

pub struct CommandPool {
    task_tx: mpsc::Sender<ServerCommand>,
    workers: Vec<JoinHandle<()>>,
}

impl CommandPool {
    /// 워커 수는 `[MIN_WORKERS, MAX_WORKERS]`로 보정
    pub fn spawn(server: FridaServer, workers: usize, queue_depth: usize) -> Self {
        let workers = workers.clamp(MIN_WORKERS, MAX_WORKERS);
        let (task_tx, task_rx) = mpsc::channel::<ServerCommand>(queue_depth.max(1));
        let task_rx = Arc::new(Mutex::new(task_rx));

        let handles = (0..workers)
            .map(|id| {
                let server = server.clone();
                let rx = task_rx.clone();
                tokio::spawn(async move {
                    worker_loop(id, server, rx).await;
                })
            })
            .collect();

        tracing::info!("[Pool] started {} workers (queue {})", workers, queue_depth.max(1));
        Self { task_tx, workers: handles }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// 큐에 넣기만 하고 실행을 기다리지 않는다
    pub fn submit(&self, command: ServerCommand) -> Result<(), PoolError> {
        self.task_tx.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PoolError::Full,
            mpsc::error::TrySendError::Closed(_) => PoolError::Closed,
        })
    }

    /// 큐를 닫고 남은 명령이 끝날 때까지 대기
    pub async fn shutdown(self) {
        drop(self.task_tx);
        for handle in self.workers {
            if let Err(e) = handle.await {
                tracing::warn!("[Pool] worker panicked: {}", e);
            }
        }
        tracing::info!("[Pool] stopped");
    }
}

async fn worker_loop(id: usize, server: FridaServer, rx: Arc<Mutex<mpsc::Receiver<ServerCommand>>>) {
    loop {
        // 수신 대기 중에만 잠금을 잡는다
        let command = { rx.lock().await.recv().await };
        let Some(command) = command else {
            break;
        };
        run_command(id, &server, command).await;
    }
    tracing::debug!("[Pool] worker {} exiting", id);
}

async fn run_command(id: usize, server: &FridaServer, command: ServerCommand) {
    let name = command.name();
    tracing::debug!("[Pool] worker {} running {}", id, name);
    let result = match command {
        ServerCommand::Install { version } => server.install_version(version).await,
        ServerCommand::Update => server.update().await,
        ServerCommand::Start => server.start().await,
        ServerCommand::Kill => server.kill().await,
        ServerCommand::ToggleListenPort { enabled, port } => server.toggle_listen_port(enabled, port).await,
    };
    match result {
        Ok(CommandOutcome::Completed) => tracing::info!("[Pool] {} completed", name),
        Ok(CommandOutcome::UpToDate) => tracing::info!("[Pool] {}: already up to date", name),
        Ok(CommandOutcome::Rejected { state }) => {
            tracing::info!("[Pool] {} ignored while {}", name, state)
        }
        Err(e) => tracing::warn!("[Pool] {} failed [{}]: {}", name, e.error_code(), e),
    }
}
