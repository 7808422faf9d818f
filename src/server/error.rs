//! 서버 라이프사이클 에러 타입 — 알림에는 `ErrorKind`만 실리고
//! 상세 내용은 명령의 `Result`로 돌아간다.

use serde::{Deserialize, Serialize};

use crate::server::state_machine::TransitionError;
use crate::updater::UpdaterError;

/// 라이프사이클 명령 중 발생할 수 있는 에러
#[derive(thiserror::Error, Debug)]
pub enum ServerError {
    #[error("{0}")]
    Updater(#[from] UpdaterError),

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("Port {port} is already in use")]
    Bind { port: u16 },

    #[error("frida-server failed: {0}")]
    Process(String),

    #[error("Invalid port {0}: must be between 1 and 65535")]
    InvalidPort(u32),

    #[error("frida-server is not installed")]
    NotInstalled,

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

/// 알림/스냅샷에 실리는 에러 분류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    NoCompatibleBuild,
    Download,
    Integrity,
    FileSystem,
    Permission,
    Bind,
    Process,
    InvalidPort,
    NotInstalled,
    Internal,
}

impl ServerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Updater(err) => match err {
                UpdaterError::Network { .. } | UpdaterError::Timeout { .. } | UpdaterError::Api { .. } => {
                    ErrorKind::Network
                }
                UpdaterError::NoCompatibleBuild { .. } => ErrorKind::NoCompatibleBuild,
                UpdaterError::Download { .. } => ErrorKind::Download,
                UpdaterError::Integrity { .. } => ErrorKind::Integrity,
                UpdaterError::FileSystem { .. } => ErrorKind::FileSystem,
                UpdaterError::Config { .. } => ErrorKind::Internal,
            },
            Self::Permission(_) => ErrorKind::Permission,
            Self::Bind { .. } => ErrorKind::Bind,
            Self::Process(_) => ErrorKind::Process,
            Self::InvalidPort(_) => ErrorKind::InvalidPort,
            Self::NotInstalled => ErrorKind::NotInstalled,
            Self::Transition(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// 머신 리더블 에러 코드
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Updater(err) => err.error_code(),
            Self::Permission(_) => "PERMISSION_DENIED",
            Self::Bind { .. } => "PORT_IN_USE",
            Self::Process(_) => "PROCESS_ERROR",
            Self::InvalidPort(_) => "INVALID_PORT",
            Self::NotInstalled => "NOT_INSTALLED",
            Self::Transition(_) => "INVALID_TRANSITION",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// JSON 에러 응답 생성
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": self.to_string(),
            "error_code": self.error_code(),
            "kind": self.kind(),
        })
    }
}
