//! 프로비저닝 에러 타입
//!
//! ## 지원하는 에러 상황
//! - 네트워크 끊김 / 타임아웃 / API 응답 오류
//! - 디바이스 아키텍처에 맞는 빌드 없음
//! - 다운로드 중단
//! - 무결성 검증 실패 (빈 파일, 해시 불일치, 손상된 압축)
//! - 파일 시스템 오류

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// 업데이터 에러 타입
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "details")]
pub enum UpdaterError {
    /// 네트워크 연결 실패
    Network {
        message: String,
        recoverable: bool,
    },
    /// HTTP 요청 타임아웃
    Timeout {
        operation: String,
        duration_secs: u64,
    },
    /// API 응답 오류
    Api {
        status_code: u16,
        message: String,
    },
    /// 현재 아키텍처용 에셋이 릴리스에 없음
    NoCompatibleBuild {
        arch: String,
        version: Option<String>,
    },
    /// 다운로드 중단됨
    Download {
        message: String,
        downloaded_bytes: u64,
        total_bytes: Option<u64>,
    },
    /// 검증 실패 (해시 불일치, 빈 바이너리, 손상된 압축)
    Integrity {
        artifact: String,
        expected: String,
        actual: String,
    },
    /// 파일 시스템 오류
    FileSystem {
        operation: String,
        path: String,
        message: String,
    },
    /// 설정 오류
    Config {
        message: String,
    },
}

impl fmt::Display for UpdaterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdaterError::Network { message, .. } => {
                write!(f, "Network error: {}", message)
            }
            UpdaterError::Timeout { operation, duration_secs } => {
                write!(f, "Timeout after {}s: {}", duration_secs, operation)
            }
            UpdaterError::Api { status_code, message } => {
                write!(f, "API error ({}): {}", status_code, message)
            }
            UpdaterError::NoCompatibleBuild { arch, version } => match version {
                Some(v) => write!(f, "No frida-server {} build for architecture '{}'", v, arch),
                None => write!(f, "No frida-server build for architecture '{}'", arch),
            },
            UpdaterError::Download { message, downloaded_bytes, total_bytes } => match total_bytes {
                Some(total) => write!(
                    f,
                    "Download failed after {}/{} bytes: {}",
                    downloaded_bytes, total, message
                ),
                None => write!(f, "Download failed after {} bytes: {}", downloaded_bytes, message),
            },
            UpdaterError::Integrity { artifact, expected, actual } => {
                write!(
                    f,
                    "Integrity check failed for {}: expected {}, got {}",
                    artifact, expected, actual
                )
            }
            UpdaterError::FileSystem { operation, path, message } => {
                write!(f, "File system error during {} on '{}': {}", operation, path, message)
            }
            UpdaterError::Config { message } => {
                write!(f, "Configuration error: {}", message)
            }
        }
    }
}

impl std::error::Error for UpdaterError {}

impl UpdaterError {
    /// 호출자가 그대로 재시도해도 되는 에러인지
    pub fn is_recoverable(&self) -> bool {
        match self {
            UpdaterError::Network { recoverable, .. } => *recoverable,
            UpdaterError::Timeout { .. } => true,
            // 5xx 에러는 재시도 가능, 4xx는 불가능
            UpdaterError::Api { status_code, .. } => *status_code >= 500,
            UpdaterError::Download { .. } => true,
            UpdaterError::NoCompatibleBuild { .. } => false,
            UpdaterError::Integrity { .. } => false,
            UpdaterError::FileSystem { .. } => false,
            UpdaterError::Config { .. } => false,
        }
    }

    /// 머신 리더블 에러 코드
    pub fn error_code(&self) -> &'static str {
        match self {
            UpdaterError::Network { .. } => "NETWORK_ERROR",
            UpdaterError::Timeout { .. } => "TIMEOUT",
            UpdaterError::Api { .. } => "API_ERROR",
            UpdaterError::NoCompatibleBuild { .. } => "NO_COMPATIBLE_BUILD",
            UpdaterError::Download { .. } => "DOWNLOAD_ERROR",
            UpdaterError::Integrity { .. } => "INTEGRITY_ERROR",
            UpdaterError::FileSystem { .. } => "FILESYSTEM_ERROR",
            UpdaterError::Config { .. } => "CONFIG_ERROR",
        }
    }

    /// reqwest 에러를 UpdaterError로 변환
    pub fn from_reqwest(err: &reqwest::Error, operation: &str, timeout_secs: u64) -> Self {
        if err.is_timeout() {
            UpdaterError::Timeout {
                operation: operation.to_string(),
                duration_secs: timeout_secs,
            }
        } else if err.is_connect() {
            UpdaterError::Network {
                message: format!("{}: connection failed", operation),
                recoverable: true,
            }
        } else if let Some(status) = err.status() {
            UpdaterError::Api {
                status_code: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            UpdaterError::Network {
                message: format!("{}: {}", operation, err),
                recoverable: err.is_request() || err.is_body(),
            }
        }
    }

    /// IO 에러를 UpdaterError로 변환
    pub fn from_io(err: &std::io::Error, operation: &str, path: &Path) -> Self {
        UpdaterError::FileSystem {
            operation: operation.to_string(),
            path: path.display().to_string(),
            message: err.to_string(),
        }
    }
}
