//! frida-mgr 설정 파일 (`frida-mgr.toml`)
//!
//! 파일이 없으면 기본값, 형식이 잘못되면 에러. 모든 필드는 생략 가능하다.
//!
//! ```toml
//! workers = 2
//!
//! [release]
//! owner = "frida"
//! repo = "frida"
//! platform = "android"
//! # api_base_url = "https://api.github.com"
//! # arch = "arm64"
//!
//! [process]
//! privilege = "auto"      # none | su | auto
//! startup_grace_ms = 500
//! kill_grace_ms = 3000
//! kill_confirm_ms = 2000
//!
//! [download]
//! timeout_secs = 300
//! http_timeout_secs = 30
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::executor::{DEFAULT_QUEUE_DEPTH, MIN_WORKERS};
use crate::server::{ListenConfig, PrivilegeMode, ReleaseSettings, ServerOptions};
use crate::updater::Arch;

pub const CONFIG_FILE: &str = "frida-mgr.toml";
pub const ROOT_ENV: &str = "FRIDA_MGR_ROOT";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ManagerConfig {
    pub release: ReleaseConfig,
    pub process: ProcessConfig,
    pub download: DownloadConfig,
    pub workers: usize,
    pub queue_depth: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            release: ReleaseConfig::default(),
            process: ProcessConfig::default(),
            download: DownloadConfig::default(),
            workers: MIN_WORKERS,
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ReleaseConfig {
    pub owner: String,
    pub repo: String,
    pub api_base_url: Option<String>,
    pub platform: String,
    /// `arm`, `arm64`, `x86`, `x86_64`; 생략하면 자동 감지
    pub arch: Option<String>,
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        let defaults = ReleaseSettings::default();
        Self {
            owner: defaults.owner,
            repo: defaults.repo,
            api_base_url: None,
            platform: defaults.platform,
            arch: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ProcessConfig {
    pub privilege: PrivilegeMode,
    pub startup_grace_ms: u64,
    pub kill_grace_ms: u64,
    pub kill_confirm_ms: u64,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            privilege: PrivilegeMode::Auto,
            startup_grace_ms: 500,
            kill_grace_ms: 3000,
            kill_confirm_ms: 2000,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct DownloadConfig {
    pub timeout_secs: u64,
    pub http_timeout_secs: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            http_timeout_secs: 30,
        }
    }
}

impl ManagerConfig {
    /// TOML 파일에서 로드 (없으면 기본값)
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("[Config] {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let cfg: Self = toml::from_str(&content)
            .with_context(|| format!("invalid config {}", path.display()))?;
        tracing::info!("[Config] Loaded from {}", path.display());
        Ok(cfg)
    }

    pub fn server_options(&self, root: &Path, listen: ListenConfig) -> Result<ServerOptions> {
        let arch = match self.release.arch.as_deref() {
            Some(tag) => Some(Arch::from_tag(tag).with_context(|| format!("unknown arch '{}'", tag))?),
            None => None,
        };

        let mut options = ServerOptions::new(root);
        options.release = ReleaseSettings {
            owner: self.release.owner.clone(),
            repo: self.release.repo.clone(),
            api_base_url: self.release.api_base_url.clone(),
            platform: self.release.platform.clone(),
            arch,
            http_timeout: Duration::from_secs(self.download.http_timeout_secs),
        };
        options.process.privilege = self.process.privilege;
        options.process.startup_grace = Duration::from_millis(self.process.startup_grace_ms);
        options.process.kill_grace = Duration::from_millis(self.process.kill_grace_ms);
        options.process.kill_confirm = Duration::from_millis(self.process.kill_confirm_ms);
        options.download_timeout = Duration::from_secs(self.download.timeout_secs);
        options.listen = listen;
        Ok(options)
    }
}

/// 데이터 루트 결정: `--root` > `FRIDA_MGR_ROOT` > `~/.frida-mgr`
pub fn resolve_root(explicit: Option<PathBuf>) -> PathBuf {
    if let Some(root) = explicit {
        return root;
    }
    if let Some(root) = std::env::var_os(ROOT_ENV) {
        return PathBuf::from(root);
    }
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".frida-mgr")
}
