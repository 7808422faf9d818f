//! 디바이스 아키텍처 → 릴리스 에셋 태그 매핑

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::UpdaterError;

/// frida 릴리스가 제공하는 아키텍처 태그
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arch {
    Arm,
    Arm64,
    X86,
    X86_64,
}

impl Arch {
    pub const ALL: [Arch; 4] = [Arch::Arm, Arch::Arm64, Arch::X86, Arch::X86_64];

    /// 현재 프로세스가 빌드된 타깃 아키텍처
    pub fn detect() -> Result<Self, UpdaterError> {
        Self::from_rust_arch(std::env::consts::ARCH).ok_or_else(|| {
            UpdaterError::NoCompatibleBuild {
                arch: std::env::consts::ARCH.to_string(),
                version: None,
            }
        })
    }

    /// `std::env::consts::ARCH` 값 기준 변환
    pub fn from_rust_arch(arch: &str) -> Option<Self> {
        match arch {
            "arm" => Some(Arch::Arm),
            "aarch64" => Some(Arch::Arm64),
            "x86" => Some(Arch::X86),
            "x86_64" => Some(Arch::X86_64),
            _ => None,
        }
    }

    /// 에셋 파일명에 쓰이는 태그
    pub fn tag(&self) -> &'static str {
        match self {
            Arch::Arm => "arm",
            Arch::Arm64 => "arm64",
            Arch::X86 => "x86",
            Arch::X86_64 => "x86_64",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.tag() == tag)
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// 에셋 이름 앞부분 — `frida-server-16.1.0-android-arm64`
pub fn asset_stem(version: &str, platform: &str, arch: Arch) -> String {
    format!("frida-server-{}-{}-{}", version, platform, arch.tag())
}
