//! # frida-mgr 업데이터 라이브러리
//!
//! frida-server 바이너리를 디바이스 아키텍처에 맞춰 찾고, 받고, 설치한다.
//!
//! ## 구성
//! - **arch.rs**: 실행 중인 CPU → 릴리스 에셋 태그
//! - **version.rs**: 시맨틱 버전 파싱/비교
//! - **github.rs**: GitHub 릴리스 API 클라이언트, `SHA256SUMS` 파싱
//! - **resolver.rs**: 설치 버전 vs 최신 버전 판정
//! - **download.rs**: 스트리밍 다운로드 + 진행률 (`DownloadState`)
//! - **install.rs**: 검증, 압축 해제, 원자적 교체, 버전 마커
//! - **error.rs**: 네트워크/무결성/파일시스템 에러 분류
//!
//! ## 릴리스 에셋 규칙
//! ```text
//! frida-server-<version>-<platform>-<arch>[.gz|.zip|.xz]
//! ```
//! 예: `frida-server-16.1.0-android-arm64.xz`

pub mod arch;
pub mod download;
pub mod error;
pub mod github;
pub mod install;
pub mod resolver;
pub mod version;

pub use arch::Arch;
pub use download::{DownloadSnapshot, DownloadState};
pub use error::UpdaterError;
pub use github::{Compression, GitHubClient, GitHubRelease, ResolvedArtifact};
pub use install::{InstallLayout, Provisioner, BINARY_NAME, VERSION_MARKER};
pub use resolver::VersionResolver;
pub use version::SemVer;
