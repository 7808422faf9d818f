//! 설치된 버전 vs 릴리스 최신 버전

use crate::arch::Arch;
use crate::error::UpdaterError;
use crate::github::{GitHubClient, ResolvedArtifact};
use crate::install::InstallLayout;
use crate::version::SemVer;

/// 설치 마커와 원격 릴리스 인덱스를 함께 보는 버전 판정기
#[derive(Clone)]
pub struct VersionResolver {
    layout: InstallLayout,
    client: GitHubClient,
    platform: String,
    arch: Option<Arch>,
}

impl VersionResolver {
    /// `arch`가 `None`이면 실행 중인 디바이스에서 감지한다
    pub fn new(layout: InstallLayout, client: GitHubClient, platform: &str, arch: Option<Arch>) -> Self {
        Self {
            layout,
            client,
            platform: platform.to_string(),
            arch,
        }
    }

    pub fn client(&self) -> &GitHubClient {
        &self.client
    }

    pub fn layout(&self) -> &InstallLayout {
        &self.layout
    }

    pub fn arch(&self) -> Result<Arch, UpdaterError> {
        match self.arch {
            Some(arch) => Ok(arch),
            None => Arch::detect(),
        }
    }

    /// 디스크의 버전 마커. 마커나 바이너리 중 하나라도 없으면 `None`
    pub fn installed_version(&self) -> Option<SemVer> {
        self.layout.read_installed_version()
    }

    /// 이 디바이스 아키텍처용 에셋이 있는 최신 릴리스 버전
    pub async fn latest_version(&self) -> Result<SemVer, UpdaterError> {
        Ok(self.resolve_artifact(None).await?.version)
    }

    /// 설치본보다 엄격히 새로운 버전이 있을 때만 `Some`
    pub async fn check_for_update(&self) -> Result<Option<SemVer>, UpdaterError> {
        let latest = self.latest_version().await?;
        let update = match self.installed_version() {
            Some(installed) if !latest.is_newer_than(&installed) => None,
            _ => Some(latest),
        };
        tracing::info!(
            "[Resolver] installed={:?} update={:?}",
            self.installed_version().map(|v| v.to_string()),
            update.as_ref().map(|v| v.to_string())
        );
        Ok(update)
    }

    /// 다운로드할 에셋 결정. `version`이 `None`이면 최신 릴리스
    pub async fn resolve_artifact(&self, version: Option<&SemVer>) -> Result<ResolvedArtifact, UpdaterError> {
        let arch = self.arch()?;
        let release = match version {
            Some(v) => self.client.fetch_release_by_tag(&v.to_string()).await?,
            None => self.client.fetch_latest_release().await?,
        };
        let artifact = release.find_artifact(&self.platform, arch)?;
        tracing::debug!(
            "[Resolver] {} {} → {}",
            release.tag_name,
            arch,
            artifact.asset_name
        );
        Ok(artifact)
    }
}
