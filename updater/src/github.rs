//! GitHub Release API 클라이언트
//!
//! frida 릴리스는 아키텍처별 `frida-server-<버전>-<플랫폼>-<아키텍처>[.xz|.gz|.zip]`
//! 에셋을 포함한다. 릴리스에 `SHA256SUMS` 에셋이 있으면 체크섬 검증에 사용한다.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::arch::{asset_stem, Arch};
use crate::error::UpdaterError;
use crate::version::SemVer;

pub const DEFAULT_API_BASE: &str = "https://api.github.com";
pub const CHECKSUMS_ASSET: &str = "SHA256SUMS";

/// GitHub Release 응답 (필요한 필드만)
#[derive(Debug, Clone, Deserialize)]
pub struct GitHubRelease {
    pub tag_name: String,
    pub name: Option<String>,
    #[serde(default)]
    pub prerelease: bool,
    #[serde(default)]
    pub draft: bool,
    pub published_at: Option<String>,
    #[serde(default)]
    pub assets: Vec<GitHubAsset>,
}

/// GitHub Release Asset
#[derive(Debug, Clone, Deserialize)]
pub struct GitHubAsset {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    pub browser_download_url: String,
}

/// 에셋 압축 형식
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Zip,
    Xz,
}

impl Compression {
    /// 같은 릴리스에 여러 형식이 있을 때의 선호 순서
    const PREFERENCE: [(Compression, &'static str); 4] = [
        (Compression::Gzip, ".gz"),
        (Compression::Zip, ".zip"),
        (Compression::Xz, ".xz"),
        (Compression::None, ""),
    ];

    pub fn suffix(&self) -> &'static str {
        match self {
            Compression::None => "",
            Compression::Gzip => ".gz",
            Compression::Zip => ".zip",
            Compression::Xz => ".xz",
        }
    }
}

/// 특정 버전/아키텍처로 결정된 다운로드 대상
#[derive(Debug, Clone)]
pub struct ResolvedArtifact {
    pub version: SemVer,
    pub release_tag: String,
    pub asset_name: String,
    pub download_url: String,
    /// 릴리스 API가 알려준 크기. 0이면 모름
    pub size: u64,
    pub compression: Compression,
    pub checksums_url: Option<String>,
}

impl GitHubRelease {
    pub fn version(&self) -> Option<SemVer> {
        SemVer::parse(&self.tag_name)
    }

    /// 이 릴리스에서 플랫폼/아키텍처에 맞는 에셋 찾기
    pub fn find_artifact(&self, platform: &str, arch: Arch) -> Result<ResolvedArtifact, UpdaterError> {
        let version = self.version().ok_or_else(|| UpdaterError::Api {
            status_code: 200,
            message: format!("release tag '{}' is not a version", self.tag_name),
        })?;
        let stem = asset_stem(&version.to_string(), platform, arch);

        let found = Compression::PREFERENCE.iter().find_map(|(compression, suffix)| {
            let wanted = format!("{}{}", stem, suffix);
            self.assets
                .iter()
                .find(|a| a.name == wanted)
                .map(|a| (*compression, a))
        });

        let (compression, asset) = found.ok_or_else(|| UpdaterError::NoCompatibleBuild {
            arch: arch.tag().to_string(),
            version: Some(version.to_string()),
        })?;

        let checksums_url = self
            .assets
            .iter()
            .find(|a| a.name == CHECKSUMS_ASSET)
            .map(|a| a.browser_download_url.clone());

        Ok(ResolvedArtifact {
            version,
            release_tag: self.tag_name.clone(),
            asset_name: asset.name.clone(),
            download_url: asset.browser_download_url.clone(),
            size: asset.size,
            compression,
            checksums_url,
        })
    }
}

/// GitHub API 클라이언트
#[derive(Clone)]
pub struct GitHubClient {
    owner: String,
    repo: String,
    http: reqwest::Client,
    /// API 베이스 URL (기본: "https://api.github.com")
    /// 로컬 mock 서버 테스트 시 "http://127.0.0.1:9876" 등으로 오버라이드
    base_url: String,
    timeout: Duration,
}

impl GitHubClient {
    pub fn new(owner: &str, repo: &str) -> Result<Self, UpdaterError> {
        Self::with_base_url(owner, repo, None, Duration::from_secs(30))
    }

    /// base_url을 오버라이드할 수 있는 생성자 (테스트/mock 서버용)
    ///
    /// `timeout`은 개별 API 요청에만 적용된다. 에셋 다운로드 전체 제한은
    /// [`crate::download`]에서 따로 건다.
    pub fn with_base_url(
        owner: &str,
        repo: &str,
        base_url: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, UpdaterError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("frida-mgr/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(timeout)
            .build()
            .map_err(|e| UpdaterError::Config {
                message: format!("failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            owner: owner.to_string(),
            repo: repo.to_string(),
            http,
            base_url: base_url
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(DEFAULT_API_BASE)
                .trim_end_matches('/')
                .to_string(),
            timeout,
        })
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// 최신 릴리스 가져오기 (프리릴리스 제외)
    pub async fn fetch_latest_release(&self) -> Result<GitHubRelease, UpdaterError> {
        let url = format!(
            "{}/repos/{}/{}/releases/latest",
            self.base_url, self.owner, self.repo
        );
        self.get_json(&url, "fetch latest release").await
    }

    /// 태그로 릴리스 가져오기
    pub async fn fetch_release_by_tag(&self, tag: &str) -> Result<GitHubRelease, UpdaterError> {
        let url = format!(
            "{}/repos/{}/{}/releases/tags/{}",
            self.base_url, self.owner, self.repo, tag
        );
        self.get_json(&url, "fetch release").await
    }

    /// 작은 텍스트 에셋 (SHA256SUMS 등)
    pub async fn fetch_text(&self, url: &str) -> Result<String, UpdaterError> {
        let response = self
            .http
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| UpdaterError::from_reqwest(&e, "fetch checksums", self.timeout.as_secs()))?;

        if !response.status().is_success() {
            return Err(UpdaterError::Api {
                status_code: response.status().as_u16(),
                message: format!("failed to download {}", url),
            });
        }

        response
            .text()
            .await
            .map_err(|e| UpdaterError::from_reqwest(&e, "read checksums", self.timeout.as_secs()))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str, operation: &str) -> Result<T, UpdaterError> {
        let secs = self.timeout.as_secs();
        let response = self
            .http
            .get(url)
            .header("Accept", "application/vnd.github+json")
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| UpdaterError::from_reqwest(&e, operation, secs))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(UpdaterError::Api {
                status_code: status.as_u16(),
                message: format!("{}: {}", operation, body),
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| UpdaterError::from_reqwest(&e, operation, secs))
    }
}

/// `SHA256SUMS` 형식(`<hex>  <파일명>`)에서 해시 찾기
pub fn parse_sha256sums(content: &str, asset_name: &str) -> Option<String> {
    content.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        let hash = parts.next()?;
        // `sha256sum -b` 출력의 '*' 접두사 허용
        let name = parts.next()?.trim_start_matches('*');
        (name == asset_name).then(|| hash.to_lowercase())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn release(tag: &str, names: &[&str]) -> GitHubRelease {
        GitHubRelease {
            tag_name: tag.to_string(),
            name: None,
            prerelease: false,
            draft: false,
            published_at: None,
            assets: names
                .iter()
                .map(|n| GitHubAsset {
                    name: n.to_string(),
                    size: 10,
                    browser_download_url: format!("http://localhost/{}", n),
                })
                .collect(),
        }
    }

    #[test]
    fn finds_matching_arch_asset() {
        let r = release(
            "16.1.0",
            &[
                "frida-server-16.1.0-android-arm.xz",
                "frida-server-16.1.0-android-arm64.xz",
                "frida-gadget-16.1.0-android-arm64.so.xz",
            ],
        );
        let art = r.find_artifact("android", Arch::Arm64).unwrap();
        assert_eq!(art.asset_name, "frida-server-16.1.0-android-arm64.xz");
        assert_eq!(art.compression, Compression::Xz);
        assert_eq!(art.version, SemVer::new(16, 1, 0));
        assert!(art.checksums_url.is_none());
    }

    #[test]
    fn prefers_gzip_over_xz() {
        let r = release(
            "16.1.0",
            &[
                "frida-server-16.1.0-android-x86.xz",
                "frida-server-16.1.0-android-x86.gz",
                "SHA256SUMS",
            ],
        );
        let art = r.find_artifact("android", Arch::X86).unwrap();
        assert_eq!(art.compression, Compression::Gzip);
        assert_eq!(art.checksums_url.as_deref(), Some("http://localhost/SHA256SUMS"));
    }

    #[test]
    fn missing_arch_is_no_compatible_build() {
        let r = release("16.1.0", &["frida-server-16.1.0-android-arm.xz"]);
        let err = r.find_artifact("android", Arch::X86_64).unwrap_err();
        assert!(matches!(err, UpdaterError::NoCompatibleBuild { ref arch, .. } if arch == "x86_64"));
    }

    #[test]
    fn x86_does_not_match_x86_64_asset() {
        let r = release("16.1.0", &["frida-server-16.1.0-android-x86_64.gz"]);
        assert!(r.find_artifact("android", Arch::X86).is_err());
    }

    #[test]
    fn parse_release_json() {
        let json = r#"{
            "tag_name": "16.1.0",
            "name": "Frida 16.1.0",
            "prerelease": false,
            "draft": false,
            "published_at": "2023-06-23T00:00:00Z",
            "html_url": "https://github.com/frida/frida/releases/tag/16.1.0",
            "assets": [
                { "name": "frida-server-16.1.0-android-arm64.xz", "size": 1234,
                  "browser_download_url": "https://example.com/a.xz", "content_type": "application/x-xz" }
            ]
        }"#;
        let r: GitHubRelease = serde_json::from_str(json).unwrap();
        assert_eq!(r.version(), Some(SemVer::new(16, 1, 0)));
        assert_eq!(r.assets[0].size, 1234);
    }

    #[test]
    fn sha256sums_lookup() {
        let content = "ABC123  frida-server-16.1.0-android-arm64.gz\n\
                       def456 *frida-server-16.1.0-android-arm.gz\n";
        assert_eq!(
            parse_sha256sums(content, "frida-server-16.1.0-android-arm64.gz").as_deref(),
            Some("abc123")
        );
        assert_eq!(
            parse_sha256sums(content, "frida-server-16.1.0-android-arm.gz").as_deref(),
            Some("def456")
        );
        assert!(parse_sha256sums(content, "frida-server-16.1.0-android-x86.gz").is_none());
    }
}
