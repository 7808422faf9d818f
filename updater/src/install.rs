//! 바이너리 프로비저닝: 다운로드 → 검증 → 압축 해제 → 원자적 교체 → 버전 마커
//!
//! ## 디렉터리 구조 (`root` 기준)
//! - `frida-server` — 설치된 실행 파일
//! - `frida-server.version` — 설치 버전 마커 (모든 단계 성공 후에만 기록)
//! - `.staging/` — 다운로드/압축 해제 임시 파일
//!
//! 어느 단계에서 실패해도 기존 바이너리와 마커는 그대로 남는다.

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::download::{download_to_file, DownloadSnapshot, DownloadState};
use crate::error::UpdaterError;
use crate::github::{parse_sha256sums, Compression, ResolvedArtifact};
use crate::resolver::VersionResolver;
use crate::version::SemVer;

pub const BINARY_NAME: &str = "frida-server";
pub const VERSION_MARKER: &str = "frida-server.version";
pub const STAGING_DIR: &str = ".staging";

/// 앱 전용 디렉터리 안의 설치 경로 모음
#[derive(Debug, Clone)]
pub struct InstallLayout {
    root: PathBuf,
}

impl InstallLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn binary_path(&self) -> PathBuf {
        self.root.join(BINARY_NAME)
    }

    pub fn marker_path(&self) -> PathBuf {
        self.root.join(VERSION_MARKER)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    /// 바이너리와 마커가 모두 있을 때만 설치된 것으로 본다
    pub fn read_installed_version(&self) -> Option<SemVer> {
        if !self.binary_path().is_file() {
            return None;
        }
        let raw = fs::read_to_string(self.marker_path()).ok()?;
        let version = SemVer::parse(&raw);
        if version.is_none() {
            tracing::warn!("[Install] Ignoring unreadable version marker: {:?}", raw.trim());
        }
        version
    }

    /// 마커 기록 (임시 파일 → rename)
    pub fn write_installed_version(&self, version: &SemVer) -> Result<(), UpdaterError> {
        let marker = self.marker_path();
        let tmp = self.root.join(format!("{}.tmp", VERSION_MARKER));
        fs::write(&tmp, format!("{}\n", version))
            .map_err(|e| UpdaterError::from_io(&e, "write version marker", &tmp))?;
        fs::rename(&tmp, &marker).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            UpdaterError::from_io(&e, "activate version marker", &marker)
        })
    }
}

/// 실패/성공 여부와 관계없이 스테이징 파일을 지운다
struct StagingGuard {
    paths: Vec<PathBuf>,
}

impl StagingGuard {
    fn new() -> Self {
        Self { paths: Vec::new() }
    }

    fn track(&mut self, path: PathBuf) -> PathBuf {
        self.paths.push(path.clone());
        path
    }
}

impl Drop for StagingGuard {
    fn drop(&mut self) {
        for path in &self.paths {
            if path.exists() {
                if let Err(e) = fs::remove_file(path) {
                    tracing::warn!("[Install] Failed to clean {}: {}", path.display(), e);
                }
            }
        }
    }
}

/// 진행률 표시를 작업 종료 시 항상 내린다
struct ProgressGuard<'a>(&'a DownloadState);

impl Drop for ProgressGuard<'_> {
    fn drop(&mut self) {
        self.0.finish();
    }
}

/// frida-server 바이너리를 받아서 설치하는 프로비저너
pub struct Provisioner {
    resolver: VersionResolver,
    state: Arc<DownloadState>,
    download_timeout: Duration,
}

impl Provisioner {
    pub fn new(resolver: VersionResolver, download_timeout: Duration) -> Self {
        Self {
            resolver,
            state: Arc::new(DownloadState::new()),
            download_timeout,
        }
    }

    pub fn resolver(&self) -> &VersionResolver {
        &self.resolver
    }

    pub fn layout(&self) -> &InstallLayout {
        self.resolver.layout()
    }

    /// 다운로드 진행 상태 (읽기 전용으로 공유)
    pub fn download_state(&self) -> Arc<DownloadState> {
        self.state.clone()
    }

    /// 지정 버전(없으면 최신)을 설치하고 설치된 버전을 반환
    pub async fn provision<F>(&self, version: Option<&SemVer>, on_progress: F) -> Result<SemVer, UpdaterError>
    where
        F: FnMut(DownloadSnapshot),
    {
        self.state.begin();
        let _progress = ProgressGuard(&self.state);

        let artifact = self.resolver.resolve_artifact(version).await?;
        self.provision_artifact(&artifact, on_progress).await?;
        Ok(artifact.version)
    }

    /// 이미 결정된 에셋으로 설치 (`provision`의 나머지 단계)
    async fn provision_artifact<F>(&self, artifact: &ResolvedArtifact, on_progress: F) -> Result<(), UpdaterError>
    where
        F: FnMut(DownloadSnapshot),
    {
        let layout = self.layout();
        let staging = layout.staging_dir();
        fs::create_dir_all(&staging)
            .map_err(|e| UpdaterError::from_io(&e, "create staging dir", &staging))?;

        let id = uuid::Uuid::new_v4();
        let mut guard = StagingGuard::new();
        let download_path = guard.track(staging.join(format!("{}.download", id)));
        let binary_path = guard.track(staging.join(format!("{}.bin", id)));
        let backup_path = guard.track(staging.join(format!("{}.old", id)));

        tracing::info!(
            "[Install] Provisioning frida-server {} from {}",
            artifact.version,
            artifact.asset_name
        );

        let outcome = download_to_file(
            self.resolver.client().http(),
            &artifact.download_url,
            &download_path,
            &self.state,
            self.download_timeout,
            on_progress,
        )
        .await?;

        if let Some(url) = &artifact.checksums_url {
            let sums = self.resolver.client().fetch_text(url).await?;
            match parse_sha256sums(&sums, &artifact.asset_name) {
                Some(expected) if expected != outcome.sha256 => {
                    return Err(UpdaterError::Integrity {
                        artifact: artifact.asset_name.clone(),
                        expected,
                        actual: outcome.sha256,
                    });
                }
                Some(_) => tracing::info!("[Install] SHA256 verified for {}", artifact.asset_name),
                None => tracing::warn!(
                    "[Install] {} has no entry in SHA256SUMS, skipping checksum",
                    artifact.asset_name
                ),
            }
        }

        let compression = artifact.compression;
        let asset_name = artifact.asset_name.clone();
        let (src, dst) = (download_path.clone(), binary_path.clone());
        tokio::task::spawn_blocking(move || unpack(compression, &asset_name, &src, &dst))
            .await
            .map_err(|e| UpdaterError::FileSystem {
                operation: "unpack".to_string(),
                path: binary_path.display().to_string(),
                message: e.to_string(),
            })??;

        let size = fs::metadata(&binary_path)
            .map_err(|e| UpdaterError::from_io(&e, "stat unpacked binary", &binary_path))?
            .len();
        if size == 0 {
            return Err(UpdaterError::Integrity {
                artifact: artifact.asset_name.clone(),
                expected: "non-empty binary".to_string(),
                actual: "0 bytes".to_string(),
            });
        }

        mark_executable(&binary_path)?;
        activate(layout, &binary_path, &backup_path, &artifact.version)?;

        tracing::info!(
            "[Install] frida-server {} installed at {} ({} bytes)",
            artifact.version,
            layout.binary_path().display(),
            size
        );
        Ok(())
    }
}

/// 새 바이너리를 제자리로 rename하고 마커를 쓴다. 마커 기록이 실패하면 이전 바이너리를 복원.
fn activate(layout: &InstallLayout, staged: &Path, backup: &Path, version: &SemVer) -> Result<(), UpdaterError> {
    let target = layout.binary_path();
    let had_previous = target.exists();

    if had_previous {
        // 하드링크가 안 되는 파일시스템이면 복사로 대체
        if fs::hard_link(&target, backup).is_err() {
            fs::copy(&target, backup)
                .map_err(|e| UpdaterError::from_io(&e, "back up previous binary", &target))?;
        }
    }

    fs::rename(staged, &target).map_err(|e| UpdaterError::from_io(&e, "activate binary", &target))?;

    if let Err(err) = layout.write_installed_version(version) {
        let restored = if had_previous {
            fs::rename(backup, &target)
        } else {
            fs::remove_file(&target)
        };
        if let Err(e) = restored {
            tracing::error!("[Install] Failed to roll back {}: {}", target.display(), e);
        }
        return Err(err);
    }
    Ok(())
}

fn unpack(compression: Compression, asset_name: &str, src: &Path, dst: &Path) -> Result<(), UpdaterError> {
    let corrupt = |format: &str, e: &dyn std::fmt::Display| UpdaterError::Integrity {
        artifact: asset_name.to_string(),
        expected: format!("valid {} archive", format),
        actual: e.to_string(),
    };

    match compression {
        Compression::None => {
            fs::copy(src, dst).map_err(|e| UpdaterError::from_io(&e, "copy binary", dst))?;
        }
        Compression::Gzip => {
            let input = fs::File::open(src).map_err(|e| UpdaterError::from_io(&e, "open download", src))?;
            let mut decoder = flate2::read::GzDecoder::new(input);
            write_stream(&mut decoder, dst).map_err(|e| match e {
                StreamError::Read(e) => corrupt("gzip", &e),
                StreamError::Write(e) => UpdaterError::from_io(&e, "write binary", dst),
            })?;
        }
        Compression::Zip => {
            let input = fs::File::open(src).map_err(|e| UpdaterError::from_io(&e, "open download", src))?;
            let mut archive = zip::ZipArchive::new(input).map_err(|e| corrupt("zip", &e))?;
            let index = pick_zip_entry(&mut archive).ok_or_else(|| UpdaterError::Integrity {
                artifact: asset_name.to_string(),
                expected: format!("{} inside zip", BINARY_NAME),
                actual: format!("{} entries without a server binary", archive.len()),
            })?;
            let mut entry = archive.by_index(index).map_err(|e| corrupt("zip", &e))?;
            write_stream(&mut entry, dst).map_err(|e| match e {
                StreamError::Read(e) => corrupt("zip", &e),
                StreamError::Write(e) => UpdaterError::from_io(&e, "write binary", dst),
            })?;
        }
        Compression::Xz => unpack_xz(asset_name, src, dst)?,
    }
    Ok(())
}

enum StreamError {
    Read(io::Error),
    Write(io::Error),
}

fn write_stream(reader: &mut dyn Read, dst: &Path) -> Result<u64, StreamError> {
    let mut out = fs::File::create(dst).map_err(StreamError::Write)?;
    let mut buf = [0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(StreamError::Read(e)),
        };
        io::Write::write_all(&mut out, &buf[..n]).map_err(StreamError::Write)?;
        total += n as u64;
    }
    out.sync_all().map_err(StreamError::Write)?;
    Ok(total)
}

/// `frida-server*` 이름의 파일 엔트리, 없으면 유일한 파일 엔트리
fn pick_zip_entry<R: Read + io::Seek>(archive: &mut zip::ZipArchive<R>) -> Option<usize> {
    let mut files = Vec::new();
    for i in 0..archive.len() {
        let Ok(entry) = archive.by_index(i) else { continue };
        if entry.is_dir() {
            continue;
        }
        let file_name = Path::new(entry.name())
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if file_name.starts_with(BINARY_NAME) {
            return Some(i);
        }
        files.push(i);
    }
    (files.len() == 1).then(|| files[0])
}

/// xz 해제 도구 후보, 앞에서부터 시도
const XZ_TOOLS: &[(&str, &[&str])] = &[("xz", &["-d", "-c"]), ("xzcat", &[])];

/// xz는 외부 도구로 해제 (`xz -dc`, 없으면 `xzcat`)
fn unpack_xz(asset_name: &str, src: &Path, dst: &Path) -> Result<(), UpdaterError> {
    unpack_xz_with(XZ_TOOLS, asset_name, src, dst)
}

fn unpack_xz_with(
    tools: &[(&str, &[&str])],
    asset_name: &str,
    src: &Path,
    dst: &Path,
) -> Result<(), UpdaterError> {
    let out = fs::File::create(dst).map_err(|e| UpdaterError::from_io(&e, "create binary", dst))?;

    let mut last_err = None;
    for &(program, args) in tools {
        let stdout = out
            .try_clone()
            .map_err(|e| UpdaterError::from_io(&e, "open binary", dst))?;
        let result = std::process::Command::new(program)
            .args(args)
            .arg(src)
            .stdout(stdout)
            .stderr(std::process::Stdio::piped())
            .output();
        match result {
            Ok(output) if output.status.success() => return Ok(()),
            Ok(output) => {
                return Err(UpdaterError::Integrity {
                    artifact: asset_name.to_string(),
                    expected: "valid xz archive".to_string(),
                    actual: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                });
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => last_err = Some(e),
            Err(e) => return Err(UpdaterError::from_io(&e, "run xz", src)),
        }
    }

    let err = last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "xz"));
    Err(UpdaterError::from_io(&err, "find xz decompressor", src))
}

fn mark_executable(path: &Path) -> Result<(), UpdaterError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path)
            .map_err(|e| UpdaterError::from_io(&e, "stat binary", path))?
            .permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms).map_err(|e| UpdaterError::from_io(&e, "chmod binary", path))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}
