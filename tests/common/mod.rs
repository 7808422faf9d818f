//! 통합 테스트 공용 도구 — 모킹 릴리스 서버, 가짜 frida-server 스크립트, 알림 기록기
#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path as UrlPath, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use sha2::{Digest, Sha256};

use frida_mgr::server::{PrivilegeMode, Subscription};
use frida_mgr::updater::{Arch, InstallLayout, SemVer};
use frida_mgr::{FridaServer, Notification, ServerOptions, ServerState};

pub const PLATFORM: &str = "android";
pub const ARCH: Arch = Arch::Arm64;

// ═══════════════════════════════════════════════════════
// 모킹 GitHub 릴리스 서버
// ═══════════════════════════════════════════════════════

#[derive(Clone)]
pub struct MockAsset {
    pub name: String,
    pub data: Vec<u8>,
    /// Content-Length 없이 청크 전송
    pub chunked: bool,
}

impl MockAsset {
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self { name: name.into(), data, chunked: false }
    }

    pub fn chunked(mut self) -> Self {
        self.chunked = true;
        self
    }
}

#[derive(Clone)]
pub struct MockRelease {
    pub tag: String,
    pub assets: Vec<MockAsset>,
}

impl MockRelease {
    pub fn new(tag: &str) -> Self {
        Self { tag: tag.to_string(), assets: Vec::new() }
    }

    pub fn asset(mut self, asset: MockAsset) -> Self {
        self.assets.push(asset);
        self
    }
}

struct MockState {
    addr: SocketAddr,
    /// 첫 번째가 latest
    releases: Vec<MockRelease>,
}

impl MockState {
    fn release_json(&self, release: &MockRelease) -> serde_json::Value {
        let assets: Vec<_> = release
            .assets
            .iter()
            .map(|a| {
                json!({
                    "name": a.name,
                    "size": a.data.len(),
                    "browser_download_url": format!("http://{}/download/{}/{}", self.addr, release.tag, a.name),
                    "content_type": "application/octet-stream"
                })
            })
            .collect();
        json!({
            "tag_name": release.tag,
            "name": format!("Frida {}", release.tag),
            "prerelease": false,
            "draft": false,
            "published_at": "2026-02-13T00:00:00Z",
            "assets": assets,
        })
    }
}

pub struct MockReleaseServer {
    pub addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl MockReleaseServer {
    pub async fn start(releases: Vec<MockRelease>) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(MockState { addr, releases });

        let app = Router::new()
            .route("/repos/:owner/:repo/releases/latest", get(latest))
            .route("/repos/:owner/:repo/releases/tags/:tag", get(by_tag))
            .route("/download/:tag/:name", get(download))
            .with_state(state);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, handle }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

impl Drop for MockReleaseServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn latest(State(state): State<Arc<MockState>>) -> Response {
    match state.releases.first() {
        Some(release) => Json(state.release_json(release)).into_response(),
        None => (StatusCode::NOT_FOUND, "Not Found").into_response(),
    }
}

async fn by_tag(
    State(state): State<Arc<MockState>>,
    UrlPath((_owner, _repo, tag)): UrlPath<(String, String, String)>,
) -> Response {
    match state.releases.iter().find(|r| r.tag == tag) {
        Some(release) => Json(state.release_json(release)).into_response(),
        None => (StatusCode::NOT_FOUND, "Not Found").into_response(),
    }
}

async fn download(
    State(state): State<Arc<MockState>>,
    UrlPath((tag, name)): UrlPath<(String, String)>,
) -> Response {
    let asset = state
        .releases
        .iter()
        .find(|r| r.tag == tag)
        .and_then(|r| r.assets.iter().find(|a| a.name == name))
        .cloned();
    match asset {
        Some(asset) if asset.chunked => {
            let chunks: Vec<Result<Vec<u8>, std::io::Error>> =
                asset.data.chunks(16 * 1024).map(|c| Ok(c.to_vec())).collect();
            let body = Body::from_stream(futures_util::stream::iter(chunks));
            (StatusCode::OK, [("content-type", "application/octet-stream")], body).into_response()
        }
        Some(asset) => (StatusCode::OK, [("content-type", "application/octet-stream")], asset.data).into_response(),
        None => (StatusCode::NOT_FOUND, "Not Found").into_response(),
    }
}

// ═══════════════════════════════════════════════════════
// 에셋 빌더
// ═══════════════════════════════════════════════════════

pub fn asset_name(version: &str, suffix: &str) -> String {
    format!("frida-server-{}-{}-{}{}", version, PLATFORM, ARCH.tag(), suffix)
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn sha256sums(entries: &[(&str, &[u8])]) -> MockAsset {
    let content: String = entries
        .iter()
        .map(|(name, data)| format!("{}  {}\n", sha256_hex(data), name))
        .collect();
    MockAsset::new("SHA256SUMS", content.into_bytes())
}

/// 결정적인 의사 난수 바이트 (압축이 잘 안 되도록)
pub fn payload(len: usize, seed: u8) -> Vec<u8> {
    let mut state = seed as u32 | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect()
}

// ═══════════════════════════════════════════════════════
// 가짜 frida-server
// ═══════════════════════════════════════════════════════

/// 계속 살아 있는 frida-server
pub const LONG_RUNNING: &str = "echo \"frida-server ready\"\nexec sleep 30\n";

/// `--listen`이 붙으면 바인드 실패로 즉시 종료
pub const FAILS_ON_LISTEN: &str = r#"for arg in "$@"; do
  if [ "$arg" = "--listen" ]; then
    echo "Unable to start server: Error binding to address 0.0.0.0: Address already in use" >&2
    exit 1
  fi
done
exec sleep 30
"#;

/// 인자를 args.txt에 기록하고 계속 실행
pub const RECORDS_ARGS: &str = "echo \"$@\" > \"$(dirname \"$0\")/args.txt\"\nexec sleep 30\n";

/// 출력 파이프를 물려받은 손자 프로세스를 남긴다
pub const SPAWNS_GRANDCHILD: &str = "sleep 30 &\necho \"frida-server ready\"\nexec sleep 30\n";

/// SIGTERM을 무시한다 (SIGKILL로만 종료)
pub const IGNORES_TERM: &str = "trap '' TERM\nwhile true; do sleep 1; done\n";

pub fn script(body: &str) -> Vec<u8> {
    format!("#!/bin/sh\n{}", body).into_bytes()
}

/// 네트워크 없이 설치된 상태 만들기
#[cfg(unix)]
pub fn preinstall(root: &Path, version: &str, body: &str) {
    use std::os::unix::fs::PermissionsExt;

    let layout = InstallLayout::new(root);
    std::fs::write(layout.binary_path(), script(body)).unwrap();
    std::fs::set_permissions(layout.binary_path(), std::fs::Permissions::from_mode(0o755)).unwrap();
    layout
        .write_installed_version(&SemVer::parse(version).unwrap())
        .unwrap();
}

pub fn options(root: &Path, base_url: &str) -> ServerOptions {
    let mut options = ServerOptions::new(root);
    options.release.api_base_url = Some(base_url.to_string());
    options.release.platform = PLATFORM.to_string();
    options.release.arch = Some(ARCH);
    options.release.http_timeout = Duration::from_secs(5);
    options.download_timeout = Duration::from_secs(10);
    options.process.privilege = PrivilegeMode::None;
    options.process.startup_grace = Duration::from_millis(300);
    options.process.kill_grace = Duration::from_secs(2);
    options.process.kill_confirm = Duration::from_secs(2);
    options
}

/// 릴리스 서버가 필요 없는 라이프사이클 테스트용
pub fn offline_options(root: &Path) -> ServerOptions {
    options(root, "http://127.0.0.1:9")
}

// ═══════════════════════════════════════════════════════
// 알림 기록
// ═══════════════════════════════════════════════════════

pub struct Recorder {
    events: Arc<Mutex<Vec<Notification>>>,
    _sub: Subscription,
}

impl Recorder {
    pub fn attach(server: &FridaServer) -> Self {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let sub = server.subscribe(move |n| sink.lock().unwrap().push(n.clone()));
        Self { events, _sub: sub }
    }

    pub fn all(&self) -> Vec<Notification> {
        self.events.lock().unwrap().clone()
    }

    pub fn states(&self) -> Vec<ServerState> {
        self.all()
            .into_iter()
            .filter_map(|n| match n {
                Notification::StateChanged { state, .. } => Some(state),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

pub async fn wait_for_state(server: &FridaServer, state: ServerState, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if server.state() == state {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    server.state() == state
}
