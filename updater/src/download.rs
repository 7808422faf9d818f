//! 스트리밍 다운로드 + 진행률 추적
//!
//! `DownloadState`는 원자 변수로만 구성되어 있어서 다운로드 중인 워커와
//! 진행률을 읽는 쪽이 서로 블로킹하지 않는다.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use crate::error::UpdaterError;

/// 총 크기를 모를 때 진행 알림 간격
const UNKNOWN_TOTAL_REPORT_STEP: i64 = 256 * 1024;

/// 다운로드 진행 상태 (프로비저너 소유, 어디서나 스냅샷 읽기 가능)
#[derive(Debug)]
pub struct DownloadState {
    in_progress: AtomicBool,
    bytes_total: AtomicI64,
    bytes_done: AtomicI64,
}

/// 특정 시점의 `DownloadState` 복사본
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DownloadSnapshot {
    pub in_progress: bool,
    /// -1이면 알 수 없음
    pub bytes_total: i64,
    pub bytes_done: i64,
}

impl DownloadSnapshot {
    /// `[0, 1]` 범위 진행률. 총 크기를 모르면 `None` (indeterminate)
    pub fn progress(&self) -> Option<f32> {
        if self.bytes_total <= 0 {
            return None;
        }
        let ratio = self.bytes_done as f64 / self.bytes_total as f64;
        Some(ratio.clamp(0.0, 1.0) as f32)
    }

    /// UI 표시용 정수 퍼센트
    pub fn percent(&self) -> Option<u8> {
        self.progress().map(|p| (p * 100.0).floor() as u8)
    }
}

impl Default for DownloadState {
    fn default() -> Self {
        Self {
            in_progress: AtomicBool::new(false),
            bytes_total: AtomicI64::new(-1),
            bytes_done: AtomicI64::new(0),
        }
    }
}

impl DownloadState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> DownloadSnapshot {
        DownloadSnapshot {
            in_progress: self.in_progress.load(Ordering::Acquire),
            bytes_total: self.bytes_total.load(Ordering::Acquire),
            bytes_done: self.bytes_done.load(Ordering::Acquire),
        }
    }

    pub fn progress(&self) -> Option<f32> {
        self.snapshot().progress()
    }

    /// 새 작업 시작: 진행률을 0으로 되돌린다
    pub fn begin(&self) {
        self.bytes_done.store(0, Ordering::Release);
        self.bytes_total.store(-1, Ordering::Release);
        self.in_progress.store(true, Ordering::Release);
    }

    pub fn set_total(&self, total: Option<u64>) {
        let total = total.and_then(|t| i64::try_from(t).ok()).unwrap_or(-1);
        self.bytes_total.store(total, Ordering::Release);
    }

    pub fn advance(&self, bytes: u64) -> i64 {
        let delta = i64::try_from(bytes).unwrap_or(i64::MAX);
        self.bytes_done.fetch_add(delta, Ordering::AcqRel) + delta
    }

    pub fn finish(&self) {
        self.in_progress.store(false, Ordering::Release);
    }
}

/// 다운로드 결과
#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    pub bytes: u64,
    /// 받은 바이트 그대로의 SHA256 (hex, 소문자)
    pub sha256: String,
}

/// `url`을 `dest`로 스트리밍 다운로드.
///
/// 진행률은 `state`에 기록되고, 의미 있는 변화가 있을 때마다 `on_progress`가 호출된다.
/// 전체 작업은 `limit` 안에 끝나야 한다.
pub async fn download_to_file<F>(
    http: &reqwest::Client,
    url: &str,
    dest: &Path,
    state: &DownloadState,
    limit: Duration,
    mut on_progress: F,
) -> Result<DownloadOutcome, UpdaterError>
where
    F: FnMut(DownloadSnapshot),
{
    match tokio::time::timeout(limit, stream_into(http, url, dest, state, &mut on_progress)).await {
        Ok(result) => result,
        Err(_) => Err(UpdaterError::Timeout {
            operation: format!("download {}", url),
            duration_secs: limit.as_secs(),
        }),
    }
}

async fn stream_into<F>(
    http: &reqwest::Client,
    url: &str,
    dest: &Path,
    state: &DownloadState,
    on_progress: &mut F,
) -> Result<DownloadOutcome, UpdaterError>
where
    F: FnMut(DownloadSnapshot),
{
    tracing::info!("[Download] {} → {}", url, dest.display());

    let response = http
        .get(url)
        .send()
        .await
        .map_err(|e| UpdaterError::from_reqwest(&e, "download", 0))?;

    if !response.status().is_success() {
        return Err(UpdaterError::Download {
            message: format!("server responded {}", response.status()),
            downloaded_bytes: 0,
            total_bytes: None,
        });
    }

    let total = response.content_length();
    state.set_total(total);
    on_progress(state.snapshot());

    let mut file = tokio::fs::File::create(dest)
        .await
        .map_err(|e| UpdaterError::from_io(&e, "create download file", dest))?;
    let mut hasher = Sha256::new();
    let mut done: u64 = 0;
    let mut last_reported = ReportMark::new(total);
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| UpdaterError::Download {
            message: e.to_string(),
            downloaded_bytes: done,
            total_bytes: total,
        })?;
        file.write_all(&chunk)
            .await
            .map_err(|e| UpdaterError::from_io(&e, "write download file", dest))?;
        hasher.update(&chunk);
        done += chunk.len() as u64;
        let now = state.advance(chunk.len() as u64);

        if last_reported.should_report(now) {
            let snapshot = state.snapshot();
            tracing::debug!("[Download] {} / {} bytes", snapshot.bytes_done, snapshot.bytes_total);
            on_progress(snapshot);
        }
    }

    file.flush()
        .await
        .map_err(|e| UpdaterError::from_io(&e, "flush download file", dest))?;
    file.sync_all()
        .await
        .map_err(|e| UpdaterError::from_io(&e, "sync download file", dest))?;

    if let Some(total) = total {
        if done < total {
            return Err(UpdaterError::Download {
                message: "connection closed early".to_string(),
                downloaded_bytes: done,
                total_bytes: Some(total),
            });
        }
    }

    on_progress(state.snapshot());
    tracing::info!("[Download] Finished {} ({} bytes)", url, done);

    Ok(DownloadOutcome {
        bytes: done,
        sha256: hex::encode(hasher.finalize()),
    })
}

/// 진행 알림 스로틀 — 퍼센트가 바뀌었거나(총 크기 알 때) 일정 바이트마다(모를 때)
struct ReportMark {
    total: Option<u64>,
    last: i64,
}

impl ReportMark {
    fn new(total: Option<u64>) -> Self {
        Self { total, last: 0 }
    }

    fn should_report(&mut self, done: i64) -> bool {
        let due = match self.total {
            Some(total) if total > 0 => {
                let total = total as i128;
                (done as i128 * 100 / total) != (self.last as i128 * 100 / total)
            }
            _ => done - self.last >= UNKNOWN_TOTAL_REPORT_STEP,
        };
        if due {
            self.last = done;
        }
        due
    }
}
