//! 사용자 설정 (`fridaMgr.json`)
//!
//! 부팅 시 자동 시작, 네트워크 리슨 여부, 포트 번호를 저장한다.
//! 값이 바뀌면 등록된 콜백이 호출된다 (보통 `save()`).

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use rand::Rng;
use serde_json::{Map, Value};

use crate::server::ListenConfig;

pub const PREFERENCES_FILE: &str = "fridaMgr.json";
pub const DEFAULT_PORT: u16 = 27055;
/// 이보다 작은 포트는 저장돼 있어도 무시하고 새로 뽑는다
pub const MIN_USER_PORT: u16 = 1000;
const RANDOM_PORT_RANGE: std::ops::RangeInclusive<u16> = 20000..=40000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preference {
    StartOnBoot,
    ListenOnNetwork,
    PortNumber,
}

impl Preference {
    pub fn key(&self) -> &'static str {
        match self {
            Self::StartOnBoot => "start_on_boot",
            Self::ListenOnNetwork => "listen_on_network",
            Self::PortNumber => "port_number",
        }
    }
}

type ChangeCallback = Arc<dyn Fn(&UserPreferences, Preference) + Send + Sync>;

pub struct UserPreferences {
    path: PathBuf,
    values: Mutex<Map<String, Value>>,
    on_change: Mutex<Option<ChangeCallback>>,
}

impl UserPreferences {
    /// 파일이 없거나 깨져 있으면 빈 설정으로 시작
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let values = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<Value>(&content) {
                Ok(Value::Object(map)) => map,
                Ok(_) | Err(_) => {
                    tracing::warn!("[Prefs] {} is not a JSON object, starting fresh", path.display());
                    Map::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(e) => {
                tracing::warn!("[Prefs] failed to read {}: {}", path.display(), e);
                Map::new()
            }
        };
        Self {
            path,
            values: Mutex::new(values),
            on_change: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn set_on_change<F>(&self, callback: F)
    where
        F: Fn(&UserPreferences, Preference) + Send + Sync + 'static,
    {
        if let Ok(mut slot) = self.on_change.lock() {
            *slot = Some(Arc::new(callback));
        }
    }

    fn get(&self, pref: Preference) -> Option<Value> {
        self.values.lock().ok()?.get(pref.key()).cloned()
    }

    fn set(&self, pref: Preference, value: Value) {
        let changed = match self.values.lock() {
            Ok(mut values) => values.insert(pref.key().to_string(), value.clone()) != Some(value),
            Err(_) => false,
        };
        if !changed {
            return;
        }
        let callback = self.on_change.lock().ok().and_then(|cb| cb.clone());
        if let Some(callback) = callback {
            callback(self, pref);
        }
    }

    pub fn get_bool(&self, pref: Preference, default: bool) -> bool {
        self.get(pref).and_then(|v| v.as_bool()).unwrap_or(default)
    }

    pub fn set_bool(&self, pref: Preference, value: bool) {
        self.set(pref, Value::Bool(value));
    }

    pub fn get_i64(&self, pref: Preference, default: i64) -> i64 {
        self.get(pref).and_then(|v| v.as_i64()).unwrap_or(default)
    }

    pub fn set_i64(&self, pref: Preference, value: i64) {
        self.set(pref, Value::from(value));
    }

    /// 저장된 포트. `[MIN_USER_PORT, 65535]` 밖이면 임의 포트를 골라 저장한다
    pub fn port(&self) -> u16 {
        let stored = self.get_i64(Preference::PortNumber, DEFAULT_PORT as i64);
        match u16::try_from(stored) {
            Ok(port) if port >= MIN_USER_PORT => port,
            _ => {
                let port = rand::thread_rng().gen_range(RANDOM_PORT_RANGE);
                tracing::info!("[Prefs] stored port {} unusable, picked {}", stored, port);
                self.set_i64(Preference::PortNumber, port as i64);
                port
            }
        }
    }

    pub fn listen_config(&self) -> ListenConfig {
        ListenConfig {
            enabled: self.get_bool(Preference::ListenOnNetwork, false),
            port: self.port(),
        }
    }

    /// 임시 파일에 쓴 뒤 교체
    pub fn save(&self) -> Result<()> {
        let content = {
            let values = self
                .values
                .lock()
                .map_err(|_| anyhow::anyhow!("preferences lock poisoned"))?;
            serde_json::to_string_pretty(&*values)?
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content).with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        tracing::debug!("[Prefs] saved {}", self.path.display());
        Ok(())
    }
}

/// 포트 입력 필터: 숫자만, 0~65535
pub fn parse_port(text: &str) -> Option<u16> {
    let text = text.trim();
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse::<u16>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn defaults_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let prefs = UserPreferences::load(dir.path().join(PREFERENCES_FILE));
        assert!(!prefs.get_bool(Preference::StartOnBoot, false));
        assert_eq!(prefs.port(), DEFAULT_PORT);
        assert_eq!(prefs.listen_config(), ListenConfig { enabled: false, port: DEFAULT_PORT });
    }

    #[test]
    fn save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PREFERENCES_FILE);
        let prefs = UserPreferences::load(&path);
        prefs.set_bool(Preference::ListenOnNetwork, true);
        prefs.set_i64(Preference::PortNumber, 9999);
        prefs.save().unwrap();

        let reloaded = UserPreferences::load(&path);
        assert!(reloaded.get_bool(Preference::ListenOnNetwork, false));
        assert_eq!(reloaded.port(), 9999);
    }

    #[test]
    fn low_port_is_replaced_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PREFERENCES_FILE);
        std::fs::write(&path, r#"{"port_number": 80}"#).unwrap();

        let prefs = UserPreferences::load(&path);
        let port = prefs.port();
        assert!(RANDOM_PORT_RANGE.contains(&port));
        assert_eq!(prefs.get_i64(Preference::PortNumber, 0), port as i64);
        assert_eq!(prefs.port(), port);
    }

    #[test]
    fn callback_fires_only_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let prefs = UserPreferences::load(dir.path().join(PREFERENCES_FILE));
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        prefs.set_on_change(move |p, pref| {
            assert_eq!(pref, Preference::StartOnBoot);
            p.save().unwrap();
            c.fetch_add(1, Ordering::SeqCst);
        });

        prefs.set_bool(Preference::StartOnBoot, true);
        prefs.set_bool(Preference::StartOnBoot, true);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(prefs.path().exists());
    }

    #[test]
    fn corrupt_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PREFERENCES_FILE);
        std::fs::write(&path, "not json").unwrap();
        let prefs = UserPreferences::load(&path);
        assert!(!prefs.get_bool(Preference::ListenOnNetwork, false));
    }

    #[test]
    fn port_filter() {
        assert_eq!(parse_port("27042"), Some(27042));
        assert_eq!(parse_port(" 0 "), Some(0));
        assert_eq!(parse_port("65536"), None);
        assert_eq!(parse_port("-1"), None);
        assert_eq!(parse_port("12a"), None);
        assert_eq!(parse_port(""), None);
    }
}
