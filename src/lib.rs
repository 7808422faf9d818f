//! frida-mgr — frida-server 설치, 업데이트, 실행 관리
//!
//! - **server**: 라이프사이클 상태 머신과 `FridaServer` 파사드
//! - **executor**: 명령 실행 워커 풀
//! - **config**: `frida-mgr.toml`
//! - **preferences**: `fridaMgr.json` 사용자 설정

pub mod config;
pub mod executor;
pub mod preferences;
pub mod server;

pub use frida_mgr_updater_lib as updater;

pub use executor::{CommandPool, PoolError, ServerCommand};
pub use server::{CommandOutcome, FridaServer, Notification, ServerError, ServerOptions, ServerState, StatusSnapshot};
