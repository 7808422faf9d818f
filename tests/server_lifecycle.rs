//! 프로세스 라이프사이클 통합 테스트 — 셸 스크립트를 frida-server로 사용
//!
//! 실행: `cargo test --test server_lifecycle`
#![cfg(unix)]

mod common;

use std::time::Duration;

use common::*;
use frida_mgr::server::{ErrorKind, ListenConfig};
use frida_mgr::{CommandOutcome, CommandPool, FridaServer, Notification, ServerCommand, ServerState};

fn server_with(body: &str) -> (tempfile::TempDir, FridaServer) {
    let dir = tempfile::tempdir().unwrap();
    preinstall(dir.path(), "16.1.0", body);
    let server = FridaServer::new(offline_options(dir.path())).unwrap();
    (dir, server)
}

#[tokio::test]
async fn start_and_kill_walk_every_state() {
    let (_dir, server) = server_with(LONG_RUNNING);
    let recorder = Recorder::attach(&server);

    assert_eq!(server.start().await.unwrap(), CommandOutcome::Completed);
    let info = server.process_info().expect("running process");
    assert!(info.pid > 0);
    assert_eq!(info.generation, 1);
    assert_eq!(server.status().process, Some(info));

    assert_eq!(server.kill().await.unwrap(), CommandOutcome::Completed);
    assert_eq!(
        recorder.states(),
        vec![
            ServerState::Starting,
            ServerState::Running,
            ServerState::Stopping,
            ServerState::Stopped
        ]
    );
    assert!(server.process_info().is_none());
    assert!(server.status().last_error.is_none());
}

#[tokio::test]
async fn repeated_start_and_kill_are_noops() {
    let (_dir, server) = server_with(LONG_RUNNING);

    let outcome = server.kill().await.unwrap();
    assert_eq!(outcome, CommandOutcome::Rejected { state: ServerState::Stopped });

    server.start().await.unwrap();
    let pid = server.process_info().unwrap().pid;

    let recorder = Recorder::attach(&server);
    let outcome = server.start().await.unwrap();
    assert_eq!(outcome, CommandOutcome::Rejected { state: ServerState::Running });
    assert_eq!(server.process_info().unwrap().pid, pid);
    assert!(recorder.all().is_empty());

    server.kill().await.unwrap();
    recorder.clear();
    let outcome = server.kill().await.unwrap();
    assert_eq!(outcome, CommandOutcome::Rejected { state: ServerState::Stopped });
    assert!(recorder.all().is_empty());
}

#[tokio::test]
async fn concurrent_command_is_rejected() {
    let (_dir, server) = server_with(LONG_RUNNING);

    let (a, b) = tokio::join!(server.start(), server.start());
    let outcomes = [a.unwrap(), b.unwrap()];
    assert_eq!(outcomes.iter().filter(|o| **o == CommandOutcome::Completed).count(), 1);
    assert!(outcomes
        .iter()
        .any(|o| matches!(o, CommandOutcome::Rejected { .. })));
    assert_eq!(server.state(), ServerState::Running);
    assert_eq!(server.process_info().unwrap().generation, 1);

    server.kill().await.unwrap();
}

#[tokio::test]
async fn listen_failure_binary_runs_without_listen() {
    let (_dir, server) = server_with(FAILS_ON_LISTEN);
    assert!(!server.listen_config().enabled);

    assert_eq!(server.start().await.unwrap(), CommandOutcome::Completed);
    assert_eq!(server.state(), ServerState::Running);

    // 리슨을 켜면 재시작이 바인드 에러로 끝난다
    let recorder = Recorder::attach(&server);
    let err = server.toggle_listen_port(true, 27042).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Bind);
    assert_eq!(server.state(), ServerState::Stopped);
    assert_eq!(server.status().last_error, Some(ErrorKind::Bind));
    assert_eq!(
        recorder.states(),
        vec![
            ServerState::Stopping,
            ServerState::Stopped,
            ServerState::Starting,
            ServerState::Stopped
        ]
    );
    // 설정은 유지된다
    assert_eq!(server.listen_config(), ListenConfig::new(true, 27042).unwrap());
}

#[tokio::test]
async fn toggle_port_restarts_with_new_process() {
    let dir = tempfile::tempdir().unwrap();
    preinstall(dir.path(), "16.1.0", RECORDS_ARGS);
    let mut opts = offline_options(dir.path());
    opts.listen = ListenConfig::new(true, 27042).unwrap();
    let server = FridaServer::new(opts).unwrap();

    server.start().await.unwrap();
    let before = server.process_info().unwrap();
    assert_eq!(before.listen.port, 27042);
    let args = std::fs::read_to_string(dir.path().join("args.txt")).unwrap();
    assert_eq!(args.trim(), "--listen 0.0.0.0:27042");

    let recorder = Recorder::attach(&server);
    let outcome = server.toggle_listen_port(true, 9999).await.unwrap();
    assert_eq!(outcome, CommandOutcome::Completed);
    assert_eq!(server.state(), ServerState::Running);

    let after = server.process_info().unwrap();
    assert_ne!(after.pid, before.pid);
    assert_eq!(after.generation, before.generation + 1);
    assert_eq!(after.listen, ListenConfig::new(true, 9999).unwrap());
    let args = std::fs::read_to_string(dir.path().join("args.txt")).unwrap();
    assert_eq!(args.trim(), "--listen 0.0.0.0:9999");

    let events = recorder.all();
    assert_eq!(
        events[0],
        Notification::ListenChanged(ListenConfig::new(true, 9999).unwrap())
    );
    assert_eq!(
        recorder.states(),
        vec![
            ServerState::Stopping,
            ServerState::Stopped,
            ServerState::Starting,
            ServerState::Running
        ]
    );

    // 같은 설정이면 아무 일도 없다
    recorder.clear();
    let outcome = server.toggle_listen_port(true, 9999).await.unwrap();
    assert_eq!(outcome, CommandOutcome::Completed);
    assert_eq!(server.process_info().unwrap().pid, after.pid);
    assert!(recorder.all().is_empty());

    // 끄면 인자 없이 재시작
    server.toggle_listen_port(false, 9999).await.unwrap();
    let args = std::fs::read_to_string(dir.path().join("args.txt")).unwrap();
    assert_eq!(args.trim(), "");

    server.kill().await.unwrap();
}

#[tokio::test]
async fn external_kill_is_detected() {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let (_dir, server) = server_with(LONG_RUNNING);
    server.start().await.unwrap();
    let pid = server.process_info().unwrap().pid;

    let recorder = Recorder::attach(&server);
    kill(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();

    assert!(wait_for_state(&server, ServerState::Stopped, Duration::from_secs(3)).await);
    // 감시 태스크가 알림을 한 번만 보내는지 잠시 더 본다
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        recorder.all(),
        vec![Notification::StateChanged {
            state: ServerState::Stopped,
            error: Some(ErrorKind::Process),
        }]
    );
    assert!(server.process_info().is_none());

    // 다시 시작하면 새 세대
    server.start().await.unwrap();
    assert_eq!(server.process_info().unwrap().generation, 2);
    server.kill().await.unwrap();
}

#[tokio::test]
async fn exit_is_reported_while_grandchild_holds_output() {
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::Pid;

    let (_dir, server) = server_with(SPAWNS_GRANDCHILD);
    server.start().await.unwrap();
    let pid = server.process_info().unwrap().pid;

    kill(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();
    let started = std::time::Instant::now();
    assert!(wait_for_state(&server, ServerState::Stopped, Duration::from_secs(3)).await);
    // 출력 파이프가 열려 있어도 종료는 바로 보인다
    assert!(started.elapsed() < Duration::from_millis(800), "took {:?}", started.elapsed());
    assert_eq!(server.status().last_error, Some(ErrorKind::Process));

    let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
}

#[tokio::test]
async fn kill_escalates_when_term_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    preinstall(dir.path(), "16.1.0", IGNORES_TERM);
    let mut opts = offline_options(dir.path());
    opts.process.kill_grace = Duration::from_millis(300);
    let server = FridaServer::new(opts).unwrap();

    server.start().await.unwrap();
    let started = std::time::Instant::now();
    assert_eq!(server.kill().await.unwrap(), CommandOutcome::Completed);
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(server.state(), ServerState::Stopped);
}

#[tokio::test]
async fn startup_crash_is_a_process_error() {
    let (_dir, server) = server_with("echo \"boom\" >&2\nexit 3\n");
    let recorder = Recorder::attach(&server);

    let err = server.start().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Process);
    assert!(err.to_string().contains("boom"));
    assert_eq!(server.state(), ServerState::Stopped);
    assert_eq!(recorder.states(), vec![ServerState::Starting, ServerState::Stopped]);
}

#[tokio::test]
async fn startup_permission_failure_is_classified() {
    let (_dir, server) = server_with("echo \"ptrace: Operation not permitted\" >&2\nexit 1\n");
    let err = server.start().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Permission);
    assert_eq!(server.state(), ServerState::Stopped);
}

#[tokio::test]
async fn busy_port_fails_before_spawning() {
    let listener = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let dir = tempfile::tempdir().unwrap();
    preinstall(dir.path(), "16.1.0", RECORDS_ARGS);
    let mut opts = offline_options(dir.path());
    opts.listen = ListenConfig::new(true, port as u32).unwrap();
    let server = FridaServer::new(opts).unwrap();

    let err = server.start().await.unwrap_err();
    assert!(matches!(err, frida_mgr::ServerError::Bind { port: p } if p == port));
    assert_eq!(server.state(), ServerState::Stopped);
    assert!(!dir.path().join("args.txt").exists());
}

#[tokio::test]
async fn companion_output_is_captured() {
    let (_dir, server) = server_with("echo \"hello from frida\"\necho \"warning\" >&2\nexec sleep 30\n");
    server.start().await.unwrap();

    let mut lines = Vec::new();
    for _ in 0..50 {
        lines = server.recent_output(10).await;
        if lines.iter().any(|l| l.content == "warning") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(lines.iter().any(|l| l.content == "hello from frida"));
    assert!(lines.iter().any(|l| l.content == "warning"));

    server.kill().await.unwrap();
    assert!(server.recent_output(10).await.is_empty());
}

#[tokio::test]
async fn events_stream_sees_transitions() {
    let (_dir, server) = server_with(LONG_RUNNING);
    let mut events = server.events();

    server.start().await.unwrap();
    server.kill().await.unwrap();

    let mut states = Vec::new();
    while let Ok(Notification::StateChanged { state, .. }) = events.try_recv() {
        states.push(state);
    }
    assert_eq!(
        states,
        vec![
            ServerState::Starting,
            ServerState::Running,
            ServerState::Stopping,
            ServerState::Stopped
        ]
    );
}

#[tokio::test]
async fn pool_runs_submitted_commands() {
    let (_dir, server) = server_with(LONG_RUNNING);
    let pool = CommandPool::spawn(server.clone(), 2, 8);

    pool.submit(ServerCommand::Start).unwrap();
    assert!(wait_for_state(&server, ServerState::Running, Duration::from_secs(3)).await);
    // Running이 보인 직후에는 start가 아직 실행 토큰을 쥐고 있을 수 있다
    tokio::time::sleep(Duration::from_millis(100)).await;

    pool.submit(ServerCommand::Kill).unwrap();
    assert!(wait_for_state(&server, ServerState::Stopped, Duration::from_secs(5)).await);

    pool.shutdown().await;
}
