//! frida-mgr CLI
//!
//! ## 사용법
//! ```text
//! frida-mgr [--root DIR] [--config FILE] status [--json]
//! frida-mgr check [--json]            # 최신 릴리스 확인
//! frida-mgr install [version]         # 미설치 상태에서 설치
//! frida-mgr update                    # 새 버전이 있으면 교체
//! frida-mgr listen on [port] | off    # 네트워크 리슨 설정 저장
//! frida-mgr boot on | off             # run 시작 시 자동 실행
//! frida-mgr run                       # 포그라운드 관리자 (stdin 명령)
//! ```
//!
//! ## 종료 코드
//! - `0` — 성공
//! - `1` — 에러
//! - `2` — 명령이 현재 상태에서 거절됨

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};

use frida_mgr::config::{resolve_root, ManagerConfig, CONFIG_FILE};
use frida_mgr::preferences::{parse_port, Preference, UserPreferences, PREFERENCES_FILE};
use frida_mgr::server::ListenConfig;
use frida_mgr::updater::SemVer;
use frida_mgr::{CommandOutcome, CommandPool, FridaServer, Notification, ServerCommand, ServerState};

struct GlobalArgs {
    root: Option<PathBuf>,
    config: Option<PathBuf>,
    rest: Vec<String>,
}

fn parse_global(args: Vec<String>) -> Result<GlobalArgs> {
    let mut root = None;
    let mut config = None;
    let mut rest = Vec::new();
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--root" => root = Some(PathBuf::from(iter.next().context("--root needs a directory")?)),
            "--config" => config = Some(PathBuf::from(iter.next().context("--config needs a file")?)),
            _ => {
                rest.push(arg);
                rest.extend(iter.by_ref());
            }
        }
    }
    Ok(GlobalArgs { root, config, rest })
}

#[tokio::main]
async fn main() {
    // stdout은 명령 출력용, 로그는 stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    match run(std::env::args().skip(1).collect()).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("✗ Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

async fn run(args: Vec<String>) -> Result<i32> {
    let global = parse_global(args)?;
    let args_ref: Vec<&str> = global.rest.iter().map(|s| s.as_str()).collect();

    if args_ref.is_empty() || matches!(args_ref[0], "help" | "--help" | "-h") {
        print_help();
        return Ok(0);
    }
    if matches!(args_ref[0], "--version" | "-V") {
        println!("frida-mgr {}", env!("CARGO_PKG_VERSION"));
        return Ok(0);
    }

    let root = resolve_root(global.root);
    std::fs::create_dir_all(&root).with_context(|| format!("cannot create {}", root.display()))?;
    let config_path = global.config.unwrap_or_else(|| root.join(CONFIG_FILE));
    let cfg = ManagerConfig::load(&config_path)?;

    let prefs = Arc::new(UserPreferences::load(root.join(PREFERENCES_FILE)));
    prefs.set_on_change(|p, pref| {
        if let Err(e) = p.save() {
            tracing::warn!("[Prefs] failed to save after {} changed: {:#}", pref.key(), e);
        }
    });

    // 설정만 바꾸는 명령은 서버를 만들지 않는다
    match args_ref[0] {
        "listen" => return cmd_listen(&prefs, &args_ref[1..]),
        "boot" => return cmd_boot(&prefs, &args_ref[1..]),
        _ => {}
    }

    let options = cfg.server_options(&root, prefs.listen_config())?;
    let server = FridaServer::new(options)?;

    match args_ref[0] {
        "status" => cmd_status(&server, &args_ref[1..]),
        "check" => cmd_check(&server, &args_ref[1..]).await,
        "install" => cmd_install(&server, &args_ref[1..]).await,
        "update" => cmd_update(&server).await,
        "run" => cmd_run(server, prefs, &cfg).await,
        other => {
            eprintln!("✗ Unknown command: {}", other);
            eprintln!("  Run 'frida-mgr help' for usage.");
            Ok(1)
        }
    }
}

// ═══════════════════════════════════════════════════════
// 명령어 핸들러
// ═══════════════════════════════════════════════════════

fn cmd_status(server: &FridaServer, flags: &[&str]) -> Result<i32> {
    let status = server.status();
    if flags.contains(&"--json") {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(0);
    }

    println!("📋 frida-server");
    println!("─────────────────────────────────────────────");
    println!("  State:     {}", status.state);
    println!(
        "  Installed: {}",
        status.installed_version.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
    );
    if status.listen.enabled {
        println!("  Listen:    0.0.0.0:{}", status.listen.port);
    } else {
        println!("  Listen:    off (port {})", status.listen.port);
    }
    Ok(0)
}

async fn cmd_check(server: &FridaServer, flags: &[&str]) -> Result<i32> {
    let installed = server.version();
    let latest = server.latest_version().await?;
    let update = installed.as_ref().map_or(true, |v| latest.is_newer_than(v));

    if flags.contains(&"--json") {
        println!(
            "{}",
            serde_json::json!({
                "installed": installed.map(|v| v.to_string()),
                "latest": latest.to_string(),
                "update_available": update,
            })
        );
        return Ok(0);
    }

    match installed {
        Some(v) if update => println!("📦 Update available: {} → {}", v, latest),
        Some(v) => println!("✓ frida-server {} is up to date.", v),
        None => println!("📦 frida-server {} available (not installed).", latest),
    }
    Ok(0)
}

async fn cmd_install(server: &FridaServer, args: &[&str]) -> Result<i32> {
    let version = match args.first() {
        Some(v) => Some(SemVer::parse(v).with_context(|| format!("invalid version '{}'", v))?),
        None => None,
    };
    let _progress = server.subscribe(print_progress);
    report(server.install_version(version).await?, server)
}

async fn cmd_update(server: &FridaServer) -> Result<i32> {
    let _progress = server.subscribe(print_progress);
    report(server.update().await?, server)
}

fn cmd_listen(prefs: &UserPreferences, args: &[&str]) -> Result<i32> {
    match args {
        ["off"] => prefs.set_bool(Preference::ListenOnNetwork, false),
        ["on"] => prefs.set_bool(Preference::ListenOnNetwork, true),
        ["on", port] => {
            let config = listen_from_text(port)?;
            prefs.set_i64(Preference::PortNumber, config.port as i64);
            prefs.set_bool(Preference::ListenOnNetwork, true);
        }
        _ => bail!("usage: frida-mgr listen on [port] | off"),
    }
    let listen = prefs.listen_config();
    println!(
        "✓ Listen {} (port {})",
        if listen.enabled { "on" } else { "off" },
        listen.port
    );
    Ok(0)
}

fn cmd_boot(prefs: &UserPreferences, args: &[&str]) -> Result<i32> {
    let enabled = match args {
        ["on"] => true,
        ["off"] => false,
        _ => bail!("usage: frida-mgr boot on | off"),
    };
    prefs.set_bool(Preference::StartOnBoot, enabled);
    println!("✓ Start on boot {}", if enabled { "on" } else { "off" });
    Ok(0)
}

/// 포그라운드 관리자. frida-server는 이 프로세스가 살아 있는 동안만 실행된다.
async fn cmd_run(server: FridaServer, prefs: Arc<UserPreferences>, cfg: &ManagerConfig) -> Result<i32> {
    let _sub = server.subscribe(print_notification);
    let pool = CommandPool::spawn(server.clone(), cfg.workers, cfg.queue_depth);

    if prefs.get_bool(Preference::StartOnBoot, false) && server.state() == ServerState::Stopped {
        submit(&pool, ServerCommand::Start);
    }
    println!("frida-mgr running ({}). Type 'help' for commands.", server.state());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !handle_line(line.trim(), &server, &pool, &prefs).await {
                        break;
                    }
                }
                // stdin 없이 실행됨: Ctrl+C까지 감시만 한다
                Ok(None) => {
                    let _ = tokio::signal::ctrl_c().await;
                    break;
                }
                Err(e) => {
                    tracing::warn!("stdin read failed: {}", e);
                    break;
                }
            },
        }
    }

    pool.shutdown().await;
    if server.state() == ServerState::Running {
        server.kill().await?;
    }
    Ok(0)
}

/// `false`면 종료
async fn handle_line(line: &str, server: &FridaServer, pool: &CommandPool, prefs: &UserPreferences) -> bool {
    let words: Vec<&str> = line.split_whitespace().collect();
    match words.as_slice() {
        [] => {}
        ["quit"] | ["exit"] => return false,
        ["help"] => print_run_help(),
        ["status"] => {
            let _ = cmd_status(server, &[]);
        }
        ["output"] | ["output", _] => {
            let count = words.get(1).and_then(|n| n.parse().ok()).unwrap_or(20);
            for line in server.recent_output(count).await {
                println!("  {} [{:?}] {}", line.timestamp.format("%H:%M:%S"), line.source, line.content);
            }
        }
        ["start"] => submit(pool, ServerCommand::Start),
        ["kill"] | ["stop"] => submit(pool, ServerCommand::Kill),
        ["update"] => submit(pool, ServerCommand::Update),
        ["install"] => submit(pool, ServerCommand::Install { version: None }),
        ["install", v] => match SemVer::parse(v) {
            Some(version) => submit(pool, ServerCommand::Install { version: Some(version) }),
            None => eprintln!("✗ invalid version '{}'", v),
        },
        ["listen", "off"] => {
            prefs.set_bool(Preference::ListenOnNetwork, false);
            submit_listen(pool, prefs);
        }
        ["listen", "on"] => {
            prefs.set_bool(Preference::ListenOnNetwork, true);
            submit_listen(pool, prefs);
        }
        ["listen", "on", port] => match listen_from_text(port) {
            Ok(config) => {
                prefs.set_i64(Preference::PortNumber, config.port as i64);
                prefs.set_bool(Preference::ListenOnNetwork, true);
                submit_listen(pool, prefs);
            }
            Err(e) => eprintln!("✗ {:#}", e),
        },
        ["boot", "on"] => prefs.set_bool(Preference::StartOnBoot, true),
        ["boot", "off"] => prefs.set_bool(Preference::StartOnBoot, false),
        _ => eprintln!("✗ Unknown command: {} (try 'help')", line),
    }
    true
}

fn listen_from_text(text: &str) -> Result<ListenConfig> {
    let port = parse_port(text).with_context(|| format!("'{}' is not a port number", text))?;
    Ok(ListenConfig::new(true, port as u32)?)
}

fn submit_listen(pool: &CommandPool, prefs: &UserPreferences) {
    let listen = prefs.listen_config();
    submit(
        pool,
        ServerCommand::ToggleListenPort {
            enabled: listen.enabled,
            port: listen.port as u32,
        },
    );
}

fn submit(pool: &CommandPool, command: ServerCommand) {
    if let Err(e) = pool.submit(command) {
        eprintln!("✗ {}", e);
    }
}

fn report(outcome: CommandOutcome, server: &FridaServer) -> Result<i32> {
    match outcome {
        CommandOutcome::Completed => {
            let version = server.version().map(|v| v.to_string()).unwrap_or_default();
            println!("✓ frida-server {} installed.", version);
            Ok(0)
        }
        CommandOutcome::UpToDate => {
            println!("✓ Already up to date.");
            Ok(0)
        }
        CommandOutcome::Rejected { state } => {
            eprintln!("⚠ Not possible while frida-server is {}.", state);
            Ok(2)
        }
    }
}

fn print_progress(notification: &Notification) {
    if let Notification::Progress(snapshot) = notification {
        match snapshot.percent() {
            Some(p) => eprint!("\r  ⬇ {:>3}%", p),
            None => eprint!("\r  ⬇ {} KiB", snapshot.bytes_done / 1024),
        }
        if !snapshot.in_progress {
            eprintln!();
        }
    }
}

fn print_notification(notification: &Notification) {
    match notification {
        Notification::StateChanged { state, error: None } => println!("● {}", state),
        Notification::StateChanged { state, error: Some(kind) } => println!("● {} ({:?})", state, kind),
        Notification::ListenChanged(listen) if listen.enabled => println!("● listen on 0.0.0.0:{}", listen.port),
        Notification::ListenChanged(_) => println!("● listen off"),
        Notification::Progress(_) => print_progress(notification),
    }
}

fn print_help() {
    println!("frida-mgr {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("USAGE:");
    println!("  frida-mgr [--root DIR] [--config FILE] <command>");
    println!();
    println!("COMMANDS:");
    println!("  status [--json]         Show install and listen state");
    println!("  check [--json]          Query the latest release");
    println!("  install [version]       Install frida-server (latest if omitted)");
    println!("  update                  Replace with a newer release if available");
    println!("  listen on [port] | off  Store the network listen setting");
    println!("  boot on | off           Start frida-server when 'run' begins");
    println!("  run                     Supervise frida-server in the foreground");
    println!();
    println!("ENVIRONMENT:");
    println!("  FRIDA_MGR_ROOT          Data directory (default ~/.frida-mgr)");
    println!("  RUST_LOG                Log filter (default info)");
}

fn print_run_help() {
    println!("  start | kill | install [version] | update");
    println!("  listen on [port] | listen off | boot on | boot off");
    println!("  status | output [n] | quit");
}
