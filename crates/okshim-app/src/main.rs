//! # okshim
//!
//! OKSHIM 셸 바이너리 진입점.
//!
//! AI 코딩 도구의 확인 버튼("Approve", "Run", "Continue")을 대신 눌러주는
//! 화면 감시 자동 클릭기. 캡처/매칭/클릭은 전부 별도 워커 프로세스에서
//! 돌고, 셸은 설정을 공급하고 상태 이벤트를 소비하기만 한다.

mod supervisor;

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::Parser;
use okshim_core::config_manager::ConfigManager;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// OKSHIM — 확인 버튼 자동 클릭기
#[derive(Parser, Debug)]
#[command(name = "okshim")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 설정 파일 경로 (기본: 플랫폼 설정 디렉토리의 config.json)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// 워커 실행 파일 경로 (기본: 셸과 같은 디렉토리의 okshim-worker)
    #[arg(long)]
    worker_bin: Option<PathBuf>,

    /// 로그 레벨 (trace, debug, info, warn, error)
    #[arg(long, short = 'l', default_value = "info")]
    log_level: String,
}

/// 셸과 같은 디렉토리에서 워커 바이너리를 찾는다
fn default_worker_bin() -> Result<PathBuf> {
    let exe = std::env::current_exe()?;
    let dir = exe
        .parent()
        .ok_or_else(|| anyhow!("실행 파일 디렉토리를 찾을 수 없음"))?;
    let name = if cfg!(windows) {
        "okshim-worker.exe"
    } else {
        "okshim-worker"
    };
    Ok(dir.join(name))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_filter = format!("okshim={0},okshim_app={0},okshim_core={0}", args.log_level);
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_filter)),
        )
        .init();

    // 설정은 셸이 만들어 두고 워커가 읽는다 (단일 JSON 문서)
    let manager = match args.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    }
    .map_err(|e| anyhow!("설정 로드 실패: {e}"))?;
    info!(config = %manager.config_path().display(), "OKSHIM 시작");

    let worker_bin = match args.worker_bin {
        Some(p) => p,
        None => default_worker_bin()?,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("종료 신호 수신");
            let _ = shutdown_tx.send(true);
        }
    });

    supervisor::run(
        supervisor::SupervisorOptions {
            worker_bin,
            config_path: Some(manager.config_path().to_path_buf()),
            log_level: args.log_level,
        },
        shutdown_rx,
    )
    .await?;

    info!("OKSHIM 종료");
    Ok(())
}
