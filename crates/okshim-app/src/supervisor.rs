//! 워커 프로세스 감독.
//!
//! 워커를 자식 프로세스로 띄우고 stdout의 상태 이벤트를 소비한다.
//! 비정상 종료는 1→2→4→8초 백오프로 재기동하며, 60초 안에 5회 이상
//! 죽으면 사용자 조치가 필요한 것으로 보고 감독을 멈춘다.
//!
//! 워커 메모리(캡처 세션, 템플릿, 캐시)는 전부 워커 소유이므로
//! 재기동이 곧 완전한 리소스 리셋이다.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use okshim_core::models::event::StatusEvent;
use okshim_core::models::scanner::WorkerCommand;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// 재기동 집계 윈도우/한도
const RESPAWN_WINDOW: Duration = Duration::from_secs(60);
const RESPAWN_BUDGET: usize = 5;

/// 감독자 설정
pub struct SupervisorOptions {
    /// 워커 실행 파일 경로
    pub worker_bin: PathBuf,
    /// 워커에 전달할 설정 파일 경로
    pub config_path: Option<PathBuf>,
    /// 워커 로그 레벨
    pub log_level: String,
}

/// 워커 생존 감독 루프. 종료 신호까지 워커를 유지한다.
pub async fn run(opts: SupervisorOptions, mut shutdown_rx: watch::Receiver<bool>) -> Result<()> {
    let mut backoff = Duration::from_secs(1);
    let mut respawns: VecDeque<Instant> = VecDeque::new();

    loop {
        if *shutdown_rx.borrow() {
            return Ok(());
        }

        let mut child = spawn_worker(&opts)?;
        info!(pid = child.id(), "워커 프로세스 시작");

        let exited_normally = pump_events(&mut child, &mut shutdown_rx).await;

        if *shutdown_rx.borrow() {
            shutdown_worker(&mut child).await;
            return Ok(());
        }
        if exited_normally {
            info!("워커 정상 종료");
            return Ok(());
        }

        // 비정상 종료 — 재기동 예산 점검
        let now = Instant::now();
        respawns.push_back(now);
        while let Some(&front) = respawns.front() {
            if now.duration_since(front) > RESPAWN_WINDOW {
                respawns.pop_front();
            } else {
                break;
            }
        }
        if respawns.len() >= RESPAWN_BUDGET {
            error!(
                "워커가 {}초 안에 {}회 죽음 — 감독 중단, 설정 점검 필요",
                RESPAWN_WINDOW.as_secs(),
                respawns.len()
            );
            anyhow::bail!("워커 반복 장애");
        }

        warn!(backoff_s = backoff.as_secs(), "워커 비정상 종료 — 재기동 대기");
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown_rx.changed() => return Ok(()),
        }
        backoff = (backoff * 2).min(Duration::from_secs(8));
    }
}

fn spawn_worker(opts: &SupervisorOptions) -> Result<Child> {
    let mut cmd = Command::new(&opts.worker_bin);
    cmd.arg("--log-level")
        .arg(&opts.log_level)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    if let Some(ref path) = opts.config_path {
        cmd.arg("--config").arg(path);
    }
    cmd.spawn()
        .with_context(|| format!("워커 실행 실패: {}", opts.worker_bin.display()))
}

/// 워커 stdout을 소비하며 종료를 기다린다. 정상 종료(코드 0)면 true.
async fn pump_events(child: &mut Child, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    let Some(stdout) = child.stdout.take() else {
        return false;
    };
    let mut lines = BufReader::new(stdout).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => handle_event_line(&line),
                    Ok(None) => break, // EOF — 워커 종료 중
                    Err(e) => {
                        warn!("워커 출력 읽기 실패: {e}");
                        break;
                    }
                }
            }
            _ = shutdown_rx.changed() => return false,
        }
    }

    match child.wait().await {
        Ok(status) => status.success(),
        Err(e) => {
            warn!("워커 종료 상태 조회 실패: {e}");
            false
        }
    }
}

/// 이벤트 한 줄 처리 — UI 셸의 뷰는 종별별 최신 이벤트의 순수 함수다.
/// 여기서는 구조화 로그로만 표면화한다.
fn handle_event_line(line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    match serde_json::from_str::<StatusEvent>(line) {
        Ok(StatusEvent::StatusChanged { state, detail, .. }) => {
            info!(%state, detail, "스캐너 상태");
        }
        Ok(StatusEvent::Match { result }) => {
            debug!(template = %result.template_id, score = result.score, "매칭");
        }
        Ok(StatusEvent::Click { info }) => {
            info!(
                hwnd = info.hwnd,
                x = info.screen_point.x,
                y = info.screen_point.y,
                template = %info.template_id,
                "클릭"
            );
        }
        Ok(StatusEvent::Error {
            error_kind, detail, ..
        }) => {
            warn!(kind = %error_kind, detail, "워커 에러");
        }
        Ok(StatusEvent::PerfTick {
            fps,
            cpu,
            mem_bytes,
            ..
        }) => {
            debug!(fps, cpu, mem_mb = mem_bytes / 1_048_576, "성능");
        }
        Err(e) => debug!(line, "이벤트 아님 (무시): {e}"),
    }
}

/// 협조적 종료: Exit 명령 → 짧은 대기 → 강제 종료
async fn shutdown_worker(child: &mut Child) {
    if let Some(mut stdin) = child.stdin.take() {
        if let Ok(cmd) = serde_json::to_string(&WorkerCommand::Exit) {
            let _ = stdin.write_all(cmd.as_bytes()).await;
            let _ = stdin.write_all(b"\n").await;
            let _ = stdin.flush().await;
        }
    }
    match tokio::time::timeout(Duration::from_secs(3), child.wait()).await {
        Ok(_) => info!("워커 협조적 종료 완료"),
        Err(_) => {
            warn!("워커 종료 시간 초과 — 강제 종료");
            let _ = child.kill().await;
        }
    }
}
